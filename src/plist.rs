//! XML property lists.
//!
//! Parses the property-list subset found in KEXT `Info.plist` files and in a
//! prelinked kernel's `__PRELINK_INFO`: dictionaries, arrays, strings,
//! integers (decimal or `0x` hex), booleans, data, dates and reals. Values
//! tagged with `ID="n"` can be referenced later through `IDREF="n"`, which is
//! how the kernel linker shares repeated strings in prelink info.

use std::collections::HashMap;

use crate::error::{PrelinkError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum PlistValue {
    Dict(Vec<(String, PlistValue)>),
    Array(Vec<PlistValue>),
    String(String),
    Integer(u64),
    Bool(bool),
    /// Base64 text, whitespace removed.
    Data(String),
    Date(String),
    Real(f64),
}

impl PlistValue {
    /// Value of `key` when this is a dictionary.
    pub fn get(&self, key: &str) -> Option<&PlistValue> {
        match self {
            PlistValue::Dict(entries) => entries
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, value)| value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PlistValue::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<u64> {
        match self {
            PlistValue::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PlistValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[PlistValue]> {
        match self {
            PlistValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&[(String, PlistValue)]> {
        match self {
            PlistValue::Dict(entries) => Some(entries),
            _ => None,
        }
    }
}

/// Parses a property list document, with or without the `<plist>` wrapper.
pub fn parse(text: &str) -> Result<PlistValue> {
    let mut parser = Parser {
        text,
        pos: 0,
        ids: HashMap::new(),
    };
    parser.skip_misc()?;
    let tag = parser.open_tag()?;
    let value = if tag.name == "plist" && !tag.self_closing {
        parser.skip_misc()?;
        let inner = parser.open_tag()?;
        let value = parser.value(inner)?;
        parser.skip_misc()?;
        parser.close_tag("plist")?;
        value
    } else {
        parser.value(tag)?
    };
    parser.skip_misc()?;
    if parser.pos < text.len() {
        return Err(parser.error("trailing content after the root value"));
    }
    Ok(value)
}

struct Tag {
    name: String,
    attributes: Vec<(String, String)>,
    self_closing: bool,
}

impl Tag {
    fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

struct Parser<'t> {
    text: &'t str,
    pos: usize,
    ids: HashMap<String, PlistValue>,
}

impl<'t> Parser<'t> {
    fn error(&self, message: impl Into<String>) -> PrelinkError {
        PrelinkError::Plist {
            offset: self.pos,
            message: message.into(),
        }
    }

    fn rest(&self) -> &'t str {
        &self.text[self.pos..]
    }

    fn skip_whitespace(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn skip_past(&mut self, terminator: &str) -> Result<()> {
        match self.rest().find(terminator) {
            Some(at) => {
                self.pos += at + terminator.len();
                Ok(())
            }
            None => Err(self.error(format!("unterminated markup, expected {terminator}"))),
        }
    }

    /// Skips whitespace, comments, the XML declaration and the doctype.
    fn skip_misc(&mut self) -> Result<()> {
        loop {
            self.skip_whitespace();
            let rest = self.rest();
            if rest.starts_with("<!--") {
                self.skip_past("-->")?;
            } else if rest.starts_with("<?") {
                self.skip_past("?>")?;
            } else if rest.starts_with("<!") {
                self.skip_past(">")?;
            } else {
                return Ok(());
            }
        }
    }

    fn open_tag(&mut self) -> Result<Tag> {
        if !self.rest().starts_with('<') || self.rest().starts_with("</") {
            return Err(self.error("expected an element"));
        }
        let end = self
            .rest()
            .find('>')
            .ok_or_else(|| self.error("unterminated tag"))?;
        let mut body = &self.rest()[1..end];
        let self_closing = body.ends_with('/');
        if self_closing {
            body = &body[..body.len() - 1];
        }
        let name_end = body
            .find(|c: char| c.is_ascii_whitespace())
            .unwrap_or(body.len());
        let name = body[..name_end].to_string();
        if name.is_empty() {
            return Err(self.error("empty tag name"));
        }
        let attributes = self.attributes(&body[name_end..])?;
        self.pos += end + 1;
        Ok(Tag {
            name,
            attributes,
            self_closing,
        })
    }

    fn attributes(&self, mut source: &str) -> Result<Vec<(String, String)>> {
        let mut attributes = Vec::new();
        loop {
            source = source.trim_start();
            if source.is_empty() {
                return Ok(attributes);
            }
            let eq = source
                .find('=')
                .ok_or_else(|| self.error("attribute without a value"))?;
            let key = source[..eq].trim().to_string();
            let after = source[eq + 1..].trim_start();
            let quote = after
                .chars()
                .next()
                .filter(|c| *c == '"' || *c == '\'')
                .ok_or_else(|| self.error("unquoted attribute value"))?;
            let close = after[1..]
                .find(quote)
                .ok_or_else(|| self.error("unterminated attribute value"))?;
            attributes.push((key, unescape(&after[1..1 + close]).map_err(|m| self.error(m))?));
            source = &after[close + 2..];
        }
    }

    fn close_tag(&mut self, name: &str) -> Result<()> {
        let expected = format!("</{name}");
        if !self.rest().starts_with(&expected) {
            return Err(self.error(format!("expected </{name}>")));
        }
        self.pos += expected.len();
        self.skip_whitespace();
        if !self.rest().starts_with('>') {
            return Err(self.error(format!("malformed </{name}>")));
        }
        self.pos += 1;
        Ok(())
    }

    /// Character data up to the closing tag of `name`.
    fn text(&mut self, tag: &Tag) -> Result<String> {
        if tag.self_closing {
            return Ok(String::new());
        }
        let end = self
            .rest()
            .find('<')
            .ok_or_else(|| self.error(format!("unterminated <{}>", tag.name)))?;
        let raw = &self.rest()[..end];
        let text = unescape(raw).map_err(|m| self.error(m))?;
        self.pos += end;
        self.close_tag(&tag.name)?;
        Ok(text)
    }

    fn value(&mut self, tag: Tag) -> Result<PlistValue> {
        if let Some(id) = tag.attribute("IDREF") {
            let value = self
                .ids
                .get(id)
                .cloned()
                .ok_or_else(|| self.error(format!("IDREF {id} has no matching ID")))?;
            if !tag.self_closing {
                self.skip_misc()?;
                self.close_tag(&tag.name)?;
            }
            return Ok(value);
        }

        let id = tag.attribute("ID").map(str::to_string);
        let value = match tag.name.as_str() {
            "dict" => self.dict(&tag)?,
            "array" => self.array(&tag)?,
            "string" => PlistValue::String(self.text(&tag)?),
            "integer" => {
                let text = self.text(&tag)?;
                PlistValue::Integer(
                    parse_integer(&text).ok_or_else(|| self.error(format!("bad integer {text:?}")))?,
                )
            }
            "real" => {
                let text = self.text(&tag)?;
                PlistValue::Real(
                    text.trim()
                        .parse()
                        .map_err(|_| self.error(format!("bad real {text:?}")))?,
                )
            }
            "true" | "false" => {
                if !tag.self_closing {
                    self.close_tag(&tag.name)?;
                }
                PlistValue::Bool(tag.name == "true")
            }
            "data" => {
                let text = self.text(&tag)?;
                PlistValue::Data(text.split_ascii_whitespace().collect())
            }
            "date" => PlistValue::Date(self.text(&tag)?.trim().to_string()),
            other => return Err(self.error(format!("unsupported element <{other}>"))),
        };
        if let Some(id) = id {
            self.ids.insert(id, value.clone());
        }
        Ok(value)
    }

    fn dict(&mut self, tag: &Tag) -> Result<PlistValue> {
        let mut entries = Vec::new();
        if tag.self_closing {
            return Ok(PlistValue::Dict(entries));
        }
        loop {
            self.skip_misc()?;
            if self.rest().starts_with("</") {
                self.close_tag("dict")?;
                return Ok(PlistValue::Dict(entries));
            }
            let key_tag = self.open_tag()?;
            if key_tag.name != "key" {
                return Err(self.error(format!("expected <key>, found <{}>", key_tag.name)));
            }
            let key = self.text(&key_tag)?;
            self.skip_misc()?;
            let value_tag = self.open_tag()?;
            let value = self.value(value_tag)?;
            entries.push((key, value));
        }
    }

    fn array(&mut self, tag: &Tag) -> Result<PlistValue> {
        let mut items = Vec::new();
        if tag.self_closing {
            return Ok(PlistValue::Array(items));
        }
        loop {
            self.skip_misc()?;
            if self.rest().starts_with("</") {
                self.close_tag("array")?;
                return Ok(PlistValue::Array(items));
            }
            let item = self.open_tag()?;
            items.push(self.value(item)?);
        }
    }
}

fn parse_integer(text: &str) -> Option<u64> {
    let text = text.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let magnitude = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16).ok()?,
        None => digits.parse().ok()?,
    };
    Some(if negative {
        magnitude.wrapping_neg()
    } else {
        magnitude
    })
}

fn unescape(raw: &str) -> std::result::Result<String, String> {
    if !raw.contains('&') {
        return Ok(raw.to_string());
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let semi = rest[amp..]
            .find(';')
            .ok_or_else(|| format!("unterminated entity in {raw:?}"))?;
        let entity = &rest[amp + 1..amp + semi];
        let decoded = match entity {
            "lt" => '<',
            "gt" => '>',
            "amp" => '&',
            "quot" => '"',
            "apos" => '\'',
            _ => {
                let code = if let Some(hex) = entity.strip_prefix("#x") {
                    u32::from_str_radix(hex, 16).ok()
                } else if let Some(dec) = entity.strip_prefix('#') {
                    dec.parse().ok()
                } else {
                    None
                };
                code.and_then(char::from_u32)
                    .ok_or_else(|| format!("unknown entity &{entity};"))?
            }
        };
        out.push(decoded);
        rest = &rest[amp + semi + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INFO_PLIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
	<!-- identity -->
	<key>CFBundleIdentifier</key>
	<string>com.example.driver</string>
	<key>CFBundleVersion</key>
	<string>1.2.3</string>
	<key>OSBundleRequired</key>
	<string>Root &amp; Safe Boot</string>
	<key>IOKitPersonalities</key>
	<dict/>
	<key>OSBundleLibraries</key>
	<dict>
		<key>com.apple.kpi.iokit</key>
		<string>8.0.0</string>
	</dict>
	<key>Flags</key>
	<array>
		<true/>
		<false></false>
		<integer>0x1F</integer>
		<integer>-1</integer>
		<real>1.5</real>
		<data>
		AAEC
		AwQ=
		</data>
	</array>
</dict>
</plist>
"#;

    #[test]
    fn parses_a_kext_manifest() {
        let root = parse(INFO_PLIST).unwrap();
        assert_eq!(
            root.get("CFBundleIdentifier").and_then(PlistValue::as_str),
            Some("com.example.driver")
        );
        assert_eq!(
            root.get("OSBundleRequired").and_then(PlistValue::as_str),
            Some("Root & Safe Boot")
        );
        assert_eq!(root.get("IOKitPersonalities"), Some(&PlistValue::Dict(vec![])));
        let libraries = root.get("OSBundleLibraries").and_then(PlistValue::as_dict).unwrap();
        assert_eq!(libraries.len(), 1);
        assert_eq!(libraries[0].0, "com.apple.kpi.iokit");

        let flags = root.get("Flags").and_then(PlistValue::as_array).unwrap();
        assert_eq!(
            flags,
            &[
                PlistValue::Bool(true),
                PlistValue::Bool(false),
                PlistValue::Integer(0x1f),
                PlistValue::Integer(u64::MAX),
                PlistValue::Real(1.5),
                PlistValue::Data("AAECAwQ=".into()),
            ]
        );
    }

    #[test]
    fn resolves_id_references() {
        let text = r#"<dict>
            <key>a</key><string ID="1">shared</string>
            <key>b</key><string IDREF="1"/>
            <key>addr</key><integer size="64" ID="2">0xffffff7f80a00000</integer>
            <key>again</key><integer IDREF="2"/>
        </dict>"#;
        let root = parse(text).unwrap();
        assert_eq!(root.get("b").and_then(PlistValue::as_str), Some("shared"));
        assert_eq!(
            root.get("again").and_then(PlistValue::as_integer),
            Some(0xffff_ff7f_80a0_0000)
        );
    }

    #[test]
    fn reports_errors_with_offsets() {
        assert!(matches!(
            parse("<dict><key>a</key><string>x</dict>"),
            Err(PrelinkError::Plist { .. })
        ));
        assert!(matches!(
            parse("<dict><string>x</string></dict>"),
            Err(PrelinkError::Plist { .. })
        ));
        assert!(matches!(
            parse("<string IDREF=\"9\"/>"),
            Err(PrelinkError::Plist { .. })
        ));
        assert!(matches!(
            parse("<integer>12z</integer>"),
            Err(PrelinkError::Plist { .. })
        ));
    }
}
