//! KEXT manifests and versions.

use std::cmp::Ordering;
use std::fmt;

use crate::error::{PrelinkError, Result};
use crate::plist::{self, PlistValue};

/// Release stage, ordered from least to most mature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KextStage {
    Development,
    Alpha,
    Beta,
    Candidate,
    Release,
}

impl KextStage {
    fn suffix(self) -> &'static str {
        match self {
            KextStage::Development => "d",
            KextStage::Alpha => "a",
            KextStage::Beta => "b",
            KextStage::Candidate => "fc",
            KextStage::Release => "",
        }
    }
}

/// A bundle version of the form `major[.minor[.revision]][stage level]`,
/// e.g. `1.2.3`, `10.0b4` or `2.1.1fc2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KextVersion {
    pub major: u16,
    pub minor: u8,
    pub revision: u8,
    pub stage: KextStage,
    pub stage_level: u8,
}

const MAX_MAJOR: u64 = 9999;
const MAX_MINOR: u64 = 99;
const MAX_STAGE_LEVEL: u64 = 255;

fn version_error(text: &str, reason: &str) -> PrelinkError {
    PrelinkError::Manifest(format!("invalid version {text:?}: {reason}"))
}

fn parse_component(text: &str, digits: &str, max: u64) -> Result<u64> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(version_error(text, "expected a decimal component"));
    }
    let value: u64 = digits
        .parse()
        .map_err(|_| version_error(text, "component too large"))?;
    if value > max {
        return Err(version_error(text, "component out of range"));
    }
    Ok(value)
}

impl KextVersion {
    pub const fn new(major: u16, minor: u8, revision: u8) -> Self {
        KextVersion {
            major,
            minor,
            revision,
            stage: KextStage::Release,
            stage_level: 0,
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        let numeric_end = trimmed
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(trimmed.len());
        let (numbers, suffix) = trimmed.split_at(numeric_end);

        let mut components = numbers.split('.');
        let major = parse_component(text, components.next().unwrap_or(""), MAX_MAJOR)?;
        let minor = match components.next() {
            Some(digits) => parse_component(text, digits, MAX_MINOR)?,
            None => 0,
        };
        let revision = match components.next() {
            Some(digits) => parse_component(text, digits, MAX_MINOR)?,
            None => 0,
        };
        if components.next().is_some() {
            return Err(version_error(text, "more than three components"));
        }

        let (stage, level) = if suffix.is_empty() {
            (KextStage::Release, "")
        } else if let Some(level) = suffix.strip_prefix("fc") {
            (KextStage::Candidate, level)
        } else if let Some(level) = suffix.strip_prefix('f') {
            (KextStage::Candidate, level)
        } else if let Some(level) = suffix.strip_prefix('d') {
            (KextStage::Development, level)
        } else if let Some(level) = suffix.strip_prefix('a') {
            (KextStage::Alpha, level)
        } else if let Some(level) = suffix.strip_prefix('b') {
            (KextStage::Beta, level)
        } else {
            return Err(version_error(text, "unknown release stage"));
        };
        let stage_level = if stage == KextStage::Release {
            0
        } else {
            parse_component(text, level, MAX_STAGE_LEVEL)?
        };

        Ok(KextVersion {
            major: major as u16,
            minor: minor as u8,
            revision: revision as u8,
            stage,
            stage_level: stage_level as u8,
        })
    }
}

impl Ord for KextVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.revision.cmp(&other.revision))
            .then(self.stage.cmp(&other.stage))
            .then(self.stage_level.cmp(&other.stage_level))
    }
}

impl PartialOrd for KextVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for KextVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.revision)?;
        if self.stage != KextStage::Release {
            write!(f, "{}{}", self.stage.suffix(), self.stage_level)?;
        }
        Ok(())
    }
}

/// The linking-relevant part of a KEXT's `Info.plist`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KextManifest {
    pub identifier: String,
    pub version: KextVersion,
    pub compatible_version: Option<KextVersion>,
    pub executable: Option<String>,
    /// `(bundle identifier, requested version)` in declaration order.
    pub libraries: Vec<(String, KextVersion)>,
}

fn required_string<'p>(dict: &'p PlistValue, key: &str) -> Result<&'p str> {
    dict.get(key)
        .and_then(PlistValue::as_str)
        .ok_or_else(|| PrelinkError::Manifest(format!("missing string {key}")))
}

fn optional_version(dict: &PlistValue, key: &str) -> Result<Option<KextVersion>> {
    match dict.get(key) {
        None => Ok(None),
        Some(value) => value
            .as_str()
            .ok_or_else(|| PrelinkError::Manifest(format!("{key} is not a string")))
            .and_then(KextVersion::parse)
            .map(Some),
    }
}

impl KextManifest {
    /// Parses an `Info.plist` document.
    pub fn parse(text: &str) -> Result<Self> {
        Self::from_plist(&plist::parse(text)?)
    }

    /// Builds a manifest from an already parsed dictionary, such as an entry
    /// of a prelinked kernel's info array.
    pub fn from_plist(dict: &PlistValue) -> Result<Self> {
        if dict.as_dict().is_none() {
            return Err(PrelinkError::Manifest("root is not a dictionary".into()));
        }
        let identifier = required_string(dict, "CFBundleIdentifier")?.to_string();
        let version = KextVersion::parse(required_string(dict, "CFBundleVersion")?)?;
        let compatible_version = optional_version(dict, "OSBundleCompatibleVersion")?;
        let executable = dict
            .get("CFBundleExecutable")
            .and_then(PlistValue::as_str)
            .map(str::to_string);

        let libraries = match dict
            .get("OSBundleLibraries_x86_64")
            .or_else(|| dict.get("OSBundleLibraries"))
        {
            None => Vec::new(),
            Some(value) => {
                let entries = value.as_dict().ok_or_else(|| {
                    PrelinkError::Manifest("OSBundleLibraries is not a dictionary".into())
                })?;
                entries
                    .iter()
                    .map(|(name, requested)| {
                        if name.is_empty() {
                            return Err(PrelinkError::Manifest("empty library name".into()));
                        }
                        let requested = requested.as_str().ok_or_else(|| {
                            PrelinkError::Manifest(format!("version of {name} is not a string"))
                        })?;
                        Ok((name.clone(), KextVersion::parse(requested)?))
                    })
                    .collect::<Result<_>>()?
            }
        };

        Ok(KextManifest {
            identifier,
            version,
            compatible_version,
            executable,
            libraries,
        })
    }

    /// Whether this bundle satisfies a dependency on `requested`.
    ///
    /// Bundles without `OSBundleCompatibleVersion` cannot be linked against.
    pub fn satisfies(&self, requested: &KextVersion) -> bool {
        match &self.compatible_version {
            Some(compatible) => compatible <= requested && *requested <= self.version,
            None => false,
        }
    }
}
