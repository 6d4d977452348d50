//! C++ and OSMetaClass symbol name conventions.
//!
//! Class names are kept in their mangled, length-prefixed form (`7MyClass`),
//! so every transform is a plain prefix/suffix edit.

pub const CXX_PREFIX: &str = "__Z";
pub const VTABLE_PREFIX: &str = "__ZTV";
pub const OSOBJ_PREFIX: &str = "__ZN";
pub const RESERVED_TOKEN: &str = "_RESERVED";
pub const METACLASS_TOKEN: &str = "10gMetaClassE";
pub const SUPER_METACLASS_POINTER_TOKEN: &str = "10superClassE";
pub const METACLASS_VTABLE_PREFIX: &str = "__ZTVN";
pub const METACLASS_VTABLE_SUFFIX: &str = "9MetaClassE";
pub const FINAL_CLASS_TOKEN: &str = "14__OSFinalClassEv";
pub const PURE_VIRTUAL: &str = "___cxa_pure_virtual";
pub const OS_METACLASS_VTABLE: &str = "__ZTV11OSMetaClass";
pub const WEAK_TEST_SYMBOL: &str = "_gOSKextUnresolved";

/// Longest symbol name the transforms will produce.
pub const MAX_NAME_LEN: usize = 256;

pub fn is_cxx(name: &str) -> bool {
    name.starts_with(CXX_PREFIX)
}

pub fn is_vtable(name: &str) -> bool {
    name.starts_with(VTABLE_PREFIX)
}

pub fn is_pure_virtual(name: &str) -> bool {
    name == PURE_VIRTUAL
}

pub fn is_padslot(name: &str) -> bool {
    name.contains(RESERVED_TOKEN)
}

pub fn is_super_metaclass_pointer(name: &str) -> bool {
    name.starts_with(OSOBJ_PREFIX) && name.ends_with(SUPER_METACLASS_POINTER_TOKEN)
}

fn strip<'a>(name: &'a str, prefix: &str, suffix: &str) -> Option<&'a str> {
    let class = name.strip_prefix(prefix)?.strip_suffix(suffix)?;
    (!class.is_empty()).then_some(class)
}

fn bounded(name: String) -> Option<String> {
    (name.len() < MAX_NAME_LEN).then_some(name)
}

/// `__ZN7MyClass10superClassE` -> `7MyClass`.
pub fn class_from_super_metaclass_pointer(name: &str) -> Option<&str> {
    strip(name, OSOBJ_PREFIX, SUPER_METACLASS_POINTER_TOKEN)
}

/// `__ZN7MyClass10gMetaClassE` -> `7MyClass`.
pub fn class_from_metaclass_pointer(name: &str) -> Option<&str> {
    strip(name, OSOBJ_PREFIX, METACLASS_TOKEN)
}

/// `__ZTV7MyClass` -> `7MyClass`.
pub fn class_from_vtable(name: &str) -> Option<&str> {
    strip(name, VTABLE_PREFIX, "")
}

pub fn vtable_name(class: &str) -> Option<String> {
    bounded(format!("{VTABLE_PREFIX}{class}"))
}

pub fn metaclass_vtable_name(class: &str) -> Option<String> {
    bounded(format!(
        "{METACLASS_VTABLE_PREFIX}{class}{METACLASS_VTABLE_SUFFIX}"
    ))
}

/// Prefix shared by every member function of `class`.
pub fn function_prefix(class: &str) -> Option<String> {
    bounded(format!("{OSOBJ_PREFIX}{class}"))
}

pub fn final_class_symbol(class: &str) -> Option<String> {
    bounded(format!("{OSOBJ_PREFIX}{class}{FINAL_CLASS_TOKEN}"))
}
