//! Utility functions.

/// Aligns an address or size up to the next multiple of `align`.
/// `align` must be a power of two; `0` and `1` leave `addr` unchanged.
///
/// Arithmetic wraps like the 64-bit address math of the target.
pub fn align_up(addr: u64, align: u64) -> u64 {
    if align <= 1 {
        return addr;
    }
    debug_assert!(align.is_power_of_two());
    addr.wrapping_add(align - 1) & !(align - 1)
}

/// Turns a Mach-O section alignment exponent into a byte alignment.
pub fn alignment(exponent: u32) -> Option<u64> {
    1u64.checked_shl(exponent)
}

/// Reads the NUL-terminated string starting at `offset`.
///
/// Returns `None` when the offset is out of bounds, the terminator is missing
/// or the bytes are not UTF-8.
pub fn c_str_at(bytes: &[u8], offset: usize) -> Option<&str> {
    let tail = bytes.get(offset..)?;
    let len = tail.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&tail[..len]).ok()
}

/// Trims a fixed-size, NUL-padded Mach-O name.
pub fn fixed_name(raw: &[u8; 16]) -> &str {
    let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    std::str::from_utf8(&raw[..len]).unwrap_or("")
}

/// Builds a fixed-size, NUL-padded Mach-O name.
pub fn to_fixed_name(name: &str) -> [u8; 16] {
    let mut raw = [0u8; 16];
    let len = name.len().min(16);
    raw[..len].copy_from_slice(&name.as_bytes()[..len]);
    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(0, 0x1000), 0);
        assert_eq!(align_up(1, 0x1000), 0x1000);
        assert_eq!(align_up(0x1000, 0x1000), 0x1000);
        assert_eq!(align_up(0x1234, 16), 0x1240);
        assert_eq!(align_up(0x1235, 1), 0x1235);
        assert_eq!(align_up(7, 0), 7);
    }

    #[test]
    fn c_str_requires_terminator() {
        let table = b"\0_foo\0_bar";
        assert_eq!(c_str_at(table, 1), Some("_foo"));
        assert_eq!(c_str_at(table, 0), Some(""));
        assert_eq!(c_str_at(table, 6), None);
        assert_eq!(c_str_at(table, 42), None);
    }

    #[test]
    fn fixed_names_round_trip() {
        let raw = to_fixed_name("__LINKEDIT");
        assert_eq!(fixed_name(&raw), "__LINKEDIT");
        assert_eq!(alignment(4), Some(16));
        assert_eq!(alignment(64), None);
    }
}
