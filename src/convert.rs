// Part of ethercat-bus. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

/// Parses an object index: hex with a `0x` prefix, decimal otherwise.
pub(crate) fn parse_object_index(input: &str) -> Option<u16> {
    let s = input.trim();
    let (digits, radix) = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (s, 10),
    };
    if digits.is_empty() || digits.starts_with('+') {
        return None;
    }
    u16::from_str_radix(digits, radix).ok()
}

#[test]
fn test_parse_object_index() {
    assert_eq!(parse_object_index("0x1600"), Some(0x1600));
    assert_eq!(parse_object_index("0X1a00"), Some(0x1A00));
    assert_eq!(parse_object_index(" 5633 "), Some(0x1601));
    assert_eq!(parse_object_index("1600"), Some(1600));
    assert_eq!(parse_object_index("0x"), None);
    assert_eq!(parse_object_index("0x10000"), None);
    assert_eq!(parse_object_index("0x16g0"), None);
    assert_eq!(parse_object_index("-0x1"), None);
    assert_eq!(parse_object_index("0x+1"), None);
}

/// Turns a visible-string SDO payload into a Rust string, stopping at the
/// first NUL byte.
pub(crate) fn sdo_bytes_to_string(data: &[u8]) -> String {
    let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).trim().to_owned()
}

#[test]
fn test_sdo_bytes_to_string() {
    assert_eq!(sdo_bytes_to_string(&[0; 16]), "");
    let mut arr = [0_u8; 64];
    arr[..12].copy_from_slice(b"Product code");
    assert_eq!(sdo_bytes_to_string(&arr), "Product code");
    assert_eq!(sdo_bytes_to_string(b"EL2008 \xff"), "EL2008 \u{FFFD}");
}
