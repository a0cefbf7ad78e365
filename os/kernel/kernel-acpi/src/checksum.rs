//! ACPI byte checksums.

/// Wrapping byte sum.
#[must_use]
pub fn sum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |a, &b| a.wrapping_add(b))
}

/// `true` if `bytes` sum to zero mod 256.
#[must_use]
pub fn is_valid_checksum(bytes: &[u8]) -> bool {
    sum(bytes) == 0
}

/// The byte that makes `bytes` (with the checksum slot zeroed) sum to zero.
#[must_use]
pub fn fixup(bytes: &[u8]) -> u8 {
    0u8.wrapping_sub(sum(bytes))
}
