//! # Hash Slots
//!
//! Purpose: Map keys onto the fixed set of cluster hash slots so that routing
//! decisions are deterministic across processes.
//!
//! ## Design Principles
//! 1. **Pure Functions**: Slot math has no state and no allocation.
//! 2. **Hash Tags**: Only the first non-empty `{...}` section is hashed, letting
//!    callers co-locate related keys.
//! 3. **Wire Compatible**: CRC16/XMODEM modulo 16384 matches the server side.

/// Number of hash slots in a clustered deployment.
pub const SLOT_COUNT: u16 = 16384;

/// CRC16 with the XMODEM polynomial (0x1021), no reflection, zero init.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Returns the hash tag of a key, or the whole key when it has none.
///
/// The tag is the content between the first `{` and the next `}`. An empty
/// tag (`{}`) does not count and the whole key is hashed instead.
pub fn hash_tag(key: &[u8]) -> &[u8] {
    let Some(open) = key.iter().position(|&b| b == b'{') else {
        return key;
    };
    let rest = &key[open + 1..];
    match rest.iter().position(|&b| b == b'}') {
        Some(close) if close > 0 => &rest[..close],
        _ => key,
    }
}

/// Computes the slot a key belongs to.
#[inline]
pub fn key_slot(key: &[u8]) -> u16 {
    crc16(hash_tag(key)) % SLOT_COUNT
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn crc16_check_value() {
        assert_eq!(crc16(b"123456789"), 0x31c3);
    }

    #[test]
    fn known_slots() {
        assert_eq!(key_slot(b"foo"), 12182);
        assert_eq!(key_slot(b"bar"), 5061);
        assert_eq!(key_slot(b""), 0);
    }

    #[test]
    fn hash_tag_rules() {
        assert_eq!(hash_tag(b"{user1000}.following"), b"user1000");
        assert_eq!(hash_tag(b"foo{}{bar}"), b"foo{}{bar}");
        assert_eq!(hash_tag(b"foo{{bar}}zap"), b"{bar");
        assert_eq!(hash_tag(b"foo{bar}{zap}"), b"bar");
        assert_eq!(hash_tag(b"no-close{tag"), b"no-close{tag");
    }

    #[test]
    fn tagged_keys_share_slot() {
        assert_eq!(
            key_slot(b"{user1000}.following"),
            key_slot(b"{user1000}.followers")
        );
    }

    proptest! {
        #[test]
        fn same_tag_same_slot(
            tag in "[a-z0-9:]{1,12}",
            left in "[^{}]{0,16}",
            right in "[^{}]{0,16}",
            other in "[^{}]{0,16}",
        ) {
            let a = format!("{left}{{{tag}}}{right}");
            let b = format!("{other}{{{tag}}}");
            prop_assert_eq!(key_slot(a.as_bytes()), key_slot(b.as_bytes()));
            prop_assert!(key_slot(a.as_bytes()) < SLOT_COUNT);
        }
    }
}
