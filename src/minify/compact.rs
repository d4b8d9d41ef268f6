//! Compact identifiers: a bijection between integers and short strings.
//!
//! Identifiers are base 54 over `a..z`, `A..Z`, `$`, `_` with no reserved
//! leading symbol: `0 -> "a"`, `53 -> "_"`, `54 -> "ba"`.

use crate::error::{Result, SyncError};

const ALPHABET: &[u8; 54] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ$_";
const BASE: u64 = ALPHABET.len() as u64;

/// Render `n` as a compact identifier.
pub fn int_to_compact(mut n: u64) -> String {
    let mut digits = Vec::new();
    loop {
        digits.push(ALPHABET[(n % BASE) as usize]);
        n /= BASE;
        if n == 0 {
            break;
        }
    }
    digits.reverse();
    digits.into_iter().map(char::from).collect()
}

/// Parse a compact identifier back to its integer.
pub fn compact_to_int(id: &str) -> Result<u64> {
    if id.is_empty() {
        return Err(SyncError::ConfigValidation("empty compact identifier".into()));
    }
    let mut n: u64 = 0;
    for c in id.bytes() {
        let digit = ALPHABET
            .iter()
            .position(|&a| a == c)
            .ok_or_else(|| {
                SyncError::ConfigValidation(format!(
                    "invalid character {:?} in compact identifier {id:?}",
                    char::from(c)
                ))
            })? as u64;
        n = n
            .checked_mul(BASE)
            .and_then(|n| n.checked_add(digit))
            .ok_or_else(|| SyncError::ConfigValidation(format!("compact identifier {id:?} overflows")))?;
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_known_values() {
        assert_eq!(int_to_compact(0), "a");
        assert_eq!(int_to_compact(1), "b");
        assert_eq!(int_to_compact(25), "z");
        assert_eq!(int_to_compact(26), "A");
        assert_eq!(int_to_compact(51), "Z");
        assert_eq!(int_to_compact(52), "$");
        assert_eq!(int_to_compact(53), "_");
        assert_eq!(int_to_compact(54), "ba");
        assert_eq!(int_to_compact(55), "bb");
    }

    #[test]
    fn test_parse_known_values() {
        assert_eq!(compact_to_int("a").unwrap(), 0);
        assert_eq!(compact_to_int("_").unwrap(), 53);
        assert_eq!(compact_to_int("ba").unwrap(), 54);
        assert_eq!(compact_to_int("bU").unwrap(), 100);
    }

    #[test]
    fn test_invalid_input() {
        assert!(compact_to_int("a-b").is_err());
        assert!(compact_to_int("").is_err());
        assert!(compact_to_int("ééé").is_err());
    }

    #[test]
    fn test_contiguous_range_distinct() {
        let names: HashSet<String> = (0..10_000).map(int_to_compact).collect();
        assert_eq!(names.len(), 10_000);
    }

    proptest! {
        #[test]
        fn prop_roundtrip(n in any::<u64>()) {
            prop_assert_eq!(compact_to_int(&int_to_compact(n)).unwrap(), n);
        }

        #[test]
        fn prop_distinct_in_range(start in 0u64..1_000_000, len in 1usize..500) {
            let names: HashSet<String> = (start..start + len as u64).map(int_to_compact).collect();
            prop_assert_eq!(names.len(), len);
        }
    }
}
