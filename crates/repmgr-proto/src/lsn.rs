/// WAL position (log sequence number) handling.
///
/// An LSN is a 64-bit monotonic byte position in the WAL stream, written
/// and parsed in the engine's `XXXXXXXX/XXXXXXXX` hexadecimal form where
/// the halves are the high and low 32 bits.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A 64-bit WAL position.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The invalid/unset position, printed as `0/0`.
    pub const INVALID: Lsn = Lsn(0);

    pub fn is_valid(self) -> bool {
        self != Lsn::INVALID
    }

    /// Bytes between two positions, saturating at zero when `other` is ahead.
    pub fn diff(self, other: Lsn) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 as u32)
    }
}

impl FromStr for Lsn {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (high, low) = s
            .split_once('/')
            .ok_or_else(|| format!("invalid LSN \"{}\"", s))?;
        let high = u32::from_str_radix(high, 16).map_err(|e| format!("invalid LSN \"{}\": {}", s, e))?;
        let low = u32::from_str_radix(low, 16).map_err(|e| format!("invalid LSN \"{}\": {}", s, e))?;
        Ok(Lsn(((high as u64) << 32) + low as u64))
    }
}

impl From<u64> for Lsn {
    fn from(v: u64) -> Self {
        Lsn(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_format_roundtrip() {
        for s in ["0/0", "0/16B3740", "16/B374D848", "FFFFFFFF/FFFFFFFF"] {
            let lsn: Lsn = s.parse().unwrap();
            assert_eq!(lsn.to_string(), s);
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<Lsn>().is_err());
        assert!("16B3740".parse::<Lsn>().is_err());
        assert!("zz/16".parse::<Lsn>().is_err());
    }

    #[test]
    fn test_ordering_and_diff() {
        let a: Lsn = "0/1000".parse().unwrap();
        let b: Lsn = "1/0".parse().unwrap();
        assert!(b > a);
        assert_eq!(b.diff(a), (1u64 << 32) - 0x1000);
        assert_eq!(a.diff(b), 0);
    }

    #[test]
    fn test_invalid_sentinel() {
        assert!(!Lsn::INVALID.is_valid());
        assert_eq!(Lsn::INVALID.to_string(), "0/0");
    }
}
