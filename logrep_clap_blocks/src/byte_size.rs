//! Config for byte sizes.
use std::ops::Deref;

/// Parsable byte size, either a plain number of bytes or a number followed by a decimal (`KB`,
/// `MB`, `GB`) or binary (`KiB`, `MiB`, `GiB`) unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteSize(u64);

impl ByteSize {
    pub const fn new(bytes: u64) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> u64 {
        self.0
    }
}

impl Deref for ByteSize {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for ByteSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for ByteSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(s.len());
        let (digits, unit) = s.split_at(split);
        let value: u64 = digits
            .parse()
            .map_err(|e| format!("Cannot parse byte size '{s}': {e}"))?;
        let multiplier: u64 = match unit.trim() {
            "" | "B" => 1,
            "K" | "KB" => 1_000,
            "KiB" => 1 << 10,
            "M" | "MB" => 1_000_000,
            "MiB" => 1 << 20,
            "G" | "GB" => 1_000_000_000,
            "GiB" => 1 << 30,
            other => return Err(format!("Unknown byte size unit '{other}' in '{s}'")),
        };
        value
            .checked_mul(multiplier)
            .map(Self)
            .ok_or_else(|| format!("Byte size '{s}' is too large"))
    }
}

impl From<ByteSize> for u64 {
    fn from(size: ByteSize) -> Self {
        size.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::str::FromStr;

    #[test]
    fn test_byte_size() {
        assert_eq!(*ByteSize::from_str("1024").unwrap(), 1024);
        assert_eq!(*ByteSize::from_str("64KB").unwrap(), 64_000);
        assert_eq!(*ByteSize::from_str("128MiB").unwrap(), 128 << 20);
        assert_eq!(*ByteSize::from_str("2 GiB").unwrap(), 2 << 30);
        assert_eq!(*ByteSize::from_str("0").unwrap(), 0);

        assert_eq!(
            ByteSize::from_str("12 parsecs").unwrap_err(),
            "Unknown byte size unit 'parsecs' in '12 parsecs'",
        );
        assert!(ByteSize::from_str("MiB").is_err());
        assert!(ByteSize::from_str("99999999999999GiB").is_err());
    }
}
