//! Sortable 128-bit event identifiers. Lexicographic byte order of the hex
//! encoding matches creation order: high bits are a millisecond timestamp,
//! low bits are random, ULID-style.

use rand::RngCore;

/// A 128-bit id whose hex string representation sorts the same way its
/// creation order did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SortableId([u8; 16]);

impl SortableId {
    /// Builds a new id from the given millisecond timestamp and fresh
    /// randomness. Split out from `new` so tests can pin the timestamp.
    pub fn from_parts(timestamp_ms: u64, random_tail: [u8; 10]) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..6].copy_from_slice(&timestamp_ms.to_be_bytes()[2..8]);
        bytes[6..16].copy_from_slice(&random_tail);
        SortableId(bytes)
    }

    pub fn new(timestamp_ms: u64) -> Self {
        let mut tail = [0u8; 10];
        rand::thread_rng().fill_bytes(&mut tail);
        Self::from_parts(timestamp_ms, tail)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for SortableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::str::FromStr for SortableId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = hex::decode(s)?;
        let mut bytes = [0u8; 16];
        if decoded.len() != 16 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        bytes.copy_from_slice(&decoded);
        Ok(SortableId(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_timestamp_sorts_after_earlier() {
        let a = SortableId::from_parts(1_000, [0u8; 10]);
        let b = SortableId::from_parts(2_000, [0u8; 10]);
        assert!(a.to_hex() < b.to_hex());
        assert!(a < b);
    }

    #[test]
    fn same_timestamp_orders_by_random_tail() {
        let a = SortableId::from_parts(5_000, [0u8; 10]);
        let b = SortableId::from_parts(5_000, [1u8; 10]);
        assert!(a < b);
    }

    #[test]
    fn round_trips_through_hex() {
        let id = SortableId::new(123_456);
        let parsed: SortableId = id.to_hex().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
