use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
use std::time::{SystemTime, UNIX_EPOCH};

static COUNTER: AtomicU32 = AtomicU32::new(0);

/// 12-byte primary key: 4-byte epoch seconds, 5-byte machine/process nonce,
/// 3-byte monotonic counter — all stored big-endian.
///
/// The source this engine descends from parsed the timestamp and counter in
/// host byte order, which breaks the lexicographic-by-creation-time property
/// on little-endian hosts. This type always encodes big-endian regardless of
/// host endianness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    /// Generates a fresh id: current epoch seconds, a process-local nonce
    /// derived once at startup, and a counter that wraps within 24 bits.
    pub fn new() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as u32;
        let nonce = process_nonce();
        let counter = COUNTER.fetch_add(1, AtomicOrdering::Relaxed) & 0x00FF_FFFF;

        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..9].copy_from_slice(&nonce);
        bytes[9..12].copy_from_slice(&counter.to_be_bytes()[1..4]);
        Self(bytes)
    }

    pub const fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub const fn to_bytes(self) -> [u8; 12] {
        self.0
    }

    pub fn epoch_seconds(&self) -> u32 {
        u32::from_be_bytes(self.0[0..4].try_into().unwrap())
    }

    pub fn counter(&self) -> u32 {
        let mut buf = [0u8; 4];
        buf[1..4].copy_from_slice(&self.0[9..12]);
        u32::from_be_bytes(buf)
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 24 {
            return None;
        }
        let mut bytes = [0u8; 12];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            bytes[i] = ((hi << 4) | lo) as u8;
        }
        Some(Self(bytes))
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

fn process_nonce() -> [u8; 5] {
    // Derived once per process from the PID and address space layout; not
    // cryptographically strong, only collision-resistant enough to keep ids
    // from different processes apart.
    let pid = std::process::id();
    let addr = &COUNTER as *const _ as u64;
    let mixed = (pid as u64).wrapping_mul(0x9E3779B97F4A7C15) ^ addr;
    let b = mixed.to_be_bytes();
    [b[3], b[4], b[5], b[6], b[7]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn big_endian_round_trip() {
        let bytes: [u8; 12] = [0, 0, 0, 1, 1, 2, 3, 4, 5, 0, 0, 1];
        let id = ObjectId::from_bytes(bytes);
        assert_eq!(id.epoch_seconds(), 1);
        assert_eq!(id.counter(), 1);
        assert_eq!(id.to_bytes(), bytes);
    }

    #[test]
    fn ordering_is_time_monotonic() {
        let a = ObjectId::from_bytes([0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0]);
        let b = ObjectId::from_bytes([0, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert!(a < b);
    }

    #[test]
    fn hex_round_trip() {
        let id = ObjectId::new();
        let hex = id.to_hex();
        assert_eq!(ObjectId::from_hex(&hex), Some(id));
    }
}
