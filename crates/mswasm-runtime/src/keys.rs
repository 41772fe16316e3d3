//! Sources of segment keys.
//!
//! Keys are sparse and unpredictable so that an integer corrupted in guest
//! memory has negligible odds of naming a live segment. The `KeyTable`
//! masks whatever a source yields to `KEY_MASK` and redraws zero or
//! already-used keys, so a source only has to be well spread, not unique.

/// A stream of candidate keys. `None` means the source is exhausted or
/// unavailable; allocation then fails with `AllocationFailed`.
pub trait KeySource {
    fn next_key(&mut self) -> Option<u32>;
}

/// Keys drawn from the operating system's random number generator.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsKeys;

impl OsKeys {
    /// Check that the OS entropy source works before relying on it.
    pub fn probe() -> Result<Self, getrandom::Error> {
        let mut buf = [0u8; 4];
        getrandom::getrandom(&mut buf)?;
        Ok(OsKeys)
    }
}

impl KeySource for OsKeys {
    fn next_key(&mut self) -> Option<u32> {
        let mut buf = [0u8; 4];
        match getrandom::getrandom(&mut buf) {
            Ok(()) => Some(u32::from_le_bytes(buf)),
            Err(err) => {
                tracing::warn!(%err, "entropy source failed while drawing a segment key");
                None
            }
        }
    }
}

/// Reproducible key stream (splitmix64) for traces and benchmarks.
#[derive(Debug, Clone)]
pub struct SeededKeys {
    state: u64,
}

impl SeededKeys {
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }
}

impl KeySource for SeededKeys {
    fn next_key(&mut self) -> Option<u32> {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        Some((z ^ (z >> 31)) as u32)
    }
}

/// Replays a fixed list of keys once. Used to force collisions in tests.
#[derive(Debug, Clone)]
pub struct FixedKeys {
    keys: Vec<u32>,
    next: usize,
}

impl FixedKeys {
    pub fn new(keys: impl Into<Vec<u32>>) -> Self {
        Self {
            keys: keys.into(),
            next: 0,
        }
    }
}

impl KeySource for FixedKeys {
    fn next_key(&mut self) -> Option<u32> {
        let key = self.keys.get(self.next).copied()?;
        self.next += 1;
        Some(key)
    }
}
