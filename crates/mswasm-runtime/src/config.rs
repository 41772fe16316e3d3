//! Engine configuration.

use crate::key_table::INITIAL_CAPACITY;
use crate::ConstructionError;

/// Limits for one `MemoryEngine` and its key table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Slots in a fresh key table.
    pub initial_capacity: usize,
    /// The key table never grows beyond this many slots; an insert that
    /// would need more fails with `AllocationFailed`.
    pub max_capacity: usize,
    /// Largest single allocation in bytes.
    pub max_segment_size: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_capacity: INITIAL_CAPACITY,
            max_capacity: 1 << 22,
            max_segment_size: 1 << 30,
        }
    }
}

impl EngineConfig {
    /// # Errors
    /// `ZeroInitialCapacity` or `InitialCapacityExceedsMax`.
    pub fn validate(&self) -> Result<(), ConstructionError> {
        if self.initial_capacity == 0 {
            return Err(ConstructionError::ZeroInitialCapacity);
        }
        if self.initial_capacity > self.max_capacity {
            return Err(ConstructionError::InitialCapacityExceedsMax {
                initial: self.initial_capacity,
                max: self.max_capacity,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert_eq!(EngineConfig::default().validate(), Ok(()));
        assert_eq!(EngineConfig::default().initial_capacity, 11);
    }

    #[test]
    fn initial_above_max_rejected() {
        let config = EngineConfig {
            initial_capacity: 64,
            max_capacity: 32,
            ..EngineConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConstructionError::InitialCapacityExceedsMax { initial: 64, max: 32 })
        );
    }
}
