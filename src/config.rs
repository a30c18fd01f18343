use crate::error::MetaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// fsync the journal before a commit is acknowledged.
    Full,
    OsBuffered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMode {
    Strict,
    Permissive,
}

/// Runtime configuration for a metadata shard.
#[derive(Debug, Clone)]
pub struct MetaConfig {
    pub durability_mode: DurabilityMode,
    pub recovery_mode: RecoveryMode,
    pub describe_cache_capacity: usize,
    pub max_parts_per_transaction: usize,
    /// Keeps the stream group record around after deallocation so tests can
    /// inspect what the drop left behind.
    pub disable_cleanup_on_drop_for_test: bool,
    pub disable_publications_of_dropping: bool,
    /// Undo in-flight multi-step operations after replay instead of resuming
    /// them on the next tick.
    pub abort_inflight_on_recovery: bool,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            durability_mode: DurabilityMode::Full,
            recovery_mode: RecoveryMode::Strict,
            describe_cache_capacity: 1024,
            max_parts_per_transaction: 64,
            disable_cleanup_on_drop_for_test: false,
            disable_publications_of_dropping: false,
            abort_inflight_on_recovery: false,
        }
    }
}

impl MetaConfig {
    pub fn production() -> Self {
        Self {
            durability_mode: DurabilityMode::Full,
            recovery_mode: RecoveryMode::Strict,
            ..Self::default()
        }
    }

    pub fn development() -> Self {
        Self {
            durability_mode: DurabilityMode::OsBuffered,
            recovery_mode: RecoveryMode::Permissive,
            describe_cache_capacity: 128,
            ..Self::default()
        }
    }

    pub fn strict_recovery(&self) -> bool {
        matches!(self.recovery_mode, RecoveryMode::Strict)
    }

    pub fn validate(&self) -> Result<(), MetaError> {
        if self.describe_cache_capacity == 0 {
            return Err(MetaError::InvalidConfig {
                message: "describe_cache_capacity must be > 0".into(),
            });
        }
        if self.max_parts_per_transaction == 0 {
            return Err(MetaError::InvalidConfig {
                message: "max_parts_per_transaction must be > 0".into(),
            });
        }
        Ok(())
    }
}
