//! Test-harness hook for intercepting domain configuration persistence.
//!
//! The slot is handed to the shard at construction. Holding an
//! [`OverrideGuard`] is the only way an override stays installed, so install
//! and uninstall are always paired and a second install while one is active
//! fails instead of silently replacing it.

use crate::catalog::PathId;
use crate::error::MetaError;
use crate::quota::DomainConfig;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

pub trait PersistOverride: Send + Sync {
    /// Returns `false` to keep the record out of the journal.
    fn persist_domain_config(&self, domain_id: PathId, config: &DomainConfig) -> bool;
}

#[derive(Clone, Default)]
pub struct OverrideSlot {
    active: Arc<Mutex<Option<Arc<dyn PersistOverride>>>>,
}

impl std::fmt::Debug for OverrideSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverrideSlot")
            .field("installed", &self.is_installed())
            .finish()
    }
}

impl OverrideSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, hook: Arc<dyn PersistOverride>) -> Result<OverrideGuard, MetaError> {
        let mut active = self.active.lock();
        if active.is_some() {
            return Err(MetaError::OverrideAlreadyInstalled);
        }
        *active = Some(hook);
        debug!("persist override installed");
        Ok(OverrideGuard { slot: self.clone() })
    }

    pub fn is_installed(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Whether the domain config record should be staged; `true` when no
    /// override is installed.
    pub(crate) fn should_persist_domain_config(
        &self,
        domain_id: PathId,
        config: &DomainConfig,
    ) -> bool {
        let hook = self.active.lock().clone();
        match hook {
            Some(hook) => hook.persist_domain_config(domain_id, config),
            None => true,
        }
    }
}

#[must_use = "dropping the guard uninstalls the override"]
#[derive(Debug)]
pub struct OverrideGuard {
    slot: OverrideSlot,
}

impl Drop for OverrideGuard {
    fn drop(&mut self) {
        self.slot.active.lock().take();
        debug!("persist override uninstalled");
    }
}

#[cfg(test)]
mod tests {
    use super::{OverrideSlot, PersistOverride};
    use crate::catalog::PathId;
    use crate::error::MetaErrorCode;
    use crate::quota::{DomainConfig, DomainLimits};
    use std::sync::Arc;

    struct Skip;

    impl PersistOverride for Skip {
        fn persist_domain_config(&self, _domain_id: PathId, _config: &DomainConfig) -> bool {
            false
        }
    }

    fn config() -> DomainConfig {
        DomainConfig {
            name: "db".into(),
            limits: DomainLimits::default(),
        }
    }

    #[test]
    fn second_install_fails_until_guard_drops() {
        let slot = OverrideSlot::new();
        let guard = slot.install(Arc::new(Skip)).expect("install");
        assert!(slot.is_installed());
        let err = slot.install(Arc::new(Skip)).err().expect("second install");
        assert_eq!(err.code(), MetaErrorCode::OverrideAlreadyInstalled);
        drop(guard);
        assert!(!slot.is_installed());
        let _again = slot.install(Arc::new(Skip)).expect("install after uninstall");
    }

    #[test]
    fn installed_override_decides_persistence() {
        let slot = OverrideSlot::new();
        assert!(slot.should_persist_domain_config(PathId(1), &config()));
        let _guard = slot.install(Arc::new(Skip)).expect("install");
        assert!(!slot.should_persist_domain_config(PathId(1), &config()));
    }
}
