//! Process-wide kill switch (C9): when set, no skill may start and every
//! managed container is a candidate for forcible removal.

use std::sync::RwLock;

/// Injectable rather than a crate-level static (spec §9's design note) so
/// tests can construct independent lockdown state instead of sharing it
/// across the test binary.
#[derive(Default)]
pub struct Lockdown {
    active: RwLock<bool>,
}

impl Lockdown {
    pub fn new() -> Self {
        Self {
            active: RwLock::new(false),
        }
    }

    pub fn is_locked_down(&self) -> bool {
        *self.active.read().unwrap_or_else(|p| p.into_inner())
    }

    /// Idempotent: calling this while already locked down is a no-op.
    pub fn lockdown(&self) {
        *self.active.write().unwrap_or_else(|p| p.into_inner()) = true;
    }

    pub fn unlock(&self) {
        *self.active.write().unwrap_or_else(|p| p.into_inner()) = false;
    }
}
