// ── Single-instance guard ──
//
// At most one `Client` may exist per process. The guard claims a
// process-wide flag on creation and releases it on drop.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::CoreError;

static CLAIMED: AtomicBool = AtomicBool::new(false);

#[derive(Debug)]
pub struct InstanceGuard {
    _private: (),
}

impl InstanceGuard {
    /// Claim the process-wide slot, or fail with [`CoreError::AlreadyRunning`].
    pub fn acquire() -> Result<Self, CoreError> {
        CLAIMED
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| Self { _private: () })
            .map_err(|_| CoreError::AlreadyRunning)
    }

    pub fn is_claimed() -> bool {
        CLAIMED.load(Ordering::Acquire)
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        CLAIMED.store(false, Ordering::Release);
    }
}
