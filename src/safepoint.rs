use std::{
    sync::{atomic::AtomicU64, Arc},
    thread,
};

use atomic::Ordering;
use crossbeam_utils::Backoff;

use crate::mutator::Mutator;

/// Epoch-based handshake between the collector and the registered
/// mutators.
///
/// The collector never stops a mutator. It bumps the epoch and waits until
/// every mutator has either started a new operation (and thereby polled the
/// new epoch) or is outside of any operation.
pub struct GlobalSafepoint {
    epoch: AtomicU64,
}

impl GlobalSafepoint {
    pub const fn new() -> Self {
        Self {
            epoch: AtomicU64::new(0),
        }
    }

    #[inline(always)]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Returns once no operation that began before this call is still
    /// running on any of `mutators`.
    pub fn handshake(&self, mutators: &[Arc<Mutator>]) -> u64 {
        let target = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        for mutator in mutators {
            let backoff = Backoff::new();
            while !mutator.has_acknowledged(target) {
                if backoff.is_completed() {
                    thread::yield_now();
                } else {
                    backoff.snooze();
                }
            }
        }
        tracing::trace!(epoch = target, mutators = mutators.len(), "handshake complete");
        target
    }
}

impl Default for GlobalSafepoint {
    fn default() -> Self {
        Self::new()
    }
}
