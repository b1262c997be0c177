use parking_lot::{Condvar, Mutex};
use std::{sync::atomic::AtomicBool, time::Duration};

use atomic::Ordering;

/// Why the collector loop woke up.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Wakeup {
    Collect,
    Shutdown,
}

/// Parks the collector thread between cycles and wakes it on allocation
/// pressure, explicit requests or shutdown.
pub struct CollectionBarrier {
    mutex: Mutex<()>,
    cv_wakeup: Condvar,
    collection_requested: AtomicBool,
    shutdown_requested: AtomicBool,
}

impl CollectionBarrier {
    pub fn new() -> Self {
        Self {
            mutex: Mutex::new(()),
            cv_wakeup: Condvar::new(),
            collection_requested: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
        }
    }

    pub fn was_gc_requested(&self) -> bool {
        self.collection_requested.load(Ordering::Relaxed)
    }

    pub fn request_gc(&self) {
        let was_already_requested = self.collection_requested.swap(true, Ordering::AcqRel);
        if !was_already_requested {
            let guard = self.mutex.lock();
            self.cv_wakeup.notify_all();
            drop(guard);
        }
    }

    /// Consumes a pending request, returning whether there was one.
    pub fn take_request(&self) -> bool {
        self.collection_requested.swap(false, Ordering::AcqRel)
    }

    pub fn notify_shutdown_requested(&self) {
        let guard = self.mutex.lock();
        self.shutdown_requested.store(true, Ordering::Release);
        self.cv_wakeup.notify_all();
        drop(guard);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    /// Blocks until a collection or shutdown is requested. With an
    /// `interval` a timeout counts as a collection request.
    pub fn await_request(&self, interval: Option<Duration>) -> Wakeup {
        let mut guard = self.mutex.lock();
        loop {
            if self.is_shutdown_requested() {
                return Wakeup::Shutdown;
            }
            if self.was_gc_requested() {
                return Wakeup::Collect;
            }
            match interval {
                Some(interval) => {
                    if self.cv_wakeup.wait_for(&mut guard, interval).timed_out() {
                        return if self.is_shutdown_requested() {
                            Wakeup::Shutdown
                        } else {
                            Wakeup::Collect
                        };
                    }
                }
                None => self.cv_wakeup.wait(&mut guard),
            }
        }
    }
}

impl Default for CollectionBarrier {
    fn default() -> Self {
        Self::new()
    }
}
