use std::{
    cell::RefCell,
    sync::{
        atomic::{AtomicBool, AtomicU64},
        Arc,
    },
};

use atomic::{Atomic, Ordering};
use parking_lot::Mutex;

use crate::{
    collector::{Collector, RootHandle},
    errors::GcError,
    gcref::ObjectRef,
    header::{Color, Header},
    heap::{allocation_size, RawAllocation},
};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ThreadState {
    /// Outside of any operation, holds no heap pointers.
    Safe = 0,
    /// Inside an operation scope.
    Unsafe = 1,
    /// Deregistered.
    Detached = 2,
}

impl ThreadState {
    pub fn safe_for_safepoint(self) -> bool {
        !matches!(self, Self::Unsafe)
    }
}

/// Per-thread view of a [`Collector`].
///
/// A mutator caches the collector's phase and colors at every poll; all
/// allocations and write barriers of the following operation use that
/// cached state.
pub struct Mutator {
    id: u64,
    collector: Arc<Collector>,
    pub(crate) state: Atomic<ThreadState>,
    ack_epoch: AtomicU64,
    marking: AtomicBool,
    mark_color: Atomic<Color>,
    alloc_color: Atomic<Color>,
    pub(crate) allocations: Mutex<Vec<RawAllocation>>,
    pub(crate) barrier_log: Mutex<Vec<ObjectRef>>,
}

impl Mutator {
    pub(crate) fn new(id: u64, collector: Arc<Collector>) -> Self {
        let color = collector.alloc_color();
        Self {
            id,
            state: Atomic::new(ThreadState::Safe),
            ack_epoch: AtomicU64::new(collector.safepoint().epoch()),
            marking: AtomicBool::new(false),
            mark_color: Atomic::new(color),
            alloc_color: Atomic::new(color),
            allocations: Mutex::new(Vec::new()),
            barrier_log: Mutex::new(Vec::new()),
            collector,
        }
    }

    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    pub fn state(&self) -> ThreadState {
        self.state.load(Ordering::SeqCst)
    }

    /// Opens an operation scope. The outermost scope polls for
    /// synchronization with the collector; nested scopes do not.
    pub fn enter(&self) -> OperationScope<'_> {
        let previous = self.state.swap(ThreadState::Unsafe, Ordering::SeqCst);
        if previous != ThreadState::Unsafe {
            self.poll_for_sync();
        }
        OperationScope {
            mutator: self,
            previous,
        }
    }

    /// Publishes the epoch this thread has observed and refreshes the
    /// cached phase and colors. Must only run at an operation boundary.
    pub fn poll_for_sync(&self) {
        let epoch = self.collector.safepoint().epoch();
        self.marking
            .store(self.collector.is_marking(), Ordering::SeqCst);
        self.mark_color
            .store(self.collector.mark_color(), Ordering::SeqCst);
        self.alloc_color
            .store(self.collector.alloc_color(), Ordering::SeqCst);
        self.ack_epoch.store(epoch, Ordering::SeqCst);
    }

    pub(crate) fn has_acknowledged(&self, epoch: u64) -> bool {
        self.state.load(Ordering::SeqCst).safe_for_safepoint()
            || self.ack_epoch.load(Ordering::SeqCst) >= epoch
    }

    /// Color given to objects allocated or shallow-copied by this thread.
    #[inline(always)]
    pub fn color(&self) -> Color {
        self.alloc_color.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn is_marking(&self) -> bool {
        self.marking.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn mark_color(&self) -> Color {
        self.mark_color.load(Ordering::Relaxed)
    }

    /// Allocates `size` payload bytes aligned to `align` behind `header`
    /// (re-colored with this thread's color) and `log_ptrs` empty log slots.
    pub fn allocate(
        &self,
        size: usize,
        align: usize,
        header: Header,
        log_ptrs: usize,
    ) -> Result<ObjectRef, GcError> {
        let header = header.recolored(self.color());
        let total = allocation_size(size, align, log_ptrs);
        self.collector.reserve(total)?;
        let raw = match RawAllocation::allocate(size, align, header, log_ptrs) {
            Ok(raw) => raw,
            Err(error) => {
                self.collector.unreserve(total);
                return Err(error);
            }
        };
        let object = raw.object();
        self.allocations.lock().push(raw);
        Ok(object)
    }

    /// Registers a callback the collector invokes to discover roots. The
    /// callback stays registered until the handle is passed to
    /// [`Collector::remove_root`].
    pub fn set_root_callback<F>(&self, callback: F) -> RootHandle
    where
        F: Fn() -> Vec<ObjectRef> + Send + Sync + 'static,
    {
        self.collector.register_root(Box::new(callback))
    }

    pub(crate) fn log_overwritten(&self, object: ObjectRef) {
        self.barrier_log.lock().push(object);
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.state.store(ThreadState::Detached, Ordering::SeqCst);
        let allocations = std::mem::take(self.allocations.get_mut());
        let logged = std::mem::take(self.barrier_log.get_mut());
        self.collector.adopt(self.id, allocations, logged);
    }
}

/// Marks the owning thread as running heap code for its lifetime.
pub struct OperationScope<'a> {
    mutator: &'a Mutator,
    previous: ThreadState,
}

impl OperationScope<'_> {
    pub fn mutator(&self) -> &Mutator {
        self.mutator
    }
}

impl Drop for OperationScope<'_> {
    fn drop(&mut self) {
        self.mutator.state.store(self.previous, Ordering::SeqCst);
    }
}

thread_local! {
    static MUTATORS: RefCell<Vec<Arc<Mutator>>> = RefCell::new(Vec::new());
}

/// The calling thread's mutator for `collector`, registered on first use.
pub(crate) fn current(collector: &Arc<Collector>) -> Result<Arc<Mutator>, GcError> {
    MUTATORS
        .try_with(|mutators| {
            let mut mutators = mutators
                .try_borrow_mut()
                .map_err(|_| GcError::MutatorUnavailable)?;
            if let Some(mutator) = mutators
                .iter()
                .find(|mutator| Arc::ptr_eq(&mutator.collector, collector))
            {
                return Ok(mutator.clone());
            }
            let mutator = collector.attach_mutator();
            mutators.push(mutator.clone());
            Ok(mutator)
        })
        .map_err(|_| GcError::MutatorUnavailable)?
}

/// State of the calling thread's mutator for `collector`, if it has one.
pub(crate) fn current_state(collector: &Collector) -> Option<ThreadState> {
    MUTATORS
        .try_with(|mutators| {
            mutators.try_borrow().ok().and_then(|mutators| {
                mutators
                    .iter()
                    .find(|mutator| std::ptr::eq(Arc::as_ptr(&mutator.collector), collector))
                    .map(|mutator| mutator.state())
            })
        })
        .ok()
        .flatten()
}

/// Drops the calling thread's mutator for `collector`.
pub(crate) fn detach(collector: &Collector) {
    let detached = MUTATORS
        .try_with(|mutators| {
            let mut mutators = match mutators.try_borrow_mut() {
                Ok(mutators) => mutators,
                Err(_) => return Vec::new(),
            };
            let (detached, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut *mutators)
                .into_iter()
                .partition(|mutator| std::ptr::eq(Arc::as_ptr(&mutator.collector), collector));
            *mutators = kept;
            detached
        })
        .unwrap_or_default();
    drop(detached);
}
