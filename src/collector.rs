use std::{
    any::TypeId,
    sync::{
        atomic::{AtomicU64, AtomicUsize},
        Arc, OnceLock, Weak,
    },
    thread::{self, JoinHandle},
    time::Instant,
};

use atomic::{Atomic, Ordering};
use parking_lot::Mutex;

use crate::{
    errors::GcError,
    gcref::ObjectRef,
    header::{Color, Header},
    heap::{allocation_size, RawAllocation},
    internal::{
        collection_barrier::{CollectionBarrier, Wakeup},
        finalize_trait::{DestroyCallback, Policy},
        trace_trait::{CopySpace, Tracer},
    },
    marking::Marker,
    mutator::{self, Mutator, ThreadState},
    safepoint::GlobalSafepoint,
    statistics::GcStats,
    sweeper::{sweep_allocations, SweepTotals},
    Config,
};

pub type RootCallback = Box<dyn Fn() -> Vec<ObjectRef> + Send + Sync>;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Phase {
    Idle = 0,
    Marking = 1,
    Sweeping = 2,
}

struct Binding {
    policy: TypeId,
    tracer: TypeId,
    destroy: DestroyCallback,
}

/// Allocations and barrier logs left behind by deregistered mutators, plus
/// everything the collector allocated itself.
#[derive(Default)]
struct Orphans {
    allocations: Vec<RawAllocation>,
    logged: Vec<ObjectRef>,
}

/// On-the-fly mark-sweep collector.
///
/// Construct one with [`Collector::new`] before any thread allocates. Each
/// thread gets its own [`Mutator`] through [`Collector::current_mutator`];
/// mutators, trie handles and a running collector thread all keep the
/// collector alive, and the heap is released once the last of them is gone.
pub struct Collector {
    config: Config,
    safepoint: GlobalSafepoint,
    barrier: CollectionBarrier,
    phase: Atomic<Phase>,
    mark_color: Atomic<Color>,
    alloc_color: Atomic<Color>,
    mutators: Mutex<Vec<Weak<Mutator>>>,
    next_mutator_id: AtomicU64,
    roots: Mutex<Vec<(u64, RootCallback)>>,
    next_root_id: AtomicU64,
    orphans: Mutex<Orphans>,
    cycle_lock: Mutex<()>,
    binding: OnceLock<Binding>,
    live_bytes: AtomicUsize,
    bytes_since_cycle: AtomicUsize,
    allocated_objects: AtomicUsize,
    allocated_bytes: AtomicUsize,
    stats: Mutex<GcStats>,
}

impl Collector {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config,
            safepoint: GlobalSafepoint::new(),
            barrier: CollectionBarrier::new(),
            phase: Atomic::new(Phase::Idle),
            mark_color: Atomic::new(Color::INITIAL),
            alloc_color: Atomic::new(Color::INITIAL),
            mutators: Mutex::new(Vec::new()),
            next_mutator_id: AtomicU64::new(1),
            roots: Mutex::new(Vec::new()),
            next_root_id: AtomicU64::new(1),
            orphans: Mutex::new(Orphans::default()),
            cycle_lock: Mutex::new(()),
            binding: OnceLock::new(),
            live_bytes: AtomicUsize::new(0),
            bytes_since_cycle: AtomicUsize::new(0),
            allocated_objects: AtomicUsize::new(0),
            allocated_bytes: AtomicUsize::new(0),
            stats: Mutex::new(GcStats::default()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn safepoint(&self) -> &GlobalSafepoint {
        &self.safepoint
    }

    pub fn phase(&self) -> Phase {
        self.phase.load(Ordering::SeqCst)
    }

    pub fn is_marking(&self) -> bool {
        self.phase() == Phase::Marking
    }

    pub fn mark_color(&self) -> Color {
        self.mark_color.load(Ordering::SeqCst)
    }

    pub fn alloc_color(&self) -> Color {
        self.alloc_color.load(Ordering::SeqCst)
    }

    /// The calling thread's mutator, registered on first use.
    pub fn current_mutator(self: &Arc<Self>) -> Result<Arc<Mutator>, GcError> {
        mutator::current(self)
    }

    /// Drops the calling thread's mutator. The next operation on this
    /// thread registers a fresh one.
    pub fn deregister_current_thread(&self) {
        mutator::detach(self);
    }

    pub(crate) fn attach_mutator(self: &Arc<Self>) -> Arc<Mutator> {
        let id = self.next_mutator_id.fetch_add(1, Ordering::Relaxed);
        let mutator = Arc::new(Mutator::new(id, self.clone()));
        self.mutators.lock().push(Arc::downgrade(&mutator));
        tracing::trace!(mutator = id, "mutator attached");
        mutator
    }

    pub(crate) fn adopt(&self, id: u64, allocations: Vec<RawAllocation>, logged: Vec<ObjectRef>) {
        self.mutators
            .lock()
            .retain(|mutator| mutator.strong_count() > 0);
        let mut orphans = self.orphans.lock();
        orphans.allocations.extend(allocations);
        orphans.logged.extend(logged);
        tracing::trace!(mutator = id, "mutator detached");
    }

    fn live_mutators(&self) -> Vec<Arc<Mutator>> {
        self.mutators
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Accounts for `bytes` of new storage, failing when the configured
    /// heap limit would be exceeded.
    pub(crate) fn reserve(&self, bytes: usize) -> Result<(), GcError> {
        let live = self.live_bytes.fetch_add(bytes, Ordering::AcqRel) + bytes;
        if let Some(limit) = self.config.max_heap_bytes {
            if live > limit {
                self.live_bytes.fetch_sub(bytes, Ordering::AcqRel);
                self.barrier.request_gc();
                tracing::warn!(requested = bytes, limit, "heap limit reached");
                return Err(GcError::HeapExhausted {
                    requested: bytes,
                    limit,
                });
            }
        }
        self.allocated_objects.fetch_add(1, Ordering::Relaxed);
        self.allocated_bytes.fetch_add(bytes, Ordering::Relaxed);
        let pending = self.bytes_since_cycle.fetch_add(bytes, Ordering::Relaxed) + bytes;
        if pending >= self.config.trigger_bytes {
            self.barrier.request_gc();
        }
        Ok(())
    }

    pub(crate) fn unreserve(&self, bytes: usize) {
        self.live_bytes.fetch_sub(bytes, Ordering::AcqRel);
    }

    pub(crate) fn register_root(&self, callback: RootCallback) -> RootHandle {
        let id = self.next_root_id.fetch_add(1, Ordering::Relaxed);
        self.roots.lock().push((id, callback));
        RootHandle { id }
    }

    /// Unregisters the root callback behind `handle`.
    pub fn remove_root(&self, handle: RootHandle) {
        self.roots.lock().retain(|(id, _)| *id != handle.id);
    }

    /// Union of every registered root callback.
    pub fn roots(&self) -> Vec<ObjectRef> {
        let roots = self.roots.lock();
        roots.iter().flat_map(|(_, callback)| callback()).collect()
    }

    /// Binds the destruction policy and tracer. A collector serves one pair
    /// for its whole lifetime.
    pub fn bind<P: Policy, T: Tracer>(&self) -> Result<(), GcError> {
        let binding = self.binding.get_or_init(|| Binding {
            policy: TypeId::of::<P>(),
            tracer: TypeId::of::<T>(),
            destroy: P::destroy,
        });
        if binding.policy == TypeId::of::<P>() && binding.tracer == TypeId::of::<T>() {
            Ok(())
        } else {
            Err(GcError::BindingMismatch)
        }
    }

    pub fn request_collection(&self) {
        self.barrier.request_gc();
    }

    /// Asks the collector loop to exit. The request is observed between
    /// cycles, a cycle in progress runs to completion first.
    pub fn stop(&self) {
        self.barrier.notify_shutdown_requested();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.barrier.is_shutdown_requested()
    }

    /// Blocking collector loop. Returns after [`Collector::stop`].
    pub fn run<P: Policy, T: Tracer>(&self) -> Result<(), GcError> {
        self.bind::<P, T>()?;
        tracing::debug!("collector loop started");
        while let Wakeup::Collect = self.barrier.await_request(self.config.cycle_interval) {
            self.cycle::<P, T>();
        }
        tracing::debug!("collector loop stopped");
        Ok(())
    }

    /// Runs [`Collector::run`] on a dedicated thread.
    pub fn spawn<P: Policy, T: Tracer>(self: &Arc<Self>) -> Result<CollectorThread, GcError> {
        self.bind::<P, T>()?;
        let collector = self.clone();
        let handle = thread::Builder::new()
            .name("otf-collector".to_string())
            .spawn(move || collector.run::<P, T>())?;
        Ok(CollectorThread {
            collector: self.clone(),
            handle: Some(handle),
        })
    }

    /// Runs one full cycle on the calling thread.
    pub fn collect<P: Policy, T: Tracer>(&self) -> Result<(), GcError> {
        self.bind::<P, T>()?;
        if mutator::current_state(self) == Some(ThreadState::Unsafe) {
            return Err(GcError::CollectInsideOperation);
        }
        self.cycle::<P, T>();
        Ok(())
    }

    /// Turns the write barrier on and picks the color of this cycle.
    /// Allocation keeps the previous color until [`Collector::blacken_allocation`].
    pub(crate) fn begin_marking(&self) -> Color {
        let mark = self.alloc_color().flipped();
        self.mark_color.store(mark, Ordering::SeqCst);
        self.phase.store(Phase::Marking, Ordering::SeqCst);
        mark
    }

    pub(crate) fn blacken_allocation(&self) {
        self.alloc_color.store(self.mark_color(), Ordering::SeqCst);
    }

    fn drain_barrier_logs(&self) -> Vec<ObjectRef> {
        let mut logged = std::mem::take(&mut self.orphans.lock().logged);
        let mutators = self.live_mutators();
        for mutator in &mutators {
            logged.append(&mut mutator.barrier_log.lock());
        }
        drop(mutators);
        logged
    }

    fn cycle<P: Policy, T: Tracer>(&self) {
        let _cycle = self.cycle_lock.lock();
        self.barrier.take_request();
        let started = Instant::now();
        let pending = self.bytes_since_cycle.swap(0, Ordering::Relaxed);
        tracing::debug!(allocated_since_last = pending, "collection started");

        let mark = self.begin_marking();
        tracing::trace!(color = mark.bits(), "marking phase entered");
        // Every operation still running after the first handshake has the
        // barrier on; after the second none predates black allocation.
        self.safepoint.handshake(&self.live_mutators());
        self.blacken_allocation();
        self.safepoint.handshake(&self.live_mutators());

        let mut marker = Marker::<T>::new(mark);
        for root in self.roots() {
            marker.shade(root);
        }
        loop {
            marker.drain();
            let logged = self.drain_barrier_logs();
            if logged.is_empty() {
                break;
            }
            for object in logged {
                marker.shade(object);
            }
        }

        self.phase.store(Phase::Sweeping, Ordering::SeqCst);
        tracing::trace!(marked = marker.marked_objects(), "sweeping phase entered");
        let totals = self.sweep::<P>(mark);
        self.phase.store(Phase::Idle, Ordering::SeqCst);
        self.live_bytes.fetch_sub(totals.freed_bytes, Ordering::AcqRel);

        let mut stats = self.stats.lock();
        stats.cycles += 1;
        stats.marked_objects = marker.marked_objects();
        stats.freed_objects += totals.freed_objects;
        stats.freed_bytes += totals.freed_bytes;
        stats.live_objects = totals.live_objects;
        stats.last_cycle = started.elapsed();
        if self.config.verbose {
            tracing::info!(
                cycle = stats.cycles,
                marked = stats.marked_objects,
                freed = totals.freed_objects,
                live = totals.live_objects,
                elapsed = ?stats.last_cycle,
                "collection finished"
            );
        } else {
            tracing::debug!(
                cycle = stats.cycles,
                marked = stats.marked_objects,
                freed = totals.freed_objects,
                live = totals.live_objects,
                elapsed = ?stats.last_cycle,
                "collection finished"
            );
        }
    }

    fn sweep<P: Policy>(&self, mark: Color) -> SweepTotals {
        let mut totals = SweepTotals::default();
        let mutators = self.live_mutators();
        for mutator in &mutators {
            let taken = std::mem::take(&mut *mutator.allocations.lock());
            let survivors = sweep_allocations::<P>(taken, mark, &mut totals);
            mutator.allocations.lock().extend(survivors);
        }
        let taken = std::mem::take(&mut self.orphans.lock().allocations);
        let survivors = sweep_allocations::<P>(taken, mark, &mut totals);
        self.orphans.lock().allocations.extend(survivors);
        drop(mutators);
        totals
    }

    pub fn stats(&self) -> GcStats {
        let mut stats = self.stats.lock().clone();
        stats.allocated_objects = self.allocated_objects.load(Ordering::Relaxed);
        stats.allocated_bytes = self.allocated_bytes.load(Ordering::Relaxed);
        stats.live_bytes = self.live_bytes.load(Ordering::Relaxed);
        stats.heap_limit = self.config.max_heap_bytes;
        stats
    }

    /// Relocates `object` into collector-owned storage through the
    /// tracer's copier. Returns `None` for kinds that are never relocated.
    ///
    /// # Safety
    /// `object` must be live and described by its header.
    pub unsafe fn evacuate<T: Tracer>(&self, object: ObjectRef) -> Result<Option<ObjectRef>, GcError> {
        T::copy_obj(object.header(), object, self)
    }
}

impl CopySpace for Collector {
    fn allocate_copy(
        &self,
        size: usize,
        align: usize,
        header: Header,
        log_ptrs: usize,
    ) -> Result<ObjectRef, GcError> {
        let total = allocation_size(size, align, log_ptrs);
        self.reserve(total)?;
        let raw = RawAllocation::allocate(size, align, header, log_ptrs).map_err(|error| {
            self.unreserve(total);
            error
        })?;
        let object = raw.object();
        self.orphans.lock().allocations.push(raw);
        Ok(object)
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        let destroy = self.binding.get().map(|binding| binding.destroy);
        let orphans = std::mem::take(self.orphans.get_mut());
        for raw in orphans.allocations {
            unsafe {
                if let Some(destroy) = destroy {
                    destroy(raw.object().header(), raw.object());
                }
                raw.release();
            }
        }
    }
}

/// Registration of a root callback, see [`Mutator::set_root_callback`].
#[derive(Debug, PartialEq, Eq)]
pub struct RootHandle {
    id: u64,
}

/// Collector loop running on its own thread.
pub struct CollectorThread {
    collector: Arc<Collector>,
    handle: Option<JoinHandle<Result<(), GcError>>>,
}

impl CollectorThread {
    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    /// Requests a stop and waits for the loop to acknowledge it.
    pub fn shutdown(mut self) -> Result<(), GcError> {
        self.collector.stop();
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            },
            None => Ok(()),
        }
    }
}

impl Drop for CollectorThread {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.collector.stop();
            let _ = handle.join();
        }
    }
}
