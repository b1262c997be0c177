//! Lock-free concurrent hash trie running on top of an on-the-fly
//! mark-sweep collector.
//!
//! The collector never stops the world. Mutator threads synchronize with it
//! through handshakes at operation boundaries and a deletion write barrier
//! while it marks. Every heap object carries a one word [`Header`] holding
//! its [`NodeTag`], its mark [`Color`] and an element count for vectors; a
//! [`Tracer`] turns that header into the object's size and outgoing pointers.
//!
//! ```no_run
//! use otf_ctrie::{Collector, Config, Ctrie};
//!
//! let collector = Collector::new(Config::default());
//! let gc = Ctrie::<usize>::spawn_collector(&collector).unwrap();
//! let trie = Ctrie::<usize>::new(&collector).unwrap();
//! trie.insert("answer", 42).unwrap();
//! assert_eq!(trie.lookup("answer").unwrap(), Some(42));
//! drop(trie);
//! gc.shutdown().unwrap();
//! ```
use std::time::Duration;

pub mod collector;
pub mod ctrie;
pub mod errors;
pub mod gcref;
pub mod header;
pub mod heap;
pub mod internal;
pub mod marking;
pub mod mutator;
pub mod safepoint;
pub mod statistics;
pub mod sweeper;
pub mod write_barrier;

pub use collector::{Collector, CollectorThread, Phase, RootHandle};
pub use ctrie::{local_hash, Ctrie, CtriePolicy, CtrieTracer};
pub use errors::GcError;
pub use gcref::{ObjectRef, TracedCell, TracedRef};
pub use header::{Color, Header, NodeTag};
pub use internal::{
    finalize_trait::Policy,
    trace_trait::{CopySpace, Tracer},
};
pub use mutator::{Mutator, OperationScope, ThreadState};
pub use statistics::GcStats;
pub use write_barrier::WriteBarrier;

/// Configuration for [`Collector::new`].
#[derive(Clone, Debug)]
pub struct Config {
    /// Bytes allocated since the last cycle after which a new cycle is requested.
    pub trigger_bytes: usize,
    /// Upper bound for live heap bytes. Allocations beyond it fail with
    /// [`GcError::HeapExhausted`].
    pub max_heap_bytes: Option<usize>,
    /// How long the collector loop sleeps before collecting without a request.
    /// `None` waits for requests only.
    pub cycle_interval: Option<Duration>,
    /// Enables per-cycle summaries at `info` level
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trigger_bytes: 4 * 1024 * 1024,
            max_heap_bytes: None,
            cycle_interval: Some(Duration::from_millis(100)),
            verbose: false,
        }
    }
}
