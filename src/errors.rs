use thiserror::Error;

/// Failures surfaced by the runtime and by trie operations.
#[derive(Debug, Error)]
pub enum GcError {
    #[error("heap limit of {limit} bytes exhausted by a {requested} byte request")]
    HeapExhausted { requested: usize, limit: usize },

    #[error("system allocator refused {requested} bytes")]
    OutOfMemory { requested: usize },

    #[error("corrupt object header {raw:#x}")]
    CorruptHeader { raw: u64 },

    #[error("no mutator available for the current thread")]
    MutatorUnavailable,

    #[error("collector is already bound to a different policy or tracer")]
    BindingMismatch,

    #[error("a collection cannot be driven from inside an operation scope")]
    CollectInsideOperation,

    #[error("failed to spawn collector thread: {0}")]
    Spawn(#[from] std::io::Error),
}
