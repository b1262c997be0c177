pub mod collection_barrier;
pub mod finalize_trait;
pub mod trace_trait;
