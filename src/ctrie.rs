//! Concurrent hash trie with constant-time snapshots, allocated on the
//! collected heap.
use std::{marker::PhantomData, sync::Arc};

pub mod algorithm;
pub mod allocator;
pub mod hash;
pub mod nodes;
pub mod string;
pub mod tracer;

pub use hash::local_hash;
pub use tracer::{CtriePolicy, CtrieTracer};

use crate::{
    collector::{Collector, CollectorThread, RootHandle},
    errors::GcError,
    gcref::{ObjectRef, TracedCell, TracedRef},
    mutator::Mutator,
};

use self::{
    algorithm::{Operation, RootSlot},
    allocator::NodeAllocator,
    nodes::Inode,
};

/// Map from byte-string keys to `V`.
///
/// Any number of threads may operate on a trie at once. Values are copied
/// in and out. All tries of one collector must share the same `V`, since
/// the collector is bound to a single tracer.
pub struct Ctrie<V> {
    collector: Arc<Collector>,
    slot: Arc<RootSlot>,
    hash: fn(&[u8]) -> u64,
    root_handle: Option<RootHandle>,
    marker: PhantomData<fn() -> V>,
}

impl<V: Copy + Send + Sync + 'static> Ctrie<V> {
    pub fn new(collector: &Arc<Collector>) -> Result<Self, GcError> {
        Self::with_hasher(collector, local_hash)
    }

    /// Empty trie hashing keys with `hash`.
    pub fn with_hasher(collector: &Arc<Collector>, hash: fn(&[u8]) -> u64) -> Result<Self, GcError> {
        collector.bind::<CtriePolicy<V>, CtrieTracer<V>>()?;
        let mutator = collector.current_mutator()?;
        let _scope = mutator.enter();
        let root = Operation::<V>::empty_root(&NodeAllocator::new(&mutator))?;
        Ok(Self::from_root(collector, &mutator, root, hash))
    }

    fn from_root(
        collector: &Arc<Collector>,
        mutator: &Mutator,
        root: TracedRef<Inode>,
        hash: fn(&[u8]) -> u64,
    ) -> Self {
        let slot = Arc::new(RootSlot {
            root: TracedCell::new(Some(root.object())),
        });
        let scanned = slot.clone();
        let root_handle = mutator.set_root_callback(move || scanned.root.load().into_iter().collect());
        Self {
            collector: collector.clone(),
            slot,
            hash,
            root_handle: Some(root_handle),
            marker: PhantomData,
        }
    }

    /// Starts a collector thread for tries holding `V`.
    pub fn spawn_collector(collector: &Arc<Collector>) -> Result<CollectorThread, GcError> {
        collector.spawn::<CtriePolicy<V>, CtrieTracer<V>>()
    }

    /// Runs one collection cycle on the calling thread.
    pub fn collect(collector: &Arc<Collector>) -> Result<(), GcError> {
        collector.collect::<CtriePolicy<V>, CtrieTracer<V>>()
    }

    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    fn operation<R>(&self, body: impl FnOnce(&Operation<'_, V>) -> Result<R, GcError>) -> Result<R, GcError> {
        let mutator = self.collector.current_mutator()?;
        let _scope = mutator.enter();
        let op = Operation::new(&self.slot, &mutator);
        body(&op)
    }

    /// Associates `value` with `key`, replacing any previous value.
    pub fn insert(&self, key: &str, value: V) -> Result<(), GcError> {
        let hash = (self.hash)(key.as_bytes());
        self.operation(|op| {
            let key = op.string(key.as_bytes())?;
            op.insert(&key, value, hash)
        })
    }

    pub fn lookup(&self, key: &str) -> Result<Option<V>, GcError> {
        let hash = (self.hash)(key.as_bytes());
        self.operation(|op| op.lookup(key.as_bytes(), hash))
    }

    /// Removes `key`, returning the value it was bound to.
    pub fn remove(&self, key: &str) -> Result<Option<V>, GcError> {
        let hash = (self.hash)(key.as_bytes());
        self.operation(|op| op.remove(key.as_bytes(), hash))
    }

    /// Independent copy of the trie's current contents. Later updates to
    /// either trie are invisible to the other.
    pub fn snapshot(&self) -> Result<Ctrie<V>, GcError> {
        let mutator = self.collector.current_mutator()?;
        let _scope = mutator.enter();
        let root = Operation::<V>::new(&self.slot, &mutator).snapshot()?;
        Ok(Self::from_root(&self.collector, &mutator, root, self.hash))
    }

    /// Objects this trie keeps reachable: its root indirection node, or a
    /// pending root descriptor.
    pub fn roots(&self) -> Vec<ObjectRef> {
        self.slot.root.load().into_iter().collect()
    }
}

impl<V> Drop for Ctrie<V> {
    fn drop(&mut self) {
        if let Some(handle) = self.root_handle.take() {
            self.collector.remove_root(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;

    #[test]
    fn empty_trie_has_one_root() {
        let collector = Collector::new(Config::default());
        let trie = Ctrie::<u32>::new(&collector).unwrap();
        assert_eq!(trie.roots().len(), 1);
        assert_eq!(collector.roots(), trie.roots());
        assert_eq!(trie.lookup("missing").unwrap(), None);
    }

    #[test]
    fn dropping_unregisters_roots() {
        let collector = Collector::new(Config::default());
        let trie = Ctrie::<u32>::new(&collector).unwrap();
        let other = Ctrie::<u32>::new(&collector).unwrap();
        assert_eq!(collector.roots().len(), 2);
        drop(trie);
        assert_eq!(collector.roots(), other.roots());
    }

    #[test]
    fn empty_key_is_a_key() {
        let collector = Collector::new(Config::default());
        let trie = Ctrie::<u32>::new(&collector).unwrap();
        trie.insert("", 9).unwrap();
        assert_eq!(trie.lookup("").unwrap(), Some(9));
        assert_eq!(trie.remove("").unwrap(), Some(9));
        assert_eq!(trie.lookup("").unwrap(), None);
    }

    #[test]
    fn wide_values_round_trip() {
        let collector = Collector::new(Config::default());
        let trie = Ctrie::<u128>::new(&collector).unwrap();
        for index in 0..100u128 {
            trie.insert(&format!("wide{}", index), index << 96).unwrap();
        }
        Ctrie::<u128>::collect(&collector).unwrap();
        for index in 0..100u128 {
            assert_eq!(trie.lookup(&format!("wide{}", index)).unwrap(), Some(index << 96));
        }
        assert_eq!(trie.remove("wide7").unwrap(), Some(7 << 96));
    }
}
