//! Lock-free insert, lookup, remove and snapshot over generation-tagged
//! indirection nodes.
//!
//! Main nodes are swapped with a generation-checked CAS (GCAS) that parks
//! the previous main node in the new one's `prev` field until the root's
//! generation has been confirmed. The root itself is replaced with a
//! restricted double-compare single-swap (RDCSS) when taking snapshots.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::{
    errors::GcError,
    gcref::{ObjectRef, TracedCell, TracedRef},
    header::NodeTag,
    mutator::Mutator,
    write_barrier::WriteBarrier,
};

use super::{
    allocator::NodeAllocator,
    nodes::{Cnode, Failure, Inode, Lnode, PlistNode, RdcssDescriptor, Snode, Tnode},
    string::CtrieString,
    tracer::CtrieTracer,
};

/// Bits of the hash consumed per level.
pub const W: u32 = 5;
const BRANCH_MASK: u64 = (1 << W) - 1;
/// Levels at and beyond this depth hold collision lists.
pub const HASH_BITS: u32 = u64::BITS;

static GENERATION: AtomicU64 = AtomicU64::new(1);

/// Fresh generation token, distinct from every token handed out before.
pub fn new_generation() -> u64 {
    GENERATION.fetch_add(1, Ordering::Relaxed)
}

/// Holds either the root indirection node or an RDCSS descriptor.
pub struct RootSlot {
    pub root: TracedCell,
}

pub enum Outcome<T> {
    Done(T),
    Restart,
}

use Outcome::{Done, Restart};

#[inline]
fn flag_pos(hash: u64, lev: u32, bitmap: u32) -> (u32, usize) {
    let index = ((hash >> lev) & BRANCH_MASK) as u32;
    let flag = 1u32 << index;
    (flag, (bitmap & (flag - 1)).count_ones() as usize)
}

fn main_prev<'n>(main: ObjectRef) -> &'n TracedCell {
    unsafe {
        match main.tag() {
            NodeTag::Cnode => &(*main.as_ptr().cast::<Cnode>()).prev,
            NodeTag::Tnode => &(*main.as_ptr().cast::<Tnode>()).prev,
            NodeTag::Lnode => &(*main.as_ptr().cast::<Lnode>()).prev,
            tag => unreachable!("{:?} is not a main node", tag),
        }
    }
}

fn main_of(inode: TracedRef<Inode>) -> ObjectRef {
    match inode.main.load() {
        Some(main) => main,
        None => unreachable!("published indirection node without a main node"),
    }
}

fn branch_at(cn: &Cnode, pos: usize) -> ObjectRef {
    match cn.branches().get(pos).copied().flatten() {
        Some(branch) => branch,
        None => unreachable!("bitmap and branch vector disagree"),
    }
}

/// One trie operation performed by one mutator inside its operation scope.
pub struct Operation<'a, V: Copy + Send + Sync + 'static> {
    slot: &'a RootSlot,
    alloc: NodeAllocator<'a>,
    barrier: WriteBarrier<'a, CtrieTracer<V>>,
}

impl<'a, V: Copy + Send + Sync + 'static> Operation<'a, V> {
    pub fn new(slot: &'a RootSlot, mutator: &'a Mutator) -> Self {
        Self {
            slot,
            alloc: NodeAllocator::new(mutator),
            barrier: WriteBarrier::new(mutator),
        }
    }

    pub fn string(&self, bytes: &[u8]) -> Result<CtrieString, GcError> {
        CtrieString::new(&self.alloc, bytes)
    }

    /// Builds an empty trie: a root indirection node over an empty branching node.
    pub fn empty_root(alloc: &NodeAllocator<'_>) -> Result<TracedRef<Inode>, GcError> {
        let gen = new_generation();
        let cn = alloc.allocate(Cnode {
            prev: TracedCell::null(),
            bitmap: 0,
            gen,
            array: None,
        })?;
        alloc.allocate(Inode {
            main: TracedCell::new(Some(cn.object())),
            gen,
        })
    }

    pub fn lookup(&self, key: &[u8], hash: u64) -> Result<Option<V>, GcError> {
        loop {
            let root = self.read_root()?;
            if let Done(found) = self.ilookup(root, key, hash, 0, None, root.gen)? {
                return Ok(found);
            }
        }
    }

    pub fn insert(&self, key: &CtrieString, value: V, hash: u64) -> Result<(), GcError> {
        loop {
            let root = self.read_root()?;
            if self.iinsert(root, key, value, hash, 0, None, root.gen)? {
                return Ok(());
            }
        }
    }

    pub fn remove(&self, key: &[u8], hash: u64) -> Result<Option<V>, GcError> {
        loop {
            let root = self.read_root()?;
            if let Done(removed) = self.iremove(root, key, hash, 0, None, root.gen)? {
                return Ok(removed);
            }
        }
    }

    /// Moves this trie to a fresh generation and returns a root for an
    /// independent trie sharing every node reachable at the switch.
    pub fn snapshot(&self) -> Result<TracedRef<Inode>, GcError> {
        loop {
            let root = self.read_root()?;
            let expected_main = self.gcas_read(root)?;
            let renewed = self.copy_to_gen(root, new_generation())?;
            if self.rdcss_root(root, expected_main, renewed)? {
                return self.copy_to_gen(root, new_generation());
            }
        }
    }

    fn ilookup(
        &self,
        inode: TracedRef<Inode>,
        key: &[u8],
        hash: u64,
        lev: u32,
        parent: Option<TracedRef<Inode>>,
        startgen: u64,
    ) -> Result<Outcome<Option<V>>, GcError> {
        let main = self.gcas_read(inode)?;
        match main.tag() {
            NodeTag::Cnode => {
                let cn = unsafe { main.cast::<Cnode>() };
                let (flag, pos) = flag_pos(hash, lev, cn.bitmap);
                if cn.bitmap & flag == 0 {
                    return Ok(Done(None));
                }
                let sub = branch_at(&cn, pos);
                match sub.tag() {
                    NodeTag::Inode => {
                        let sub = unsafe { sub.cast::<Inode>() };
                        if sub.gen == startgen {
                            return self.ilookup(sub, key, hash, lev + W, Some(inode), startgen);
                        }
                        let renewed = self.renewed(cn, startgen)?;
                        if self.gcas(inode, main, renewed.object())? {
                            return self.ilookup(inode, key, hash, lev, parent, startgen);
                        }
                        Ok(Restart)
                    }
                    NodeTag::Snode => {
                        let sn = unsafe { sub.cast::<Snode<V>>() };
                        Ok(Done(sn.matches(hash, key).then_some(sn.value)))
                    }
                    tag => unreachable!("{:?} inside a branching node", tag),
                }
            }
            NodeTag::Tnode => {
                if self.clean(parent, lev).is_ok() {
                    return Ok(Restart);
                }
                let tn = unsafe { main.cast::<Tnode>() };
                let sn = unsafe { tn.sn.cast::<Snode<V>>() };
                Ok(Done(sn.matches(hash, key).then_some(sn.value)))
            }
            NodeTag::Lnode => {
                let ln = unsafe { main.cast::<Lnode>() };
                Ok(Done(Self::list_find(&ln, key).map(|sn| sn.value)))
            }
            tag => unreachable!("{:?} as main node", tag),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn iinsert(
        &self,
        inode: TracedRef<Inode>,
        key: &CtrieString,
        value: V,
        hash: u64,
        lev: u32,
        parent: Option<TracedRef<Inode>>,
        startgen: u64,
    ) -> Result<bool, GcError> {
        let main = self.gcas_read(inode)?;
        match main.tag() {
            NodeTag::Cnode => {
                let cn = unsafe { main.cast::<Cnode>() };
                let (flag, pos) = flag_pos(hash, lev, cn.bitmap);
                if cn.bitmap & flag == 0 {
                    let current = self.current_gen(cn, inode.gen)?;
                    let sn = self.new_snode(key, value, hash)?;
                    let updated = self.inserted(current, pos, flag, sn, inode.gen)?;
                    return self.gcas(inode, main, updated.object());
                }
                let sub = branch_at(&cn, pos);
                match sub.tag() {
                    NodeTag::Inode => {
                        let sub = unsafe { sub.cast::<Inode>() };
                        if sub.gen == startgen {
                            return self.iinsert(
                                sub,
                                key,
                                value,
                                hash,
                                lev + W,
                                Some(inode),
                                startgen,
                            );
                        }
                        let renewed = self.renewed(cn, startgen)?;
                        if self.gcas(inode, main, renewed.object())? {
                            return self.iinsert(inode, key, value, hash, lev, parent, startgen);
                        }
                        Ok(false)
                    }
                    NodeTag::Snode => {
                        let sn = unsafe { sub.cast::<Snode<V>>() };
                        if sn.matches(hash, key.as_bytes()) {
                            let replacement = self.new_snode(key, value, hash)?;
                            let updated = self.updated_at(cn, pos, replacement, inode.gen)?;
                            return self.gcas(inode, main, updated.object());
                        }
                        let current = self.current_gen(cn, inode.gen)?;
                        let added = self.new_snode(key, value, hash)?;
                        let dual = self.dual(sub, sn.hash, added, hash, lev + W, inode.gen)?;
                        let below = self.alloc.allocate(Inode {
                            main: TracedCell::new(Some(dual)),
                            gen: inode.gen,
                        })?;
                        let updated = self.updated_at(current, pos, below.object(), inode.gen)?;
                        self.gcas(inode, main, updated.object())
                    }
                    tag => unreachable!("{:?} inside a branching node", tag),
                }
            }
            NodeTag::Tnode => {
                self.clean(parent, lev)?;
                Ok(false)
            }
            NodeTag::Lnode => {
                let ln = unsafe { main.cast::<Lnode>() };
                let updated = self.list_inserted(&ln, key, value, hash)?;
                self.gcas(inode, main, updated)
            }
            tag => unreachable!("{:?} as main node", tag),
        }
    }

    fn iremove(
        &self,
        inode: TracedRef<Inode>,
        key: &[u8],
        hash: u64,
        lev: u32,
        parent: Option<TracedRef<Inode>>,
        startgen: u64,
    ) -> Result<Outcome<Option<V>>, GcError> {
        let main = self.gcas_read(inode)?;
        match main.tag() {
            NodeTag::Cnode => {
                let cn = unsafe { main.cast::<Cnode>() };
                let (flag, pos) = flag_pos(hash, lev, cn.bitmap);
                if cn.bitmap & flag == 0 {
                    return Ok(Done(None));
                }
                let sub = branch_at(&cn, pos);
                let outcome = match sub.tag() {
                    NodeTag::Inode => {
                        let sub = unsafe { sub.cast::<Inode>() };
                        if sub.gen == startgen {
                            self.iremove(sub, key, hash, lev + W, Some(inode), startgen)?
                        } else {
                            let renewed = self.renewed(cn, startgen)?;
                            if self.gcas(inode, main, renewed.object())? {
                                self.iremove(inode, key, hash, lev, parent, startgen)?
                            } else {
                                Restart
                            }
                        }
                    }
                    NodeTag::Snode => {
                        let sn = unsafe { sub.cast::<Snode<V>>() };
                        if !sn.matches(hash, key) {
                            Done(None)
                        } else {
                            let removed = self.removed_at(cn, pos, flag, inode.gen)?;
                            let contracted = self.to_contracted(removed, lev)?;
                            if self.gcas(inode, main, contracted)? {
                                Done(Some(sn.value))
                            } else {
                                Restart
                            }
                        }
                    }
                    tag => unreachable!("{:?} inside a branching node", tag),
                };
                if let (Done(Some(_)), Some(parent)) = (&outcome, parent) {
                    if let Err(error) = self.contract_parent(parent, inode, hash, lev, startgen) {
                        tracing::debug!(%error, "entombed node left for a later operation");
                    }
                }
                Ok(outcome)
            }
            NodeTag::Tnode => {
                self.clean(parent, lev)?;
                Ok(Restart)
            }
            NodeTag::Lnode => {
                let ln = unsafe { main.cast::<Lnode>() };
                let value = match Self::list_find(&ln, key) {
                    Some(sn) => sn.value,
                    None => return Ok(Done(None)),
                };
                let updated = self.list_removed(&ln, key)?;
                if self.gcas(inode, main, updated)? {
                    Ok(Done(Some(value)))
                } else {
                    Ok(Restart)
                }
            }
            tag => unreachable!("{:?} as main node", tag),
        }
    }

    fn contract_parent(
        &self,
        parent: TracedRef<Inode>,
        inode: TracedRef<Inode>,
        hash: u64,
        lev: u32,
        startgen: u64,
    ) -> Result<(), GcError> {
        if self.gcas_read(inode)?.tag() == NodeTag::Tnode {
            self.clean_parent(parent, inode, hash, lev - W, startgen)?;
        }
        Ok(())
    }

    /// Compresses the parent of an entombed node. `lev` is the level of the
    /// entombed node.
    fn clean(&self, parent: Option<TracedRef<Inode>>, lev: u32) -> Result<(), GcError> {
        let parent = match parent {
            Some(parent) => parent,
            None => return Ok(()),
        };
        let lev = lev - W;
        let main = self.gcas_read(parent)?;
        if main.tag() == NodeTag::Cnode {
            let compressed = self.to_compressed(unsafe { main.cast::<Cnode>() }, lev, parent.gen)?;
            self.gcas(parent, main, compressed)?;
        }
        Ok(())
    }

    fn clean_parent(
        &self,
        parent: TracedRef<Inode>,
        inode: TracedRef<Inode>,
        hash: u64,
        lev: u32,
        startgen: u64,
    ) -> Result<(), GcError> {
        loop {
            let parent_main = self.gcas_read(parent)?;
            if parent_main.tag() != NodeTag::Cnode {
                return Ok(());
            }
            let cn = unsafe { parent_main.cast::<Cnode>() };
            let (flag, pos) = flag_pos(hash, lev, cn.bitmap);
            if cn.bitmap & flag == 0 || branch_at(&cn, pos) != inode.object() {
                return Ok(());
            }
            let main = self.gcas_read(inode)?;
            if main.tag() != NodeTag::Tnode {
                return Ok(());
            }
            let resurrected = self.untombed(unsafe { main.cast::<Tnode>() })?;
            let updated = self.updated_at(cn, pos, resurrected, parent.gen)?;
            let contracted = self.to_contracted(updated, lev)?;
            if self.gcas(parent, parent_main, contracted)? {
                return Ok(());
            }
            if self.read_root()?.gen != startgen {
                return Ok(());
            }
        }
    }

    /// Replaces `old` with `new` as the main node of `inode`. Every
    /// allocation happens before `new` is published, so an error means the
    /// trie is unchanged.
    fn gcas(
        &self,
        inode: TracedRef<Inode>,
        old: ObjectRef,
        new: ObjectRef,
    ) -> Result<bool, GcError> {
        main_prev(new).init(Some(old));
        let failure = self.alloc.allocate(Failure { prev: old })?;
        let installed = self
            .barrier
            .compare_exchange(Some(inode.object()), &inode.main, Some(old), Some(new))
            .is_ok();
        if !installed {
            return Ok(false);
        }
        Ok(self.gcas_settle(inode, new, failure))
    }

    /// Commits or aborts the published `new`. Returns whether it committed.
    fn gcas_settle(
        &self,
        inode: TracedRef<Inode>,
        new: ObjectRef,
        failure: TracedRef<Failure>,
    ) -> bool {
        loop {
            let prev = match main_prev(new).load() {
                Some(prev) => prev,
                None => return true,
            };
            if prev.tag() == NodeTag::Failure {
                let restored = unsafe { prev.cast::<Failure>() }.prev;
                let _ = self.barrier.compare_exchange(
                    Some(inode.object()),
                    &inode.main,
                    Some(new),
                    Some(restored),
                );
                return false;
            }
            let next = if self.rdcss_abort().gen == inode.gen {
                None
            } else {
                Some(failure.object())
            };
            let _ = self
                .barrier
                .compare_exchange(Some(new), main_prev(new), Some(prev), next);
        }
    }

    fn gcas_read(&self, inode: TracedRef<Inode>) -> Result<ObjectRef, GcError> {
        let main = main_of(inode);
        if main_prev(main).load().is_none() {
            return Ok(main);
        }
        self.gcas_complete(inode, main)
    }

    fn gcas_complete(
        &self,
        inode: TracedRef<Inode>,
        mut main: ObjectRef,
    ) -> Result<ObjectRef, GcError> {
        loop {
            let prev = match main_prev(main).load() {
                Some(prev) => prev,
                None => return Ok(main),
            };
            if prev.tag() == NodeTag::Failure {
                let restored = unsafe { prev.cast::<Failure>() }.prev;
                match self.barrier.compare_exchange(
                    Some(inode.object()),
                    &inode.main,
                    Some(main),
                    Some(restored),
                ) {
                    Ok(_) => return Ok(restored),
                    Err(_) => {
                        main = main_of(inode);
                        continue;
                    }
                }
            }
            if self.rdcss_abort().gen == inode.gen {
                let committed = self
                    .barrier
                    .compare_exchange(Some(main), main_prev(main), Some(prev), None)
                    .is_ok();
                if committed {
                    return Ok(main);
                }
            } else {
                let failure = self.alloc.allocate(Failure { prev })?;
                let _ = self.barrier.compare_exchange(
                    Some(main),
                    main_prev(main),
                    Some(prev),
                    Some(failure.object()),
                );
                main = main_of(inode);
            }
        }
    }

    fn root_value(&self) -> ObjectRef {
        match self.slot.root.load() {
            Some(root) => root,
            None => unreachable!("trie without a root"),
        }
    }

    fn swap_root(&self, current: ObjectRef, new: ObjectRef) -> bool {
        self.barrier
            .compare_exchange(None, &self.slot.root, Some(current), Some(new))
            .is_ok()
    }

    /// Current root indirection node. A pending descriptor is completed
    /// first.
    fn read_root(&self) -> Result<TracedRef<Inode>, GcError> {
        let root = self.root_value();
        if root.tag() == NodeTag::Inode {
            return Ok(unsafe { root.cast::<Inode>() });
        }
        self.rdcss_complete()
    }

    /// Current root indirection node, rolling back a pending descriptor.
    fn rdcss_abort(&self) -> TracedRef<Inode> {
        loop {
            let root = self.root_value();
            match root.tag() {
                NodeTag::Inode => return unsafe { root.cast::<Inode>() },
                NodeTag::Rdcss => {
                    let desc = unsafe { root.cast::<RdcssDescriptor>() };
                    if self.swap_root(root, desc.ov.object()) {
                        return desc.ov;
                    }
                }
                tag => unreachable!("{:?} in the root slot", tag),
            }
        }
    }

    fn rdcss_complete(&self) -> Result<TracedRef<Inode>, GcError> {
        loop {
            let root = self.root_value();
            match root.tag() {
                NodeTag::Inode => return Ok(unsafe { root.cast::<Inode>() }),
                NodeTag::Rdcss => {
                    let desc = unsafe { root.cast::<RdcssDescriptor>() };
                    let old_main = self.gcas_read(desc.ov)?;
                    if old_main == desc.expected_main {
                        if self.swap_root(root, desc.nv.object()) {
                            desc.committed.store(true, Ordering::SeqCst);
                            return Ok(desc.nv);
                        }
                    } else if self.swap_root(root, desc.ov.object()) {
                        return Ok(desc.ov);
                    }
                }
                tag => unreachable!("{:?} in the root slot", tag),
            }
        }
    }

    fn rdcss_root(
        &self,
        ov: TracedRef<Inode>,
        expected_main: ObjectRef,
        nv: TracedRef<Inode>,
    ) -> Result<bool, GcError> {
        let desc = self.alloc.allocate(RdcssDescriptor {
            ov,
            expected_main,
            nv,
            committed: AtomicBool::new(false),
        })?;
        if !self.swap_root(ov.object(), desc.object()) {
            return Ok(false);
        }
        self.rdcss_complete()?;
        Ok(desc.committed.load(Ordering::SeqCst))
    }

    fn copy_to_gen(&self, inode: TracedRef<Inode>, gen: u64) -> Result<TracedRef<Inode>, GcError> {
        let main = self.gcas_read(inode)?;
        self.alloc.allocate(Inode {
            main: TracedCell::new(Some(main)),
            gen,
        })
    }

    fn current_gen(&self, cn: TracedRef<Cnode>, gen: u64) -> Result<TracedRef<Cnode>, GcError> {
        if cn.gen == gen {
            Ok(cn)
        } else {
            self.renewed(cn, gen)
        }
    }

    /// Copy of `cn` in generation `gen` whose child indirection nodes are
    /// copied into `gen` as well.
    fn renewed(&self, cn: TracedRef<Cnode>, gen: u64) -> Result<TracedRef<Cnode>, GcError> {
        let mut branches = Vec::with_capacity(cn.branches().len());
        for &branch in cn.branches().iter().flatten() {
            let branch = match branch.tag() {
                NodeTag::Inode => self
                    .copy_to_gen(unsafe { branch.cast::<Inode>() }, gen)?
                    .object(),
                _ => branch,
            };
            branches.push(branch);
        }
        self.new_cnode(cn.bitmap, &branches, gen)
    }

    fn new_cnode(
        &self,
        bitmap: u32,
        branches: &[ObjectRef],
        gen: u64,
    ) -> Result<TracedRef<Cnode>, GcError> {
        let array = if branches.is_empty() {
            None
        } else {
            Some(self.alloc.branch_vector(branches)?)
        };
        self.alloc.allocate(Cnode {
            prev: TracedCell::null(),
            bitmap,
            gen,
            array,
        })
    }

    fn branches_of(cn: &Cnode) -> Vec<ObjectRef> {
        cn.branches().iter().flatten().copied().collect()
    }

    fn inserted(
        &self,
        cn: TracedRef<Cnode>,
        pos: usize,
        flag: u32,
        node: ObjectRef,
        gen: u64,
    ) -> Result<TracedRef<Cnode>, GcError> {
        let mut branches = Self::branches_of(&cn);
        branches.insert(pos, node);
        self.new_cnode(cn.bitmap | flag, &branches, gen)
    }

    fn updated_at(
        &self,
        cn: TracedRef<Cnode>,
        pos: usize,
        node: ObjectRef,
        gen: u64,
    ) -> Result<TracedRef<Cnode>, GcError> {
        let mut branches = Self::branches_of(&cn);
        branches[pos] = node;
        self.new_cnode(cn.bitmap, &branches, gen)
    }

    fn removed_at(
        &self,
        cn: TracedRef<Cnode>,
        pos: usize,
        flag: u32,
        gen: u64,
    ) -> Result<TracedRef<Cnode>, GcError> {
        let mut branches = Self::branches_of(&cn);
        branches.remove(pos);
        self.new_cnode(cn.bitmap ^ flag, &branches, gen)
    }

    /// Entombs the single leaf of a branching node below the root level.
    fn to_contracted(&self, cn: TracedRef<Cnode>, lev: u32) -> Result<ObjectRef, GcError> {
        if lev > 0 {
            if let [Some(only)] = cn.branches() {
                if only.tag() == NodeTag::Snode {
                    return self.entombed(*only);
                }
            }
        }
        Ok(cn.object())
    }

    /// Replaces every entombed child with its leaf, then contracts.
    fn to_compressed(
        &self,
        cn: TracedRef<Cnode>,
        lev: u32,
        gen: u64,
    ) -> Result<ObjectRef, GcError> {
        let mut branches = Vec::with_capacity(cn.branches().len());
        for &branch in cn.branches().iter().flatten() {
            let branch = if branch.tag() == NodeTag::Inode {
                let main = self.gcas_read(unsafe { branch.cast::<Inode>() })?;
                if main.tag() == NodeTag::Tnode {
                    self.untombed(unsafe { main.cast::<Tnode>() })?
                } else {
                    branch
                }
            } else {
                branch
            };
            branches.push(branch);
        }
        let compressed = self.new_cnode(cn.bitmap, &branches, gen)?;
        self.to_contracted(compressed, lev)
    }

    fn entombed(&self, sn: ObjectRef) -> Result<ObjectRef, GcError> {
        let tn = self.alloc.allocate(Tnode {
            prev: TracedCell::null(),
            sn,
        })?;
        Ok(tn.object())
    }

    fn untombed(&self, tn: TracedRef<Tnode>) -> Result<ObjectRef, GcError> {
        let sn = unsafe { tn.sn.cast::<Snode<V>>() };
        let copy = self.alloc.allocate(Snode {
            hash: sn.hash,
            key: sn.key.shallow_copy(self.alloc.mutator()),
            value: sn.value,
        })?;
        Ok(copy.object())
    }

    fn new_snode(&self, key: &CtrieString, value: V, hash: u64) -> Result<ObjectRef, GcError> {
        let sn = self.alloc.allocate(Snode {
            hash,
            key: key.shallow_copy(self.alloc.mutator()),
            value,
        })?;
        Ok(sn.object())
    }

    /// Branch holding two leaves whose hashes agree on every level above `lev`.
    fn dual(
        &self,
        x: ObjectRef,
        xhash: u64,
        y: ObjectRef,
        yhash: u64,
        lev: u32,
        gen: u64,
    ) -> Result<ObjectRef, GcError> {
        if lev >= HASH_BITS {
            return self.new_lnode(&[x, y]);
        }
        let xidx = (xhash >> lev) & BRANCH_MASK;
        let yidx = (yhash >> lev) & BRANCH_MASK;
        let bitmap = (1u32 << xidx) | (1u32 << yidx);
        let cn = if xidx == yidx {
            let sub = self.dual(x, xhash, y, yhash, lev + W, gen)?;
            let below = self.alloc.allocate(Inode {
                main: TracedCell::new(Some(sub)),
                gen,
            })?;
            self.new_cnode(bitmap, &[below.object()], gen)?
        } else if xidx < yidx {
            self.new_cnode(bitmap, &[x, y], gen)?
        } else {
            self.new_cnode(bitmap, &[y, x], gen)?
        };
        Ok(cn.object())
    }

    fn list_find(ln: &Lnode, key: &[u8]) -> Option<TracedRef<Snode<V>>> {
        ln.entries()
            .map(|sn| unsafe { sn.cast::<Snode<V>>() })
            .find(|sn| sn.key.as_bytes() == key)
    }

    fn new_lnode(&self, entries: &[ObjectRef]) -> Result<ObjectRef, GcError> {
        let mut head = None;
        for &sn in entries.iter().rev() {
            head = Some(self.alloc.allocate(PlistNode { next: head, sn })?);
        }
        let ln = self.alloc.allocate(Lnode {
            prev: TracedCell::null(),
            head,
            len: entries.len(),
        })?;
        Ok(ln.object())
    }

    fn list_inserted(
        &self,
        ln: &Lnode,
        key: &CtrieString,
        value: V,
        hash: u64,
    ) -> Result<ObjectRef, GcError> {
        let mut entries = vec![self.new_snode(key, value, hash)?];
        entries.extend(ln.entries().filter(|&sn| {
            unsafe { sn.cast::<Snode<V>>() }.key.as_bytes() != key.as_bytes()
        }));
        self.new_lnode(&entries)
    }

    fn list_removed(&self, ln: &Lnode, key: &[u8]) -> Result<ObjectRef, GcError> {
        let remaining: Vec<ObjectRef> = ln
            .entries()
            .filter(|&sn| unsafe { sn.cast::<Snode<V>>() }.key.as_bytes() != key)
            .collect();
        match remaining.as_slice() {
            [only] => self.entombed(*only),
            _ => self.new_lnode(&remaining),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{collector::Collector, Config};

    fn with_operation<R>(f: impl FnOnce(&Operation<'_, u64>) -> R) -> R {
        let collector = Collector::new(Config::default());
        let mutator = collector.current_mutator().unwrap();
        let _scope = mutator.enter();
        let root = Operation::<u64>::empty_root(&NodeAllocator::new(&mutator)).unwrap();
        let slot = RootSlot {
            root: TracedCell::new(Some(root.object())),
        };
        let op = Operation::new(&slot, &mutator);
        f(&op)
    }

    #[test]
    fn flag_positions_count_lower_bits() {
        assert_eq!(flag_pos(0b00011, 0, 0), (1 << 3, 0));
        assert_eq!(flag_pos(0b00011, 0, 0b0111), (1 << 3, 3));
        assert_eq!(flag_pos(0b00011 << 5, 5, 0b1_0001), (1 << 3, 1));
    }

    #[test]
    fn generations_are_unique() {
        let a = new_generation();
        let b = new_generation();
        assert_ne!(a, b);
    }

    #[test]
    fn insert_lookup_remove() {
        with_operation(|op| {
            let key = op.string(b"alpha").unwrap();
            op.insert(&key, 1, 17).unwrap();
            assert_eq!(op.lookup(b"alpha", 17).unwrap(), Some(1));
            assert_eq!(op.lookup(b"beta", 17).unwrap(), None);
            op.insert(&key, 2, 17).unwrap();
            assert_eq!(op.lookup(b"alpha", 17).unwrap(), Some(2));
            assert_eq!(op.remove(b"alpha", 17).unwrap(), Some(2));
            assert_eq!(op.remove(b"alpha", 17).unwrap(), None);
            assert_eq!(op.lookup(b"alpha", 17).unwrap(), None);
        });
    }

    #[test]
    fn shared_prefixes_split_into_levels() {
        with_operation(|op| {
            // Equal in the lowest ten bits.
            let hashes = [0b00001_00001u64, 0b00001_00001 | (1 << 10), 0b00001_00001 | (2 << 10)];
            for (index, hash) in hashes.iter().enumerate() {
                let key = op.string(format!("k{}", index).as_bytes()).unwrap();
                op.insert(&key, index as u64, *hash).unwrap();
            }
            for (index, hash) in hashes.iter().enumerate() {
                assert_eq!(
                    op.lookup(format!("k{}", index).as_bytes(), *hash).unwrap(),
                    Some(index as u64)
                );
            }
            for (index, hash) in hashes.iter().enumerate() {
                assert_eq!(
                    op.remove(format!("k{}", index).as_bytes(), *hash).unwrap(),
                    Some(index as u64)
                );
            }
            let root = op.read_root().unwrap();
            let main = op.gcas_read(root).unwrap();
            assert_eq!(main.tag(), NodeTag::Cnode);
        });
    }

    #[test]
    fn full_collisions_use_lists() {
        with_operation(|op| {
            for name in ["x", "y", "z"] {
                let key = op.string(name.as_bytes()).unwrap();
                op.insert(&key, name.as_bytes()[0] as u64, 42).unwrap();
            }
            assert_eq!(op.lookup(b"y", 42).unwrap(), Some(b'y' as u64));
            assert_eq!(op.remove(b"x", 42).unwrap(), Some(b'x' as u64));
            assert_eq!(op.remove(b"y", 42).unwrap(), Some(b'y' as u64));
            assert_eq!(op.lookup(b"z", 42).unwrap(), Some(b'z' as u64));
            assert_eq!(op.lookup(b"x", 42).unwrap(), None);
        });
    }

    #[test]
    fn snapshot_moves_root_to_new_generation() {
        with_operation(|op| {
            let key = op.string(b"k").unwrap();
            op.insert(&key, 1, 3).unwrap();
            let before = op.read_root().unwrap();
            let snap = op.snapshot().unwrap();
            let after = op.read_root().unwrap();
            assert_ne!(before.gen, after.gen);
            assert_ne!(snap.gen, after.gen);
            assert_eq!(op.root_value().tag(), NodeTag::Inode);
            assert_eq!(main_of(snap), main_of(after));
        });
    }

    #[test]
    fn gcas_aborts_outside_the_root_generation() {
        with_operation(|op| {
            let root = op.read_root().unwrap();
            let main = op.gcas_read(root).unwrap();
            let stale = op
                .alloc
                .allocate(Inode {
                    main: TracedCell::new(Some(main)),
                    gen: new_generation(),
                })
                .unwrap();
            let update = op.new_cnode(0, &[], stale.gen).unwrap().object();
            assert!(!op.gcas(stale, main, update).unwrap());
            assert_eq!(main_of(stale), main);
            assert_eq!(main_prev(update).load().map(|prev| prev.tag()), Some(NodeTag::Failure));

            let update = op.new_cnode(0, &[], root.gen).unwrap().object();
            assert!(op.gcas(root, main, update).unwrap());
            assert_eq!(main_of(root), update);
            assert!(main_prev(update).load().is_none());
        });
    }
}
