//! Heap layouts of the trie's node kinds.
//!
//! Every layout is `#[repr(C)]` so the tracer can interpret a payload from
//! its header tag alone.
use std::{mem::size_of, slice, sync::atomic::AtomicBool};

use crate::{
    gcref::{ObjectRef, TracedCell, TracedRef},
    header::NodeTag,
};

use super::string::CtrieString;

/// Static description of a fixed-size node kind.
pub trait NodeKind {
    const TAG: NodeTag;
    const NUM_LOG_PTRS: usize = num_log_ptrs(Self::TAG);
}

/// Static description of a variable-length vector kind.
pub trait VectorKind {
    const TAG: NodeTag;
    type Element: Copy;
}

/// Kinds whose mutable fields may be overwritten while the collector marks
/// carry one log slot.
pub const fn num_log_ptrs(tag: NodeTag) -> usize {
    match tag {
        NodeTag::Inode | NodeTag::Cnode | NodeTag::Failure | NodeTag::Rdcss => 1,
        NodeTag::Snode
        | NodeTag::Tnode
        | NodeTag::Lnode
        | NodeTag::BranchVector
        | NodeTag::StringVector
        | NodeTag::PlistNode => 0,
    }
}

/// Indirection node. `main` is the only field that changes after
/// publication.
#[repr(C)]
pub struct Inode {
    pub main: TracedCell,
    pub gen: u64,
}

impl NodeKind for Inode {
    const TAG: NodeTag = NodeTag::Inode;
}

/// Branching node. Branches are stored in a separate branch vector
/// ordered by bit position in `bitmap`.
#[repr(C)]
pub struct Cnode {
    pub prev: TracedCell,
    pub bitmap: u32,
    pub gen: u64,
    pub array: Option<TracedRef<BranchVector>>,
}

impl Cnode {
    pub fn branches(&self) -> &[Option<ObjectRef>] {
        match self.array {
            Some(array) => {
                let object = array.object();
                unsafe {
                    slice::from_raw_parts(
                        object.as_ptr().cast::<Option<ObjectRef>>(),
                        object.header().count(),
                    )
                }
            }
            None => &[],
        }
    }
}

impl NodeKind for Cnode {
    const TAG: NodeTag = NodeTag::Cnode;
}

/// Leaf holding one key and its value.
#[repr(C)]
pub struct Snode<V> {
    pub hash: u64,
    pub key: CtrieString,
    pub value: V,
}

impl<V> Snode<V> {
    pub fn matches(&self, hash: u64, key: &[u8]) -> bool {
        self.hash == hash && self.key.as_bytes() == key
    }
}

impl<V> NodeKind for Snode<V> {
    const TAG: NodeTag = NodeTag::Snode;
}

/// Tomb wrapping the last leaf of a branch that is waiting to be
/// contracted into its parent.
#[repr(C)]
pub struct Tnode {
    pub prev: TracedCell,
    pub sn: ObjectRef,
}

impl NodeKind for Tnode {
    const TAG: NodeTag = NodeTag::Tnode;
}

/// Collision list for keys whose full hashes are equal.
#[repr(C)]
pub struct Lnode {
    pub prev: TracedCell,
    pub head: Option<TracedRef<PlistNode>>,
    pub len: usize,
}

impl Lnode {
    /// Leaves of the list, front to back.
    pub fn entries(&self) -> impl Iterator<Item = ObjectRef> {
        let mut cell = self.head;
        std::iter::from_fn(move || {
            let current = cell?;
            cell = current.next;
            Some(current.sn)
        })
    }
}

impl NodeKind for Lnode {
    const TAG: NodeTag = NodeTag::Lnode;
}

/// Cell of an immutable persistent list.
#[repr(C)]
pub struct PlistNode {
    pub next: Option<TracedRef<PlistNode>>,
    pub sn: ObjectRef,
}

impl NodeKind for PlistNode {
    const TAG: NodeTag = NodeTag::PlistNode;
}

/// Installed into a main node's `prev` when a generation-checked CAS
/// lost; points back at the main node to restore.
#[repr(C)]
pub struct Failure {
    pub prev: ObjectRef,
}

impl NodeKind for Failure {
    const TAG: NodeTag = NodeTag::Failure;
}

/// Pending replacement of the root indirection node.
#[repr(C)]
pub struct RdcssDescriptor {
    pub ov: TracedRef<Inode>,
    pub expected_main: ObjectRef,
    pub nv: TracedRef<Inode>,
    pub committed: AtomicBool,
}

impl NodeKind for RdcssDescriptor {
    const TAG: NodeTag = NodeTag::Rdcss;
}

pub struct BranchVector;

impl VectorKind for BranchVector {
    const TAG: NodeTag = NodeTag::BranchVector;
    type Element = Option<ObjectRef>;
}

pub struct StringVector;

impl VectorKind for StringVector {
    const TAG: NodeTag = NodeTag::StringVector;
    type Element = u8;
}

/// Payload bytes of a vector of `count` elements of kind `K`.
pub const fn vector_size<K: VectorKind>(count: usize) -> usize {
    count * size_of::<K::Element>()
}
