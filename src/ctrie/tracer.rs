use std::{
    marker::PhantomData,
    mem::{align_of, size_of},
    ptr,
};

use crate::{
    errors::GcError,
    gcref::ObjectRef,
    header::{Header, NodeTag},
    internal::{
        finalize_trait::Policy,
        trace_trait::{CopySpace, Tracer},
    },
};

use super::nodes::{
    num_log_ptrs, vector_size, BranchVector, Cnode, Failure, Inode, Lnode, PlistNode,
    RdcssDescriptor, Snode, StringVector, Tnode,
};

/// Pointer layout of every trie node kind for values of type `V`.
pub struct CtrieTracer<V>(PhantomData<fn() -> V>);

/// Runs the destructor of the node before its storage is released.
pub struct CtriePolicy<V>(PhantomData<fn() -> V>);

impl<V: Copy + Send + Sync + 'static> Tracer for CtrieTracer<V> {
    fn num_log_ptrs(header: Header) -> usize {
        num_log_ptrs(header.tag())
    }

    fn size_of(header: Header) -> usize {
        match header.tag() {
            NodeTag::Inode => size_of::<Inode>(),
            NodeTag::Cnode => size_of::<Cnode>(),
            NodeTag::Snode => size_of::<Snode<V>>(),
            NodeTag::Tnode => size_of::<Tnode>(),
            NodeTag::Lnode => size_of::<Lnode>(),
            NodeTag::Failure => size_of::<Failure>(),
            NodeTag::BranchVector => vector_size::<BranchVector>(header.count()),
            NodeTag::StringVector => vector_size::<StringVector>(header.count()),
            NodeTag::PlistNode => size_of::<PlistNode>(),
            NodeTag::Rdcss => size_of::<RdcssDescriptor>(),
        }
    }

    fn align_of(header: Header) -> usize {
        match header.tag() {
            NodeTag::Inode => align_of::<Inode>(),
            NodeTag::Cnode => align_of::<Cnode>(),
            NodeTag::Snode => align_of::<Snode<V>>(),
            NodeTag::Tnode => align_of::<Tnode>(),
            NodeTag::Lnode => align_of::<Lnode>(),
            NodeTag::Failure => align_of::<Failure>(),
            NodeTag::BranchVector => align_of::<Option<ObjectRef>>(),
            NodeTag::StringVector => align_of::<u8>(),
            NodeTag::PlistNode => align_of::<PlistNode>(),
            NodeTag::Rdcss => align_of::<RdcssDescriptor>(),
        }
    }

    unsafe fn trace(header: Header, object: ObjectRef, visitor: &mut dyn FnMut(ObjectRef)) {
        match header.tag() {
            NodeTag::Inode => {
                let inode = object.cast::<Inode>();
                if let Some(main) = inode.main.load() {
                    visitor(main);
                }
            }
            NodeTag::Cnode => {
                let cnode = object.cast::<Cnode>();
                if let Some(prev) = cnode.prev.load() {
                    visitor(prev);
                }
                if let Some(array) = cnode.array {
                    visitor(array.object());
                }
                for branch in cnode.branches().iter().flatten() {
                    visitor(*branch);
                }
            }
            NodeTag::Snode => {
                let snode = object.cast::<Snode<V>>();
                if let Some(storage) = snode.key.storage() {
                    visitor(storage);
                }
            }
            NodeTag::Tnode => {
                let tnode = object.cast::<Tnode>();
                if let Some(prev) = tnode.prev.load() {
                    visitor(prev);
                }
                visitor(tnode.sn);
            }
            NodeTag::Lnode => {
                let lnode = object.cast::<Lnode>();
                if let Some(prev) = lnode.prev.load() {
                    visitor(prev);
                }
                if let Some(head) = lnode.head {
                    visitor(head.object());
                }
            }
            NodeTag::Failure => visitor(object.cast::<Failure>().prev),
            NodeTag::PlistNode => {
                let cell = object.cast::<PlistNode>();
                if let Some(next) = cell.next {
                    visitor(next.object());
                }
                visitor(cell.sn);
            }
            NodeTag::Rdcss => {
                let desc = object.cast::<RdcssDescriptor>();
                visitor(desc.ov.object());
                visitor(desc.expected_main);
                visitor(desc.nv.object());
            }
            NodeTag::BranchVector | NodeTag::StringVector => {}
        }
    }

    unsafe fn copy_obj(
        header: Header,
        object: ObjectRef,
        space: &dyn CopySpace,
    ) -> Result<Option<ObjectRef>, GcError> {
        if header.tag() == NodeTag::StringVector {
            return Ok(None);
        }
        let size = Self::size_of(header);
        let copy = space.allocate_copy(
            size,
            Self::align_of(header),
            header,
            Self::num_log_ptrs(header),
        )?;
        ptr::copy_nonoverlapping(object.as_ptr(), copy.as_ptr(), size);
        Ok(Some(copy))
    }
}

impl<V: Copy + Send + Sync + 'static> Policy for CtriePolicy<V> {
    unsafe fn destroy(header: Header, object: ObjectRef) {
        let payload = object.as_ptr();
        match header.tag() {
            NodeTag::Inode => ptr::drop_in_place(payload.cast::<Inode>()),
            NodeTag::Cnode => ptr::drop_in_place(payload.cast::<Cnode>()),
            NodeTag::Snode => ptr::drop_in_place(payload.cast::<Snode<V>>()),
            NodeTag::Tnode => ptr::drop_in_place(payload.cast::<Tnode>()),
            NodeTag::Lnode => ptr::drop_in_place(payload.cast::<Lnode>()),
            NodeTag::Failure => ptr::drop_in_place(payload.cast::<Failure>()),
            NodeTag::PlistNode => ptr::drop_in_place(payload.cast::<PlistNode>()),
            NodeTag::Rdcss => ptr::drop_in_place(payload.cast::<RdcssDescriptor>()),
            NodeTag::BranchVector | NodeTag::StringVector => {}
        }
    }
}
