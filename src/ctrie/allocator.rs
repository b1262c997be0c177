use std::{
    mem::{align_of, size_of},
    ptr,
};

use crate::{
    errors::GcError,
    gcref::{ObjectRef, TracedRef},
    header::Header,
    mutator::Mutator,
};

use super::nodes::{num_log_ptrs, vector_size, BranchVector, NodeKind, StringVector, VectorKind};

/// Typed allocation front end over a [`Mutator`]. Every object it hands
/// out carries the mutator's current color and the kind's log slots.
#[derive(Clone, Copy)]
pub struct NodeAllocator<'m> {
    mutator: &'m Mutator,
}

impl<'m> NodeAllocator<'m> {
    pub fn new(mutator: &'m Mutator) -> Self {
        Self { mutator }
    }

    pub fn mutator(&self) -> &'m Mutator {
        self.mutator
    }

    /// Moves `node` into a fresh object of kind `K`.
    pub fn allocate<K: NodeKind>(&self, node: K) -> Result<TracedRef<K>, GcError> {
        let header = Header::encode(K::TAG, self.mutator.color(), 0);
        let object = self
            .mutator
            .allocate(size_of::<K>(), align_of::<K>(), header, K::NUM_LOG_PTRS)?;
        unsafe {
            object.as_ptr().cast::<K>().write(node);
            Ok(object.cast::<K>())
        }
    }

    /// Zeroed vector of `count` elements. The count lives in the header.
    pub fn allocate_vector<K: VectorKind>(&self, count: usize) -> Result<TracedRef<K>, GcError> {
        let header = Header::encode(K::TAG, self.mutator.color(), count);
        let object = self.mutator.allocate(
            vector_size::<K>(count),
            align_of::<K::Element>(),
            header,
            num_log_ptrs(K::TAG),
        )?;
        Ok(unsafe { object.cast::<K>() })
    }

    pub fn branch_vector(&self, branches: &[ObjectRef]) -> Result<TracedRef<BranchVector>, GcError> {
        let vector = self.allocate_vector::<BranchVector>(branches.len())?;
        let elements = vector.object().as_ptr().cast::<Option<ObjectRef>>();
        for (index, branch) in branches.iter().enumerate() {
            unsafe { elements.add(index).write(Some(*branch)) };
        }
        Ok(vector)
    }

    pub fn string_vector(&self, bytes: &[u8]) -> Result<TracedRef<StringVector>, GcError> {
        let vector = self.allocate_vector::<StringVector>(bytes.len())?;
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), vector.object().as_ptr(), bytes.len());
        }
        Ok(vector)
    }
}
