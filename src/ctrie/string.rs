use std::{fmt, slice};

use crate::{
    errors::GcError,
    gcref::{ObjectRef, TracedRef},
    mutator::Mutator,
};

use super::{allocator::NodeAllocator, nodes::StringVector};

/// Immutable byte string whose storage is a heap string vector. Copies
/// share that storage.
#[repr(C)]
pub struct CtrieString {
    len: usize,
    data: Option<TracedRef<StringVector>>,
}

impl CtrieString {
    /// Copies `bytes` into a fresh segment. The empty string owns none.
    pub fn new(alloc: &NodeAllocator<'_>, bytes: &[u8]) -> Result<Self, GcError> {
        let data = if bytes.is_empty() {
            None
        } else {
            Some(alloc.string_vector(bytes)?)
        };
        Ok(Self {
            len: bytes.len(),
            data,
        })
    }

    /// `len` copies of `byte`.
    pub fn repeated(alloc: &NodeAllocator<'_>, len: usize, byte: u8) -> Result<Self, GcError> {
        Self::new(alloc, &vec![byte; len])
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self.data {
            Some(data) => unsafe { slice::from_raw_parts(data.object().as_ptr(), self.len) },
            None => &[],
        }
    }

    pub fn storage(&self) -> Option<ObjectRef> {
        self.data.map(TracedRef::object)
    }

    /// New handle on the same storage. The storage is re-colored with the
    /// copying mutator's color so a concurrent cycle treats it like a fresh
    /// allocation.
    pub fn shallow_copy(&self, mutator: &Mutator) -> Self {
        if let Some(data) = self.data {
            data.object().header_cell().recolor(mutator.color());
        }
        Self {
            len: self.len,
            data: self.data,
        }
    }
}

impl PartialEq for CtrieString {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for CtrieString {}

impl fmt::Debug for CtrieString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(self.as_bytes()))
    }
}
