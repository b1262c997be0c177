use std::{
    fmt::{self},
    marker::PhantomData,
    ops::Deref,
    ptr::{null_mut, NonNull},
    sync::atomic::AtomicPtr,
};

use atomic::Ordering;

use crate::header::{Header, HeapObjectHeader, NodeTag};

/// Untyped pointer to the payload of a heap object.
///
/// An `ObjectRef` obtained from the heap stays valid for as long as the
/// object is reachable from a root or held inside an operation scope.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ObjectRef {
    raw: NonNull<u8>,
}

unsafe impl Send for ObjectRef {}
unsafe impl Sync for ObjectRef {}

impl ObjectRef {
    /// # Safety
    /// `ptr` must be null or the payload address of a heap allocation.
    #[inline(always)]
    pub unsafe fn from_raw(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(|raw| Self { raw })
    }

    #[inline(always)]
    pub fn as_ptr(self) -> *mut u8 {
        self.raw.as_ptr()
    }

    #[inline(always)]
    pub fn header_cell(&self) -> &HeapObjectHeader {
        unsafe { HeapObjectHeader::from_object(self.raw.as_ptr()) }
    }

    #[inline(always)]
    pub fn header(self) -> Header {
        self.header_cell().load()
    }

    #[inline(always)]
    pub fn tag(self) -> NodeTag {
        self.header().tag()
    }

    /// # Safety
    /// The payload must hold a `T`.
    #[inline(always)]
    pub unsafe fn cast<T>(self) -> TracedRef<T> {
        TracedRef {
            raw: self,
            marker: PhantomData,
        }
    }
}

#[inline(always)]
pub(crate) fn into_raw(object: Option<ObjectRef>) -> *mut u8 {
    object.map_or(null_mut(), ObjectRef::as_ptr)
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:p})", self.raw)
    }
}

impl fmt::Pointer for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.raw)
    }
}

/// Typed, non-owning reference to a heap object. Reachability, not the
/// holder, decides how long the target lives.
#[repr(transparent)]
pub struct TracedRef<T> {
    raw: ObjectRef,
    marker: PhantomData<*const T>,
}

unsafe impl<T: Sync> Send for TracedRef<T> {}
unsafe impl<T: Sync> Sync for TracedRef<T> {}

impl<T> TracedRef<T> {
    #[inline(always)]
    pub fn object(self) -> ObjectRef {
        self.raw
    }
}

impl<T> Clone for TracedRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TracedRef<T> {}

impl<T> PartialEq for TracedRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for TracedRef<T> {}

impl<T> Deref for TracedRef<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.raw.as_ptr().cast::<T>() }
    }
}

impl<T> fmt::Debug for TracedRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TracedRef({:p})", self.raw)
    }
}

/// Atomically updated traced pointer field. Loads are plain acquire loads,
/// stores of published objects go through [`WriteBarrier`](crate::write_barrier::WriteBarrier).
#[repr(transparent)]
pub struct TracedCell {
    ptr: AtomicPtr<u8>,
}

/// Slot placed before an object's header in which the write barrier stashes
/// an overwritten value.
pub type LogSlot = TracedCell;

impl TracedCell {
    pub const fn null() -> Self {
        Self {
            ptr: AtomicPtr::new(null_mut()),
        }
    }

    pub fn new(value: Option<ObjectRef>) -> Self {
        Self {
            ptr: AtomicPtr::new(into_raw(value)),
        }
    }

    #[inline(always)]
    pub fn load(&self) -> Option<ObjectRef> {
        unsafe { ObjectRef::from_raw(self.ptr.load(Ordering::Acquire)) }
    }

    /// Sets the field of an object no other thread can see yet.
    #[inline(always)]
    pub(crate) fn init(&self, value: Option<ObjectRef>) {
        self.ptr.store(into_raw(value), Ordering::Release);
    }

    #[inline(always)]
    pub(crate) fn atomic(&self) -> &AtomicPtr<u8> {
        &self.ptr
    }
}

impl fmt::Debug for TracedCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TracedCell").field(&self.load()).finish()
    }
}
