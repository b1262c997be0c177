use crate::{
    errors::GcError,
    gcref::{LogSlot, ObjectRef},
    header::Header,
    heap::{log_slot, ALLOCATION_GRANULARITY},
};

/// Exposes the pointer graph of every heap object kind to the collector.
///
/// All dispatch is driven by the header alone, the collector never
/// consults anything else to interpret an object.
pub trait Tracer: 'static {
    /// Log slots reserved in front of objects carrying `header`.
    fn num_log_ptrs(header: Header) -> usize;

    /// Payload bytes of the object.
    fn size_of(header: Header) -> usize;

    /// Alignment the payload needs.
    fn align_of(_header: Header) -> usize {
        ALLOCATION_GRANULARITY
    }

    /// Calls `visitor` once for every outgoing pointer of `object`.
    ///
    /// # Safety
    /// `object` must be a live, published object described by `header`.
    unsafe fn trace(header: Header, object: ObjectRef, visitor: &mut dyn FnMut(ObjectRef));

    /// # Safety
    /// See [`Tracer::trace`].
    unsafe fn get_derived_ptrs(header: Header, object: ObjectRef) -> Vec<ObjectRef> {
        let mut derived = Vec::new();
        Self::trace(header, object, &mut |child| derived.push(child));
        derived
    }

    /// Duplicates `object` into storage obtained from `space`. Kinds that
    /// are never relocated return `Ok(None)`.
    ///
    /// # Safety
    /// See [`Tracer::trace`].
    unsafe fn copy_obj(
        header: Header,
        object: ObjectRef,
        space: &dyn CopySpace,
    ) -> Result<Option<ObjectRef>, GcError>;

    /// # Safety
    /// See [`Tracer::trace`].
    #[inline(always)]
    unsafe fn log_ptr<'a>(header: Header, object: ObjectRef) -> Option<&'a LogSlot> {
        log_slot(object, Self::num_log_ptrs(header))
    }
}

/// Target storage for relocated objects.
pub trait CopySpace {
    /// Allocates `size` payload bytes aligned to `align` with exactly
    /// `header` and `log_ptrs` empty log slots.
    fn allocate_copy(
        &self,
        size: usize,
        align: usize,
        header: Header,
        log_ptrs: usize,
    ) -> Result<ObjectRef, GcError>;
}
