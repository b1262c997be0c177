use std::{marker::PhantomData, ptr::null_mut};

use atomic::Ordering;

use crate::{
    gcref::{into_raw, ObjectRef, TracedCell},
    internal::trace_trait::Tracer,
    mutator::Mutator,
};

/// Deletion barrier wrapping every store into a published traced field.
///
/// While the collector is marking, an overwritten value that is not marked
/// yet is stashed in the container's log slot (when its kind has one) and
/// appended to the mutator's barrier log before the store happens.
pub struct WriteBarrier<'m, T: Tracer> {
    mutator: &'m Mutator,
    marker: PhantomData<T>,
}

impl<'m, T: Tracer> WriteBarrier<'m, T> {
    pub fn new(mutator: &'m Mutator) -> Self {
        Self {
            mutator,
            marker: PhantomData,
        }
    }

    pub fn mutator(&self) -> &'m Mutator {
        self.mutator
    }

    #[inline(always)]
    fn log_before_overwrite(&self, container: Option<ObjectRef>, old: Option<ObjectRef>) {
        if !self.mutator.is_marking() {
            return;
        }
        let old = match old {
            Some(old) => old,
            None => return,
        };
        if old.header_cell().color() == self.mutator.mark_color() {
            return;
        }
        self.log_slow(container, old);
    }

    #[cold]
    #[inline(never)]
    fn log_slow(&self, container: Option<ObjectRef>, old: ObjectRef) {
        if let Some(container) = container {
            let slot = unsafe { T::log_ptr(container.header(), container) };
            if let Some(slot) = slot {
                let _ = slot.atomic().compare_exchange(
                    null_mut(),
                    old.as_ptr(),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
            }
        }
        self.mutator.log_overwritten(old);
    }

    /// Unconditionally replaces the value of `cell`, a field of `container`.
    pub fn store(&self, container: Option<ObjectRef>, cell: &TracedCell, new: Option<ObjectRef>) {
        let mut current = cell.load();
        loop {
            match self.compare_exchange(container, cell, current, new) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Installs `new` if `cell` still holds `current`. On failure returns
    /// the value found instead.
    pub fn compare_exchange(
        &self,
        container: Option<ObjectRef>,
        cell: &TracedCell,
        current: Option<ObjectRef>,
        new: Option<ObjectRef>,
    ) -> Result<Option<ObjectRef>, Option<ObjectRef>> {
        self.log_before_overwrite(container, current);
        cell.atomic()
            .compare_exchange(
                into_raw(current),
                into_raw(new),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map(|previous| unsafe { ObjectRef::from_raw(previous) })
            .map_err(|actual| unsafe { ObjectRef::from_raw(actual) })
    }
}
