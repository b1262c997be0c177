use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    mem::size_of,
    ptr::null_mut,
};

use atomic::Ordering;

use crate::{
    errors::GcError,
    gcref::{LogSlot, ObjectRef},
    header::{Header, HeapObjectHeader, HEADER_SIZE},
};

pub const LOG_PTR_SIZE: usize = size_of::<usize>();
pub const ALLOCATION_GRANULARITY: usize = size_of::<usize>();

/// rounds the given value `val` up to the nearest multiple
/// of `align`
pub const fn align_usize(value: usize, align: usize) -> usize {
    if align == 0 {
        return value;
    }

    ((value + align - 1) / align) * align
}

/// Alignment an allocation gets for a payload that needs `align`.
pub const fn object_align(align: usize) -> usize {
    if align > ALLOCATION_GRANULARITY {
        align
    } else {
        ALLOCATION_GRANULARITY
    }
}

/// Distance from the start of an allocation to its payload. Padding goes
/// in front of the log slots so they stay adjacent to the header.
pub const fn payload_offset(log_ptrs: usize, align: usize) -> usize {
    align_usize(log_ptrs * LOG_PTR_SIZE + HEADER_SIZE, object_align(align))
}

/// Bytes a single allocation occupies, log slots and header included.
pub const fn allocation_size(size: usize, align: usize, log_ptrs: usize) -> usize {
    payload_offset(log_ptrs, align) + align_usize(size, object_align(align))
}

/// Log slot of `object`. With several slots the one farthest from the
/// header is used.
///
/// # Safety
/// `object` must have been allocated with `log_ptrs` log slots.
#[inline(always)]
pub unsafe fn log_slot<'a>(object: ObjectRef, log_ptrs: usize) -> Option<&'a LogSlot> {
    if log_ptrs == 0 {
        return None;
    }
    let slot = object
        .as_ptr()
        .sub(HEADER_SIZE + log_ptrs * LOG_PTR_SIZE)
        .cast::<LogSlot>();
    Some(&*slot)
}

/// One heap allocation: `[padding][log slots][header][payload]`.
pub struct RawAllocation {
    object: ObjectRef,
    layout: Layout,
    log_ptrs: usize,
}

unsafe impl Send for RawAllocation {}

impl RawAllocation {
    /// Reserves zeroed storage for a `size` byte payload aligned to at
    /// least `align`, writes `header` and leaves every log slot empty.
    pub fn allocate(
        size: usize,
        align: usize,
        header: Header,
        log_ptrs: usize,
    ) -> Result<Self, GcError> {
        let total = allocation_size(size, align, log_ptrs);
        let layout = Layout::from_size_align(total, object_align(align))
            .map_err(|_| GcError::OutOfMemory { requested: total })?;
        unsafe {
            let base = alloc_zeroed(layout);
            if base.is_null() {
                tracing::warn!(requested = total, "system allocator returned null");
                return Err(GcError::OutOfMemory { requested: total });
            }
            let header_ptr = base.add(payload_offset(log_ptrs, layout.align()) - HEADER_SIZE);
            header_ptr
                .cast::<HeapObjectHeader>()
                .write(HeapObjectHeader::new(header));
            let object = ObjectRef::from_raw(header_ptr.add(HEADER_SIZE))
                .ok_or(GcError::OutOfMemory { requested: total })?;
            Ok(Self {
                object,
                layout,
                log_ptrs,
            })
        }
    }

    #[inline(always)]
    pub fn object(&self) -> ObjectRef {
        self.object
    }

    /// Total footprint in bytes.
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    pub fn clear_log_slots(&self) {
        unsafe {
            let first = self
                .object
                .as_ptr()
                .sub(HEADER_SIZE + self.log_ptrs * LOG_PTR_SIZE);
            for index in 0..self.log_ptrs {
                (*first.cast::<LogSlot>().add(index))
                    .atomic()
                    .store(null_mut(), Ordering::Release);
            }
        }
    }

    fn base(&self) -> *mut u8 {
        unsafe {
            self.object
                .as_ptr()
                .sub(payload_offset(self.log_ptrs, self.layout.align()))
        }
    }

    /// Returns the storage to the system allocator.
    ///
    /// # Safety
    /// Nothing may reference the object afterwards.
    pub unsafe fn release(self) {
        dealloc(self.base(), self.layout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{Color, NodeTag};

    #[test]
    fn layout_places_log_slots_before_header() {
        let header = Header::encode(NodeTag::Inode, Color::INITIAL, 0);
        let raw = RawAllocation::allocate(16, 8, header, 1).unwrap();
        assert_eq!(raw.size(), allocation_size(16, 8, 1));
        assert_eq!(raw.object().header(), header);
        let slot = unsafe { log_slot(raw.object(), 1) }.unwrap();
        assert_eq!(
            slot as *const LogSlot as usize,
            raw.object().as_ptr() as usize - HEADER_SIZE - LOG_PTR_SIZE
        );
        assert!(slot.load().is_none());
        unsafe { raw.release() };
    }

    #[test]
    fn kinds_without_log_slots_have_none() {
        let header = Header::encode(NodeTag::Snode, Color::INITIAL, 0);
        let raw = RawAllocation::allocate(24, 8, header, 0).unwrap();
        assert!(unsafe { log_slot(raw.object(), 0) }.is_none());
        unsafe { raw.release() };
    }

    #[test]
    fn empty_payload_still_gets_a_header() {
        let header = Header::encode(NodeTag::StringVector, Color::INITIAL, 0);
        let raw = RawAllocation::allocate(0, 1, header, 0).unwrap();
        assert_eq!(raw.size(), HEADER_SIZE);
        assert_eq!(raw.object().header().count(), 0);
        unsafe { raw.release() };
    }

    #[test]
    fn wide_payloads_are_aligned() {
        let header = Header::encode(NodeTag::Snode, Color::INITIAL, 0);
        for log_ptrs in 0..3 {
            let raw = RawAllocation::allocate(48, 32, header, log_ptrs).unwrap();
            assert_eq!(raw.object().as_ptr() as usize % 32, 0);
            assert_eq!(raw.size(), allocation_size(48, 32, log_ptrs));
            assert_eq!(raw.object().header(), header);
            if let Some(slot) = unsafe { log_slot(raw.object(), log_ptrs) } {
                assert!(slot.load().is_none());
            }
            raw.clear_log_slots();
            unsafe { raw.release() };
        }
    }
}
