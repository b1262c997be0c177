use std::marker::PhantomData;

use crate::{gcref::ObjectRef, header::Color, internal::trace_trait::Tracer};

/// Grey worklist of one marking phase.
pub struct Marker<T: Tracer> {
    color: Color,
    worklist: Vec<ObjectRef>,
    marked_objects: usize,
    marker: PhantomData<T>,
}

impl<T: Tracer> Marker<T> {
    pub fn new(color: Color) -> Self {
        Self {
            color,
            worklist: Vec::new(),
            marked_objects: 0,
            marker: PhantomData,
        }
    }

    /// Colors `object` and queues it for scanning unless it already
    /// carries this cycle's color.
    #[inline]
    pub fn shade(&mut self, object: ObjectRef) {
        if object.header_cell().try_mark(self.color) {
            self.marked_objects += 1;
            self.worklist.push(object);
        }
    }

    /// Scans grey objects until the worklist is empty. The value stashed in
    /// an object's log slot counts as one of its children.
    pub fn drain(&mut self) {
        while let Some(object) = self.worklist.pop() {
            let header = object.header();
            unsafe {
                T::trace(header, object, &mut |child| self.shade(child));
                if let Some(logged) = T::log_ptr(header, object).and_then(|slot| slot.load()) {
                    self.shade(logged);
                }
            }
        }
    }

    pub fn marked_objects(&self) -> usize {
        self.marked_objects
    }
}
