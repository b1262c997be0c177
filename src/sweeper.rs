use crate::{
    header::Color, heap::RawAllocation, internal::finalize_trait::Policy,
};

#[derive(Default, Debug, Clone, Copy)]
pub struct SweepTotals {
    pub freed_objects: usize,
    pub freed_bytes: usize,
    pub live_objects: usize,
}

/// Destroys and releases every allocation not carrying `mark`. Survivors
/// get their log slots cleared for the next cycle.
pub fn sweep_allocations<P: Policy>(
    allocations: Vec<RawAllocation>,
    mark: Color,
    totals: &mut SweepTotals,
) -> Vec<RawAllocation> {
    let mut survivors = Vec::with_capacity(allocations.len());
    for raw in allocations {
        let object = raw.object();
        let header = object.header();
        if header.color() == mark {
            raw.clear_log_slots();
            totals.live_objects += 1;
            survivors.push(raw);
        } else {
            totals.freed_objects += 1;
            totals.freed_bytes += raw.size();
            unsafe {
                P::destroy(header, object);
                raw.release();
            }
        }
    }
    survivors
}
