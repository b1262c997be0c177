use std::time::Duration;

#[derive(Clone, Debug, Default)]
pub struct GcStats {
    pub cycles: usize,
    pub allocated_objects: usize,
    pub allocated_bytes: usize,
    /// Objects marked by the last cycle.
    pub marked_objects: usize,
    pub freed_objects: usize,
    pub freed_bytes: usize,
    /// Objects that survived the last sweep.
    pub live_objects: usize,
    pub live_bytes: usize,
    pub heap_limit: Option<usize>,
    pub last_cycle: Duration,
}

struct FormattedSize {
    pub size: usize,
}

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ksize = (self.size as f64) / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 1f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}

impl std::fmt::Display for GcStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Collector statistics:")?;
        writeln!(f, "  Cycles: {}", self.cycles)?;
        writeln!(
            f,
            "  Total allocated: {} in {} objects",
            formatted_size(self.allocated_bytes),
            self.allocated_objects
        )?;
        writeln!(
            f,
            "  Total freed: {} in {} objects",
            formatted_size(self.freed_bytes),
            self.freed_objects
        )?;
        writeln!(
            f,
            "  Live: {} in {} objects ({} marked by the last cycle)",
            formatted_size(self.live_bytes),
            self.live_objects,
            self.marked_objects
        )?;
        match self.heap_limit {
            Some(limit) => writeln!(f, "  Heap limit: {}", formatted_size(limit))?,
            None => writeln!(f, "  Heap limit: none")?,
        }
        writeln!(f, "  Last cycle: {:?}", self.last_cycle)?;
        Ok(())
    }
}
