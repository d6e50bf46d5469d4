use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// Exponentially weighted estimate of how much memory a call needs
///
/// Used to pre-size per-call arenas. Updates are relaxed: concurrent updates may interleave in
/// any order, and only convergence toward recent observations is guaranteed.
#[derive(Debug)]
pub struct CallSizeEstimate(AtomicUsize);

impl CallSizeEstimate {
    /// Start from an initial guess
    pub fn new(initial: usize) -> Self {
        Self(AtomicUsize::new(initial))
    }

    /// Current estimate in bytes
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    /// Fold in the observed size of a finished call
    ///
    /// Growth is adopted immediately so the next call does not have to reallocate; shrinkage
    /// decays slowly, by 1/256 of the difference per observation.
    pub fn update(&self, size: usize) {
        let cur = self.0.load(Ordering::Relaxed);
        if size > cur {
            // Lost races are acceptable; some other update got in first
            let _ = self
                .0
                .compare_exchange(cur, size, Ordering::Relaxed, Ordering::Relaxed);
        } else if size < cur {
            let next = (cur.saturating_mul(255).saturating_add(size)) / 256;
            let _ = self
                .0
                .compare_exchange(cur, next, Ordering::Relaxed, Ordering::Relaxed);
        }
    }
}

/// Hands out accounted memory reservations for one channel
///
/// Quota enforcement belongs to the embedding application; this type only keeps the books so
/// that a channel knows how much its calls currently hold.
#[derive(Debug, Clone)]
pub struct MemoryAllocator {
    name: Arc<str>,
    outstanding: Arc<AtomicUsize>,
}

impl MemoryAllocator {
    /// Create an allocator labelled `name` for diagnostics
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Reserve `size` bytes until the returned guard is dropped
    pub fn reserve(&self, size: usize) -> Reservation {
        self.outstanding.fetch_add(size, Ordering::Relaxed);
        Reservation {
            size,
            outstanding: self.outstanding.clone(),
        }
    }

    /// Bytes currently reserved
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Label given at construction
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Memory held on behalf of one call
#[derive(Debug)]
pub struct Reservation {
    size: usize,
    outstanding: Arc<AtomicUsize>,
}

impl Reservation {
    /// Bytes held by this reservation
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(self.size, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_grows_at_once_and_shrinks_slowly() {
        let estimate = CallSizeEstimate::new(1024);
        estimate.update(4096);
        assert_eq!(estimate.get(), 4096);
        estimate.update(0);
        assert_eq!(estimate.get(), 4096 * 255 / 256);
        estimate.update(estimate.get());
        assert_eq!(estimate.get(), 4096 * 255 / 256);
    }

    #[test]
    fn estimate_converges_downward() {
        let estimate = CallSizeEstimate::new(1 << 20);
        for _ in 0..4096 {
            estimate.update(512);
        }
        assert!(estimate.get() < 1024, "estimate {}", estimate.get());
        assert!(estimate.get() >= 512);
    }

    #[test]
    fn reservations_release_on_drop() {
        let allocator = MemoryAllocator::new("test");
        let a = allocator.reserve(100);
        let b = allocator.clone().reserve(28);
        assert_eq!(allocator.outstanding(), 128);
        drop(a);
        assert_eq!(allocator.outstanding(), 28);
        assert_eq!(b.size(), 28);
        drop(b);
        assert_eq!(allocator.outstanding(), 0);
    }
}
