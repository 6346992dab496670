//! RTP port pool for framed taps.

use std::collections::HashSet;

use parking_lot::Mutex;
use rand::Rng;

use crate::error::{GatewayError, GatewayResult};

/// Guarded allocator over an inclusive port range. Ports are drawn at
/// random; a port is never handed out twice while its session lives.
pub struct PortAllocator {
    min: u16,
    max: u16,
    allocated: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(min: u16, max: u16) -> Self {
        debug_assert!(min <= max);
        PortAllocator {
            min,
            max,
            allocated: Mutex::new(HashSet::new()),
        }
    }

    /// Draw a free port. Attempts are bounded by the range width.
    pub fn allocate(&self) -> GatewayResult<u16> {
        let width = (self.max - self.min) as usize + 1;
        let mut allocated = self.allocated.lock();
        if allocated.len() >= width {
            return Err(GatewayError::PortRangeExhausted(self.min, self.max));
        }

        let mut rng = rand::thread_rng();
        for _ in 0..width {
            let port = rng.gen_range(self.min..=self.max);
            if allocated.insert(port) {
                return Ok(port);
            }
        }
        Err(GatewayError::PortRangeExhausted(self.min, self.max))
    }

    /// Return a port to the pool.
    pub fn free(&self, port: u16) {
        self.allocated.lock().remove(&port);
    }

    /// Number of ports currently allocated.
    pub fn in_use(&self) -> usize {
        self.allocated.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_unique_ports_until_exhausted() {
        let pool = PortAllocator::new(40000, 40003);
        let mut seen = HashSet::new();
        for _ in 0..4 {
            let port = pool.allocate().unwrap();
            assert!((40000..=40003).contains(&port));
            assert!(seen.insert(port), "port {port} handed out twice");
        }
        assert!(matches!(
            pool.allocate(),
            Err(GatewayError::PortRangeExhausted(40000, 40003))
        ));
    }

    #[test]
    fn freed_ports_become_allocatable_again() {
        let pool = PortAllocator::new(41000, 41000);
        let port = pool.allocate().unwrap();
        assert_eq!(port, 41000);
        assert!(pool.allocate().is_err());

        pool.free(port);
        assert_eq!(pool.allocate().unwrap(), 41000);
    }

    #[test]
    fn width_one_range_is_legal() {
        let pool = PortAllocator::new(42000, 42000);
        assert_eq!(pool.allocate().unwrap(), 42000);
        assert_eq!(pool.in_use(), 1);
    }
}
