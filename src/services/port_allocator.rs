use dashmap::DashSet;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::{Error, Result};

/// Attribue des ports de worker dans `[base, max)` en round-robin
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    max: u16,
    next: AtomicU32,
    in_use: DashSet<u16>,
}

impl PortAllocator {
    pub fn new(base: u16, max: u16) -> Self {
        Self {
            base,
            max,
            next: AtomicU32::new(0),
            in_use: DashSet::new(),
        }
    }

    fn width(&self) -> u32 {
        self.max.saturating_sub(self.base) as u32
    }

    /// Sonde à partir d'un compteur tournant ; échoue après un tour complet
    pub fn allocate(&self) -> Result<u16> {
        let width = self.width();
        for _ in 0..width {
            let offset = self.next.fetch_add(1, Ordering::Relaxed) % width;
            let port = self.base + offset as u16;
            if self.in_use.insert(port) {
                tracing::debug!(port, "Allocated worker port");
                return Ok(port);
            }
        }

        Err(Error::AllocationExhausted {
            start: self.base,
            end: self.max,
        })
    }

    pub fn release(&self, port: u16) -> bool {
        let released = self.in_use.remove(&port).is_some();
        if released {
            tracing::debug!(port, "Released worker port");
        }
        released
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.in_use.contains(&port)
    }

    pub fn allocated_count(&self) -> usize {
        self.in_use.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_ports_are_unique_until_exhausted() {
        let allocator = PortAllocator::new(9000, 9004);
        let ports: HashSet<u16> = (0..4).map(|_| allocator.allocate().unwrap()).collect();

        assert_eq!(ports.len(), 4);
        assert!(ports.iter().all(|p| (9000..9004).contains(p)));
        assert!(matches!(
            allocator.allocate(),
            Err(Error::AllocationExhausted { start: 9000, end: 9004 })
        ));
    }

    #[test]
    fn test_released_port_is_reusable() {
        let allocator = PortAllocator::new(9000, 9002);
        let first = allocator.allocate().unwrap();
        let _second = allocator.allocate().unwrap();

        assert!(allocator.release(first));
        assert!(!allocator.release(first));
        assert_eq!(allocator.allocate().unwrap(), first);
    }

    #[test]
    fn test_concurrent_allocation_never_duplicates() {
        let allocator = Arc::new(PortAllocator::new(20000, 20128));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let allocator = allocator.clone();
                std::thread::spawn(move || (0..8).map(|_| allocator.allocate().unwrap()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for port in handle.join().unwrap() {
                assert!(seen.insert(port), "port {} handed out twice", port);
            }
        }
        assert_eq!(allocator.allocated_count(), 64);
    }
}
