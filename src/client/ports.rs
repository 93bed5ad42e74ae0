//! Debugger forwarding port pool

use parking_lot::Mutex;
use std::collections::BTreeSet;

/// Ports in `[base, base + count)` handed out lowest first
pub struct DebuggerPortPool {
    base: u16,
    count: u16,
    on_loan: Mutex<BTreeSet<u16>>,
}

impl DebuggerPortPool {
    pub fn new(base: u16, count: u16) -> Self {
        Self {
            base,
            count,
            on_loan: Mutex::new(BTreeSet::new()),
        }
    }

    fn end(&self) -> u32 {
        u32::from(self.base) + u32::from(self.count)
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.base && u32::from(port) < self.end()
    }

    /// Lend the lowest free port, `None` when exhausted
    pub fn allocate(&self) -> Option<u16> {
        let mut on_loan = self.on_loan.lock();
        let port = (u32::from(self.base)..self.end())
            .map(|p| p as u16)
            .find(|p| !on_loan.contains(p))?;
        on_loan.insert(port);
        Some(port)
    }

    /// Take a specific port
    ///
    /// Ports outside the pool are always granted and are not tracked.
    pub fn claim(&self, port: u16) -> bool {
        if !self.contains(port) {
            return true;
        }
        self.on_loan.lock().insert(port)
    }

    /// Return a port; unknown ports are ignored
    pub fn release(&self, port: u16) {
        if self.contains(port) {
            self.on_loan.lock().remove(&port);
        }
    }

    pub fn available(&self) -> usize {
        usize::from(self.count).saturating_sub(self.on_loan.lock().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_release_cycle() {
        let pool = DebuggerPortPool::new(8600, 3);
        assert_eq!(pool.allocate(), Some(8600));
        assert_eq!(pool.allocate(), Some(8601));
        assert_eq!(pool.allocate(), Some(8602));
        assert_eq!(pool.allocate(), None);

        pool.release(8601);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.allocate(), Some(8601));
    }

    #[test]
    fn test_claim_pinned_ports() {
        let pool = DebuggerPortPool::new(8600, 2);
        assert!(pool.claim(8601));
        assert!(!pool.claim(8601));
        assert_eq!(pool.allocate(), Some(8600));
        assert_eq!(pool.allocate(), None);

        // Outside the pool: granted, never tracked
        assert!(pool.claim(9000));
        assert!(pool.claim(9000));
        pool.release(9000);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_pool_at_top_of_range() {
        let pool = DebuggerPortPool::new(65534, 2);
        assert_eq!(pool.allocate(), Some(65534));
        assert_eq!(pool.allocate(), Some(65535));
        assert_eq!(pool.allocate(), None);
    }
}
