//! Memory quota admission control.
//!
//! A [`MemoryQuotaController`] is shared by every partition on a host. Reopen
//! steps reserve the estimated cost of a switch before touching live state;
//! a refused reservation aborts the attempt.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct MemoryQuotaController {
    total: u64,
    used: AtomicU64,
}

impl MemoryQuotaController {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            used: AtomicU64::new(0),
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    pub fn free(&self) -> u64 {
        self.total.saturating_sub(self.used())
    }

    /// Reserve `bytes` if they fit in the remaining quota.
    ///
    /// Never reserves partially: on refusal nothing changes.
    pub fn reserve(&self, bytes: u64) -> bool {
        let mut current = self.used.load(Ordering::SeqCst);
        loop {
            let Some(next) = current.checked_add(bytes) else {
                return false;
            };
            if next > self.total {
                return false;
            }
            match self
                .used
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn release(&self, bytes: u64) {
        let mut current = self.used.load(Ordering::SeqCst);
        loop {
            let next = current.saturating_sub(bytes);
            match self
                .used
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Reserve `bytes` and tie the reservation to the returned guard.
    pub fn try_reserve(self: &Arc<Self>, bytes: u64) -> Option<MemoryReservation> {
        if self.reserve(bytes) {
            Some(MemoryReservation {
                controller: self.clone(),
                bytes,
            })
        } else {
            None
        }
    }

    /// An empty reservation that can later absorb others.
    pub fn empty_reservation(self: &Arc<Self>) -> MemoryReservation {
        MemoryReservation {
            controller: self.clone(),
            bytes: 0,
        }
    }
}

/// Reserved quota, released when dropped.
pub struct MemoryReservation {
    controller: Arc<MemoryQuotaController>,
    bytes: u64,
}

impl MemoryReservation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Take over another reservation against the same controller.
    pub fn merge(&mut self, mut other: MemoryReservation) {
        debug_assert!(Arc::ptr_eq(&self.controller, &other.controller));
        self.bytes += other.bytes;
        other.bytes = 0;
    }

    /// Release everything above `bytes`. Growing is not possible this way.
    pub fn shrink_to(&mut self, bytes: u64) {
        if bytes < self.bytes {
            self.controller.release(self.bytes - bytes);
            self.bytes = bytes;
        }
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        if self.bytes > 0 {
            self.controller.release(self.bytes);
        }
    }
}

impl fmt::Debug for MemoryReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryReservation")
            .field("bytes", &self.bytes)
            .finish()
    }
}
