use crate::RawLock;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Ticket lock: waiters are served in the order they arrived.
pub struct RawTicket {
    next: AtomicUsize,
    owner: AtomicUsize,
}

impl Default for RawTicket {
    fn default() -> Self {
        Self::new()
    }
}

impl RawTicket {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicUsize::new(0),
            owner: AtomicUsize::new(0),
        }
    }

    /// Number of callers holding or waiting for the lock.
    #[inline]
    pub fn queue_len(&self) -> usize {
        let owner = self.owner.load(Ordering::Relaxed);
        self.next.load(Ordering::Relaxed).wrapping_sub(owner)
    }
}

impl RawLock for RawTicket {
    #[inline]
    fn raw_lock(&self) {
        let ticket = self.next.fetch_add(1, Ordering::Relaxed);
        while self.owner.load(Ordering::Acquire) != ticket {
            spin_loop();
        }
    }

    #[inline]
    fn raw_try_lock(&self) -> bool {
        let owner = self.owner.load(Ordering::Relaxed);
        // Only claim a ticket if it would be served immediately.
        self.next
            .compare_exchange(
                owner,
                owner.wrapping_add(1),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    #[inline]
    fn raw_is_locked(&self) -> bool {
        self.queue_len() != 0
    }

    #[inline]
    unsafe fn raw_unlock(&self) {
        let t = self.owner.load(Ordering::Relaxed);
        self.owner.store(t.wrapping_add(1), Ordering::Release);
    }
}
