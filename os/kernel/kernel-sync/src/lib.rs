//! # Kernel synchronization primitives
//!
//! Spin-based locks for code that may run in contexts that must not suspend.
//!
//! * [`SpinMutex`]: test-and-set mutex, cheapest when uncontended.
//! * [`TicketMutex`]: FIFO ticket mutex, fair under contention.
//! * [`RwSpin`]: reader/writer spin lock for read-mostly data.
//!
//! None of these ever put the caller to sleep; contention is resolved by
//! spinning.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod mutex;
mod raw_spin;
mod raw_ticket;
mod rw_spin;

pub use mutex::{Mutex, MutexGuard};
pub use raw_spin::RawSpin;
pub use raw_ticket::RawTicket;
pub use rw_spin::{RwSpin, RwSpinReadGuard, RwSpinWriteGuard};

pub type SpinMutex<T> = Mutex<T, RawSpin>;
pub type TicketMutex<T> = Mutex<T, RawTicket>;

impl<T> SpinMutex<T> {
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawSpin::new(), value)
    }
}

impl<T> TicketMutex<T> {
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawTicket::new(), value)
    }
}

/// A raw mutual-exclusion primitive without associated data.
pub trait RawLock {
    /// Spin until the lock is held by the caller.
    fn raw_lock(&self);

    /// Take the lock if it is free; never spins.
    fn raw_try_lock(&self) -> bool;

    /// Whether the lock is currently held by anyone.
    fn raw_is_locked(&self) -> bool;

    /// # Safety
    /// The caller must currently hold the lock.
    unsafe fn raw_unlock(&self);
}
