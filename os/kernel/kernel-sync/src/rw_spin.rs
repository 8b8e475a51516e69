use core::cell::UnsafeCell;
use core::fmt;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};

/// Held exclusively by a writer.
const WRITER: usize = 1;
/// A writer is waiting; new readers back off.
const PENDING: usize = 2;
/// One reader; the reader count lives above the flag bits.
const READER: usize = 4;

/// Reader/writer spin lock for read-mostly data.
///
/// Any number of readers may hold the lock at once. A waiting writer blocks
/// new readers from entering so that a steady stream of readers cannot
/// starve it.
pub struct RwSpin<T> {
    state: AtomicUsize,
    inner: UnsafeCell<T>,
}

// Safety: readers get `&T` concurrently (needs T: Sync), writers get `&mut T`.
unsafe impl<T: Send + Sync> Sync for RwSpin<T> {}
unsafe impl<T: Send> Send for RwSpin<T> {}

impl<T> RwSpin<T> {
    #[must_use]
    pub const fn new(inner: T) -> Self {
        Self {
            state: AtomicUsize::new(0),
            inner: UnsafeCell::new(inner),
        }
    }

    #[inline]
    pub fn read(&self) -> RwSpinReadGuard<'_, T> {
        loop {
            if let Some(g) = self.try_read() {
                return g;
            }
            while self.state.load(Ordering::Relaxed) & (WRITER | PENDING) != 0 {
                spin_loop();
            }
        }
    }

    #[inline]
    pub fn try_read(&self) -> Option<RwSpinReadGuard<'_, T>> {
        let s = self.state.load(Ordering::Relaxed);
        if s & (WRITER | PENDING) != 0 {
            return None;
        }
        self.state
            .compare_exchange(s, s + READER, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| RwSpinReadGuard { lock: self })
    }

    #[inline]
    pub fn write(&self) -> RwSpinWriteGuard<'_, T> {
        loop {
            let s = self.state.load(Ordering::Relaxed);
            if s & WRITER == 0 && s < READER {
                // No readers and no writer: claim it (clears PENDING).
                if self
                    .state
                    .compare_exchange_weak(s, WRITER, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return RwSpinWriteGuard { lock: self };
                }
            } else if s & PENDING == 0 {
                self.state.fetch_or(PENDING, Ordering::Relaxed);
            }
            spin_loop();
        }
    }

    #[inline]
    pub fn try_write(&self) -> Option<RwSpinWriteGuard<'_, T>> {
        self.state
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| RwSpinWriteGuard { lock: self })
    }

    /// Number of readers currently inside.
    #[inline]
    pub fn reader_count(&self) -> usize {
        self.state.load(Ordering::Relaxed) / READER
    }

    #[inline]
    pub fn is_write_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) & WRITER != 0
    }

    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

impl<T: Default> Default for RwSpin<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for RwSpin<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwSpin")
            .field("readers", &self.reader_count())
            .field("writer", &self.is_write_locked())
            .finish_non_exhaustive()
    }
}

pub struct RwSpinReadGuard<'a, T> {
    lock: &'a RwSpin<T>,
}

impl<T> Deref for RwSpinReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> Drop for RwSpinReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(READER, Ordering::Release);
    }
}

pub struct RwSpinWriteGuard<'a, T> {
    lock: &'a RwSpin<T>,
}

impl<T> Deref for RwSpinWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> DerefMut for RwSpinWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T> Drop for RwSpinWriteGuard<'_, T> {
    fn drop(&mut self) {
        // Leave a PENDING bit set by another writer intact.
        self.lock.state.fetch_and(!WRITER, Ordering::Release);
    }
}
