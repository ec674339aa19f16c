use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use log::error;

use crate::event::{EventType, KEvent};
use crate::status::DriverStatus;

/// Keeps a device from going away while I/O on it is in flight.
///
/// Every path that touches the device takes the lock with [`acquire`] and
/// gives it back with [`release`]. The removal path calls
/// [`release_and_wait`], after which new acquisitions fail with
/// `DeletePending` and the caller blocks until the last holder is gone.
///
/// [`acquire`]: RemoveLock::acquire
/// [`release`]: RemoveLock::release
/// [`release_and_wait`]: RemoveLock::release_and_wait
#[derive(Debug)]
pub struct RemoveLock {
    removed: AtomicBool,
    io_count: AtomicI32,
    remove_event: KEvent,
}

impl RemoveLock {
    pub fn new() -> Self {
        Self {
            removed: AtomicBool::new(false),
            io_count: AtomicI32::new(0),
            remove_event: KEvent::new(EventType::Notification, false),
        }
    }

    pub fn acquire(&self) -> Result<(), DriverStatus> {
        self.io_count.fetch_add(1, Ordering::SeqCst);
        if self.removed.load(Ordering::SeqCst) {
            if self.io_count.fetch_sub(1, Ordering::SeqCst) == 1 {
                self.remove_event.set();
            }
            return Err(DriverStatus::DeletePending);
        }
        Ok(())
    }

    pub fn release(&self) {
        let left = self.io_count.fetch_sub(1, Ordering::SeqCst) - 1;
        if left == 0 && self.removed.load(Ordering::SeqCst) {
            self.remove_event.set();
        } else if left < 0 {
            error!("remove lock {:p} released more often than acquired", self);
        }
    }

    /// Marks the lock removed, drops the caller's own acquisition and waits
    /// for every other holder to release.
    pub fn release_and_wait(&self) {
        self.removed.store(true, Ordering::SeqCst);
        let left = self.io_count.fetch_sub(1, Ordering::SeqCst) - 1;
        if left == 0 {
            self.remove_event.set();
        } else if left < 0 {
            error!("remove lock {:p} is not acquired", self);
        } else {
            self.remove_event.wait();
        }
    }

    #[inline]
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn io_count(&self) -> i32 {
        self.io_count.load(Ordering::SeqCst)
    }
}

impl Default for RemoveLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removal_refuses_new_holders() {
        let lock = RemoveLock::new();
        assert_eq!(lock.acquire(), Ok(()));
        lock.release();
        assert_eq!(lock.acquire(), Ok(()));
        assert_eq!(lock.io_count(), 1);

        lock.release_and_wait();
        assert!(lock.is_removed());
        assert_eq!(lock.io_count(), 0);
        assert_eq!(lock.acquire(), Err(DriverStatus::DeletePending));
        assert_eq!(lock.io_count(), 0);
    }
}
