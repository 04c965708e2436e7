use core::ops::{Deref, DerefMut};

use spin::{Mutex, MutexGuard};

use super::reg::{RegIo, USBINTR};

/// State shared with the interrupt path.
///
/// USBINTR is cleared for as long as the guard lives, so the controller
/// cannot interrupt a CPU that is spinning on its own lock. The value found
/// in USBINTR on entry is written back on release, so a controller running
/// with interrupts disabled stays that way.
pub(crate) struct IrqLock<T> {
    data: Mutex<T>,
}

impl<T> IrqLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            data: Mutex::new(data),
        }
    }

    pub fn lock<'a>(&'a self, io: &'a dyn RegIo) -> IrqLockGuard<'a, T> {
        let mask = IntrMask::save(io);
        IrqLockGuard {
            data: self.data.lock(),
            _mask: mask,
        }
    }

    /// Exclusive access proves nothing else can reach the data.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

/// Fields drop in order: the lock goes first, interrupts come back after.
pub(crate) struct IrqLockGuard<'a, T> {
    data: MutexGuard<'a, T>,
    _mask: IntrMask<'a>,
}

impl<T> Deref for IrqLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T> DerefMut for IrqLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.data
    }
}

struct IntrMask<'a> {
    io: &'a dyn RegIo,
    saved: u16,
}

impl<'a> IntrMask<'a> {
    fn save(io: &'a dyn RegIo) -> Self {
        let saved = io.read16(USBINTR);
        if saved != 0 {
            io.write16(USBINTR, 0);
        }
        Self { io, saved }
    }
}

impl Drop for IntrMask<'_> {
    fn drop(&mut self) {
        if self.saved != 0 {
            self.io.write16(USBINTR, self.saved);
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicU16, Ordering};

    use super::*;

    #[derive(Default)]
    struct IntrIo {
        intr: AtomicU16,
        writes: spin::Mutex<Vec<u16>>,
    }

    impl RegIo for IntrIo {
        fn read8(&self, _offset: u16) -> u8 {
            0
        }
        fn read16(&self, offset: u16) -> u16 {
            if offset == USBINTR { self.intr.load(Ordering::SeqCst) } else { 0 }
        }
        fn read32(&self, _offset: u16) -> u32 {
            0
        }
        fn write8(&self, _offset: u16, _value: u8) {}
        fn write16(&self, offset: u16, value: u16) {
            if offset == USBINTR {
                self.intr.store(value, Ordering::SeqCst);
                self.writes.lock().push(value);
            }
        }
        fn write32(&self, _offset: u16, _value: u32) {}
    }

    #[test]
    fn interrupts_are_masked_while_held() {
        let io = IntrIo::default();
        io.intr.store(0x0F, Ordering::SeqCst);
        let lock = IrqLock::new(0u32);
        {
            let mut guard = lock.lock(&io);
            *guard += 1;
            assert_eq!(io.intr.load(Ordering::SeqCst), 0);
        }
        assert_eq!(io.intr.load(Ordering::SeqCst), 0x0F);
        assert_eq!(*io.writes.lock(), [0, 0x0F]);
        assert_eq!(*lock.lock(&io), 1);
    }

    #[test]
    fn a_stopped_controller_stays_masked() {
        let io = IntrIo::default();
        let lock = IrqLock::new(());
        drop(lock.lock(&io));
        assert_eq!(io.intr.load(Ordering::SeqCst), 0);
        assert!(io.writes.lock().is_empty());
    }

    #[test]
    fn the_lock_is_free_before_interrupts_return() {
        let io = IntrIo::default();
        io.intr.store(0x05, Ordering::SeqCst);
        let lock = IrqLock::new(());
        let guard = lock.lock(&io);
        assert!(lock.data.is_locked());
        drop(guard);
        assert!(!lock.data.is_locked());
        assert_eq!(io.intr.load(Ordering::SeqCst), 0x05);
    }
}
