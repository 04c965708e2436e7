use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use super::reg::{FRNUM_COUNT, FRNUM_MASK};

/// Extends the 11-bit FRNUM register to a 64-bit frame count.
///
/// The low word is advanced with a compare-and-swap. Once it is within one
/// register period of wrapping, updates take the lock so the high word moves
/// exactly once.
pub struct FrameCounter {
    low: AtomicU32,
    high: AtomicU32,
    overflow_lock: Mutex<()>,
}

impl FrameCounter {
    pub const fn new() -> Self {
        Self {
            low: AtomicU32::new(0),
            high: AtomicU32::new(0),
            overflow_lock: Mutex::new(()),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_low(low: u32) -> Self {
        let counter = Self::new();
        counter.low.store(low, Ordering::Relaxed);
        counter
    }

    /// Value the FRNUM register should be restored to after a reset.
    pub fn register_value(&self) -> u32 {
        self.low.load(Ordering::Acquire) & FRNUM_MASK
    }

    /// Fold a fresh FRNUM reading into the counter and return the 64-bit frame.
    pub fn update(&self, read_frnum: impl Fn() -> u32) -> u64 {
        let new_low = if self.low.load(Ordering::Acquire) >= !FRNUM_MASK {
            let _guard = self.overflow_lock.lock();
            let last = self.low.load(Ordering::Acquire);
            let overflow = last & !FRNUM_MASK;
            let this_frame = read_frnum() & FRNUM_MASK;
            let new_low = if last & FRNUM_MASK <= this_frame {
                overflow + this_frame
            } else {
                self.high.fetch_add(1, Ordering::AcqRel);
                let new_low = overflow.wrapping_add(this_frame).wrapping_add(FRNUM_COUNT);
                debug!("64-bit frame number overflow (low {new_low:#x})");
                new_low
            };
            self.low.store(new_low, Ordering::Release);
            new_low
        } else {
            loop {
                let last = self.low.load(Ordering::Acquire);
                let overflow = last & !FRNUM_MASK;
                let this_frame = read_frnum() & FRNUM_MASK;
                let new_low = if last & FRNUM_MASK <= this_frame {
                    overflow + this_frame
                } else {
                    trace!("11-bit frame number overflow");
                    overflow + this_frame + FRNUM_COUNT
                };
                if self
                    .low
                    .compare_exchange(last, new_low, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break new_low;
                }
            }
        };
        ((self.high.load(Ordering::Acquire) as u64) << 32) | new_low as u64
    }
}

impl Default for FrameCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follows_register_within_period() {
        let counter = FrameCounter::new();
        assert_eq!(counter.update(|| 5), 5);
        assert_eq!(counter.update(|| 700), 700);
        assert_eq!(counter.register_value(), 700);
    }

    #[test]
    fn eleven_bit_wrap_is_monotonic() {
        let counter = FrameCounter::new();
        assert_eq!(counter.update(|| 0x7F0), 0x7F0);
        assert_eq!(counter.update(|| 0x010), 0x810);
        assert_eq!(counter.update(|| 0x7FF), 0xFFF);
        assert_eq!(counter.update(|| 0x000), 0x1000);
    }

    #[test]
    fn thirty_two_bit_wrap_bumps_high_word() {
        let counter = FrameCounter::with_low(0xFFFF_FFF0);
        let before = counter.update(|| 0x7F8);
        assert_eq!(before, 0xFFFF_FFF8);
        let after = counter.update(|| 0x002);
        assert_eq!(after, 0x1_0000_0002);
        assert!(after > before);
    }
}
