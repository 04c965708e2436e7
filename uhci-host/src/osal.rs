use core::time::Duration;

/// Services the controller core needs from the surrounding kernel.
///
/// Handed to [`Uhci::new`](crate::Uhci::new) as a trait object, one per
/// controller, so each instance can run against its own clock.
pub trait Kernel: Send + Sync {
    /// Sleep or spin for at least `duration`.
    fn delay(&self, duration: Duration);

    /// Monotonic time since an arbitrary epoch, used to timestamp completions.
    fn now(&self) -> Duration;
}

/// Poll `condition` up to `tries` times, delaying `interval` between polls.
///
/// Returns the number of polls it took, or `None` if the condition never held.
pub(crate) fn poll_until(
    kernel: &dyn Kernel,
    tries: usize,
    interval: Duration,
    mut condition: impl FnMut() -> bool,
) -> Option<usize> {
    for i in 0..tries {
        if condition() {
            return Some(i);
        }
        kernel.delay(interval);
    }
    None
}
