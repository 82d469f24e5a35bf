use std::time::Duration;

use tokio::time::Instant;

/// Single-shot deadline stored inside the control block that owns it. Freeing
/// the block drops the deadline, so an expiration can never be delivered to a
/// freed structure.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(transparent)]
pub(super) struct Timer(Option<Instant>);

impl Timer {
    /// Arms the timer, replacing any existing deadline.
    #[inline]
    pub fn start(&mut self, timeout: Duration) {
        self.0 = Instant::now().checked_add(timeout);
    }

    /// Disarms the timer.
    #[inline(always)]
    pub fn stop(&mut self) {
        self.0 = None;
    }

    /// Returns the deadline of an armed timer.
    #[inline(always)]
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.0
    }

    /// Returns whether the timer is armed.
    #[inline(always)]
    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.0.is_some()
    }

    /// Disarms the timer and returns `true` if its deadline is at or before
    /// `now`.
    #[inline]
    pub fn take_expired(&mut self, now: Instant) -> bool {
        let exp = self.0.map_or(false, |t| t <= now);
        if exp {
            self.0 = None;
        }
        exp
    }
}
