use std::fmt::{Debug, Display, Formatter};
use std::num::NonZeroU16;
use std::ops::{Bound, RangeBounds};

use crate::util::name_of;

/// Attribute handle ([Vol 3] Part F, Section 3.2.2).
#[derive(
    Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
#[repr(transparent)]
#[serde(transparent)]
pub struct Handle(NonZeroU16);

impl Handle {
    /// Lowest valid handle.
    pub const MIN: Self = match Self::new(0x0001) {
        Some(h) => h,
        None => unreachable!(),
    };
    /// Highest valid handle.
    pub const MAX: Self = match Self::new(0xFFFF) {
        Some(h) => h,
        None => unreachable!(),
    };

    /// Wraps a raw handle. Returns `None` if the handle is invalid.
    #[inline]
    #[must_use]
    pub const fn new(h: u16) -> Option<Self> {
        match NonZeroU16::new(h) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Returns the next handle or `None` if the maximum handle was reached.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        Self::new(self.0.get().wrapping_add(1))
    }

    /// Returns the handle `n` positions after `self` or `None` if it would
    /// exceed the handle space.
    #[inline]
    #[must_use]
    pub fn offset(self, n: usize) -> Option<Self> {
        (usize::from(self.0.get()).checked_add(n))
            .and_then(|v| u16::try_from(v).ok())
            .and_then(Self::new)
    }
}

impl Debug for Handle {
    #[allow(clippy::use_self)]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({:#06X})", name_of!(Handle), self.0.get())
    }
}

impl Display for Handle {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

impl From<Handle> for u16 {
    #[inline]
    fn from(h: Handle) -> Self {
        h.0.get()
    }
}

impl From<Handle> for usize {
    #[inline]
    fn from(h: Handle) -> Self {
        Self::from(h.0.get())
    }
}

/// Inclusive range of attribute handles. This is a `Copy` version of
/// `RangeInclusive<Handle>`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
#[must_use]
pub struct HandleRange {
    start: Handle,
    end: Handle,
}

impl HandleRange {
    /// Handle range that includes all possible handles.
    pub const ALL: Self = Self {
        start: Handle::MIN,
        end: Handle::MAX,
    };

    /// Creates a new handle range `start..=end`.
    ///
    /// # Panics
    ///
    /// Panics if `start > end`.
    #[inline]
    pub const fn new(start: Handle, end: Handle) -> Self {
        assert!(start.0.get() <= end.0.get());
        Self { start, end }
    }

    /// Creates a handle range from raw handles. Returns [`None`] if either
    /// handle is invalid or the range is empty.
    #[inline]
    #[must_use]
    pub const fn try_new(start: u16, end: u16) -> Option<Self> {
        match (Handle::new(start), Handle::new(end)) {
            (Some(s), Some(e)) if start <= end => Some(Self { start: s, end: e }),
            _ => None,
        }
    }

    /// Returns the starting handle.
    #[inline(always)]
    #[must_use]
    pub const fn start(self) -> Handle {
        self.start
    }

    /// Returns the ending handle.
    #[inline(always)]
    #[must_use]
    pub const fn end(self) -> Handle {
        self.end
    }

    /// Returns the number of handles in the range.
    #[inline]
    #[must_use]
    pub const fn len(self) -> usize {
        (self.end.0.get() - self.start.0.get()) as usize + 1
    }

    /// Returns whether the range contains handle `h`.
    #[inline]
    #[must_use]
    pub fn contains_handle(self, h: Handle) -> bool {
        self.start <= h && h <= self.end
    }

    /// Returns whether two ranges share at least one handle.
    #[inline]
    #[must_use]
    pub fn overlaps(self, other: Self) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Returns the remaining range after handle `h` or [`None`] if `h` is the
    /// last handle of the range.
    #[inline]
    #[must_use]
    pub fn after(self, h: Handle) -> Option<Self> {
        let next = h.next()?;
        (next <= self.end).then(|| Self::new(next.max(self.start), self.end))
    }
}

impl RangeBounds<Handle> for HandleRange {
    #[inline]
    fn start_bound(&self) -> Bound<&Handle> {
        Bound::Included(&self.start)
    }

    #[inline]
    fn end_bound(&self) -> Bound<&Handle> {
        Bound::Included(&self.end)
    }
}

impl Default for HandleRange {
    /// Returns a handle range that includes all possible handles.
    #[inline(always)]
    fn default() -> Self {
        Self::ALL
    }
}
