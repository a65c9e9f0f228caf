use std::fmt::{Debug, Formatter};
use std::num::NonZeroU16;

use crate::util::name_of;

/// Attribute handle ([Vol 3] Part F, Section 3.2.2). Handle 0 is reserved,
/// so `Option<Handle>` carries a possibly-absent handle in two bytes.
#[derive(
    Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
#[repr(transparent)]
#[serde(transparent)]
pub struct Handle(NonZeroU16);

impl Handle {
    pub const MIN: Self = Self(NonZeroU16::MIN);
    pub const MAX: Self = Self(NonZeroU16::MAX);

    /// Returns `None` for the reserved handle 0.
    #[inline]
    #[must_use]
    pub const fn new(h: u16) -> Option<Self> {
        match NonZeroU16::new(h) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Returns the following handle, or `None` after 0xFFFF.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        self.add(1)
    }

    /// Returns `self + n`, or `None` on overflow.
    #[inline]
    #[must_use]
    pub const fn add(self, n: u16) -> Option<Self> {
        match self.0.checked_add(n) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }
}

impl Debug for Handle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({:#06X})", name_of!(Handle), self.0.get())
    }
}

crate::impl_display_via_debug! { Handle }

impl From<Handle> for u16 {
    #[inline]
    fn from(h: Handle) -> Self {
        h.0.get()
    }
}

/// Non-empty inclusive handle range, as carried by the discovery requests.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[must_use]
pub struct HandleRange {
    start: Handle,
    end: Handle,
}

impl HandleRange {
    /// `0x0001..=0xFFFF`.
    pub const ALL: Self = Self {
        start: Handle::MIN,
        end: Handle::MAX,
    };

    /// Creates the range `start..=end`.
    ///
    /// # Panics
    ///
    /// Panics if `start > end`.
    #[inline]
    pub const fn new(start: Handle, end: Handle) -> Self {
        assert!(start.0.get() <= end.0.get());
        Self { start, end }
    }

    /// Validates a requested range. Returns `None` if `start` is 0 or greater
    /// than `end` ([Vol 3] Part F, Section 3.4.3.1).
    #[inline]
    #[must_use]
    pub const fn from_raw(start: u16, end: u16) -> Option<Self> {
        match (Handle::new(start), Handle::new(end)) {
            (Some(s), Some(e)) if start <= end => Some(Self { start: s, end: e }),
            _ => None,
        }
    }

    #[inline(always)]
    #[must_use]
    pub const fn start(self) -> Handle {
        self.start
    }

    #[inline(always)]
    #[must_use]
    pub const fn end(self) -> Handle {
        self.end
    }

    /// Returns whether `h` is within the range.
    #[inline]
    #[must_use]
    pub fn contains(&self, h: &Handle) -> bool {
        (self.start..=self.end).contains(h)
    }

    /// Returns whether the two ranges share at least one handle.
    #[inline]
    #[must_use]
    pub fn overlaps(self, other: Self) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn niche() {
        assert_eq!(std::mem::size_of::<Option<Handle>>(), 2);
        assert_eq!(format!("{}", Handle::new(0x2A).unwrap()), "Handle(0x002A)");
    }

    #[test]
    fn range() {
        assert_eq!(HandleRange::from_raw(0, 5), None);
        assert_eq!(HandleRange::from_raw(6, 5), None);
        let r = HandleRange::from_raw(5, 10).unwrap();
        assert_eq!(HandleRange::from_raw(7, 7).map(HandleRange::end), Handle::new(7));
        assert!(r.contains(&Handle::new(5).unwrap()));
        assert!(r.contains(&Handle::new(10).unwrap()));
        assert!(!r.contains(&Handle::new(11).unwrap()));
        assert!(r.overlaps(HandleRange::from_raw(10, 12).unwrap()));
        assert!(!r.overlaps(HandleRange::from_raw(11, 12).unwrap()));
        assert_eq!(Handle::MAX.next(), None);
        assert_eq!(Handle::MIN.add(4), Handle::new(5));
        assert_eq!(Handle::new(0xFFFE).unwrap().add(2), None);
    }
}
