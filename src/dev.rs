//! Device numbers and the ranges registered over them.

use std::fmt;

use crate::error::RegistryError;

/// Number of low bits holding the minor number.
pub const MINOR_BITS: u32 = 20;
/// Mask selecting the minor number.
pub const MINOR_MASK: u32 = (1 << MINOR_BITS) - 1;
/// Largest representable major number.
pub const MAX_MAJOR: u32 = u32::MAX >> MINOR_BITS;

/// A device number: 12-bit major over a 20-bit minor.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DevId(pub u32);

impl DevId {
    /// Build a device number from its parts. Out-of-range bits are masked.
    #[inline]
    pub const fn new(major: u32, minor: u32) -> Self {
        Self(((major & MAX_MAJOR) << MINOR_BITS) | (minor & MINOR_MASK))
    }

    #[inline]
    pub const fn major(self) -> u32 {
        self.0 >> MINOR_BITS
    }

    #[inline]
    pub const fn minor(self) -> u32 {
        self.0 & MINOR_MASK
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl From<u32> for DevId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for DevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major(), self.minor())
    }
}

impl fmt::Display for DevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major(), self.minor())
    }
}

/// A contiguous run of device numbers `[low, low + span)`.
///
/// `span` is always at least one and the last number never wraps past
/// `u32::MAX`. Two keys are equal only when both `low` and `span` match;
/// that exact equality is what deregistration compares against.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RangeKey {
    low: DevId,
    span: u32,
}

impl RangeKey {
    pub fn new(low: DevId, span: u32) -> Result<Self, RegistryError> {
        if span == 0 || low.0.checked_add(span - 1).is_none() {
            return Err(RegistryError::InvalidRange { low, span });
        }
        Ok(Self { low, span })
    }

    #[inline]
    pub fn low(self) -> DevId {
        self.low
    }

    #[inline]
    pub fn span(self) -> u32 {
        self.span
    }

    /// Last device number covered (inclusive).
    #[inline]
    pub fn last(self) -> DevId {
        DevId(self.low.0 + (self.span - 1))
    }

    #[inline]
    pub fn contains(self, id: DevId) -> bool {
        self.low <= id && id <= self.last()
    }

    /// Position of `id` inside the range. Only meaningful when `contains(id)`.
    #[inline]
    pub fn offset_of(self, id: DevId) -> u32 {
        debug_assert!(self.contains(id));
        id.0 - self.low.0
    }
}

impl fmt::Debug for RangeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}, +{})", self.low, self.span)
    }
}
