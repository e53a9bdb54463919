//! Two-axis request cost vectors.
//!
//! A ticket describes what one request costs the device on two orthogonal
//! axes: `weight` counts against the operations-per-second envelope and
//! `size` against the bytes-per-second envelope. A queue that admits one
//! request of weight 1 and size 16 KiB per second sustains 1 IOPS at
//! 16 KiB/s.
//!
//! Upper layers pre-scale the `size` axis by their read/write multipliers
//! before handing a ticket to the scheduler; the constants below fix the
//! scaling conventions so that tickets produced on different shards are
//! comparable.

use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// Base count one read request is scaled by when building tickets.
///
/// Write requests that are, say, 30% more expensive than reads are accounted
/// as `(READ_REQUEST_BASE_COUNT * 130) / 100`, keeping the multiplier math in
/// integers.
pub const READ_REQUEST_BASE_COUNT: u32 = 128;

/// Shift applied to request lengths when computing the ticket `size` axis.
pub const REQUEST_TICKET_SIZE_SHIFT: u32 = 9;

/// Smallest request length, in bytes, the ticket scaling accounts for.
pub const MINIMAL_REQUEST_SIZE: u32 = 512;

/// The cost of one request on the IOPS-like and bandwidth-like axes.
///
/// Tickets are additive: accounting sums them component-wise. A ticket is
/// zero iff both components are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IoTicket {
    weight: u32,
    size: u32,
}

impl IoTicket {
    /// Creates a ticket with the given per-op `weight` and pre-scaled `size`.
    #[must_use]
    pub const fn new(weight: u32, size: u32) -> Self {
        Self { weight, size }
    }

    /// Returns the weight (per-op) component.
    #[must_use]
    pub const fn weight(self) -> u32 {
        self.weight
    }

    /// Returns the size (per-byte) component.
    #[must_use]
    pub const fn size(self) -> u32 {
        self.size
    }

    /// Returns true iff both components are zero.
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.weight == 0 && self.size == 0
    }

    /// Returns true iff both components are non-zero.
    ///
    /// This is the validity test for a normalization axis, which must not
    /// have either component set to zero.
    #[must_use]
    pub const fn is_non_zero(self) -> bool {
        self.weight > 0 && self.size > 0
    }

    /// Returns the normalized value of this ticket along a base `axis`.
    ///
    /// The result is the sum of the per-axis ratios, so a request that is
    /// large on both axes costs more than one that is large on a single
    /// axis. Either component of `self` may be zero, in which case only the
    /// other one contributes.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if `axis` has a zero component.
    #[must_use]
    pub fn normalize(self, axis: Self) -> f64 {
        debug_assert!(axis.is_non_zero(), "normalization axis has a zero component");
        f64::from(self.weight) / f64::from(axis.weight) + f64::from(self.size) / f64::from(axis.size)
    }
}

impl Add for IoTicket {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self::new(self.weight + other.weight, self.size + other.size)
    }
}

impl AddAssign for IoTicket {
    fn add_assign(&mut self, other: Self) {
        self.weight += other.weight;
        self.size += other.size;
    }
}

impl Sub for IoTicket {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        Self::new(self.weight - other.weight, self.size - other.size)
    }
}

impl SubAssign for IoTicket {
    fn sub_assign(&mut self, other: Self) {
        self.weight -= other.weight;
        self.size -= other.size;
    }
}

impl fmt::Display for IoTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.weight, self.size)
    }
}

/// For both axes, checks if the first value is ahead of the second and
/// returns the difference; a component that is behind yields zero.
///
/// The subtraction is interpreted through signed 32-bit arithmetic, so
/// callers comparing wrapped counters get the expected "ahead of" window.
#[must_use]
#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)] // Signed reinterpretation is the point.
pub fn wrapping_difference(a: IoTicket, b: IoTicket) -> IoTicket {
    IoTicket::new(
        (a.weight.wrapping_sub(b.weight) as i32).max(0) as u32,
        (a.size.wrapping_sub(b.size) as i32).max(0) as u32,
    )
}
