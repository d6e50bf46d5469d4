use std::{fmt, ops};

/// Selects which properties of a parent call a child call inherits
///
/// ```
/// # use tether_proto::PropagationMask;
/// let mask = PropagationMask::DEADLINE | PropagationMask::CANCELLATION;
/// assert!(mask.contains(PropagationMask::DEADLINE));
/// assert!(!mask.contains(PropagationMask::CENSUS_TRACING));
/// assert!(PropagationMask::DEFAULTS.contains(mask));
/// ```
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct PropagationMask(u32);

impl PropagationMask {
    /// Inherit nothing
    pub const NONE: Self = Self(0);
    /// The child's deadline is capped by the parent's
    pub const DEADLINE: Self = Self(0x1);
    /// The child's stats are attributed to the parent's context
    pub const CENSUS_STATS: Self = Self(0x2);
    /// The child joins the parent's trace
    pub const CENSUS_TRACING: Self = Self(0x4);
    /// Cancelling the parent cancels the child
    pub const CANCELLATION: Self = Self(0x8);
    /// Every propagable property
    pub const DEFAULTS: Self = Self(
        Self::DEADLINE.0 | Self::CENSUS_STATS.0 | Self::CENSUS_TRACING.0 | Self::CANCELLATION.0,
    );

    /// Whether every bit in `other` is set in `self`
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw bit representation
    pub fn bits(self) -> u32 {
        self.0
    }
}

impl ops::BitOr for PropagationMask {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for PropagationMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for PropagationMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_set();
        for (bit, name) in [
            (Self::DEADLINE, "DEADLINE"),
            (Self::CENSUS_STATS, "CENSUS_STATS"),
            (Self::CENSUS_TRACING, "CENSUS_TRACING"),
            (Self::CANCELLATION, "CANCELLATION"),
        ] {
            if self.contains(bit) {
                list.entry(&format_args!("{name}"));
            }
        }
        list.finish()
    }
}
