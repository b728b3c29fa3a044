//! The fundamental unit of time in the emulator.

/// A count of CPU clock ticks.
///
/// All timing is expressed in 6502 CPU cycles. Drivers accumulate ticks as
/// instructions retire and hand them to the [`crate::Timers`] sink in
/// batches; the sink owns the translation to wall-clock or video time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Ticks(pub u64);

impl Ticks {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn new(count: u64) -> Self {
        Self(count)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Ticks remaining before a countdown of `countdown` expires; zero if
    /// the countdown has already gone negative.
    #[must_use]
    pub const fn from_countdown(countdown: i64) -> Self {
        if countdown > 0 {
            Self(countdown as u64)
        } else {
            Self(0)
        }
    }
}

impl core::ops::Add for Ticks {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl core::ops::AddAssign for Ticks {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl core::ops::Sub for Ticks {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl From<u64> for Ticks {
    fn from(count: u64) -> Self {
        Self(count)
    }
}
