//! Tick consumer interface.

use crate::Ticks;

/// What the timer subsystem wants the CPU driver to do after consuming a
/// batch of cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimerAction {
    /// New countdown value to load, if the next timer deadline moved.
    /// `None` leaves the countdown expired; the driver will not fire the
    /// timer again until the countdown is reloaded.
    pub reload: Option<i64>,

    /// Raise the IRQ line. The driver delivers the interrupt at the next
    /// instruction boundary, subject to the I flag.
    pub irq: bool,
}

/// Consumer of elapsed CPU cycles.
///
/// The CPU driver calls [`Timers::tick_timers`] whenever its countdown
/// crosses zero, passing the cycles consumed since the previous call. The
/// implementation advances video/sound/VIA state and reports back whether
/// to reload the countdown and whether an IRQ is now pending.
pub trait Timers {
    fn tick_timers(&mut self, consumed: Ticks) -> TimerAction;
}

/// A sink that counts invocations and never reloads. Tests use this to pin
/// down exactly when the timer trampoline fires.
#[derive(Debug, Default)]
pub struct NullTimers {
    pub fired: u32,
    pub consumed: Ticks,
}

impl Timers for NullTimers {
    fn tick_timers(&mut self, consumed: Ticks) -> TimerAction {
        self.fired += 1;
        self.consumed += consumed;
        TimerAction::default()
    }
}
