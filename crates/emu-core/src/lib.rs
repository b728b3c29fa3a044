//! Core traits and types shared by the 6502 CPU drivers.
//!
//! A CPU driver (interpreter or JIT) owns the 6502 architectural state and
//! talks to the rest of the machine through two seams: the [`Bus`] for
//! memory and memory-mapped hardware, and the [`Timers`] sink for consumed
//! cycles and interrupt requests.

mod bus;
mod ticks;
mod timers;

pub use bus::{Bus, FlatBus};
pub use ticks::Ticks;
pub use timers::{NullTimers, TimerAction, Timers};

/// Size of the 6502 address space in bytes.
pub const ADDR_SPACE_SIZE: usize = 0x1_0000;
