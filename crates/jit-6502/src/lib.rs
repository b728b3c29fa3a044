//! Dynamic binary translator for the MOS 6502.
//!
//! Recompiles 6502 machine code into translated form while preserving
//! single-cycle timing and coping transparently with self-modifying code.
//! The design hinges on one decision: a fixed-size code slot per 6502
//! address, making "jump to arbitrary PC" pure arithmetic and
//! sub-instruction entry a block split rather than a recompile-the-world
//! event.
//!
//! The pipeline is decoder -> optimiser -> backend emitter, over
//! straight-line blocks. Three backends share the slot layout. The
//! driver executes slot content through its record interpreter, so the
//! portable record backend is the one the driver will accept and the one
//! every test runs end to end. The x86-64 and ARM64 backends are
//! machine-code *emitters*: their output is checked by inspection, and
//! [`Jit::with_backend`] refuses them rather than misread their bytes as
//! records. Writes into translated bytes plant a trap over the affected
//! code through the write-notification channel; chronically rewritten
//! instructions get promoted to dynamic forms that re-fetch their bytes
//! at run time and need no further invalidation.
//!
//! ```no_run
//! use emu_core::{FlatBus, NullTimers};
//! use jit_6502::{Jit, JitConfig};
//!
//! let mut bus = FlatBus::new();
//! bus.load(0x1000, &[0xA9, 0x42, 0x02]); // LDA #$42; exit
//! let mut jit = Jit::new(JitConfig::default())?;
//! jit.registers_mut().pc = 0x1000;
//! jit.set_countdown(1_000_000);
//! jit.enter(&mut bus, &mut NullTimers::default());
//! assert_eq!(jit.registers().a, 0x42);
//! # Ok::<(), jit_6502::JitError>(())
//! ```

pub mod arena;
pub mod backend;
mod compile;
pub mod config;
pub mod decode;
mod dispatch;
mod engine;
mod exec;
pub mod metadata;
pub mod optimize;
pub mod stats;
pub mod uop;

pub use config::{ConfigError, JitConfig};
pub use dispatch::{ExitReason, Jit};

use thiserror::Error;

/// Unrecoverable driver errors. Translation problems never surface here;
/// they degrade to interpreter indirections instead.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JitError {
    #[error("code arena allocation failed")]
    ArenaAlloc,
    #[error("backend codegen preconditions not met")]
    BackendPreconditions,
    #[error("backend output is not executable by this driver")]
    BackendNotExecutable,
}
