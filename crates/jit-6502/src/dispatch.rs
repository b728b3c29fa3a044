//! The JIT CPU driver: entry, dispatch and trampolines.
//!
//! `enter` is the single way in. It resolves the current PC to translated
//! code through the jit-pointer table, invoking the compiler for no-code
//! and invalidated entries, splitting blocks for entries that land inside
//! one, and then runs until the program exits, jams, or a trampoline hands
//! control back here. Translated slots execute through the record
//! interpreter in `exec`; the compile, interpreter-fallback, timer and
//! debug trampolines are the Rust functions this module and `exec` share.

use emu_6502::{Mos6502, Registers};
use emu_core::{Bus, Timers};
use log::debug;

use crate::arena::{Arena, slot_offset};
use crate::backend::{Backend, PortableBackend};
use crate::compile::compile_block;
use crate::config::JitConfig;
use crate::engine;
use crate::exec::{self, Machine, RunExit};
use crate::metadata::Metadata;
use crate::stats::Stats;
use crate::JitError;

/// Why `enter` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The exit opcode was reached; PC parks on it.
    Exited,
    /// A KIL opcode jammed the machine; reset required.
    Halted,
}

/// The recompiling 6502 CPU driver.
pub struct Jit {
    config: JitConfig,
    backend: Box<dyn Backend>,
    arena: Arena,
    metadata: Metadata,
    stats: Stats,
    cpu: Mos6502,
    countdown: i64,
    timer_armed: bool,
    irq_line: bool,
    last_sync: i64,
    halted: bool,
    debug_cb: Option<Box<dyn FnMut(&Registers)>>,
}

impl Jit {
    /// Create a driver with the portable backend.
    pub fn new(config: JitConfig) -> Result<Self, JitError> {
        Self::with_backend(config, Box::new(PortableBackend::new()))
    }

    /// Create a driver with an explicit backend.
    ///
    /// The driver executes slot content through its record interpreter,
    /// so only a backend whose output it can actually run is accepted.
    /// The emit-only machine-code backends are refused here rather than
    /// silently misread as records.
    pub fn with_backend(
        config: JitConfig,
        backend: Box<dyn Backend>,
    ) -> Result<Self, JitError> {
        if !backend.is_execution_enabled() {
            return Err(JitError::BackendNotExecutable);
        }
        backend.slot_preconditions_test()?;
        let mut arena = Arena::new()?;
        let slot = crate::arena::SLOT_SIZE;
        for chunk in arena.bytes_mut().chunks_exact_mut(slot) {
            backend.fill_with_trap(chunk);
        }
        debug!("jit: {} backend, slot size {slot}", backend.name());
        Ok(Self {
            config,
            backend,
            arena,
            metadata: Metadata::new(),
            stats: Stats::new(),
            cpu: Mos6502::new(),
            countdown: 0,
            timer_armed: true,
            irq_line: false,
            last_sync: 0,
            halted: false,
            debug_cb: None,
        })
    }

    /// The authoritative register copy at translation boundaries.
    #[must_use]
    pub fn registers(&self) -> Registers {
        self.cpu.regs
    }

    pub fn registers_mut(&mut self) -> &mut Registers {
        &mut self.cpu.regs
    }

    #[must_use]
    pub fn countdown(&self) -> i64 {
        self.countdown
    }

    /// Load the countdown and re-arm the timer check.
    pub fn set_countdown(&mut self, countdown: i64) {
        self.countdown = countdown;
        self.last_sync = countdown;
        self.timer_armed = true;
    }

    /// Drive the IRQ line level.
    pub fn set_irq(&mut self, level: bool) {
        self.irq_line = level;
    }

    /// Install the instruction-boundary debug callback (used when the
    /// `debug` option is on).
    pub fn set_debug_callback(&mut self, cb: Box<dyn FnMut(&Registers)>) {
        self.debug_cb = Some(cb);
    }

    #[must_use]
    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    /// Software write-notification: a collaborator stored to `addr`.
    pub fn memory_written(&mut self, addr: u16) {
        engine::on_write(
            &mut self.metadata,
            &mut self.arena,
            &mut self.stats,
            self.backend.as_ref(),
            addr,
        );
    }

    /// Plant the invalidation trap over the code implementing `addr`,
    /// without touching the promotion counters. Debugger-driven.
    pub fn invalidate_address(&mut self, addr: u16) {
        let ptr = self.metadata.jit_ptr(addr);
        if Metadata::is_no_code(ptr) || Metadata::is_dynamic(ptr) {
            return;
        }
        let seq = self.backend.invalidation_sequence();
        let at = ptr as usize;
        self.arena.bytes_mut()[at..at + seq.len()].copy_from_slice(seq);
    }

    /// Trap the entry slot of the block owning `addr`, forcing its next
    /// entry through the compiler.
    pub fn invalidate_block_at(&mut self, addr: u16) {
        let block = self.metadata.code_block(addr);
        if block >= 0 {
            engine::invalidate_block_entry(
                &mut self.arena,
                self.backend.as_ref(),
                block as u16,
            );
        }
    }

    /// Rewrite stale invalidated entries back to no-code.
    pub fn cleanup_stale(&mut self) {
        engine::cleanup_stale(&mut self.metadata, &self.arena, self.backend.as_ref());
    }

    /// Emulator reset: revoke all translations, zero all counters. The
    /// arena mapping itself is retained.
    pub fn reset(&mut self) {
        engine::flush_all(
            &mut self.metadata,
            &mut self.arena,
            &mut self.stats,
            self.backend.as_ref(),
        );
        self.halted = false;
        self.irq_line = false;
        self.timer_armed = true;
    }

    // Introspection, mirroring what the debugger and tests ask for.

    /// True if the address has any translation (even an invalidated one).
    #[must_use]
    pub fn has_code(&self, addr: u16) -> bool {
        !Metadata::is_no_code(self.metadata.jit_ptr(addr))
    }

    /// True if the address starts a live block.
    #[must_use]
    pub fn is_block_start(&self, addr: u16) -> bool {
        self.metadata.is_block_start(addr)
    }

    /// True if the address is marked dynamic (operand or opcode).
    #[must_use]
    pub fn is_dynamic(&self, addr: u16) -> bool {
        Metadata::is_dynamic(self.metadata.jit_ptr(addr))
    }

    /// True if the code implementing this address has been invalidated.
    #[must_use]
    pub fn has_invalidated_code(&self, addr: u16) -> bool {
        let ptr = self.metadata.jit_ptr(addr);
        if Metadata::is_no_code(ptr) {
            return false;
        }
        if Metadata::is_dynamic(ptr) {
            // Dynamic slots always read as self-modified.
            return true;
        }
        let at = ptr as usize;
        self.backend
            .is_invalidated_at(&self.arena.bytes()[at..at + 4])
    }

    /// True if the block-entry slot for this address holds the trap.
    #[must_use]
    pub fn jump_target_is_invalidated(&self, addr: u16) -> bool {
        let at = slot_offset(addr) as usize;
        self.backend
            .is_invalidated_at(&self.arena.bytes()[at..at + 4])
    }

    /// The owning block start for an address, or -1.
    #[must_use]
    pub fn block_from_6502(&self, addr: u16) -> i32 {
        self.metadata.code_block(addr)
    }

    /// The arena offset of the code implementing an address.
    #[must_use]
    pub fn code_ptr(&self, addr: u16) -> u32 {
        self.metadata.jit_ptr(addr)
    }

    /// Map a host position in the arena to the 6502 address whose uop
    /// covers it.
    #[must_use]
    pub fn host_pc_to_6502(&self, offset: u32) -> u16 {
        self.metadata.pc_from_host(offset)
    }

    #[must_use]
    pub fn compile_count(&self) -> u64 {
        self.stats.compiles
    }

    #[must_use]
    pub fn invalidation_count(&self, addr: u16) -> u32 {
        self.stats.invalidation_count(addr)
    }

    /// Run from the current PC until exit or jam.
    pub fn enter<BUS: Bus, T: Timers>(
        &mut self,
        bus: &mut BUS,
        timers: &mut T,
    ) -> ExitReason {
        if self.halted {
            return ExitReason::Halted;
        }

        let mut m = Machine {
            arena: &mut self.arena,
            metadata: &mut self.metadata,
            stats: &mut self.stats,
            backend: self.backend.as_ref(),
            config: &self.config,
            cpu: &mut self.cpu,
            bus,
            timers,
            countdown: &mut self.countdown,
            timer_armed: &mut self.timer_armed,
            irq_line: &mut self.irq_line,
            last_sync: &mut self.last_sync,
            debug_cb: &mut self.debug_cb,
        };

        loop {
            // Pending interrupt at a dispatch boundary.
            if *m.irq_line && !m.cpu.regs.p.is_set(emu_6502::flags::I) {
                let pc = m.cpu.regs.pc;
                let target = m.deliver_irq(pc);
                m.cpu.regs.pc = target;
            }

            let pc = m.cpu.regs.pc;
            let Some(entry) = resolve_entry(&mut m, pc) else {
                continue;
            };

            match exec::run(&mut m, entry) {
                RunExit::Trap(off) => {
                    // Self-modify or no-code trap: recover the 6502
                    // address from the host position and recompile.
                    let addr = m.metadata.pc_from_host(off);
                    m.cpu.regs.pc = addr;
                    compile_block(&mut m, addr);
                }
                RunExit::Dispatch(pc) => {
                    m.cpu.regs.pc = pc;
                }
                RunExit::Exit(pc) => {
                    m.cpu.regs.pc = pc;
                    return ExitReason::Exited;
                }
                RunExit::Halt(pc) => {
                    m.cpu.regs.pc = pc;
                    self.halted = true;
                    return ExitReason::Halted;
                }
            }
        }
    }
}

/// Entry policy: resolve a 6502 PC to a runnable arena offset, compiling
/// or splitting as needed. `None` means a compile happened and resolution
/// should be retried.
fn resolve_entry<BUS: Bus, T: Timers>(
    m: &mut Machine<'_, BUS, T>,
    pc: u16,
) -> Option<u32> {
    let ptr = m.metadata.jit_ptr(pc);

    if Metadata::is_no_code(ptr) {
        compile_block(m, pc);
        return None;
    }

    if Metadata::is_dynamic(ptr) {
        // A dynamic-opcode instruction at a block start executes from its
        // slot; a dynamic operand byte entered as a PC is a fresh
        // sub-instruction block.
        if m.metadata.is_block_start(pc) {
            return Some(slot_offset(pc));
        }
        compile_block(m, pc);
        return None;
    }

    // Invalidated code recompiles before entry.
    let at = ptr as usize;
    if m.backend.is_invalidated_at(&m.arena.bytes()[at..at + 4]) {
        compile_block(m, pc);
        return None;
    }

    if ptr == slot_offset(pc) {
        if m.metadata.is_block_start(pc) {
            return Some(ptr);
        }
        // An instruction boundary in the middle of a block: always split
        // so the entry gets code compiled for this exact entry point.
        compile_block(m, pc);
        return None;
    }

    // The pointer leads into an earlier slot: this PC was merged away or
    // is mid-instruction. Precise mode recompiles from here; fast mode
    // re-executes the whole covering uop.
    if m.config.sub_instruction {
        compile_block(m, pc);
        return None;
    }
    Some(ptr)
}
