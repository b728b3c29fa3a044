//! Invalidation engine.
//!
//! A write into bytes covered by a live block must plant the self-modify
//! trap over that code before any subsequent fetch from it. The
//! write-notification channel is what feeds this requirement: every store
//! issued by translated records, by the interpreter fallback, and by
//! collaborators that intercept writes themselves lands in [`on_write`],
//! which plants the trap and books the statistics that drive dynamic
//! promotion. A host-fault channel for natively executing code would
//! terminate here too; until that path exists, this is the whole story.

use emu_core::{ADDR_SPACE_SIZE, Bus};
use log::{debug, trace};

use crate::arena::Arena;
use crate::backend::Backend;
use crate::metadata::{Metadata, NO_BLOCK};
use crate::stats::Stats;

/// A write landed on `addr`. Plant the trap and book the statistics that
/// drive dynamic promotion. Step 2 of the fault-handler contract.
pub fn on_write(
    metadata: &mut Metadata,
    arena: &mut Arena,
    stats: &mut Stats,
    backend: &dyn Backend,
    addr: u16,
) {
    let ptr = metadata.jit_ptr(addr);
    if Metadata::is_no_code(ptr) {
        return;
    }
    if Metadata::is_dynamic(ptr) {
        // Dynamic bytes are re-fetched at run time; writes are free.
        return;
    }
    let block = metadata.code_block(addr);
    if block == NO_BLOCK {
        return;
    }

    let seq = backend.invalidation_sequence();
    let at = ptr as usize;
    arena.bytes_mut()[at..at + seq.len()].copy_from_slice(seq);

    // An instruction-start byte's pointer is its own slot base; anything
    // else is an operand byte (or a merged follower).
    let is_opcode_byte = ptr == crate::arena::slot_offset(addr);
    stats.count_invalidation(addr, is_opcode_byte);
    stats.count_block_invalidation(block as u16);

    trace!(
        "invalidated code at ${addr:04X} (block ${block:04X}, {} byte)",
        if is_opcode_byte { "opcode" } else { "operand" }
    );
}

/// Plant the trap over a block's entry slot so the next entry recompiles.
/// Used by block splitting.
pub fn invalidate_block_entry(arena: &mut Arena, backend: &dyn Backend, block: u16) {
    let seq = backend.invalidation_sequence();
    let at = crate::arena::slot_offset(block) as usize;
    arena.bytes_mut()[at..at + seq.len()].copy_from_slice(seq);
}

/// Walk the jit-pointer table rewriting entries that still point at stale
/// invalidated stubs back to no-code, clearing block ownership with them.
pub fn cleanup_stale(metadata: &mut Metadata, arena: &Arena, backend: &dyn Backend) {
    let mut cleared = 0u32;
    for addr in 0..ADDR_SPACE_SIZE as u32 {
        let addr = addr as u16;
        let ptr = metadata.jit_ptr(addr);
        if Metadata::is_no_code(ptr) || Metadata::is_dynamic(ptr) {
            continue;
        }
        let at = ptr as usize;
        if backend.is_invalidated_at(&arena.bytes()[at..at + 4]) {
            metadata.make_no_code(addr);
            metadata.set_code_block(addr, NO_BLOCK);
            cleared += 1;
        }
    }
    debug!("cleanup: {cleared} stale entries rewritten to no-code");
}

/// Revoke every translation: all pointers back to no-code, all blocks
/// cleared, all counters zeroed, every slot refilled with trap filler.
/// The arena itself is never freed or moved.
pub fn flush_all(
    metadata: &mut Metadata,
    arena: &mut Arena,
    stats: &mut Stats,
    backend: &dyn Backend,
) {
    metadata.clear();
    stats.clear();
    let slot = crate::arena::SLOT_SIZE;
    let bytes = arena.bytes_mut();
    for chunk in bytes.chunks_exact_mut(slot) {
        backend.fill_with_trap(chunk);
    }
    debug!("cache flush: all translations revoked");
}

/// A bus wrapper that feeds interpreter-issued writes into the
/// invalidation engine. The interpreter fallback runs against this, so an
/// instruction executed out of line still honours the self-modify
/// contract.
pub struct NotifyBus<'a, B: Bus> {
    pub bus: &'a mut B,
    pub metadata: &'a mut Metadata,
    pub arena: &'a mut Arena,
    pub stats: &'a mut Stats,
    pub backend: &'a dyn Backend,
}

impl<B: Bus> Bus for NotifyBus<'_, B> {
    fn mem(&self) -> &[u8; ADDR_SPACE_SIZE] {
        self.bus.mem()
    }

    fn mem_mut(&mut self) -> &mut [u8; ADDR_SPACE_SIZE] {
        self.bus.mem_mut()
    }

    fn is_special(&self, address: u16) -> bool {
        self.bus.is_special(address)
    }

    fn special_read(&mut self, address: u16) -> u8 {
        self.bus.special_read(address)
    }

    fn special_write(&mut self, address: u16, value: u8) {
        self.bus.special_write(address, value);
    }

    fn is_rom(&self, address: u16) -> bool {
        self.bus.is_rom(address)
    }

    fn write(&mut self, address: u16, value: u8) {
        if self.is_special(address) {
            self.bus.special_write(address, value);
            return;
        }
        if self.is_rom(address) {
            return;
        }
        self.bus.mem_mut()[address as usize] = value;
        on_write(self.metadata, self.arena, self.stats, self.backend, address);
    }
}
