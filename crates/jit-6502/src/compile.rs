//! Block compilation: decode, optimise, emit, install.
//!
//! Also owns block splitting. When compilation is requested for an
//! address in the middle of an existing block, the old block is truncated
//! (its entry slot trapped so the next entry recompiles it shorter) and a
//! new block starts at the requested address. This is what keeps entry
//! into previously-compiled regions cheap.

use emu_core::{Bus, Timers};
use log::{debug, trace};

use crate::arena::slot_offset;
use crate::backend::{BranchKind, CapacityError, EmitCtx};
use crate::decode::{Block, decode_block};
use crate::engine;
use crate::exec::Machine;
use crate::metadata::NO_BLOCK;
use crate::optimize::optimize_block;
use crate::uop::Uop;

/// Compile (or recompile) a block starting at `pc` and install it.
pub fn compile_block<BUS: Bus, T: Timers>(m: &mut Machine<'_, BUS, T>, pc: u16) {
    // Split: `pc` sits inside another block.
    let owner = m.metadata.code_block(pc);
    if owner != NO_BLOCK && owner != i32::from(pc) {
        m.metadata.clear_block_from(owner, pc);
        engine::invalidate_block_entry(m.arena, m.backend, owner as u16);
        debug!("block ${owner:04X} split at ${pc:04X}");
    }
    // Recompile: clear our own previous extent so a shorter decode does
    // not leave stale ownership behind.
    if m.metadata.code_block(pc) == i32::from(pc) {
        m.metadata.clear_block_from(i32::from(pc), pc);
    }

    let mut block = decode_block(m.bus, m.metadata, m.stats, m.config, pc);
    let backend = m.backend;
    let supports = |u: &Uop| backend.supports_uop(u);
    let special = |a: u16| m.bus.is_special(a);
    optimize_block(&mut block, m.config, &supports, &special);

    emit_block(m, &block);
    install_metadata(m, &block);

    m.stats.compiles += 1;
    trace!(
        "compiled block ${pc:04X}: {} instructions, ends ${:04X}",
        block.instrs.len(),
        block.end()
    );
}

/// True when `target` is a directly enterable instruction start within
/// this block: compiled, and not merged away into a predecessor.
fn in_block_entry(block: &Block, target: u16) -> bool {
    block.instrs.iter().any(|i| i.addr == target && !i.merged)
}

fn emit_block<BUS: Bus, T: Timers>(m: &mut Machine<'_, BUS, T>, block: &Block) {
    let accurate = m.config.accurate_cycles;
    let debug_mode = m.config.debug;

    for (idx, instr) in block.instrs.iter().enumerate() {
        if instr.merged {
            // A merged instruction's slot holds a continuation into the
            // slot after its group, preserving "any PC has a slot".
            let next = next_unmerged_addr(block, idx);
            let slot = m.arena.slot_mut(instr.addr);
            m.backend.fill_with_trap(slot);
            let mut ctx = EmitCtx::new(slot, instr.addr, accurate);
            let _ = match next {
                Some(addr) => m.backend.emit_jump_to_slot(&mut ctx, slot_offset(addr)),
                None => Ok(()),
            };
            continue;
        }

        let fallthrough = group_end_addr(block, idx);
        let result = emit_instr(m, block, instr, fallthrough, accurate, debug_mode);
        if result.is_err() {
            // Translation capacity: the slot gets the long-form
            // interpreter indirection instead. Never fatal.
            let addr = instr.addr;
            let slot = m.arena.slot_mut(addr);
            m.backend.fill_with_trap(slot);
            let mut ctx = EmitCtx::new(slot, addr, accurate);
            let _ = m.backend.emit(&mut ctx, &Uop::Interp { addr });
            debug!("slot overflow at ${addr:04X}; interpreter indirection");
        }
    }
}

/// First address past an instruction and its merged followers.
fn group_end_addr(block: &Block, idx: usize) -> u32 {
    let mut end = u32::from(block.instrs[idx].addr) + u32::from(block.instrs[idx].len);
    for follower in &block.instrs[idx + 1..] {
        if !follower.merged {
            break;
        }
        end = u32::from(follower.addr) + u32::from(follower.len);
    }
    end
}

/// The next unmerged instruction after `idx`, if any.
fn next_unmerged_addr(block: &Block, idx: usize) -> Option<u16> {
    block.instrs[idx + 1..]
        .iter()
        .find(|i| !i.merged)
        .map(|i| i.addr)
}

fn emit_instr<BUS: Bus, T: Timers>(
    m: &mut Machine<'_, BUS, T>,
    block: &Block,
    instr: &crate::decode::DecodedInstr,
    fallthrough: u32,
    accurate: bool,
    debug_mode: bool,
) -> Result<(), CapacityError> {
    let addr = instr.addr;
    let backend = m.backend;
    let block_end = block.end();

    let slot = m.arena.slot_mut(addr);
    backend.fill_with_trap(slot);
    let mut ctx = EmitCtx::new(slot, addr, accurate);

    if debug_mode {
        backend.emit(&mut ctx, &Uop::DebugTrap { addr })?;
    }
    if instr.cycles > 0 {
        backend.emit(&mut ctx, &Uop::Countdown { addr, cost: instr.cycles })?;
    }

    let mut terminal = false;
    for uop in &instr.uops {
        match *uop {
            Uop::Branch { target, .. } => {
                let in_block = u32::from(target) < block_end
                    && target >= block.start
                    && in_block_entry(block, target);
                ctx.branch_kind = if in_block {
                    BranchKind::Slot(slot_offset(target))
                } else {
                    BranchKind::Dispatch
                };
                backend.emit(&mut ctx, uop)?;
            }
            Uop::Jump { target } => {
                let in_block = u32::from(target) < block_end
                    && target >= block.start
                    && in_block_entry(block, target);
                if in_block {
                    backend.emit_jump_to_slot(&mut ctx, slot_offset(target))?;
                } else {
                    backend.emit(&mut ctx, uop)?;
                }
                terminal = true;
            }
            _ => {
                backend.emit(&mut ctx, uop)?;
                terminal = terminal || uop.is_terminal()
                    || matches!(uop, Uop::Interp { .. });
            }
        }
    }

    if !terminal {
        // Fall through to the next instruction. Inside the block that is
        // a direct slot jump; past the end it goes through the
        // dispatcher, whose entry policy copes with foreign blocks.
        if fallthrough < block_end && fallthrough > u32::from(block.start) {
            backend.emit_jump_to_slot(&mut ctx, slot_offset(fallthrough as u16))?;
        } else {
            backend.emit_dispatch(&mut ctx, fallthrough as u16)?;
        }
    }
    Ok(())
}

fn install_metadata<BUS: Bus, T: Timers>(m: &mut Machine<'_, BUS, T>, block: &Block) {
    let start = i32::from(block.start);
    let mut owner = block.start;

    for instr in &block.instrs {
        if !instr.merged {
            owner = instr.addr;
        }
        let owner_off = slot_offset(owner);

        for k in 0..u16::from(instr.len) {
            let a = instr.addr.wrapping_add(k);
            m.metadata.set_code_block(a, start);
            if instr.dyn_opcode {
                // Every byte is re-fetched at run time; writes are free.
                m.metadata.make_dynamic(a);
            } else if k > 0 && instr.dyn_operand {
                m.metadata.make_dynamic(a);
            } else if k == 0 && !instr.merged {
                m.metadata.set_jit_ptr(a, slot_offset(instr.addr));
            } else {
                m.metadata.set_jit_ptr(a, owner_off);
            }
        }

        if !instr.merged && !instr.dyn_opcode {
            m.stats.record_compiled(instr.addr, instr.opcode);
        }
    }
}
