//! Block optimiser.
//!
//! Rewrites the decoded uop stream: dead flag materialisations go away,
//! CLC/SEC fold into the following ADC/SBC, constant loads merge into
//! stores, repeated accumulator shifts coalesce, and known index registers
//! turn indexed addressing into absolute addressing.
//!
//! Every transformation is valid only along the block's fall-through path;
//! entries into the middle of a block go through the dispatcher, which
//! recompiles from the entry point rather than trusting optimised code.
//! No pass reorders memory accesses, changes the cycle total at any
//! instruction boundary, or changes the flags live at a block exit.

use crate::config::JitConfig;
use crate::decode::Block;
use crate::uop::{AluOp, Addr16, Cond, Imm8, Reg, Uop};

/// Passes run in a fixed order, then iterate to fixpoint with a bounded
/// cap; later passes expose work for earlier ones (dropping a dead flag
/// materialisation is what makes a load dead).
const MAX_PASS_ITERATIONS: u32 = 8;

pub fn optimize_block(
    block: &mut Block,
    config: &JitConfig,
    supports: &dyn Fn(&Uop) -> bool,
    is_special: &dyn Fn(u16) -> bool,
) {
    if !config.optimizing || config.debug {
        // Debug mode reports flags at every boundary; nothing is dead.
        return;
    }

    for _ in 0..MAX_PASS_ITERATIONS {
        let mut changed = false;
        changed |= fold_carry(block);
        changed |= propagate_known_index(block, is_special);
        changed |= eliminate_dead_loads(block);
        changed |= merge_store_imm(block, supports);
        changed |= coalesce_shifts(block);
        changed |= hoist_modes(block);
        changed |= trim_dead_flags(block);
        if !changed {
            break;
        }
    }
}

/// Index of the next instruction with any uops, skipping merged/empty ones.
fn next_live(block: &Block, from: usize) -> Option<usize> {
    (from..block.instrs.len()).find(|&i| !block.instrs[i].uops.is_empty())
}

/// CLC;ADC -> ADD and SEC;SBC -> SUB.
///
/// The arithmetic instruction need not be adjacent: the fold walks
/// forward over carry-neutral uops (loads, transfers, flag
/// materialisations) looking for the first uop that touches carry or can
/// leave the block carrying the folded-away value; only when that uop is
/// the matching ADC/SBC does the flag instruction go away.
fn fold_carry(block: &mut Block) -> bool {
    let mut changed = false;
    let mut i = 0;
    'outer: while i < block.instrs.len() {
        let want = match block.instrs[i].uops[..] {
            [Uop::SetC(false)] => Some((AluOp::Adc, AluOp::Add)),
            [Uop::SetC(true)] => Some((AluOp::Sbc, AluOp::Sub)),
            _ => None,
        };
        let Some((from_op, to_op)) = want else {
            i += 1;
            continue;
        };

        for j in i + 1..block.instrs.len() {
            for k in 0..block.instrs[j].uops.len() {
                let uop = block.instrs[j].uops[k];
                let exits = uop.is_terminal() || matches!(uop, Uop::Branch { .. });
                if !exits && !uop.reads_carry() && !uop.writes_carry() {
                    continue;
                }
                let matches_op = match uop {
                    Uop::AluImm { op, .. }
                    | Uop::AluMem { op, .. }
                    | Uop::AluScratch { op } => op == from_op,
                    _ => false,
                };
                if matches_op {
                    match &mut block.instrs[j].uops[k] {
                        Uop::AluImm { op, .. }
                        | Uop::AluMem { op, .. }
                        | Uop::AluScratch { op } => *op = to_op,
                        _ => unreachable!(),
                    }
                    block.instrs[i].uops.clear();
                    changed = true;
                }
                // Either folded, or something else consumes/escapes with
                // the carry first; both end this candidate.
                i += 1;
                continue 'outer;
            }
        }
        i += 1;
    }
    changed
}

/// Rewrite indexed addressing against a known X or Y to absolute form.
fn propagate_known_index(block: &mut Block, is_special: &dyn Fn(u16) -> bool) -> bool {
    let mut changed = false;
    let mut known_x: Option<u8> = None;
    let mut known_y: Option<u8> = None;

    for instr in &mut block.instrs {
        let mut rewrite: Option<(usize, u16, bool)> = None;
        for (k, uop) in instr.uops.iter().enumerate() {
            match *uop {
                Uop::ModeAbx { base: Addr16::Const(base) } => {
                    if let Some(x) = known_x {
                        let addr = base.wrapping_add(u16::from(x));
                        let crossed = addr & 0xFF00 != base & 0xFF00;
                        if !is_special(addr) {
                            rewrite = Some((k, addr, crossed));
                        }
                    }
                }
                Uop::ModeAby { base: Addr16::Const(base) } => {
                    if let Some(y) = known_y {
                        let addr = base.wrapping_add(u16::from(y));
                        let crossed = addr & 0xFF00 != base & 0xFF00;
                        if !is_special(addr) {
                            rewrite = Some((k, addr, crossed));
                        }
                    }
                }
                Uop::ModeZpx { base: Imm8::Const(base) } => {
                    if let Some(x) = known_x {
                        let addr = u16::from(base.wrapping_add(x));
                        if !is_special(addr) {
                            rewrite = Some((k, addr, false));
                        }
                    }
                }
                Uop::ModeZpy { base: Imm8::Const(base) } => {
                    if let Some(y) = known_y {
                        let addr = u16::from(base.wrapping_add(y));
                        if !is_special(addr) {
                            rewrite = Some((k, addr, false));
                        }
                    }
                }
                _ => {}
            }
            if rewrite.is_some() {
                break;
            }
        }

        if let Some((k, addr, crossed)) = rewrite {
            // Replace the mode uop and retarget the scratch consumer.
            let consumer = instr.uops.iter().position(|u| {
                matches!(
                    u,
                    Uop::LoadScratch { .. }
                        | Uop::StoreScratch { .. }
                        | Uop::AluScratch { .. }
                        | Uop::ShiftScratch { .. }
                        | Uop::IncScratch { .. }
                )
            });
            if let Some(c) = consumer {
                let target = Addr16::Const(addr);
                instr.uops[c] = match instr.uops[c] {
                    Uop::LoadScratch { reg } => Uop::LoadMem { reg, addr: target },
                    Uop::StoreScratch { reg } => Uop::StoreMem { reg, addr: target },
                    Uop::AluScratch { op } => Uop::AluMem { op, addr: target },
                    Uop::ShiftScratch { op } => Uop::ShiftMem { op, addr: target },
                    Uop::IncScratch { delta } => Uop::IncMem { delta, addr: target },
                    _ => unreachable!(),
                };
                instr.uops.remove(k);
                // The page-crossing outcome is now a compile-time fact;
                // bake the penalty cycle into the boundary cost.
                if let Some(p) = instr
                    .uops
                    .iter()
                    .position(|u| matches!(u, Uop::CheckPagePenalty))
                {
                    instr.uops.remove(p);
                    if crossed {
                        instr.cycles += 1;
                    }
                }
                changed = true;
            }
        }

        // Update what we know about X and Y.
        for uop in &instr.uops {
            match *uop {
                Uop::LoadImm { reg: Reg::X, value: Imm8::Const(v) } => {
                    known_x = Some(v);
                }
                Uop::LoadImm { reg: Reg::Y, value: Imm8::Const(v) } => {
                    known_y = Some(v);
                }
                _ => {
                    if uop.writes_reg(Reg::X) {
                        known_x = None;
                    }
                    if uop.writes_reg(Reg::Y) {
                        known_y = None;
                    }
                }
            }
        }
    }
    changed
}

/// Drop constant loads whose value is overwritten before any read.
fn eliminate_dead_loads(block: &mut Block) -> bool {
    let mut changed = false;
    // Flatten positions for a forward scan per candidate.
    let positions: Vec<(usize, usize)> = block
        .instrs
        .iter()
        .enumerate()
        .flat_map(|(i, instr)| (0..instr.uops.len()).map(move |k| (i, k)))
        .collect();

    for (idx, &(i, k)) in positions.iter().enumerate() {
        let Uop::LoadImm { reg, value: Imm8::Const(_) } = block.instrs[i].uops[k]
        else {
            continue;
        };
        // The value is live at any block exit, so only an unconditional
        // overwrite before any read or exit kills it.
        let mut dead = false;
        for &(i2, k2) in &positions[idx + 1..] {
            let uop = block.instrs[i2].uops[k2];
            if uop.reads_reg(reg) || uop.is_terminal() || matches!(uop, Uop::Branch { .. }) {
                break;
            }
            if uop.writes_reg(reg) {
                dead = true;
                break;
            }
        }
        if dead {
            block.instrs[i].uops.remove(k);
            changed = true;
            // Positions are stale now; pick the rest up next iteration.
            break;
        }
    }
    changed
}

/// LDA #k; STA addr with A dead after -> a single store-immediate uop.
fn merge_store_imm(block: &mut Block, supports: &dyn Fn(&Uop) -> bool) -> bool {
    let mut changed = false;
    let mut i = 0;
    while i < block.instrs.len() {
        let Some(j) = next_live(block, i + 1) else { break };

        let load = matches!(
            block.instrs[i].uops[..],
            [Uop::LoadImm { reg: Reg::A, value: Imm8::Const(_) }]
        );
        let store = matches!(
            block.instrs[j].uops[..],
            [Uop::StoreMem { reg: Reg::A, addr: Addr16::Const(_) }]
        );
        if !(load && store) {
            i = j;
            continue;
        }
        let Uop::LoadImm { value, .. } = block.instrs[i].uops[0] else {
            unreachable!()
        };
        let Uop::StoreMem { addr, .. } = block.instrs[j].uops[0] else {
            unreachable!()
        };
        let merged = Uop::StoreImm { addr, value };
        if !supports(&merged) {
            i = j;
            continue;
        }

        // A must be written again before any read or exit.
        let mut dead = false;
        'outer: for instr in &block.instrs[j + 1..] {
            for uop in &instr.uops {
                if uop.reads_reg(Reg::A)
                    || uop.is_terminal()
                    || matches!(uop, Uop::Branch { .. })
                {
                    break 'outer;
                }
                if uop.writes_reg(Reg::A) {
                    dead = true;
                    break 'outer;
                }
            }
        }
        if !dead {
            i = j;
            continue;
        }

        let store_cycles = block.instrs[j].cycles;
        block.instrs[i].uops = vec![merged];
        block.instrs[i].cycles += store_cycles;
        block.instrs[j].uops.clear();
        block.instrs[j].cycles = 0;
        block.instrs[j].merged = true;
        changed = true;
        i = j + 1;
    }
    changed
}

/// N consecutive identical accumulator shifts -> one shift-by-N.
///
/// Intermediate carry and N/Z values are unobserved once the dead flag
/// materialisations are gone, and a host shift-by-N leaves the same final
/// carry as the sequential shifts.
fn coalesce_shifts(block: &mut Block) -> bool {
    let mut changed = false;
    let mut i = 0;
    while i < block.instrs.len() {
        let Some(first) = shift_only(block, i) else {
            i += 1;
            continue;
        };

        let mut run = vec![i];
        let mut j = i;
        while let Some(next) = next_live(block, j + 1) {
            match shift_only(block, next) {
                Some(op) if op == first && run.len() < 7 => {
                    run.push(next);
                    j = next;
                }
                _ => break,
            }
        }
        if run.len() < 2 {
            i += 1;
            continue;
        }

        // Owner keeps a widened shift plus the run's last flag uop.
        let last = *run.last().unwrap_or_else(|| unreachable!());
        let tail_flags = block.instrs[last]
            .uops
            .iter()
            .find(|u| matches!(u, Uop::FlagsNz { .. }))
            .copied();
        let total_cycles: u8 = run.iter().map(|&r| block.instrs[r].cycles).sum();

        block.instrs[i].uops = vec![Uop::ShiftAcc { op: first, by: run.len() as u8 }];
        if let Some(f) = tail_flags {
            block.instrs[i].uops.push(f);
        }
        block.instrs[i].cycles = total_cycles;
        for &r in &run[1..] {
            block.instrs[r].uops.clear();
            block.instrs[r].cycles = 0;
            block.instrs[r].merged = true;
        }
        changed = true;
        i = last + 1;
    }
    changed
}

/// The shift op if the instruction is a single-step accumulator shift
/// (with or without a trailing flag materialisation).
fn shift_only(block: &Block, i: usize) -> Option<crate::uop::ShiftOp> {
    match block.instrs[i].uops[..] {
        [Uop::ShiftAcc { op, by: 1 }] => Some(op),
        [Uop::ShiftAcc { op, by: 1 }, Uop::FlagsNz { .. }] => Some(op),
        _ => None,
    }
}

/// Drop a mode uop identical to the one whose result is still sitting in
/// the scratch register. Applies to the indirect modes, where recomputing
/// means re-reading the zero-page pointer.
fn hoist_modes(block: &mut Block) -> bool {
    let mut changed = false;
    let mut live: Option<Uop> = None;

    for instr in &mut block.instrs {
        let mut k = 0;
        while k < instr.uops.len() {
            let uop = instr.uops[k];
            match uop {
                Uop::ModeIdx { .. } | Uop::ModeIdy { .. } => {
                    if live == Some(uop) {
                        instr.uops.remove(k);
                        changed = true;
                        continue;
                    }
                    live = Some(uop);
                }
                // Any other mode computation replaces the scratch value.
                Uop::ModeZpx { .. }
                | Uop::ModeZpy { .. }
                | Uop::ModeAbx { .. }
                | Uop::ModeAby { .. } => live = None,
                // Writes that could touch a zero-page pointer, or leave
                // uop-land entirely, end the sharing.
                Uop::StoreMem { addr: Addr16::Const(a), .. } if a < 0x100 => {
                    live = None;
                }
                Uop::StoreMem { addr: Addr16::Mem(_), .. }
                | Uop::StoreScratch { .. }
                | Uop::StoreImm { .. }
                | Uop::ShiftScratch { .. }
                | Uop::ShiftMem { .. }
                | Uop::IncScratch { .. }
                | Uop::IncMem { .. }
                | Uop::Interp { .. } => live = None,
                _ => {
                    let kills_index = match live {
                        Some(Uop::ModeIdx { .. }) => uop.writes_reg(Reg::X),
                        Some(Uop::ModeIdy { .. }) => uop.writes_reg(Reg::Y),
                        _ => false,
                    };
                    if kills_index {
                        live = None;
                    }
                }
            }
            k += 1;
        }
    }
    changed
}

/// Backward liveness over N and Z: trim or drop flag materialisations
/// nobody reads.
fn trim_dead_flags(block: &mut Block) -> bool {
    let mut changed = false;
    let mut n_live = true;
    let mut z_live = true;

    for instr in block.instrs.iter_mut().rev() {
        let mut k = instr.uops.len();
        while k > 0 {
            k -= 1;
            let uop = instr.uops[k];
            match uop {
                Uop::FlagsNz { src, n, z } => {
                    let keep_n = n && n_live;
                    let keep_z = z && z_live;
                    if !keep_n && !keep_z {
                        instr.uops.remove(k);
                        changed = true;
                        continue;
                    }
                    if keep_n != n || keep_z != z {
                        instr.uops[k] = Uop::FlagsNz { src, n: keep_n, z: keep_z };
                        changed = true;
                    }
                    if keep_n {
                        n_live = false;
                    }
                    if keep_z {
                        z_live = false;
                    }
                }
                // Writers without reads.
                Uop::PullP | Uop::Rti | Uop::BitMem { .. } => {
                    n_live = false;
                    z_live = false;
                    if matches!(uop, Uop::Rti) {
                        // Control leaves the block; everything beyond is
                        // another block's business.
                        n_live = true;
                        z_live = true;
                    }
                }
                Uop::Branch { cond, .. } => match cond {
                    Cond::Pl | Cond::Mi => n_live = true,
                    Cond::Ne | Cond::Eq => z_live = true,
                    _ => {}
                },
                // Anything that can observe the whole status byte or leave
                // the block makes both live.
                Uop::PushP
                | Uop::Brk { .. }
                | Uop::Interp { .. }
                | Uop::Exit { .. }
                | Uop::Halt { .. }
                | Uop::DebugTrap { .. }
                | Uop::Jump { .. }
                | Uop::JumpInd { .. }
                | Uop::Jsr { .. }
                | Uop::Rts => {
                    n_live = true;
                    z_live = true;
                }
                _ => {}
            }
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::decode_block;
    use crate::metadata::Metadata;
    use crate::stats::Stats;
    use crate::uop::ShiftOp;
    use emu_core::{Bus, FlatBus};

    fn optimized(program: &[u8], at: u16) -> Block {
        let mut bus = FlatBus::new();
        bus.load(at, program);
        let metadata = Metadata::new();
        let stats = Stats::new();
        let config = JitConfig::default();
        let mut block = decode_block(&bus, &metadata, &stats, &config, at);
        let special = |a: u16| bus.is_special(a);
        optimize_block(&mut block, &config, &|_| true, &special);
        block
    }

    fn all_uops(block: &Block) -> Vec<Uop> {
        block.instrs.iter().flat_map(|i| i.uops.clone()).collect()
    }

    #[test]
    fn clc_adc_folds_to_add() {
        // CLC; ADC #$01; exit
        let block = optimized(&[0x18, 0x69, 0x01, 0x02], 0x3100);
        let uops = all_uops(&block);
        assert!(
            uops.iter()
                .any(|u| matches!(u, Uop::AluImm { op: AluOp::Add, .. })),
            "carry fold should produce ADD: {uops:?}"
        );
        assert!(!uops.iter().any(|u| matches!(u, Uop::SetC(_))));
    }

    #[test]
    fn sec_sbc_folds_to_sub() {
        let block = optimized(&[0x38, 0xE9, 0x01, 0x02], 0x3100);
        let uops = all_uops(&block);
        assert!(
            uops.iter()
                .any(|u| matches!(u, Uop::AluImm { op: AluOp::Sub, .. }))
        );
    }

    #[test]
    fn shifts_coalesce_and_cycles_accumulate() {
        // LDA #$06; ASL A x4; STA $00; exit
        let block = optimized(
            &[0xA9, 0x06, 0x0A, 0x0A, 0x0A, 0x0A, 0x85, 0x00, 0x02],
            0x2100,
        );
        let uops = all_uops(&block);
        assert!(
            uops.iter()
                .any(|u| matches!(u, Uop::ShiftAcc { op: ShiftOp::Asl, by: 4 })),
            "expected shift-by-4: {uops:?}"
        );
        // The owner boundary charges all four shifts.
        let owner = block
            .instrs
            .iter()
            .find(|i| {
                i.uops
                    .iter()
                    .any(|u| matches!(u, Uop::ShiftAcc { by: 4, .. }))
            })
            .unwrap_or_else(|| unreachable!());
        assert_eq!(owner.cycles, 8);
        // Total block cycles are unchanged by merging.
        let total: u32 = block.instrs.iter().map(|i| u32::from(i.cycles)).sum();
        assert_eq!(total, 2 + 2 * 4 + 3);
    }

    #[test]
    fn store_imm_merges_when_a_dead() {
        // LDA #$07; STA $40; LDA #$09; exit -- first A is dead after STA.
        let block = optimized(&[0xA9, 0x07, 0x85, 0x40, 0xA9, 0x09, 0x02], 0x2200);
        let uops = all_uops(&block);
        assert!(
            uops.iter().any(|u| matches!(
                u,
                Uop::StoreImm { addr: Addr16::Const(0x40), value: Imm8::Const(0x07) }
            )),
            "expected merged store: {uops:?}"
        );
    }

    #[test]
    fn store_imm_not_merged_when_a_live() {
        // LDA #$07; STA $40; exit -- A is live at block exit.
        let block = optimized(&[0xA9, 0x07, 0x85, 0x40, 0x02], 0x2200);
        let uops = all_uops(&block);
        assert!(!uops.iter().any(|u| matches!(u, Uop::StoreImm { .. })));
    }

    #[test]
    fn known_x_rewrites_indexed_to_absolute() {
        // LDX #$04; LDA $3000,X; exit
        let block = optimized(&[0xA2, 0x04, 0xBD, 0x00, 0x30, 0x02], 0x2300);
        let uops = all_uops(&block);
        assert!(
            uops.iter().any(|u| matches!(
                u,
                Uop::LoadMem { reg: Reg::A, addr: Addr16::Const(0x3004) }
            )),
            "expected absolute rewrite: {uops:?}"
        );
        assert!(!uops.iter().any(|u| matches!(u, Uop::ModeAbx { .. })));
    }

    #[test]
    fn idy_base_load_shared_between_adjacent_ops() {
        // LDA ($70),Y; ORA ($70),Y; exit
        let block = optimized(&[0xB1, 0x70, 0x11, 0x70, 0x02], 0x2400);
        let mode_count = all_uops(&block)
            .iter()
            .filter(|u| matches!(u, Uop::ModeIdy { .. }))
            .count();
        assert_eq!(mode_count, 1, "second pointer load should be hoisted");
    }

    #[test]
    fn dead_nz_flags_dropped_between_loads() {
        // LDA #$01; LDA #$02; exit -- the first LDA's flags and value die.
        let block = optimized(&[0xA9, 0x01, 0xA9, 0x02, 0x02], 0x2500);
        let loads = all_uops(&block)
            .iter()
            .filter(|u| matches!(u, Uop::LoadImm { .. }))
            .count();
        let flags = all_uops(&block)
            .iter()
            .filter(|u| matches!(u, Uop::FlagsNz { .. }))
            .count();
        assert_eq!(loads, 1, "dead constant load eliminated");
        assert_eq!(flags, 1, "dead flag materialisation eliminated");
    }

    #[test]
    fn branch_on_z_keeps_z_but_sheds_n() {
        // LDA #$00; BEQ +0; exit. Z feeds the branch; N is dead only if
        // nothing downstream reads it -- the block exit keeps it live, so
        // here both survive. Contrast with an overwrite before the exit.
        let block = optimized(&[0xA9, 0x00, 0xF0, 0x00, 0x02], 0x2600);
        let uops = all_uops(&block);
        assert!(uops.iter().any(|u| matches!(u, Uop::FlagsNz { z: true, .. })));
    }

    #[test]
    fn cycle_totals_survive_optimisation() {
        let program = [0x18, 0xA9, 0x10, 0x69, 0x01, 0x85, 0x20, 0x02];
        let mut bus = FlatBus::new();
        bus.load(0x2700, &program);
        let metadata = Metadata::new();
        let stats = Stats::new();
        let config = JitConfig::default();
        let plain = decode_block(&bus, &metadata, &stats, &config, 0x2700);
        let mut opt = plain.clone();
        let special = |a: u16| bus.is_special(a);
        optimize_block(&mut opt, &config, &|_| true, &special);
        let sum = |b: &Block| -> u32 { b.instrs.iter().map(|i| u32::from(i.cycles)).sum() };
        assert_eq!(sum(&plain), sum(&opt));
    }
}
