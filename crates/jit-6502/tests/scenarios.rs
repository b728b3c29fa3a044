//! End-to-end scenarios for the translating driver.
//!
//! Programs are poked straight into a flat bus and entered at a chosen
//! PC; assertions inspect the architectural end state plus the
//! translation metadata (jit pointers, block ids, invalidation marks).

use emu_core::{FlatBus, NullTimers};
use jit_6502::{ExitReason, Jit, JitConfig};

fn make_jit(flags: &str) -> Jit {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = JitConfig::from_flags(flags).unwrap_or_else(|e| panic!("{e}"));
    Jit::new(config).unwrap_or_else(|e| panic!("{e}"))
}

fn enter_at(jit: &mut Jit, bus: &mut FlatBus, pc: u16, countdown: i64) -> ExitReason {
    jit.registers_mut().pc = pc;
    jit.set_countdown(countdown);
    jit.enter(bus, &mut NullTimers::default())
}

/// Length of the live block starting at `addr`, in bytes owned by it.
fn block_len(jit: &Jit, addr: u16) -> u32 {
    let block = jit.block_from_6502(addr);
    if block == -1 {
        return 0;
    }
    let mut len = 0;
    let mut a = u32::from(addr);
    while a <= 0xFFFF && jit.block_from_6502(a as u16) == block {
        len += 1;
        a += 1;
    }
    len
}

#[test]
fn single_block_nop() {
    let mut bus = FlatBus::new();
    let mut jit = make_jit("");

    bus.load(0x1000, &[0xEA, 0xEA, 0x02]); // NOP; NOP; exit

    let reason = enter_at(&mut jit, &mut bus, 0x1000, 100);
    assert_eq!(reason, ExitReason::Exited);
    assert_eq!(jit.registers().pc, 0x1002, "PC parks on the exit opcode");
    assert_eq!(jit.countdown(), 100 - 4, "two NOPs cost 2 cycles each");
    assert!(jit.is_block_start(0x1000));
    assert!(jit.has_code(0x1001));
}

#[test]
fn self_modify_trap_then_dynamic_promotion() {
    let mut bus = FlatBus::new();
    let mut jit = make_jit("");

    bus.load(
        0x2000,
        &[
            0xE8, // INX          @ $2000
            0xA9, 0x00, // LDA #$00     @ $2001
            0xEE, 0x02, 0x20, // INC $2002    @ $2003 (rewrites the LDA operand)
            0x02, // exit         @ $2006
        ],
    );

    // First run: the INC invalidates the code for the LDA it feeds.
    enter_at(&mut jit, &mut bus, 0x2000, 1_000);
    assert_eq!(bus.peek(0x2002), 0x01);
    assert_eq!(jit.registers().a, 0x00, "first run saw the original operand");
    assert!(
        jit.has_invalidated_code(0x2001),
        "the jit pointer for the written operand leads to the trap"
    );

    // Second run recompiles once and sees the new operand.
    enter_at(&mut jit, &mut bus, 0x2000, 1_000);
    assert_eq!(bus.peek(0x2002), 0x02);
    assert_eq!(jit.registers().a, 0x01);

    // Keep going: the per-address counter passes the trigger and the
    // operand byte is promoted to a run-time fetch.
    for expect in 3..=6u8 {
        enter_at(&mut jit, &mut bus, 0x2000, 1_000);
        assert_eq!(bus.peek(0x2002), expect);
    }
    assert!(jit.is_dynamic(0x2002), "operand byte promoted to dynamic");
    assert!(
        !jit.has_invalidated_code(0x2001) || jit.is_dynamic(0x2001),
        "dynamic-operand slots no longer invalidate on operand writes"
    );

    // And once dynamic, runs stop planting traps entirely.
    let invalidations = jit.invalidation_count(0x2002);
    enter_at(&mut jit, &mut bus, 0x2000, 1_000);
    enter_at(&mut jit, &mut bus, 0x2000, 1_000);
    assert_eq!(
        jit.invalidation_count(0x2002),
        invalidations,
        "no invalidation between runs after promotion"
    );
}

#[test]
fn block_split_via_sub_instruction_entry() {
    let mut bus = FlatBus::new();
    let mut jit = make_jit("");

    bus.load(0x0B00, &[0xEA, 0xEA, 0x02]); // NOP; NOP; exit

    enter_at(&mut jit, &mut bus, 0x0B00, 1_000);
    assert_eq!(jit.block_from_6502(0x0B00), 0x0B00);
    assert_eq!(jit.block_from_6502(0x0B01), 0x0B00, "one block covers both");

    // Entering at the second NOP forces a split.
    enter_at(&mut jit, &mut bus, 0x0B01, 1_000);
    assert_eq!(jit.block_from_6502(0x0B00), 0x0B00);
    assert_eq!(block_len(&jit, 0x0B00), 1, "head block truncated to one byte");
    assert_eq!(jit.block_from_6502(0x0B01), 0x0B01, "tail is its own block");
    assert!(
        jit.jump_target_is_invalidated(0x0B00),
        "the head block's entry recompiles shorter on next use"
    );

    // The shortened head still runs correctly end to end.
    enter_at(&mut jit, &mut bus, 0x0B00, 1_000);
    assert_eq!(jit.registers().pc, 0x0B02);
}

#[test]
fn carry_fold_semantics() {
    let mut bus = FlatBus::new();
    let mut jit = make_jit("");

    bus.load(0x3100, &[0xD8, 0x18, 0x69, 0x01, 0x02]); // CLD; CLC; ADC #$01; exit
    jit.registers_mut().a = 0x10;

    enter_at(&mut jit, &mut bus, 0x3100, 1_000);
    assert_eq!(jit.registers().a, 0x11);
    assert!(!jit.registers().p.is_set(emu_6502::flags::C), "carry clear");
    assert_eq!(jit.countdown(), 1_000 - (2 + 2 + 2));
}

/// The optimiser's work is visible in the emitted native code: a folded
/// ADD has no carry load (`shr r9b, 1`) ahead of the add.
#[test]
fn carry_fold_visible_in_x64_disassembly() {
    use jit_6502::backend::{Backend, EmitCtx, x64::X64Backend};
    use jit_6502::config::JitConfig;
    use jit_6502::decode::decode_block;
    use jit_6502::metadata::Metadata;
    use jit_6502::optimize::optimize_block;
    use jit_6502::stats::Stats;

    let mut bus = FlatBus::new();
    bus.load(0x3100, &[0xD8, 0x18, 0x69, 0x01, 0x02]);

    let config = JitConfig::default();
    let mut block = decode_block(&bus, &Metadata::new(), &Stats::new(), &config, 0x3100);
    let backend = X64Backend::new();
    optimize_block(
        &mut block,
        &config,
        &|u| backend.supports_uop(u),
        &|_| false,
    );

    let mut code = Vec::new();
    for instr in &block.instrs {
        let mut slot = [0u8; 128];
        let mut ctx = EmitCtx::new(&mut slot, instr.addr, true);
        for uop in &instr.uops {
            backend.emit(&mut ctx, uop).unwrap_or_else(|_| panic!("emit"));
        }
        let pos = ctx.pos;
        code.extend_from_slice(&slot[..pos]);
    }

    let carry_load = [0x41, 0xD0, 0xE9]; // shr r9b, 1
    assert!(
        !code.windows(3).any(|w| w == carry_load),
        "no carry load may precede the folded add: {code:02X?}"
    );
    assert!(
        code.windows(2).any(|w| w == [0x04, 0x01]),
        "plain `add al, 1` expected in the slot"
    );
}

/// The driver executes record slots; handing it a machine-code emitter
/// must fail loudly instead of silently misreading the emitted bytes.
#[test]
fn driver_refuses_emit_only_backends() {
    use jit_6502::JitError;
    use jit_6502::backend::{Arm64Backend, X64Backend};

    let err = Jit::with_backend(JitConfig::default(), Box::new(X64Backend::new()));
    assert!(matches!(err, Err(JitError::BackendNotExecutable)));

    let err = Jit::with_backend(JitConfig::default(), Box::new(Arm64Backend::new()));
    assert!(matches!(err, Err(JitError::BackendNotExecutable)));

    use jit_6502::backend::PortableBackend;
    assert!(Jit::with_backend(JitConfig::default(), Box::new(PortableBackend::new())).is_ok());
}

#[test]
fn coalesced_shifts() {
    let mut bus = FlatBus::new();
    let mut jit = make_jit("");

    // LDA #$06; ASL A x4; STA $00; exit
    bus.load(0x2100, &[0xA9, 0x06, 0x0A, 0x0A, 0x0A, 0x0A, 0x85, 0x00, 0x02]);

    enter_at(&mut jit, &mut bus, 0x2100, 1_000);
    assert_eq!(bus.peek(0x0000), 0x60);
    assert_eq!(jit.registers().a, 0x60);
    // 2 (LDA) + 4 * 2 (shifts) + 3 (STA) cycles.
    assert_eq!(jit.countdown(), 1_000 - 13);
    // The merged shifts share the owner's code pointer.
    assert_eq!(jit.code_ptr(0x2103), jit.code_ptr(0x2102));
    assert_eq!(jit.code_ptr(0x2105), jit.code_ptr(0x2102));
}

#[test]
fn mid_shift_entry_splits_the_block() {
    let mut bus = FlatBus::new();
    let mut jit = make_jit("sub_instruction=1");

    bus.load(0x2100, &[0xA9, 0x06, 0x0A, 0x0A, 0x0A, 0x0A, 0x85, 0x00, 0x02]);
    enter_at(&mut jit, &mut bus, 0x2100, 1_000);
    assert_eq!(jit.registers().a, 0x60);

    // Enter at the third ASL: precise mode recompiles from there, so only
    // the remaining two shifts run.
    jit.registers_mut().a = 0x06;
    enter_at(&mut jit, &mut bus, 0x2104, 1_000);
    assert_eq!(jit.registers().a, 0x06 << 2, "two shifts remain from here");
    assert_eq!(jit.block_from_6502(0x2104), 0x2104, "entry became a block");
    assert_eq!(bus.peek(0x0000), 0x06 << 2);
}

#[test]
fn mid_shift_entry_reexecutes_without_sub_instruction() {
    let mut bus = FlatBus::new();
    let mut jit = make_jit("sub_instruction=0");

    bus.load(0x2100, &[0xA9, 0x06, 0x0A, 0x0A, 0x0A, 0x0A, 0x85, 0x00, 0x02]);
    enter_at(&mut jit, &mut bus, 0x2100, 1_000);

    // Fast mode re-enters through the covering uop: the whole shift-by-4
    // runs again from the current A.
    jit.registers_mut().a = 0x06;
    enter_at(&mut jit, &mut bus, 0x2104, 1_000);
    assert_eq!(jit.registers().a, 0x60, "whole merged uop re-executed");
}

#[test]
fn countdown_fires_timer_exactly_once() {
    let mut bus = FlatBus::new();
    let mut jit = make_jit("");

    bus.load(0x4000, &[0xEA, 0xEA, 0xEA, 0x02]); // NOP x3; exit

    jit.registers_mut().pc = 0x4000;
    jit.set_countdown(3);
    let mut timers = NullTimers::default();
    let reason = jit.enter(&mut bus, &mut timers);

    assert_eq!(reason, ExitReason::Exited);
    assert_eq!(timers.fired, 1, "one expiry, one trampoline call");
    assert!(jit.countdown() <= 0);
}

#[test]
fn timer_reload_rearms_the_check() {
    use emu_core::{TimerAction, Ticks, Timers};

    struct Reloading {
        fired: u32,
    }
    impl Timers for Reloading {
        fn tick_timers(&mut self, _consumed: Ticks) -> TimerAction {
            self.fired += 1;
            TimerAction { reload: Some(4), irq: false }
        }
    }

    let mut bus = FlatBus::new();
    let mut jit = make_jit("");
    bus.load(0x4100, &[0xEA; 16]);
    bus.load(0x4110, &[0x02]);

    jit.registers_mut().pc = 0x4100;
    jit.set_countdown(3);
    let mut timers = Reloading { fired: 0 };
    jit.enter(&mut bus, &mut timers);
    assert!(timers.fired >= 3, "reloads keep the countdown check alive");
}

#[test]
fn timer_irq_is_delivered_through_the_vector() {
    use emu_core::{TimerAction, Ticks, Timers};

    struct IrqOnce {
        raised: bool,
    }
    impl Timers for IrqOnce {
        fn tick_timers(&mut self, _consumed: Ticks) -> TimerAction {
            let irq = !self.raised;
            self.raised = true;
            TimerAction { reload: None, irq }
        }
    }

    let mut bus = FlatBus::new();
    let mut jit = make_jit("");

    // Main line: CLI, then NOPs. IRQ handler at $9000 exits immediately.
    bus.load(0x5000, &[0x58, 0xEA, 0xEA, 0xEA, 0xEA, 0x02]);
    bus.load(0x9000, &[0x02]);
    bus.load(0xFFFE, &[0x00, 0x90]);

    jit.registers_mut().pc = 0x5000;
    jit.set_countdown(4);
    let mut timers = IrqOnce { raised: false };
    jit.enter(&mut bus, &mut timers);

    assert_eq!(jit.registers().pc, 0x9000, "exited inside the IRQ handler");
    assert!(jit.registers().p.is_set(emu_6502::flags::I));
    // Return address and flags were pushed.
    let s = jit.registers().s;
    assert_eq!(s, 0xFD - 3);
}

#[test]
fn invalidation_recompiles_exactly_once() {
    let mut bus = FlatBus::new();
    let mut jit = make_jit("dynamic_operand=0,dynamic_opcode=0");

    bus.load(0x6000, &[0xA9, 0x07, 0x02]); // LDA #$07; exit
    enter_at(&mut jit, &mut bus, 0x6000, 1_000);
    let baseline = jit.compile_count();

    // A write through the notification channel invalidates the slot.
    bus.load(0x6001, &[0x0A]);
    jit.memory_written(0x6001);
    assert!(jit.has_invalidated_code(0x6001));

    enter_at(&mut jit, &mut bus, 0x6000, 1_000);
    assert_eq!(jit.registers().a, 0x0A, "recompile saw the new operand");
    assert_eq!(jit.compile_count(), baseline + 1, "one compile, no more");

    enter_at(&mut jit, &mut bus, 0x6000, 1_000);
    assert_eq!(jit.compile_count(), baseline + 1, "fast path thereafter");
}

#[test]
fn host_pc_maps_back_to_6502_addresses() {
    let mut bus = FlatBus::new();
    let mut jit = make_jit("");

    // LDA #$01; STA $0300; LDX #$02; exit -- a few multi-byte instructions.
    bus.load(0x7000, &[0xA9, 0x01, 0x8D, 0x00, 0x03, 0xA2, 0x02, 0x02]);
    enter_at(&mut jit, &mut bus, 0x7000, 1_000);

    for addr in [0x7000u16, 0x7002, 0x7005, 0x7007] {
        if jit.is_dynamic(addr) {
            continue;
        }
        assert_eq!(
            jit.host_pc_to_6502(jit.code_ptr(addr)),
            addr,
            "round trip for ${addr:04X}"
        );
    }
    // Operand bytes resolve to their owning instruction.
    assert_eq!(jit.host_pc_to_6502(jit.code_ptr(0x7001)), 0x7000);
    assert_eq!(jit.host_pc_to_6502(jit.code_ptr(0x7003)), 0x7002);
}

#[test]
fn merged_store_entry_at_last_byte_reexecutes_whole_uop() {
    let mut bus = FlatBus::new();
    let mut jit = make_jit("sub_instruction=0");

    // LDA #$07; STA $40; LDA #$09; exit. The first pair merges into a
    // store-immediate whose bytes span $2200-$2203.
    bus.load(0x2200, &[0xA9, 0x07, 0x85, 0x40, 0xA9, 0x09, 0x02]);
    enter_at(&mut jit, &mut bus, 0x2200, 1_000);
    assert_eq!(bus.peek(0x0040), 0x07);
    assert_eq!(jit.registers().a, 0x09);

    // Entry at the last covered byte re-runs the whole merged uop and
    // must not corrupt registers or flags.
    bus.load(0x0040, &[0x00]);
    let p_before = jit.registers().p;
    enter_at(&mut jit, &mut bus, 0x2203, 1_000);
    assert_eq!(bus.peek(0x0040), 0x07, "merged store re-executed");
    assert_eq!(jit.registers().a, 0x09, "A restored by the trailing load");
    assert_eq!(jit.registers().p, p_before, "flags preserved");
}

#[test]
fn branch_target_landing_mid_block_splits_it() {
    let mut bus = FlatBus::new();
    let mut jit = make_jit("");

    // Victim block: LDA #$01; LDA #$02; exit.
    bus.load(0x0500, &[0xA9, 0x01, 0xA9, 0x02, 0x02]);
    enter_at(&mut jit, &mut bus, 0x0500, 1_000);
    assert_eq!(jit.block_from_6502(0x0502), 0x0500);

    // Branch into its middle from a second block: LDX #$01 clears Z so
    // the BNE is taken; its target is the second LDA.
    bus.load(0x04C0, &[0xA2, 0x01, 0xD0, 0x3E]); // LDX #1; BNE $0502
    enter_at(&mut jit, &mut bus, 0x04C0, 1_000);

    assert_eq!(jit.registers().a, 0x02);
    assert_eq!(jit.block_from_6502(0x0502), 0x0502, "landing split the block");
    assert_eq!(block_len(&jit, 0x0500), 2, "head keeps the first LDA only");
}

#[test]
fn compile_invalidate_all_recompile_is_equivalent() {
    let mut bus = FlatBus::new();
    let mut jit = make_jit("");

    // CLC; LDA #$21; ADC #$21; STA $0300; LSR A; exit
    let program = [0x18, 0xA9, 0x21, 0x69, 0x21, 0x8D, 0x00, 0x03, 0x4A, 0x02];
    bus.load(0x0800, &program);

    enter_at(&mut jit, &mut bus, 0x0800, 1_000);
    let first = (jit.registers(), jit.countdown(), bus.peek(0x0300));

    // Full cache revocation, then the same program again.
    jit.reset();
    jit.registers_mut().a = 0;
    jit.registers_mut().p = emu_6502::Status::new();
    enter_at(&mut jit, &mut bus, 0x0800, 1_000);
    let second = (jit.registers(), jit.countdown(), bus.peek(0x0300));

    assert_eq!(first.0, second.0, "registers identical after recompile");
    assert_eq!(first.1, second.1, "cycle accounting identical");
    assert_eq!(first.2, second.2);
}

#[test]
fn cleanup_rewrites_stale_stubs_to_no_code() {
    let mut bus = FlatBus::new();
    let mut jit = make_jit("dynamic_operand=0,dynamic_opcode=0");

    bus.load(0x0900, &[0xA9, 0x05, 0x02]);
    enter_at(&mut jit, &mut bus, 0x0900, 1_000);

    bus.load(0x0901, &[0x06]);
    jit.memory_written(0x0901);
    assert!(jit.has_code(0x0901));

    jit.cleanup_stale();
    assert!(!jit.has_code(0x0901), "stale stub rewritten to no-code");
    assert_eq!(jit.block_from_6502(0x0901), -1);
}

#[test]
fn kil_jams_until_reset() {
    let mut bus = FlatBus::new();
    let mut jit = make_jit("");

    bus.load(0x0A00, &[0xE8, 0x12]); // INX; KIL
    let reason = enter_at(&mut jit, &mut bus, 0x0A00, 1_000);
    assert_eq!(reason, ExitReason::Halted);
    assert_eq!(jit.registers().x, 1);

    // Still jammed on re-entry.
    assert_eq!(enter_at(&mut jit, &mut bus, 0x0A00, 1_000), ExitReason::Halted);

    jit.reset();
    bus.load(0x0A01, &[0x02]); // replace KIL with exit
    let reason = enter_at(&mut jit, &mut bus, 0x0A00, 1_000);
    assert_eq!(reason, ExitReason::Exited);
}

#[test]
fn debug_callback_sees_every_boundary() {
    use std::cell::RefCell;
    use std::rc::Rc;

    let mut bus = FlatBus::new();
    let mut jit = make_jit("debug=1");

    bus.load(0x0C00, &[0xE8, 0xC8, 0x02]); // INX; INY; exit
    let seen: Rc<RefCell<Vec<u16>>> = Rc::default();
    let sink = Rc::clone(&seen);
    jit.set_debug_callback(Box::new(move |regs| sink.borrow_mut().push(regs.pc)));

    enter_at(&mut jit, &mut bus, 0x0C00, 1_000);
    assert_eq!(&seen.borrow()[..2], &[0x0C00, 0x0C01]);
}
