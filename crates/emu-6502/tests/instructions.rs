//! Unit tests for 6502 instruction behaviour and cycle costs.

use emu_6502::{Mos6502, Step, flags};
use emu_core::{Bus, FlatBus};

/// Load a program at $0200 and set PC there.
fn setup_program(bus: &mut FlatBus, cpu: &mut Mos6502, program: &[u8]) {
    bus.load(0x0200, program);
    cpu.regs.pc = 0x0200;
}

/// Step once, panicking unless the instruction ran, and return its cycles.
fn step_cycles(cpu: &mut Mos6502, bus: &mut FlatBus) -> u8 {
    match cpu.step(bus) {
        Step::Ran(cycles) => cycles,
        other => panic!("instruction did not run: {other:?}"),
    }
}

#[test]
fn stack_pha_pla() {
    let mut bus = FlatBus::new();
    let mut cpu = Mos6502::new();

    let program = [
        0xA9, 0x42, // LDA #$42
        0xA2, 0xFF, // LDX #$FF
        0x9A, // TXS
        0x48, // PHA
        0xA9, 0x00, // LDA #$00
        0x68, // PLA
    ];
    setup_program(&mut bus, &mut cpu, &program);

    for _ in 0..6 {
        step_cycles(&mut cpu, &mut bus);
    }

    assert_eq!(cpu.regs.a, 0x42, "PLA should restore A");
    assert_eq!(cpu.regs.s, 0xFF, "SP should be back to $FF after PLA");
}

#[test]
fn brk_pushes_pc_plus_two_and_sets_i() {
    let mut bus = FlatBus::new();
    let mut cpu = Mos6502::new();

    bus.write(0xFFFE, 0x00);
    bus.write(0xFFFF, 0x03);

    let program = [
        0xA2, 0xFF, // LDX #$FF    @ $0200
        0x9A, // TXS         @ $0202
        0x58, // CLI         @ $0203
        0x00, // BRK         @ $0204
        0xEA, // padding     @ $0205 (skipped)
    ];
    setup_program(&mut bus, &mut cpu, &program);

    for _ in 0..4 {
        step_cycles(&mut cpu, &mut bus);
    }

    assert_eq!(cpu.regs.pc, 0x0300, "PC should be at BRK vector target");
    assert_eq!(cpu.regs.s, 0xFC, "three pushes from $FF");
    assert!(cpu.regs.p.is_set(flags::I), "I set after BRK");
    assert_eq!(bus.peek(0x01FF), 0x02, "pushed PCH");
    assert_eq!(bus.peek(0x01FE), 0x06, "pushed PCL is BRK + 2");
    assert_eq!(bus.peek(0x01FD) & 0x30, 0x30, "pushed P has B and U set");
}

#[test]
fn adc_binary_carry_and_overflow() {
    let mut bus = FlatBus::new();
    let mut cpu = Mos6502::new();

    // CLC; LDA #$7F; ADC #$01 -> $80, V set, C clear, N set
    let program = [0x18, 0xA9, 0x7F, 0x69, 0x01];
    setup_program(&mut bus, &mut cpu, &program);
    for _ in 0..3 {
        step_cycles(&mut cpu, &mut bus);
    }

    assert_eq!(cpu.regs.a, 0x80);
    assert!(cpu.regs.p.is_set(flags::V), "signed overflow");
    assert!(cpu.regs.p.is_set(flags::N));
    assert!(!cpu.regs.p.is_set(flags::C));
}

#[test]
fn adc_decimal() {
    let mut bus = FlatBus::new();
    let mut cpu = Mos6502::new();

    // SED; SEC; LDA #$58; ADC #$46 -> $05 with carry out (58 + 46 + 1 = 105)
    let program = [0xF8, 0x38, 0xA9, 0x58, 0x69, 0x46];
    setup_program(&mut bus, &mut cpu, &program);
    for _ in 0..4 {
        step_cycles(&mut cpu, &mut bus);
    }

    assert_eq!(cpu.regs.a, 0x05);
    assert!(cpu.regs.p.is_set(flags::C), "decimal carry out");
}

#[test]
fn sbc_decimal() {
    let mut bus = FlatBus::new();
    let mut cpu = Mos6502::new();

    // SED; SEC; LDA #$46; SBC #$12 -> $34
    let program = [0xF8, 0x38, 0xA9, 0x46, 0xE9, 0x12];
    setup_program(&mut bus, &mut cpu, &program);
    for _ in 0..4 {
        step_cycles(&mut cpu, &mut bus);
    }

    assert_eq!(cpu.regs.a, 0x34);
    assert!(cpu.regs.p.is_set(flags::C), "no borrow");
}

#[test]
fn branch_cycle_costs() {
    let mut bus = FlatBus::new();
    let mut cpu = Mos6502::new();

    // BNE not taken: 2 cycles.
    cpu.regs.p.set(flags::Z);
    setup_program(&mut bus, &mut cpu, &[0xD0, 0x10]);
    assert_eq!(step_cycles(&mut cpu, &mut bus), 2);

    // BNE taken, same page: 3 cycles.
    cpu.regs.p.clear(flags::Z);
    cpu.regs.pc = 0x0200;
    assert_eq!(step_cycles(&mut cpu, &mut bus), 3);
    assert_eq!(cpu.regs.pc, 0x0212);

    // BNE taken, crossing into the next page: 4 cycles.
    bus.load(0x02F0, &[0xD0, 0x20]); // next = $02F2, target = $0312
    cpu.regs.pc = 0x02F0;
    assert_eq!(step_cycles(&mut cpu, &mut bus), 4);
    assert_eq!(cpu.regs.pc, 0x0312);
}

#[test]
fn lda_abx_page_cross_penalty() {
    let mut bus = FlatBus::new();
    let mut cpu = Mos6502::new();

    bus.write(0x0300, 0x55);
    cpu.regs.x = 0x01;
    // LDA $02FF,X reads $0300 and pays the crossing cycle.
    setup_program(&mut bus, &mut cpu, &[0xBD, 0xFF, 0x02]);
    assert_eq!(step_cycles(&mut cpu, &mut bus), 5);
    assert_eq!(cpu.regs.a, 0x55);

    // Same opcode without a crossing is 4 cycles.
    cpu.regs.x = 0x00;
    bus.write(0x02FF, 0xAA);
    cpu.regs.pc = 0x0200;
    assert_eq!(step_cycles(&mut cpu, &mut bus), 4);
    assert_eq!(cpu.regs.a, 0xAA);
}

#[test]
fn sta_abx_never_pays_penalty() {
    let mut bus = FlatBus::new();
    let mut cpu = Mos6502::new();

    cpu.regs.a = 0x77;
    cpu.regs.x = 0x01;
    setup_program(&mut bus, &mut cpu, &[0x9D, 0xFF, 0x02]); // STA $02FF,X
    assert_eq!(step_cycles(&mut cpu, &mut bus), 5);
    assert_eq!(bus.peek(0x0300), 0x77);
}

#[test]
fn jmp_indirect_page_wrap_bug() {
    let mut bus = FlatBus::new();
    let mut cpu = Mos6502::new();

    // Pointer at $02FF: low byte at $02FF, high byte read from $0200 (not
    // $0300) because the 6502 wraps the read within the page.
    bus.write(0x02FF, 0x34);
    bus.write(0x0200, 0x12);
    bus.write(0x0300, 0x99); // must not be used
    bus.load(0x0400, &[0x6C, 0xFF, 0x02]); // JMP ($02FF)
    cpu.regs.pc = 0x0400;

    step_cycles(&mut cpu, &mut bus);
    assert_eq!(cpu.regs.pc, 0x1234);
}

#[test]
fn indexed_indirect_wraps_in_zero_page() {
    let mut bus = FlatBus::new();
    let mut cpu = Mos6502::new();

    // (zp),Y with zp = $FF: pointer low at $FF, high at $00.
    bus.write(0x00FF, 0x00);
    bus.write(0x0000, 0x03);
    bus.write(0x0302, 0x5A);
    cpu.regs.y = 0x02;
    setup_program(&mut bus, &mut cpu, &[0xB1, 0xFF]); // LDA ($FF),Y
    step_cycles(&mut cpu, &mut bus);
    assert_eq!(cpu.regs.a, 0x5A);
}

#[test]
fn exit_opcode_returns_without_running() {
    let mut bus = FlatBus::new();
    let mut cpu = Mos6502::new();

    setup_program(&mut bus, &mut cpu, &[0xE8, 0x02]); // INX; exit
    step_cycles(&mut cpu, &mut bus);
    assert_eq!(cpu.step(&mut bus), Step::Exited);
    assert_eq!(cpu.regs.pc, 0x0201, "PC left at the exit opcode");
    assert_eq!(cpu.regs.x, 1);
}

#[test]
fn kil_jams_until_reset() {
    let mut bus = FlatBus::new();
    let mut cpu = Mos6502::new();

    setup_program(&mut bus, &mut cpu, &[0x12]); // KIL
    assert_eq!(cpu.step(&mut bus), Step::Halted);
    assert_eq!(cpu.step(&mut bus), Step::Halted);
    assert!(cpu.is_jammed());

    bus.write(0xFFFC, 0x00);
    bus.write(0xFFFD, 0x80);
    cpu.reset(&mut bus);
    assert!(!cpu.is_jammed());
    assert_eq!(cpu.regs.pc, 0x8000);
}

#[test]
fn irq_respects_i_flag_and_pushes_state() {
    let mut bus = FlatBus::new();
    let mut cpu = Mos6502::new();

    bus.write(0xFFFE, 0x00);
    bus.write(0xFFFF, 0x90);
    setup_program(&mut bus, &mut cpu, &[0xE8, 0xE8]); // INX; INX
    cpu.regs.s = 0xFF;

    // I is set out of reset: IRQ line high but masked.
    cpu.set_irq(true);
    step_cycles(&mut cpu, &mut bus);
    assert_eq!(cpu.regs.pc, 0x0201, "masked IRQ does not deliver");

    cpu.regs.p.clear(flags::I);
    assert_eq!(cpu.step(&mut bus), Step::Ran(7), "IRQ delivery costs 7");
    assert_eq!(cpu.regs.pc, 0x9000);
    assert!(cpu.regs.p.is_set(flags::I));
    assert_eq!(bus.peek(0x01FF), 0x02, "pushed PCH");
    assert_eq!(bus.peek(0x01FE), 0x01, "pushed PCL");
    assert_eq!(bus.peek(0x01FD) & 0x10, 0, "pushed P has B clear");
}
