//! Differential tests: the translating driver against the interpreter.
//!
//! Random straight-line programs run to the exit opcode under both
//! drivers from identical initial states; registers, flags, the whole of
//! memory and the cycle totals must agree. The generator sticks to
//! data-processing instructions (control flow gets directed coverage
//! below and in the scenario tests) but deliberately includes decimal
//! mode, indexed addressing for the page-cross penalties, and zero-page
//! stores.

use emu_6502::{Mos6502, Status, Step};
use emu_core::{FlatBus, NullTimers};
use jit_6502::{Jit, JitConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const PROGRAM_BASE: u16 = 0x0200;
const RUNS: u32 = 1_000;
const COUNTDOWN: i64 = 1_000_000;

/// Operand policy for one pool entry.
#[derive(Clone, Copy)]
enum Operand {
    None,
    Imm,
    Zp,
    /// Absolute read: anywhere in RAM.
    AbsRead,
    /// Absolute write target: confined to the $0300 page so stores never
    /// clobber the program or the stack.
    AbsWrite,
}

/// The opcode pool: documented data-processing instructions.
const POOL: &[(u8, Operand)] = &[
    (0xA9, Operand::Imm),     // LDA #
    (0xA2, Operand::Imm),     // LDX #
    (0xA0, Operand::Imm),     // LDY #
    (0xA5, Operand::Zp),      // LDA zp
    (0xB5, Operand::Zp),      // LDA zp,X
    (0xAD, Operand::AbsRead), // LDA abs
    (0xBD, Operand::AbsRead), // LDA abs,X
    (0xB9, Operand::AbsRead), // LDA abs,Y
    (0xA1, Operand::Zp),      // LDA (zp,X)
    (0xB1, Operand::Zp),      // LDA (zp),Y
    (0xA6, Operand::Zp),      // LDX zp
    (0xB6, Operand::Zp),      // LDX zp,Y
    (0xA4, Operand::Zp),      // LDY zp
    (0x85, Operand::Zp),      // STA zp
    (0x95, Operand::Zp),      // STA zp,X
    (0x8D, Operand::AbsWrite), // STA abs
    (0x86, Operand::Zp),      // STX zp
    (0x84, Operand::Zp),      // STY zp
    (0x09, Operand::Imm),     // ORA #
    (0x05, Operand::Zp),      // ORA zp
    (0x29, Operand::Imm),     // AND #
    (0x2D, Operand::AbsRead), // AND abs
    (0x49, Operand::Imm),     // EOR #
    (0x69, Operand::Imm),     // ADC #
    (0x65, Operand::Zp),      // ADC zp
    (0x7D, Operand::AbsRead), // ADC abs,X
    (0xE9, Operand::Imm),     // SBC #
    (0xE5, Operand::Zp),      // SBC zp
    (0xC9, Operand::Imm),     // CMP #
    (0xC5, Operand::Zp),      // CMP zp
    (0xE0, Operand::Imm),     // CPX #
    (0xC0, Operand::Imm),     // CPY #
    (0x24, Operand::Zp),      // BIT zp
    (0x0A, Operand::None),    // ASL A
    (0x4A, Operand::None),    // LSR A
    (0x2A, Operand::None),    // ROL A
    (0x6A, Operand::None),    // ROR A
    (0x06, Operand::Zp),      // ASL zp
    (0x46, Operand::Zp),      // LSR zp
    (0xE6, Operand::Zp),      // INC zp
    (0xC6, Operand::Zp),      // DEC zp
    (0xE8, Operand::None),    // INX
    (0xCA, Operand::None),    // DEX
    (0xC8, Operand::None),    // INY
    (0x88, Operand::None),    // DEY
    (0xAA, Operand::None),    // TAX
    (0xA8, Operand::None),    // TAY
    (0x8A, Operand::None),    // TXA
    (0x98, Operand::None),    // TYA
    (0xBA, Operand::None),    // TSX
    (0x18, Operand::None),    // CLC
    (0x38, Operand::None),    // SEC
    (0xD8, Operand::None),    // CLD
    (0xF8, Operand::None),    // SED
    (0xB8, Operand::None),    // CLV
    (0x48, Operand::None),    // PHA
    (0x68, Operand::None),    // PLA
    (0x08, Operand::None),    // PHP
    (0x28, Operand::None),    // PLP
    (0xEA, Operand::None),    // NOP
];

/// Assemble a random program at `PROGRAM_BASE`, returning its bytes.
fn random_program(rng: &mut StdRng) -> Vec<u8> {
    let count = rng.gen_range(1..=12);
    let mut bytes = Vec::new();
    for _ in 0..count {
        let (opcode, operand) = POOL[rng.gen_range(0..POOL.len())];
        bytes.push(opcode);
        match operand {
            Operand::None => {}
            Operand::Imm | Operand::Zp => bytes.push(rng.r#gen()),
            Operand::AbsRead => {
                bytes.push(rng.r#gen());
                bytes.push(rng.r#gen());
            }
            Operand::AbsWrite => {
                bytes.push(rng.r#gen());
                bytes.push(0x03);
            }
        }
    }
    bytes.push(0x02); // exit
    bytes
}

/// A random machine state: register file plus fully randomised RAM.
fn random_state(rng: &mut StdRng, program: &[u8]) -> (FlatBus, emu_6502::Registers) {
    let mut bus = FlatBus::new();
    let mut ram = vec![0u8; 0x1_0000];
    rng.fill(&mut ram[..]);
    bus.load(0x0000, &ram);
    bus.load(PROGRAM_BASE, program);

    let mut regs = emu_6502::Registers::new();
    regs.a = rng.r#gen();
    regs.x = rng.r#gen();
    regs.y = rng.r#gen();
    regs.s = rng.gen_range(0x40..=0xFF);
    regs.p = Status::from_byte(rng.r#gen());
    regs.pc = PROGRAM_BASE;
    (bus, regs)
}

/// Run the reference interpreter to the exit opcode; returns total cycles.
fn run_interpreter(bus: &mut FlatBus, regs: emu_6502::Registers) -> (emu_6502::Registers, u64) {
    let mut cpu = Mos6502::new();
    cpu.regs = regs;
    let mut cycles = 0u64;
    loop {
        match cpu.step(bus) {
            Step::Ran(c) => cycles += u64::from(c),
            Step::Exited => return (cpu.regs, cycles),
            Step::Halted => panic!("interpreter jammed unexpectedly"),
        }
    }
}

fn run_jit(flags: &str, bus: &mut FlatBus, regs: emu_6502::Registers) -> (emu_6502::Registers, u64) {
    let config = JitConfig::from_flags(flags).unwrap_or_else(|e| panic!("{e}"));
    let mut jit = Jit::new(config).unwrap_or_else(|e| panic!("{e}"));
    *jit.registers_mut() = regs;
    jit.set_countdown(COUNTDOWN);
    jit.enter(bus, &mut NullTimers::default());
    let consumed = (COUNTDOWN - jit.countdown()) as u64;
    (jit.registers(), consumed)
}

fn assert_equivalent(
    seed: u64,
    program: &[u8],
    jit_regs: emu_6502::Registers,
    jit_cycles: u64,
    jit_bus: &FlatBus,
    ref_regs: emu_6502::Registers,
    ref_cycles: u64,
    ref_bus: &FlatBus,
) {
    let context = format!("seed {seed}, program {program:02X?}");
    assert_eq!(jit_regs.a, ref_regs.a, "A mismatch: {context}");
    assert_eq!(jit_regs.x, ref_regs.x, "X mismatch: {context}");
    assert_eq!(jit_regs.y, ref_regs.y, "Y mismatch: {context}");
    assert_eq!(jit_regs.s, ref_regs.s, "S mismatch: {context}");
    assert_eq!(jit_regs.pc, ref_regs.pc, "PC mismatch: {context}");
    assert_eq!(
        jit_regs.p.to_byte(),
        ref_regs.p.to_byte(),
        "P mismatch: {context}"
    );
    assert_eq!(jit_cycles, ref_cycles, "cycle mismatch: {context}");
    for addr in 0..=0xFFFFu16 {
        assert_eq!(
            jit_bus.peek(addr),
            ref_bus.peek(addr),
            "memory mismatch at ${addr:04X}: {context}"
        );
    }
}

/// Invariants 1-3: for random programs and initial states, the compiled
/// result matches the interpreter in registers, flags, memory and cycle
/// totals, page-crossing penalties included.
#[test]
fn random_programs_match_interpreter() {
    let mut rng = StdRng::seed_from_u64(0x6502_6502);
    for _ in 0..RUNS {
        let program = random_program(&mut rng);
        let seed: u64 = rng.r#gen();
        let mut state_rng = StdRng::seed_from_u64(seed);

        let (mut ref_bus, regs) = random_state(&mut state_rng, &program);
        let mut state_rng = StdRng::seed_from_u64(seed);
        let (mut jit_bus, jit_start) = random_state(&mut state_rng, &program);
        assert_eq!(regs, jit_start, "state generation must be deterministic");

        let (ref_regs, ref_cycles) = run_interpreter(&mut ref_bus, regs);
        let (jit_regs, jit_cycles) = run_jit("", &mut jit_bus, regs);

        assert_equivalent(
            seed, &program, jit_regs, jit_cycles, &jit_bus, ref_regs, ref_cycles,
            &ref_bus,
        );
    }
}

/// The same sweep without the optimiser: the unoptimised lowering is its
/// own implementation path and must agree too.
#[test]
fn random_programs_match_interpreter_unoptimized() {
    let mut rng = StdRng::seed_from_u64(0xBEEB);
    for _ in 0..200 {
        let program = random_program(&mut rng);
        let seed: u64 = rng.r#gen();

        let mut state_rng = StdRng::seed_from_u64(seed);
        let (mut ref_bus, regs) = random_state(&mut state_rng, &program);
        let mut state_rng = StdRng::seed_from_u64(seed);
        let (mut jit_bus, _) = random_state(&mut state_rng, &program);

        let (ref_regs, ref_cycles) = run_interpreter(&mut ref_bus, regs);
        let (jit_regs, jit_cycles) = run_jit("optimizing=0", &mut jit_bus, regs);

        assert_equivalent(
            seed, &program, jit_regs, jit_cycles, &jit_bus, ref_regs, ref_cycles,
            &ref_bus,
        );
    }
}

/// Directed branch coverage: taken, not taken, and page-crossing taken
/// branches agree with the interpreter, including the cycle penalties.
#[test]
fn branches_match_interpreter() {
    // LDX #3; loop: DEX; BNE loop; exit -- plus a page-crossing variant.
    let programs: &[&[u8]] = &[
        &[0xA2, 0x03, 0xCA, 0xD0, 0xFD, 0x02],
        &[0xA9, 0x00, 0xF0, 0x01, 0xE8, 0x02], // BEQ over INX
        &[0xA9, 0x01, 0xF0, 0x01, 0xE8, 0x02], // BEQ not taken
    ];
    for program in programs {
        let mut ref_bus = FlatBus::new();
        ref_bus.load(PROGRAM_BASE, program);
        let mut jit_bus = FlatBus::new();
        jit_bus.load(PROGRAM_BASE, program);

        let mut regs = emu_6502::Registers::new();
        regs.pc = PROGRAM_BASE;

        let (ref_regs, ref_cycles) = run_interpreter(&mut ref_bus, regs);
        let (jit_regs, jit_cycles) = run_jit("", &mut jit_bus, regs);
        assert_eq!(jit_regs.pc, ref_regs.pc, "program {program:02X?}");
        assert_eq!(jit_regs.x, ref_regs.x);
        assert_eq!(jit_cycles, ref_cycles, "cycles for {program:02X?}");
    }

    // Page-crossing taken branch: place it near a page edge.
    let mut ref_bus = FlatBus::new();
    let mut jit_bus = FlatBus::new();
    // At $02F8: LDA #0; BEQ +$10 -> $030C (crosses into $03xx); exit there.
    for bus in [&mut ref_bus, &mut jit_bus] {
        bus.load(0x02F8, &[0xA9, 0x00, 0xF0, 0x10]);
        bus.load(0x030C, &[0x02]);
    }
    let mut regs = emu_6502::Registers::new();
    regs.pc = 0x02F8;
    let (ref_regs, ref_cycles) = run_interpreter(&mut ref_bus, regs);
    let (jit_regs, jit_cycles) = run_jit("", &mut jit_bus, regs);
    assert_eq!(jit_regs.pc, ref_regs.pc);
    assert_eq!(jit_cycles, ref_cycles, "page-crossing branch penalty");
}

/// JSR/RTS and BRK/RTI stack discipline against the interpreter.
#[test]
fn subroutines_and_interrupt_returns_match() {
    let mut ref_bus = FlatBus::new();
    let mut jit_bus = FlatBus::new();
    for bus in [&mut ref_bus, &mut jit_bus] {
        // JSR $0240; INX; exit / subroutine: INY; RTS
        bus.load(0x0200, &[0x20, 0x40, 0x02, 0xE8, 0x02]);
        bus.load(0x0240, &[0xC8, 0x60]);
        // BRK handler at $0280: DEY; RTI. Vector points at it.
        bus.load(0x0280, &[0x88, 0x40]);
        bus.load(0xFFFE, &[0x80, 0x02]);
    }

    let mut regs = emu_6502::Registers::new();
    regs.pc = 0x0200;
    let (ref_regs, ref_cycles) = run_interpreter(&mut ref_bus, regs);
    let (jit_regs, jit_cycles) = run_jit("", &mut jit_bus, regs);
    assert_eq!(jit_regs, ref_regs);
    assert_eq!(jit_cycles, ref_cycles);

    // And with a BRK in the main line.
    for bus in [&mut ref_bus, &mut jit_bus] {
        bus.load(0x0300, &[0x00, 0xEA, 0xE8, 0x02]); // BRK; (skipped); INX; exit
    }
    let mut regs = emu_6502::Registers::new();
    regs.pc = 0x0300;
    let (ref_regs, ref_cycles) = run_interpreter(&mut ref_bus, regs);
    let (jit_regs, jit_cycles) = run_jit("", &mut jit_bus, regs);
    assert_eq!(jit_regs, ref_regs);
    assert_eq!(jit_cycles, ref_cycles);
}

/// Round-trip law: a dynamic-operand slot fed arbitrary operand writes
/// stays equal to the interpreter over the same writes.
#[test]
fn dynamic_operand_matches_interpreter_over_writes() {
    let program = [0xA9, 0x00, 0x8D, 0x00, 0x03, 0x02]; // LDA #imm; STA $0300; exit
    let mut jit_bus = FlatBus::new();
    jit_bus.load(PROGRAM_BASE, &program);

    let config = JitConfig::default();
    let mut jit = Jit::new(config).unwrap_or_else(|e| panic!("{e}"));

    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..32 {
        let value: u8 = rng.r#gen();
        // Rewrite the LDA operand through the write-notification channel.
        jit_bus.load(PROGRAM_BASE + 1, &[value]);
        jit.memory_written(PROGRAM_BASE + 1);

        let mut ref_bus = FlatBus::new();
        ref_bus.load(PROGRAM_BASE, &program);
        ref_bus.load(PROGRAM_BASE + 1, &[value]);
        let mut regs = emu_6502::Registers::new();
        regs.pc = PROGRAM_BASE;
        let (ref_regs, _) = run_interpreter(&mut ref_bus, regs);

        *jit.registers_mut() = regs;
        jit.set_countdown(COUNTDOWN);
        jit.enter(&mut jit_bus, &mut NullTimers::default());

        assert_eq!(jit.registers().a, ref_regs.a, "operand {value:#04X}");
        assert_eq!(jit_bus.peek(0x0300), ref_bus.peek(0x0300));
    }
    // The churn must have promoted the operand byte.
    assert!(jit.is_dynamic(PROGRAM_BASE + 1));
}
