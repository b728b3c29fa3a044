//! Block decoder: 6502 bytes to uops.
//!
//! A block is a straight-line run of instructions starting at one address.
//! Decoding stops at unconditional control flow, at the instruction
//! budget, at bytes owned by another live block, and at memory-mapped
//! register addresses. Undecodable opcodes lower to an interpreter trap,
//! never an error.

use emu_6502::opcodes::{self, AddrMode, OpType};
use emu_core::Bus;

use crate::config::JitConfig;
use crate::metadata::Metadata;
use crate::stats::Stats;
use crate::uop::{AluOp, Addr16, Cond, Imm8, NzSrc, Reg, ShiftOp, TReg, Uop};

/// One decoded 6502 instruction and its lowering.
#[derive(Debug, Clone)]
pub struct DecodedInstr {
    /// 6502 address of the opcode byte.
    pub addr: u16,
    /// The opcode byte as read at decode time.
    pub opcode: u8,
    /// Instruction length in bytes.
    pub len: u8,
    /// Cycles charged at this instruction's boundary. Merging folds the
    /// cost of absorbed instructions into their owner.
    pub cycles: u8,
    /// Lowered uops; empty for an instruction absorbed by a merge.
    pub uops: Vec<Uop>,
    /// True when a preceding instruction's uops cover this one.
    pub merged: bool,
    /// Compiled with run-time operand fetches.
    pub dyn_operand: bool,
    /// Compiled as a run-time opcode dispatch (interpreter).
    pub dyn_opcode: bool,
}

impl DecodedInstr {
    /// True when this instruction ends with a uop that leaves the block.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.uops.last().is_some_and(|u| u.is_terminal())
            || matches!(self.uops.last(), Some(Uop::Interp { .. }))
    }
}

/// A decoded block: the translation unit.
#[derive(Debug, Clone)]
pub struct Block {
    pub start: u16,
    pub instrs: Vec<DecodedInstr>,
}

impl Block {
    /// First address past the block. Saturates at the top of the address
    /// space; blocks never wrap.
    #[must_use]
    pub fn end(&self) -> u32 {
        self.instrs
            .iter()
            .fold(u32::from(self.start), |a, i| a + u32::from(i.len))
    }
}

/// Decode a block starting at `start`.
pub fn decode_block<B: Bus>(
    bus: &B,
    metadata: &Metadata,
    stats: &Stats,
    config: &JitConfig,
    start: u16,
) -> Block {
    let mem = bus.mem();
    let mut instrs: Vec<DecodedInstr> = Vec::new();
    let mut pc = u32::from(start);
    let max_ops = config.effective_max_ops();

    while (instrs.len() as u32) < max_ops && pc <= 0xFFFF {
        let addr = pc as u16;
        let opcode = mem[pc as usize];
        let len = u32::from(opcodes::length(opcode));

        if pc + len > 0x1_0000 {
            // The instruction would wrap the address space; the vectors
            // live up there, real code does not.
            break;
        }

        // A byte already owned by a different live block ends this one.
        let owned_elsewhere = (pc..pc + len).any(|a| {
            let owner = metadata.code_block(a as u16);
            owner != -1 && owner != i32::from(start)
        });
        if owned_elsewhere && !instrs.is_empty() {
            break;
        }

        // Code fetched from hardware registers goes to the interpreter,
        // one instruction per block.
        let special_code = (pc..pc + len).any(|a| bus.is_special(a as u16));
        if special_code {
            if instrs.is_empty() {
                instrs.push(interp_instr(addr, opcode));
            }
            break;
        }

        let dyn_opcode =
            config.dynamic_opcode && stats.wants_dynamic_opcode(addr, config);
        if dyn_opcode {
            // Run-time dispatch: length is unknowable at compile time, so
            // the block must end here.
            let mut instr = interp_instr(addr, opcode);
            instr.dyn_opcode = true;
            instrs.push(instr);
            break;
        }

        let dyn_operand = config.dynamic_operand
            && stats.wants_dynamic_operand(addr, len as u8, config);
        let instr = lower(bus, addr, opcode, dyn_operand, config);
        let terminal = instr.is_terminal();
        instrs.push(instr);
        if terminal {
            break;
        }
        pc += len;
    }

    if instrs.is_empty() {
        // Budget of zero or an immediate boundary: still make progress.
        instrs.push(interp_instr(start, mem[start as usize]));
    }

    Block { start, instrs }
}

/// The interpreter-trap lowering used for undocumented opcodes, hardware
/// register touches and dynamic-opcode slots.
fn interp_instr(addr: u16, opcode: u8) -> DecodedInstr {
    DecodedInstr {
        addr,
        opcode,
        len: opcodes::length(opcode),
        cycles: 0,
        uops: vec![Uop::Interp { addr }],
        merged: false,
        dyn_operand: false,
        dyn_opcode: false,
    }
}

/// Lower one instruction to uops.
fn lower<B: Bus>(
    bus: &B,
    addr: u16,
    opcode: u8,
    dyn_operand: bool,
    config: &JitConfig,
) -> DecodedInstr {
    let mem = bus.mem();
    let optype = opcodes::OPTYPES[opcode as usize];
    let mode = opcodes::OPMODES[opcode as usize];
    let len = opcodes::length(opcode);
    // A jam (or the harness exit) never reaches a countable boundary.
    let cycles = if optype == OpType::Kil {
        0
    } else {
        opcodes::CYCLES[opcode as usize]
    };
    let op1 = mem[addr.wrapping_add(1) as usize];
    let op2 = mem[addr.wrapping_add(2) as usize];
    let abs = u16::from_le_bytes([op1, op2]);
    let op_addr = addr.wrapping_add(1);

    let imm8 = |v: u8| {
        if dyn_operand {
            Imm8::Mem(op_addr)
        } else {
            Imm8::Const(v)
        }
    };
    let addr16 = |v: u16| {
        if dyn_operand {
            Addr16::Mem(op_addr)
        } else {
            Addr16::Const(v)
        }
    };

    let mut uops: Vec<Uop> = Vec::new();

    // Undocumented opcodes trap to the interpreter.
    if optype == OpType::Unk {
        return interp_instr(addr, opcode);
    }

    // Constant-address data accesses to hardware registers go to the
    // interpreter whole; run-time-computed addresses are checked by the
    // emitted scratch accesses instead.
    let data_addr = match mode {
        AddrMode::Zpg => Some(u16::from(op1)),
        AddrMode::Abs if !matches!(optype, OpType::Jmp | OpType::Jsr) => Some(abs),
        _ => None,
    };
    if let Some(a) = data_addr {
        if bus.is_special(a) {
            return interp_instr(addr, opcode);
        }
    }

    // Mode uop, where the addressing needs the scratch register.
    let penalty = config.accurate_cycles && opcodes::page_cross_penalty(opcode);
    let scratch = match mode {
        AddrMode::Zpx => {
            uops.push(Uop::ModeZpx { base: imm8(op1) });
            true
        }
        AddrMode::Zpy => {
            uops.push(Uop::ModeZpy { base: imm8(op1) });
            true
        }
        AddrMode::Abx => {
            uops.push(Uop::ModeAbx { base: addr16(abs) });
            if penalty {
                uops.push(Uop::CheckPagePenalty);
            }
            true
        }
        AddrMode::Aby => {
            uops.push(Uop::ModeAby { base: addr16(abs) });
            if penalty {
                uops.push(Uop::CheckPagePenalty);
            }
            true
        }
        AddrMode::Idx => {
            uops.push(Uop::ModeIdx { zp: imm8(op1) });
            true
        }
        AddrMode::Idy => {
            uops.push(Uop::ModeIdy { zp: imm8(op1) });
            if penalty {
                uops.push(Uop::CheckPagePenalty);
            }
            true
        }
        _ => false,
    };

    // Dynamic operands on control flow degrade to the interpreter; the
    // branch target cannot be baked.
    if dyn_operand
        && matches!(
            optype,
            OpType::Jmp | OpType::Jsr | OpType::Bpl | OpType::Bmi | OpType::Bvc
                | OpType::Bvs | OpType::Bcc | OpType::Bcs | OpType::Bne | OpType::Beq
        )
    {
        return interp_instr(addr, opcode);
    }

    // The memory source for read ops in the non-scratch modes.
    let mem_src = addr16(match mode {
        AddrMode::Zpg => u16::from(op1),
        _ => abs,
    });

    match optype {
        OpType::Lda | OpType::Ldx | OpType::Ldy => {
            let reg = match optype {
                OpType::Lda => Reg::A,
                OpType::Ldx => Reg::X,
                _ => Reg::Y,
            };
            if scratch {
                uops.push(Uop::LoadScratch { reg });
            } else if mode == AddrMode::Imm {
                uops.push(Uop::LoadImm { reg, value: imm8(op1) });
            } else {
                uops.push(Uop::LoadMem { reg, addr: mem_src });
            }
            let src = match reg {
                Reg::A => NzSrc::A,
                Reg::X => NzSrc::X,
                Reg::Y => NzSrc::Y,
            };
            uops.push(Uop::FlagsNz { src, n: true, z: true });
        }
        OpType::Sta | OpType::Stx | OpType::Sty => {
            let reg = match optype {
                OpType::Sta => Reg::A,
                OpType::Stx => Reg::X,
                _ => Reg::Y,
            };
            if scratch {
                uops.push(Uop::StoreScratch { reg });
            } else {
                uops.push(Uop::StoreMem { reg, addr: mem_src });
            }
        }
        OpType::Ora | OpType::And | OpType::Eor | OpType::Adc | OpType::Sbc
        | OpType::Cmp | OpType::Cpx | OpType::Cpy => {
            let op = match optype {
                OpType::Ora => AluOp::Ora,
                OpType::And => AluOp::And,
                OpType::Eor => AluOp::Eor,
                OpType::Adc => AluOp::Adc,
                OpType::Sbc => AluOp::Sbc,
                OpType::Cmp => AluOp::Cmp,
                OpType::Cpx => AluOp::Cpx,
                _ => AluOp::Cpy,
            };
            if scratch {
                uops.push(Uop::AluScratch { op });
            } else if mode == AddrMode::Imm {
                uops.push(Uop::AluImm { op, value: imm8(op1) });
            } else {
                uops.push(Uop::AluMem { op, addr: mem_src });
            }
            uops.push(Uop::FlagsNz { src: NzSrc::Last, n: true, z: true });
        }
        OpType::Bit => {
            uops.push(Uop::BitMem { addr: mem_src });
        }
        OpType::Asl | OpType::Lsr | OpType::Rol | OpType::Ror => {
            let op = match optype {
                OpType::Asl => ShiftOp::Asl,
                OpType::Lsr => ShiftOp::Lsr,
                OpType::Rol => ShiftOp::Rol,
                _ => ShiftOp::Ror,
            };
            if mode == AddrMode::Acc {
                uops.push(Uop::ShiftAcc { op, by: 1 });
            } else if scratch {
                uops.push(Uop::ShiftScratch { op });
            } else {
                uops.push(Uop::ShiftMem { op, addr: mem_src });
            }
            uops.push(Uop::FlagsNz { src: NzSrc::Last, n: true, z: true });
        }
        OpType::Inc | OpType::Dec => {
            let delta: i8 = if optype == OpType::Inc { 1 } else { -1 };
            if scratch {
                uops.push(Uop::IncScratch { delta });
            } else {
                uops.push(Uop::IncMem { delta, addr: mem_src });
            }
            uops.push(Uop::FlagsNz { src: NzSrc::Last, n: true, z: true });
        }
        OpType::Inx | OpType::Dex => {
            let delta: i8 = if optype == OpType::Inx { 1 } else { -1 };
            uops.push(Uop::IncReg { reg: Reg::X, delta });
            uops.push(Uop::FlagsNz { src: NzSrc::X, n: true, z: true });
        }
        OpType::Iny | OpType::Dey => {
            let delta: i8 = if optype == OpType::Iny { 1 } else { -1 };
            uops.push(Uop::IncReg { reg: Reg::Y, delta });
            uops.push(Uop::FlagsNz { src: NzSrc::Y, n: true, z: true });
        }
        OpType::Tax => {
            uops.push(Uop::Transfer { from: TReg::A, to: TReg::X });
            uops.push(Uop::FlagsNz { src: NzSrc::X, n: true, z: true });
        }
        OpType::Tay => {
            uops.push(Uop::Transfer { from: TReg::A, to: TReg::Y });
            uops.push(Uop::FlagsNz { src: NzSrc::Y, n: true, z: true });
        }
        OpType::Txa => {
            uops.push(Uop::Transfer { from: TReg::X, to: TReg::A });
            uops.push(Uop::FlagsNz { src: NzSrc::A, n: true, z: true });
        }
        OpType::Tya => {
            uops.push(Uop::Transfer { from: TReg::Y, to: TReg::A });
            uops.push(Uop::FlagsNz { src: NzSrc::A, n: true, z: true });
        }
        OpType::Tsx => {
            uops.push(Uop::Transfer { from: TReg::S, to: TReg::X });
            uops.push(Uop::FlagsNz { src: NzSrc::X, n: true, z: true });
        }
        OpType::Txs => {
            uops.push(Uop::Transfer { from: TReg::X, to: TReg::S });
        }
        OpType::Pha => uops.push(Uop::PushA),
        OpType::Pla => {
            uops.push(Uop::PullA);
            uops.push(Uop::FlagsNz { src: NzSrc::A, n: true, z: true });
        }
        OpType::Php => uops.push(Uop::PushP),
        OpType::Plp => uops.push(Uop::PullP),
        OpType::Clc => uops.push(Uop::SetC(false)),
        OpType::Sec => uops.push(Uop::SetC(true)),
        OpType::Cli => uops.push(Uop::SetI(false)),
        OpType::Sei => uops.push(Uop::SetI(true)),
        OpType::Cld => uops.push(Uop::SetD(false)),
        OpType::Sed => uops.push(Uop::SetD(true)),
        OpType::Clv => uops.push(Uop::ClearV),
        OpType::Nop => {}
        OpType::Bpl | OpType::Bmi | OpType::Bvc | OpType::Bvs | OpType::Bcc
        | OpType::Bcs | OpType::Bne | OpType::Beq => {
            let cond = match optype {
                OpType::Bpl => Cond::Pl,
                OpType::Bmi => Cond::Mi,
                OpType::Bvc => Cond::Vc,
                OpType::Bvs => Cond::Vs,
                OpType::Bcc => Cond::Cc,
                OpType::Bcs => Cond::Cs,
                OpType::Bne => Cond::Ne,
                _ => Cond::Eq,
            };
            let target = addr.wrapping_add(2).wrapping_add(op1 as i8 as u16);
            uops.push(Uop::Branch { cond, target });
        }
        OpType::Jmp => {
            if mode == AddrMode::Ind {
                uops.push(Uop::JumpInd { ptr: abs });
            } else {
                uops.push(Uop::Jump { target: abs });
            }
        }
        OpType::Jsr => {
            uops.push(Uop::Jsr { target: abs, ret: addr.wrapping_add(2) });
        }
        OpType::Rts => uops.push(Uop::Rts),
        OpType::Rti => uops.push(Uop::Rti),
        OpType::Brk => uops.push(Uop::Brk { ret: addr.wrapping_add(2) }),
        OpType::Kil => {
            if opcode == emu_6502::EXIT_OPCODE {
                uops.push(Uop::Exit { addr });
            } else {
                uops.push(Uop::Halt { addr });
            }
        }
        OpType::Unk => unreachable!(),
    }

    DecodedInstr {
        addr,
        opcode,
        len,
        cycles,
        uops,
        merged: false,
        dyn_operand,
        dyn_opcode: false,
    }
}
