//! ARM64 backend.
//!
//! Register binding (all 32-bit views unless noted):
//!
//! | host | 6502 |
//! |------|------|
//! | `w19` | A |
//! | `w20` | X |
//! | `w21` | Y |
//! | `w22` | S |
//! | `x23` | emulated memory base (64-bit) |
//! | `w24` | scratch / effective address |
//! | `w25` | carry (0/1) |
//! | `w26` | zero (0/1) |
//! | `w27` | negative (0/1) |
//! | `w28` | overflow (0/1) |
//! | `w10` | I and D flag bits (status-byte positions) |
//! | `w9`  | page-crossing latch |
//! | `x13` | countdown (64-bit) |
//! | `x15` | context pointer (trampoline table, 64-bit) |
//! | `w12` | last 8-bit result, for flag materialisation |
//! | `w16`, `w17` | temporaries |
//! | `x29` | compile trampoline (invalidation target) |
//!
//! Execution of this backend's output is not wired up yet; the emitter
//! compiles and is exercised by inspection tests only. The merged
//! store-immediate uop is declined: ARM64 has no store-immediate-to-memory
//! instruction, so keeping the original load/store pair avoids an extra
//! constant load.

use crate::JitError;
use crate::uop::{AluOp, Addr16, Cond, Imm8, NzSrc, Reg, ShiftOp, TReg, Uop};

use super::{Backend, BranchKind, CapacityError, EmitCtx};

/// Trampoline-table byte offsets from the context pointer in `x15`.
pub mod ctx_offset {
    pub const COMPILE: u16 = 0x00;
    pub const INTERP: u16 = 0x08;
    pub const TIMER: u16 = 0x10;
    pub const DEBUG: u16 = 0x18;
    pub const DISPATCH: u16 = 0x20;
    pub const HALT: u16 = 0x28;
}

/// `brk #0`: slot filler.
const BRK_WORD: u32 = 0xD420_0000;

// Register numbers.
const A: u32 = 19;
const X: u32 = 20;
const Y: u32 = 21;
const S: u32 = 22;
const MEM: u32 = 23;
const EA: u32 = 24;
const FC: u32 = 25;
const FZ: u32 = 26;
const FN: u32 = 27;
const FV: u32 = 28;
const FLAGS_ID: u32 = 10;
const CROSSED: u32 = 9;
const LAST: u32 = 12;
const COUNTDOWN: u32 = 13;
const CTX: u32 = 15;
const T0: u32 = 16;
const T1: u32 = 17;
const WZR: u32 = 31;

// A64 condition codes.
const COND_EQ: u32 = 0x0;
const COND_NE: u32 = 0x1;
const COND_CS: u32 = 0x2;

const fn movz(rd: u32, imm16: u32) -> u32 {
    0x5280_0000 | (imm16 << 5) | rd
}

const fn mov_reg(rd: u32, rm: u32) -> u32 {
    // orr wd, wzr, wm
    0x2A00_03E0 | (rm << 16) | rd
}

const fn add_imm(rd: u32, rn: u32, imm12: u32) -> u32 {
    0x1100_0000 | (imm12 << 10) | (rn << 5) | rd
}

const fn sub_imm(rd: u32, rn: u32, imm12: u32) -> u32 {
    0x5100_0000 | (imm12 << 10) | (rn << 5) | rd
}

const fn sub_imm64(rd: u32, rn: u32, imm12: u32) -> u32 {
    0xD100_0000 | (imm12 << 10) | (rn << 5) | rd
}

const fn add_reg(rd: u32, rn: u32, rm: u32) -> u32 {
    0x0B00_0000 | (rm << 16) | (rn << 5) | rd
}

const fn sub_reg(rd: u32, rn: u32, rm: u32) -> u32 {
    0x4B00_0000 | (rm << 16) | (rn << 5) | rd
}

const fn sub_reg64(rd: u32, rn: u32, rm: u32) -> u32 {
    0xCB00_0000 | (rm << 16) | (rn << 5) | rd
}

const fn and_reg(rd: u32, rn: u32, rm: u32) -> u32 {
    0x0A00_0000 | (rm << 16) | (rn << 5) | rd
}

const fn orr_reg(rd: u32, rn: u32, rm: u32) -> u32 {
    0x2A00_0000 | (rm << 16) | (rn << 5) | rd
}

const fn eor_reg(rd: u32, rn: u32, rm: u32) -> u32 {
    0x4A00_0000 | (rm << 16) | (rn << 5) | rd
}

const fn ldrb_imm(rt: u32, rn: u32, imm12: u32) -> u32 {
    0x3940_0000 | (imm12 << 10) | (rn << 5) | rt
}

const fn strb_imm(rt: u32, rn: u32, imm12: u32) -> u32 {
    0x3900_0000 | (imm12 << 10) | (rn << 5) | rt
}

const fn ldrb_reg(rt: u32, rn: u32, rm: u32) -> u32 {
    0x3860_6800 | (rm << 16) | (rn << 5) | rt
}

const fn strb_reg(rt: u32, rn: u32, rm: u32) -> u32 {
    0x3820_6800 | (rm << 16) | (rn << 5) | rt
}

const fn ldr_x_imm(rt: u32, rn: u32, byte_off: u32) -> u32 {
    0xF940_0000 | ((byte_off / 8) << 10) | (rn << 5) | rt
}

/// UBFM-based unsigned bitfield extract.
const fn ubfx(rd: u32, rn: u32, lsb: u32, width: u32) -> u32 {
    0x5300_0000 | (lsb << 16) | ((lsb + width - 1) << 10) | (rn << 5) | rd
}

const fn lsl_imm(rd: u32, rn: u32, shift: u32) -> u32 {
    let immr = (32 - shift) % 32;
    let imms = 31 - shift;
    0x5300_0000 | (immr << 16) | (imms << 10) | (rn << 5) | rd
}

const fn lsr_imm(rd: u32, rn: u32, shift: u32) -> u32 {
    0x5300_0000 | (shift << 16) | (31 << 10) | (rn << 5) | rd
}

const fn cmp_imm(rn: u32, imm12: u32) -> u32 {
    // subs wzr, wn, #imm
    0x7100_0000 | (imm12 << 10) | (rn << 5) | WZR
}

const fn cmp_reg(rn: u32, rm: u32) -> u32 {
    0x6B00_0000 | (rm << 16) | (rn << 5) | WZR
}

const fn cset(rd: u32, cond: u32) -> u32 {
    // csinc wd, wzr, wzr, inv(cond)
    0x1A9F_07E0 | ((cond ^ 1) << 12) | rd
}

const fn cbz(rt: u32, words: i32) -> u32 {
    0x3400_0000 | (((words as u32) & 0x7FFFF) << 5) | rt
}

const fn cbnz(rt: u32, words: i32) -> u32 {
    0x3500_0000 | (((words as u32) & 0x7FFFF) << 5) | rt
}

const fn tbz(rt: u32, bit: u32, words: i32) -> u32 {
    0x3600_0000 | (bit << 19) | (((words as u32) & 0x3FFF) << 5) | rt
}

const fn b(words: i32) -> u32 {
    0x1400_0000 | ((words as u32) & 0x03FF_FFFF)
}

const fn b_cond(cond: u32, words: i32) -> u32 {
    0x5400_0000 | (((words as u32) & 0x7FFFF) << 5) | cond
}

const fn blr(rn: u32) -> u32 {
    0xD63F_0000 | (rn << 5)
}

const fn ret() -> u32 {
    0xD65F_03C0
}

#[derive(Debug, Default)]
pub struct Arm64Backend;

impl Arm64Backend {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn put(ctx: &mut EmitCtx, word: u32) -> Result<(), CapacityError> {
        ctx.put(&word.to_le_bytes())
    }

    fn put_all(ctx: &mut EmitCtx, words: &[u32]) -> Result<(), CapacityError> {
        for &w in words {
            Self::put(ctx, w)?;
        }
        Ok(())
    }

    /// Load a 16-bit constant into a register.
    fn load_imm16(ctx: &mut EmitCtx, rd: u32, v: u16) -> Result<(), CapacityError> {
        Self::put(ctx, movz(rd, u32::from(v)))
    }

    /// Load a byte of emulated memory at a constant address into `rt`.
    /// Self-contained: `rt` doubles as the address temporary.
    fn load_mem_const(ctx: &mut EmitCtx, rt: u32, addr: u16) -> Result<(), CapacityError> {
        if addr < 0x1000 {
            Self::put(ctx, ldrb_imm(rt, MEM, u32::from(addr)))
        } else {
            Self::load_imm16(ctx, rt, addr)?;
            Self::put(ctx, ldrb_reg(rt, MEM, rt))
        }
    }

    /// Store `rt` to emulated memory at a constant address, using `tmp`
    /// for the address when it exceeds the immediate-offset range.
    fn store_mem_const(
        ctx: &mut EmitCtx,
        rt: u32,
        addr: u16,
        tmp: u32,
    ) -> Result<(), CapacityError> {
        if addr < 0x1000 {
            Self::put(ctx, strb_imm(rt, MEM, u32::from(addr)))
        } else {
            Self::load_imm16(ctx, tmp, addr)?;
            Self::put(ctx, strb_reg(rt, MEM, tmp))
        }
    }

    /// Assemble a 16-bit operand (little-endian pair at `op_addr`) into
    /// `rd` at run time.
    fn fetch_operand16(ctx: &mut EmitCtx, rd: u32, op_addr: u16) -> Result<(), CapacityError> {
        let tmp = if rd == T1 { T0 } else { T1 };
        Self::load_mem_const(ctx, rd, op_addr)?;
        Self::load_mem_const(ctx, tmp, op_addr.wrapping_add(1))?;
        Self::put_all(ctx, &[lsl_imm(tmp, tmp, 8), orr_reg(rd, rd, tmp)])
    }

    /// Finish an indexed mode: `EA = base + idx`, page-crossing latch.
    fn index_with_crossing(ctx: &mut EmitCtx, idx: u32) -> Result<(), CapacityError> {
        // base is in EA already (full 16-bit value).
        Self::put_all(ctx, &[
            add_reg(T0, EA, idx),
            ubfx(T0, T0, 0, 16),
            eor_reg(T1, T0, EA),
            lsr_imm(T1, T1, 8),
            cmp_imm(T1, 0),
            cset(CROSSED, COND_NE),
            mov_reg(EA, T0),
        ])
    }

    /// Decimal-mode detour for ADC/SBC: `tbz w10, #3, +3; ldr x16,
    /// [x15, #INTERP]; blr x16`. The trampoline resumes at the next
    /// boundary rather than returning.
    fn bcd_guard(ctx: &mut EmitCtx) -> Result<(), CapacityError> {
        Self::put_all(ctx, &[
            tbz(FLAGS_ID, 3, 3),
            ldr_x_imm(T0, CTX, u32::from(ctx_offset::INTERP)),
            blr(T0),
        ])
    }

    /// Call a context trampoline with the 6502 address argument in `w0`.
    fn call_context(ctx: &mut EmitCtx, off: u16, addr_arg: Option<u16>) -> Result<(), CapacityError> {
        if let Some(a) = addr_arg {
            Self::put(ctx, movz(0, u32::from(a)))?;
        }
        Self::put_all(ctx, &[ldr_x_imm(T0, CTX, u32::from(off)), blr(T0)])
    }

    /// Push `rt` onto the 6502 stack.
    fn push_byte(ctx: &mut EmitCtx, rt: u32) -> Result<(), CapacityError> {
        Self::put_all(ctx, &[
            // stack address = 0x100 | S
            movz(T1, 0x100),
            orr_reg(T1, T1, S),
            strb_reg(rt, MEM, T1),
            sub_imm(S, S, 1),
            ubfx(S, S, 0, 8),
        ])
    }

    /// Pull a byte from the 6502 stack into `rt`.
    fn pull_byte(ctx: &mut EmitCtx, rt: u32) -> Result<(), CapacityError> {
        Self::put_all(ctx, &[
            add_imm(S, S, 1),
            ubfx(S, S, 0, 8),
            movz(T1, 0x100),
            orr_reg(T1, T1, S),
            ldrb_reg(rt, MEM, T1),
        ])
    }

    /// Assemble the status byte into `rt` (B and unused set).
    fn status_to(ctx: &mut EmitCtx, rt: u32) -> Result<(), CapacityError> {
        Self::put_all(ctx, &[
            mov_reg(rt, FLAGS_ID),
            orr_reg(rt, rt, FC),
            lsl_imm(T1, FZ, 1),
            orr_reg(rt, rt, T1),
            lsl_imm(T1, FV, 6),
            orr_reg(rt, rt, T1),
            lsl_imm(T1, FN, 7),
            orr_reg(rt, rt, T1),
            movz(T1, 0x30),
            orr_reg(rt, rt, T1),
        ])
    }

    /// Scatter a status byte in `rt` back into the flag registers.
    fn status_from(ctx: &mut EmitCtx, rt: u32) -> Result<(), CapacityError> {
        Self::put_all(ctx, &[
            ubfx(FC, rt, 0, 1),
            ubfx(FZ, rt, 1, 1),
            ubfx(FV, rt, 6, 1),
            ubfx(FN, rt, 7, 1),
            // Keep I and D only in the residue.
            ubfx(T1, rt, 2, 2),
            lsl_imm(FLAGS_ID, T1, 2),
        ])
    }

    /// N/Z materialisation from an 8-bit value register.
    fn flags_from(ctx: &mut EmitCtx, rv: u32, n: bool, z: bool) -> Result<(), CapacityError> {
        if z {
            Self::put_all(ctx, &[cmp_imm(rv, 0), cset(FZ, COND_EQ)])?;
        }
        if n {
            Self::put(ctx, ubfx(FN, rv, 7, 1))?;
        }
        Ok(())
    }

    /// Binary ADC/SBC core: operand byte in `T0`, result to A, flags out.
    fn adc_core(ctx: &mut EmitCtx, subtract: bool) -> Result<(), CapacityError> {
        if subtract {
            // SBC is ADC of the one's complement.
            Self::put_all(ctx, &[
                movz(T1, 0xFF),
                eor_reg(T0, T0, T1),
            ])?;
        }
        Self::put_all(ctx, &[
            add_reg(LAST, A, T0),
            add_reg(LAST, LAST, FC),
            // Overflow from the sign interplay of the 9-bit sum.
            eor_reg(T1, A, LAST),
            eor_reg(T0, T0, LAST),
            and_reg(T1, T1, T0),
            ubfx(FV, T1, 7, 1),
            ubfx(FC, LAST, 8, 1),
            ubfx(LAST, LAST, 0, 8),
            mov_reg(A, LAST),
        ])
    }

    /// Load the ALU operand byte into `T0` for each source form.
    fn alu_operand(ctx: &mut EmitCtx, src: AluSrc) -> Result<(), CapacityError> {
        match src {
            AluSrc::Imm(v) => Self::put(ctx, movz(T0, u32::from(v))),
            AluSrc::OperandByte(op_addr) => Self::load_mem_const(ctx, T0, op_addr),
            AluSrc::Mem(a) => Self::load_mem_const(ctx, T0, a),
            AluSrc::FetchedMem(op_addr) => {
                Self::fetch_operand16(ctx, T1, op_addr)?;
                Self::put(ctx, ldrb_reg(T0, MEM, T1))
            }
            AluSrc::Scratch => Self::put(ctx, ldrb_reg(T0, MEM, EA)),
        }
    }

    fn emit_alu(ctx: &mut EmitCtx, op: AluOp, src: AluSrc) -> Result<(), CapacityError> {
        match op {
            AluOp::Ora | AluOp::And | AluOp::Eor => {
                Self::alu_operand(ctx, src)?;
                let insn = match op {
                    AluOp::Ora => orr_reg(A, A, T0),
                    AluOp::And => and_reg(A, A, T0),
                    _ => eor_reg(A, A, T0),
                };
                Self::put_all(ctx, &[insn, mov_reg(LAST, A)])
            }
            AluOp::Adc => {
                Self::bcd_guard(ctx)?;
                Self::alu_operand(ctx, src)?;
                Self::adc_core(ctx, false)
            }
            AluOp::Sbc => {
                Self::bcd_guard(ctx)?;
                Self::alu_operand(ctx, src)?;
                Self::adc_core(ctx, true)
            }
            AluOp::Add | AluOp::Sub => {
                // Carry-folded: seed the known carry, then the full core.
                Self::bcd_guard(ctx)?;
                Self::alu_operand(ctx, src)?;
                let seed = if matches!(op, AluOp::Add) { 0 } else { 1 };
                Self::put(ctx, movz(FC, seed))?;
                Self::adc_core(ctx, matches!(op, AluOp::Sub))
            }
            AluOp::Cmp | AluOp::Cpx | AluOp::Cpy => {
                Self::alu_operand(ctx, src)?;
                let rn = match op {
                    AluOp::Cpx => X,
                    AluOp::Cpy => Y,
                    _ => A,
                };
                Self::put_all(ctx, &[
                    cmp_reg(rn, T0),
                    cset(FC, COND_CS),
                    sub_reg(LAST, rn, T0),
                    ubfx(LAST, LAST, 0, 8),
                ])
            }
        }
    }
}

/// Resolved ALU operand source forms.
#[derive(Debug, Clone, Copy)]
enum AluSrc {
    Imm(u8),
    OperandByte(u16),
    Mem(u16),
    FetchedMem(u16),
    Scratch,
}

impl Backend for Arm64Backend {
    fn name(&self) -> &'static str {
        "arm64"
    }

    fn is_execution_enabled(&self) -> bool {
        // Emit-only, like the x86-64 backend: no entry trampoline jumps
        // host execution into these words yet.
        false
    }

    fn supports_uop(&self, uop: &Uop) -> bool {
        // No store-immediate-to-memory instruction here: keeping the
        // load/store pair avoids an extra constant load, so the merged
        // form is declined.
        !matches!(uop, Uop::StoreImm { .. })
    }

    fn invalidation_sequence(&self) -> &'static [u8] {
        // blr x29
        &[0xA0, 0x03, 0x3F, 0xD6]
    }

    fn fill_with_trap(&self, buf: &mut [u8]) {
        for chunk in buf.chunks_exact_mut(4) {
            chunk.copy_from_slice(&BRK_WORD.to_le_bytes());
        }
        buf[..4].copy_from_slice(self.invalidation_sequence());
    }

    fn emit(&self, ctx: &mut EmitCtx, uop: &Uop) -> Result<(), CapacityError> {
        match *uop {
            Uop::ModeZpx { base } | Uop::ModeZpy { base } => {
                let idx = if matches!(uop, Uop::ModeZpx { .. }) { X } else { Y };
                match base {
                    Imm8::Const(v) => Self::put(ctx, movz(EA, u32::from(v)))?,
                    Imm8::Mem(op_addr) => Self::load_mem_const(ctx, EA, op_addr)?,
                }
                Self::put_all(ctx, &[add_reg(EA, EA, idx), ubfx(EA, EA, 0, 8)])?;
            }
            Uop::ModeAbx { base } | Uop::ModeAby { base } => {
                let idx = if matches!(uop, Uop::ModeAbx { .. }) { X } else { Y };
                match base {
                    Addr16::Const(v) => Self::load_imm16(ctx, EA, v)?,
                    Addr16::Mem(op_addr) => Self::fetch_operand16(ctx, EA, op_addr)?,
                }
                Self::index_with_crossing(ctx, idx)?;
            }
            Uop::ModeIdx { zp } => {
                match zp {
                    Imm8::Const(v) => Self::put(ctx, movz(T0, u32::from(v)))?,
                    Imm8::Mem(op_addr) => Self::load_mem_const(ctx, T0, op_addr)?,
                }
                Self::put_all(ctx, &[
                    // Pointer address wraps in the zero page after + X.
                    add_reg(T0, T0, X),
                    ubfx(T0, T0, 0, 8),
                    ldrb_reg(EA, MEM, T0),
                    add_imm(T0, T0, 1),
                    ubfx(T0, T0, 0, 8),
                    ldrb_reg(T1, MEM, T0),
                    lsl_imm(T1, T1, 8),
                    orr_reg(EA, EA, T1),
                ])?;
            }
            Uop::ModeIdy { zp } => {
                match zp {
                    Imm8::Const(v) => Self::put(ctx, movz(T0, u32::from(v)))?,
                    Imm8::Mem(op_addr) => Self::load_mem_const(ctx, T0, op_addr)?,
                }
                Self::put_all(ctx, &[
                    ldrb_reg(EA, MEM, T0),
                    add_imm(T0, T0, 1),
                    ubfx(T0, T0, 0, 8),
                    ldrb_reg(T1, MEM, T0),
                    lsl_imm(T1, T1, 8),
                    orr_reg(EA, EA, T1),
                ])?;
                Self::index_with_crossing(ctx, Y)?;
            }
            Uop::CheckPagePenalty => {
                Self::put(ctx, sub_reg64(COUNTDOWN, COUNTDOWN, CROSSED))?;
            }

            Uop::LoadImm { reg, value } => {
                let rd = reg_num(reg);
                match value {
                    Imm8::Const(v) => Self::put(ctx, movz(rd, u32::from(v)))?,
                    Imm8::Mem(op_addr) => Self::load_mem_const(ctx, rd, op_addr)?,
                }
                Self::put(ctx, mov_reg(LAST, rd))?;
            }
            Uop::LoadMem { reg, addr } => {
                let rd = reg_num(reg);
                match addr {
                    Addr16::Const(a) => Self::load_mem_const(ctx, rd, a)?,
                    Addr16::Mem(op_addr) => {
                        Self::fetch_operand16(ctx, T1, op_addr)?;
                        Self::put(ctx, ldrb_reg(rd, MEM, T1))?;
                    }
                }
                Self::put(ctx, mov_reg(LAST, rd))?;
            }
            Uop::LoadScratch { reg } => {
                let rd = reg_num(reg);
                Self::put_all(ctx, &[ldrb_reg(rd, MEM, EA), mov_reg(LAST, rd)])?;
            }
            Uop::StoreMem { reg, addr } => {
                let rs = reg_num(reg);
                match addr {
                    Addr16::Const(a) => Self::store_mem_const(ctx, rs, a, T1)?,
                    Addr16::Mem(op_addr) => {
                        Self::fetch_operand16(ctx, T1, op_addr)?;
                        Self::put(ctx, strb_reg(rs, MEM, T1))?;
                    }
                }
            }
            Uop::StoreScratch { reg } => {
                Self::put(ctx, strb_reg(reg_num(reg), MEM, EA))?;
            }
            Uop::StoreImm { .. } => return Err(CapacityError),
            Uop::Transfer { from, to } => {
                Self::put(ctx, mov_reg(treg_num(to), treg_num(from)))?;
            }

            Uop::AluImm { op, value } => {
                let src = match value {
                    Imm8::Const(v) => AluSrc::Imm(v),
                    Imm8::Mem(op_addr) => AluSrc::OperandByte(op_addr),
                };
                Self::emit_alu(ctx, op, src)?;
            }
            Uop::AluMem { op, addr } => {
                let src = match addr {
                    Addr16::Const(a) => AluSrc::Mem(a),
                    Addr16::Mem(op_addr) => AluSrc::FetchedMem(op_addr),
                };
                Self::emit_alu(ctx, op, src)?;
            }
            Uop::AluScratch { op } => Self::emit_alu(ctx, op, AluSrc::Scratch)?,

            Uop::ShiftAcc { op, by } => {
                Self::put(ctx, mov_reg(T0, A))?;
                emit_shift(ctx, op, by)?;
                Self::put_all(ctx, &[mov_reg(A, T0), mov_reg(LAST, T0)])?;
            }
            Uop::ShiftMem { op, addr } => {
                match addr {
                    Addr16::Const(a) => {
                        Self::load_mem_const(ctx, T0, a)?;
                        emit_shift(ctx, op, 1)?;
                        Self::put(ctx, mov_reg(LAST, T0))?;
                        Self::store_mem_const(ctx, T0, a, T1)?;
                    }
                    Addr16::Mem(op_addr) => {
                        Self::fetch_operand16(ctx, EA, op_addr)?;
                        Self::put(ctx, ldrb_reg(T0, MEM, EA))?;
                        emit_shift(ctx, op, 1)?;
                        Self::put_all(ctx, &[mov_reg(LAST, T0), strb_reg(T0, MEM, EA)])?;
                    }
                }
            }
            Uop::ShiftScratch { op } => {
                Self::put(ctx, ldrb_reg(T0, MEM, EA))?;
                emit_shift(ctx, op, 1)?;
                Self::put_all(ctx, &[mov_reg(LAST, T0), strb_reg(T0, MEM, EA)])?;
            }
            Uop::IncMem { delta, addr } => {
                let step = if delta > 0 {
                    add_imm(T0, T0, 1)
                } else {
                    sub_imm(T0, T0, 1)
                };
                match addr {
                    Addr16::Const(a) => {
                        Self::load_mem_const(ctx, T0, a)?;
                        Self::put_all(ctx, &[step, ubfx(T0, T0, 0, 8), mov_reg(LAST, T0)])?;
                        Self::store_mem_const(ctx, T0, a, T1)?;
                    }
                    Addr16::Mem(op_addr) => {
                        Self::fetch_operand16(ctx, EA, op_addr)?;
                        Self::put_all(ctx, &[
                            ldrb_reg(T0, MEM, EA),
                            step,
                            ubfx(T0, T0, 0, 8),
                            mov_reg(LAST, T0),
                            strb_reg(T0, MEM, EA),
                        ])?;
                    }
                }
            }
            Uop::IncScratch { delta } => {
                let step = if delta > 0 {
                    add_imm(T0, T0, 1)
                } else {
                    sub_imm(T0, T0, 1)
                };
                Self::put_all(ctx, &[
                    ldrb_reg(T0, MEM, EA),
                    step,
                    ubfx(T0, T0, 0, 8),
                    mov_reg(LAST, T0),
                    strb_reg(T0, MEM, EA),
                ])?;
            }
            Uop::IncReg { reg, delta } => {
                let r = reg_num(reg);
                let step = if delta > 0 {
                    add_imm(r, r, 1)
                } else {
                    sub_imm(r, r, 1)
                };
                Self::put_all(ctx, &[step, ubfx(r, r, 0, 8), mov_reg(LAST, r)])?;
            }

            Uop::BitMem { addr } => {
                match addr {
                    Addr16::Const(a) => Self::load_mem_const(ctx, T0, a)?,
                    Addr16::Mem(op_addr) => {
                        Self::fetch_operand16(ctx, T1, op_addr)?;
                        Self::put(ctx, ldrb_reg(T0, MEM, T1))?;
                    }
                }
                Self::put_all(ctx, &[
                    ubfx(FN, T0, 7, 1),
                    ubfx(FV, T0, 6, 1),
                    and_reg(T0, T0, A),
                    cmp_imm(T0, 0),
                    cset(FZ, COND_EQ),
                ])?;
            }

            Uop::SetC(v) => Self::put(ctx, movz(FC, u32::from(v)))?,
            Uop::SetI(v) => {
                if v {
                    Self::put_all(ctx, &[movz(T0, 0x04), orr_reg(FLAGS_ID, FLAGS_ID, T0)])?;
                } else {
                    // Clear bit 2: keep bit 3 only, then restore.
                    Self::put_all(ctx, &[
                        ubfx(T0, FLAGS_ID, 3, 1),
                        lsl_imm(FLAGS_ID, T0, 3),
                    ])?;
                }
            }
            Uop::SetD(v) => {
                if v {
                    Self::put_all(ctx, &[movz(T0, 0x08), orr_reg(FLAGS_ID, FLAGS_ID, T0)])?;
                } else {
                    Self::put_all(ctx, &[
                        ubfx(T0, FLAGS_ID, 2, 1),
                        lsl_imm(FLAGS_ID, T0, 2),
                    ])?;
                }
            }
            Uop::ClearV => Self::put(ctx, movz(FV, 0))?,

            Uop::FlagsNz { src, n, z } => {
                let rv = match src {
                    NzSrc::A => A,
                    NzSrc::X => X,
                    NzSrc::Y => Y,
                    NzSrc::Last => LAST,
                };
                Self::flags_from(ctx, rv, n, z)?;
            }

            Uop::PushA => Self::push_byte(ctx, A)?,
            Uop::PullA => {
                Self::pull_byte(ctx, A)?;
                Self::put(ctx, mov_reg(LAST, A))?;
            }
            Uop::PushP => {
                Self::status_to(ctx, T0)?;
                Self::push_byte(ctx, T0)?;
            }
            Uop::PullP => {
                Self::pull_byte(ctx, T0)?;
                Self::status_from(ctx, T0)?;
            }

            Uop::Branch { cond, target } => {
                // Test the backing flag register; fall through when not
                // taken.
                let (flag, taken_when_set) = match cond {
                    Cond::Pl => (FN, false),
                    Cond::Mi => (FN, true),
                    Cond::Vc => (FV, false),
                    Cond::Vs => (FV, true),
                    Cond::Cc => (FC, false),
                    Cond::Cs => (FC, true),
                    Cond::Ne => (FZ, false),
                    Cond::Eq => (FZ, true),
                };
                let penalty = ctx.accurate_cycles;
                // Words in the taken body.
                let body_words: i32 = (if penalty { 1 } else { 0 })
                    + match ctx.branch_kind {
                        BranchKind::Slot(_) => 1,
                        BranchKind::Dispatch => 3,
                    };
                let skip = body_words + 1;
                if taken_when_set {
                    Self::put(ctx, cbz(flag, skip))?;
                } else {
                    Self::put(ctx, cbnz(flag, skip))?;
                }
                if penalty {
                    let next = ctx.instr_addr.wrapping_add(2);
                    let cost = if target & 0xFF00 == next & 0xFF00 { 1 } else { 2 };
                    Self::put(ctx, sub_imm64(COUNTDOWN, COUNTDOWN, cost))?;
                }
                match ctx.branch_kind {
                    BranchKind::Slot(off) => {
                        let rel_words =
                            (i64::from(off) - i64::from(ctx.arena_pos())) / 4;
                        Self::put(ctx, b(rel_words as i32))?;
                    }
                    BranchKind::Dispatch => {
                        Self::call_context(ctx, ctx_offset::DISPATCH, Some(target))?;
                    }
                }
            }
            Uop::Jump { target } => {
                Self::call_context(ctx, ctx_offset::DISPATCH, Some(target))?;
            }
            Uop::JumpInd { ptr } => {
                let hi_addr = (ptr & 0xFF00) | u16::from((ptr as u8).wrapping_add(1));
                Self::load_mem_const(ctx, 0, ptr)?;
                Self::load_mem_const(ctx, T1, hi_addr)?;
                Self::put_all(ctx, &[lsl_imm(T1, T1, 8), orr_reg(0, 0, T1)])?;
                Self::call_context(ctx, ctx_offset::DISPATCH, None)?;
            }
            Uop::Jsr { target, ret } => {
                Self::put(ctx, movz(T0, u32::from(ret >> 8)))?;
                Self::push_byte(ctx, T0)?;
                Self::put(ctx, movz(T0, u32::from(ret & 0xFF)))?;
                Self::push_byte(ctx, T0)?;
                Self::call_context(ctx, ctx_offset::DISPATCH, Some(target))?;
            }
            Uop::Rts => {
                Self::pull_byte(ctx, 0)?;
                Self::pull_byte(ctx, T0)?;
                Self::put_all(ctx, &[
                    lsl_imm(T0, T0, 8),
                    orr_reg(0, 0, T0),
                    add_imm(0, 0, 1),
                    ubfx(0, 0, 0, 16),
                ])?;
                Self::call_context(ctx, ctx_offset::DISPATCH, None)?;
            }
            Uop::Rti => {
                Self::pull_byte(ctx, T0)?;
                Self::status_from(ctx, T0)?;
                Self::pull_byte(ctx, 0)?;
                Self::pull_byte(ctx, T0)?;
                Self::put_all(ctx, &[lsl_imm(T0, T0, 8), orr_reg(0, 0, T0)])?;
                Self::call_context(ctx, ctx_offset::DISPATCH, None)?;
            }
            Uop::Brk { ret } => {
                Self::put(ctx, movz(T0, u32::from(ret >> 8)))?;
                Self::push_byte(ctx, T0)?;
                Self::put(ctx, movz(T0, u32::from(ret & 0xFF)))?;
                Self::push_byte(ctx, T0)?;
                Self::status_to(ctx, T0)?;
                Self::push_byte(ctx, T0)?;
                Self::put_all(ctx, &[movz(T0, 0x04), orr_reg(FLAGS_ID, FLAGS_ID, T0)])?;
                Self::load_mem_const(ctx, 0, 0xFFFE)?;
                Self::load_mem_const(ctx, T1, 0xFFFF)?;
                Self::put_all(ctx, &[lsl_imm(T1, T1, 8), orr_reg(0, 0, T1)])?;
                Self::call_context(ctx, ctx_offset::DISPATCH, None)?;
            }

            Uop::Countdown { addr: _, cost } => {
                // subs countdown; b.pl +3; timer call
                Self::put_all(ctx, &[
                    // subs x13, x13, #cost
                    0xF100_0000 | (u32::from(cost) << 10) | (COUNTDOWN << 5) | COUNTDOWN,
                    b_cond(0x5 /* PL */, 3),
                    ldr_x_imm(T0, CTX, u32::from(ctx_offset::TIMER)),
                ])?;
                Self::put(ctx, blr(T0))?;
            }
            Uop::DebugTrap { addr } => {
                Self::call_context(ctx, ctx_offset::DEBUG, Some(addr))?;
            }
            Uop::Interp { addr } => {
                Self::call_context(ctx, ctx_offset::INTERP, Some(addr))?;
            }
            Uop::Exit { addr } => {
                Self::put(ctx, movz(0, u32::from(addr)))?;
                Self::put(ctx, ret())?;
            }
            Uop::Halt { addr } => {
                Self::call_context(ctx, ctx_offset::HALT, Some(addr))?;
            }
        }
        Ok(())
    }

    fn emit_jump_to_slot(
        &self,
        ctx: &mut EmitCtx,
        target_offset: u32,
    ) -> Result<(), CapacityError> {
        let rel_words = (i64::from(target_offset) - i64::from(ctx.arena_pos())) / 4;
        Self::put(ctx, b(rel_words as i32))
    }

    fn emit_dispatch(
        &self,
        ctx: &mut EmitCtx,
        target_pc: u16,
    ) -> Result<(), CapacityError> {
        Self::call_context(ctx, ctx_offset::DISPATCH, Some(target_pc))
    }

    fn patch_branch(
        &self,
        buf: &mut [u8],
        at: usize,
        taken_offset: u32,
        field_arena_offset: u32,
    ) {
        let rel_words = (i64::from(taken_offset) - i64::from(field_arena_offset)) / 4;
        let word = b(rel_words as i32);
        buf[at..at + 4].copy_from_slice(&word.to_le_bytes());
    }

    fn slot_preconditions_test(&self) -> Result<(), JitError> {
        // The trap must be exactly one instruction word.
        if self.invalidation_sequence().len() != 4
            || crate::arena::SLOT_SIZE % 4 != 0
        {
            return Err(JitError::BackendPreconditions);
        }
        Ok(())
    }
}

const fn reg_num(reg: Reg) -> u32 {
    match reg {
        Reg::A => A,
        Reg::X => X,
        Reg::Y => Y,
    }
}

const fn treg_num(reg: TReg) -> u32 {
    match reg {
        TReg::A => A,
        TReg::X => X,
        TReg::Y => Y,
        TReg::S => S,
    }
}

/// Shift/rotate `T0` (8-bit value) by `by`, leaving the 6502 carry in the
/// carry flag register.
fn emit_shift(ctx: &mut EmitCtx, op: ShiftOp, by: u8) -> Result<(), CapacityError> {
    let by = u32::from(by);
    match op {
        ShiftOp::Asl => Arm64Backend::put_all(ctx, &[
            lsl_imm(T0, T0, by),
            ubfx(FC, T0, 8, 1),
            ubfx(T0, T0, 0, 8),
        ]),
        ShiftOp::Lsr => Arm64Backend::put_all(ctx, &[
            ubfx(FC, T0, by - 1, 1),
            lsr_imm(T0, T0, by),
        ]),
        ShiftOp::Rol => {
            // Rotate through carry: widen to 9 bits per step.
            let mut words: Vec<u32> = Vec::new();
            for _ in 0..by {
                words.extend_from_slice(&[
                    lsl_imm(T0, T0, 1),
                    orr_reg(T0, T0, FC),
                    ubfx(FC, T0, 8, 1),
                    ubfx(T0, T0, 0, 8),
                ]);
            }
            Arm64Backend::put_all(ctx, &words)
        }
        ShiftOp::Ror => {
            let mut words: Vec<u32> = Vec::new();
            for _ in 0..by {
                words.extend_from_slice(&[
                    lsl_imm(T1, FC, 8),
                    orr_reg(T0, T0, T1),
                    ubfx(FC, T0, 0, 1),
                    lsr_imm(T0, T0, 1),
                ]);
            }
            Arm64Backend::put_all(ctx, &words)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalidation_is_blr_x29() {
        let backend = Arm64Backend::new();
        assert_eq!(backend.invalidation_sequence(), &0xD63F_03A0u32.to_le_bytes()[..]);
        let mut slot = [0u8; 32];
        backend.fill_with_trap(&mut slot);
        assert!(backend.is_invalidated_at(&slot));
    }

    #[test]
    fn store_imm_is_declined() {
        // The merged constant store would cost an extra constant load
        // here, so the backend keeps the load/store pair.
        let backend = Arm64Backend::new();
        let uop = Uop::StoreImm {
            addr: Addr16::Const(0x40),
            value: Imm8::Const(7),
        };
        assert!(!backend.supports_uop(&uop));
        let plain = Uop::StoreMem { reg: Reg::A, addr: Addr16::Const(0x40) };
        assert!(backend.supports_uop(&plain));
    }

    #[test]
    fn emits_word_aligned_code() {
        let backend = Arm64Backend::new();
        let mut buf = [0u8; 128];
        let mut ctx = EmitCtx::new(&mut buf, 0x1000, true);
        backend
            .emit(&mut ctx, &Uop::LoadImm { reg: Reg::A, value: Imm8::Const(0x42) })
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(ctx.pos % 4, 0);
        // movz w19, #0x42
        let w = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        assert_eq!(w, 0x5280_0000 | (0x42 << 5) | 19);
    }

    #[test]
    fn execution_is_not_wired_up() {
        assert!(!Arm64Backend::new().is_execution_enabled());
    }
}
