//! x86-64 backend.
//!
//! Register binding:
//!
//! | host | 6502 |
//! |------|------|
//! | `al` | A |
//! | `bl` | X |
//! | `cl` | Y |
//! | `sil` | S |
//! | `rdi` | emulated memory base |
//! | `rdx` | scratch / effective address |
//! | `r8` | I and D flag bits (status-byte positions) |
//! | `r9b` | carry (0/1) |
//! | `r10b` | zero (0/1) |
//! | `r11b` | negative (0/1) |
//! | `r12b` | overflow (0/1) |
//! | `r13` | countdown |
//! | `r14` | context pointer (trampoline table) |
//! | `r15` | spare scratch / page-crossing latch |
//! | `rbp` | compile trampoline (invalidation target) |
//!
//! Keeping each flag in its own byte register removes most PSR-to-integer
//! conversion cost: a flag write is one `setcc`, a flag read one `test`.
//!
//! Emit-only: no entry trampoline jumps host execution into these bytes
//! yet, so the driver refuses this backend and the inspection tests are
//! what exercise it. The encoding assumes the eventual native view maps
//! the I/O pages inaccessible, so run-time-computed hardware-register
//! accesses need no inline range check; the fault would route the
//! instruction to the interpreter.

use crate::JitError;
use crate::uop::{AluOp, Addr16, Cond, Imm8, NzSrc, Reg, ShiftOp, TReg, Uop};

use super::{Backend, BranchKind, CapacityError, EmitCtx, LastValue};

/// Trampoline-table offsets from the context pointer in `r14`.
pub mod ctx_offset {
    pub const COMPILE: u8 = 0x00;
    pub const INTERP: u8 = 0x08;
    pub const TIMER: u8 = 0x10;
    pub const DEBUG: u8 = 0x18;
    pub const DISPATCH: u8 = 0x20;
    pub const HALT: u8 = 0x28;
}

/// The invalidation trap: `call rbp`, two bytes, installable with one
/// aligned store. The pushed return address is what lets the compile
/// trampoline recover the 6502 address by slot arithmetic.
const INVALIDATION: [u8; 2] = [0xFF, 0xD5];

#[derive(Debug, Default)]
pub struct X64Backend;

impl X64Backend {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// `mov <reg8>, imm8` for the 6502 value registers.
    fn mov_reg_imm(ctx: &mut EmitCtx, reg: Reg, v: u8) -> Result<(), CapacityError> {
        let opcode = match reg {
            Reg::A => 0xB0, // mov al, imm8
            Reg::X => 0xB3, // mov bl, imm8
            Reg::Y => 0xB1, // mov cl, imm8
        };
        ctx.put(&[opcode, v])
    }

    /// `mov <reg8>, [rdi + disp32]`.
    fn mov_reg_mem(ctx: &mut EmitCtx, reg: Reg, addr: u16) -> Result<(), CapacityError> {
        let modrm = match reg {
            Reg::A => 0x87,
            Reg::X => 0x9F,
            Reg::Y => 0x8F,
        };
        ctx.put(&[0x8A, modrm])?;
        ctx.put(&u32::from(addr).to_le_bytes())
    }

    /// `mov <reg8>, [rdi + rdx]` (scratch-addressed load).
    fn mov_reg_scratch(ctx: &mut EmitCtx, reg: Reg) -> Result<(), CapacityError> {
        let modrm = match reg {
            Reg::A => 0x04,
            Reg::X => 0x1C,
            Reg::Y => 0x0C,
        };
        ctx.put(&[0x8A, modrm, 0x17])
    }

    /// Fetch a 16-bit operand from emulated code bytes into `r15d`:
    /// `movzx r15d, word [rdi + disp32]`.
    fn fetch_addr_r15(ctx: &mut EmitCtx, op_addr: u16) -> Result<(), CapacityError> {
        ctx.put(&[0x44, 0x0F, 0xB7, 0xBF])?;
        ctx.put(&u32::from(op_addr).to_le_bytes())
    }

    /// Compute page-crossing into `r15b` around an `add dx, <idx16>`.
    /// Expects the 16-bit base already in `dx`; emits:
    /// `mov r15d, edx; add dx, <idx>; xor r15d, edx; shr r15d, 8;
    ///  setne r15b`.
    fn add_index_with_crossing(
        ctx: &mut EmitCtx,
        index: Reg,
    ) -> Result<(), CapacityError> {
        // mov r15d, edx
        ctx.put(&[0x41, 0x89, 0xD7])?;
        match index {
            // add dx, bx
            Reg::X => ctx.put(&[0x66, 0x01, 0xDA])?,
            // add dx, cx
            Reg::Y => ctx.put(&[0x66, 0x01, 0xCA])?,
            Reg::A => return Err(CapacityError),
        }
        // xor r15d, edx ; shr r15d, 8 ; setne r15b
        ctx.put(&[0x41, 0x31, 0xD7])?;
        ctx.put(&[0x41, 0xC1, 0xEF, 0x08])?;
        ctx.put(&[0x41, 0x0F, 0x95, 0xC7])
    }

    /// Materialise carry out of the host CF: `setb r9b`.
    fn set_carry_from_cf(ctx: &mut EmitCtx) -> Result<(), CapacityError> {
        ctx.put(&[0x41, 0x0F, 0x92, 0xC1])
    }

    /// Carry out of an x86 subtract: `setae r9b` (no borrow means set).
    fn set_carry_from_not_cf(ctx: &mut EmitCtx) -> Result<(), CapacityError> {
        ctx.put(&[0x41, 0x0F, 0x93, 0xC1])
    }

    /// `seto r12b`.
    fn set_overflow_from_of(ctx: &mut EmitCtx) -> Result<(), CapacityError> {
        ctx.put(&[0x41, 0x0F, 0x90, 0xC4])
    }

    /// Load the 6502 carry into the host CF, trashing `r9b`:
    /// `shr r9b, 1`.
    fn carry_to_cf(ctx: &mut EmitCtx) -> Result<(), CapacityError> {
        ctx.put(&[0x41, 0xD0, 0xE9])
    }

    /// Decimal-mode guard for ADC/SBC: `test r8b, 8; jz +4;
    /// call [r14 + INTERP]`. The interpreter trampoline does not return
    /// here; it recovers the instruction address from the call's return
    /// address and resumes at the next boundary.
    fn bcd_guard(ctx: &mut EmitCtx) -> Result<(), CapacityError> {
        ctx.put(&[0x41, 0xF6, 0xC0, 0x08])?;
        ctx.put(&[0x74, 0x04])?;
        ctx.put(&[0x41, 0xFF, 0x56, ctx_offset::INTERP])
    }

    /// `call [r14 + off]`.
    fn call_context(ctx: &mut EmitCtx, off: u8) -> Result<(), CapacityError> {
        ctx.put(&[0x41, 0xFF, 0x56, off])
    }

    /// `mov edx, imm32` with a 6502 address payload.
    fn mov_edx_imm(ctx: &mut EmitCtx, v: u32) -> Result<(), CapacityError> {
        ctx.put(&[0xBA])?;
        ctx.put(&v.to_le_bytes())
    }

    /// Test the flag register backing a branch condition; returns the
    /// `jcc` opcode that *skips* the taken path.
    fn test_cond(ctx: &mut EmitCtx, cond: Cond) -> Result<u8, CapacityError> {
        let (test, skip) = match cond {
            // test r11b, r11b -- taken when N clear (ZF=1) / set
            Cond::Pl => ([0x45, 0x84, 0xDB], 0x75),
            Cond::Mi => ([0x45, 0x84, 0xDB], 0x74),
            // test r12b, r12b
            Cond::Vc => ([0x45, 0x84, 0xE4], 0x75),
            Cond::Vs => ([0x45, 0x84, 0xE4], 0x74),
            // test r9b, r9b
            Cond::Cc => ([0x45, 0x84, 0xC9], 0x75),
            Cond::Cs => ([0x45, 0x84, 0xC9], 0x74),
            // test r10b, r10b -- taken when Z clear (r10b == 0) / set
            Cond::Ne => ([0x45, 0x84, 0xD2], 0x75),
            Cond::Eq => ([0x45, 0x84, 0xD2], 0x74),
        };
        ctx.put(&test)?;
        Ok(skip)
    }

    /// Push `dx` as a 16-bit word onto the 6502 stack, high byte first:
    /// `mov [rsi], dh; dec sil; mov [rsi], dl; dec sil`.
    fn push_scratch_word(ctx: &mut EmitCtx) -> Result<(), CapacityError> {
        ctx.put(&[0x88, 0x36])?;
        ctx.put(&[0x40, 0xFE, 0xCE])?;
        ctx.put(&[0x88, 0x16])?;
        ctx.put(&[0x40, 0xFE, 0xCE])
    }

    /// Pull a 16-bit word from the 6502 stack into `dx`:
    /// `inc sil; movzx edx, byte [rsi]; inc sil; mov dh, [rsi]`.
    fn pull_scratch_word(ctx: &mut EmitCtx) -> Result<(), CapacityError> {
        ctx.put(&[0x40, 0xFE, 0xC6])?;
        ctx.put(&[0x0F, 0xB6, 0x16])?;
        ctx.put(&[0x40, 0xFE, 0xC6])?;
        ctx.put(&[0x8A, 0x36])
    }

    /// Assemble the status byte into `dl` from the flag registers, with B
    /// and the unused bit set (PHP/BRK form):
    /// the I/D residue from `r8`, carry at bit 0, zero at bit 1,
    /// negative at bit 7, overflow at bit 6, then `or dl, 0x30`.
    fn status_to_scratch(ctx: &mut EmitCtx) -> Result<(), CapacityError> {
        // mov rdx, r8 ; or rdx, r9
        ctx.put(&[0x4C, 0x89, 0xC2])?;
        ctx.put(&[0x4C, 0x09, 0xCA])?;
        // mov r15, r10 ; shl r15, 1 ; or rdx, r15
        ctx.put(&[0x4D, 0x89, 0xD7])?;
        ctx.put(&[0x49, 0xD1, 0xE7])?;
        ctx.put(&[0x4C, 0x09, 0xFA])?;
        // mov r15, r11 ; shl r15, 7 ; or rdx, r15
        ctx.put(&[0x4D, 0x89, 0xDF])?;
        ctx.put(&[0x49, 0xC1, 0xE7, 0x07])?;
        ctx.put(&[0x4C, 0x09, 0xFA])?;
        // mov r15, r12 ; shl r15, 6 ; or rdx, r15
        ctx.put(&[0x4D, 0x89, 0xE7])?;
        ctx.put(&[0x49, 0xC1, 0xE7, 0x06])?;
        ctx.put(&[0x4C, 0x09, 0xFA])?;
        // or dl, 0x30
        ctx.put(&[0x80, 0xCA, 0x30])
    }

    /// Scatter a status byte in `dl` back into the flag registers:
    /// bit tests feeding `setb`, then the I/D residue into `r8b`.
    fn status_from_scratch(ctx: &mut EmitCtx) -> Result<(), CapacityError> {
        // bt edx, 0 ; setb r9b (carry)
        ctx.put(&[0x0F, 0xBA, 0xE2, 0x00])?;
        ctx.put(&[0x41, 0x0F, 0x92, 0xC1])?;
        // bt edx, 1 ; setb r10b (zero)
        ctx.put(&[0x0F, 0xBA, 0xE2, 0x01])?;
        ctx.put(&[0x41, 0x0F, 0x92, 0xC2])?;
        // bt edx, 6 ; setb r12b (overflow)
        ctx.put(&[0x0F, 0xBA, 0xE2, 0x06])?;
        ctx.put(&[0x41, 0x0F, 0x92, 0xC4])?;
        // bt edx, 7 ; setb r11b (negative)
        ctx.put(&[0x0F, 0xBA, 0xE2, 0x07])?;
        ctx.put(&[0x41, 0x0F, 0x92, 0xC3])?;
        // mov r8b, dl ; and r8b, 0x0c (keep I and D only)
        ctx.put(&[0x41, 0x88, 0xD0])?;
        ctx.put(&[0x41, 0x80, 0xE0, 0x0C])
    }

    /// Emit the N/Z materialisation after establishing host flags for the
    /// last value per the context's tracking.
    fn flags_nz(
        ctx: &mut EmitCtx,
        src: NzSrc,
        n: bool,
        z: bool,
    ) -> Result<(), CapacityError> {
        match src {
            NzSrc::A => ctx.put(&[0x84, 0xC0])?, // test al, al
            NzSrc::X => ctx.put(&[0x84, 0xDB])?, // test bl, bl
            NzSrc::Y => ctx.put(&[0x84, 0xC9])?, // test cl, cl
            NzSrc::Last => match ctx.last_value {
                LastValue::HostFlags => {}
                LastValue::InA | LastValue::None => ctx.put(&[0x84, 0xC0])?,
                LastValue::InMem(addr) => {
                    // test byte [rdi + addr], 0xff
                    ctx.put(&[0xF6, 0x87])?;
                    ctx.put(&u32::from(addr).to_le_bytes())?;
                    ctx.put(&[0xFF])?;
                }
                LastValue::InScratchMem => {
                    // test byte [rdi + rdx], 0xff
                    ctx.put(&[0xF6, 0x04, 0x17, 0xFF])?;
                }
                LastValue::InFetchedMem => {
                    // test byte [rdi + r15], 0xff
                    ctx.put(&[0x42, 0xF6, 0x04, 0x3F, 0xFF])?;
                }
            },
        }
        if z {
            // sete r10b
            ctx.put(&[0x41, 0x0F, 0x94, 0xC2])?;
        }
        if n {
            // sets r11b
            ctx.put(&[0x41, 0x0F, 0x98, 0xC3])?;
        }
        Ok(())
    }

    /// The base x86 opcode byte for an ALU op in its `[rdi + disp]` form;
    /// immediate forms are base + 2 (the `al, imm8` encoding).
    fn alu_base(op: AluOp) -> u8 {
        match op {
            AluOp::Ora => 0x0A,
            AluOp::And => 0x22,
            AluOp::Eor => 0x32,
            AluOp::Adc => 0x12,
            AluOp::Sbc => 0x1A, // sbb
            AluOp::Add => 0x02,
            AluOp::Sub => 0x2A,
            AluOp::Cmp | AluOp::Cpx | AluOp::Cpy => 0x3A,
        }
    }

    /// Pre-op glue for ALU carry semantics.
    fn alu_prologue(ctx: &mut EmitCtx, op: AluOp) -> Result<(), CapacityError> {
        match op {
            AluOp::Adc => {
                Self::bcd_guard(ctx)?;
                Self::carry_to_cf(ctx)
            }
            AluOp::Sbc => {
                Self::bcd_guard(ctx)?;
                Self::carry_to_cf(ctx)?;
                // cmc: x86 borrow is the 6502 carry inverted
                ctx.put(&[0xF5])
            }
            // The carry-folded forms skip the carry load but still take
            // the decimal-mode detour.
            AluOp::Add | AluOp::Sub => Self::bcd_guard(ctx),
            _ => Ok(()),
        }
    }

    /// Post-op flag materialisation for ALU carry/overflow.
    fn alu_epilogue(ctx: &mut EmitCtx, op: AluOp) -> Result<(), CapacityError> {
        match op {
            AluOp::Adc | AluOp::Add => {
                Self::set_carry_from_cf(ctx)?;
                Self::set_overflow_from_of(ctx)
            }
            AluOp::Sbc | AluOp::Sub => {
                Self::set_carry_from_not_cf(ctx)?;
                Self::set_overflow_from_of(ctx)
            }
            AluOp::Cmp | AluOp::Cpx | AluOp::Cpy => Self::set_carry_from_not_cf(ctx),
            _ => Ok(()),
        }
    }

    /// ModRM variants of an ALU op against the comparison register.
    fn alu_reg_modrm(op: AluOp, kind: u8) -> u8 {
        // kind: 0 = [rdi+disp32], 1 = [rdi+rdx] (leading byte of pair),
        // 2 = [rdi+r15].
        let reg = match op {
            AluOp::Cpx => 3u8, // bl
            AluOp::Cpy => 1u8, // cl
            _ => 0u8,          // al
        };
        match kind {
            0 => 0x80 | (reg << 3) | 0x07,
            _ => (reg << 3) | 0x04,
        }
    }

    /// The `/r` digit for a shift op in its `d0`/`c0` group encodings.
    fn shift_digit(op: ShiftOp) -> u8 {
        match op {
            ShiftOp::Asl => 4, // shl
            ShiftOp::Lsr => 5, // shr
            ShiftOp::Rol => 2, // rcl
            ShiftOp::Ror => 3, // rcr
        }
    }
}

impl Backend for X64Backend {
    fn name(&self) -> &'static str {
        "x64"
    }

    fn is_execution_enabled(&self) -> bool {
        // Emit-only: the entry trampoline and executable arena mapping
        // are not wired up, and the driver must not misread these bytes
        // as records.
        false
    }

    fn supports_uop(&self, uop: &Uop) -> bool {
        // The merged constant store is a single `mov byte [mem], imm` here.
        !matches!(
            uop,
            Uop::StoreImm { addr: Addr16::Mem(_), .. }
                | Uop::StoreImm { value: Imm8::Mem(_), .. }
        )
    }

    fn invalidation_sequence(&self) -> &'static [u8] {
        &INVALIDATION
    }

    fn fill_with_trap(&self, buf: &mut [u8]) {
        // int3 filler with the trap call at the slot head.
        buf.fill(0xCC);
        buf[..2].copy_from_slice(&INVALIDATION);
    }

    fn emit(&self, ctx: &mut EmitCtx, uop: &Uop) -> Result<(), CapacityError> {
        let mut last = LastValue::None;
        match *uop {
            Uop::ModeZpx { base } => {
                match base {
                    Imm8::Const(b) => {
                        // mov edx, ebx ; add dl, base
                        ctx.put(&[0x89, 0xDA])?;
                        ctx.put(&[0x80, 0xC2, b])?;
                    }
                    Imm8::Mem(op_addr) => {
                        // movzx edx, byte [rdi + op] ; add dl, bl
                        ctx.put(&[0x0F, 0xB6, 0x97])?;
                        ctx.put(&u32::from(op_addr).to_le_bytes())?;
                        ctx.put(&[0x00, 0xDA])?;
                    }
                }
            }
            Uop::ModeZpy { base } => match base {
                Imm8::Const(b) => {
                    // mov edx, ecx ; add dl, base
                    ctx.put(&[0x89, 0xCA])?;
                    ctx.put(&[0x80, 0xC2, b])?;
                }
                Imm8::Mem(op_addr) => {
                    ctx.put(&[0x0F, 0xB6, 0x97])?;
                    ctx.put(&u32::from(op_addr).to_le_bytes())?;
                    ctx.put(&[0x00, 0xCA])?;
                }
            },
            Uop::ModeAbx { base } | Uop::ModeAby { base } => {
                let index = if matches!(uop, Uop::ModeAbx { .. }) {
                    Reg::X
                } else {
                    Reg::Y
                };
                match base {
                    Addr16::Const(b) => {
                        // mov edx, imm32 (base)
                        Self::mov_edx_imm(ctx, u32::from(b))?;
                    }
                    Addr16::Mem(op_addr) => {
                        // movzx edx, word [rdi + op]
                        ctx.put(&[0x0F, 0xB7, 0x97])?;
                        ctx.put(&u32::from(op_addr).to_le_bytes())?;
                    }
                }
                Self::add_index_with_crossing(ctx, index)?;
            }
            Uop::ModeIdx { zp } => {
                match zp {
                    Imm8::Const(b) => {
                        // mov r15, rbx ; add r15b, zp+1
                        ctx.put(&[0x49, 0x89, 0xDF])?;
                        ctx.put(&[0x41, 0x80, 0xC7, b.wrapping_add(1)])?;
                    }
                    Imm8::Mem(op_addr) => {
                        // movzx r15d, byte [rdi + op] ; add r15b, bl ;
                        // inc r15b
                        ctx.put(&[0x44, 0x0F, 0xB6, 0xBF])?;
                        ctx.put(&u32::from(op_addr).to_le_bytes())?;
                        ctx.put(&[0x41, 0x00, 0xDF])?;
                        ctx.put(&[0x41, 0xFE, 0xC7])?;
                    }
                }
                // movzx rdx, byte [rdi + r15] ; shl edx, 8 ; dec r15b ;
                // mov dl, [rdi + r15]
                ctx.put(&[0x4A, 0x0F, 0xB6, 0x14, 0x3F])?;
                ctx.put(&[0xC1, 0xE2, 0x08])?;
                ctx.put(&[0x41, 0xFE, 0xCF])?;
                ctx.put(&[0x42, 0x8A, 0x14, 0x3F])?;
            }
            Uop::ModeIdy { zp } => {
                match zp {
                    Imm8::Const(0xFF) => {
                        // Pointer wraps the zero page: two byte loads.
                        // movzx edx, byte [rdi + 0xff] ; mov dh, [rdi]
                        ctx.put(&[0x0F, 0xB6, 0x97])?;
                        ctx.put(&0xFFu32.to_le_bytes())?;
                        ctx.put(&[0x8A, 0x37])?;
                    }
                    Imm8::Const(b) => {
                        // movzx edx, word [rdi + zp]
                        ctx.put(&[0x0F, 0xB7, 0x97])?;
                        ctx.put(&u32::from(b).to_le_bytes())?;
                    }
                    Imm8::Mem(op_addr) => {
                        // movzx r15d, byte [rdi + op] ; inc r15b ;
                        // movzx rdx, byte [rdi + r15] ; shl edx, 8 ;
                        // dec r15b ; mov dl, [rdi + r15]
                        ctx.put(&[0x44, 0x0F, 0xB6, 0xBF])?;
                        ctx.put(&u32::from(op_addr).to_le_bytes())?;
                        ctx.put(&[0x41, 0xFE, 0xC7])?;
                        ctx.put(&[0x4A, 0x0F, 0xB6, 0x14, 0x3F])?;
                        ctx.put(&[0xC1, 0xE2, 0x08])?;
                        ctx.put(&[0x41, 0xFE, 0xCF])?;
                        ctx.put(&[0x42, 0x8A, 0x14, 0x3F])?;
                    }
                }
                Self::add_index_with_crossing(ctx, Reg::Y)?;
            }
            Uop::CheckPagePenalty => {
                // movzx r15d, r15b ; sub r13, r15
                ctx.put(&[0x45, 0x0F, 0xB6, 0xFF])?;
                ctx.put(&[0x4D, 0x29, 0xFD])?;
            }

            Uop::LoadImm { reg, value } => match value {
                Imm8::Const(v) => Self::mov_reg_imm(ctx, reg, v)?,
                // A dynamic immediate is a load from the operand byte.
                Imm8::Mem(op_addr) => Self::mov_reg_mem(ctx, reg, op_addr)?,
            },
            Uop::LoadMem { reg, addr } => match addr {
                Addr16::Const(a) => Self::mov_reg_mem(ctx, reg, a)?,
                Addr16::Mem(op_addr) => {
                    Self::fetch_addr_r15(ctx, op_addr)?;
                    // mov <reg>, [rdi + r15]
                    let modrm = match reg {
                        Reg::A => 0x04,
                        Reg::X => 0x1C,
                        Reg::Y => 0x0C,
                    };
                    ctx.put(&[0x42, 0x8A, modrm, 0x3F])?;
                }
            },
            Uop::LoadScratch { reg } => Self::mov_reg_scratch(ctx, reg)?,
            Uop::StoreMem { reg, addr } => {
                let modrm_disp = match reg {
                    Reg::A => 0x87,
                    Reg::X => 0x9F,
                    Reg::Y => 0x8F,
                };
                match addr {
                    Addr16::Const(a) => {
                        // mov [rdi + addr], <reg>
                        ctx.put(&[0x88, modrm_disp])?;
                        ctx.put(&u32::from(a).to_le_bytes())?;
                    }
                    Addr16::Mem(op_addr) => {
                        Self::fetch_addr_r15(ctx, op_addr)?;
                        let modrm = match reg {
                            Reg::A => 0x04,
                            Reg::X => 0x1C,
                            Reg::Y => 0x0C,
                        };
                        ctx.put(&[0x42, 0x88, modrm, 0x3F])?;
                    }
                }
            }
            Uop::StoreScratch { reg } => {
                let modrm = match reg {
                    Reg::A => 0x04,
                    Reg::X => 0x1C,
                    Reg::Y => 0x0C,
                };
                // mov [rdi + rdx], <reg>
                ctx.put(&[0x88, modrm, 0x17])?;
            }
            Uop::StoreImm { addr: Addr16::Const(a), value: Imm8::Const(v) } => {
                // mov byte [rdi + addr], imm8
                ctx.put(&[0xC6, 0x87])?;
                ctx.put(&u32::from(a).to_le_bytes())?;
                ctx.put(&[v])?;
            }
            Uop::StoreImm { .. } => return Err(CapacityError),
            Uop::Transfer { from, to } => {
                // mov r/m8, r8 within al/bl/cl/sil.
                let code = |r: TReg| -> u8 {
                    match r {
                        TReg::A => 0,
                        TReg::Y => 1,
                        TReg::X => 3,
                        TReg::S => 6,
                    }
                };
                let needs_rex = matches!(from, TReg::S) || matches!(to, TReg::S);
                let modrm = 0xC0 | (code(from) << 3) | code(to);
                if needs_rex {
                    ctx.put(&[0x40, 0x88, modrm])?;
                } else {
                    ctx.put(&[0x88, modrm])?;
                }
            }

            Uop::AluImm { op, value } => {
                Self::alu_prologue(ctx, op)?;
                match (op, value) {
                    (AluOp::Cpx, Imm8::Const(v)) => ctx.put(&[0x80, 0xFB, v])?,
                    (AluOp::Cpy, Imm8::Const(v)) => ctx.put(&[0x80, 0xF9, v])?,
                    (_, Imm8::Const(v)) => {
                        // <op> al, imm8
                        ctx.put(&[Self::alu_base(op) + 2, v])?;
                    }
                    (_, Imm8::Mem(op_addr)) => {
                        // Dynamic immediate: <op> reg, [rdi + operand]
                        ctx.put(&[
                            Self::alu_base(op),
                            Self::alu_reg_modrm(op, 0),
                        ])?;
                        ctx.put(&u32::from(op_addr).to_le_bytes())?;
                    }
                }
                Self::alu_epilogue(ctx, op)?;
                last = LastValue::HostFlags;
            }
            Uop::AluMem { op, addr } => {
                Self::alu_prologue(ctx, op)?;
                match addr {
                    Addr16::Const(a) => {
                        ctx.put(&[
                            Self::alu_base(op),
                            Self::alu_reg_modrm(op, 0),
                        ])?;
                        ctx.put(&u32::from(a).to_le_bytes())?;
                    }
                    Addr16::Mem(op_addr) => {
                        Self::fetch_addr_r15(ctx, op_addr)?;
                        ctx.put(&[
                            0x42,
                            Self::alu_base(op),
                            Self::alu_reg_modrm(op, 2),
                            0x3F,
                        ])?;
                    }
                }
                Self::alu_epilogue(ctx, op)?;
                last = LastValue::HostFlags;
            }
            Uop::AluScratch { op } => {
                Self::alu_prologue(ctx, op)?;
                // <op> reg, [rdi + rdx]
                ctx.put(&[Self::alu_base(op), Self::alu_reg_modrm(op, 1), 0x17])?;
                Self::alu_epilogue(ctx, op)?;
                last = LastValue::HostFlags;
            }

            Uop::ShiftAcc { op, by } => {
                if matches!(op, ShiftOp::Rol | ShiftOp::Ror) {
                    Self::carry_to_cf(ctx)?;
                }
                let digit = Self::shift_digit(op);
                if by == 1 {
                    // d0 /digit al
                    ctx.put(&[0xD0, 0xC0 | (digit << 3)])?;
                } else {
                    // c0 /digit al, by
                    ctx.put(&[0xC0, 0xC0 | (digit << 3), by])?;
                }
                Self::set_carry_from_cf(ctx)?;
                last = match op {
                    // Rotates leave ZF/SF undefined; force a re-test.
                    ShiftOp::Rol | ShiftOp::Ror => LastValue::InA,
                    _ => LastValue::HostFlags,
                };
            }
            Uop::ShiftMem { op, addr } => {
                if matches!(op, ShiftOp::Rol | ShiftOp::Ror) {
                    Self::carry_to_cf(ctx)?;
                }
                let digit = Self::shift_digit(op);
                match addr {
                    Addr16::Const(a) => {
                        // d0 /digit byte [rdi + disp32]
                        ctx.put(&[0xD0, 0x80 | (digit << 3) | 0x07])?;
                        ctx.put(&u32::from(a).to_le_bytes())?;
                        Self::set_carry_from_cf(ctx)?;
                        last = match op {
                            ShiftOp::Rol | ShiftOp::Ror => LastValue::InMem(a),
                            _ => LastValue::HostFlags,
                        };
                    }
                    Addr16::Mem(op_addr) => {
                        Self::fetch_addr_r15(ctx, op_addr)?;
                        // d0 /digit byte [rdi + r15]
                        ctx.put(&[0x42, 0xD0, (digit << 3) | 0x04, 0x3F])?;
                        Self::set_carry_from_cf(ctx)?;
                        last = match op {
                            ShiftOp::Rol | ShiftOp::Ror => LastValue::InFetchedMem,
                            _ => LastValue::HostFlags,
                        };
                    }
                }
            }
            Uop::ShiftScratch { op } => {
                if matches!(op, ShiftOp::Rol | ShiftOp::Ror) {
                    Self::carry_to_cf(ctx)?;
                }
                let digit = Self::shift_digit(op);
                // d0 /digit byte [rdi + rdx]
                ctx.put(&[0xD0, (digit << 3) | 0x04, 0x17])?;
                Self::set_carry_from_cf(ctx)?;
                last = match op {
                    ShiftOp::Rol | ShiftOp::Ror => LastValue::InScratchMem,
                    _ => LastValue::HostFlags,
                };
            }
            Uop::IncMem { delta, addr } => {
                let digit: u8 = if delta > 0 { 0 } else { 1 };
                match addr {
                    Addr16::Const(a) => {
                        // fe /digit byte [rdi + disp32]
                        ctx.put(&[0xFE, 0x80 | (digit << 3) | 0x07])?;
                        ctx.put(&u32::from(a).to_le_bytes())?;
                    }
                    Addr16::Mem(op_addr) => {
                        Self::fetch_addr_r15(ctx, op_addr)?;
                        ctx.put(&[0x42, 0xFE, (digit << 3) | 0x04, 0x3F])?;
                    }
                }
                last = LastValue::HostFlags;
            }
            Uop::IncScratch { delta } => {
                let digit: u8 = if delta > 0 { 0 } else { 1 };
                ctx.put(&[0xFE, (digit << 3) | 0x04, 0x17])?;
                last = LastValue::HostFlags;
            }
            Uop::IncReg { reg, delta } => {
                let rm = match reg {
                    Reg::A => 0xC0,
                    Reg::X => 0xC3,
                    Reg::Y => 0xC1,
                };
                // fe /0 = inc r8, fe /1 = dec r8
                ctx.put(&[0xFE, if delta > 0 { rm } else { rm | 0x08 }])?;
                last = LastValue::HostFlags;
            }

            Uop::BitMem { addr } => {
                match addr {
                    Addr16::Const(a) => {
                        // mov dl, [rdi + addr]
                        ctx.put(&[0x8A, 0x97])?;
                        ctx.put(&u32::from(a).to_le_bytes())?;
                    }
                    Addr16::Mem(op_addr) => {
                        Self::fetch_addr_r15(ctx, op_addr)?;
                        ctx.put(&[0x42, 0x8A, 0x14, 0x3F])?;
                    }
                }
                // bt edx, 7 ; setb r11b (negative)
                ctx.put(&[0x0F, 0xBA, 0xE2, 0x07])?;
                ctx.put(&[0x41, 0x0F, 0x92, 0xC3])?;
                // bt edx, 6 ; setb r12b (overflow)
                ctx.put(&[0x0F, 0xBA, 0xE2, 0x06])?;
                ctx.put(&[0x41, 0x0F, 0x92, 0xC4])?;
                // and dl, al ; sete r10b (zero)
                ctx.put(&[0x20, 0xC2])?;
                ctx.put(&[0x41, 0x0F, 0x94, 0xC2])?;
            }

            Uop::SetC(v) => {
                // mov r9b, imm8
                ctx.put(&[0x41, 0xB1, u8::from(v)])?;
            }
            Uop::SetI(v) => {
                // bts/btr r8, 2
                if v {
                    ctx.put(&[0x49, 0x0F, 0xBA, 0xE8, 0x02])?;
                } else {
                    ctx.put(&[0x49, 0x0F, 0xBA, 0xF0, 0x02])?;
                }
            }
            Uop::SetD(v) => {
                if v {
                    ctx.put(&[0x49, 0x0F, 0xBA, 0xE8, 0x03])?;
                } else {
                    ctx.put(&[0x49, 0x0F, 0xBA, 0xF0, 0x03])?;
                }
            }
            Uop::ClearV => {
                // xor r12d, r12d
                ctx.put(&[0x45, 0x31, 0xE4])?;
            }

            Uop::FlagsNz { src, n, z } => {
                let saved = ctx.last_value;
                Self::flags_nz(ctx, src, n, z)?;
                last = saved;
            }

            Uop::PushA => {
                // mov [rsi], al ; dec sil
                ctx.put(&[0x88, 0x06])?;
                ctx.put(&[0x40, 0xFE, 0xCE])?;
            }
            Uop::PullA => {
                // inc sil ; mov al, [rsi]
                ctx.put(&[0x40, 0xFE, 0xC6])?;
                ctx.put(&[0x8A, 0x06])?;
                last = LastValue::InA;
            }
            Uop::PushP => {
                Self::status_to_scratch(ctx)?;
                // mov [rsi], dl ; dec sil
                ctx.put(&[0x88, 0x16])?;
                ctx.put(&[0x40, 0xFE, 0xCE])?;
            }
            Uop::PullP => {
                // inc sil ; mov dl, [rsi]
                ctx.put(&[0x40, 0xFE, 0xC6])?;
                ctx.put(&[0x8A, 0x16])?;
                Self::status_from_scratch(ctx)?;
            }

            Uop::Branch { cond, target } => {
                let skip = Self::test_cond(ctx, cond)?;
                // Taken-path body: optional penalty, then the transfer.
                let penalty = ctx.accurate_cycles;
                let body_len = (if penalty { 4 } else { 0 })
                    + match ctx.branch_kind {
                        BranchKind::Slot(_) => 5,
                        BranchKind::Dispatch => 9,
                    };
                ctx.put(&[skip, body_len as u8])?;
                if penalty {
                    // Taken costs one extra, two when crossing a page.
                    let next = ctx.instr_addr.wrapping_add(2);
                    let cost: u8 =
                        if target & 0xFF00 == next & 0xFF00 { 1 } else { 2 };
                    // sub r13, imm8
                    ctx.put(&[0x49, 0x83, 0xED, cost])?;
                }
                match ctx.branch_kind {
                    BranchKind::Slot(off) => {
                        // jmp rel32
                        let rel =
                            off.wrapping_sub(ctx.arena_pos() + 5) as i32;
                        ctx.put(&[0xE9])?;
                        ctx.put(&rel.to_le_bytes())?;
                    }
                    BranchKind::Dispatch => {
                        Self::mov_edx_imm(ctx, u32::from(target))?;
                        Self::call_context(ctx, ctx_offset::DISPATCH)?;
                    }
                }
            }
            Uop::Jump { target } => {
                Self::mov_edx_imm(ctx, u32::from(target))?;
                Self::call_context(ctx, ctx_offset::DISPATCH)?;
            }
            Uop::JumpInd { ptr } => {
                // Pointer read wraps within the page, as the 6502 does.
                let hi_addr = (ptr & 0xFF00) | u16::from((ptr as u8).wrapping_add(1));
                // movzx edx, byte [rdi + ptr] ; mov dh, [rdi + hi]
                ctx.put(&[0x0F, 0xB6, 0x97])?;
                ctx.put(&u32::from(ptr).to_le_bytes())?;
                ctx.put(&[0x8A, 0xB7])?;
                ctx.put(&u32::from(hi_addr).to_le_bytes())?;
                Self::call_context(ctx, ctx_offset::DISPATCH)?;
            }
            Uop::Jsr { target, ret } => {
                Self::mov_edx_imm(ctx, u32::from(ret))?;
                Self::push_scratch_word(ctx)?;
                Self::mov_edx_imm(ctx, u32::from(target))?;
                Self::call_context(ctx, ctx_offset::DISPATCH)?;
            }
            Uop::Rts => {
                Self::pull_scratch_word(ctx)?;
                // inc dx
                ctx.put(&[0x66, 0xFF, 0xC2])?;
                Self::call_context(ctx, ctx_offset::DISPATCH)?;
            }
            Uop::Rti => {
                // Pull P, then PC, then dispatch.
                ctx.put(&[0x40, 0xFE, 0xC6])?;
                ctx.put(&[0x8A, 0x16])?;
                Self::status_from_scratch(ctx)?;
                Self::pull_scratch_word(ctx)?;
                Self::call_context(ctx, ctx_offset::DISPATCH)?;
            }
            Uop::Brk { ret } => {
                Self::mov_edx_imm(ctx, u32::from(ret))?;
                Self::push_scratch_word(ctx)?;
                Self::status_to_scratch(ctx)?;
                ctx.put(&[0x88, 0x16])?;
                ctx.put(&[0x40, 0xFE, 0xCE])?;
                // sei
                ctx.put(&[0x49, 0x0F, 0xBA, 0xE8, 0x02])?;
                // Load the IRQ vector and dispatch.
                ctx.put(&[0x0F, 0xB6, 0x97])?;
                ctx.put(&0xFFFEu32.to_le_bytes())?;
                ctx.put(&[0x8A, 0xB7])?;
                ctx.put(&0xFFFFu32.to_le_bytes())?;
                Self::call_context(ctx, ctx_offset::DISPATCH)?;
            }

            Uop::Countdown { addr: _, cost } => {
                // sub r13, imm8 ; jns +4 ; call [r14 + TIMER]
                ctx.put(&[0x49, 0x83, 0xED, cost])?;
                ctx.put(&[0x79, 0x04])?;
                Self::call_context(ctx, ctx_offset::TIMER)?;
            }
            Uop::DebugTrap { addr } => {
                Self::mov_edx_imm(ctx, u32::from(addr))?;
                Self::call_context(ctx, ctx_offset::DEBUG)?;
            }
            Uop::Interp { addr } => {
                Self::mov_edx_imm(ctx, u32::from(addr))?;
                Self::call_context(ctx, ctx_offset::INTERP)?;
            }
            Uop::Exit { addr } => {
                // Park PC at the exit opcode and return to jit_enter.
                Self::mov_edx_imm(ctx, u32::from(addr))?;
                ctx.put(&[0xC3])?;
            }
            Uop::Halt { addr } => {
                Self::mov_edx_imm(ctx, u32::from(addr))?;
                Self::call_context(ctx, ctx_offset::HALT)?;
            }
        }
        ctx.last_value = last;
        Ok(())
    }

    fn emit_jump_to_slot(
        &self,
        ctx: &mut EmitCtx,
        target_offset: u32,
    ) -> Result<(), CapacityError> {
        // jmp rel32
        let rel = target_offset.wrapping_sub(ctx.arena_pos() + 5) as i32;
        ctx.put(&[0xE9])?;
        ctx.put(&rel.to_le_bytes())
    }

    fn emit_dispatch(
        &self,
        ctx: &mut EmitCtx,
        target_pc: u16,
    ) -> Result<(), CapacityError> {
        Self::mov_edx_imm(ctx, u32::from(target_pc))?;
        Self::call_context(ctx, ctx_offset::DISPATCH)
    }

    fn patch_branch(
        &self,
        buf: &mut [u8],
        at: usize,
        taken_offset: u32,
        field_arena_offset: u32,
    ) {
        // `at` addresses the rel32 of an emitted `jmp rel32`.
        let rel = taken_offset.wrapping_sub(field_arena_offset + 4) as i32;
        buf[at..at + 4].copy_from_slice(&rel.to_le_bytes());
    }

    fn slot_preconditions_test(&self) -> Result<(), JitError> {
        if INVALIDATION.len() > 4 {
            return Err(JitError::BackendPreconditions);
        }
        Ok(())
    }
}
