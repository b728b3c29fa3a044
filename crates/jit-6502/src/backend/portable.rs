//! Portable backend.
//!
//! Encodes uops as fixed-width 8-byte records in the arena slots. The
//! dispatcher's record interpreter executes them directly, which makes
//! this backend runnable on any host while keeping the exact slot
//! geometry, jit-pointer values and invalidation behaviour of the native
//! backends. The record layout is `[tag, a, b:u16le, c:u32le]`.

use crate::JitError;
use crate::uop::{AluOp, Addr16, Cond, Imm8, NzSrc, Reg, ShiftOp, TReg, Uop};

use super::{Backend, BranchKind, CapacityError, EmitCtx};

/// Bytes per record. A slot holds `SLOT_SIZE / RECORD_SIZE` records.
pub const RECORD_SIZE: usize = 8;

/// Record tags. The trap tag is zero so that the 4-byte invalidation
/// store `[0, 0, 0, 0]` both plants the trap and clears its argument.
pub mod tag {
    pub const TRAP: u8 = 0x00;
    pub const COUNTDOWN: u8 = 0x01;
    pub const DEBUG: u8 = 0x02;
    pub const MODE_ZPX: u8 = 0x03;
    pub const MODE_ZPX_DYN: u8 = 0x04;
    pub const MODE_ZPY: u8 = 0x05;
    pub const MODE_ZPY_DYN: u8 = 0x06;
    pub const MODE_ABX: u8 = 0x07;
    pub const MODE_ABX_DYN: u8 = 0x08;
    pub const MODE_ABY: u8 = 0x09;
    pub const MODE_ABY_DYN: u8 = 0x0A;
    pub const MODE_IDX: u8 = 0x0B;
    pub const MODE_IDX_DYN: u8 = 0x0C;
    pub const MODE_IDY: u8 = 0x0D;
    pub const MODE_IDY_DYN: u8 = 0x0E;
    pub const PAGE_PENALTY: u8 = 0x0F;
    pub const LOAD_IMM: u8 = 0x10;
    pub const LOAD_IMM_DYN: u8 = 0x11;
    pub const LOAD_MEM: u8 = 0x12;
    pub const LOAD_MEM_DYN: u8 = 0x13;
    pub const LOAD_SCRATCH: u8 = 0x14;
    pub const STORE_MEM: u8 = 0x15;
    pub const STORE_MEM_DYN: u8 = 0x16;
    pub const STORE_SCRATCH: u8 = 0x17;
    pub const STORE_IMM: u8 = 0x18;
    pub const TRANSFER: u8 = 0x19;
    pub const ALU_IMM: u8 = 0x1A;
    pub const ALU_IMM_DYN: u8 = 0x1B;
    pub const ALU_MEM: u8 = 0x1C;
    pub const ALU_MEM_DYN: u8 = 0x1D;
    pub const ALU_SCRATCH: u8 = 0x1E;
    pub const SHIFT_ACC: u8 = 0x1F;
    pub const SHIFT_MEM: u8 = 0x20;
    pub const SHIFT_MEM_DYN: u8 = 0x21;
    pub const SHIFT_SCRATCH: u8 = 0x22;
    pub const INC_MEM: u8 = 0x23;
    pub const INC_MEM_DYN: u8 = 0x24;
    pub const INC_SCRATCH: u8 = 0x25;
    pub const INC_REG: u8 = 0x26;
    pub const BIT_MEM: u8 = 0x27;
    pub const BIT_MEM_DYN: u8 = 0x28;
    pub const SET_C: u8 = 0x29;
    pub const SET_I: u8 = 0x2A;
    pub const SET_D: u8 = 0x2B;
    pub const CLEAR_V: u8 = 0x2C;
    pub const FLAGS_NZ: u8 = 0x2D;
    pub const PUSH_A: u8 = 0x2E;
    pub const PULL_A: u8 = 0x2F;
    pub const PUSH_P: u8 = 0x30;
    pub const PULL_P: u8 = 0x31;
    pub const BRANCH: u8 = 0x32;
    pub const JUMP_SLOT: u8 = 0x33;
    pub const DISPATCH: u8 = 0x34;
    pub const JUMP_IND: u8 = 0x35;
    pub const JSR: u8 = 0x36;
    pub const RTS: u8 = 0x37;
    pub const RTI: u8 = 0x38;
    pub const BRK: u8 = 0x39;
    pub const INTERP: u8 = 0x3A;
    pub const EXIT: u8 = 0x3B;
    pub const HALT: u8 = 0x3C;
}

/// Branch record flag bits carried in `a` alongside the condition.
pub const BRANCH_FLAG_DISPATCH: u8 = 0x10;
pub const BRANCH_FLAG_ACCURATE: u8 = 0x20;

/// One decoded record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    pub tag: u8,
    pub a: u8,
    pub b: u16,
    pub c: u32,
}

impl Record {
    #[must_use]
    pub fn new(tag: u8, a: u8, b: u16, c: u32) -> Self {
        Self { tag, a, b, c }
    }

    /// Read the record at a byte offset.
    #[must_use]
    pub fn read(bytes: &[u8], off: usize) -> Self {
        Self {
            tag: bytes[off],
            a: bytes[off + 1],
            b: u16::from_le_bytes([bytes[off + 2], bytes[off + 3]]),
            c: u32::from_le_bytes([
                bytes[off + 4],
                bytes[off + 5],
                bytes[off + 6],
                bytes[off + 7],
            ]),
        }
    }

    fn write(self, ctx: &mut EmitCtx) -> Result<(), CapacityError> {
        let b = self.b.to_le_bytes();
        let c = self.c.to_le_bytes();
        ctx.put(&[self.tag, self.a, b[0], b[1], c[0], c[1], c[2], c[3]])
    }
}

pub const fn reg_code(reg: Reg) -> u8 {
    match reg {
        Reg::A => 0,
        Reg::X => 1,
        Reg::Y => 2,
    }
}

pub const fn treg_code(reg: TReg) -> u8 {
    match reg {
        TReg::A => 0,
        TReg::X => 1,
        TReg::Y => 2,
        TReg::S => 3,
    }
}

pub const fn alu_code(op: AluOp) -> u8 {
    match op {
        AluOp::Ora => 0,
        AluOp::And => 1,
        AluOp::Eor => 2,
        AluOp::Adc => 3,
        AluOp::Sbc => 4,
        AluOp::Add => 5,
        AluOp::Sub => 6,
        AluOp::Cmp => 7,
        AluOp::Cpx => 8,
        AluOp::Cpy => 9,
    }
}

pub const fn shift_code(op: ShiftOp) -> u8 {
    match op {
        ShiftOp::Asl => 0,
        ShiftOp::Lsr => 1,
        ShiftOp::Rol => 2,
        ShiftOp::Ror => 3,
    }
}

pub const fn cond_code(cond: Cond) -> u8 {
    match cond {
        Cond::Pl => 0,
        Cond::Mi => 1,
        Cond::Vc => 2,
        Cond::Vs => 3,
        Cond::Cc => 4,
        Cond::Cs => 5,
        Cond::Ne => 6,
        Cond::Eq => 7,
    }
}

pub const fn nz_code(src: NzSrc) -> u8 {
    match src {
        NzSrc::A => 0,
        NzSrc::X => 1,
        NzSrc::Y => 2,
        NzSrc::Last => 3,
    }
}

/// The default, runs-everywhere backend.
#[derive(Debug, Default)]
pub struct PortableBackend;

impl PortableBackend {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn imm8_record(
        tag_const: u8,
        tag_dyn: u8,
        a: u8,
        value: Imm8,
    ) -> Record {
        match value {
            Imm8::Const(v) => Record::new(tag_const, a, u16::from(v), 0),
            Imm8::Mem(op_addr) => Record::new(tag_dyn, a, op_addr, 0),
        }
    }

    fn addr16_record(tag_const: u8, tag_dyn: u8, a: u8, addr: Addr16) -> Record {
        match addr {
            Addr16::Const(v) => Record::new(tag_const, a, v, 0),
            Addr16::Mem(op_addr) => Record::new(tag_dyn, a, op_addr, 0),
        }
    }
}

impl Backend for PortableBackend {
    fn name(&self) -> &'static str {
        "portable"
    }

    fn is_execution_enabled(&self) -> bool {
        true
    }

    fn supports_uop(&self, uop: &Uop) -> bool {
        // The merged store is only emitted with both parts constant; the
        // dynamic forms never arise because the optimiser runs on
        // non-dynamic instructions only.
        !matches!(
            uop,
            Uop::StoreImm { addr: Addr16::Mem(_), .. }
                | Uop::StoreImm { value: Imm8::Mem(_), .. }
        )
    }

    fn invalidation_sequence(&self) -> &'static [u8] {
        // One zeroed record head; a 4-byte aligned store plants it.
        &[tag::TRAP, 0, 0, 0]
    }

    fn fill_with_trap(&self, buf: &mut [u8]) {
        buf.fill(tag::TRAP);
    }

    fn emit(&self, ctx: &mut EmitCtx, uop: &Uop) -> Result<(), CapacityError> {
        use tag as t;
        let rec = match *uop {
            Uop::ModeZpx { base } => {
                Self::imm8_record(t::MODE_ZPX, t::MODE_ZPX_DYN, 0, base)
            }
            Uop::ModeZpy { base } => {
                Self::imm8_record(t::MODE_ZPY, t::MODE_ZPY_DYN, 0, base)
            }
            Uop::ModeAbx { base } => {
                Self::addr16_record(t::MODE_ABX, t::MODE_ABX_DYN, 0, base)
            }
            Uop::ModeAby { base } => {
                Self::addr16_record(t::MODE_ABY, t::MODE_ABY_DYN, 0, base)
            }
            Uop::ModeIdx { zp } => Self::imm8_record(t::MODE_IDX, t::MODE_IDX_DYN, 0, zp),
            Uop::ModeIdy { zp } => Self::imm8_record(t::MODE_IDY, t::MODE_IDY_DYN, 0, zp),
            Uop::CheckPagePenalty => Record::new(t::PAGE_PENALTY, 0, 0, 0),

            Uop::LoadImm { reg, value } => {
                Self::imm8_record(t::LOAD_IMM, t::LOAD_IMM_DYN, reg_code(reg), value)
            }
            Uop::LoadMem { reg, addr } => {
                Self::addr16_record(t::LOAD_MEM, t::LOAD_MEM_DYN, reg_code(reg), addr)
            }
            Uop::LoadScratch { reg } => Record::new(t::LOAD_SCRATCH, reg_code(reg), 0, 0),
            Uop::StoreMem { reg, addr } => {
                Self::addr16_record(t::STORE_MEM, t::STORE_MEM_DYN, reg_code(reg), addr)
            }
            Uop::StoreScratch { reg } => {
                Record::new(t::STORE_SCRATCH, reg_code(reg), 0, 0)
            }
            Uop::StoreImm { addr: Addr16::Const(a), value: Imm8::Const(v) } => {
                Record::new(t::STORE_IMM, v, a, 0)
            }
            Uop::StoreImm { .. } => return Err(CapacityError),
            Uop::Transfer { from, to } => {
                Record::new(t::TRANSFER, treg_code(from) << 4 | treg_code(to), 0, 0)
            }

            Uop::AluImm { op, value } => {
                Self::imm8_record(t::ALU_IMM, t::ALU_IMM_DYN, alu_code(op), value)
            }
            Uop::AluMem { op, addr } => {
                Self::addr16_record(t::ALU_MEM, t::ALU_MEM_DYN, alu_code(op), addr)
            }
            Uop::AluScratch { op } => Record::new(t::ALU_SCRATCH, alu_code(op), 0, 0),

            Uop::ShiftAcc { op, by } => {
                Record::new(t::SHIFT_ACC, shift_code(op), u16::from(by), 0)
            }
            Uop::ShiftMem { op, addr } => {
                Self::addr16_record(t::SHIFT_MEM, t::SHIFT_MEM_DYN, shift_code(op), addr)
            }
            Uop::ShiftScratch { op } => Record::new(t::SHIFT_SCRATCH, shift_code(op), 0, 0),
            Uop::IncMem { delta, addr } => {
                Self::addr16_record(t::INC_MEM, t::INC_MEM_DYN, delta as u8, addr)
            }
            Uop::IncScratch { delta } => Record::new(t::INC_SCRATCH, delta as u8, 0, 0),
            Uop::IncReg { reg, delta } => {
                Record::new(t::INC_REG, reg_code(reg), u16::from(delta as u8), 0)
            }

            Uop::BitMem { addr } => Self::addr16_record(t::BIT_MEM, t::BIT_MEM_DYN, 0, addr),

            Uop::SetC(v) => Record::new(t::SET_C, u8::from(v), 0, 0),
            Uop::SetI(v) => Record::new(t::SET_I, u8::from(v), 0, 0),
            Uop::SetD(v) => Record::new(t::SET_D, u8::from(v), 0, 0),
            Uop::ClearV => Record::new(t::CLEAR_V, 0, 0, 0),

            Uop::FlagsNz { src, n, z } => Record::new(
                t::FLAGS_NZ,
                nz_code(src) << 2 | u8::from(n) << 1 | u8::from(z),
                0,
                0,
            ),

            Uop::PushA => Record::new(t::PUSH_A, 0, 0, 0),
            Uop::PullA => Record::new(t::PULL_A, 0, 0, 0),
            Uop::PushP => Record::new(t::PUSH_P, 0, 0, 0),
            Uop::PullP => Record::new(t::PULL_P, 0, 0, 0),

            Uop::Branch { cond, target } => {
                let mut a = cond_code(cond);
                if ctx.accurate_cycles {
                    a |= BRANCH_FLAG_ACCURATE;
                }
                let taken = match ctx.branch_kind {
                    BranchKind::Slot(off) => off,
                    BranchKind::Dispatch => {
                        a |= BRANCH_FLAG_DISPATCH;
                        0
                    }
                };
                Record::new(t::BRANCH, a, target, taken)
            }
            // Unconditional transfers resolve through the dispatcher; the
            // compiler emits direct slot jumps via `emit_jump_to_slot`.
            Uop::Jump { target } => Record::new(t::DISPATCH, 0, target, 0),
            Uop::JumpInd { ptr } => Record::new(t::JUMP_IND, 0, ptr, 0),
            Uop::Jsr { target, ret } => Record::new(t::JSR, 0, target, u32::from(ret)),
            Uop::Rts => Record::new(t::RTS, 0, 0, 0),
            Uop::Rti => Record::new(t::RTI, 0, 0, 0),
            Uop::Brk { ret } => Record::new(t::BRK, 0, ret, 0),

            Uop::Countdown { addr, cost } => {
                Record::new(t::COUNTDOWN, cost, addr, 0)
            }
            Uop::DebugTrap { addr } => Record::new(t::DEBUG, 0, addr, 0),
            Uop::Interp { addr } => Record::new(t::INTERP, 0, addr, 0),
            Uop::Exit { addr } => Record::new(t::EXIT, 0, addr, 0),
            Uop::Halt { addr } => Record::new(t::HALT, 0, addr, 0),
        };
        rec.write(ctx)
    }

    fn emit_jump_to_slot(
        &self,
        ctx: &mut EmitCtx,
        target_offset: u32,
    ) -> Result<(), CapacityError> {
        Record::new(tag::JUMP_SLOT, 0, 0, target_offset).write(ctx)
    }

    fn emit_dispatch(
        &self,
        ctx: &mut EmitCtx,
        target_pc: u16,
    ) -> Result<(), CapacityError> {
        Record::new(tag::DISPATCH, 0, target_pc, 0).write(ctx)
    }

    fn patch_branch(
        &self,
        buf: &mut [u8],
        at: usize,
        taken_offset: u32,
        _field_arena_offset: u32,
    ) {
        // `at` addresses the branch record; the taken edge lives in `c`.
        buf[at + 4..at + 8].copy_from_slice(&taken_offset.to_le_bytes());
        buf[at + 1] &= !BRANCH_FLAG_DISPATCH;
    }

    fn slot_preconditions_test(&self) -> Result<(), JitError> {
        // Slot geometry must hold a whole number of records and the trap
        // must fit the 4-byte invalidation store.
        if crate::arena::SLOT_SIZE % RECORD_SIZE != 0
            || self.invalidation_sequence().len() > 4
        {
            return Err(JitError::BackendPreconditions);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emit_one(uop: Uop) -> Record {
        let backend = PortableBackend::new();
        let mut buf = [0u8; 64];
        let mut ctx = EmitCtx::new(&mut buf, 0x1000, true);
        backend.emit(&mut ctx, &uop).unwrap_or_else(|_| unreachable!());
        Record::read(&buf, 0)
    }

    #[test]
    fn records_round_trip() {
        let rec = emit_one(Uop::LoadImm { reg: Reg::A, value: Imm8::Const(0x42) });
        assert_eq!(rec.tag, tag::LOAD_IMM);
        assert_eq!(rec.b, 0x42);

        let rec = emit_one(Uop::LoadImm { reg: Reg::A, value: Imm8::Mem(0x2002) });
        assert_eq!(rec.tag, tag::LOAD_IMM_DYN);
        assert_eq!(rec.b, 0x2002);
    }

    #[test]
    fn invalidation_store_is_at_most_four_bytes() {
        let backend = PortableBackend::new();
        assert!(backend.invalidation_sequence().len() <= 4);
        let mut slot = [0xFFu8; 16];
        slot[..4].copy_from_slice(backend.invalidation_sequence());
        assert!(backend.is_invalidated_at(&slot));
        assert_eq!(Record::read(&slot, 0).tag, tag::TRAP);
    }

    #[test]
    fn branch_patching_clears_dispatch_flag() {
        let backend = PortableBackend::new();
        let mut buf = [0u8; 64];
        let mut ctx = EmitCtx::new(&mut buf, 0x1000, true);
        ctx.branch_kind = BranchKind::Dispatch;
        backend
            .emit(&mut ctx, &Uop::Branch { cond: Cond::Ne, target: 0x1234 })
            .unwrap_or_else(|_| unreachable!());
        backend.patch_branch(&mut buf, 0, 0xABCD0, 0);
        let rec = Record::read(&buf, 0);
        assert_eq!(rec.c, 0xABCD0);
        assert_eq!(rec.a & BRANCH_FLAG_DISPATCH, 0);
    }
}
