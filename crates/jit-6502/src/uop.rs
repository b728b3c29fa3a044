//! Architecture-neutral micro-ops.
//!
//! The decoder lowers each 6502 instruction to a short run of uops; the
//! optimiser rewrites them; a backend turns them into slot code. Operand
//! bytes appear either baked in ([`Imm8::Const`], [`Addr16::Const`]) or as
//! run-time fetches from the emulated code bytes ([`Imm8::Mem`],
//! [`Addr16::Mem`]) once an address has been promoted to dynamic-operand
//! form.

/// A value register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    A,
    X,
    Y,
}

/// Transferable registers (the TAX/TXS family).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TReg {
    A,
    X,
    Y,
    S,
}

/// An 8-bit operand: baked constant, or fetched from emulated memory at
/// run time (dynamic-operand form; the address is the operand byte's).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Imm8 {
    Const(u8),
    Mem(u16),
}

/// A 16-bit address operand: baked, or assembled at run time from the two
/// operand bytes starting at the given address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addr16 {
    Const(u16),
    Mem(u16),
}

/// Accumulator ALU operations. `Add`/`Sub` are the carry-folded forms
/// produced by the optimiser from CLC;ADC and SEC;SBC pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Ora,
    And,
    Eor,
    Adc,
    Sbc,
    Add,
    Sub,
    Cmp,
    Cpx,
    Cpy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Asl,
    Lsr,
    Rol,
    Ror,
}

/// Branch conditions, named after the 6502 mnemonic suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Pl,
    Mi,
    Vc,
    Vs,
    Cc,
    Cs,
    Ne,
    Eq,
}

/// Where an N/Z materialisation takes its value from. `Last` is the result
/// of the immediately preceding value-producing uop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NzSrc {
    A,
    X,
    Y,
    Last,
}

/// One micro-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Uop {
    // Effective-address computation into the scratch register. The
    // page-crossing flag is latched for a following `CheckPagePenalty`.
    ModeZpx { base: Imm8 },
    ModeZpy { base: Imm8 },
    ModeAbx { base: Addr16 },
    ModeAby { base: Addr16 },
    ModeIdx { zp: Imm8 },
    ModeIdy { zp: Imm8 },
    /// Charge one extra cycle if the preceding mode uop crossed a page.
    CheckPagePenalty,

    LoadImm { reg: Reg, value: Imm8 },
    LoadMem { reg: Reg, addr: Addr16 },
    LoadScratch { reg: Reg },
    StoreMem { reg: Reg, addr: Addr16 },
    StoreScratch { reg: Reg },
    /// Merged constant store (STOA): write an immediate straight to memory.
    StoreImm { addr: Addr16, value: Imm8 },
    Transfer { from: TReg, to: TReg },

    AluImm { op: AluOp, value: Imm8 },
    AluMem { op: AluOp, addr: Addr16 },
    AluScratch { op: AluOp },

    /// Accumulator shift; `by` > 1 is the coalesced repeated-shift form.
    ShiftAcc { op: ShiftOp, by: u8 },
    ShiftMem { op: ShiftOp, addr: Addr16 },
    ShiftScratch { op: ShiftOp },
    IncMem { delta: i8, addr: Addr16 },
    IncScratch { delta: i8 },
    IncReg { reg: Reg, delta: i8 },

    BitMem { addr: Addr16 },

    SetC(bool),
    SetI(bool),
    SetD(bool),
    ClearV,

    /// Materialise N and/or Z from `src`. The optimiser clears `n` or `z`
    /// when the corresponding flag is provably overwritten before any read.
    FlagsNz { src: NzSrc, n: bool, z: bool },

    PushA,
    PullA,
    PushP,
    PullP,

    /// Conditional branch. Taken path transfers to `target`; the emitter
    /// resolves it to an in-block slot jump or a dispatcher exit.
    Branch { cond: Cond, target: u16 },
    Jump { target: u16 },
    JumpInd { ptr: u16 },
    Jsr { target: u16, ret: u16 },
    Rts,
    Rti,
    Brk { ret: u16 },

    /// Instruction boundary: charge `cost` cycles against the countdown.
    /// `addr` is the owning 6502 address, which is also what the debug and
    /// fault paths report.
    Countdown { addr: u16, cost: u8 },
    /// Invoke the debug callback with the register shadow.
    DebugTrap { addr: u16 },
    /// Execute the instruction at `addr` through the interpreter.
    Interp { addr: u16 },
    /// Leave emulation with PC parked at `addr` (the exit opcode).
    Exit { addr: u16 },
    /// KIL: jam until reset.
    Halt { addr: u16 },
}

impl Uop {
    /// Returns true if this uop reads the carry flag.
    #[must_use]
    pub fn reads_carry(self) -> bool {
        match self {
            Uop::AluImm { op, .. } | Uop::AluMem { op, .. } | Uop::AluScratch { op } => {
                matches!(op, AluOp::Adc | AluOp::Sbc)
            }
            Uop::ShiftAcc { op, .. }
            | Uop::ShiftMem { op, .. }
            | Uop::ShiftScratch { op } => matches!(op, ShiftOp::Rol | ShiftOp::Ror),
            Uop::Branch { cond, .. } => matches!(cond, Cond::Cc | Cond::Cs),
            Uop::PushP | Uop::Brk { .. } | Uop::Interp { .. } | Uop::Exit { .. } => true,
            _ => false,
        }
    }

    /// Returns true if this uop writes the carry flag.
    #[must_use]
    pub fn writes_carry(self) -> bool {
        match self {
            Uop::AluImm { op, .. } | Uop::AluMem { op, .. } | Uop::AluScratch { op } => {
                !matches!(op, AluOp::Ora | AluOp::And | AluOp::Eor)
            }
            Uop::ShiftAcc { .. } | Uop::ShiftMem { .. } | Uop::ShiftScratch { .. } => true,
            Uop::SetC(_) | Uop::PullP | Uop::Rti | Uop::Interp { .. } => true,
            _ => false,
        }
    }

    /// Returns true if this uop reads register `reg`.
    #[must_use]
    pub fn reads_reg(self, reg: Reg) -> bool {
        let treg = match reg {
            Reg::A => TReg::A,
            Reg::X => TReg::X,
            Reg::Y => TReg::Y,
        };
        match self {
            Uop::StoreMem { reg: r, .. } | Uop::StoreScratch { reg: r } => r == reg,
            Uop::IncReg { reg: r, .. } => r == reg,
            Uop::Transfer { from, .. } => from == treg,
            Uop::AluImm { op, .. } | Uop::AluMem { op, .. } | Uop::AluScratch { op } => {
                match op {
                    AluOp::Cpx => reg == Reg::X,
                    AluOp::Cpy => reg == Reg::Y,
                    _ => reg == Reg::A,
                }
            }
            Uop::ShiftAcc { .. } | Uop::PushA | Uop::BitMem { .. } => reg == Reg::A,
            Uop::ModeZpx { .. } | Uop::ModeAbx { .. } | Uop::ModeIdx { .. } => {
                reg == Reg::X
            }
            Uop::ModeZpy { .. } | Uop::ModeAby { .. } | Uop::ModeIdy { .. } => {
                reg == Reg::Y
            }
            Uop::FlagsNz { src, .. } => match src {
                NzSrc::A => reg == Reg::A,
                NzSrc::X => reg == Reg::X,
                NzSrc::Y => reg == Reg::Y,
                NzSrc::Last => false,
            },
            // Anything that leaves uop-land may observe everything.
            Uop::Interp { .. }
            | Uop::Exit { .. }
            | Uop::Halt { .. }
            | Uop::Brk { .. }
            | Uop::DebugTrap { .. } => true,
            _ => false,
        }
    }

    /// Returns true if this uop writes register `reg`.
    #[must_use]
    pub fn writes_reg(self, reg: Reg) -> bool {
        let treg = match reg {
            Reg::A => TReg::A,
            Reg::X => TReg::X,
            Reg::Y => TReg::Y,
        };
        match self {
            Uop::LoadImm { reg: r, .. }
            | Uop::LoadMem { reg: r, .. }
            | Uop::LoadScratch { reg: r }
            | Uop::IncReg { reg: r, .. } => r == reg,
            Uop::Transfer { to, .. } => to == treg,
            Uop::AluImm { op, .. } | Uop::AluMem { op, .. } | Uop::AluScratch { op } => {
                reg == Reg::A && !matches!(op, AluOp::Cmp | AluOp::Cpx | AluOp::Cpy)
            }
            Uop::ShiftAcc { .. } | Uop::PullA => reg == Reg::A,
            Uop::Interp { .. } | Uop::Rti => true,
            _ => false,
        }
    }

    /// Returns true for uops that end the instruction stream of a block.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Uop::Jump { .. }
                | Uop::JumpInd { .. }
                | Uop::Jsr { .. }
                | Uop::Rts
                | Uop::Rti
                | Uop::Brk { .. }
                | Uop::Exit { .. }
                | Uop::Halt { .. }
        )
    }
}
