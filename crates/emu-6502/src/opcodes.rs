//! Opcode classification tables.
//!
//! Shared by the interpreter and the recompiling drivers so both agree on
//! operation, addressing mode, instruction length and base cycle cost for
//! every opcode byte, undocumented ones included.

/// The operation class of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    /// Illegal opcode that halts a standard 6502.
    Kil,
    /// Undocumented opcode with no stable modelled behaviour; executes as a
    /// single-byte NOP.
    Unk,
    Brk,
    Ora,
    Asl,
    Php,
    Bpl,
    Clc,
    Jsr,
    And,
    Bit,
    Plp,
    Rol,
    Bmi,
    Sec,
    Rti,
    Eor,
    Lsr,
    Pha,
    Jmp,
    Bvc,
    Cli,
    Rts,
    Adc,
    Pla,
    Ror,
    Bvs,
    Sei,
    Sty,
    Sta,
    Stx,
    Dey,
    Txa,
    Bcc,
    Tya,
    Txs,
    Ldy,
    Lda,
    Ldx,
    Tay,
    Tax,
    Bcs,
    Clv,
    Tsx,
    Cpy,
    Cmp,
    Cpx,
    Dec,
    Iny,
    Dex,
    Bne,
    Cld,
    Sbc,
    Inx,
    Nop,
    Inc,
    Beq,
    Sed,
}

/// The addressing mode of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrMode {
    /// Implied; no operand bytes.
    Imp,
    /// Accumulator; no operand bytes.
    Acc,
    /// Immediate `#$nn`.
    Imm,
    /// Zero page `$nn`.
    Zpg,
    /// Zero page indexed `$nn,X`.
    Zpx,
    /// Zero page indexed `$nn,Y`.
    Zpy,
    /// Absolute `$nnnn`.
    Abs,
    /// Absolute indexed `$nnnn,X`.
    Abx,
    /// Absolute indexed `$nnnn,Y`.
    Aby,
    /// Indexed indirect `($nn,X)`.
    Idx,
    /// Indirect indexed `($nn),Y`.
    Idy,
    /// Absolute indirect `($nnnn)`; JMP only.
    Ind,
    /// PC-relative branch offset.
    Rel,
}

impl AddrMode {
    /// Instruction length in bytes, opcode included.
    #[must_use]
    pub const fn length(self) -> u8 {
        match self {
            AddrMode::Imp | AddrMode::Acc => 1,
            AddrMode::Imm
            | AddrMode::Zpg
            | AddrMode::Zpx
            | AddrMode::Zpy
            | AddrMode::Idx
            | AddrMode::Idy
            | AddrMode::Rel => 2,
            AddrMode::Abs | AddrMode::Abx | AddrMode::Aby | AddrMode::Ind => 3,
        }
    }
}

use AddrMode as M;
use OpType as T;

/// Operation class per opcode byte.
pub const OPTYPES: [OpType; 256] = [
    // 0x00
    T::Brk, T::Ora, T::Kil, T::Unk, T::Unk, T::Ora, T::Asl, T::Unk,
    T::Php, T::Ora, T::Asl, T::Unk, T::Unk, T::Ora, T::Asl, T::Unk,
    // 0x10
    T::Bpl, T::Ora, T::Kil, T::Unk, T::Unk, T::Ora, T::Asl, T::Unk,
    T::Clc, T::Ora, T::Unk, T::Unk, T::Unk, T::Ora, T::Asl, T::Unk,
    // 0x20
    T::Jsr, T::And, T::Kil, T::Unk, T::Bit, T::And, T::Rol, T::Unk,
    T::Plp, T::And, T::Rol, T::Unk, T::Bit, T::And, T::Rol, T::Unk,
    // 0x30
    T::Bmi, T::And, T::Kil, T::Unk, T::Unk, T::And, T::Rol, T::Unk,
    T::Sec, T::And, T::Unk, T::Unk, T::Unk, T::And, T::Rol, T::Unk,
    // 0x40
    T::Rti, T::Eor, T::Kil, T::Unk, T::Unk, T::Eor, T::Lsr, T::Unk,
    T::Pha, T::Eor, T::Lsr, T::Unk, T::Jmp, T::Eor, T::Lsr, T::Unk,
    // 0x50
    T::Bvc, T::Eor, T::Kil, T::Unk, T::Unk, T::Eor, T::Lsr, T::Unk,
    T::Cli, T::Eor, T::Unk, T::Unk, T::Unk, T::Eor, T::Lsr, T::Unk,
    // 0x60
    T::Rts, T::Adc, T::Kil, T::Unk, T::Unk, T::Adc, T::Ror, T::Unk,
    T::Pla, T::Adc, T::Ror, T::Unk, T::Jmp, T::Adc, T::Ror, T::Unk,
    // 0x70
    T::Bvs, T::Adc, T::Kil, T::Unk, T::Unk, T::Adc, T::Ror, T::Unk,
    T::Sei, T::Adc, T::Unk, T::Unk, T::Unk, T::Adc, T::Ror, T::Unk,
    // 0x80
    T::Unk, T::Sta, T::Unk, T::Unk, T::Sty, T::Sta, T::Stx, T::Unk,
    T::Dey, T::Unk, T::Txa, T::Unk, T::Sty, T::Sta, T::Stx, T::Unk,
    // 0x90
    T::Bcc, T::Sta, T::Kil, T::Unk, T::Sty, T::Sta, T::Stx, T::Unk,
    T::Tya, T::Sta, T::Txs, T::Unk, T::Unk, T::Sta, T::Unk, T::Unk,
    // 0xA0
    T::Ldy, T::Lda, T::Ldx, T::Unk, T::Ldy, T::Lda, T::Ldx, T::Unk,
    T::Tay, T::Lda, T::Tax, T::Unk, T::Ldy, T::Lda, T::Ldx, T::Unk,
    // 0xB0
    T::Bcs, T::Lda, T::Kil, T::Unk, T::Ldy, T::Lda, T::Ldx, T::Unk,
    T::Clv, T::Lda, T::Tsx, T::Unk, T::Ldy, T::Lda, T::Ldx, T::Unk,
    // 0xC0
    T::Cpy, T::Cmp, T::Unk, T::Unk, T::Cpy, T::Cmp, T::Dec, T::Unk,
    T::Iny, T::Cmp, T::Dex, T::Unk, T::Cpy, T::Cmp, T::Dec, T::Unk,
    // 0xD0
    T::Bne, T::Cmp, T::Kil, T::Unk, T::Unk, T::Cmp, T::Dec, T::Unk,
    T::Cld, T::Cmp, T::Unk, T::Unk, T::Unk, T::Cmp, T::Dec, T::Unk,
    // 0xE0
    T::Cpx, T::Sbc, T::Unk, T::Unk, T::Cpx, T::Sbc, T::Inc, T::Unk,
    T::Inx, T::Sbc, T::Nop, T::Unk, T::Cpx, T::Sbc, T::Inc, T::Unk,
    // 0xF0
    T::Beq, T::Sbc, T::Kil, T::Unk, T::Unk, T::Sbc, T::Inc, T::Unk,
    T::Sed, T::Sbc, T::Unk, T::Unk, T::Unk, T::Sbc, T::Inc, T::Unk,
];

/// Addressing mode per opcode byte. `Kil` and `Unk` entries are `Imp` so
/// that every opcode has a well-defined length.
pub const OPMODES: [AddrMode; 256] = [
    // 0x00
    M::Imp, M::Idx, M::Imp, M::Imp, M::Imp, M::Zpg, M::Zpg, M::Imp,
    M::Imp, M::Imm, M::Acc, M::Imp, M::Imp, M::Abs, M::Abs, M::Imp,
    // 0x10
    M::Rel, M::Idy, M::Imp, M::Imp, M::Imp, M::Zpx, M::Zpx, M::Imp,
    M::Imp, M::Aby, M::Imp, M::Imp, M::Imp, M::Abx, M::Abx, M::Imp,
    // 0x20
    M::Abs, M::Idx, M::Imp, M::Imp, M::Zpg, M::Zpg, M::Zpg, M::Imp,
    M::Imp, M::Imm, M::Acc, M::Imp, M::Abs, M::Abs, M::Abs, M::Imp,
    // 0x30
    M::Rel, M::Idy, M::Imp, M::Imp, M::Imp, M::Zpx, M::Zpx, M::Imp,
    M::Imp, M::Aby, M::Imp, M::Imp, M::Imp, M::Abx, M::Abx, M::Imp,
    // 0x40
    M::Imp, M::Idx, M::Imp, M::Imp, M::Imp, M::Zpg, M::Zpg, M::Imp,
    M::Imp, M::Imm, M::Acc, M::Imp, M::Abs, M::Abs, M::Abs, M::Imp,
    // 0x50
    M::Rel, M::Idy, M::Imp, M::Imp, M::Imp, M::Zpx, M::Zpx, M::Imp,
    M::Imp, M::Aby, M::Imp, M::Imp, M::Imp, M::Abx, M::Abx, M::Imp,
    // 0x60
    M::Imp, M::Idx, M::Imp, M::Imp, M::Imp, M::Zpg, M::Zpg, M::Imp,
    M::Imp, M::Imm, M::Acc, M::Imp, M::Ind, M::Abs, M::Abs, M::Imp,
    // 0x70
    M::Rel, M::Idy, M::Imp, M::Imp, M::Imp, M::Zpx, M::Zpx, M::Imp,
    M::Imp, M::Aby, M::Imp, M::Imp, M::Imp, M::Abx, M::Abx, M::Imp,
    // 0x80
    M::Imp, M::Idx, M::Imp, M::Imp, M::Zpg, M::Zpg, M::Zpg, M::Imp,
    M::Imp, M::Imp, M::Imp, M::Imp, M::Abs, M::Abs, M::Abs, M::Imp,
    // 0x90
    M::Rel, M::Idy, M::Imp, M::Imp, M::Zpx, M::Zpx, M::Zpy, M::Imp,
    M::Imp, M::Aby, M::Imp, M::Imp, M::Imp, M::Abx, M::Imp, M::Imp,
    // 0xA0
    M::Imm, M::Idx, M::Imm, M::Imp, M::Zpg, M::Zpg, M::Zpg, M::Imp,
    M::Imp, M::Imm, M::Imp, M::Imp, M::Abs, M::Abs, M::Abs, M::Imp,
    // 0xB0
    M::Rel, M::Idy, M::Imp, M::Imp, M::Zpx, M::Zpx, M::Zpy, M::Imp,
    M::Imp, M::Aby, M::Imp, M::Imp, M::Abx, M::Abx, M::Aby, M::Imp,
    // 0xC0
    M::Imm, M::Idx, M::Imp, M::Imp, M::Zpg, M::Zpg, M::Zpg, M::Imp,
    M::Imp, M::Imm, M::Imp, M::Imp, M::Abs, M::Abs, M::Abs, M::Imp,
    // 0xD0
    M::Rel, M::Idy, M::Imp, M::Imp, M::Imp, M::Zpx, M::Zpx, M::Imp,
    M::Imp, M::Aby, M::Imp, M::Imp, M::Imp, M::Abx, M::Abx, M::Imp,
    // 0xE0
    M::Imm, M::Idx, M::Imp, M::Imp, M::Zpg, M::Zpg, M::Zpg, M::Imp,
    M::Imp, M::Imm, M::Imp, M::Imp, M::Abs, M::Abs, M::Abs, M::Imp,
    // 0xF0
    M::Rel, M::Idy, M::Imp, M::Imp, M::Imp, M::Zpx, M::Zpx, M::Imp,
    M::Imp, M::Aby, M::Imp, M::Imp, M::Imp, M::Abx, M::Abx, M::Imp,
];

/// Base cycle cost per opcode byte, page-crossing and branch penalties
/// excluded. `Kil` and `Unk` opcodes cost 2, like a NOP.
pub const CYCLES: [u8; 256] = [
    7, 6, 2, 2, 2, 3, 5, 2, 3, 2, 2, 2, 2, 4, 6, 2, // 0x00
    2, 5, 2, 2, 2, 4, 6, 2, 2, 4, 2, 2, 2, 4, 7, 2, // 0x10
    6, 6, 2, 2, 3, 3, 5, 2, 4, 2, 2, 2, 4, 4, 6, 2, // 0x20
    2, 5, 2, 2, 2, 4, 6, 2, 2, 4, 2, 2, 2, 4, 7, 2, // 0x30
    6, 6, 2, 2, 2, 3, 5, 2, 3, 2, 2, 2, 3, 4, 6, 2, // 0x40
    2, 5, 2, 2, 2, 4, 6, 2, 2, 4, 2, 2, 2, 4, 7, 2, // 0x50
    6, 6, 2, 2, 2, 3, 5, 2, 4, 2, 2, 2, 5, 4, 6, 2, // 0x60
    2, 5, 2, 2, 2, 4, 6, 2, 2, 4, 2, 2, 2, 4, 7, 2, // 0x70
    2, 6, 2, 2, 3, 3, 3, 2, 2, 2, 2, 2, 4, 4, 4, 2, // 0x80
    2, 6, 2, 2, 4, 4, 4, 2, 2, 5, 2, 2, 2, 5, 2, 2, // 0x90
    2, 6, 2, 2, 3, 3, 3, 2, 2, 2, 2, 2, 4, 4, 4, 2, // 0xA0
    2, 5, 2, 2, 4, 4, 4, 2, 2, 4, 2, 2, 4, 4, 4, 2, // 0xB0
    2, 6, 2, 2, 3, 3, 5, 2, 2, 2, 2, 2, 4, 4, 6, 2, // 0xC0
    2, 5, 2, 2, 2, 4, 6, 2, 2, 4, 2, 2, 2, 4, 7, 2, // 0xD0
    2, 6, 2, 2, 3, 3, 5, 2, 2, 2, 2, 2, 4, 4, 6, 2, // 0xE0
    2, 5, 2, 2, 2, 4, 6, 2, 2, 4, 2, 2, 2, 4, 7, 2, // 0xF0
];

/// Returns true if the opcode pays a one-cycle penalty when its indexed
/// effective address crosses a page boundary. Only reads pay it; stores
/// and read-modify-writes always take the fixed (longer) cost.
#[must_use]
pub const fn page_cross_penalty(opcode: u8) -> bool {
    let mode_penalty = matches!(
        OPMODES[opcode as usize],
        AddrMode::Abx | AddrMode::Aby | AddrMode::Idy
    );
    let read_op = matches!(
        OPTYPES[opcode as usize],
        T::Ora
            | T::And
            | T::Eor
            | T::Adc
            | T::Sbc
            | T::Cmp
            | T::Lda
            | T::Ldx
            | T::Ldy
    );
    mode_penalty && read_op
}

/// Returns true if the opcode unconditionally transfers control and
/// therefore ends a straight-line run of instructions.
#[must_use]
pub const fn ends_block(opcode: u8) -> bool {
    matches!(
        OPTYPES[opcode as usize],
        T::Jmp | T::Jsr | T::Rts | T::Rti | T::Brk | T::Kil
    )
}

/// Returns true if the opcode is a conditional branch.
#[must_use]
pub const fn is_branch(opcode: u8) -> bool {
    matches!(
        OPTYPES[opcode as usize],
        T::Bpl | T::Bmi | T::Bvc | T::Bvs | T::Bcc | T::Bcs | T::Bne | T::Beq
    )
}

/// Instruction length in bytes for an opcode.
#[must_use]
pub const fn length(opcode: u8) -> u8 {
    OPMODES[opcode as usize].length()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documented_lengths() {
        assert_eq!(length(0xEA), 1); // NOP
        assert_eq!(length(0xA9), 2); // LDA #
        assert_eq!(length(0xAD), 3); // LDA abs
        assert_eq!(length(0x6C), 3); // JMP (ind)
        assert_eq!(length(0x10), 2); // BPL rel
    }

    #[test]
    fn penalty_applies_to_reads_only() {
        assert!(page_cross_penalty(0xBD)); // LDA abs,X
        assert!(page_cross_penalty(0xB1)); // LDA (zp),Y
        assert!(!page_cross_penalty(0x9D)); // STA abs,X
        assert!(!page_cross_penalty(0xDE)); // DEC abs,X
        assert!(!page_cross_penalty(0xA5)); // LDA zp
    }

    #[test]
    fn block_enders() {
        assert!(ends_block(0x4C)); // JMP
        assert!(ends_block(0x60)); // RTS
        assert!(ends_block(0x00)); // BRK
        assert!(ends_block(0x02)); // KIL
        assert!(!ends_block(0xD0)); // BNE falls through
        assert!(!ends_block(0xEA));
    }
}
