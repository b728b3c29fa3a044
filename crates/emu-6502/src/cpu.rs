//! 6502 CPU interpreter.
//!
//! Instruction-stepped: each `step()` executes one whole instruction and
//! returns its cycle cost. Interrupts are sampled at instruction
//! boundaries, which is where the recompiling drivers sample them too.

use emu_core::Bus;

use crate::flags::{B, C, D, I, N, V, Z};
use crate::opcodes::{self, AddrMode, OpType};
use crate::{IRQ_VECTOR, NMI_VECTOR, RESET_VECTOR, Registers, Status};

/// Outcome of executing one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Instruction retired; cost in cycles, penalties included.
    Ran(u8),
    /// Hit the exit opcode ($02). PC is left pointing at it and no cycles
    /// are charged; the harness regains control.
    Exited,
    /// Hit a KIL opcode; the CPU is jammed until reset.
    Halted,
}

/// The opcode conventionally used by test harnesses to leave emulation.
/// It is the first of the KIL group and can never occur in a program that
/// runs on real hardware.
pub const EXIT_OPCODE: u8 = 0x02;

/// The MOS 6502, stepped one instruction at a time.
#[derive(Debug)]
pub struct Mos6502 {
    /// CPU registers.
    pub regs: Registers,

    /// IRQ line level; sampled before each instruction.
    irq_line: bool,

    /// NMI edge latch.
    nmi_pending: bool,

    /// Set when a KIL opcode jammed the CPU.
    jammed: bool,
}

impl Default for Mos6502 {
    fn default() -> Self {
        Self::new()
    }
}

impl Mos6502 {
    /// Create a new 6502 in reset state. PC is not loaded from the reset
    /// vector until [`Mos6502::reset`] runs against a bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            regs: Registers::new(),
            irq_line: false,
            nmi_pending: false,
            jammed: false,
        }
    }

    /// Reset: reload PC from the reset vector, set I, un-jam.
    pub fn reset<BUS: Bus>(&mut self, bus: &mut BUS) {
        let lo = bus.read(RESET_VECTOR);
        let hi = bus.read(RESET_VECTOR.wrapping_add(1));
        self.regs = Registers::new();
        self.regs.pc = u16::from_le_bytes([lo, hi]);
        self.jammed = false;
        self.nmi_pending = false;
    }

    /// Drive the IRQ line level.
    pub fn set_irq(&mut self, level: bool) {
        self.irq_line = level;
    }

    /// Latch an NMI edge.
    pub fn nmi(&mut self) {
        self.nmi_pending = true;
    }

    /// Returns true if a KIL opcode jammed the CPU.
    #[must_use]
    pub fn is_jammed(&self) -> bool {
        self.jammed
    }

    /// Execute exactly one instruction (or deliver one interrupt).
    pub fn step<BUS: Bus>(&mut self, bus: &mut BUS) -> Step {
        if self.jammed {
            return Step::Halted;
        }
        if self.nmi_pending {
            self.nmi_pending = false;
            self.interrupt(bus, NMI_VECTOR);
            return Step::Ran(7);
        }
        if self.irq_line && !self.regs.p.is_set(I) {
            self.interrupt(bus, IRQ_VECTOR);
            return Step::Ran(7);
        }

        let pc = self.regs.pc;
        let opcode = bus.read(pc);
        let optype = opcodes::OPTYPES[opcode as usize];
        let mode = opcodes::OPMODES[opcode as usize];
        let mut cycles = opcodes::CYCLES[opcode as usize];

        if optype == OpType::Kil {
            if opcode == EXIT_OPCODE {
                return Step::Exited;
            }
            self.jammed = true;
            return Step::Halted;
        }

        // Control-flow opcodes manage PC themselves.
        match optype {
            OpType::Brk => {
                let ret = pc.wrapping_add(2);
                self.push8(bus, (ret >> 8) as u8);
                self.push8(bus, ret as u8);
                self.push8(bus, self.regs.p.to_byte_brk());
                self.regs.p.set(I);
                self.regs.pc = self.read16(bus, IRQ_VECTOR);
                return Step::Ran(cycles);
            }
            OpType::Jsr => {
                let target = self.read16(bus, pc.wrapping_add(1));
                let ret = pc.wrapping_add(2);
                self.push8(bus, (ret >> 8) as u8);
                self.push8(bus, ret as u8);
                self.regs.pc = target;
                return Step::Ran(cycles);
            }
            OpType::Rts => {
                let lo = self.pull8(bus);
                let hi = self.pull8(bus);
                self.regs.pc = u16::from_le_bytes([lo, hi]).wrapping_add(1);
                return Step::Ran(cycles);
            }
            OpType::Rti => {
                let p = self.pull8(bus);
                self.regs.p = Status::from_byte(p & !B);
                let lo = self.pull8(bus);
                let hi = self.pull8(bus);
                self.regs.pc = u16::from_le_bytes([lo, hi]);
                return Step::Ran(cycles);
            }
            OpType::Jmp => {
                let target = self.read16(bus, pc.wrapping_add(1));
                self.regs.pc = if mode == AddrMode::Ind {
                    // 6502 bug: the high byte read wraps within the page.
                    let lo = bus.read(target);
                    let hi_addr =
                        (target & 0xFF00) | u16::from((target as u8).wrapping_add(1));
                    let hi = bus.read(hi_addr);
                    u16::from_le_bytes([lo, hi])
                } else {
                    target
                };
                return Step::Ran(cycles);
            }
            OpType::Bpl | OpType::Bmi | OpType::Bvc | OpType::Bvs | OpType::Bcc
            | OpType::Bcs | OpType::Bne | OpType::Beq => {
                let taken = self.branch_taken(optype);
                let offset = bus.read(pc.wrapping_add(1)) as i8;
                let next = pc.wrapping_add(2);
                self.regs.pc = next;
                if taken {
                    let target = next.wrapping_add(offset as u16);
                    cycles += 1;
                    if target & 0xFF00 != next & 0xFF00 {
                        cycles += 1;
                    }
                    self.regs.pc = target;
                }
                return Step::Ran(cycles);
            }
            _ => {}
        }

        // Everything else: resolve the operand, execute, advance PC.
        let (addr, crossed) = self.effective_addr(bus, pc, mode);
        if crossed && opcodes::page_cross_penalty(opcode) {
            cycles += 1;
        }
        self.regs.pc = pc.wrapping_add(u16::from(mode.length()));

        match optype {
            OpType::Ora => {
                let v = self.load(bus, mode, addr);
                self.regs.a |= v;
                self.regs.p.update_nz(self.regs.a);
            }
            OpType::And => {
                let v = self.load(bus, mode, addr);
                self.regs.a &= v;
                self.regs.p.update_nz(self.regs.a);
            }
            OpType::Eor => {
                let v = self.load(bus, mode, addr);
                self.regs.a ^= v;
                self.regs.p.update_nz(self.regs.a);
            }
            OpType::Adc => {
                let v = self.load(bus, mode, addr);
                self.do_adc(v);
            }
            OpType::Sbc => {
                let v = self.load(bus, mode, addr);
                self.do_sbc(v);
            }
            OpType::Cmp => {
                let v = self.load(bus, mode, addr);
                self.compare(self.regs.a, v);
            }
            OpType::Cpx => {
                let v = self.load(bus, mode, addr);
                self.compare(self.regs.x, v);
            }
            OpType::Cpy => {
                let v = self.load(bus, mode, addr);
                self.compare(self.regs.y, v);
            }
            OpType::Bit => {
                let v = self.load(bus, mode, addr);
                self.regs.p.set_if(N, v & 0x80 != 0);
                self.regs.p.set_if(V, v & 0x40 != 0);
                self.regs.p.set_if(Z, v & self.regs.a == 0);
            }
            OpType::Lda => {
                self.regs.a = self.load(bus, mode, addr);
                self.regs.p.update_nz(self.regs.a);
            }
            OpType::Ldx => {
                self.regs.x = self.load(bus, mode, addr);
                self.regs.p.update_nz(self.regs.x);
            }
            OpType::Ldy => {
                self.regs.y = self.load(bus, mode, addr);
                self.regs.p.update_nz(self.regs.y);
            }
            OpType::Sta => bus.write(addr, self.regs.a),
            OpType::Stx => bus.write(addr, self.regs.x),
            OpType::Sty => bus.write(addr, self.regs.y),
            OpType::Asl => self.rmw(bus, mode, addr, |p, v| {
                p.set_if(C, v & 0x80 != 0);
                v << 1
            }),
            OpType::Lsr => self.rmw(bus, mode, addr, |p, v| {
                p.set_if(C, v & 0x01 != 0);
                v >> 1
            }),
            OpType::Rol => self.rmw(bus, mode, addr, |p, v| {
                let carry_in = p.is_set(C) as u8;
                p.set_if(C, v & 0x80 != 0);
                (v << 1) | carry_in
            }),
            OpType::Ror => self.rmw(bus, mode, addr, |p, v| {
                let carry_in = (p.is_set(C) as u8) << 7;
                p.set_if(C, v & 0x01 != 0);
                (v >> 1) | carry_in
            }),
            OpType::Inc => self.rmw(bus, mode, addr, |_, v| v.wrapping_add(1)),
            OpType::Dec => self.rmw(bus, mode, addr, |_, v| v.wrapping_sub(1)),
            OpType::Inx => {
                self.regs.x = self.regs.x.wrapping_add(1);
                self.regs.p.update_nz(self.regs.x);
            }
            OpType::Dex => {
                self.regs.x = self.regs.x.wrapping_sub(1);
                self.regs.p.update_nz(self.regs.x);
            }
            OpType::Iny => {
                self.regs.y = self.regs.y.wrapping_add(1);
                self.regs.p.update_nz(self.regs.y);
            }
            OpType::Dey => {
                self.regs.y = self.regs.y.wrapping_sub(1);
                self.regs.p.update_nz(self.regs.y);
            }
            OpType::Tax => {
                self.regs.x = self.regs.a;
                self.regs.p.update_nz(self.regs.x);
            }
            OpType::Tay => {
                self.regs.y = self.regs.a;
                self.regs.p.update_nz(self.regs.y);
            }
            OpType::Txa => {
                self.regs.a = self.regs.x;
                self.regs.p.update_nz(self.regs.a);
            }
            OpType::Tya => {
                self.regs.a = self.regs.y;
                self.regs.p.update_nz(self.regs.a);
            }
            OpType::Tsx => {
                self.regs.x = self.regs.s;
                self.regs.p.update_nz(self.regs.x);
            }
            OpType::Txs => self.regs.s = self.regs.x,
            OpType::Pha => self.push8(bus, self.regs.a),
            OpType::Pla => {
                self.regs.a = self.pull8(bus);
                self.regs.p.update_nz(self.regs.a);
            }
            OpType::Php => self.push8(bus, self.regs.p.to_byte_brk()),
            OpType::Plp => {
                let p = self.pull8(bus);
                self.regs.p = Status::from_byte(p & !B);
            }
            OpType::Clc => self.regs.p.clear(C),
            OpType::Sec => self.regs.p.set(C),
            OpType::Cli => self.regs.p.clear(I),
            OpType::Sei => self.regs.p.set(I),
            OpType::Cld => self.regs.p.clear(D),
            OpType::Sed => self.regs.p.set(D),
            OpType::Clv => self.regs.p.clear(V),
            OpType::Nop | OpType::Unk => {}
            // Handled above.
            OpType::Kil
            | OpType::Brk
            | OpType::Jsr
            | OpType::Rts
            | OpType::Rti
            | OpType::Jmp
            | OpType::Bpl
            | OpType::Bmi
            | OpType::Bvc
            | OpType::Bvs
            | OpType::Bcc
            | OpType::Bcs
            | OpType::Bne
            | OpType::Beq => unreachable!(),
        }

        Step::Ran(cycles)
    }

    /// Push PC and flags, set I, load the vector. Shared by IRQ and NMI.
    fn interrupt<BUS: Bus>(&mut self, bus: &mut BUS, vector: u16) {
        let pc = self.regs.pc;
        self.push8(bus, (pc >> 8) as u8);
        self.push8(bus, pc as u8);
        self.push8(bus, self.regs.p.to_byte());
        self.regs.p.set(I);
        self.regs.pc = self.read16(bus, vector);
    }

    fn branch_taken(&self, optype: OpType) -> bool {
        let p = self.regs.p;
        match optype {
            OpType::Bpl => !p.is_set(N),
            OpType::Bmi => p.is_set(N),
            OpType::Bvc => !p.is_set(V),
            OpType::Bvs => p.is_set(V),
            OpType::Bcc => !p.is_set(C),
            OpType::Bcs => p.is_set(C),
            OpType::Bne => !p.is_set(Z),
            OpType::Beq => p.is_set(Z),
            _ => unreachable!(),
        }
    }

    /// Resolve the effective address for a mode. Returns the address (or
    /// the operand address itself for `Imm`) and whether indexing crossed
    /// a page boundary.
    fn effective_addr<BUS: Bus>(
        &mut self,
        bus: &mut BUS,
        pc: u16,
        mode: AddrMode,
    ) -> (u16, bool) {
        let op_addr = pc.wrapping_add(1);
        match mode {
            AddrMode::Imp | AddrMode::Acc | AddrMode::Rel | AddrMode::Ind => (0, false),
            AddrMode::Imm => (op_addr, false),
            AddrMode::Zpg => (u16::from(bus.read(op_addr)), false),
            AddrMode::Zpx => {
                (u16::from(bus.read(op_addr).wrapping_add(self.regs.x)), false)
            }
            AddrMode::Zpy => {
                (u16::from(bus.read(op_addr).wrapping_add(self.regs.y)), false)
            }
            AddrMode::Abs => (self.read16(bus, op_addr), false),
            AddrMode::Abx => {
                let base = self.read16(bus, op_addr);
                let addr = base.wrapping_add(u16::from(self.regs.x));
                (addr, addr & 0xFF00 != base & 0xFF00)
            }
            AddrMode::Aby => {
                let base = self.read16(bus, op_addr);
                let addr = base.wrapping_add(u16::from(self.regs.y));
                (addr, addr & 0xFF00 != base & 0xFF00)
            }
            AddrMode::Idx => {
                let zp = bus.read(op_addr).wrapping_add(self.regs.x);
                (self.read16_zp(bus, zp), false)
            }
            AddrMode::Idy => {
                let zp = bus.read(op_addr);
                let base = self.read16_zp(bus, zp);
                let addr = base.wrapping_add(u16::from(self.regs.y));
                (addr, addr & 0xFF00 != base & 0xFF00)
            }
        }
    }

    /// Load the operand value: accumulator, immediate byte, or memory.
    fn load<BUS: Bus>(&mut self, bus: &mut BUS, mode: AddrMode, addr: u16) -> u8 {
        match mode {
            AddrMode::Acc => self.regs.a,
            _ => bus.read(addr),
        }
    }

    /// Read-modify-write, to the accumulator or to memory, with NZ update.
    fn rmw<BUS: Bus>(
        &mut self,
        bus: &mut BUS,
        mode: AddrMode,
        addr: u16,
        f: impl FnOnce(&mut Status, u8) -> u8,
    ) {
        if mode == AddrMode::Acc {
            let result = f(&mut self.regs.p, self.regs.a);
            self.regs.a = result;
            self.regs.p.update_nz(result);
        } else {
            let v = bus.read(addr);
            let result = f(&mut self.regs.p, v);
            bus.write(addr, result);
            self.regs.p.update_nz(result);
        }
    }

    fn do_adc(&mut self, val: u8) {
        if self.regs.p.is_set(D) {
            self.do_adc_decimal(val);
        } else {
            self.do_adc_binary(val);
        }
    }

    fn do_adc_binary(&mut self, val: u8) {
        let a = self.regs.a;
        let carry = self.regs.p.is_set(C) as u16;
        let sum = u16::from(a) + u16::from(val) + carry;
        let result = sum as u8;
        self.regs.p.set_if(C, sum > 0xFF);
        self.regs
            .p
            .set_if(V, (a ^ result) & (val ^ result) & 0x80 != 0);
        self.regs.a = result;
        self.regs.p.update_nz(result);
    }

    fn do_adc_decimal(&mut self, val: u8) {
        let a = self.regs.a;
        let carry = self.regs.p.is_set(C) as u16;

        let mut lo = u16::from(a & 0x0F) + u16::from(val & 0x0F) + carry;
        if lo > 9 {
            lo += 6;
        }
        let mut hi = u16::from(a >> 4) + u16::from(val >> 4) + u16::from(lo > 0x0F);

        // Z, N and V come from the binary result on an NMOS 6502.
        let bin = (u16::from(a) + u16::from(val) + carry) as u8;
        self.regs.p.set_if(Z, bin == 0);
        self.regs.p.set_if(N, hi & 0x08 != 0);
        self.regs.p.set_if(V, (a ^ bin) & (val ^ bin) & 0x80 != 0);

        if hi > 9 {
            hi += 6;
        }
        self.regs.p.set_if(C, hi > 0x0F);
        self.regs.a = ((hi << 4) as u8) | ((lo as u8) & 0x0F);
    }

    fn do_sbc(&mut self, val: u8) {
        if self.regs.p.is_set(D) {
            self.do_sbc_decimal(val);
        } else {
            // SBC is ADC with the operand inverted.
            self.do_adc_binary(!val);
        }
    }

    fn do_sbc_decimal(&mut self, val: u8) {
        let a = self.regs.a;
        let borrow = i16::from(!self.regs.p.is_set(C));

        // Flags come from the binary result on an NMOS 6502.
        let bin = i16::from(a) - i16::from(val) - borrow;
        self.regs.p.set_if(C, bin >= 0);
        self.regs.p.set_if(Z, (bin as u8) == 0);
        self.regs.p.set_if(N, bin & 0x80 != 0);
        self.regs.p.set_if(
            V,
            (i16::from(a) ^ bin) & (i16::from(a) ^ i16::from(val)) & 0x80 != 0,
        );

        let mut lo = i16::from(a & 0x0F) - i16::from(val & 0x0F) - borrow;
        let mut hi = i16::from(a >> 4) - i16::from(val >> 4);
        if lo < 0 {
            lo -= 6;
            hi -= 1;
        }
        if hi < 0 {
            hi -= 6;
        }
        self.regs.a = (((hi as u8) & 0x0F) << 4) | ((lo as u8) & 0x0F);
    }

    fn compare(&mut self, reg: u8, val: u8) {
        self.regs.p.set_if(C, reg >= val);
        self.regs.p.update_nz(reg.wrapping_sub(val));
    }

    fn push8<BUS: Bus>(&mut self, bus: &mut BUS, value: u8) {
        let addr = self.regs.push();
        bus.write(addr, value);
    }

    fn pull8<BUS: Bus>(&mut self, bus: &mut BUS) -> u8 {
        let addr = self.regs.pop();
        bus.read(addr)
    }

    fn read16<BUS: Bus>(&mut self, bus: &mut BUS, addr: u16) -> u16 {
        let lo = bus.read(addr);
        let hi = bus.read(addr.wrapping_add(1));
        u16::from_le_bytes([lo, hi])
    }

    /// 16-bit pointer read from zero page, wrapping within the page.
    fn read16_zp<BUS: Bus>(&mut self, bus: &mut BUS, zp: u8) -> u16 {
        let lo = bus.read(u16::from(zp));
        let hi = bus.read(u16::from(zp.wrapping_add(1)));
        u16::from_le_bytes([lo, hi])
    }
}
