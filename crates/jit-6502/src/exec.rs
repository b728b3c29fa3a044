//! Record interpreter: the execution engine behind the portable backend.
//!
//! Runs translated slots record by record, straight out of the arena.
//! Because every record fetch re-reads the arena bytes, a self-modify trap
//! planted by a store earlier in the same block is seen the moment control
//! reaches the trapped instruction, which is exactly the guarantee the
//! native backends get from planting the trap in the instruction stream.

use emu_6502::flags::{B, C, D, I, N, V, Z};
use emu_6502::{IRQ_VECTOR, Mos6502, Status, Step};
use emu_core::{Bus, Ticks, Timers};

use crate::arena::Arena;
use crate::backend::{Backend, RECORD_SIZE, Record, tag};
use crate::backend::portable::{BRANCH_FLAG_ACCURATE, BRANCH_FLAG_DISPATCH};
use crate::config::JitConfig;
use crate::engine;
use crate::metadata::Metadata;
use crate::stats::Stats;

/// Why the record interpreter stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// Hit a self-modify or no-code trap at this arena offset.
    Trap(u32),
    /// Control left the block; dispatch at this 6502 PC.
    Dispatch(u16),
    /// The exit opcode; PC parked on it.
    Exit(u16),
    /// A KIL opcode; the machine is jammed.
    Halt(u16),
}

/// Everything the engine touches while running or compiling, borrowed
/// from the driver for the duration of one `enter`.
pub struct Machine<'a, BUS: Bus, T: Timers> {
    pub arena: &'a mut Arena,
    pub metadata: &'a mut Metadata,
    pub stats: &'a mut Stats,
    pub backend: &'a dyn Backend,
    pub config: &'a JitConfig,
    pub cpu: &'a mut Mos6502,
    pub bus: &'a mut BUS,
    pub timers: &'a mut T,
    pub countdown: &'a mut i64,
    pub timer_armed: &'a mut bool,
    pub irq_line: &'a mut bool,
    pub last_sync: &'a mut i64,
    pub debug_cb: &'a mut Option<Box<dyn FnMut(&emu_6502::Registers)>>,
}

impl<BUS: Bus, T: Timers> Machine<'_, BUS, T> {
    /// Ordinary data read from translated code.
    fn read(&mut self, addr: u16) -> u8 {
        if self.bus.is_special(addr) {
            self.bus.special_read(addr)
        } else {
            self.bus.mem()[addr as usize]
        }
    }

    /// Ordinary data write from translated code: ROM writes drop, special
    /// writes cross to the hardware, RAM writes notify the invalidation
    /// engine.
    fn write(&mut self, addr: u16, value: u8) {
        if self.bus.is_special(addr) {
            self.bus.special_write(addr, value);
            return;
        }
        if self.bus.is_rom(addr) {
            return;
        }
        self.bus.mem_mut()[addr as usize] = value;
        engine::on_write(self.metadata, self.arena, self.stats, self.backend, addr);
    }

    /// Raw code-byte read (dynamic-operand fetches).
    fn code_byte(&self, addr: u16) -> u8 {
        self.bus.mem()[addr as usize]
    }

    fn code_word(&self, addr: u16) -> u16 {
        u16::from_le_bytes([self.code_byte(addr), self.code_byte(addr.wrapping_add(1))])
    }

    /// 16-bit pointer read from the zero page, wrapping within the page.
    fn read_zp_ptr(&mut self, zp: u8) -> u16 {
        let lo = self.read(u16::from(zp));
        let hi = self.read(u16::from(zp.wrapping_add(1)));
        u16::from_le_bytes([lo, hi])
    }

    fn push(&mut self, value: u8) {
        let addr = self.cpu.regs.push();
        self.write(addr, value);
    }

    fn pull(&mut self) -> u8 {
        let addr = self.cpu.regs.pop();
        self.read(addr)
    }

    /// Consume accumulated cycles at a countdown expiry: report to the
    /// timer sink, honour a reload, latch the expiry otherwise.
    fn timer_fire(&mut self) {
        let consumed = *self.last_sync - *self.countdown;
        let action = self
            .timers
            .tick_timers(Ticks::new(consumed.max(0) as u64));
        match action.reload {
            Some(reload) => {
                *self.countdown = reload;
                *self.last_sync = reload;
            }
            None => {
                *self.timer_armed = false;
                *self.last_sync = *self.countdown;
            }
        }
        if action.irq {
            *self.irq_line = true;
        }
    }

    /// True when an IRQ can be taken right now.
    fn irq_deliverable(&self) -> bool {
        *self.irq_line && !self.cpu.regs.p.is_set(I)
    }

    /// Push PC and flags, set I, return the IRQ vector target.
    pub fn deliver_irq(&mut self, pc: u16) -> u16 {
        self.push((pc >> 8) as u8);
        self.push(pc as u8);
        let p = self.cpu.regs.p.to_byte();
        self.push(p);
        self.cpu.regs.p.set(I);
        let lo = self.read(IRQ_VECTOR);
        let hi = self.read(IRQ_VECTOR.wrapping_add(1));
        u16::from_le_bytes([lo, hi])
    }

    /// Execute one instruction at `addr` through the interpreter and
    /// charge its true cost. Returns the continuation.
    fn interp_one(&mut self, addr: u16) -> RunExit {
        self.cpu.regs.pc = addr;
        let step = {
            let mut nbus = engine::NotifyBus {
                bus: &mut *self.bus,
                metadata: &mut *self.metadata,
                arena: &mut *self.arena,
                stats: &mut *self.stats,
                backend: self.backend,
            };
            self.cpu.step(&mut nbus)
        };
        match step {
            Step::Exited => RunExit::Exit(self.cpu.regs.pc),
            Step::Halted => RunExit::Halt(self.cpu.regs.pc),
            Step::Ran(cycles) => {
                *self.countdown -= i64::from(cycles);
                if *self.timer_armed && *self.countdown < 0 {
                    self.timer_fire();
                }
                if self.irq_deliverable() {
                    let target = self.deliver_irq(self.cpu.regs.pc);
                    return RunExit::Dispatch(target);
                }
                RunExit::Dispatch(self.cpu.regs.pc)
            }
        }
    }
}

/// Per-run scratch state mirroring the native backends' scratch
/// registers.
struct Scratch {
    /// Effective address from the last mode record.
    ea: u16,
    /// Page-crossing latch from the last indexed mode record.
    crossed: bool,
    /// Last 8-bit result, for flag materialisation.
    last: u8,
    /// Address and cost of the current instruction boundary.
    instr_addr: u16,
    instr_cost: u8,
    /// Page-crossing penalty cycles charged within this instruction,
    /// refunded with the base cost if the instruction detours to the
    /// interpreter.
    penalty_charged: u8,
}

/// Run translated records starting at an arena offset.
pub fn run<BUS: Bus, T: Timers>(m: &mut Machine<'_, BUS, T>, mut off: u32) -> RunExit {
    let mut s = Scratch {
        ea: 0,
        crossed: false,
        last: 0,
        instr_addr: m.cpu.regs.pc,
        instr_cost: 0,
        penalty_charged: 0,
    };

    loop {
        let rec = Record::read(m.arena.bytes(), off as usize);
        let mut next = off + RECORD_SIZE as u32;

        match rec.tag {
            tag::TRAP => return RunExit::Trap(off),

            tag::COUNTDOWN => {
                s.instr_addr = rec.b;
                s.instr_cost = rec.a;
                s.penalty_charged = 0;
                let cost = i64::from(rec.a);
                *m.countdown -= cost;
                if *m.timer_armed && *m.countdown < 0 {
                    // The boundary sits before this instruction: refund,
                    // service timers, maybe take an interrupt, re-charge.
                    *m.countdown += cost;
                    m.timer_fire();
                    if m.irq_deliverable() {
                        let target = m.deliver_irq(rec.b);
                        return RunExit::Dispatch(target);
                    }
                    *m.countdown -= cost;
                }
            }

            tag::DEBUG => {
                m.cpu.regs.pc = rec.b;
                if let Some(cb) = m.debug_cb.as_mut() {
                    cb(&m.cpu.regs);
                }
            }

            tag::MODE_ZPX => {
                s.ea = u16::from((rec.b as u8).wrapping_add(m.cpu.regs.x));
                s.crossed = false;
            }
            tag::MODE_ZPX_DYN => {
                let base = m.code_byte(rec.b);
                s.ea = u16::from(base.wrapping_add(m.cpu.regs.x));
                s.crossed = false;
            }
            tag::MODE_ZPY => {
                s.ea = u16::from((rec.b as u8).wrapping_add(m.cpu.regs.y));
                s.crossed = false;
            }
            tag::MODE_ZPY_DYN => {
                let base = m.code_byte(rec.b);
                s.ea = u16::from(base.wrapping_add(m.cpu.regs.y));
                s.crossed = false;
            }
            tag::MODE_ABX | tag::MODE_ABX_DYN => {
                let base = if rec.tag == tag::MODE_ABX {
                    rec.b
                } else {
                    m.code_word(rec.b)
                };
                s.ea = base.wrapping_add(u16::from(m.cpu.regs.x));
                s.crossed = s.ea & 0xFF00 != base & 0xFF00;
            }
            tag::MODE_ABY | tag::MODE_ABY_DYN => {
                let base = if rec.tag == tag::MODE_ABY {
                    rec.b
                } else {
                    m.code_word(rec.b)
                };
                s.ea = base.wrapping_add(u16::from(m.cpu.regs.y));
                s.crossed = s.ea & 0xFF00 != base & 0xFF00;
            }
            tag::MODE_IDX | tag::MODE_IDX_DYN => {
                let zp = if rec.tag == tag::MODE_IDX {
                    rec.b as u8
                } else {
                    m.code_byte(rec.b)
                };
                let ptr = zp.wrapping_add(m.cpu.regs.x);
                s.ea = m.read_zp_ptr(ptr);
                s.crossed = false;
            }
            tag::MODE_IDY | tag::MODE_IDY_DYN => {
                let zp = if rec.tag == tag::MODE_IDY {
                    rec.b as u8
                } else {
                    m.code_byte(rec.b)
                };
                let base = m.read_zp_ptr(zp);
                s.ea = base.wrapping_add(u16::from(m.cpu.regs.y));
                s.crossed = s.ea & 0xFF00 != base & 0xFF00;
            }
            tag::PAGE_PENALTY => {
                if s.crossed {
                    *m.countdown -= 1;
                    s.penalty_charged += 1;
                }
            }

            tag::LOAD_IMM | tag::LOAD_IMM_DYN => {
                let v = if rec.tag == tag::LOAD_IMM {
                    rec.b as u8
                } else {
                    m.code_byte(rec.b)
                };
                set_reg(m, rec.a, v);
                s.last = v;
            }
            tag::LOAD_MEM | tag::LOAD_MEM_DYN => {
                let addr = if rec.tag == tag::LOAD_MEM {
                    rec.b
                } else {
                    m.code_word(rec.b)
                };
                if m.bus.is_special(addr) {
                    return interp_bail(m, &s);
                }
                let v = m.read(addr);
                set_reg(m, rec.a, v);
                s.last = v;
            }
            tag::LOAD_SCRATCH => {
                if m.bus.is_special(s.ea) {
                    return interp_bail(m, &s);
                }
                let v = m.read(s.ea);
                set_reg(m, rec.a, v);
                s.last = v;
            }
            tag::STORE_MEM | tag::STORE_MEM_DYN => {
                let addr = if rec.tag == tag::STORE_MEM {
                    rec.b
                } else {
                    m.code_word(rec.b)
                };
                let v = get_reg(m, rec.a);
                m.write(addr, v);
            }
            tag::STORE_SCRATCH => {
                let v = get_reg(m, rec.a);
                let ea = s.ea;
                m.write(ea, v);
            }
            tag::STORE_IMM => {
                m.write(rec.b, rec.a);
            }
            tag::TRANSFER => {
                let v = get_treg(m, rec.a >> 4);
                set_treg(m, rec.a & 0x0F, v);
                s.last = v;
            }

            tag::ALU_IMM | tag::ALU_IMM_DYN => {
                let v = if rec.tag == tag::ALU_IMM {
                    rec.b as u8
                } else {
                    m.code_byte(rec.b)
                };
                match alu(m, rec.a, v, &mut s) {
                    AluOutcome::Done => {}
                    AluOutcome::Decimal => return interp_bail(m, &s),
                }
            }
            tag::ALU_MEM | tag::ALU_MEM_DYN => {
                let addr = if rec.tag == tag::ALU_MEM {
                    rec.b
                } else {
                    m.code_word(rec.b)
                };
                if m.bus.is_special(addr) {
                    return interp_bail(m, &s);
                }
                let v = m.read(addr);
                match alu(m, rec.a, v, &mut s) {
                    AluOutcome::Done => {}
                    AluOutcome::Decimal => return interp_bail(m, &s),
                }
            }
            tag::ALU_SCRATCH => {
                if m.bus.is_special(s.ea) {
                    return interp_bail(m, &s);
                }
                let v = m.read(s.ea);
                match alu(m, rec.a, v, &mut s) {
                    AluOutcome::Done => {}
                    AluOutcome::Decimal => return interp_bail(m, &s),
                }
            }

            tag::SHIFT_ACC => {
                let mut v = m.cpu.regs.a;
                for _ in 0..rec.b {
                    v = shift_step(&mut m.cpu.regs.p, rec.a, v);
                }
                m.cpu.regs.a = v;
                s.last = v;
            }
            tag::SHIFT_MEM | tag::SHIFT_MEM_DYN => {
                let addr = if rec.tag == tag::SHIFT_MEM {
                    rec.b
                } else {
                    m.code_word(rec.b)
                };
                if m.bus.is_special(addr) {
                    return interp_bail(m, &s);
                }
                let before = m.read(addr);
                let v = shift_step(&mut m.cpu.regs.p, rec.a, before);
                m.write(addr, v);
                s.last = v;
            }
            tag::SHIFT_SCRATCH => {
                if m.bus.is_special(s.ea) {
                    return interp_bail(m, &s);
                }
                let ea = s.ea;
                let before = m.read(ea);
                let v = shift_step(&mut m.cpu.regs.p, rec.a, before);
                m.write(ea, v);
                s.last = v;
            }
            tag::INC_MEM | tag::INC_MEM_DYN => {
                let addr = if rec.tag == tag::INC_MEM {
                    rec.b
                } else {
                    m.code_word(rec.b)
                };
                if m.bus.is_special(addr) {
                    return interp_bail(m, &s);
                }
                let v = m.read(addr).wrapping_add(rec.a);
                m.write(addr, v);
                s.last = v;
            }
            tag::INC_SCRATCH => {
                if m.bus.is_special(s.ea) {
                    return interp_bail(m, &s);
                }
                let ea = s.ea;
                let v = m.read(ea).wrapping_add(rec.a);
                m.write(ea, v);
                s.last = v;
            }
            tag::INC_REG => {
                let v = get_reg(m, rec.a).wrapping_add(rec.b as u8);
                set_reg(m, rec.a, v);
                s.last = v;
            }

            tag::BIT_MEM | tag::BIT_MEM_DYN => {
                let addr = if rec.tag == tag::BIT_MEM {
                    rec.b
                } else {
                    m.code_word(rec.b)
                };
                if m.bus.is_special(addr) {
                    return interp_bail(m, &s);
                }
                let v = m.read(addr);
                let p = &mut m.cpu.regs.p;
                p.set_if(N, v & 0x80 != 0);
                p.set_if(V, v & 0x40 != 0);
                p.set_if(Z, v & m.cpu.regs.a == 0);
            }

            tag::SET_C => m.cpu.regs.p.set_if(C, rec.a != 0),
            tag::SET_I => m.cpu.regs.p.set_if(I, rec.a != 0),
            tag::SET_D => m.cpu.regs.p.set_if(D, rec.a != 0),
            tag::CLEAR_V => m.cpu.regs.p.clear(V),

            tag::FLAGS_NZ => {
                let v = match rec.a >> 2 {
                    0 => m.cpu.regs.a,
                    1 => m.cpu.regs.x,
                    2 => m.cpu.regs.y,
                    _ => s.last,
                };
                let p = &mut m.cpu.regs.p;
                if rec.a & 0x02 != 0 {
                    p.set_if(N, v & 0x80 != 0);
                }
                if rec.a & 0x01 != 0 {
                    p.set_if(Z, v == 0);
                }
            }

            tag::PUSH_A => {
                let v = m.cpu.regs.a;
                m.push(v);
            }
            tag::PULL_A => {
                let v = m.pull();
                m.cpu.regs.a = v;
                s.last = v;
            }
            tag::PUSH_P => {
                let v = m.cpu.regs.p.to_byte_brk();
                m.push(v);
            }
            tag::PULL_P => {
                let v = m.pull();
                m.cpu.regs.p = Status::from_byte(v & !B);
            }

            tag::BRANCH => {
                let taken = branch_taken(&m.cpu.regs.p, rec.a & 0x0F);
                if taken {
                    if rec.a & BRANCH_FLAG_ACCURATE != 0 {
                        let from = s.instr_addr.wrapping_add(2);
                        let cost = if rec.b & 0xFF00 == from & 0xFF00 { 1 } else { 2 };
                        *m.countdown -= cost;
                    }
                    if rec.a & BRANCH_FLAG_DISPATCH != 0 {
                        return RunExit::Dispatch(rec.b);
                    }
                    next = rec.c;
                }
            }
            tag::JUMP_SLOT => next = rec.c,
            tag::DISPATCH => return RunExit::Dispatch(rec.b),
            tag::JUMP_IND => {
                let ptr = rec.b;
                let hi_addr = (ptr & 0xFF00) | u16::from((ptr as u8).wrapping_add(1));
                let lo = m.read(ptr);
                let hi = m.read(hi_addr);
                return RunExit::Dispatch(u16::from_le_bytes([lo, hi]));
            }
            tag::JSR => {
                let ret = rec.c as u16;
                m.push((ret >> 8) as u8);
                m.push(ret as u8);
                return RunExit::Dispatch(rec.b);
            }
            tag::RTS => {
                let lo = m.pull();
                let hi = m.pull();
                return RunExit::Dispatch(u16::from_le_bytes([lo, hi]).wrapping_add(1));
            }
            tag::RTI => {
                let p = m.pull();
                m.cpu.regs.p = Status::from_byte(p & !B);
                let lo = m.pull();
                let hi = m.pull();
                return RunExit::Dispatch(u16::from_le_bytes([lo, hi]));
            }
            tag::BRK => {
                let ret = rec.b;
                m.push((ret >> 8) as u8);
                m.push(ret as u8);
                let p = m.cpu.regs.p.to_byte_brk();
                m.push(p);
                m.cpu.regs.p.set(I);
                let lo = m.read(IRQ_VECTOR);
                let hi = m.read(IRQ_VECTOR.wrapping_add(1));
                return RunExit::Dispatch(u16::from_le_bytes([lo, hi]));
            }

            tag::INTERP => return m.interp_one(rec.b),
            tag::EXIT => {
                m.cpu.regs.pc = rec.b;
                return RunExit::Exit(rec.b);
            }
            tag::HALT => {
                m.cpu.regs.pc = rec.b;
                return RunExit::Halt(rec.b);
            }

            _ => {
                // Corrupt record: treat as a trap so the compiler rebuilds
                // the slot rather than running off the rails.
                return RunExit::Trap(off);
            }
        }

        off = next;
    }
}

/// Refund the boundary charge and hand the whole current instruction to
/// the interpreter (decimal arithmetic, hardware-register touches).
fn interp_bail<BUS: Bus, T: Timers>(m: &mut Machine<'_, BUS, T>, s: &Scratch) -> RunExit {
    *m.countdown += i64::from(s.instr_cost) + i64::from(s.penalty_charged);
    m.interp_one(s.instr_addr)
}

fn get_reg<BUS: Bus, T: Timers>(m: &Machine<'_, BUS, T>, code: u8) -> u8 {
    match code {
        0 => m.cpu.regs.a,
        1 => m.cpu.regs.x,
        _ => m.cpu.regs.y,
    }
}

fn set_reg<BUS: Bus, T: Timers>(m: &mut Machine<'_, BUS, T>, code: u8, v: u8) {
    match code {
        0 => m.cpu.regs.a = v,
        1 => m.cpu.regs.x = v,
        _ => m.cpu.regs.y = v,
    }
}

fn get_treg<BUS: Bus, T: Timers>(m: &Machine<'_, BUS, T>, code: u8) -> u8 {
    match code {
        0 => m.cpu.regs.a,
        1 => m.cpu.regs.x,
        2 => m.cpu.regs.y,
        _ => m.cpu.regs.s,
    }
}

fn set_treg<BUS: Bus, T: Timers>(m: &mut Machine<'_, BUS, T>, code: u8, v: u8) {
    match code {
        0 => m.cpu.regs.a = v,
        1 => m.cpu.regs.x = v,
        2 => m.cpu.regs.y = v,
        _ => m.cpu.regs.s = v,
    }
}

enum AluOutcome {
    Done,
    Decimal,
}

/// The accumulator ALU. Codes match `backend::portable::alu_code`.
fn alu<BUS: Bus, T: Timers>(
    m: &mut Machine<'_, BUS, T>,
    code: u8,
    v: u8,
    s: &mut Scratch,
) -> AluOutcome {
    let regs = &mut m.cpu.regs;
    match code {
        // ORA / AND / EOR
        0 => {
            regs.a |= v;
            s.last = regs.a;
        }
        1 => {
            regs.a &= v;
            s.last = regs.a;
        }
        2 => {
            regs.a ^= v;
            s.last = regs.a;
        }
        // ADC
        3 => {
            if regs.p.is_set(D) {
                return AluOutcome::Decimal;
            }
            s.last = add_binary(regs, v);
        }
        // SBC
        4 => {
            if regs.p.is_set(D) {
                return AluOutcome::Decimal;
            }
            s.last = add_binary(regs, !v);
        }
        // ADD: carry-folded CLC;ADC. The dropped CLC's effect happens
        // here, which also keeps the interpreter detour exact.
        5 => {
            regs.p.clear(C);
            if regs.p.is_set(D) {
                return AluOutcome::Decimal;
            }
            s.last = add_binary(regs, v);
        }
        // SUB: carry-folded SEC;SBC.
        6 => {
            regs.p.set(C);
            if regs.p.is_set(D) {
                return AluOutcome::Decimal;
            }
            s.last = add_binary(regs, !v);
        }
        // CMP / CPX / CPY
        7 | 8 | 9 => {
            let reg = match code {
                7 => regs.a,
                8 => regs.x,
                _ => regs.y,
            };
            regs.p.set_if(C, reg >= v);
            s.last = reg.wrapping_sub(v);
        }
        _ => {}
    }
    AluOutcome::Done
}

/// Binary add with carry-in; sets C and V, returns the result.
fn add_binary(regs: &mut emu_6502::Registers, v: u8) -> u8 {
    let a = regs.a;
    let carry = regs.p.is_set(C) as u16;
    let sum = u16::from(a) + u16::from(v) + carry;
    let result = sum as u8;
    regs.p.set_if(C, sum > 0xFF);
    regs.p.set_if(V, (a ^ result) & (v ^ result) & 0x80 != 0);
    regs.a = result;
    result
}

/// One shift/rotate step. Codes match `backend::portable::shift_code`.
fn shift_step(p: &mut Status, code: u8, v: u8) -> u8 {
    match code {
        // ASL
        0 => {
            p.set_if(C, v & 0x80 != 0);
            v << 1
        }
        // LSR
        1 => {
            p.set_if(C, v & 0x01 != 0);
            v >> 1
        }
        // ROL
        2 => {
            let carry_in = p.is_set(C) as u8;
            p.set_if(C, v & 0x80 != 0);
            (v << 1) | carry_in
        }
        // ROR
        _ => {
            let carry_in = (p.is_set(C) as u8) << 7;
            p.set_if(C, v & 0x01 != 0);
            (v >> 1) | carry_in
        }
    }
}

/// Condition evaluation. Codes match `backend::portable::cond_code`.
fn branch_taken(p: &Status, code: u8) -> bool {
    match code {
        0 => !p.is_set(N),
        1 => p.is_set(N),
        2 => !p.is_set(V),
        3 => p.is_set(V),
        4 => !p.is_set(C),
        5 => p.is_set(C),
        6 => !p.is_set(Z),
        _ => p.is_set(Z),
    }
}
