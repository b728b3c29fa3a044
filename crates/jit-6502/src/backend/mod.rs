//! Code-generation backends.
//!
//! One implementation per host architecture behind a uniform trait. The
//! portable backend encodes uops as fixed-width records executed by the
//! dispatcher's record interpreter and runs everywhere; the x86-64 and
//! ARM64 backends emit machine code into the same slot layout but are
//! emit-only until a native entry trampoline lands, and report themselves
//! as such through [`Backend::is_execution_enabled`].

pub mod arm64;
pub mod portable;
pub mod x64;

pub use arm64::Arm64Backend;
pub use portable::{PortableBackend, RECORD_SIZE, Record, tag};
pub use x64::X64Backend;

use crate::JitError;
use crate::uop::Uop;

/// Slot space exhausted mid-emit. The compiler responds by replacing the
/// instruction with the long-form interpreter indirection; this error is
/// never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityError;

/// Where a branch's taken edge lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    /// Taken edge stays in the block: jump straight to the target's slot.
    Slot(u32),
    /// Taken edge leaves the block: return to the dispatcher.
    Dispatch,
}

/// Mutable emit state for one instruction's slot.
pub struct EmitCtx<'a> {
    /// The slot being filled.
    pub buf: &'a mut [u8],
    /// Write position within the slot.
    pub pos: usize,
    /// 6502 address owning the slot.
    pub instr_addr: u16,
    /// Arena offset of the slot's first byte, for position-relative
    /// encodings.
    pub slot_offset: u32,
    /// Charge run-time cycle penalties.
    pub accurate_cycles: bool,
    /// Resolution for the next `Uop::Branch`'s taken edge.
    pub branch_kind: BranchKind,
    /// Where the last value-producing uop left its result, for flag
    /// materialisation strategies that reuse host flags.
    pub last_value: LastValue,
}

/// Tracking for [`EmitCtx::last_value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LastValue {
    #[default]
    None,
    /// Host condition flags are still valid for the last result.
    HostFlags,
    /// Result is in the accumulator, flags stale.
    InA,
    /// Result is in memory at a compile-time constant address.
    InMem(u16),
    /// Result is in memory at the scratch effective address.
    InScratchMem,
    /// Result is in memory at the run-time-fetched address register.
    InFetchedMem,
}

impl<'a> EmitCtx<'a> {
    pub fn new(buf: &'a mut [u8], instr_addr: u16, accurate_cycles: bool) -> Self {
        Self {
            buf,
            pos: 0,
            instr_addr,
            slot_offset: crate::arena::slot_offset(instr_addr),
            accurate_cycles,
            branch_kind: BranchKind::Dispatch,
            last_value: LastValue::None,
        }
    }

    /// Arena offset of the current write position.
    #[must_use]
    pub fn arena_pos(&self) -> u32 {
        self.slot_offset + self.pos as u32
    }

    /// Append raw bytes, failing on slot overflow.
    pub fn put(&mut self, bytes: &[u8]) -> Result<(), CapacityError> {
        if self.pos + bytes.len() > self.buf.len() {
            return Err(CapacityError);
        }
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }
}

/// A host-architecture code generator.
///
/// Backends own the machine encoding of every uop, the invalidation trap
/// sequence, and the slot continuation/branch plumbing. They hold no
/// per-block state; everything flows through [`EmitCtx`].
pub trait Backend {
    fn name(&self) -> &'static str;

    /// Whether the driver can execute this backend's output. The
    /// dispatcher runs slots through the record interpreter, so only the
    /// record-emitting backend qualifies; the machine-code emitters
    /// return false and the driver refuses to be built on them.
    fn is_execution_enabled(&self) -> bool;

    /// Whether the backend emits this uop form. The compiler keeps the
    /// unmerged form when it does not.
    fn supports_uop(&self, uop: &Uop) -> bool;

    /// The self-modify trap installed over a slot's first bytes. At most
    /// 4 bytes so a single aligned store can plant it.
    fn invalidation_sequence(&self) -> &'static [u8];

    /// True if the code at `code` begins with the invalidation trap.
    fn is_invalidated_at(&self, code: &[u8]) -> bool {
        code.starts_with(self.invalidation_sequence())
    }

    /// Fill a slot with trap filler, as on arena initialisation.
    fn fill_with_trap(&self, buf: &mut [u8]);

    /// Emit one uop at the context position.
    fn emit(&self, ctx: &mut EmitCtx, uop: &Uop) -> Result<(), CapacityError>;

    /// Emit an unconditional transfer to another arena slot.
    fn emit_jump_to_slot(
        &self,
        ctx: &mut EmitCtx,
        target_offset: u32,
    ) -> Result<(), CapacityError>;

    /// Emit a return to the dispatcher with a new 6502 PC.
    fn emit_dispatch(&self, ctx: &mut EmitCtx, target_pc: u16)
    -> Result<(), CapacityError>;

    /// Rewrite the taken-edge of a previously emitted branch. `at` is the
    /// position of the backend's 4-byte target field within `buf`, and
    /// `field_arena_offset` is that field's own arena offset, for backends
    /// whose encoding is position-relative.
    fn patch_branch(
        &self,
        buf: &mut [u8],
        at: usize,
        taken_offset: u32,
        field_arena_offset: u32,
    );

    /// Runtime assertion that the backend's codegen assumptions hold on
    /// this build (register bindings, slot geometry).
    fn slot_preconditions_test(&self) -> Result<(), JitError>;
}
