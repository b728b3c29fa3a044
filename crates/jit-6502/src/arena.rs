//! The code arena.
//!
//! A fixed region holding one equal-sized slot per 6502 address, plus two
//! distinguished stub slots past the end: the no-code stub and the dynamic
//! stub. Slot addresses are pure arithmetic on the 6502 address, which is
//! what makes "jump to arbitrary PC" a lookup-free operation. The arena is
//! allocated once and lives until teardown; resets refill it but never
//! move or free it.
//!
//! The arena is heap-backed and stays writable for the life of the
//! process: the driver executes slot content through the record
//! interpreter, so there is no executable mapping and no page-permission
//! toggling here. A native-dispatch build would replace this store with
//! an executable mapping behind the same accessors.

use crate::JitError;

/// log2 of the slot size. Smaller is generally faster (an icache effect)
/// but every instruction's code must fit its slot.
pub const SLOT_SHIFT: u32 = 7;

/// Bytes reserved per 6502 address.
pub const SLOT_SIZE: usize = 1 << SLOT_SHIFT;

/// Number of per-address slots.
pub const NUM_SLOTS: usize = 0x1_0000;

/// Arena offset of the shared no-code stub: the jit-pointer value meaning
/// "never compiled".
pub const NO_CODE_OFFSET: u32 = (NUM_SLOTS * SLOT_SIZE) as u32;

/// Arena offset of the shared dynamic stub: the jit-pointer value meaning
/// "this byte is re-fetched from emulated memory at run time".
pub const DYNAMIC_OFFSET: u32 = NO_CODE_OFFSET + SLOT_SIZE as u32;

/// Total arena size: the per-address slots and the two stub slots.
pub const ARENA_SIZE: usize = (NUM_SLOTS + 2) * SLOT_SIZE;

/// Arena offset of the slot for a 6502 address.
#[must_use]
pub const fn slot_offset(addr: u16) -> u32 {
    (addr as u32) << SLOT_SHIFT
}

/// The 6502 address whose slot contains this arena offset.
#[must_use]
pub const fn slot_addr(offset: u32) -> u16 {
    (offset >> SLOT_SHIFT) as u16
}

/// The backing store for translated code.
pub struct Arena {
    bytes: Vec<u8>,
}

impl Arena {
    pub fn new() -> Result<Self, JitError> {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(ARENA_SIZE)
            .map_err(|_| JitError::ArenaAlloc)?;
        bytes.resize(ARENA_SIZE, 0);
        Ok(Self { bytes })
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// The slot for a 6502 address.
    #[must_use]
    pub fn slot(&self, addr: u16) -> &[u8] {
        let off = slot_offset(addr) as usize;
        &self.bytes[off..off + SLOT_SIZE]
    }

    pub fn slot_mut(&mut self, addr: u16) -> &mut [u8] {
        let off = slot_offset(addr) as usize;
        &mut self.bytes[off..off + SLOT_SIZE]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_arithmetic_round_trips() {
        assert_eq!(slot_offset(0), 0);
        assert_eq!(slot_offset(1), SLOT_SIZE as u32);
        assert_eq!(slot_addr(slot_offset(0x1234)), 0x1234);
        assert_eq!(slot_addr(slot_offset(0xFFFF) + 5), 0xFFFF);
    }

    #[test]
    fn stub_offsets_sit_past_the_slots() {
        assert_eq!(NO_CODE_OFFSET as usize, NUM_SLOTS * SLOT_SIZE);
        assert!(DYNAMIC_OFFSET as usize + SLOT_SIZE <= ARENA_SIZE);
    }
}
