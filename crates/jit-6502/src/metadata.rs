//! Per-address translation metadata.
//!
//! Two parallel arrays indexed by 6502 address: the jit-pointer table,
//! whose entries name the host code implementing the instruction that
//! starts (or covers) that address, and the block-id map, whose entries
//! name the block owning the byte. Both use distinguished values for
//! "no code" and "dynamic".

use crate::arena::{self, DYNAMIC_OFFSET, NO_CODE_OFFSET, NUM_SLOTS, SLOT_SIZE};

/// Block-id value for a byte not owned by any live block.
pub const NO_BLOCK: i32 = -1;

pub struct Metadata {
    /// Arena offset of the code for each 6502 address.
    jit_ptrs: Box<[u32; NUM_SLOTS]>,
    /// 6502 start address of the owning block, or [`NO_BLOCK`].
    code_blocks: Box<[i32; NUM_SLOTS]>,
}

impl Metadata {
    #[must_use]
    pub fn new() -> Self {
        Self {
            jit_ptrs: vec![NO_CODE_OFFSET; NUM_SLOTS]
                .into_boxed_slice()
                .try_into()
                .unwrap_or_else(|_| unreachable!()),
            code_blocks: vec![NO_BLOCK; NUM_SLOTS]
                .into_boxed_slice()
                .try_into()
                .unwrap_or_else(|_| unreachable!()),
        }
    }

    /// Reset every entry to no-code, as on emulator reset.
    pub fn clear(&mut self) {
        self.jit_ptrs.fill(NO_CODE_OFFSET);
        self.code_blocks.fill(NO_BLOCK);
    }

    #[must_use]
    pub fn jit_ptr(&self, addr: u16) -> u32 {
        self.jit_ptrs[addr as usize]
    }

    pub fn set_jit_ptr(&mut self, addr: u16, offset: u32) {
        self.jit_ptrs[addr as usize] = offset;
    }

    pub fn make_no_code(&mut self, addr: u16) {
        self.jit_ptrs[addr as usize] = NO_CODE_OFFSET;
    }

    pub fn make_dynamic(&mut self, addr: u16) {
        self.jit_ptrs[addr as usize] = DYNAMIC_OFFSET;
    }

    #[must_use]
    pub fn is_no_code(offset: u32) -> bool {
        offset == NO_CODE_OFFSET
    }

    #[must_use]
    pub fn is_dynamic(offset: u32) -> bool {
        offset == DYNAMIC_OFFSET
    }

    #[must_use]
    pub fn code_block(&self, addr: u16) -> i32 {
        self.code_blocks[addr as usize]
    }

    pub fn set_code_block(&mut self, addr: u16, block: i32) {
        self.code_blocks[addr as usize] = block;
    }

    /// True if the address is the start of a live block.
    #[must_use]
    pub fn is_block_start(&self, addr: u16) -> bool {
        self.code_blocks[addr as usize] == i32::from(addr)
    }

    /// Walk forward from `block_addr` clearing ownership, stopping at the
    /// first byte owned by a different block. Returns the first address
    /// past the cleared range.
    pub fn clear_block_from(&mut self, block: i32, from: u16) -> u32 {
        let mut addr = u32::from(from);
        while addr < NUM_SLOTS as u32 && self.code_blocks[addr as usize] == block {
            self.code_blocks[addr as usize] = NO_BLOCK;
            self.jit_ptrs[addr as usize] = NO_CODE_OFFSET;
            addr += 1;
        }
        addr
    }

    /// The 6502 address whose slot contains an arena offset.
    #[must_use]
    pub fn block_addr_from_host(offset: u32) -> u16 {
        arena::slot_addr(offset.min(NO_CODE_OFFSET - 1))
    }

    /// Map a host position inside the arena back to the 6502 address whose
    /// uop covers it.
    ///
    /// Slot-aligned positions resolve immediately by arithmetic. Otherwise
    /// walk the owning block's jit pointers and pick the last instruction
    /// whose code starts at or before the position, skipping dynamic
    /// entries.
    #[must_use]
    pub fn pc_from_host(&self, offset: u32) -> u16 {
        let slot = Self::block_addr_from_host(offset);
        if offset & (SLOT_SIZE as u32 - 1) == 0 {
            return slot;
        }

        let block = self.code_blocks[slot as usize];
        if block == NO_BLOCK {
            return slot;
        }

        let mut ret = slot;
        let mut current: Option<u32> = None;
        let mut addr = block as u32;
        while addr < NUM_SLOTS as u32 && self.code_blocks[addr as usize] == block {
            let ptr = self.jit_ptrs[addr as usize];
            if Self::is_dynamic(ptr) {
                addr += 1;
                continue;
            }
            if ptr > offset {
                break;
            }
            if current != Some(ptr) {
                current = Some(ptr);
                ret = addr as u16;
            }
            addr += 1;
        }
        ret
    }
}

impl Default for Metadata {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::slot_offset;

    #[test]
    fn fresh_metadata_is_empty() {
        let m = Metadata::new();
        assert!(Metadata::is_no_code(m.jit_ptr(0x1234)));
        assert_eq!(m.code_block(0x1234), NO_BLOCK);
        assert!(!m.is_block_start(0x1234));
    }

    #[test]
    fn pc_from_host_resolves_aligned_and_walked_positions() {
        let mut m = Metadata::new();
        // Block at $2000: 3-instruction layout; $2001 is an operand byte
        // of the instruction at $2000, $2002 starts its own instruction.
        for addr in 0x2000..0x2003u16 {
            m.set_code_block(addr, 0x2000);
        }
        m.set_jit_ptr(0x2000, slot_offset(0x2000));
        m.set_jit_ptr(0x2001, slot_offset(0x2000));
        m.set_jit_ptr(0x2002, slot_offset(0x2002));

        assert_eq!(m.pc_from_host(slot_offset(0x2000)), 0x2000);
        assert_eq!(m.pc_from_host(slot_offset(0x2000) + 24), 0x2000);
        assert_eq!(m.pc_from_host(slot_offset(0x2002)), 0x2002);
        assert_eq!(m.pc_from_host(slot_offset(0x2002) + 8), 0x2002);
    }

    #[test]
    fn clear_block_stops_at_foreign_bytes() {
        let mut m = Metadata::new();
        for addr in 0x3000..0x3004u16 {
            m.set_code_block(addr, 0x3000);
            m.set_jit_ptr(addr, slot_offset(addr));
        }
        m.set_code_block(0x3004, 0x3004);

        let end = m.clear_block_from(0x3000, 0x3002);
        assert_eq!(end, 0x3004);
        assert_eq!(m.code_block(0x3001), 0x3000, "bytes before the split stay");
        assert_eq!(m.code_block(0x3002), NO_BLOCK);
        assert!(Metadata::is_no_code(m.jit_ptr(0x3003)));
        assert_eq!(m.code_block(0x3004), 0x3004, "foreign block untouched");
    }
}
