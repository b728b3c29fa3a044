//! Memory and I/O bus interface.

use crate::ADDR_SPACE_SIZE;

/// Memory and I/O bus interface.
///
/// CPU drivers read and write ordinary RAM/ROM through the flat byte array
/// returned by [`Bus::mem`]; only addresses for which [`Bus::is_special`]
/// returns true (memory-mapped hardware registers) are routed through the
/// callback methods. This split is what lets a recompiling driver bake
/// direct loads and stores into generated code while still giving hardware
/// registers interpreter-exact access ordering.
pub trait Bus {
    /// Read-only view of the flat 64 KiB address space.
    fn mem(&self) -> &[u8; ADDR_SPACE_SIZE];

    /// Mutable view of the flat 64 KiB address space.
    fn mem_mut(&mut self) -> &mut [u8; ADDR_SPACE_SIZE];

    /// Returns true if the address is a memory-mapped hardware register.
    ///
    /// Accesses to special addresses must go through [`Bus::special_read`]
    /// and [`Bus::special_write`] so the hardware sees them in cycle order.
    fn is_special(&self, address: u16) -> bool;

    /// Read a memory-mapped hardware register.
    fn special_read(&mut self, address: u16) -> u8;

    /// Write a memory-mapped hardware register.
    fn special_write(&mut self, address: u16, value: u8);

    /// Returns true if the address is in ROM. Writes to ROM are dropped,
    /// matching hardware.
    fn is_rom(&self, address: u16) -> bool {
        let _ = address;
        false
    }

    /// Read a byte, routing special addresses to the hardware callbacks.
    fn read(&mut self, address: u16) -> u8 {
        if self.is_special(address) {
            self.special_read(address)
        } else {
            self.mem()[address as usize]
        }
    }

    /// Write a byte, routing special addresses to the hardware callbacks
    /// and dropping ROM writes.
    fn write(&mut self, address: u16, value: u8) {
        if self.is_special(address) {
            self.special_write(address, value);
        } else if !self.is_rom(address) {
            self.mem_mut()[address as usize] = value;
        }
    }
}

/// A bus backed by 64 KiB of flat RAM with no hardware registers.
///
/// Used by tests and by machines during early bring-up.
pub struct FlatBus {
    ram: Box<[u8; ADDR_SPACE_SIZE]>,
}

impl FlatBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ram: vec![0u8; ADDR_SPACE_SIZE]
                .into_boxed_slice()
                .try_into()
                .unwrap_or_else(|_| unreachable!()),
        }
    }

    /// Copy a program image into RAM starting at `address`.
    pub fn load(&mut self, address: u16, bytes: &[u8]) {
        for (i, &b) in bytes.iter().enumerate() {
            self.ram[(address as usize + i) & 0xFFFF] = b;
        }
    }

    /// Read a byte without any side effects.
    #[must_use]
    pub fn peek(&self, address: u16) -> u8 {
        self.ram[address as usize]
    }
}

impl Default for FlatBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus for FlatBus {
    fn mem(&self) -> &[u8; ADDR_SPACE_SIZE] {
        &self.ram
    }

    fn mem_mut(&mut self) -> &mut [u8; ADDR_SPACE_SIZE] {
        &mut self.ram
    }

    fn is_special(&self, _address: u16) -> bool {
        false
    }

    fn special_read(&mut self, _address: u16) -> u8 {
        0xFF
    }

    fn special_write(&mut self, _address: u16, _value: u8) {}
}
