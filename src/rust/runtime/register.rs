// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::sync::Arc;

//======================================================================================================================
// Constants
//======================================================================================================================

/// Start bit of the HLS control protocol.
pub const AP_START: u32 = 0x1;
/// Done bit of the HLS control protocol.
pub const AP_DONE: u32 = 0x2;
/// Idle bit of the HLS control protocol.
pub const AP_IDLE: u32 = 0x4;
/// Ready bit of the HLS control protocol.
pub const AP_READY: u32 = 0x8;
/// Continue bit of the HLS control protocol (acknowledges AP_DONE).
pub const AP_CONTINUE: u32 = 0x10;

/// Control/status register offsets of the embedded scheduler peripheral.
///
/// These offsets are shared with the device firmware and the host driver;
/// they are wire contract, not tunables.
pub mod csr {
    /// Base address of the control/status register block.
    pub const CSR_BASE: u32 = 0x18_0000;
    /// Base address of the command queue memory.
    pub const CQ_BASE: u32 = 0x19_0000;
    /// Size of the command queue memory in bytes.
    pub const CQ_SIZE: u32 = 0x1_0000;

    /// Completion status registers (4 words, one bit per slot).
    pub const STATUS_REGISTER: u32 = CSR_BASE;
    /// CU-DMA enable register.
    pub const CU_DMA_ENABLE: u32 = CSR_BASE + 0x18;
    /// CU-DMA configuration registers (4 words).
    pub const CU_DMA_REGISTER: u32 = CSR_BASE + 0x1C;
    /// Command queue slot size in bytes.
    pub const CQ_SLOT_SIZE: u32 = CSR_BASE + 0x2C;
    /// Shift value converting a CU index into a CU address offset.
    pub const CU_OFFSET: u32 = CSR_BASE + 0x30;
    /// Number of slots in the command queue.
    pub const CQ_NUMBER_OF_SLOTS: u32 = CSR_BASE + 0x34;
    /// Base address of the CU register space.
    pub const CU_BASE_ADDRESS: u32 = CSR_BASE + 0x38;
    /// Base address of the command queue.
    pub const CQ_BASE_ADDRESS: u32 = CSR_BASE + 0x3C;
    /// CU interrupt handler enable register.
    pub const CU_ISR_HANDLER_ENABLE: u32 = CSR_BASE + 0x40;
    /// CU completion status registers (4 words, one bit per CU).
    pub const CU_STATUS_REGISTER: u32 = CSR_BASE + 0x44;
    /// Host-to-device new-command interrupt enable register.
    pub const CQ_STATUS_ENABLE: u32 = CSR_BASE + 0x54;
    /// Host-to-device new-command doorbell registers (4 words, one bit per slot).
    pub const CQ_STATUS_REGISTER: u32 = CSR_BASE + 0x58;
    /// Number of compute units register.
    pub const NUMBER_OF_CU: u32 = CSR_BASE + 0x68;
    /// Device-to-host interrupt enable register.
    pub const HOST_INTERRUPT_ENABLE: u32 = CSR_BASE + 0x100;
}

//======================================================================================================================
// Traits
//======================================================================================================================

/// Narrow interface to the register space of an accelerator device.
///
/// This is the only channel through which schedulers touch hardware: 32-bit
/// reads and writes at fixed offsets. Implementations are expected to be
/// shared across threads, so access takes `&self`.
pub trait RegisterIo {
    /// Reads the 32-bit register at `addr`.
    fn read_register(&self, addr: u32) -> u32;

    /// Writes the 32-bit register at `addr`.
    fn write_register(&self, addr: u32, value: u32);

    /// Writes a block of consecutive 32-bit registers starting at `addr`.
    fn write_block(&self, addr: u32, words: &[u32]) {
        for (i, word) in words.iter().enumerate() {
            self.write_register(addr + (i as u32) * 4, *word);
        }
    }

    /// Reads `len` consecutive 32-bit registers starting at `addr`.
    fn read_block(&self, addr: u32, len: usize) -> Vec<u32> {
        (0..len).map(|i| self.read_register(addr + (i as u32) * 4)).collect()
    }
}

/// Shared handle to a device register space.
pub type DeviceHandle = Arc<dyn RegisterIo + Send + Sync>;

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Computes the register base address of compute unit `idx`.
pub fn cu_idx_to_addr(cu_base_addr: u32, idx: usize, cu_shift: u32) -> u32 {
    cu_base_addr + ((idx as u32) << cu_shift)
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use crate::runtime::register::cu_idx_to_addr;

    #[test]
    fn cu_address_formula() {
        // base + (idx << shift)
        assert_eq!(cu_idx_to_addr(0x40_0000, 0, 12), 0x40_0000);
        assert_eq!(cu_idx_to_addr(0x40_0000, 1, 12), 0x40_1000);
        assert_eq!(cu_idx_to_addr(0x40_0000, 127, 12), 0x40_0000 + (127 << 12));
    }
}
