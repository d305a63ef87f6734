// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    packet,
    packet::state::CmdState,
    runtime::{
        bitset::Bitmask,
        fail::Fail,
        memory::ExecBuf,
        register::{
            csr,
            DeviceHandle,
        },
    },
};
use ::libc::EAGAIN;

//======================================================================================================================
// Constants
//======================================================================================================================

/// Slot 0 is reserved for control commands; start commands go elsewhere.
pub const CTRL_SLOT: usize = 0;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Host view of the device-resident command queue.
///
/// Slots live in device memory at fixed offsets from the queue base; the host
/// claims a slot, writes the packet into it (header last), and optionally
/// rings the firmware doorbell. Completions come back through the read-to-
/// clear status registers.
pub struct CommandQueue {
    /// Register access to the device.
    dev: DeviceHandle,
    /// Number of slots.
    num_slots: usize,
    /// Slot size in bytes.
    slot_size: u32,
    /// Busy bit per slot.
    slot_status: Bitmask,
    /// Ring the new-command doorbell on submission.
    doorbell: bool,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

/// Associated Functions for Command Queues
impl CommandQueue {
    /// Creates a queue of `num_slots` slots of `slot_size` bytes each.
    pub fn new(dev: DeviceHandle, num_slots: usize, slot_size: u32, doorbell: bool) -> Self {
        Self {
            dev,
            num_slots,
            slot_size,
            slot_status: Bitmask::new(),
            doorbell,
        }
    }

    /// Returns the device address of slot `idx`.
    pub fn slot_addr(&self, idx: usize) -> u32 {
        csr::CQ_BASE + idx as u32 * self.slot_size
    }

    /// Returns the number of slots.
    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    /// Claims a free slot. Control commands take the reserved slot 0; start
    /// commands take the lowest free slot above it.
    pub fn acquire_slot(&mut self, ctrl: bool) -> Result<usize, Fail> {
        if ctrl {
            if self.slot_status.test(CTRL_SLOT) {
                return Err(Fail::new(EAGAIN, "control slot is busy"));
            }
            self.slot_status.set(CTRL_SLOT);
            return Ok(CTRL_SLOT);
        }

        for idx in (CTRL_SLOT + 1)..self.num_slots {
            if !self.slot_status.test(idx) {
                self.slot_status.set(idx);
                return Ok(idx);
            }
        }
        Err(Fail::new(EAGAIN, "all command slots are busy"))
    }

    /// Releases a slot back to the allocator.
    pub fn release_slot(&mut self, idx: usize) {
        assert!(self.slot_status.test(idx), "slot released twice");
        self.slot_status.clear(idx);
    }

    /// Copies a packet into slot `idx` and makes it visible to the firmware.
    ///
    /// The payload goes first; the header is written last so the firmware
    /// never observes a NEW header over a half-written payload.
    pub fn write_command(&self, idx: usize, buf: &ExecBuf) {
        let addr: u32 = self.slot_addr(idx);
        let header: u32 = buf.read_header();
        let count: usize = packet::count(header) as usize;

        let payload: Vec<u32> = buf.read_words(1, count);
        self.dev.write_block(addr + 4, &payload);
        self.dev.write_register(addr, header);

        if self.doorbell {
            let reg: u32 = csr::CQ_STATUS_REGISTER + 4 * (idx as u32 >> 5);
            self.dev.write_register(reg, 1 << (idx & 31));
        }
    }

    /// Reads the packet state of slot `idx` straight from device memory.
    pub fn slot_state(&self, idx: usize) -> Option<CmdState> {
        packet::state_of(self.dev.read_register(self.slot_addr(idx)))
    }

    /// Copies `count` payload words of slot `idx` back into `buf`. Used for
    /// commands that return data in place, such as CU_STAT.
    pub fn read_payload(&self, idx: usize, buf: &ExecBuf, count: usize) {
        let words: Vec<u32> = self.dev.read_block(self.slot_addr(idx) + 4, count);
        buf.write_words(1, &words);
    }

    /// Harvests completed slots from the read-to-clear status registers.
    pub fn harvest(&self) -> Bitmask {
        let mut completed: Bitmask = Bitmask::new();
        for word in 0..((self.num_slots + 31) / 32) {
            let bits: u32 = self.dev.read_register(csr::STATUS_REGISTER + 4 * word as u32);
            completed.set_word(word, bits);
        }
        completed
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
