// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    packet,
    packet::configure::ConfigurePayload,
    runtime::{
        bitset::Bitmask,
        fail::Fail,
        memory::ExecBuf,
        register::{
            cu_idx_to_addr,
            DeviceHandle,
        },
    },
    sws::cu::ComputeUnit,
};
use ::libc::EBUSY;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Execution core of the software scheduler.
///
/// Owns the slot and CU allocators plus the per-CU models. All methods are
/// called under the scheduler lock; the core itself carries no locking.
pub struct ExecCore {
    /// Register access to the device.
    dev: DeviceHandle,
    /// Number of command slots.
    num_slots: usize,
    /// Busy bit per slot.
    slot_status: Bitmask,
    /// Per-CU models, indexed by CU index.
    cus: Vec<ComputeUnit>,
    /// Busy bit per CU.
    cu_status: Bitmask,
    /// Set once a CONFIGURE command has been processed.
    configured: bool,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

/// Associated Functions for Execution Cores
impl ExecCore {
    /// Creates an unconfigured core with `num_slots` command slots.
    pub fn new(dev: DeviceHandle, num_slots: usize) -> Self {
        Self {
            dev,
            num_slots,
            slot_status: Bitmask::new(),
            cus: Vec::new(),
            cu_status: Bitmask::new(),
            configured: false,
        }
    }

    /// Applies a CONFIGURE command, rebuilding the CU list.
    ///
    /// Reconfiguration is rejected while any CU is busy; in-flight commands
    /// would otherwise complete against stale CU models.
    pub fn configure(&mut self, buf: &ExecBuf) -> Result<(), Fail> {
        if !self.cu_status.none() {
            let cause: &str = "cannot reconfigure while compute units are busy";
            error!("configure(): {}", cause);
            return Err(Fail::new(EBUSY, cause));
        }

        let payload: ConfigurePayload = ConfigurePayload::from_buf(buf)?;
        self.cus.clear();
        for (idx, addr) in payload.cu_addrs.iter().enumerate() {
            self.cus.push(ComputeUnit::new(idx, *addr));
        }
        self.configured = true;
        info!(
            "configure(): {} cus, slot_size={}, cu_shift={}",
            self.cus.len(),
            payload.slot_size,
            payload.cu_shift
        );
        Ok(())
    }

    /// Installs CUs from an explicit address list, bypassing the CONFIGURE
    /// packet.
    pub fn configure_from_addrs(&mut self, cu_addrs: &[u32]) {
        self.cus.clear();
        for (idx, addr) in cu_addrs.iter().enumerate() {
            self.cus.push(ComputeUnit::new(idx, *addr));
        }
        self.configured = true;
    }

    /// Installs CUs directly from geometry, bypassing the CONFIGURE packet.
    /// Used when the host already knows the CU layout at open time.
    pub fn configure_from_geometry(&mut self, num_cus: usize, cu_base_addr: u32, cu_shift: u32) {
        self.cus.clear();
        for idx in 0..num_cus {
            self.cus.push(ComputeUnit::new(idx, cu_idx_to_addr(cu_base_addr, idx, cu_shift)));
        }
        self.configured = true;
    }

    /// Returns true once a configuration has been applied.
    pub fn configured(&self) -> bool {
        self.configured
    }

    /// Returns the number of configured CUs.
    pub fn num_cus(&self) -> usize {
        self.cus.len()
    }

    /// Returns the number of command slots.
    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    /// Returns true if no CU is busy.
    pub fn idle(&self) -> bool {
        self.cu_status.none()
    }

    /// Claims a free slot, lowest index first.
    pub fn acquire_slot(&mut self) -> Option<usize> {
        let idx: usize = self.slot_status.first_clear_below(self.num_slots)?;
        self.slot_status.set(idx);
        Some(idx)
    }

    /// Releases a slot back to the allocator.
    pub fn release_slot(&mut self, idx: usize) {
        assert!(self.slot_status.test(idx), "slot released twice");
        self.slot_status.clear(idx);
    }

    /// Claims the first ready CU named by `mask`, returning its index.
    pub fn acquire_cu(&mut self, mask: &Bitmask) -> Option<usize> {
        for idx in mask.iter() {
            if idx >= self.cus.len() {
                break;
            }
            if !self.cu_status.test(idx) && self.cus[idx].ready() {
                self.cu_status.set(idx);
                return Some(idx);
            }
        }
        None
    }

    /// Releases a CU back to the allocator.
    pub fn release_cu(&mut self, idx: usize) {
        assert!(self.cu_status.test(idx), "cu released twice");
        self.cu_status.clear(idx);
    }

    /// Writes the regmap of `buf` to CU `idx` and starts it.
    pub fn start_cu(&mut self, idx: usize, buf: &ExecBuf) {
        self.cus[idx].start(self.dev.as_ref(), buf);
    }

    /// Polls CU `idx` for completion, acknowledging it if done.
    pub fn poll_cu(&mut self, idx: usize) -> bool {
        self.cus[idx].poll(self.dev.as_ref())
    }

    /// Abandons the in-flight run on CU `idx` and releases it.
    pub fn abort_cu(&mut self, idx: usize) {
        self.cus[idx].abort();
        self.release_cu(idx);
    }

    /// Broadcasts the regmap of an INIT_CU command to every CU in its mask
    /// without starting any of them.
    pub fn init_cus(&mut self, buf: &ExecBuf) {
        let mask: Bitmask = packet::cu_mask(buf);
        for idx in mask.iter() {
            if idx >= self.cus.len() {
                warn!("init_cus(): mask names cu {} beyond the configured {}", idx, self.cus.len());
                break;
            }
            self.cus[idx].write_regmap(self.dev.as_ref(), buf);
        }
    }

    /// Answers a CU_STAT command in place: one usage count per CU is written
    /// into the payload, in CU index order.
    pub fn cu_stat(&self, buf: &ExecBuf) {
        let room: usize = packet::count(buf.read_header()) as usize;
        for (idx, cu) in self.cus.iter().enumerate().take(room) {
            buf.write(1 + idx, cu.usage());
        }
    }

    /// Returns the lifetime start count of CU `idx`.
    pub fn cu_usage(&self, idx: usize) -> u32 {
        self.cus[idx].usage()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
