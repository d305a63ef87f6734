// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Test support: an in-memory device model.
//!
//! Implements [RegisterIo] over a register map plus a tiny CU behavior model:
//! AP_START arms a countdown, every control-register read ticks it, AP_DONE
//! shows up when it reaches zero, AP_CONTINUE returns the CU to idle. The
//! status and doorbell registers behave like the hardware ones: write-one-to-
//! set, read-to-clear. Devices built with [EmulatedDevice::with_cu_dma] also
//! model the CU-DMA engine: a slot bit rung on the engine register copies
//! that slot's regmap into its CU and starts the CU.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    packet,
    runtime::register::{
        csr,
        RegisterIo,
        AP_CONTINUE,
        AP_DONE,
        AP_IDLE,
        AP_START,
    },
};
use ::std::{
    collections::{
        HashMap,
        HashSet,
    },
    sync::{
        Arc,
        Mutex,
        MutexGuard,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Behavior model of one CU.
#[derive(Clone, Copy)]
enum CuModel {
    /// Nothing running.
    Idle,
    /// Started; `polls_left` control-register reads until done.
    Busy { polls_left: u32 },
    /// Finished, waiting for AP_CONTINUE.
    Done,
}

/// Behavior model of the CU-DMA engine.
#[derive(Clone, Copy)]
struct CuDmaModel {
    /// CU handle convention: address on 5.2 platforms, index mask otherwise.
    dsa52: bool,
}

/// Mutable device state.
struct DeviceState {
    /// Plain registers and queue memory, keyed by address.
    regs: HashMap<u32, u32>,
    /// CU models, keyed by control-register address.
    cus: HashMap<u32, CuModel>,
    /// Addresses whose next read returns stale zeros.
    poisoned: HashSet<u32>,
}

/// An emulated accelerator.
pub struct EmulatedDevice {
    /// Everything behind one lock; accesses are single words.
    state: Mutex<DeviceState>,
    /// Countdown armed by AP_START.
    delay: u32,
    /// CU-DMA engine, present only on fabrics built with it.
    dma: Option<CuDmaModel>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

/// Associated Functions for Emulated Devices
impl EmulatedDevice {
    /// Creates a device with CUs at `cu_addrs`. Each started CU reports done
    /// after `delay` control-register reads.
    pub fn with_cus(cu_addrs: &[u32], delay: u32) -> Arc<Self> {
        Self::build(cu_addrs, delay, None)
    }

    /// Creates a device that also carries the CU-DMA engine. `dsa52` picks
    /// the CU handle convention the engine reads out of a slot.
    pub fn with_cu_dma(cu_addrs: &[u32], delay: u32, dsa52: bool) -> Arc<Self> {
        Self::build(cu_addrs, delay, Some(CuDmaModel { dsa52 }))
    }

    fn build(cu_addrs: &[u32], delay: u32, dma: Option<CuDmaModel>) -> Arc<Self> {
        assert!(delay > 0, "a cu needs at least one poll to finish");
        Arc::new(Self {
            state: Mutex::new(DeviceState {
                regs: HashMap::new(),
                cus: cu_addrs.iter().map(|addr| (*addr, CuModel::Idle)).collect(),
                poisoned: HashSet::new(),
            }),
            delay,
            dma,
        })
    }

    /// Inspects a register without the side effects of a bus read: no
    /// read-to-clear, no CU countdown tick.
    pub fn register(&self, addr: u32) -> u32 {
        let state: MutexGuard<DeviceState> = self.lock();
        match state.cus.get(&addr) {
            Some(CuModel::Idle) => AP_IDLE,
            Some(CuModel::Busy { .. }) => AP_START,
            Some(CuModel::Done) => AP_DONE,
            None => state.regs.get(&addr).copied().unwrap_or(0),
        }
    }

    /// Makes the next bus read of `addr` return stale zeros, modeling the
    /// BRAM read-after-write hazard.
    pub fn poison_read(&self, addr: u32) {
        self.lock().poisoned.insert(addr);
    }

    /// Raises the completion bit for `slot` the way firmware would.
    pub fn raise_status(&self, slot: usize) {
        self.write_register(csr::STATUS_REGISTER + 4 * (slot as u32 >> 5), 1 << (slot & 31));
    }

    /// Forces every busy CU to finish on its next poll.
    pub fn finish_cus(&self) {
        let mut state: MutexGuard<DeviceState> = self.lock();
        for model in state.cus.values_mut() {
            if let CuModel::Busy { .. } = model {
                *model = CuModel::Done;
            }
        }
    }

    fn lock(&self) -> MutexGuard<DeviceState> {
        self.state.lock().expect("device lock poisoned")
    }

    /// True for the read-to-clear, write-one-to-set register ranges: the
    /// completion status registers and the new-command doorbells.
    fn is_sticky(addr: u32) -> bool {
        (csr::STATUS_REGISTER..csr::STATUS_REGISTER + 16).contains(&addr)
            || (csr::CQ_STATUS_REGISTER..csr::CQ_STATUS_REGISTER + 16).contains(&addr)
    }

    /// One CU-DMA engine kick: for each slot bit in `bits`, read the CU
    /// handle out of the slot's mask section, copy the slot's regmap into
    /// that CU's register window, and raise AP_START on it.
    fn cu_dma_transfer(state: &mut DeviceState, dma: CuDmaModel, delay: u32, slot_base: usize, bits: u32) {
        fn reg(state: &DeviceState, addr: u32) -> u32 {
            state.regs.get(&addr).copied().unwrap_or(0)
        }

        let slot_size: u32 = reg(state, csr::CQ_SLOT_SIZE);
        if slot_size == 0 {
            return;
        }

        for bit in ::bit_iter::BitIter::from(bits) {
            let slot_addr: u32 = csr::CQ_BASE + (slot_base + bit) as u32 * slot_size;
            let header: u32 = reg(state, slot_addr);
            let num_masks: u32 = packet::num_cu_masks(header);
            let count: u32 = packet::count(header);

            let cu_addr: u32 = if dma.dsa52 {
                // The slot holds the CU address shifted down by 2.
                reg(state, slot_addr + 4) << 2
            } else {
                let mut idx: Option<usize> = None;
                for word in 0..num_masks {
                    let mask: u32 = reg(state, slot_addr + 4 + 4 * word);
                    if mask != 0 {
                        idx = Some(((word as usize) << 5) + mask.trailing_zeros() as usize);
                        break;
                    }
                }
                let idx: usize = match idx {
                    Some(idx) => idx,
                    None => continue,
                };
                reg(state, csr::CU_BASE_ADDRESS) + ((idx as u32) << reg(state, csr::CU_OFFSET))
            };

            // The first four regmap words are the control protocol registers.
            let regmap_addr: u32 = slot_addr + 4 * (1 + num_masks);
            let regmap_words: u32 = count.saturating_sub(num_masks);
            for word in 4..regmap_words {
                let value: u32 = reg(state, regmap_addr + 4 * word);
                state.regs.insert(cu_addr + 4 * word, value);
            }
            if let Some(model) = state.cus.get_mut(&cu_addr) {
                *model = CuModel::Busy { polls_left: delay };
            }
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Register I/O Trait Implementation for Emulated Devices
impl RegisterIo for EmulatedDevice {
    fn read_register(&self, addr: u32) -> u32 {
        let mut state: MutexGuard<DeviceState> = self.lock();
        if state.poisoned.remove(&addr) {
            return 0;
        }

        if let Some(model) = state.cus.get_mut(&addr) {
            return match *model {
                CuModel::Idle => AP_IDLE,
                CuModel::Busy { polls_left } if polls_left <= 1 => {
                    *model = CuModel::Done;
                    AP_DONE
                },
                CuModel::Busy { polls_left } => {
                    *model = CuModel::Busy {
                        polls_left: polls_left - 1,
                    };
                    AP_START
                },
                CuModel::Done => AP_DONE,
            };
        }

        if Self::is_sticky(addr) {
            return state.regs.insert(addr, 0).unwrap_or(0);
        }
        state.regs.get(&addr).copied().unwrap_or(0)
    }

    fn write_register(&self, addr: u32, value: u32) {
        let mut state: MutexGuard<DeviceState> = self.lock();
        if let Some(model) = state.cus.get_mut(&addr) {
            if value & AP_START != 0 {
                *model = CuModel::Busy { polls_left: self.delay };
            } else if value & AP_CONTINUE != 0 {
                *model = CuModel::Idle;
            }
            return;
        }

        if let Some(dma) = self.dma {
            let enabled: bool = state.regs.get(&csr::CU_DMA_ENABLE).copied().unwrap_or(0) != 0;
            if enabled && (csr::CU_DMA_REGISTER..csr::CU_DMA_REGISTER + 16).contains(&addr) {
                let word: u32 = (addr - csr::CU_DMA_REGISTER) / 4;
                Self::cu_dma_transfer(&mut state, dma, self.delay, (word as usize) << 5, value);
                return;
            }
        }

        if Self::is_sticky(addr) {
            *state.regs.entry(addr).or_insert(0) |= value;
            return;
        }
        state.regs.insert(addr, value);
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
