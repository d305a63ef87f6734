// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    packet,
    packet::opcode::Opcode,
    runtime::{
        fail::Fail,
        memory::ExecBuf,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

// Feature bits of the configure payload, word 5 of the packet.
const FEATURE_ERT: u32 = 1 << 0;
const FEATURE_POLLING: u32 = 1 << 1;
const FEATURE_CU_DMA: u32 = 1 << 2;
const FEATURE_CU_ISR: u32 = 1 << 3;
const FEATURE_CQ_INT: u32 = 1 << 4;
const FEATURE_DATAFLOW: u32 = 1 << 6;
const FEATURE_ECHO: u32 = 1 << 10;
const FEATURE_DSA52: u32 = 1 << 31;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Decoded payload of a CONFIGURE command.
///
/// Word layout after the header: slot_size, num_cus, cu_shift, cu_base_addr,
/// feature bits, then one register base address per CU.
#[derive(Clone, Debug)]
pub struct ConfigurePayload {
    /// Command queue slot size in bytes.
    pub slot_size: u32,
    /// Shift converting a CU index into an address offset.
    pub cu_shift: u32,
    /// Base address of the CU register space.
    pub cu_base_addr: u32,
    /// Raw feature bits.
    features: u32,
    /// Register base address of each CU.
    pub cu_addrs: Vec<u32>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

/// Associated Functions for Configure Payloads
impl ConfigurePayload {
    /// Decodes the configure payload of `buf`.
    pub fn from_buf(buf: &ExecBuf) -> Result<Self, Fail> {
        let header: u32 = buf.read_header();
        if packet::opcode_of(header) != Some(Opcode::Configure) {
            return Err(Fail::bad_packet("not a configure command"));
        }
        if !packet::is_valid(buf) {
            return Err(Fail::bad_packet("malformed configure command"));
        }

        let num_cus: usize = buf.read(2) as usize;
        Ok(Self {
            slot_size: buf.read(1),
            cu_shift: buf.read(3),
            cu_base_addr: buf.read(4),
            features: buf.read(5),
            cu_addrs: buf.read_words(6, num_cus),
        })
    }

    /// Encodes this payload into `buf`, returning the payload word count.
    pub fn write_to(&self, buf: &ExecBuf) -> u32 {
        buf.write(1, self.slot_size);
        buf.write(2, self.cu_addrs.len() as u32);
        buf.write(3, self.cu_shift);
        buf.write(4, self.cu_base_addr);
        buf.write(5, self.features);
        buf.write_words(6, &self.cu_addrs);
        5 + self.cu_addrs.len() as u32
    }

    /// Creates a payload with no feature enabled.
    pub fn new(slot_size: u32, cu_shift: u32, cu_base_addr: u32, cu_addrs: Vec<u32>) -> Self {
        Self {
            slot_size,
            cu_shift,
            cu_base_addr,
            features: 0,
            cu_addrs,
        }
    }

    /// Number of CUs described by this payload.
    pub fn num_cus(&self) -> usize {
        self.cu_addrs.len()
    }

    pub fn ert(&self) -> bool {
        self.features & FEATURE_ERT != 0
    }

    pub fn polling(&self) -> bool {
        self.features & FEATURE_POLLING != 0
    }

    pub fn cu_dma(&self) -> bool {
        self.features & FEATURE_CU_DMA != 0
    }

    pub fn cu_isr(&self) -> bool {
        self.features & FEATURE_CU_ISR != 0
    }

    pub fn cq_int(&self) -> bool {
        self.features & FEATURE_CQ_INT != 0
    }

    pub fn dataflow(&self) -> bool {
        self.features & FEATURE_DATAFLOW != 0
    }

    pub fn echo(&self) -> bool {
        self.features & FEATURE_ECHO != 0
    }

    pub fn dsa52(&self) -> bool {
        self.features & FEATURE_DSA52 != 0
    }

    pub fn set_ert(&mut self, on: bool) -> &mut Self {
        self.set_feature(FEATURE_ERT, on)
    }

    pub fn set_polling(&mut self, on: bool) -> &mut Self {
        self.set_feature(FEATURE_POLLING, on)
    }

    pub fn set_cu_dma(&mut self, on: bool) -> &mut Self {
        self.set_feature(FEATURE_CU_DMA, on)
    }

    pub fn set_cu_isr(&mut self, on: bool) -> &mut Self {
        self.set_feature(FEATURE_CU_ISR, on)
    }

    pub fn set_cq_int(&mut self, on: bool) -> &mut Self {
        self.set_feature(FEATURE_CQ_INT, on)
    }

    pub fn set_echo(&mut self, on: bool) -> &mut Self {
        self.set_feature(FEATURE_ECHO, on)
    }

    pub fn set_dsa52(&mut self, on: bool) -> &mut Self {
        self.set_feature(FEATURE_DSA52, on)
    }

    fn set_feature(&mut self, bit: u32, on: bool) -> &mut Self {
        if on {
            self.features |= bit;
        } else {
            self.features &= !bit;
        }
        self
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
