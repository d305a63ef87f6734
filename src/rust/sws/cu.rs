// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    packet,
    packet::opcode::Opcode,
    runtime::{
        memory::ExecBuf,
        register::{
            RegisterIo,
            AP_CONTINUE,
            AP_DONE,
            AP_IDLE,
            AP_START,
        },
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Word offset of the first kernel argument in a CU register window. The
/// first four words are the control and interrupt registers of the HLS
/// protocol and are never written from a regmap.
const CU_REGMAP_OFFSET: usize = 4;

/// Number of reserved words at the head of an EXEC_WRITE regmap, before the
/// {offset, value} pairs start.
const EXEC_WRITE_RESERVED_WORDS: usize = 6;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Host-side model of one compute unit.
///
/// Tracks the cached control register, the number of in-flight starts, and a
/// monotonic usage counter that survives release (reported via CU_STAT).
pub struct ComputeUnit {
    /// Index of this CU on the fabric.
    idx: usize,
    /// Register base address.
    addr: u32,
    /// Last value observed in the control register.
    ctrlreg: u32,
    /// Commands started and not yet observed done.
    run_cnt: u32,
    /// Lifetime completions.
    done_cnt: u32,
    /// Lifetime starts; monotonic, never reset on release.
    usage: u32,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

/// Associated Functions for Compute Units
impl ComputeUnit {
    /// Creates an idle compute unit at `addr`.
    pub fn new(idx: usize, addr: u32) -> Self {
        Self {
            idx,
            addr,
            ctrlreg: 0,
            run_cnt: 0,
            done_cnt: 0,
            usage: 0,
        }
    }

    /// Returns the index of this CU.
    pub fn idx(&self) -> usize {
        self.idx
    }

    /// Returns the register base address of this CU.
    pub fn addr(&self) -> u32 {
        self.addr
    }

    /// Returns the lifetime start count of this CU.
    pub fn usage(&self) -> u32 {
        self.usage
    }

    /// Returns the lifetime completion count of this CU.
    pub fn done_cnt(&self) -> u32 {
        self.done_cnt
    }

    /// Returns true if the CU can accept a start.
    pub fn ready(&self) -> bool {
        self.run_cnt == 0
    }

    /// Writes the register map of `buf` into the CU register window and
    /// starts the CU.
    ///
    /// For EXEC_WRITE commands, the regmap is interpreted as {offset, value}
    /// pairs after the reserved words; everything else copies the regmap
    /// verbatim past the control words.
    pub fn start(&mut self, dev: &dyn RegisterIo, buf: &ExecBuf) {
        self.write_regmap(dev, buf);
        trace!("start(): cu {} at {:#x}", self.idx, self.addr);
        dev.write_register(self.addr, AP_START);
        self.mark_started();
    }

    /// Records a start performed on this CU's behalf by the CU-DMA engine.
    /// The engine copies the regmap and raises AP_START itself; only the
    /// bookkeeping happens here.
    pub fn mark_started(&mut self) {
        self.ctrlreg = AP_START;
        self.run_cnt += 1;
        self.usage += 1;
    }

    /// Writes the register map of `buf` into the CU register window without
    /// starting the CU (the INIT_CU path).
    pub fn write_regmap(&mut self, dev: &dyn RegisterIo, buf: &ExecBuf) {
        let begin: usize = packet::regmap_begin(buf);
        let end: usize = packet::regmap_end(buf);

        match packet::opcode_of(buf.read_header()) {
            Some(Opcode::ExecWrite) => {
                let mut i: usize = begin + EXEC_WRITE_RESERVED_WORDS;
                while i + 1 < end {
                    dev.write_register(self.addr + buf.read(i), buf.read(i + 1));
                    i += 2;
                }
            },
            _ => {
                for i in (begin + CU_REGMAP_OFFSET)..end {
                    let offset: u32 = ((i - begin) * 4) as u32;
                    dev.write_register(self.addr + offset, buf.read(i));
                }
            },
        }
    }

    /// Forgets one in-flight start without touching the device, the abort
    /// path. The hardware run is left to finish on its own.
    pub fn abort(&mut self) {
        assert!(self.run_cnt > 0, "no run to abort");
        self.run_cnt -= 1;
    }

    /// Polls the CU control register, acknowledging a completion with
    /// AP_CONTINUE. Returns true if a completion was observed.
    pub fn poll(&mut self, dev: &dyn RegisterIo) -> bool {
        if self.run_cnt == 0 {
            return false;
        }

        self.ctrlreg = dev.read_register(self.addr);
        if self.ctrlreg & (AP_DONE | AP_IDLE) != 0 {
            self.run_cnt -= 1;
            self.done_cnt += 1;
            dev.write_register(self.addr, AP_CONTINUE);
            return true;
        }
        false
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
