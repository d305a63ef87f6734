// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Wire format of command packets.
//!
//! A packet is a 32-bit header followed by `count` payload words. The header
//! bit layout (state[3:0], custom[11:4], count[22:12], opcode[27:23],
//! type[31:28]) is shared byte-for-byte between user space, the kernel
//! driver, and the device firmware. All field access goes through the
//! shift/mask accessors below; nothing in this crate relies on in-memory
//! struct layout.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod configure;
pub mod opcode;
pub mod state;
pub mod validate;

pub use self::{
    configure::ConfigurePayload,
    opcode::{
        CmdType,
        Opcode,
    },
    state::CmdState,
    validate::is_valid,
};

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    bitset::Bitmask,
    memory::ExecBuf,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Number of payload words an INIT_CU packet carries before its CU masks
/// (timeout configuration and reserved words).
const INIT_CU_FIXED_WORDS: usize = 8;

/// Size in words of the DPU instruction-buffer descriptor.
const DPU_DATA_WORDS: usize = 4;

/// Size in words of the NPU instruction-buffer descriptor.
const NPU_DATA_WORDS: usize = 4;

/// Size in words of the preemptible-NPU instruction-buffer descriptor.
const NPU_PREEMPT_DATA_WORDS: usize = 10;

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Extracts the raw state nibble from a packet header.
pub fn raw_state(header: u32) -> u32 {
    header & 0xf
}

/// Extracts the command state from a packet header.
pub fn state_of(header: u32) -> Option<CmdState> {
    CmdState::from_u32(raw_state(header))
}

/// Extracts the opcode-specific custom bits [11:4] from a packet header.
pub fn custom(header: u32) -> u32 {
    (header >> 4) & 0xff
}

/// Extracts the payload word count [22:12] from a packet header.
pub fn count(header: u32) -> u32 {
    (header >> 12) & 0x7ff
}

/// Extracts the opcode [27:23] from a packet header.
pub fn opcode_of(header: u32) -> Option<Opcode> {
    Opcode::from_u32((header >> 23) & 0x1f)
}

/// Extracts the command type [31:28] from a packet header.
pub fn type_of(header: u32) -> Option<CmdType> {
    CmdType::from_u32(header >> 28)
}

/// Returns the total packet size in words, header included.
pub fn packet_words(header: u32) -> usize {
    1 + count(header) as usize
}

/// Replaces the state nibble of a packet header.
pub fn with_state(header: u32, state: CmdState) -> u32 {
    (header & !0xf) | state as u32
}

/// Builds a packet header from its fields.
pub fn make_header(state: CmdState, count: u32, opcode: Opcode, ty: CmdType) -> u32 {
    assert!(count <= 0x7ff, "payload count out of range");
    state as u32 | (count << 12) | ((opcode as u32) << 23) | ((ty as u32) << 28)
}

/// Sets the extra-CU-mask count, header bits [11:10] of start-kernel packets.
pub fn with_extra_cu_masks(header: u32, extra: u32) -> u32 {
    assert!(extra <= 3, "at most 3 extra cu masks");
    (header & !(0x3 << 10)) | (extra << 10)
}

/// Extracts the extra-CU-mask count of a start-kernel packet header.
pub fn extra_cu_masks(header: u32) -> u32 {
    (header >> 10) & 0x3
}

/// Total number of CU mask words (mandatory mask included).
pub fn num_cu_masks(header: u32) -> u32 {
    1 + extra_cu_masks(header)
}

/// True if timestamp recording is enabled, header bit [4] of start-kernel packets.
pub fn stat_enabled(header: u32) -> bool {
    (header >> 4) & 0x1 != 0
}

/// Returns the word index of the mandatory CU mask for `opcode`.
///
/// INIT_CU packets carry timeout configuration before the masks; every other
/// CU-addressed packet has its mandatory mask right after the header.
pub fn cu_masks_begin(opcode: Opcode) -> usize {
    match opcode {
        Opcode::InitCu => 1 + INIT_CU_FIXED_WORDS,
        _ => 1,
    }
}

/// Collects the CU masks of a packet into a [Bitmask].
pub fn cu_mask(buf: &ExecBuf) -> Bitmask {
    let header: u32 = buf.read_header();
    let begin: usize = match opcode_of(header) {
        Some(opcode) => cu_masks_begin(opcode),
        None => 1,
    };
    let words: Vec<u32> = buf.read_words(begin, num_cu_masks(header) as usize);
    Bitmask::from_words(&words)
}

/// Returns the word index of the first register-map word of a packet.
///
/// The regmap follows the CU masks; DPU and NPU opcodes additionally prepend
/// an instruction-buffer descriptor (and, for chained DPU commands, one
/// descriptor per chain link) that must be skipped.
pub fn regmap_begin(buf: &ExecBuf) -> usize {
    let header: u32 = buf.read_header();
    let masks_end: usize = 1 + num_cu_masks(header) as usize;
    match opcode_of(header) {
        Some(Opcode::StartDpu) => {
            // chained count lives in the high half of the descriptor's last word
            let chained: usize = (buf.read(masks_end + 3) >> 16) as usize;
            masks_end + (chained + 1) * DPU_DATA_WORDS
        },
        Some(Opcode::StartNpu) => {
            let prop_count: usize = buf.read(masks_end + 3) as usize;
            masks_end + NPU_DATA_WORDS + prop_count
        },
        Some(Opcode::StartNpuPreempt) | Some(Opcode::StartNpuPreemptElf) => {
            let prop_count: usize = buf.read(masks_end + 9) as usize;
            masks_end + NPU_PREEMPT_DATA_WORDS + prop_count
        },
        Some(Opcode::InitCu) => 1 + INIT_CU_FIXED_WORDS + num_cu_masks(header) as usize,
        _ => masks_end,
    }
}

/// Returns the word index one past the last register-map word of a packet.
pub fn regmap_end(buf: &ExecBuf) -> usize {
    packet_words(buf.read_header())
}

/// Returns the register-map size of a packet in words.
pub fn regmap_size(buf: &ExecBuf) -> usize {
    regmap_end(buf).saturating_sub(regmap_begin(buf))
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
