// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    packet,
    packet::opcode::Opcode,
    runtime::memory::ExecBuf,
};

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Checks a command packet against the per-opcode minimum payload size.
///
/// This is the first line of defense against truncated or malformed packets:
/// a packet rejected here is never dispatched and no scheduler state is
/// touched on its behalf. The minimum counts are wire contract; each entry
/// states the mandatory words beyond the CU masks.
pub fn is_valid(buf: &ExecBuf) -> bool {
    let header: u32 = buf.read_header();
    let count: u32 = packet::count(header);
    let extra: u32 = packet::extra_cu_masks(header);

    // A packet that claims more words than its buffer holds is truncated.
    if packet::packet_words(header) > buf.capacity() {
        return false;
    }

    let opcode: Opcode = match packet::opcode_of(header) {
        Some(opcode) => opcode,
        None => return false,
    };

    match opcode {
        // 1 cu mask + 4 control registers.
        Opcode::StartCu => count >= extra + 1 + 4,
        // 1 cu mask + 6 words of {offset, value} pairs area.
        Opcode::ExecWrite => count >= extra + 1 + 6,
        // 1 cu mask.
        Opcode::StartFa | Opcode::StartKeyVal => count >= extra + 1,
        // 1 cu mask + 1 control word.
        Opcode::SkStart => count >= extra + 1 + 1,
        // 1 cu mask + instruction buffer descriptor.
        Opcode::StartDpu | Opcode::StartNpu => count >= 1 + extra + 4,
        Opcode::StartNpuPreempt | Opcode::StartNpuPreemptElf => count >= 1 + extra + 10,
        // header count must match the number of chained commands in the payload
        Opcode::CmdChain => {
            if count < 6 {
                return false;
            }
            let command_count: u32 = buf.read(1);
            count as u64 == command_count as u64 * 2 + 6
        },
        // 5 mandatory payload words + one address per CU.
        Opcode::Configure => {
            if count < 5 {
                return false;
            }
            let num_cus: u32 = buf.read(2);
            count as u64 >= 5 + num_cus as u64
        },
        Opcode::StartCopyBo => count == 16,
        // 8 fixed words + 1 cu mask + 4 control registers.
        Opcode::InitCu => count >= extra + 9 + 4,
        // 1 image-count word + 7 words per soft-kernel image.
        Opcode::SkConfig => {
            if count < 1 {
                return false;
            }
            let num_image: u32 = buf.read(1);
            count as u64 == num_image as u64 * 7 + 1
        },
        // Payload is a results area filled by the scheduler.
        Opcode::ClkCalib | Opcode::MbValidate | Opcode::AccessTestC | Opcode::CuStat => true,
        Opcode::Exit | Opcode::Abort => true,
        // Retired opcodes are always rejected.
        Opcode::SkUnconfig | Opcode::AccessTest => false,
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
