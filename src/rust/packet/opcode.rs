// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Structures
//======================================================================================================================

/// Command packet opcodes.
///
/// The discriminants are wire values shared with the device firmware and the
/// kernel driver and must not be renumbered.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Opcode {
    /// Start a compute unit.
    StartCu = 0,
    /// Configure the scheduler.
    Configure = 2,
    /// Stop the scheduler.
    Exit = 3,
    /// Abort a command in another slot.
    Abort = 4,
    /// Start a compute unit with explicit {offset, value} register writes.
    ExecWrite = 5,
    /// Report per-CU usage statistics.
    CuStat = 6,
    /// Copy between buffer objects.
    StartCopyBo = 7,
    /// Configure soft-kernel images.
    SkConfig = 8,
    /// Start a soft kernel.
    SkStart = 9,
    /// Unconfigure soft kernels (obsolete, always rejected).
    SkUnconfig = 10,
    /// Initialize CU registers without starting the CU.
    InitCu = 11,
    /// Start a fast-adapter CU.
    StartFa = 12,
    /// Clock calibration.
    ClkCalib = 13,
    /// Scheduler self-validation.
    MbValidate = 14,
    /// Start a key-value CU.
    StartKeyVal = 15,
    /// Access test (control variant).
    AccessTestC = 16,
    /// Access test.
    AccessTest = 17,
    /// Start a DPU with an instruction buffer descriptor.
    StartDpu = 18,
    /// Chain of commands.
    CmdChain = 19,
    /// Start an NPU with an instruction buffer descriptor.
    StartNpu = 20,
    /// Start a preemptible NPU.
    StartNpuPreempt = 21,
    /// Start a preemptible NPU from an ELF image.
    StartNpuPreemptElf = 22,
}

/// Coarse command categories, encoded in the packet header type field.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CmdType {
    /// Uncategorized command.
    Default = 0,
    /// Command handled locally by the kernel scheduler.
    KdsLocal = 1,
    /// Control-plane command, never occupies a CU.
    Ctrl = 2,
    /// Data-plane command bound for a CU.
    Cu = 3,
    /// Command bound for a soft (PS-side) CU.
    Scu = 4,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

/// Associated Functions for Opcodes
impl Opcode {
    /// Decodes an opcode from its wire value.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::StartCu),
            2 => Some(Self::Configure),
            3 => Some(Self::Exit),
            4 => Some(Self::Abort),
            5 => Some(Self::ExecWrite),
            6 => Some(Self::CuStat),
            7 => Some(Self::StartCopyBo),
            8 => Some(Self::SkConfig),
            9 => Some(Self::SkStart),
            10 => Some(Self::SkUnconfig),
            11 => Some(Self::InitCu),
            12 => Some(Self::StartFa),
            13 => Some(Self::ClkCalib),
            14 => Some(Self::MbValidate),
            15 => Some(Self::StartKeyVal),
            16 => Some(Self::AccessTestC),
            17 => Some(Self::AccessTest),
            18 => Some(Self::StartDpu),
            19 => Some(Self::CmdChain),
            20 => Some(Self::StartNpu),
            21 => Some(Self::StartNpuPreempt),
            22 => Some(Self::StartNpuPreemptElf),
            _ => None,
        }
    }

    /// Returns true for opcodes that carry the start-kernel header layout
    /// (extra CU mask count in header bits [11:10], masks before the regmap).
    pub fn starts_cu(&self) -> bool {
        matches!(
            self,
            Self::StartCu
                | Self::ExecWrite
                | Self::StartFa
                | Self::SkStart
                | Self::StartKeyVal
                | Self::StartDpu
                | Self::StartNpu
                | Self::StartNpuPreempt
                | Self::StartNpuPreemptElf
        )
    }

    /// Returns true for control-plane opcodes that are processed by the
    /// scheduler itself and never occupy a CU.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Self::Configure
                | Self::Exit
                | Self::Abort
                | Self::CuStat
                | Self::InitCu
                | Self::SkConfig
                | Self::ClkCalib
                | Self::MbValidate
                | Self::AccessTestC
        )
    }
}

/// Associated Functions for Command Types
impl CmdType {
    /// Decodes a command type from its wire value.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Default),
            1 => Some(Self::KdsLocal),
            2 => Some(Self::Ctrl),
            3 => Some(Self::Cu),
            4 => Some(Self::Scu),
            _ => None,
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use crate::packet::opcode::{
        CmdType,
        Opcode,
    };

    #[test]
    fn opcode_wire_values_round_trip() {
        for value in 0..32 {
            if let Some(opcode) = Opcode::from_u32(value) {
                assert_eq!(opcode as u32, value);
            }
        }
        // Wire value 1 is retired and must not decode.
        assert_eq!(Opcode::from_u32(1), None);
        assert_eq!(Opcode::from_u32(23), None);
    }

    #[test]
    fn cmd_type_wire_values_round_trip() {
        for value in 0..5 {
            let ty: CmdType = CmdType::from_u32(value).unwrap();
            assert_eq!(ty as u32, value);
        }
        assert_eq!(CmdType::from_u32(5), None);
    }
}
