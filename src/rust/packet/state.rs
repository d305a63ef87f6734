// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Structures
//======================================================================================================================

/// Lifecycle states of a command, stored in the low nibble of the packet
/// header. The discriminants are wire values shared with firmware and the
/// kernel driver.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CmdState {
    /// Set by the host to hand a command over to a scheduler.
    New = 1,
    /// Accepted by a scheduler, waiting for a compute unit.
    Queued = 2,
    /// Executing on a compute unit.
    Running = 3,
    /// Finished successfully.
    Completed = 4,
    /// Finished with an execution error.
    Error = 5,
    /// Forced to completion by an abort command.
    Abort = 6,
    /// Written into a command-queue slot, not yet picked up by firmware.
    Submitted = 7,
    /// Sentinel returned by a timed wait; never stored in a packet by a scheduler.
    Timeout = 8,
    /// The device stopped responding while the command was in flight.
    NoResponse = 9,
    /// A soft kernel reported an error.
    SkError = 10,
    /// A soft kernel crashed.
    SkCrashed = 11,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

/// Associated Functions for Command States
impl CmdState {
    /// Decodes a command state from its wire value.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::New),
            2 => Some(Self::Queued),
            3 => Some(Self::Running),
            4 => Some(Self::Completed),
            5 => Some(Self::Error),
            6 => Some(Self::Abort),
            7 => Some(Self::Submitted),
            8 => Some(Self::Timeout),
            9 => Some(Self::NoResponse),
            10 => Some(Self::SkError),
            11 => Some(Self::SkCrashed),
            _ => None,
        }
    }

    /// Returns true for completed-or-worse states. Note that this is an
    /// explicit state set rather than a numeric comparison: SUBMITTED and
    /// TIMEOUT encode above COMPLETED on the wire but are not terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Error | Self::Abort | Self::NoResponse | Self::SkError | Self::SkCrashed
        )
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
