// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod bitset;
pub mod fail;
pub mod logging;
pub mod memory;
pub mod register;

pub use self::{
    bitset::Bitmask,
    fail::Fail,
    memory::ExecBuf,
    register::{
        DeviceHandle,
        RegisterIo,
    },
};
