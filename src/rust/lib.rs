// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![cfg_attr(feature = "strict", deny(warnings))]
#![deny(clippy::all)]

#[macro_use]
extern crate log;

pub mod accel;
pub mod command;
pub mod ert;
pub mod packet;
pub mod pts;
pub mod runtime;
pub mod sws;
pub mod test_helpers;

pub use self::{
    accel::{
        Accelerator,
        Config,
        SchedulerMode,
    },
    command::{
        registry::CmdDesc,
        Command,
    },
    ert::{
        ErtScheduler,
        Firmware,
    },
    packet::{
        CmdState,
        CmdType,
        Opcode,
    },
    pts::PtsScheduler,
    runtime::{
        fail::Fail,
        register::{
            DeviceHandle,
            RegisterIo,
        },
    },
    sws::SwsScheduler,
};
