// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    accel::config::Config,
    runtime::fail::Fail,
};
use ::std::env;

//======================================================================================================================
// Constants
//======================================================================================================================

/// Environment variable overriding the configured scheduler backend.
const MODE_ENV_VAR: &str = "ACCEL_SCHEDULER";

//======================================================================================================================
// Structures
//======================================================================================================================

/// Scheduler backends.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SchedulerMode {
    /// Software scheduler: a host thread walks the CU list.
    Sws,
    /// Embedded scheduler: device firmware owns the command queue.
    Ert,
    /// Pass-through scheduler: the host pokes a single CU directly.
    Pts,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

/// Associated Functions for Scheduler Modes
impl SchedulerMode {
    /// Parses a backend name.
    pub fn from_str(name: &str) -> Result<Self, Fail> {
        match name {
            "sws" => Ok(Self::Sws),
            "ert" => Ok(Self::Ert),
            "pts" => Ok(Self::Pts),
            _ => {
                let cause: String = format!("unknown scheduler mode: {:?}", name);
                error!("from_str(): {}", cause);
                Err(Fail::new(libc::EINVAL, &cause))
            },
        }
    }

    /// Selects the backend from the environment, falling back to the
    /// configuration file. The selection is made once at device-open time
    /// and never changes for the lifetime of the context.
    pub fn select(config: &Config) -> Result<Self, Fail> {
        match env::var(MODE_ENV_VAR) {
            Ok(name) => Self::from_str(&name),
            Err(_) => Self::from_str(&config.scheduler_mode()?),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
