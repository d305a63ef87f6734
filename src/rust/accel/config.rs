// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::std::{
    fs::File,
    io::Read,
    ops::Index,
};
use ::yaml_rust::{
    Yaml,
    YamlLoader,
};

//======================================================================================================================
// Constants
//======================================================================================================================

// Device description: slot and compute-unit geometry.
mod device_config {
    pub const SECTION_NAME: &str = "device";
    pub const NUM_SLOTS: &str = "num_slots";
    pub const SLOT_SIZE: &str = "slot_size";
    pub const NUM_CUS: &str = "num_cus";
    pub const CU_BASE_ADDR: &str = "cu_base_addr";
    pub const CU_SHIFT: &str = "cu_shift";
    pub const CU_ADDRS: &str = "cu_addrs";
}

// Scheduler options: backend selection and feature toggles.
mod scheduler_config {
    pub const SECTION_NAME: &str = "scheduler";
    pub const MODE: &str = "mode";
    pub const POLLING: &str = "polling";
    pub const ECHO: &str = "echo";
    pub const CU_DMA: &str = "cu_dma";
    pub const CU_ISR: &str = "cu_isr";
    pub const CQ_INT: &str = "cq_int";
    pub const DSA52: &str = "dsa52";
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Accelerator runtime configuration.
#[derive(Clone, Debug)]
pub struct Config(pub Yaml);

//======================================================================================================================
// Associated Functions
//======================================================================================================================

/// Associated Functions for the accelerator runtime configuration object.
impl Config {
    /// Reads a configuration file into a [Config] object.
    pub fn new(config_path: String) -> Result<Self, Fail> {
        let mut config_s: String = String::new();
        File::open(config_path)?.read_to_string(&mut config_s)?;
        Self::from_str(&config_s)
    }

    /// Parses a configuration document from a string.
    pub fn from_str(config_s: &str) -> Result<Self, Fail> {
        let config: Vec<Yaml> = match YamlLoader::load_from_str(config_s) {
            Ok(config) => config,
            Err(e) => {
                let cause: String = format!("malformed configuration: {:?}", e);
                error!("from_str(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        let config_obj: &Yaml = match &config[..] {
            &[ref c] => c,
            _ => return Err(Fail::new(libc::EINVAL, "wrong number of config objects")),
        };
        Ok(Self(config_obj.clone()))
    }

    fn get_device_config(&self) -> Result<&Yaml, Fail> {
        Self::get_subsection(&self.0, device_config::SECTION_NAME)
    }

    fn get_scheduler_config(&self) -> Result<&Yaml, Fail> {
        Self::get_subsection(&self.0, scheduler_config::SECTION_NAME)
    }

    /// Device config: number of command-queue slots.
    pub fn num_slots(&self) -> Result<usize, Fail> {
        Self::get_int_option(self.get_device_config()?, device_config::NUM_SLOTS)
    }

    /// Device config: command-queue slot size in bytes.
    pub fn slot_size(&self) -> Result<u32, Fail> {
        Self::get_int_option(self.get_device_config()?, device_config::SLOT_SIZE)
    }

    /// Device config: number of compute units on the fabric.
    pub fn num_cus(&self) -> Result<usize, Fail> {
        Self::get_int_option(self.get_device_config()?, device_config::NUM_CUS)
    }

    /// Device config: base address of the CU register space.
    pub fn cu_base_addr(&self) -> Result<u32, Fail> {
        Self::get_int_option(self.get_device_config()?, device_config::CU_BASE_ADDR)
    }

    /// Device config: shift converting a CU index into an address offset.
    pub fn cu_shift(&self) -> Result<u32, Fail> {
        Self::get_int_option(self.get_device_config()?, device_config::CU_SHIFT)
    }

    /// Device config: explicit per-CU register base addresses. When absent,
    /// addresses are derived from `cu_base_addr` and `cu_shift`.
    pub fn cu_addrs(&self) -> Result<Option<Vec<u32>>, Fail> {
        let device: &Yaml = self.get_device_config()?;
        match device.index(device_config::CU_ADDRS) {
            Yaml::BadValue => Ok(None),
            Yaml::Array(ref addrs) => {
                let mut result: Vec<u32> = Vec::with_capacity(addrs.len());
                for addr in addrs {
                    match addr.as_i64().and_then(|v| u32::try_from(v).ok()) {
                        Some(addr) => result.push(addr),
                        None => {
                            let cause: &str = "cu address is not a 32-bit integer";
                            error!("cu_addrs(): {}", cause);
                            return Err(Fail::new(libc::EINVAL, cause));
                        },
                    }
                }
                Ok(Some(result))
            },
            _ => Err(Fail::new(libc::EINVAL, "parameter \"cu_addrs\" has unexpected type")),
        }
    }

    /// Scheduler config: backend name (sws, ert, or pts).
    pub fn scheduler_mode(&self) -> Result<String, Fail> {
        let section: &Yaml = self.get_scheduler_config()?;
        match Self::get_option(section, scheduler_config::MODE)?.as_str() {
            Some(mode) => Ok(mode.to_string()),
            None => Err(Fail::new(libc::EINVAL, "parameter \"mode\" has unexpected type")),
        }
    }

    /// Scheduler config: poll for CU completion instead of taking interrupts.
    pub fn polling(&self) -> Result<bool, Fail> {
        self.get_toggle(scheduler_config::POLLING)
    }

    /// Scheduler config: complete commands at fetch time without touching CUs.
    pub fn echo(&self) -> Result<bool, Fail> {
        self.get_toggle(scheduler_config::ECHO)
    }

    /// Scheduler config: program the CU-DMA engine at configure time.
    pub fn cu_dma(&self) -> Result<bool, Fail> {
        self.get_toggle(scheduler_config::CU_DMA)
    }

    /// Scheduler config: enable the CU completion interrupt handler.
    pub fn cu_isr(&self) -> Result<bool, Fail> {
        self.get_toggle(scheduler_config::CU_ISR)
    }

    /// Scheduler config: enable the host-to-device new-command doorbell.
    pub fn cq_int(&self) -> Result<bool, Fail> {
        self.get_toggle(scheduler_config::CQ_INT)
    }

    /// Scheduler config: CU-DMA takes addresses (5.2 platforms) instead of indices.
    pub fn dsa52(&self) -> Result<bool, Fail> {
        self.get_toggle(scheduler_config::DSA52)
    }

    /// Reads a boolean toggle from the scheduler section, absent means off.
    fn get_toggle(&self, index: &str) -> Result<bool, Fail> {
        let section: &Yaml = self.get_scheduler_config()?;
        match section.index(index) {
            Yaml::BadValue => Ok(false),
            Yaml::Boolean(value) => Ok(*value),
            _ => {
                let message: String = format!("parameter \"{}\" has unexpected type", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
        }
    }

    //==================================================================================================================
    // Static Functions
    //==================================================================================================================

    /// Index `yaml` to find the subsection at `index`.
    fn get_subsection<'a>(yaml: &'a Yaml, index: &str) -> Result<&'a Yaml, Fail> {
        let section: &'a Yaml = Self::get_option(yaml, index)?;
        match section {
            Yaml::Hash(_) => Ok(section),
            _ => {
                let message: String = format!("parameter \"{}\" has unexpected type", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
        }
    }

    /// Index `yaml` to find the value at `index`, validating that the index exists.
    fn get_option<'a>(yaml: &'a Yaml, index: &str) -> Result<&'a Yaml, Fail> {
        match yaml.index(index) {
            Yaml::BadValue => {
                let message: String = format!("missing configuration option \"{}\"", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
            value => Ok(value),
        }
    }

    /// Index `yaml` to find the integer at `index`, verifying that the
    /// destination type may hold the value.
    fn get_int_option<T: TryFrom<i64>>(yaml: &Yaml, index: &str) -> Result<T, Fail> {
        let val: i64 = match Self::get_option(yaml, index)?.as_i64() {
            Some(val) => val,
            None => {
                let message: String = format!("parameter \"{}\" has unexpected type", index);
                return Err(Fail::new(libc::EINVAL, message.as_str()));
            },
        };
        match T::try_from(val) {
            Ok(val) => Ok(val),
            _ => {
                let message: String = format!("parameter \"{}\" is out of range", index);
                Err(Fail::new(libc::ERANGE, message.as_str()))
            },
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
