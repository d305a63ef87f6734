// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    command::Command,
    runtime::fail::Fail,
};
use ::libc::EBADF;
use ::slab::Slab;
use ::std::sync::Arc;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Command Descriptor
///
/// Opaque handle to a command held in a [CommandRegistry].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CmdDesc(usize);

/// Registry mapping command descriptors to strongly-owned commands.
///
/// The registry is the only table a handle is valid in; a descriptor
/// released back to the registry may be reused for a later command.
#[derive(Default)]
pub struct CommandRegistry {
    /// Underlying storage.
    table: Slab<Arc<Command>>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

/// Associated Functions for Command Registries
impl CommandRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self { table: Slab::new() }
    }

    /// Registers a command, returning its descriptor.
    pub fn insert(&mut self, cmd: Arc<Command>) -> CmdDesc {
        CmdDesc(self.table.insert(cmd))
    }

    /// Looks up the command behind `desc`.
    pub fn get(&self, desc: CmdDesc) -> Result<Arc<Command>, Fail> {
        match self.table.get(desc.0) {
            Some(cmd) => Ok(cmd.clone()),
            None => Err(Fail::new(EBADF, "invalid command descriptor")),
        }
    }

    /// Removes the command behind `desc` from the registry.
    ///
    /// The command itself stays alive while any backend still holds it, so
    /// removal never races a pending completion.
    pub fn remove(&mut self, desc: CmdDesc) -> Result<Arc<Command>, Fail> {
        if !self.table.contains(desc.0) {
            return Err(Fail::new(EBADF, "invalid command descriptor"));
        }
        Ok(self.table.remove(desc.0))
    }

    /// Returns the number of registered commands.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Returns true if no command is registered.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Conversion Trait Implementation for Command Descriptors
impl From<usize> for CmdDesc {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

/// Conversion Trait Implementation for Command Descriptors
impl From<CmdDesc> for usize {
    fn from(desc: CmdDesc) -> Self {
        desc.0
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
