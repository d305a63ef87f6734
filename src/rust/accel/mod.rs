// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Backend selection and dispatch.
//!
//! The facade owns the command registry and one scheduler backend, selected
//! once at initialization time. Callers talk in command descriptors; every
//! packet crosses exactly one validation point here before a backend sees it.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod config;
pub mod mode;

pub use self::{
    config::Config,
    mode::SchedulerMode,
};

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    command::{
        registry::{
            CmdDesc,
            CommandRegistry,
        },
        Command,
    },
    ert::ErtScheduler,
    packet,
    packet::state::CmdState,
    pts::PtsScheduler,
    runtime::{
        fail::Fail,
        logging,
        register::DeviceHandle,
    },
    sws::SwsScheduler,
};
use ::libc::{
    EBADMSG,
    EPERM,
};
use ::std::{
    sync::Arc,
    time::Duration,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// The active scheduler backend.
enum Backend {
    /// Software scheduler.
    Sws(SwsScheduler),
    /// Embedded scheduler.
    Ert(ErtScheduler),
    /// Pass-through scheduler.
    Pts(PtsScheduler),
}

/// The accelerator runtime context.
pub struct Accelerator {
    /// Register access to the device.
    dev: DeviceHandle,
    /// Backend picked at context creation, instantiated by [Self::init].
    mode: SchedulerMode,
    /// Runtime configuration.
    config: Config,
    /// The running backend, `None` before init and after stop.
    backend: Option<Backend>,
    /// Descriptor table for commands created through this context.
    registry: CommandRegistry,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

/// Associated Functions for Backends
impl Backend {
    fn submit(&self, cmd: Arc<Command>) -> Result<(), Fail> {
        match self {
            Backend::Sws(sched) => sched.submit(cmd),
            Backend::Ert(sched) => sched.submit(cmd),
            Backend::Pts(sched) => sched.submit(cmd),
        }
    }

    fn num_live(&self) -> usize {
        match self {
            Backend::Sws(sched) => sched.num_live(),
            Backend::Ert(sched) => sched.num_live(),
            Backend::Pts(sched) => sched.num_live(),
        }
    }

    fn stop(&mut self) -> Result<(), Fail> {
        match self {
            Backend::Sws(sched) => sched.stop(),
            Backend::Ert(sched) => sched.stop(),
            Backend::Pts(sched) => sched.stop(),
        }
    }
}

/// Associated Functions for the Accelerator Runtime
impl Accelerator {
    /// Creates a context for `dev`. The backend is selected here but not
    /// started; call [Self::init] before scheduling.
    pub fn new(dev: DeviceHandle, config: Config) -> Result<Self, Fail> {
        logging::initialize();
        let mode: SchedulerMode = SchedulerMode::select(&config)?;
        info!("new(): scheduler mode {:?}", mode);
        Ok(Self {
            dev,
            mode,
            config,
            backend: None,
            registry: CommandRegistry::new(),
        })
    }

    /// Starts the selected backend. Calling init on a running context is a
    /// no-op; start-up happens exactly once.
    pub fn init(&mut self) -> Result<(), Fail> {
        if self.backend.is_some() {
            debug!("init(): backend already running");
            return Ok(());
        }

        let backend: Backend = match self.mode {
            SchedulerMode::Sws => Backend::Sws(SwsScheduler::new(self.dev.clone(), &self.config)?),
            SchedulerMode::Ert => Backend::Ert(ErtScheduler::new(self.dev.clone(), &self.config)?),
            SchedulerMode::Pts => Backend::Pts(PtsScheduler::new(self.dev.clone(), &self.config)?),
        };
        self.backend = Some(backend);
        Ok(())
    }

    /// Returns true once the backend is running.
    pub fn initialized(&self) -> bool {
        self.backend.is_some()
    }

    /// Allocates a command with a packet buffer of `capacity` words.
    pub fn create_command(&mut self, capacity: usize) -> CmdDesc {
        self.registry.insert(Arc::new(Command::new(capacity)))
    }

    /// Looks up the command behind `desc`, for packet construction and
    /// callback registration.
    pub fn command(&self, desc: CmdDesc) -> Result<Arc<Command>, Fail> {
        self.registry.get(desc)
    }

    /// Launches the command behind `desc` on the active backend.
    ///
    /// The packet is validated here, once, before anything downstream trusts
    /// its header; a malformed packet never reaches a backend. A command
    /// whose previous run has not completed is rejected without touching the
    /// live run.
    pub fn schedule(&mut self, desc: CmdDesc) -> Result<(), Fail> {
        let backend: &Backend = match self.backend {
            Some(ref backend) => backend,
            None => {
                let cause: &str = "context is not initialized";
                error!("schedule(): {}", cause);
                return Err(Fail::new(EPERM, cause));
            },
        };

        let cmd: Arc<Command> = self.registry.get(desc)?;
        if !packet::is_valid(cmd.buf()) {
            let cause: &str = "malformed command packet";
            error!("schedule(): {}", cause);
            return Err(Fail::new(EBADMSG, cause));
        }

        cmd.begin()?;
        if let Err(e) = backend.submit(cmd.clone()) {
            cmd.rollback();
            return Err(e);
        }
        Ok(())
    }

    /// Blocks until the command behind `desc` completes; returns its final
    /// state.
    pub fn wait(&self, desc: CmdDesc) -> Result<CmdState, Fail> {
        self.registry.get(desc)?.wait()
    }

    /// Blocks until the command behind `desc` completes or `timeout` elapses.
    pub fn wait_timeout(&self, desc: CmdDesc, timeout: Duration) -> Result<CmdState, Fail> {
        self.registry.get(desc)?.wait_timeout(timeout)
    }

    /// Returns the current packet state of the command behind `desc`.
    pub fn state(&self, desc: CmdDesc) -> Result<CmdState, Fail> {
        self.registry.get(desc)?.state()
    }

    /// Registers a completion callback on the command behind `desc`.
    pub fn add_callback<F>(&self, desc: CmdDesc, callback: F) -> Result<(), Fail>
    where
        F: Fn(CmdState) + Send + Sync + 'static,
    {
        self.registry.get(desc)?.add_callback(callback)
    }

    /// Releases the descriptor. The command itself stays alive while a
    /// backend still runs it.
    pub fn close_command(&mut self, desc: CmdDesc) -> Result<(), Fail> {
        self.registry.remove(desc).map(|_| ())
    }

    /// Returns the number of commands in flight on the backend.
    pub fn num_live(&self) -> usize {
        self.backend.as_ref().map_or(0, Backend::num_live)
    }

    /// Stops the backend. Fails while commands are in flight; stopping a
    /// stopped context is a no-op.
    pub fn stop(&mut self) -> Result<(), Fail> {
        let mut backend: Backend = match self.backend.take() {
            Some(backend) => backend,
            None => return Ok(()),
        };
        match backend.stop() {
            Ok(()) => Ok(()),
            Err(e) => {
                // Leave a busy backend in place so a later stop can retry.
                self.backend = Some(backend);
                Err(e)
            },
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
