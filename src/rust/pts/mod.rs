// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Pass-through scheduler.
//!
//! Debug backend that drives a single CU directly, one command at a time.
//! There is no queue: a second submission while one is in flight is rejected
//! at the call site. Useful for bring-up, where the full scheduler machinery
//! only gets in the way of watching one kernel run.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    accel::config::Config,
    command::Command,
    packet,
    packet::{
        opcode::Opcode,
        state::CmdState,
    },
    runtime::{
        fail::Fail,
        memory::ExecBuf,
        register::DeviceHandle,
    },
    sws::cu::ComputeUnit,
};
use ::crossbeam_channel::{
    Receiver,
    Sender,
};
use ::libc::{
    EBUSY,
    ESHUTDOWN,
};
use ::std::{
    sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
    thread,
    thread::JoinHandle,
    time::Duration,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Nap between completion polls.
const POLL_INTERVAL: Duration = Duration::from_micros(100);

//======================================================================================================================
// Structures
//======================================================================================================================

/// Operations accepted by the pass-through thread.
enum PtsOp {
    /// Run one command to completion.
    Submit(Arc<Command>),
    /// Shut the thread down.
    Stop,
}

/// Handle to the pass-through scheduler.
pub struct PtsScheduler {
    /// Operation outbox to the runner thread.
    tx: Sender<PtsOp>,
    /// The runner thread.
    thread: Option<JoinHandle<()>>,
    /// Commands submitted and not yet completed (0 or 1).
    live: Arc<AtomicUsize>,
}

/// State owned by the runner thread.
struct PtsLoop {
    /// Register access to the device.
    dev: DeviceHandle,
    /// The one CU this backend drives.
    cu: ComputeUnit,
    /// Operation inbox.
    rx: Receiver<PtsOp>,
    /// Shared with the handle.
    live: Arc<AtomicUsize>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

/// Associated Functions for the Pass-Through Scheduler
impl PtsScheduler {
    /// Starts the pass-through thread, driving the CU at the configured base
    /// address.
    pub fn new(dev: DeviceHandle, config: &Config) -> Result<Self, Fail> {
        let cu_addr: u32 = config.cu_base_addr()?;
        let (tx, rx): (Sender<PtsOp>, Receiver<PtsOp>) = crossbeam_channel::unbounded();
        let live: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
        let pts_loop: PtsLoop = PtsLoop {
            dev,
            cu: ComputeUnit::new(0, cu_addr),
            rx,
            live: live.clone(),
        };
        let thread: JoinHandle<()> = thread::Builder::new()
            .name("pts-scheduler".to_string())
            .spawn(move || pts_loop.run())
            .map_err(Fail::from)?;

        Ok(Self {
            tx,
            thread: Some(thread),
            live,
        })
    }

    /// Hands a command to the runner thread. Only one command may be in
    /// flight at a time.
    pub fn submit(&self, cmd: Arc<Command>) -> Result<(), Fail> {
        if self.live.fetch_add(1, Ordering::SeqCst) > 0 {
            self.live.fetch_sub(1, Ordering::SeqCst);
            let cause: &str = "pass-through backend runs one command at a time";
            error!("submit(): {}", cause);
            return Err(Fail::new(EBUSY, cause));
        }
        if self.tx.send(PtsOp::Submit(cmd)).is_err() {
            self.live.fetch_sub(1, Ordering::SeqCst);
            return Err(Fail::new(ESHUTDOWN, "scheduler thread is gone"));
        }
        Ok(())
    }

    /// Returns the number of commands in flight.
    pub fn num_live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Stops the runner thread. Fails while a command is in flight.
    pub fn stop(&mut self) -> Result<(), Fail> {
        if self.num_live() > 0 {
            let cause: &str = "a command is still in flight";
            error!("stop(): {}", cause);
            return Err(Fail::new(EBUSY, cause));
        }

        let _ = self.tx.send(PtsOp::Stop);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("stop(): pass-through thread panicked");
            }
        }
        Ok(())
    }
}

/// Associated Functions for the Pass-Through Loop
impl PtsLoop {
    /// Runs commands until stopped.
    fn run(mut self) {
        trace!("run(): pass-through scheduler up, cu at {:#x}", self.cu.addr());
        loop {
            match self.rx.recv() {
                Ok(PtsOp::Submit(cmd)) => self.execute(&cmd),
                Ok(PtsOp::Stop) | Err(_) => break,
            }
        }
        trace!("run(): pass-through scheduler down");
    }

    /// Runs one command to completion, blocking the loop.
    fn execute(&mut self, cmd: &Arc<Command>) {
        let buf: Arc<ExecBuf> = cmd.buf_handle();
        let header: u32 = buf.read_header();

        let state: CmdState = match packet::opcode_of(header) {
            Some(opcode) if opcode.starts_cu() => {
                buf.write_header(packet::with_state(header, CmdState::Running));
                self.cu.start(self.dev.as_ref(), &buf);
                while !self.cu.poll(self.dev.as_ref()) {
                    thread::sleep(POLL_INTERVAL);
                }
                CmdState::Completed
            },
            Some(Opcode::CuStat) => {
                buf.write(1, self.cu.usage());
                CmdState::Completed
            },
            // Remaining control commands have nothing to configure here.
            Some(opcode) if opcode.is_control() => CmdState::Completed,
            opcode => {
                error!("execute(): unsupported opcode {:?}", opcode);
                CmdState::Error
            },
        };

        buf.write_header(packet::with_state(buf.read_header(), state));
        self.live.fetch_sub(1, Ordering::SeqCst);
        cmd.notify(state);
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Drop Trait Implementation for the Pass-Through Scheduler
impl Drop for PtsScheduler {
    fn drop(&mut self) {
        if self.thread.is_some() {
            if let Err(e) = self.stop() {
                warn!("drop(): could not stop the scheduler: {:?}", e);
            }
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
