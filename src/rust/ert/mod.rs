// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Embedded scheduler, host side.
//!
//! Commands are copied into the device-resident command queue and picked up
//! by the scheduler firmware; completions come back through the read-to-clear
//! status registers. The host never walks CU registers in this mode, it only
//! talks to the queue.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod firmware;
pub mod queue;

pub use self::{
    firmware::Firmware,
    queue::CommandQueue,
};

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    accel::config::Config,
    command::Command,
    packet,
    packet::{
        opcode::{
            CmdType,
            Opcode,
        },
        state::CmdState,
    },
    runtime::{
        bitset::Bitmask,
        fail::Fail,
        memory::ExecBuf,
        register::DeviceHandle,
    },
};
use ::crossbeam_channel::{
    Receiver,
    Sender,
    TryRecvError,
};
use ::libc::{
    EBUSY,
    ESHUTDOWN,
};
use ::std::{
    collections::VecDeque,
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

/// Nap between harvest passes while commands are in flight.
const POLL_INTERVAL: Duration = Duration::from_micros(100);

/// How many harvest passes the shutdown path grants the firmware to
/// acknowledge an EXIT command before giving up.
const EXIT_POLLS: usize = 1_000;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Operations accepted by the submitter thread.
enum SchedulerOp {
    /// Hand a command to the firmware.
    Submit(Arc<Command>),
    /// Tell the firmware to exit and shut the thread down.
    Stop,
}

/// State owned by the submitter thread.
struct ErtLoop {
    /// The device-resident queue.
    queue: CommandQueue,
    /// Host command behind each occupied slot.
    inflight: Vec<Option<Arc<Command>>>,
    /// Commands waiting for a free slot.
    pending: VecDeque<Arc<Command>>,
    /// Operation inbox.
    rx: Receiver<SchedulerOp>,
    /// Commands submitted and not yet completed, shared with the handle.
    live: Arc<AtomicUsize>,
}

/// Handle to the embedded scheduler.
pub struct ErtScheduler {
    /// Operation outbox to the submitter thread.
    tx: Sender<SchedulerOp>,
    /// The submitter thread.
    thread: Option<JoinHandle<()>>,
    /// Commands submitted and not yet completed.
    live: Arc<AtomicUsize>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

/// Associated Functions for the Embedded Scheduler
impl ErtScheduler {
    /// Starts the submitter thread for `dev`.
    pub fn new(dev: DeviceHandle, config: &Config) -> Result<Self, Fail> {
        let num_slots: usize = config.num_slots()?;
        let slot_size: u32 = config.slot_size()?;
        let doorbell: bool = config.cq_int()?;

        let (tx, rx): (Sender<SchedulerOp>, Receiver<SchedulerOp>) = crossbeam_channel::unbounded();
        let live: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
        let ert_loop: ErtLoop = ErtLoop {
            queue: CommandQueue::new(dev, num_slots, slot_size, doorbell),
            inflight: (0..num_slots).map(|_| None).collect(),
            pending: VecDeque::new(),
            rx,
            live: live.clone(),
        };
        let thread: JoinHandle<()> = thread::Builder::new()
            .name("ert-scheduler".to_string())
            .spawn(move || ert_loop.run())
            .map_err(Fail::from)?;

        Ok(Self {
            tx,
            thread: Some(thread),
            live,
        })
    }

    /// Hands a command to the submitter thread.
    pub fn submit(&self, cmd: Arc<Command>) -> Result<(), Fail> {
        self.live.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(SchedulerOp::Submit(cmd)).is_err() {
            self.live.fetch_sub(1, Ordering::SeqCst);
            return Err(Fail::new(ESHUTDOWN, "scheduler thread is gone"));
        }
        Ok(())
    }

    /// Returns the number of commands in flight.
    pub fn num_live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Stops the submitter thread, telling the firmware to exit first. Fails
    /// while commands are in flight.
    pub fn stop(&mut self) -> Result<(), Fail> {
        if self.num_live() > 0 {
            let cause: &str = "commands are still in flight";
            error!("stop(): {}", cause);
            return Err(Fail::new(EBUSY, cause));
        }

        let _ = self.tx.send(SchedulerOp::Stop);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("stop(): scheduler thread panicked");
            }
        }
        Ok(())
    }
}

/// Associated Functions for the Submitter Loop
impl ErtLoop {
    /// Runs the submitter until stopped.
    fn run(mut self) {
        trace!("run(): embedded scheduler up, {} slots", self.queue.num_slots());
        loop {
            if self.idle() {
                match self.rx.recv() {
                    Ok(SchedulerOp::Submit(cmd)) => self.admit(cmd),
                    Ok(SchedulerOp::Stop) => break,
                    Err(_) => break,
                }
            }
            let mut stop: bool = false;
            loop {
                match self.rx.try_recv() {
                    Ok(SchedulerOp::Submit(cmd)) => self.admit(cmd),
                    Ok(SchedulerOp::Stop) => {
                        stop = true;
                        break;
                    },
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        stop = true;
                        break;
                    },
                }
            }
            if stop {
                break;
            }

            self.submit_pending();
            self.reap();

            if !self.idle() {
                thread::sleep(POLL_INTERVAL);
            }
        }
        self.shutdown();
        trace!("run(): embedded scheduler down");
    }

    /// Returns true if no command is held by the loop.
    fn idle(&self) -> bool {
        self.pending.is_empty() && self.inflight.iter().all(Option::is_none)
    }

    fn admit(&mut self, cmd: Arc<Command>) {
        self.pending.push_back(cmd);
    }

    /// Copies parked commands into free queue slots, in arrival order.
    fn submit_pending(&mut self) {
        while let Some(cmd) = self.pending.pop_front() {
            let ctrl: bool = packet::type_of(cmd.buf().read_header()) != Some(CmdType::Cu);
            match self.queue.acquire_slot(ctrl) {
                Ok(slot) => {
                    self.queue.write_command(slot, cmd.buf());
                    self.inflight[slot] = Some(cmd);
                },
                Err(_) => {
                    // Backpressure, retry next pass.
                    self.pending.push_front(cmd);
                    break;
                },
            }
        }
    }

    /// Harvests completion bits and retires the commands behind them.
    fn reap(&mut self) {
        let completed: Bitmask = self.queue.harvest();
        if completed.none() {
            return;
        }

        for slot in completed.iter() {
            let cmd: Arc<Command> = match self.inflight.get_mut(slot).and_then(Option::take) {
                Some(cmd) => cmd,
                None => {
                    warn!("reap(): completion bit for empty slot {}", slot);
                    continue;
                },
            };

            let buf: Arc<ExecBuf> = cmd.buf_handle();
            let header: u32 = buf.read_header();
            let state: CmdState = self.queue.slot_state(slot).unwrap_or(CmdState::Error);
            // Commands that answer in place carry their response back to the
            // host buffer before completion is visible.
            if packet::opcode_of(header) == Some(Opcode::CuStat) {
                self.queue.read_payload(slot, &buf, packet::count(header) as usize);
            }
            self.queue.release_slot(slot);

            buf.write_header(packet::with_state(header, state));
            self.live.fetch_sub(1, Ordering::SeqCst);
            cmd.notify(state);
        }
    }

    /// Asks the firmware to exit and waits briefly for the acknowledgment.
    fn shutdown(&mut self) {
        let slot: usize = match self.queue.acquire_slot(true) {
            Ok(slot) => slot,
            Err(_) => {
                warn!("shutdown(): control slot is busy, leaving the firmware running");
                return;
            },
        };

        let exit: ExecBuf = ExecBuf::new(1);
        exit.write_header(packet::make_header(CmdState::New, 0, Opcode::Exit, CmdType::Ctrl));
        self.queue.write_command(slot, &exit);

        for _ in 0..EXIT_POLLS {
            if self.queue.harvest().test(slot) {
                self.queue.release_slot(slot);
                return;
            }
            thread::sleep(POLL_INTERVAL);
        }
        warn!("shutdown(): firmware did not acknowledge the exit command");
        self.queue.release_slot(slot);
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Drop Trait Implementation for the Embedded Scheduler
impl Drop for ErtScheduler {
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
