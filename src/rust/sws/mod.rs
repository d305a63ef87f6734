// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Software scheduler.
//!
//! A dedicated host thread owns the command queue and the CU models. Commands
//! arrive over a channel, walk the NEW, QUEUED, RUNNING states inside the
//! packet header, and complete through [Command::notify]. Control commands
//! short-circuit: they are fully handled while still NEW and never occupy a
//! CU.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod cu;
pub mod exec;

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
    sws::exec::ExecCore,
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

/// How long the scheduler thread naps between polling passes while commands
/// are in flight.
const POLL_INTERVAL: Duration = Duration::from_micros(100);

//======================================================================================================================
// Structures
//======================================================================================================================

/// Operations accepted by the scheduler thread.
enum SchedulerOp {
    /// Launch a command.
    Submit(Arc<Command>),
    /// Shut the scheduler thread down.
    Stop,
}

/// A command occupying a slot.
struct SlotEntry {
    /// The command itself.
    cmd: Arc<Command>,
    /// CU mask cached at the new to queued transition.
    mask: Bitmask,
    /// CU claimed for this command, set while RUNNING.
    cu: Option<usize>,
}

/// State owned by the scheduler thread.
struct SchedulerLoop {
    /// Allocators and CU models.
    core: ExecCore,
    /// One entry per slot; `None` marks a free slot.
    slots: Vec<Option<SlotEntry>>,
    /// Commands waiting for a free slot.
    pending: VecDeque<Arc<Command>>,
    /// Operation inbox.
    rx: Receiver<SchedulerOp>,
    /// Commands submitted and not yet completed, shared with the handle.
    live: Arc<AtomicUsize>,
    /// Set by an EXIT command; the loop drains and stops.
    exiting: bool,
}

/// Handle to the software scheduler.
pub struct SwsScheduler {
    /// Operation outbox to the scheduler thread.
    tx: Sender<SchedulerOp>,
    /// The scheduler thread.
    thread: Option<JoinHandle<()>>,
    /// Commands submitted and not yet completed.
    live: Arc<AtomicUsize>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

/// Associated Functions for the Software Scheduler
impl SwsScheduler {
    /// Starts the scheduler thread for `dev`.
    ///
    /// When the configuration names explicit CU geometry, the core is
    /// configured at start-up; otherwise the first CONFIGURE command installs
    /// the CU list.
    pub fn new(dev: DeviceHandle, config: &Config) -> Result<Self, Fail> {
        let num_slots: usize = config.num_slots()?;
        let mut core: ExecCore = ExecCore::new(dev, num_slots);
        if let Ok(Some(addrs)) = config.cu_addrs() {
            core.configure_from_addrs(&addrs);
        } else if let (Ok(num_cus), Ok(base), Ok(shift)) = (config.num_cus(), config.cu_base_addr(), config.cu_shift())
        {
            core.configure_from_geometry(num_cus, base, shift);
        }

        let (tx, rx): (Sender<SchedulerOp>, Receiver<SchedulerOp>) = crossbeam_channel::unbounded();
        let live: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
        let sched_loop: SchedulerLoop = SchedulerLoop {
            core,
            slots: (0..num_slots).map(|_| None).collect(),
            pending: VecDeque::new(),
            rx,
            live: live.clone(),
            exiting: false,
        };
        let thread: JoinHandle<()> = thread::Builder::new()
            .name("sws-scheduler".to_string())
            .spawn(move || sched_loop.run())
            .map_err(Fail::from)?;

        Ok(Self {
            tx,
            thread: Some(thread),
            live,
        })
    }

    /// Hands a command to the scheduler thread.
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

    /// Stops the scheduler thread. Fails while commands are in flight.
    pub fn stop(&mut self) -> Result<(), Fail> {
        if self.num_live() > 0 {
            let cause: &str = "commands are still in flight";
            error!("stop(): {}", cause);
            return Err(Fail::new(EBUSY, cause));
        }

        // A send error means the thread already exited on its own.
        let _ = self.tx.send(SchedulerOp::Stop);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("stop(): scheduler thread panicked");
            }
        }
        Ok(())
    }
}

/// Associated Functions for the Scheduler Loop
impl SchedulerLoop {
    /// Runs the scheduler until stopped.
    fn run(mut self) {
        trace!("run(): software scheduler up, {} slots", self.slots.len());
        loop {
            // Block for work when fully idle, otherwise just drain the inbox.
            if self.idle() {
                if self.exiting {
                    break;
                }
                match self.rx.recv() {
                    Ok(op) => {
                        if self.handle(op) {
                            break;
                        }
                    },
                    Err(_) => break,
                }
            }
            let mut stop: bool = false;
            loop {
                match self.rx.try_recv() {
                    Ok(op) => {
                        if self.handle(op) {
                            stop = true;
                            break;
                        }
                    },
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        self.exiting = true;
                        break;
                    },
                }
            }
            if stop {
                break;
            }

            self.pass();

            if !self.idle() {
                thread::sleep(POLL_INTERVAL);
            }
        }
        trace!("run(): software scheduler down");
    }

    /// Returns true if no command is held by the loop.
    fn idle(&self) -> bool {
        self.pending.is_empty() && self.slots.iter().all(Option::is_none)
    }

    /// Returns the number of commands held by the loop.
    fn num_held(&self) -> usize {
        self.pending.len() + self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Handles one inbox operation, returning true on stop.
    fn handle(&mut self, op: SchedulerOp) -> bool {
        match op {
            SchedulerOp::Submit(cmd) => {
                if self.exiting {
                    warn!("handle(): scheduler is exiting, rejecting command");
                    self.complete(&cmd, CmdState::Error);
                    return false;
                }
                self.admit(cmd);
                false
            },
            SchedulerOp::Stop => true,
        }
    }

    /// Places a command into a slot, or parks it until one frees up.
    fn admit(&mut self, cmd: Arc<Command>) {
        match self.core.acquire_slot() {
            Some(slot) => {
                self.slots[slot] = Some(SlotEntry {
                    cmd,
                    mask: Bitmask::new(),
                    cu: None,
                });
            },
            None => self.pending.push_back(cmd),
        }
    }

    /// One scheduling pass: admit parked commands, then advance every
    /// occupied slot one state at most (NEW commands may reach RUNNING in the
    /// same pass once queued).
    fn pass(&mut self) {
        while !self.pending.is_empty() {
            match self.core.acquire_slot() {
                Some(slot) => {
                    let cmd: Arc<Command> = self.pending.pop_front().expect("pending is nonempty");
                    self.slots[slot] = Some(SlotEntry {
                        cmd,
                        mask: Bitmask::new(),
                        cu: None,
                    });
                },
                None => break,
            }
        }

        for slot in 0..self.slots.len() {
            if let Some(entry) = self.slots[slot].take() {
                if let Some(entry) = self.step(slot, entry) {
                    self.slots[slot] = Some(entry);
                } else {
                    self.core.release_slot(slot);
                }
            }
        }
    }

    /// Advances one slot. Returns the entry if the command stays in the slot,
    /// `None` once it completed.
    fn step(&mut self, slot: usize, mut entry: SlotEntry) -> Option<SlotEntry> {
        let buf: Arc<ExecBuf> = entry.cmd.buf_handle();
        let header: u32 = buf.read_header();

        match packet::state_of(header) {
            Some(CmdState::New) => {
                if packet::type_of(header) != Some(CmdType::Cu) {
                    self.control(slot, &entry);
                    return None;
                }
                entry.mask = packet::cu_mask(&buf);
                buf.write_header(packet::with_state(header, CmdState::Queued));
                self.try_start(entry)
            },
            Some(CmdState::Queued) => self.try_start(entry),
            Some(CmdState::Running) => {
                let cu: usize = entry.cu.expect("running command must hold a cu");
                if self.core.poll_cu(cu) {
                    self.core.release_cu(cu);
                    self.complete(&entry.cmd, CmdState::Completed);
                    return None;
                }
                Some(entry)
            },
            _ => {
                error!("step(): slot {} holds a packet in an unexpected state {:#x}", slot, header);
                self.complete(&entry.cmd, CmdState::Error);
                None
            },
        }
    }

    /// Attempts the queued to running transition.
    fn try_start(&mut self, mut entry: SlotEntry) -> Option<SlotEntry> {
        if let Some(cu) = self.core.acquire_cu(&entry.mask) {
            let buf: Arc<ExecBuf> = entry.cmd.buf_handle();
            self.core.start_cu(cu, &buf);
            buf.write_header(packet::with_state(buf.read_header(), CmdState::Running));
            entry.cu = Some(cu);
        }
        Some(entry)
    }

    /// Handles a control command synchronously. The slot is freed by the
    /// caller.
    fn control(&mut self, slot: usize, entry: &SlotEntry) {
        let buf: Arc<ExecBuf> = entry.cmd.buf_handle();
        let state: CmdState = match packet::opcode_of(buf.read_header()) {
            Some(Opcode::Configure) => {
                // Reconfiguration under live traffic would yank CU models out
                // from under queued commands.
                if self.num_held() > 1 {
                    warn!("control(): rejecting CONFIGURE, other commands are in flight");
                    CmdState::Error
                } else {
                    match self.core.configure(&buf) {
                        Ok(()) => CmdState::Completed,
                        Err(e) => {
                            warn!("control(): configure failed: {:?}", e);
                            CmdState::Error
                        },
                    }
                }
            },
            Some(Opcode::CuStat) => {
                self.core.cu_stat(&buf);
                CmdState::Completed
            },
            Some(Opcode::InitCu) => {
                self.core.init_cus(&buf);
                CmdState::Completed
            },
            Some(Opcode::Abort) => {
                self.abort(buf.read(1) as usize);
                CmdState::Completed
            },
            Some(Opcode::Exit) => {
                self.exiting = true;
                CmdState::Completed
            },
            Some(Opcode::ClkCalib) | Some(Opcode::MbValidate) | Some(Opcode::AccessTestC) => CmdState::Completed,
            opcode => {
                error!("control(): slot {} holds an unhandled control opcode {:?}", slot, opcode);
                CmdState::Error
            },
        };
        self.complete(&entry.cmd, state);
    }

    /// Forces a RUNNING start-CU command in `target` through completion with
    /// the ABORT state. Anything else is treated as already handled.
    fn abort(&mut self, target: usize) {
        if target >= self.slots.len() {
            warn!("abort(): slot {} is out of range", target);
            return;
        }

        let running: bool = match self.slots[target] {
            Some(ref entry) => {
                let header: u32 = entry.cmd.buf().read_header();
                packet::state_of(header) == Some(CmdState::Running)
                    && packet::type_of(header) == Some(CmdType::Cu)
            },
            None => false,
        };
        if !running {
            debug!("abort(): slot {} holds no running command, nothing to do", target);
            return;
        }

        let entry: SlotEntry = self.slots[target].take().expect("target was just inspected");
        if let Some(cu) = entry.cu {
            self.core.abort_cu(cu);
        }
        self.core.release_slot(target);
        self.complete(&entry.cmd, CmdState::Abort);
    }

    /// Writes the final packet state and wakes the host side.
    fn complete(&mut self, cmd: &Arc<Command>, state: CmdState) {
        let buf: &ExecBuf = cmd.buf();
        buf.write_header(packet::with_state(buf.read_header(), state));
        self.live.fetch_sub(1, Ordering::SeqCst);
        cmd.notify(state);
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Drop Trait Implementation for the Software Scheduler
impl Drop for SwsScheduler {
    fn drop(&mut self) {
        // Completions still land while commands drain; only the handle goes
        // away. The thread exits once the channel disconnects and the last
        // command retires.
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

#[cfg(test)]
mod tests {
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
        sws::SwsScheduler,
        test_helpers::EmulatedDevice,
    };
    use ::std::sync::Arc;

    const CONFIG: &str = "
device:
    num_slots: 16
    slot_size: 4096
    num_cus: 2
    cu_base_addr: 0x400000
    cu_shift: 16
scheduler:
    mode: sws
    polling: true
";

    fn start_cu_command(mask: u32) -> Arc<Command> {
        let cmd: Command = Command::new(8);
        cmd.buf()
            .write_header(packet::make_header(CmdState::New, 5, Opcode::StartCu, CmdType::Cu));
        cmd.buf().write(1, mask);
        cmd
            .begin()
            .expect("fresh command must launch");
        Arc::new(cmd)
    }

    #[test]
    fn start_cu_runs_to_completion() {
        let dev: Arc<EmulatedDevice> = EmulatedDevice::with_cus(&[0x40_0000, 0x41_0000], 2);
        let config: Config = Config::from_str(CONFIG).unwrap();
        let mut sched: SwsScheduler = SwsScheduler::new(dev, &config).unwrap();

        let cmd: Arc<Command> = start_cu_command(0x1);
        sched.submit(cmd.clone()).unwrap();

        assert_eq!(cmd.wait().unwrap(), CmdState::Completed);
        assert_eq!(sched.num_live(), 0);
        sched.stop().unwrap();
    }

    #[test]
    fn stop_is_rejected_while_commands_fly() {
        let dev: Arc<EmulatedDevice> = EmulatedDevice::with_cus(&[0x40_0000, 0x41_0000], 1_000_000);
        let config: Config = Config::from_str(CONFIG).unwrap();
        let mut sched: SwsScheduler = SwsScheduler::new(dev.clone(), &config).unwrap();

        let cmd: Arc<Command> = start_cu_command(0x1);
        sched.submit(cmd.clone()).unwrap();

        match sched.stop() {
            Ok(()) => panic!("stop must be rejected while a command is live"),
            Err(e) => assert_eq!(e.errno, libc::EBUSY),
        }

        // Let the run finish so drop can stop the thread.
        dev.finish_cus();
        cmd.wait().unwrap();
        sched.stop().unwrap();
    }
}
