// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod registry;

pub use self::registry::{
    CmdDesc,
    CommandRegistry,
};

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    packet,
    packet::state::CmdState,
    runtime::{
        fail::Fail,
        memory::ExecBuf,
    },
};
use ::libc::{
    EBADMSG,
    EBUSY,
    EPROTO,
};
use ::std::{
    sync::{
        Arc,
        Condvar,
        Mutex,
        MutexGuard,
    },
    time::Duration,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Completion callback invoked with the final command state.
pub type Callback = Arc<dyn Fn(CmdState) + Send + Sync>;

/// Run state of a command object, independent of the packet state nibble.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum RunState {
    /// Never handed to a backend, or recycled after completion.
    Idle,
    /// Handed to a backend and not yet notified complete.
    Live,
    /// Notified complete; packet holds the final state.
    Done,
}

/// State protected by the per-command lock.
struct Inner {
    /// Run state of the current (or last) run.
    run: RunState,
    /// Completion callbacks in registration order.
    callbacks: Vec<Callback>,
}

/// Host-side command object.
///
/// Wraps one packet buffer together with the waitable completion state every
/// backend reports into. The command lock is private to this object so that
/// blocked waiters never contend with the scheduler-wide lock.
pub struct Command {
    /// Packet buffer.
    buf: Arc<ExecBuf>,
    /// Completion state and callbacks.
    inner: Mutex<Inner>,
    /// Signaled when the command completes.
    exec_done: Condvar,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

/// Associated Functions for Commands
impl Command {
    /// Creates an idle command backed by a zeroed packet buffer of `capacity` words.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Arc::new(ExecBuf::new(capacity)),
            inner: Mutex::new(Inner {
                run: RunState::Idle,
                callbacks: Vec::new(),
            }),
            exec_done: Condvar::new(),
        }
    }

    /// Returns the packet buffer of this command.
    pub fn buf(&self) -> &ExecBuf {
        &self.buf
    }

    /// Returns a shared handle to the packet buffer of this command.
    pub fn buf_handle(&self) -> Arc<ExecBuf> {
        self.buf.clone()
    }

    /// Returns the current packet state of this command.
    pub fn state(&self) -> Result<CmdState, Fail> {
        match packet::state_of(self.buf.read_header()) {
            Some(state) => Ok(state),
            None => Err(Fail::new(EBADMSG, "packet does not carry a valid state")),
        }
    }

    /// Marks the start of a new run, flipping the packet state to NEW.
    ///
    /// Fails if a previous run has not completed yet; the live run is left
    /// untouched.
    pub fn begin(&self) -> Result<(), Fail> {
        let mut inner: MutexGuard<Inner> = self.lock();
        if inner.run == RunState::Live {
            let cause: &str = "command is still running, cannot launch again";
            error!("begin(): {}", cause);
            return Err(Fail::new(EBUSY, cause));
        }
        inner.run = RunState::Live;
        self.buf.write_header(packet::with_state(self.buf.read_header(), CmdState::New));
        Ok(())
    }

    /// Registers a completion callback.
    ///
    /// If the command has already completed, the new callback (and only the
    /// new callback) is invoked immediately with the final state, outside the
    /// command lock. A completed command whose packet does not carry a
    /// terminal state indicates a scheduler bug and is reported as a failure.
    pub fn add_callback<F>(&self, callback: F) -> Result<(), Fail>
    where
        F: Fn(CmdState) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        let completed: Option<CmdState> = {
            let mut inner: MutexGuard<Inner> = self.lock();
            inner.callbacks.push(callback.clone());
            if inner.run == RunState::Done {
                match packet::state_of(self.buf.read_header()) {
                    Some(state) if state.is_terminal() => Some(state),
                    _ => {
                        let cause: &str = "command is done but packet state is not terminal";
                        error!("add_callback(): {}", cause);
                        return Err(Fail::new(EPROTO, cause));
                    },
                }
            } else {
                None
            }
        };

        // The lock must not be held while running the callback.
        if let Some(state) = completed {
            callback(state);
        }
        Ok(())
    }

    /// Blocks the calling thread until the command completes and returns the
    /// final packet state. Returns immediately if the command is not live.
    pub fn wait(&self) -> Result<CmdState, Fail> {
        let mut inner: MutexGuard<Inner> = self.lock();
        while inner.run == RunState::Live {
            inner = self
                .exec_done
                .wait(inner)
                .expect("command lock poisoned");
        }
        drop(inner);
        self.state()
    }

    /// Blocks the calling thread until the command completes or `timeout`
    /// elapses. A timeout returns the TIMEOUT sentinel without altering the
    /// command; the caller may wait again or abort.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<CmdState, Fail> {
        let mut inner: MutexGuard<Inner> = self.lock();
        while inner.run == RunState::Live {
            let (guard, result) = self
                .exec_done
                .wait_timeout(inner, timeout)
                .expect("command lock poisoned");
            inner = guard;
            if result.timed_out() && inner.run == RunState::Live {
                return Ok(CmdState::Timeout);
            }
        }
        drop(inner);
        self.state()
    }

    /// Backend-only completion entry point.
    ///
    /// Non-terminal states are ignored. A terminal state marks the command
    /// done, wakes all waiters, and then invokes every registered callback in
    /// registration order, outside the command lock. A command can only ever
    /// be live on one backend, so concurrent notifications indicate a
    /// corrupted state machine and panic.
    pub fn notify(&self, state: CmdState) {
        if !state.is_terminal() {
            return;
        }

        let callbacks: Vec<Callback> = {
            let mut inner: MutexGuard<Inner> = self.lock();
            assert!(inner.run != RunState::Done, "command notified twice");
            inner.run = RunState::Done;
            self.exec_done.notify_all();
            inner.callbacks.clone()
        };

        for callback in callbacks.iter() {
            callback(state);
        }
    }

    /// Rolls back a run that never reached a backend, making the command
    /// launchable again. No waiter can be blocked on the run yet because the
    /// descriptor has not been returned to the caller.
    pub(crate) fn rollback(&self) {
        let mut inner: MutexGuard<Inner> = self.lock();
        if inner.run == RunState::Live {
            inner.run = RunState::Idle;
        }
    }

    /// Returns true if a run is in flight.
    pub fn is_live(&self) -> bool {
        self.lock().run == RunState::Live
    }

    fn lock(&self) -> MutexGuard<Inner> {
        self.inner.lock().expect("command lock poisoned")
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use crate::{
        command::Command,
        packet,
        packet::{
            opcode::{
                CmdType,
                Opcode,
            },
            state::CmdState,
        },
    };
    use ::std::sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
    };
    use ::std::time::Duration;

    fn start_cu_command() -> Command {
        let cmd: Command = Command::new(8);
        cmd.buf()
            .write_header(packet::make_header(CmdState::New, 5, Opcode::StartCu, CmdType::Cu));
        cmd
    }

    #[test]
    fn double_submit_is_rejected() {
        let cmd: Command = start_cu_command();

        cmd.begin().expect("first run must launch");
        match cmd.begin() {
            Ok(()) => panic!("second run must be rejected while live"),
            Err(e) => assert_eq!(e.errno, libc::EBUSY),
        }

        // The live run is untouched.
        assert!(cmd.is_live());
        assert_eq!(cmd.state().unwrap(), CmdState::New);
    }

    #[test]
    fn notify_wakes_waiters_and_runs_callbacks_in_order() {
        let cmd: Arc<Command> = Arc::new(start_cu_command());
        let order: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));

        let first: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
        let second: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
        {
            let (order, first) = (order.clone(), first.clone());
            cmd.add_callback(move |_| first.store(order.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst))
                .unwrap();
        }
        {
            let (order, second) = (order.clone(), second.clone());
            cmd.add_callback(move |_| second.store(order.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst))
                .unwrap();
        }

        cmd.begin().unwrap();
        let buf = cmd.buf();
        buf.write_header(packet::with_state(buf.read_header(), CmdState::Completed));
        cmd.notify(CmdState::Completed);

        assert_eq!(cmd.wait().unwrap(), CmdState::Completed);
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn late_callback_fires_once_with_final_state() {
        let cmd: Command = start_cu_command();
        let early_calls: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
        {
            let early_calls = early_calls.clone();
            cmd.add_callback(move |_| {
                early_calls.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        cmd.begin().unwrap();
        cmd.buf()
            .write_header(packet::with_state(cmd.buf().read_header(), CmdState::Error));
        cmd.notify(CmdState::Error);
        assert_eq!(early_calls.load(Ordering::SeqCst), 1);

        // Registering after completion invokes only the new callback.
        let late_calls: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
        {
            let late_calls = late_calls.clone();
            cmd.add_callback(move |state| {
                assert_eq!(state, CmdState::Error);
                late_calls.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        assert_eq!(late_calls.load(Ordering::SeqCst), 1);
        assert_eq!(early_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn done_command_with_live_packet_state_is_a_fault() {
        let cmd: Command = start_cu_command();
        cmd.begin().unwrap();
        // Backend forgets to write a terminal state into the packet.
        cmd.notify(CmdState::Completed);

        match cmd.add_callback(|_| ()) {
            Ok(()) => panic!("inconsistent command must be reported"),
            Err(e) => assert_eq!(e.errno, libc::EPROTO),
        }
    }

    #[test]
    fn non_terminal_notify_is_ignored() {
        let cmd: Command = start_cu_command();
        cmd.begin().unwrap();
        cmd.notify(CmdState::Running);
        assert!(cmd.is_live());
    }

    #[test]
    fn timed_wait_returns_sentinel_and_leaves_command_live() {
        let cmd: Command = start_cu_command();
        cmd.begin().unwrap();

        let state: CmdState = cmd.wait_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(state, CmdState::Timeout);
        assert!(cmd.is_live());
        assert_eq!(cmd.state().unwrap(), CmdState::New);
    }
}
