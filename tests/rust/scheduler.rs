// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! End-to-end scheduling behavior of the host backends.

use ::accelrt::{
    accel::{
        Accelerator,
        Config,
    },
    command::registry::CmdDesc,
    ert::queue::CommandQueue,
    packet,
    packet::{
        CmdState,
        CmdType,
        Opcode,
    },
    test_helpers::EmulatedDevice,
};
use ::std::{
    sync::Arc,
    thread,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

const CU_BASE: u32 = 0x40_0000;
const CU_SHIFT: u32 = 16;
const NUM_CUS: usize = 6;

/// A delay long enough that a CU never finishes on its own within a test.
const STUCK: u32 = 1_000_000_000;

const SWS_CONFIG: &str = "
device:
    num_slots: 16
    slot_size: 4096
    num_cus: 6
    cu_base_addr: 0x400000
    cu_shift: 16
scheduler:
    mode: sws
    polling: true
";

//======================================================================================================================
// Helpers
//======================================================================================================================

fn cu_addrs() -> Vec<u32> {
    (0..NUM_CUS).map(|idx| CU_BASE + ((idx as u32) << CU_SHIFT)).collect()
}

fn context(delay: u32) -> (Arc<EmulatedDevice>, Accelerator) {
    let dev: Arc<EmulatedDevice> = EmulatedDevice::with_cus(&cu_addrs(), delay);
    let mut accel: Accelerator = Accelerator::new(dev.clone(), Config::from_str(SWS_CONFIG).unwrap()).unwrap();
    accel.init().unwrap();
    (dev, accel)
}

/// Creates a START_CU command with the given CU mask.
fn start_cu(accel: &mut Accelerator, mask: u32) -> CmdDesc {
    let desc: CmdDesc = accel.create_command(8);
    let cmd = accel.command(desc).unwrap();
    cmd.buf()
        .write_header(packet::make_header(CmdState::New, 5, Opcode::StartCu, CmdType::Cu));
    cmd.buf().write(1, mask);
    desc
}

/// Reads every CU usage counter through a CU_STAT command.
fn usages(accel: &mut Accelerator) -> Vec<u32> {
    let desc: CmdDesc = accel.create_command(1 + NUM_CUS);
    accel
        .command(desc)
        .unwrap()
        .buf()
        .write_header(packet::make_header(CmdState::New, NUM_CUS as u32, Opcode::CuStat, CmdType::Ctrl));
    accel.schedule(desc).unwrap();
    assert_eq!(accel.wait(desc).unwrap(), CmdState::Completed);

    let cmd = accel.command(desc).unwrap();
    let result: Vec<u32> = (0..NUM_CUS).map(|idx| cmd.buf().read(1 + idx)).collect();
    accel.close_command(desc).unwrap();
    result
}

/// Spins until the command reaches `state`.
fn wait_for_state(accel: &Accelerator, desc: CmdDesc, state: CmdState) {
    let deadline: Instant = Instant::now() + Duration::from_secs(5);
    loop {
        if accel.state(desc).unwrap() == state {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {:?}", state);
        thread::sleep(Duration::from_millis(1));
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

/// A command masked to {CU2, CU5} with both idle lands on CU2, the lowest
/// eligible index, and only CU2's usage counter moves.
#[test]
fn lowest_eligible_cu_wins() {
    let (_dev, mut accel) = context(2);

    let desc: CmdDesc = start_cu(&mut accel, (1 << 2) | (1 << 5));
    accel.schedule(desc).unwrap();
    assert_eq!(accel.wait(desc).unwrap(), CmdState::Completed);

    let usage: Vec<u32> = usages(&mut accel);
    assert_eq!(usage[2], 1);
    assert_eq!(usage[5], 0);
    assert_eq!(usage[0], 0);

    accel.close_command(desc).unwrap();
    accel.stop().unwrap();
}

/// A command whose only masked CU is busy stays QUEUED, then moves to RUNNING
/// once the CU frees up, without an intervening completion.
#[test]
fn command_stalls_queued_until_a_cu_frees_up() {
    let (dev, mut accel) = context(STUCK);

    let hog: CmdDesc = start_cu(&mut accel, 1 << 3);
    accel.schedule(hog).unwrap();
    wait_for_state(&accel, hog, CmdState::Running);

    let stalled: CmdDesc = start_cu(&mut accel, 1 << 3);
    accel.schedule(stalled).unwrap();
    wait_for_state(&accel, stalled, CmdState::Queued);

    // Several scheduling passes later it is still queued.
    thread::sleep(Duration::from_millis(5));
    assert_eq!(accel.state(stalled).unwrap(), CmdState::Queued);

    // Free the CU: the hog completes and the stalled command starts.
    dev.finish_cus();
    assert_eq!(accel.wait(hog).unwrap(), CmdState::Completed);
    wait_for_state(&accel, stalled, CmdState::Running);

    dev.finish_cus();
    assert_eq!(accel.wait(stalled).unwrap(), CmdState::Completed);
    accel.close_command(hog).unwrap();
    accel.close_command(stalled).unwrap();
    accel.stop().unwrap();
}

/// CONFIGURE while another command is in flight is rejected and leaves the
/// existing configuration working.
#[test]
fn configure_under_traffic_is_rejected() {
    let (dev, mut accel) = context(STUCK);

    let hog: CmdDesc = start_cu(&mut accel, 1 << 0);
    accel.schedule(hog).unwrap();
    wait_for_state(&accel, hog, CmdState::Running);

    let configure: CmdDesc = accel.create_command(16);
    {
        let cmd = accel.command(configure).unwrap();
        cmd.buf()
            .write_header(packet::make_header(CmdState::New, 6, Opcode::Configure, CmdType::Ctrl));
        cmd.buf().write(1, 4096); // slot size
        cmd.buf().write(2, 1); // one cu
        cmd.buf().write(3, CU_SHIFT);
        cmd.buf().write(4, CU_BASE);
        cmd.buf().write(6, CU_BASE);
    }
    accel.schedule(configure).unwrap();
    assert_eq!(accel.wait(configure).unwrap(), CmdState::Error);

    // The prior configuration still schedules onto all six CUs.
    dev.finish_cus();
    accel.wait(hog).unwrap();
    let late: CmdDesc = start_cu(&mut accel, 1 << 5);
    accel.schedule(late).unwrap();
    wait_for_state(&accel, late, CmdState::Running);
    dev.finish_cus();
    assert_eq!(accel.wait(late).unwrap(), CmdState::Completed);

    accel.close_command(hog).unwrap();
    accel.close_command(configure).unwrap();
    accel.close_command(late).unwrap();
    accel.stop().unwrap();
}

/// ABORT forces a running command through completion with the ABORT state;
/// aborting a slot that already completed is a no-op.
#[test]
fn abort_hits_running_commands_only() {
    let (dev, mut accel) = context(STUCK);

    // First submission lands in slot 0.
    let victim: CmdDesc = start_cu(&mut accel, 1 << 0);
    accel.schedule(victim).unwrap();
    wait_for_state(&accel, victim, CmdState::Running);

    let abort: CmdDesc = accel.create_command(4);
    {
        let cmd = accel.command(abort).unwrap();
        cmd.buf()
            .write_header(packet::make_header(CmdState::New, 1, Opcode::Abort, CmdType::Ctrl));
        cmd.buf().write(1, 0); // target slot
    }
    accel.schedule(abort).unwrap();
    assert_eq!(accel.wait(abort).unwrap(), CmdState::Completed);
    assert_eq!(accel.wait(victim).unwrap(), CmdState::Abort);

    // Aborting the same slot again is a no-op: the retired command keeps its
    // recorded state and the CU is reusable.
    let again: CmdDesc = accel.create_command(4);
    {
        let cmd = accel.command(again).unwrap();
        cmd.buf()
            .write_header(packet::make_header(CmdState::New, 1, Opcode::Abort, CmdType::Ctrl));
        cmd.buf().write(1, 0);
    }
    accel.schedule(again).unwrap();
    assert_eq!(accel.wait(again).unwrap(), CmdState::Completed);
    assert_eq!(accel.state(victim).unwrap(), CmdState::Abort);

    let late: CmdDesc = start_cu(&mut accel, 1 << 0);
    accel.schedule(late).unwrap();
    wait_for_state(&accel, late, CmdState::Running);
    dev.finish_cus();
    assert_eq!(accel.wait(late).unwrap(), CmdState::Completed);

    for desc in [victim, abort, again, late] {
        accel.close_command(desc).unwrap();
    }
    accel.stop().unwrap();
}

/// A live command cannot be scheduled twice; the first run is untouched.
#[test]
fn double_schedule_is_rejected() {
    let (dev, mut accel) = context(STUCK);

    let desc: CmdDesc = start_cu(&mut accel, 1 << 1);
    accel.schedule(desc).unwrap();
    wait_for_state(&accel, desc, CmdState::Running);

    match accel.schedule(desc) {
        Ok(()) => panic!("double submission must be rejected"),
        Err(e) => assert_eq!(e.errno, libc::EBUSY),
    }
    assert_eq!(accel.state(desc).unwrap(), CmdState::Running);

    dev.finish_cus();
    assert_eq!(accel.wait(desc).unwrap(), CmdState::Completed);
    accel.close_command(desc).unwrap();
    accel.stop().unwrap();
}

/// Completion callbacks fire with the final state, including for callbacks
/// registered after completion.
#[test]
fn callbacks_fire_with_the_final_state() {
    let (_dev, mut accel) = context(1);

    let desc: CmdDesc = start_cu(&mut accel, 1 << 0);
    let (tx, rx) = ::std::sync::mpsc::channel::<CmdState>();
    accel
        .add_callback(desc, move |state| tx.send(state).unwrap())
        .unwrap();

    accel.schedule(desc).unwrap();
    assert_eq!(accel.wait(desc).unwrap(), CmdState::Completed);
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), CmdState::Completed);

    // Late registration sees the same state, immediately.
    let (tx2, rx2) = ::std::sync::mpsc::channel::<CmdState>();
    accel
        .add_callback(desc, move |state| tx2.send(state).unwrap())
        .unwrap();
    assert_eq!(rx2.try_recv().unwrap(), CmdState::Completed);

    accel.close_command(desc).unwrap();
    accel.stop().unwrap();
}

/// The slot allocator of the device-resident queue never hands the same slot
/// to two owners.
#[test]
fn queue_slots_are_exclusive() {
    let dev: Arc<EmulatedDevice> = EmulatedDevice::with_cus(&[], 1);
    let mut queue: CommandQueue = CommandQueue::new(dev, 16, 4096, false);

    let mut held: Vec<usize> = Vec::new();
    for _ in 0..15 {
        let slot: usize = queue.acquire_slot(false).unwrap();
        assert!(!held.contains(&slot), "slot {} handed out twice", slot);
        held.push(slot);
    }
    assert!(queue.acquire_slot(false).is_err());

    // Interleave releases and re-acquisitions.
    for _ in 0..32 {
        let slot: usize = held.remove(0);
        queue.release_slot(slot);
        let again: usize = queue.acquire_slot(false).unwrap();
        assert!(!held.contains(&again), "slot {} handed out twice", again);
        held.push(again);
    }
}

/// The pass-through backend drives a kernel end to end through the facade.
#[test]
fn pass_through_backend_via_the_facade() {
    const PTS_CONFIG: &str = "
device:
    num_slots: 1
    slot_size: 4096
    num_cus: 1
    cu_base_addr: 0x400000
    cu_shift: 16
scheduler:
    mode: pts
";
    let dev: Arc<EmulatedDevice> = EmulatedDevice::with_cus(&[CU_BASE], 2);
    let mut accel: Accelerator = Accelerator::new(dev, Config::from_str(PTS_CONFIG).unwrap()).unwrap();
    accel.init().unwrap();
    accel.init().unwrap(); // idempotent

    let desc: CmdDesc = accel.create_command(8);
    accel
        .command(desc)
        .unwrap()
        .buf()
        .write_header(packet::make_header(CmdState::New, 5, Opcode::StartCu, CmdType::Cu));
    accel.schedule(desc).unwrap();
    assert_eq!(accel.wait(desc).unwrap(), CmdState::Completed);

    accel.close_command(desc).unwrap();
    accel.stop().unwrap();
    accel.stop().unwrap(); // idempotent
}
