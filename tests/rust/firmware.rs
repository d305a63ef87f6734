// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Host-to-firmware integration over the emulated device.

use ::accelrt::{
    accel::Config,
    command::Command,
    ert::{
        ErtScheduler,
        Firmware,
    },
    packet,
    packet::{
        configure::ConfigurePayload,
        CmdState,
        CmdType,
        Opcode,
    },
    test_helpers::EmulatedDevice,
};
use ::std::{
    sync::Arc,
    thread,
    thread::JoinHandle,
};

//======================================================================================================================
// Constants
//======================================================================================================================

const CU_BASE: u32 = 0x40_0000;
const CU_SHIFT: u32 = 12;

const CONFIG: &str = "
device:
    num_slots: 64
    slot_size: 1024
    num_cus: 128
    cu_base_addr: 0x400000
    cu_shift: 12
scheduler:
    mode: ert
";

const CONFIG_DOORBELL: &str = "
device:
    num_slots: 64
    slot_size: 1024
    num_cus: 1
    cu_base_addr: 0x400000
    cu_shift: 12
scheduler:
    mode: ert
    cq_int: true
";

//======================================================================================================================
// Helpers
//======================================================================================================================

fn cu_addrs(num_cus: usize) -> Vec<u32> {
    (0..num_cus).map(|idx| CU_BASE + ((idx as u32) << CU_SHIFT)).collect()
}

fn spawn_firmware(dev: Arc<EmulatedDevice>) -> JoinHandle<()> {
    let mut fw: Firmware = Firmware::new(dev);
    thread::spawn(move || fw.run())
}

fn configure_command(num_cus: usize, features: impl Fn(&mut ConfigurePayload)) -> Arc<Command> {
    let cmd: Command = Command::new(8 + num_cus);
    let mut payload: ConfigurePayload = ConfigurePayload::new(1024, CU_SHIFT, CU_BASE, cu_addrs(num_cus));
    features(&mut payload);
    let count: u32 = payload.write_to(cmd.buf());
    cmd.buf()
        .write_header(packet::make_header(CmdState::New, count, Opcode::Configure, CmdType::Ctrl));
    cmd.begin().unwrap();
    Arc::new(cmd)
}

/// Creates a START_CU command whose four mask words name exactly `cu`.
fn start_single_cu(cu: usize) -> Arc<Command> {
    let cmd: Command = Command::new(16);
    let header: u32 = packet::make_header(CmdState::New, 8, Opcode::StartCu, CmdType::Cu);
    cmd.buf().write_header(packet::with_extra_cu_masks(header, 3));
    cmd.buf().write(1 + (cu >> 5), 1 << (cu & 31));
    cmd.begin().unwrap();
    Arc::new(cmd)
}

fn cu_stat_command(num_cus: usize) -> Arc<Command> {
    let cmd: Command = Command::new(1 + num_cus);
    cmd.buf()
        .write_header(packet::make_header(CmdState::New, num_cus as u32, Opcode::CuStat, CmdType::Ctrl));
    cmd.begin().unwrap();
    Arc::new(cmd)
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

/// 128 commands with distinct single-CU masks across a 128-CU fabric: every
/// one completes and every usage counter lands on exactly 1.
#[test]
fn every_cu_runs_exactly_once() {
    const NUM_CUS: usize = 128;
    let dev: Arc<EmulatedDevice> = EmulatedDevice::with_cus(&cu_addrs(NUM_CUS), 1);
    let pump: JoinHandle<()> = spawn_firmware(dev.clone());
    let mut sched: ErtScheduler = ErtScheduler::new(dev, &Config::from_str(CONFIG).unwrap()).unwrap();

    let configure: Arc<Command> = configure_command(NUM_CUS, |_| ());
    sched.submit(configure.clone()).unwrap();
    assert_eq!(configure.wait().unwrap(), CmdState::Completed);

    let commands: Vec<Arc<Command>> = (0..NUM_CUS).map(start_single_cu).collect();
    for cmd in &commands {
        sched.submit(cmd.clone()).unwrap();
    }
    let mut completions: usize = 0;
    for cmd in &commands {
        assert_eq!(cmd.wait().unwrap(), CmdState::Completed);
        completions += 1;
    }
    assert_eq!(completions, NUM_CUS);

    let stat: Arc<Command> = cu_stat_command(NUM_CUS);
    sched.submit(stat.clone()).unwrap();
    assert_eq!(stat.wait().unwrap(), CmdState::Completed);
    for cu in 0..NUM_CUS {
        assert_eq!(stat.buf().read(1 + cu), 1, "cu {} usage", cu);
    }

    sched.stop().unwrap();
    pump.join().unwrap();
}

/// With the new-command doorbell enabled the firmware only fetches announced
/// slots, and the round trip still completes.
#[test]
fn doorbell_driven_submission_completes() {
    let dev: Arc<EmulatedDevice> = EmulatedDevice::with_cus(&cu_addrs(1), 2);
    let pump: JoinHandle<()> = spawn_firmware(dev.clone());
    let mut sched: ErtScheduler = ErtScheduler::new(dev, &Config::from_str(CONFIG_DOORBELL).unwrap()).unwrap();

    let configure: Arc<Command> = configure_command(1, |p| {
        p.set_cq_int(true);
    });
    sched.submit(configure.clone()).unwrap();
    assert_eq!(configure.wait().unwrap(), CmdState::Completed);

    let cmd: Arc<Command> = start_single_cu(0);
    sched.submit(cmd.clone()).unwrap();
    assert_eq!(cmd.wait().unwrap(), CmdState::Completed);

    sched.stop().unwrap();
    pump.join().unwrap();
}

/// EXEC_WRITE applies its {offset, value} pairs to the CU register window.
#[test]
fn exec_write_pairs_reach_the_cu_registers() {
    let dev: Arc<EmulatedDevice> = EmulatedDevice::with_cus(&cu_addrs(1), 1);
    let pump: JoinHandle<()> = spawn_firmware(dev.clone());
    let mut sched: ErtScheduler = ErtScheduler::new(dev.clone(), &Config::from_str(CONFIG).unwrap()).unwrap();

    let configure: Arc<Command> = configure_command(1, |_| ());
    sched.submit(configure.clone()).unwrap();
    configure.wait().unwrap();

    // 1 mask + 6 reserved + 2 pairs.
    let cmd: Arc<Command> = Arc::new(Command::new(16));
    cmd.buf()
        .write_header(packet::make_header(CmdState::New, 11, Opcode::ExecWrite, CmdType::Cu));
    cmd.buf().write(1, 0x1);
    cmd.buf().write(8, 0x18);
    cmd.buf().write(9, 0x1111);
    cmd.buf().write(10, 0x20);
    cmd.buf().write(11, 0x2222);
    cmd.begin().unwrap();
    sched.submit(cmd.clone()).unwrap();
    assert_eq!(cmd.wait().unwrap(), CmdState::Completed);

    assert_eq!(dev.register(CU_BASE + 0x18), 0x1111);
    assert_eq!(dev.register(CU_BASE + 0x20), 0x2222);

    sched.stop().unwrap();
    pump.join().unwrap();
}

/// Echo mode completes CU commands at fetch time; no CU ever starts.
#[test]
fn echo_mode_never_touches_a_cu() {
    let dev: Arc<EmulatedDevice> = EmulatedDevice::with_cus(&cu_addrs(2), 1);
    let pump: JoinHandle<()> = spawn_firmware(dev.clone());
    let mut sched: ErtScheduler = ErtScheduler::new(dev, &Config::from_str(CONFIG).unwrap()).unwrap();

    let configure: Arc<Command> = configure_command(2, |p| {
        p.set_echo(true);
    });
    sched.submit(configure.clone()).unwrap();
    assert_eq!(configure.wait().unwrap(), CmdState::Completed);

    for cu in 0..2 {
        let cmd: Arc<Command> = start_single_cu(cu);
        sched.submit(cmd.clone()).unwrap();
        assert_eq!(cmd.wait().unwrap(), CmdState::Completed);
    }

    let stat: Arc<Command> = cu_stat_command(2);
    sched.submit(stat.clone()).unwrap();
    assert_eq!(stat.wait().unwrap(), CmdState::Completed);
    assert_eq!(stat.buf().read(1), 0);
    assert_eq!(stat.buf().read(2), 0);

    sched.stop().unwrap();
    pump.join().unwrap();
}
