// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Packet validity at the word-count boundaries of every opcode.

use ::accelrt::{
    packet,
    packet::{
        CmdState,
        CmdType,
        Opcode,
    },
    runtime::memory::ExecBuf,
};

//======================================================================================================================
// Helpers
//======================================================================================================================

/// Builds a packet with `count` payload words and the given payload words
/// poked in at their indices.
fn build(opcode: Opcode, ty: CmdType, count: u32, extra_masks: u32, payload: &[(usize, u32)]) -> ExecBuf {
    let buf: ExecBuf = ExecBuf::new(1 + count as usize);
    let mut header: u32 = packet::make_header(CmdState::New, count, opcode, ty);
    if extra_masks > 0 {
        header = packet::with_extra_cu_masks(header, extra_masks);
    }
    buf.write_header(header);
    for (idx, word) in payload {
        buf.write(*idx, *word);
    }
    buf
}

/// Asserts that `opcode` is accepted at exactly `min` payload words and
/// rejected one word below it.
fn check_min(opcode: Opcode, ty: CmdType, min: u32) {
    assert!(
        packet::is_valid(&build(opcode, ty, min, 0, &[])),
        "{:?} must accept count {}",
        opcode,
        min
    );
    if min > 0 {
        assert!(
            !packet::is_valid(&build(opcode, ty, min - 1, 0, &[])),
            "{:?} must reject count {}",
            opcode,
            min - 1
        );
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[test]
fn start_kernel_minimums() {
    check_min(Opcode::StartCu, CmdType::Cu, 5);
    check_min(Opcode::ExecWrite, CmdType::Cu, 7);
    check_min(Opcode::StartFa, CmdType::Cu, 1);
    check_min(Opcode::StartKeyVal, CmdType::Cu, 1);
    check_min(Opcode::SkStart, CmdType::Scu, 2);
    check_min(Opcode::StartDpu, CmdType::Cu, 5);
    check_min(Opcode::StartNpu, CmdType::Cu, 5);
    check_min(Opcode::StartNpuPreempt, CmdType::Cu, 11);
    check_min(Opcode::StartNpuPreemptElf, CmdType::Cu, 11);
}

#[test]
fn extra_cu_masks_raise_the_minimum() {
    // Two extra masks: 3 mask words + 4 regmap words.
    assert!(packet::is_valid(&build(Opcode::StartCu, CmdType::Cu, 7, 2, &[])));
    assert!(!packet::is_valid(&build(Opcode::StartCu, CmdType::Cu, 6, 2, &[])));

    assert!(packet::is_valid(&build(Opcode::ExecWrite, CmdType::Cu, 9, 2, &[])));
    assert!(!packet::is_valid(&build(Opcode::ExecWrite, CmdType::Cu, 8, 2, &[])));
}

#[test]
fn command_chain_requires_an_exact_count() {
    // No links: 6 words exactly.
    assert!(packet::is_valid(&build(Opcode::CmdChain, CmdType::Cu, 6, 0, &[(1, 0)])));
    assert!(!packet::is_valid(&build(Opcode::CmdChain, CmdType::Cu, 5, 0, &[(1, 0)])));
    assert!(!packet::is_valid(&build(Opcode::CmdChain, CmdType::Cu, 7, 0, &[(1, 0)])));

    // Two links: 2 * 2 + 6 = 10 words exactly.
    assert!(packet::is_valid(&build(Opcode::CmdChain, CmdType::Cu, 10, 0, &[(1, 2)])));
    assert!(!packet::is_valid(&build(Opcode::CmdChain, CmdType::Cu, 9, 0, &[(1, 2)])));
    assert!(!packet::is_valid(&build(Opcode::CmdChain, CmdType::Cu, 11, 0, &[(1, 2)])));
}

#[test]
fn configure_scales_with_the_cu_count() {
    assert!(packet::is_valid(&build(Opcode::Configure, CmdType::Ctrl, 7, 0, &[(2, 2)])));
    assert!(!packet::is_valid(&build(Opcode::Configure, CmdType::Ctrl, 6, 0, &[(2, 2)])));
    // Too short to even hold the fixed configure words.
    assert!(!packet::is_valid(&build(Opcode::Configure, CmdType::Ctrl, 4, 0, &[])));
}

#[test]
fn copy_bo_is_fixed_size() {
    assert!(packet::is_valid(&build(Opcode::StartCopyBo, CmdType::Cu, 16, 0, &[])));
    assert!(!packet::is_valid(&build(Opcode::StartCopyBo, CmdType::Cu, 15, 0, &[])));
    assert!(!packet::is_valid(&build(Opcode::StartCopyBo, CmdType::Cu, 17, 0, &[])));
}

#[test]
fn init_cu_carries_fixed_words_masks_and_a_regmap() {
    // 8 fixed words + 1 mask + 4 regmap words.
    check_min(Opcode::InitCu, CmdType::KdsLocal, 13);
}

#[test]
fn soft_kernel_configure_scales_with_the_image_count() {
    // One image: 7 words per image + 1.
    assert!(packet::is_valid(&build(Opcode::SkConfig, CmdType::Ctrl, 8, 0, &[(1, 1)])));
    assert!(!packet::is_valid(&build(Opcode::SkConfig, CmdType::Ctrl, 7, 0, &[(1, 1)])));
    assert!(!packet::is_valid(&build(Opcode::SkConfig, CmdType::Ctrl, 9, 0, &[(1, 1)])));
}

#[test]
fn payload_free_control_commands_are_always_valid() {
    for opcode in [
        Opcode::Exit,
        Opcode::Abort,
        Opcode::CuStat,
        Opcode::ClkCalib,
        Opcode::MbValidate,
        Opcode::AccessTestC,
    ] {
        assert!(
            packet::is_valid(&build(opcode, CmdType::Ctrl, 0, 0, &[])),
            "{:?} must accept an empty payload",
            opcode
        );
    }
}

#[test]
fn unsupported_opcodes_are_rejected() {
    assert!(!packet::is_valid(&build(Opcode::SkUnconfig, CmdType::Ctrl, 8, 0, &[])));
    assert!(!packet::is_valid(&build(Opcode::AccessTest, CmdType::Cu, 8, 0, &[])));
}

#[test]
fn retired_opcode_values_are_rejected() {
    // Opcode value 1 no longer exists on the wire.
    let buf: ExecBuf = ExecBuf::new(8);
    buf.write_header(0x1 | (5 << 12) | (1 << 23) | (3 << 28));
    assert_eq!(packet::opcode_of(buf.read_header()), None);
    assert!(!packet::is_valid(&buf));
}

#[test]
fn truncated_packets_are_rejected() {
    // Header claims 20 payload words; the buffer holds 8.
    let buf: ExecBuf = ExecBuf::new(8);
    buf.write_header(packet::make_header(CmdState::New, 20, Opcode::StartCu, CmdType::Cu));
    assert!(!packet::is_valid(&buf));
}

#[test]
fn state_round_trips_through_header_updates() {
    let buf: ExecBuf = ExecBuf::new(8);
    buf.write_header(packet::make_header(CmdState::New, 5, Opcode::StartCu, CmdType::Cu));

    for state in [
        CmdState::Queued,
        CmdState::Running,
        CmdState::Completed,
    ] {
        buf.write_header(packet::with_state(buf.read_header(), state));
        assert_eq!(packet::state_of(buf.read_header()), Some(state));
        assert_eq!(packet::opcode_of(buf.read_header()), Some(Opcode::StartCu));
        assert_eq!(packet::count(buf.read_header()), 5);
    }
}
