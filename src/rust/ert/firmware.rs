// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Embedded scheduler firmware.
//!
//! The device-resident mirror of the software scheduler: the same slot and CU
//! state machine, but operating directly on the memory-mapped command queue
//! instead of host data structures. Until a CONFIGURE command arrives in slot
//! 0, the queue is a single slot spanning the whole command-queue region.
//!
//! Interrupt entry points ([Firmware::on_cu_interrupt]) push into a bounded
//! completion channel the scheduler loop drains; the loop itself never runs
//! inside an interrupt context.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    packet,
    packet::{
        configure::ConfigurePayload,
        opcode::{
            CmdType,
            Opcode,
        },
        state::CmdState,
    },
    runtime::{
        bitset::Bitmask,
        memory::ExecBuf,
        register::{
            csr,
            DeviceHandle,
        },
    },
    sws::cu::ComputeUnit,
};
use ::crossbeam_channel::{
    Receiver,
    Sender,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Hard cap on addressable slots and CUs (4 mask words of 32 bits).
const MAX_SLOTS: usize = 128;

/// CUs beyond this cannot be routed through the interrupt controller; their
/// completions fall back to polling.
const MAX_ISR_CUS: usize = 32;

/// Capacity of the CU completion channel fed by the interrupt handler.
const CU_IRQ_DEPTH: usize = 128;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Lifecycle of one command-queue slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SlotPhase {
    /// Nothing fetched; the header in device memory is authoritative.
    Free,
    /// Fetched, not yet classified.
    New,
    /// CU command waiting for a free CU.
    Queued,
    /// CU command started on `Slot::cu`.
    Running,
}

/// Firmware-side slot bookkeeping.
struct Slot {
    /// Device address of the slot.
    addr: u32,
    /// Where the slot is in its lifecycle.
    phase: SlotPhase,
    /// Packet image captured at fetch time. The host may start reusing the
    /// queue memory as soon as the completion bit is raised, so the firmware
    /// never re-reads a packet after fetching it.
    snapshot: Option<ExecBuf>,
    /// CU mask cached at classification.
    mask: Bitmask,
    /// CU claimed while RUNNING.
    cu: Option<usize>,
    /// A new-command doorbell fired for this slot.
    doorbell: bool,
}

/// The embedded scheduler.
pub struct Firmware {
    /// Register access, standing in for the memory-mapped fabric.
    dev: DeviceHandle,
    /// One entry per slot.
    slots: Vec<Slot>,
    /// CU models, indexed by CU index.
    cus: Vec<ComputeUnit>,
    /// Busy bit per CU.
    cu_status: Bitmask,
    /// Host rings a doorbell per new command; poll the queue only when off.
    cq_status_enabled: bool,
    /// CU completions arrive by interrupt; poll the CUs only when off.
    cu_interrupt_enabled: bool,
    /// Regmap transfer and AP_START are delegated to the CU-DMA engine.
    cu_dma_enabled: bool,
    /// The CU-DMA engine takes CU addresses instead of index masks.
    dsa52: bool,
    /// Complete CU commands at fetch time without touching any CU.
    echo: bool,
    /// Interrupt-to-loop completion channel, producer side.
    cu_irq_tx: Sender<usize>,
    /// Interrupt-to-loop completion channel, consumer side.
    cu_irq_rx: Receiver<usize>,
    /// Set by an EXIT command.
    stopped: bool,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

/// Associated Functions for Slots
impl Slot {
    fn new(addr: u32) -> Self {
        Self {
            addr,
            phase: SlotPhase::Free,
            snapshot: None,
            mask: Bitmask::new(),
            cu: None,
            doorbell: false,
        }
    }
}

/// Associated Functions for the Firmware
impl Firmware {
    /// Boots the firmware in its bootstrap configuration: one slot covering
    /// the whole queue region, no CUs, pure polling.
    pub fn new(dev: DeviceHandle) -> Self {
        let (cu_irq_tx, cu_irq_rx): (Sender<usize>, Receiver<usize>) = crossbeam_channel::bounded(CU_IRQ_DEPTH);
        let mut firmware: Self = Self {
            dev,
            slots: Vec::new(),
            cus: Vec::new(),
            cu_status: Bitmask::new(),
            cq_status_enabled: false,
            cu_interrupt_enabled: false,
            cu_dma_enabled: false,
            dsa52: false,
            echo: false,
            cu_irq_tx,
            cu_irq_rx,
            stopped: false,
        };
        firmware.rebuild_slots(1, csr::CQ_SIZE);
        firmware
    }

    /// Returns true once an EXIT command has been processed.
    pub fn stopped(&self) -> bool {
        self.stopped
    }

    /// Returns the number of slots in the current configuration.
    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    /// Returns the number of configured CUs.
    pub fn num_cus(&self) -> usize {
        self.cus.len()
    }

    /// Interrupt entry point: CU `idx` finished. Never blocks; a full channel
    /// drops the event and the polling fallback picks the completion up.
    pub fn on_cu_interrupt(&self, idx: usize) {
        let _ = self.cu_irq_tx.try_send(idx);
    }

    /// One pass of the scheduler loop: drain notifications, then sweep every
    /// slot at most one lifecycle step forward (a freshly fetched command may
    /// reach RUNNING within the pass).
    pub fn pump(&mut self) {
        if self.stopped {
            return;
        }

        if self.cq_status_enabled {
            self.drain_doorbells();
        }
        if self.cu_interrupt_enabled {
            self.drain_cu_irqs();
        }

        for idx in 0..self.slots.len() {
            if self.stopped {
                break;
            }
            self.step(idx);
        }
    }

    /// Pumps until an EXIT command stops the firmware.
    pub fn run(&mut self) {
        while !self.stopped {
            self.pump();
            ::std::thread::yield_now();
        }
    }

    /// Moves the doorbell bits from the read-to-clear registers into the
    /// per-slot flags.
    fn drain_doorbells(&mut self) {
        for word in 0..((self.slots.len() + 31) / 32) {
            let bits: u32 = self.dev.read_register(csr::CQ_STATUS_REGISTER + 4 * word as u32);
            if bits == 0 {
                continue;
            }
            for bit in ::bit_iter::BitIter::from(bits) {
                let slot: usize = (word << 5) + bit;
                if slot < self.slots.len() {
                    self.slots[slot].doorbell = true;
                }
            }
        }
    }

    /// Retires CU completions reported by the interrupt handler.
    fn drain_cu_irqs(&mut self) {
        while let Ok(cu) = self.cu_irq_rx.try_recv() {
            let slot: Option<usize> = (0..self.slots.len())
                .find(|&idx| self.slots[idx].phase == SlotPhase::Running && self.slots[idx].cu == Some(cu));
            match slot {
                // The interrupt only says "look"; the control register is
                // still checked and acknowledged through the normal path.
                Some(idx) => {
                    if self.poll_running_cu(cu) {
                        self.complete(idx, CmdState::Completed);
                    }
                },
                None => warn!("drain_cu_irqs(): cu {} is not running anything", cu),
            }
        }
    }

    /// Advances slot `idx` through its lifecycle.
    fn step(&mut self, idx: usize) {
        if self.slots[idx].phase == SlotPhase::Free {
            // Poll the queue memory only when the doorbell channel cannot
            // announce the command.
            if self.cq_status_enabled && !self.slots[idx].doorbell {
                return;
            }
            if !self.fetch(idx) {
                return;
            }
        }
        if self.slots[idx].phase == SlotPhase::New {
            self.classify(idx);
        }
        if self.slots[idx].phase == SlotPhase::Queued {
            self.try_start(idx);
        }
        if self.slots[idx].phase == SlotPhase::Running && !self.cu_interrupt_enabled {
            let cu: usize = self.slots[idx].cu.expect("running slot must hold a cu");
            if self.poll_running_cu(cu) {
                self.complete(idx, CmdState::Completed);
            }
        }
    }

    /// The free to new transition: snapshots a NEW packet out of queue memory.
    ///
    /// The queue lives in BRAM whose first read after a host write can return
    /// stale zeros; a zero header is read a second time and the second value
    /// trusted.
    fn fetch(&mut self, idx: usize) -> bool {
        let addr: u32 = self.slots[idx].addr;
        self.slots[idx].doorbell = false;
        let mut header: u32 = self.dev.read_register(addr);
        if header == 0 {
            header = self.dev.read_register(addr);
        }
        if packet::state_of(header) != Some(CmdState::New) {
            return false;
        }

        let count: usize = packet::count(header) as usize;
        let snapshot: ExecBuf = ExecBuf::new(1 + count);
        snapshot.write_header(header);
        let payload: Vec<u32> = self.dev.read_block(addr + 4, count);
        snapshot.write_words(1, &payload);

        self.slots[idx].snapshot = Some(snapshot);
        self.slots[idx].phase = SlotPhase::New;
        self.set_slot_state(idx, CmdState::Queued);
        true
    }

    /// The new to queued transition: control commands are handled here in
    /// full; CU commands cache their mask and wait for a CU.
    fn classify(&mut self, idx: usize) {
        let snapshot: &ExecBuf = self.slots[idx].snapshot.as_ref().expect("new slot must hold a snapshot");
        let header: u32 = snapshot.read_header();

        if packet::type_of(header) != Some(CmdType::Cu) {
            self.control(idx);
            return;
        }
        if self.echo {
            self.complete(idx, CmdState::Completed);
            return;
        }

        self.slots[idx].mask = packet::cu_mask(snapshot);
        self.slots[idx].phase = SlotPhase::Queued;
    }

    /// The queued to running transition: first ready CU in the mask wins.
    fn try_start(&mut self, idx: usize) {
        let mask: Bitmask = self.slots[idx].mask;
        let cu: usize = match self.acquire_cu(&mask) {
            Some(cu) => cu,
            None => return,
        };

        if self.cu_dma_enabled {
            self.start_cu_dma(idx, cu);
        } else {
            let snapshot: ExecBuf = self.slots[idx].snapshot.take().expect("queued slot must hold a snapshot");
            self.cus[cu].start(self.dev.as_ref(), &snapshot);
            self.slots[idx].snapshot = Some(snapshot);
        }
        self.slots[idx].cu = Some(cu);
        self.slots[idx].phase = SlotPhase::Running;
        self.set_slot_state(idx, CmdState::Running);
    }

    /// Hands the queued to running transition of slot `idx` to the CU-DMA
    /// engine: the chosen CU goes into the slot's mask section (its address
    /// on 5.2 platforms, an index mask otherwise), then the slot bit rung on
    /// the engine's register tells it which regmap to transfer. The engine
    /// copies the regmap and raises AP_START on its own.
    fn start_cu_dma(&mut self, idx: usize, cu: usize) {
        let addr: u32 = self.slots[idx].addr;
        if self.dsa52 {
            // The HLS engine shifts the address back up by 2.
            self.dev.write_register(addr + 4, self.cus[cu].addr() >> 2);
        } else {
            let snapshot: &ExecBuf = self.slots[idx].snapshot.as_ref().expect("queued slot must hold a snapshot");
            let num_masks: u32 = packet::num_cu_masks(snapshot.read_header());
            let mut mask: Bitmask = Bitmask::new();
            mask.set(cu);
            for word in 0..num_masks as usize {
                self.dev.write_register(addr + 4 + 4 * word as u32, mask.word(word));
            }
        }
        self.dev
            .write_register(csr::CU_DMA_REGISTER + 4 * (idx as u32 >> 5), 1 << (idx & 31));
        self.cus[cu].mark_started();
    }

    /// Claims the first ready CU named by `mask`.
    fn acquire_cu(&mut self, mask: &Bitmask) -> Option<usize> {
        for idx in mask.iter() {
            if idx >= self.cus.len() {
                break;
            }
            if !self.cu_status.test(idx) && self.cus[idx].ready() {
                self.cu_status.set(idx);
                return Some(idx);
            }
        }
        None
    }

    /// Checks CU `idx` for completion, acknowledging it if done.
    fn poll_running_cu(&mut self, idx: usize) -> bool {
        self.cus[idx].poll(self.dev.as_ref())
    }

    /// Finishes slot `idx`: final state into queue memory, completion bit to
    /// the host, resources back to the allocators.
    fn complete(&mut self, idx: usize, state: CmdState) {
        if let Some(cu) = self.slots[idx].cu.take() {
            self.cu_status.clear(cu);
        }
        self.set_slot_state(idx, state);
        self.slots[idx].snapshot = None;
        self.slots[idx].phase = SlotPhase::Free;
        self.dev
            .write_register(csr::STATUS_REGISTER + 4 * (idx as u32 >> 5), 1 << (idx & 31));
    }

    /// Rewrites the state nibble of slot `idx` in queue memory.
    fn set_slot_state(&self, idx: usize, state: CmdState) {
        let addr: u32 = self.slots[idx].addr;
        let header: u32 = self.dev.read_register(addr);
        self.dev.write_register(addr, packet::with_state(header, state));
    }

    /// Dispatches a control command. The slot is completed here.
    fn control(&mut self, idx: usize) {
        let snapshot: ExecBuf = self.slots[idx].snapshot.take().expect("control slot must hold a snapshot");
        let state: CmdState = match packet::opcode_of(snapshot.read_header()) {
            Some(Opcode::Configure) => self.configure(&snapshot),
            Some(Opcode::Exit) => {
                self.stopped = true;
                CmdState::Completed
            },
            Some(Opcode::Abort) => {
                self.abort(snapshot.read(1) as usize);
                CmdState::Completed
            },
            Some(Opcode::CuStat) => {
                self.cu_stat(idx, &snapshot);
                CmdState::Completed
            },
            Some(Opcode::InitCu) => {
                self.init_cus(&snapshot);
                CmdState::Completed
            },
            Some(Opcode::ClkCalib) | Some(Opcode::MbValidate) | Some(Opcode::AccessTestC) => CmdState::Completed,
            opcode => {
                error!("control(): slot {} holds an unhandled control opcode {:?}", idx, opcode);
                CmdState::Error
            },
        };
        self.slots[idx].snapshot = Some(snapshot);
        self.complete(idx, state);
    }

    /// Applies a CONFIGURE command: queue geometry, CU list, feature toggles,
    /// and the host-visible CSR mirror of all of it.
    fn configure(&mut self, snapshot: &ExecBuf) -> CmdState {
        let busy: bool = self
            .slots
            .iter()
            .any(|slot| matches!(slot.phase, SlotPhase::Queued | SlotPhase::Running));
        if busy {
            warn!("configure(): rejecting CONFIGURE, commands are in flight");
            return CmdState::Error;
        }

        let payload: ConfigurePayload = match ConfigurePayload::from_buf(snapshot) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("configure(): {:?}", e);
                return CmdState::Error;
            },
        };
        if payload.slot_size == 0 || payload.slot_size % 4 != 0 {
            warn!("configure(): bad slot size {}", payload.slot_size);
            return CmdState::Error;
        }

        let num_slots: usize = ((csr::CQ_SIZE / payload.slot_size) as usize).min(MAX_SLOTS);
        self.rebuild_slots(num_slots, payload.slot_size);

        self.cus.clear();
        self.cu_status = Bitmask::new();
        for (idx, addr) in payload.cu_addrs.iter().enumerate() {
            self.cus.push(ComputeUnit::new(idx, *addr));
        }

        self.echo = payload.echo();
        self.cq_status_enabled = payload.cq_int();
        self.cu_dma_enabled = payload.cu_dma();
        self.dsa52 = payload.dsa52();
        // The interrupt controller routes 32 CU lines; larger fabrics poll.
        self.cu_interrupt_enabled = payload.cu_isr() && !payload.polling() && self.cus.len() <= MAX_ISR_CUS;

        self.dev.write_register(csr::CQ_SLOT_SIZE, payload.slot_size);
        self.dev.write_register(csr::CQ_NUMBER_OF_SLOTS, num_slots as u32);
        self.dev.write_register(csr::NUMBER_OF_CU, self.cus.len() as u32);
        self.dev.write_register(csr::CU_OFFSET, payload.cu_shift);
        self.dev.write_register(csr::CU_BASE_ADDRESS, payload.cu_base_addr);
        self.dev.write_register(csr::CQ_BASE_ADDRESS, csr::CQ_BASE);
        self.dev
            .write_register(csr::CQ_STATUS_ENABLE, self.cq_status_enabled as u32);
        self.dev
            .write_register(csr::CU_ISR_HANDLER_ENABLE, self.cu_interrupt_enabled as u32);
        self.dev.write_register(csr::HOST_INTERRUPT_ENABLE, 1);
        self.dev.write_register(csr::CU_DMA_ENABLE, self.cu_dma_enabled as u32);

        info!(
            "configure(): {} slots of {} bytes, {} cus, echo={}, doorbell={}, cu_irq={}, cu_dma={}",
            num_slots,
            payload.slot_size,
            self.cus.len(),
            self.echo,
            self.cq_status_enabled,
            self.cu_interrupt_enabled,
            self.cu_dma_enabled
        );
        CmdState::Completed
    }

    /// Forces a RUNNING CU command in `target` through completion with the
    /// ABORT state. Anything else is treated as already handled.
    fn abort(&mut self, target: usize) {
        if target >= self.slots.len() {
            warn!("abort(): slot {} is out of range", target);
            return;
        }
        if self.slots[target].phase != SlotPhase::Running {
            debug!("abort(): slot {} is not running, nothing to do", target);
            return;
        }

        if let Some(cu) = self.slots[target].cu {
            self.cus[cu].abort();
        }
        self.complete(target, CmdState::Abort);
    }

    /// Answers a CU_STAT command: one usage count per CU, written into the
    /// payload of the requesting slot in CU index order.
    fn cu_stat(&self, idx: usize, snapshot: &ExecBuf) {
        let room: usize = packet::count(snapshot.read_header()) as usize;
        let usages: Vec<u32> = self.cus.iter().take(room).map(ComputeUnit::usage).collect();
        self.dev.write_block(self.slots[idx].addr + 4, &usages);
    }

    /// Broadcasts an INIT_CU regmap to every CU in its mask without starting
    /// any of them.
    fn init_cus(&mut self, snapshot: &ExecBuf) {
        let mask: Bitmask = packet::cu_mask(snapshot);
        for idx in mask.iter() {
            if idx >= self.cus.len() {
                warn!("init_cus(): mask names cu {} beyond the configured {}", idx, self.cus.len());
                break;
            }
            self.cus[idx].write_regmap(self.dev.as_ref(), snapshot);
        }
    }

    /// Replaces the slot table.
    fn rebuild_slots(&mut self, num_slots: usize, slot_size: u32) {
        self.slots = (0..num_slots)
            .map(|idx| Slot::new(csr::CQ_BASE + idx as u32 * slot_size))
            .collect();
    }

    /// Returns the lifetime start count of CU `idx`.
    #[cfg(test)]
    pub fn cu_usage(&self, idx: usize) -> u32 {
        self.cus[idx].usage()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
