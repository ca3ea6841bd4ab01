//! Virtio MMIO transport (version 2): the register file implementing the
//! device-status handshake, feature negotiation, queue programming, and
//! device-specific config-space access shared by every device on top of
//! it.
//!
//! Modeled as a sealed sum type elsewhere (`crate::transport`) rather than
//! a trait object — the set of transports this crate supports is closed,
//! and an indirect call per MMIO access is avoidable.

use tracing::{info, warn};

use crate::queue::Virtqueue;

pub const MAGIC_VALUE: u32 = 0x7472_6976; // "virt"
pub const VERSION: u32 = 2;
pub const VENDOR_ID: u32 = 0x0;

pub const DEVICE_TYPE_NET: u32 = 1;
pub const DEVICE_TYPE_BLOCK: u32 = 2;

// Register offsets (virtio-mmio v2). Public: a guest driver (and this
// crate's own test harness, which plays the driver's role without a real
// vCPU) addresses the device purely in terms of these offsets.
pub const REG_MAGIC_VALUE: u64 = 0x000;
pub const REG_VERSION: u64 = 0x004;
pub const REG_DEVICE_ID: u64 = 0x008;
pub const REG_VENDOR_ID: u64 = 0x00c;
pub const REG_DEVICE_FEATURES: u64 = 0x010;
pub const REG_DEVICE_FEATURES_SEL: u64 = 0x014;
pub const REG_DRIVER_FEATURES: u64 = 0x020;
pub const REG_DRIVER_FEATURES_SEL: u64 = 0x024;
pub const REG_QUEUE_SEL: u64 = 0x030;
pub const REG_QUEUE_NUM_MAX: u64 = 0x034;
pub const REG_QUEUE_NUM: u64 = 0x038;
pub const REG_QUEUE_READY: u64 = 0x044;
pub const REG_QUEUE_NOTIFY: u64 = 0x050;
pub const REG_INTERRUPT_STATUS: u64 = 0x060;
pub const REG_INTERRUPT_ACK: u64 = 0x064;
pub const REG_STATUS: u64 = 0x070;
pub const REG_QUEUE_DESC_LOW: u64 = 0x080;
pub const REG_QUEUE_DESC_HIGH: u64 = 0x084;
pub const REG_QUEUE_DRIVER_LOW: u64 = 0x090;
pub const REG_QUEUE_DRIVER_HIGH: u64 = 0x094;
pub const REG_QUEUE_DEVICE_LOW: u64 = 0x0a0;
pub const REG_QUEUE_DEVICE_HIGH: u64 = 0x0a4;
pub const CONFIG_BASE: u64 = 0x100;

pub const STATUS_ACKNOWLEDGE: u32 = 1;
pub const STATUS_DRIVER: u32 = 2;
pub const STATUS_DRIVER_OK: u32 = 4;
pub const STATUS_FEATURES_OK: u32 = 8;
pub const STATUS_DEVICE_NEEDS_RESET: u32 = 64;
pub const STATUS_FAILED: u32 = 128;

pub const IRQ_STATUS_RING: u32 = 0x01;
pub const IRQ_STATUS_CONFIG: u32 = 0x02;

const VIRTIO_RING_F_EVENT_IDX: u64 = 1 << 29;

/// The effect a register write has on the owning device, beyond updating
/// transport state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing beyond the register write itself.
    NoAction,
    /// The guest just set `DRIVER_OK`: queue addresses are latched now.
    ActivateDevice,
    /// The guest wrote zero to `device_status`: device returns to `Fresh`.
    Reset,
}

#[derive(Default, Clone, Copy)]
struct QueueStaging {
    size: u16,
    ready: bool,
    desc: u64,
    avail: u64,
    used: u64,
}

impl QueueStaging {
    fn set_low(addr: &mut u64, value: u32) {
        *addr = (*addr & 0xFFFF_FFFF_0000_0000) | value as u64;
    }

    fn set_high(addr: &mut u64, value: u32) {
        *addr = (*addr & 0x0000_0000_FFFF_FFFF) | ((value as u64) << 32);
    }
}

/// The MMIO register file for one virtio device, plus the per-queue state
/// it programs.
pub struct MmioTransport {
    device_type: u32,
    device_features: u64,
    acked_features: u64,
    device_status: u32,
    selected_queue: u32,
    selected_device_feature_page: u32,
    selected_guest_feature_page: u32,
    queue_max_size: u16,
    queues: Vec<Virtqueue>,
    staging: Vec<QueueStaging>,
    irq_status: u32,
    config: Vec<u8>,
    pending_notify: Option<u32>,
}

impl MmioTransport {
    pub fn new(
        device_type: u32,
        num_queues: usize,
        queue_max_size: u16,
        device_features: u64,
        config: Vec<u8>,
    ) -> Self {
        Self {
            device_type,
            device_features,
            acked_features: 0,
            device_status: 0,
            selected_queue: 0,
            selected_device_feature_page: 0,
            selected_guest_feature_page: 0,
            queue_max_size,
            queues: (0..num_queues).map(|_| Virtqueue::new(0)).collect(),
            staging: vec![QueueStaging::default(); num_queues],
            irq_status: 0,
            config,
            pending_notify: None,
        }
    }

    pub fn device_status(&self) -> u32 {
        self.device_status
    }

    pub fn acked_features(&self) -> u64 {
        self.acked_features
    }

    pub fn irq_status(&self) -> u32 {
        self.irq_status
    }

    pub fn raise_ring_interrupt(&mut self) {
        self.irq_status |= IRQ_STATUS_RING;
    }

    pub fn raise_config_interrupt(&mut self) {
        self.irq_status |= IRQ_STATUS_CONFIG;
    }

    pub fn is_running(&self) -> bool {
        self.device_status & STATUS_DRIVER_OK != 0
    }

    pub fn queue(&self, idx: usize) -> Option<&Virtqueue> {
        self.queues.get(idx)
    }

    pub fn queue_mut(&mut self, idx: usize) -> Option<&mut Virtqueue> {
        self.queues.get_mut(idx)
    }

    pub fn num_queues(&self) -> usize {
        self.queues.len()
    }

    pub fn config(&self) -> &[u8] {
        &self.config
    }

    pub fn set_config(&mut self, bytes: &[u8]) {
        self.config.clear();
        self.config.extend_from_slice(bytes);
    }

    /// Consume the most recent queue-notify doorbell write, if any arrived
    /// since the last call. In production this register is never actually
    /// observed here — KVM's ioeventfd intercepts the write before it
    /// reaches this transport (§ transport wiring) — but software-only
    /// tests drive the device purely through `read`/`write`, so the
    /// doorbell is tracked here too.
    pub fn take_pending_notify(&mut self) -> Option<u32> {
        self.pending_notify.take()
    }

    pub fn read(&self, offset: u64) -> u32 {
        match offset {
            REG_MAGIC_VALUE => MAGIC_VALUE,
            REG_VERSION => VERSION,
            REG_DEVICE_ID => self.device_type,
            REG_VENDOR_ID => VENDOR_ID,
            REG_DEVICE_FEATURES => {
                ((self.device_features >> (32 * self.selected_device_feature_page)) & 0xFFFF_FFFF)
                    as u32
            }
            REG_QUEUE_NUM_MAX => self.queue_max_size as u32,
            REG_QUEUE_READY => self
                .staging
                .get(self.selected_queue as usize)
                .map(|s| s.ready as u32)
                .unwrap_or(0),
            REG_INTERRUPT_STATUS => self.irq_status,
            REG_STATUS => self.device_status,
            _ if offset >= CONFIG_BASE => self.read_config((offset - CONFIG_BASE) as usize),
            _ => 0,
        }
    }

    pub fn write(&mut self, offset: u64, value: u32) -> Action {
        match offset {
            REG_DEVICE_FEATURES_SEL => {
                self.selected_device_feature_page = value;
                Action::NoAction
            }
            REG_DRIVER_FEATURES => {
                let page = self.selected_guest_feature_page;
                let mask = 0xFFFF_FFFFu64 << (32 * page);
                let shifted = (value as u64) << (32 * page);
                self.acked_features = (self.acked_features & !mask) | (shifted & mask);
                Action::NoAction
            }
            REG_DRIVER_FEATURES_SEL => {
                self.selected_guest_feature_page = value;
                Action::NoAction
            }
            REG_QUEUE_SEL => {
                self.selected_queue = value;
                Action::NoAction
            }
            REG_QUEUE_NUM => {
                if let Some(staging) = self.staging.get_mut(self.selected_queue as usize) {
                    staging.size = value as u16;
                }
                if let Some(q) = self.queues.get_mut(self.selected_queue as usize) {
                    *q = Virtqueue::new(value as u16);
                }
                Action::NoAction
            }
            REG_QUEUE_READY => {
                if let Some(staging) = self.staging.get_mut(self.selected_queue as usize) {
                    staging.ready = value != 0;
                }
                Action::NoAction
            }
            REG_QUEUE_NOTIFY => {
                self.pending_notify = Some(value);
                Action::NoAction
            }
            REG_INTERRUPT_ACK => {
                self.irq_status &= !value;
                Action::NoAction
            }
            REG_STATUS => self.write_status(value),
            REG_QUEUE_DESC_LOW if !self.is_running() => {
                self.with_staging(|s| QueueStaging::set_low(&mut s.desc, value));
                Action::NoAction
            }
            REG_QUEUE_DESC_HIGH if !self.is_running() => {
                self.with_staging(|s| QueueStaging::set_high(&mut s.desc, value));
                Action::NoAction
            }
            REG_QUEUE_DRIVER_LOW if !self.is_running() => {
                self.with_staging(|s| QueueStaging::set_low(&mut s.avail, value));
                Action::NoAction
            }
            REG_QUEUE_DRIVER_HIGH if !self.is_running() => {
                self.with_staging(|s| QueueStaging::set_high(&mut s.avail, value));
                Action::NoAction
            }
            REG_QUEUE_DEVICE_LOW if !self.is_running() => {
                self.with_staging(|s| QueueStaging::set_low(&mut s.used, value));
                Action::NoAction
            }
            REG_QUEUE_DEVICE_HIGH if !self.is_running() => {
                self.with_staging(|s| QueueStaging::set_high(&mut s.used, value));
                Action::NoAction
            }
            _ if offset >= CONFIG_BASE => {
                self.write_config((offset - CONFIG_BASE) as usize, value);
                Action::NoAction
            }
            // Queue-address writes after DRIVER_OK, and anything else
            // unrecognized, are silently ignored.
            _ => Action::NoAction,
        }
    }

    fn with_staging(&mut self, f: impl FnOnce(&mut QueueStaging)) {
        if let Some(s) = self.staging.get_mut(self.selected_queue as usize) {
            f(s);
        }
    }

    fn read_config(&self, offset: usize) -> u32 {
        let bytes = self.config.get(offset..offset + 4);
        match bytes {
            Some(b) => u32::from_le_bytes(b.try_into().unwrap()),
            None => 0,
        }
    }

    fn write_config(&mut self, offset: usize, value: u32) {
        if offset + 4 <= self.config.len() {
            self.config[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        }
    }

    fn write_status(&mut self, value: u32) -> Action {
        if value == 0 {
            self.reset();
            info!(device_type = self.device_type, "virtio device reset");
            return Action::Reset;
        }

        let mut new_status = value;
        let feature_ok_newly_set =
            new_status & STATUS_FEATURES_OK != 0 && self.device_status & STATUS_FEATURES_OK == 0;
        if feature_ok_newly_set && self.acked_features & !self.device_features != 0 {
            warn!(
                acked = format!("{:#x}", self.acked_features),
                advertised = format!("{:#x}", self.device_features),
                "driver acked features outside advertised set; refusing FEATURES_OK"
            );
            new_status &= !STATUS_FEATURES_OK;
        }

        let was_driver_ok = self.device_status & STATUS_DRIVER_OK != 0;
        self.device_status = new_status;
        let now_driver_ok = self.device_status & STATUS_DRIVER_OK != 0;

        if now_driver_ok && !was_driver_ok {
            self.latch_queues();
            info!(device_type = self.device_type, "virtio device activated");
            Action::ActivateDevice
        } else {
            Action::NoAction
        }
    }

    fn latch_queues(&mut self) {
        let event_idx = self.acked_features & VIRTIO_RING_F_EVENT_IDX != 0;
        for (queue, staging) in self.queues.iter_mut().zip(self.staging.iter()) {
            if staging.ready {
                queue.enable(staging.desc, staging.avail, staging.used);
                queue.set_event_idx(event_idx);
            }
        }
    }

    fn reset(&mut self) {
        self.device_status = 0;
        self.acked_features = 0;
        self.irq_status = 0;
        self.selected_queue = 0;
        self.selected_device_feature_page = 0;
        self.selected_guest_feature_page = 0;
        self.pending_notify = None;
        for queue in self.queues.iter_mut() {
            queue.reset();
        }
        for staging in self.staging.iter_mut() {
            *staging = QueueStaging::default();
        }
    }
}
