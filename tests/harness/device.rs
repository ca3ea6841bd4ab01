//! Drives an `MmioTransport` the way a guest driver's MMIO accesses would,
//! without a real vCPU or KVM underneath: register reads/writes go straight
//! to the transport, and `take_pending_notify` stands in for the ioeventfd
//! trap a real kernel would intercept before user space sees it.

use virtio_deviceplane::state::DeviceState;
use virtio_deviceplane::transport::mmio::{self, MmioTransport};

pub struct FakeDriver<'a> {
    pub transport: &'a mut MmioTransport,
}

impl<'a> FakeDriver<'a> {
    pub fn new(transport: &'a mut MmioTransport) -> Self {
        Self { transport }
    }

    pub fn reg(&mut self, offset: u64) -> u32 {
        self.transport.read(offset)
    }

    /// Run the standard ACK -> DRIVER -> (feature negotiation) -> FEATURES_OK
    /// -> per-queue setup -> DRIVER_OK sequence, acking exactly `acked_features`.
    /// `queues` is `(index, size, desc_addr, avail_addr, used_addr)` per queue.
    pub fn negotiate(&mut self, acked_features: u64, queues: &[(u16, u16, u64, u64, u64)]) {
        self.transport.write(mmio::REG_STATUS, mmio::STATUS_ACKNOWLEDGE);
        self.transport
            .write(mmio::REG_STATUS, mmio::STATUS_ACKNOWLEDGE | mmio::STATUS_DRIVER);

        self.transport.write(mmio::REG_DRIVER_FEATURES_SEL, 0);
        self.transport
            .write(mmio::REG_DRIVER_FEATURES, (acked_features & 0xffff_ffff) as u32);
        self.transport.write(mmio::REG_DRIVER_FEATURES_SEL, 1);
        self.transport
            .write(mmio::REG_DRIVER_FEATURES, (acked_features >> 32) as u32);

        self.transport.write(
            mmio::REG_STATUS,
            mmio::STATUS_ACKNOWLEDGE | mmio::STATUS_DRIVER | mmio::STATUS_FEATURES_OK,
        );
        assert_eq!(
            self.transport.read(mmio::REG_STATUS) & mmio::STATUS_FEATURES_OK,
            mmio::STATUS_FEATURES_OK,
            "device refused FEATURES_OK"
        );

        for &(idx, size, desc, avail, used) in queues {
            self.transport.write(mmio::REG_QUEUE_SEL, idx as u32);
            self.transport.write(mmio::REG_QUEUE_NUM, size as u32);
            self.transport.write(mmio::REG_QUEUE_DESC_LOW, desc as u32);
            self.transport
                .write(mmio::REG_QUEUE_DESC_HIGH, (desc >> 32) as u32);
            self.transport.write(mmio::REG_QUEUE_DRIVER_LOW, avail as u32);
            self.transport
                .write(mmio::REG_QUEUE_DRIVER_HIGH, (avail >> 32) as u32);
            self.transport.write(mmio::REG_QUEUE_DEVICE_LOW, used as u32);
            self.transport
                .write(mmio::REG_QUEUE_DEVICE_HIGH, (used >> 32) as u32);
            self.transport.write(mmio::REG_QUEUE_READY, 1);
        }

        self.transport.write(
            mmio::REG_STATUS,
            mmio::STATUS_ACKNOWLEDGE
                | mmio::STATUS_DRIVER
                | mmio::STATUS_FEATURES_OK
                | mmio::STATUS_DRIVER_OK,
        );
        assert_eq!(
            DeviceState::from_status(self.transport.device_status()),
            DeviceState::Running
        );
    }

    pub fn kick(&mut self, queue: u16) {
        self.transport.write(mmio::REG_QUEUE_NOTIFY, queue as u32);
    }

    pub fn reset(&mut self) {
        self.transport.write(mmio::REG_STATUS, 0);
    }
}
