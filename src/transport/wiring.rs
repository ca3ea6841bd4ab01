//! KVM-level wiring: binds the queue-notify doorbell straight to an
//! `ioeventfd` and the device's interrupt straight to an `irqfd`, so a
//! guest doorbell write or a device-raised interrupt never has to trap
//! into this process at all.

use kvm_ioctls::{Datamatch, IoEventAddress, VmFd};
use thiserror::Error;
use vmm_sys_util::eventfd::EventFd;

#[derive(Debug, Error)]
pub enum WiringError {
    #[error("failed to bind ioeventfd for queue {queue} at {addr:#x}: {source}")]
    IoEventFd {
        queue: u16,
        addr: u64,
        #[source]
        source: kvm_ioctls::Error,
    },
    #[error("failed to bind irqfd for gsi {gsi}: {source}")]
    IrqFd {
        gsi: u32,
        #[source]
        source: kvm_ioctls::Error,
    },
    #[error("failed to unbind ioeventfd for queue {queue} at {addr:#x}: {source}")]
    UnbindIoEventFd {
        queue: u16,
        addr: u64,
        #[source]
        source: kvm_ioctls::Error,
    },
}

/// One device's doorbell + interrupt wiring into a KVM VM. Each queue gets
/// its own `ioeventfd` bound at its transport's `QueueNotify` MMIO address;
/// the device as a whole gets one `irqfd` for the legacy line interrupt it
/// raises through `irq_status`.
pub struct TransportWiring {
    mmio_base: u64,
    queue_notify_offset: u64,
    bound_queues: Vec<(u16, u64)>,
    irq_gsi: Option<u32>,
}

impl TransportWiring {
    pub fn new(mmio_base: u64, queue_notify_offset: u64) -> Self {
        Self {
            mmio_base,
            queue_notify_offset,
            bound_queues: Vec::new(),
            irq_gsi: None,
        }
    }

    /// Bind `fd` so that any guest write of `queue` to the `QueueNotify`
    /// register is consumed entirely in-kernel; the datapath thread learns
    /// of it only by `fd` becoming readable, with no userspace MMIO exit in
    /// between. All queues share the single `QueueNotify` address, so each
    /// binding matches only a 32-bit write of its own queue index — without
    /// that datamatch a second queue's binding at the same address would
    /// collide with the first.
    pub fn bind_queue_doorbell(
        &mut self,
        vm: &VmFd,
        queue: u16,
        fd: &EventFd,
    ) -> Result<(), WiringError> {
        let addr = self.mmio_base + self.queue_notify_offset;
        vm.register_ioevent(fd, &IoEventAddress::Mmio(addr), Datamatch::U32(Some(queue as u32)))
            .map_err(|source| WiringError::IoEventFd { queue, addr, source })?;
        self.bound_queues.push((queue, addr));
        Ok(())
    }

    pub fn unbind_queue_doorbell(
        &mut self,
        vm: &VmFd,
        queue: u16,
        fd: &EventFd,
    ) -> Result<(), WiringError> {
        let addr = self.mmio_base + self.queue_notify_offset;
        vm.unregister_ioevent(fd, &IoEventAddress::Mmio(addr), Datamatch::U32(Some(queue as u32)))
            .map_err(|source| WiringError::UnbindIoEventFd { queue, addr, source })?;
        self.bound_queues.retain(|(q, _)| *q != queue);
        Ok(())
    }

    /// Bind `fd` so that signaling it injects `gsi` directly, without a
    /// trip through userspace to call `KVM_IRQ_LINE`.
    pub fn bind_irq(&mut self, vm: &VmFd, gsi: u32, fd: &EventFd) -> Result<(), WiringError> {
        vm.register_irqfd(fd, gsi)
            .map_err(|source| WiringError::IrqFd { gsi, source })?;
        self.irq_gsi = Some(gsi);
        Ok(())
    }

    pub fn irq_gsi(&self) -> Option<u32> {
        self.irq_gsi
    }

    pub fn bound_queue_count(&self) -> usize {
        self.bound_queues.len()
    }
}
