//! vhost-net kernel offload: hands the two virtqueues and the TAP fd
//! straight to `/dev/vhost-net` so the kernel drives the datapath and this
//! process sees neither kicks nor completions again.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, RawFd};

use nix::libc;
use thiserror::Error;

use crate::net::config::VhostNetConfig;

const VHOST_SET_OWNER: libc::c_ulong = 0xaf01;
const VHOST_SET_FEATURES: libc::c_ulong = 0x4008af00;
const VHOST_SET_MEM_TABLE: libc::c_ulong = 0x4008af03;
const VHOST_SET_VRING_NUM: libc::c_ulong = 0x4008af10;
const VHOST_SET_VRING_ADDR: libc::c_ulong = 0x4028af11;
const VHOST_SET_VRING_KICK: libc::c_ulong = 0x4008af20;
const VHOST_SET_VRING_CALL: libc::c_ulong = 0x4008af21;
const VHOST_NET_SET_BACKEND: libc::c_ulong = 0x4008af30;

/// `VIRTIO_RING_F_INDIRECT_DESC` — only ever acked on this path, since only
/// the kernel's ring walker (not this crate's in-process backends) handles
/// indirect descriptor tables.
pub const VIRTIO_RING_F_INDIRECT_DESC: u64 = 1 << 28;

#[repr(C)]
struct VhostVringState {
    index: u32,
    num: u32,
}

#[repr(C)]
struct VhostVringFile {
    index: u32,
    fd: i32,
}

#[repr(C)]
struct VhostVringAddr {
    index: u32,
    flags: u32,
    desc_user_addr: u64,
    avail_user_addr: u64,
    used_user_addr: u64,
    log_guest_addr: u64,
}

#[repr(C)]
struct VhostMemoryRegion {
    guest_phys_addr: u64,
    memory_size: u64,
    userspace_addr: u64,
    flags_padding: u64,
}

#[repr(C)]
struct VhostMemory {
    nregions: u32,
    padding: u32,
    region: VhostMemoryRegion,
}

#[derive(Debug, Error)]
pub enum VhostNetError {
    #[error("failed to open /dev/vhost-net: {0}")]
    Open(#[source] io::Error),
    #[error("VHOST_SET_OWNER failed: {0}")]
    SetOwner(#[source] io::Error),
    #[error("VHOST_SET_FEATURES failed: {0}")]
    SetFeatures(#[source] io::Error),
    #[error("VHOST_SET_MEM_TABLE failed: {0}")]
    SetMemTable(#[source] io::Error),
    #[error("VHOST_SET_VRING_NUM failed for queue {queue}: {source}")]
    SetVringNum { queue: u16, #[source] source: io::Error },
    #[error("VHOST_SET_VRING_ADDR failed for queue {queue}: {source}")]
    SetVringAddr { queue: u16, #[source] source: io::Error },
    #[error("VHOST_SET_VRING_KICK failed for queue {queue}: {source}")]
    SetVringKick { queue: u16, #[source] source: io::Error },
    #[error("VHOST_SET_VRING_CALL failed for queue {queue}: {source}")]
    SetVringCall { queue: u16, #[source] source: io::Error },
    #[error("VHOST_NET_SET_BACKEND failed for queue {queue}: {source}")]
    SetBackend { queue: u16, #[source] source: io::Error },
}

/// Plain data the embedding VMM fills in to hand one virtqueue's ring
/// addresses over to the kernel.
#[derive(Debug, Clone, Copy)]
pub struct VringLayout {
    pub size: u16,
    pub desc: u64,
    pub avail: u64,
    pub used: u64,
}

fn ioctl_write<T>(fd: RawFd, request: libc::c_ulong, value: &T) -> io::Result<()> {
    let ret = unsafe { libc::ioctl(fd, request as _, value as *const T) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn ioctl_write_u64(fd: RawFd, request: libc::c_ulong, value: u64) -> io::Result<()> {
    ioctl_write(fd, request, &value)
}

/// A vhost-net instance bound to exactly one TAP fd and one pair of
/// virtqueues (RX at index 0, TX at index 1), matching the net device's
/// fixed queue layout.
pub struct VhostNetBackend {
    file: File,
}

impl VhostNetBackend {
    /// Open `/dev/vhost-net` and take ownership. Must be called once per
    /// device before any `set_*` call.
    pub fn open() -> Result<Self, VhostNetError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/vhost-net")
            .map_err(VhostNetError::Open)?;
        ioctl_write(file.as_raw_fd(), VHOST_SET_OWNER, &0u8).map_err(VhostNetError::SetOwner)?;
        Ok(Self { file })
    }

    /// `features` is the guest-acked set intersected with whatever
    /// `VHOST_GET_FEATURES` reports this kernel supports — the caller does
    /// that intersection before calling in, since the kernel's supported
    /// set differs by build and is orthogonal to this crate's own feature
    /// negotiation in `transport::mmio`.
    pub fn set_features(&self, features: u64) -> Result<(), VhostNetError> {
        ioctl_write_u64(self.file.as_raw_fd(), VHOST_SET_FEATURES, features)
            .map_err(VhostNetError::SetFeatures)
    }

    /// Describe the single guest DRAM region vhost-net should translate
    /// ring addresses against.
    pub fn set_mem_table(&self, guest_phys_addr: u64, size: u64, userspace_addr: u64) -> Result<(), VhostNetError> {
        let table = VhostMemory {
            nregions: 1,
            padding: 0,
            region: VhostMemoryRegion {
                guest_phys_addr,
                memory_size: size,
                userspace_addr,
                flags_padding: 0,
            },
        };
        ioctl_write(self.file.as_raw_fd(), VHOST_SET_MEM_TABLE, &table)
            .map_err(VhostNetError::SetMemTable)
    }

    /// Program one virtqueue's size and ring addresses, then bind its
    /// per-queue kick/call eventfds and the TAP backend fd. After this
    /// call the kernel owns the ring; this process must not touch it
    /// again until `reset`.
    pub fn activate_queue(
        &self,
        queue: u16,
        layout: VringLayout,
        kick_fd: RawFd,
        call_fd: RawFd,
        tap_fd: RawFd,
    ) -> Result<(), VhostNetError> {
        let fd = self.file.as_raw_fd();

        ioctl_write(
            fd,
            VHOST_SET_VRING_NUM,
            &VhostVringState { index: queue as u32, num: layout.size as u32 },
        )
        .map_err(|source| VhostNetError::SetVringNum { queue, source })?;

        ioctl_write(
            fd,
            VHOST_SET_VRING_ADDR,
            &VhostVringAddr {
                index: queue as u32,
                flags: 0,
                desc_user_addr: layout.desc,
                avail_user_addr: layout.avail,
                used_user_addr: layout.used,
                log_guest_addr: 0,
            },
        )
        .map_err(|source| VhostNetError::SetVringAddr { queue, source })?;

        ioctl_write(
            fd,
            VHOST_SET_VRING_KICK,
            &VhostVringFile { index: queue as u32, fd: kick_fd },
        )
        .map_err(|source| VhostNetError::SetVringKick { queue, source })?;

        ioctl_write(
            fd,
            VHOST_SET_VRING_CALL,
            &VhostVringFile { index: queue as u32, fd: call_fd },
        )
        .map_err(|source| VhostNetError::SetVringCall { queue, source })?;

        ioctl_write(
            fd,
            VHOST_NET_SET_BACKEND,
            &VhostVringFile { index: queue as u32, fd: tap_fd },
        )
        .map_err(|source| VhostNetError::SetBackend { queue, source })?;

        Ok(())
    }

    /// Activate every queue in `queues` against the TAP fd and queue size
    /// carried in `config`, the batch entry point a VMM calls once both
    /// ring eventfds are ready rather than hand-threading `tap_fd` through
    /// each `activate_queue` call.
    pub fn activate_net(
        &self,
        config: &VhostNetConfig,
        queues: &[(u16, VringLayout, RawFd, RawFd)],
    ) -> Result<(), VhostNetError> {
        for &(queue, layout, kick_fd, call_fd) in queues {
            assert_eq!(
                layout.size, config.queue_size,
                "vring size for queue {queue} does not match the negotiated queue size"
            );
            self.activate_queue(queue, layout, kick_fd, call_fd, config.tap_fd)?;
        }
        Ok(())
    }

    /// Detach the TAP backend from a queue (fd = -1 tells the kernel to
    /// stop polling it), used on device reset before the queue's ring
    /// addresses are allowed to change again.
    pub fn deactivate_queue(&self, queue: u16) -> Result<(), VhostNetError> {
        ioctl_write(
            self.file.as_raw_fd(),
            VHOST_NET_SET_BACKEND,
            &VhostVringFile { index: queue as u32, fd: -1 },
        )
        .map_err(|source| VhostNetError::SetBackend { queue, source })
    }
}
