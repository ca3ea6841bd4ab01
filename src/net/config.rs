use std::os::fd::RawFd;

use crate::net::hdr::{
    VIRTIO_NET_F_GUEST_CSUM, VIRTIO_NET_F_GUEST_TSO4, VIRTIO_NET_F_GUEST_TSO6,
    VIRTIO_NET_F_GUEST_UFO, VIRTIO_NET_S_LINK_UP,
};
use crate::net::tap::OffloadFlags;

/// Receive/transmit offload capabilities to advertise to the guest and (on
/// the vhost-net path) program into the TAP device via `TUNSETOFFLOAD`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetOffloadConfig {
    pub csum: bool,
    pub tso4: bool,
    pub tso6: bool,
    pub ufo: bool,
}

impl NetOffloadConfig {
    /// Intersect this configured capability set against the features the
    /// driver actually acked, producing the `TUNSETOFFLOAD` bits to program
    /// at activation (§4.5). A bit this device never offered to advertise
    /// stays off even if `acked_features` somehow carries it.
    pub fn gate(&self, acked_features: u64) -> OffloadFlags {
        OffloadFlags {
            csum: self.csum && acked_features & VIRTIO_NET_F_GUEST_CSUM != 0,
            tso4: self.tso4 && acked_features & VIRTIO_NET_F_GUEST_TSO4 != 0,
            tso6: self.tso6 && acked_features & VIRTIO_NET_F_GUEST_TSO6 != 0,
            ufo: self.ufo && acked_features & VIRTIO_NET_F_GUEST_UFO != 0,
        }
    }
}

/// What the embedding VMM fills in to construct an in-process net device.
#[derive(Debug, Clone)]
pub struct NetConfig {
    pub tap_name: Option<String>,
    pub mac: [u8; 6],
    pub queue_size: u16,
    pub mergeable_rx: bool,
    pub offload: NetOffloadConfig,
}

impl NetConfig {
    /// The `virtio_net_config` bytes this device exposes: MAC followed by a
    /// link status that is always up.
    pub fn config_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        out.extend_from_slice(&self.mac);
        out.extend_from_slice(&VIRTIO_NET_S_LINK_UP.to_le_bytes());
        out
    }
}

/// What the embedding VMM fills in to construct a vhost-net-offloaded net
/// device; `tap_fd` is handed straight to `VHOST_NET_SET_BACKEND` rather
/// than opened by this crate, since the caller owns the TAP device's
/// lifetime on this path.
#[derive(Debug, Clone, Copy)]
pub struct VhostNetConfig {
    pub tap_fd: RawFd,
    pub queue_size: u16,
}
