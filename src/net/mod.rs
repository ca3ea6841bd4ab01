pub mod config;
pub mod hdr;
pub mod inproc_backend;
pub mod tap;
pub mod vhost_backend;

pub use config::{NetConfig, NetOffloadConfig, VhostNetConfig};
pub use hdr::{VirtioNetHdr, VIRTIO_NET_HDR_SIZE};
pub use inproc_backend::InProcNetBackend;
pub use tap::{OffloadFlags, TapDevice, TapError};
pub use vhost_backend::{VhostNetBackend, VhostNetError};
