//! TAP device setup: `TUNSETIFF` with `IFF_TAP | IFF_NO_PI | IFF_VNET_HDR`,
//! then `TUNSETVNETHDRSZ` to size the header every frame carries, then
//! (once features are negotiated) `TUNSETOFFLOAD` to hand the kernel the
//! guest's advertised checksum/segmentation capabilities.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;

use nix::libc;
use thiserror::Error;

const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;
const IFF_VNET_HDR: libc::c_short = 0x4000;

const TUNSETIFF: libc::c_ulong = 0x400454ca;
const TUNSETVNETHDRSZ: libc::c_ulong = 0x400454d8;
const TUNSETOFFLOAD: libc::c_ulong = 0x400454d0;

const TUN_F_CSUM: libc::c_uint = 0x01;
const TUN_F_TSO4: libc::c_uint = 0x02;
const TUN_F_TSO6: libc::c_uint = 0x04;
const TUN_F_UFO: libc::c_uint = 0x08;

#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

#[derive(Debug, Error)]
pub enum TapError {
    #[error("failed to open /dev/net/tun: {0}")]
    Open(#[source] io::Error),
    #[error("TUNSETIFF failed for interface {name}: {source}")]
    SetIff {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("TUNSETVNETHDRSZ failed: {0}")]
    SetVnetHdrSize(#[source] io::Error),
    #[error("TUNSETOFFLOAD failed: {0}")]
    SetOffload(#[source] io::Error),
    #[error("NetConfig.tap_name must be set to open a TAP device")]
    MissingTapName,
}

/// Negotiated guest receive-offload capabilities, translated into
/// `TUNSETOFFLOAD` bits once the device transitions to `Running`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OffloadFlags {
    pub csum: bool,
    pub tso4: bool,
    pub tso6: bool,
    pub ufo: bool,
}

pub struct TapDevice {
    file: File,
}

impl TapDevice {
    pub fn open(name: &str, vnet_hdr_size: usize) -> Result<Self, TapError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open("/dev/net/tun")
            .map_err(TapError::Open)?;

        assert!(name.len() < libc::IFNAMSIZ, "tap interface name too long: {name}");
        let mut ifr = IfReq {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: IFF_TAP | IFF_NO_PI | IFF_VNET_HDR,
            _pad: [0; 22],
        };
        for (i, b) in name.bytes().enumerate() {
            ifr.ifr_name[i] = b as libc::c_char;
        }

        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &ifr) };
        if ret < 0 {
            return Err(TapError::SetIff {
                name: name.to_string(),
                source: io::Error::last_os_error(),
            });
        }

        let size = vnet_hdr_size as libc::c_int;
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETVNETHDRSZ as _, &size) };
        if ret < 0 {
            return Err(TapError::SetVnetHdrSize(io::Error::last_os_error()));
        }

        Ok(Self { file })
    }

    pub fn set_offload(&self, flags: OffloadFlags) -> Result<(), TapError> {
        let mut bits: libc::c_uint = 0;
        if flags.csum {
            bits |= TUN_F_CSUM;
        }
        if flags.tso4 {
            bits |= TUN_F_TSO4;
        }
        if flags.tso6 {
            bits |= TUN_F_TSO6;
        }
        if flags.ufo {
            bits |= TUN_F_UFO;
        }
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), TUNSETOFFLOAD as _, bits) };
        if ret < 0 {
            return Err(TapError::SetOffload(io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn writev(&self, iov: &[libc::iovec]) -> io::Result<usize> {
        let ret = unsafe { libc::writev(self.file.as_raw_fd(), iov.as_ptr(), iov.len() as libc::c_int) };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret as usize)
        }
    }

    pub fn readv(&self, iov: &[libc::iovec]) -> io::Result<usize> {
        let ret = unsafe { libc::readv(self.file.as_raw_fd(), iov.as_ptr(), iov.len() as libc::c_int) };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret as usize)
        }
    }
}
