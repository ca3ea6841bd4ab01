//! Synchronous virtio-blk datapath: a guest kick is serviced by direct
//! `memcpy` against a `mmap`-ed backing file. See `uring_backend` for the
//! async counterpart sharing the same transport and request parsing.

use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::ptr::NonNull;

use nix::libc::c_void;
use nix::sys::mman::{MapFlags, MsFlags, ProtFlags, mmap, msync, munmap};
use nix::sys::stat::fstat;
use thiserror::Error;
use tracing::warn;

use crate::block::config::BlockConfig;
use crate::block::request::{
    self, SECTOR_SIZE, VIRTIO_BLK_ID_BYTES, VIRTIO_BLK_S_IOERR, VIRTIO_BLK_S_OK,
    VIRTIO_BLK_S_UNSUPP, VIRTIO_BLK_T_FLUSH, VIRTIO_BLK_T_GET_ID, VIRTIO_BLK_T_IN,
    VIRTIO_BLK_T_OUT, ParsedRequest,
};
use crate::mem::GuestMemoryView;
use crate::queue::Virtqueue;

const SIZE_MAX: u32 = 1 << 16;

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("failed to open backing file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to stat backing file {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },
    #[error("failed to map backing file {path}: {source}")]
    Mmap {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },
    #[error("backing file {path} is empty")]
    EmptyFile { path: PathBuf },
}

struct MappedFile {
    ptr: NonNull<c_void>,
    len: usize,
}

// Safety: the mapping is only ever touched through `&self`/`&mut self`
// methods that bounds-check against `len`; the backend that owns it is
// itself driven from a single event-loop thread.
unsafe impl Send for MappedFile {}

impl MappedFile {
    fn map(file: &File, len: usize, read_only: bool) -> Result<Self, nix::Error> {
        let prot = if read_only {
            ProtFlags::PROT_READ
        } else {
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE
        };
        let flags = if read_only {
            MapFlags::MAP_PRIVATE
        } else {
            MapFlags::MAP_SHARED
        };
        let len_nz = NonZeroUsize::new(len).expect("backing file length checked non-zero by caller");
        let ptr = unsafe { mmap(None, len_nz, prot, flags, file, 0)? };
        Ok(Self { ptr, len })
    }

    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr().cast()
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) {
        assert!(
            offset.checked_add(buf.len()).is_some_and(|end| end <= self.len),
            "mmap read [{offset}, {}) out of range (len {})",
            offset + buf.len(),
            self.len
        );
        unsafe { std::ptr::copy_nonoverlapping(self.as_ptr().add(offset), buf.as_mut_ptr(), buf.len()) };
    }

    fn write_at(&self, offset: usize, buf: &[u8]) {
        assert!(
            offset.checked_add(buf.len()).is_some_and(|end| end <= self.len),
            "mmap write [{offset}, {}) out of range (len {})",
            offset + buf.len(),
            self.len
        );
        unsafe { std::ptr::copy_nonoverlapping(buf.as_ptr(), self.as_ptr().add(offset), buf.len()) };
    }

    fn flush_async(&self) {
        if let Err(e) = unsafe { msync(self.ptr, self.len, MsFlags::MS_ASYNC) } {
            warn!(error = %e, "msync failed");
        }
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        let _ = unsafe { munmap(self.ptr, self.len) };
    }
}

/// Services virtio-blk requests against a file mapped whole into this
/// process's address space. Read-write backing files are mapped `SHARED`
/// so writes land in the page cache immediately and `FLUSH` just has to
/// push them to disk; read-only files are mapped `PRIVATE`.
pub struct MmapBlockBackend {
    _file: File,
    mapping: MappedFile,
    read_only: bool,
    capacity_sectors: u64,
    seg_max: u32,
    block_id: [u8; VIRTIO_BLK_ID_BYTES],
}

impl MmapBlockBackend {
    pub fn open(config: &BlockConfig) -> Result<Self, BlockError> {
        let file = OpenOptions::new()
            .read(true)
            .write(!config.read_only)
            .open(&config.path)
            .map_err(|source| BlockError::Open {
                path: config.path.clone(),
                source,
            })?;

        let stat = fstat(&file).map_err(|source| BlockError::Stat {
            path: config.path.clone(),
            source,
        })?;
        let file_len = stat.st_size as u64;
        if file_len == 0 {
            return Err(BlockError::EmptyFile {
                path: config.path.clone(),
            });
        }

        let mapping =
            MappedFile::map(&file, file_len as usize, config.read_only).map_err(|source| {
                BlockError::Mmap {
                    path: config.path.clone(),
                    source,
                }
            })?;

        let mut block_id = [0u8; VIRTIO_BLK_ID_BYTES];
        let id_str = format!("{}{}{}", stat.st_dev, stat.st_rdev, stat.st_ino);
        let n = id_str.len().min(VIRTIO_BLK_ID_BYTES);
        block_id[..n].copy_from_slice(&id_str.as_bytes()[..n]);

        Ok(Self {
            _file: file,
            mapping,
            read_only: config.read_only,
            capacity_sectors: file_len >> 9,
            seg_max: (config.queue_size as u32).saturating_sub(2),
            block_id,
        })
    }

    /// The 16-byte `{capacity, size_max, seg_max}` config blob exposed at
    /// MMIO offset 0x100.
    pub fn config_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        out.extend_from_slice(&self.capacity_sectors.to_le_bytes());
        out.extend_from_slice(&SIZE_MAX.to_le_bytes());
        out.extend_from_slice(&self.seg_max.to_le_bytes());
        out
    }

    /// Drain every chain currently available on `queue`. Returns whether
    /// at least one was processed, so the caller knows whether to consult
    /// `send_notification` at all.
    pub fn process_queue(&mut self, mem: &GuestMemoryView, queue: &mut Virtqueue) -> bool {
        let mut processed = false;
        while let Some(chain) = queue.pop_desc_chain(mem) {
            processed = true;
            match request::parse(mem, chain) {
                Ok(req) => {
                    let (status, written) = self.execute(mem, &req);
                    mem.write_obj(req.status_addr, status);
                    queue.add_used(mem, req.head_index, written);
                }
                Err((head_index, status_addr, err)) => {
                    warn!(error = %err, "rejecting malformed virtio-blk request");
                    mem.write_obj(status_addr, VIRTIO_BLK_S_IOERR);
                    queue.add_used(mem, head_index, 0);
                }
            }
        }
        processed
    }

    fn execute(&mut self, mem: &GuestMemoryView, req: &ParsedRequest) -> (u8, u32) {
        match req.req_type {
            VIRTIO_BLK_T_IN => {
                let mut offset = (req.sector * SECTOR_SIZE) as usize;
                let mut total = 0u32;
                let mut buf = Vec::new();
                for d in &req.data {
                    assert!(d.is_write_only(), "IN data descriptor must be device-writable");
                    buf.resize(d.len as usize, 0);
                    self.mapping.read_at(offset, &mut buf);
                    mem.write_slice(d.addr, &buf);
                    offset += d.len as usize;
                    total += d.len;
                }
                (VIRTIO_BLK_S_OK, total)
            }
            VIRTIO_BLK_T_OUT => {
                if self.read_only {
                    return (VIRTIO_BLK_S_IOERR, 0);
                }
                let mut offset = (req.sector * SECTOR_SIZE) as usize;
                let mut total = 0u32;
                let mut buf = Vec::new();
                for d in &req.data {
                    assert!(!d.is_write_only(), "OUT data descriptor must be driver-readable");
                    buf.resize(d.len as usize, 0);
                    mem.read_slice(d.addr, &mut buf);
                    self.mapping.write_at(offset, &buf);
                    offset += d.len as usize;
                    total += d.len;
                }
                (VIRTIO_BLK_S_OK, total)
            }
            VIRTIO_BLK_T_FLUSH => {
                if !self.read_only {
                    self.mapping.flush_async();
                }
                (VIRTIO_BLK_S_OK, 0)
            }
            VIRTIO_BLK_T_GET_ID => {
                mem.write_slice(req.data[0].addr, &self.block_id);
                (VIRTIO_BLK_S_OK, VIRTIO_BLK_ID_BYTES as u32)
            }
            other => {
                warn!(req_type = other, "unsupported virtio-blk request type");
                (VIRTIO_BLK_S_UNSUPP, 0)
            }
        }
    }
}
