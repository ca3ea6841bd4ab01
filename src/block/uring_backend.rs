//! Asynchronous virtio-blk datapath: requests are submitted as io_uring
//! SQEs and retired on their CQE, rather than serviced inline on the kick.
//! Shares the transport, virtqueue, and request parsing with
//! `mmap_backend`; the only thing this module owns is the submit/complete
//! bookkeeping.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::PathBuf;

use io_uring::{IoUring, opcode, types};
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
pub enum UringError {
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
    #[error("failed to set up io_uring instance: {source}")]
    RingSetup {
        #[source]
        source: std::io::Error,
    },
}

struct InFlight {
    head_index: u16,
    status_addr: u64,
    response_len: u32,
}

/// A request occupies one slot from submission until its CQE arrives.
/// Bounded to `queue_size / 3` — each request consumes at most a header, a
/// data descriptor, and a status descriptor, so this bounds how many can
/// be concurrently in flight against one queue.
pub struct UringBlockBackend {
    ring: IoUring,
    file: File,
    read_only: bool,
    capacity_sectors: u64,
    block_id: [u8; VIRTIO_BLK_ID_BYTES],
    slots: Vec<Option<InFlight>>,
}

impl UringBlockBackend {
    pub fn open(config: &BlockConfig) -> Result<Self, UringError> {
        let file = OpenOptions::new()
            .read(true)
            .write(!config.read_only)
            .open(&config.path)
            .map_err(|source| UringError::Open {
                path: config.path.clone(),
                source,
            })?;

        let stat = fstat(&file).map_err(|source| UringError::Stat {
            path: config.path.clone(),
            source,
        })?;
        let file_len = stat.st_size as u64;

        let mut block_id = [0u8; VIRTIO_BLK_ID_BYTES];
        let id_str = format!("{}{}{}", stat.st_dev, stat.st_rdev, stat.st_ino);
        let n = id_str.len().min(VIRTIO_BLK_ID_BYTES);
        block_id[..n].copy_from_slice(&id_str.as_bytes()[..n]);

        let capacity = ((config.queue_size as usize) / 3).max(1);
        let ring = IoUring::new(capacity as u32).map_err(|source| UringError::RingSetup { source })?;

        Ok(Self {
            ring,
            file,
            read_only: config.read_only,
            capacity_sectors: file_len >> 9,
            block_id,
            slots: (0..capacity).map(|_| None).collect(),
        })
    }

    /// `seg_max` is fixed at 1 on this backend: every request has exactly
    /// one data segment, so the `SubmissionsRing` bound above holds.
    pub fn config_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        out.extend_from_slice(&self.capacity_sectors.to_le_bytes());
        out.extend_from_slice(&SIZE_MAX.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        out
    }

    fn alloc_slot(&self) -> usize {
        self.slots
            .iter()
            .position(|s| s.is_none())
            .expect("SubmissionsRing exhausted: queue_size/3 bound violated")
    }

    /// Drain available chains, completing `GET_ID` and rejected requests
    /// synchronously and submitting everything else as an SQE.
    pub fn process_queue(&mut self, mem: &GuestMemoryView, queue: &mut Virtqueue) {
        let mut submitted_any = false;
        while let Some(chain) = queue.pop_desc_chain(mem) {
            match request::parse(mem, chain) {
                Ok(req) if req.req_type == VIRTIO_BLK_T_GET_ID => {
                    mem.write_slice(req.data[0].addr, &self.block_id);
                    mem.write_obj(req.status_addr, VIRTIO_BLK_S_OK);
                    queue.add_used(mem, req.head_index, VIRTIO_BLK_ID_BYTES as u32);
                }
                Ok(req) if req.req_type == VIRTIO_BLK_T_OUT && self.read_only => {
                    mem.write_obj(req.status_addr, VIRTIO_BLK_S_IOERR);
                    queue.add_used(mem, req.head_index, 0);
                }
                Ok(req)
                    if matches!(
                        req.req_type,
                        VIRTIO_BLK_T_IN | VIRTIO_BLK_T_OUT | VIRTIO_BLK_T_FLUSH
                    ) =>
                {
                    self.submit(mem, req);
                    submitted_any = true;
                }
                Ok(req) => {
                    warn!(req_type = req.req_type, "unsupported virtio-blk request type");
                    mem.write_obj(req.status_addr, VIRTIO_BLK_S_UNSUPP);
                    queue.add_used(mem, req.head_index, 0);
                }
                Err((head_index, status_addr, err)) => {
                    warn!(error = %err, "rejecting malformed virtio-blk request");
                    mem.write_obj(status_addr, VIRTIO_BLK_S_IOERR);
                    queue.add_used(mem, head_index, 0);
                }
            }
        }
        if submitted_any {
            self.ring.submit().expect("io_uring submit");
        }
    }

    fn submit(&mut self, mem: &GuestMemoryView, req: ParsedRequest) {
        let slot_idx = self.alloc_slot();
        let fd = types::Fd(self.file.as_raw_fd());
        let offset = req.sector * SECTOR_SIZE;

        let (entry, response_len) = match req.req_type {
            VIRTIO_BLK_T_IN => {
                let d = req.data[0];
                assert!(d.is_write_only(), "IN data descriptor must be device-writable");
                let ptr = mem.host_addr(d.addr, d.len as usize);
                (opcode::Read::new(fd, ptr, d.len).offset(offset).build(), d.len)
            }
            VIRTIO_BLK_T_OUT => {
                let d = req.data[0];
                assert!(!d.is_write_only(), "OUT data descriptor must be driver-readable");
                let ptr = mem.host_addr(d.addr, d.len as usize);
                (opcode::Write::new(fd, ptr, d.len).offset(offset).build(), d.len)
            }
            VIRTIO_BLK_T_FLUSH => (opcode::Fsync::new(fd).build(), 0),
            _ => unreachable!("submit() only called for IN/OUT/FLUSH"),
        };

        self.slots[slot_idx] = Some(InFlight {
            head_index: req.head_index,
            status_addr: req.status_addr,
            response_len,
        });

        let entry = entry.user_data(slot_idx as u64);
        unsafe {
            self.ring
                .submission()
                .push(&entry)
                .expect("SubmissionsRing exhausted: queue_size/3 bound violated");
        }
    }

    /// Reap whatever CQEs are ready, writing each request's status and
    /// publishing its used entry. Completion order need not match
    /// submission order (§ ordering: no cross-request guarantee beyond
    /// what the guest imposes with FLUSH).
    pub fn poll_completions(&mut self, mem: &GuestMemoryView, queue: &mut Virtqueue) -> bool {
        let completed: Vec<(u64, i32)> = self
            .ring
            .completion()
            .map(|cqe| (cqe.user_data(), cqe.result()))
            .collect();

        let any = !completed.is_empty();
        for (user_data, result) in completed {
            let slot_idx = user_data as usize;
            let slot = self.slots[slot_idx]
                .take()
                .expect("completion for unallocated io_uring slot");
            let (status, written) = if result < 0 {
                warn!(errno = -result, "io_uring request failed");
                (VIRTIO_BLK_S_IOERR, 0)
            } else {
                (VIRTIO_BLK_S_OK, slot.response_len)
            };
            mem.write_obj(slot.status_addr, status);
            queue.add_used(mem, slot.head_index, written);
        }
        any
    }
}
