//! In-process virtio-net datapath: TX is `writev`-ed straight to a TAP fd,
//! RX is `readv`-ed into pre-queued guest buffers with merged-RX buffer
//! coalescing. See `vhost_backend` for the kernel-offloaded counterpart.

use std::io;
use std::mem::offset_of;

use nix::libc;
use tracing::warn;

use crate::containers::{BoundedArray, GuestIoSlice, IovRing, RingBuffer};
use crate::mem::GuestMemoryView;
use crate::net::config::NetConfig;
use crate::net::hdr::{finalize_checksum, VirtioNetHdr, VIRTIO_NET_HDR_F_NEEDS_CSUM, VIRTIO_NET_HDR_SIZE};
use crate::net::tap::{TapDevice, TapError};
use crate::queue::Virtqueue;

const MAX_TX_CHAIN_DESCRIPTORS: usize = 16;
/// A single worst-case TSO frame must fit before another `readv` is worth
/// issuing.
const MAX_FRAME_SIZE: usize = 65535;

pub const RX_QUEUE: usize = 0;
pub const TX_QUEUE: usize = 1;

#[derive(Debug, Clone, Copy)]
struct ChainInfo {
    head_index: u16,
    iov_count: usize,
    total_capacity: usize,
}

/// The RX-side bookkeeping: a ring of guest-buffer iovec views plus a
/// parallel ring recording which run of consecutive iovecs belongs to
/// which descriptor chain. Kept separate from `InProcNetBackend` so tests
/// can drive it without a live TAP fd.
struct RxPipeline {
    mergeable: bool,
    iovs: IovRing,
    chains: RingBuffer<ChainInfo>,
}

impl RxPipeline {
    fn new(queue_size: u16, mergeable: bool) -> Self {
        Self {
            mergeable,
            iovs: IovRing::with_capacity(2 * queue_size as usize),
            chains: RingBuffer::with_capacity(queue_size as usize),
        }
    }

    /// Pull every currently-available RX chain into the buffered rings.
    /// Buffers become available only at driver initiative (the guest
    /// deciding to post RX descriptors), not on TAP readability.
    fn refill(&mut self, mem: &GuestMemoryView, queue: &mut Virtqueue) {
        while let Some(chain) = queue.pop_desc_chain(mem) {
            let head_index = chain.head_index;
            let mut iov_count = 0usize;
            let mut total_capacity = 0usize;
            for desc in chain {
                assert!(desc.is_write_only(), "RX descriptor must be device-writable");
                let ptr = mem.host_addr(desc.addr, desc.len as usize);
                self.iovs.push(GuestIoSlice { ptr, len: desc.len as usize });
                total_capacity += desc.len as usize;
                iov_count += 1;
            }
            assert!(
                total_capacity >= VIRTIO_NET_HDR_SIZE,
                "first RX buffer chain smaller than the net header ({total_capacity} < {VIRTIO_NET_HDR_SIZE})"
            );
            self.chains.push_back(ChainInfo { head_index, iov_count, total_capacity });
        }
    }

    /// The iovec array to hand to the next `readv`, or `None` if there is
    /// no buffered chain or not enough spare capacity for a worst-case
    /// frame.
    fn next_iov(&self) -> Option<Vec<libc::iovec>> {
        if self.chains.is_empty() || self.iovs.total_capacity() <= MAX_FRAME_SIZE {
            return None;
        }
        Some(if self.mergeable {
            self.iovs.all_chains_slice()
        } else {
            self.iovs.first_chain_slice(self.chains.front().unwrap().iov_count)
        })
    }

    /// Account a frame of `frame_len` bytes just written by `readv` across
    /// however many buffered chains it spans, publishing a used entry per
    /// chain consumed and stamping `num_buffers` on the first chain's
    /// header.
    fn complete_frame(&mut self, mem: &GuestMemoryView, queue: &mut Virtqueue, frame_len: usize) {
        let mut remaining = frame_len;
        let mut consumed_chains: u16 = 0;
        let mut header_slice: Option<GuestIoSlice> = None;

        while remaining > 0 {
            let chain = self
                .chains
                .pop_front()
                .expect("readv returned more bytes than the buffered chains can account for");
            let slices = self.iovs.pop_front_n(chain.iov_count);
            if header_slice.is_none() {
                header_slice = slices.first().copied();
            }
            let consumed = chain.total_capacity.min(remaining);
            queue.add_used(mem, chain.head_index, consumed as u32);
            remaining -= consumed;
            consumed_chains += 1;
        }

        let header_slice = header_slice.expect("completed frame consumed zero chains");
        assert!(
            header_slice.len >= VIRTIO_NET_HDR_SIZE,
            "first RX buffer smaller than the net header"
        );
        let offset = offset_of!(VirtioNetHdr, num_buffers);
        unsafe {
            std::ptr::copy_nonoverlapping(
                consumed_chains.to_le_bytes().as_ptr(),
                header_slice.ptr.add(offset),
                2,
            );
        }
    }
}

/// If the guest set `VIRTIO_NET_HDR_F_NEEDS_CSUM` on the header in `bufs[0]`,
/// gather the frame bytes in `bufs[1..]`, finalize the checksum the guest
/// left incomplete, and copy the result back in place before the frame is
/// `writev`-ed out.
fn finalize_tx_checksum(bufs: &[GuestIoSlice]) {
    let Some(header) = bufs.first() else { return };
    if header.len < VIRTIO_NET_HDR_SIZE {
        return;
    }
    let flags = unsafe { *header.ptr };
    if flags & VIRTIO_NET_HDR_F_NEEDS_CSUM == 0 {
        return;
    }

    let csum_start_off = offset_of!(VirtioNetHdr, csum_start);
    let csum_offset_off = offset_of!(VirtioNetHdr, csum_offset);
    let csum_start = unsafe {
        u16::from_le_bytes([*header.ptr.add(csum_start_off), *header.ptr.add(csum_start_off + 1)])
    };
    let csum_offset = unsafe {
        u16::from_le_bytes([*header.ptr.add(csum_offset_off), *header.ptr.add(csum_offset_off + 1)])
    };

    let frame = &bufs[1..];
    let frame_len: usize = frame.iter().map(|b| b.len).sum();
    let mut packet = Vec::with_capacity(frame_len);
    for b in frame {
        packet.extend_from_slice(unsafe { std::slice::from_raw_parts(b.ptr, b.len) });
    }

    finalize_checksum(&mut packet, csum_start, csum_offset);

    let mut offset = 0;
    for b in frame {
        unsafe { std::ptr::copy_nonoverlapping(packet.as_ptr().add(offset), b.ptr, b.len) };
        offset += b.len;
    }
}

/// Services virtio-net TX by `writev` to a TAP device and RX by `readv`
/// into guest buffers the driver has posted.
pub struct InProcNetBackend {
    tap: TapDevice,
    rx: RxPipeline,
}

impl InProcNetBackend {
    pub fn new(tap: TapDevice, queue_size: u16, mergeable_rx: bool) -> Self {
        Self {
            tap,
            rx: RxPipeline::new(queue_size, mergeable_rx),
        }
    }

    /// Open the TAP device named in `config` and build the RX pipeline
    /// around it.
    pub fn open(config: &NetConfig) -> Result<Self, TapError> {
        let name = config.tap_name.as_deref().ok_or(TapError::MissingTapName)?;
        let tap = TapDevice::open(name, VIRTIO_NET_HDR_SIZE)?;
        Ok(Self::new(tap, config.queue_size, config.mergeable_rx))
    }

    /// Called on the `Running` transition: gate `config`'s advertised
    /// offload capabilities by what the driver actually acked and program
    /// the result into the TAP device via `TUNSETOFFLOAD` (§4.5).
    pub fn activate(&self, config: &NetConfig, acked_features: u64) -> Result<(), TapError> {
        self.tap.set_offload(config.offload.gate(acked_features))
    }

    /// Drain queue 1, `writev`-ing each chain to the TAP device. Returns
    /// whether any chain was processed.
    pub fn process_tx(&mut self, mem: &GuestMemoryView, queue: &mut Virtqueue) -> bool {
        let mut processed = false;
        while let Some(chain) = queue.pop_desc_chain(mem) {
            processed = true;
            let head = chain.head_index;
            let mut bufs: BoundedArray<GuestIoSlice, MAX_TX_CHAIN_DESCRIPTORS> = BoundedArray::new();
            for desc in chain {
                assert!(!desc.is_write_only(), "TX descriptor must be driver-readable");
                let ptr = mem.host_addr(desc.addr, desc.len as usize);
                let pushed = bufs.push(GuestIoSlice { ptr, len: desc.len as usize });
                assert!(pushed, "TX chain exceeds {MAX_TX_CHAIN_DESCRIPTORS} descriptors");
            }
            finalize_tx_checksum(bufs.as_slice());
            let iov: Vec<libc::iovec> = bufs.as_slice().iter().map(GuestIoSlice::as_iovec).collect();
            if let Err(e) = self.tap.writev(&iov) {
                warn!(error = %e, "writev to tap failed");
            }
            queue.add_used(mem, head, 0);
        }
        processed
    }

    /// Drain whatever RX buffers the driver has posted, then service TAP
    /// readability against them until a worst-case frame no longer fits or
    /// the fd would block. Returns whether any frame was delivered.
    pub fn process_rx(&mut self, mem: &GuestMemoryView, queue: &mut Virtqueue) -> bool {
        self.rx.refill(mem, queue);

        let mut delivered = false;
        while let Some(iov) = self.rx.next_iov() {
            match self.tap.readv(&iov) {
                Ok(0) => break,
                Ok(n) => {
                    self.rx.complete_frame(mem, queue, n);
                    delivered = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("tap readv failed: {e}"),
            }
        }
        delivered
    }

    pub fn tap(&self) -> &TapDevice {
        &self.tap
    }
}
