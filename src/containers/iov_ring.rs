use super::ring_buffer::RingBuffer;

/// A single guest buffer view: a host pointer plus a byte length, as
/// returned by `GuestMemoryView::host_addr`. Deliberately not `libc::iovec`
/// itself so this type can derive `Default`/`Copy` without depending on
/// `libc`'s layout guarantees for `Default`.
#[derive(Clone, Copy, Debug)]
pub struct GuestIoSlice {
    pub ptr: *mut u8,
    pub len: usize,
}

impl Default for GuestIoSlice {
    fn default() -> Self {
        Self {
            ptr: std::ptr::null_mut(),
            len: 0,
        }
    }
}

impl GuestIoSlice {
    pub fn as_iovec(&self) -> nix::libc::iovec {
        nix::libc::iovec {
            iov_base: self.ptr as *mut nix::libc::c_void,
            iov_len: self.len,
        }
    }
}

/// Ring of guest-buffer views backing the net RX pipeline. Paired with a
/// `RingBuffer<ChainInfo>` (see `net::inproc_backend`) that records which
/// consecutive run of slices belongs to which descriptor chain; the two
/// rings are kept length-consistent by the caller popping exactly
/// `chain.iov_count` slices per `ChainInfo` it consumes.
pub struct IovRing {
    slices: RingBuffer<GuestIoSlice>,
}

impl IovRing {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slices: RingBuffer::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, slice: GuestIoSlice) {
        self.slices.push_back(slice);
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Sum of every buffered slice's byte length — used to decide whether
    /// more than 65535 bytes of capacity remain before issuing another
    /// `readv` (a single worst-case 64 KiB TSO frame must fit).
    pub fn total_capacity(&self) -> usize {
        self.slices.iter().map(|s| s.len).sum()
    }

    /// Remove and return up to `n` slices from the front.
    pub fn pop_front_n(&mut self, n: usize) -> Vec<GuestIoSlice> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            match self.slices.pop_front() {
                Some(s) => out.push(s),
                None => break,
            }
        }
        out
    }

    /// Iovec array covering only the first buffered chain — used when
    /// `VIRTIO_NET_F_MRG_RXBUF` was not negotiated, so a frame must fit in a
    /// single chain's buffers.
    pub fn first_chain_slice(&self, chain_iov_count: usize) -> Vec<nix::libc::iovec> {
        self.slices
            .iter()
            .take(chain_iov_count)
            .map(GuestIoSlice::as_iovec)
            .collect()
    }

    /// Iovec array covering every buffered chain — used when mergeable RX
    /// buffers are negotiated, so one frame may span consecutive chains.
    pub fn all_chains_slice(&self) -> Vec<nix::libc::iovec> {
        self.slices.iter().map(GuestIoSlice::as_iovec).collect()
    }
}
