//! Driver-side virtqueue: a realistic guest view of the split ring (free-list
//! descriptor management, chained scatter-gather adds, used-ring draining,
//! event-idx notification suppression), used to drive the device side under
//! test the way a real guest kernel would.

use std::io;
use std::sync::atomic::{Ordering, fence};

use vm_memory::{Bytes, GuestAddress, GuestMemory};

pub const VIRTQ_DESC_F_NEXT: u16 = 1;
pub const VIRTQ_DESC_F_WRITE: u16 = 2;

const DESC_SIZE: u64 = 16;
const AVAIL_RING_HEADER: u64 = 4;
const AVAIL_RING_ELEM: u64 = 2;
const USED_RING_HEADER: u64 = 4;
const USED_RING_ELEM: u64 = 8;

#[derive(Clone, Default)]
struct DescState {
    chain_len: u16,
}

#[derive(Debug)]
pub struct UsedBuffer {
    pub head: u16,
    pub len: u32,
}

pub struct VirtqueueDriver {
    size: u16,
    desc_addr: u64,
    avail_addr: u64,
    used_addr: u64,
    free_head: u16,
    num_free: u16,
    avail_idx_shadow: u16,
    last_used_idx: u16,
    event_idx: bool,
    desc_state: Vec<DescState>,
}

impl VirtqueueDriver {
    pub fn new(size: u16, desc_addr: u64, avail_addr: u64, used_addr: u64, event_idx: bool) -> Self {
        Self {
            size,
            desc_addr,
            avail_addr,
            used_addr,
            free_head: 0,
            num_free: size,
            avail_idx_shadow: 0,
            last_used_idx: 0,
            event_idx,
            desc_state: vec![DescState::default(); size as usize],
        }
    }

    /// Zero the ring area and chain the free-list (`desc[i].next = i + 1`),
    /// exactly as the Linux driver does at queue init.
    pub fn init<M: GuestMemory>(&mut self, mem: &M) {
        for i in 0..self.size {
            let next = if i == self.size - 1 { 0 } else { i + 1 };
            let desc_offset = self.desc_addr + i as u64 * DESC_SIZE;
            mem.write_obj(0u64, GuestAddress(desc_offset)).unwrap();
            mem.write_obj(0u32, GuestAddress(desc_offset + 8)).unwrap();
            mem.write_obj(0u16, GuestAddress(desc_offset + 12)).unwrap();
            mem.write_obj(next, GuestAddress(desc_offset + 14)).unwrap();
        }
        mem.write_obj(0u16, GuestAddress(self.avail_addr)).unwrap();
        mem.write_obj(0u16, GuestAddress(self.avail_addr + 2)).unwrap();
        mem.write_obj(0u16, GuestAddress(self.used_addr)).unwrap();
        mem.write_obj(0u16, GuestAddress(self.used_addr + 2)).unwrap();
    }

    pub fn desc_addr(&self) -> u64 {
        self.desc_addr
    }
    pub fn avail_addr(&self) -> u64 {
        self.avail_addr
    }
    pub fn used_addr(&self) -> u64 {
        self.used_addr
    }
    pub fn num_free(&self) -> u16 {
        self.num_free
    }

    pub fn add_outbuf<M: GuestMemory>(&mut self, mem: &M, buffers: &[(u64, u32)]) -> io::Result<u16> {
        self.add_buf_internal(mem, buffers, &[])
    }

    pub fn add_inbuf<M: GuestMemory>(&mut self, mem: &M, addr: u64, len: u32) -> io::Result<u16> {
        self.add_buf_internal(mem, &[], &[(addr, len)])
    }

    /// Chain driver-readable `out_bufs` followed by device-writable
    /// `in_bufs` into a single descriptor chain, e.g. a virtio-blk request
    /// (header out, data in, status in).
    pub fn add_chain<M: GuestMemory>(
        &mut self,
        mem: &M,
        out_bufs: &[(u64, u32)],
        in_bufs: &[(u64, u32)],
    ) -> io::Result<u16> {
        self.add_buf_internal(mem, out_bufs, in_bufs)
    }

    fn add_buf_internal<M: GuestMemory>(
        &mut self,
        mem: &M,
        out_bufs: &[(u64, u32)],
        in_bufs: &[(u64, u32)],
    ) -> io::Result<u16> {
        let total = out_bufs.len() + in_bufs.len();
        if total == 0 || total > self.num_free as usize {
            return Err(io::Error::other("no free descriptors for chain"));
        }

        let head = self.free_head;
        let mut desc_idx = head;
        let mut prev_idx = head;

        for (i, &(addr, len)) in out_bufs.iter().enumerate() {
            let is_last = i == out_bufs.len() - 1 && in_bufs.is_empty();
            self.write_desc(mem, desc_idx, addr, len, false, !is_last);
            prev_idx = desc_idx;
            if !is_last {
                desc_idx = self.read_desc_next(mem, desc_idx);
            }
        }
        for (i, &(addr, len)) in in_bufs.iter().enumerate() {
            let is_last = i == in_bufs.len() - 1;
            self.write_desc(mem, desc_idx, addr, len, true, !is_last);
            prev_idx = desc_idx;
            if !is_last {
                desc_idx = self.read_desc_next(mem, desc_idx);
            }
        }

        self.free_head = self.read_desc_next(mem, prev_idx);
        self.num_free -= total as u16;
        self.desc_state[head as usize] = DescState { chain_len: total as u16 };

        let ring_offset = self.avail_addr + AVAIL_RING_HEADER
            + (self.avail_idx_shadow % self.size) as u64 * AVAIL_RING_ELEM;
        mem.write_obj(head, GuestAddress(ring_offset)).unwrap();

        fence(Ordering::SeqCst);
        self.avail_idx_shadow = self.avail_idx_shadow.wrapping_add(1);
        mem.write_obj(self.avail_idx_shadow, GuestAddress(self.avail_addr + 2))
            .unwrap();

        Ok(head)
    }

    fn write_desc<M: GuestMemory>(&self, mem: &M, idx: u16, addr: u64, len: u32, write: bool, has_next: bool) {
        let desc_offset = self.desc_addr + idx as u64 * DESC_SIZE;
        let mut flags = 0u16;
        if write {
            flags |= VIRTQ_DESC_F_WRITE;
        }
        if has_next {
            flags |= VIRTQ_DESC_F_NEXT;
        }
        mem.write_obj(addr, GuestAddress(desc_offset)).unwrap();
        mem.write_obj(len, GuestAddress(desc_offset + 8)).unwrap();
        mem.write_obj(flags, GuestAddress(desc_offset + 12)).unwrap();
    }

    fn read_desc_next<M: GuestMemory>(&self, mem: &M, idx: u16) -> u16 {
        mem.read_obj(GuestAddress(self.desc_addr + idx as u64 * DESC_SIZE + 14))
            .unwrap()
    }

    pub fn pop_used<M: GuestMemory>(&mut self, mem: &M) -> Option<UsedBuffer> {
        let used_idx: u16 = mem.read_obj(GuestAddress(self.used_addr + 2)).unwrap();
        if used_idx == self.last_used_idx {
            return None;
        }
        fence(Ordering::SeqCst);

        let ring_idx = self.last_used_idx % self.size;
        let elem_offset = self.used_addr + USED_RING_HEADER + ring_idx as u64 * USED_RING_ELEM;
        let id: u32 = mem.read_obj(GuestAddress(elem_offset)).unwrap();
        let len: u32 = mem.read_obj(GuestAddress(elem_offset + 4)).unwrap();
        let head = id as u16;
        let chain_len = self.desc_state[head as usize].chain_len;

        let mut tail = head;
        for _ in 0..chain_len.saturating_sub(1) {
            tail = self.read_desc_next(mem, tail);
        }
        let tail_next_offset = self.desc_addr + tail as u64 * DESC_SIZE + 14;
        mem.write_obj(self.free_head, GuestAddress(tail_next_offset)).unwrap();
        self.free_head = head;
        self.num_free += chain_len;

        self.last_used_idx = self.last_used_idx.wrapping_add(1);
        Some(UsedBuffer { head, len })
    }

    pub fn has_used<M: GuestMemory>(&self, mem: &M) -> bool {
        let used_idx: u16 = mem.read_obj(GuestAddress(self.used_addr + 2)).unwrap();
        used_idx != self.last_used_idx
    }

    pub fn set_event_idx(&mut self, enabled: bool) {
        self.event_idx = enabled;
    }

    pub fn event_idx(&self) -> bool {
        self.event_idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vm_memory::{GuestAddress, GuestMemoryMmap, GuestRegionMmap, MmapRegion};

    fn mem(size: usize) -> GuestMemoryMmap {
        let region = MmapRegion::new(size).unwrap();
        let region = GuestRegionMmap::new(region, GuestAddress(0)).unwrap();
        GuestMemoryMmap::from_regions(vec![region]).unwrap()
    }

    #[test]
    fn chained_descriptors_carry_next_flag() {
        let m = mem(64 * 1024);
        let mut vq = VirtqueueDriver::new(16, 0, 16 * 16, 16 * 16 + 64, false);
        vq.init(&m);

        vq.add_outbuf(&m, &[(0x1000, 12), (0x2000, 1500)]).unwrap();
        let flags0: u16 = m.read_obj(GuestAddress(12)).unwrap();
        let flags1: u16 = m.read_obj(GuestAddress(16 + 12)).unwrap();
        assert_eq!(flags0, VIRTQ_DESC_F_NEXT);
        assert_eq!(flags1, 0);
    }
}
