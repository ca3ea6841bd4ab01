//! Fake guest memory for device-plane integration tests: one anonymous
//! mapping at guest-physical 0, with a fixed per-queue region for the
//! descriptor table / avail ring / used ring and a separate area for data
//! buffers.

use vm_memory::{
    Address, Bytes, GuestAddress, GuestMemory, GuestMemoryMmap, GuestMemoryRegion, GuestRegionMmap,
    MmapRegion,
};

pub const MEMORY_SIZE: u64 = 4 * 1024 * 1024;

/// Each queue gets its own 32 KiB region for desc/avail/used; this is far
/// more than any queue size used in these tests needs, but keeps per-queue
/// address arithmetic trivial.
pub const QUEUE_REGION_SIZE: u64 = 0x8000;
pub const QUEUE_REGIONS_BASE: u64 = 0;
/// Data buffers start after room for 8 queues' worth of ring regions.
pub const DATA_BUFFER_OFFSET: u64 = QUEUE_REGIONS_BASE + 8 * QUEUE_REGION_SIZE;

pub struct TestGuestMemory {
    mem: GuestMemoryMmap,
    next_data_offset: u64,
}

impl TestGuestMemory {
    pub fn new() -> std::io::Result<Self> {
        let region = MmapRegion::new(MEMORY_SIZE as usize)
            .map_err(|e| std::io::Error::other(format!("MmapRegion::new: {e}")))?;
        let guest_region = GuestRegionMmap::new(region, GuestAddress(0))
            .map_err(|e| std::io::Error::other(format!("GuestRegionMmap::new: {e}")))?;
        let mem = GuestMemoryMmap::from_regions(vec![guest_region])
            .map_err(|e| std::io::Error::other(format!("GuestMemoryMmap::from_regions: {e}")))?;
        Ok(Self { mem, next_data_offset: DATA_BUFFER_OFFSET })
    }

    pub fn memory(&self) -> &GuestMemoryMmap {
        &self.mem
    }

    /// Allocate `size` bytes of data-buffer space, 16-byte aligned, and
    /// return its guest-physical address.
    pub fn alloc_buffer(&mut self, size: usize) -> u64 {
        let addr = self.next_data_offset;
        self.next_data_offset += ((size as u64) + 15) & !15;
        addr
    }

    pub fn write(&self, addr: u64, data: &[u8]) {
        self.mem
            .write_slice(data, GuestAddress(addr))
            .expect("test guest memory write");
    }

    pub fn read(&self, addr: u64, buf: &mut [u8]) {
        self.mem
            .read_slice(buf, GuestAddress(addr))
            .expect("test guest memory read");
    }

    pub fn desc_table_addr(&self, queue_idx: u16) -> u64 {
        QUEUE_REGIONS_BASE + queue_idx as u64 * QUEUE_REGION_SIZE
    }

    pub fn avail_ring_addr(&self, queue_idx: u16) -> u64 {
        self.desc_table_addr(queue_idx) + QUEUE_REGION_SIZE / 4
    }

    pub fn used_ring_addr(&self, queue_idx: u16) -> u64 {
        self.desc_table_addr(queue_idx) + QUEUE_REGION_SIZE / 2
    }

    /// The single region's guest-physical base, length and host userspace
    /// address, for `set_mem_table`-shaped calls.
    pub fn region_info(&self) -> (u64, u64, u64) {
        let region = self.mem.iter().next().unwrap();
        (region.start_addr().raw_value(), region.len(), region.as_ptr() as u64)
    }
}

impl Default for TestGuestMemory {
    fn default() -> Self {
        Self::new().expect("failed to create test guest memory")
    }
}
