//! Guest-memory view: a bounds-checked, volatile-access window onto the
//! single contiguous guest DRAM mapping.
//!
//! The guest driver mutates this memory concurrently with the device
//! reading it; every access here goes through `vm-memory`'s volatile
//! primitives rather than a plain reference so the compiler cannot assume
//! the bytes are stable or that accesses may be reordered.

use std::sync::Arc;

use vm_memory::{
    Address, Bytes, GuestAddress, GuestMemory, GuestMemoryMmap, GuestMemoryRegion, GuestRegionMmap,
    MmapRegion,
};

/// Host-addressable view of a guest's physical address space.
///
/// Backed by a single contiguous mapping starting at a fixed guest-physical
/// base. Every dereferenced address must lie in `[base, base+len)`;
/// violating that is a programming error (a malformed guest descriptor, or a
/// bug in the surrounding VMM) and is asserted rather than returned as an
/// error — the guest driver cannot be trusted, but it also cannot be
/// serviced once it has corrupted its own ring.
#[derive(Clone)]
pub struct GuestMemoryView {
    mem: Arc<GuestMemoryMmap>,
    base: u64,
    len: u64,
}

impl GuestMemoryView {
    /// Wrap an existing mapping. `base` must match the guest-physical start
    /// address the region was constructed with.
    pub fn new(mem: GuestMemoryMmap, base: u64) -> Self {
        let len = mem.iter().next().map(|r| r.len()).unwrap_or(0);
        Self {
            mem: Arc::new(mem),
            base,
            len,
        }
    }

    /// Create a fresh anonymous mapping of `len` bytes at guest-physical
    /// `base`. Used by tests and by callers that do not already have a
    /// `GuestMemoryMmap` (the kernel/initrd loader owns the real one; see
    /// the crate-level external-interfaces note).
    pub fn anonymous(base: u64, len: usize) -> std::io::Result<Self> {
        let region = MmapRegion::new(len).map_err(|e| std::io::Error::other(e.to_string()))?;
        let guest_region = GuestRegionMmap::new(region, GuestAddress(base))
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let mem = GuestMemoryMmap::from_regions(vec![guest_region])
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        Ok(Self::new(mem, base))
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check_bounds(&self, addr: u64, len: usize) {
        let end = addr
            .checked_add(len as u64)
            .expect("guest address + length overflowed u64");
        assert!(
            addr >= self.base && end <= self.base + self.len,
            "guest access {addr:#x}+{len:#x} outside mapped range [{:#x}, {:#x})",
            self.base,
            self.base + self.len
        );
    }

    /// Read a plain-old-data value at `addr`.
    pub fn read_obj<T: vm_memory::ByteValued>(&self, addr: u64) -> T {
        self.check_bounds(addr, std::mem::size_of::<T>());
        self.mem
            .read_obj(GuestAddress(addr))
            .expect("guest memory read_obj")
    }

    /// Write a plain-old-data value at `addr`.
    pub fn write_obj<T: vm_memory::ByteValued>(&self, addr: u64, val: T) {
        self.check_bounds(addr, std::mem::size_of::<T>());
        self.mem
            .write_obj(val, GuestAddress(addr))
            .expect("guest memory write_obj")
    }

    /// Read raw bytes into `buf` starting at `addr`.
    pub fn read_slice(&self, addr: u64, buf: &mut [u8]) {
        self.check_bounds(addr, buf.len());
        self.mem
            .read_slice(buf, GuestAddress(addr))
            .expect("guest memory read_slice")
    }

    /// Write raw bytes from `buf` starting at `addr`.
    pub fn write_slice(&self, addr: u64, buf: &[u8]) {
        self.check_bounds(addr, buf.len());
        self.mem
            .write_slice(buf, GuestAddress(addr))
            .expect("guest memory write_slice")
    }

    /// Host virtual address backing a guest-physical range, for syscalls
    /// (mmap I/O, iovecs for readv/writev) that need a raw pointer rather
    /// than a `read`/`write` call.
    pub fn host_addr(&self, addr: u64, len: usize) -> *mut u8 {
        self.check_bounds(addr, len);
        let region = self
            .mem
            .find_region(GuestAddress(addr))
            .expect("guest region lookup");
        let offset = addr - region.start_addr().raw_value();
        unsafe { region.as_ptr().add(offset as usize) }
    }

    /// The underlying `vm-memory` type, for code (virtqueue descriptor
    /// table walks) that wants to address guest memory in terms of the
    /// `vm-memory` traits directly.
    pub fn inner(&self) -> &GuestMemoryMmap {
        &self.mem
    }
}
