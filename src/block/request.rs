//! Parses a descriptor chain into a virtio-blk request: header, data
//! descriptors, status descriptor. See the data-model invariant: header
//! and status are fixed-size and always at the ends of the chain.

use thiserror::Error;
use vm_memory::ByteValued;

use crate::mem::GuestMemoryView;
use crate::queue::{Descriptor, DescriptorChain};

pub const VIRTIO_BLK_T_IN: u32 = 0;
pub const VIRTIO_BLK_T_OUT: u32 = 1;
pub const VIRTIO_BLK_T_FLUSH: u32 = 4;
pub const VIRTIO_BLK_T_GET_ID: u32 = 8;

pub const VIRTIO_BLK_S_OK: u8 = 0;
pub const VIRTIO_BLK_S_IOERR: u8 = 1;
pub const VIRTIO_BLK_S_UNSUPP: u8 = 2;

pub const SECTOR_SIZE: u64 = 512;
pub const VIRTIO_BLK_ID_BYTES: usize = 20;

const HEADER_SIZE: u32 = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct BlockReqHeader {
    type_: u32,
    reserved: u32,
    sector: u64,
}

unsafe impl ByteValued for BlockReqHeader {}

/// A request pulled off the chain, ready for a backend to execute.
pub struct ParsedRequest {
    pub head_index: u16,
    pub req_type: u32,
    pub sector: u64,
    pub data: Vec<Descriptor>,
    pub status_addr: u64,
}

/// Business-rule rejections: the chain is well-formed (no ring
/// corruption) but the request itself is one this device refuses to
/// service. Carries the status descriptor address so the caller can still
/// complete the request with an error status rather than stalling the
/// queue.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request type {0} has no data descriptors")]
    MissingDataDescriptor(u32),
}

/// Parse one descriptor chain into a request. Ring-corruption conditions
/// (too few descriptors, wrong direction on the header/status descriptors)
/// are programming errors per the crate's error taxonomy and panic; a
/// request that is simply one this device won't do (no data segments
/// outside FLUSH) is returned as `Err` so the caller can report
/// `VIRTIO_BLK_S_IOERR` without tearing anything down.
pub fn parse(
    mem: &GuestMemoryView,
    chain: DescriptorChain,
) -> Result<ParsedRequest, (u16, u64, RequestError)> {
    let head_index = chain.head_index;
    let descs: Vec<Descriptor> = chain.collect();
    assert!(
        descs.len() >= 2,
        "block request chain too short ({}) to hold header + status",
        descs.len()
    );

    let header_desc = descs[0];
    assert!(
        !header_desc.is_write_only(),
        "block request header descriptor must be driver-readable"
    );
    assert_eq!(
        header_desc.len, HEADER_SIZE,
        "block request header must be {HEADER_SIZE} bytes, got {}",
        header_desc.len
    );
    let header: BlockReqHeader = mem.read_obj(header_desc.addr);

    let status_desc = *descs.last().unwrap();
    assert!(
        status_desc.is_write_only(),
        "block request status descriptor must be device-writable"
    );
    assert!(
        status_desc.len >= 1,
        "block request status descriptor must be at least 1 byte"
    );

    let data = descs[1..descs.len() - 1].to_vec();

    if header.type_ == VIRTIO_BLK_T_GET_ID {
        assert_eq!(
            data.len(),
            1,
            "GET_ID request must have exactly one data descriptor, got {}",
            data.len()
        );
        assert_eq!(
            data[0].len as usize, VIRTIO_BLK_ID_BYTES,
            "GET_ID data descriptor must be {VIRTIO_BLK_ID_BYTES} bytes"
        );
    }

    if data.is_empty() && header.type_ != VIRTIO_BLK_T_FLUSH {
        return Err((
            head_index,
            status_desc.addr,
            RequestError::MissingDataDescriptor(header.type_),
        ));
    }

    Ok(ParsedRequest {
        head_index,
        req_type: header.type_,
        sector: header.sector,
        data,
        status_addr: status_desc.addr,
    })
}
