//! Fixed-capacity containers backing the net RX pipeline (§4.5/§4.6 in the
//! component design). No allocation on the hot path: every one of these is
//! backed by a pre-sized array or `VecDeque` with a reserved capacity.

mod bounded_array;
mod iov_ring;
mod ring_buffer;

pub use bounded_array::BoundedArray;
pub use iov_ring::{GuestIoSlice, IovRing};
pub use ring_buffer::RingBuffer;
