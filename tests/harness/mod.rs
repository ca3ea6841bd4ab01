//! Test harness for device-plane integration tests: fake guest memory, a
//! driver-side virtqueue, and an MMIO-poking fake driver.

pub mod device;
pub mod memory;
pub mod virtqueue;

pub use device::FakeDriver;
pub use memory::TestGuestMemory;
pub use virtqueue::VirtqueueDriver;
