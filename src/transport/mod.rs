pub mod mmio;
pub mod wiring;

pub use mmio::{Action, MmioTransport};
pub use wiring::{TransportWiring, WiringError};
