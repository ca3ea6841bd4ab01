pub mod config;
pub mod mmap_backend;
pub mod request;
pub mod uring_backend;

pub use config::BlockConfig;
pub use mmap_backend::{BlockError, MmapBlockBackend};
pub use uring_backend::{UringBlockBackend, UringError};
