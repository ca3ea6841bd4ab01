use std::path::PathBuf;

/// Construction-time parameters for either block backend. Not a config
/// *file* format — callers (tests, and whatever embeds this crate) build
/// this directly; there is no parser here.
#[derive(Debug, Clone)]
pub struct BlockConfig {
    pub path: PathBuf,
    pub read_only: bool,
    pub queue_size: u16,
}
