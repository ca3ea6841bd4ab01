//! Named device lifecycle states, derived from the raw `device_status`
//! bits each transport tracks. Kept separate from `transport::mmio` so
//! logging and test assertions can talk about "Ready" or "Failed" instead
//! of bitmasks.

use std::fmt;

use crate::transport::mmio::{
    STATUS_ACKNOWLEDGE, STATUS_DEVICE_NEEDS_RESET, STATUS_DRIVER, STATUS_DRIVER_OK,
    STATUS_FAILED, STATUS_FEATURES_OK,
};

/// `Fresh -> Acknowledged -> FeaturesNegotiated -> Ready -> Running`, with
/// `Failed`/`NeedsReset` reachable from anywhere the guest sets the
/// corresponding status bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Fresh,
    Acknowledged,
    FeaturesNegotiated,
    Ready,
    Running,
    Failed,
    NeedsReset,
}

impl DeviceState {
    /// Classify the current `device_status` register value. `FAILED` and
    /// `DEVICE_NEEDS_RESET` take priority over whatever handshake bits are
    /// also set, since the guest may set them mid-handshake.
    pub fn from_status(status: u32) -> Self {
        if status & STATUS_FAILED != 0 {
            return DeviceState::Failed;
        }
        if status & STATUS_DEVICE_NEEDS_RESET != 0 {
            return DeviceState::NeedsReset;
        }
        if status & STATUS_DRIVER_OK != 0 {
            return DeviceState::Running;
        }
        if status & STATUS_FEATURES_OK != 0 {
            return DeviceState::Ready;
        }
        if status & STATUS_DRIVER != 0 {
            return DeviceState::FeaturesNegotiated;
        }
        if status & STATUS_ACKNOWLEDGE != 0 {
            return DeviceState::Acknowledged;
        }
        DeviceState::Fresh
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Fresh => "fresh",
            DeviceState::Acknowledged => "acknowledged",
            DeviceState::FeaturesNegotiated => "features_negotiated",
            DeviceState::Ready => "ready",
            DeviceState::Running => "running",
            DeviceState::Failed => "failed",
            DeviceState::NeedsReset => "needs_reset",
        };
        f.write_str(name)
    }
}
