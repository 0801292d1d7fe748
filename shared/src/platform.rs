// Platform Collaborators
// Capability traits for the hardware the lifecycle controller drives.
// The firmware implements them over ESP-IDF; the simulator and tests use `sim`.

// Import anyhow for error handling
use anyhow::Result;

// Import Embassy time utilities for caller-supplied timeouts
use embassy_time::Duration;

use crate::credentials::WifiCredentials;

/// Compensated values from the environmental sensor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvironmentReading {
    pub temperature: f32,
    pub humidity: f32,
    pub pressure: f32,
    pub gas_resistance: f32,
}

pub trait EnvironmentSensor {
    fn read(&mut self) -> Result<EnvironmentReading>;
}

/// Wi-Fi station link. `connect` blocks up to `timeout` and raises WifiUp on the
/// signal register once an address is assigned.
pub trait Network {
    fn connect(&mut self, credentials: &WifiCredentials, timeout: Duration) -> Result<()>;
    fn disconnect(&mut self);
}

/// Why the chip left deep sleep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeCause {
    PowerOn,
    Timer,
    Button,
}

pub trait PowerControl {
    fn wake_cause(&self) -> WakeCause;

    /// Enter deep sleep for `seconds`, waking early on a button press.
    /// On hardware this never returns; the next boot starts from scratch.
    fn deep_sleep(&mut self, seconds: u32);
}
