// Device State Module
// The persisted lifecycle phase, source of truth across deep sleep and power loss

use std::fmt;
use std::sync::Mutex;

// Import logging macros
use log::{info, warn};

use crate::storage::{lock_store, SharedBlobStore, StoreError, StoreResult};

pub const DEVICE_STATE_BLOB: &str = "state";

/// Lifecycle phase selected at every boot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DeviceState {
    Unknown = 0,
    BleConfig = 1,
    // 2 belonged to a retired deep-sleep phase and loads as corrupt
    Measure = 3,
    MeasureConfig = 4,
}

impl DeviceState {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(DeviceState::Unknown),
            1 => Some(DeviceState::BleConfig),
            3 => Some(DeviceState::Measure),
            4 => Some(DeviceState::MeasureConfig),
            _ => None,
        }
    }

    pub fn as_raw(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Unknown => "unknown",
            DeviceState::BleConfig => "ble-config",
            DeviceState::Measure => "measure",
            DeviceState::MeasureConfig => "measure-config",
        };
        f.write_str(name)
    }
}

/// Durable single-value store for the DeviceState
pub struct StateStore {
    blobs: SharedBlobStore,
    lock: Mutex<()>,
}

impl StateStore {
    pub fn new(blobs: SharedBlobStore) -> Self {
        Self {
            blobs,
            lock: Mutex::new(()),
        }
    }

    /// Load the persisted state. Missing, unknown or corrupt records resolve to
    /// BleConfig, which is written back so the next boot reads a defined value.
    pub fn load(&self) -> DeviceState {
        match self.read() {
            Ok(Some(state)) if state != DeviceState::Unknown => {
                info!("💾 Loaded device state: {}", state);
                return state;
            }
            Ok(_) => info!("💾 No device state stored - starting in BLE config"),
            Err(e) => warn!("⚠️ {} - falling back to BLE config", e),
        }

        if let Err(e) = self.save(DeviceState::BleConfig) {
            warn!("⚠️ Failed to persist recovered device state: {}", e);
        }
        DeviceState::BleConfig
    }

    pub fn save(&self, state: DeviceState) -> StoreResult<()> {
        let _guard = lock_store(&self.lock, "device state")?;
        self.blobs
            .write(DEVICE_STATE_BLOB, &state.as_raw().to_le_bytes())?;
        info!("💾 Device state saved: {}", state);
        Ok(())
    }

    fn read(&self) -> StoreResult<Option<DeviceState>> {
        let _guard = lock_store(&self.lock, "device state")?;
        let Some(bytes) = self.blobs.read(DEVICE_STATE_BLOB)? else {
            return Ok(None);
        };

        let raw: [u8; 4] = bytes.as_slice().try_into().map_err(|_| StoreError::Corrupt {
            blob: DEVICE_STATE_BLOB.to_string(),
            reason: format!("expected 4 bytes, found {}", bytes.len()),
        })?;

        let raw = u32::from_le_bytes(raw);
        DeviceState::from_raw(raw)
            .map(Some)
            .ok_or_else(|| StoreError::Corrupt {
                blob: DEVICE_STATE_BLOB.to_string(),
                reason: format!("undefined state value {}", raw),
            })
    }
}
