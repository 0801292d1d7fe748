// Hatch Configuration Module
// Cloud-controlled tunables, the publish policy that runs over them, and the
// durable single-record store that keeps them across deep sleep

use std::sync::Mutex;

// Import anyhow for validation errors
use anyhow::{anyhow, Result};

// Import logging macros
use log::{debug, info, warn};

use crate::storage::{lock_store, SharedBlobStore, StoreResult};

pub const HATCH_CONFIG_BLOB: &str = "hatch_cfg";
pub const HATCH_CONFIG_MAGIC: u32 = 0xDEAD_BEEF; // Validity marker of a populated record
pub const HATCH_UUID_LEN_MAX: usize = 36; // Canonical UUID string length

// Record layout: magic, uuid field, then eleven 32-bit words
const UUID_FIELD_LEN: usize = 40;
const WORDS_OFFSET: usize = 4 + UUID_FIELD_LEN;
const WORD_COUNT: usize = 11;
pub const HATCH_CONFIG_RECORD_LEN: usize = WORDS_OFFSET + WORD_COUNT * 4;

// Defaults for a device that has never seen a shadow document
const DEFAULT_MEASURE_INTERVAL_SEC: u32 = 15 * 60;
const DEFAULT_END_UNIX_TIMESTAMP: u32 = i32::MAX as u32;
const DEFAULT_TEMPERATURE_LOW_CELSIUS: f32 = 36.6666; // 98 F
const DEFAULT_TEMPERATURE_HIGH_CELSIUS: f32 = 39.4444; // 103 F
const DEFAULT_LOW_READINGS_ERROR: u32 = 8;
const DEFAULT_HIGH_READINGS_ERROR: u32 = 1;
const DEFAULT_MEASUREMENTS_BEFORE_PUBLISHING: u32 = 4 * 12; // Twelve hours at 15 minutes

/// Why a measurement cycle decided to publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishReason {
    Threshold,
    HighTemperatureRun,
    LowTemperatureRun,
    HatchEnded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HatchConfig {
    pub uuid: String,
    pub measure_interval_sec: u32,
    pub end_unix_timestamp: u32,
    pub temperature_low_celsius: f32,
    pub temperature_high_celsius: f32,
    pub temperature_offset_celsius: f32,
    pub consecutive_low_readings: u32,
    pub consecutive_high_readings: u32,
    pub consecutive_low_readings_error: u32,
    pub consecutive_high_readings_error: u32,
    pub measurements_since_publish: u32,
    pub measurements_before_publishing: u32,
}

impl Default for HatchConfig {
    fn default() -> Self {
        Self {
            uuid: String::new(),
            measure_interval_sec: DEFAULT_MEASURE_INTERVAL_SEC,
            end_unix_timestamp: DEFAULT_END_UNIX_TIMESTAMP,
            temperature_low_celsius: DEFAULT_TEMPERATURE_LOW_CELSIUS,
            temperature_high_celsius: DEFAULT_TEMPERATURE_HIGH_CELSIUS,
            temperature_offset_celsius: 0.0,
            consecutive_low_readings: 0,
            consecutive_high_readings: 0,
            consecutive_low_readings_error: DEFAULT_LOW_READINGS_ERROR,
            consecutive_high_readings_error: DEFAULT_HIGH_READINGS_ERROR,
            measurements_since_publish: 0,
            measurements_before_publishing: DEFAULT_MEASUREMENTS_BEFORE_PUBLISHING,
        }
    }
}

impl HatchConfig {
    /// Check the values a shadow document or local command may overwrite
    pub fn validate(&self) -> Result<()> {
        if self.uuid.is_empty() || self.uuid.len() > HATCH_UUID_LEN_MAX {
            return Err(anyhow!(
                "Hatch UUID must be 1-{} bytes, got {}",
                HATCH_UUID_LEN_MAX,
                self.uuid.len()
            ));
        }

        if self.measure_interval_sec == 0 {
            return Err(anyhow!("Measure interval must be at least one second"));
        }

        if !(self.temperature_low_celsius < self.temperature_high_celsius) {
            return Err(anyhow!(
                "Temperature band is empty: low {} >= high {}",
                self.temperature_low_celsius,
                self.temperature_high_celsius
            ));
        }

        if !self.temperature_offset_celsius.is_finite() {
            return Err(anyhow!("Temperature offset must be finite"));
        }

        Ok(())
    }

    /// Raw sensor temperature shifted by the configured offset
    pub fn corrected_temperature(&self, raw_celsius: f32) -> f32 {
        raw_celsius + self.temperature_offset_celsius
    }

    /// Count one reading toward the publish threshold and the out-of-band runs
    pub fn record_reading(&mut self, temperature_celsius: f32) {
        self.measurements_since_publish = self.measurements_since_publish.saturating_add(1);

        if temperature_celsius > self.temperature_high_celsius {
            self.consecutive_high_readings = self.consecutive_high_readings.saturating_add(1);
            self.consecutive_low_readings = 0;
        } else if temperature_celsius < self.temperature_low_celsius {
            self.consecutive_low_readings = self.consecutive_low_readings.saturating_add(1);
            self.consecutive_high_readings = 0;
        } else {
            self.consecutive_low_readings = 0;
            self.consecutive_high_readings = 0;
        }
    }

    pub fn hatch_ended(&self, now: u32) -> bool {
        now >= self.end_unix_timestamp
    }

    /// First publish trigger that holds for the current counters, if any
    pub fn publish_reason(&self, now: u32) -> Option<PublishReason> {
        if self.measurements_since_publish >= self.measurements_before_publishing {
            Some(PublishReason::Threshold)
        } else if self.consecutive_high_readings >= self.consecutive_high_readings_error {
            Some(PublishReason::HighTemperatureRun)
        } else if self.consecutive_low_readings >= self.consecutive_low_readings_error {
            Some(PublishReason::LowTemperatureRun)
        } else if self.hatch_ended(now) {
            Some(PublishReason::HatchEnded)
        } else {
            None
        }
    }

    /// Called only after a whole publish batch succeeded
    pub fn reset_publish_counters(&mut self) {
        self.measurements_since_publish = 0;
        self.consecutive_low_readings = 0;
        self.consecutive_high_readings = 0;
    }

    pub fn to_bytes(&self) -> [u8; HATCH_CONFIG_RECORD_LEN] {
        let mut record = [0u8; HATCH_CONFIG_RECORD_LEN];
        record[..4].copy_from_slice(&HATCH_CONFIG_MAGIC.to_le_bytes());

        let uuid = self.uuid.as_bytes();
        let uuid_len = uuid.len().min(HATCH_UUID_LEN_MAX);
        record[4..4 + uuid_len].copy_from_slice(&uuid[..uuid_len]);

        let words: [u32; WORD_COUNT] = [
            self.measure_interval_sec,
            self.end_unix_timestamp,
            self.temperature_low_celsius.to_bits(),
            self.temperature_high_celsius.to_bits(),
            self.temperature_offset_celsius.to_bits(),
            self.consecutive_low_readings,
            self.consecutive_high_readings,
            self.consecutive_low_readings_error,
            self.consecutive_high_readings_error,
            self.measurements_since_publish,
            self.measurements_before_publishing,
        ];
        for (i, word) in words.iter().enumerate() {
            let at = WORDS_OFFSET + i * 4;
            record[at..at + 4].copy_from_slice(&word.to_le_bytes());
        }

        record
    }

    /// Decode a persisted record; anything short of a complete, marked record is None
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != HATCH_CONFIG_RECORD_LEN {
            return None;
        }

        let word_at = |at: usize| {
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };
        if word_at(0) != HATCH_CONFIG_MAGIC {
            return None;
        }

        let uuid_field = &bytes[4..4 + UUID_FIELD_LEN];
        let uuid_len = uuid_field
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(UUID_FIELD_LEN);
        if uuid_len > HATCH_UUID_LEN_MAX {
            return None;
        }
        let uuid = std::str::from_utf8(&uuid_field[..uuid_len]).ok()?.to_string();

        let word = |i: usize| word_at(WORDS_OFFSET + i * 4);
        Some(Self {
            uuid,
            measure_interval_sec: word(0),
            end_unix_timestamp: word(1),
            temperature_low_celsius: f32::from_bits(word(2)),
            temperature_high_celsius: f32::from_bits(word(3)),
            temperature_offset_celsius: f32::from_bits(word(4)),
            consecutive_low_readings: word(5),
            consecutive_high_readings: word(6),
            consecutive_low_readings_error: word(7),
            consecutive_high_readings_error: word(8),
            measurements_since_publish: word(9),
            measurements_before_publishing: word(10),
        })
    }
}

/// Partial update from the local configuration protocol; unset fields keep their value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThresholdUpdate {
    pub measurements_before_publishing: Option<u32>,
    pub measure_interval_sec: Option<u32>,
    pub temperature_low_celsius: Option<f32>,
    pub temperature_high_celsius: Option<f32>,
}

impl ThresholdUpdate {
    /// Apply onto a copy of `config`, leaving `config` untouched on invalid input
    pub fn apply(&self, config: &HatchConfig) -> Result<HatchConfig> {
        let mut updated = config.clone();
        if let Some(total) = self.measurements_before_publishing {
            updated.measurements_before_publishing = total;
        }
        if let Some(interval) = self.measure_interval_sec {
            updated.measure_interval_sec = interval;
        }
        if let Some(low) = self.temperature_low_celsius {
            updated.temperature_low_celsius = low;
        }
        if let Some(high) = self.temperature_high_celsius {
            updated.temperature_high_celsius = high;
        }

        if updated.measure_interval_sec == 0 {
            return Err(anyhow!("Measure interval must be at least one second"));
        }
        if !(updated.temperature_low_celsius < updated.temperature_high_celsius) {
            return Err(anyhow!("Temperature band is empty"));
        }
        Ok(updated)
    }
}

/// Durable single-record store for the HatchConfig
pub struct ConfigStore {
    blobs: SharedBlobStore,
    lock: Mutex<()>,
}

impl ConfigStore {
    pub fn new(blobs: SharedBlobStore) -> Self {
        Self {
            blobs,
            lock: Mutex::new(()),
        }
    }

    /// Persisted config, or defaults when the record is missing or invalid
    pub fn load(&self) -> HatchConfig {
        let record = lock_store(&self.lock, "hatch config")
            .and_then(|_guard| self.blobs.read(HATCH_CONFIG_BLOB));

        match record {
            Ok(Some(bytes)) => match HatchConfig::from_bytes(&bytes) {
                Some(config) => {
                    debug!("💾 Loaded hatch config for hatch '{}'", config.uuid);
                    config
                }
                None => {
                    warn!(
                        "⚠️ Stored hatch config invalid ({} bytes) - using defaults",
                        bytes.len()
                    );
                    HatchConfig::default()
                }
            },
            Ok(None) => {
                info!("💾 No hatch config stored - using defaults");
                HatchConfig::default()
            }
            Err(e) => {
                warn!("⚠️ Failed to read hatch config: {} - using defaults", e);
                HatchConfig::default()
            }
        }
    }

    pub fn save(&self, config: &HatchConfig) -> StoreResult<()> {
        let _guard = lock_store(&self.lock, "hatch config")?;
        self.blobs.write(HATCH_CONFIG_BLOB, &config.to_bytes())
    }

    pub fn clear(&self) -> StoreResult<()> {
        let _guard = lock_store(&self.lock, "hatch config")?;
        self.blobs.remove(HATCH_CONFIG_BLOB)
    }
}
