// Shadow Sync Module
// Bounded exchange with the cloud device shadow: request the document, pump the
// client until the desired config arrives, a reset is requested, or the pump
// budget runs out, then always disconnect

use std::fmt;

// Import anyhow for error handling
use anyhow::{anyhow, Result};

// Import Embassy utilities for the pump loop
use embassy_futures::select::{select, Either};
use embassy_time::{Duration, Timer};

// Import logging macros
use log::{debug, info, warn};

// Import serde_json for the shadow document
use serde_json::{Map, Value};

use crate::hatch_config::HatchConfig;
use crate::signals::{SignalBits, SignalRegister};

// Shadow sync timing
pub const CLOUD_CONNECT_TIMEOUT: Duration = Duration::from_secs(20); // MQTT command timeout
pub const SHADOW_PROCESS_STEP: Duration = Duration::from_millis(500); // Client work per pump
pub const SHADOW_PUMP_INTERVAL: Duration = Duration::from_millis(500); // Pause between pumps
pub const SHADOW_MAX_PUMPS: u32 = 60; // Roughly one minute end to end
const SHADOW_WAIT_SLACK: Duration = Duration::from_secs(1);

// Shadow document keys
const DESIRED_KEY: &str = "desired";
const STATE_KEY: &str = "state";
const HATCH_UUID_KEY: &str = "hatchUUID";
const END_UNIX_TIMESTAMP_KEY: &str = "endUnixTimestamp";
const MEASURE_INTERVAL_KEY: &str = "measureIntervalSec";
const PUBLISH_THRESHOLD_KEY: &str = "measurementsBeforePublishing";
const LOW_TEMPERATURE_KEY: &str = "lowTemperature";
const HIGH_TEMPERATURE_KEY: &str = "highTemperature";
const LOW_READINGS_ERROR_KEY: &str = "consecutiveLowReadingsError";
const HIGH_READINGS_ERROR_KEY: &str = "consecutiveHighReadingsError";
const TEMPERATURE_OFFSET_KEY: &str = "temperatureOffset";

/// Shadow document errors
#[derive(Debug, Clone, PartialEq)]
pub enum ShadowError {
    NotJson(String),
    MissingDesired,
    MissingKey(&'static str),
    InvalidValue { key: &'static str, reason: String },
}

impl fmt::Display for ShadowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShadowError::NotJson(msg) => write!(f, "Shadow document is not JSON: {}", msg),
            ShadowError::MissingDesired => write!(f, "Shadow document has no desired object"),
            ShadowError::MissingKey(key) => write!(f, "Desired config missing '{}'", key),
            ShadowError::InvalidValue { key, reason } => {
                write!(f, "Desired config '{}' invalid: {}", key, reason)
            }
        }
    }
}

impl std::error::Error for ShadowError {}

/// Receives raw shadow documents delivered while the client is pumped
pub trait ShadowListener {
    fn on_shadow_document(&mut self, document: &[u8]);
}

/// Cloud MQTT session. Every call blocks at most for its timeout.
pub trait CloudClient {
    fn connect(&mut self, client_id: &str, timeout: Duration) -> Result<()>;

    /// Issue the asynchronous shadow get; the answer arrives through `process`
    fn request_shadow(&mut self, thing_name: &str) -> Result<()>;

    /// Run one network step of up to `timeout`, handing shadow documents to `listener`
    fn process(&mut self, timeout: Duration, listener: &mut dyn ShadowListener) -> Result<()>;

    fn publish(&mut self, topic: &str, payload: &[u8], timeout: Duration) -> Result<()>;

    fn disconnect(&mut self);
}

/// Desired configuration carried by a shadow document
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DesiredConfig {
    pub hatch_uuid: String,
    pub end_unix_timestamp: u32,
    pub measure_interval_sec: u32,
    pub measurements_before_publishing: Option<u32>,
    pub temperature_low_celsius: Option<f32>,
    pub temperature_high_celsius: Option<f32>,
    pub consecutive_low_readings_error: Option<u32>,
    pub consecutive_high_readings_error: Option<u32>,
    pub temperature_offset_celsius: Option<f32>,
}

impl DesiredConfig {
    /// Extract the desired object, found at the top level or under `state`
    pub fn from_document(document: &[u8]) -> Result<Self, ShadowError> {
        let root: Value =
            serde_json::from_slice(document).map_err(|e| ShadowError::NotJson(e.to_string()))?;

        let desired = root
            .get(DESIRED_KEY)
            .or_else(|| root.get(STATE_KEY).and_then(|state| state.get(DESIRED_KEY)))
            .and_then(Value::as_object)
            .ok_or(ShadowError::MissingDesired)?;

        let hatch_uuid = desired
            .get(HATCH_UUID_KEY)
            .ok_or(ShadowError::MissingKey(HATCH_UUID_KEY))?
            .as_str()
            .ok_or_else(|| ShadowError::InvalidValue {
                key: HATCH_UUID_KEY,
                reason: "expected a string".to_string(),
            })?
            .to_string();

        Ok(Self {
            hatch_uuid,
            end_unix_timestamp: required_u32(desired, END_UNIX_TIMESTAMP_KEY)?,
            measure_interval_sec: required_u32(desired, MEASURE_INTERVAL_KEY)?,
            measurements_before_publishing: optional_u32(desired, PUBLISH_THRESHOLD_KEY)?,
            temperature_low_celsius: optional_f32(desired, LOW_TEMPERATURE_KEY)?,
            temperature_high_celsius: optional_f32(desired, HIGH_TEMPERATURE_KEY)?,
            consecutive_low_readings_error: optional_u32(desired, LOW_READINGS_ERROR_KEY)?,
            consecutive_high_readings_error: optional_u32(desired, HIGH_READINGS_ERROR_KEY)?,
            temperature_offset_celsius: optional_f32(desired, TEMPERATURE_OFFSET_KEY)?,
        })
    }

    /// Merge onto a scratch copy of `current`; `current` is untouched on error
    pub fn apply(&self, current: &HatchConfig) -> Result<HatchConfig, ShadowError> {
        let mut scratch = current.clone();
        scratch.uuid = self.hatch_uuid.clone();
        scratch.end_unix_timestamp = self.end_unix_timestamp;
        scratch.measure_interval_sec = self.measure_interval_sec;

        if let Some(total) = self.measurements_before_publishing {
            scratch.measurements_before_publishing = total;
        }
        if let Some(low) = self.temperature_low_celsius {
            scratch.temperature_low_celsius = low;
        }
        if let Some(high) = self.temperature_high_celsius {
            scratch.temperature_high_celsius = high;
        }
        if let Some(errors) = self.consecutive_low_readings_error {
            scratch.consecutive_low_readings_error = errors;
        }
        if let Some(errors) = self.consecutive_high_readings_error {
            scratch.consecutive_high_readings_error = errors;
        }
        if let Some(offset) = self.temperature_offset_celsius {
            scratch.temperature_offset_celsius = offset;
        }

        scratch
            .validate()
            .map_err(|e| ShadowError::InvalidValue {
                key: DESIRED_KEY,
                reason: e.to_string(),
            })?;
        Ok(scratch)
    }
}

// Integers may arrive as JSON numbers or as numeric strings
fn parse_u32(key: &'static str, value: &Value) -> Result<u32, ShadowError> {
    let parsed = match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse::<u32>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| ShadowError::InvalidValue {
        key,
        reason: format!("expected an unsigned 32-bit integer, got {}", value),
    })
}

fn required_u32(desired: &Map<String, Value>, key: &'static str) -> Result<u32, ShadowError> {
    let value = desired.get(key).ok_or(ShadowError::MissingKey(key))?;
    parse_u32(key, value)
}

fn optional_u32(desired: &Map<String, Value>, key: &'static str) -> Result<Option<u32>, ShadowError> {
    desired.get(key).map(|value| parse_u32(key, value)).transpose()
}

fn optional_f32(desired: &Map<String, Value>, key: &'static str) -> Result<Option<f32>, ShadowError> {
    desired
        .get(key)
        .map(|value| {
            value
                .as_f64()
                .map(|v| v as f32)
                .ok_or_else(|| ShadowError::InvalidValue {
                    key,
                    reason: format!("expected a number, got {}", value),
                })
        })
        .transpose()
}

/// Result of one shadow exchange
#[derive(Debug, Clone, PartialEq)]
pub enum ShadowOutcome {
    Updated(HatchConfig),
    NotReceived,
    ResetRequested,
}

// Listener owned by a single exchange; merges into a scratch copy
struct ShadowCollector<'a> {
    signals: &'a SignalRegister,
    current: HatchConfig,
    received: Option<HatchConfig>,
}

impl ShadowListener for ShadowCollector<'_> {
    fn on_shadow_document(&mut self, document: &[u8]) {
        match DesiredConfig::from_document(document).and_then(|d| d.apply(&self.current)) {
            Ok(config) => {
                info!(
                    "📡 Shadow config received for hatch '{}' (ends {}, every {}s)",
                    config.uuid, config.end_unix_timestamp, config.measure_interval_sec
                );
                self.received = Some(config);
                self.signals.set(SignalBits::CONFIG_SHADOW_RECEIVED);
            }
            Err(e) => warn!("⚠️ Shadow document discarded: {}", e),
        }
    }
}

/// Pacing of the client pump during a shadow get
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpSchedule {
    pub process_step: Duration,
    pub pump_interval: Duration,
    pub max_pumps: u32,
}

impl Default for PumpSchedule {
    fn default() -> Self {
        Self {
            process_step: SHADOW_PROCESS_STEP,
            pump_interval: SHADOW_PUMP_INTERVAL,
            max_pumps: SHADOW_MAX_PUMPS,
        }
    }
}

/// Drives one bounded shadow get over a CloudClient
pub struct ShadowSync<'a> {
    signals: &'a SignalRegister,
    schedule: PumpSchedule,
}

impl<'a> ShadowSync<'a> {
    pub fn new(signals: &'a SignalRegister, schedule: PumpSchedule) -> Self {
        Self { signals, schedule }
    }

    /// Connect as `client_id`, fetch the shadow of the same thing, disconnect.
    /// `current` is only ever copied; committing the result is the caller's job.
    pub async fn fetch(
        &self,
        cloud: &mut dyn CloudClient,
        client_id: &str,
        current: &HatchConfig,
    ) -> Result<ShadowOutcome> {
        // ConfigShadowReceived is owned by this exchange
        self.signals.clear(SignalBits::CONFIG_SHADOW_RECEIVED);

        cloud
            .connect(client_id, CLOUD_CONNECT_TIMEOUT)
            .map_err(|e| anyhow!("Failed to connect for shadow sync: {}", e))?;

        let outcome = self.exchange(cloud, client_id, current).await;

        cloud.disconnect();
        self.signals.clear(SignalBits::CONFIG_SHADOW_RECEIVED);
        outcome
    }

    async fn exchange(
        &self,
        cloud: &mut dyn CloudClient,
        thing_name: &str,
        current: &HatchConfig,
    ) -> Result<ShadowOutcome> {
        cloud
            .request_shadow(thing_name)
            .map_err(|e| anyhow!("Failed to request shadow: {}", e))?;

        let mut collector = ShadowCollector {
            signals: self.signals,
            current: current.clone(),
            received: None,
        };

        let PumpSchedule {
            process_step,
            pump_interval,
            max_pumps,
        } = self.schedule;

        // The pump arm ends the exchange; the wait bound only backs it up
        let budget = (process_step + pump_interval) * max_pumps + SHADOW_WAIT_SLACK;
        let waiting = self
            .signals
            .wait(SignalBits::CONFIG_SHADOW_RECEIVED, budget);
        let pumping = async {
            for pump in 1..=max_pumps {
                cloud.process(process_step, &mut collector)?;
                debug!("📡 Shadow pump {}/{}", pump, max_pumps);
                Timer::after(pump_interval).await;
            }
            Ok::<(), anyhow::Error>(())
        };

        if let Either::Second(Err(e)) = select(waiting, pumping).await {
            return Err(anyhow!("Shadow pump failed: {}", e));
        }

        if self.signals.get().contains(SignalBits::RESET_REQUESTED) {
            return Ok(ShadowOutcome::ResetRequested);
        }

        Ok(match collector.received.take() {
            Some(config) => ShadowOutcome::Updated(config),
            None => {
                warn!("⚠️ No shadow config after {} pumps", max_pumps);
                ShadowOutcome::NotReceived
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimCloud;
    use futures::executor::block_on;

    const DOCUMENT: &str = r#"{
        "state": {
            "desired": {
                "hatchUUID": "0b7c4b53-8d1e-4c8e-a4a5-5a0d2f6f3b1e",
                "endUnixTimestamp": 1735689600,
                "measureIntervalSec": "600",
                "measurementsBeforePublishing": 12
            },
            "reported": {"hatchUUID": "old"}
        },
        "version": 7
    }"#;

    fn fast(signals: &SignalRegister) -> ShadowSync<'_> {
        ShadowSync::new(
            signals,
            PumpSchedule {
                process_step: Duration::from_millis(1),
                pump_interval: Duration::from_millis(2),
                max_pumps: 5,
            },
        )
    }

    #[test]
    fn test_extract_nested_desired() {
        let desired = DesiredConfig::from_document(DOCUMENT.as_bytes()).unwrap();
        assert_eq!(desired.hatch_uuid, "0b7c4b53-8d1e-4c8e-a4a5-5a0d2f6f3b1e");
        assert_eq!(desired.end_unix_timestamp, 1_735_689_600);
        assert_eq!(desired.measure_interval_sec, 600);
        assert_eq!(desired.measurements_before_publishing, Some(12));
        assert_eq!(desired.temperature_low_celsius, None);
    }

    #[test]
    fn test_extract_top_level_desired_with_reordered_keys() {
        let document = br#"{"desired": {"measureIntervalSec": 60, "nested": {"a": 1},
            "endUnixTimestamp": 5, "hatchUUID": "h"}}"#;
        let desired = DesiredConfig::from_document(document).unwrap();
        assert_eq!(desired.hatch_uuid, "h");
        assert_eq!(desired.measure_interval_sec, 60);
    }

    #[test]
    fn test_partial_document_is_rejected() {
        let partial = br#"{"desired": {"hatchUUID": "h", "endUnixTimestamp": 5}}"#;
        assert_eq!(
            DesiredConfig::from_document(partial),
            Err(ShadowError::MissingKey(MEASURE_INTERVAL_KEY))
        );

        let garbage = br#"{"desired": {"hatchUUID": "h", "endUnixTimestamp": -1, "measureIntervalSec": 60}}"#;
        assert!(matches!(
            DesiredConfig::from_document(garbage),
            Err(ShadowError::InvalidValue { key: END_UNIX_TIMESTAMP_KEY, .. })
        ));

        assert_eq!(
            DesiredConfig::from_document(br#"{"reported": {}}"#),
            Err(ShadowError::MissingDesired)
        );
        assert!(matches!(
            DesiredConfig::from_document(b"{desired"),
            Err(ShadowError::NotJson(_))
        ));
    }

    #[test]
    fn test_apply_keeps_current_on_invalid_merge() {
        let current = HatchConfig {
            uuid: "previous".to_string(),
            ..HatchConfig::default()
        };
        let desired = DesiredConfig {
            hatch_uuid: String::new(),
            end_unix_timestamp: 10,
            measure_interval_sec: 60,
            ..DesiredConfig::default()
        };

        assert!(desired.apply(&current).is_err());
        assert_eq!(current.uuid, "previous");
    }

    #[test]
    fn test_fetch_commits_complete_document() {
        let signals = SignalRegister::new();
        let mut cloud = SimCloud::new();
        cloud.respond_with(DOCUMENT, 2);
        let current = HatchConfig {
            measurements_since_publish: 3,
            ..HatchConfig::default()
        };

        let outcome = block_on(fast(&signals).fetch(&mut cloud, "peep-1", &current)).unwrap();

        let ShadowOutcome::Updated(config) = outcome else {
            panic!("expected an updated config, got {:?}", outcome);
        };
        assert_eq!(config.uuid, "0b7c4b53-8d1e-4c8e-a4a5-5a0d2f6f3b1e");
        assert_eq!(config.measurements_before_publishing, 12);
        assert_eq!(config.measurements_since_publish, 3);
        assert_eq!(cloud.requested_things(), vec!["peep-1".to_string()]);
        assert!(!cloud.is_connected());
        assert!(!signals.get().contains(SignalBits::CONFIG_SHADOW_RECEIVED));
    }

    #[test]
    fn test_fetch_gives_up_after_pump_budget() {
        let signals = SignalRegister::new();
        let mut cloud = SimCloud::new();

        let outcome = block_on(fast(&signals).fetch(&mut cloud, "peep-1", &HatchConfig::default()));

        assert_eq!(outcome.unwrap(), ShadowOutcome::NotReceived);
        assert_eq!(cloud.process_calls(), 5);
        assert!(!cloud.is_connected());
    }

    #[test]
    fn test_fetch_discards_malformed_document() {
        let signals = SignalRegister::new();
        let mut cloud = SimCloud::new();
        cloud.respond_with(r#"{"desired": {"hatchUUID": "h"}}"#, 1);

        let outcome = block_on(fast(&signals).fetch(&mut cloud, "peep-1", &HatchConfig::default()));

        assert_eq!(outcome.unwrap(), ShadowOutcome::NotReceived);
    }

    #[test]
    fn test_fetch_stops_on_reset() {
        let signals = SignalRegister::new();
        signals.set(SignalBits::RESET_REQUESTED);
        let mut cloud = SimCloud::new();
        cloud.respond_with(DOCUMENT, 3);

        let outcome = block_on(fast(&signals).fetch(&mut cloud, "peep-1", &HatchConfig::default()));

        assert_eq!(outcome.unwrap(), ShadowOutcome::ResetRequested);
        assert!(!cloud.is_connected());
    }

    #[test]
    fn test_fetch_reports_connect_failure() {
        let signals = SignalRegister::new();
        let mut cloud = SimCloud::new();
        cloud.set_reachable(false);

        let outcome = block_on(fast(&signals).fetch(&mut cloud, "peep-1", &HatchConfig::default()));

        assert!(outcome.is_err());
        assert_eq!(cloud.process_calls(), 0);
    }
}
