// Measurement Cycle Module
// One wake in the Measure state: read, count, apply the publish policy, then
// either buffer the reading locally or run the network path and publish the batch

// Import anyhow for error handling
use anyhow::{anyhow, Result};

// Import Embassy time utilities
use embassy_time::Duration;

// Import logging macros
use log::{error, info, warn};

use crate::hatch_config::HatchConfig;
use crate::lifecycle::{DeviceContext, LinkStatus};
use crate::measurement::Measurement;
use crate::shadow::{ShadowOutcome, CLOUD_CONNECT_TIMEOUT};

// Publish constants
pub const MEASUREMENT_TOPIC: &str = "hatchtrack/data/put";
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);
pub const FALLBACK_INTERVAL_SEC: u32 = 15 * 60; // Used when the network path is unavailable

/// What the lifecycle controller does after a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Stay in Measure and sleep this many seconds
    Sleep(u32),
    /// End-timestamp reached; go back to MeasureConfig
    HatchEnded,
    ResetRequested,
}

// Result of the network path of one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PublishResult {
    Published,
    Failed,
    Offline,
    Reset,
}

pub struct MeasurementCycle<'c> {
    ctx: &'c mut DeviceContext,
}

impl<'c> MeasurementCycle<'c> {
    pub fn new(ctx: &'c mut DeviceContext) -> Self {
        Self { ctx }
    }

    pub async fn run(&mut self) -> Result<CycleOutcome> {
        let mut config = self.ctx.config.load();

        let reading = match self.ctx.sensor.read() {
            Ok(reading) => reading,
            Err(e) => {
                warn!("⚠️ Sensor read failed, skipping cycle: {}", e);
                return Ok(CycleOutcome::Sleep(config.measure_interval_sec));
            }
        };

        // Timestamp is best effort until the first successful time sync
        let now = self.ctx.clock.unix_time();
        let temperature = config.corrected_temperature(reading.temperature);
        let measurement = Measurement {
            unix_timestamp: now,
            temperature,
            humidity: reading.humidity,
            pressure: reading.pressure,
            gas_resistance: reading.gas_resistance,
        };
        info!(
            "🌡️ {:.2}C {:.1}% {:.0}Pa at {}",
            measurement.temperature, measurement.humidity, measurement.pressure, now
        );

        config.record_reading(temperature);
        let mut offline = false;
        let mut reset = false;

        match config.publish_reason(now) {
            None => self.buffer(&measurement),
            Some(reason) => {
                info!(
                    "📡 Publishing ({:?}) after {} readings",
                    reason, config.measurements_since_publish
                );
                match self.publish(&mut config, &measurement).await {
                    PublishResult::Published => {
                        self.ctx
                            .log
                            .delete_all()
                            .map_err(|e| anyhow!("Failed to clear measurement log: {}", e))?;
                        config.reset_publish_counters();
                    }
                    PublishResult::Failed => self.buffer(&measurement),
                    PublishResult::Offline => {
                        self.buffer(&measurement);
                        offline = true;
                    }
                    PublishResult::Reset => {
                        self.buffer(&measurement);
                        reset = true;
                    }
                }
            }
        }

        // Judged on the refreshed config so an extended hatch keeps measuring
        let hatch_ended = config.hatch_ended(now);

        // Commits any shadow refresh together with the updated counters
        self.ctx
            .config
            .save(&config)
            .map_err(|e| anyhow!("Failed to save hatch config: {}", e))?;

        Ok(if reset {
            CycleOutcome::ResetRequested
        } else if hatch_ended {
            info!("🏁 Hatch '{}' ended at {}", config.uuid, config.end_unix_timestamp);
            CycleOutcome::HatchEnded
        } else if offline {
            CycleOutcome::Sleep(FALLBACK_INTERVAL_SEC)
        } else {
            CycleOutcome::Sleep(config.measure_interval_sec)
        })
    }

    // A lost record is logged, never fatal
    fn buffer(&self, measurement: &Measurement) {
        if let Err(e) = self.ctx.log.append(measurement) {
            error!(
                "❌ Failed to buffer measurement at {}: {}",
                measurement.unix_timestamp, e
            );
        }
    }

    async fn publish(&mut self, config: &mut HatchConfig, current: &Measurement) -> PublishResult {
        let result = self.publish_online(config, current).await;
        self.ctx.network.disconnect();
        result
    }

    async fn publish_online(
        &mut self,
        config: &mut HatchConfig,
        current: &Measurement,
    ) -> PublishResult {
        match self.ctx.bring_up_network().await {
            LinkStatus::Up => {}
            LinkStatus::Down => return PublishResult::Offline,
            LinkStatus::ResetRequested => return PublishResult::Reset,
        }

        match self.ctx.fetch_shadow(config).await {
            Some(ShadowOutcome::Updated(updated)) => *config = updated,
            Some(ShadowOutcome::NotReceived) => {}
            Some(ShadowOutcome::ResetRequested) => return PublishResult::Reset,
            None => return PublishResult::Offline,
        }

        let records = match self.ctx.log.read_all() {
            Ok(records) => records,
            Err(e) => {
                warn!("⚠️ Failed to read measurement log: {}", e);
                return PublishResult::Failed;
            }
        };

        let peep_id = self.ctx.peep_id();
        if let Err(e) = self.ctx.cloud.connect(&peep_id, CLOUD_CONNECT_TIMEOUT) {
            warn!("⚠️ Cloud connect failed: {}", e);
            return PublishResult::Offline;
        }

        let result = self.publish_batch(&peep_id, &config.uuid, &records, current);
        self.ctx.cloud.disconnect();
        result
    }

    // Log records in order, then the current reading; stop at the first failure
    fn publish_batch(
        &mut self,
        peep_id: &str,
        hatch_uuid: &str,
        records: &[Measurement],
        current: &Measurement,
    ) -> PublishResult {
        let total = records.len() + 1;
        for (index, measurement) in records.iter().chain(std::iter::once(current)).enumerate() {
            let payload = match serde_json::to_vec(&measurement.to_message(peep_id, hatch_uuid)) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("⚠️ Failed to encode measurement: {}", e);
                    return PublishResult::Failed;
                }
            };

            if let Err(e) = self
                .ctx
                .cloud
                .publish(MEASUREMENT_TOPIC, &payload, PUBLISH_TIMEOUT)
            {
                warn!(
                    "⚠️ Publish {}/{} failed, keeping the log: {}",
                    index + 1,
                    total,
                    e
                );
                return PublishResult::Failed;
            }
        }

        info!("✅ Published {} measurements", total);
        PublishResult::Published
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::tests::{bench, Bench, END_DOCUMENT_TEMPLATE, NOW, YEAR_SEC};
    use futures::executor::block_on;

    fn configured(bench: &Bench, threshold: u32) {
        configured_until(bench, threshold, bench.clock.now() + YEAR_SEC);
    }

    fn configured_until(bench: &Bench, threshold: u32, end: u32) {
        let config = HatchConfig {
            uuid: "hatch-1".to_string(),
            end_unix_timestamp: end,
            measurements_before_publishing: threshold,
            ..HatchConfig::default()
        };
        bench.ctx.config.save(&config).unwrap();
    }

    // RTC still at its power-on value, well before 2016
    const UNSYNCED_TIME: u32 = 1_000;

    #[test]
    fn test_cycle_buffers_until_threshold() {
        let mut bench = bench();
        configured(&bench, 3);

        for _ in 0..2 {
            let outcome = block_on(MeasurementCycle::new(&mut bench.ctx).run()).unwrap();
            assert_eq!(outcome, CycleOutcome::Sleep(900));
        }

        assert_eq!(bench.ctx.log.total().unwrap(), 2);
        assert_eq!(bench.ctx.config.load().measurements_since_publish, 2);
        assert!(bench.cloud.published().is_empty());
        assert_eq!(bench.network.connects(), 0);
    }

    #[test]
    fn test_cycle_applies_temperature_offset() {
        let mut bench = bench();
        configured(&bench, 10);
        let mut config = bench.ctx.config.load();
        config.temperature_offset_celsius = -1.5;
        bench.ctx.config.save(&config).unwrap();
        bench.sensor.push(39.0);

        block_on(MeasurementCycle::new(&mut bench.ctx).run()).unwrap();

        let records = bench.ctx.log.read_all().unwrap();
        assert_eq!(records[0].temperature, 37.5);
    }

    #[test]
    fn test_partial_publish_keeps_everything() {
        let mut bench = bench();
        configured(&bench, 4);
        let end = bench.clock.now() + 365 * 86_400;
        bench.cloud.respond_with(&END_DOCUMENT_TEMPLATE.replace("{end}", &end.to_string()), 1);
        bench.cloud.fail_publish_after(2);

        for _ in 0..3 {
            block_on(MeasurementCycle::new(&mut bench.ctx).run()).unwrap();
        }
        let outcome = block_on(MeasurementCycle::new(&mut bench.ctx).run()).unwrap();

        assert_eq!(outcome, CycleOutcome::Sleep(900));
        assert_eq!(bench.cloud.published().len(), 2);
        // The three buffered readings plus the current one stay for the next batch
        assert_eq!(bench.ctx.log.total().unwrap(), 4);
        assert_eq!(bench.ctx.config.load().measurements_since_publish, 4);
        assert!(!bench.network.is_connected());
        assert!(!bench.cloud.is_connected());
    }

    #[test]
    fn test_offline_publish_uses_fallback_interval() {
        let mut bench = bench();
        configured(&bench, 1);
        bench.network.set_reachable(false);

        let outcome = block_on(MeasurementCycle::new(&mut bench.ctx).run()).unwrap();

        assert_eq!(outcome, CycleOutcome::Sleep(FALLBACK_INTERVAL_SEC));
        assert_eq!(bench.ctx.log.total().unwrap(), 1);
        assert_eq!(bench.ctx.config.load().measurements_since_publish, 1);
    }

    #[test]
    fn test_high_reading_publishes_immediately() {
        let mut bench = bench();
        configured(&bench, 48);
        let end = bench.clock.now() + 365 * 86_400;
        bench.cloud.respond_with(&END_DOCUMENT_TEMPLATE.replace("{end}", &end.to_string()), 1);
        bench.sensor.push(41.0);

        let outcome = block_on(MeasurementCycle::new(&mut bench.ctx).run()).unwrap();

        assert_eq!(outcome, CycleOutcome::Sleep(900));
        let published = bench.cloud.published_json();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0]["temperature"], 41.0);
        assert_eq!(published[0]["hatchUUID"], "hatch-1");
        assert_eq!(bench.ctx.log.total().unwrap(), 0);
        assert_eq!(bench.ctx.config.load().consecutive_high_readings, 0);
    }

    #[test]
    fn test_failed_time_sync_keeps_raw_timestamp() {
        let mut bench = bench();
        bench.clock.set(UNSYNCED_TIME);
        configured_until(&bench, 1, NOW + YEAR_SEC);

        let outcome = block_on(MeasurementCycle::new(&mut bench.ctx).run()).unwrap();

        assert_eq!(outcome, CycleOutcome::Sleep(FALLBACK_INTERVAL_SEC));
        assert_eq!(bench.network.connects(), 1);
        assert!(!bench.network.is_connected());
        assert!(bench.cloud.published().is_empty());
        let records = bench.ctx.log.read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].unix_timestamp, UNSYNCED_TIME);
    }

    #[test]
    fn test_time_sync_corrects_later_readings() {
        let mut bench = bench();
        bench.clock.set(UNSYNCED_TIME);
        bench.clock.set_network_time(NOW);
        configured_until(&bench, 1, NOW + YEAR_SEC);

        let outcome = block_on(MeasurementCycle::new(&mut bench.ctx).run()).unwrap();
        assert_eq!(outcome, CycleOutcome::Sleep(900));
        assert_eq!(bench.clock.now(), NOW);

        block_on(MeasurementCycle::new(&mut bench.ctx).run()).unwrap();

        // The first reading was taken before the sync and keeps its best-effort time
        let times: Vec<u64> = bench
            .cloud
            .published_json()
            .iter()
            .map(|m| m["unixTime"].as_u64().unwrap())
            .collect();
        assert_eq!(times, vec![u64::from(UNSYNCED_TIME), u64::from(NOW)]);
        assert_eq!(bench.ctx.log.total().unwrap(), 0);
    }

    #[test]
    fn test_shadow_extending_hatch_keeps_measuring() {
        let mut bench = bench();
        configured_until(&bench, 48, NOW);
        let end = NOW + YEAR_SEC;
        bench.cloud.respond_with(&END_DOCUMENT_TEMPLATE.replace("{end}", &end.to_string()), 1);

        let outcome = block_on(MeasurementCycle::new(&mut bench.ctx).run()).unwrap();

        assert_eq!(outcome, CycleOutcome::Sleep(900));
        assert_eq!(bench.cloud.published().len(), 1);
        assert_eq!(bench.ctx.config.load().end_unix_timestamp, end);
    }

    #[test]
    fn test_sensor_failure_skips_cycle() {
        let mut bench = bench();
        configured(&bench, 1);
        bench.ctx.sensor = Box::new(FailingSensor);

        let outcome = block_on(MeasurementCycle::new(&mut bench.ctx).run()).unwrap();

        assert_eq!(outcome, CycleOutcome::Sleep(900));
        assert_eq!(bench.ctx.log.total().unwrap(), 0);
        assert_eq!(bench.ctx.config.load().measurements_since_publish, 0);
    }

    struct FailingSensor;

    impl crate::platform::EnvironmentSensor for FailingSensor {
        fn read(&mut self) -> Result<crate::platform::EnvironmentReading> {
            Err(anyhow!("I2C timeout"))
        }
    }
}
