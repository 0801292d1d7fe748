// Lifecycle Controller Module
// Persisted device state machine: BLE provisioning, cloud configuration and the
// measurement loop, with factory reset and the button-aware deep sleep

use std::convert::Infallible;
use std::sync::Arc;

// Import anyhow for error handling
use anyhow::{anyhow, Result};

// Import Embassy time utilities
use embassy_time::Duration;

// Import logging macros
use log::{info, warn};

use crate::clock::{sync_time, tick_duration, Clock, TimeSyncSchedule};
use crate::credentials::{CredentialStore, IdentityStore};
use crate::cycle::{CycleOutcome, MeasurementCycle, FALLBACK_INTERVAL_SEC};
use crate::device_state::{DeviceState, StateStore};
use crate::hatch_config::{ConfigStore, HatchConfig};
use crate::measurement::MeasurementLog;
use crate::platform::{EnvironmentSensor, Network, PowerControl};
use crate::provisioning::{ProvisioningSession, ProvisioningTransport};
use crate::shadow::{CloudClient, PumpSchedule, ShadowOutcome, ShadowSync};
use crate::signals::{SignalBits, SignalRegister};
use crate::storage::SharedBlobStore;

// Phase timing
pub const BLE_CONFIG_WINDOW: Duration = Duration::from_secs(10 * 60);
pub const WIFI_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const BLE_RETRY_SLEEP_SEC: u32 = 60 * 60; // No credentials received; the button wakes early
pub const HANDOFF_SLEEP_SEC: u32 = 1; // Reboot so the next phase owns the radio
pub const MIN_SLEEP_SEC: u32 = 1;
// Release wait for short sleeps such as the hand-off after a long press
pub const MIN_RELEASE_WAIT: Duration = Duration::from_secs(10);

/// Timeouts of the blocking phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleTiming {
    pub ble_window: Duration,
    pub wifi_timeout: Duration,
    pub time_sync: TimeSyncSchedule,
    pub shadow: PumpSchedule,
}

impl Default for LifecycleTiming {
    fn default() -> Self {
        Self {
            ble_window: BLE_CONFIG_WINDOW,
            wifi_timeout: WIFI_CONNECT_TIMEOUT,
            time_sync: TimeSyncSchedule::default(),
            shadow: PumpSchedule::default(),
        }
    }
}

/// Outcome of bringing the station link and the clock up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Up,
    Down,
    ResetRequested,
}

/// Hardware handed to the device context
pub struct Collaborators {
    pub sensor: Box<dyn EnvironmentSensor>,
    pub network: Box<dyn Network>,
    pub cloud: Box<dyn CloudClient>,
    pub clock: Box<dyn Clock>,
    pub provisioning: Box<dyn ProvisioningTransport>,
    pub power: Box<dyn PowerControl>,
}

/// Everything one boot works with
pub struct DeviceContext {
    pub signals: &'static SignalRegister,
    /// MAC-derived id used until a peep uuid is provisioned
    pub device_id: String,
    pub states: StateStore,
    pub config: Arc<ConfigStore>,
    pub credentials: Arc<CredentialStore>,
    pub identity: Arc<IdentityStore>,
    pub log: MeasurementLog,
    pub sensor: Box<dyn EnvironmentSensor>,
    pub network: Box<dyn Network>,
    pub cloud: Box<dyn CloudClient>,
    pub clock: Box<dyn Clock>,
    pub provisioning: Box<dyn ProvisioningTransport>,
    pub power: Box<dyn PowerControl>,
    pub timing: LifecycleTiming,
}

impl DeviceContext {
    pub fn new(
        signals: &'static SignalRegister,
        device_id: &str,
        blobs: SharedBlobStore,
        parts: Collaborators,
    ) -> Self {
        Self {
            signals,
            device_id: device_id.to_string(),
            states: StateStore::new(blobs.clone()),
            config: Arc::new(ConfigStore::new(blobs.clone())),
            credentials: Arc::new(CredentialStore::new(blobs.clone())),
            identity: Arc::new(IdentityStore::new(blobs.clone())),
            log: MeasurementLog::new(blobs),
            sensor: parts.sensor,
            network: parts.network,
            cloud: parts.cloud,
            clock: parts.clock,
            provisioning: parts.provisioning,
            power: parts.power,
            timing: LifecycleTiming::default(),
        }
    }

    pub fn with_timing(mut self, timing: LifecycleTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Cloud client id and shadow thing name
    pub fn peep_id(&self) -> String {
        self.identity.peep_id(&self.device_id)
    }

    /// Join the stored network and get a valid clock. The caller disconnects.
    pub async fn bring_up_network(&mut self) -> LinkStatus {
        let Some(credentials) = self.credentials.load() else {
            warn!("⚠️ No WiFi credentials stored");
            return LinkStatus::Down;
        };

        self.signals
            .clear(SignalBits::WIFI_UP | SignalBits::WIFI_DOWN);
        info!("📡 Connecting to WiFi network '{}'", credentials.ssid);
        if let Err(e) = self
            .network
            .connect(&credentials, self.timing.wifi_timeout)
        {
            warn!("⚠️ WiFi connection failed: {}", e);
            return LinkStatus::Down;
        }

        let bits = self
            .signals
            .wait(SignalBits::WIFI_UP, self.timing.wifi_timeout)
            .await;
        if bits.contains(SignalBits::RESET_REQUESTED) {
            return LinkStatus::ResetRequested;
        }
        if !bits.contains(SignalBits::WIFI_UP) {
            warn!("⚠️ No IP address within {}s", self.timing.wifi_timeout.as_secs());
            return LinkStatus::Down;
        }

        if !sync_time(self.clock.as_mut(), self.signals, self.timing.time_sync).await {
            if self.signals.get().contains(SignalBits::RESET_REQUESTED) {
                return LinkStatus::ResetRequested;
            }
            warn!("⚠️ Time sync unavailable");
            return LinkStatus::Down;
        }

        info!("✅ Online with a valid clock");
        LinkStatus::Up
    }

    /// One shadow get for this device; None when the cloud was unreachable
    pub async fn fetch_shadow(&mut self, current: &HatchConfig) -> Option<ShadowOutcome> {
        let peep_id = self.peep_id();
        let sync = ShadowSync::new(self.signals, self.timing.shadow);
        match sync.fetch(self.cloud.as_mut(), &peep_id, current).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!("⚠️ Shadow sync failed: {}", e);
                None
            }
        }
    }
}

/// Drives the persisted DeviceState across boots
pub struct LifecycleController {
    ctx: DeviceContext,
}

impl LifecycleController {
    pub fn new(ctx: DeviceContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut DeviceContext {
        &mut self.ctx
    }

    /// Boot forever. Only returns on a fatal store failure.
    pub async fn run(&mut self) -> Result<Infallible> {
        loop {
            self.boot().await?;
        }
    }

    /// Run phases until one asks for sleep, then sleep. On hardware the sleep
    /// does not return; in simulation each call is one boot.
    pub async fn boot(&mut self) -> Result<()> {
        loop {
            let seconds = self.step().await?;
            if seconds > 0 {
                return self.sleep(seconds).await;
            }
        }
    }

    /// Run the phase of the persisted state; returns the requested sleep, 0 to continue
    pub async fn step(&mut self) -> Result<u32> {
        if self
            .ctx
            .signals
            .get()
            .contains(SignalBits::RESET_REQUESTED)
        {
            return self.factory_reset();
        }

        let state = self.ctx.states.load();
        info!("🔧 Running phase {}", state);
        match state {
            DeviceState::Unknown => {
                self.ctx.states.save(DeviceState::BleConfig)?;
                Ok(0)
            }
            DeviceState::BleConfig => self.ble_config().await,
            DeviceState::MeasureConfig => self.measure_config().await,
            DeviceState::Measure => self.measure().await,
        }
    }

    async fn ble_config(&mut self) -> Result<u32> {
        let ctx = &mut self.ctx;
        ctx.signals.clear(SignalBits::BLE_CREDENTIALS_READY);

        let session = Arc::new(ProvisioningSession::new(
            ctx.signals,
            ctx.credentials.clone(),
            ctx.identity.clone(),
            ctx.config.clone(),
            &ctx.device_id,
        ));
        if let Err(e) = ctx.provisioning.enable(session.clone(), session.clone()) {
            warn!("❌ Failed to start BLE provisioning: {}", e);
            return Ok(BLE_RETRY_SLEEP_SEC);
        }

        info!(
            "📡 BLE provisioning open for {}s",
            ctx.timing.ble_window.as_secs()
        );
        let bits = ctx
            .signals
            .wait(SignalBits::BLE_CREDENTIALS_READY, ctx.timing.ble_window)
            .await;

        if let Err(e) = ctx.provisioning.disable() {
            warn!("⚠️ Failed to stop BLE provisioning: {}", e);
        }
        if let Some(unix_time) = session.take_requested_time() {
            if let Err(e) = ctx.clock.set_unix_time(unix_time) {
                warn!("⚠️ Failed to set clock: {}", e);
            }
        }

        if bits.contains(SignalBits::RESET_REQUESTED) {
            return Ok(0);
        }
        if !bits.contains(SignalBits::BLE_CREDENTIALS_READY) || ctx.credentials.load().is_none() {
            info!("📡 No credentials received, retrying in {}s", BLE_RETRY_SLEEP_SEC);
            return Ok(BLE_RETRY_SLEEP_SEC);
        }

        ctx.signals.clear(SignalBits::BLE_CREDENTIALS_READY);
        ctx.states.save(DeviceState::MeasureConfig)?;
        info!("✅ Provisioned; rebooting into configuration");
        Ok(HANDOFF_SLEEP_SEC)
    }

    async fn measure_config(&mut self) -> Result<u32> {
        let current = self.ctx.config.load();

        let outcome = match self.ctx.bring_up_network().await {
            LinkStatus::Up => self.ctx.fetch_shadow(&current).await,
            LinkStatus::Down => None,
            LinkStatus::ResetRequested => Some(ShadowOutcome::ResetRequested),
        };
        self.ctx.network.disconnect();

        match outcome {
            Some(ShadowOutcome::Updated(mut config)) => {
                let now = self.ctx.clock.unix_time();
                if config.hatch_ended(now) {
                    warn!(
                        "⚠️ Hatch '{}' already ended at {} - waiting for a new one",
                        config.uuid, config.end_unix_timestamp
                    );
                    return Ok(FALLBACK_INTERVAL_SEC);
                }

                config.reset_publish_counters();
                self.ctx
                    .config
                    .save(&config)
                    .map_err(|e| anyhow!("Failed to save hatch config: {}", e))?;
                self.ctx.states.save(DeviceState::Measure)?;
                info!(
                    "✅ Measuring hatch '{}' every {}s until {}",
                    config.uuid, config.measure_interval_sec, config.end_unix_timestamp
                );
                Ok(0)
            }
            Some(ShadowOutcome::ResetRequested) => Ok(0),
            Some(ShadowOutcome::NotReceived) | None => {
                warn!(
                    "⚠️ No hatch config yet, retrying in {}s",
                    FALLBACK_INTERVAL_SEC
                );
                Ok(FALLBACK_INTERVAL_SEC)
            }
        }
    }

    async fn measure(&mut self) -> Result<u32> {
        match MeasurementCycle::new(&mut self.ctx).run().await? {
            CycleOutcome::Sleep(seconds) => Ok(seconds),
            CycleOutcome::HatchEnded => {
                self.ctx.states.save(DeviceState::MeasureConfig)?;
                Ok(0)
            }
            CycleOutcome::ResetRequested => Ok(0),
        }
    }

    // Identity and buffered measurements survive the wipe
    fn factory_reset(&mut self) -> Result<u32> {
        warn!("🔄 Factory reset: wiping hatch config and WiFi credentials");
        self.ctx.config.clear()?;
        self.ctx.credentials.clear()?;
        self.ctx.states.save(DeviceState::BleConfig)?;
        self.ctx.signals.clear(SignalBits::RESET_REQUESTED);
        Ok(HANDOFF_SLEEP_SEC)
    }

    async fn sleep(&mut self, seconds: u32) -> Result<()> {
        let mut requested = seconds;
        let mut remaining_ms = u64::from(seconds) * 1_000;

        // A held button must be released first or the level wake fires at once
        loop {
            if !self
                .ctx
                .signals
                .get()
                .contains(SignalBits::BUTTON_PRESSED)
            {
                break;
            }

            info!("🔘 Button held - waiting for release before sleeping");
            let limit = Duration::from_secs(u64::from(requested)).max(MIN_RELEASE_WAIT);
            let started = self.ctx.clock.ticks_ms();
            let bits = self
                .ctx
                .signals
                .wait(SignalBits::BUTTON_RELEASED, limit)
                .await;
            let elapsed = tick_duration(started, self.ctx.clock.ticks_ms());
            remaining_ms = remaining_ms.saturating_sub(u64::from(elapsed));

            // The long press is still held after a reset; wait for its release too
            if bits.contains(SignalBits::RESET_REQUESTED) {
                requested = self.factory_reset()?;
                remaining_ms = u64::from(requested) * 1_000;
                continue;
            }
            if !bits.contains(SignalBits::BUTTON_RELEASED) {
                warn!("⚠️ Button still held after {}s", limit.as_secs());
            }
            break;
        }

        // Always reboot, even when the wait used up the whole duration
        let seconds = u32::try_from(remaining_ms.div_ceil(1_000))
            .unwrap_or(u32::MAX)
            .max(MIN_SLEEP_SEC);
        info!("💤 Entering deep sleep for {}s", seconds);
        self.ctx.power.deep_sleep(seconds);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::credentials::IdentityItem;
    use crate::measurement::Measurement;
    use crate::sim::{
        MemoryBlobStore, ScriptedSensor, SimClock, SimCloud, SimNetwork, SimPower,
        SimProvisioning,
    };
    use embassy_futures::join::join;
    use embassy_time::Timer;
    use futures::executor::block_on;

    pub(crate) const NOW: u32 = 1_700_000_000;
    pub(crate) const YEAR_SEC: u32 = 365 * 86_400;
    pub(crate) const END_DOCUMENT_TEMPLATE: &str = r#"{"state": {"desired": {
        "hatchUUID": "hatch-1",
        "endUnixTimestamp": {end},
        "measureIntervalSec": 900,
        "measurementsBeforePublishing": 12
    }}}"#;

    pub(crate) struct Bench {
        pub ctx: DeviceContext,
        pub signals: &'static SignalRegister,
        pub blobs: Arc<MemoryBlobStore>,
        pub sensor: ScriptedSensor,
        pub network: SimNetwork,
        pub cloud: SimCloud,
        pub clock: SimClock,
        pub provisioning: SimProvisioning,
        pub power: SimPower,
    }

    pub(crate) fn bench() -> Bench {
        let signals: &'static SignalRegister = Box::leak(Box::new(SignalRegister::new()));
        let blobs = Arc::new(MemoryBlobStore::new());
        let sensor = ScriptedSensor::new(&[]);
        let network = SimNetwork::new(signals);
        let cloud = SimCloud::new();
        let clock = SimClock::new(NOW);
        let provisioning = SimProvisioning::new();
        let power = SimPower::new(clock.clone());

        let ctx = DeviceContext::new(
            signals,
            "peep-a0b1c2",
            blobs.clone(),
            Collaborators {
                sensor: Box::new(sensor.clone()),
                network: Box::new(network.clone()),
                cloud: Box::new(cloud.clone()),
                clock: Box::new(clock.clone()),
                provisioning: Box::new(provisioning.clone()),
                power: Box::new(power.clone()),
            },
        )
        .with_timing(LifecycleTiming {
            ble_window: Duration::from_millis(20),
            wifi_timeout: Duration::from_millis(20),
            time_sync: TimeSyncSchedule {
                retries: 3,
                retry_interval: Duration::from_millis(1),
            },
            shadow: PumpSchedule {
                process_step: Duration::from_millis(1),
                pump_interval: Duration::from_millis(1),
                max_pumps: 3,
            },
        });

        // Provisioned bench: credentials present unless a test clears them
        ctx.credentials
            .save(&crate::credentials::WifiCredentials {
                ssid: "X".to_string(),
                password: "Y".to_string(),
            })
            .unwrap();

        Bench {
            ctx,
            signals,
            blobs,
            sensor,
            network,
            cloud,
            clock,
            provisioning,
            power,
        }
    }

    fn shadow_ending_at(end: u32) -> String {
        END_DOCUMENT_TEMPLATE.replace("{end}", &end.to_string())
    }

    #[test]
    fn test_fresh_device_to_first_publish() {
        let bench = bench();
        bench.ctx.credentials.clear().unwrap();
        let Bench {
            ctx,
            cloud,
            provisioning,
            power,
            clock,
            network,
            ..
        } = bench;
        let mut controller = LifecycleController::new(ctx);

        // Nobody connects: stay in BleConfig and retry in an hour
        block_on(controller.boot()).unwrap();
        assert_eq!(controller.context().states.load(), DeviceState::BleConfig);
        assert_eq!(power.last_sleep(), Some(BLE_RETRY_SLEEP_SEC));

        // Phone writes credentials
        provisioning.queue_write(br#"{"wifiSSID": "X", "wifiPassword": "Y"}"#);
        block_on(controller.boot()).unwrap();
        assert_eq!(controller.context().states.load(), DeviceState::MeasureConfig);
        assert_eq!(power.last_sleep(), Some(HANDOFF_SLEEP_SEC));
        assert!(!provisioning.is_enabled());

        // Shadow configures a year-long hatch; the same boot takes the first reading
        let end = clock.now() + YEAR_SEC;
        cloud.respond_with(&shadow_ending_at(end), 1);
        block_on(controller.boot()).unwrap();
        assert_eq!(controller.context().states.load(), DeviceState::Measure);
        assert_eq!(network.last_ssid().as_deref(), Some("X"));
        let config = controller.context().config.load();
        assert_eq!(config.uuid, "hatch-1");
        assert_eq!(config.measurements_before_publishing, 12);

        for _ in 0..4 {
            block_on(controller.boot()).unwrap();
        }
        assert_eq!(controller.context().log.total().unwrap(), 5);
        assert!(cloud.published().is_empty());
        assert_eq!(power.last_sleep(), Some(900));

        // Sixth reading lands after the end of the hatch
        clock.set(end);
        block_on(controller.boot()).unwrap();

        let published = cloud.published_json();
        assert_eq!(published.len(), 6);
        let times: Vec<u64> = published
            .iter()
            .map(|m| m["unixTime"].as_u64().unwrap())
            .collect();
        assert!(times.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(times[5], u64::from(end));
        assert!(published.iter().all(|m| m["peepUUID"] == "peep-a0b1c2"));
        assert_eq!(controller.context().log.total().unwrap(), 0);
        assert_eq!(controller.context().states.load(), DeviceState::MeasureConfig);
        // The shadow still names the finished hatch
        assert_eq!(power.last_sleep(), Some(FALLBACK_INTERVAL_SEC));
    }

    #[test]
    fn test_measure_config_without_shadow_retries() {
        let bench = bench();
        bench.ctx.states.save(DeviceState::MeasureConfig).unwrap();

        let seconds = block_on(LifecycleController::new(bench.ctx).step()).unwrap();

        assert_eq!(seconds, FALLBACK_INTERVAL_SEC);
        assert!(!bench.network.is_connected());
        assert_eq!(bench.cloud.requested_things(), vec!["peep-a0b1c2".to_string()]);
    }

    #[test]
    fn test_measure_config_uses_provisioned_identity() {
        let bench = bench();
        bench.ctx.states.save(DeviceState::MeasureConfig).unwrap();
        bench
            .ctx
            .identity
            .set(IdentityItem::PeepUuid, "0b7c4b53-8d1e-4c8e-a4a5-5a0d2f6f3b1e")
            .unwrap();
        bench
            .cloud
            .respond_with(&shadow_ending_at(NOW + YEAR_SEC), 1);
        let mut controller = LifecycleController::new(bench.ctx);

        assert_eq!(block_on(controller.step()).unwrap(), 0);
        assert_eq!(
            bench.cloud.requested_things(),
            vec!["0b7c4b53-8d1e-4c8e-a4a5-5a0d2f6f3b1e".to_string()]
        );
        assert_eq!(controller.context().states.load(), DeviceState::Measure);
    }

    #[test]
    fn test_reset_wipes_config_and_credentials() {
        let bench = bench();
        bench.ctx.states.save(DeviceState::Measure).unwrap();
        bench
            .ctx
            .config
            .save(&HatchConfig {
                uuid: "hatch-1".to_string(),
                ..HatchConfig::default()
            })
            .unwrap();
        bench
            .ctx
            .identity
            .set(IdentityItem::PeepUuid, "peep-1")
            .unwrap();
        bench
            .ctx
            .log
            .append(&Measurement {
                unix_timestamp: NOW,
                temperature: 37.0,
                humidity: 50.0,
                pressure: 100_000.0,
                gas_resistance: 0.0,
            })
            .unwrap();
        bench.signals.set(SignalBits::RESET_REQUESTED);
        let mut controller = LifecycleController::new(bench.ctx);

        block_on(controller.boot()).unwrap();

        let ctx = controller.context();
        assert_eq!(ctx.states.load(), DeviceState::BleConfig);
        assert!(ctx.credentials.load().is_none());
        assert_eq!(ctx.config.load(), HatchConfig::default());
        assert_eq!(ctx.identity.get(IdentityItem::PeepUuid).as_deref(), Some("peep-1"));
        assert_eq!(ctx.log.total().unwrap(), 1);
        assert!(!bench.signals.get().contains(SignalBits::RESET_REQUESTED));
        assert_eq!(bench.power.sleeps(), vec![HANDOFF_SLEEP_SEC]);
    }

    #[test]
    fn test_sleep_waits_for_button_release() {
        let bench = bench();
        let signals = bench.signals;
        signals.set(SignalBits::BUTTON_PRESSED);
        let mut controller = LifecycleController::new(bench.ctx);

        let (result, _) = block_on(join(controller.sleep(900), async {
            Timer::after(Duration::from_millis(10)).await;
            signals.clear(SignalBits::BUTTON_PRESSED);
            signals.set(SignalBits::BUTTON_RELEASED);
        }));

        result.unwrap();
        assert_eq!(bench.power.sleeps(), vec![900]);
    }

    #[test]
    fn test_long_press_while_waiting_to_sleep_resets() {
        let bench = bench();
        let signals = bench.signals;
        bench.ctx.states.save(DeviceState::Measure).unwrap();
        signals.set(SignalBits::BUTTON_PRESSED);
        let mut controller = LifecycleController::new(bench.ctx);

        let (result, _) = block_on(join(controller.sleep(900), async {
            Timer::after(Duration::from_millis(10)).await;
            signals.set(SignalBits::RESET_REQUESTED);
            Timer::after(Duration::from_millis(20)).await;
            assert!(bench.power.sleeps().is_empty());
            signals.clear(SignalBits::BUTTON_PRESSED);
            signals.set(SignalBits::BUTTON_RELEASED);
        }));

        result.unwrap();
        assert_eq!(bench.power.sleeps(), vec![HANDOFF_SLEEP_SEC]);
        assert_eq!(controller.context().states.load(), DeviceState::BleConfig);
        assert!(controller.context().credentials.load().is_none());
    }

    #[test]
    fn test_handoff_sleep_after_long_press() {
        let bench = bench();
        let signals = bench.signals;
        let clock = bench.clock.clone();
        bench.ctx.states.save(DeviceState::Measure).unwrap();
        signals.set(SignalBits::BUTTON_PRESSED | SignalBits::RESET_REQUESTED);
        let mut controller = LifecycleController::new(bench.ctx);

        // The user lets go a second after the reset fired
        let (result, _) = block_on(join(controller.boot(), async {
            Timer::after(Duration::from_millis(30)).await;
            clock.advance_secs(1);
            signals.clear(SignalBits::BUTTON_PRESSED);
            signals.set(SignalBits::BUTTON_RELEASED);
        }));

        result.unwrap();
        assert_eq!(bench.power.sleeps(), vec![HANDOFF_SLEEP_SEC]);
        assert_eq!(controller.context().states.load(), DeviceState::BleConfig);
    }

    #[test]
    fn test_sleep_subtracts_time_held() {
        let bench = bench();
        let signals = bench.signals;
        let clock = bench.clock.clone();
        signals.set(SignalBits::BUTTON_PRESSED);
        let mut controller = LifecycleController::new(bench.ctx);

        let (result, _) = block_on(join(controller.sleep(900), async {
            Timer::after(Duration::from_millis(10)).await;
            clock.advance_secs(300);
            signals.clear(SignalBits::BUTTON_PRESSED);
            signals.set(SignalBits::BUTTON_RELEASED);
        }));

        result.unwrap();
        assert_eq!(bench.power.sleeps(), vec![600]);
    }

    #[test]
    fn test_sleep_still_reboots_when_hold_outlasts_duration() {
        let bench = bench();
        let signals = bench.signals;
        let clock = bench.clock.clone();
        signals.set(SignalBits::BUTTON_PRESSED);
        let mut controller = LifecycleController::new(bench.ctx);

        let (result, _) = block_on(join(controller.sleep(900), async {
            Timer::after(Duration::from_millis(10)).await;
            clock.advance_secs(1_000);
            signals.clear(SignalBits::BUTTON_PRESSED);
            signals.set(SignalBits::BUTTON_RELEASED);
        }));

        result.unwrap();
        assert_eq!(bench.power.sleeps(), vec![MIN_SLEEP_SEC]);
    }

    #[test]
    fn test_ble_session_sets_clock() {
        let bench = bench();
        bench.ctx.credentials.clear().unwrap();
        bench
            .provisioning
            .queue_write(br#"{"id": 1, "command": {"setTime": 1800000000}}"#);
        bench
            .provisioning
            .queue_write(br#"{"id": 2, "command": {"setWifiSsid": "barn"}}"#);
        bench
            .provisioning
            .queue_write(br#"{"id": 3, "command": {"setWifiPassword": "hunter22"}}"#);
        bench
            .provisioning
            .queue_write(br#"{"id": 4, "command": "startMeasuring"}"#);
        let mut controller = LifecycleController::new(bench.ctx);

        assert_eq!(block_on(controller.step()).unwrap(), HANDOFF_SLEEP_SEC);
        assert_eq!(bench.clock.now(), 1_800_000_000);
        assert_eq!(bench.provisioning.replies().len(), 4);
        assert_eq!(
            controller.context().states.load(),
            DeviceState::MeasureConfig
        );
    }

    #[test]
    fn test_store_failure_is_fatal() {
        let bench = bench();
        bench.blobs.set_fail_writes(true);
        bench.signals.set(SignalBits::RESET_REQUESTED);
        let mut controller = LifecycleController::new(bench.ctx);

        assert!(block_on(controller.boot()).is_err());
    }
}
