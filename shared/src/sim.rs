// Simulated Collaborators
// In-memory implementations of every platform trait, used by the unit tests
// and the host simulator. Handles are cheap clones sharing one state so a test
// can inspect a collaborator after handing it to the device context.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

// Import anyhow for error handling
use anyhow::{anyhow, Result};

// Import Embassy time utilities
use embassy_time::Duration;

// Import logging macros
use log::{debug, info};

use crate::clock::Clock;
use crate::credentials::WifiCredentials;
use crate::platform::{EnvironmentReading, EnvironmentSensor, Network, PowerControl, WakeCause};
use crate::provisioning::{CredentialSink, IdentitySource, ProvisioningTransport};
use crate::shadow::{CloudClient, ShadowListener};
use crate::signals::{SignalBits, SignalRegister};
use crate::storage::{BlobStore, StoreError, StoreResult};

fn lock<T>(state: &Mutex<T>) -> MutexGuard<'_, T> {
    // A test that panicked while holding the lock already failed
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Blob store kept in a map, with write failure injection
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self, name: &str) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend(format!("injected write failure on '{}'", name)));
        }
        Ok(())
    }
}

impl BlobStore for MemoryBlobStore {
    fn read(&self, name: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(lock(&self.blobs).get(name).cloned())
    }

    fn write(&self, name: &str, data: &[u8]) -> StoreResult<()> {
        self.check_writable(name)?;
        lock(&self.blobs).insert(name.to_string(), data.to_vec());
        Ok(())
    }

    fn append(&self, name: &str, data: &[u8]) -> StoreResult<()> {
        self.check_writable(name)?;
        lock(&self.blobs)
            .entry(name.to_string())
            .or_default()
            .extend_from_slice(data);
        Ok(())
    }

    fn size(&self, name: &str) -> StoreResult<usize> {
        Ok(lock(&self.blobs).get(name).map_or(0, Vec::len))
    }

    fn remove(&self, name: &str) -> StoreResult<()> {
        self.check_writable(name)?;
        lock(&self.blobs).remove(name);
        Ok(())
    }
}

/// Sensor replaying a temperature script, then repeating its last value
#[derive(Clone)]
pub struct ScriptedSensor {
    temperatures: Arc<Mutex<VecDeque<f32>>>,
    last: Arc<Mutex<f32>>,
}

impl ScriptedSensor {
    pub fn new(temperatures: &[f32]) -> Self {
        Self {
            temperatures: Arc::new(Mutex::new(temperatures.iter().copied().collect())),
            last: Arc::new(Mutex::new(temperatures.last().copied().unwrap_or(37.8))),
        }
    }

    pub fn push(&self, temperature: f32) {
        lock(&self.temperatures).push_back(temperature);
    }
}

impl EnvironmentSensor for ScriptedSensor {
    fn read(&mut self) -> Result<EnvironmentReading> {
        let temperature = match lock(&self.temperatures).pop_front() {
            Some(t) => {
                *lock(&self.last) = t;
                t
            }
            None => *lock(&self.last),
        };

        Ok(EnvironmentReading {
            temperature,
            humidity: 55.0,
            pressure: 101_325.0,
            gas_resistance: 0.0,
        })
    }
}

#[derive(Default)]
struct NetworkState {
    reachable: bool,
    connected: bool,
    connects: usize,
    last_ssid: Option<String>,
}

/// Wi-Fi link that raises WifiUp immediately when reachable
#[derive(Clone)]
pub struct SimNetwork {
    signals: &'static SignalRegister,
    state: Arc<Mutex<NetworkState>>,
}

impl SimNetwork {
    pub fn new(signals: &'static SignalRegister) -> Self {
        Self {
            signals,
            state: Arc::new(Mutex::new(NetworkState {
                reachable: true,
                ..NetworkState::default()
            })),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.state).reachable = reachable;
    }

    pub fn connects(&self) -> usize {
        lock(&self.state).connects
    }

    pub fn last_ssid(&self) -> Option<String> {
        lock(&self.state).last_ssid.clone()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }
}

impl Network for SimNetwork {
    fn connect(&mut self, credentials: &WifiCredentials, _timeout: Duration) -> Result<()> {
        let mut state = lock(&self.state);
        state.connects += 1;
        state.last_ssid = Some(credentials.ssid.clone());
        if !state.reachable {
            return Err(anyhow!("Network '{}' not found", credentials.ssid));
        }

        state.connected = true;
        drop(state);
        self.signals.set(SignalBits::WIFI_UP);
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut state = lock(&self.state);
        if state.connected {
            state.connected = false;
            drop(state);
            self.signals.clear(SignalBits::WIFI_UP);
            self.signals.set(SignalBits::WIFI_DOWN);
        }
    }
}

#[derive(Default)]
struct CloudState {
    reachable: bool,
    connected: bool,
    shadow_document: Option<String>,
    deliver_on_process: u32,
    processes_since_request: u32,
    awaiting_shadow: bool,
    process_calls: u32,
    requested_things: Vec<String>,
    publish_budget: Option<usize>,
    published: Vec<(String, Vec<u8>)>,
}

/// MQTT session with a scripted shadow and recorded publishes
#[derive(Clone)]
pub struct SimCloud {
    state: Arc<Mutex<CloudState>>,
}

impl Default for SimCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl SimCloud {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(CloudState {
                reachable: true,
                ..CloudState::default()
            })),
        }
    }

    /// Answer every shadow get with `document` on the `on_process`th pump after the request
    pub fn respond_with(&self, document: &str, on_process: u32) {
        let mut state = lock(&self.state);
        state.shadow_document = Some(document.to_string());
        state.deliver_on_process = on_process.max(1);
    }

    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.state).reachable = reachable;
    }

    /// Let `successes` more publishes through, then fail the rest
    pub fn fail_publish_after(&self, successes: usize) {
        lock(&self.state).publish_budget = Some(successes);
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        lock(&self.state).published.clone()
    }

    pub fn published_json(&self) -> Vec<serde_json::Value> {
        self.published()
            .iter()
            .filter_map(|(_, payload)| serde_json::from_slice(payload).ok())
            .collect()
    }

    pub fn requested_things(&self) -> Vec<String> {
        lock(&self.state).requested_things.clone()
    }

    pub fn process_calls(&self) -> u32 {
        lock(&self.state).process_calls
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }
}

impl CloudClient for SimCloud {
    fn connect(&mut self, client_id: &str, _timeout: Duration) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.reachable {
            return Err(anyhow!("Broker unreachable for '{}'", client_id));
        }
        state.connected = true;
        debug!("📡 Sim cloud connected as '{}'", client_id);
        Ok(())
    }

    fn request_shadow(&mut self, thing_name: &str) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(anyhow!("Not connected"));
        }
        state.requested_things.push(thing_name.to_string());
        state.awaiting_shadow = true;
        state.processes_since_request = 0;
        Ok(())
    }

    fn process(&mut self, _timeout: Duration, listener: &mut dyn ShadowListener) -> Result<()> {
        let document = {
            let mut state = lock(&self.state);
            if !state.connected {
                return Err(anyhow!("Not connected"));
            }
            state.process_calls += 1;
            if !state.awaiting_shadow {
                return Ok(());
            }

            state.processes_since_request += 1;
            if state.processes_since_request < state.deliver_on_process {
                return Ok(());
            }
            match state.shadow_document.clone() {
                Some(document) => {
                    state.awaiting_shadow = false;
                    document
                }
                None => return Ok(()),
            }
        };

        // Listener may touch the signal register; never call it under the lock
        listener.on_shadow_document(document.as_bytes());
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8], _timeout: Duration) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(anyhow!("Not connected"));
        }
        if let Some(budget) = state.publish_budget.as_mut() {
            if *budget == 0 {
                return Err(anyhow!("Publish to '{}' timed out", topic));
            }
            *budget -= 1;
        }
        state.published.push((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut state = lock(&self.state);
        state.connected = false;
        state.awaiting_shadow = false;
    }
}

struct ClockState {
    unix_time: u32,
    ticks_ms: u32,
    synced_time: Option<u32>,
}

/// RTC and tick counter advanced explicitly by the test or by SimPower
#[derive(Clone)]
pub struct SimClock {
    state: Arc<Mutex<ClockState>>,
}

impl SimClock {
    pub fn new(unix_time: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(ClockState {
                unix_time,
                ticks_ms: 0,
                synced_time: None,
            })),
        }
    }

    /// Value an SNTP sync will install
    pub fn set_network_time(&self, unix_time: u32) {
        lock(&self.state).synced_time = Some(unix_time);
    }

    pub fn set(&self, unix_time: u32) {
        lock(&self.state).unix_time = unix_time;
    }

    pub fn advance_secs(&self, seconds: u32) {
        let mut state = lock(&self.state);
        state.unix_time = state.unix_time.saturating_add(seconds);
        state.ticks_ms = state.ticks_ms.wrapping_add(seconds.wrapping_mul(1_000));
    }

    pub fn now(&self) -> u32 {
        lock(&self.state).unix_time
    }
}

impl Clock for SimClock {
    fn unix_time(&self) -> u32 {
        lock(&self.state).unix_time
    }

    fn ticks_ms(&self) -> u32 {
        lock(&self.state).ticks_ms
    }

    fn set_unix_time(&mut self, unix_time: u32) -> Result<()> {
        self.set(unix_time);
        Ok(())
    }

    fn start_sync(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some(time) = state.synced_time {
            state.unix_time = time;
        }
        Ok(())
    }
}

struct PowerState {
    wake_cause: WakeCause,
    sleeps: Vec<u32>,
}

/// Deep sleep that records the duration, advances the clock and returns
#[derive(Clone)]
pub struct SimPower {
    clock: SimClock,
    state: Arc<Mutex<PowerState>>,
}

impl SimPower {
    pub fn new(clock: SimClock) -> Self {
        Self {
            clock,
            state: Arc::new(Mutex::new(PowerState {
                wake_cause: WakeCause::PowerOn,
                sleeps: Vec::new(),
            })),
        }
    }

    pub fn sleeps(&self) -> Vec<u32> {
        lock(&self.state).sleeps.clone()
    }

    pub fn last_sleep(&self) -> Option<u32> {
        lock(&self.state).sleeps.last().copied()
    }
}

impl PowerControl for SimPower {
    fn wake_cause(&self) -> WakeCause {
        lock(&self.state).wake_cause
    }

    fn deep_sleep(&mut self, seconds: u32) {
        info!("💤 Simulated deep sleep for {}s", seconds);
        let mut state = lock(&self.state);
        state.sleeps.push(seconds);
        state.wake_cause = WakeCause::Timer;
        drop(state);
        self.clock.advance_secs(seconds);
    }
}

#[derive(Default)]
struct ProvisioningState {
    sink: Option<Arc<dyn CredentialSink>>,
    queued_writes: VecDeque<Vec<u8>>,
    replies: Vec<Vec<u8>>,
}

/// BLE transport whose phone side is a queue of writes delivered on enable
#[derive(Clone, Default)]
pub struct SimProvisioning {
    state: Arc<Mutex<ProvisioningState>>,
}

impl SimProvisioning {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write performed by the client as soon as the next session is enabled
    pub fn queue_write(&self, payload: &[u8]) {
        lock(&self.state).queued_writes.push_back(payload.to_vec());
    }

    pub fn replies(&self) -> Vec<Vec<u8>> {
        lock(&self.state).replies.clone()
    }

    pub fn is_enabled(&self) -> bool {
        lock(&self.state).sink.is_some()
    }
}

impl ProvisioningTransport for SimProvisioning {
    fn enable(
        &mut self,
        sink: Arc<dyn CredentialSink>,
        _source: Arc<dyn IdentitySource>,
    ) -> Result<()> {
        let writes: Vec<Vec<u8>> = {
            let mut state = lock(&self.state);
            state.sink = Some(sink.clone());
            state.queued_writes.drain(..).collect()
        };

        for payload in writes {
            if let Some(reply) = sink.on_write(&payload) {
                lock(&self.state).replies.push(reply);
            }
        }
        Ok(())
    }

    fn disable(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        state.sink = None;
        Ok(())
    }
}
