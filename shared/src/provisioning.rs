// Provisioning Module
// Local configuration session served over BLE: Wi-Fi credential writes, the
// identity read, and the tagged command/query protocol for bench setup

use std::sync::{Arc, Mutex};

// Import anyhow for error handling
use anyhow::{anyhow, Result};

// Import logging macros
use log::{info, warn};

// Import Serde for the protocol messages
use serde::{Deserialize, Serialize};

// Import uuid to validate device identities
use uuid::Uuid;

use crate::credentials::{
    CredentialStore, IdentityItem, IdentityStore, WifiCredentials, WIFI_PASSWORD_LEN_MAX,
    WIFI_SSID_LEN_MAX,
};
use crate::hatch_config::{ConfigStore, ThresholdUpdate};
use crate::signals::{SignalBits, SignalRegister};

pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Receives raw characteristic writes. The returned bytes, if any, are sent
/// back to the client as a status notification.
pub trait CredentialSink: Send + Sync {
    fn on_write(&self, payload: &[u8]) -> Option<Vec<u8>>;
}

/// Answers characteristic reads
pub trait IdentitySource: Send + Sync {
    fn on_read(&self) -> Vec<u8>;
}

/// Radio-side transport of the session (BLE GATT on hardware)
pub trait ProvisioningTransport {
    fn enable(
        &mut self,
        sink: Arc<dyn CredentialSink>,
        source: Arc<dyn IdentitySource>,
    ) -> Result<()>;

    fn disable(&mut self) -> Result<()>;
}

/// Threshold fields accepted by the set-thresholds command
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdsPayload {
    pub measurements_before_publishing: Option<u32>,
    pub measure_interval_sec: Option<u32>,
    pub low_temperature: Option<f32>,
    pub high_temperature: Option<f32>,
}

impl From<ThresholdsPayload> for ThresholdUpdate {
    fn from(payload: ThresholdsPayload) -> Self {
        ThresholdUpdate {
            measurements_before_publishing: payload.measurements_before_publishing,
            measure_interval_sec: payload.measure_interval_sec,
            temperature_low_celsius: payload.low_temperature,
            temperature_high_celsius: payload.high_temperature,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Command {
    SetWifiSsid(String),
    SetWifiPassword(String),
    SetCertificate(String),
    SetPrivateKey(String),
    SetRootCa(String),
    SetDeviceUuid(String),
    SetTime(u32),
    SetThresholds(ThresholdsPayload),
    StartMeasuring,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Query {
    ProtocolVersion,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageBody {
    Command(Command),
    Query(Query),
}

/// Decoded client message, e.g. `{"id": 3, "command": {"setWifiSsid": "barn"}}`
/// or `{"id": 4, "query": "protocolVersion"}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClientMessage {
    pub id: u32,
    #[serde(flatten)]
    pub body: MessageBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseKind {
    CommandResult,
    QueryResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub id: u32,
    #[serde(rename = "type")]
    pub kind: ResponseKind,
    pub status: ResponseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    fn command(id: u32, outcome: Result<()>) -> Self {
        match outcome {
            Ok(()) => Self {
                id,
                kind: ResponseKind::CommandResult,
                status: ResponseStatus::Success,
                value: None,
                error: None,
            },
            Err(e) => Self {
                id,
                kind: ResponseKind::CommandResult,
                status: ResponseStatus::Error,
                value: None,
                error: Some(e.to_string()),
            },
        }
    }

    fn query(id: u32, value: &str) -> Self {
        Self {
            id,
            kind: ResponseKind::QueryResult,
            status: ResponseStatus::Success,
            value: Some(value.to_string()),
            error: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct IdentityReply<'a> {
    uuid: &'a str,
}

// Values collected across writes until the credentials are complete
#[derive(Debug, Default)]
struct PendingSession {
    ssid: Option<String>,
    password: Option<String>,
    requested_time: Option<u32>,
}

/// One BLE configuration window. Shared with the transport's callbacks, so all
/// state sits behind the stores' own locks or the pending mutex.
pub struct ProvisioningSession {
    signals: &'static SignalRegister,
    credentials: Arc<CredentialStore>,
    identity: Arc<IdentityStore>,
    config: Arc<ConfigStore>,
    fallback_id: String,
    pending: Mutex<PendingSession>,
}

impl ProvisioningSession {
    pub fn new(
        signals: &'static SignalRegister,
        credentials: Arc<CredentialStore>,
        identity: Arc<IdentityStore>,
        config: Arc<ConfigStore>,
        fallback_id: &str,
    ) -> Self {
        Self {
            signals,
            credentials,
            identity,
            config,
            fallback_id: fallback_id.to_string(),
            pending: Mutex::new(PendingSession::default()),
        }
    }

    /// Clock value sent by the client, taken once by the lifecycle phase
    pub fn take_requested_time(&self) -> Option<u32> {
        self.pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.requested_time.take())
    }

    /// Execute a decoded client message
    pub fn handle(&self, message: ClientMessage) -> Response {
        match message.body {
            MessageBody::Command(command) => {
                let outcome = self.execute(command);
                if let Err(e) = &outcome {
                    warn!("⚠️ Command {} failed: {}", message.id, e);
                }
                Response::command(message.id, outcome)
            }
            MessageBody::Query(Query::ProtocolVersion) => {
                Response::query(message.id, PROTOCOL_VERSION)
            }
        }
    }

    fn execute(&self, command: Command) -> Result<()> {
        match command {
            Command::SetWifiSsid(ssid) => {
                if ssid.is_empty() || ssid.len() > WIFI_SSID_LEN_MAX {
                    return Err(anyhow!("SSID must be 1-{} bytes", WIFI_SSID_LEN_MAX));
                }
                self.with_pending(|pending| pending.ssid = Some(ssid))?;
                self.complete_credentials()
            }
            Command::SetWifiPassword(password) => {
                if password.is_empty() || password.len() > WIFI_PASSWORD_LEN_MAX {
                    return Err(anyhow!(
                        "Password must be 1-{} bytes",
                        WIFI_PASSWORD_LEN_MAX
                    ));
                }
                self.with_pending(|pending| pending.password = Some(password))?;
                self.complete_credentials()
            }
            Command::SetCertificate(pem) => self.set_identity(IdentityItem::Certificate, &pem),
            Command::SetPrivateKey(pem) => self.set_identity(IdentityItem::PrivateKey, &pem),
            Command::SetRootCa(pem) => self.set_identity(IdentityItem::RootCa, &pem),
            Command::SetDeviceUuid(raw) => {
                let uuid = Uuid::parse_str(raw.trim())
                    .map_err(|e| anyhow!("Invalid device UUID '{}': {}", raw, e))?;
                let canonical = uuid.hyphenated().to_string();
                self.set_identity(IdentityItem::PeepUuid, &canonical)
            }
            Command::SetTime(unix_time) => {
                self.with_pending(|pending| pending.requested_time = Some(unix_time))?;
                info!("🕐 Clock update to {} requested", unix_time);
                Ok(())
            }
            Command::SetThresholds(payload) => {
                let updated = ThresholdUpdate::from(payload).apply(&self.config.load())?;
                self.config
                    .save(&updated)
                    .map_err(|e| anyhow!("Failed to save thresholds: {}", e))?;
                info!(
                    "✅ Thresholds updated: publish every {} readings, band {}..{}",
                    updated.measurements_before_publishing,
                    updated.temperature_low_celsius,
                    updated.temperature_high_celsius
                );
                Ok(())
            }
            Command::StartMeasuring => {
                if self.credentials.load().is_none() {
                    return Err(anyhow!("WiFi credentials not configured"));
                }
                info!("✅ Start measuring requested");
                self.signals.set(SignalBits::BLE_CREDENTIALS_READY);
                Ok(())
            }
        }
    }

    fn with_pending<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut PendingSession),
    {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| anyhow!("Provisioning session lock poisoned"))?;
        f(&mut pending);
        Ok(())
    }

    fn set_identity(&self, item: IdentityItem, value: &str) -> Result<()> {
        if value.trim().is_empty() {
            return Err(anyhow!("{:?} must not be empty", item));
        }
        self.identity
            .set(item, value)
            .map_err(|e| anyhow!("Failed to store {:?}: {}", item, e))
    }

    // Persist once both halves have arrived through separate commands
    fn complete_credentials(&self) -> Result<()> {
        let credentials = {
            let pending = self
                .pending
                .lock()
                .map_err(|_| anyhow!("Provisioning session lock poisoned"))?;
            match (&pending.ssid, &pending.password) {
                (Some(ssid), Some(password)) => WifiCredentials {
                    ssid: ssid.clone(),
                    password: password.clone(),
                },
                _ => return Ok(()),
            }
        };
        // The protocol client ends the session itself with StartMeasuring
        self.persist_credentials(&credentials)
    }

    fn persist_credentials(&self, credentials: &WifiCredentials) -> Result<()> {
        credentials.validate()?;
        self.credentials
            .save(credentials)
            .map_err(|e| anyhow!("Failed to save WiFi credentials: {}", e))
    }

    // A bare credential write is the whole session
    fn store_credentials(&self, credentials: &WifiCredentials) -> Result<()> {
        self.persist_credentials(credentials)?;
        self.signals.set(SignalBits::BLE_CREDENTIALS_READY);
        Ok(())
    }
}

impl CredentialSink for ProvisioningSession {
    fn on_write(&self, payload: &[u8]) -> Option<Vec<u8>> {
        // Protocol messages carry an id; anything else is a bare credential object
        if let Ok(message) = serde_json::from_slice::<ClientMessage>(payload) {
            let response = self.handle(message);
            return serde_json::to_vec(&response).ok();
        }

        match WifiCredentials::from_json(payload) {
            Ok(credentials) => match self.store_credentials(&credentials) {
                Ok(()) => info!("✅ WiFi credentials received over BLE"),
                Err(e) => warn!("❌ Failed to store BLE credentials: {}", e),
            },
            Err(e) => warn!("⚠️ Ignoring BLE write of {} bytes: {}", payload.len(), e),
        }
        None
    }
}

impl IdentitySource for ProvisioningSession {
    fn on_read(&self) -> Vec<u8> {
        let uuid = self.identity.peep_id(&self.fallback_id);
        serde_json::to_vec(&IdentityReply { uuid: &uuid }).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hatch_config::HatchConfig;
    use crate::sim::MemoryBlobStore;
    use crate::storage::SharedBlobStore;

    fn session() -> (&'static SignalRegister, Arc<CredentialStore>, ProvisioningSession) {
        let signals: &'static SignalRegister = Box::leak(Box::new(SignalRegister::new()));
        let blobs: SharedBlobStore = Arc::new(MemoryBlobStore::new());
        let credentials = Arc::new(CredentialStore::new(blobs.clone()));
        let session = ProvisioningSession::new(
            signals,
            credentials.clone(),
            Arc::new(IdentityStore::new(blobs.clone())),
            Arc::new(ConfigStore::new(blobs)),
            "peep-a0b1c2",
        );
        (signals, credentials, session)
    }

    fn command(id: u32, command: Command) -> ClientMessage {
        ClientMessage {
            id,
            body: MessageBody::Command(command),
        }
    }

    #[test]
    fn test_json_credentials_write() {
        let (signals, credentials, session) = session();

        let reply = session.on_write(br#"{"wifiSSID": "X", "wifiPassword": "Y"}"#);

        assert!(reply.is_none());
        assert!(signals.get().contains(SignalBits::BLE_CREDENTIALS_READY));
        assert_eq!(credentials.load().unwrap().ssid, "X");
    }

    #[test]
    fn test_incomplete_write_is_ignored() {
        let (signals, credentials, session) = session();

        session.on_write(br#"{"wifiSSID": "X"}"#);
        session.on_write(b"not json");

        assert!(signals.get().is_empty());
        assert!(credentials.load().is_none());
    }

    #[test]
    fn test_read_returns_identity() {
        let (_, _, session) = session();
        let reply: serde_json::Value = serde_json::from_slice(&session.on_read()).unwrap();
        assert_eq!(reply["uuid"], "peep-a0b1c2");

        session
            .handle(command(1, Command::SetDeviceUuid("0B7C4B53-8D1E-4C8E-A4A5-5A0D2F6F3B1E".into())));
        let reply: serde_json::Value = serde_json::from_slice(&session.on_read()).unwrap();
        assert_eq!(reply["uuid"], "0b7c4b53-8d1e-4c8e-a4a5-5a0d2f6f3b1e");
    }

    #[test]
    fn test_split_credentials_commands() {
        let (signals, credentials, session) = session();

        let response = session.handle(command(1, Command::SetWifiSsid("barn".into())));
        assert_eq!(response.status, ResponseStatus::Success);
        assert!(!signals.get().contains(SignalBits::BLE_CREDENTIALS_READY));

        session.handle(command(2, Command::SetWifiPassword("hunter22".into())));
        assert_eq!(credentials.load().unwrap().password, "hunter22");
        // Still open for certificates until the client starts measuring
        assert!(!signals.get().contains(SignalBits::BLE_CREDENTIALS_READY));

        session.handle(command(3, Command::StartMeasuring));
        assert!(signals.get().contains(SignalBits::BLE_CREDENTIALS_READY));
    }

    #[test]
    fn test_wire_message_dispatch() {
        let (_, _, session) = session();

        let reply = session
            .on_write(br#"{"id": 7, "query": "protocolVersion"}"#)
            .unwrap();
        let reply: serde_json::Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(reply["id"], 7);
        assert_eq!(reply["type"], "queryResult");
        assert_eq!(reply["value"], PROTOCOL_VERSION);

        let reply = session
            .on_write(br#"{"id": 8, "command": {"setDeviceUuid": "nope"}}"#)
            .unwrap();
        let reply: serde_json::Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(reply["type"], "commandResult");
        assert_eq!(reply["status"], "error");
    }

    #[test]
    fn test_set_time_and_thresholds() {
        let blobs: SharedBlobStore = Arc::new(MemoryBlobStore::new());
        let config = Arc::new(ConfigStore::new(blobs.clone()));
        let session = ProvisioningSession::new(
            Box::leak(Box::new(SignalRegister::new())),
            Arc::new(CredentialStore::new(blobs.clone())),
            Arc::new(IdentityStore::new(blobs)),
            config.clone(),
            "peep-a0b1c2",
        );

        session.on_write(br#"{"id": 1, "command": {"setTime": 1700000000}}"#);
        assert_eq!(session.take_requested_time(), Some(1_700_000_000));
        assert_eq!(session.take_requested_time(), None);

        let response = session.on_write(
            br#"{"id": 2, "command": {"setThresholds": {"measurementsBeforePublishing": 12}}}"#,
        );
        assert!(response.is_some());
        assert_eq!(config.load().measurements_before_publishing, 12);
        assert_eq!(
            config.load().measure_interval_sec,
            HatchConfig::default().measure_interval_sec
        );
    }

    #[test]
    fn test_start_measuring_needs_credentials() {
        let (signals, _, session) = session();

        let response = session.handle(command(1, Command::StartMeasuring));
        assert_eq!(response.status, ResponseStatus::Error);
        assert!(!signals.get().contains(SignalBits::BLE_CREDENTIALS_READY));

        session.on_write(br#"{"wifiSSID": "X", "wifiPassword": "Y"}"#);
        signals.clear(SignalBits::BLE_CREDENTIALS_READY);

        let response = session.handle(command(2, Command::StartMeasuring));
        assert_eq!(response.status, ResponseStatus::Success);
        assert!(signals.get().contains(SignalBits::BLE_CREDENTIALS_READY));
    }
}
