// MQTT Client Module
// AWS IoT Core session over mutual TLS: shadow get for the hatch configuration
// and QoS 1 publishing of measurement messages

use std::ffi::{CStr, CString};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;

// Import anyhow for error handling
use anyhow::{anyhow, Result};

// Import Embassy time utilities
use embassy_time::Duration;

// Import ESP-IDF MQTT client types
use esp_idf_svc::mqtt::client::{
    Details, EspMqttClient, EspMqttEvent, EventPayload, MqttClientConfiguration, QoS,
};

// Import X.509 certificate type for TLS authentication
use esp_idf_svc::tls::X509;

// Import logging macros
use log::{debug, info, warn};

// Import SHA-256 for certificate fingerprints
use sha2::{Digest, Sha256};

use peep_shared::credentials::{IdentityItem, IdentityStore};
use peep_shared::shadow::{CloudClient, ShadowListener};

// AWS IoT Core ATS endpoint for the peep fleet
const IOT_ENDPOINT: &str = "a1mdhmgt02ub52.iot.us-west-2.amazonaws.com";
const IOT_PORT: u16 = 8883;
const MQTT_BUFFER_SIZE: usize = 4096;
const KEEP_ALIVE: std::time::Duration = std::time::Duration::from_secs(60);
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

fn shadow_get_topic(thing_name: &str) -> String {
    format!("$aws/things/{}/shadow/get", thing_name)
}

fn shadow_accepted_topic(thing_name: &str) -> String {
    format!("$aws/things/{}/shadow/get/accepted", thing_name)
}

// Events forwarded from the MQTT task to the caller
#[derive(Debug)]
enum CloudEvent {
    Connected,
    Disconnected,
    Subscribed(u32),
    Published(u32),
    Received { topic: String, data: Vec<u8> },
    Error(String),
}

// Reassembles messages larger than the client buffer
#[derive(Default)]
struct Inbox {
    topic: String,
    data: Vec<u8>,
}

impl Inbox {
    fn on_event(&mut self, event: EspMqttEvent<'_>, tx: &Sender<CloudEvent>) {
        let forwarded = match event.payload() {
            EventPayload::Connected(_) => Some(CloudEvent::Connected),
            EventPayload::Disconnected => Some(CloudEvent::Disconnected),
            EventPayload::Subscribed(id) => Some(CloudEvent::Subscribed(id)),
            EventPayload::Published(id) => Some(CloudEvent::Published(id)),
            EventPayload::Received {
                topic,
                data,
                details,
                ..
            } => match details {
                Details::Complete => Some(CloudEvent::Received {
                    topic: topic.unwrap_or_default().to_string(),
                    data: data.to_vec(),
                }),
                Details::InitialChunk(chunk) => {
                    self.topic = topic.unwrap_or_default().to_string();
                    self.data = Vec::with_capacity(chunk.total_data_size);
                    self.data.extend_from_slice(data);
                    None
                }
                Details::SubsequentChunk(chunk) => {
                    self.data.extend_from_slice(data);
                    if self.data.len() >= chunk.total_data_size {
                        Some(CloudEvent::Received {
                            topic: std::mem::take(&mut self.topic),
                            data: std::mem::take(&mut self.data),
                        })
                    } else {
                        None
                    }
                }
            },
            EventPayload::Error(e) => Some(CloudEvent::Error(format!("{:?}", e))),
            _ => None,
        };

        if let Some(event) = forwarded {
            // The receiver is gone once the session is dropped
            let _ = tx.send(event);
        }
    }
}

struct Session {
    client: EspMqttClient<'static>,
    events: Receiver<CloudEvent>,
    accepted_topic: Option<String>,
}

/// AWS IoT Core client authenticated with the provisioned X.509 identity
pub struct AwsIotCloudClient {
    identity: Arc<IdentityStore>,
    session: Option<Session>,
}

impl AwsIotCloudClient {
    pub fn new(identity: Arc<IdentityStore>) -> Self {
        Self {
            identity,
            session: None,
        }
    }

    /// ESP-IDF keeps the certificate pointers for the client's lifetime;
    /// every boot ends in deep sleep, so the leak is bounded by a few connects
    fn leak_pem(pem: &str) -> Result<X509<'static>> {
        let c_string =
            CString::new(pem).map_err(|e| anyhow!("PEM contains null bytes: {}", e))?;
        let static_cstr: &'static CStr = Box::leak(c_string.into_boxed_c_str());
        Ok(X509::pem(static_cstr))
    }

    fn identity_item(&self, item: IdentityItem) -> Result<String> {
        self.identity
            .get(item)
            .ok_or_else(|| anyhow!("{:?} not provisioned", item))
    }

    fn session(&mut self) -> Result<&mut Session> {
        self.session
            .as_mut()
            .ok_or_else(|| anyhow!("MQTT client not connected"))
    }
}

fn fingerprint(pem: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pem.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl Session {
    // Wait for the first event `matches` accepts; everything else is dropped
    fn wait_for<F>(&mut self, timeout: Duration, what: &str, mut matches: F) -> Result<()>
    where
        F: FnMut(&CloudEvent) -> bool,
    {
        let deadline = std::time::Instant::now() + std::time::Duration::from(timeout);
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            match self.events.recv_timeout(remaining) {
                Ok(event) if matches(&event) => return Ok(()),
                Ok(CloudEvent::Disconnected) => {
                    return Err(anyhow!("Disconnected while waiting for {}", what))
                }
                Ok(CloudEvent::Error(e)) => warn!("⚠️ MQTT error while waiting for {}: {}", what, e),
                Ok(other) => debug!("🔍 Ignoring {:?} while waiting for {}", other, what),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(anyhow!("Timed out waiting for {}", what))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(anyhow!("MQTT event channel closed"))
                }
            }
        }
    }
}

impl CloudClient for AwsIotCloudClient {
    fn connect(&mut self, client_id: &str, timeout: Duration) -> Result<()> {
        self.disconnect();

        let certificate = self.identity_item(IdentityItem::Certificate)?;
        let private_key = self.identity_item(IdentityItem::PrivateKey)?;
        let root_ca = self.identity.get(IdentityItem::RootCa);
        info!("🔐 Device certificate sha256: {}", fingerprint(&certificate));

        let server_certificate = match root_ca.as_deref() {
            Some(pem) => Some(Self::leak_pem(pem)?),
            None => {
                warn!("⚠️ No provisioned root CA, using the built-in certificate bundle");
                None
            }
        };

        let config = MqttClientConfiguration {
            client_id: Some(client_id),
            client_certificate: Some(Self::leak_pem(&certificate)?),
            private_key: Some(Self::leak_pem(&private_key)?),
            crt_bundle_attach: if server_certificate.is_none() {
                Some(esp_idf_svc::sys::esp_crt_bundle_attach)
            } else {
                None
            },
            server_certificate,
            keep_alive_interval: Some(KEEP_ALIVE),
            network_timeout: timeout.into(),
            buffer_size: MQTT_BUFFER_SIZE,
            disable_clean_session: false,
            ..Default::default()
        };

        let broker_url = format!("mqtts://{}:{}", IOT_ENDPOINT, IOT_PORT);
        info!("🌐 Connecting to {} as '{}'", broker_url, client_id);

        let (tx, events) = mpsc::channel();
        let mut inbox = Inbox::default();
        let client = EspMqttClient::new_cb(&broker_url, &config, move |event| {
            inbox.on_event(event, &tx)
        })
        .map_err(|e| anyhow!("Failed to create MQTT client: {:?}", e))?;

        let mut session = Session {
            client,
            events,
            accepted_topic: None,
        };
        session.wait_for(timeout, "MQTT connect", |event| {
            matches!(event, CloudEvent::Connected)
        })?;

        info!("✅ Connected to AWS IoT Core");
        self.session = Some(session);
        Ok(())
    }

    fn request_shadow(&mut self, thing_name: &str) -> Result<()> {
        let session = self.session()?;
        let accepted = shadow_accepted_topic(thing_name);

        let subscription = session
            .client
            .subscribe(&accepted, QoS::AtLeastOnce)
            .map_err(|e| anyhow!("Failed to subscribe to {}: {:?}", accepted, e))?;
        session.wait_for(SUBSCRIBE_TIMEOUT, "shadow subscription", |event| {
            matches!(event, CloudEvent::Subscribed(id) if *id == subscription)
        })?;
        session.accepted_topic = Some(accepted);

        let get_topic = shadow_get_topic(thing_name);
        session
            .client
            .enqueue(&get_topic, QoS::AtLeastOnce, false, b"{}")
            .map_err(|e| anyhow!("Failed to request shadow: {:?}", e))?;
        info!("📨 Shadow requested for '{}'", thing_name);
        Ok(())
    }

    fn process(&mut self, timeout: Duration, listener: &mut dyn ShadowListener) -> Result<()> {
        let session = self.session()?;
        let mut wait = std::time::Duration::from(timeout);

        loop {
            match session.events.recv_timeout(wait) {
                Ok(CloudEvent::Received { topic, data }) => {
                    if session.accepted_topic.as_deref() == Some(topic.as_str()) {
                        info!("📥 Shadow document received ({} bytes)", data.len());
                        listener.on_shadow_document(&data);
                    } else {
                        debug!("🔍 Ignoring message on {}", topic);
                    }
                }
                Ok(CloudEvent::Disconnected) => return Err(anyhow!("MQTT connection lost")),
                Ok(CloudEvent::Error(e)) => warn!("⚠️ MQTT error: {}", e),
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => return Ok(()),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(anyhow!("MQTT event channel closed"))
                }
            }
            // Drain whatever else is queued without blocking again
            wait = std::time::Duration::ZERO;
        }
    }

    fn publish(&mut self, topic: &str, payload: &[u8], timeout: Duration) -> Result<()> {
        let session = self.session()?;
        let message_id = session
            .client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| anyhow!("Failed to publish to {}: {:?}", topic, e))?;

        session.wait_for(timeout, "publish acknowledgement", |event| {
            matches!(event, CloudEvent::Published(id) if *id == message_id)
        })?;
        debug!("📤 Message {} acknowledged", message_id);
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            // Dropping the client stops the MQTT task
            drop(session);
            info!("🔌 Disconnected from AWS IoT Core");
        }
    }
}
