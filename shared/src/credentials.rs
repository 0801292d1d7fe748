// Credentials Module
// Wi-Fi credentials delivered over BLE and the device identity blobs used for
// the cloud connection (peep uuid, client certificate, key, root CA)

use std::sync::Mutex;

// Import anyhow for error handling
use anyhow::{anyhow, Result};

// Import logging macros
use log::{info, warn};

// Import serde_json for the BLE credential payload
use serde_json::Value;

use crate::storage::{lock_store, SharedBlobStore, StoreResult};

// Blob names
pub const WIFI_SSID_BLOB: &str = "wifi_ssid";
pub const WIFI_PASS_BLOB: &str = "wifi_pass";
pub const PEEP_UUID_BLOB: &str = "peep_uuid";
pub const PEEP_CERT_BLOB: &str = "peep_cert";
pub const PEEP_KEY_BLOB: &str = "peep_key";
pub const PEEP_ROOT_CA_BLOB: &str = "peep_root_ca";

// Credential limits
pub const WIFI_SSID_LEN_MAX: usize = 32;
pub const WIFI_PASSWORD_LEN_MAX: usize = 64;

// JSON keys of the BLE credential write, matched case-insensitively
const SSID_JSON_KEY: &str = "wifiSSID";
const PASSWORD_JSON_KEY: &str = "wifiPassword";

#[derive(Clone, PartialEq, Eq)]
pub struct WifiCredentials {
    pub ssid: String,
    pub password: String,
}

// Passwords never reach the log
impl std::fmt::Debug for WifiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WifiCredentials")
            .field("ssid", &self.ssid)
            .field("password", &"***")
            .finish()
    }
}

impl WifiCredentials {
    pub fn validate(&self) -> Result<()> {
        if self.ssid.is_empty() || self.ssid.len() > WIFI_SSID_LEN_MAX {
            return Err(anyhow!(
                "SSID must be 1-{} bytes, got {}",
                WIFI_SSID_LEN_MAX,
                self.ssid.len()
            ));
        }

        if self.password.is_empty() || self.password.len() > WIFI_PASSWORD_LEN_MAX {
            return Err(anyhow!(
                "Password must be 1-{} bytes, got {}",
                WIFI_PASSWORD_LEN_MAX,
                self.password.len()
            ));
        }

        Ok(())
    }

    /// Parse `{"wifiSSID": "...", "wifiPassword": "..."}` with case-insensitive keys
    pub fn from_json(payload: &[u8]) -> Result<Self> {
        let document: Value = serde_json::from_slice(payload)
            .map_err(|e| anyhow!("Failed to parse credential JSON: {}", e))?;
        let object = document
            .as_object()
            .ok_or_else(|| anyhow!("Credential payload is not a JSON object"))?;

        let field = |name: &str| {
            object
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .and_then(|(_, value)| value.as_str())
                .map(str::to_string)
                .ok_or_else(|| anyhow!("Credential payload missing string '{}'", name))
        };

        let credentials = Self {
            ssid: field(SSID_JSON_KEY)?,
            password: field(PASSWORD_JSON_KEY)?,
        };
        credentials.validate()?;
        Ok(credentials)
    }
}

/// Durable Wi-Fi credential store
pub struct CredentialStore {
    blobs: SharedBlobStore,
    lock: Mutex<()>,
}

impl CredentialStore {
    pub fn new(blobs: SharedBlobStore) -> Self {
        Self {
            blobs,
            lock: Mutex::new(()),
        }
    }

    pub fn save(&self, credentials: &WifiCredentials) -> StoreResult<()> {
        let _guard = lock_store(&self.lock, "wifi credentials")?;
        self.blobs
            .write(WIFI_SSID_BLOB, credentials.ssid.as_bytes())?;
        self.blobs
            .write(WIFI_PASS_BLOB, credentials.password.as_bytes())?;
        info!("💾 WiFi credentials stored for SSID '{}'", credentials.ssid);
        Ok(())
    }

    /// Stored credentials, or None when either half is missing or unreadable
    pub fn load(&self) -> Option<WifiCredentials> {
        let _guard = lock_store(&self.lock, "wifi credentials").ok()?;
        let ssid = read_string(&self.blobs, WIFI_SSID_BLOB)?;
        let password = read_string(&self.blobs, WIFI_PASS_BLOB)?;

        let credentials = WifiCredentials { ssid, password };
        match credentials.validate() {
            Ok(()) => Some(credentials),
            Err(e) => {
                warn!("⚠️ Stored WiFi credentials rejected: {}", e);
                None
            }
        }
    }

    pub fn clear(&self) -> StoreResult<()> {
        let _guard = lock_store(&self.lock, "wifi credentials")?;
        self.blobs.remove(WIFI_SSID_BLOB)?;
        self.blobs.remove(WIFI_PASS_BLOB)?;
        info!("💾 WiFi credentials cleared");
        Ok(())
    }
}

/// Identity material installed over the local configuration protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityItem {
    PeepUuid,
    Certificate,
    PrivateKey,
    RootCa,
}

impl IdentityItem {
    fn blob(self) -> &'static str {
        match self {
            IdentityItem::PeepUuid => PEEP_UUID_BLOB,
            IdentityItem::Certificate => PEEP_CERT_BLOB,
            IdentityItem::PrivateKey => PEEP_KEY_BLOB,
            IdentityItem::RootCa => PEEP_ROOT_CA_BLOB,
        }
    }
}

/// Durable identity store, kept across factory resets
pub struct IdentityStore {
    blobs: SharedBlobStore,
    lock: Mutex<()>,
}

impl IdentityStore {
    pub fn new(blobs: SharedBlobStore) -> Self {
        Self {
            blobs,
            lock: Mutex::new(()),
        }
    }

    pub fn set(&self, item: IdentityItem, value: &str) -> StoreResult<()> {
        let _guard = lock_store(&self.lock, "identity")?;
        self.blobs.write(item.blob(), value.as_bytes())?;
        info!("💾 Stored {:?} ({} bytes)", item, value.len());
        Ok(())
    }

    pub fn get(&self, item: IdentityItem) -> Option<String> {
        let _guard = lock_store(&self.lock, "identity").ok()?;
        read_string(&self.blobs, item.blob())
    }

    /// Cloud client id and shadow thing name: the stored peep uuid, else `fallback`
    pub fn peep_id(&self, fallback: &str) -> String {
        self.get(IdentityItem::PeepUuid)
            .unwrap_or_else(|| fallback.to_string())
    }
}

// Non-empty UTF-8 blob contents, trailing NULs trimmed
fn read_string(blobs: &SharedBlobStore, name: &str) -> Option<String> {
    let bytes = match blobs.read(name) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return None,
        Err(e) => {
            warn!("⚠️ Failed to read '{}': {}", name, e);
            return None;
        }
    };

    let text = String::from_utf8(bytes).ok()?;
    let text = text.trim_end_matches('\0');
    (!text.is_empty()).then(|| text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::MemoryBlobStore;
    use std::sync::Arc;

    #[test]
    fn test_parse_credentials_case_insensitive() {
        let credentials =
            WifiCredentials::from_json(br#"{"WIFISSID": "barn", "wifipassword": "hunter22"}"#)
                .unwrap();
        assert_eq!(credentials.ssid, "barn");
        assert_eq!(credentials.password, "hunter22");
    }

    #[test]
    fn test_parse_credentials_rejects_incomplete() {
        assert!(WifiCredentials::from_json(br#"{"wifiSSID": "barn"}"#).is_err());
        assert!(WifiCredentials::from_json(br#"{"wifiSSID": "", "wifiPassword": "x"}"#).is_err());
        assert!(WifiCredentials::from_json(br#"{"wifiSSID": 5, "wifiPassword": "x"}"#).is_err());
        assert!(WifiCredentials::from_json(b"wifiSSID=barn").is_err());
    }

    #[test]
    fn test_credentials_persist_and_clear() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let credentials = WifiCredentials {
            ssid: "X".to_string(),
            password: "Y".to_string(),
        };

        CredentialStore::new(blobs.clone()).save(&credentials).unwrap();
        let store = CredentialStore::new(blobs);
        assert_eq!(store.load(), Some(credentials));

        store.clear().unwrap();
        assert_eq!(store.load(), None);
    }

    #[test]
    fn test_debug_hides_password() {
        let credentials = WifiCredentials {
            ssid: "barn".to_string(),
            password: "secret".to_string(),
        };
        assert!(!format!("{:?}", credentials).contains("secret"));
    }

    #[test]
    fn test_identity_items() {
        let store = IdentityStore::new(Arc::new(MemoryBlobStore::new()));
        assert_eq!(store.get(IdentityItem::PeepUuid), None);
        assert_eq!(store.peep_id("peep-a0b1c2"), "peep-a0b1c2");

        store.set(IdentityItem::PeepUuid, "peep-1").unwrap();
        store.set(IdentityItem::RootCa, "-----BEGIN CERTIFICATE-----").unwrap();
        assert_eq!(store.get(IdentityItem::PeepUuid).as_deref(), Some("peep-1"));
        assert_eq!(store.get(IdentityItem::Certificate), None);
        assert_eq!(store.peep_id("peep-a0b1c2"), "peep-1");
    }
}
