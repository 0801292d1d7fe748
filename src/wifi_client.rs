// WiFi Client Module
// Station-mode link used by the measure path. The driver is created on first
// connect so a BLE boot never touches the WiFi radio

use std::sync::{Arc, Mutex};

// Import anyhow for error handling
use anyhow::{anyhow, Result};

// Import Embassy time utilities
use embassy_time::Duration;

// Import ESP-IDF event loop for handling system events
use esp_idf_svc::eventloop::EspSystemEventLoop;

// Import the radio peripheral shared with BLE
use esp_idf_svc::hal::modem::Modem;
use esp_idf_svc::hal::peripheral::Peripheral;

// Import NVS partition for WiFi driver storage needs
use esp_idf_svc::nvs::EspDefaultNvsPartition;

// Import WiFi-related types from ESP-IDF
use esp_idf_svc::wifi::{AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi};

// Import logging macros
use log::{info, warn};

use peep_shared::credentials::WifiCredentials;
use peep_shared::platform::Network;
use peep_shared::signals::{SignalBits, SignalRegister};

/// The modem can back either WiFi or BLE; whichever starts first takes it
pub type RadioSlot = Arc<Mutex<Option<Modem>>>;

/// Take the modem out of the slot. Returns the token to hand back with
/// `release_radio` and the handle to build the driver from.
pub fn claim_radio(radio: &RadioSlot, holder: &str) -> Result<(Modem, Modem)> {
    let mut token = radio
        .lock()
        .map_err(|_| anyhow!("Radio slot lock poisoned"))?
        .take()
        .ok_or_else(|| anyhow!("Radio already taken by {}", holder))?;
    // Safety: the token stays out of the slot until the driver built on this handle is dropped
    let handle = unsafe { token.clone_unchecked() };
    Ok((token, handle))
}

/// Put the modem back once the driver using it has been dropped
pub fn release_radio(radio: &RadioSlot, token: Modem) {
    match radio.lock() {
        Ok(mut slot) => *slot = Some(token),
        Err(_) => warn!("⚠️ Radio slot lock poisoned, modem not returned"),
    }
}

pub struct EspWifiNetwork {
    radio: RadioSlot,
    sys_loop: EspSystemEventLoop,
    nvs: EspDefaultNvsPartition,
    signals: &'static SignalRegister,
    wifi: Option<BlockingWifi<EspWifi<'static>>>,
    radio_token: Option<Modem>,
}

impl EspWifiNetwork {
    pub fn new(
        radio: RadioSlot,
        sys_loop: EspSystemEventLoop,
        nvs: EspDefaultNvsPartition,
        signals: &'static SignalRegister,
    ) -> Self {
        Self {
            radio,
            sys_loop,
            nvs,
            signals,
            wifi: None,
            radio_token: None,
        }
    }

    fn driver(&mut self) -> Result<&mut BlockingWifi<EspWifi<'static>>> {
        if self.wifi.is_none() {
            let (token, modem) = claim_radio(&self.radio, "BLE")?;
            let wifi = EspWifi::new(modem, self.sys_loop.clone(), Some(self.nvs.clone()))
                .and_then(|wifi| BlockingWifi::wrap(wifi, self.sys_loop.clone()));
            let wifi = match wifi {
                Ok(wifi) => wifi,
                Err(e) => {
                    release_radio(&self.radio, token);
                    return Err(anyhow!("Failed to create WiFi driver: {:?}", e));
                }
            };
            info!("📶 WiFi driver initialized");
            self.wifi = Some(wifi);
            self.radio_token = Some(token);
        }

        self.wifi
            .as_mut()
            .ok_or_else(|| anyhow!("WiFi driver unavailable"))
    }
}

fn auth_method(password: &str) -> AuthMethod {
    if password.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPA2Personal
    }
}

impl Network for EspWifiNetwork {
    fn connect(&mut self, credentials: &WifiCredentials, timeout: Duration) -> Result<()> {
        let config = Configuration::Client(ClientConfiguration {
            ssid: credentials
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("SSID too long"))?,
            password: credentials
                .password
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("Password too long"))?,
            channel: None,
            auth_method: auth_method(&credentials.password),
            ..Default::default()
        });

        info!("📶 Connecting to '{}'", credentials.ssid);
        let wifi = self.driver()?;
        wifi.set_configuration(&config)
            .map_err(|e| anyhow!("Failed to set WiFi configuration: {:?}", e))?;
        wifi.start()
            .map_err(|e| anyhow!("Failed to start WiFi: {:?}", e))?;
        wifi.connect()
            .map_err(|e| anyhow!("Failed to associate with '{}': {:?}", credentials.ssid, e))?;
        wifi.ip_wait_while(
            || wifi.wifi().sta_netif().is_up().map(|up| !up),
            Some(timeout.into()),
        )
        .map_err(|e| anyhow!("No IP address within {:?}: {:?}", timeout, e))?;

        let ip_info = wifi
            .wifi()
            .sta_netif()
            .get_ip_info()
            .map_err(|e| anyhow!("Failed to read IP info: {:?}", e))?;
        info!("✅ WiFi up, IP: {}", ip_info.ip);

        self.signals.clear(SignalBits::WIFI_DOWN);
        self.signals.set(SignalBits::WIFI_UP);
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(wifi) = self.wifi.as_mut() {
            if wifi.is_connected().unwrap_or(false) {
                if let Err(e) = wifi.disconnect() {
                    warn!("⚠️ WiFi disconnect failed: {:?}", e);
                }
            }
            if let Err(e) = wifi.stop() {
                warn!("⚠️ WiFi stop failed: {:?}", e);
            }
            info!("📴 WiFi stopped");
        }

        // Drop the driver before handing the modem to BLE
        self.wifi = None;
        if let Some(token) = self.radio_token.take() {
            release_radio(&self.radio, token);
        }

        self.signals.clear(SignalBits::WIFI_UP);
        self.signals.set(SignalBits::WIFI_DOWN);
    }
}
