// Peep Firmware Entry Point
// Wires the ESP32 peripherals into the lifecycle controller and runs one boot:
// a phase or a measurement cycle, then deep sleep

#[cfg(target_os = "espidf")]
mod ble_provisioning;
#[cfg(target_os = "espidf")]
mod device_info;
#[cfg(target_os = "espidf")]
mod mqtt_client;
#[cfg(target_os = "espidf")]
mod nvs_store;
#[cfg(target_os = "espidf")]
mod power;
#[cfg(target_os = "espidf")]
mod reset_button;
#[cfg(target_os = "espidf")]
mod sensor;
#[cfg(target_os = "espidf")]
mod time_sync;
#[cfg(target_os = "espidf")]
mod wifi_client;

#[cfg(target_os = "espidf")]
mod firmware {
    use std::convert::Infallible;
    use std::sync::{Arc, Mutex};

    // Import anyhow for error handling
    use anyhow::{anyhow, Result};

    // Import Embassy time utilities
    use embassy_time::{Duration, Timer};

    // Import ESP-IDF system services
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::hal::peripherals::Peripherals;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;

    // Import logging macros
    use log::{error, info};

    use peep_shared::credentials::IdentityStore;
    use peep_shared::lifecycle::{Collaborators, DeviceContext, LifecycleController};
    use peep_shared::platform::PowerControl;
    use peep_shared::storage::SharedBlobStore;
    use peep_shared::SignalRegister;

    use crate::ble_provisioning::BleProvisioning;
    use crate::device_info;
    use crate::mqtt_client::AwsIotCloudClient;
    use crate::nvs_store::NvsBlobStore;
    use crate::power::EspPower;
    use crate::reset_button::{self, ResetButton};
    use crate::sensor::Bme280Sensor;
    use crate::time_sync::EspClock;
    use crate::wifi_client::{EspWifiNetwork, RadioSlot};

    // The one process-wide global: button timer, BLE callbacks and the main task share it
    static SIGNALS: SignalRegister = SignalRegister::new();

    pub async fn run() -> Result<Infallible> {
        let peripherals =
            Peripherals::take().map_err(|e| anyhow!("Failed to take peripherals: {:?}", e))?;
        let sys_loop = EspSystemEventLoop::take()
            .map_err(|e| anyhow!("Failed to take system event loop: {:?}", e))?;
        let nvs = EspDefaultNvsPartition::take()
            .map_err(|e| anyhow!("Failed to take NVS partition: {:?}", e))?;

        let device_id = device_info::device_id();
        info!("🆔 Device {}", device_id);

        let blobs: SharedBlobStore = Arc::new(
            NvsBlobStore::new(nvs.clone())
                .map_err(|e| anyhow!("Failed to open NVS store: {:?}", e))?,
        );

        let power = EspPower::new();
        let button = ResetButton::new(peripherals.pins.gpio0)?;
        // Dropping the timer stops sampling
        let _button_timer = reset_button::start_monitor(button, &SIGNALS, power.wake_cause())?;

        let radio: RadioSlot = Arc::new(Mutex::new(Some(peripherals.modem)));
        let parts = Collaborators {
            sensor: Box::new(Bme280Sensor::new(
                peripherals.i2c0,
                peripherals.pins.gpio32,
                peripherals.pins.gpio33,
            )?),
            network: Box::new(EspWifiNetwork::new(
                radio.clone(),
                sys_loop,
                nvs.clone(),
                &SIGNALS,
            )),
            cloud: Box::new(AwsIotCloudClient::new(Arc::new(IdentityStore::new(
                blobs.clone(),
            )))),
            clock: Box::new(EspClock::new()),
            provisioning: Box::new(BleProvisioning::new(
                radio,
                nvs,
                device_info::advertising_name(),
            )),
            power: Box::new(power),
        };

        let ctx = DeviceContext::new(&SIGNALS, &device_id, blobs, parts);
        info!("🆔 Peep id {}", ctx.peep_id());

        LifecycleController::new(ctx).run().await
    }

    /// Stay up and keep reporting; a watchdog or power cycle is the only way out
    pub async fn halt(reason: anyhow::Error) -> ! {
        loop {
            error!("❌ Halted: {:#}", reason);
            Timer::after(Duration::from_secs(1)).await;
        }
    }
}

#[cfg(target_os = "espidf")]
#[embassy_executor::main]
async fn main(_spawner: embassy_executor::Spawner) {
    // It is necessary to call this function once. Otherwise some patches to the runtime
    // implemented by esp-idf-sys might not link properly. See https://github.com/esp-rs/esp-idf-template/issues/71
    esp_idf_svc::sys::link_patches();

    // Bind the log crate to the ESP Logging facilities
    esp_idf_svc::log::EspLogger::initialize_default();

    log::info!("🐣 Peep firmware v{}", env!("CARGO_PKG_VERSION"));

    match firmware::run().await {
        Ok(never) => match never {},
        Err(e) => firmware::halt(e).await,
    }
}

#[cfg(not(target_os = "espidf"))]
fn main() {
    eprintln!("The peep firmware only runs on ESP-IDF targets; use peep-simulator on the host.");
}
