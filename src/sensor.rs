// Sensor Module
// BME280 environmental sensor on I2C0 (SDA GPIO32, SCL GPIO33, external pull-ups)

// Import anyhow for error handling
use anyhow::{anyhow, Result};

// Import the BME280 driver
use bme280::i2c::BME280;

// Import ESP-IDF I2C and delay support
use esp_idf_svc::hal::delay::Ets;
use esp_idf_svc::hal::gpio::{Gpio32, Gpio33};
use esp_idf_svc::hal::i2c::{I2c, I2cConfig, I2cDriver};
use esp_idf_svc::hal::peripheral::Peripheral;
use esp_idf_svc::hal::units::FromValueType;

// Import logging macros
use log::{debug, info};

use peep_shared::platform::{EnvironmentReading, EnvironmentSensor};

pub struct Bme280Sensor {
    sensor: BME280<I2cDriver<'static>>,
    initialized: bool,
}

impl Bme280Sensor {
    pub fn new(
        i2c: impl Peripheral<P = impl I2c> + 'static,
        sda: Gpio32,
        scl: Gpio33,
    ) -> Result<Self> {
        let config = I2cConfig::new()
            .baudrate(100.kHz().into())
            .sda_enable_pullup(false)
            .scl_enable_pullup(false);
        let driver = I2cDriver::new(i2c, sda, scl, &config)
            .map_err(|e| anyhow!("Failed to start I2C driver: {:?}", e))?;

        Ok(Self {
            sensor: BME280::new_primary(driver),
            initialized: false,
        })
    }

    // Deferred to the first read so a missing sensor never blocks provisioning
    fn ensure_initialized(&mut self) -> Result<()> {
        if !self.initialized {
            self.sensor
                .init(&mut Ets)
                .map_err(|e| anyhow!("Failed to init bme280: {:?}", e))?;
            self.initialized = true;
            info!("🌡️ BME280 initialized");
        }
        Ok(())
    }
}

impl EnvironmentSensor for Bme280Sensor {
    fn read(&mut self) -> Result<EnvironmentReading> {
        self.ensure_initialized()?;
        let measurements = self
            .sensor
            .measure(&mut Ets)
            .map_err(|e| anyhow!("Failed to read bme280 sensor: {:?}", e))?;
        debug!(
            "🌡️ Raw reading {:.2}C {:.1}% {:.0}Pa",
            measurements.temperature, measurements.humidity, measurements.pressure
        );

        Ok(EnvironmentReading {
            temperature: measurements.temperature,
            humidity: measurements.humidity,
            pressure: measurements.pressure,
            // The BME280 has no gas sensor
            gas_resistance: 0.0,
        })
    }
}
