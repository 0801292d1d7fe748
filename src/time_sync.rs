// Time Sync Module
// System clock backed by the RTC (kept across deep sleep) with SNTP sync and
// a manual set path for the local configuration session

use std::time::{SystemTime, UNIX_EPOCH};

// Import anyhow for error handling
use anyhow::{anyhow, Result};

// Import chrono for readable timestamps in logs
use chrono::DateTime;

// Import the ESP-IDF SNTP client
use esp_idf_svc::sntp::EspSntp;
use esp_idf_svc::sys as esp_idf_sys;

// Import logging macros
use log::info;

use peep_shared::clock::Clock;

pub struct EspClock {
    sntp: Option<EspSntp<'static>>,
}

impl EspClock {
    pub fn new() -> Self {
        Self { sntp: None }
    }
}

fn rfc3339(unix_time: u32) -> String {
    DateTime::from_timestamp(i64::from(unix_time), 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| unix_time.to_string())
}

impl Clock for EspClock {
    fn unix_time(&self) -> u32 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0)
    }

    // Wraps after ~49 days; callers use tick_duration
    fn ticks_ms(&self) -> u32 {
        let micros = unsafe { esp_idf_sys::esp_timer_get_time() };
        (micros / 1000) as u32
    }

    fn set_unix_time(&mut self, unix_time: u32) -> Result<()> {
        let tv = esp_idf_sys::timeval {
            tv_sec: unix_time.into(),
            tv_usec: 0,
        };
        let result = unsafe { esp_idf_sys::settimeofday(&tv, std::ptr::null()) };
        if result != 0 {
            return Err(anyhow!("settimeofday failed: {}", result));
        }
        info!("🕐 Clock set to {}", rfc3339(unix_time));
        Ok(())
    }

    fn start_sync(&mut self) -> Result<()> {
        if self.sntp.is_none() {
            let sntp = EspSntp::new_default()
                .map_err(|e| anyhow!("Failed to start SNTP: {:?}", e))?;
            info!("🕐 SNTP started");
            self.sntp = Some(sntp);
        }
        Ok(())
    }
}
