// Power Module
// Wake cause readout and deep sleep entry with the timer and the reset
// button (ext0, active low) armed as wake sources

// Import logging macros
use log::{info, warn};

use esp_idf_svc::sys as esp_idf_sys;

use peep_shared::platform::{PowerControl, WakeCause};

use crate::reset_button::RESET_BUTTON_GPIO;

pub struct EspPower {
    wake_cause: WakeCause,
}

impl EspPower {
    /// Latch the wake cause once at boot
    pub fn new() -> Self {
        let cause = unsafe { esp_idf_sys::esp_sleep_get_wakeup_cause() };
        let wake_cause = match cause {
            esp_idf_sys::esp_sleep_source_t_ESP_SLEEP_WAKEUP_TIMER => WakeCause::Timer,
            esp_idf_sys::esp_sleep_source_t_ESP_SLEEP_WAKEUP_EXT0 => WakeCause::Button,
            _ => WakeCause::PowerOn,
        };
        info!("⏰ Wake cause: {:?}", wake_cause);
        Self { wake_cause }
    }
}

impl PowerControl for EspPower {
    fn wake_cause(&self) -> WakeCause {
        self.wake_cause
    }

    fn deep_sleep(&mut self, seconds: u32) {
        info!("💤 Deep sleep for {}s", seconds);
        unsafe {
            esp_idf_sys::esp_sleep_enable_timer_wakeup(u64::from(seconds) * 1_000_000);
            let result = esp_idf_sys::esp_sleep_enable_ext0_wakeup(RESET_BUTTON_GPIO, 0);
            if result != esp_idf_sys::ESP_OK {
                warn!("⚠️ Button wake source unavailable: esp_err {}", result);
            }
            esp_idf_sys::esp_deep_sleep_start();
        }
    }
}
