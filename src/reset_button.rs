// Reset Button Module
// GPIO0 sampling for the button monitor, driven by the ESP timer service so
// presses are seen even while the main task is blocked on the network

// Import anyhow for error handling
use anyhow::{anyhow, Result};

// Import Embassy time utilities
use embassy_time::Instant;

// Import ESP-IDF GPIO functionality for the button input
use esp_idf_svc::hal::gpio::{Gpio0, Input, PinDriver, Pull};

// Import the timer service that runs the sampling callback
use esp_idf_svc::timer::{EspTaskTimerService, EspTimer};

// Import logging macros
use log::info;

use peep_shared::button::{ButtonInput, ButtonMonitor, DEBOUNCE_INTERVAL};
use peep_shared::platform::WakeCause;
use peep_shared::signals::SignalRegister;

pub const RESET_BUTTON_GPIO: i32 = 0;

/// Active-low push button with the internal pull-up
pub struct ResetButton {
    pin: PinDriver<'static, Gpio0, Input>,
}

impl ResetButton {
    pub fn new(gpio0: Gpio0) -> Result<Self> {
        // The pad was handed to the RTC domain as a wake source before deep sleep
        unsafe {
            esp_idf_svc::sys::rtc_gpio_deinit(RESET_BUTTON_GPIO);
        }

        let mut pin = PinDriver::input(gpio0)
            .map_err(|e| anyhow!("Failed to configure reset button GPIO: {:?}", e))?;
        pin.set_pull(Pull::Up)
            .map_err(|e| anyhow!("Failed to set reset button pull-up: {:?}", e))?;
        Ok(Self { pin })
    }
}

impl ButtonInput for ResetButton {
    fn is_pressed(&mut self) -> bool {
        self.pin.is_low()
    }
}

/// Start periodic sampling. The returned timer must be kept alive.
pub fn start_monitor(
    button: ResetButton,
    signals: &'static SignalRegister,
    wake_cause: WakeCause,
) -> Result<EspTimer<'static>> {
    let mut monitor = ButtonMonitor::new(button, signals, wake_cause, Instant::now());

    let timer_service = EspTaskTimerService::new()
        .map_err(|e| anyhow!("Failed to create timer service: {:?}", e))?;
    let timer = timer_service
        .timer(move || {
            monitor.poll(Instant::now());
        })
        .map_err(|e| anyhow!("Failed to create button timer: {:?}", e))?;
    timer
        .every(DEBOUNCE_INTERVAL.into())
        .map_err(|e| anyhow!("Failed to start button timer: {:?}", e))?;

    info!(
        "🔘 Reset button sampled every {}ms on GPIO{}",
        DEBOUNCE_INTERVAL.as_millis(),
        RESET_BUTTON_GPIO
    );
    Ok(timer)
}
