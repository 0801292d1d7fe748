// Clock Module
// Wall-clock and free-running tick access, plus the SNTP validity wait

// Import anyhow for error handling
use anyhow::Result;

// Import chrono for calendar checks on the RTC value
use chrono::{DateTime, Datelike};

// Import Embassy time utilities
use embassy_time::Duration;

// Import logging macros
use log::{info, warn};

use crate::signals::{SignalBits, SignalRegister};

// Time sync constants
pub const MIN_VALID_YEAR: i32 = 2016; // RTC values before this year are unsynced
pub const TIME_SYNC_RETRIES: u32 = 10; // Validity polls after starting SNTP
pub const TIME_SYNC_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Validity polls after SNTP is started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSyncSchedule {
    pub retries: u32,
    pub retry_interval: Duration,
}

impl Default for TimeSyncSchedule {
    fn default() -> Self {
        Self {
            retries: TIME_SYNC_RETRIES,
            retry_interval: TIME_SYNC_RETRY_INTERVAL,
        }
    }
}

/// Wall clock plus a wrapping millisecond tick counter
pub trait Clock {
    /// Seconds since the unix epoch according to the RTC, valid or not
    fn unix_time(&self) -> u32;

    /// Milliseconds from a free-running counter that wraps at `u32::MAX`
    fn ticks_ms(&self) -> u32;

    /// Overwrite the RTC, used by the local configuration protocol
    fn set_unix_time(&mut self, unix_time: u32) -> Result<()>;

    /// Kick off network time sync; completion is observed through `unix_time`
    fn start_sync(&mut self) -> Result<()>;
}

/// Elapsed ticks between two samples of a counter that wraps at `u32::MAX`
pub fn tick_duration(previous: u32, current: u32) -> u32 {
    if current >= previous {
        current - previous
    } else {
        (u32::MAX - previous) + current
    }
}

/// An RTC value counts as valid once it lands in or after `MIN_VALID_YEAR`
pub fn is_valid_unix_time(unix_time: u32) -> bool {
    DateTime::from_timestamp(i64::from(unix_time), 0)
        .map(|t| t.year() >= MIN_VALID_YEAR)
        .unwrap_or(false)
}

/// Start SNTP and poll for a valid clock. Returns false when the clock is still
/// invalid after the retries or when a reset request interrupted the wait.
pub async fn sync_time(
    clock: &mut dyn Clock,
    signals: &SignalRegister,
    schedule: TimeSyncSchedule,
) -> bool {
    if is_valid_unix_time(clock.unix_time()) {
        return true;
    }

    if let Err(e) = clock.start_sync() {
        warn!("⚠️ Failed to start time sync: {}", e);
        return false;
    }

    for attempt in 1..=schedule.retries {
        // Waiting on no bits still wakes for the reserved reset bit
        let bits = signals.wait(SignalBits::NONE, schedule.retry_interval).await;
        if bits.contains(SignalBits::RESET_REQUESTED) {
            return false;
        }

        if is_valid_unix_time(clock.unix_time()) {
            info!("🕐 Clock synchronized after {} attempt(s)", attempt);
            return true;
        }
    }

    warn!(
        "⚠️ Clock still invalid after {} sync attempts",
        schedule.retries
    );
    false
}
