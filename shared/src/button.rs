// Button Monitor Module
// Debounced press/release edges and long-press reset detection for the single
// user button, published to the signal register

// Import Embassy time utilities
use embassy_time::{Duration, Instant, Timer};

// Import logging macros
use log::{debug, info, warn};

use crate::platform::WakeCause;
use crate::signals::{SignalBits, SignalRegister};

// Button timing
pub const DEBOUNCE_INTERVAL: Duration = Duration::from_millis(50); // Also the sampling period
pub const RESET_HOLD: Duration = Duration::from_millis(9_500); // Long press that wipes the device

/// Level of the physical button
pub trait ButtonInput: Send {
    fn is_pressed(&mut self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonEvent {
    Pressed,
    Released { held: Duration },
    ResetRequested,
    /// Release that ends a long press which already requested a reset
    ResetReleased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DetectorState {
    Idle,
    Debouncing { since: Instant },
    Tracking { since: Instant },
    Latched,
}

/// Pure edge detector over sampled button levels
#[derive(Debug)]
pub struct ButtonDetector {
    state: DetectorState,
}

impl ButtonDetector {
    /// A button already held at construction is tracked as pressed from `now`
    pub fn new(initially_pressed: bool, now: Instant) -> Self {
        let state = if initially_pressed {
            DetectorState::Tracking { since: now }
        } else {
            DetectorState::Idle
        };
        Self { state }
    }

    pub fn is_pressed(&self) -> bool {
        matches!(
            self.state,
            DetectorState::Tracking { .. } | DetectorState::Latched
        )
    }

    pub fn sample(&mut self, pressed: bool, now: Instant) -> Option<ButtonEvent> {
        match (self.state, pressed) {
            (DetectorState::Idle, true) => {
                self.state = DetectorState::Debouncing { since: now };
                None
            }
            (DetectorState::Idle, false) => None,
            (DetectorState::Debouncing { since }, true) => {
                if now.saturating_duration_since(since) >= DEBOUNCE_INTERVAL {
                    self.state = DetectorState::Tracking { since };
                    Some(ButtonEvent::Pressed)
                } else {
                    None
                }
            }
            // Bounce shorter than the debounce interval
            (DetectorState::Debouncing { .. }, false) => {
                self.state = DetectorState::Idle;
                None
            }
            (DetectorState::Tracking { since }, true) => {
                if now.saturating_duration_since(since) >= RESET_HOLD {
                    self.state = DetectorState::Latched;
                    Some(ButtonEvent::ResetRequested)
                } else {
                    None
                }
            }
            (DetectorState::Tracking { since }, false) => {
                self.state = DetectorState::Idle;
                Some(ButtonEvent::Released {
                    held: now.saturating_duration_since(since),
                })
            }
            (DetectorState::Latched, true) => None,
            (DetectorState::Latched, false) => {
                self.state = DetectorState::Idle;
                Some(ButtonEvent::ResetReleased)
            }
        }
    }
}

/// Samples a ButtonInput and owns the ButtonPressed/ButtonReleased bits
pub struct ButtonMonitor<I: ButtonInput> {
    input: I,
    detector: ButtonDetector,
    signals: &'static SignalRegister,
}

impl<I: ButtonInput> ButtonMonitor<I> {
    pub fn new(
        mut input: I,
        signals: &'static SignalRegister,
        wake_cause: WakeCause,
        now: Instant,
    ) -> Self {
        let initially_pressed = wake_cause == WakeCause::Button || input.is_pressed();
        if initially_pressed {
            info!("🔘 Button held at boot - counting as a press");
            signals.clear(SignalBits::BUTTON_RELEASED);
            signals.set(SignalBits::BUTTON_PRESSED);
        }

        Self {
            input,
            detector: ButtonDetector::new(initially_pressed, now),
            signals,
        }
    }

    /// Take one sample; safe to call from a timer callback.
    /// Returns true when a parked waiter was resumed.
    pub fn poll(&mut self, now: Instant) -> bool {
        let pressed = self.input.is_pressed();
        let Some(event) = self.detector.sample(pressed, now) else {
            return false;
        };

        match event {
            ButtonEvent::Pressed => {
                debug!("🔘 Button pressed");
                self.signals.clear(SignalBits::BUTTON_RELEASED);
                self.signals.set_from_interrupt(SignalBits::BUTTON_PRESSED)
            }
            ButtonEvent::Released { held } => {
                info!("🔘 Button released after {}ms", held.as_millis());
                self.signals.clear(SignalBits::BUTTON_PRESSED);
                self.signals.set_from_interrupt(SignalBits::BUTTON_RELEASED)
            }
            ButtonEvent::ResetRequested => {
                warn!(
                    "🔘 Button held for {}ms - factory reset requested",
                    RESET_HOLD.as_millis()
                );
                self.signals.set_from_interrupt(SignalBits::RESET_REQUESTED)
            }
            ButtonEvent::ResetReleased => {
                info!("🔘 Button released after reset request");
                self.signals.clear(SignalBits::BUTTON_PRESSED);
                self.signals.set_from_interrupt(SignalBits::BUTTON_RELEASED)
            }
        }
    }

    /// Sampling task for executors that are never blocked longer than the debounce interval
    pub async fn run(mut self) -> ! {
        loop {
            self.poll(Instant::now());
            Timer::after(DEBOUNCE_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct FakeButton(Arc<AtomicBool>);

    impl FakeButton {
        fn set(&self, pressed: bool) {
            self.0.store(pressed, Ordering::SeqCst);
        }
    }

    impl ButtonInput for FakeButton {
        fn is_pressed(&mut self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn at(ms: u64) -> Instant {
        Instant::from_millis(ms)
    }

    // Drive the detector at the sampling period from `start` to `end` (exclusive)
    fn hold(detector: &mut ButtonDetector, pressed: bool, start: u64, end: u64) -> Vec<ButtonEvent> {
        (start..end)
            .step_by(DEBOUNCE_INTERVAL.as_millis() as usize)
            .filter_map(|ms| detector.sample(pressed, at(ms)))
            .collect()
    }

    #[test]
    fn test_short_press_releases_without_reset() {
        let mut detector = ButtonDetector::new(false, at(0));

        let events = hold(&mut detector, true, 1_000, 4_000);
        assert_eq!(events, vec![ButtonEvent::Pressed]);

        let events = hold(&mut detector, false, 4_000, 4_100);
        assert_eq!(
            events,
            vec![ButtonEvent::Released {
                held: Duration::from_millis(3_000)
            }]
        );
    }

    #[test]
    fn test_long_press_requests_reset_once() {
        let mut detector = ButtonDetector::new(false, at(0));

        let events = hold(&mut detector, true, 0, 10_000);
        assert_eq!(
            events,
            vec![ButtonEvent::Pressed, ButtonEvent::ResetRequested]
        );

        let events = hold(&mut detector, false, 10_000, 10_200);
        assert_eq!(events, vec![ButtonEvent::ResetReleased]);
    }

    #[test]
    fn test_bounce_is_filtered() {
        let mut detector = ButtonDetector::new(false, at(0));
        assert_eq!(detector.sample(true, at(100)), None);
        assert_eq!(detector.sample(false, at(120)), None);
        assert_eq!(detector.sample(true, at(140)), None);
        assert_eq!(detector.sample(true, at(190)), Some(ButtonEvent::Pressed));
    }

    #[test]
    fn test_held_at_boot_counts_as_press() {
        let mut detector = ButtonDetector::new(true, at(0));
        assert!(detector.is_pressed());
        assert_eq!(
            detector.sample(false, at(200)),
            Some(ButtonEvent::Released {
                held: Duration::from_millis(200)
            })
        );
    }

    #[test]
    fn test_monitor_publishes_edges() {
        let signals: &'static SignalRegister = Box::leak(Box::new(SignalRegister::new()));
        let button = FakeButton::default();
        let mut monitor = ButtonMonitor::new(button.clone(), signals, WakeCause::Timer, at(0));
        assert!(signals.get().is_empty());

        button.set(true);
        monitor.poll(at(50));
        monitor.poll(at(100));
        assert!(signals.get().contains(SignalBits::BUTTON_PRESSED));

        button.set(false);
        monitor.poll(at(3_050));
        let bits = signals.get();
        assert!(bits.contains(SignalBits::BUTTON_RELEASED));
        assert!(!bits.contains(SignalBits::BUTTON_PRESSED));
        assert!(!bits.contains(SignalBits::RESET_REQUESTED));
    }

    #[test]
    fn test_monitor_reset_after_ten_second_hold() {
        let signals: &'static SignalRegister = Box::leak(Box::new(SignalRegister::new()));
        let button = FakeButton::default();
        button.set(true);
        let mut monitor = ButtonMonitor::new(button.clone(), signals, WakeCause::Button, at(0));
        assert!(signals.get().contains(SignalBits::BUTTON_PRESSED));

        for ms in (50..10_000).step_by(50) {
            monitor.poll(at(ms));
        }
        assert!(signals.get().contains(SignalBits::RESET_REQUESTED));

        button.set(false);
        monitor.poll(at(10_050));
        let bits = signals.get();
        assert!(!bits.contains(SignalBits::BUTTON_PRESSED));
        assert!(bits.contains(SignalBits::BUTTON_RELEASED));
    }
}
