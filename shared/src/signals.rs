// Signal Register Module
// Sticky broadcast bits shared by the button monitor, the lifecycle phases and
// network callbacks. Nothing clears a bit except an explicit clear() from its owner.

// Import core utilities for interior mutability and future polling
use core::cell::RefCell;
use core::fmt;
use core::future::poll_fn;
use core::ops::{BitAnd, BitOr, BitOrAssign, Not};
use core::task::{Poll, Waker};

// Import Embassy's critical section mutex for interrupt-safe access
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

// Import Embassy time utilities for bounded waits
use embassy_time::{with_timeout, Duration};

// Import logging macros
use log::debug;

/// Bitmask over the named signals
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct SignalBits(u32);

impl SignalBits {
    pub const NONE: Self = Self(0);
    pub const BLE_CREDENTIALS_READY: Self = Self(1 << 0);
    pub const CONFIG_SHADOW_RECEIVED: Self = Self(1 << 1);
    pub const WIFI_UP: Self = Self(1 << 2);
    pub const WIFI_DOWN: Self = Self(1 << 3);
    pub const BUTTON_RELEASED: Self = Self(1 << 4);
    pub const BUTTON_PRESSED: Self = Self(1 << 5);
    /// Reserved bit, added to every wait mask
    pub const RESET_REQUESTED: Self = Self(1 << 7);

    const NAMES: [(SignalBits, &'static str); 7] = [
        (Self::BLE_CREDENTIALS_READY, "BleCredentialsReady"),
        (Self::CONFIG_SHADOW_RECEIVED, "ConfigShadowReceived"),
        (Self::WIFI_UP, "WifiUp"),
        (Self::WIFI_DOWN, "WifiDown"),
        (Self::BUTTON_RELEASED, "ButtonReleased"),
        (Self::BUTTON_PRESSED, "ButtonPressed"),
        (Self::RESET_REQUESTED, "ResetRequested"),
    ];

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every bit of `other` is set in `self`
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when at least one bit of `other` is set in `self`
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for SignalBits {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for SignalBits {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for SignalBits {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for SignalBits {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0)
    }
}

impl fmt::Debug for SignalBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        for (bit, name) in Self::NAMES {
            if self.contains(bit) {
                set.entry(&format_args!("{}", name));
            }
        }
        set.finish()
    }
}

// A task parked in wait() until one of `mask` is raised
struct Waiter {
    id: u32,
    mask: SignalBits,
    waker: Waker,
}

struct RegisterState {
    bits: SignalBits,
    waiters: Vec<Waiter>,
    next_waiter_id: u32,
}

// Unparks its waiter when the wait ends, whether ready, timed out or dropped
struct Registration<'a> {
    register: &'a SignalRegister,
    id: u32,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.register.forget(self.id);
    }
}

/// Process-wide sticky signal bits with waitable edges
pub struct SignalRegister {
    state: Mutex<CriticalSectionRawMutex, RefCell<RegisterState>>,
}

impl Default for SignalRegister {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalRegister {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(RefCell::new(RegisterState {
                bits: SignalBits::NONE,
                waiters: Vec::new(),
                next_waiter_id: 0,
            })),
        }
    }

    /// OR `bits` into the register from task context
    pub fn set(&self, bits: SignalBits) {
        self.raise(bits);
    }

    /// OR `bits` into the register from interrupt or timer-callback context.
    /// Returns true when a parked waiter was resumed, so the caller can yield
    /// before leaving the interrupt.
    pub fn set_from_interrupt(&self, bits: SignalBits) -> bool {
        self.raise(bits)
    }

    /// Remove `bits`; only the owner of a bit may clear it
    pub fn clear(&self, bits: SignalBits) {
        self.state.lock(|cell| {
            let mut state = cell.borrow_mut();
            state.bits = state.bits & !bits;
        });
    }

    /// Snapshot of every bit currently set
    pub fn get(&self) -> SignalBits {
        self.state.lock(|cell| cell.borrow().bits)
    }

    /// Suspend until any bit of `mask` (or the reset bit) is set, or `timeout` elapses.
    /// Returns the full register contents observed when the wait ended.
    pub async fn wait(&self, mask: SignalBits, timeout: Duration) -> SignalBits {
        let mask = mask | SignalBits::RESET_REQUESTED;
        let registration = self.register();
        let ready = poll_fn(|cx| self.poll_wait(registration.id, mask, cx.waker()));

        match with_timeout(timeout, ready).await {
            Ok(bits) => bits,
            Err(_) => {
                let bits = self.get();
                debug!(
                    "⏱️ Signal wait for {:?} timed out after {}ms (register {:?})",
                    mask,
                    timeout.as_millis(),
                    bits
                );
                bits
            }
        }
    }

    fn register(&self) -> Registration<'_> {
        let id = self.state.lock(|cell| {
            let mut state = cell.borrow_mut();
            let id = state.next_waiter_id;
            state.next_waiter_id = id.wrapping_add(1);
            id
        });
        Registration { register: self, id }
    }

    fn forget(&self, id: u32) {
        self.state.lock(|cell| cell.borrow_mut().waiters.retain(|w| w.id != id));
    }

    fn poll_wait(&self, id: u32, mask: SignalBits, waker: &Waker) -> Poll<SignalBits> {
        self.state.lock(|cell| {
            let mut state = cell.borrow_mut();
            if state.bits.intersects(mask) {
                return Poll::Ready(state.bits);
            }

            // Re-polls of the same wait replace their earlier registration
            state.waiters.retain(|w| w.id != id);
            state.waiters.push(Waiter {
                id,
                mask,
                waker: waker.clone(),
            });
            Poll::Pending
        })
    }

    fn raise(&self, bits: SignalBits) -> bool {
        let ready: Vec<Waker> = self.state.lock(|cell| {
            let mut state = cell.borrow_mut();
            state.bits |= bits;

            let (ready, parked): (Vec<Waiter>, Vec<Waiter>) = std::mem::take(&mut state.waiters)
                .into_iter()
                .partition(|w| w.mask.intersects(bits));
            state.waiters = parked;
            ready.into_iter().map(|w| w.waker).collect()
        });

        let resumed = !ready.is_empty();
        for waker in ready {
            waker.wake();
        }
        resumed
    }

    #[cfg(test)]
    fn parked_waiters(&self) -> usize {
        self.state.lock(|cell| cell.borrow().waiters.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::join::join;
    use embassy_time::Timer;
    use futures::executor::block_on;

    #[test]
    fn test_set_bits_are_sticky() {
        let signals = SignalRegister::new();
        signals.set(SignalBits::WIFI_UP);

        let first = block_on(signals.wait(SignalBits::WIFI_UP, Duration::from_millis(10)));
        let second = block_on(signals.wait(SignalBits::WIFI_UP, Duration::from_millis(10)));

        assert!(first.contains(SignalBits::WIFI_UP));
        assert!(second.contains(SignalBits::WIFI_UP));
    }

    #[test]
    fn test_clear_removes_only_requested_bits() {
        let signals = SignalRegister::new();
        signals.set(SignalBits::WIFI_UP | SignalBits::BUTTON_PRESSED);
        signals.clear(SignalBits::WIFI_UP);

        assert_eq!(signals.get(), SignalBits::BUTTON_PRESSED);
    }

    #[test]
    fn test_wait_times_out_with_current_bits() {
        let signals = SignalRegister::new();
        signals.set(SignalBits::BUTTON_PRESSED);

        let bits = block_on(signals.wait(
            SignalBits::CONFIG_SHADOW_RECEIVED,
            Duration::from_millis(20),
        ));

        assert!(!bits.intersects(SignalBits::CONFIG_SHADOW_RECEIVED));
        assert!(bits.contains(SignalBits::BUTTON_PRESSED));
    }

    #[test]
    fn test_timed_out_waits_do_not_accumulate() {
        let signals = SignalRegister::new();

        for _ in 0..5 {
            block_on(signals.wait(SignalBits::BLE_CREDENTIALS_READY, Duration::from_millis(2)));
        }

        assert_eq!(signals.parked_waiters(), 0);
    }

    #[test]
    fn test_reset_bit_wakes_every_waiter() {
        let signals = SignalRegister::new();

        let (bits, _) = block_on(join(
            signals.wait(SignalBits::WIFI_UP, Duration::from_secs(5)),
            async {
                Timer::after(Duration::from_millis(10)).await;
                signals.set(SignalBits::RESET_REQUESTED);
            },
        ));

        assert!(bits.contains(SignalBits::RESET_REQUESTED));
        assert!(!bits.contains(SignalBits::WIFI_UP));
    }

    #[test]
    fn test_interrupt_set_reports_resumed_waiter() {
        let signals = SignalRegister::new();

        let (bits, resumed) = block_on(join(
            signals.wait(SignalBits::BUTTON_RELEASED, Duration::from_secs(5)),
            async {
                Timer::after(Duration::from_millis(10)).await;
                signals.set_from_interrupt(SignalBits::BUTTON_RELEASED)
            },
        ));

        assert!(resumed);
        assert!(bits.contains(SignalBits::BUTTON_RELEASED));
        assert_eq!(signals.parked_waiters(), 0);
    }

    #[test]
    fn test_interrupt_set_without_interested_waiter() {
        let signals = SignalRegister::new();
        assert!(!signals.set_from_interrupt(SignalBits::BUTTON_PRESSED));

        let (_, resumed) = block_on(join(
            signals.wait(SignalBits::WIFI_UP, Duration::from_millis(50)),
            async {
                Timer::after(Duration::from_millis(5)).await;
                signals.set_from_interrupt(SignalBits::WIFI_DOWN)
            },
        ));

        assert!(!resumed);
    }

    #[test]
    fn test_debug_lists_signal_names() {
        let bits = SignalBits::WIFI_UP | SignalBits::RESET_REQUESTED;
        assert_eq!(format!("{:?}", bits), "{WifiUp, ResetRequested}");
    }
}
