// Peep Core Library
// Hardware-independent lifecycle, storage and publish logic for the Peep sensor
// Every hardware concern is reached through the collaborator traits in `platform`

pub mod button;
pub mod clock;
pub mod credentials;
pub mod cycle;
pub mod device_state;
pub mod hatch_config;
pub mod lifecycle;
pub mod measurement;
pub mod platform;
pub mod provisioning;
pub mod shadow;
pub mod signals;
pub mod storage;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use device_state::DeviceState;
pub use hatch_config::HatchConfig;
pub use lifecycle::{DeviceContext, LifecycleController};
pub use measurement::Measurement;
pub use signals::{SignalBits, SignalRegister};
