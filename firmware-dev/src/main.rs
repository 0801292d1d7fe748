// Peep Simulator
// Runs the real lifecycle controller against in-memory collaborators: BLE
// provisioning, the cloud shadow, buffered measurements and batch publishing

use std::time::{SystemTime, UNIX_EPOCH};

// Import anyhow for error handling
use anyhow::{anyhow, Context, Result};

// Import Embassy time utilities
use embassy_time::Duration;

// Import the blocking executor for one boot at a time
use futures::executor::block_on;

// Import logging macros
use log::info;

// Import rand for the synthetic sensor
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use peep_shared::clock::TimeSyncSchedule;
use peep_shared::lifecycle::{Collaborators, DeviceContext, LifecycleController, LifecycleTiming};
use peep_shared::platform::{EnvironmentReading, EnvironmentSensor};
use peep_shared::shadow::PumpSchedule;
use peep_shared::sim::{
    MemoryBlobStore, SimClock, SimCloud, SimNetwork, SimPower, SimProvisioning,
};
use peep_shared::SignalRegister;

static SIGNALS: SignalRegister = SignalRegister::new();

const DEFAULT_BOOTS: u32 = 24;
const HATCH_DAYS: u32 = 21;
const SIM_DEVICE_ID: &str = "peep-5ca1ab1e0000";

/// Incubator temperature drifting around 37.5C with the odd excursion
struct RandomWalkSensor {
    rng: StdRng,
    temperature: f32,
}

impl RandomWalkSensor {
    fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            temperature: 37.5,
        }
    }
}

impl EnvironmentSensor for RandomWalkSensor {
    fn read(&mut self) -> Result<EnvironmentReading> {
        self.temperature = (self.temperature + self.rng.gen_range(-0.2..=0.2)).clamp(36.0, 39.0);
        let spike = if self.rng.gen_ratio(1, 20) { 2.5 } else { 0.0 };

        Ok(EnvironmentReading {
            temperature: self.temperature + spike,
            humidity: self.rng.gen_range(50.0..60.0),
            pressure: 101_325.0 + self.rng.gen_range(-200.0..200.0),
            gas_resistance: 0.0,
        })
    }
}

struct Options {
    boots: u32,
    seed: u64,
}

fn parse_options() -> Result<Options> {
    let mut options = Options {
        boots: DEFAULT_BOOTS,
        seed: 7,
    };

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let value = args
            .next()
            .ok_or_else(|| anyhow!("Missing value for {}", arg))?;
        match arg.as_str() {
            "--boots" => options.boots = value.parse().context("Invalid --boots")?,
            "--seed" => options.seed = value.parse().context("Invalid --seed")?,
            other => return Err(anyhow!("Unknown option {}", other)),
        }
    }
    Ok(options)
}

fn shadow_document(end_unix_timestamp: u32) -> String {
    serde_json::json!({
        "state": {
            "desired": {
                "hatchUUID": "sim-hatch-0001",
                "endUnixTimestamp": end_unix_timestamp,
                "measureIntervalSec": 900,
                "measurementsBeforePublishing": 4,
                "lowTemperature": 36.0,
                "highTemperature": 39.5,
                "temperatureOffset": -0.3
            }
        }
    })
    .to_string()
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let options = parse_options()?;

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("System clock before 1970")?
        .as_secs() as u32;

    let blobs = std::sync::Arc::new(MemoryBlobStore::new());
    let network = SimNetwork::new(&SIGNALS);
    let cloud = SimCloud::new();
    let clock = SimClock::new(now);
    let provisioning = SimProvisioning::new();
    let power = SimPower::new(clock.clone());

    cloud.respond_with(&shadow_document(now + HATCH_DAYS * 86_400), 1);
    // The phone app writes credentials as soon as the device advertises
    provisioning.queue_write(br#"{"wifiSSID":"barn","wifiPassword":"hatchery"}"#);

    let parts = Collaborators {
        sensor: Box::new(RandomWalkSensor::new(options.seed)),
        network: Box::new(network.clone()),
        cloud: Box::new(cloud.clone()),
        clock: Box::new(clock.clone()),
        provisioning: Box::new(provisioning.clone()),
        power: Box::new(power.clone()),
    };
    let timing = LifecycleTiming {
        ble_window: Duration::from_millis(200),
        wifi_timeout: Duration::from_millis(200),
        time_sync: TimeSyncSchedule {
            retries: 2,
            retry_interval: Duration::from_millis(5),
        },
        shadow: PumpSchedule {
            process_step: Duration::from_millis(5),
            pump_interval: Duration::from_millis(5),
            max_pumps: 10,
        },
    };
    let ctx = DeviceContext::new(&SIGNALS, SIM_DEVICE_ID, blobs, parts).with_timing(timing);
    let mut controller = LifecycleController::new(ctx);

    for boot in 1..=options.boots {
        block_on(controller.boot())?;

        let ctx = controller.context();
        info!(
            "🔁 Boot {:>3}: state {}, slept {}s, {} buffered, {} published, wifi connects {}",
            boot,
            ctx.states.load(),
            power.last_sleep().unwrap_or(0),
            ctx.log.total().unwrap_or(0),
            cloud.published().len(),
            network.connects()
        );
    }

    info!(
        "🏁 Simulated {} boots over {}s of device time",
        options.boots,
        clock.now().saturating_sub(now)
    );
    Ok(())
}
