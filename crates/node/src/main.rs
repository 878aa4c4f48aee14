use anyhow::Result;
use clap::Parser;
use rumqttc::MqttOptions;
use std::{env, time::Duration};
use tracing::info;
use tracing_subscriber::EnvFilter;

use envctl_node::broker::BrokerLink;
use envctl_node::config::{self, DeviceEntry, DeviceType};
use envctl_node::devices::climate::Climate;
use envctl_node::devices::fixture::Fixture;
use envctl_node::devices::pump::{self, Pump};
use envctl_node::devices::relay::Relay;
use envctl_node::devices::NodeServices;
use envctl_node::hardware::{open_climate_sensor, GpioSwitch, LoggingStrip};
use envctl_node::scheduler::Scheduler;
use envctl_node::store::ConfigStore;
use envctl_node::telemetry::TelemetryLog;
use envctl_node::window::LocalClock;

#[derive(Debug, Parser)]
#[command(name = "envctl-node", about = "Environmental-control node runtime")]
struct Cli {
    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    run().await
}

fn init_tracing(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

async fn run() -> Result<()> {
    // ── Env config ──────────────────────────────────────────────────
    let broker = env_or("MQTT_HOST", "127.0.0.1");
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let client_id = env_or("MQTT_CLIENT_ID", "envctl-node");
    let node_config = env_or("NODE_CONFIG", "node.toml");
    let store_path = env_or("CONFIG_STORE", "device-config.toml");
    let db_url = env_or("DB_URL", "sqlite:telemetry.db?mode=rwc");

    // ── Inventory + stores ──────────────────────────────────────────
    let inventory = config::load(&node_config)?;
    if inventory.devices.is_empty() {
        tracing::warn!(path = %node_config, "no devices configured");
    }

    let store = ConfigStore::open(&store_path)?;
    info!(path = %store_path, keys = store.key_count(), "config store ready");

    let log = TelemetryLog::connect(&db_url).await?;
    info!(db = %db_url, "telemetry log ready");

    // ── MQTT ────────────────────────────────────────────────────────
    let mut options = MqttOptions::new(client_id, broker.clone(), port);
    options.set_keep_alive(Duration::from_secs(30));
    let link = BrokerLink::new(options);
    info!(broker = %broker, port, "mqtt link configured");

    // ── Devices ─────────────────────────────────────────────────────
    let services = NodeServices {
        link,
        store,
        log,
        clock: LocalClock::System,
    };
    let mut scheduler = Scheduler::new(services.clone());
    for entry in &inventory.devices {
        spawn_device(&mut scheduler, &services, entry)?;
    }

    scheduler.run_until_shutdown().await
}

/// Open the hardware for one inventory entry and hand it to the scheduler.
fn spawn_device(scheduler: &mut Scheduler, services: &NodeServices, entry: &DeviceEntry) -> Result<()> {
    let identity = entry.identity();
    let pin = entry.gpio_pin()?;
    info!(device = %identity, kind = %entry.kind, pin, "registering device");

    match entry.kind {
        DeviceType::Climate => {
            let sensor = open_climate_sensor(pin)?;
            scheduler.spawn(identity, Climate::new(sensor));
        }
        DeviceType::Pump => {
            let status = pump::initial_status(&services.store, &identity);
            let switch = GpioSwitch::new(pin)?;
            scheduler.spawn(identity, Pump::new(Box::new(switch), status));
        }
        DeviceType::Fixture => {
            let strip = LoggingStrip::new(entry.led_count(), pin);
            scheduler.spawn(identity, Fixture::new(Box::new(strip)));
        }
        DeviceType::Relay => {
            let switch = GpioSwitch::new(pin)?;
            scheduler.spawn(identity, Relay::new(Box::new(switch)));
        }
    }
    Ok(())
}
