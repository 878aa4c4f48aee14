//! The device lifecycle shared by every variant.
//!
//! A [`Device`] owns its hardware and runs the poll loop
//! (actuate → persist telemetry → publish state → sleep). Commands arrive on
//! the broker's event loop, are queued, and are applied by a separate task.
//! Both sides go through one per-device mutex around the variant's config.

pub mod climate;
pub mod fixture;
pub mod pump;
pub mod relay;

use anyhow::{bail, ensure, Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use time::Time;
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::broker::BrokerLink;
use crate::hardware::Rgb;
use crate::mqtt::{
    select_command, Ack, DeviceIdentity, SET_COLLECT_INTERVAL, SET_END_TIME, SET_START_TIME,
};
use crate::store::{ConfigStore, ConfigType};
use crate::telemetry::{Record, TelemetryLog};
use crate::window::{format_hms, parse_hms, LocalClock, TimeWindow};

// ---------------------------------------------------------------------------
// Config parameter names (ConfigStore key suffixes)
// ---------------------------------------------------------------------------

pub const COLLECT_INTERVAL: &str = "collectInterval";
pub const ON_INTERVAL: &str = "onInterval";
pub const OFF_INTERVAL: &str = "offInterval";
pub const STATUS: &str = "status";
pub const START_TIME: &str = "startTime";
pub const END_TIME: &str = "endTime";
pub const RIGHT_COLOR: &str = "rightColor";
pub const LEFT_COLOR: &str = "leftColor";

/// Inbound commands waiting for the command task, per device.
const COMMAND_QUEUE: usize = 16;

// ---------------------------------------------------------------------------
// Variant contract
// ---------------------------------------------------------------------------

/// What a concrete device contributes: its config schema, command table,
/// hardware primitive and telemetry shapes. Everything else is [`Device`].
pub trait DeviceKind: Send + 'static {
    type Config: Clone + fmt::Debug + Send + Sync + 'static;
    type Record: Record + fmt::Debug;
    type State: Serialize + fmt::Debug + Send + Sync;

    const LABEL: &'static str;
    /// Recognised command keys, highest priority first.
    const COMMANDS: &'static [&'static str];

    /// Read every parameter from the store, defaulting absent ones.
    fn load_config(store: &ConfigStore, identity: &DeviceIdentity) -> Self::Config;

    /// Apply one command to `config`. An `Err` means the value was unusable
    /// and nothing should be persisted or acknowledged.
    fn apply(config: &mut Self::Config, command: &'static str, value: &Value) -> Result<Update>;

    /// Compute the target state for `now` and drive the hardware.
    fn actuate(&mut self, config: &Self::Config, now: Time) -> Result<()>;

    /// Telemetry row for this cycle, `None` while there is nothing to log.
    fn record(&self, config: &Self::Config) -> Option<Self::Record>;

    /// Snapshot published on the attrs topic, `None` while there is nothing
    /// to send.
    fn state(&self, config: &Self::Config) -> Option<Self::State>;

    /// How long to sleep after this cycle.
    fn next_sleep(&mut self, config: &Self::Config) -> Duration;
}

/// A validated config change: the store writes it needs and the
/// acknowledgement to publish once they are durable.
#[derive(Debug)]
pub struct Update {
    writes: Vec<(&'static str, toml::Value)>,
    ack: Ack,
}

impl Update {
    pub fn new(command: &'static str, info: impl Into<String>) -> Self {
        Self {
            writes: Vec::new(),
            ack: Ack::new(command, info),
        }
    }

    pub fn persist<T: ConfigType>(mut self, param: &'static str, value: &T) -> Self {
        self.writes.push((param, value.to_toml()));
        self
    }

    pub fn report(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.ack = self.ack.field(field, value);
        self
    }
}

// ---------------------------------------------------------------------------
// Command value parsing
// ---------------------------------------------------------------------------

/// Seconds, as a positive integer or a numeric string.
pub fn parse_interval(value: &Value) -> Result<u64> {
    let secs = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .with_context(|| format!("interval must be a whole number of seconds, got {value}"))?;
    ensure!(secs > 0, "interval must be positive");
    // The store keeps integers as i64.
    ensure!(secs <= i64::MAX as u64, "interval of {secs} seconds is too large");
    Ok(secs)
}

/// `[r, g, b]` with each channel in 0..=255.
pub fn parse_color(value: &Value) -> Result<Rgb> {
    let parts = value
        .as_array()
        .with_context(|| format!("color must be an [r, g, b] array, got {value}"))?;
    ensure!(parts.len() == 3, "color must have 3 channels, got {}", parts.len());
    let mut channels = [0u8; 3];
    for (slot, part) in channels.iter_mut().zip(parts) {
        *slot = part
            .as_u64()
            .and_then(|c| u8::try_from(c).ok())
            .with_context(|| format!("color channel out of range: {part}"))?;
    }
    let [r, g, b] = channels;
    Ok(Rgb::new(r, g, b))
}

/// "HH:MM:SS".
pub fn parse_time(value: &Value) -> Result<Time> {
    let text = value
        .as_str()
        .with_context(|| format!("time must be an HH:MM:SS string, got {value}"))?;
    parse_hms(text)
}

// Commands shared by the windowed variants and the climate probe.

fn set_start_time(window: &mut TimeWindow, value: &Value) -> Result<Update> {
    let start = parse_time(value)?;
    window.start = start;
    Ok(Update::new(SET_START_TIME, format!("Updated to {}", format_hms(start)))
        .persist(START_TIME, &start)
        .report("st", format_hms(start)))
}

fn set_end_time(window: &mut TimeWindow, value: &Value) -> Result<Update> {
    let end = parse_time(value)?;
    window.end = end;
    Ok(Update::new(SET_END_TIME, format!("Updated to {}", format_hms(end)))
        .persist(END_TIME, &end)
        .report("et", format_hms(end)))
}

fn set_collect_interval(interval: &mut u64, value: &Value) -> Result<Update> {
    let secs = parse_interval(value)?;
    *interval = secs;
    Ok(Update::new(SET_COLLECT_INTERVAL, format!("Updated to {secs} seconds"))
        .persist(COLLECT_INTERVAL, &secs)
        .report("ci", secs))
}

fn unsupported(command: &str) -> Result<Update> {
    bail!("unsupported command '{command}'")
}

fn load_window(store: &ConfigStore, identity: &DeviceIdentity, default: TimeWindow) -> TimeWindow {
    TimeWindow::new(
        store.get(&identity.config_key(START_TIME), default.start),
        store.get(&identity.config_key(END_TIME), default.end),
    )
}

/// Unix time in seconds, as carried in every state payload.
pub fn timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// Handles every device on the node shares.
#[derive(Clone)]
pub struct NodeServices {
    pub link: BrokerLink,
    pub store: ConfigStore,
    pub log: TelemetryLog,
    pub clock: LocalClock,
}

pub struct Device<K: DeviceKind> {
    kind: K,
    shared: Arc<Shared<K>>,
    log: TelemetryLog,
    clock: LocalClock,
}

/// The part of a device the command task also touches.
struct Shared<K: DeviceKind> {
    identity: DeviceIdentity,
    config: Mutex<K::Config>,
    link: BrokerLink,
    store: ConfigStore,
}

impl<K: DeviceKind> Device<K> {
    /// Load config, wait for the broker, and start listening for commands.
    pub async fn start(identity: DeviceIdentity, kind: K, services: &NodeServices) -> Result<Self> {
        let config = K::load_config(&services.store, &identity);
        info!(device = %identity, kind = K::LABEL, ?config, "device configured");

        // Telemetry problems never keep the device from running; `append`
        // retries the schema on every cycle.
        if let Err(e) = services.log.ensure_schema::<K::Record>(identity.device_id()).await {
            error!(device = %identity, phase = "telemetry", "schema unavailable: {e:#}");
        }

        services.link.connect().await;

        let shared = Arc::new(Shared {
            identity,
            config: Mutex::new(config),
            link: services.link.clone(),
            store: services.store.clone(),
        });

        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let cmd_topic = shared.identity.cmd_topic();
        let device = shared.identity.device_id().to_string();
        services.link.register_callback(cmd_topic.clone(), move |topic, payload| {
            if let Err(e) = tx.try_send(payload.to_vec()) {
                warn!(device = %device, topic, "command dropped: {e}");
            }
        });
        services.link.subscribe(&cmd_topic).await;
        tokio::spawn(Arc::clone(&shared).command_loop(rx));

        log_history::<K::Record>(&services.log, shared.identity.device_id()).await;
        Ok(Self {
            kind,
            shared,
            log: services.log.clone(),
            clock: services.clock,
        })
    }

    /// Poll forever.
    pub async fn run(mut self) {
        info!(device = %self.shared.identity, "device loop started");
        loop {
            let pause = self.cycle(self.clock.now()).await;
            sleep(pause).await;
        }
    }

    /// One pass of the poll loop. Every phase runs even if an earlier one
    /// failed; failures are logged here and never escape.
    pub(crate) async fn cycle(&mut self, now: Time) -> Duration {
        let config = self.shared.config.lock().await.clone();
        let id = &self.shared.identity;

        if let Err(e) = self.kind.actuate(&config, now) {
            error!(device = %id, phase = "actuate", "hardware error: {e:#}");
        }

        if let Some(record) = self.kind.record(&config) {
            self.log.append(id.device_id(), &record).await;
        }

        match self.kind.state(&config) {
            Some(state) => {
                info!(device = %id, ?state, "{} cycle", K::LABEL);
                let outcome = self.shared.link.publish_json(&id.attrs_topic(), &state).await;
                debug!(device = %id, ?outcome, "state published");
            }
            None => debug!(device = %id, "no reading this cycle; state send skipped"),
        }

        self.kind.next_sleep(&config)
    }

    #[cfg(test)]
    pub(crate) fn kind(&self) -> &K {
        &self.kind
    }

    #[cfg(test)]
    pub(crate) async fn config(&self) -> K::Config {
        self.shared.config.lock().await.clone()
    }

    #[cfg(test)]
    pub(crate) async fn handle_command(&self, payload: &[u8]) -> bool {
        self.shared.handle_command(payload).await
    }
}

async fn log_history<R: Record + fmt::Debug>(log: &TelemetryLog, id: &str) {
    let count = log.count::<R>(id).await;
    let last = log.recent::<R>(id, 1).await;
    match (count, last) {
        (Ok(rows), Ok(last)) => match last.first() {
            Some(row) => info!(device = %id, rows, last_at = %row.ts, last = ?row.record, "telemetry history"),
            None => info!(device = %id, "no telemetry history"),
        },
        (Err(e), _) | (_, Err(e)) => warn!(device = %id, "telemetry history unavailable: {e:#}"),
    }
}

impl<K: DeviceKind> Shared<K> {
    async fn command_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Vec<u8>>) {
        while let Some(payload) = rx.recv().await {
            self.handle_command(&payload).await;
        }
    }

    /// Apply, persist, then acknowledge. Returns whether an ack was sent.
    /// The in-memory config only changes once every write is durable.
    async fn handle_command(&self, payload: &[u8]) -> bool {
        let id = &self.identity;
        let Some((command, value)) = select_command(payload, K::COMMANDS) else {
            debug!(device = %id, "ignoring payload without a recognised command");
            return false;
        };

        let ack = {
            let mut config = self.config.lock().await;
            let mut next = config.clone();
            let update = match K::apply(&mut next, command, &value) {
                Ok(update) => update,
                Err(e) => {
                    warn!(device = %id, command, "malformed command ignored: {e:#}");
                    return false;
                }
            };
            for (param, value) in update.writes {
                if let Err(e) = self.persist(id.config_key(param), value).await {
                    error!(device = %id, command, phase = "persist", "{e:#}");
                    return false;
                }
            }
            *config = next;
            info!(device = %id, command, config = ?*config, "command applied");
            update.ack
        };

        let outcome = self.link.publish_json(&id.attrs_topic(), &ack.into_payload()).await;
        debug!(device = %id, command, ?outcome, "command acknowledged");
        true
    }

    /// The store write (and its fsync) runs on the blocking pool.
    async fn persist(&self, key: String, value: toml::Value) -> Result<()> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.set_value(&key, value))
            .await
            .context("config write task failed")?
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------


// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::time;

    // -- parse_interval -----------------------------------------------------

    #[test]
    fn interval_accepts_integers_and_numeric_strings() {
        assert_eq!(parse_interval(&json!(30)).unwrap(), 30);
        assert_eq!(parse_interval(&json!(" 15 ")).unwrap(), 15);
    }

    #[test]
    fn interval_rejects_zero_negative_and_fractional() {
        assert!(parse_interval(&json!(0)).is_err());
        assert!(parse_interval(&json!(-5)).is_err());
        assert!(parse_interval(&json!(2.5)).is_err());
        assert!(parse_interval(&json!(true)).is_err());
    }

    #[test]
    fn interval_must_fit_a_stored_integer() {
        assert_eq!(parse_interval(&json!(i64::MAX)).unwrap(), i64::MAX as u64);
        assert!(parse_interval(&json!(u64::MAX)).is_err());
        assert!(parse_interval(&json!(u64::MAX.to_string())).is_err());
    }

    // -- parse_color --------------------------------------------------------

    #[test]
    fn color_accepts_three_channels() {
        assert_eq!(parse_color(&json!([255, 128, 0])).unwrap(), Rgb::new(255, 128, 0));
    }

    #[test]
    fn color_rejects_bad_shapes() {
        assert!(parse_color(&json!([255, 128])).is_err());
        assert!(parse_color(&json!([1, 2, 3, 4])).is_err());
        assert!(parse_color(&json!([256, 0, 0])).is_err());
        assert!(parse_color(&json!([-1, 0, 0])).is_err());
        assert!(parse_color(&json!("red")).is_err());
    }

    // -- parse_time ---------------------------------------------------------

    #[test]
    fn time_accepts_hms_strings_only() {
        assert_eq!(parse_time(&json!("22:15:00")).unwrap(), time!(22:15));
        assert!(parse_time(&json!("22:15")).is_err());
        assert!(parse_time(&json!(2215)).is_err());
    }

    // -- Shared window commands ---------------------------------------------

    #[test]
    fn start_time_update_persists_and_reports_new_value() {
        let mut window = TimeWindow::new(time!(08:00), time!(18:00));
        let update = set_start_time(&mut window, &json!("06:30:00")).unwrap();
        assert_eq!(window.start, time!(06:30));
        assert_eq!(update.writes, vec![(START_TIME, toml::Value::from("06:30:00"))]);
        assert_eq!(
            update.ack.into_payload(),
            json!({
                "st": "06:30:00",
                "setStartTime_info": "Updated to 06:30:00",
                "setStartTime_status": "OK",
            })
        );
    }

    #[test]
    fn largest_interval_is_written_as_reported() {
        let mut interval = 60;
        let update = set_collect_interval(&mut interval, &json!(i64::MAX)).unwrap();
        assert_eq!(interval, i64::MAX as u64);
        assert_eq!(update.writes, vec![(COLLECT_INTERVAL, toml::Value::Integer(i64::MAX))]);
        assert_eq!(update.ack.into_payload()["ci"], json!(i64::MAX));
    }

    #[test]
    fn invalid_value_leaves_config_untouched() {
        let mut interval = 60;
        assert!(set_collect_interval(&mut interval, &json!("soon")).is_err());
        assert_eq!(interval, 60);
    }

    #[test]
    fn unsupported_command_is_an_error() {
        assert!(unsupported("reboot").is_err());
    }
}
