//! Pump cycling between an "on" period and an "off" period.

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::fmt;
use std::time::Duration;
use time::Time;
use tracing::warn;

use super::{
    parse_interval, timestamp, unsupported, DeviceKind, Update, OFF_INTERVAL, ON_INTERVAL, STATUS,
};
use crate::hardware::Switch;
use crate::mqtt::{DeviceIdentity, SET_OFF_INTERVAL, SET_ON_INTERVAL};
use crate::store::ConfigStore;
use crate::telemetry::{Column, Field, Record, Schema};

pub const DEFAULT_ON_INTERVAL: u64 = 5;
pub const DEFAULT_OFF_INTERVAL: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PumpStatus {
    On,
    Off,
}

impl PumpStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
        }
    }

    fn toggled(self) -> Self {
        match self {
            Self::On => Self::Off,
            Self::Off => Self::On,
        }
    }
}

impl fmt::Display for PumpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status the pump starts in, from the `status` key (default "off").
pub fn initial_status(store: &ConfigStore, identity: &DeviceIdentity) -> PumpStatus {
    let raw: String = store.get(&identity.config_key(STATUS), "off".to_string());
    match raw.trim().to_ascii_lowercase().as_str() {
        "on" => PumpStatus::On,
        "off" => PumpStatus::Off,
        other => {
            warn!(device = %identity, status = other, "unknown pump status; starting off");
            PumpStatus::Off
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PumpConfig {
    pub on_interval: u64,
    pub off_interval: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PumpState {
    pub s: PumpStatus,
    pub on: u64,
    pub off: u64,
    pub timestamp: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PumpRecord {
    pub status: String,
}

impl Record for PumpRecord {
    const SCHEMA: Schema = Schema {
        table: "pump_log",
        columns: &[Column::text("status")],
    };

    fn fields(&self) -> Vec<Field> {
        vec![Field::Text(self.status.clone())]
    }

    fn from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            status: row.try_get("status")?,
        })
    }
}

pub struct Pump {
    switch: Box<dyn Switch>,
    status: PumpStatus,
}

impl Pump {
    pub fn new(switch: Box<dyn Switch>, status: PumpStatus) -> Self {
        Self { switch, status }
    }

    pub fn status(&self) -> PumpStatus {
        self.status
    }
}

impl DeviceKind for Pump {
    type Config = PumpConfig;
    type Record = PumpRecord;
    type State = PumpState;

    const LABEL: &'static str = "pump";
    const COMMANDS: &'static [&'static str] = &[SET_ON_INTERVAL, SET_OFF_INTERVAL];

    fn load_config(store: &ConfigStore, identity: &DeviceIdentity) -> PumpConfig {
        PumpConfig {
            on_interval: store.get(&identity.config_key(ON_INTERVAL), DEFAULT_ON_INTERVAL),
            off_interval: store.get(&identity.config_key(OFF_INTERVAL), DEFAULT_OFF_INTERVAL),
        }
    }

    fn apply(config: &mut PumpConfig, command: &'static str, value: &Value) -> Result<Update> {
        let secs = parse_interval(value)?;
        let (slot, param, field) = match command {
            SET_ON_INTERVAL => (&mut config.on_interval, ON_INTERVAL, "on"),
            SET_OFF_INTERVAL => (&mut config.off_interval, OFF_INTERVAL, "off"),
            other => return unsupported(other),
        };
        *slot = secs;
        Ok(Update::new(command, format!("Updated to {secs} seconds"))
            .persist(param, &secs)
            .report(field, secs))
    }

    fn actuate(&mut self, _config: &PumpConfig, _now: Time) -> Result<()> {
        self.switch.set(self.status == PumpStatus::On)
    }

    fn record(&self, _config: &PumpConfig) -> Option<PumpRecord> {
        Some(PumpRecord {
            status: self.status.as_str().to_string(),
        })
    }

    fn state(&self, config: &PumpConfig) -> Option<PumpState> {
        Some(PumpState {
            s: self.status,
            on: config.on_interval,
            off: config.off_interval,
            timestamp: timestamp(),
        })
    }

    /// Sleep for the current status's period, then flip for the next cycle.
    fn next_sleep(&mut self, config: &PumpConfig) -> Duration {
        let secs = match self.status {
            PumpStatus::On => config.on_interval,
            PumpStatus::Off => config.off_interval,
        };
        self.status = self.status.toggled();
        Duration::from_secs(secs)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::testing::Harness;
    use crate::devices::Device;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use time::macros::time;

    /// Switch that records every level it is driven to.
    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<bool>>>);

    impl Switch for Recorder {
        fn set(&mut self, on: bool) -> Result<()> {
            self.0.lock().unwrap().push(on);
            Ok(())
        }
    }

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new("k", "pump001")
    }

    async fn start(h: &Harness, recorder: &Recorder) -> Device<Pump> {
        let status = initial_status(&h.services.store, &identity());
        let kind = Pump::new(Box::new(recorder.clone()), status);
        Device::start(identity(), kind, &h.services).await.unwrap()
    }

    // -- Poll loop ----------------------------------------------------------

    #[tokio::test]
    async fn alternates_off_and_on_periods() {
        let h = Harness::new().await;
        let recorder = Recorder::default();
        let mut device = start(&h, &recorder).await;
        assert_eq!(device.kind().status(), PumpStatus::Off);

        assert_eq!(device.cycle(time!(12:00)).await, Duration::from_secs(10));
        assert_eq!(device.kind().status(), PumpStatus::On);

        assert_eq!(device.cycle(time!(12:00:10)).await, Duration::from_secs(5));
        assert_eq!(device.kind().status(), PumpStatus::Off);

        assert_eq!(*recorder.0.lock().unwrap(), vec![false, true]);

        // One row per cycle, carrying the status active during that cycle.
        let rows = h.services.log.recent::<PumpRecord>("pump001", 10).await.unwrap();
        let statuses: Vec<_> = rows.iter().rev().map(|r| r.record.status.as_str()).collect();
        assert_eq!(statuses, vec!["off", "on"]);

        let sent = h.sent_on(&identity().attrs_topic());
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0]["s"], json!("off"));
        assert_eq!(sent[0]["on"], json!(5));
        assert_eq!(sent[0]["off"], json!(10));
        assert_eq!(sent[1]["s"], json!("on"));
    }

    #[tokio::test]
    async fn starts_from_stored_status() {
        let h = Harness::new().await;
        h.services.store.set("pump001_status", &"ON".to_string()).unwrap();
        let recorder = Recorder::default();
        let mut device = start(&h, &recorder).await;

        assert_eq!(device.cycle(time!(12:00)).await, Duration::from_secs(5));
        assert_eq!(*recorder.0.lock().unwrap(), vec![true]);
    }

    #[test]
    fn unknown_stored_status_starts_off() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path().join("c.toml")).unwrap();
        store.set("pump001_status", &"maybe".to_string()).unwrap();
        assert_eq!(initial_status(&store, &identity()), PumpStatus::Off);
    }

    // -- Commands -----------------------------------------------------------

    #[tokio::test]
    async fn only_first_priority_command_is_applied() {
        let h = Harness::new().await;
        let mut device = start(&h, &Recorder::default()).await;

        let applied = device
            .handle_command(br#"{"setOffInterval": 40, "setOnInterval": 7}"#)
            .await;
        assert!(applied);
        assert_eq!(
            device.config().await,
            PumpConfig { on_interval: 7, off_interval: DEFAULT_OFF_INTERVAL }
        );
        assert_eq!(h.services.store.get("pump001_onInterval", 0u64), 7);
        assert_eq!(h.services.store.get("pump001_offInterval", 0u64), 0);

        let acks = h.sent_on(&identity().attrs_topic());
        assert_eq!(
            acks,
            vec![json!({
                "on": 7,
                "setOnInterval_info": "Updated to 7 seconds",
                "setOnInterval_status": "OK",
            })]
        );

        // The new "on" period is used on the next "on" cycle.
        device.cycle(time!(12:00)).await;
        assert_eq!(device.cycle(time!(12:00:10)).await, Duration::from_secs(7));
    }

    #[tokio::test]
    async fn malformed_commands_are_ignored_without_ack() {
        let h = Harness::new().await;
        let device = start(&h, &Recorder::default()).await;

        let payloads: [&[u8]; 4] = [
            b"not json",
            br#"{"setCollectInterval": 3}"#,
            br#"{"setOnInterval": 0}"#,
            br#"{"setOnInterval": "soon", "setOffInterval": 20}"#,
        ];
        for payload in payloads {
            assert!(!device.handle_command(payload).await);
        }

        assert_eq!(
            device.config().await,
            PumpConfig { on_interval: DEFAULT_ON_INTERVAL, off_interval: DEFAULT_OFF_INTERVAL }
        );
        assert!(h.sent_on(&identity().attrs_topic()).is_empty());
        assert_eq!(h.services.store.key_count(), 0);
    }

    #[tokio::test]
    async fn persistence_failure_sends_no_ack() {
        let h = Harness::new().await;
        let device = start(&h, &Recorder::default()).await;

        // Make the store's directory unusable so the temp-file write fails.
        std::fs::remove_dir_all(h.dir.path()).unwrap();

        assert!(!device.handle_command(br#"{"setOnInterval": 9}"#).await);
        assert_eq!(device.config().await.on_interval, DEFAULT_ON_INTERVAL);
        assert!(h.sent_on(&identity().attrs_topic()).is_empty());
    }

    #[tokio::test]
    async fn commands_arrive_through_the_broker_link() {
        let h = Harness::new().await;
        let device = start(&h, &Recorder::default()).await;
        assert!(h.transport.subscribed().contains(&identity().cmd_topic()));

        h.services
            .link
            .dispatch(&identity().cmd_topic(), br#"{"setOffInterval": 25}"#);

        tokio::time::timeout(Duration::from_secs(2), async {
            while device.config().await.off_interval != 25 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("command task should apply the update");

        // The ack is published after the config commit; wait for it too.
        tokio::time::timeout(Duration::from_secs(2), async {
            while h.sent_on(&identity().attrs_topic()).is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(h.sent_on(&identity().attrs_topic())[0]["off"], json!(25));
    }
}
