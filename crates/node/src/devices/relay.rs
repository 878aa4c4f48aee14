//! Binary output (cooling fixture, fan, heater) switched on inside a daily
//! time window.

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::time::Duration;
use time::macros::time;
use time::Time;

use super::{
    load_window, set_collect_interval, set_end_time, set_start_time, timestamp, unsupported,
    DeviceKind, Update, COLLECT_INTERVAL,
};
use crate::hardware::Switch;
use crate::mqtt::{DeviceIdentity, SET_COLLECT_INTERVAL, SET_END_TIME, SET_START_TIME};
use crate::store::ConfigStore;
use crate::telemetry::{Column, Field, Record, Schema};
use crate::window::{format_hms, TimeWindow};

pub const DEFAULT_WINDOW: TimeWindow = TimeWindow {
    start: time!(10:00),
    end: time!(20:00),
};
pub const DEFAULT_COLLECT_INTERVAL: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub window: TimeWindow,
    pub collect_interval: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayState {
    pub s: &'static str,
    pub st: String,
    pub et: String,
    pub ci: u64,
    pub timestamp: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRecord {
    pub status: String,
}

impl Record for RelayRecord {
    const SCHEMA: Schema = Schema {
        table: "relay_log",
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

fn status_text(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

pub struct Relay {
    switch: Box<dyn Switch>,
    on: bool,
}

impl Relay {
    pub fn new(switch: Box<dyn Switch>) -> Self {
        Self { switch, on: false }
    }

    pub fn is_on(&self) -> bool {
        self.on
    }
}

impl DeviceKind for Relay {
    type Config = RelayConfig;
    type Record = RelayRecord;
    type State = RelayState;

    const LABEL: &'static str = "relay";
    const COMMANDS: &'static [&'static str] = &[SET_START_TIME, SET_END_TIME, SET_COLLECT_INTERVAL];

    fn load_config(store: &ConfigStore, identity: &DeviceIdentity) -> RelayConfig {
        RelayConfig {
            window: load_window(store, identity, DEFAULT_WINDOW),
            collect_interval: store.get(
                &identity.config_key(COLLECT_INTERVAL),
                DEFAULT_COLLECT_INTERVAL,
            ),
        }
    }

    fn apply(config: &mut RelayConfig, command: &'static str, value: &Value) -> Result<Update> {
        match command {
            SET_START_TIME => set_start_time(&mut config.window, value),
            SET_END_TIME => set_end_time(&mut config.window, value),
            SET_COLLECT_INTERVAL => set_collect_interval(&mut config.collect_interval, value),
            other => unsupported(other),
        }
    }

    fn actuate(&mut self, config: &RelayConfig, now: Time) -> Result<()> {
        let on = config.window.contains(now);
        self.switch.set(on)?;
        self.on = on;
        Ok(())
    }

    fn record(&self, _config: &RelayConfig) -> Option<RelayRecord> {
        Some(RelayRecord {
            status: status_text(self.on).to_string(),
        })
    }

    fn state(&self, config: &RelayConfig) -> Option<RelayState> {
        Some(RelayState {
            s: status_text(self.on),
            st: format_hms(config.window.start),
            et: format_hms(config.window.end),
            ci: config.collect_interval,
            timestamp: timestamp(),
        })
    }

    fn next_sleep(&mut self, config: &RelayConfig) -> Duration {
        Duration::from_secs(config.collect_interval)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
