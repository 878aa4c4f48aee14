//! Temperature/humidity probe.

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::time::Duration;
use time::Time;

use super::{set_collect_interval, timestamp, unsupported, DeviceKind, Update, COLLECT_INTERVAL};
use crate::hardware::{ClimateReading, ClimateSensor};
use crate::mqtt::{DeviceIdentity, SET_COLLECT_INTERVAL};
use crate::store::ConfigStore;
use crate::telemetry::{Column, Field, Record, Schema};

pub const DEFAULT_COLLECT_INTERVAL: u64 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClimateConfig {
    pub collect_interval: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClimateState {
    pub t: f64,
    pub rh: f64,
    pub ci: u64,
    pub timestamp: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClimateRecord {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
}

impl Record for ClimateRecord {
    const SCHEMA: Schema = Schema {
        table: "climate_log",
        columns: &[Column::real("temperature"), Column::real("humidity")],
    };

    fn fields(&self) -> Vec<Field> {
        vec![Field::Real(self.temperature), Field::Real(self.humidity)]
    }

    fn from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            temperature: row.try_get("temperature")?,
            humidity: row.try_get("humidity")?,
        })
    }
}

pub struct Climate {
    sensor: Box<dyn ClimateSensor>,
    /// This cycle's reading; `None` if the read failed.
    current: Option<ClimateReading>,
}

impl Climate {
    pub fn new(sensor: Box<dyn ClimateSensor>) -> Self {
        Self {
            sensor,
            current: None,
        }
    }
}

impl DeviceKind for Climate {
    type Config = ClimateConfig;
    type Record = ClimateRecord;
    type State = ClimateState;

    const LABEL: &'static str = "climate";
    const COMMANDS: &'static [&'static str] = &[SET_COLLECT_INTERVAL];

    fn load_config(store: &ConfigStore, identity: &DeviceIdentity) -> ClimateConfig {
        ClimateConfig {
            collect_interval: store.get(
                &identity.config_key(COLLECT_INTERVAL),
                DEFAULT_COLLECT_INTERVAL,
            ),
        }
    }

    fn apply(config: &mut ClimateConfig, command: &'static str, value: &Value) -> Result<Update> {
        match command {
            SET_COLLECT_INTERVAL => set_collect_interval(&mut config.collect_interval, value),
            other => unsupported(other),
        }
    }

    fn actuate(&mut self, _config: &ClimateConfig, _now: Time) -> Result<()> {
        self.current = None;
        self.current = Some(self.sensor.read()?);
        Ok(())
    }

    /// One row per cycle; a failed read is logged as nulls.
    fn record(&self, _config: &ClimateConfig) -> Option<ClimateRecord> {
        Some(ClimateRecord {
            temperature: self.current.map(|r| r.temperature),
            humidity: self.current.map(|r| r.humidity),
        })
    }

    fn state(&self, config: &ClimateConfig) -> Option<ClimateState> {
        // A failed read sends nothing rather than a stale or null reading.
        let reading = self.current?;
        Some(ClimateState {
            t: reading.temperature,
            rh: reading.humidity,
            ci: config.collect_interval,
            timestamp: timestamp(),
        })
    }

    fn next_sleep(&mut self, config: &ClimateConfig) -> Duration {
        Duration::from_secs(config.collect_interval)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
