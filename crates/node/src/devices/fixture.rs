//! Two-zone LED light fixture gated by a daily time window.
//!
//! The commanded colours are config; the current colours are what the strip
//! actually shows, which is the commanded colour inside the window and off
//! outside it. Both are reported.

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::time::Duration;
use time::macros::time;
use time::Time;

use super::{
    load_window, parse_color, set_collect_interval, set_end_time, set_start_time, timestamp,
    unsupported, DeviceKind, Update, COLLECT_INTERVAL, LEFT_COLOR, RIGHT_COLOR,
};
use crate::hardware::{PixelStrip, Rgb};
use crate::mqtt::{
    DeviceIdentity, SET_COLLECT_INTERVAL, SET_END_TIME, SET_LEFT_COLOR, SET_RIGHT_COLOR,
    SET_START_TIME,
};
use crate::store::ConfigStore;
use crate::telemetry::{Column, Field, Record, Schema};
use crate::window::{format_hms, TimeWindow};

pub const DEFAULT_WINDOW: TimeWindow = TimeWindow {
    start: time!(08:00),
    end: time!(18:00),
};
pub const DEFAULT_COLLECT_INTERVAL: u64 = 60;
pub const DEFAULT_LED_COUNT: usize = 54;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureConfig {
    pub window: TimeWindow,
    pub right: Rgb,
    pub left: Rgb,
    pub collect_interval: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FixtureState {
    #[serde(rename = "cr-red")]
    pub cr_red: u8,
    #[serde(rename = "cr-green")]
    pub cr_green: u8,
    #[serde(rename = "cr-blue")]
    pub cr_blue: u8,
    #[serde(rename = "cl-red")]
    pub cl_red: u8,
    #[serde(rename = "cl-green")]
    pub cl_green: u8,
    #[serde(rename = "cl-blue")]
    pub cl_blue: u8,
    #[serde(rename = "sr-red")]
    pub sr_red: u8,
    #[serde(rename = "sr-green")]
    pub sr_green: u8,
    #[serde(rename = "sr-blue")]
    pub sr_blue: u8,
    #[serde(rename = "sl-red")]
    pub sl_red: u8,
    #[serde(rename = "sl-green")]
    pub sl_green: u8,
    #[serde(rename = "sl-blue")]
    pub sl_blue: u8,
    pub st: String,
    pub et: String,
    pub ci: u64,
    pub timestamp: f64,
}

/// Current (shown) colours of both zones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureRecord {
    pub right: Rgb,
    pub left: Rgb,
}

impl Record for FixtureRecord {
    const SCHEMA: Schema = Schema {
        table: "fixture_log",
        columns: &[
            Column::integer("right_red"),
            Column::integer("right_green"),
            Column::integer("right_blue"),
            Column::integer("left_red"),
            Column::integer("left_green"),
            Column::integer("left_blue"),
        ],
    };

    fn fields(&self) -> Vec<Field> {
        [self.right, self.left]
            .iter()
            .flat_map(|c| [c.r, c.g, c.b])
            .map(|v| Field::Integer(v.into()))
            .collect()
    }

    fn from_row(row: &SqliteRow) -> Result<Self> {
        let channel = |name: &str| -> Result<u8> {
            let value: i64 = row.try_get(name)?;
            Ok(u8::try_from(value)?)
        };
        Ok(Self {
            right: Rgb::new(channel("right_red")?, channel("right_green")?, channel("right_blue")?),
            left: Rgb::new(channel("left_red")?, channel("left_green")?, channel("left_blue")?),
        })
    }
}

pub struct Fixture {
    strip: Box<dyn PixelStrip>,
    right: Rgb,
    left: Rgb,
}

impl Fixture {
    pub fn new(strip: Box<dyn PixelStrip>) -> Self {
        Self {
            strip,
            right: Rgb::OFF,
            left: Rgb::OFF,
        }
    }

    /// Colours currently shown (right, left).
    pub fn current(&self) -> (Rgb, Rgb) {
        (self.right, self.left)
    }
}

fn set_color(slot: &mut Rgb, command: &'static str, value: &Value) -> Result<Update> {
    let color = parse_color(value)?;
    *slot = color;
    let (param, prefix, zone) = if command == SET_RIGHT_COLOR {
        (RIGHT_COLOR, "sr", "Right")
    } else {
        (LEFT_COLOR, "sl", "Left")
    };
    Ok(Update::new(command, format!("Updated {zone} Color"))
        .persist(param, &color)
        .report(&format!("{prefix}-red"), color.r)
        .report(&format!("{prefix}-green"), color.g)
        .report(&format!("{prefix}-blue"), color.b))
}

impl DeviceKind for Fixture {
    type Config = FixtureConfig;
    type Record = FixtureRecord;
    type State = FixtureState;

    const LABEL: &'static str = "fixture";
    const COMMANDS: &'static [&'static str] = &[
        SET_RIGHT_COLOR,
        SET_LEFT_COLOR,
        SET_START_TIME,
        SET_END_TIME,
        SET_COLLECT_INTERVAL,
    ];

    fn load_config(store: &ConfigStore, identity: &DeviceIdentity) -> FixtureConfig {
        FixtureConfig {
            window: load_window(store, identity, DEFAULT_WINDOW),
            right: store.get(&identity.config_key(RIGHT_COLOR), Rgb::WHITE),
            left: store.get(&identity.config_key(LEFT_COLOR), Rgb::WHITE),
            collect_interval: store.get(
                &identity.config_key(COLLECT_INTERVAL),
                DEFAULT_COLLECT_INTERVAL,
            ),
        }
    }

    fn apply(config: &mut FixtureConfig, command: &'static str, value: &Value) -> Result<Update> {
        match command {
            SET_RIGHT_COLOR => set_color(&mut config.right, command, value),
            SET_LEFT_COLOR => set_color(&mut config.left, command, value),
            SET_START_TIME => set_start_time(&mut config.window, value),
            SET_END_TIME => set_end_time(&mut config.window, value),
            SET_COLLECT_INTERVAL => set_collect_interval(&mut config.collect_interval, value),
            other => unsupported(other),
        }
    }

    fn actuate(&mut self, config: &FixtureConfig, now: Time) -> Result<()> {
        if config.window.contains(now) {
            self.right = config.right;
            self.left = config.left;
        } else {
            self.right = Rgb::OFF;
            self.left = Rgb::OFF;
        }
        self.strip.show(self.right, self.left)
    }

    fn record(&self, _config: &FixtureConfig) -> Option<FixtureRecord> {
        Some(FixtureRecord {
            right: self.right,
            left: self.left,
        })
    }

    fn state(&self, config: &FixtureConfig) -> Option<FixtureState> {
        Some(FixtureState {
            cr_red: self.right.r,
            cr_green: self.right.g,
            cr_blue: self.right.b,
            cl_red: self.left.r,
            cl_green: self.left.g,
            cl_blue: self.left.b,
            sr_red: config.right.r,
            sr_green: config.right.g,
            sr_blue: config.right.b,
            sl_red: config.left.r,
            sl_green: config.left.g,
            sl_blue: config.left.b,
            st: format_hms(config.window.start),
            et: format_hms(config.window.end),
            ci: config.collect_interval,
            timestamp: timestamp(),
        })
    }

    fn next_sleep(&mut self, config: &FixtureConfig) -> Duration {
        Duration::from_secs(config.collect_interval)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
