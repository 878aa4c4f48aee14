use serde_json::{Map, Value};
use std::fmt;

// ---------------------------------------------------------------------------
// Device identity and topics
// ---------------------------------------------------------------------------

/// The (api key, device id) pair a device is registered under. Fixes both
/// of its topics and the prefix of its config keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    api_key: String,
    device_id: String,
}

impl DeviceIdentity {
    pub fn new(api_key: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            device_id: device_id.into(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Telemetry egress: "/json/<key>/<id>/attrs".
    pub fn attrs_topic(&self) -> String {
        format!("/json/{}/{}/attrs", self.api_key, self.device_id)
    }

    /// Command ingress: "/<key>/<id>/cmd".
    pub fn cmd_topic(&self) -> String {
        format!("/{}/{}/cmd", self.api_key, self.device_id)
    }

    /// ConfigStore key for one of this device's parameters.
    pub fn config_key(&self, param: &str) -> String {
        format!("{}_{}", self.device_id, param)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.device_id)
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

pub const SET_COLLECT_INTERVAL: &str = "setCollectInterval";
pub const SET_ON_INTERVAL: &str = "setOnInterval";
pub const SET_OFF_INTERVAL: &str = "setOffInterval";
pub const SET_RIGHT_COLOR: &str = "setRightColor";
pub const SET_LEFT_COLOR: &str = "setLeftColor";
pub const SET_START_TIME: &str = "setStartTime";
pub const SET_END_TIME: &str = "setEndTime";

/// Pick the command to apply from a cmd payload: the first key of `keys`
/// (priority order) present in the JSON object with a non-null value.
/// Anything that is not a JSON object yields `None`.
pub fn select_command(payload: &[u8], keys: &[&'static str]) -> Option<(&'static str, Value)> {
    let Ok(Value::Object(mut fields)) = serde_json::from_slice::<Value>(payload) else {
        return None;
    };
    keys.iter().find_map(|key| match fields.remove(*key) {
        None | Some(Value::Null) => None,
        Some(value) => Some((*key, value)),
    })
}

// ---------------------------------------------------------------------------
// Acknowledgements
// ---------------------------------------------------------------------------

/// Reply published on the attrs topic after a command has been applied and
/// persisted.
#[derive(Debug, Clone)]
pub struct Ack {
    command: &'static str,
    fields: Map<String, Value>,
    info: String,
}

impl Ack {
    pub fn new(command: &'static str, info: impl Into<String>) -> Self {
        Self {
            command,
            fields: Map::new(),
            info: info.into(),
        }
    }

    /// Add one mnemonic field carrying a value just written.
    pub fn field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn into_payload(self) -> Value {
        let mut fields = self.fields;
        fields.insert(format!("{}_info", self.command), Value::String(self.info));
        fields.insert(format!("{}_status", self.command), Value::from("OK"));
        Value::Object(fields)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
