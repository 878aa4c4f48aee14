//! Node inventory file: which devices this node runs, under which identity,
//! on which pins.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;

use crate::devices::fixture::DEFAULT_LED_COUNT;
use crate::mqtt::DeviceIdentity;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Climate,
    Pump,
    Fixture,
    Relay,
}

impl DeviceType {
    /// BCM pin used when an entry does not name one.
    pub fn default_pin(self) -> i64 {
        match self {
            Self::Climate => 4,
            Self::Pump | Self::Relay => 17,
            Self::Fixture => 18,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Climate => "climate",
            Self::Pump => "pump",
            Self::Fixture => "fixture",
            Self::Relay => "relay",
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceEntry {
    pub kind: DeviceType,
    pub api_key: String,
    pub device_id: String,
    pub pin: Option<i64>,
    pub led_count: Option<i64>,
}

impl DeviceEntry {
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(self.api_key.clone(), self.device_id.clone())
    }

    pub fn effective_pin(&self) -> i64 {
        self.pin.unwrap_or_else(|| self.kind.default_pin())
    }

    /// Validated BCM pin number.
    pub fn gpio_pin(&self) -> Result<u8> {
        u8::try_from(self.effective_pin())
            .with_context(|| format!("device '{}': pin out of range", self.device_id))
    }

    pub fn led_count(&self) -> usize {
        self.led_count
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(DEFAULT_LED_COUNT)
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM.
const VALID_GPIO_PINS: std::ops::RangeInclusive<i64> = 2..=27;

/// Characters with a meaning in MQTT topic filters.
const TOPIC_RESERVED: &[char] = &['/', '+', '#'];

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl NodeConfig {
    /// Validate every entry. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_devices(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_devices(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();
        let mut seen_pins: HashSet<i64> = HashSet::new();

        for (i, d) in self.devices.iter().enumerate() {
            let ctx = || {
                if d.device_id.is_empty() {
                    format!("devices[{i}]")
                } else {
                    format!("device '{}'", d.device_id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if d.device_id.trim().is_empty() {
                errors.push(format!("{}: device_id is empty", ctx()));
            } else if !seen_ids.insert(&d.device_id) {
                errors.push(format!("{}: duplicate device_id", ctx()));
            }
            for (field, value) in [("device_id", &d.device_id), ("api_key", &d.api_key)] {
                if field == "api_key" && value.trim().is_empty() {
                    errors.push(format!("{}: api_key is empty", ctx()));
                }
                if value.contains(TOPIC_RESERVED) || value.contains(char::is_whitespace) {
                    errors.push(format!(
                        "{}: {field} {value:?} must not contain whitespace, '/', '+' or '#'",
                        ctx()
                    ));
                }
            }

            // ── GPIO pin whitelist ──────────────────────────────
            let pin = d.effective_pin();
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "{}: pin {pin} is not a valid BCM GPIO pin (allowed: 2-27)",
                    ctx()
                ));
            } else if !seen_pins.insert(pin) {
                errors.push(format!(
                    "{}: pin {pin} is already used by another device",
                    ctx()
                ));
            }

            // ── LED strip ───────────────────────────────────────
            match (d.kind, d.led_count) {
                (DeviceType::Fixture, Some(n)) if n <= 0 || n % 2 != 0 => {
                    errors.push(format!(
                        "{}: led_count must be a positive even number, got {n}",
                        ctx()
                    ));
                }
                (DeviceType::Fixture, _) | (_, None) => {}
                (kind, Some(_)) => {
                    errors.push(format!("{}: led_count is only valid for fixtures, not {kind}", ctx()));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML node config file.
pub fn load(path: &str) -> Result<NodeConfig> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: NodeConfig =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(kind: DeviceType, device_id: &str) -> DeviceEntry {
        DeviceEntry {
            kind,
            api_key: "4jggokgpepnvsb2uv4s40d59ov".into(),
            device_id: device_id.into(),
            pin: None,
            led_count: None,
        }
    }

    fn valid_config() -> NodeConfig {
        NodeConfig {
            devices: vec![
                entry(DeviceType::Climate, "dht22:001"),
                entry(DeviceType::Pump, "pump:001"),
                entry(DeviceType::Fixture, "light_fixture:001"),
            ],
        }
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &NodeConfig, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_inventory() {
        let toml_str = r#"
[[devices]]
kind = "climate"
api_key = "dht22_key"
device_id = "dht22:002"

[[devices]]
kind = "fixture"
api_key = "light_fixture_key"
device_id = "light_fixture:003"
pin = 18
led_count = 60

[[devices]]
kind = "relay"
api_key = "light_fixture_key"
device_id = "light_fixture:004"
pin = 22
"#;
        let config: NodeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.devices.len(), 3);
        assert_eq!(config.devices[0].kind, DeviceType::Climate);
        assert_eq!(config.devices[1].led_count(), 60);
        assert_eq!(config.devices[2].effective_pin(), 22);
        config.validate().unwrap();
    }

    #[test]
    fn parse_empty_config() {
        let config: NodeConfig = toml::from_str("").unwrap();
        assert!(config.devices.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn parse_unknown_kind_fails() {
        let toml_str = r#"
[[devices]]
kind = "toaster"
api_key = "k"
device_id = "t1"
"#;
        assert!(toml::from_str::<NodeConfig>(toml_str).is_err());
    }

    // -- Defaults ---------------------------------------------------------

    #[test]
    fn default_pins_and_led_count() {
        let cfg = valid_config();
        assert_eq!(cfg.devices[0].effective_pin(), 4);
        assert_eq!(cfg.devices[1].effective_pin(), 17);
        assert_eq!(cfg.devices[2].effective_pin(), 18);
        assert_eq!(cfg.devices[2].led_count(), DEFAULT_LED_COUNT);
        assert_eq!(cfg.devices[2].gpio_pin().unwrap(), 18);
    }

    #[test]
    fn identity_uses_entry_key_and_id() {
        let id = valid_config().devices[1].identity();
        assert_eq!(id.cmd_topic(), "/4jggokgpepnvsb2uv4s40d59ov/pump:001/cmd");
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn empty_device_id_rejected() {
        let mut cfg = valid_config();
        cfg.devices[0].device_id = "  ".into();
        assert_validation_err(&cfg, "device_id is empty");
    }

    #[test]
    fn duplicate_device_id_rejected() {
        let mut cfg = valid_config();
        cfg.devices[1].device_id = "dht22:001".into();
        cfg.devices[1].pin = Some(5);
        assert_validation_err(&cfg, "duplicate device_id");
    }

    #[test]
    fn empty_api_key_rejected() {
        let mut cfg = valid_config();
        cfg.devices[2].api_key = String::new();
        assert_validation_err(&cfg, "api_key is empty");
    }

    #[test]
    fn topic_wildcards_in_identity_rejected() {
        let mut cfg = valid_config();
        cfg.devices[0].device_id = "dht/22".into();
        assert_validation_err(&cfg, "device_id \"dht/22\" must not contain");

        let mut cfg = valid_config();
        cfg.devices[1].api_key = "key#".into();
        assert_validation_err(&cfg, "api_key \"key#\" must not contain");
    }

    #[test]
    fn pin_outside_whitelist_rejected() {
        for bad in [0, 1, 28, -3] {
            let mut cfg = valid_config();
            cfg.devices[1].pin = Some(bad);
            assert_validation_err(&cfg, "is not a valid BCM GPIO pin");
        }
    }

    #[test]
    fn default_pin_collision_rejected() {
        let mut cfg = valid_config();
        cfg.devices.push(entry(DeviceType::Relay, "cold:001"));
        assert_validation_err(&cfg, "pin 17 is already used by another device");

        cfg.devices[3].pin = Some(22);
        cfg.validate().unwrap();
    }

    #[test]
    fn led_count_must_be_positive_and_even() {
        for bad in [0, -2, 55] {
            let mut cfg = valid_config();
            cfg.devices[2].led_count = Some(bad);
            assert_validation_err(&cfg, "led_count must be a positive even number");
        }
    }

    #[test]
    fn led_count_only_for_fixtures() {
        let mut cfg = valid_config();
        cfg.devices[1].led_count = Some(10);
        assert_validation_err(&cfg, "led_count is only valid for fixtures, not pump");
    }

    #[test]
    fn multiple_errors_reported_together() {
        let mut cfg = valid_config();
        cfg.devices[0].device_id = String::new();
        cfg.devices[1].pin = Some(99);
        cfg.devices[2].led_count = Some(3);
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "got: {msg}");
    }

    #[test]
    fn load_reads_and_validates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(
            &path,
            "[[devices]]\nkind = \"pump\"\napi_key = \"k\"\ndevice_id = \"p1\"\npin = 99\n",
        )
        .unwrap();
        let err = load(path.to_str().unwrap()).unwrap_err();
        assert!(format!("{err:#}").contains("invalid config"));
    }
}
