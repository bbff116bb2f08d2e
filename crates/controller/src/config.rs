//! TOML config file loading and validation for thresholds, sensors, pumps,
//! schedules and the optional MQTT bridge.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use crate::dosing::{EC_UNIT_SECONDS, NUTRIENT, PH_DOWN, PH_UNIT_SECONDS, PH_UP};
use crate::scheduler::TaskKind;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_poll_interval_sec")]
    pub poll_interval_sec: u64,
    pub thresholds: Thresholds,
    #[serde(default)]
    pub sensors: SensorSettings,
    #[serde(default)]
    pub pumps: Vec<PumpEntry>,
    #[serde(default)]
    pub schedules: BTreeMap<String, TaskEntry>,
    #[serde(default)]
    pub triggers: BTreeMap<String, TaskEntry>,
    #[serde(default)]
    pub mqtt: Option<MqttEntry>,
}

/// Target band for the reservoir chemistry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub ph_min: f64,
    pub ph_max: f64,
    pub ec_min: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    pub bus: u8,
    pub ph_address: u16,
    pub ec_address: u16,
    pub poll_attempts: u32,
    pub poll_delay_ms: u64,
    pub long_timeout_ms: u64,
    pub short_timeout_ms: u64,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            bus: 1,
            ph_address: 0x63,
            ec_address: 0x64,
            poll_attempts: 10,
            poll_delay_ms: 300,
            long_timeout_ms: 1500,
            short_timeout_ms: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PumpEntry {
    pub name: String,
    pub enable_pin: i64,
    pub input_pin: i64,
    pub daily_limit_sec: f64,
    #[serde(default)]
    pub ml_per_second: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskEntry {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub interval_min: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttEntry {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_poll_interval_sec() -> u64 {
    10
}

fn default_enabled() -> bool {
    true
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "hydro-controller".to_string()
}

fn default_prefix() -> String {
    "hydro".to_string()
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_sec)
    }
}

impl TaskEntry {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_min.saturating_mul(60))
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist / bus addresses
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

/// Usable 7-bit I2C addresses (0x00-0x02 and 0x78-0x7F are reserved).
const I2C_ADDRESSES: std::ops::RangeInclusive<u16> = 0x03..=0x77;

/// Longest wake interval for the control loop (one hour).
const MAX_POLL_INTERVAL_SEC: u64 = 60 * 60;

/// Longest task interval (one year).
const MAX_INTERVAL_MIN: u64 = 60 * 24 * 365;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Thresholds {
    /// Every way these thresholds are unusable.  Empty when valid.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        for (field, value) in [("ph_min", self.ph_min), ("ph_max", self.ph_max)] {
            if !(0.0..=14.0).contains(&value) {
                problems.push(format!("{field} {value} out of range [0, 14]"));
            }
        }
        if self.ph_min >= self.ph_max {
            problems.push(format!(
                "ph_min ({}) must be less than ph_max ({})",
                self.ph_min, self.ph_max
            ));
        }
        if !self.ec_min.is_finite() || self.ec_min < 0.0 {
            problems.push(format!("ec_min must be non-negative, got {}", self.ec_min));
        }

        problems
    }
}

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.poll_interval_sec == 0 {
            errors.push("poll_interval_sec must be positive".to_string());
        } else if self.poll_interval_sec > MAX_POLL_INTERVAL_SEC {
            errors.push(format!(
                "poll_interval_sec ({}) exceeds maximum of {MAX_POLL_INTERVAL_SEC}",
                self.poll_interval_sec
            ));
        }
        for p in self.thresholds.problems() {
            errors.push(format!("thresholds: {p}"));
        }
        self.validate_sensors(&mut errors);
        self.validate_pumps(&mut errors);
        self.validate_tasks(&mut errors);
        self.validate_mqtt(&mut errors);

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

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        let s = &self.sensors;

        for (field, addr) in [("ph_address", s.ph_address), ("ec_address", s.ec_address)] {
            if !I2C_ADDRESSES.contains(&addr) {
                errors.push(format!(
                    "sensors: {field} 0x{addr:02x} is not a usable 7-bit I2C address (0x03-0x77)"
                ));
            }
        }
        if s.ph_address == s.ec_address {
            errors.push(format!(
                "sensors: ph_address and ec_address are both 0x{:02x}",
                s.ph_address
            ));
        }
        if s.poll_attempts == 0 {
            errors.push("sensors: poll_attempts must be positive".to_string());
        }
    }

    fn validate_pumps(&self, errors: &mut Vec<String>) {
        let mut seen_names: HashSet<&str> = HashSet::new();
        let mut seen_pins: HashSet<i64> = HashSet::new();

        for (i, p) in self.pumps.iter().enumerate() {
            let ctx = || {
                if p.name.is_empty() {
                    format!("pumps[{i}]")
                } else {
                    format!("pump '{}'", p.name)
                }
            };

            // ── Identity ────────────────────────────────────────
            if p.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            } else if !seen_names.insert(&p.name) {
                errors.push(format!("{}: duplicate pump name", ctx()));
            }

            // ── Budget and calibration ──────────────────────────
            if !p.daily_limit_sec.is_finite() || p.daily_limit_sec <= 0.0 {
                errors.push(format!(
                    "{}: daily_limit_sec must be positive, got {}",
                    ctx(),
                    p.daily_limit_sec
                ));
            } else if let Some(unit) = unit_dose_for(&p.name) {
                if unit > p.daily_limit_sec {
                    errors.push(format!(
                        "{}: unit dose ({unit}s) exceeds daily_limit_sec ({})",
                        ctx(),
                        p.daily_limit_sec
                    ));
                }
            }
            if let Some(rate) = p.ml_per_second {
                if !rate.is_finite() || rate <= 0.0 {
                    errors.push(format!(
                        "{}: ml_per_second must be positive, got {rate}",
                        ctx()
                    ));
                }
            }

            // ── GPIO pin whitelist ──────────────────────────────
            for (field, pin) in [("enable_pin", p.enable_pin), ("input_pin", p.input_pin)] {
                if !VALID_GPIO_PINS.contains(&pin) {
                    errors.push(format!(
                        "{}: {field} {pin} is not a valid BCM GPIO pin (allowed: 2-27)",
                        ctx()
                    ));
                } else if !seen_pins.insert(pin) {
                    errors.push(format!("{}: {field} {pin} is already in use", ctx()));
                }
            }
        }
    }

    fn validate_tasks(&self, errors: &mut Vec<String>) {
        let pump_names: HashSet<&str> = self.pumps.iter().map(|p| p.name.as_str()).collect();

        for (section, tasks, want_trigger) in [
            ("schedule", &self.schedules, false),
            ("trigger", &self.triggers, true),
        ] {
            for (name, task) in tasks {
                let kind = match TaskKind::from_name(name) {
                    Some(k) if k.is_trigger() == want_trigger => k,
                    _ => {
                        errors.push(format!("{section} '{name}': unknown {section}"));
                        continue;
                    }
                };

                if task.interval_min == 0 {
                    errors.push(format!("{section} '{name}': interval_min must be positive"));
                } else if task.interval_min > MAX_INTERVAL_MIN {
                    errors.push(format!(
                        "{section} '{name}': interval_min ({}) exceeds maximum of {MAX_INTERVAL_MIN}",
                        task.interval_min
                    ));
                }

                if task.enabled {
                    for pump in kind.required_pumps() {
                        if !pump_names.contains(pump) {
                            errors.push(format!(
                                "{section} '{name}': requires pump '{pump}' which is not configured"
                            ));
                        }
                    }
                }
            }
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let Some(m) = &self.mqtt else {
            return;
        };

        if m.host.trim().is_empty() {
            errors.push("mqtt: host is empty".to_string());
        }
        if m.client_id.trim().is_empty() {
            errors.push("mqtt: client_id is empty".to_string());
        }
        if m.prefix.trim().is_empty() {
            errors.push("mqtt: prefix is empty".to_string());
        } else if m.prefix.contains(|c: char| c == '+' || c == '#') {
            errors.push(format!("mqtt: prefix '{}' contains a wildcard", m.prefix));
        } else if m.prefix.ends_with('/') {
            errors.push(format!("mqtt: prefix '{}' ends with '/'", m.prefix));
        }
    }
}

fn unit_dose_for(pump: &str) -> Option<f64> {
    if pump == PH_UP || pump == PH_DOWN {
        Some(PH_UNIT_SECONDS)
    } else if pump == NUTRIENT {
        Some(EC_UNIT_SECONDS)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;

    tracing::info!(
        pumps = config.pumps.len(),
        schedules = config.schedules.len(),
        triggers = config.triggers.len(),
        mqtt = config.mqtt.is_some(),
        "config loaded"
    );

    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
