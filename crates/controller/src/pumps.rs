//! Dosing pump control via GPIO. The `gpio` feature gates the real rppal
//! driver; without it, a mock implementation tracks line levels and logs.
//!
//! Each pump sits behind one H-bridge channel: an enable line and an input
//! line.  A pump runs while both are high.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

use crate::config::PumpEntry;

/// Flow rate assumed for pumps that have never been calibrated.
pub const DEFAULT_ML_PER_SECOND: f64 = 1.0;

#[derive(Debug, Error)]
pub enum PumpError {
    #[error("unknown pump '{0}'")]
    UnknownPump(String),
    #[error("pump '{pump}': invalid duration {seconds}s")]
    InvalidDuration { pump: String, seconds: f64 },
    #[error("pump '{pump}': invalid volume {ml}ml")]
    InvalidVolume { pump: String, ml: f64 },
    #[error("pump '{pump}': {seconds}s exceeds the {limit}s single-run watchdog")]
    ExceedsWatchdog {
        pump: String,
        seconds: f64,
        limit: f64,
    },
    #[error("gpio: {0}")]
    Line(String),
}

/// Something that can run a named pump for a bounded time.
pub trait Actuator {
    /// Run `pump` for `seconds`, blocking until it is off again.
    fn run(&mut self, pump: &str, seconds: f64) -> Result<(), PumpError>;

    /// Run time needed for `pump` to deliver `ml`.
    fn volume_to_seconds(&self, pump: &str, ml: f64) -> Result<f64, PumpError>;

    /// Set the flow rate from a timed test run and return the new ml/s.
    fn calibrate(&mut self, pump: &str, run_seconds: f64, measured_ml: f64)
        -> Result<f64, PumpError>;

    fn all_off(&mut self);

    /// Deliver `ml` from `pump`; returns the seconds it ran.
    fn dose_volume(&mut self, pump: &str, ml: f64) -> Result<f64, PumpError> {
        let seconds = self.volume_to_seconds(pump, ml)?;
        self.run(pump, seconds)?;
        Ok(seconds)
    }
}

// ---------------------------------------------------------------------------
// Real GPIO lines (production: requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub(crate) struct PumpLines {
    pins: HashMap<u8, OutputPin>,
}

#[cfg(feature = "gpio")]
impl PumpLines {
    pub(crate) fn new(pins: &[u8]) -> Result<Self, PumpError> {
        let gpio = Gpio::new().map_err(|e| PumpError::Line(e.to_string()))?;
        let mut out = HashMap::new();

        for &pin_num in pins {
            // Fail-safe: every line starts low, so every pump starts off.
            let pin = gpio
                .get(pin_num)
                .map_err(|e| PumpError::Line(format!("gpio {pin_num}: {e}")))?
                .into_output_low();
            out.insert(pin_num, pin);
        }

        Ok(Self { pins: out })
    }

    pub(crate) fn set(&mut self, pin: u8, high: bool) -> Result<(), PumpError> {
        let out = self
            .pins
            .get_mut(&pin)
            .ok_or_else(|| PumpError::Line(format!("gpio {pin} not claimed")))?;
        if high {
            out.set_high();
        } else {
            out.set_low();
        }
        Ok(())
    }

    pub(crate) fn all_low(&mut self) {
        for pin in self.pins.values_mut() {
            pin.set_low();
        }
    }
}

// ---------------------------------------------------------------------------
// Mock lines (development, no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub(crate) struct PumpLines {
    pub(crate) levels: HashMap<u8, bool>, // BCM pin -> high/low
}

#[cfg(not(feature = "gpio"))]
impl PumpLines {
    pub(crate) fn new(pins: &[u8]) -> Result<Self, PumpError> {
        let levels = pins.iter().map(|&p| (p, false)).collect();
        tracing::info!(lines = pins.len(), "[mock-gpio] pump lines initialised (no hardware)");
        Ok(Self { levels })
    }

    pub(crate) fn set(&mut self, pin: u8, high: bool) -> Result<(), PumpError> {
        let level = self
            .levels
            .get_mut(&pin)
            .ok_or_else(|| PumpError::Line(format!("gpio {pin} not claimed")))?;
        *level = high;
        tracing::debug!(pin, high, "[mock-gpio] line set");
        Ok(())
    }

    pub(crate) fn all_low(&mut self) {
        for level in self.levels.values_mut() {
            *level = false;
        }
    }
}

// ---------------------------------------------------------------------------
// Pump board
// ---------------------------------------------------------------------------

struct Pump {
    enable_pin: u8,
    input_pin: u8,
    /// Upper bound on any single run.
    watchdog_sec: f64,
    ml_per_second: f64,
}

type PulseHook = Box<dyn FnMut(&str, f64) + Send>;

pub struct PumpBoard {
    lines: PumpLines,
    pumps: HashMap<String, Pump>,
    sleep: fn(Duration),
    on_pulse: Option<PulseHook>,
}

impl PumpBoard {
    /// Claim every pump's lines and force them low.  Pins are assumed to be
    /// validated already.
    pub fn new(entries: &[PumpEntry]) -> Result<Self, PumpError> {
        let mut pumps = HashMap::new();
        let mut pins = Vec::new();

        for e in entries {
            let enable_pin = to_pin(e.enable_pin)?;
            let input_pin = to_pin(e.input_pin)?;
            pins.extend([enable_pin, input_pin]);
            pumps.insert(
                e.name.clone(),
                Pump {
                    enable_pin,
                    input_pin,
                    watchdog_sec: e.daily_limit_sec,
                    ml_per_second: e.ml_per_second.unwrap_or(DEFAULT_ML_PER_SECOND),
                },
            );
        }

        let mut lines = PumpLines::new(&pins)?;
        lines.all_low();

        Ok(Self {
            lines,
            pumps,
            sleep: std::thread::sleep,
            on_pulse: None,
        })
    }

    /// Replace the blocking sleep that times each pulse.
    pub fn with_sleep(mut self, sleep: fn(Duration)) -> Self {
        self.sleep = sleep;
        self
    }

    /// Called with `(pump, seconds)` after every completed pulse.
    pub fn on_pulse(mut self, hook: impl FnMut(&str, f64) + Send + 'static) -> Self {
        self.on_pulse = Some(Box::new(hook));
        self
    }

    pub fn calibration(&self, pump: &str) -> Option<f64> {
        self.pumps.get(pump).map(|p| p.ml_per_second)
    }

    fn pump(&self, name: &str) -> Result<&Pump, PumpError> {
        self.pumps
            .get(name)
            .ok_or_else(|| PumpError::UnknownPump(name.to_string()))
    }

    fn switch(&mut self, enable_pin: u8, input_pin: u8, on: bool) -> Result<(), PumpError> {
        if on {
            self.lines.set(input_pin, true)?;
            self.lines.set(enable_pin, true)
        } else {
            self.lines.set(enable_pin, false)?;
            self.lines.set(input_pin, false)
        }
    }
}

impl Actuator for PumpBoard {
    fn run(&mut self, pump: &str, seconds: f64) -> Result<(), PumpError> {
        let p = self.pump(pump)?;
        if !seconds.is_finite() || seconds <= 0.0 {
            return Err(PumpError::InvalidDuration {
                pump: pump.to_string(),
                seconds,
            });
        }
        if seconds > p.watchdog_sec {
            return Err(PumpError::ExceedsWatchdog {
                pump: pump.to_string(),
                seconds,
                limit: p.watchdog_sec,
            });
        }
        let (enable_pin, input_pin) = (p.enable_pin, p.input_pin);

        if let Err(e) = self.switch(enable_pin, input_pin, true) {
            self.lines.all_low();
            return Err(e);
        }
        tracing::info!(pump, seconds, "pump on");

        (self.sleep)(Duration::from_secs_f64(seconds));

        if let Err(e) = self.switch(enable_pin, input_pin, false) {
            self.lines.all_low();
            return Err(e);
        }
        tracing::info!(pump, "pump off");

        if let Some(hook) = self.on_pulse.as_mut() {
            hook(pump, seconds);
        }
        Ok(())
    }

    fn volume_to_seconds(&self, pump: &str, ml: f64) -> Result<f64, PumpError> {
        let p = self.pump(pump)?;
        if !ml.is_finite() || ml <= 0.0 {
            return Err(PumpError::InvalidVolume {
                pump: pump.to_string(),
                ml,
            });
        }
        Ok(ml / p.ml_per_second)
    }

    fn calibrate(
        &mut self,
        pump: &str,
        run_seconds: f64,
        measured_ml: f64,
    ) -> Result<f64, PumpError> {
        if !run_seconds.is_finite() || run_seconds <= 0.0 {
            return Err(PumpError::InvalidDuration {
                pump: pump.to_string(),
                seconds: run_seconds,
            });
        }
        if !measured_ml.is_finite() || measured_ml <= 0.0 {
            return Err(PumpError::InvalidVolume {
                pump: pump.to_string(),
                ml: measured_ml,
            });
        }
        let p = self
            .pumps
            .get_mut(pump)
            .ok_or_else(|| PumpError::UnknownPump(pump.to_string()))?;

        p.ml_per_second = measured_ml / run_seconds;
        tracing::info!(pump, ml_per_second = p.ml_per_second, "pump calibrated");
        Ok(p.ml_per_second)
    }

    fn all_off(&mut self) {
        self.lines.all_low();
        tracing::info!("all pumps off");
    }
}

impl Drop for PumpBoard {
    fn drop(&mut self) {
        self.lines.all_low();
    }
}

fn to_pin(raw: i64) -> Result<u8, PumpError> {
    u8::try_from(raw).map_err(|_| PumpError::Line(format!("gpio {raw} out of range")))
}

// ===========================================================================
// Tests
// ===========================================================================
