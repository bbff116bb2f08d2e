//! Simulated EZO circuits for development without hardware.
//!
//! A [`Reservoir`] models the nutrient solution:
//! - pH creeps upward and EC falls as plants take up nutrients
//! - per-sample probe noise
//! - closed-loop response to dosing (`pH_up`, `pH_down`, `nutrient*`)
//!
//! [`SimulatedEzo`] speaks the EZO I2C protocol on top of it, including the
//! "still processing" status a real circuit reports while measuring.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::LinkError;
use crate::link::{ModuleKind, Transport, STATUS_NO_DATA, STATUS_PENDING, STATUS_SUCCESS};

/// Status byte a real circuit returns for an unknown command.
const STATUS_SYNTAX_ERROR: u8 = 2;

/// Reads answered with 254 after a measurement command.
const DEFAULT_BUSY_READS: u32 = 2;

const FIRMWARE_VERSION: &str = "2.16";

// Dose response per second of pump run time.
const PH_PER_SECOND: f64 = 0.1;
const EC_PER_SECOND: f64 = 0.2;

// ---------------------------------------------------------------------------
// Gaussian approximation
// ---------------------------------------------------------------------------

/// Irwin-Hall: sum of 12 uniform [0,1) values minus 6 approximates N(0,1).
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Starts in range, pH rises and EC falls steadily.
    Drifting,
    /// Stays in range with light noise.
    Stable,
    /// Starts acidic and underfed (pH 5.4, EC 0.8).
    Depleted,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "depleted" => Self::Depleted,
            _ => Self::Drifting,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drifting => write!(f, "drifting"),
            Self::Stable => write!(f, "stable"),
            Self::Depleted => write!(f, "depleted"),
        }
    }
}

// ---------------------------------------------------------------------------
// Reservoir
// ---------------------------------------------------------------------------

struct ReservoirState {
    ph: f64,
    ec: f64,
    ph_drift: f64,
    ec_drift: f64,
    ph_noise: f64,
    ec_noise: f64,
}

/// Shared handle to one simulated reservoir.  Clones see the same water.
#[derive(Clone)]
pub struct Reservoir {
    inner: Arc<Mutex<ReservoirState>>,
}

impl Reservoir {
    pub fn new(scenario: Scenario) -> Self {
        let (ph, ec, ph_drift, ec_drift, ph_noise, ec_noise) = match scenario {
            Scenario::Drifting => (6.0, 1.3, 0.01, -0.005, 0.02, 0.01),
            Scenario::Stable => (6.0, 1.3, 0.0, 0.0, 0.01, 0.005),
            Scenario::Depleted => (5.4, 0.8, 0.0, -0.002, 0.02, 0.01),
        };
        Self::from_state(ReservoirState {
            ph,
            ec,
            ph_drift,
            ec_drift,
            ph_noise,
            ec_noise,
        })
    }

    /// Constant chemistry with no drift or noise.  Dosing still applies.
    pub fn fixed(ph: f64, ec: f64) -> Self {
        Self::from_state(ReservoirState {
            ph,
            ec,
            ph_drift: 0.0,
            ec_drift: 0.0,
            ph_noise: 0.0,
            ec_noise: 0.0,
        })
    }

    fn from_state(state: ReservoirState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> MutexGuard<'_, ReservoirState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn ph(&self) -> f64 {
        self.state().ph
    }

    pub fn ec(&self) -> f64 {
        self.state().ec
    }

    /// Apply the effect of running `pump` for `seconds`.  Unknown pumps
    /// leave the water unchanged.
    pub fn apply_dose(&self, pump: &str, seconds: f64) {
        let mut s = self.state();
        let name = pump.to_ascii_lowercase();
        if name == "ph_up" {
            s.ph += PH_PER_SECOND * seconds;
        } else if name == "ph_down" {
            s.ph -= PH_PER_SECOND * seconds;
        } else if name.starts_with("nutrient") {
            s.ec += EC_PER_SECOND * seconds;
        }
        s.ph = s.ph.clamp(0.0, 14.0);
        s.ec = s.ec.max(0.0);
    }

    /// Advance one measurement step and return the probe's pH.
    fn sample_ph(&self) -> f64 {
        let mut s = self.state();
        s.ph = (s.ph + s.ph_drift).clamp(0.0, 14.0);
        (s.ph + s.ph_noise * approx_std_normal()).clamp(0.0, 14.0)
    }

    /// Advance one measurement step and return the probe's EC.
    fn sample_ec(&self) -> f64 {
        let mut s = self.state();
        s.ec = (s.ec + s.ec_drift).max(0.0);
        (s.ec + s.ec_noise * approx_std_normal()).max(0.0)
    }
}

// ---------------------------------------------------------------------------
// Simulated circuit
// ---------------------------------------------------------------------------

struct Pending {
    busy_left: u32,
    status: u8,
    payload: String,
}

/// An EZO circuit answering from a [`Reservoir`].
pub struct SimulatedEzo {
    kind: ModuleKind,
    reservoir: Reservoir,
    busy_reads: u32,
    pending: Option<Pending>,
    asleep: bool,
}

impl SimulatedEzo {
    pub fn new(kind: ModuleKind, reservoir: Reservoir) -> Self {
        Self {
            kind,
            reservoir,
            busy_reads: DEFAULT_BUSY_READS,
            pending: None,
            asleep: false,
        }
    }

    /// How many reads answer 254 after a measurement or calibration.
    pub fn with_busy_reads(mut self, busy_reads: u32) -> Self {
        self.busy_reads = busy_reads;
        self
    }

    fn measurement(&self) -> String {
        match self.kind {
            ModuleKind::Ph => format!("{:.2}", self.reservoir.sample_ph()),
            ModuleKind::Ec => {
                let ec = self.reservoir.sample_ec();
                format!(
                    "{:.2},{:.0},{:.2},{:.3}",
                    ec,
                    ec * 500.0,
                    ec * 0.55,
                    1.0 + ec * 0.0007
                )
            }
        }
    }

    fn answer(&mut self, status: u8, payload: String, busy_left: u32) {
        self.pending = Some(Pending {
            busy_left,
            status,
            payload,
        });
    }
}

impl Transport for SimulatedEzo {
    fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        // Any traffic wakes a sleeping circuit.
        self.asleep = false;

        let command = String::from_utf8_lossy(bytes)
            .trim_end_matches('\0')
            .trim()
            .to_ascii_uppercase();

        if command == "R" {
            let payload = self.measurement();
            self.answer(STATUS_SUCCESS, payload, self.busy_reads);
        } else if command.starts_with("CAL") {
            self.answer(STATUS_SUCCESS, String::new(), self.busy_reads);
        } else if command == "I" {
            let info = format!("?I,{},{FIRMWARE_VERSION}", self.kind);
            self.answer(STATUS_SUCCESS, info, 0);
        } else if command.starts_with("SLEEP") {
            self.asleep = true;
            self.pending = None;
        } else {
            self.answer(STATUS_SYNTAX_ERROR, String::new(), 0);
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        if self.asleep {
            return Err(LinkError::Read("device is asleep".into()));
        }
        buf.fill(0);
        if buf.is_empty() {
            return Ok(0);
        }

        let frame_status = match self.pending.take() {
            None => STATUS_NO_DATA,
            Some(mut p) if p.busy_left > 0 => {
                p.busy_left -= 1;
                self.pending = Some(p);
                STATUS_PENDING
            }
            Some(p) => {
                let bytes = p.payload.as_bytes();
                let n = bytes.len().min(buf.len() - 1);
                buf[1..=n].copy_from_slice(&bytes[..n]);
                p.status
            }
        };

        buf[0] = frame_status;
        Ok(buf.len())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
