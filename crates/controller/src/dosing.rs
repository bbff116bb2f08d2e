//! Dosing decisions and the per-pump daily budget.
//!
//! Deciding is pure: a reading, the thresholds and the budgets go in, a
//! [`Decision`] comes out and nothing is mutated.  [`apply`] is the only
//! path that charges a budget, and it charges only after the pump has
//! actually run.
//!
//! ```text
//!   reading ──▶ decide_ph / decide_ec ──▶ Decision
//!                                           │
//!        InRange / LimitReached ◀───────────┤ (no actuation, budget untouched)
//!                                           ▼
//!                                 Dose ──▶ apply ──▶ run pump ──▶ charge budget
//! ```

use std::collections::HashMap;
use std::fmt;

use time::Date;

use crate::config::Thresholds;
use crate::pumps::{Actuator, PumpError};

pub const PH_UP: &str = "pH_up";
pub const PH_DOWN: &str = "pH_down";
pub const NUTRIENT: &str = "nutrientA";

/// Run time of one corrective pH dose.
pub const PH_UNIT_SECONDS: f64 = 1.0;
/// Run time of one corrective nutrient dose.
pub const EC_UNIT_SECONDS: f64 = 2.0;

// ---------------------------------------------------------------------------
// Budgets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Budget {
    pub seconds_used_today: f64,
    pub daily_limit_seconds: f64,
}

impl Budget {
    pub fn new(daily_limit_seconds: f64) -> Self {
        Self {
            seconds_used_today: 0.0,
            daily_limit_seconds,
        }
    }

    pub fn remaining(&self) -> f64 {
        (self.daily_limit_seconds - self.seconds_used_today).max(0.0)
    }

    pub fn allows(&self, seconds: f64) -> bool {
        self.seconds_used_today + seconds <= self.daily_limit_seconds
    }
}

/// Daily run-time budgets for every pump, reset together at the date
/// boundary.
#[derive(Debug, Clone)]
pub struct Budgets {
    pumps: HashMap<String, Budget>,
    last_reset_date: Date,
}

impl Budgets {
    pub fn new<I, S>(limits: I, today: Date) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        Self {
            pumps: limits
                .into_iter()
                .map(|(name, limit)| (name.into(), Budget::new(limit)))
                .collect(),
            last_reset_date: today,
        }
    }

    pub fn get(&self, pump: &str) -> Option<&Budget> {
        self.pumps.get(pump)
    }

    pub fn last_reset_date(&self) -> Date {
        self.last_reset_date
    }

    /// Zero every counter when `today` is not the last reset date.  Returns
    /// whether a reset happened.
    pub fn roll_over(&mut self, today: Date) -> bool {
        if today == self.last_reset_date {
            return false;
        }
        for budget in self.pumps.values_mut() {
            budget.seconds_used_today = 0.0;
        }
        self.last_reset_date = today;
        true
    }

    fn charge(&mut self, pump: &str, seconds: f64) {
        if let Some(b) = self.pumps.get_mut(pump) {
            b.seconds_used_today += seconds;
        }
    }
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Dose {
        pump: String,
        seconds: f64,
    },
    /// A dose was warranted but the pump's budget cannot cover it.
    LimitReached {
        pump: String,
        seconds: f64,
        remaining: f64,
    },
    InRange,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dose { pump, seconds } => write!(f, "dose {pump} {seconds:.1}s"),
            Self::LimitReached {
                pump,
                seconds,
                remaining,
            } => write!(
                f,
                "daily limit reached for {pump} ({seconds:.1}s requested, {remaining:.1}s left)"
            ),
            Self::InRange => write!(f, "in range"),
        }
    }
}

/// Budget-check a dose of `seconds` on `pump`.  A pump without a budget has
/// nothing left to spend.
pub fn request(pump: &str, seconds: f64, budgets: &Budgets) -> Decision {
    match budgets.get(pump) {
        Some(b) if b.allows(seconds) => Decision::Dose {
            pump: pump.to_string(),
            seconds,
        },
        other => Decision::LimitReached {
            pump: pump.to_string(),
            seconds,
            remaining: other.map(Budget::remaining).unwrap_or(0.0),
        },
    }
}

/// Values exactly on a threshold are in range.
pub fn decide_ph(ph: f64, t: &Thresholds, budgets: &Budgets) -> Decision {
    if ph < t.ph_min {
        request(PH_UP, PH_UNIT_SECONDS, budgets)
    } else if ph > t.ph_max {
        request(PH_DOWN, PH_UNIT_SECONDS, budgets)
    } else {
        Decision::InRange
    }
}

/// Single-sided: only a low EC is corrected.
pub fn decide_ec(ec: f64, t: &Thresholds, budgets: &Budgets) -> Decision {
    if ec < t.ec_min {
        request(NUTRIENT, EC_UNIT_SECONDS, budgets)
    } else {
        Decision::InRange
    }
}

/// Carry out `decision`.  A dose charges its budget only once the pump has
/// run; a failed run leaves the budget untouched.
pub fn apply<A: Actuator>(
    decision: Decision,
    budgets: &mut Budgets,
    pumps: &mut A,
) -> Result<Decision, PumpError> {
    if let Decision::Dose { pump, seconds } = &decision {
        pumps.run(pump, *seconds)?;
        budgets.charge(pump, *seconds);
    }
    Ok(decision)
}

/// Like [`apply`], but the dose is delivered as `ml` so the pump's own
/// calibration sets the run time.  The budget is charged with the seconds
/// actually run.
pub fn apply_volume<A: Actuator>(
    decision: Decision,
    ml: f64,
    budgets: &mut Budgets,
    pumps: &mut A,
) -> Result<Decision, PumpError> {
    match decision {
        Decision::Dose { pump, .. } => {
            let seconds = pumps.dose_volume(&pump, ml)?;
            budgets.charge(&pump, seconds);
            Ok(Decision::Dose { pump, seconds })
        }
        other => Ok(other),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
