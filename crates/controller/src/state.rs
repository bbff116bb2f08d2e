//! Everything the control loop decides with: thresholds and pump budgets.
//! Owned by the scheduler thread and only ever borrowed from there.

use time::Date;

use crate::config::{Config, Thresholds};
use crate::dosing::{self, Budgets, Decision};
use crate::pumps::{Actuator, PumpError};

pub struct ControllerState {
    pub thresholds: Thresholds,
    pub budgets: Budgets,
}

impl ControllerState {
    /// Fresh state with zero usage on every configured pump.
    pub fn new(config: &Config, today: Date) -> Self {
        Self {
            thresholds: config.thresholds,
            budgets: Budgets::new(
                config
                    .pumps
                    .iter()
                    .map(|p| (p.name.clone(), p.daily_limit_sec)),
                today,
            ),
        }
    }

    /// Replace the thresholds if they are usable; otherwise keep the current
    /// ones and return what is wrong.
    pub fn set_thresholds(&mut self, thresholds: Thresholds) -> Result<(), Vec<String>> {
        let problems = thresholds.problems();
        if !problems.is_empty() {
            return Err(problems);
        }
        self.thresholds = thresholds;
        Ok(())
    }

    pub fn roll_over(&mut self, today: Date) -> bool {
        self.budgets.roll_over(today)
    }

    pub fn correct_ph<A: Actuator>(&mut self, ph: f64, pumps: &mut A) -> Result<Decision, PumpError> {
        let decision = dosing::decide_ph(ph, &self.thresholds, &self.budgets);
        dosing::apply(decision, &mut self.budgets, pumps)
    }

    pub fn correct_ec<A: Actuator>(&mut self, ec: f64, pumps: &mut A) -> Result<Decision, PumpError> {
        let decision = dosing::decide_ec(ec, &self.thresholds, &self.budgets);
        dosing::apply(decision, &mut self.budgets, pumps)
    }

    /// An out-of-band dose, charged against the same budget as automatic ones.
    pub fn manual_dose<A: Actuator>(
        &mut self,
        pump: &str,
        seconds: f64,
        pumps: &mut A,
    ) -> Result<Decision, PumpError> {
        self.check_known(pump)?;
        if !seconds.is_finite() || seconds <= 0.0 {
            return Err(PumpError::InvalidDuration {
                pump: pump.to_string(),
                seconds,
            });
        }
        let decision = dosing::request(pump, seconds, &self.budgets);
        dosing::apply(decision, &mut self.budgets, pumps)
    }

    /// An out-of-band dose by volume.  The budget check uses the run time the
    /// pump's calibration gives for `ml`.
    pub fn manual_dose_volume<A: Actuator>(
        &mut self,
        pump: &str,
        ml: f64,
        pumps: &mut A,
    ) -> Result<Decision, PumpError> {
        self.check_known(pump)?;
        let seconds = pumps.volume_to_seconds(pump, ml)?;
        let decision = dosing::request(pump, seconds, &self.budgets);
        dosing::apply_volume(decision, ml, &mut self.budgets, pumps)
    }

    /// Every configured pump has a budget, so a missing one means the name
    /// is not a pump.
    fn check_known(&self, pump: &str) -> Result<(), PumpError> {
        match self.budgets.get(pump) {
            Some(_) => Ok(()),
            None => Err(PumpError::UnknownPump(pump.to_string())),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
