//! Control loop: wakes on a fixed poll interval, runs every due task in a
//! fixed order, and serves manual commands in between.
//!
//! The loop owns the sensors, the pumps and the [`ControllerState`], so
//! every bus transaction and every pump pulse happens on this one thread,
//! one at a time.  Other threads only reach the hardware by sending a
//! [`Command`] down the queue.
//!
//! ## Per-task state machine
//!
//! ```text
//! Idle ──[enabled && now - last_run >= interval]──▶ Due ──▶ Running
//!  ▲                                                          │
//!  └───────────────[body done, last_run = now]────────────────┘
//! ```
//!
//! A task that has never run is due on the first wake-up.

use std::ops::ControlFlow;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use ezo::{SensorReader, SensorReading, Transport};
use time::{Date, OffsetDateTime, UtcOffset};
use tracing::{error, info, warn};

use crate::config::{Config, Thresholds};
use crate::dosing::{Decision, NUTRIENT, PH_DOWN, PH_UP};
use crate::events::EventLog;
use crate::pumps::{Actuator, PumpError};
use crate::state::ControllerState;

/// Wake interval when none is given.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Declaration order is evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskKind {
    /// Schedule: read both sensors and record the values.
    SensorCheck,
    /// Trigger: read pH and correct it.
    PhControl,
    /// Trigger: read EC and correct it.
    EcControl,
}

impl TaskKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sensor_check" => Some(Self::SensorCheck),
            "ph_control" => Some(Self::PhControl),
            "ec_control" => Some(Self::EcControl),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::SensorCheck => "sensor_check",
            Self::PhControl => "ph_control",
            Self::EcControl => "ec_control",
        }
    }

    pub fn is_trigger(self) -> bool {
        !matches!(self, Self::SensorCheck)
    }

    /// Pumps the task may dose with.
    pub fn required_pumps(self) -> &'static [&'static str] {
        match self {
            Self::SensorCheck => &[],
            Self::PhControl => &[PH_UP, PH_DOWN],
            Self::EcControl => &[NUTRIENT],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Due,
    Running,
}

#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub kind: TaskKind,
    pub enabled: bool,
    pub interval: Duration,
    pub last_run: Option<Instant>,
    phase: Phase,
}

impl ScheduledTask {
    pub fn new(kind: TaskKind, enabled: bool, interval: Duration) -> Self {
        Self {
            kind,
            enabled,
            interval,
            last_run: None,
            phase: Phase::Idle,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn is_due(&self, now: Instant) -> bool {
        self.enabled
            && self
                .last_run
                .map_or(true, |last| now.saturating_duration_since(last) >= self.interval)
    }
}

/// Every configured schedule and trigger, in evaluation order.
pub fn tasks_from_config(config: &Config) -> Vec<ScheduledTask> {
    let mut tasks: Vec<ScheduledTask> = config
        .schedules
        .iter()
        .chain(config.triggers.iter())
        .filter_map(|(name, entry)| {
            TaskKind::from_name(name)
                .map(|kind| ScheduledTask::new(kind, entry.enabled, entry.interval()))
        })
        .collect();
    tasks.sort_by_key(|t| t.kind);
    tasks
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Out-of-band requests served by the control thread between wake-ups.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Dose { pump: String, seconds: f64 },
    DoseVolume { pump: String, ml: f64 },
    ReadSensors,
    SetThresholds(Thresholds),
    Calibrate {
        pump: String,
        run_seconds: f64,
        measured_ml: f64,
    },
    Shutdown,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Readings taken during one wake-up.  `Some(None)` is a read that failed.
#[derive(Default)]
struct CycleReadings {
    ph: Option<Option<f64>>,
    ec: Option<Option<f64>>,
}

pub struct Scheduler<T, A> {
    tasks: Vec<ScheduledTask>,
    state: ControllerState,
    sensors: SensorReader<T>,
    pumps: A,
    events: EventLog,
    poll_interval: Duration,
    utc_offset: UtcOffset,
}

impl<T: Transport, A: Actuator> Scheduler<T, A> {
    pub fn new(
        mut tasks: Vec<ScheduledTask>,
        state: ControllerState,
        sensors: SensorReader<T>,
        pumps: A,
        events: EventLog,
    ) -> Self {
        tasks.sort_by_key(|t| t.kind);
        Self {
            tasks,
            state,
            sensors,
            pumps,
            events,
            poll_interval: DEFAULT_POLL_INTERVAL,
            utc_offset: UtcOffset::UTC,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Offset used to decide when the calendar day changes.
    pub fn with_utc_offset(mut self, utc_offset: UtcOffset) -> Self {
        self.utc_offset = utc_offset;
        self
    }

    pub fn tasks(&self) -> &[ScheduledTask] {
        &self.tasks
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn pumps(&self) -> &A {
        &self.pumps
    }

    fn today(&self) -> Date {
        OffsetDateTime::now_utc().to_offset(self.utc_offset).date()
    }

    /// Run the loop until `Shutdown` arrives or every sender is gone, then
    /// force every pump off.
    pub fn run(mut self, commands: Receiver<Command>) {
        info!(
            tasks = self.tasks.len(),
            poll_sec = self.poll_interval.as_secs_f64(),
            "scheduler started"
        );
        for t in &self.tasks {
            info!(
                task = t.kind.name(),
                enabled = t.enabled,
                interval_min = t.interval.as_secs() / 60,
                "task registered"
            );
        }
        self.events.record_system("controller started".to_string());

        let mut next_wake = Instant::now();
        loop {
            let now = Instant::now();
            if now >= next_wake {
                let today = self.today();
                self.wake(now, today);
                next_wake = now
                    .checked_add(self.poll_interval)
                    .unwrap_or(now + DEFAULT_POLL_INTERVAL);
            }

            match commands.recv_timeout(next_wake.saturating_duration_since(Instant::now())) {
                Ok(cmd) => {
                    let today = self.today();
                    if self.handle(cmd, today).is_break() {
                        info!("shutdown requested");
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("command queue closed, stopping");
                    break;
                }
            }
        }

        self.pumps.all_off();
        self.events.record_system("controller stopped".to_string());
        info!(events = self.events.len(), "scheduler stopped");
    }

    /// Evaluate every task once, running the due ones in order.  Returns how
    /// many ran.  Each sensor is read at most once per wake-up; later tasks
    /// reuse the earlier result, failed reads included.
    pub fn wake(&mut self, now: Instant, today: Date) -> usize {
        self.roll_over(today);

        let mut cycle = CycleReadings::default();
        let mut ran = 0;
        for i in 0..self.tasks.len() {
            if !self.tasks[i].is_due(now) {
                continue;
            }
            self.tasks[i].phase = Phase::Due;
            let kind = self.tasks[i].kind;

            self.tasks[i].phase = Phase::Running;
            self.run_task(kind, &mut cycle);

            let task = &mut self.tasks[i];
            task.last_run = Some(now);
            task.phase = Phase::Idle;
            ran += 1;
        }
        ran
    }

    /// Serve one command.  `Break` means stop the loop.
    pub fn handle(&mut self, cmd: Command, today: Date) -> ControlFlow<()> {
        self.roll_over(today);

        match cmd {
            Command::Dose { pump, seconds } => {
                info!(pump = %pump, seconds, "manual dose requested");
                let result = self.state.manual_dose(&pump, seconds, &mut self.pumps);
                self.report("manual", result);
            }
            Command::DoseVolume { pump, ml } => {
                info!(pump = %pump, ml, "manual volume dose requested");
                let result = self.state.manual_dose_volume(&pump, ml, &mut self.pumps);
                self.report("manual", result);
            }
            Command::ReadSensors => {
                self.read_ph();
                self.read_ec();
            }
            Command::SetThresholds(t) => match self.state.set_thresholds(t) {
                Ok(()) => {
                    info!(ph_min = t.ph_min, ph_max = t.ph_max, ec_min = t.ec_min, "thresholds updated");
                    self.events.record_system(format!(
                        "thresholds set: pH {:.2}-{:.2}, EC min {:.2}",
                        t.ph_min, t.ph_max, t.ec_min
                    ));
                }
                Err(problems) => {
                    let detail = format!("thresholds rejected: {}", problems.join("; "));
                    warn!("{detail}");
                    self.events.record_error(detail);
                }
            },
            Command::Calibrate {
                pump,
                run_seconds,
                measured_ml,
            } => match self.pumps.calibrate(&pump, run_seconds, measured_ml) {
                Ok(rate) => {
                    self.events
                        .record_system(format!("{pump} calibrated to {rate:.3} ml/s"));
                }
                Err(e) => {
                    warn!("calibration rejected: {e}");
                    self.events.record_error(format!("calibration rejected: {e}"));
                }
            },
            Command::Shutdown => return ControlFlow::Break(()),
        }

        ControlFlow::Continue(())
    }

    // ── Task bodies ─────────────────────────────────────────────────

    fn run_task(&mut self, kind: TaskKind, cycle: &mut CycleReadings) {
        match kind {
            TaskKind::SensorCheck => {
                self.cycle_ph(cycle);
                self.cycle_ec(cycle);
            }
            TaskKind::PhControl => {
                let Some(ph) = self.cycle_ph(cycle) else {
                    self.events
                        .record_error("ph_control: no pH reading, correction skipped".to_string());
                    return;
                };
                let result = self.state.correct_ph(ph, &mut self.pumps);
                self.report(&format!("pH {ph:.2}"), result);
            }
            TaskKind::EcControl => {
                let Some(ec) = self.cycle_ec(cycle) else {
                    self.events
                        .record_error("ec_control: no EC reading, correction skipped".to_string());
                    return;
                };
                let result = self.state.correct_ec(ec, &mut self.pumps);
                self.report(&format!("EC {ec:.2}"), result);
            }
        }
    }

    fn cycle_ph(&mut self, cycle: &mut CycleReadings) -> Option<f64> {
        if let Some(ph) = cycle.ph {
            return ph;
        }
        let ph = self.read_ph();
        cycle.ph = Some(ph);
        ph
    }

    fn cycle_ec(&mut self, cycle: &mut CycleReadings) -> Option<f64> {
        if let Some(ec) = cycle.ec {
            return ec;
        }
        let ec = self.read_ec();
        cycle.ec = Some(ec);
        ec
    }

    fn read_ph(&mut self) -> Option<f64> {
        let ph = self.sensors.read_ph();
        match ph {
            Some(v) => self.events.record_reading(SensorReading::Ph(v).to_string()),
            None => self.events.record_error("pH read failed".to_string()),
        }
        ph
    }

    /// Returns just the EC value; the full reading goes to the event log.
    fn read_ec(&mut self) -> Option<f64> {
        let reading = self.sensors.read_ec();
        match reading {
            Some(r) => self.events.record_reading(SensorReading::Ec(r).to_string()),
            None => self.events.record_error("EC read failed".to_string()),
        }
        reading.map(|r| r.ec)
    }

    fn report(&mut self, context: &str, result: Result<Decision, PumpError>) {
        match result {
            Ok(Decision::InRange) => {
                self.events.record_decision(format!("{context}: in range"));
            }
            Ok(d @ Decision::LimitReached { .. }) => {
                warn!(decision = %d, "{context}: dose rejected");
                self.events.record_decision(format!("{context}: {d}"));
            }
            Ok(d @ Decision::Dose { .. }) => {
                self.events.record_decision(format!("{context}: {d}"));
                if let Decision::Dose { pump, seconds } = &d {
                    let detail = match self.state.budgets.get(pump) {
                        Some(b) => format!(
                            "{pump} ran {seconds:.1}s ({:.1}/{:.1}s today)",
                            b.seconds_used_today, b.daily_limit_seconds
                        ),
                        None => format!("{pump} ran {seconds:.1}s"),
                    };
                    self.events.record_pump(detail);
                }
            }
            Err(e) => {
                error!("{context}: dose abandoned: {e}");
                self.events
                    .record_error(format!("{context}: dose abandoned: {e}"));
            }
        }
    }

    fn roll_over(&mut self, today: Date) {
        if self.state.roll_over(today) {
            info!(%today, "daily budgets reset");
            self.events
                .record_system(format!("daily budgets reset for {today}"));
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dosing::tests::{fresh_budgets, thresholds, FakeActuator};
    use crate::events::EventKind;
    use ezo::sim::{Reservoir, SimulatedEzo};
    use ezo::{DeviceHandle, DeviceLink, LinkError, ModuleKind};
    use time::macros::date;

    const DAY: Date = date!(2024 - 03 - 01);
    const MIN: Duration = Duration::from_secs(60);

    type TestScheduler = Scheduler<Box<dyn Transport + Send>, FakeActuator>;

    /// A sensor that has fallen off the bus.
    struct Unplugged;

    impl Transport for Unplugged {
        fn write(&mut self, _: &[u8]) -> Result<(), LinkError> {
            Err(LinkError::Write("remote I/O error".into()))
        }

        fn read(&mut self, _: &mut [u8]) -> Result<usize, LinkError> {
            Err(LinkError::Read("remote I/O error".into()))
        }
    }

    fn no_delay(_: Duration) {}

    fn link(kind: ModuleKind, t: Box<dyn Transport + Send>) -> DeviceLink<Box<dyn Transport + Send>> {
        DeviceLink::new(DeviceHandle::new(1, 0x63, kind, ""), t).with_delay(no_delay)
    }

    fn sensors(ph: Option<f64>, ec: Option<f64>) -> SensorReader<Box<dyn Transport + Send>> {
        let water = Reservoir::fixed(ph.unwrap_or(7.0), ec.unwrap_or(1.5));
        let ph_t: Box<dyn Transport + Send> = match ph {
            Some(_) => Box::new(SimulatedEzo::new(ModuleKind::Ph, water.clone())),
            None => Box::new(Unplugged),
        };
        let ec_t: Box<dyn Transport + Send> = match ec {
            Some(_) => Box::new(SimulatedEzo::new(ModuleKind::Ec, water)),
            None => Box::new(Unplugged),
        };
        SensorReader::new(link(ModuleKind::Ph, ph_t), link(ModuleKind::Ec, ec_t))
    }

    fn all_tasks() -> Vec<ScheduledTask> {
        vec![
            ScheduledTask::new(TaskKind::EcControl, true, 60 * MIN),
            ScheduledTask::new(TaskKind::SensorCheck, true, 15 * MIN),
            ScheduledTask::new(TaskKind::PhControl, true, 30 * MIN),
        ]
    }

    fn scheduler(tasks: Vec<ScheduledTask>, ph: Option<f64>, ec: Option<f64>) -> TestScheduler {
        Scheduler::new(
            tasks,
            ControllerState {
                thresholds: thresholds(),
                budgets: fresh_budgets(DAY),
            },
            sensors(ph, ec),
            FakeActuator::default(),
            EventLog::new(),
        )
    }

    fn details(s: &TestScheduler, kind: EventKind) -> Vec<String> {
        let mut v: Vec<String> = s
            .events()
            .recent()
            .filter(|e| e.kind == kind)
            .map(|e| e.detail.clone())
            .collect();
        v.reverse();
        v
    }

    fn used(s: &TestScheduler, pump: &str) -> f64 {
        s.state().budgets.get(pump).unwrap().seconds_used_today
    }

    // -- Task names ---------------------------------------------------------

    #[test]
    fn task_names_round_trip() {
        for kind in [TaskKind::SensorCheck, TaskKind::PhControl, TaskKind::EcControl] {
            assert_eq!(TaskKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(TaskKind::from_name("image_capture"), None);
        assert!(!TaskKind::SensorCheck.is_trigger());
        assert!(TaskKind::EcControl.is_trigger());
    }

    // -- Interval gating ----------------------------------------------------

    #[test]
    fn never_run_task_is_due_immediately() {
        let mut s = scheduler(
            vec![ScheduledTask::new(TaskKind::PhControl, true, 30 * MIN)],
            Some(5.4),
            Some(1.5),
        );
        assert_eq!(s.wake(Instant::now(), DAY), 1);
        assert_eq!(s.pumps().runs, vec![(PH_UP.to_string(), 1.0)]);
    }

    #[test]
    fn wakes_before_interval_run_nothing_then_exactly_once() {
        let t0 = Instant::now();
        let mut task = ScheduledTask::new(TaskKind::PhControl, true, 30 * MIN);
        task.last_run = Some(t0);
        let mut s = scheduler(vec![task], Some(5.4), Some(1.5));

        assert_eq!(s.wake(t0 + MIN, DAY), 0);
        assert_eq!(s.wake(t0 + 29 * MIN, DAY), 0);
        assert!(s.pumps().runs.is_empty());
        assert_eq!(s.tasks()[0].last_run, Some(t0));

        let due = t0 + 30 * MIN;
        assert_eq!(s.wake(due, DAY), 1);
        assert_eq!(s.pumps().runs.len(), 1);
        assert_eq!(s.tasks()[0].last_run, Some(due));
        assert_eq!(s.tasks()[0].phase(), Phase::Idle);

        assert_eq!(s.wake(due + MIN, DAY), 0);
    }

    #[test]
    fn disabled_task_never_runs() {
        let mut s = scheduler(
            vec![ScheduledTask::new(TaskKind::PhControl, false, MIN)],
            Some(5.4),
            Some(1.5),
        );
        assert_eq!(s.wake(Instant::now(), DAY), 0);
        assert!(s.events().recent().next().is_none());
    }

    // -- Ordering -----------------------------------------------------------

    #[test]
    fn tasks_run_in_fixed_order() {
        let mut s = scheduler(all_tasks(), Some(5.4), Some(0.8));
        let kinds: Vec<TaskKind> = s.tasks().iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![TaskKind::SensorCheck, TaskKind::PhControl, TaskKind::EcControl]
        );

        assert_eq!(s.wake(Instant::now(), DAY), 3);
        assert_eq!(
            s.pumps().runs,
            vec![(PH_UP.to_string(), 1.0), (NUTRIENT.to_string(), 2.0)]
        );
        assert_eq!(
            details(&s, EventKind::Decision),
            vec!["pH 5.40: dose pH_up 1.0s", "EC 0.80: dose nutrientA 2.0s"]
        );
        assert_eq!(
            details(&s, EventKind::Pump),
            vec![
                "pH_up ran 1.0s (1.0/30.0s today)",
                "nutrientA ran 2.0s (2.0/60.0s today)"
            ]
        );
    }

    #[test]
    fn in_range_is_recorded_as_decision() {
        let mut s = scheduler(all_tasks(), Some(6.0), Some(1.5));
        s.wake(Instant::now(), DAY);
        assert!(s.pumps().runs.is_empty());
        assert_eq!(
            details(&s, EventKind::Decision),
            vec!["pH 6.00: in range", "EC 1.50: in range"]
        );
    }

    #[test]
    fn each_sensor_read_once_per_wake() {
        let mut s = scheduler(all_tasks(), Some(5.4), Some(0.8));
        assert_eq!(s.wake(Instant::now(), DAY), 3);
        assert_eq!(
            details(&s, EventKind::Reading),
            vec!["pH=5.40", "EC=0.80 TDS=400.0 SAL=0.44 SG=1.001"]
        );
        assert_eq!(s.pumps().runs.len(), 2);
    }

    #[test]
    fn failed_read_is_not_retried_in_same_wake() {
        let mut s = scheduler(all_tasks(), None, Some(1.5));
        s.wake(Instant::now(), DAY);
        let errors = details(&s, EventKind::Error);
        assert_eq!(errors.iter().filter(|d| *d == "pH read failed").count(), 1);
        assert!(errors.iter().any(|d| d.contains("correction skipped")));
    }

    #[test]
    fn next_wake_reads_again() {
        let t0 = Instant::now();
        let mut s = scheduler(
            vec![ScheduledTask::new(TaskKind::SensorCheck, true, MIN)],
            Some(6.0),
            Some(1.5),
        );
        s.wake(t0, DAY);
        s.wake(t0 + MIN, DAY);
        assert_eq!(details(&s, EventKind::Reading).len(), 4);
    }

    // -- Failure isolation --------------------------------------------------

    #[test]
    fn failed_sensor_does_not_abort_sibling_task() {
        let mut s = scheduler(all_tasks(), None, Some(0.8));
        assert_eq!(s.wake(Instant::now(), DAY), 3);
        assert_eq!(s.pumps().runs, vec![(NUTRIENT.to_string(), 2.0)]);
        assert!(details(&s, EventKind::Error)
            .iter()
            .any(|d| d.contains("correction skipped")));
    }

    #[test]
    fn failed_pump_is_logged_and_budget_untouched() {
        let mut s = scheduler(all_tasks(), Some(5.4), Some(1.5));
        s.pumps.fail = true;
        s.wake(Instant::now(), DAY);
        assert_eq!(used(&s, PH_UP), 0.0);
        assert!(details(&s, EventKind::Error)
            .iter()
            .any(|d| d.contains("dose abandoned")));
    }

    #[test]
    fn spent_budget_is_limit_reached_without_actuation() {
        let mut s = scheduler(all_tasks(), Some(5.4), Some(1.5));
        s.handle(
            Command::Dose {
                pump: PH_UP.into(),
                seconds: 30.0,
            },
            DAY,
        );
        s.pumps.runs.clear();

        s.wake(Instant::now(), DAY);
        assert!(s.pumps().runs.is_empty());
        assert!(details(&s, EventKind::Decision)
            .iter()
            .any(|d| d.contains("daily limit reached for pH_up")));
    }

    // -- Daily reset --------------------------------------------------------

    #[test]
    fn new_day_resets_budget_before_deciding() {
        let mut s = scheduler(all_tasks(), Some(5.4), Some(1.5));
        s.handle(
            Command::Dose {
                pump: PH_UP.into(),
                seconds: 30.0,
            },
            DAY,
        );

        s.wake(Instant::now(), date!(2024 - 03 - 02));
        assert_eq!(used(&s, PH_UP), 1.0);
        assert!(details(&s, EventKind::System)
            .iter()
            .any(|d| d == "daily budgets reset for 2024-03-02"));
    }

    // -- Commands -----------------------------------------------------------

    #[test]
    fn manual_dose_charges_budget() {
        let mut s = scheduler(vec![], Some(6.0), Some(1.5));
        let flow = s.handle(
            Command::Dose {
                pump: NUTRIENT.into(),
                seconds: 5.0,
            },
            DAY,
        );
        assert!(flow.is_continue());
        assert_eq!(used(&s, NUTRIENT), 5.0);
    }

    #[test]
    fn manual_volume_dose_converts_then_charges() {
        let mut s = scheduler(vec![], Some(6.0), Some(1.5));
        s.handle(
            Command::DoseVolume {
                pump: NUTRIENT.into(),
                ml: 4.0,
            },
            DAY,
        );
        assert_eq!(s.pumps().runs, vec![(NUTRIENT.to_string(), 4.0)]);
        assert_eq!(used(&s, NUTRIENT), 4.0);
    }

    #[test]
    fn manual_dose_unknown_pump_is_an_error_not_a_decision() {
        let mut s = scheduler(vec![], Some(6.0), Some(1.5));
        s.handle(
            Command::Dose {
                pump: "drain".into(),
                seconds: 1.0,
            },
            DAY,
        );
        s.handle(
            Command::DoseVolume {
                pump: "drain".into(),
                ml: 1.0,
            },
            DAY,
        );
        assert!(s.pumps().runs.is_empty());
        assert!(details(&s, EventKind::Decision).is_empty());
        let errors = details(&s, EventKind::Error);
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|d| d.contains("unknown pump 'drain'")), "{errors:?}");
    }

    #[test]
    fn manual_zero_volume_is_rejected() {
        let mut s = scheduler(vec![], Some(6.0), Some(1.5));
        s.handle(
            Command::DoseVolume {
                pump: NUTRIENT.into(),
                ml: 0.0,
            },
            DAY,
        );
        assert!(s.pumps().runs.is_empty());
        assert_eq!(details(&s, EventKind::Error).len(), 1);
    }

    #[test]
    fn read_sensors_records_both_readings() {
        let mut s = scheduler(vec![], Some(6.0), Some(1.2));
        s.handle(Command::ReadSensors, DAY);
        assert_eq!(
            details(&s, EventKind::Reading),
            vec!["pH=6.00", "EC=1.20 TDS=600.0 SAL=0.66 SG=1.001"]
        );
    }

    #[test]
    fn set_thresholds_applies_between_wakes() {
        let mut s = scheduler(all_tasks(), Some(5.6), Some(1.5));
        s.handle(
            Command::SetThresholds(Thresholds {
                ph_min: 5.5,
                ..thresholds()
            }),
            DAY,
        );
        s.wake(Instant::now(), DAY);
        assert!(s.pumps().runs.is_empty());
    }

    #[test]
    fn invalid_thresholds_are_rejected() {
        let mut s = scheduler(vec![], Some(6.0), Some(1.5));
        s.handle(
            Command::SetThresholds(Thresholds {
                ph_min: 6.5,
                ph_max: 6.0,
                ec_min: 1.0,
            }),
            DAY,
        );
        assert_eq!(s.state().thresholds, thresholds());
        assert!(details(&s, EventKind::Error)[0].starts_with("thresholds rejected"));
    }

    #[test]
    fn calibrate_is_recorded() {
        let mut s = scheduler(vec![], Some(6.0), Some(1.5));
        s.handle(
            Command::Calibrate {
                pump: PH_UP.into(),
                run_seconds: 10.0,
                measured_ml: 12.0,
            },
            DAY,
        );
        assert_eq!(
            details(&s, EventKind::System),
            vec!["pH_up calibrated to 1.200 ml/s"]
        );
    }

    #[test]
    fn shutdown_breaks() {
        let mut s = scheduler(vec![], Some(6.0), Some(1.5));
        assert!(s.handle(Command::Shutdown, DAY).is_break());
    }

    // -- Loop ---------------------------------------------------------------

    #[test]
    fn run_wakes_serves_commands_and_stops() {
        let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();
        let s: TestScheduler = Scheduler::new(
            all_tasks(),
            ControllerState {
                thresholds: thresholds(),
                budgets: fresh_budgets(OffsetDateTime::now_utc().date()),
            },
            sensors(Some(6.0), Some(1.5)),
            FakeActuator::default(),
            EventLog::with_forward(event_tx),
        )
        .with_poll_interval(Duration::from_secs(3600));

        let (tx, rx) = std::sync::mpsc::channel();
        tx.send(Command::ReadSensors).unwrap();
        tx.send(Command::Shutdown).unwrap();
        std::thread::spawn(move || s.run(rx)).join().unwrap();

        let mut events = Vec::new();
        while let Ok(e) = event_rx.try_recv() {
            events.push(e);
        }
        assert_eq!(events.first().unwrap().detail, "controller started");
        assert_eq!(events.last().unwrap().detail, "controller stopped");
        // one wake-up reads each sensor once, then one manual read
        let readings = events.iter().filter(|e| e.kind == EventKind::Reading).count();
        assert_eq!(readings, 4);
    }

    #[test]
    fn run_stops_when_queue_closes() {
        let s = scheduler(vec![], Some(6.0), Some(1.5));
        let (tx, rx) = std::sync::mpsc::channel::<Command>();
        drop(tx);
        s.run(rx);
    }
}
