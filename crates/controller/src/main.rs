mod config;
mod dosing;
mod events;
mod mqtt;
mod pumps;
mod scheduler;
mod state;

use anyhow::{anyhow, Context, Result};
use std::{env, sync::mpsc, thread, time::Duration};
use time::UtcOffset;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use ezo::{DeviceHandle, DeviceLink, ModuleKind, PollPolicy, SensorReader, Transport};
use events::EventLog;
use pumps::{Actuator, PumpBoard};
use scheduler::{Command, Scheduler};
use state::ControllerState;

type BoxedTransport = Box<dyn Transport + Send>;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // The local offset can only be read while this is the only thread.
    let utc_offset = UtcOffset::current_local_offset().unwrap_or_else(|e| {
        warn!("local UTC offset unavailable ({e}), daily budgets reset at UTC midnight");
        UtcOffset::UTC
    });

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "hydro.toml".to_string());
    let cfg = config::load(&config_path)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?
        .block_on(run(cfg, utc_offset))
}

async fn run(cfg: Config, utc_offset: UtcOffset) -> Result<()> {
    // ── Hardware ────────────────────────────────────────────────────
    let (sensors, pumps) = build_hardware(&cfg)?;

    // ── Events (forwarded to MQTT when configured) ──────────────────
    let (events, event_rx) = if cfg.mqtt.is_some() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (EventLog::with_forward(tx), Some(rx))
    } else {
        (EventLog::new(), None)
    };

    // ── Control thread ──────────────────────────────────────────────
    let today = time::OffsetDateTime::now_utc().to_offset(utc_offset).date();
    let scheduler = Scheduler::new(
        scheduler::tasks_from_config(&cfg),
        ControllerState::new(&cfg, today),
        sensors,
        pumps,
        events,
    )
    .with_poll_interval(cfg.poll_interval())
    .with_utc_offset(utc_offset);

    let (cmd_tx, cmd_rx) = mpsc::channel::<Command>();
    let control = thread::Builder::new()
        .name("control".to_string())
        .spawn(move || scheduler.run(cmd_rx))
        .context("failed to spawn control thread")?;

    // ── MQTT ────────────────────────────────────────────────────────
    if let (Some(mqtt_cfg), Some(rx)) = (cfg.mqtt.clone(), event_rx) {
        tokio::spawn(mqtt::run(mqtt_cfg, cmd_tx.clone(), rx));
    }

    info!(pumps = cfg.pumps.len(), "controller running, ctrl-c to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    if cmd_tx.send(Command::Shutdown).is_err() {
        warn!("control thread already stopped");
    }
    tokio::task::spawn_blocking(move || control.join())
        .await
        .context("failed to join control thread")?
        .map_err(|_| anyhow!("control thread panicked"))?;

    info!("controller stopped");
    Ok(())
}

fn poll_policy(cfg: &Config) -> PollPolicy {
    PollPolicy {
        attempts: cfg.sensors.poll_attempts,
        delay: Duration::from_millis(cfg.sensors.poll_delay_ms),
    }
}

fn device_handle(cfg: &Config, address: u16, kind: ModuleKind, name: &str) -> DeviceHandle {
    let mut handle = DeviceHandle::new(cfg.sensors.bus, address, kind, name);
    handle.long_timeout = Duration::from_millis(cfg.sensors.long_timeout_ms);
    handle.short_timeout = Duration::from_millis(cfg.sensors.short_timeout_ms);
    handle
}

/// Real EZO circuits on the I2C bus.
#[cfg(feature = "i2c")]
fn build_hardware(cfg: &Config) -> Result<(SensorReader<BoxedTransport>, impl Actuator + Send)> {
    let s = &cfg.sensors;
    let ph: BoxedTransport = Box::new(ezo::link::open_i2c(s.bus, s.ph_address).context("pH sensor")?);
    let ec: BoxedTransport = Box::new(ezo::link::open_i2c(s.bus, s.ec_address).context("EC sensor")?);

    let sensors = SensorReader::new(
        DeviceLink::new(device_handle(cfg, s.ph_address, ModuleKind::Ph, "pH_sensor"), ph)
            .with_poll(poll_policy(cfg)),
        DeviceLink::new(device_handle(cfg, s.ec_address, ModuleKind::Ec, "EC_sensor"), ec)
            .with_poll(poll_policy(cfg)),
    );
    let pumps = PumpBoard::new(&cfg.pumps).context("failed to set up pump lines")?;

    Ok((sensors, pumps))
}

/// Simulated circuits over one reservoir.  Pump pulses feed back into the
/// reservoir so the loop is closed.
#[cfg(not(feature = "i2c"))]
fn build_hardware(cfg: &Config) -> Result<(SensorReader<BoxedTransport>, impl Actuator + Send)> {
    use ezo::sim::{Reservoir, Scenario, SimulatedEzo};

    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());
    let water = Reservoir::new(scenario);
    info!(%scenario, "using simulated sensors");

    let s = &cfg.sensors;
    let ph: BoxedTransport = Box::new(SimulatedEzo::new(ModuleKind::Ph, water.clone()));
    let ec: BoxedTransport = Box::new(SimulatedEzo::new(ModuleKind::Ec, water.clone()));

    let sensors = SensorReader::new(
        DeviceLink::new(device_handle(cfg, s.ph_address, ModuleKind::Ph, "pH_sensor"), ph)
            .with_poll(poll_policy(cfg)),
        DeviceLink::new(device_handle(cfg, s.ec_address, ModuleKind::Ec, "EC_sensor"), ec)
            .with_poll(poll_policy(cfg)),
    );
    let pumps = PumpBoard::new(&cfg.pumps)
        .context("failed to set up pump lines")?
        .on_pulse(move |pump, seconds| water.apply_dose(pump, seconds));

    Ok((sensors, pumps))
}
