//! MQTT bridge: turns inbound messages into scheduler commands and publishes
//! every controller event.  It never touches hardware itself.
//!
//! ```text
//!   <prefix>/pump/<name>/dose        {"seconds": 1.5} | {"ml": 3.0}
//!   <prefix>/pump/<name>/calibrate   {"run_seconds": 10, "measured_ml": 12}
//!   <prefix>/sensors/read            (any payload)
//!   <prefix>/thresholds/set          {"ph_min": 5.8, "ph_max": 6.2, "ec_min": 1.0}
//!   <prefix>/events                  outbound, one JSON event per message
//! ```

use std::sync::mpsc::Sender;
use std::time::Duration;

use rumqttc::{AsyncClient, Event as MqttEvent, MqttOptions, Packet, QoS};
use serde::Deserialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::{MqttEntry, Thresholds};
use crate::events::Event;
use crate::scheduler::Command;

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct DoseMsg {
    pub(crate) seconds: Option<f64>,
    pub(crate) ml: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CalibrateMsg {
    pub(crate) run_seconds: f64,
    pub(crate) measured_ml: f64,
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Topics the bridge subscribes to under `prefix`.
pub(crate) fn subscriptions(prefix: &str) -> [String; 4] {
    [
        format!("{prefix}/pump/+/dose"),
        format!("{prefix}/pump/+/calibrate"),
        format!("{prefix}/sensors/read"),
        format!("{prefix}/thresholds/set"),
    ]
}

pub(crate) fn events_topic(prefix: &str) -> String {
    format!("{prefix}/events")
}

/// Extract the pump name from "<prefix>/pump/<name>/<action>".
pub(crate) fn extract_pump_id<'a>(prefix: &str, topic: &'a str, action: &str) -> Option<&'a str> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    let parts: Vec<&str> = rest.split('/').collect();
    if parts.len() == 3 && parts[0] == "pump" && !parts[1].is_empty() && parts[2] == action {
        Some(parts[1])
    } else {
        None
    }
}

/// Parse a dose payload: exactly one of `seconds` or `ml`.
pub(crate) fn parse_dose(pump: &str, payload: &[u8]) -> Result<Command, String> {
    let msg: DoseMsg =
        serde_json::from_slice(payload).map_err(|e| format!("bad dose json: {e}"))?;
    match (msg.seconds, msg.ml) {
        (Some(seconds), None) => Ok(Command::Dose {
            pump: pump.to_string(),
            seconds,
        }),
        (None, Some(ml)) => Ok(Command::DoseVolume {
            pump: pump.to_string(),
            ml,
        }),
        _ => Err("dose needs exactly one of 'seconds' or 'ml'".to_string()),
    }
}

/// Map an inbound message to a command.  `Ok(None)` for topics that are not
/// ours.
pub(crate) fn parse_command(prefix: &str, topic: &str, payload: &[u8]) -> Result<Option<Command>, String> {
    if let Some(pump) = extract_pump_id(prefix, topic, "dose") {
        return parse_dose(pump, payload).map(Some);
    }

    if let Some(pump) = extract_pump_id(prefix, topic, "calibrate") {
        let msg: CalibrateMsg = serde_json::from_slice(payload)
            .map_err(|e| format!("bad calibrate json: {e}"))?;
        return Ok(Some(Command::Calibrate {
            pump: pump.to_string(),
            run_seconds: msg.run_seconds,
            measured_ml: msg.measured_ml,
        }));
    }

    let Some(rest) = topic.strip_prefix(prefix).and_then(|r| r.strip_prefix('/')) else {
        return Ok(None);
    };
    match rest {
        "sensors/read" => Ok(Some(Command::ReadSensors)),
        "thresholds/set" => {
            let t: Thresholds = serde_json::from_slice(payload)
                .map_err(|e| format!("bad thresholds json: {e}"))?;
            Ok(Some(Command::SetThresholds(t)))
        }
        _ => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

/// Run the bridge until the control thread stops taking commands.
/// Intended to be `tokio::spawn`-ed from main.
pub async fn run(cfg: MqttEntry, commands: Sender<Command>, mut events: UnboundedReceiver<Event>) {
    let mut opts = MqttOptions::new(cfg.client_id.as_str(), cfg.host.as_str(), cfg.port);
    opts.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(opts, 20);
    let events_topic = events_topic(&cfg.prefix);
    let mut forwarding = true;

    info!(host = %cfg.host, port = cfg.port, prefix = %cfg.prefix, "mqtt bridge starting");

    loop {
        tokio::select! {
            polled = eventloop.poll() => match polled {
                Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => {
                    info!("mqtt connected");
                    // Clean sessions drop subscriptions, so renew them on every connect.
                    for topic in subscriptions(&cfg.prefix) {
                        if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                            error!(topic = %topic, "mqtt subscribe failed: {e}");
                        }
                    }
                }
                Ok(MqttEvent::Incoming(Packet::Publish(p))) => {
                    match parse_command(&cfg.prefix, &p.topic, &p.payload) {
                        Ok(Some(cmd)) => {
                            info!(topic = %p.topic, ?cmd, "mqtt command");
                            if commands.send(cmd).is_err() {
                                warn!("control thread gone, mqtt bridge stopping");
                                return;
                            }
                        }
                        Ok(None) => warn!(topic = %p.topic, "unhandled topic"),
                        Err(msg) => warn!(topic = %p.topic, "{msg}"),
                    }
                }
                Ok(MqttEvent::Incoming(Packet::Disconnect)) => warn!("mqtt disconnected"),
                Ok(_) => {}
                Err(e) => {
                    warn!("mqtt error: {e}. reconnecting...");
                    sleep(Duration::from_secs(2)).await;
                }
            },
            next = events.recv(), if forwarding => match next {
                Some(event) => match serde_json::to_vec(&event) {
                    Ok(body) => {
                        if let Err(e) = client.try_publish(events_topic.as_str(), QoS::AtLeastOnce, false, body) {
                            warn!("event publish dropped: {e}");
                        }
                    }
                    Err(e) => error!("event serialization failed: {e}"),
                },
                None => forwarding = false,
            },
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
