//! Typed pH and EC readings from a pair of EZO circuits.
//!
//! Every failure (bus, device status, timeout, malformed payload) is logged
//! here and surfaced as "no reading".  The caller never sees a failure that
//! could halt its cycle.

use std::fmt;

use crate::error::{ParseError, ReadError};
use crate::link::{DeviceLink, Transport};

/// Measurement command understood by every EZO circuit.
const READ_COMMAND: &str = "R";

/// EC circuits report EC, TDS, salinity and specific gravity.
const EC_FIELDS: usize = 4;

/// One EC measurement with all four outputs enabled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EcReading {
    /// Electrical conductivity.
    pub ec: f64,
    /// Total dissolved solids.
    pub tds: f64,
    pub salinity: f64,
    pub specific_gravity: f64,
}

/// A successful reading of either chemistry axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensorReading {
    Ph(f64),
    Ec(EcReading),
}

impl fmt::Display for SensorReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ph(v) => write!(f, "pH={v:.2}"),
            Self::Ec(r) => write!(
                f,
                "EC={:.2} TDS={:.1} SAL={:.2} SG={:.3}",
                r.ec, r.tds, r.salinity, r.specific_gravity
            ),
        }
    }
}

// ── Payload parsing ─────────────────────────────────────────────────────────

fn parse_field(field: &'static str, raw: &str) -> Result<f64, ParseError> {
    let trimmed = raw.trim();
    trimmed
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ParseError::NotANumber {
            field,
            raw: trimmed.to_string(),
        })
}

/// Parse a pH payload such as `"6.87"`.
pub fn parse_ph(payload: &str) -> Result<f64, ParseError> {
    if payload.trim().is_empty() {
        return Err(ParseError::Empty);
    }
    parse_field("pH", payload)
}

/// Parse an EC payload such as `"1413,706,0.70,1.000"`.  Partial payloads
/// are rejected rather than padded.
pub fn parse_ec(payload: &str) -> Result<EcReading, ParseError> {
    if payload.trim().is_empty() {
        return Err(ParseError::Empty);
    }

    let parts: Vec<&str> = payload.split(',').collect();
    if parts.len() != EC_FIELDS {
        return Err(ParseError::FieldCount {
            expected: EC_FIELDS,
            found: parts.len(),
        });
    }

    Ok(EcReading {
        ec: parse_field("EC", parts[0])?,
        tds: parse_field("TDS", parts[1])?,
        salinity: parse_field("salinity", parts[2])?,
        specific_gravity: parse_field("specific gravity", parts[3])?,
    })
}

// ── Reader ──────────────────────────────────────────────────────────────────

pub struct SensorReader<T> {
    ph: DeviceLink<T>,
    ec: DeviceLink<T>,
}

impl<T: Transport> SensorReader<T> {
    pub fn new(ph: DeviceLink<T>, ec: DeviceLink<T>) -> Self {
        Self { ph, ec }
    }

    pub fn ph_link(&mut self) -> &mut DeviceLink<T> {
        &mut self.ph
    }

    pub fn ec_link(&mut self) -> &mut DeviceLink<T> {
        &mut self.ec
    }

    /// One bounded measurement exchange with the pH circuit.
    pub fn try_read_ph(&mut self) -> Result<f64, ReadError> {
        let payload = self.ph.poll(READ_COMMAND)?;
        Ok(parse_ph(&payload)?)
    }

    /// One bounded measurement exchange with the EC circuit.
    pub fn try_read_ec(&mut self) -> Result<EcReading, ReadError> {
        let payload = self.ec.poll(READ_COMMAND)?;
        Ok(parse_ec(&payload)?)
    }

    pub fn read_ph(&mut self) -> Option<f64> {
        match self.try_read_ph() {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(device = %self.ph.handle().describe(), "ph read failed: {e}");
                None
            }
        }
    }

    pub fn read_ec(&mut self) -> Option<EcReading> {
        match self.try_read_ec() {
            Ok(r) => Some(r),
            Err(ReadError::Parse(ParseError::FieldCount { expected, found })) => {
                tracing::warn!(
                    device = %self.ec.handle().describe(),
                    expected,
                    found,
                    "ec read failed: partial payload discarded"
                );
                None
            }
            Err(e) => {
                tracing::warn!(device = %self.ec.handle().describe(), "ec read failed: {e}");
                None
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeviceError;
    use crate::link::tests::{no_delay, success, Scripted};
    use crate::link::{DeviceHandle, ModuleKind, DEFAULT_POLL_ATTEMPTS, STATUS_PENDING};

    fn reader(ph: Scripted, ec: Scripted) -> SensorReader<Scripted> {
        SensorReader::new(
            DeviceLink::new(DeviceHandle::new(1, 0x63, ModuleKind::Ph, "pH_sensor"), ph)
                .with_delay(no_delay),
            DeviceLink::new(DeviceHandle::new(1, 0x64, ModuleKind::Ec, "EC_sensor"), ec)
                .with_delay(no_delay),
        )
    }

    // -- parse_ph -------------------------------------------------------------

    #[test]
    fn parse_ph_decimal() {
        assert_eq!(parse_ph("6.87"), Ok(6.87));
    }

    #[test]
    fn parse_ph_with_whitespace() {
        assert_eq!(parse_ph(" 5.40 "), Ok(5.4));
    }

    #[test]
    fn parse_ph_empty() {
        assert_eq!(parse_ph(""), Err(ParseError::Empty));
        assert_eq!(parse_ph("   "), Err(ParseError::Empty));
    }

    #[test]
    fn parse_ph_garbage() {
        assert!(matches!(
            parse_ph("*ER"),
            Err(ParseError::NotANumber { field: "pH", .. })
        ));
    }

    #[test]
    fn parse_ph_rejects_nan() {
        assert!(parse_ph("NaN").is_err());
    }

    // -- parse_ec -------------------------------------------------------------

    #[test]
    fn parse_ec_four_fields() {
        let r = parse_ec("1413,706,0.70,1.000").unwrap();
        assert_eq!(r.ec, 1413.0);
        assert_eq!(r.tds, 706.0);
        assert_eq!(r.salinity, 0.70);
        assert_eq!(r.specific_gravity, 1.0);
    }

    #[test]
    fn parse_ec_partial_payload_rejected() {
        assert_eq!(
            parse_ec("1413,706"),
            Err(ParseError::FieldCount {
                expected: 4,
                found: 2
            })
        );
    }

    #[test]
    fn parse_ec_extra_fields_rejected() {
        assert!(matches!(
            parse_ec("1,2,3,4,5"),
            Err(ParseError::FieldCount { found: 5, .. })
        ));
    }

    #[test]
    fn parse_ec_bad_field_named() {
        assert!(matches!(
            parse_ec("1413,abc,0.70,1.000"),
            Err(ParseError::NotANumber { field: "TDS", .. })
        ));
    }

    #[test]
    fn parse_ec_empty() {
        assert_eq!(parse_ec(""), Err(ParseError::Empty));
    }

    // -- Reader ---------------------------------------------------------------

    #[test]
    fn read_ph_success() {
        let mut r = reader(
            Scripted::with_frames(&[&[STATUS_PENDING], &success("5.40")]),
            Scripted::default(),
        );
        assert_eq!(r.read_ph(), Some(5.4));
        assert_eq!(r.ph_link().transport_mut().written, vec![b"R\0".to_vec()]);
    }

    #[test]
    fn read_ph_always_busy_is_absent_after_attempt_budget() {
        let mut r = reader(Scripted::always_busy(), Scripted::default());
        assert_eq!(r.read_ph(), None);
        assert_eq!(r.ph_link().transport_mut().reads, DEFAULT_POLL_ATTEMPTS);
    }

    #[test]
    fn try_read_ph_reports_busy_cause() {
        let mut r = reader(Scripted::always_busy(), Scripted::default());
        assert!(matches!(
            r.try_read_ph(),
            Err(ReadError::Device(DeviceError::Busy { .. }))
        ));
    }

    #[test]
    fn read_ph_empty_payload_is_absent() {
        let mut r = reader(Scripted::with_frames(&[&success("")]), Scripted::default());
        assert!(matches!(
            r.try_read_ph(),
            Err(ReadError::Parse(ParseError::Empty))
        ));
    }

    #[test]
    fn read_ph_link_failure_is_absent() {
        let mut r = reader(
            Scripted {
                fail_writes: true,
                ..Scripted::default()
            },
            Scripted::default(),
        );
        assert_eq!(r.read_ph(), None);
    }

    #[test]
    fn read_ec_success() {
        let mut r = reader(
            Scripted::default(),
            Scripted::with_frames(&[&success("1.20,600,0.60,1.000")]),
        );
        let ec = r.read_ec().unwrap();
        assert_eq!(ec.ec, 1.2);
        assert_eq!(ec.tds, 600.0);
    }

    #[test]
    fn read_ec_partial_is_absent() {
        let mut r = reader(
            Scripted::default(),
            Scripted::with_frames(&[&success("1.20,600")]),
        );
        assert_eq!(r.read_ec(), None);
    }

    #[test]
    fn read_ec_no_data_is_absent() {
        // Scripted answers 255 once its frames run out.
        let mut r = reader(Scripted::default(), Scripted::default());
        assert!(matches!(
            r.try_read_ec(),
            Err(ReadError::Device(DeviceError::NoData))
        ));
        assert_eq!(r.ec_link().transport_mut().reads, 1);
    }

    #[test]
    fn sensor_reading_display() {
        assert_eq!(SensorReading::Ph(5.4).to_string(), "pH=5.40");
        let ec = SensorReading::Ec(EcReading {
            ec: 1.2,
            tds: 600.0,
            salinity: 0.6,
            specific_gravity: 1.0,
        });
        assert_eq!(ec.to_string(), "EC=1.20 TDS=600.0 SAL=0.60 SG=1.000");
    }
}
