//! Error types for EZO device exchanges.
//!
//! Transport failures, device status codes and payload parse failures are
//! kept apart so the reader can log the exact cause of an absent reading.

use thiserror::Error;

/// The bus itself failed (open, address select, read or write).
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("bus open failed: {0}")]
    Open(String),
    #[error("bus write failed: {0}")]
    Write(String),
    #[error("bus read failed: {0}")]
    Read(String),
}

/// A single request/response exchange did not produce a payload.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Link(#[from] LinkError),
    /// Status 254 on every read of the attempt budget.
    #[error("device still processing after {attempts} attempts")]
    Busy { attempts: u32 },
    /// Status 255: nothing pending, not retried.
    #[error("device has no data pending")]
    NoData,
    /// Any status other than 1, 254 or 255.
    #[error("unexpected status code {0}")]
    Protocol(u8),
    #[error("device returned an empty frame")]
    EmptyFrame,
}

/// The payload arrived but does not have the expected shape.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("empty payload")]
    Empty,
    #[error("{field} is not a number: {raw:?}")]
    NotANumber { field: &'static str, raw: String },
    #[error("expected {expected} fields, got {found}")]
    FieldCount { expected: usize, found: usize },
}

/// Why a sensor produced no reading this cycle.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}
