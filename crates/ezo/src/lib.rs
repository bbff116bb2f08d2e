//! Driver for Atlas Scientific EZO pH and EC circuits over I2C.
//!
//! - [`link`]: NUL-terminated command/response exchange with bounded polling
//! - [`reader`]: typed pH and EC readings that never fail the caller
//! - `sim`: a simulated reservoir and circuits for running without hardware

pub mod error;
pub mod link;
pub mod reader;
#[cfg(feature = "sim")]
pub mod sim;

pub use error::{DeviceError, LinkError, ParseError, ReadError};
pub use link::{DeviceHandle, DeviceLink, ModuleKind, PollPolicy, QueryReply, Response, Transport};
pub use reader::{EcReading, SensorReader, SensorReading};
