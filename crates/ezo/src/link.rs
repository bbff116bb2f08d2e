//! Request/response link to a single Atlas Scientific EZO circuit.
//!
//! Commands are NUL-terminated ASCII.  Every response frame starts with a
//! status byte followed by a NUL-padded ASCII payload:
//!
//! ```text
//!   [0]     status   1 = success, 2 = syntax error,
//!                    254 = still processing, 255 = no data pending
//!   [1..]   payload  ASCII; the Pi I2C controller may set bit 7
//! ```

use std::{fmt, thread, time::Duration};

use crate::error::{DeviceError, LinkError};

// ── Status codes ────────────────────────────────────────────────────────────

pub const STATUS_SUCCESS: u8 = 1;
pub const STATUS_PENDING: u8 = 254;
pub const STATUS_NO_DATA: u8 = 255;

// ── Timing ──────────────────────────────────────────────────────────────────

/// Wait after commands that start a measurement or a calibration.
pub const LONG_TIMEOUT: Duration = Duration::from_millis(1500);
/// Wait after every other command.
pub const SHORT_TIMEOUT: Duration = Duration::from_millis(300);

const LONG_TIMEOUT_COMMANDS: &[&str] = &["R", "CAL"];
const SLEEP_COMMANDS: &[&str] = &["SLEEP"];

/// Frame size used by the EZO firmware for I2C responses.
pub const DEFAULT_READ_LEN: usize = 31;

pub const DEFAULT_POLL_ATTEMPTS: u32 = 10;
pub const DEFAULT_POLL_DELAY: Duration = Duration::from_millis(300);

/// Bit 7 is occasionally set on payload bytes read through the Pi I2C
/// controller; the payload is 7-bit ASCII.
const ASCII_MASK: u8 = 0x7F;

// ── Transport ───────────────────────────────────────────────────────────────

/// Byte-level channel to one addressed peripheral.
pub trait Transport {
    fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError>;

    /// Fill `buf` from the device and return the number of bytes read.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, LinkError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        (**self).write(bytes)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        (**self).read(buf)
    }
}

#[cfg(feature = "i2c")]
impl Transport for rppal::i2c::I2c {
    fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        rppal::i2c::I2c::write(self, bytes)
            .map(|_| ())
            .map_err(|e| LinkError::Write(e.to_string()))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        rppal::i2c::I2c::read(self, buf).map_err(|e| LinkError::Read(e.to_string()))
    }
}

/// Open `bus` and select the 7-bit slave `address`.
#[cfg(feature = "i2c")]
pub fn open_i2c(bus: u8, address: u16) -> Result<rppal::i2c::I2c, LinkError> {
    let mut i2c = rppal::i2c::I2c::with_bus(bus).map_err(|e| LinkError::Open(e.to_string()))?;
    i2c.set_slave_address(address)
        .map_err(|e| LinkError::Open(e.to_string()))?;

    tracing::info!(
        bus,
        addr = format_args!("0x{address:02x}"),
        "i2c device opened"
    );

    Ok(i2c)
}

// ── Device description ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Ph,
    Ec,
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ph => write!(f, "PH"),
            Self::Ec => write!(f, "EC"),
        }
    }
}

/// Where a device lives on the bus and how long it needs per command.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    pub bus: u8,
    pub address: u16,
    pub kind: ModuleKind,
    pub name: String,
    pub long_timeout: Duration,
    pub short_timeout: Duration,
}

impl DeviceHandle {
    pub fn new(bus: u8, address: u16, kind: ModuleKind, name: impl Into<String>) -> Self {
        Self {
            bus,
            address,
            kind,
            name: name.into(),
            long_timeout: LONG_TIMEOUT,
            short_timeout: SHORT_TIMEOUT,
        }
    }

    /// `"PH 99 pH_sensor"`, or `"PH 99"` when unnamed.
    pub fn describe(&self) -> String {
        if self.name.is_empty() {
            format!("{} {}", self.kind, self.address)
        } else {
            format!("{} {} {}", self.kind, self.address, self.name)
        }
    }

    /// How long to wait before reading the answer to `command`.
    /// `None` for sleep commands, which never answer.
    pub fn command_timeout(&self, command: &str) -> Option<Duration> {
        let upper = command.trim().to_ascii_uppercase();
        if LONG_TIMEOUT_COMMANDS.iter().any(|p| upper.starts_with(p)) {
            Some(self.long_timeout)
        } else if SLEEP_COMMANDS.iter().any(|p| upper.starts_with(p)) {
            None
        } else {
            Some(self.short_timeout)
        }
    }
}

// ── Responses ───────────────────────────────────────────────────────────────

/// Bounded retry budget for a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_POLL_ATTEMPTS,
            delay: DEFAULT_POLL_DELAY,
        }
    }
}

/// An interpreted response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Data(String),
    /// Status 254: retry later.
    Pending,
    /// Status 255: nothing to report.
    NoData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryReply {
    Response(Response),
    /// A sleep command was sent; the device will not answer.
    Sleeping,
}

/// Interpret a raw frame by its leading status byte.
pub fn interpret(frame: &[u8]) -> Result<Response, DeviceError> {
    let (&status, payload) = frame.split_first().ok_or(DeviceError::EmptyFrame)?;
    match status {
        STATUS_SUCCESS => Ok(Response::Data(decode_payload(payload))),
        STATUS_PENDING => Ok(Response::Pending),
        STATUS_NO_DATA => Ok(Response::NoData),
        other => Err(DeviceError::Protocol(other)),
    }
}

fn decode_payload(payload: &[u8]) -> String {
    let text: String = payload
        .iter()
        .map(|b| b & ASCII_MASK)
        .take_while(|&b| b != 0)
        .map(char::from)
        .collect();
    text.trim().to_string()
}

// ── Link ────────────────────────────────────────────────────────────────────

pub struct DeviceLink<T> {
    handle: DeviceHandle,
    transport: T,
    poll: PollPolicy,
    delay: fn(Duration),
}

impl<T: Transport> DeviceLink<T> {
    pub fn new(handle: DeviceHandle, transport: T) -> Self {
        Self {
            handle,
            transport,
            poll: PollPolicy::default(),
            delay: thread::sleep,
        }
    }

    pub fn with_poll(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    /// Replace the blocking sleep used between exchanges.
    pub fn with_delay(mut self, delay: fn(Duration)) -> Self {
        self.delay = delay;
        self
    }

    pub fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    pub fn poll_policy(&self) -> PollPolicy {
        self.poll
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Send `command` followed by a NUL terminator.
    pub fn write(&mut self, command: &str) -> Result<(), LinkError> {
        let mut frame = Vec::with_capacity(command.len() + 1);
        frame.extend_from_slice(command.as_bytes());
        frame.push(0);
        self.transport.write(&frame)
    }

    /// Read one frame of up to `max_bytes` and interpret its status byte.
    pub fn read(&mut self, max_bytes: usize) -> Result<Response, DeviceError> {
        let mut buf = vec![0u8; max_bytes.max(1)];
        let n = self.transport.read(&mut buf)?;
        interpret(&buf[..n.min(buf.len())])
    }

    /// Write, wait the command-appropriate timeout, then read once.
    pub fn query(&mut self, command: &str) -> Result<QueryReply, DeviceError> {
        self.write(command)?;
        let Some(timeout) = self.handle.command_timeout(command) else {
            return Ok(QueryReply::Sleeping);
        };
        (self.delay)(timeout);
        Ok(QueryReply::Response(self.read(DEFAULT_READ_LEN)?))
    }

    /// Write once, then read until the device reports success or the attempt
    /// budget runs out.  Status 255 ends the exchange without retrying.
    pub fn poll(&mut self, command: &str) -> Result<String, DeviceError> {
        self.write(command)?;

        for attempt in 1..=self.poll.attempts {
            (self.delay)(self.poll.delay);
            match self.read(DEFAULT_READ_LEN)? {
                Response::Data(payload) => {
                    tracing::debug!(
                        device = %self.handle.describe(),
                        command,
                        attempt,
                        payload = %payload,
                        "ezo response"
                    );
                    return Ok(payload);
                }
                Response::Pending => continue,
                Response::NoData => return Err(DeviceError::NoData),
            }
        }

        Err(DeviceError::Busy {
            attempts: self.poll.attempts,
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
