/// Communication layer: command channel abstraction and NDJSON codec.
///
/// A client session talks to the host through a [`CommandChannel`]. Sends
/// are fire-and-forget and at-most-once: there is no acknowledgement and no
/// retry here. Byte transports carry commands as newline-delimited JSON,
/// reassembled on the receiving side with [`LineReader`].
use thiserror::Error;

use crate::protocol::{
    Command, MsgBuffer, RawCommand, ScanPeriods, ScanRequest, WireCommand, MAX_MSG_LEN,
};
use crate::region::{Region, RegionError};

/// Failure to hand a command to the transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelSendError {
    #[error("Command channel closed")]
    Closed,
    #[error("Command does not fit in a {} byte message", MAX_MSG_LEN)]
    Encode,
}

/// Failure to turn a received line into a [`Command`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Empty command line")]
    Empty,
    #[error("Malformed command JSON")]
    Malformed,
    #[error("Unrecognized command '{0}'")]
    UnknownCommand(String),
    #[error("Command '{cmd}' is missing field '{field}'")]
    MissingField {
        cmd: &'static str,
        field: &'static str,
    },
    #[error("Command carries an invalid region: {0}")]
    InvalidRegion(#[from] RegionError),
}

/// One direction of an ordered, reliable channel to the host.
///
/// Commands sent on one channel instance arrive in send order. A channel is
/// tied to one connection; a reconnect yields a fresh instance.
pub trait CommandChannel: Send + Sync {
    fn send(&self, command: &Command) -> Result<(), ChannelSendError>;
}

// ── Serialization helpers ──────────────────────────────────────────────

/// Serialize a command to JSON bytes and write to the output buffer.
/// Returns the number of bytes written, or None if the line (newline
/// included) does not fit.
pub fn serialize_command(command: &Command, buf: &mut [u8]) -> Option<usize> {
    match serde_json_core::to_slice(&WireCommand::from(command), buf) {
        Ok(len) => {
            // Append newline for NDJSON; a line without one is unusable
            let newline = buf.get_mut(len)?;
            *newline = b'\n';
            Some(len + 1)
        }
        Err(_) => None,
    }
}

/// Encode a command as one NDJSON line.
pub fn encode_command(command: &Command) -> Result<MsgBuffer, ChannelSendError> {
    let mut buf = [0u8; MAX_MSG_LEN];
    let len = serialize_command(command, &mut buf).ok_or(ChannelSendError::Encode)?;
    MsgBuffer::from_slice(&buf[..len]).map_err(|_| ChannelSendError::Encode)
}

/// Deserialize a command from a JSON byte slice.
pub fn parse_command(data: &[u8]) -> Result<Command, WireError> {
    // Strip trailing newline/whitespace
    let trimmed = trim_trailing_whitespace(data);
    if trimmed.is_empty() {
        return Err(WireError::Empty);
    }
    // Escaped strings are decoded here so ids keep their exact text
    let mut unescape = [0u8; MAX_MSG_LEN];
    let (raw, _) = serde_json_core::from_slice_escaped::<RawCommand>(trimmed, &mut unescape)
        .map_err(|_| WireError::Malformed)?;

    let periods = ScanPeriods::new(raw.scan_ms.unwrap_or(0), raw.between_ms.unwrap_or(0));
    let background = raw.bg.unwrap_or(false);

    let command = match raw.cmd.as_str() {
        "start_ranging" => {
            Command::StartRanging(scan_request("start_ranging", &raw, periods, background)?)
        }
        "stop_ranging" => {
            Command::StopRanging(scan_request("stop_ranging", &raw, periods, background)?)
        }
        "start_monitoring" => {
            Command::StartMonitoring(scan_request("start_monitoring", &raw, periods, background)?)
        }
        "stop_monitoring" => {
            Command::StopMonitoring(scan_request("stop_monitoring", &raw, periods, background)?)
        }
        "set_scan_periods" => Command::SetScanPeriods {
            periods,
            background,
        },
        other => return Err(WireError::UnknownCommand(other.into())),
    };
    Ok(command)
}

fn scan_request(
    cmd: &'static str,
    raw: &RawCommand,
    periods: ScanPeriods,
    background: bool,
) -> Result<ScanRequest, WireError> {
    let id = raw
        .id
        .as_deref()
        .ok_or(WireError::MissingField { cmd, field: "id" })?;
    let client = raw
        .client
        .clone()
        .ok_or(WireError::MissingField { cmd, field: "client" })?;
    let region = Region::build(id, raw.mac.as_deref())?;
    Ok(ScanRequest {
        region,
        client,
        periods,
        background,
    })
}

// ── NDJSON line reader ─────────────────────────────────────────────────

/// NDJSON reader state machine.
/// Accumulates bytes until a newline is found, then yields the line.
pub struct LineReader {
    buf: [u8; MAX_MSG_LEN],
    pos: usize,
}

impl LineReader {
    pub const fn new() -> Self {
        Self {
            buf: [0; MAX_MSG_LEN],
            pos: 0,
        }
    }

    /// Feed a byte into the reader. Returns a complete line (without newline)
    /// when one is detected.
    pub fn feed(&mut self, byte: u8) -> Option<&[u8]> {
        if byte == b'\n' || byte == b'\r' {
            if self.pos > 0 {
                let line = &self.buf[..self.pos];
                self.pos = 0;
                Some(line)
            } else {
                None
            }
        } else if self.pos < self.buf.len() {
            self.buf[self.pos] = byte;
            self.pos += 1;
            None
        } else {
            // Overflow: discard and reset
            log::warn!("Command line exceeds {} bytes, discarded", MAX_MSG_LEN);
            self.pos = 0;
            None
        }
    }
}

impl Default for LineReader {
    fn default() -> Self {
        Self::new()
    }
}

fn trim_trailing_whitespace(data: &[u8]) -> &[u8] {
    let mut end = data.len();
    while end > 0 && matches!(data[end - 1], b' ' | b'\n' | b'\r' | b'\t') {
        end -= 1;
    }
    &data[..end]
}
