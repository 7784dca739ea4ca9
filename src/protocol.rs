/// Message vocabulary between a client session and the scanning host.
///
/// Commands flow client → host; notifications flow host → client. On a byte
/// transport commands are newline-delimited JSON (NDJSON), encoded and
/// parsed in [`crate::comm`]. Bounded `heapless` strings keep every field
/// of a wire message within [`MAX_MSG_LEN`].
use heapless::{String, Vec};
use serde::{Deserialize, Serialize};

use crate::beacon::ClassifiedBeacon;
use crate::region::Region;

/// Maximum length for MAC address strings ("AA:BB:CC:DD:EE:FF")
pub type MacString = String<18>;

/// Region unique id
pub type RegionId = String<64>;

/// Opaque client identity the host uses to route notifications back
pub type ClientId = String<64>;

/// Active/idle durations of one scan cycle, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanPeriods {
    /// How long the radio scans per cycle
    pub scan_ms: u64,
    /// How long the radio idles between scans
    pub between_scan_ms: u64,
}

impl ScanPeriods {
    pub const fn new(scan_ms: u64, between_scan_ms: u64) -> Self {
        Self {
            scan_ms,
            between_scan_ms,
        }
    }

    /// Full cycle length (active + idle).
    pub const fn cycle_ms(&self) -> u64 {
        self.scan_ms + self.between_scan_ms
    }
}

/// Payload shared by the four ranging/monitoring commands.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRequest {
    pub region: Region,
    pub client: ClientId,
    pub periods: ScanPeriods,
    pub background: bool,
}

/// Ranging or monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Ranging,
    Monitoring,
}

impl Interest {
    pub fn start(self, request: ScanRequest) -> Command {
        match self {
            Interest::Ranging => Command::StartRanging(request),
            Interest::Monitoring => Command::StartMonitoring(request),
        }
    }

    pub fn stop(self, request: ScanRequest) -> Command {
        match self {
            Interest::Ranging => Command::StopRanging(request),
            Interest::Monitoring => Command::StopMonitoring(request),
        }
    }
}

/// Commands sent from a client session to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    StartRanging(ScanRequest),
    StopRanging(ScanRequest),
    StartMonitoring(ScanRequest),
    StopMonitoring(ScanRequest),
    /// Reconfigure the scan cycle; applied at the next cycle boundary
    SetScanPeriods {
        periods: ScanPeriods,
        background: bool,
    },
}

impl Command {
    /// Wire name, the `cmd` field of the JSON form.
    pub fn name(&self) -> &'static str {
        match self {
            Command::StartRanging(_) => "start_ranging",
            Command::StopRanging(_) => "stop_ranging",
            Command::StartMonitoring(_) => "start_monitoring",
            Command::StopMonitoring(_) => "stop_monitoring",
            Command::SetScanPeriods { .. } => "set_scan_periods",
        }
    }

    /// The ranging/monitoring request, if this command carries one.
    pub fn request(&self) -> Option<&ScanRequest> {
        match self {
            Command::StartRanging(req)
            | Command::StopRanging(req)
            | Command::StartMonitoring(req)
            | Command::StopMonitoring(req) => Some(req),
            Command::SetScanPeriods { .. } => None,
        }
    }

    /// Scan periods and background flag carried by every command.
    pub fn scan_settings(&self) -> (ScanPeriods, bool) {
        match self {
            Command::SetScanPeriods {
                periods,
                background,
            } => (*periods, *background),
            _ => self
                .request()
                .map(|req| (req.periods, req.background))
                .unwrap_or((ScanPeriods::new(0, 0), false)),
        }
    }
}

/// Notifications sent from the host back to a client session.
#[derive(Debug, Clone)]
pub enum HostEvent {
    /// Beacons seen in a ranged region during the last scan cycle
    RangeUpdate {
        region: Region,
        beacons: std::vec::Vec<ClassifiedBeacon>,
    },
    /// First detection in a monitored region
    RegionEnter(Region),
    /// No detection in a monitored region for the exit period
    RegionExit(Region),
}

/// Wire form of a command: flat struct borrowed from a [`Command`] for
/// serialization.
#[derive(Serialize)]
pub(crate) struct WireCommand<'a> {
    pub cmd: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<&'a str>,
    pub scan_ms: u64,
    pub between_ms: u64,
    pub bg: bool,
}

impl<'a> From<&'a Command> for WireCommand<'a> {
    fn from(command: &'a Command) -> Self {
        let (periods, background) = command.scan_settings();
        let request = command.request();
        Self {
            cmd: command.name(),
            id: request.map(|req| req.region.unique_id()),
            mac: request.and_then(|req| req.region.hardware_address()),
            client: request.map(|req| req.client.as_str()),
            scan_ms: periods.scan_ms,
            between_ms: periods.between_scan_ms,
            bg: background,
        }
    }
}

/// Wire format for incoming commands: flat struct that `serde_json_core`
/// can deserialize without `deserialize_any`. Converted to [`Command`] in
/// `comm::parse_command()`.
#[derive(Deserialize)]
pub(crate) struct RawCommand {
    pub cmd: String<32>,
    #[serde(default)]
    pub id: Option<RegionId>,
    #[serde(default)]
    pub mac: Option<MacString>,
    #[serde(default)]
    pub client: Option<ClientId>,
    #[serde(default)]
    pub scan_ms: Option<u64>,
    #[serde(default)]
    pub between_ms: Option<u64>,
    #[serde(default)]
    pub bg: Option<bool>,
}

/// Library version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum size of a serialized JSON message
pub const MAX_MSG_LEN: usize = 512;

/// Buffer type for serialized JSON messages
pub type MsgBuffer = Vec<u8, MAX_MSG_LEN>;
