/// Runtime configuration for client and host sessions.
///
/// Plain values with compiled-in defaults. Embedders that persist settings
/// can load these from JSON; everything derives `serde`.
use serde::{Deserialize, Serialize};

use crate::defaults;
use crate::protocol::{ClientId, ScanPeriods};

/// Scan periods for each mode. The active pair is selected by the session's
/// background flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanPeriodConfig {
    pub foreground: ScanPeriods,
    pub background: ScanPeriods,
}

impl ScanPeriodConfig {
    pub const fn new() -> Self {
        Self {
            foreground: ScanPeriods::new(
                defaults::FOREGROUND_SCAN_MS,
                defaults::FOREGROUND_BETWEEN_SCAN_MS,
            ),
            background: ScanPeriods::new(
                defaults::BACKGROUND_SCAN_MS,
                defaults::BACKGROUND_BETWEEN_SCAN_MS,
            ),
        }
    }

    /// The pair in effect for the given mode.
    pub const fn select(&self, background: bool) -> ScanPeriods {
        if background {
            self.background
        } else {
            self.foreground
        }
    }
}

impl Default for ScanPeriodConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// What a client session does when a region with an already-active
/// unique id is started again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DuplicatePolicy {
    /// Keep a single entry per unique id. The start command is still sent.
    Ignore,
    /// Append every start, even repeats. One stop removes only the first
    /// matching entry, so a repeated start needs a matching number of stops.
    Append,
}

/// When the host stops the shared scan cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopPolicy {
    /// Any stop command stops scanning, regardless of other registrations.
    Immediate,
    /// Scanning stops only once no ranging or monitoring registration remains.
    WhenIdle,
}

/// Client-side session settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Identity the host routes notifications to
    pub client_id: ClientId,
    pub periods: ScanPeriodConfig,
    pub duplicates: DuplicatePolicy,
}

impl SessionConfig {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            periods: ScanPeriodConfig::new(),
            duplicates: DuplicatePolicy::Ignore,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        let mut client_id = ClientId::new();
        let _ = client_id.push_str(defaults::CLIENT_ID);
        Self::new(client_id)
    }
}

/// Host-side session settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Decode worker threads; `0` means available parallelism + 1
    pub workers: usize,
    /// Bounded queue in front of the workers
    pub queue_depth: usize,
    /// Quiet interval before a monitored region is exited (ms)
    pub exit_period_ms: u64,
    pub stop_policy: StopPolicy,
}

impl HostConfig {
    pub const fn new() -> Self {
        Self {
            workers: 0,
            queue_depth: defaults::QUEUE_DEPTH,
            exit_period_ms: defaults::EXIT_PERIOD_MS,
            stop_policy: StopPolicy::WhenIdle,
        }
    }

    /// Worker count with `0` resolved against the machine.
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            + 1
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self::new()
    }
}
