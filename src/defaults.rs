/// Compiled-in defaults for beacon classification, scan timing and the
/// detection pipeline.
///
/// Scan timings follow the usual foreground/background power-saving split:
/// scan continuously while the app is in front, scan briefly every five
/// minutes while it is not.

/// Manufacturer-specific data prefix of an iBeacon advertisement:
/// Apple company ID (0x004C, little-endian) followed by type 0x02, length 0x15.
pub const IBEACON_PREFIX: [u8; 4] = [0x4C, 0x00, 0x02, 0x15];

/// Minimum manufacturer data length for an iBeacon record:
/// 4 (prefix) + 16 (proximity UUID) + 2 (major) + 2 (minor) + 1 (measured power).
pub const IBEACON_MIN_LEN: usize = 25;

/// Active scan duration in the foreground (ms).
pub const FOREGROUND_SCAN_MS: u64 = 1100;

/// Idle duration between foreground scans (ms). Zero means scan back to back.
pub const FOREGROUND_BETWEEN_SCAN_MS: u64 = 0;

/// Active scan duration in the background (ms).
pub const BACKGROUND_SCAN_MS: u64 = 10_000;

/// Idle duration between background scans (ms).
pub const BACKGROUND_BETWEEN_SCAN_MS: u64 = 5 * 60 * 1000;

/// Quiet interval after which an unseen beacon's region is declared exited (ms).
pub const EXIT_PERIOD_MS: u64 = 10_000;

/// Bounded queue depth in front of the decode workers. Events beyond this
/// are dropped rather than blocking the scan loop.
pub const QUEUE_DEPTH: usize = 64;

/// Client identity used when the embedder does not set one.
pub const CLIENT_ID: &str = "beaconhound";
