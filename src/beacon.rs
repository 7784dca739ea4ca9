/// Beacon classification: raw advertisement → beacon kind + decoded fields.
///
/// Advertisement data is a sequence of AD structures: [length] [type] [data...].
/// The classifier only looks at the manufacturer-specific record (type 0xFF),
/// whose data starts with the 2-byte company ID (little-endian).
///
/// iBeacon layout of the manufacturer data:
///   0..4   4C 00 02 15 (Apple, type 0x02, length 0x15)
///   4..20  proximity UUID
///   20..22 major (big-endian)
///   22..24 minor (big-endian)
///   24     measured power at 1 m (signed dBm)
///
/// All functions here are pure; an unrecognized payload is a normal outcome,
/// not an error.
use core::fmt::Write;

use crate::defaults::{IBEACON_MIN_LEN, IBEACON_PREFIX};
use crate::protocol::MacString;

/// AD type of the manufacturer-specific data record
pub const AD_TYPE_MANUFACTURER: u8 = 0xFF;

/// One observed advertisement, as delivered by the scan-cycle controller.
#[derive(Debug, Clone)]
pub struct RawScanEvent {
    pub mac: [u8; 6],
    pub rssi: i8,
    /// Raw advertisement data (AD structures)
    pub payload: Vec<u8>,
    /// Wall-clock milliseconds when the advertisement was received
    pub timestamp: u64,
}

/// Beacon classification result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeaconKind {
    NotABeacon,
    IBeacon,
}

/// Fields decoded from an iBeacon record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IBeaconFields {
    pub proximity_uuid: [u8; 16],
    pub major: u16,
    pub minor: u16,
    /// Calibrated RSSI at 1 m (dBm)
    pub tx_power: i8,
}

impl IBeaconFields {
    /// Proximity UUID in canonical 8-4-4-4-12 lowercase form.
    pub fn uuid_string(&self) -> heapless::String<36> {
        let mut out = heapless::String::new();
        for (i, b) in self.proximity_uuid.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                let _ = out.push('-');
            }
            let _ = write!(out, "{:02x}", b);
        }
        out
    }
}

/// A classified beacon sighting. Transient: discarded after dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedBeacon {
    /// Advertiser address, "AA:BB:CC:DD:EE:FF"
    pub address: MacString,
    pub kind: BeaconKind,
    pub fields: Option<IBeaconFields>,
    pub rssi: i8,
    pub timestamp: u64,
    /// Estimated distance in metres, when it can be computed
    pub distance: Option<f64>,
}

/// Classify manufacturer-specific data.
///
/// iBeacon iff at least [`IBEACON_MIN_LEN`] bytes long and starting with
/// [`IBEACON_PREFIX`]. Everything else, including empty data, is `NotABeacon`.
pub fn classify(manufacturer_data: &[u8]) -> BeaconKind {
    if manufacturer_data.len() >= IBEACON_MIN_LEN && manufacturer_data.starts_with(&IBEACON_PREFIX)
    {
        BeaconKind::IBeacon
    } else {
        BeaconKind::NotABeacon
    }
}

/// Classify a raw advertisement by its manufacturer-specific record.
pub fn classify_advertisement(ad_data: &[u8]) -> BeaconKind {
    manufacturer_data(ad_data).map_or(BeaconKind::NotABeacon, classify)
}

/// Find the manufacturer-specific record in advertisement data.
///
/// Walks the AD structures and stops at the first malformed one (zero
/// length or running past the end of the buffer).
pub fn manufacturer_data(ad_data: &[u8]) -> Option<&[u8]> {
    let mut pos = 0;
    while pos < ad_data.len() {
        let len = ad_data[pos] as usize;
        if len == 0 || pos + 1 + len > ad_data.len() {
            break;
        }

        if ad_data[pos + 1] == AD_TYPE_MANUFACTURER {
            return Some(&ad_data[pos + 2..pos + 1 + len]);
        }

        pos += 1 + len;
    }
    None
}

/// Decode iBeacon fields from manufacturer data, if it classifies as one.
pub fn decode_ibeacon(manufacturer_data: &[u8]) -> Option<IBeaconFields> {
    if classify(manufacturer_data) != BeaconKind::IBeacon {
        return None;
    }
    let d = manufacturer_data;
    let proximity_uuid: [u8; 16] = d[4..20].try_into().ok()?;
    Some(IBeaconFields {
        proximity_uuid,
        major: u16::from_be_bytes([d[20], d[21]]),
        minor: u16::from_be_bytes([d[22], d[23]]),
        tx_power: d[24] as i8,
    })
}

/// Classify and decode one scan event.
///
/// Returns `None` for anything that is not a recognized beacon.
pub fn decode(event: &RawScanEvent) -> Option<ClassifiedBeacon> {
    let fields = decode_ibeacon(manufacturer_data(&event.payload)?)?;
    let mut address = MacString::new();
    format_mac(&event.mac, &mut address);
    Some(ClassifiedBeacon {
        address,
        kind: BeaconKind::IBeacon,
        fields: Some(fields),
        rssi: event.rssi,
        timestamp: event.timestamp,
        distance: estimate_distance(fields.tx_power, event.rssi),
    })
}

/// Estimate distance (metres) from measured power and received RSSI.
///
/// Uses the log-distance fit common to iBeacon SDKs. `None` when either
/// value is zero, i.e. unknown.
pub fn estimate_distance(tx_power: i8, rssi: i8) -> Option<f64> {
    if rssi == 0 || tx_power == 0 {
        return None;
    }
    let ratio = f64::from(rssi) / f64::from(tx_power);
    if ratio < 1.0 {
        Some(ratio.powi(10))
    } else {
        Some(0.89976 * ratio.powf(7.7095) + 0.111)
    }
}

/// Format a 6-byte MAC address into "AA:BB:CC:DD:EE:FF" string
pub fn format_mac(mac: &[u8; 6], buf: &mut MacString) {
    let _ = write!(
        buf,
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    );
}
