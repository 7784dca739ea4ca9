/// Regions: named filters describing which beacons a client cares about.
///
/// A region is identified solely by its unique id. The optional hardware
/// address narrows it to a single advertiser; without one, every beacon
/// matches. No other filtering happens here; identifier filtering, if
/// wanted, is layered on top by the caller.
use core::fmt;
use core::hash::{Hash, Hasher};

use thiserror::Error;

use crate::beacon::ClassifiedBeacon;
use crate::protocol::{MacString, RegionId};

/// Maximum length of a region unique id, in bytes.
pub const MAX_REGION_ID_LEN: usize = 64;

/// Errors raised while constructing a [`Region`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegionError {
    #[error("Region unique id may not be empty")]
    EmptyId,
    #[error("Region unique id longer than {} bytes", MAX_REGION_ID_LEN)]
    IdTooLong,
    #[error("Invalid mac address: '{0}'. Must be 6 hex bytes separated by colons")]
    InvalidAddress(String),
}

/// A region of interest. Immutable once built.
#[derive(Debug, Clone)]
pub struct Region {
    unique_id: RegionId,
    hardware_address: Option<MacString>,
}

impl Region {
    /// Region matching every beacon.
    pub fn new(unique_id: &str) -> Result<Self, RegionError> {
        Self::build(unique_id, None)
    }

    /// Region restricted to the advertiser with the given `AA:BB:CC:DD:EE:FF` address.
    pub fn with_address(unique_id: &str, address: &str) -> Result<Self, RegionError> {
        Self::build(unique_id, Some(address))
    }

    pub(crate) fn build(unique_id: &str, address: Option<&str>) -> Result<Self, RegionError> {
        if unique_id.is_empty() {
            return Err(RegionError::EmptyId);
        }
        let mut id = RegionId::new();
        id.push_str(unique_id).map_err(|_| RegionError::IdTooLong)?;

        let hardware_address = match address {
            Some(mac) => {
                if !is_valid_mac(mac) {
                    return Err(RegionError::InvalidAddress(mac.into()));
                }
                let mut buf = MacString::new();
                // 17 ASCII bytes always fit after validation
                let _ = buf.push_str(mac);
                Some(buf)
            }
            None => None,
        };

        Ok(Self {
            unique_id: id,
            hardware_address,
        })
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn hardware_address(&self) -> Option<&str> {
        self.hardware_address.as_deref()
    }

    /// True if the beacon belongs to this region.
    pub fn matches(&self, beacon: &ClassifiedBeacon) -> bool {
        self.matches_address(&beacon.address)
    }

    /// True if no address filter is set, or the filter equals `address`
    /// ignoring ASCII case.
    pub fn matches_address(&self, address: &str) -> bool {
        match &self.hardware_address {
            Some(filter) => filter.eq_ignore_ascii_case(address),
            None => true,
        }
    }
}

impl PartialEq for Region {
    fn eq(&self, other: &Self) -> bool {
        self.unique_id == other.unique_id
    }
}

impl Eq for Region {}

impl Hash for Region {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.unique_id.as_str().hash(state);
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.hardware_address {
            Some(mac) => write!(f, "{} [{}]", self.unique_id, mac),
            None => write!(f, "{}", self.unique_id),
        }
    }
}

/// Check `AA:BB:CC:DD:EE:FF` form: six hex pairs separated by colons.
pub fn is_valid_mac(mac: &str) -> bool {
    let bytes = mac.as_bytes();
    if bytes.len() != 17 {
        return false;
    }
    bytes.iter().enumerate().all(|(i, &b)| {
        if i % 3 == 2 {
            b == b':'
        } else {
            b.is_ascii_hexdigit()
        }
    })
}
