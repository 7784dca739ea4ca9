//! BeaconHound library: client/host coordination for BLE beacon ranging and
//! monitoring.
//!
//! A [`client::ClientSession`] declares interest in [`region::Region`]s and
//! receives range updates and region entry/exit notifications. A
//! [`host::HostSession`] owns the scan cycle and the detection pipeline that
//! turns raw advertisements into those notifications. The two talk through a
//! [`comm::CommandChannel`]; [`transport`] provides an in-process one and
//! [`comm`] the NDJSON codec for byte transports.
//!
//! Radio access is not part of the library. Platform code implements
//! [`host::ScanCycleController`] and feeds advertisements to
//! [`pipeline::ScanCallback`].
//!
//! Modules, bottom-up:
//! - `defaults`, `protocol`, `region`, `beacon`: constants, message types and
//!   the pure classifier/matcher.
//! - `comm`, `config`, `tracker`, `cycle`: codec, settings, entry/exit
//!   bookkeeping and scan duty-cycle schedule.
//! - `pipeline`, `host`, `client`, `transport`: the moving parts.

pub mod beacon;
pub mod client;
pub mod comm;
pub mod config;
pub mod cycle;
pub mod defaults;
pub mod host;
pub mod pipeline;
pub mod protocol;
pub mod region;
pub mod tracker;
pub mod transport;
