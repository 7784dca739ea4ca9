/// Client session: the state machine applications call into.
///
/// The session remembers which regions are ranged and monitored, owns the
/// connection to the host and replays every declared region whenever a
/// connection comes up.
///
/// Connection contract:
/// - `start_*` connects lazily. While disconnected the region is recorded,
///   a connection is requested and the command is sent later by replay.
/// - `stop_*` never connects. Without a connection it fails with
///   [`SessionError::NotConnected`] and leaves the region lists alone.
///
/// Client code may rely on this asymmetry.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use thiserror::Error;

use crate::beacon::ClassifiedBeacon;
use crate::comm::{ChannelSendError, CommandChannel};
use crate::config::{DuplicatePolicy, ScanPeriodConfig, SessionConfig};
use crate::protocol::{Command, HostEvent, Interest, ScanRequest};
use crate::region::Region;

/// Errors surfaced to callers of [`ClientSession`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("The session is not connected to the host")]
    NotConnected,
    #[error(transparent)]
    Channel(#[from] ChannelSendError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Receives the beacons seen in a ranged region, about once per scan cycle.
pub trait RangeNotifier: Send + Sync {
    fn on_range_update(&self, beacons: &[ClassifiedBeacon], region: &Region);
}

/// Receives entry/exit transitions of monitored regions.
pub trait MonitorNotifier: Send + Sync {
    fn on_region_enter(&self, region: &Region);
    fn on_region_exit(&self, region: &Region);
}

/// Establishes connections to the host on behalf of a session.
///
/// `request_connection` only starts the attempt. The transport reports the
/// outcome through [`ClientSession::on_connected`] and
/// [`ClientSession::on_disconnected`], possibly before the call returns.
pub trait HostConnector: Send + Sync {
    fn request_connection(&self, session: Weak<ClientSession>) -> Result<(), ChannelSendError>;
    fn disconnect(&self, client_id: &str);
}

struct Link {
    state: ConnectionState,
    channel: Option<Arc<dyn CommandChannel>>,
    background: bool,
    periods: ScanPeriodConfig,
}

impl Link {
    fn request(&self, region: &Region, config: &SessionConfig) -> ScanRequest {
        ScanRequest {
            region: region.clone(),
            client: config.client_id.clone(),
            periods: self.periods.select(self.background),
            background: self.background,
        }
    }

    fn set_scan_periods(&self) -> Command {
        Command::SetScanPeriods {
            periods: self.periods.select(self.background),
            background: self.background,
        }
    }
}

#[derive(Default)]
struct Declared {
    ranged: Vec<Region>,
    monitored: Vec<Region>,
    range_notifier: Option<Arc<dyn RangeNotifier>>,
    monitor_notifier: Option<Arc<dyn MonitorNotifier>>,
}

impl Declared {
    fn list_mut(&mut self, interest: Interest) -> &mut Vec<Region> {
        match interest {
            Interest::Ranging => &mut self.ranged,
            Interest::Monitoring => &mut self.monitored,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A client's view of the scanning host.
///
/// Locks guard only mutation and snapshot copies; commands are sent and
/// notifiers are called with no lock held.
pub struct ClientSession {
    config: SessionConfig,
    connector: Arc<dyn HostConnector>,
    this: Weak<ClientSession>,
    link: Mutex<Link>,
    declared: Mutex<Declared>,
}

impl ClientSession {
    pub fn new(config: SessionConfig, connector: Arc<dyn HostConnector>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            link: Mutex::new(Link {
                state: ConnectionState::Disconnected,
                channel: None,
                background: false,
                periods: config.periods,
            }),
            declared: Mutex::new(Declared::default()),
            config,
            connector,
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    pub fn connection_state(&self) -> ConnectionState {
        lock(&self.link).state
    }

    pub fn is_background_mode(&self) -> bool {
        lock(&self.link).background
    }

    pub fn scan_period_config(&self) -> ScanPeriodConfig {
        lock(&self.link).periods
    }

    // ── Notifiers ───────────────────────────────────────────────────

    /// Install the ranging notifier, replacing any previous one.
    pub fn set_range_notifier(&self, notifier: Arc<dyn RangeNotifier>) {
        lock(&self.declared).range_notifier = Some(notifier);
    }

    /// Install the monitoring notifier, replacing any previous one.
    pub fn set_monitor_notifier(&self, notifier: Arc<dyn MonitorNotifier>) {
        lock(&self.declared).monitor_notifier = Some(notifier);
    }

    // ── Ranging / monitoring ────────────────────────────────────────

    pub fn start_ranging(&self, region: &Region) -> Result<(), SessionError> {
        self.start(Interest::Ranging, region)
    }

    pub fn stop_ranging(&self, region: &Region) -> Result<(), SessionError> {
        self.stop(Interest::Ranging, region)
    }

    pub fn start_monitoring(&self, region: &Region) -> Result<(), SessionError> {
        self.start(Interest::Monitoring, region)
    }

    pub fn stop_monitoring(&self, region: &Region) -> Result<(), SessionError> {
        self.stop(Interest::Monitoring, region)
    }

    pub fn active_ranged_regions(&self) -> Vec<Region> {
        lock(&self.declared).ranged.clone()
    }

    pub fn active_monitored_regions(&self) -> Vec<Region> {
        lock(&self.declared).monitored.clone()
    }

    fn start(&self, interest: Interest, region: &Region) -> Result<(), SessionError> {
        // Recorded under the link lock: replay and a direct send never both
        // see the new entry
        let send = self.connected_or_connect(|link| {
            self.record(interest, region);
            interest.start(link.request(region, &self.config))
        });

        match send {
            Some((channel, command)) => {
                log::debug!("Sending {} for {}", command.name(), region);
                channel.send(&command)?;
                Ok(())
            }
            // Sent by replay once connected
            None => Ok(()),
        }
    }

    fn record(&self, interest: Interest, region: &Region) {
        let mut declared = lock(&self.declared);
        let list = declared.list_mut(interest);
        if self.config.duplicates == DuplicatePolicy::Ignore && list.contains(region) {
            log::debug!("Region {} already active ({:?})", region, interest);
        } else {
            list.push(region.clone());
        }
    }

    fn stop(&self, interest: Interest, region: &Region) -> Result<(), SessionError> {
        let (channel, command) = {
            let link = lock(&self.link);
            match (&link.state, &link.channel) {
                (ConnectionState::Connected, Some(channel)) => (
                    Arc::clone(channel),
                    interest.stop(link.request(region, &self.config)),
                ),
                _ => return Err(SessionError::NotConnected),
            }
        };
        channel.send(&command)?;

        let mut declared = lock(&self.declared);
        let list = declared.list_mut(interest);
        if let Some(idx) = list.iter().position(|r| r.unique_id() == region.unique_id()) {
            list.remove(idx);
        }
        Ok(())
    }

    // ── Scan periods ────────────────────────────────────────────────

    /// Switch between foreground and background scan periods.
    ///
    /// No-op if the mode is unchanged. Failing to reach the host is logged,
    /// not returned.
    pub fn set_background_mode(&self, background: bool) {
        {
            let mut link = lock(&self.link);
            if link.background == background {
                return;
            }
            link.background = background;
        }
        if let Err(e) = self.update_scan_periods() {
            log::warn!("Cannot contact host to set scan periods: {}", e);
        }
    }

    /// Replace both period pairs and push the active one to the host.
    pub fn set_scan_period_config(&self, periods: ScanPeriodConfig) -> Result<(), SessionError> {
        lock(&self.link).periods = periods;
        self.update_scan_periods()
    }

    /// Send the active period pair to the host.
    ///
    /// Without a connection a connection is requested, the update is dropped
    /// and `NotConnected` is returned; the periods travel with the next
    /// replayed start command instead.
    pub fn update_scan_periods(&self) -> Result<(), SessionError> {
        match self.connected_or_connect(Link::set_scan_periods) {
            Some((channel, command)) => {
                let (periods, background) = command.scan_settings();
                log::debug!(
                    "Updating scan periods to {}/{} ms (background: {})",
                    periods.scan_ms,
                    periods.between_scan_ms,
                    background
                );
                channel.send(&command)?;
                Ok(())
            }
            None => Err(SessionError::NotConnected),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Stop everything and drop the connection.
    ///
    /// Stop commands are best-effort: the first failure ends the attempt and
    /// is logged. Region lists, channel and background mode are reset either
    /// way.
    pub fn release(&self) {
        let (ranged, monitored) = {
            let declared = lock(&self.declared);
            (declared.ranged.clone(), declared.monitored.clone())
        };
        if let Err(e) = self.stop_all(&ranged, &monitored) {
            log::error!("Cannot stop active regions: {}", e);
        }

        log::debug!("Releasing connection for {}", self.client_id());
        self.connector.disconnect(self.client_id());
        {
            let mut link = lock(&self.link);
            link.channel = None;
            link.state = ConnectionState::Disconnected;
            link.background = false;
        }
        let mut declared = lock(&self.declared);
        declared.ranged.clear();
        declared.monitored.clear();
    }

    fn stop_all(&self, ranged: &[Region], monitored: &[Region]) -> Result<(), SessionError> {
        for region in ranged {
            self.stop_ranging(region)?;
        }
        for region in monitored {
            self.stop_monitoring(region)?;
        }
        Ok(())
    }

    /// Transport callback: a connection to the host is up.
    ///
    /// Replays a start command for every ranged, then every monitored
    /// region, in list order. Each send is independent; failures are logged.
    pub fn on_connected(&self, channel: Arc<dyn CommandChannel>) {
        log::info!("{} connected to host", self.client_id());
        let replay = {
            let mut link = lock(&self.link);
            link.state = ConnectionState::Connected;
            link.channel = Some(Arc::clone(&channel));
            let declared = lock(&self.declared);
            let ranged = declared
                .ranged
                .iter()
                .map(|r| Interest::Ranging.start(link.request(r, &self.config)));
            let monitored = declared
                .monitored
                .iter()
                .map(|r| Interest::Monitoring.start(link.request(r, &self.config)));
            ranged.chain(monitored).collect::<Vec<_>>()
        };

        for command in &replay {
            if let Err(e) = channel.send(command) {
                let region = command.request().map(|r| r.region.unique_id()).unwrap_or("?");
                log::warn!("Replay of {} for {} failed: {}", command.name(), region, e);
            }
        }
    }

    /// Transport callback: the host went away. Declared regions are kept
    /// and replayed on the next connection.
    pub fn on_disconnected(&self) {
        log::warn!("{} lost connection to host", self.client_id());
        let mut link = lock(&self.link);
        link.channel = None;
        link.state = ConnectionState::Disconnected;
    }

    /// Transport callback: a notification from the host.
    pub fn deliver(&self, event: HostEvent) {
        match event {
            HostEvent::RangeUpdate { region, beacons } => {
                let notifier = lock(&self.declared).range_notifier.clone();
                if let Some(notifier) = notifier {
                    notifier.on_range_update(&beacons, &region);
                }
            }
            HostEvent::RegionEnter(region) => {
                let notifier = lock(&self.declared).monitor_notifier.clone();
                if let Some(notifier) = notifier {
                    notifier.on_region_enter(&region);
                }
            }
            HostEvent::RegionExit(region) => {
                let notifier = lock(&self.declared).monitor_notifier.clone();
                if let Some(notifier) = notifier {
                    notifier.on_region_exit(&region);
                }
            }
        }
    }

    /// Current channel and a command built from the link, or `None` after
    /// kicking off a connection if there is no channel yet.
    ///
    /// `build` runs under the link lock in every state.
    fn connected_or_connect<F>(&self, build: F) -> Option<(Arc<dyn CommandChannel>, Command)>
    where
        F: FnOnce(&Link) -> Command,
    {
        {
            let mut link = lock(&self.link);
            let command = build(&link);
            match link.state {
                ConnectionState::Connected => {
                    if let Some(channel) = &link.channel {
                        return Some((Arc::clone(channel), command));
                    }
                    link.state = ConnectionState::Connecting;
                }
                ConnectionState::Connecting => return None,
                ConnectionState::Disconnected => link.state = ConnectionState::Connecting,
            }
        }

        log::debug!("{} is not connected, requesting connection", self.client_id());
        if let Err(e) = self.connector.request_connection(self.this.clone()) {
            log::warn!("Connection request failed: {}", e);
            let mut link = lock(&self.link);
            if link.state == ConnectionState::Connecting {
                link.state = ConnectionState::Disconnected;
            }
        }
        None
    }
}
