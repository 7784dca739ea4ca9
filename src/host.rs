/// Host session: owns the registrations, the detection pipeline and the
/// shared scan cycle.
///
/// Commands from any number of clients are applied in arrival order. The
/// scan-cycle controller is started by the first start command and stopped
/// according to the configured [`StopPolicy`]. Notifications are routed to
/// clients by client id through registered [`EventRoute`]s.
use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::comm::{self, LineReader, WireError};
use crate::config::{HostConfig, StopPolicy};
use crate::pipeline::{
    DetectionPipeline, EventSink, Registration, Registrations, Registry, ScanCallback,
};
use crate::protocol::{ClientId, Command, HostEvent, Interest, ScanPeriods, ScanRequest};

/// Drives the physical scan loop.
///
/// Implementations feed results into the [`ScanCallback`] obtained from
/// [`HostSession::scan_callback`]. New periods take effect at the next cycle
/// boundary; [`crate::cycle::ScanSchedule`] does that bookkeeping.
pub trait ScanCycleController: Send {
    fn start(&mut self);
    fn stop(&mut self);
    fn set_scan_periods(&mut self, periods: ScanPeriods, background: bool);
}

/// Delivers notifications to one connected client.
pub trait EventRoute: Send + Sync {
    fn deliver(&self, event: HostEvent);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Routing ────────────────────────────────────────────────────────────

#[derive(Default)]
struct Routes {
    table: Mutex<HashMap<ClientId, Arc<dyn EventRoute>>>,
}

impl EventSink for Routes {
    fn deliver(&self, client: &str, event: HostEvent) {
        let route = lock(&self.table).get(client).map(Arc::clone);
        match route {
            Some(route) => route.deliver(event),
            None => log::debug!("No route to client {}, notification dropped", client),
        }
    }
}

// ── Session ────────────────────────────────────────────────────────────

struct ScanState {
    controller: Box<dyn ScanCycleController>,
    scanning: bool,
}

pub struct HostSession {
    stop_policy: StopPolicy,
    registry: Arc<Registry>,
    routes: Arc<Routes>,
    pipeline: Arc<DetectionPipeline>,
    scan: Mutex<ScanState>,
}

impl HostSession {
    /// Build a session and spawn its decode workers.
    pub fn new(config: &HostConfig, controller: Box<dyn ScanCycleController>) -> io::Result<Self> {
        let registry = Arc::new(Registry::new());
        let routes = Arc::new(Routes::default());
        let sink: Arc<dyn EventSink> = routes.clone();
        let pipeline = Arc::new(DetectionPipeline::new(config, Arc::clone(&registry), sink)?);
        log::info!(
            "Host session ready: {} decode workers, exit period {} ms",
            pipeline.workers(),
            config.exit_period_ms
        );
        Ok(Self {
            stop_policy: config.stop_policy,
            registry,
            routes,
            pipeline,
            scan: Mutex::new(ScanState {
                controller,
                scanning: false,
            }),
        })
    }

    /// Callback the scan-cycle controller reports into.
    pub fn scan_callback(&self) -> Arc<dyn ScanCallback> {
        self.pipeline.clone()
    }

    pub fn pipeline(&self) -> &DetectionPipeline {
        &self.pipeline
    }

    pub fn is_scanning(&self) -> bool {
        lock(&self.scan).scanning
    }

    pub fn registrations(&self) -> Registrations {
        self.registry.snapshot()
    }

    // ── Routes ──────────────────────────────────────────────────────

    /// Deliver notifications for `client` to `route`, replacing any
    /// previous route for that id.
    pub fn register_route(&self, client: ClientId, route: Arc<dyn EventRoute>) {
        log::debug!("Route registered for {}", client);
        lock(&self.routes.table).insert(client, route);
    }

    pub fn unregister_route(&self, client: &str) {
        if lock(&self.routes.table).remove(client).is_some() {
            log::debug!("Route removed for {}", client);
        }
    }

    // ── Commands ────────────────────────────────────────────────────

    pub fn handle(&self, command: Command) {
        log::debug!("Handling {}", command.name());
        match command {
            Command::StartRanging(req) => self.start(Interest::Ranging, req),
            Command::StartMonitoring(req) => self.start(Interest::Monitoring, req),
            Command::StopRanging(req) => self.stop(Interest::Ranging, req),
            Command::StopMonitoring(req) => self.stop(Interest::Monitoring, req),
            Command::SetScanPeriods {
                periods,
                background,
            } => self.apply_scan_periods(periods, background),
        }
    }

    /// Parse and handle one NDJSON command line.
    ///
    /// Unrecognized commands are logged and ignored; other wire errors are
    /// returned.
    pub fn handle_line(&self, line: &[u8]) -> Result<(), WireError> {
        match comm::parse_command(line) {
            Ok(command) => {
                self.handle(command);
                Ok(())
            }
            Err(WireError::UnknownCommand(cmd)) => {
                log::warn!("Ignoring unrecognized command '{}'", cmd);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Handle NDJSON commands from a byte stream until end of input.
    ///
    /// Lines that fail to parse are logged and skipped.
    pub fn serve<R: Read>(&self, mut reader: R) -> io::Result<()> {
        let mut lines = LineReader::new();
        let mut buf = [0u8; 256];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            for &byte in &buf[..n] {
                if let Some(line) = lines.feed(byte) {
                    if let Err(e) = self.handle_line(line) {
                        log::warn!("Dropping command line: {}", e);
                    }
                }
            }
        }
    }

    // Registry changes and the start/stop decision share the scan lock.
    fn start(&self, interest: Interest, req: ScanRequest) {
        let registration = Registration {
            client: req.client,
            region: req.region,
        };
        let mut scan = lock(&self.scan);
        if self.registry.add(interest, registration.clone()) {
            log::info!(
                "{} started {:?} for {}",
                registration.client,
                interest,
                registration.region
            );
        } else {
            log::debug!(
                "{} already has {:?} for {}",
                registration.client,
                interest,
                registration.region
            );
        }

        scan.controller.set_scan_periods(req.periods, req.background);
        if !scan.scanning {
            log::info!("Starting scan cycle");
            scan.controller.start();
            scan.scanning = true;
        }
    }

    fn stop(&self, interest: Interest, req: ScanRequest) {
        let registration = Registration {
            client: req.client,
            region: req.region,
        };
        let mut scan = lock(&self.scan);
        if self.registry.remove(interest, &registration) {
            log::info!(
                "{} stopped {:?} for {}",
                registration.client,
                interest,
                registration.region
            );
        } else {
            log::debug!(
                "{} had no {:?} for {}",
                registration.client,
                interest,
                registration.region
            );
        }
        self.pipeline.forget(&registration);

        scan.controller.set_scan_periods(req.periods, req.background);
        let stop = match self.stop_policy {
            StopPolicy::Immediate => true,
            StopPolicy::WhenIdle => self.registry.is_empty(),
        };
        if stop && scan.scanning {
            log::info!("Stopping scan cycle");
            scan.controller.stop();
            scan.scanning = false;
        }
    }

    fn apply_scan_periods(&self, periods: ScanPeriods, background: bool) {
        log::debug!(
            "Scan periods {}/{} ms requested (background: {})",
            periods.scan_ms,
            periods.between_scan_ms,
            background
        );
        lock(&self.scan)
            .controller
            .set_scan_periods(periods, background);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::tests::ibeacon_advertisement;
    use crate::beacon::RawScanEvent;
    use crate::region::Region;
    use std::thread;

    #[derive(Debug, Clone, PartialEq)]
    enum ControllerCall {
        Start,
        Stop,
        Periods(ScanPeriods, bool),
    }

    /// Records controller calls into a shared log.
    struct RecordingController(Arc<Mutex<Vec<ControllerCall>>>);

    impl ScanCycleController for RecordingController {
        fn start(&mut self) {
            self.0.lock().unwrap().push(ControllerCall::Start);
        }
        fn stop(&mut self) {
            self.0.lock().unwrap().push(ControllerCall::Stop);
        }
        fn set_scan_periods(&mut self, periods: ScanPeriods, background: bool) {
            self.0
                .lock()
                .unwrap()
                .push(ControllerCall::Periods(periods, background));
        }
    }

    #[derive(Default)]
    struct RecordingRoute {
        events: Mutex<Vec<HostEvent>>,
    }

    impl EventRoute for RecordingRoute {
        fn deliver(&self, event: HostEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn host(policy: StopPolicy) -> (HostSession, Arc<Mutex<Vec<ControllerCall>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let config = HostConfig {
            workers: 1,
            stop_policy: policy,
            ..HostConfig::new()
        };
        let host = HostSession::new(&config, Box::new(RecordingController(calls.clone()))).unwrap();
        (host, calls)
    }

    fn request(client: &str, id: &str) -> ScanRequest {
        ScanRequest {
            region: Region::new(id).unwrap(),
            client: ClientId::try_from(client).unwrap(),
            periods: ScanPeriods::new(1100, 0),
            background: false,
        }
    }

    fn starts_and_stops(calls: &Mutex<Vec<ControllerCall>>) -> Vec<ControllerCall> {
        calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| !matches!(c, ControllerCall::Periods(..)))
            .cloned()
            .collect()
    }

    #[test]
    fn first_start_starts_scanning_once() {
        let (host, calls) = host(StopPolicy::WhenIdle);
        assert!(!host.is_scanning());
        host.handle(Command::StartRanging(request("app", "r1")));
        host.handle(Command::StartMonitoring(request("app", "m1")));
        assert!(host.is_scanning());
        assert_eq!(starts_and_stops(&calls), vec![ControllerCall::Start]);
        let regs = host.registrations();
        assert_eq!(regs.ranged.len(), 1);
        assert_eq!(regs.monitored.len(), 1);
    }

    #[test]
    fn start_applies_carried_periods() {
        let (host, calls) = host(StopPolicy::WhenIdle);
        let mut req = request("app", "r1");
        req.periods = ScanPeriods::new(10_000, 300_000);
        req.background = true;
        host.handle(Command::StartRanging(req));
        assert_eq!(
            calls.lock().unwrap()[0],
            ControllerCall::Periods(ScanPeriods::new(10_000, 300_000), true)
        );
    }

    #[test]
    fn when_idle_keeps_scanning_while_registrations_remain() {
        let (host, calls) = host(StopPolicy::WhenIdle);
        host.handle(Command::StartRanging(request("app", "r1")));
        host.handle(Command::StartMonitoring(request("app", "m1")));

        host.handle(Command::StopRanging(request("app", "r1")));
        assert!(host.is_scanning());

        host.handle(Command::StopMonitoring(request("app", "m1")));
        assert!(!host.is_scanning());
        assert_eq!(
            starts_and_stops(&calls),
            vec![ControllerCall::Start, ControllerCall::Stop]
        );
    }

    #[test]
    fn immediate_policy_stops_on_any_stop() {
        let (host, calls) = host(StopPolicy::Immediate);
        host.handle(Command::StartRanging(request("app", "r1")));
        host.handle(Command::StartMonitoring(request("app", "m1")));
        host.handle(Command::StopRanging(request("app", "r1")));
        assert!(!host.is_scanning());
        assert_eq!(host.registrations().monitored.len(), 1);

        // The next start resumes the cycle
        host.handle(Command::StartRanging(request("app", "r2")));
        assert_eq!(
            starts_and_stops(&calls),
            vec![ControllerCall::Start, ControllerCall::Stop, ControllerCall::Start]
        );
    }

    #[test]
    fn registrations_are_per_client() {
        let (host, _) = host(StopPolicy::WhenIdle);
        host.handle(Command::StartRanging(request("one", "r1")));
        host.handle(Command::StartRanging(request("two", "r1")));
        host.handle(Command::StopRanging(request("one", "r1")));
        let regs = host.registrations();
        assert_eq!(regs.ranged.len(), 1);
        assert_eq!(regs.ranged[0].client, "two");
        assert!(host.is_scanning());
    }

    #[test]
    fn set_scan_periods_reaches_controller() {
        let (host, calls) = host(StopPolicy::WhenIdle);
        host.handle(Command::SetScanPeriods {
            periods: ScanPeriods::new(10_000, 300_000),
            background: true,
        });
        assert_eq!(
            *calls.lock().unwrap(),
            vec![ControllerCall::Periods(ScanPeriods::new(10_000, 300_000), true)]
        );
        assert!(!host.is_scanning());
    }

    #[test]
    fn unknown_command_line_is_ignored() {
        let (host, calls) = host(StopPolicy::WhenIdle);
        assert_eq!(host.handle_line(br#"{"cmd":"self_destruct"}"#), Ok(()));
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(host.handle_line(b"not json"), Err(WireError::Malformed));
    }

    #[test]
    fn serve_reads_ndjson_stream() {
        let (host, _) = host(StopPolicy::WhenIdle);
        let input: &[u8] = b"{\"cmd\":\"start_ranging\",\"id\":\"r1\",\"client\":\"app\",\"scan_ms\":1100,\"between_ms\":0,\"bg\":false}\n\
garbage\n\
{\"cmd\":\"start_monitoring\",\"id\":\"m1\",\"mac\":\"00:11:22:33:44:55\",\"client\":\"app\",\"scan_ms\":1100,\"between_ms\":0,\"bg\":false}\n";
        host.serve(input).unwrap();
        let regs = host.registrations();
        assert_eq!(regs.ranged.len(), 1);
        assert_eq!(regs.monitored.len(), 1);
        assert_eq!(
            regs.monitored[0].region.hardware_address(),
            Some("00:11:22:33:44:55")
        );
    }

    #[test]
    fn notifications_follow_routes() {
        let (host, _) = host(StopPolicy::WhenIdle);
        let route = Arc::new(RecordingRoute::default());
        host.register_route(ClientId::try_from("app").unwrap(), route.clone());
        host.handle(Command::StartMonitoring(request("app", "m1")));

        let event = RawScanEvent {
            mac: [0x00, 0x11, 0x22, 0x33, 0x44, 0x55],
            rssi: -60,
            payload: ibeacon_advertisement(1, 2),
            timestamp: 1_000,
        };
        host.pipeline().process(&event);
        assert_eq!(route.events.lock().unwrap().len(), 1);

        host.unregister_route("app");
        host.pipeline().end_cycle(1_000_000);
        // Exit fired but had nowhere to go
        assert_eq!(route.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn stop_forgets_monitoring_state() {
        let (host, _) = host(StopPolicy::WhenIdle);
        let route = Arc::new(RecordingRoute::default());
        host.register_route(ClientId::try_from("app").unwrap(), route.clone());
        host.handle(Command::StartMonitoring(request("app", "m1")));
        host.pipeline().process(&RawScanEvent {
            mac: [1, 2, 3, 4, 5, 6],
            rssi: -60,
            payload: ibeacon_advertisement(1, 2),
            timestamp: 0,
        });
        host.handle(Command::StopMonitoring(request("app", "m1")));
        host.pipeline().end_cycle(1_000_000);
        let events = route.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], HostEvent::RegionEnter(_)));
    }

    #[test]
    fn concurrent_clients_never_stop_an_active_registration() {
        let (host, calls) = host(StopPolicy::WhenIdle);
        let host = Arc::new(host);
        let clients: Vec<_> = ["one", "two"]
            .into_iter()
            .map(|client| {
                let host = Arc::clone(&host);
                thread::spawn(move || {
                    for _ in 0..500 {
                        host.handle(Command::StartRanging(request(client, "r")));
                        // Own registration is live until our stop below
                        assert!(host.is_scanning(), "{client} registered but not scanning");
                        host.handle(Command::StopRanging(request(client, "r")));
                    }
                })
            })
            .collect();
        for client in clients {
            client.join().unwrap();
        }

        assert!(host.registrations().is_empty());
        assert!(!host.is_scanning());
        let edges = starts_and_stops(&calls);
        assert!(edges.windows(2).all(|w| w[0] != w[1]), "start/stop alternate");
        assert_eq!(edges.last(), Some(&ControllerCall::Stop));
    }

    #[test]
    fn route_lookup_by_client_id() {
        let (host, _) = host(StopPolicy::WhenIdle);
        let first = Arc::new(RecordingRoute::default());
        let second = Arc::new(RecordingRoute::default());
        let other = Arc::new(RecordingRoute::default());
        host.register_route(ClientId::try_from("app").unwrap(), first.clone());
        host.register_route(ClientId::try_from("other").unwrap(), other.clone());
        host.register_route(ClientId::try_from("app").unwrap(), second.clone());

        let region = Region::new("m1").unwrap();
        host.routes.deliver("app", HostEvent::RegionEnter(region.clone()));
        assert!(first.events.lock().unwrap().is_empty(), "replaced route");
        assert_eq!(second.events.lock().unwrap().len(), 1);
        assert!(other.events.lock().unwrap().is_empty());

        host.unregister_route("app");
        host.routes.deliver("app", HostEvent::RegionExit(region.clone()));
        host.routes.deliver("nobody", HostEvent::RegionExit(region));
        assert_eq!(second.events.lock().unwrap().len(), 1);
        assert!(other.events.lock().unwrap().is_empty());
    }
}
