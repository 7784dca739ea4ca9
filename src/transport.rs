/// In-process transport between client sessions and a host session.
///
/// Each connection gets its own FIFO: commands are encoded as NDJSON lines,
/// pushed through an `mpsc` channel and handled by a dedicated host thread
/// in send order. Notifications travel back through a route that holds the
/// client session weakly.
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};

use crate::client::{ClientSession, HostConnector};
use crate::comm::{self, ChannelSendError, CommandChannel};
use crate::host::{EventRoute, HostSession};
use crate::protocol::{Command, HostEvent, MsgBuffer};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Client end of one local connection.
pub struct LocalChannel {
    tx: Mutex<Option<Sender<MsgBuffer>>>,
}

impl LocalChannel {
    fn close(&self) {
        lock(&self.tx).take();
    }
}

impl CommandChannel for LocalChannel {
    fn send(&self, command: &Command) -> Result<(), ChannelSendError> {
        let line = comm::encode_command(command)?;
        let tx = lock(&self.tx);
        let tx = tx.as_ref().ok_or(ChannelSendError::Closed)?;
        tx.send(line).map_err(|_| ChannelSendError::Closed)
    }
}

struct SessionRoute(Weak<ClientSession>);

impl EventRoute for SessionRoute {
    fn deliver(&self, event: HostEvent) {
        match self.0.upgrade() {
            Some(session) => session.deliver(event),
            None => log::debug!("Client session gone, notification dropped"),
        }
    }
}

struct LocalLink {
    channel: Arc<LocalChannel>,
    session: Weak<ClientSession>,
    worker: JoinHandle<()>,
}

/// Connects client sessions to a host living in the same process.
pub struct LocalConnector {
    host: Arc<HostSession>,
    links: Mutex<HashMap<String, LocalLink>>,
}

impl LocalConnector {
    pub fn new(host: Arc<HostSession>) -> Self {
        Self {
            host,
            links: Mutex::new(HashMap::new()),
        }
    }

    pub fn host(&self) -> &Arc<HostSession> {
        &self.host
    }

    /// Number of open connections.
    pub fn connections(&self) -> usize {
        lock(&self.links).len()
    }

    /// Drop a connection from the host side, as if the host went away.
    ///
    /// The client is told through `on_disconnected` and keeps its regions.
    pub fn sever(&self, client_id: &str) {
        if let Some(session) = self.close(client_id).and_then(|s| s.upgrade()) {
            session.on_disconnected();
        }
    }

    /// Close the link for `client_id` and wait for its queued commands to
    /// be handled. Returns the session the link belonged to.
    fn close(&self, client_id: &str) -> Option<Weak<ClientSession>> {
        let link = lock(&self.links).remove(client_id)?;
        link.channel.close();
        if link.worker.join().is_err() {
            log::error!("Host link thread for {} panicked", client_id);
        }
        self.host.unregister_route(client_id);
        Some(link.session)
    }

    fn serve(host: Arc<HostSession>, rx: Receiver<MsgBuffer>) {
        for line in rx {
            if let Err(e) = host.handle_line(&line) {
                log::warn!("Dropping command line: {}", e);
            }
        }
    }
}

impl HostConnector for LocalConnector {
    fn request_connection(&self, session: Weak<ClientSession>) -> Result<(), ChannelSendError> {
        let client = session.upgrade().ok_or(ChannelSendError::Closed)?;
        let client_id = client.client_id().to_string();

        // A reconnect replaces any previous link for the same id
        self.close(&client_id);

        let (tx, rx) = mpsc::channel();
        let host = Arc::clone(&self.host);
        let worker = thread::Builder::new()
            .name(format!("host-link-{client_id}"))
            .spawn(move || Self::serve(host, rx))
            .map_err(|e| {
                log::error!("Cannot spawn host link thread: {}", e);
                ChannelSendError::Closed
            })?;

        self.host.register_route(
            client.config().client_id.clone(),
            Arc::new(SessionRoute(Weak::clone(&session))),
        );

        let channel = Arc::new(LocalChannel {
            tx: Mutex::new(Some(tx)),
        });
        lock(&self.links).insert(
            client_id,
            LocalLink {
                channel: Arc::clone(&channel),
                session,
                worker,
            },
        );

        client.on_connected(channel);
        Ok(())
    }

    fn disconnect(&self, client_id: &str) {
        if self.close(client_id).is_some() {
            log::debug!("Closed local link for {}", client_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ConnectionState;
    use crate::config::{HostConfig, SessionConfig};
    use crate::host::ScanCycleController;
    use crate::protocol::{ClientId, ScanPeriods};
    use crate::region::Region;

    struct NullController;

    impl ScanCycleController for NullController {
        fn start(&mut self) {}
        fn stop(&mut self) {}
        fn set_scan_periods(&mut self, _periods: ScanPeriods, _background: bool) {}
    }

    fn connector() -> Arc<LocalConnector> {
        let config = HostConfig {
            workers: 1,
            ..HostConfig::new()
        };
        let host = HostSession::new(&config, Box::new(NullController)).unwrap();
        Arc::new(LocalConnector::new(Arc::new(host)))
    }

    fn session(connector: &Arc<LocalConnector>) -> Arc<ClientSession> {
        let config = SessionConfig::new(ClientId::try_from("app").unwrap());
        ClientSession::new(config, connector.clone())
    }

    #[test]
    fn start_connects_and_reaches_host() {
        let connector = connector();
        let session = session(&connector);
        session.start_ranging(&Region::new("r1").unwrap()).unwrap();
        assert_eq!(session.connection_state(), ConnectionState::Connected);
        assert_eq!(connector.connections(), 1);

        // Closing the link drains the queue
        connector.disconnect("app");
        assert_eq!(connector.host().registrations().ranged.len(), 1);
        assert!(connector.host().is_scanning());
    }

    #[test]
    fn closed_channel_rejects_sends() {
        let (tx, _rx) = mpsc::channel();
        let channel = LocalChannel {
            tx: Mutex::new(Some(tx)),
        };
        let command = Command::SetScanPeriods {
            periods: ScanPeriods::new(1, 2),
            background: false,
        };
        assert_eq!(channel.send(&command), Ok(()));
        channel.close();
        assert_eq!(channel.send(&command), Err(ChannelSendError::Closed));
    }

    #[test]
    fn sever_notifies_client() {
        let connector = connector();
        let session = session(&connector);
        session.start_monitoring(&Region::new("m1").unwrap()).unwrap();
        connector.sever("app");
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert_eq!(connector.connections(), 0);
        assert_eq!(session.active_monitored_regions().len(), 1);
    }

    #[test]
    fn release_stops_regions_on_host() {
        let connector = connector();
        let session = session(&connector);
        session.start_ranging(&Region::new("r1").unwrap()).unwrap();
        session.release();
        assert_eq!(connector.connections(), 0);
        assert!(connector.host().registrations().is_empty());
        assert!(!connector.host().is_scanning());
    }
}
