/// Host-side detection pipeline.
///
/// Raw advertisements arrive from the scan-cycle controller one callback at a
/// time. Each is queued to a fixed pool of decode workers; a full queue drops
/// the event instead of stalling the scan loop. Workers classify the payload
/// and match recognized beacons against the current registrations:
///
/// - ranged matches are buffered and flushed as one range update per region
///   at the end of the scan cycle;
/// - monitored matches go through the detection tracker, which turns them
///   into region entries now and region exits after the exit period.
///
/// No ordering is kept between concurrently decoded events.
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::beacon::{self, ClassifiedBeacon, RawScanEvent};
use crate::config::HostConfig;
use crate::protocol::{ClientId, HostEvent, Interest};
use crate::region::Region;
use crate::tracker::{Detection, DetectionTracker, ExitPeriodTracker};

/// Receiver of raw scan results, implemented by the pipeline and driven by
/// the scan-cycle controller. Both entry points must return promptly.
pub trait ScanCallback: Send + Sync {
    /// One observed advertisement.
    fn on_event(&self, event: RawScanEvent);
    /// The active scan window closed.
    fn on_cycle_end(&self);
}

/// Where the pipeline sends notifications for a client.
pub trait EventSink: Send + Sync {
    fn deliver(&self, client: &str, event: HostEvent);
}

/// One client's interest in one region.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Registration {
    pub client: ClientId,
    pub region: Region,
}

/// Snapshot of the active registrations.
#[derive(Debug, Clone, Default)]
pub struct Registrations {
    pub ranged: Vec<Registration>,
    pub monitored: Vec<Registration>,
}

impl Registrations {
    fn list_mut(&mut self, interest: Interest) -> &mut Vec<Registration> {
        match interest {
            Interest::Ranging => &mut self.ranged,
            Interest::Monitoring => &mut self.monitored,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ranged.is_empty() && self.monitored.is_empty()
    }
}

/// Registrations shared between the host's command handling and the workers.
#[derive(Debug, Default)]
pub struct Registry {
    inner: Mutex<Registrations>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a registration. Returns false if it was already present.
    pub fn add(&self, interest: Interest, registration: Registration) -> bool {
        let mut regs = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let list = regs.list_mut(interest);
        if list.contains(&registration) {
            return false;
        }
        list.push(registration);
        true
    }

    /// Remove a registration. Returns false if it was not present.
    pub fn remove(&self, interest: Interest, registration: &Registration) -> bool {
        let mut regs = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let list = regs.list_mut(interest);
        match list.iter().position(|r| r == registration) {
            Some(idx) => {
                list.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> Registrations {
        self.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Registrations> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Worker pool ────────────────────────────────────────────────────────

/// Fixed-size pool of decode threads behind a bounded queue.
pub struct WorkerPool {
    queue: Option<SyncSender<RawScanEvent>>,
    workers: Vec<JoinHandle<()>>,
    dropped: AtomicU64,
}

impl WorkerPool {
    /// Spawn `size` workers sharing a queue of `depth` pending events.
    pub fn new<F>(size: usize, depth: usize, handler: F) -> io::Result<Self>
    where
        F: Fn(RawScanEvent) + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(depth.max(1));
        let rx: Arc<Mutex<Receiver<RawScanEvent>>> = Arc::new(Mutex::new(rx));
        let handler = Arc::new(handler);

        let mut workers = Vec::with_capacity(size.max(1));
        for i in 0..size.max(1) {
            let rx = Arc::clone(&rx);
            let handler = Arc::clone(&handler);
            let worker = thread::Builder::new()
                .name(format!("beacon-decode-{i}"))
                .spawn(move || loop {
                    let next = rx.lock().unwrap_or_else(PoisonError::into_inner).recv();
                    match next {
                        Ok(event) => handler(event),
                        Err(_) => break,
                    }
                })?;
            workers.push(worker);
        }

        log::debug!("Decode pool started: {} workers, queue depth {}", workers.len(), depth.max(1));
        Ok(Self {
            queue: Some(tx),
            workers,
            dropped: AtomicU64::new(0),
        })
    }

    /// Queue an event without blocking. Returns false if it was dropped.
    pub fn submit(&self, event: RawScanEvent) -> bool {
        let Some(queue) = &self.queue else {
            return false;
        };
        match queue.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                log::warn!("Ignoring scan result because we cannot keep up ({total} dropped)");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Decode workers gone, scan result dropped");
                false
            }
        }
    }

    /// Events dropped since the pool started.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the queue lets workers drain what is left and exit
        self.queue.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("Decode worker panicked");
            }
        }
    }
}

// ── Pipeline ───────────────────────────────────────────────────────────

type CycleBuffer = HashMap<Registration, Vec<ClassifiedBeacon>>;

struct Dispatcher {
    registry: Arc<Registry>,
    tracker: Arc<dyn DetectionTracker<Registration>>,
    sink: Arc<dyn EventSink>,
    cycle: Mutex<CycleBuffer>,
    classified: AtomicU64,
}

impl Dispatcher {
    fn process(&self, event: &RawScanEvent) -> Option<ClassifiedBeacon> {
        let beacon = beacon::decode(event)?;
        self.classified.fetch_add(1, Ordering::Relaxed);

        // Matches are recorded while the registry is locked: a registration
        // removed (and forgotten) by the host never gets state back.
        let entered: Vec<Registration> = {
            let regs = self.registry.lock();

            let mut ranged = regs
                .ranged
                .iter()
                .filter(|r| r.region.matches(&beacon))
                .peekable();
            if ranged.peek().is_some() {
                let mut cycle = self.cycle.lock().unwrap_or_else(PoisonError::into_inner);
                for reg in ranged {
                    let seen = cycle.entry(reg.clone()).or_default();
                    match seen.iter_mut().find(|b| b.address == beacon.address) {
                        Some(existing) if existing.timestamp <= beacon.timestamp => {
                            *existing = beacon.clone()
                        }
                        Some(_) => {}
                        None => seen.push(beacon.clone()),
                    }
                }
            }

            let mut entered = Vec::new();
            for reg in regs.monitored.iter().filter(|r| r.region.matches(&beacon)) {
                if self.tracker.record_detection(reg, beacon.timestamp) == Detection::Entered {
                    entered.push(reg.clone());
                }
            }
            entered
        };

        for reg in entered {
            log::info!("{} entered region {}", beacon.address, reg.region);
            self.sink
                .deliver(&reg.client, HostEvent::RegionEnter(reg.region));
        }

        Some(beacon)
    }

    fn end_cycle(&self, now: u64) {
        let ranged = {
            let mut cycle = self.cycle.lock().unwrap_or_else(PoisonError::into_inner);
            core::mem::take(&mut *cycle)
        };
        for (reg, beacons) in ranged {
            log::debug!("Range update for {}: {} beacons", reg.region, beacons.len());
            self.sink.deliver(
                &reg.client,
                HostEvent::RangeUpdate {
                    region: reg.region,
                    beacons,
                },
            );
        }

        for reg in self.tracker.take_exited(now) {
            log::info!("Region {} exited", reg.region);
            self.sink
                .deliver(&reg.client, HostEvent::RegionExit(reg.region));
        }
    }
}

/// Classify-and-dispatch pipeline fed by the scan-cycle controller.
pub struct DetectionPipeline {
    dispatcher: Arc<Dispatcher>,
    pool: WorkerPool,
}

impl DetectionPipeline {
    /// Pipeline with the default exit-period tracker.
    pub fn new(
        config: &HostConfig,
        registry: Arc<Registry>,
        sink: Arc<dyn EventSink>,
    ) -> io::Result<Self> {
        let tracker = Arc::new(ExitPeriodTracker::<Registration>::new(config.exit_period_ms));
        Self::with_tracker(config, registry, sink, tracker)
    }

    pub fn with_tracker(
        config: &HostConfig,
        registry: Arc<Registry>,
        sink: Arc<dyn EventSink>,
        tracker: Arc<dyn DetectionTracker<Registration>>,
    ) -> io::Result<Self> {
        let dispatcher = Arc::new(Dispatcher {
            registry,
            tracker,
            sink,
            cycle: Mutex::new(HashMap::new()),
            classified: AtomicU64::new(0),
        });
        let worker_dispatcher = Arc::clone(&dispatcher);
        let pool = WorkerPool::new(config.worker_count(), config.queue_depth, move |event| {
            worker_dispatcher.process(&event);
        })?;
        Ok(Self { dispatcher, pool })
    }

    /// Decode and dispatch one event on the calling thread.
    ///
    /// Returns the beacon if the payload was recognized.
    pub fn process(&self, event: &RawScanEvent) -> Option<ClassifiedBeacon> {
        self.dispatcher.process(event)
    }

    /// Flush the cycle's range updates and sweep monitoring exits as of `now` (ms).
    pub fn end_cycle(&self, now: u64) {
        self.dispatcher.end_cycle(now);
    }

    /// Drop buffered and tracked state for a registration that went away.
    pub fn forget(&self, registration: &Registration) {
        self.dispatcher
            .cycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(registration);
        self.dispatcher.tracker.forget(registration);
    }

    /// Events dropped because the workers could not keep up.
    pub fn dropped_events(&self) -> u64 {
        self.pool.dropped()
    }

    /// Events recognized as beacons.
    pub fn classified_events(&self) -> u64 {
        self.dispatcher.classified.load(Ordering::Relaxed)
    }

    pub fn workers(&self) -> usize {
        self.pool.size()
    }
}

impl ScanCallback for DetectionPipeline {
    fn on_event(&self, event: RawScanEvent) {
        self.pool.submit(event);
    }

    fn on_cycle_end(&self) {
        self.end_cycle(now_millis());
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
