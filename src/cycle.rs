/// Scan duty-cycle schedule.
///
/// Pure time bookkeeping for a scan-cycle controller: alternate an active
/// scan window with an idle window. Reconfiguration is staged and only takes
/// effect when the next cycle starts, never in the middle of one. The
/// controller owns the radio and the timer; it calls [`ScanSchedule::advance`]
/// with the current time and acts on the returned edge.
use crate::protocol::ScanPeriods;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Scanning,
    Idle,
}

/// Edge produced by [`ScanSchedule::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleEdge {
    /// Scan window closed: stop the radio and flush the cycle's results.
    ScanEnded,
    /// New cycle started with the (possibly updated) periods.
    CycleStarted,
}

#[derive(Debug, Clone)]
pub struct ScanSchedule {
    periods: ScanPeriods,
    background: bool,
    pending: Option<(ScanPeriods, bool)>,
    phase: Phase,
    phase_started: u64,
    cycles: u64,
}

impl ScanSchedule {
    /// Start the first scan window at `now` (ms).
    pub fn new(periods: ScanPeriods, background: bool, now: u64) -> Self {
        Self {
            periods,
            background,
            pending: None,
            phase: Phase::Scanning,
            phase_started: now,
            cycles: 0,
        }
    }

    /// Stage new periods for the next cycle boundary.
    pub fn set_scan_periods(&mut self, periods: ScanPeriods, background: bool) {
        self.pending = Some((periods, background));
    }

    pub fn periods(&self) -> ScanPeriods {
        self.periods
    }

    pub fn is_background(&self) -> bool {
        self.background
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Completed cycles since construction.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Time (ms) at which the current phase ends.
    pub fn next_deadline(&self) -> u64 {
        let len = match self.phase {
            Phase::Scanning => self.periods.scan_ms,
            Phase::Idle => self.periods.between_scan_ms,
        };
        self.phase_started.saturating_add(len)
    }

    /// Move to the next phase if its deadline has passed.
    ///
    /// Returns at most one edge per call; call again until `None` to catch up
    /// after a long stall.
    pub fn advance(&mut self, now: u64) -> Option<CycleEdge> {
        let deadline = self.next_deadline();
        if now < deadline {
            return None;
        }
        match self.phase {
            Phase::Scanning => {
                self.phase = Phase::Idle;
                self.phase_started = deadline;
                Some(CycleEdge::ScanEnded)
            }
            Phase::Idle => {
                if let Some((periods, background)) = self.pending.take() {
                    log::debug!(
                        "Scan periods now {}/{} ms (background: {})",
                        periods.scan_ms,
                        periods.between_scan_ms,
                        background
                    );
                    self.periods = periods;
                    self.background = background;
                }
                self.phase = Phase::Scanning;
                self.phase_started = deadline;
                self.cycles += 1;
                Some(CycleEdge::CycleStarted)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alternates_scan_and_idle() {
        let mut s = ScanSchedule::new(ScanPeriods::new(100, 50), false, 0);
        assert_eq!(s.advance(99), None);
        assert_eq!(s.advance(100), Some(CycleEdge::ScanEnded));
        assert_eq!(s.phase(), Phase::Idle);
        assert_eq!(s.advance(149), None);
        assert_eq!(s.advance(150), Some(CycleEdge::CycleStarted));
        assert_eq!(s.phase(), Phase::Scanning);
        assert_eq!(s.cycles(), 1);
        assert_eq!(s.next_deadline(), 250);
    }

    #[test]
    fn zero_idle_restarts_immediately() {
        let mut s = ScanSchedule::new(ScanPeriods::new(1100, 0), false, 0);
        assert_eq!(s.advance(1100), Some(CycleEdge::ScanEnded));
        assert_eq!(s.advance(1100), Some(CycleEdge::CycleStarted));
        assert_eq!(s.advance(1100), None);
    }

    #[test]
    fn new_periods_wait_for_cycle_boundary() {
        let mut s = ScanSchedule::new(ScanPeriods::new(100, 100), false, 0);
        s.set_scan_periods(ScanPeriods::new(10_000, 300_000), true);
        // Current cycle keeps its periods
        assert_eq!(s.periods(), ScanPeriods::new(100, 100));
        assert_eq!(s.advance(100), Some(CycleEdge::ScanEnded));
        assert_eq!(s.periods(), ScanPeriods::new(100, 100));
        assert_eq!(s.advance(200), Some(CycleEdge::CycleStarted));
        assert_eq!(s.periods(), ScanPeriods::new(10_000, 300_000));
        assert!(s.is_background());
        assert_eq!(s.next_deadline(), 10_200);
    }

    #[test]
    fn catches_up_after_stall() {
        let mut s = ScanSchedule::new(ScanPeriods::new(10, 10), false, 0);
        let mut edges = 0;
        while s.advance(45).is_some() {
            edges += 1;
        }
        assert_eq!(edges, 4);
        assert_eq!(s.cycles(), 2);
    }
}
