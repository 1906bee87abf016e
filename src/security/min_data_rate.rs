//! Minimum data rate enforcement (slow-loris protection).
//!
//! # Responsibilities
//! - Count bytes per monitored phase (request head, request body, response body)
//! - After a grace period, compare bytes/elapsed against a minimum rate
//! - Report the first phase that falls below its minimum
//!
//! # Design Decisions
//! - Rate is the cumulative average since phase start, over unpaused time only;
//!   timing pauses while the transport waits on the application (input
//!   backpressure, or no output to send yet)
//! - A pause belongs to a direction, so a phase started mid-pause starts paused
//! - Callers pass the current instant, so heartbeats and tests control time
//! - Enforcement can be switched off per connection, and is off for good once
//!   the connection is upgraded to a raw byte stream

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// A monitored phase of a connection's traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataPhase {
    /// Inbound, before the request head is complete.
    RequestHead,
    /// Inbound request body.
    RequestBody,
    /// Outbound response body.
    ResponseBody,
}

impl DataPhase {
    pub const ALL: [DataPhase; 3] = [
        DataPhase::RequestHead,
        DataPhase::RequestBody,
        DataPhase::ResponseBody,
    ];

    fn index(self) -> usize {
        match self {
            DataPhase::RequestHead => 0,
            DataPhase::RequestBody => 1,
            DataPhase::ResponseBody => 2,
        }
    }

    pub fn is_inbound(self) -> bool {
        !matches!(self, DataPhase::ResponseBody)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DataPhase::RequestHead => "request_head",
            DataPhase::RequestBody => "request_body",
            DataPhase::ResponseBody => "response_body",
        }
    }
}

impl fmt::Display for DataPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A minimum throughput with a grace period.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinDataRate {
    pub bytes_per_second: f64,
    pub grace_period: Duration,
}

impl MinDataRate {
    pub fn new(bytes_per_second: f64, grace_period: Duration) -> Self {
        Self {
            bytes_per_second,
            grace_period,
        }
    }
}

/// Thresholds per phase; `None` leaves a phase unmonitored.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DataRateLimits {
    pub request_head: Option<MinDataRate>,
    pub request_body: Option<MinDataRate>,
    pub response_body: Option<MinDataRate>,
}

impl DataRateLimits {
    fn get(&self, phase: DataPhase) -> Option<MinDataRate> {
        match phase {
            DataPhase::RequestHead => self.request_head,
            DataPhase::RequestBody => self.request_body,
            DataPhase::ResponseBody => self.response_body,
        }
    }
}

/// A phase observed below its minimum rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateViolation {
    pub phase: DataPhase,
    pub observed_bytes_per_second: f64,
    pub minimum_bytes_per_second: f64,
}

impl fmt::Display for RateViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} rate {:.1} B/s below minimum {:.1} B/s",
            self.phase, self.observed_bytes_per_second, self.minimum_bytes_per_second
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct PhaseTiming {
    rate: Option<MinDataRate>,
    active: bool,
    bytes: u64,
    accumulated: Duration,
    running_since: Option<Instant>,
}

impl PhaseTiming {
    fn elapsed(&self, now: Instant) -> Duration {
        let running = self
            .running_since
            .map(|since| now.saturating_duration_since(since))
            .unwrap_or_default();
        self.accumulated + running
    }

    fn pause(&mut self, now: Instant) {
        if let Some(since) = self.running_since.take() {
            self.accumulated += now.saturating_duration_since(since);
        }
    }

    fn resume(&mut self, now: Instant) {
        if self.active && self.running_since.is_none() {
            self.running_since = Some(now);
        }
    }
}

#[derive(Debug, Default)]
struct Timings {
    phases: [PhaseTiming; 3],
    /// Paused flag per direction: inbound, outbound.
    paused: [bool; 2],
}

impl Timings {
    fn direction(inbound: bool) -> usize {
        if inbound {
            0
        } else {
            1
        }
    }

    fn in_direction(&mut self, inbound: bool) -> impl Iterator<Item = &mut PhaseTiming> {
        DataPhase::ALL
            .into_iter()
            .zip(self.phases.iter_mut())
            .filter(move |(phase, _)| phase.is_inbound() == inbound)
            .map(|(_, timing)| timing)
    }
}

/// Per-connection throughput watchdog.
#[derive(Debug)]
pub struct DataRateMonitor {
    enabled: AtomicBool,
    upgraded: AtomicBool,
    timings: Mutex<Timings>,
}

impl DataRateMonitor {
    pub fn new(limits: DataRateLimits, enabled: bool) -> Self {
        let mut timings = Timings::default();
        for phase in DataPhase::ALL {
            timings.phases[phase.index()].rate = limits.get(phase);
        }
        Self {
            enabled: AtomicBool::new(enabled),
            upgraded: AtomicBool::new(false),
            timings: Mutex::new(timings),
        }
    }

    /// Turn enforcement on or off for this connection.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// The connection now carries raw bytes; never enforce again.
    pub fn mark_upgraded(&self) {
        self.upgraded.store(true, Ordering::Release);
    }

    pub fn is_enforced(&self) -> bool {
        self.enabled.load(Ordering::Acquire) && !self.upgraded.load(Ordering::Acquire)
    }

    /// Override the threshold for one phase; `None` stops monitoring it.
    pub fn set_rate(&self, phase: DataPhase, rate: Option<MinDataRate>) {
        self.timings.lock().phases[phase.index()].rate = rate;
    }

    pub fn rate(&self, phase: DataPhase) -> Option<MinDataRate> {
        self.timings.lock().phases[phase.index()].rate
    }

    /// Begin a phase, resetting its counters. The clock starts stopped if
    /// the phase's direction is currently paused.
    pub fn start(&self, phase: DataPhase, now: Instant) {
        let mut timings = self.timings.lock();
        let paused = timings.paused[Timings::direction(phase.is_inbound())];
        let timing = &mut timings.phases[phase.index()];
        timing.active = true;
        timing.bytes = 0;
        timing.accumulated = Duration::ZERO;
        timing.running_since = (!paused).then_some(now);
    }

    pub fn stop(&self, phase: DataPhase) {
        let mut timings = self.timings.lock();
        let timing = &mut timings.phases[phase.index()];
        timing.active = false;
        timing.running_since = None;
    }

    pub fn is_active(&self, phase: DataPhase) -> bool {
        self.timings.lock().phases[phase.index()].active
    }

    /// Stop the clock of every active phase in one direction, including
    /// phases started before the matching [`resume`](Self::resume).
    pub fn pause(&self, inbound: bool, now: Instant) {
        let mut timings = self.timings.lock();
        timings.paused[Timings::direction(inbound)] = true;
        for timing in timings.in_direction(inbound) {
            timing.pause(now);
        }
    }

    pub fn resume(&self, inbound: bool, now: Instant) {
        let mut timings = self.timings.lock();
        timings.paused[Timings::direction(inbound)] = false;
        for timing in timings.in_direction(inbound) {
            timing.resume(now);
        }
    }

    pub fn is_paused(&self, inbound: bool) -> bool {
        self.timings.lock().paused[Timings::direction(inbound)]
    }

    /// Credit bytes to every active phase in one direction.
    pub fn record(&self, inbound: bool, bytes: usize) {
        let mut timings = self.timings.lock();
        for timing in timings.in_direction(inbound) {
            if timing.active {
                timing.bytes += bytes as u64;
            }
        }
    }

    /// Bytes counted in the current run of `phase`.
    pub fn bytes(&self, phase: DataPhase) -> u64 {
        self.timings.lock().phases[phase.index()].bytes
    }

    /// Check every active phase at `now`.
    pub fn check(&self, now: Instant) -> Option<RateViolation> {
        if !self.is_enforced() {
            return None;
        }

        let timings = self.timings.lock();
        DataPhase::ALL.into_iter().find_map(|phase| {
            let timing = &timings.phases[phase.index()];
            let rate = timing.rate?;
            if !timing.active {
                return None;
            }
            let elapsed = timing.elapsed(now);
            if elapsed <= rate.grace_period {
                return None;
            }
            let observed = timing.bytes as f64 / elapsed.as_secs_f64();
            (observed < rate.bytes_per_second).then_some(RateViolation {
                phase,
                observed_bytes_per_second: observed,
                minimum_bytes_per_second: rate.bytes_per_second,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(phase_rate: MinDataRate) -> DataRateMonitor {
        DataRateMonitor::new(
            DataRateLimits {
                request_head: Some(phase_rate),
                request_body: Some(phase_rate),
                response_body: Some(phase_rate),
            },
            true,
        )
    }

    fn rate_100_grace_1s() -> MinDataRate {
        MinDataRate::new(100.0, Duration::from_secs(1))
    }

    #[test]
    fn silent_connection_is_flagged_after_grace() {
        let monitor = monitor(rate_100_grace_1s());
        let start = Instant::now();
        monitor.start(DataPhase::RequestBody, start);

        assert_eq!(monitor.check(start + Duration::from_millis(500)), None);
        assert_eq!(monitor.check(start + Duration::from_secs(1)), None);

        let violation = monitor
            .check(start + Duration::from_secs(3))
            .expect("0 bytes for 2s past grace must violate");
        assert_eq!(violation.phase, DataPhase::RequestBody);
        assert_eq!(violation.observed_bytes_per_second, 0.0);
    }

    #[test]
    fn steady_traffic_above_minimum_is_never_flagged() {
        let monitor = monitor(rate_100_grace_1s());
        let start = Instant::now();
        monitor.start(DataPhase::RequestBody, start);

        // 15 bytes every 100ms is 150 B/s.
        for tick in 1..=100u64 {
            let now = start + Duration::from_millis(tick * 100);
            assert_eq!(monitor.check(now - Duration::from_millis(1)), None, "tick {tick}");
            monitor.record(true, 15);
            assert_eq!(monitor.check(now), None, "tick {tick}");
        }
    }

    #[test]
    fn paused_time_is_not_counted() {
        let monitor = monitor(rate_100_grace_1s());
        let start = Instant::now();
        monitor.start(DataPhase::RequestBody, start);
        monitor.record(true, 200);

        // Backpressured for a long stretch.
        monitor.pause(true, start + Duration::from_millis(500));
        assert_eq!(monitor.check(start + Duration::from_secs(5)), None);
        monitor.resume(true, start + Duration::from_secs(10));

        // 1.5s of running time: 200 bytes / 1.5s is above the minimum.
        assert_eq!(monitor.check(start + Duration::from_secs(11)), None);
        // 3.5s of running time is not.
        assert!(monitor.check(start + Duration::from_secs(13)).is_some());
    }

    #[test]
    fn phase_started_while_paused_waits_for_resume() {
        let monitor = monitor(rate_100_grace_1s());
        let start = Instant::now();

        // The transport is waiting for the application's first output.
        monitor.pause(false, start);
        monitor.start(DataPhase::ResponseBody, start + Duration::from_millis(100));
        assert!(monitor.is_paused(false));
        assert_eq!(monitor.check(start + Duration::from_secs(3)), None);

        monitor.resume(false, start + Duration::from_secs(3));
        monitor.record(false, 150);
        assert!(!monitor.is_paused(false));
        assert_eq!(monitor.check(start + Duration::from_secs(4)), None);
        // 150 bytes over 2.5s of running time is below the minimum.
        assert!(monitor.check(start + Duration::from_millis(5500)).is_some());
    }

    #[test]
    fn disabled_or_upgraded_connections_are_not_checked() {
        let monitor = monitor(rate_100_grace_1s());
        let start = Instant::now();
        monitor.start(DataPhase::ResponseBody, start);
        let late = start + Duration::from_secs(5);

        monitor.set_enabled(false);
        assert_eq!(monitor.check(late), None);

        monitor.set_enabled(true);
        assert!(monitor.check(late).is_some());

        monitor.mark_upgraded();
        assert_eq!(monitor.check(late), None);
    }

    #[test]
    fn inactive_and_unlimited_phases_are_ignored() {
        let monitor = monitor(rate_100_grace_1s());
        let start = Instant::now();
        assert_eq!(monitor.check(start + Duration::from_secs(5)), None);

        monitor.start(DataPhase::RequestHead, start);
        monitor.set_rate(DataPhase::RequestHead, None);
        assert_eq!(monitor.check(start + Duration::from_secs(5)), None);

        monitor.stop(DataPhase::RequestHead);
        assert!(!monitor.is_active(DataPhase::RequestHead));
    }

    #[test]
    fn outbound_bytes_only_count_towards_response_body() {
        let monitor = monitor(rate_100_grace_1s());
        let start = Instant::now();
        monitor.start(DataPhase::RequestBody, start);
        monitor.start(DataPhase::ResponseBody, start);

        monitor.record(false, 500);
        assert_eq!(monitor.bytes(DataPhase::ResponseBody), 500);
        assert_eq!(monitor.bytes(DataPhase::RequestBody), 0);
    }
}
