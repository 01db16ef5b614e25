//! Per-endpoint circuit breaker
//!
//! # States
//! - Closed: requests flow; consecutive failures are counted
//! - Open: endpoint is skipped until the open timeout elapses
//! - Half-Open: one probe at a time is admitted; enough successes close
//!   the circuit
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive_failures >= failure_threshold
//! Open → Half-Open: is_open() called once open_timeout has elapsed
//! Half-Open → Closed: consecutive_successes >= success_threshold
//! Half-Open → Open: any failure
//! ```
//!
//! A failure reported while Open (a request admitted before the trip that
//! finished late) lands in the failure window but leaves the counters and
//! `opened_at` alone.
//!
//! Every read-decide-write happens under one mutex per breaker, so two
//! callers can never both perform the Open → Half-Open transition. There
//! is no background timer; the timeout is evaluated lazily in `is_open`.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState
{   Closed
  , Open
  , HalfOpen
}

impl fmt::Display for CircuitState
{   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {   let name = match self
        {   CircuitState::Closed => "CLOSED"
          , CircuitState::Open => "OPEN"
          , CircuitState::HalfOpen => "HALF_OPEN"
        };
        f.write_str(name)
    }
}

/// Mutable health record; only touched with the breaker's lock held
#[derive(Debug)]
struct CircuitRecord
{   state: CircuitState
  , consecutive_failures: u32
  , consecutive_successes: u32
  , last_failure: Option<Instant>
  , last_success: Option<Instant>
  , opened_at: Option<Instant>
  , failure_times: VecDeque<Instant>
  , probe_in_flight: bool
}

impl CircuitRecord
{   fn new() -> Self
    {   CircuitRecord
        {   state: CircuitState::Closed
          , consecutive_failures: 0
          , consecutive_successes: 0
          , last_failure: None
          , last_success: None
          , opened_at: None
          , failure_times: VecDeque::new()
          , probe_in_flight: false
        }
    }

    fn open(&mut self, now: Instant)
    {   self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.consecutive_successes = 0;
        self.probe_in_flight = false;
    }

    fn prune(&mut self, now: Instant, window: Duration)
    {   while let Some(&oldest) = self.failure_times.front()
        {   if now.saturating_duration_since(oldest) > window
            {   self.failure_times.pop_front();
            } else
            {   break;
            }
        }
    }
}

/// Read-only snapshot of a breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitStatus
{   pub index: usize
  , pub name: String
  , pub state: CircuitState
  , pub consecutive_failures: u32
  , pub consecutive_successes: u32
  , /// Failures inside the window as of the last prune
    pub recent_failure_count: usize
  , #[serde(serialize_with = "serialize_elapsed_ms")]
    pub last_failure: Option<Instant>
  , #[serde(serialize_with = "serialize_elapsed_ms")]
    pub last_success: Option<Instant>
  , #[serde(serialize_with = "serialize_elapsed_ms")]
    pub opened_at: Option<Instant>
}

/// Instants are written as milliseconds elapsed since they happened
fn serialize_elapsed_ms<S: Serializer>(
  instant: &Option<Instant>
, serializer: S
) -> Result<S::Ok, S::Error>
{   match instant
    {   Some(at) => serializer.serialize_some(
          &(at.elapsed().as_millis() as u64)
        )
      , None => serializer.serialize_none()
    }
}

/// Health tracker for one endpoint
#[derive(Debug)]
pub struct CircuitBreaker
{   index: usize
  , name: String
  , config: CircuitBreakerConfig
  , record: Mutex<CircuitRecord>
}

impl CircuitBreaker
{   /// New breaker in the closed state
    pub fn new(
      index: usize
    , name: impl Into<String>
    , config: CircuitBreakerConfig
    ) -> Self
    {   CircuitBreaker
        {   index
          , name: name.into()
          , config
          , record: Mutex::new(CircuitRecord::new())
        }
    }

    pub fn name(&self) -> &str
    {   &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig
    {   &self.config
    }

    /// Whether calls to this endpoint should be skipped.
    ///
    /// An open circuit whose timeout has elapsed moves to half-open here
    /// and answers `false`, admitting the caller as the probe. While that
    /// probe is outstanding every other caller is told the circuit is open.
    /// The slot frees up once the probe's outcome is recorded or
    /// `release_probe` is called.
    pub fn is_open(&self) -> bool
    {   let mut record = self.record.lock();
        match record.state
        {   CircuitState::Closed => false
          , CircuitState::HalfOpen => {
              if record.probe_in_flight
              {   true
              } else
              {   record.probe_in_flight = true;
                  debug!("Circuit {} admitting next probe", self.name);
                  false
              }
            }
          , CircuitState::Open => {
              let now = Instant::now();
              let elapsed = record.opened_at
                .map(|at| now.saturating_duration_since(at))
                .unwrap_or(Duration::MAX);
              if elapsed >= self.config.open_timeout()
              {   record.state = CircuitState::HalfOpen;
                  record.consecutive_successes = 0;
                  record.probe_in_flight = true;
                  info!(
                    "Circuit {} half-open after {:?}, admitting probe",
                    self.name, elapsed
                  );
                  false
              } else
              {   true
              }
            }
        }
    }

    pub fn record_success(&self)
    {   let mut record = self.record.lock();
        record.last_success = Some(Instant::now());
        match record.state
        {   CircuitState::Closed => {
              record.consecutive_failures = 0;
              record.consecutive_successes
                = record.consecutive_successes.saturating_add(1);
            }
          , CircuitState::HalfOpen => {
              record.probe_in_flight = false;
              record.consecutive_failures = 0;
              record.consecutive_successes += 1;
              if record.consecutive_successes >= self.config.success_threshold
              {   record.state = CircuitState::Closed;
                  record.consecutive_successes = 0;
                  record.opened_at = None;
                  info!("Circuit {} closed after successful probes", self.name);
              } else
              {   debug!(
                    "Circuit {} probe succeeded ({}/{})",
                    self.name,
                    record.consecutive_successes,
                    self.config.success_threshold
                  );
              }
            }
          , CircuitState::Open => {
              // a request admitted before the circuit opened finished late
              debug!("Circuit {} success recorded while open", self.name);
            }
        }
    }

    pub fn record_failure(&self)
    {   let mut record = self.record.lock();
        let now = Instant::now();
        record.last_failure = Some(now);
        record.failure_times.push_back(now);
        record.prune(now, self.config.failure_window());
        if record.state == CircuitState::Open
        {   debug!("Circuit {} failure recorded while open", self.name);
            return;
        }
        record.consecutive_successes = 0;
        record.consecutive_failures
          = record.consecutive_failures.saturating_add(1);

        match record.state
        {   CircuitState::Closed => {
              if record.consecutive_failures >= self.config.failure_threshold
              {   record.open(now);
                  warn!(
                    "Circuit {} opened after {} consecutive failures",
                    self.name, record.consecutive_failures
                  );
              }
            }
          , CircuitState::HalfOpen => {
              record.open(now);
              warn!("Circuit {} re-opened after failed probe", self.name);
            }
          , CircuitState::Open => {}
        }
    }

    /// Give back a half-open probe slot whose request ended without an
    /// outcome (for example on cancellation)
    pub fn release_probe(&self)
    {   let mut record = self.record.lock();
        if record.probe_in_flight
        {   record.probe_in_flight = false;
            debug!("Circuit {} probe released without outcome", self.name);
        }
    }

    /// Force the circuit closed and clear all counters
    pub fn reset(&self)
    {   let mut record = self.record.lock();
        *record = CircuitRecord
        {   last_failure: record.last_failure
          , last_success: record.last_success
          , ..CircuitRecord::new()
        };
        info!("Circuit {} manually reset", self.name);
    }

    /// Snapshot of the current record; never changes state
    pub fn status(&self) -> CircuitStatus
    {   let record = self.record.lock();
        CircuitStatus
        {   index: self.index
          , name: self.name.clone()
          , state: record.state
          , consecutive_failures: record.consecutive_failures
          , consecutive_successes: record.consecutive_successes
          , recent_failure_count: record.failure_times.len()
          , last_failure: record.last_failure
          , last_success: record.last_success
          , opened_at: record.opened_at
        }
    }

    pub fn state(&self) -> CircuitState
    {   self.record.lock().state
    }
}
