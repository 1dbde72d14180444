// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Hybrid logical clock.
//!
//! Every column write is stamped with an [`Hlc`]: physical milliseconds, a
//! logical counter, and the writing device. Timestamps are totally ordered
//! (physical, then counter, then device), so two column writes never compare
//! equal and last-writer-wins is deterministic on every replica.
//!
//! The [`HlcClock`] hands out strictly increasing stamps even when the wall
//! clock stalls or jumps backwards, and is advanced past any remote stamp it
//! observes.
//!
//! # Wire Encoding
//!
//! ```text
//! 0000018f2a3b4c5d-00000003-6f1c2d3e-4b5a-4c6d-8e9f-0a1b2c3d4e5f
//! └──── physical ─┘ └count─┘ └──────────── device id ──────────┘
//! ```
//!
//! Fixed-width lowercase hex, so string order equals timestamp order and the
//! encoding can be indexed and compared directly in SQL.
//!
//! # Example
//!
//! ```
//! use replica_sync::hlc::{Hlc, HlcClock, ManualTimeSource};
//! use std::sync::Arc;
//! use uuid::Uuid;
//!
//! let time = ManualTimeSource::new(1_000);
//! let clock = HlcClock::new(Uuid::new_v4(), Arc::new(time.clone()));
//!
//! let a = clock.now();
//! let b = clock.now(); // same millisecond: counter bumps
//! assert!(b > a);
//!
//! let parsed: Hlc = b.to_string().parse().unwrap();
//! assert_eq!(parsed, b);
//! ```

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Error parsing the sortable string form of an [`Hlc`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HlcParseError {
    #[error("malformed HLC '{0}': expected physical-counter-device")]
    Format(String),
    #[error("malformed HLC physical time '{0}'")]
    Physical(String),
    #[error("malformed HLC counter '{0}'")]
    Counter(String),
    #[error("malformed HLC device id '{0}'")]
    Device(String),
}

/// A hybrid logical timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Hlc {
    /// Milliseconds since the Unix epoch
    pub physical_ms: u64,
    /// Logical counter within one physical millisecond
    pub counter: u32,
    /// Device that produced the stamp (final tie-break)
    pub device_id: Uuid,
}

impl Hlc {
    #[must_use]
    pub fn new(physical_ms: u64, counter: u32, device_id: Uuid) -> Self {
        Self { physical_ms, counter, device_id }
    }

    /// Upper bound covering every device at this (physical, counter) point.
    ///
    /// Used as an inclusive scan ceiling: any stamp the local clock can still
    /// hand out compares strictly greater.
    #[must_use]
    pub fn ceiling(&self) -> Self {
        Self {
            physical_ms: self.physical_ms,
            counter: self.counter,
            device_id: Uuid::from_u128(u128::MAX),
        }
    }

    fn logical(&self) -> (u64, u32) {
        (self.physical_ms, self.counter)
    }
}

impl Ord for Hlc {
    fn cmp(&self, other: &Self) -> Ordering {
        self.physical_ms
            .cmp(&other.physical_ms)
            .then(self.counter.cmp(&other.counter))
            .then(self.device_id.cmp(&other.device_id))
    }
}

impl PartialOrd for Hlc {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Hlc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}-{:08x}-{}", self.physical_ms, self.counter, self.device_id.hyphenated())
    }
}

impl FromStr for Hlc {
    type Err = HlcParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Device id carries its own hyphens, so split twice only
        let mut parts = s.splitn(3, '-');
        let (Some(physical), Some(counter), Some(device)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(HlcParseError::Format(s.to_string()));
        };
        if physical.len() != 16 || counter.len() != 8 {
            return Err(HlcParseError::Format(s.to_string()));
        }

        let physical_ms = u64::from_str_radix(physical, 16)
            .map_err(|_| HlcParseError::Physical(physical.to_string()))?;
        let counter = u32::from_str_radix(counter, 16)
            .map_err(|_| HlcParseError::Counter(counter.to_string()))?;
        let device_id = Uuid::parse_str(device)
            .map_err(|_| HlcParseError::Device(device.to_string()))?;

        Ok(Self { physical_ms, counter, device_id })
    }
}

impl TryFrom<String> for Hlc {
    type Error = HlcParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Hlc> for String {
    fn from(value: Hlc) -> Self {
        value.to_string()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TIME SOURCES
// ═══════════════════════════════════════════════════════════════════════════

/// Physical time provider for the clock.
pub trait TimeSource: Send + Sync {
    /// Current wall time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// Wall clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_ms(&self) -> u64 {
        u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
    }
}

/// Manually driven time, shared between clones.
///
/// Lets tests and simulations move time forwards or backwards explicitly.
#[derive(Debug, Clone)]
pub struct ManualTimeSource {
    now: Arc<AtomicU64>,
}

impl ManualTimeSource {
    #[must_use]
    pub fn new(start_ms: u64) -> Self {
        Self { now: Arc::new(AtomicU64::new(start_ms)) }
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, AtomicOrdering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, AtomicOrdering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_ms(&self) -> u64 {
        self.now.load(AtomicOrdering::SeqCst)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CLOCK
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct ClockState {
    /// Highest (physical, counter) handed out or observed
    last: Option<(u64, u32)>,
    /// Highest wall reading seen, for regression detection
    last_wall_ms: u64,
}

/// Monotonic hybrid logical clock for one device.
///
/// All operations take a single short lock, so concurrent writers on the same
/// device never receive colliding stamps.
pub struct HlcClock {
    device_id: Uuid,
    time: Arc<dyn TimeSource>,
    state: Mutex<ClockState>,
    max_skew_ms: AtomicU64,
}

impl HlcClock {
    /// Default tolerated lead of a remote stamp over local wall time.
    pub const DEFAULT_MAX_SKEW_MS: u64 = 5 * 60 * 1000;

    pub fn new(device_id: Uuid, time: Arc<dyn TimeSource>) -> Self {
        Self {
            device_id,
            time,
            state: Mutex::new(ClockState::default()),
            max_skew_ms: AtomicU64::new(Self::DEFAULT_MAX_SKEW_MS),
        }
    }

    #[must_use]
    pub fn device_id(&self) -> Uuid {
        self.device_id
    }

    /// Current wall time as seen by the clock's time source.
    #[must_use]
    pub fn wall_ms(&self) -> u64 {
        self.time.now_ms()
    }

    pub fn set_max_skew_ms(&self, ms: u64) {
        self.max_skew_ms.store(ms, AtomicOrdering::Relaxed);
    }

    /// Stamp a local write.
    ///
    /// Strictly greater than every stamp previously produced or observed.
    pub fn now(&self) -> Hlc {
        let wall = self.time.now_ms();
        let mut state = self.state.lock();

        if wall < state.last_wall_ms {
            warn!(
                wall_ms = wall,
                previous_wall_ms = state.last_wall_ms,
                device = %self.device_id,
                "Wall clock moved backwards; advancing logical counter"
            );
            crate::metrics::record_clock_regression();
        }
        state.last_wall_ms = state.last_wall_ms.max(wall);

        let (physical_ms, counter) = match state.last {
            Some((physical, counter)) if wall <= physical => bump(physical, counter),
            _ => (wall, 0),
        };
        state.last = Some((physical_ms, counter));

        Hlc { physical_ms, counter, device_id: self.device_id }
    }

    /// Advance past a stamp received from a peer.
    ///
    /// Returns `true` if the stamp was further ahead of local wall time than
    /// the configured skew tolerance. The clock advances either way.
    pub fn observe(&self, remote: &Hlc) -> bool {
        let wall = self.time.now_ms();
        let max_skew = self.max_skew_ms.load(AtomicOrdering::Relaxed);
        let skewed = remote.physical_ms > wall.saturating_add(max_skew);
        if skewed {
            warn!(
                remote = %remote,
                wall_ms = wall,
                lead_ms = remote.physical_ms - wall,
                "Remote HLC exceeds tolerated clock skew"
            );
            crate::metrics::record_clock_skew();
        }
        self.advance_to(remote);
        skewed
    }

    /// Seed from persisted stamps at startup so a restart never regresses.
    pub fn seed(&self, hlc: &Hlc) {
        self.advance_to(hlc);
    }

    fn advance_to(&self, hlc: &Hlc) {
        let mut state = self.state.lock();
        let incoming = hlc.logical();
        if state.last.map_or(true, |last| incoming > last) {
            state.last = Some(incoming);
        }
    }

    /// Highest stamp produced or observed so far, tagged with this device.
    #[must_use]
    pub fn last(&self) -> Option<Hlc> {
        self.state
            .lock()
            .last
            .map(|(physical_ms, counter)| Hlc { physical_ms, counter, device_id: self.device_id })
    }

    /// Inclusive upper bound on every stamp committed so far.
    ///
    /// Only meaningful while local writers are excluded; see
    /// [`crate::locks::ReplicaLocks::snapshot_ceiling`].
    #[must_use]
    pub fn ceiling(&self) -> Option<Hlc> {
        self.last().map(|hlc| hlc.ceiling())
    }
}

fn bump(physical: u64, counter: u32) -> (u64, u32) {
    match counter.checked_add(1) {
        Some(next) => (physical, next),
        None => (physical.saturating_add(1), 0),
    }
}
