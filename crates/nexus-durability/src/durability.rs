//! Transaction identifiers, master serial and durability point
//!
//! - [`TxId`] / [`TxPoint`]: 128-bit transaction id paired with a 64-bit serial
//! - [`TxCounters`]: last point plus running count, kept per direction
//! - [`MasterSerial`]: process-wide logical clock seeded from wall-clock micros
//! - [`DurabilityTracker`]: last inbound transaction reflected in a snapshot

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall clock in microseconds since the Unix epoch
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Current wall clock in milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    now_micros() / 1000
}

/// Current wall clock in seconds since the Unix epoch
pub fn now_secs() -> u64 {
    now_micros() / 1_000_000
}

/// 128-bit transaction identifier
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "[u64; 2]", into = "[u64; 2]")]
pub struct TxId(pub u128);

impl TxId {
    /// The null transaction
    pub const NULL: TxId = TxId(0);

    /// Generate a fresh random id
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().as_u128())
    }

    /// True for the null transaction
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Low and high words
    pub fn words(&self) -> (u64, u64) {
        (self.0 as u64, (self.0 >> 64) as u64)
    }

    /// Rebuild from low and high words
    pub fn from_words(lo: u64, hi: u64) -> Self {
        Self(lo as u128 | ((hi as u128) << 64))
    }
}

impl From<[u64; 2]> for TxId {
    fn from(w: [u64; 2]) -> Self {
        Self::from_words(w[0], w[1])
    }
}

impl From<TxId> for [u64; 2] {
    fn from(id: TxId) -> Self {
        let (lo, hi) = id.words();
        [lo, hi]
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxId({})", self)
    }
}

/// A transaction id paired with its serial number
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxPoint {
    /// Transaction id
    pub id: TxId,
    /// Monotonic serial number
    pub serial: u64,
}

impl TxPoint {
    /// Create a transaction point
    pub fn new(id: TxId, serial: u64) -> Self {
        Self { id, serial }
    }
}

/// Last transaction point and running count for one stream direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxCounters {
    /// Most recent transaction
    pub last: TxPoint,
    /// Number of transactions seen
    pub count: u64,
}

impl TxCounters {
    /// Record a transaction
    pub fn record(&mut self, point: TxPoint) {
        self.last = point;
        self.count += 1;
    }
}

/// Process-wide monotonically increasing logical clock
///
/// Used only as a comparable "as-of" marker across graphs hosted by one
/// process, never for conflict resolution.
#[derive(Debug)]
pub struct MasterSerial {
    value: AtomicU64,
}

impl MasterSerial {
    /// Seed from wall-clock microseconds
    pub fn from_clock() -> Self {
        Self::starting_at(now_micros())
    }

    /// Seed from an explicit value
    pub fn starting_at(value: u64) -> Self {
        Self {
            value: AtomicU64::new(value),
        }
    }

    /// Current value
    pub fn current(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Advance and return the new value
    pub fn next(&self) -> u64 {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Never move backwards past a value observed elsewhere
    pub fn observe(&self, seen: u64) {
        self.value.fetch_max(seen, Ordering::SeqCst);
    }
}

impl Default for MasterSerial {
    fn default() -> Self {
        Self::from_clock()
    }
}

/// Last inbound transaction known to be reflected in a completed snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurabilityPoint {
    /// Inbound transaction captured by the snapshot
    pub tx: TxPoint,
    /// Snapshot completion time (Unix millis)
    pub persisted_ts: u64,
}

/// Tracks the durability point and snapshots currently in flight
#[derive(Debug, Default)]
pub struct DurabilityTracker {
    point: RwLock<DurabilityPoint>,
    in_flight: AtomicU32,
}

impl DurabilityTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Current durability point
    pub fn point(&self) -> DurabilityPoint {
        *self.point.read()
    }

    /// Snapshots currently running
    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Mark the start of a snapshot; the returned guard ends it
    pub fn begin(&self) -> InFlightGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard { tracker: self }
    }

    /// Record a completed snapshot
    pub fn mark(&self, point: DurabilityPoint) {
        *self.point.write() = point;
    }
}

/// Ends an in-flight snapshot on drop
pub struct InFlightGuard<'a> {
    tracker: &'a DurabilityTracker,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.tracker.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_txid_words_roundtrip() {
        let id = TxId::random();
        let (lo, hi) = id.words();
        assert_eq!(TxId::from_words(lo, hi), id);
        assert_eq!(id.to_string().len(), 32);
        assert!(TxId::NULL.is_null());
    }

    #[test]
    fn test_txid_serde_as_words() {
        let id = TxId(0x0123_4567_89ab_cdef_fedc_ba98_7654_3210);
        let json = serde_json::to_string(&id).unwrap();
        let back: TxId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_master_serial_monotonic() {
        let serial = MasterSerial::from_clock();
        let a = serial.current();
        // Seeded from wall-clock microseconds: well past 2020-01-01
        assert!(a > 1_577_836_800_000_000);
        let b = serial.next();
        let c = serial.next();
        assert!(b > a && c > b);
        serial.observe(a);
        assert_eq!(serial.current(), c);
        serial.observe(c + 100);
        assert_eq!(serial.current(), c + 100);
    }

    #[test]
    fn test_tx_counters() {
        let mut counters = TxCounters::default();
        counters.record(TxPoint::new(TxId(1), 10));
        counters.record(TxPoint::new(TxId(2), 11));
        assert_eq!(counters.count, 2);
        assert_eq!(counters.last.serial, 11);
    }

    #[test]
    fn test_durability_tracker_in_flight() {
        let tracker = DurabilityTracker::new();
        {
            let _a = tracker.begin();
            let _b = tracker.begin();
            assert_eq!(tracker.in_flight(), 2);
        }
        assert_eq!(tracker.in_flight(), 0);
        let point = DurabilityPoint {
            tx: TxPoint::new(TxId(9), 99),
            persisted_ts: 1234,
        };
        tracker.mark(point);
        assert_eq!(tracker.point(), point);
    }
}
