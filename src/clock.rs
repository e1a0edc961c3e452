//! Clock & IDs
//!
//! Wall-clock and monotonic timestamps, plus sortable session/event identifiers.
//! Mirrors `handle.rs`'s role as the universal correlation primitive, but backed
//! by a ULID instead of a UUID so that identifiers minted within the same
//! process sort by creation order even when generated in the same millisecond.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};
use ulid::{Generator, Ulid};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

/// Current wall-clock time in microseconds since the Unix epoch, for traces.
pub fn now_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_micros() as i64
}

/// Process-wide monotonic ULID generator. `Ulid::new()` fills a fresh random
/// payload on every call and gives no ordering guarantee for two ids minted
/// in the same millisecond; `Generator::generate()` increments the previous
/// random component instead when the timestamp hasn't advanced, which is
/// what actually provides the creation-order guarantee.
fn generator() -> &'static parking_lot::Mutex<Generator> {
    static GENERATOR: OnceLock<parking_lot::Mutex<Generator>> = OnceLock::new();
    GENERATOR.get_or_init(|| parking_lot::Mutex::new(Generator::new()))
}

/// A 26-character, lexicographically sortable identifier.
///
/// Two ids minted within the same millisecond still sort by creation order
/// (backed by a process-wide `Generator`, which increments the previous
/// random component when the timestamp hasn't advanced).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SortableId(Ulid);

impl SortableId {
    pub fn new() -> Self {
        let mut gen = generator().lock();
        // generate() only errs if the random component overflows within the
        // same millisecond (2^80 ids/ms); falling back to a fresh ULID is
        // safe since that case already can't preserve ordering anyway.
        let ulid = gen.generate().unwrap_or_else(|_| Ulid::new());
        Self(ulid)
    }

    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for SortableId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SortableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SortableId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

/// Generates a new sortable identifier (session id or event id).
pub fn new_id() -> SortableId {
    SortableId::new()
}
