//! The clock consulted for inode timestamps.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Where the file system gets "now" from, in milliseconds since the epoch.
///
/// A fixed value makes every timestamp deterministic; a callback lets tests
/// advance time explicitly. The sentinel `-1` converts to the wall clock.
#[derive(Clone)]
pub enum TimeSource {
    Wall,
    Fixed(i64),
    Callback(Arc<dyn Fn() -> i64 + Send + Sync>),
}

impl TimeSource {
    pub fn now(&self) -> i64 {
        match self {
            TimeSource::Wall => wall_clock_ms(),
            TimeSource::Fixed(ms) => *ms,
            TimeSource::Callback(f) => f(),
        }
    }
}

impl TimeSource {
    pub fn callback(f: impl Fn() -> i64 + Send + Sync + 'static) -> TimeSource {
        TimeSource::Callback(Arc::new(f))
    }
}

impl From<i64> for TimeSource {
    fn from(ms: i64) -> Self {
        if ms == -1 {
            TimeSource::Wall
        } else {
            TimeSource::Fixed(ms)
        }
    }
}

impl core::fmt::Debug for TimeSource {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            TimeSource::Wall => write!(f, "Wall"),
            TimeSource::Fixed(ms) => write!(f, "Fixed({})", ms),
            TimeSource::Callback(_) => write!(f, "Callback(..)"),
        }
    }
}

pub fn wall_clock_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(_) => 0,
    }
}
