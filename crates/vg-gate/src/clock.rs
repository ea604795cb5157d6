//! Time source for expiry and lockout windows.
//!
//! Deadlines are persisted with sessions, so they are UTC timestamps. The
//! system clock is clamped so it never reports an earlier instant than it
//! already has; a wall-clock step backwards cannot shorten a lockout.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock, monotonic non-decreasing within the process.
#[derive(Debug, Default)]
pub struct SystemClock {
    last_micros: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        let wall = Utc::now().timestamp_micros();
        let prev = self.last_micros.fetch_max(wall, Ordering::SeqCst);
        let micros = prev.max(wall);
        DateTime::<Utc>::from_timestamp_micros(micros).unwrap_or_else(Utc::now)
    }
}

/// Hand-driven clock for tests and replay.
#[derive(Clone, Debug)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move forward by `d`. Clones share the same time.
    pub fn advance(&self, d: Duration) {
        if let Ok(mut g) = self.now.lock() {
            *g = crate::types::plus(*g, d);
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|g| *g).unwrap_or_else(|p| *p.into_inner())
    }
}
