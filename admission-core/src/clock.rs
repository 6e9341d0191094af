use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// Injectable time source. Every time-sensitive component (caches, JWKS TTL,
/// JWT exp/nbf checks, flush intervals) takes a `Clock` rather than calling
/// `Utc::now()` directly, so tests can move time forward deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Deterministic clock for tests. Starts at a fixed instant and only moves
/// forward when `advance`/`set` is called.
pub struct TestClock {
    current: Mutex<DateTime<Utc>>,
}

impl TestClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Mutex::new(start),
        }
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut guard = self.current.lock().expect("clock mutex poisoned");
        *guard += delta;
    }

    pub fn set(&self, value: DateTime<Utc>) {
        let mut guard = self.current.lock().expect("clock mutex poisoned");
        *guard = value;
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock().expect("clock mutex poisoned")
    }
}
