//! Drain deadline shared between the state machine, the send worker and the
//! socket writer. Once set, any blocking wait checks it and gives up when it
//! has passed.

use std::sync::Mutex;

use quanta::Instant;

#[derive(Debug, Default)]
pub struct ShutdownSignal {
    deadline: Mutex<Option<Instant>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start draining; waits must finish by `deadline`.
    pub fn begin(&self, deadline: Instant) {
        *self.deadline.lock().unwrap_or_else(|e| e.into_inner()) = Some(deadline);
    }

    pub fn clear(&self) {
        *self.deadline.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        *self.deadline.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_draining(&self) -> bool {
        self.deadline().is_some()
    }

    /// True once a drain has begun and its deadline has passed.
    pub fn expired(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|d| now >= d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn deadline_lifecycle() {
        let sig = ShutdownSignal::new();
        let now = Instant::now();
        assert!(!sig.is_draining());
        assert!(!sig.expired(now));

        sig.begin(now + Duration::from_secs(5));
        assert!(sig.is_draining());
        assert!(!sig.expired(now));
        assert!(sig.expired(now + Duration::from_secs(5)));

        sig.clear();
        assert!(!sig.expired(now + Duration::from_secs(60)));
    }
}
