use std::sync::atomic::{AtomicU8, Ordering};

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

/// One-way `idle -> running -> stopped` state shared by sources and
/// recorders, so each instance is started at most once and stopped at most
/// once no matter how many registry events mention it.
#[derive(Debug, Default)]
pub struct Lifecycle(AtomicU8);

impl Lifecycle {
    pub fn new() -> Self {
        Self(AtomicU8::new(IDLE))
    }

    /// `true` exactly once, for the caller that moved the instance to running.
    pub fn begin(&self) -> bool {
        self.0
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// `true` exactly once, for the caller that stopped a running instance.
    /// An instance that never started goes straight to stopped and reports
    /// `false`.
    pub fn end(&self) -> bool {
        self.0.swap(STOPPED, Ordering::AcqRel) == RUNNING
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire) == RUNNING
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire) == STOPPED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_and_stops_once() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.begin());
        assert!(!lifecycle.begin());
        assert!(lifecycle.is_running());
        assert!(lifecycle.end());
        assert!(!lifecycle.end());
        assert!(lifecycle.is_stopped());
        assert!(!lifecycle.begin(), "a stopped instance never restarts");
    }

    #[test]
    fn stop_before_start() {
        let lifecycle = Lifecycle::new();
        assert!(!lifecycle.end());
        assert!(!lifecycle.begin());
    }
}
