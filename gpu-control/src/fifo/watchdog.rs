//! Channel watchdog: detects a channel whose GP_GET stops moving while jobs
//! are outstanding.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogStatus {
    /// Not running.
    Idle,
    /// GET moved since the last check; the timer restarted.
    Progress,
    /// Running, no progress, within the timeout.
    Running,
    /// No progress for longer than the timeout.
    Expired,
}

#[derive(Debug)]
struct WdtState {
    enabled: bool,
    running: bool,
    started: Instant,
    gp_get: u32,
}

#[derive(Debug)]
pub struct ChannelWatchdog {
    timeout: Duration,
    state: Mutex<WdtState>,
}

impl ChannelWatchdog {
    pub fn new(enabled: bool, timeout: Duration) -> Self {
        Self {
            timeout,
            state: Mutex::new(WdtState {
                enabled,
                running: false,
                started: Instant::now(),
                gp_get: 0,
            }),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    pub fn enable(&self) {
        self.state.lock().enabled = true;
    }

    /// Disabling also stops a running timer.
    pub fn disable(&self) {
        let mut s = self.state.lock();
        s.enabled = false;
        s.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Arm the timer if enabled and not already running.
    pub fn start(&self, gp_get: u32) {
        let mut s = self.state.lock();
        if s.enabled && !s.running {
            s.running = true;
            s.started = Instant::now();
            s.gp_get = gp_get;
        }
    }

    /// Stop the timer; returns whether it was running.
    pub fn stop(&self) -> bool {
        let mut s = self.state.lock();
        std::mem::replace(&mut s.running, false)
    }

    /// Re-arm after a `stop` that found the timer running.
    pub fn restart(&self, gp_get: u32) {
        let mut s = self.state.lock();
        if s.enabled {
            s.running = true;
            s.started = Instant::now();
            s.gp_get = gp_get;
        }
    }

    pub fn check(&self, gp_get: u32) -> WatchdogStatus {
        self.check_at(gp_get, Instant::now())
    }

    pub fn check_at(&self, gp_get: u32, now: Instant) -> WatchdogStatus {
        let mut s = self.state.lock();
        if !s.enabled || !s.running {
            return WatchdogStatus::Idle;
        }
        if gp_get != s.gp_get {
            s.gp_get = gp_get;
            s.started = now;
            return WatchdogStatus::Progress;
        }
        if now.saturating_duration_since(s.started) > self.timeout {
            s.running = false;
            WatchdogStatus::Expired
        } else {
            WatchdogStatus::Running
        }
    }
}
