//! Clock sessions and client handles.
//!
//! A [`ClkSession`] is one opened clock-control handle. Its desired clocks
//! live in an `ArcSwap<ArbTarget>` that the arbiter swaps wholesale, so
//! readers never see half of an update. Request handles committed by the
//! client wait on `targets` until the next arbiter pass folds them in.
//!
//! A [`ClkDev`] is one client handle (request or event). It refers back to
//! its session by [`SessionId`] only; the arbiter resolves the id through
//! the [`SessionRegistry`] when it needs the session.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex};

use super::notification::NotificationQueue;
use super::types::{ArbTarget, ClockDomain};
use crate::error::{GpuControlError, Result};

pub type SessionId = u64;
pub type DevId = u64;

// ============================================================================
// Session
// ============================================================================

/// One clock-control session.
pub struct ClkSession {
    id: SessionId,
    target: ArcSwap<ArbTarget>,
    /// Committed requests not yet folded in by the arbiter.
    targets: Mutex<Vec<Arc<ClkDev>>>,
    zombie: AtomicBool,
}

impl ClkSession {
    pub(crate) fn new(id: SessionId) -> Self {
        Self {
            id,
            target: ArcSwap::from_pointee(ArbTarget::IDLE),
            targets: Mutex::new(Vec::new()),
            zombie: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The target the arbiter last accepted for this session.
    pub fn target(&self) -> ArbTarget {
        **self.target.load()
    }

    pub(crate) fn swap_target(&self, target: ArbTarget) {
        self.target.store(Arc::new(target));
    }

    pub fn is_zombie(&self) -> bool {
        self.zombie.load(Ordering::Acquire)
    }

    pub(crate) fn mark_zombie(&self) {
        self.zombie.store(true, Ordering::Release);
    }

    pub(crate) fn push_request(&self, dev: Arc<ClkDev>) {
        self.targets.lock().push(dev);
    }

    /// Committed requests, most recent first.
    pub(crate) fn take_requests(&self) -> Vec<Arc<ClkDev>> {
        let mut targets = std::mem::take(&mut *self.targets.lock());
        targets.reverse();
        targets
    }

    pub fn pending_requests(&self) -> usize {
        self.targets.lock().len()
    }
}

impl std::fmt::Debug for ClkSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClkSession")
            .field("id", &self.id)
            .field("target", &self.target())
            .field("zombie", &self.is_zombie())
            .finish()
    }
}

/// Live sessions keyed by id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<BTreeMap<SessionId, Arc<ClkSession>>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self) -> Arc<ClkSession> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let session = Arc::new(ClkSession::new(id));
        self.sessions.lock().insert(id, Arc::clone(&session));
        session
    }

    pub fn remove(&self, id: SessionId) -> Option<Arc<ClkSession>> {
        self.sessions.lock().remove(&id)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<ClkSession>> {
        self.sessions.lock().get(&id).cloned()
    }

    /// Snapshot of all registered sessions, in id order.
    pub fn snapshot(&self) -> Vec<Arc<ClkSession>> {
        self.sessions.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Client handle
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClkDevKind {
    /// Carries a target request; completes once per arbiter pass.
    Request,
    /// Receives alarm notifications.
    Event,
}

/// One client handle.
pub struct ClkDev {
    id: DevId,
    session: SessionId,
    kind: ClkDevKind,
    pub(crate) queue: NotificationQueue,
    pub(crate) enabled_mask: AtomicU32,
    pub(crate) alarms_reported: AtomicU32,
    pub(crate) arb_queue_head: AtomicU32,
    poll_mask: AtomicU32,
    gpc2clk_target_mhz: AtomicU16,
    mclk_target_mhz: AtomicU16,
    /// Bumped on every post; waiters sleep on `readout`.
    events: Mutex<u64>,
    readout: Condvar,
}

impl ClkDev {
    pub(crate) fn new(
        id: DevId,
        session: SessionId,
        kind: ClkDevKind,
        queue_size: u32,
        enabled_mask: u32,
        arb_queue_head: u32,
    ) -> Result<Self> {
        Ok(Self {
            id,
            session,
            kind,
            queue: NotificationQueue::new(queue_size)?,
            enabled_mask: AtomicU32::new(enabled_mask),
            alarms_reported: AtomicU32::new(0),
            arb_queue_head: AtomicU32::new(arb_queue_head),
            poll_mask: AtomicU32::new(0),
            gpc2clk_target_mhz: AtomicU16::new(0),
            mclk_target_mhz: AtomicU16::new(0),
            events: Mutex::new(0),
            readout: Condvar::new(),
        })
    }

    pub fn id(&self) -> DevId {
        self.id
    }

    pub fn session_id(&self) -> SessionId {
        self.session
    }

    pub fn kind(&self) -> ClkDevKind {
        self.kind
    }

    pub fn enabled_mask(&self) -> u32 {
        self.enabled_mask.load(Ordering::Acquire)
    }

    pub fn alarms_reported(&self) -> u32 {
        self.alarms_reported.load(Ordering::Acquire)
    }

    /// This client's own notification queue.
    pub fn queue(&self) -> &NotificationQueue {
        &self.queue
    }

    pub fn target_mhz(&self, domain: ClockDomain) -> u16 {
        match domain {
            ClockDomain::Gpc2clk => self.gpc2clk_target_mhz.load(Ordering::Acquire),
            ClockDomain::Mclk => self.mclk_target_mhz.load(Ordering::Acquire),
        }
    }

    pub(crate) fn set_target_mhz(&self, domain: ClockDomain, mhz: u16) {
        match domain {
            ClockDomain::Gpc2clk => self.gpc2clk_target_mhz.store(mhz, Ordering::Release),
            ClockDomain::Mclk => self.mclk_target_mhz.store(mhz, Ordering::Release),
        }
    }

    /// Current poll readiness without consuming it.
    pub fn poll_mask(&self) -> u32 {
        self.poll_mask.load(Ordering::Acquire)
    }

    /// Consume the poll readiness.
    pub fn take_poll_mask(&self) -> u32 {
        self.poll_mask.swap(0, Ordering::AcqRel)
    }

    /// Raise `mask` and wake waiters.
    pub(crate) fn post_event(&self, mask: u32) {
        self.poll_mask.fetch_or(mask, Ordering::AcqRel);
        let mut events = self.events.lock();
        *events = events.wrapping_add(1);
        self.readout.notify_all();
    }

    /// Block until the poll mask is non-zero, then consume it.
    pub fn wait_event(&self, timeout: Duration) -> Result<u32> {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock();
        loop {
            let mask = self.take_poll_mask();
            if mask != 0 {
                return Ok(mask);
            }
            if self.readout.wait_until(&mut events, deadline).timed_out() {
                let mask = self.take_poll_mask();
                return if mask != 0 {
                    Ok(mask)
                } else {
                    Err(GpuControlError::Timeout(timeout))
                };
            }
        }
    }
}

impl std::fmt::Debug for ClkDev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClkDev")
            .field("id", &self.id)
            .field("session", &self.session)
            .field("kind", &self.kind)
            .field("enabled_mask", &format_args!("{:#x}", self.enabled_mask()))
            .field("poll_mask", &format_args!("{:#x}", self.poll_mask()))
            .finish()
    }
}
