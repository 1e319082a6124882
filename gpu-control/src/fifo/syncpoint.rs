//! Hardware sync primitives: syncpoints and semaphores.
//!
//! Both are monotonically increasing 32-bit counters with two halves:
//! `max` is what the CPU has promised (reserved thresholds for submitted
//! increments) and `value` is what the GPU has actually reached. A
//! threshold is expired once `value` passes it, compared with wrapping
//! arithmetic so the counters may roll over.
//!
//! Waiters either block on a condvar or register a one-shot notifier that
//! fires when the threshold is reached (the job-completion interrupt).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{GpuControlError, Result};

/// Reserved id; never handed out.
pub const INVALID_SYNCPT_ID: u32 = 0;

/// Whether `value` has reached `thresh`, handling wrap-around.
#[inline]
pub fn threshold_reached(value: u32, thresh: u32) -> bool {
    (value.wrapping_sub(thresh) as i32) >= 0
}

type Notifier = Box<dyn FnOnce() + Send>;

// ============================================================================
// Timeline
// ============================================================================

/// One counter pair with waiters.
pub struct Timeline {
    value: AtomicU32,
    max: AtomicU32,
    notifiers: Mutex<Vec<(u32, Notifier)>>,
    wait_lock: Mutex<()>,
    wait_cv: Condvar,
}

impl Timeline {
    fn new() -> Self {
        Self {
            value: AtomicU32::new(0),
            max: AtomicU32::new(0),
            notifiers: Mutex::new(Vec::new()),
            wait_lock: Mutex::new(()),
            wait_cv: Condvar::new(),
        }
    }

    pub fn value(&self) -> u32 {
        self.value.load(Ordering::Acquire)
    }

    pub fn max(&self) -> u32 {
        self.max.load(Ordering::Acquire)
    }

    /// Reserve `incrs` future increments; returns the new threshold.
    pub fn incr_max(&self, incrs: u32) -> u32 {
        self.max.fetch_add(incrs, Ordering::AcqRel).wrapping_add(incrs)
    }

    /// Undo the most recent `incr_max` if it is still the latest
    /// reservation. Returns whether it was undone.
    pub fn release_max(&self, thresh: u32, incrs: u32) -> bool {
        self.max
            .compare_exchange(
                thresh,
                thresh.wrapping_sub(incrs),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn is_expired(&self, thresh: u32) -> bool {
        threshold_reached(self.value(), thresh)
    }

    /// GPU side: advance by one. Returns the new value.
    pub fn increment(&self) -> u32 {
        let value = self.value.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        self.wake(value);
        value
    }

    /// Force `value` up to `max`, expiring every outstanding threshold.
    pub fn set_min_eq_max(&self) {
        let max = self.max();
        self.value.store(max, Ordering::Release);
        self.wake(max);
    }

    fn wake(&self, value: u32) {
        let ready: Vec<Notifier> = {
            let mut notifiers = self.notifiers.lock();
            let mut ready = Vec::new();
            let mut i = 0;
            while i < notifiers.len() {
                if threshold_reached(value, notifiers[i].0) {
                    ready.push(notifiers.swap_remove(i).1);
                } else {
                    i += 1;
                }
            }
            ready
        };
        {
            let _guard = self.wait_lock.lock();
            self.wait_cv.notify_all();
        }
        for notifier in ready {
            notifier();
        }
    }

    /// Run `notifier` once `thresh` is reached; immediately if it already is.
    pub fn register_notifier(&self, thresh: u32, notifier: Notifier) {
        {
            let mut notifiers = self.notifiers.lock();
            if !self.is_expired(thresh) {
                notifiers.push((thresh, notifier));
                return;
            }
        }
        notifier();
    }

    /// Block until `thresh` is reached.
    pub fn wait(&self, thresh: u32, timeout: Duration) -> Result<()> {
        if self.is_expired(thresh) {
            return Ok(());
        }
        let deadline = Instant::now() + timeout;
        let mut guard = self.wait_lock.lock();
        while !self.is_expired(thresh) {
            if self.wait_cv.wait_until(&mut guard, deadline).timed_out() {
                return if self.is_expired(thresh) {
                    Ok(())
                } else {
                    Err(GpuControlError::Timeout(timeout))
                };
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Timeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timeline")
            .field("value", &self.value())
            .field("max", &self.max())
            .finish()
    }
}

// ============================================================================
// Syncpoints
// ============================================================================

/// Pool of hardware syncpoints.
pub struct SyncpointManager {
    points: Box<[Timeline]>,
    allocated: Box<[AtomicBool]>,
    alloc_lock: Mutex<()>,
}

impl SyncpointManager {
    /// `num` syncpoints; id 0 is reserved.
    pub fn new(num: u32) -> Self {
        let points: Vec<Timeline> = (0..num).map(|_| Timeline::new()).collect();
        let allocated: Vec<AtomicBool> = (0..num).map(|i| AtomicBool::new(i == 0)).collect();
        Self {
            points: points.into_boxed_slice(),
            allocated: allocated.into_boxed_slice(),
            alloc_lock: Mutex::new(()),
        }
    }

    pub fn num_syncpoints(&self) -> u32 {
        self.points.len() as u32
    }

    /// Hand out a free syncpoint. Its value and max start equal.
    pub fn alloc(&self) -> Result<u32> {
        let _guard = self.alloc_lock.lock();
        for (id, used) in self.allocated.iter().enumerate().skip(1) {
            if !used.load(Ordering::Acquire) {
                used.store(true, Ordering::Release);
                let point = &self.points[id];
                point.max.store(point.value(), Ordering::Release);
                log::trace!("syncpoint: allocated {}", id);
                return Ok(id as u32);
            }
        }
        Err(GpuControlError::ResourceExhausted("syncpoints".into()))
    }

    /// Return `id` to the pool, expiring anything still pending on it.
    pub fn free(&self, id: u32) {
        let _guard = self.alloc_lock.lock();
        if let Some(point) = self.point(id) {
            point.set_min_eq_max();
            self.allocated[id as usize].store(false, Ordering::Release);
            log::trace!("syncpoint: freed {}", id);
        }
    }

    /// Whether `id` names a real syncpoint.
    pub fn is_valid(&self, id: u32) -> bool {
        id != INVALID_SYNCPT_ID && (id as usize) < self.points.len()
    }

    pub fn is_allocated(&self, id: u32) -> bool {
        self.is_valid(id) && self.allocated[id as usize].load(Ordering::Acquire)
    }

    fn point(&self, id: u32) -> Option<&Timeline> {
        if self.is_valid(id) {
            Some(&self.points[id as usize])
        } else {
            None
        }
    }

    fn checked(&self, id: u32) -> Result<&Timeline> {
        self.point(id)
            .ok_or_else(|| GpuControlError::InvalidArgument(format!("invalid syncpoint {}", id)))
    }

    pub fn timeline(&self, id: u32) -> Result<&Timeline> {
        self.checked(id)
    }

    pub fn value(&self, id: u32) -> u32 {
        self.point(id).map_or(0, Timeline::value)
    }

    pub fn max(&self, id: u32) -> u32 {
        self.point(id).map_or(0, Timeline::max)
    }

    pub fn incr_max(&self, id: u32, incrs: u32) -> Result<u32> {
        Ok(self.checked(id)?.incr_max(incrs))
    }

    pub fn release_max(&self, id: u32, thresh: u32, incrs: u32) -> bool {
        self.point(id)
            .is_some_and(|p| p.release_max(thresh, incrs))
    }

    /// GPU side: advance `id` by one. Returns the new value, 0 for an
    /// invalid id.
    pub fn increment(&self, id: u32) -> u32 {
        match self.point(id) {
            Some(point) => {
                let value = point.increment();
                log::trace!("syncpoint[{}] incremented to {}", id, value);
                value
            }
            None => {
                log::warn!("syncpoint: increment out of range id={}", id);
                0
            }
        }
    }

    /// Advance `id` until every reserved threshold has expired.
    pub fn complete_all(&self, id: u32) {
        if let Some(point) = self.point(id) {
            while !point.is_expired(point.max()) {
                point.increment();
            }
        }
    }

    pub fn is_expired(&self, id: u32, thresh: u32) -> bool {
        self.point(id).is_some_and(|p| p.is_expired(thresh))
    }

    pub fn set_min_eq_max(&self, id: u32) {
        if let Some(point) = self.point(id) {
            point.set_min_eq_max();
        }
    }

    pub fn wait(&self, id: u32, thresh: u32, timeout: Duration) -> Result<()> {
        self.checked(id)?.wait(thresh, timeout)
    }

    pub fn register_notifier(&self, id: u32, thresh: u32, notifier: Notifier) -> Result<()> {
        self.checked(id)?.register_notifier(thresh, notifier);
        Ok(())
    }
}

impl std::fmt::Debug for SyncpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let used = self
            .allocated
            .iter()
            .skip(1)
            .filter(|a| a.load(Ordering::Relaxed))
            .count();
        f.debug_struct("SyncpointManager")
            .field("num", &self.points.len())
            .field("allocated", &used)
            .finish()
    }
}

// ============================================================================
// Semaphores
// ============================================================================

/// A GPU semaphore: a timeline living in GPU-visible memory.
#[derive(Debug)]
pub struct Semaphore {
    timeline: Timeline,
    gva: u64,
}

impl Semaphore {
    pub fn new(gva: u64) -> Self {
        Self {
            timeline: Timeline::new(),
            gva,
        }
    }

    pub fn gva(&self) -> u64 {
        self.gva
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    /// GPU side: release the next value.
    pub fn release(&self) -> u32 {
        self.timeline.increment()
    }
}
