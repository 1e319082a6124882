//! GPU channel: a GPFIFO ring plus the job tracking around it.
//!
//! Lock order: `ring` (submit lock) -> `sync` (sync lock) -> `jobs`.
//! Job cleanup takes `jobs` alone and `sync` only after dropping `jobs`.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use super::gpfifo::GpfifoRing;
use super::job::{ChannelJob, JobList};
use super::priv_cmdbuf::{PrivCmdQueue, PrivCmdState};
use super::sync::ChannelSync;
use super::vm::AddressSpace;
use super::watchdog::{ChannelWatchdog, WatchdogStatus};
use crate::config::ChannelConfig;
use crate::device::Device;
use crate::error::{GpuControlError, Result};

/// Error notifier values reported to the channel's owner.
pub mod error_notifier {
    pub const NONE: u32 = 0;
    pub const FIFO_ERROR_IDLE_TIMEOUT: u32 = 8;
    pub const RESETCHANNEL_VERIF_ERROR: u32 = 43;
}

const SEMA_SIZE: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSetupArgs {
    /// Power of two.
    pub num_gpfifo_entries: u32,
    /// Preallocated job slots; 0 allocates on demand.
    pub num_inflight_jobs: u32,
    pub deterministic: bool,
    /// User space writes the ring itself; kernel submits are refused.
    pub usermode: bool,
}

impl ChannelSetupArgs {
    pub fn from_config(cfg: &ChannelConfig) -> Self {
        Self {
            num_gpfifo_entries: cfg.num_gpfifo_entries,
            num_inflight_jobs: cfg.num_inflight_jobs,
            deterministic: false,
            usermode: false,
        }
    }
}

/// Job list and private command queue, guarded together.
#[derive(Debug, Default)]
pub(crate) struct JobState {
    pub(crate) list: Option<JobList>,
    pub(crate) priv_cmd_q: Option<PrivCmdQueue>,
}

pub struct Channel {
    chid: u32,
    self_ref: Weak<Channel>,
    device: Arc<Device>,
    pub(crate) ring: Mutex<Option<GpfifoRing>>,
    pub(crate) sync: Mutex<Option<Arc<ChannelSync>>>,
    pub(crate) jobs: Mutex<JobState>,
    vm: RwLock<Option<Arc<dyn AddressSpace>>>,
    wdt: ChannelWatchdog,
    /// Ring size once set up; 0 before.
    entry_num: AtomicU32,
    last_gp_get: AtomicU32,
    unserviceable: AtomicBool,
    error_notifier: AtomicU32,
    deterministic: AtomicBool,
    railgate_allowed: AtomicBool,
    usermode: AtomicBool,
    closed: AtomicBool,
    jobs_completed: AtomicU64,
}

impl Channel {
    pub(crate) fn new(device: Arc<Device>, chid: u32) -> Arc<Self> {
        let cfg = &device.config().channel;
        let wdt = ChannelWatchdog::new(
            cfg.watchdog_enabled,
            Duration::from_millis(cfg.watchdog_timeout_ms),
        );
        Arc::new_cyclic(|self_ref| Self {
            chid,
            self_ref: self_ref.clone(),
            device,
            ring: Mutex::new(None),
            sync: Mutex::new(None),
            jobs: Mutex::new(JobState::default()),
            vm: RwLock::new(None),
            wdt,
            entry_num: AtomicU32::new(0),
            last_gp_get: AtomicU32::new(0),
            unserviceable: AtomicBool::new(false),
            error_notifier: AtomicU32::new(error_notifier::NONE),
            deterministic: AtomicBool::new(false),
            railgate_allowed: AtomicBool::new(false),
            usermode: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            jobs_completed: AtomicU64::new(0),
        })
    }

    pub fn chid(&self) -> u32 {
        self.chid
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub(crate) fn weak(&self) -> Weak<Channel> {
        self.self_ref.clone()
    }

    pub fn watchdog(&self) -> &ChannelWatchdog {
        &self.wdt
    }

    pub fn vm(&self) -> Option<Arc<dyn AddressSpace>> {
        self.vm.read().clone()
    }

    pub fn bind_address_space(&self, vm: Arc<dyn AddressSpace>) {
        *self.vm.write() = Some(vm);
    }

    pub fn is_deterministic(&self) -> bool {
        self.deterministic.load(Ordering::Acquire)
    }

    pub fn railgate_allowed(&self) -> bool {
        self.railgate_allowed.load(Ordering::Acquire)
    }

    pub(crate) fn set_railgate_allowed(&self, allowed: bool) {
        self.railgate_allowed.store(allowed, Ordering::Release);
    }

    pub fn is_usermode(&self) -> bool {
        self.usermode.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Ring size, 0 when no kernel ring is set up.
    pub fn gpfifo_entry_num(&self) -> u32 {
        self.entry_num.load(Ordering::Acquire)
    }

    // ========================================================================
    // Setup
    // ========================================================================

    pub fn setup_gpfifo(&self, args: ChannelSetupArgs) -> Result<()> {
        if self.is_closed() {
            return Err(GpuControlError::InvalidArgument(format!("ch {} closed", self.chid)));
        }
        let n = args.num_gpfifo_entries;
        if n < 2 || !n.is_power_of_two() {
            return Err(GpuControlError::InvalidArgument(format!(
                "gpfifo entries {} not a power of two",
                n
            )));
        }
        let mut ring = self.ring.lock();
        if ring.is_some() || self.is_usermode() {
            return Err(GpuControlError::InvalidArgument(format!(
                "ch {} already set up",
                self.chid
            )));
        }
        let vm = self.vm().ok_or_else(|| {
            GpuControlError::InvalidArgument(format!("ch {} has no address space", self.chid))
        })?;

        if args.deterministic {
            let _busy = self.device.deterministic_busy.read();
            self.device.power().busy()?;
            self.deterministic.store(true, Ordering::Release);
        }

        let result = self.alloc_kernel_resources(&args, vm.as_ref(), &mut ring);
        if let Err(e) = &result {
            log::warn!("ch {}: setup failed: {}", self.chid, e);
            if args.deterministic {
                let _busy = self.device.deterministic_busy.read();
                self.deterministic.store(false, Ordering::Release);
                self.device.power().idle();
            }
        }
        result
    }

    fn alloc_kernel_resources(
        &self,
        args: &ChannelSetupArgs,
        vm: &dyn AddressSpace,
        ring: &mut Option<GpfifoRing>,
    ) -> Result<()> {
        let n = args.num_gpfifo_entries;
        self.device.userd().init_mem(self.chid, n);
        if args.usermode {
            self.usermode.store(true, Ordering::Release);
            log::debug!("ch {}: usermode submit, {} entries", self.chid, n);
            return Ok(());
        }

        let new_ring = GpfifoRing::new(n, vm.alloc_va(u64::from(n) * 8)?)?;

        let words = self.device.config().channel.priv_cmdbuf_words_per_job;
        let job_count = if args.num_inflight_jobs != 0 {
            args.num_inflight_jobs
        } else {
            n / 2
        };
        let q_gva = vm.alloc_va(u64::from(job_count) * u64::from(words) * 4)?;
        let priv_cmd_q = PrivCmdQueue::new(q_gva, job_count, words)?;
        let list = JobList::new(args.num_inflight_jobs)?;

        if !self.device.uses_dynamic_syncs() {
            let sync = ChannelSync::create(
                self.chid,
                self.device.syncpoints(),
                vm.alloc_va(SEMA_SIZE)?,
            )?;
            *self.sync.lock() = Some(Arc::new(sync));
        }

        {
            let mut jobs = self.jobs.lock();
            jobs.list = Some(list);
            jobs.priv_cmd_q = Some(priv_cmd_q);
        }
        *ring = Some(new_ring);
        self.entry_num.store(n, Ordering::Release);
        log::debug!(
            "ch {}: gpfifo {} entries, {} job slots{}",
            self.chid,
            n,
            args.num_inflight_jobs,
            if args.deterministic { ", deterministic" } else { "" }
        );
        Ok(())
    }

    /// Create (if needed) and return the channel sync. Caller holds the
    /// sync lock.
    pub(crate) fn get_or_create_sync(
        &self,
        slot: &mut Option<Arc<ChannelSync>>,
    ) -> Result<Arc<ChannelSync>> {
        if let Some(sync) = slot {
            return Ok(Arc::clone(sync));
        }
        let vm = self.vm().ok_or_else(|| {
            GpuControlError::InvalidArgument(format!("ch {} has no address space", self.chid))
        })?;
        let sync = Arc::new(ChannelSync::create(
            self.chid,
            self.device.syncpoints(),
            vm.alloc_va(SEMA_SIZE)?,
        )?);
        *slot = Some(Arc::clone(&sync));
        Ok(sync)
    }

    // ========================================================================
    // Ring state
    // ========================================================================

    /// Free slots by the cached GET.
    pub fn gpfifo_free_count(&self) -> u32 {
        self.ring.lock().as_ref().map_or(0, GpfifoRing::free_count)
    }

    /// Re-read GET from the hardware, then count free slots.
    pub fn update_gpfifo_get_and_free_count(&self) -> u32 {
        match self.ring.lock().as_mut() {
            Some(ring) => self.refresh_get(ring),
            None => 0,
        }
    }

    pub(crate) fn refresh_get(&self, ring: &mut GpfifoRing) -> u32 {
        let get = self.device.userd().gp_get(self.chid);
        ring.set_get(get);
        self.last_gp_get.store(ring.get(), Ordering::Release);
        ring.free_count()
    }

    /// `(put, get)` of the kernel ring.
    pub fn gpfifo_state(&self) -> Option<(u32, u32)> {
        self.ring.lock().as_ref().map(|r| (r.put(), r.get()))
    }

    pub fn num_jobs(&self) -> usize {
        self.jobs.lock().list.as_ref().map_or(0, JobList::len)
    }

    pub fn jobs_completed(&self) -> u64 {
        self.jobs_completed.load(Ordering::Relaxed)
    }

    /// Job slots taken by submits that have not committed yet.
    pub fn job_slots_reserved(&self) -> u32 {
        self.jobs.lock().list.as_ref().map_or(0, JobList::reserved)
    }

    pub fn priv_cmdbuf_state(&self) -> Option<PrivCmdState> {
        self.jobs.lock().priv_cmd_q.as_ref().map(PrivCmdQueue::state)
    }

    pub fn sync(&self) -> Option<Arc<ChannelSync>> {
        self.sync.lock().clone()
    }

    // ========================================================================
    // Errors
    // ========================================================================

    pub fn set_unserviceable(&self) {
        self.unserviceable.store(true, Ordering::Release);
    }

    pub fn is_unserviceable(&self) -> bool {
        self.unserviceable.load(Ordering::Acquire)
    }

    pub fn error_notifier(&self) -> u32 {
        self.error_notifier.load(Ordering::Acquire)
    }

    /// Record `error` unless an earlier error is already reported.
    pub fn set_error_notifier(&self, error: u32) {
        let _ = self.error_notifier.compare_exchange(
            error_notifier::NONE,
            error,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Kill the channel: no further submits, every pending fence expires,
    /// jobs are reclaimed.
    pub fn abort(&self, channel_preempt: bool) {
        log::info!("ch {}: abort (preempt {})", self.chid, channel_preempt);
        self.set_error_notifier(error_notifier::RESETCHANNEL_VERIF_ERROR);
        self.set_unserviceable();
        if channel_preempt {
            self.wdt.stop();
        }
        if let Some(sync) = self.sync.lock().as_ref() {
            sync.set_safe_state();
        }
        self.clean_up_jobs();
    }

    /// Check the watchdog against the hardware GET.
    pub fn check_watchdog(&self) -> WatchdogStatus {
        let get = self.device.userd().gp_get(self.chid);
        let status = self.wdt.check(get);
        if status == WatchdogStatus::Expired {
            log::error!(
                "ch {}: no progress for {:?}, get {}",
                self.chid,
                self.wdt.timeout(),
                get
            );
            self.set_error_notifier(error_notifier::FIFO_ERROR_IDLE_TIMEOUT);
            self.abort(true);
        }
        status
    }

    // ========================================================================
    // Job cleanup
    // ========================================================================

    /// Reclaim every completed job in submit order. Returns how many.
    pub fn clean_up_jobs(&self) -> usize {
        self.clean_up(usize::MAX, false)
    }

    /// Reclaim at most one completed job.
    pub fn clean_up_deterministic_job(&self) -> usize {
        self.clean_up(1, false)
    }

    /// Queue [`Channel::clean_up_jobs`] on the device's channel worker.
    pub fn update(&self) {
        self.device.schedule_channel_update(self.chid);
    }

    fn clean_up(&self, max: usize, force: bool) -> usize {
        let wdt_was_running = self.wdt.stop();
        let (done, remaining) = {
            let mut state = self.jobs.lock();
            let JobState { list, priv_cmd_q } = &mut *state;
            let Some(list) = list.as_mut() else {
                return 0;
            };
            let mut done = Vec::new();
            while done.len() < max {
                match list.front() {
                    Some(job) if force || job.is_complete() => {}
                    _ => break,
                }
                let Some(mut job) = list.pop_front() else {
                    break;
                };
                if let Some(q) = priv_cmd_q.as_mut() {
                    if let Some(cmd) = job.wait_cmd.take() {
                        q.free(cmd);
                    }
                    if let Some(cmd) = job.incr_cmd.take() {
                        q.free(cmd);
                    }
                }
                done.push(job);
            }
            (done, list.len())
        };

        if wdt_was_running && remaining > 0 {
            self.wdt.restart(self.last_gp_get.load(Ordering::Acquire));
        }

        let count = done.len();
        for job in done {
            self.release_job(job);
        }
        if count > 0 {
            self.jobs_completed.fetch_add(count as u64, Ordering::Relaxed);
            log::trace!("ch {}: reclaimed {} jobs, {} left", self.chid, count, remaining);
        }
        count
    }

    /// Drop what a finished (or rolled back) job holds.
    pub(crate) fn release_job(&self, mut job: ChannelJob) {
        if !job.mapped_buffers.is_empty() {
            if let Some(vm) = self.vm() {
                vm.put_buffers(std::mem::take(&mut job.mapped_buffers));
            }
        }
        job.post_fence = None;
        if job.sync_ref {
            self.put_sync_ref();
        }
        if job.power_ref {
            self.device.power().idle();
        }
    }

    /// Drop a job's dynamic sync reference, destroying the sync when it was
    /// the last one and the device is short on syncs.
    pub(crate) fn put_sync_ref(&self) {
        let mut slot = self.sync.lock();
        let destroy = match slot.as_ref() {
            Some(sync) => sync.put_ref_and_check() && self.device.aggressive_sync_destroy(),
            None => false,
        };
        if destroy {
            log::debug!("ch {}: destroying idle sync", self.chid);
            *slot = None;
        }
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Release everything the channel holds. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("ch {}: close", self.chid);
        self.wdt.disable();
        if let Some(sync) = self.sync.lock().as_ref() {
            sync.set_safe_state();
        }
        self.clean_up(usize::MAX, true);

        {
            let mut jobs = self.jobs.lock();
            jobs.list = None;
            jobs.priv_cmd_q = None;
        }
        *self.ring.lock() = None;
        *self.sync.lock() = None;
        self.entry_num.store(0, Ordering::Release);

        if self.is_deterministic() {
            let _busy = self.device.deterministic_busy.read();
            self.deterministic.store(false, Ordering::Release);
            if !self.railgate_allowed.swap(false, Ordering::AcqRel) {
                self.device.power().idle();
            }
        }
        self.device.release_chid(self.chid);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("chid", &self.chid)
            .field("gpfifo", &self.gpfifo_state())
            .field("jobs", &self.num_jobs())
            .field("deterministic", &self.is_deterministic())
            .field("unserviceable", &self.is_unserviceable())
            .finish()
    }
}
