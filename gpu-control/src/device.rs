//! Device context shared by every channel and the clock arbiter.
//!
//! Owns the collaborators the submission core talks to (power, USERD,
//! syncpoints, sync-fds), the channel registry and the channel worker that
//! runs deferred job cleanup.
//!
//! ```text
//!   Device ──┬── PowerBackend      busy()/idle() references
//!            ├── Userd             GP_GET / GP_PUT
//!            ├── SyncpointManager  (absent: semaphore tracking)
//!            ├── SyncFdTable
//!            ├── channels          chid -> Weak<Channel>
//!            ├── channel worker    ChannelWorkItem(chid) -> clean_up_jobs
//!            └── ClkArbiter        (optional)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, RwLock, RwLockWriteGuard};

use crate::clk_arb::{ClkArbiter, ClockBackend, TableClockBackend};
use crate::config::{load_config, DeviceConfig};
use crate::error::{GpuControlError, Result};
use crate::fifo::channel::Channel;
use crate::fifo::fence::SyncFdTable;
use crate::fifo::syncpoint::SyncpointManager;
use crate::fifo::userd::{SimUserd, Userd};
use crate::fifo::watchdog::WatchdogStatus;
use crate::worker::{WorkItem, Worker};

// ============================================================================
// Power
// ============================================================================

/// Power references: the GPU may power-gate while none are held.
pub trait PowerBackend: Send + Sync {
    /// Take a reference, powering the GPU up if needed. May block.
    fn busy(&self) -> Result<()>;

    /// Drop a reference taken by `busy`.
    fn idle(&self);
}

/// Counting power backend.
#[derive(Debug, Default)]
pub struct PowerRefCounter {
    refs: AtomicI64,
    busy_calls: AtomicU64,
    fail_busy: AtomicBool,
}

impl PowerRefCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refs(&self) -> i64 {
        self.refs.load(Ordering::Acquire)
    }

    pub fn busy_calls(&self) -> u64 {
        self.busy_calls.load(Ordering::Relaxed)
    }

    pub fn is_powered(&self) -> bool {
        self.refs() > 0
    }

    /// Make `busy` fail, for exercising submit rollback.
    pub fn set_fail_busy(&self, fail: bool) {
        self.fail_busy.store(fail, Ordering::Relaxed);
    }
}

impl PowerBackend for PowerRefCounter {
    fn busy(&self) -> Result<()> {
        self.busy_calls.fetch_add(1, Ordering::Relaxed);
        if self.fail_busy.load(Ordering::Relaxed) {
            return Err(GpuControlError::Backend("power on failed".into()));
        }
        self.refs.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn idle(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        if prev <= 0 {
            log::error!("power: idle without busy (refs {})", prev);
        }
    }
}

// ============================================================================
// Channel worker
// ============================================================================

/// Deferred cleanup for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelWorkItem {
    pub chid: u32,
}

impl WorkItem for ChannelWorkItem {
    type Key = u32;

    fn key(&self) -> u32 {
        self.chid
    }
}

#[derive(Debug, Default)]
struct ChannelSlots {
    open: HashMap<u32, Weak<Channel>>,
    free: Vec<u32>,
    next_chid: u32,
}

// ============================================================================
// Device
// ============================================================================

pub struct Device {
    config: DeviceConfig,
    power: Arc<dyn PowerBackend>,
    userd: Arc<dyn Userd>,
    syncpoints: Option<Arc<SyncpointManager>>,
    sync_fds: SyncFdTable,
    /// Read side: deterministic submits. Write side: idle/unidle.
    pub(crate) deterministic_busy: RwLock<()>,
    channels: Mutex<ChannelSlots>,
    aggressive_sync_destroy: AtomicBool,
    channel_worker: OnceLock<Worker<ChannelWorkItem>>,
    clk_arb: Option<Arc<ClkArbiter>>,
    dying: AtomicBool,
}

/// Builds a [`Device`], defaulting every collaborator to its in-process
/// implementation.
pub struct DeviceBuilder {
    config: DeviceConfig,
    power: Option<Arc<dyn PowerBackend>>,
    userd: Option<Arc<dyn Userd>>,
    clock_backend: Option<Arc<dyn ClockBackend>>,
}

impl DeviceBuilder {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            power: None,
            userd: None,
            clock_backend: None,
        }
    }

    /// Builder over the config at the default path (`GPU_CONTROL_CONFIG`,
    /// else `~/.gpu-control/config.json`), or the defaults when it is absent.
    pub fn from_default_config() -> Result<Self> {
        Ok(Self::new(load_config()?))
    }

    pub fn power(mut self, power: Arc<dyn PowerBackend>) -> Self {
        self.power = Some(power);
        self
    }

    pub fn userd(mut self, userd: Arc<dyn Userd>) -> Self {
        self.userd = Some(userd);
        self
    }

    pub fn clock_backend(mut self, backend: Arc<dyn ClockBackend>) -> Self {
        self.clock_backend = Some(backend);
        self
    }

    pub fn build(self) -> Result<Arc<Device>> {
        let config = self.config;
        config.validate()?;

        let clk_arb = if config.clk_arb.enabled {
            let backend = match self.clock_backend {
                Some(b) => b,
                None => Arc::new(TableClockBackend::new(config.clock_table.clone())),
            };
            Some(ClkArbiter::new(config.clk_arb.clone(), backend)?)
        } else {
            None
        };

        let syncpoints = config
            .has_syncpoints
            .then(|| Arc::new(SyncpointManager::new(config.num_syncpoints)));

        let device = Arc::new(Device {
            power: self.power.unwrap_or_else(|| Arc::new(PowerRefCounter::new())),
            userd: self.userd.unwrap_or_else(|| Arc::new(SimUserd::new())),
            syncpoints,
            sync_fds: SyncFdTable::new(),
            deterministic_busy: RwLock::new(()),
            channels: Mutex::new(ChannelSlots::default()),
            aggressive_sync_destroy: AtomicBool::new(false),
            channel_worker: OnceLock::new(),
            clk_arb,
            dying: AtomicBool::new(false),
            config,
        });

        let weak: Weak<Device> = Arc::downgrade(&device);
        let worker = Worker::spawn("gpu-channel", move |item: ChannelWorkItem| {
            let Some(device) = weak.upgrade() else {
                return;
            };
            if let Some(ch) = device.channel(item.chid) {
                ch.clean_up_jobs();
            }
        })?;
        let _ = device.channel_worker.set(worker);

        log::info!(
            "{}: device up (syncpoints: {}, clk_arb: {})",
            device.config.name,
            device.syncpoints.is_some(),
            device.clk_arb.is_some()
        );
        Ok(device)
    }
}

impl Device {
    /// Device with default collaborators.
    pub fn new(config: DeviceConfig) -> Result<Arc<Self>> {
        DeviceBuilder::new(config).build()
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn power(&self) -> &Arc<dyn PowerBackend> {
        &self.power
    }

    pub fn userd(&self) -> &Arc<dyn Userd> {
        &self.userd
    }

    pub fn syncpoints(&self) -> Option<&Arc<SyncpointManager>> {
        self.syncpoints.as_ref()
    }

    pub fn sync_fds(&self) -> &SyncFdTable {
        &self.sync_fds
    }

    pub fn clk_arb(&self) -> Option<&Arc<ClkArbiter>> {
        self.clk_arb.as_ref()
    }

    pub fn is_dying(&self) -> bool {
        self.dying.load(Ordering::Acquire)
    }

    /// Syncs are created per submit and refcounted.
    pub fn uses_dynamic_syncs(&self) -> bool {
        self.config.aggressive_sync_destroy_thresh != 0
    }

    /// Idle dynamic syncs are destroyed.
    pub fn aggressive_sync_destroy(&self) -> bool {
        self.aggressive_sync_destroy.load(Ordering::Acquire)
    }

    // ========================================================================
    // Channels
    // ========================================================================

    pub fn open_channel(self: &Arc<Self>) -> Result<Arc<Channel>> {
        if self.is_dying() {
            return Err(GpuControlError::NoDevice("driver is dying".into()));
        }
        let mut slots = self.channels.lock();
        let chid = match slots.free.pop() {
            Some(chid) => chid,
            None if slots.next_chid < self.config.channel.max_channels => {
                slots.next_chid += 1;
                slots.next_chid - 1
            }
            None => return Err(GpuControlError::ResourceExhausted("channels".into())),
        };
        let ch = Channel::new(Arc::clone(self), chid);
        slots.open.insert(chid, Arc::downgrade(&ch));

        let thresh = self.config.aggressive_sync_destroy_thresh;
        if thresh != 0 && slots.open.len() as u32 > thresh {
            self.aggressive_sync_destroy.store(true, Ordering::Release);
        }
        log::debug!("{}: opened channel {}", self.config.name, chid);
        Ok(ch)
    }

    pub(crate) fn release_chid(&self, chid: u32) {
        let mut slots = self.channels.lock();
        if slots.open.remove(&chid).is_some() {
            slots.free.push(chid);
        }
        let thresh = self.config.aggressive_sync_destroy_thresh;
        if thresh != 0 && (slots.open.len() as u32) < thresh {
            self.aggressive_sync_destroy.store(false, Ordering::Release);
        }
    }

    pub fn channel(&self, chid: u32) -> Option<Arc<Channel>> {
        self.channels.lock().open.get(&chid).and_then(Weak::upgrade)
    }

    fn open_channels(&self) -> Vec<Arc<Channel>> {
        self.channels
            .lock()
            .open
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn num_channels(&self) -> usize {
        self.channels.lock().open.len()
    }

    /// Queue job cleanup for `chid` on the channel worker.
    pub fn schedule_channel_update(&self, chid: u32) {
        if let Some(worker) = self.channel_worker.get() {
            worker.enqueue(ChannelWorkItem { chid });
        }
    }

    /// Wait for queued channel cleanups.
    pub fn flush_channel_worker(&self) -> Result<()> {
        match self.channel_worker.get() {
            Some(worker) => worker.flush(),
            None => Ok(()),
        }
    }

    /// Check every channel's watchdog; returns the channels that expired.
    pub fn check_watchdogs(&self) -> Vec<u32> {
        self.open_channels()
            .into_iter()
            .filter(|ch| ch.check_watchdog() == WatchdogStatus::Expired)
            .map(|ch| ch.chid())
            .collect()
    }

    // ========================================================================
    // Deterministic channels
    // ========================================================================

    /// Let the GPU power-gate even though deterministic channels are open.
    ///
    /// Drops each deterministic channel's lifetime power reference and holds
    /// off deterministic submits until the returned guard is dropped (or
    /// [`DeterministicIdle::unidle`] is called), which retakes them.
    pub fn deterministic_idle(&self) -> DeterministicIdle<'_> {
        let busy = self.deterministic_busy.write();
        for ch in self.open_channels() {
            if ch.is_deterministic() && !ch.railgate_allowed() {
                self.power.idle();
            }
        }
        log::debug!("{}: deterministic idle", self.config.name);
        DeterministicIdle {
            device: self,
            _busy: busy,
        }
    }

    fn deterministic_unidle(&self) {
        for ch in self.open_channels() {
            if ch.is_deterministic() && !ch.railgate_allowed() {
                if let Err(e) = self.power.busy() {
                    log::error!("ch {}: cannot retake power ref: {}", ch.chid(), e);
                }
            }
        }
        log::debug!("{}: deterministic unidle", self.config.name);
    }

    /// Allow or disallow power-gating while deterministic channel `ch` is
    /// open. A channel with railgating allowed may not submit.
    pub fn set_deterministic_railgate_allowed(&self, ch: &Channel, allowed: bool) -> Result<()> {
        let _busy = self.deterministic_busy.write();
        if !ch.is_deterministic() {
            return Err(GpuControlError::InvalidArgument(format!(
                "ch {} is not deterministic",
                ch.chid()
            )));
        }
        match (allowed, ch.railgate_allowed()) {
            (true, false) => {
                self.power.idle();
                ch.set_railgate_allowed(true);
            }
            (false, true) => {
                self.power.busy()?;
                ch.set_railgate_allowed(false);
            }
            _ => {}
        }
        Ok(())
    }

    /// Refuse new work, then stop the workers.
    pub fn shutdown(&self) -> Result<()> {
        self.dying.store(true, Ordering::Release);
        if let Some(arb) = &self.clk_arb {
            arb.shutdown()?;
        }
        match self.channel_worker.get() {
            Some(worker) => worker.stop(),
            None => Ok(()),
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        log::debug!("{}: device torn down", self.config.name);
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.config.name)
            .field("channels", &self.num_channels())
            .field("syncpoints", &self.syncpoints)
            .field("clk_arb", &self.clk_arb.is_some())
            .field("dying", &self.is_dying())
            .finish()
    }
}

/// Write side of `deterministic_busy`, held between idle and unidle.
pub struct DeterministicIdle<'a> {
    device: &'a Device,
    _busy: RwLockWriteGuard<'a, ()>,
}

impl DeterministicIdle<'_> {
    pub fn unidle(self) {}
}

impl Drop for DeterministicIdle<'_> {
    fn drop(&mut self) {
        self.device.deterministic_unidle();
    }
}
