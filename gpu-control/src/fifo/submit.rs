//! GPFIFO submission.
//!
//! ```text
//!  preconditions ──> [power ref] ──> submit lock ──> capacity (GET re-read once)
//!                                                     │
//!        untracked: append entries ───────────────────┤
//!                                                     │
//!        tracked:   job slot ─> syncs (wait, incr) ─> append [wait] entries incr
//!                   ─> add job (buffer refs, watchdog) ─> mark progress
//!                                                     │
//!                                    release fence ─> PUT
//! ```
//!
//! A tracked submit that fails after the job slot was taken is rolled back:
//! ring `put`, priv cmd queue, job list, sync thresholds and references are
//! left exactly as they were.

use std::ops::BitOr;
use std::sync::atomic::{self, Ordering};
use std::sync::Arc;

use super::channel::{Channel, JobState};
use super::fence::{Fence, UserFence};
use super::gpfifo::{GpfifoEntry, GpfifoRing, EXTRA_GPFIFO_ENTRIES};
use super::job::ChannelJob;
use super::priv_cmdbuf::PrivCmdEntry;
use super::profile::{SubmitProfile, SubmitStage};
use super::sync::ChannelSync;
use crate::error::{GpuControlError, Result};

/// Submit flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitFlags(u32);

impl SubmitFlags {
    /// Wait for the pre-fence before running the entries.
    pub const FENCE_WAIT: Self = Self(1 << 0);
    /// Return a post fence.
    pub const FENCE_GET: Self = Self(1 << 1);
    /// Entries are already in hardware format.
    pub const HW_FORMAT: Self = Self(1 << 2);
    /// Fences are sync-fds rather than raw syncpoints.
    pub const SYNC_FENCE: Self = Self(1 << 3);
    /// No wait-for-idle ahead of the post-fence increment.
    pub const SUPPRESS_WFI: Self = Self(1 << 4);
    /// Do not pin the address space's buffers for the job.
    pub const SKIP_BUFFER_REFCOUNTING: Self = Self(1 << 5);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for SubmitFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Pre-fence: a raw syncpoint `{id, value}`, or with SYNC_FENCE a sync-fd in
/// `id`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelFence {
    pub id: u32,
    pub value: u32,
}

/// Entries living in caller memory that may fault while copied.
pub trait UserGpfifo {
    fn num_entries(&self) -> u32;

    /// Copy entries `start..start + dst.len()` into `dst`.
    fn copy_entries(&self, start: u32, dst: &mut [GpfifoEntry]) -> Result<()>;
}

/// User buffer of entries, optionally faulting at one index.
#[derive(Debug, Clone, Default)]
pub struct UserBuffer {
    pub entries: Vec<GpfifoEntry>,
    pub fault_at: Option<u32>,
}

impl UserBuffer {
    pub fn new(entries: Vec<GpfifoEntry>) -> Self {
        Self {
            entries,
            fault_at: None,
        }
    }
}

impl UserGpfifo for UserBuffer {
    fn num_entries(&self) -> u32 {
        self.entries.len() as u32
    }

    fn copy_entries(&self, start: u32, dst: &mut [GpfifoEntry]) -> Result<()> {
        let end = start as usize + dst.len();
        if let Some(at) = self.fault_at {
            if (start..end as u32).contains(&at) {
                return Err(GpuControlError::InvalidArgument(format!(
                    "fault copying gpfifo entry {}",
                    at
                )));
            }
        }
        let src = self.entries.get(start as usize..end).ok_or_else(|| {
            GpuControlError::InvalidArgument("gpfifo copy out of bounds".into())
        })?;
        dst.copy_from_slice(src);
        Ok(())
    }
}

pub enum GpfifoSource<'a> {
    Kernel(&'a [GpfifoEntry]),
    User(&'a dyn UserGpfifo),
}

impl GpfifoSource<'_> {
    pub fn num_entries(&self) -> u32 {
        match self {
            GpfifoSource::Kernel(entries) => entries.len() as u32,
            GpfifoSource::User(user) => user.num_entries(),
        }
    }

    /// Copy into the ring at `put` and advance it. On error `put` is
    /// unchanged.
    fn append_to(&self, ring: &mut GpfifoRing) -> Result<()> {
        let n = self.num_entries();
        match self {
            GpfifoSource::Kernel(entries) => ring.append(entries),
            GpfifoSource::User(user) => {
                let (first, second) = ring.slots_from_put(n);
                let split = first.len() as u32;
                user.copy_entries(0, first)?;
                user.copy_entries(split, second)?;
                ring.advance(n);
            }
        }
        Ok(())
    }
}

// ============================================================================
// Entry points
// ============================================================================

/// Submit entries from kernel memory. Returns the post fence when
/// `FENCE_GET` is set.
pub fn submit_gpfifo_kernel(
    c: &Channel,
    entries: &[GpfifoEntry],
    flags: SubmitFlags,
    fence: Option<ChannelFence>,
) -> Result<Option<Fence>> {
    submit_gpfifo(c, GpfifoSource::Kernel(entries), flags, fence, None)
}

/// Submit entries from user memory. The post fence comes back as a sync-fd
/// with `SYNC_FENCE`, as a raw syncpoint otherwise.
pub fn submit_gpfifo_user(
    c: &Channel,
    entries: &dyn UserGpfifo,
    flags: SubmitFlags,
    fence: Option<ChannelFence>,
    profile: Option<&mut SubmitProfile>,
) -> Result<Option<UserFence>> {
    let post = submit_gpfifo(c, GpfifoSource::User(entries), flags, fence, profile)?;
    Ok(post.and_then(|f| f.extract_user(c.device().sync_fds())))
}

pub fn submit_gpfifo(
    c: &Channel,
    src: GpfifoSource<'_>,
    flags: SubmitFlags,
    fence_in: Option<ChannelFence>,
    mut profile: Option<&mut SubmitProfile>,
) -> Result<Option<Fence>> {
    if let Some(p) = profile.as_deref_mut() {
        p.begin();
    }
    let device = Arc::clone(c.device());
    let chid = c.chid();
    let num_entries = src.num_entries();

    if device.is_dying() {
        return Err(GpuControlError::NoDevice("driver is dying".into()));
    }
    if c.is_unserviceable() {
        return Err(GpuControlError::Unserviceable { chid });
    }
    if c.is_usermode() {
        return Err(GpuControlError::InvalidArgument(format!(
            "ch {} submits from user mode",
            chid
        )));
    }
    let entry_num = c.gpfifo_entry_num();
    if entry_num == 0 {
        return Err(GpuControlError::OutOfMemory(format!("ch {} has no gpfifo", chid)));
    }
    let Some(vm) = c.vm() else {
        return Err(GpuControlError::InvalidArgument(format!(
            "ch {} has no address space",
            chid
        )));
    };
    if entry_num - 1 < num_entries + EXTRA_GPFIFO_ENTRIES {
        log::info!(
            "ch {}: not enough gpfifo space allocated ({} for {})",
            chid,
            entry_num,
            num_entries
        );
        return Err(GpuControlError::OutOfMemory(format!(
            "{} entries never fit a ring of {}",
            num_entries, entry_num
        )));
    }
    if flags.contains(SubmitFlags::FENCE_WAIT) && fence_in.is_none() {
        return Err(GpuControlError::InvalidArgument("FENCE_WAIT without a fence".into()));
    }

    let cfg = device.config();
    let deterministic = c.is_deterministic();
    let fence_flags = flags.contains(SubmitFlags::FENCE_WAIT) || flags.contains(SubmitFlags::FENCE_GET);
    let need_job_tracking = fence_flags
        || (!deterministic
            && (cfg.can_railgate
                || cfg.vpr_resize
                || !flags.contains(SubmitFlags::SKIP_BUFFER_REFCOUNTING)
                || c.watchdog().is_enabled()));

    if deterministic {
        check_deterministic_flags(c, flags)?;
    }

    let _det_busy = deterministic.then(|| device.deterministic_busy.read());
    if deterministic && c.railgate_allowed() {
        return Err(GpuControlError::InvalidArgument(format!(
            "ch {}: deterministic submit with railgating allowed",
            chid
        )));
    }

    let mut power_ref = false;
    if need_job_tracking {
        if deterministic {
            check_deterministic_tracking(c)?;
            c.clean_up_deterministic_job();
        } else {
            device.power().busy()?;
            power_ref = true;
        }
    }
    if let Some(p) = profile.as_deref_mut() {
        p.num_entries = num_entries;
        p.tracked = need_job_tracking;
        p.mark(SubmitStage::Entry);
    }

    let result = submit_locked(
        c,
        &src,
        flags,
        fence_in,
        need_job_tracking,
        power_ref,
        vm.as_ref(),
        profile.as_deref_mut(),
    );
    if result.is_err() && power_ref {
        device.power().idle();
    }
    if let Some(p) = profile {
        p.mark(SubmitStage::End);
    }
    result
}

/// Deterministic channels cannot do anything that needs deferred cleanup,
/// whether or not the submit is tracked.
fn check_deterministic_flags(c: &Channel, flags: SubmitFlags) -> Result<()> {
    let reason = if flags.contains(SubmitFlags::FENCE_GET) && flags.contains(SubmitFlags::SYNC_FENCE)
    {
        Some("sync-fd post fence")
    } else if !flags.contains(SubmitFlags::SKIP_BUFFER_REFCOUNTING) {
        Some("buffer refcounting")
    } else if c.watchdog().is_enabled() {
        Some("watchdog")
    } else {
        None
    };
    reject_deterministic(c, reason)
}

/// Job tracking on a deterministic channel needs syncpoints, static syncs
/// and a preallocated job ring.
fn check_deterministic_tracking(c: &Channel) -> Result<()> {
    let device = c.device();
    let reason = if device.syncpoints().is_none() {
        Some("semaphore tracking")
    } else if device.uses_dynamic_syncs() {
        Some("dynamic syncs")
    } else if !c
        .jobs
        .lock()
        .list
        .as_ref()
        .is_some_and(|l| l.is_preallocated())
    {
        Some("job tracking without preallocated jobs")
    } else {
        None
    };
    reject_deterministic(c, reason)
}

fn reject_deterministic(c: &Channel, reason: Option<&str>) -> Result<()> {
    match reason {
        Some(reason) => {
            log::info!("ch {}: deterministic submit rejected: {}", c.chid(), reason);
            Err(GpuControlError::InvalidArgument(format!(
                "deterministic channel cannot use {}",
                reason
            )))
        }
        None => Ok(()),
    }
}

#[allow(clippy::too_many_arguments)]
fn submit_locked(
    c: &Channel,
    src: &GpfifoSource<'_>,
    flags: SubmitFlags,
    fence_in: Option<ChannelFence>,
    need_job_tracking: bool,
    power_ref: bool,
    vm: &dyn super::vm::AddressSpace,
    mut profile: Option<&mut SubmitProfile>,
) -> Result<Option<Fence>> {
    let chid = c.chid();
    let num_entries = src.num_entries();
    let mut ring_guard = c.ring.lock();
    let ring = ring_guard
        .as_mut()
        .ok_or_else(|| GpuControlError::OutOfMemory(format!("ch {} has no gpfifo", chid)))?;

    let needed = num_entries + EXTRA_GPFIFO_ENTRIES;
    if ring.free_count() < needed && c.refresh_get(ring) < needed {
        log::debug!(
            "ch {}: gpfifo full, put {} get {} need {}",
            chid,
            ring.put(),
            ring.get(),
            needed
        );
        return Err(GpuControlError::WouldBlock("gpfifo full".into()));
    }

    let post_fence = if need_job_tracking {
        let fence = submit_tracked(c, ring, src, flags, fence_in, power_ref, vm, profile.as_deref_mut())?;
        Some(fence)
    } else {
        src.append_to(ring)?;
        if let Some(p) = profile.as_deref_mut() {
            p.mark(SubmitStage::Append);
        }
        None
    };

    // Entries must be visible before the hardware sees the new PUT.
    atomic::fence(Ordering::Release);
    c.device().userd().gp_put(chid, ring.put());
    log::trace!(
        "ch {}: submitted {} entries, put {} get {}",
        chid,
        num_entries,
        ring.put(),
        ring.get()
    );

    Ok(post_fence.filter(|_| flags.contains(SubmitFlags::FENCE_GET)))
}

#[allow(clippy::too_many_arguments)]
fn submit_tracked(
    c: &Channel,
    ring: &mut GpfifoRing,
    src: &GpfifoSource<'_>,
    flags: SubmitFlags,
    fence_in: Option<ChannelFence>,
    power_ref: bool,
    vm: &dyn super::vm::AddressSpace,
    mut profile: Option<&mut SubmitProfile>,
) -> Result<Fence> {
    let mut job = {
        let mut state = c.jobs.lock();
        let list = state
            .list
            .as_mut()
            .ok_or_else(|| GpuControlError::OutOfMemory(format!("ch {} has no job list", c.chid())))?;
        list.alloc_job()?
    };

    let sync = match prepare_syncs(c, &mut job, flags, fence_in) {
        Ok(sync) => sync,
        Err(e) => {
            rollback_job(c, job, None);
            return Err(e);
        }
    };
    if let Some(p) = profile.as_deref_mut() {
        p.wait_cmd = job.wait_cmd.is_some();
        p.mark(SubmitStage::JobTracking);
    }

    let mut appended = 0;
    if let Some(cmd) = &job.wait_cmd {
        ring.append(&[cmd_entry(cmd)]);
        appended += 1;
    }
    if let Err(e) = src.append_to(ring) {
        ring.rewind(appended);
        rollback_job(c, job, Some(sync.as_ref()));
        return Err(e);
    }
    appended += src.num_entries();
    if let Some(cmd) = &job.incr_cmd {
        ring.append(&[cmd_entry(cmd)]);
        appended += 1;
    }
    if let Some(p) = profile.as_deref_mut() {
        p.mark(SubmitStage::Append);
    }

    if !flags.contains(SubmitFlags::SKIP_BUFFER_REFCOUNTING) {
        match vm.get_buffers() {
            Ok(buffers) => job.mapped_buffers = buffers,
            Err(e) => {
                ring.rewind(appended);
                rollback_job(c, job, Some(sync.as_ref()));
                return Err(e);
            }
        }
    }

    let Some(post_fence) = job.post_fence.clone() else {
        ring.rewind(appended);
        rollback_job(c, job, Some(sync.as_ref()));
        return Err(GpuControlError::Backend("tracked job without post fence".into()));
    };
    job.power_ref = power_ref;
    if !c.is_deterministic() {
        c.watchdog().start(ring.get());
    }
    let orphan = {
        let mut state = c.jobs.lock();
        match state.list.as_mut() {
            Some(list) => {
                list.add(job);
                None
            }
            None => Some(job),
        }
    };
    if let Some(job) = orphan {
        // Closed underneath us.
        c.release_job(job);
    }

    let notify = if c.is_deterministic() {
        None
    } else {
        let weak = c.weak();
        Some(Box::new(move || {
            if let Some(ch) = weak.upgrade() {
                ch.update();
            }
        }) as Box<dyn FnOnce() + Send>)
    };
    sync.mark_progress(&post_fence, notify);
    Ok(post_fence)
}

/// Wait and increment commands for `job`, taking a dynamic sync reference
/// when syncs are created per submit.
fn prepare_syncs(
    c: &Channel,
    job: &mut ChannelJob,
    flags: SubmitFlags,
    fence_in: Option<ChannelFence>,
) -> Result<Arc<ChannelSync>> {
    let device = c.device();
    let sync = {
        let mut slot = c.sync.lock();
        if device.uses_dynamic_syncs() {
            let sync = c.get_or_create_sync(&mut slot)?;
            sync.get_ref();
            job.sync_ref = true;
            sync
        } else {
            slot.clone().ok_or_else(|| {
                GpuControlError::NoDevice(format!("ch {} has no sync", c.chid()))
            })?
        }
    };

    let mut state = c.jobs.lock();
    let JobState { priv_cmd_q, .. } = &mut *state;
    let q = priv_cmd_q
        .as_mut()
        .ok_or_else(|| GpuControlError::OutOfMemory(format!("ch {} has no priv cmdbuf", c.chid())))?;

    if flags.contains(SubmitFlags::FENCE_WAIT) {
        let fence = fence_in.unwrap_or_default();
        job.wait_cmd = if flags.contains(SubmitFlags::SYNC_FENCE) {
            let max_wait_cmds = if c.is_deterministic() { 1 } else { 0 };
            sync.wait_fence_fd(q, device.sync_fds(), fence.id as i32, max_wait_cmds)?
        } else {
            sync.wait_syncpt(q, fence.id, fence.value)?
        };
    }

    let (cmd, fence) = if flags.contains(SubmitFlags::FENCE_GET) {
        let need_wfi = !flags.contains(SubmitFlags::SUPPRESS_WFI);
        sync.incr(q, need_wfi, flags.contains(SubmitFlags::SYNC_FENCE))?
    } else {
        sync.incr(q, false, false)?
    };
    job.incr_cmd = Some(cmd);
    job.post_fence = Some(fence);
    Ok(sync)
}

/// Undo a job that never reached the job list.
fn rollback_job(c: &Channel, mut job: ChannelJob, sync: Option<&ChannelSync>) {
    if let (Some(fence), Some(sync)) = (job.post_fence.take(), sync) {
        sync.rollback_incr(&fence);
    }
    let sync_ref = std::mem::take(&mut job.sync_ref);
    {
        let mut state = c.jobs.lock();
        let JobState { list, priv_cmd_q } = &mut *state;
        if let Some(q) = priv_cmd_q.as_mut() {
            if let Some(cmd) = job.incr_cmd.take() {
                q.rollback(cmd);
            }
            if let Some(cmd) = job.wait_cmd.take() {
                q.rollback(cmd);
            }
        }
        if let Some(list) = list.as_mut() {
            list.free_job(job);
        }
    }
    if sync_ref {
        c.put_sync_ref();
    }
    log::debug!("ch {}: submit rolled back", c.chid());
}

fn cmd_entry(cmd: &PrivCmdEntry) -> GpfifoEntry {
    GpfifoEntry::new(cmd.gva(), cmd.size())
}
