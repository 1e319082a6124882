//! Channel sync: turns syncpoint or semaphore operations into private
//! commands.
//!
//! Every tracked job gets an increment command (optionally preceded by a
//! wait-for-idle) whose threshold becomes the job's post fence, and, when the
//! submit carries a pre-fence, a wait command ahead of the user entries.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use super::fence::{Fence, SyncFdTable, SyncPrimitive};
use super::priv_cmdbuf::{
    PrivCmdEntry, PrivCmdQueue, SEMA_INCR_CMD_WORDS, SEMA_WAIT_CMD_WORDS, SYNCPT_INCR_CMD_WORDS,
    SYNCPT_WAIT_CMD_WORDS, WFI_CMD_WORDS,
};
use super::syncpoint::{Semaphore, SyncpointManager};
use crate::error::{GpuControlError, Result};

/// Increments one release adds to the backing counter.
pub const INCR_PER_RELEASE: u32 = 1;

// Host methods, encoded as (method << 16) | count.
const METHOD_WFI: u32 = 0x2001_0078;
const METHOD_SYNCPT_PAYLOAD: u32 = 0x2001_001c;
const METHOD_SYNCPT_ACTION: u32 = 0x2001_001d;
const METHOD_SEMA_ADDR: u32 = 0x2002_0004;
const METHOD_SEMA_EXECUTE: u32 = 0x2001_0006;
const METHOD_NON_STALL_INT: u32 = 0x2001_0008;

const SYNCPT_ACTION_WAIT: u32 = 0;
const SYNCPT_ACTION_INCR: u32 = 1;
const SEMA_ACQUIRE_GEQ: u32 = 0x4;
const SEMA_RELEASE: u32 = 0x2;

/// What a channel's sync counts on.
#[derive(Debug)]
pub enum SyncBacking {
    Syncpoint {
        syncpoints: Arc<SyncpointManager>,
        id: u32,
    },
    Semaphore(Arc<Semaphore>),
}

type Notifier = Box<dyn FnOnce() + Send>;

#[derive(Debug)]
pub struct ChannelSync {
    chid: u32,
    backing: SyncBacking,
    refcount: AtomicU32,
    progress: AtomicU64,
}

impl ChannelSync {
    /// Syncpoint-backed when the device has syncpoints, semaphore-backed
    /// at `sema_gva` otherwise.
    pub fn create(
        chid: u32,
        syncpoints: Option<&Arc<SyncpointManager>>,
        sema_gva: u64,
    ) -> Result<Self> {
        let backing = match syncpoints {
            Some(syncpoints) => SyncBacking::Syncpoint {
                id: syncpoints.alloc()?,
                syncpoints: Arc::clone(syncpoints),
            },
            None => SyncBacking::Semaphore(Arc::new(Semaphore::new(sema_gva))),
        };
        log::debug!("ch {}: created sync {:?}", chid, backing);
        Ok(Self {
            chid,
            backing,
            refcount: AtomicU32::new(0),
            progress: AtomicU64::new(0),
        })
    }

    pub fn backing(&self) -> &SyncBacking {
        &self.backing
    }

    pub fn is_syncpoint(&self) -> bool {
        matches!(self.backing, SyncBacking::Syncpoint { .. })
    }

    pub fn syncpt_id(&self) -> Option<u32> {
        match &self.backing {
            SyncBacking::Syncpoint { id, .. } => Some(*id),
            SyncBacking::Semaphore(_) => None,
        }
    }

    /// Thresholds reserved so far.
    pub fn max(&self) -> u32 {
        match &self.backing {
            SyncBacking::Syncpoint { syncpoints, id } => syncpoints.max(*id),
            SyncBacking::Semaphore(sema) => sema.timeline().max(),
        }
    }

    /// Wait command for a raw syncpoint pre-fence, or `None` if it has
    /// already expired.
    pub fn wait_syncpt(
        &self,
        q: &mut PrivCmdQueue,
        id: u32,
        thresh: u32,
    ) -> Result<Option<PrivCmdEntry>> {
        let SyncBacking::Syncpoint { syncpoints, .. } = &self.backing else {
            return Err(GpuControlError::InvalidArgument(
                "raw syncpoint wait needs a syncpoint-backed channel".into(),
            ));
        };
        if !syncpoints.is_valid(id) {
            return Err(GpuControlError::InvalidArgument(format!(
                "invalid wait syncpoint {}",
                id
            )));
        }
        if syncpoints.is_expired(id, thresh) {
            return Ok(None);
        }
        let mut cmd = q.alloc(SYNCPT_WAIT_CMD_WORDS)?;
        emit_syncpt_wait(&mut cmd, id, thresh);
        Ok(Some(cmd))
    }

    /// Wait command covering every pending primitive of sync-fd `fd`.
    /// `max_wait_cmds` of 0 means unbounded.
    pub fn wait_fence_fd(
        &self,
        q: &mut PrivCmdQueue,
        sync_fds: &SyncFdTable,
        fd: i32,
        max_wait_cmds: u32,
    ) -> Result<Option<PrivCmdEntry>> {
        let primitives = sync_fds.get(fd)?;
        if max_wait_cmds != 0 && primitives.len() as u32 > max_wait_cmds {
            return Err(GpuControlError::InvalidArgument(format!(
                "sync-fd {} has {} fences, limit {}",
                fd,
                primitives.len(),
                max_wait_cmds
            )));
        }
        let pending: Vec<&SyncPrimitive> = primitives.iter().filter(|p| !p.is_expired()).collect();
        if pending.is_empty() {
            return Ok(None);
        }
        let words = pending
            .iter()
            .map(|p| match p {
                SyncPrimitive::Syncpoint { .. } => SYNCPT_WAIT_CMD_WORDS,
                SyncPrimitive::Semaphore { .. } => SEMA_WAIT_CMD_WORDS,
            })
            .sum();
        let mut cmd = q.alloc(words)?;
        for p in pending {
            match p {
                SyncPrimitive::Syncpoint { id, thresh, .. } => {
                    emit_syncpt_wait(&mut cmd, *id, *thresh)
                }
                SyncPrimitive::Semaphore { sema, value } => {
                    emit_sema(&mut cmd, sema.gva(), *value, SEMA_ACQUIRE_GEQ)
                }
            }
        }
        Ok(Some(cmd))
    }

    /// Reserve the next threshold and build its increment command.
    pub fn incr(
        &self,
        q: &mut PrivCmdQueue,
        wfi: bool,
        need_sync_fd: bool,
    ) -> Result<(PrivCmdEntry, Fence)> {
        let base = match self.backing {
            SyncBacking::Syncpoint { .. } => SYNCPT_INCR_CMD_WORDS,
            SyncBacking::Semaphore(_) => SEMA_INCR_CMD_WORDS,
        };
        let words = base + if wfi { WFI_CMD_WORDS } else { 0 };
        let mut cmd = q.alloc(words)?;
        if wfi {
            cmd.push(METHOD_WFI);
            cmd.push(0);
        }
        let primitive = match &self.backing {
            SyncBacking::Syncpoint { syncpoints, id } => {
                let thresh = syncpoints.incr_max(*id, INCR_PER_RELEASE)?;
                cmd.push(METHOD_SYNCPT_PAYLOAD);
                cmd.push(0);
                cmd.push(METHOD_SYNCPT_ACTION);
                cmd.push((*id << 8) | SYNCPT_ACTION_INCR);
                cmd.push(METHOD_NON_STALL_INT);
                cmd.push(0);
                SyncPrimitive::Syncpoint {
                    syncpoints: Arc::clone(syncpoints),
                    id: *id,
                    thresh,
                }
            }
            SyncBacking::Semaphore(sema) => {
                let value = sema.timeline().incr_max(INCR_PER_RELEASE);
                emit_sema(&mut cmd, sema.gva(), value, SEMA_RELEASE);
                cmd.push(METHOD_NON_STALL_INT);
                cmd.push(0);
                SyncPrimitive::Semaphore {
                    sema: Arc::clone(sema),
                    value,
                }
            }
        };
        Ok((cmd, Fence::new(primitive, need_sync_fd)))
    }

    /// Give back the threshold `fence` reserved, if nothing was reserved
    /// after it.
    pub fn rollback_incr(&self, fence: &Fence) -> bool {
        let released = match fence.primitive() {
            SyncPrimitive::Syncpoint {
                syncpoints,
                id,
                thresh,
            } => syncpoints.release_max(*id, *thresh, INCR_PER_RELEASE),
            SyncPrimitive::Semaphore { sema, value } => {
                sema.timeline().release_max(*value, INCR_PER_RELEASE)
            }
        };
        if !released {
            log::warn!("ch {}: could not release fence {:?}", self.chid, fence.primitive());
        }
        released
    }

    /// Note a submitted job; `on_complete` runs once its fence expires.
    pub fn mark_progress(&self, fence: &Fence, on_complete: Option<Notifier>) {
        self.progress.fetch_add(1, Ordering::Relaxed);
        let Some(notifier) = on_complete else {
            return;
        };
        match fence.primitive() {
            SyncPrimitive::Syncpoint {
                syncpoints,
                id,
                thresh,
            } => {
                if let Err(e) = syncpoints.register_notifier(*id, *thresh, notifier) {
                    log::warn!("ch {}: completion notifier: {}", self.chid, e);
                }
            }
            SyncPrimitive::Semaphore { sema, value } => {
                sema.timeline().register_notifier(*value, notifier)
            }
        }
    }

    pub fn progress(&self) -> u64 {
        self.progress.load(Ordering::Relaxed)
    }

    pub fn get_ref(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one user; true when none remain.
    pub fn put_ref_and_check(&self) -> bool {
        self.refcount.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Expire every reserved threshold.
    pub fn set_min_eq_max(&self) {
        match &self.backing {
            SyncBacking::Syncpoint { syncpoints, id } => syncpoints.set_min_eq_max(*id),
            SyncBacking::Semaphore(sema) => sema.timeline().set_min_eq_max(),
        }
    }

    /// Put the sync where nothing can wait on it forever; used on abort.
    pub fn set_safe_state(&self) {
        log::debug!("ch {}: sync safe state", self.chid);
        self.set_min_eq_max();
    }
}

impl Drop for ChannelSync {
    fn drop(&mut self) {
        if let SyncBacking::Syncpoint { syncpoints, id } = &self.backing {
            syncpoints.free(*id);
        }
    }
}

fn emit_syncpt_wait(cmd: &mut PrivCmdEntry, id: u32, thresh: u32) {
    cmd.push(METHOD_SYNCPT_PAYLOAD);
    cmd.push(thresh);
    cmd.push(METHOD_SYNCPT_ACTION);
    cmd.push((id << 8) | SYNCPT_ACTION_WAIT);
}

fn emit_sema(cmd: &mut PrivCmdEntry, gva: u64, value: u32, op: u32) {
    cmd.push(METHOD_SEMA_ADDR);
    cmd.push(gva as u32);
    cmd.push(value);
    cmd.push(METHOD_SEMA_EXECUTE | (op << 8));
}
