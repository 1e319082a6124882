//! Fences and sync-fds.
//!
//! A [`Fence`] is a shared handle on one sync primitive threshold. Jobs hold
//! their post fence until cleanup; submitters may hold another clone. A fence
//! created for a SYNC_FENCE submit is exported as a sync-fd number from the
//! device's [`SyncFdTable`] rather than as a raw syncpoint pair.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::syncpoint::{Semaphore, SyncpointManager};
use crate::error::{GpuControlError, Result};

/// A threshold on a syncpoint or a semaphore.
#[derive(Clone)]
pub enum SyncPrimitive {
    Syncpoint {
        syncpoints: Arc<SyncpointManager>,
        id: u32,
        thresh: u32,
    },
    Semaphore {
        sema: Arc<Semaphore>,
        value: u32,
    },
}

impl SyncPrimitive {
    pub fn is_expired(&self) -> bool {
        match self {
            SyncPrimitive::Syncpoint {
                syncpoints,
                id,
                thresh,
            } => syncpoints.is_expired(*id, *thresh),
            SyncPrimitive::Semaphore { sema, value } => sema.timeline().is_expired(*value),
        }
    }

    pub fn wait(&self, timeout: Duration) -> Result<()> {
        match self {
            SyncPrimitive::Syncpoint {
                syncpoints,
                id,
                thresh,
            } => syncpoints.wait(*id, *thresh, timeout),
            SyncPrimitive::Semaphore { sema, value } => sema.timeline().wait(*value, timeout),
        }
    }
}

impl fmt::Debug for SyncPrimitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncPrimitive::Syncpoint { id, thresh, .. } => {
                write!(f, "Syncpoint({}@{})", id, thresh)
            }
            SyncPrimitive::Semaphore { sema, value } => {
                write!(f, "Semaphore({:#x}@{})", sema.gva(), value)
            }
        }
    }
}

#[derive(Debug)]
struct FenceInner {
    primitive: SyncPrimitive,
    sync_fd: bool,
}

/// Reference-counted post fence.
#[derive(Debug, Clone)]
pub struct Fence(Arc<FenceInner>);

impl Fence {
    pub fn new(primitive: SyncPrimitive, sync_fd: bool) -> Self {
        Self(Arc::new(FenceInner { primitive, sync_fd }))
    }

    pub fn primitive(&self) -> &SyncPrimitive {
        &self.0.primitive
    }

    /// Whether the fence is to be exported as a sync-fd.
    pub fn wants_sync_fd(&self) -> bool {
        self.0.sync_fd
    }

    pub fn is_expired(&self) -> bool {
        self.0.primitive.is_expired()
    }

    pub fn wait(&self, timeout: Duration) -> Result<()> {
        self.0.primitive.wait(timeout)
    }

    /// `(id, thresh)` for a syncpoint-backed fence.
    pub fn syncpoint(&self) -> Option<(u32, u32)> {
        match &self.0.primitive {
            SyncPrimitive::Syncpoint { id, thresh, .. } => Some((*id, *thresh)),
            SyncPrimitive::Semaphore { .. } => None,
        }
    }

    /// Live handles on this fence.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Export for user space. A sync-fd is created now; a semaphore fence
    /// without one has no user representation.
    pub fn extract_user(&self, sync_fds: &SyncFdTable) -> Option<UserFence> {
        if self.0.sync_fd {
            return Some(UserFence::SyncFd(sync_fds.install(vec![self.0.primitive.clone()])));
        }
        self.syncpoint()
            .map(|(id, value)| UserFence::Syncpoint { id, value })
    }
}

/// Fence as returned across the user boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserFence {
    Syncpoint { id: u32, value: u32 },
    SyncFd(i32),
}

// ============================================================================
// Sync-fd table
// ============================================================================

const FIRST_SYNC_FD: i32 = 3;

/// Sync-fd numbers, each naming a set of primitives that signals once all of
/// them have.
#[derive(Debug, Default)]
pub struct SyncFdTable {
    inner: Mutex<SyncFdInner>,
}

#[derive(Debug, Default)]
struct SyncFdInner {
    next_fd: i32,
    fds: HashMap<i32, Arc<Vec<SyncPrimitive>>>,
}

impl SyncFdTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, primitives: Vec<SyncPrimitive>) -> i32 {
        let mut inner = self.inner.lock();
        let fd = inner.next_fd.max(FIRST_SYNC_FD);
        inner.next_fd = fd + 1;
        inner.fds.insert(fd, Arc::new(primitives));
        fd
    }

    pub fn get(&self, fd: i32) -> Result<Arc<Vec<SyncPrimitive>>> {
        self.inner
            .lock()
            .fds
            .get(&fd)
            .cloned()
            .ok_or_else(|| GpuControlError::InvalidArgument(format!("bad sync-fd {}", fd)))
    }

    pub fn close(&self, fd: i32) -> bool {
        self.inner.lock().fds.remove(&fd).is_some()
    }

    /// Signalled once every primitive has expired.
    pub fn is_signaled(&self, fd: i32) -> Result<bool> {
        Ok(self.get(fd)?.iter().all(SyncPrimitive::is_expired))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
