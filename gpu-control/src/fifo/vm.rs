//! GPU address space seen by the submission core.
//!
//! Submits that track buffers take a reference on every mapping of the
//! channel's address space, so nothing the GPU may still read is unmapped
//! before the job completes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{GpuControlError, Result};

/// A mapping kept alive by its handles.
#[derive(Debug)]
pub struct Mapping {
    pub gva: u64,
    pub size: u64,
}

pub type MappedBuffer = Arc<Mapping>;

pub trait AddressSpace: Send + Sync {
    /// Reserve `size` bytes of GPU VA.
    fn alloc_va(&self, size: u64) -> Result<u64>;

    /// References on every current mapping.
    fn get_buffers(&self) -> Result<Vec<MappedBuffer>>;

    /// Drop references taken by `get_buffers`.
    fn put_buffers(&self, buffers: Vec<MappedBuffer>);
}

const VA_START: u64 = 0x1_0000_0000;
const VA_ALIGN: u64 = 0x1000;

/// Bump-allocated address space with a mapping list.
#[derive(Debug)]
pub struct Vm {
    next_va: AtomicU64,
    mappings: Mutex<Vec<MappedBuffer>>,
    fail_get_buffers: AtomicBool,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self {
            next_va: AtomicU64::new(VA_START),
            mappings: Mutex::new(Vec::new()),
            fail_get_buffers: AtomicBool::new(false),
        }
    }

    pub fn map(&self, size: u64) -> Result<MappedBuffer> {
        let gva = self.alloc_va(size)?;
        let buf = Arc::new(Mapping { gva, size });
        self.mappings.lock().push(Arc::clone(&buf));
        Ok(buf)
    }

    /// Remove `gva` from the mapping list; outstanding job references keep
    /// the mapping alive.
    pub fn unmap(&self, gva: u64) -> bool {
        let mut mappings = self.mappings.lock();
        let before = mappings.len();
        mappings.retain(|m| m.gva != gva);
        mappings.len() != before
    }

    pub fn num_mappings(&self) -> usize {
        self.mappings.lock().len()
    }

    /// Make `get_buffers` fail, for exercising submit rollback.
    pub fn set_fail_get_buffers(&self, fail: bool) {
        self.fail_get_buffers.store(fail, Ordering::Relaxed);
    }
}

impl AddressSpace for Vm {
    fn alloc_va(&self, size: u64) -> Result<u64> {
        let size = size.max(1).div_ceil(VA_ALIGN) * VA_ALIGN;
        let gva = self.next_va.fetch_add(size, Ordering::Relaxed);
        if gva.checked_add(size).is_none() {
            return Err(GpuControlError::OutOfMemory("gpu va exhausted".into()));
        }
        Ok(gva)
    }

    fn get_buffers(&self) -> Result<Vec<MappedBuffer>> {
        if self.fail_get_buffers.load(Ordering::Relaxed) {
            return Err(GpuControlError::OutOfMemory("mapped buffer list".into()));
        }
        let mappings = self.mappings.lock();
        let mut out = Vec::new();
        out.try_reserve_exact(mappings.len())?;
        out.extend(mappings.iter().cloned());
        Ok(out)
    }

    fn put_buffers(&self, buffers: Vec<MappedBuffer>) {
        drop(buffers);
    }
}
