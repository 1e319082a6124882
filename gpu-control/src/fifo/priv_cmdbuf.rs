//! Private command buffer: a per-channel word ring holding the wait and
//! increment commands the driver inserts around user entries.
//!
//! Allocations are contiguous. A request that does not fit before the end of
//! the buffer skips the tail and starts at offset 0; the skipped words are
//! charged to the entry so that freeing it returns them. Entries are freed in
//! allocation order (job order), and only the newest may be rolled back.

use crate::error::{GpuControlError, Result};

/// Syncpoint wait: payload + action, two methods each.
pub const SYNCPT_WAIT_CMD_WORDS: u32 = 4;
/// Syncpoint increment.
pub const SYNCPT_INCR_CMD_WORDS: u32 = 6;
/// Semaphore acquire.
pub const SEMA_WAIT_CMD_WORDS: u32 = 4;
/// Semaphore release.
pub const SEMA_INCR_CMD_WORDS: u32 = 6;
/// Extra words for a wait-for-idle ahead of an increment.
pub const WFI_CMD_WORDS: u32 = 2;

/// An allocated command slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivCmdEntry {
    /// Where the allocation began, including any skipped tail.
    start: u32,
    /// Word offset of the payload.
    off: u32,
    /// Payload words.
    size: u32,
    /// Words charged to this entry (payload plus skipped tail).
    alloc_size: u32,
    gva: u64,
    words: Vec<u32>,
}

impl PrivCmdEntry {
    pub fn gva(&self) -> u64 {
        self.gva
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Append a method/data word. Writing past the allocation is a bug.
    pub fn push(&mut self, word: u32) {
        debug_assert!((self.words.len() as u32) < self.size, "priv cmd overflow");
        self.words.push(word);
    }

    /// Words written so far.
    pub fn fill(&self) -> u32 {
        self.words.len() as u32
    }
}

/// Allocator bookkeeping, comparable before and after a failed submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrivCmdState {
    pub put: u32,
    pub get: u32,
    pub used: u32,
    pub entries: u32,
}

#[derive(Debug)]
pub struct PrivCmdQueue {
    gva: u64,
    size: u32,
    put: u32,
    get: u32,
    used: u32,
    entries: u32,
    max_entries: u32,
}

impl PrivCmdQueue {
    /// Queue for `job_count` in-flight jobs of `words_per_job` words each,
    /// at most two entries (wait + incr) per job.
    pub fn new(gva: u64, job_count: u32, words_per_job: u32) -> Result<Self> {
        let size = job_count
            .checked_mul(words_per_job)
            .filter(|&s| s > 0)
            .ok_or_else(|| GpuControlError::InvalidArgument("priv cmdbuf size".into()))?;
        Ok(Self {
            gva,
            size,
            put: 0,
            get: 0,
            used: 0,
            entries: 0,
            max_entries: job_count.saturating_mul(2),
        })
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn state(&self) -> PrivCmdState {
        PrivCmdState {
            put: self.put,
            get: self.get,
            used: self.used,
            entries: self.entries,
        }
    }

    /// Reserve `words` contiguous words.
    pub fn alloc(&mut self, words: u32) -> Result<PrivCmdEntry> {
        if words == 0 || words > self.size {
            return Err(GpuControlError::OutOfMemory(format!(
                "priv cmd of {} words in a {}-word queue",
                words, self.size
            )));
        }
        let skip = if self.put + words > self.size {
            self.size - self.put
        } else {
            0
        };
        let total = skip + words;
        if self.used + total > self.size || self.entries >= self.max_entries {
            log::debug!(
                "priv cmdbuf full: want {} (+{} skip), used {}/{}",
                words,
                skip,
                self.used,
                self.size
            );
            return Err(GpuControlError::WouldBlock("priv cmdbuf full".into()));
        }
        let start = self.put;
        let off = if skip > 0 { 0 } else { self.put };
        self.put = (off + words) % self.size;
        self.used += total;
        self.entries += 1;

        let mut buf = Vec::new();
        buf.try_reserve_exact(words as usize)?;
        Ok(PrivCmdEntry {
            start,
            off,
            size: words,
            alloc_size: total,
            gva: self.gva + u64::from(off) * 4,
            words: buf,
        })
    }

    /// Undo the newest allocation.
    pub fn rollback(&mut self, entry: PrivCmdEntry) {
        let expected = (entry.start + entry.alloc_size) % self.size;
        if expected != self.put {
            log::warn!(
                "priv cmdbuf: rollback of {} out of order (put {})",
                entry.start,
                self.put
            );
        }
        self.put = entry.start;
        self.used -= entry.alloc_size;
        self.entries -= 1;
    }

    /// Release the oldest allocation once the GPU is past it.
    pub fn free(&mut self, entry: PrivCmdEntry) {
        if entry.start != self.get {
            log::warn!(
                "priv cmdbuf: free of {} out of order (get {})",
                entry.start,
                self.get
            );
        }
        self.get = (entry.start + entry.alloc_size) % self.size;
        self.used -= entry.alloc_size;
        self.entries -= 1;
    }
}
