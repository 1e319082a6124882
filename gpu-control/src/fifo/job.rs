//! Job tracking for submits that need completion bookkeeping.

use std::collections::VecDeque;

use super::fence::Fence;
use super::priv_cmdbuf::PrivCmdEntry;
use super::vm::MappedBuffer;
use crate::error::{GpuControlError, Result};

/// One tracked submit: everything to release once its fence expires.
#[derive(Debug, Default)]
pub struct ChannelJob {
    pub wait_cmd: Option<PrivCmdEntry>,
    pub incr_cmd: Option<PrivCmdEntry>,
    pub post_fence: Option<Fence>,
    pub mapped_buffers: Vec<MappedBuffer>,
    /// Holds a power reference dropped at cleanup.
    pub power_ref: bool,
    /// Holds a reference on a dynamically created sync.
    pub sync_ref: bool,
}

impl ChannelJob {
    pub fn is_complete(&self) -> bool {
        self.post_fence.as_ref().map_or(true, Fence::is_expired)
    }
}

/// In-flight jobs in submit order, optionally bounded by a preallocated
/// ring of slots.
#[derive(Debug)]
pub struct JobList {
    jobs: VecDeque<ChannelJob>,
    capacity: u32,
    reserved: u32,
}

impl JobList {
    /// `capacity` of 0 means unbounded.
    pub fn new(capacity: u32) -> Result<Self> {
        let mut jobs = VecDeque::new();
        jobs.try_reserve_exact(capacity as usize)?;
        Ok(Self {
            jobs,
            capacity,
            reserved: 0,
        })
    }

    pub fn is_preallocated(&self) -> bool {
        self.capacity != 0
    }

    /// Reserve a slot.
    pub fn alloc_job(&mut self) -> Result<ChannelJob> {
        if self.capacity != 0 && self.jobs.len() as u32 + self.reserved >= self.capacity {
            return Err(GpuControlError::WouldBlock("job ring full".into()));
        }
        self.reserved += 1;
        Ok(ChannelJob::default())
    }

    /// Give back a reserved slot that was never committed.
    pub fn free_job(&mut self, job: ChannelJob) {
        debug_assert!(job.post_fence.is_none() && job.incr_cmd.is_none());
        self.reserved = self.reserved.saturating_sub(1);
    }

    /// Commit a reserved job at the tail.
    pub fn add(&mut self, job: ChannelJob) {
        self.reserved = self.reserved.saturating_sub(1);
        self.jobs.push_back(job);
    }

    pub fn front(&self) -> Option<&ChannelJob> {
        self.jobs.front()
    }

    pub fn pop_front(&mut self) -> Option<ChannelJob> {
        self.jobs.pop_front()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn reserved(&self) -> u32 {
        self.reserved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preallocated_limit() {
        let mut list = JobList::new(2).unwrap();
        let a = list.alloc_job().unwrap();
        let b = list.alloc_job().unwrap();
        assert!(matches!(list.alloc_job(), Err(GpuControlError::WouldBlock(_))));
        list.add(a);
        list.free_job(b);
        assert_eq!(list.len(), 1);
        assert_eq!(list.reserved(), 0);
        assert!(list.alloc_job().is_ok());
    }

    #[test]
    fn test_unbounded() {
        let mut list = JobList::new(0).unwrap();
        for _ in 0..100 {
            let job = list.alloc_job().unwrap();
            list.add(job);
        }
        assert_eq!(list.len(), 100);
        assert!(!list.is_preallocated());
    }

    #[test]
    fn test_fifo_order() {
        let mut list = JobList::new(4).unwrap();
        for n in 0..3 {
            let mut job = list.alloc_job().unwrap();
            job.power_ref = n == 1;
            list.add(job);
        }
        assert!(!list.pop_front().unwrap().power_ref);
        assert!(list.pop_front().unwrap().power_ref);
    }

    #[test]
    fn test_job_without_fence_is_complete() {
        assert!(ChannelJob::default().is_complete());
    }
}
