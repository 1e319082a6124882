//! Lossy multi-producer notification ring.
//!
//! Records are `{timestamp, alarm_mask}` pairs. A push claims the next index
//! with one `fetch_add` on `reserve`, writes the slot `index % size`, then
//! advances `tail` past it. Tail only moves in claim order, so a reader that
//! observes `tail == n` can read every slot up to `n`; a producer waits only
//! for a concurrent producer that claimed an earlier index to finish its
//! two stores. When a reader falls more than `size` records behind, the
//! oldest records are silently skipped; alarms are sticky bitmasks, so a lost
//! record never loses a condition, only a duplicate report of it.
//!
//! ```text
//!   head (last consumed)            tail (last pushed)
//!        |                               |
//!   ...  h  h+1  h+2  ...          t-1   t
//!           \___ visible to read() _____/
//! ```
//!
//! Indices are monotonically increasing `u32` counters that wrap; all
//! distance computations use wrapping arithmetic.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

use crate::error::{GpuControlError, Result};

/// Nanoseconds since the first timestamp taken in this process.
pub fn timestamp_ns() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// One notification record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    pub timestamp_ns: u64,
    pub alarm_mask: u32,
}

#[derive(Default)]
struct Slot {
    timestamp: AtomicU64,
    mask: AtomicU32,
}

impl Slot {
    fn load(&self) -> Notification {
        // Acquire on the mask pairs with the Release store in push().
        let alarm_mask = self.mask.load(Ordering::Acquire);
        Notification {
            timestamp_ns: self.timestamp.load(Ordering::Relaxed),
            alarm_mask,
        }
    }
}

/// Fixed-capacity lossy ring of notification records.
pub struct NotificationQueue {
    slots: Box<[Slot]>,
    head: AtomicU32,
    reserve: AtomicU32,
    tail: AtomicU32,
}

impl NotificationQueue {
    /// Allocate a queue of `capacity` records with head and tail at 0.
    ///
    /// `capacity` must be a power of two so slot selection stays correct
    /// when the u32 indices wrap.
    pub fn new(capacity: u32) -> Result<Self> {
        if !capacity.is_power_of_two() {
            return Err(GpuControlError::InvalidArgument(format!(
                "notification queue capacity {} is not a power of two",
                capacity
            )));
        }
        let mut slots = Vec::new();
        slots.try_reserve_exact(capacity as usize)?;
        slots.resize_with(capacity as usize, Slot::default);
        Ok(Self {
            slots: slots.into_boxed_slice(),
            head: AtomicU32::new(0),
            reserve: AtomicU32::new(0),
            tail: AtomicU32::new(0),
        })
    }

    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn head(&self) -> u32 {
        self.head.load(Ordering::Acquire)
    }

    pub fn tail(&self) -> u32 {
        self.tail.load(Ordering::Acquire)
    }

    /// Mark everything up to and including `index` as consumed.
    pub fn set_head(&self, index: u32) {
        self.head.store(index, Ordering::Release);
    }

    fn slot(&self, index: u32) -> &Slot {
        &self.slots[(index & (self.capacity() - 1)) as usize]
    }

    /// Append a record stamped now; returns the index it was written at.
    pub fn push(&self, alarm_mask: u32) -> u32 {
        self.push_record(Notification {
            timestamp_ns: timestamp_ns(),
            alarm_mask,
        })
    }

    /// Append a record keeping its original timestamp.
    pub fn push_record(&self, record: Notification) -> u32 {
        let index = self.reserve.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        let slot = self.slot(index);
        slot.timestamp.store(record.timestamp_ns, Ordering::Relaxed);
        slot.mask.store(record.alarm_mask, Ordering::Release);
        let prev = index.wrapping_sub(1);
        while self
            .tail
            .compare_exchange_weak(prev, index, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        index
    }

    /// Number of records between `from` and `tail` still held by the ring.
    fn visible_since(&self, from: u32, tail: u32) -> u32 {
        let behind = tail.wrapping_sub(from);
        // A reader ahead of tail (negative distance) has nothing to see.
        if (behind as i32) <= 0 {
            0
        } else {
            behind.min(self.capacity())
        }
    }

    /// Records after `from` whose mask intersects `enabled_mask`.
    ///
    /// The tail is snapshotted once; records pushed afterwards are not part
    /// of this drain. Aged-out records (more than `capacity` behind) are
    /// skipped.
    pub fn drain_since(&self, from: u32, enabled_mask: u32) -> NotificationDrain<'_> {
        self.drain_range(from, self.tail(), enabled_mask)
    }

    /// Like [`drain_since`](Self::drain_since) but stops at an explicit
    /// `end` index instead of the current tail.
    pub fn drain_range(&self, from: u32, end: u32, enabled_mask: u32) -> NotificationDrain<'_> {
        let count = self.visible_since(from, end);
        NotificationDrain {
            queue: self,
            next: end.wrapping_sub(count),
            end,
            enabled_mask,
        }
    }

    /// Consume up to `max` records from the head.
    ///
    /// Single consumer: the per-client read path.
    pub fn read(&self, max: usize) -> Vec<Notification> {
        let tail = self.tail();
        let mut head = self.head();
        head = tail.wrapping_sub(self.visible_since(head, tail));

        let mut out = Vec::with_capacity(max.min(self.capacity() as usize));
        while head != tail && out.len() < max {
            head = head.wrapping_add(1);
            out.push(self.slot(head).load());
        }
        self.set_head(head);
        out
    }

    /// Records not yet consumed by `read()`.
    pub fn pending(&self) -> u32 {
        self.visible_since(self.head(), self.tail())
    }
}

impl std::fmt::Debug for NotificationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationQueue")
            .field("capacity", &self.capacity())
            .field("head", &self.head())
            .field("tail", &self.tail())
            .finish()
    }
}

/// Lazy scan over a tail snapshot; clone it to restart.
#[derive(Clone)]
pub struct NotificationDrain<'a> {
    queue: &'a NotificationQueue,
    next: u32,
    end: u32,
    enabled_mask: u32,
}

impl NotificationDrain<'_> {
    /// Tail snapshot this drain stops at.
    pub fn end(&self) -> u32 {
        self.end
    }
}

impl Iterator for NotificationDrain<'_> {
    type Item = Notification;

    fn next(&mut self) -> Option<Notification> {
        while self.next != self.end {
            self.next = self.next.wrapping_add(1);
            let record = self.queue.slot(self.next).load();
            if record.alarm_mask & self.enabled_mask != 0 {
                return Some(record);
            }
        }
        None
    }
}
