//! Global alarm word: a 32-bit alarm mask and a 32-bit refcount packed into
//! one `AtomicU64`.
//!
//! Every successful set or clear bumps the refcount, so a reader comparing
//! two snapshots can tell whether it missed an update even when the mask
//! itself came back to the same value.

use std::sync::atomic::{AtomicU64, Ordering};

// Alarm bits carried by notification records and the global alarm word.

pub const VF_UPDATE: u32 = 1 << 0;
pub const TARGET_VF_NOT_POSSIBLE: u32 = 1 << 1;
pub const LOCAL_TARGET_VF_NOT_POSSIBLE: u32 = 1 << 2;
pub const CLOCK_ARBITER_FAILED: u32 = 1 << 3;
pub const VF_TABLE_UPDATE_FAILED: u32 = 1 << 4;
pub const THERMAL_ABOVE_THRESHOLD: u32 = 1 << 5;
pub const POWER_ABOVE_THRESHOLD: u32 = 1 << 6;
pub const GPU_LOST: u32 = 1 << 7;

/// Alarms generated per client rather than through the global word.
pub const LOCAL_MASK: u32 = LOCAL_TARGET_VF_NOT_POSSIBLE | VF_UPDATE;

pub const ALL: u32 = VF_UPDATE
    | TARGET_VF_NOT_POSSIBLE
    | LOCAL_TARGET_VF_NOT_POSSIBLE
    | CLOCK_ARBITER_FAILED
    | VF_TABLE_UPDATE_FAILED
    | THERMAL_ABOVE_THRESHOLD
    | POWER_ABOVE_THRESHOLD
    | GPU_LOST;

/// Unpacked view of the alarm word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmWord {
    pub mask: u32,
    pub refcount: u32,
}

impl AlarmWord {
    pub fn pack(self) -> u64 {
        ((self.refcount as u64) << 32) | self.mask as u64
    }

    pub fn unpack(word: u64) -> Self {
        Self {
            mask: word as u32,
            refcount: (word >> 32) as u32,
        }
    }
}

/// Lock-free alarm mask with a mutation counter.
#[derive(Debug, Default)]
pub struct GlobalAlarmState {
    word: AtomicU64,
}

impl GlobalAlarmState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self) -> AlarmWord {
        AlarmWord::unpack(self.word.load(Ordering::Acquire))
    }

    /// Current alarm mask.
    pub fn mask(&self) -> u32 {
        self.load().mask
    }

    /// OR `bits` into the mask. Returns the word that was installed.
    pub fn set(&self, bits: u32) -> AlarmWord {
        self.update(|mask| mask | bits)
    }

    /// Clear `bits` from the mask. Returns the word that was installed.
    pub fn clear(&self, bits: u32) -> AlarmWord {
        self.update(|mask| mask & !bits)
    }

    fn update(&self, f: impl Fn(u32) -> u32) -> AlarmWord {
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            let old = AlarmWord::unpack(current);
            let new = AlarmWord {
                mask: f(old.mask),
                refcount: old.refcount.wrapping_add(1),
            };
            match self.word.compare_exchange_weak(
                current,
                new.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return new,
                Err(actual) => current = actual,
            }
        }
    }
}
