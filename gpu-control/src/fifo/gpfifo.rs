//! GPFIFO ring: the circular buffer of pushbuffer-segment descriptors the
//! GPU host engine consumes.
//!
//! ```text
//!            get              put
//!             v                v
//!   [ . . . . X X X X X X X X . . . . ]   entry_num slots
//!             \____in flight___/
//! ```
//!
//! The CPU advances `put` after writing entries; the GPU advances `get` as it
//! fetches them. One slot always stays empty so `put == get` means empty.

use crate::error::{GpuControlError, Result};

/// Slots a tracked submit may need on top of the caller's entries: one wait
/// command and one increment command.
pub const EXTRA_GPFIFO_ENTRIES: u32 = 2;

const GP_ENTRY1_LENGTH_SHIFT: u32 = 10;
const GP_ENTRY1_LENGTH_MASK: u32 = 0x1f_ffff;

/// One ring slot: a GPU VA and a length in 32-bit words.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GpfifoEntry {
    pub entry0: u32,
    pub entry1: u32,
}

impl GpfifoEntry {
    /// Encode a pushbuffer segment at `gva` of `words` 32-bit words.
    pub fn new(gva: u64, words: u32) -> Self {
        Self {
            entry0: gva as u32,
            entry1: (gva >> 32) as u32
                | ((words & GP_ENTRY1_LENGTH_MASK) << GP_ENTRY1_LENGTH_SHIFT),
        }
    }

    pub fn gva(&self) -> u64 {
        (u64::from(self.entry1 & ((1 << GP_ENTRY1_LENGTH_SHIFT) - 1)) << 32)
            | u64::from(self.entry0)
    }

    pub fn length(&self) -> u32 {
        (self.entry1 >> GP_ENTRY1_LENGTH_SHIFT) & GP_ENTRY1_LENGTH_MASK
    }
}

/// Ring state owned by a channel, mutated only under its submit lock.
#[derive(Debug)]
pub struct GpfifoRing {
    entries: Vec<GpfifoEntry>,
    put: u32,
    get: u32,
    gva: u64,
}

impl GpfifoRing {
    /// A ring of `entry_num` slots mapped at `gva`. `entry_num` must be a
    /// power of two.
    pub fn new(entry_num: u32, gva: u64) -> Result<Self> {
        if entry_num < 2 || !entry_num.is_power_of_two() {
            return Err(GpuControlError::InvalidArgument(format!(
                "gpfifo size {} is not a power of two",
                entry_num
            )));
        }
        let mut entries = Vec::new();
        entries.try_reserve_exact(entry_num as usize)?;
        entries.resize(entry_num as usize, GpfifoEntry::default());
        Ok(Self {
            entries,
            put: 0,
            get: 0,
            gva,
        })
    }

    #[inline]
    pub fn entry_num(&self) -> u32 {
        self.entries.len() as u32
    }

    #[inline]
    fn mask(&self) -> u32 {
        self.entry_num() - 1
    }

    pub fn put(&self) -> u32 {
        self.put
    }

    pub fn get(&self) -> u32 {
        self.get
    }

    pub fn gva(&self) -> u64 {
        self.gva
    }

    /// Record the GPU's fetch position.
    pub fn set_get(&mut self, get: u32) {
        self.get = get & self.mask();
    }

    /// Slots free for new entries.
    pub fn free_count(&self) -> u32 {
        let n = self.entry_num();
        n.wrapping_sub(self.put.wrapping_sub(self.get)).wrapping_sub(1) % n
    }

    /// Slots written but not yet fetched.
    pub fn in_flight(&self) -> u32 {
        self.put.wrapping_sub(self.get) & self.mask()
    }

    pub fn entry(&self, index: u32) -> GpfifoEntry {
        self.entries[(index & self.mask()) as usize]
    }

    /// Copy `src` in at `put`, wrapping at the end, and advance `put`.
    /// The caller has checked `free_count`.
    pub fn append(&mut self, src: &[GpfifoEntry]) {
        debug_assert!(src.len() as u32 <= self.free_count());
        let start = self.put as usize;
        let len = self.entries.len();
        let first = src.len().min(len - start);
        self.entries[start..start + first].copy_from_slice(&src[..first]);
        self.entries[..src.len() - first].copy_from_slice(&src[first..]);
        self.advance(src.len() as u32);
    }

    /// Slot-wise write used for sources that are copied in chunks.
    pub(crate) fn slots_from_put(&mut self, count: u32) -> (&mut [GpfifoEntry], &mut [GpfifoEntry]) {
        let start = self.put as usize;
        let len = self.entries.len();
        let first = (count as usize).min(len - start);
        let rest = count as usize - first;
        let (head, tail) = self.entries.split_at_mut(start);
        (&mut tail[..first], &mut head[..rest])
    }

    pub(crate) fn advance(&mut self, count: u32) {
        self.put = self.put.wrapping_add(count) & self.mask();
    }

    /// Move `put` back over the last `count` appended entries.
    pub fn rewind(&mut self, count: u32) {
        self.put = self.put.wrapping_sub(count) & self.mask();
    }
}
