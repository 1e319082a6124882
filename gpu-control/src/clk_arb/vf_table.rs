//! Double-buffered VF table with lock-free publish.
//!
//! Two table slots exist for the lifetime of the arbiter. One is published
//! through an [`ArcSwap`]; the other is the spare the next rebuild writes
//! into. Readers never see a partially written table: the rebuild fills a
//! table nobody else can reach, seals its checksum and only then swaps it in.
//!
//! ```text
//! Readers (N)                       Worker (1)
//!   |                                 |
//!   +-- store.load()                  +-- take spare slot (1 - current.slot)
//!   |   (acquire)                     +-- fill from backend
//!   |                                 +-- seal checksum
//!   +-- guard keeps table alive       +-- store (release), old -> spare
//! ```
//!
//! A spare still pinned by a slow reader is not written in place; the
//! rebuild allocates a fresh table for that slot instead.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use arc_swap::{ArcSwap, Guard};
use parking_lot::Mutex;

use super::backend::ClockBackend;
use super::types::{ClockDomain, Pstate, VfPoint};
use crate::error::{GpuControlError, Result};

/// Rebuild progress, observable by tests and debug dumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RebuildState {
    Idle = 0,
    Rebuilding = 1,
    Published = 2,
}

impl RebuildState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => RebuildState::Rebuilding,
            2 => RebuildState::Published,
            _ => RebuildState::Idle,
        }
    }
}

/// FNV-1a over 64-bit words.
struct Fnv(u64);

impl Fnv {
    fn new() -> Self {
        Fnv(0xcbf2_9ce4_8422_2325)
    }

    fn mix(&mut self, v: u64) {
        self.0 ^= v;
        self.0 = self.0.wrapping_mul(0x0000_0100_0000_01b3);
    }
}

/// One VF table slot.
#[derive(Debug, Clone)]
pub struct VfTable {
    slot: u8,
    generation: u64,
    gpc2clk_range: (u16, u16),
    mclk_range: Option<(u16, u16)>,
    mclk_points: Vec<u16>,
    points: Vec<VfPoint>,
    checksum: u64,
}

impl VfTable {
    /// Empty table for `slot`, with room for `capacity` points.
    pub fn empty(slot: u8, capacity: usize) -> Self {
        let mut t = Self {
            slot,
            generation: 0,
            gpc2clk_range: (0, 0),
            mclk_range: None,
            mclk_points: Vec::new(),
            points: Vec::with_capacity(capacity),
            checksum: 0,
        };
        t.seal();
        t
    }

    pub fn slot(&self) -> u8 {
        self.slot
    }

    /// Number of successful publishes before this table.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn points(&self) -> &[VfPoint] {
        &self.points
    }

    pub fn num_points(&self) -> usize {
        self.points.len()
    }

    pub fn gpc2clk_range(&self) -> (u16, u16) {
        self.gpc2clk_range
    }

    pub fn mclk_range(&self) -> Option<(u16, u16)> {
        self.mclk_range
    }

    pub fn mclk_points(&self) -> &[u16] {
        &self.mclk_points
    }

    /// Range of `domain` this table was built from.
    pub fn range(&self, domain: ClockDomain) -> Option<(u16, u16)> {
        match domain {
            ClockDomain::Gpc2clk => Some(self.gpc2clk_range),
            ClockDomain::Mclk => self.mclk_range,
        }
    }

    /// First point at or above `gpc_mhz`, else the highest point.
    pub fn find_point(&self, gpc_mhz: u16) -> Option<&VfPoint> {
        self.points
            .iter()
            .find(|p| p.gpc_mhz >= gpc_mhz)
            .or_else(|| self.points.last())
    }

    /// First memory clock point at or above `mclk_mhz`, else the highest.
    pub fn find_mclk_point(&self, mclk_mhz: u16) -> Option<u16> {
        self.mclk_points
            .iter()
            .copied()
            .find(|&m| m >= mclk_mhz)
            .or_else(|| self.mclk_points.last().copied())
    }

    /// Checksum of the current contents.
    pub fn compute_checksum(&self) -> u64 {
        let mut h = Fnv::new();
        h.mix(self.slot as u64);
        h.mix(self.generation);
        h.mix(((self.gpc2clk_range.0 as u64) << 16) | self.gpc2clk_range.1 as u64);
        match self.mclk_range {
            Some((lo, hi)) => h.mix((1 << 32) | ((lo as u64) << 16) | hi as u64),
            None => h.mix(0),
        }
        for m in &self.mclk_points {
            h.mix(*m as u64);
        }
        h.mix(self.points.len() as u64);
        for p in &self.points {
            h.mix(
                (p.gpc_mhz as u64)
                    | ((p.sys_mhz as u64) << 16)
                    | ((p.xbar_mhz as u64) << 32)
                    | ((p.nvd_mhz as u64) << 48),
            );
            h.mix(((p.host_mhz as u64) << 32) | p.pstates as u64);
        }
        h.0
    }

    /// Checksum sealed at publish time.
    pub fn checksum(&self) -> u64 {
        self.checksum
    }

    /// Whether the contents still match the sealed checksum.
    pub fn is_consistent(&self) -> bool {
        self.compute_checksum() == self.checksum
    }

    fn seal(&mut self) {
        self.checksum = self.compute_checksum();
    }

    fn reset(&mut self, slot: u8, generation: u64) {
        self.slot = slot;
        self.generation = generation;
        self.gpc2clk_range = (0, 0);
        self.mclk_range = None;
        self.mclk_points.clear();
        self.points.clear();
        self.checksum = 0;
    }

    /// Fill this slot from the backend.
    ///
    /// `range` gives the allowed window per domain (the arbiter narrows the
    /// hardware range by pstate bounds and the board cap). Accepts gpc2clk
    /// points inside that window, de-duplicates adjacent equal points,
    /// resolves slave clocks and tags pstate support. Any backend failure
    /// aborts the fill.
    pub fn populate(
        &mut self,
        backend: &dyn ClockBackend,
        range: &dyn Fn(ClockDomain) -> Result<(u16, u16)>,
        max_f_points: usize,
    ) -> Result<()> {
        let (gpc_min, gpc_max) = query_range(range, ClockDomain::Gpc2clk)?;
        self.gpc2clk_range = (gpc_min, gpc_max);

        if backend.clk_domains() & ClockDomain::Mclk.bit() != 0 {
            let (mclk_min, mclk_max) = query_range(range, ClockDomain::Mclk)?;
            self.mclk_range = Some((mclk_min, mclk_max));
            let mut mclk_points = backend.f_points(ClockDomain::Mclk, max_f_points)?;
            mclk_points.retain(|m| (mclk_min..=mclk_max).contains(m));
            mclk_points.dedup();
            self.mclk_points = mclk_points;
        }

        let mut f_points = backend.f_points(ClockDomain::Gpc2clk, max_f_points)?;
        f_points.truncate(max_f_points);
        if f_points.is_empty() {
            return Err(GpuControlError::EmptyFrequencyTable(ClockDomain::Gpc2clk));
        }

        if backend.pstate_clk_info(Pstate::P0, ClockDomain::Gpc2clk).is_none() {
            return Err(GpuControlError::InvalidRange {
                domain: ClockDomain::Gpc2clk,
                reason: "no P0 bounds".into(),
            });
        }
        let tiers: Vec<_> = Pstate::ALL
            .iter()
            .filter_map(|&p| backend.pstate_clk_info(p, ClockDomain::Gpc2clk).map(|i| (p, i)))
            .collect();

        let mut prev = None;
        for &mhz in &f_points {
            if mhz < gpc_min || mhz > gpc_max || prev == Some(mhz) {
                continue;
            }
            let slaves = backend.slave_clks(mhz)?;
            let mut point = VfPoint::from_slaves(slaves);
            point.gpc_mhz = mhz;
            for (pstate, info) in &tiers {
                if (info.min_mhz..=info.max_mhz).contains(&mhz) {
                    point.pstates |= pstate.bit();
                }
            }
            self.points.push(point);
            prev = Some(mhz);
        }

        if self.points.is_empty() {
            return Err(GpuControlError::EmptyFrequencyTable(ClockDomain::Gpc2clk));
        }
        Ok(())
    }
}

fn query_range(
    range: &dyn Fn(ClockDomain) -> Result<(u16, u16)>,
    domain: ClockDomain,
) -> Result<(u16, u16)> {
    match range(domain) {
        Ok((min, max)) if min <= max => Ok((min, max)),
        Ok((min, max)) => Err(GpuControlError::InvalidRange {
            domain,
            reason: format!("min {} > max {}", min, max),
        }),
        Err(e @ GpuControlError::InvalidRange { .. }) => Err(e),
        Err(e) => Err(GpuControlError::InvalidRange {
            domain,
            reason: e.to_string(),
        }),
    }
}

// ============================================================================
// Store
// ============================================================================

/// Two-slot VF table store.
pub struct VfTableStore {
    current: ArcSwap<VfTable>,
    spare: Mutex<Option<Arc<VfTable>>>,
    /// Serializes writers; readers never take it.
    writer: Mutex<()>,
    state: AtomicU8,
    capacity: usize,
}

impl VfTableStore {
    /// Store whose slot 0 holds an empty table, with room for `capacity`
    /// points per slot.
    pub fn new(capacity: usize) -> Self {
        Self {
            current: ArcSwap::from_pointee(VfTable::empty(0, capacity)),
            spare: Mutex::new(Some(Arc::new(VfTable::empty(1, capacity)))),
            writer: Mutex::new(()),
            state: AtomicU8::new(RebuildState::Idle as u8),
            capacity,
        }
    }

    /// Lock-free guard to the published table.
    #[inline]
    pub fn load(&self) -> Guard<Arc<VfTable>> {
        self.current.load()
    }

    /// Owned reference to the published table.
    pub fn load_full(&self) -> Arc<VfTable> {
        self.current.load_full()
    }

    pub fn state(&self) -> RebuildState {
        RebuildState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: RebuildState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Mark the publish cycle complete.
    pub fn finish(&self) {
        self.set_state(RebuildState::Idle);
    }

    /// The inactive slot, reset for writing.
    fn take_inactive(&self, current: &VfTable) -> VfTable {
        let slot = 1 - current.slot;
        let generation = current.generation + 1;
        let spare = self.spare.lock().take();
        let mut table = match spare.map(Arc::try_unwrap) {
            Some(Ok(table)) => table,
            // Still pinned by a reader: leave it to them.
            _ => VfTable::empty(slot, self.capacity),
        };
        table.reset(slot, generation);
        table
    }

    /// Fill the inactive slot with `fill` and publish it.
    ///
    /// On error nothing is published and the spare slot is kept for the next
    /// attempt; the current table stays authoritative.
    pub fn rebuild<F>(&self, fill: F) -> Result<Arc<VfTable>>
    where
        F: FnOnce(&mut VfTable) -> Result<()>,
    {
        let _writer = self.writer.lock();
        self.set_state(RebuildState::Rebuilding);

        let current = self.current.load_full();
        let mut table = self.take_inactive(&current);

        if let Err(e) = fill(&mut table) {
            *self.spare.lock() = Some(Arc::new(table));
            self.set_state(RebuildState::Idle);
            return Err(e);
        }

        table.seal();
        let published = Arc::new(table);
        let old = self.current.swap(Arc::clone(&published));
        drop(current);
        *self.spare.lock() = Some(old);
        self.set_state(RebuildState::Published);
        Ok(published)
    }
}

impl std::fmt::Debug for VfTableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let current = self.load();
        f.debug_struct("VfTableStore")
            .field("slot", &current.slot)
            .field("generation", &current.generation)
            .field("points", &current.points.len())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clk_arb::backend::{ClockTableConfig, TableClockBackend};

    fn fill(t: &mut VfTable, backend: &TableClockBackend, max: usize) -> Result<()> {
        t.populate(backend, &|d| backend.clk_range(d), max)
    }

    fn populated_store() -> (VfTableStore, TableClockBackend) {
        let store = VfTableStore::new(256);
        let backend = TableClockBackend::default();
        store.rebuild(|t| fill(t, &backend, 256)).unwrap();
        (store, backend)
    }

    #[test]
    fn test_store_starts_with_empty_slot_zero() {
        let store = VfTableStore::new(16);
        let t = store.load();
        assert_eq!(t.slot(), 0);
        assert_eq!(t.num_points(), 0);
        assert!(t.is_consistent());
        assert_eq!(store.state(), RebuildState::Idle);
    }

    #[test]
    fn test_rebuild_toggles_slot_and_generation() {
        let (store, backend) = populated_store();
        let first = store.load_full();
        assert_eq!(first.slot(), 1);
        assert_eq!(first.generation(), 1);
        assert_eq!(store.state(), RebuildState::Published);

        store.rebuild(|t| fill(t, &backend, 256)).unwrap();
        let second = store.load_full();
        assert_eq!(second.slot(), 0);
        assert_eq!(second.generation(), 2);
        assert!(second.is_consistent());
    }

    #[test]
    fn test_points_filtered_deduped_and_tagged() {
        let store = VfTableStore::new(256);
        let backend = TableClockBackend::new(ClockTableConfig {
            gpc2clk_min_mhz: 700,
            gpc2clk_max_mhz: 1000,
            f_points: vec![600, 700, 700, 800, 900, 900, 1000, 1100],
            ..Default::default()
        });
        let t = store.rebuild(|t| fill(t, &backend, 256)).unwrap();
        let mhz: Vec<u16> = t.points().iter().map(|p| p.gpc_mhz).collect();
        assert_eq!(mhz, vec![700, 800, 900, 1000]);
        // Default table: P0 covers 600-2000, P8 covers 600-900.
        assert!(t.points().iter().all(|p| p.supports(Pstate::P0)));
        assert!(t.points()[0].supports(Pstate::P8));
        assert!(!t.points()[3].supports(Pstate::P8));
        assert_eq!(t.points()[1].sys_mhz, 640);
    }

    #[test]
    fn test_points_capped_at_max() {
        let store = VfTableStore::new(4);
        let backend = TableClockBackend::default();
        let t = store.rebuild(|t| fill(t, &backend, 4)).unwrap();
        assert_eq!(t.num_points(), 4);
    }

    #[test]
    fn test_empty_points_keeps_stale_table() {
        let (store, backend) = populated_store();
        let before = store.load_full();
        backend.set_f_points(Vec::new());
        let err = store.rebuild(|t| fill(t, &backend, 256)).unwrap_err();
        assert!(matches!(err, GpuControlError::EmptyFrequencyTable(ClockDomain::Gpc2clk)));
        let after = store.load_full();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(store.state(), RebuildState::Idle);
    }

    #[test]
    fn test_invalid_range_aborts() {
        let (store, backend) = populated_store();
        backend.set_gpc2clk_range(1500, 1000);
        let err = store.rebuild(|t| fill(t, &backend, 256)).unwrap_err();
        assert!(matches!(err, GpuControlError::InvalidRange { .. }));
        assert_eq!(store.load().generation(), 1);
    }

    #[test]
    fn test_missing_p0_rejected() {
        let store = VfTableStore::new(16);
        let backend = TableClockBackend::new(ClockTableConfig {
            pstates: Vec::new(),
            ..Default::default()
        });
        assert!(matches!(
            store.rebuild(|t| fill(t, &backend, 16)),
            Err(GpuControlError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_pinned_spare_not_written_in_place() {
        let (store, backend) = populated_store();
        // Pin the current (slot 1) table; after the next publish it becomes
        // the spare while still referenced.
        let pinned = store.load_full();
        let sealed = pinned.checksum();
        store.rebuild(|t| fill(t, &backend, 256)).unwrap();
        backend.set_f_points(vec![600, 645]);
        store.rebuild(|t| fill(t, &backend, 256)).unwrap();
        assert_eq!(pinned.checksum(), sealed);
        assert!(pinned.is_consistent());
        assert_eq!(store.load().num_points(), 2);
        assert_eq!(store.load().slot(), 1);
    }

    #[test]
    fn test_find_point_snaps_up() {
        let (store, _) = populated_store();
        let t = store.load();
        assert_eq!(t.find_point(601).unwrap().gpc_mhz, 645);
        assert_eq!(t.find_point(0).unwrap().gpc_mhz, 600);
        let last = t.points().last().unwrap().gpc_mhz;
        assert_eq!(t.find_point(u16::MAX).unwrap().gpc_mhz, last);
        assert_eq!(t.find_mclk_point(1000), Some(3003));
    }
}
