//! The clock arbiter.
//!
//! Owns the global alarm word, the arbiter-wide notification queue, the
//! double-buffered VF table and the set of client sessions. All clock
//! changes happen on one background worker thread (`clk-arb`):
//!
//! ```text
//!  client threads                          clk-arb worker
//!  --------------                          --------------
//!  commit_request_fd --enqueue(UpdateArb)--> run_arbiter()
//!  release_session   --enqueue(UpdateArb)-->   fold session requests
//!  send_thermal_alarm -set+enqueue--------->   program clocks, publish actual
//!                                              complete requests, notify users
//!  schedule_vf_table_update --------------> update_vf_table()
//!                                              rebuild inactive slot, publish
//!                                              enqueue(UpdateArb)
//!  event_poll --notify (lock-free)--> client queue
//! ```
//!
//! Enqueue is coalescing: a burst of commits while a pass is queued costs
//! one pass. Client polls and the worker may run [`notify`] on the same
//! handle concurrently.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex, MutexGuard};

use super::alarm::{self, AlarmWord, GlobalAlarmState};
use super::backend::ClockBackend;
use super::notification::{Notification, NotificationQueue};
use super::notify::notify;
use super::session::{ClkDev, ClkDevKind, ClkSession, SessionRegistry};
use super::stats::ArbSwitchStats;
use super::types::{poll, ArbTarget, ClockDomain, Pstate};
use super::vf_table::{RebuildState, VfTable, VfTableStore};
use crate::config::ArbiterConfig;
use crate::error::{GpuControlError, Result};
use crate::worker::{WorkItem, Worker};

/// Work the arbiter thread knows how to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClkArbWorkItem {
    /// Refresh the backend's VF cache, then rebuild and publish the table.
    UpdateVfTable,
    /// Run one arbitration pass.
    UpdateArb,
}

impl WorkItem for ClkArbWorkItem {
    type Key = ClkArbWorkItem;

    fn key(&self) -> ClkArbWorkItem {
        *self
    }
}

/// GPU clock arbiter.
pub struct ClkArbiter {
    config: ArbiterConfig,
    backend: Arc<dyn ClockBackend>,
    alarm: GlobalAlarmState,
    notification_queue: NotificationQueue,
    vf_tables: VfTableStore,
    actual: ArcSwap<ArbTarget>,
    sessions: SessionRegistry,
    /// Event handles, notified after every pass.
    users: Mutex<Vec<Arc<ClkDev>>>,
    /// Request handles folded into the running pass, completed at its end.
    requests: Mutex<Vec<Arc<ClkDev>>>,
    next_dev_id: AtomicU64,
    /// Committed requests not yet completed.
    global_nr: AtomicU32,
    gpc2clk_default_mhz: u16,
    mclk_default_mhz: u16,
    gpc_cap_mhz: Option<u16>,
    /// Completed arbiter passes; init waits for the first one.
    req_nr: Mutex<u64>,
    request_wq: Condvar,
    status: Mutex<Result<()>>,
    pstate_lock: Mutex<()>,
    stats: Mutex<ArbSwitchStats>,
    worker: OnceLock<Worker<ClkArbWorkItem>>,
}

impl ClkArbiter {
    /// Bring the arbiter up.
    ///
    /// Builds the first VF table synchronously, starts the worker and waits
    /// (bounded by `init_timeout_ms`) for the first arbiter pass. Returns
    /// that pass's error if it failed.
    pub fn new(config: ArbiterConfig, backend: Arc<dyn ClockBackend>) -> Result<Arc<Self>> {
        let domains = backend.clk_domains();
        if domains == 0 {
            return Err(GpuControlError::NoDevice("no arbitrated clock domains".into()));
        }

        let step = config.freq_step_mhz.max(1);
        let gpc_cap_mhz = config.gpc_cap_mhz.map(|cap| cap - cap % step);
        let mut gpc2clk_default_mhz = backend.clk_default(ClockDomain::Gpc2clk)?;
        if let Some(cap) = gpc_cap_mhz {
            gpc2clk_default_mhz = gpc2clk_default_mhz.min(cap);
        }
        let mclk_default_mhz = if domains & ClockDomain::Mclk.bit() != 0 {
            backend.clk_default(ClockDomain::Mclk)?
        } else {
            0
        };

        let arb = Arc::new(Self {
            notification_queue: NotificationQueue::new(config.notification_queue_size)?,
            vf_tables: VfTableStore::new(config.max_f_points),
            config,
            backend,
            alarm: GlobalAlarmState::new(),
            actual: ArcSwap::from_pointee(ArbTarget::IDLE),
            sessions: SessionRegistry::new(),
            users: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            next_dev_id: AtomicU64::new(0),
            global_nr: AtomicU32::new(0),
            gpc2clk_default_mhz,
            mclk_default_mhz,
            gpc_cap_mhz,
            req_nr: Mutex::new(0),
            request_wq: Condvar::new(),
            status: Mutex::new(Ok(())),
            pstate_lock: Mutex::new(()),
            stats: Mutex::new(ArbSwitchStats::default()),
            worker: OnceLock::new(),
        });

        arb.backend.refresh_vf_cache()?;
        arb.update_vf_table()?;

        let weak: Weak<ClkArbiter> = Arc::downgrade(&arb);
        let worker = Worker::spawn("clk-arb", move |item| {
            if let Some(arb) = weak.upgrade() {
                arb.process(item);
            }
        })?;
        if arb.worker.set(worker).is_err() {
            return Err(GpuControlError::Backend("clk-arb worker started twice".into()));
        }

        arb.enqueue(ClkArbWorkItem::UpdateArb);
        arb.wait_first_run()?;
        arb.status.lock().clone()?;

        log::info!(
            "clk_arb: up, gpc2clk default {} MHz, mclk default {} MHz, cap {:?}",
            arb.gpc2clk_default_mhz,
            arb.mclk_default_mhz,
            arb.gpc_cap_mhz
        );
        Ok(arb)
    }

    fn wait_first_run(&self) -> Result<()> {
        let timeout = Duration::from_millis(self.config.init_timeout_ms);
        let deadline = Instant::now() + timeout;
        let mut nr = self.req_nr.lock();
        while *nr == 0 {
            if self.request_wq.wait_until(&mut nr, deadline).timed_out() && *nr == 0 {
                log::error!("clk_arb: first arbiter run did not complete in {:?}", timeout);
                return Err(GpuControlError::Timeout(timeout));
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &ArbiterConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn ClockBackend> {
        &self.backend
    }

    // ========================================================================
    // Worker plumbing
    // ========================================================================

    fn enqueue(&self, item: ClkArbWorkItem) {
        match self.worker.get() {
            Some(worker) => {
                worker.enqueue(item);
            }
            // Init-time rebuild: the first pass is queued once the worker runs.
            None => log::trace!("clk_arb: {:?} before worker start", item),
        }
    }

    fn process(&self, item: ClkArbWorkItem) {
        log::trace!("clk_arb: processing {:?}", item);
        match item {
            ClkArbWorkItem::UpdateVfTable => {
                if let Err(e) = self.backend.refresh_vf_cache() {
                    log::warn!("clk_arb: failed to cache VF table: {}", e);
                    self.set_global_alarm(alarm::VF_TABLE_UPDATE_FAILED);
                    self.enqueue(ClkArbWorkItem::UpdateArb);
                    return;
                }
                // Failures are reported through the alarm.
                let _ = self.update_vf_table();
            }
            ClkArbWorkItem::UpdateArb => self.run_arbiter(),
        }
    }

    /// Block until all queued arbiter work, including work it queued, is done.
    pub fn flush(&self) -> Result<()> {
        match self.worker.get() {
            Some(worker) => worker.flush(),
            None => Ok(()),
        }
    }

    /// Stop the worker. Queued work still runs; later enqueues are dropped.
    pub fn shutdown(&self) -> Result<()> {
        log::debug!("clk_arb: shutdown");
        match self.worker.get() {
            Some(worker) => worker.stop(),
            None => Ok(()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.get().is_some_and(|w| w.is_running())
    }

    // ========================================================================
    // Ranges and VF table
    // ========================================================================

    /// Range the arbiter may program for `domain`.
    ///
    /// The hardware range narrowed by the P0 bounds; for gpc2clk the floor
    /// also sits above the DVCO minimum and the ceiling under the GPC cap.
    pub fn get_arbiter_clk_range(&self, domain: ClockDomain) -> Result<(u16, u16)> {
        if !self.is_valid_domain(domain) {
            return Err(GpuControlError::InvalidArgument(format!(
                "{:?} is not arbitrated",
                domain
            )));
        }
        let (mut min, mut max) = self.backend.clk_range(domain)?;
        if let Some(p0) = self.backend.pstate_clk_info(Pstate::P0, domain) {
            min = min.max(p0.min_mhz);
            max = max.min(p0.max_mhz);
        }
        if domain == ClockDomain::Gpc2clk {
            let dvco = self.backend.dvco_min_mhz();
            if dvco != 0 && dvco >= min {
                min = dvco.saturating_add(1);
            }
            if let Some(cap) = self.gpc_cap_mhz {
                max = max.min(cap);
            }
        }
        Ok((min, max))
    }

    /// Rebuild the inactive VF table slot and publish it.
    ///
    /// On failure the published table stays current and
    /// `VF_TABLE_UPDATE_FAILED` is raised. An arbiter pass is queued either
    /// way.
    pub fn update_vf_table(&self) -> Result<()> {
        let max_f_points = self.config.max_f_points;
        let range = |d: ClockDomain| self.get_arbiter_clk_range(d);
        let result = self
            .vf_tables
            .rebuild(|table| table.populate(self.backend.as_ref(), &range, max_f_points));

        let result = match result {
            Ok(table) => {
                log::debug!(
                    "clk_arb: published VF table slot {} gen {} ({} points)",
                    table.slot(),
                    table.generation(),
                    table.num_points()
                );
                Ok(())
            }
            Err(e) => {
                log::warn!("clk_arb: VF table update failed: {}", e);
                self.set_global_alarm(alarm::VF_TABLE_UPDATE_FAILED);
                Err(e)
            }
        };

        self.enqueue(ClkArbWorkItem::UpdateArb);
        self.vf_tables.finish();
        result
    }

    /// Queue a VF cache refresh and table rebuild.
    pub fn schedule_vf_table_update(&self) {
        self.enqueue(ClkArbWorkItem::UpdateVfTable);
    }

    /// The published VF table.
    pub fn vf_table(&self) -> Arc<VfTable> {
        self.vf_tables.load_full()
    }

    pub fn rebuild_state(&self) -> RebuildState {
        self.vf_tables.state()
    }

    // ========================================================================
    // Alarms
    // ========================================================================

    /// Raise `bits` and record them on the global notification queue.
    pub fn set_global_alarm(&self, bits: u32) -> AlarmWord {
        let word = self.alarm.set(bits);
        self.notification_queue.push(bits);
        word
    }

    pub fn clear_global_alarm(&self, bits: u32) -> AlarmWord {
        self.alarm.clear(bits)
    }

    pub fn alarm_word(&self) -> AlarmWord {
        self.alarm.load()
    }

    /// Raise `bits` and queue a pass so clients hear about them.
    pub fn schedule_alarm(&self, bits: u32) {
        self.set_global_alarm(bits);
        self.enqueue(ClkArbWorkItem::UpdateArb);
    }

    pub fn send_thermal_alarm(&self) {
        self.schedule_alarm(alarm::THERMAL_ABOVE_THRESHOLD);
    }

    /// Mark the GPU as gone. Later passes skip arbitration but keep
    /// reporting `GPU_LOST` to every client.
    pub fn gpu_lost(&self) {
        log::error!("clk_arb: GPU lost");
        self.schedule_alarm(alarm::GPU_LOST);
    }

    pub fn notification_queue(&self) -> &NotificationQueue {
        &self.notification_queue
    }

    // ========================================================================
    // Arbitration
    // ========================================================================

    /// Fold committed requests into session targets; max over sessions.
    fn collect_targets(&self) -> (u16, u16) {
        let mut gpc2clk_target = 0u16;
        let mut mclk_target = 0u16;
        for session in self.sessions.snapshot() {
            if session.is_zombie() {
                continue;
            }
            let committed = session.take_requests();
            if !committed.is_empty() {
                let mut target = session.target();
                let mut gpc_set = false;
                let mut mclk_set = false;
                for dev in &committed {
                    let mclk = dev.target_mhz(ClockDomain::Mclk);
                    if !mclk_set && mclk != 0 {
                        target.mclk_mhz = mclk;
                        mclk_set = true;
                    }
                    let gpc = dev.target_mhz(ClockDomain::Gpc2clk);
                    if !gpc_set && gpc != 0 {
                        target.gpc2clk_mhz = gpc;
                        gpc_set = true;
                    }
                }
                target.pstate = Pstate::P0;
                self.requests.lock().extend(committed);
                session.swap_target(target);
            }
            let target = session.target();
            gpc2clk_target = gpc2clk_target.max(target.gpc2clk_mhz);
            mclk_target = mclk_target.max(target.mclk_mhz);
        }
        (gpc2clk_target, mclk_target)
    }

    fn program(&self, gpc2clk_target: u16, mclk_target: u16) -> Result<ArbTarget> {
        let table = self.vf_tables.load_full();

        let mut gpc = if gpc2clk_target > 0 {
            gpc2clk_target
        } else {
            self.gpc2clk_default_mhz
        };
        let (gpc_min, gpc_max) = table.gpc2clk_range();
        gpc = gpc.clamp(gpc_min, gpc_max.max(gpc_min));
        if let Some(cap) = self.gpc_cap_mhz {
            gpc = gpc.min(cap);
        }

        let mut mclk = if mclk_target > 0 {
            mclk_target
        } else {
            self.mclk_default_mhz
        };
        if let Some((mclk_min, mclk_max)) = table.mclk_range() {
            mclk = mclk.clamp(mclk_min, mclk_max.max(mclk_min));
        }

        let point = *table
            .find_point(gpc)
            .ok_or(GpuControlError::EmptyFrequencyTable(ClockDomain::Gpc2clk))?;
        let mclk = table.find_mclk_point(mclk).unwrap_or(0);
        let pstate = Pstate::ALL
            .iter()
            .rev()
            .copied()
            .find(|&p| point.supports(p))
            .unwrap_or(Pstate::P0);

        {
            let _pstate = self.pstate_lock.lock();
            self.backend.program_clocks(&point.slaves(), mclk)?;
        }

        Ok(ArbTarget {
            gpc2clk_mhz: point.gpc_mhz,
            mclk_mhz: mclk,
            pstate,
        })
    }

    fn publish_run(&self, status: Result<()>) {
        *self.status.lock() = status;
        let mut nr = self.req_nr.lock();
        *nr += 1;
        self.request_wq.notify_all();
    }

    /// One arbitration pass. Runs on the worker thread.
    fn run_arbiter(&self) {
        if self.alarm.mask() & alarm::GPU_LOST == 0 {
            let t0 = Instant::now();
            let (gpc2clk_target, mclk_target) = self.collect_targets();

            match self.program(gpc2clk_target, mclk_target) {
                Ok(actual) => {
                    log::debug!(
                        "clk_arb: programmed gpc2clk {} MHz mclk {} MHz ({:?})",
                        actual.gpc2clk_mhz,
                        actual.mclk_mhz,
                        actual.pstate
                    );
                    self.actual.store(Arc::new(actual));
                    self.publish_run(Ok(()));
                    self.set_global_alarm(alarm::VF_UPDATE);
                    self.stats.lock().record(t0.elapsed().as_micros() as u64);
                }
                Err(e) => {
                    log::error!("clk_arb: arbiter update failed: {}", e);
                    self.publish_run(Err(e));
                    self.set_global_alarm(alarm::CLOCK_ARBITER_FAILED);
                }
            }
        }

        let current_alarm = self.alarm.mask();

        let completed = std::mem::take(&mut *self.requests.lock());
        if !completed.is_empty() {
            self.global_nr
                .fetch_sub(completed.len() as u32, Ordering::AcqRel);
        }
        for dev in &completed {
            dev.post_event(poll::POLLIN | poll::POLLRDNORM);
        }

        self.notification_queue.set_head(self.notification_queue.tail());

        let actual = self.actual();
        let users = self.users.lock().clone();
        let mut alarms_notified = 0;
        for dev in &users {
            let session_target = self.sessions.get(dev.session_id()).map(|s| s.target());
            alarms_notified |= notify(
                &self.notification_queue,
                dev,
                session_target,
                &actual,
                current_alarm,
            );
        }

        self.clear_global_alarm(alarms_notified & !alarm::GPU_LOST);
    }

    /// Completed arbiter passes, successful or not.
    pub fn arbiter_runs(&self) -> u64 {
        *self.req_nr.lock()
    }

    /// Result of the last arbiter pass.
    pub fn status(&self) -> Result<()> {
        self.status.lock().clone()
    }

    pub fn switch_stats(&self) -> ArbSwitchStats {
        *self.stats.lock()
    }

    /// Hold off clock programming while the caller changes pstate.
    pub fn pstate_change_lock(&self) -> MutexGuard<'_, ()> {
        self.pstate_lock.lock()
    }

    // ========================================================================
    // Sessions and handles
    // ========================================================================

    /// Open a session. It starts idle (P8, no clock request).
    pub fn init_session(&self) -> Result<Arc<ClkSession>> {
        let session = self.sessions.insert();
        log::debug!("clk_arb: session {} opened", session.id());
        Ok(session)
    }

    /// Close a session; the next pass drops its target.
    pub fn release_session(&self, session: &Arc<ClkSession>) {
        session.mark_zombie();
        self.sessions.remove(session.id());
        log::debug!("clk_arb: session {} released", session.id());
        self.enqueue(ClkArbWorkItem::UpdateArb);
    }

    pub fn num_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn new_dev(
        &self,
        session: &ClkSession,
        kind: ClkDevKind,
        enabled_mask: u32,
    ) -> Result<Arc<ClkDev>> {
        let id = self.next_dev_id.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Arc::new(ClkDev::new(
            id,
            session.id(),
            kind,
            self.config.event_queue_size,
            enabled_mask,
            self.notification_queue.tail(),
        )?))
    }

    /// Create an event handle receiving the alarms in `alarm_mask`.
    ///
    /// Only alarms raised after this call are delivered.
    pub fn install_event_fd(&self, session: &ClkSession, alarm_mask: u32) -> Result<Arc<ClkDev>> {
        let dev = self.new_dev(session, ClkDevKind::Event, alarm_mask)?;
        self.users.lock().push(Arc::clone(&dev));
        Ok(dev)
    }

    pub fn release_event_fd(&self, dev: &ClkDev) {
        self.users.lock().retain(|d| d.id() != dev.id());
    }

    /// Replace the set of alarms an event handle receives.
    pub fn set_event_filter(&self, dev: &ClkDev, alarm_mask: u32) {
        dev.enabled_mask.store(alarm_mask, Ordering::Release);
    }

    /// Deliver pending alarms to `dev` and consume its readiness mask.
    pub fn event_poll(&self, dev: &ClkDev) -> u32 {
        let session_target = self.sessions.get(dev.session_id()).map(|s| s.target());
        notify(
            &self.notification_queue,
            dev,
            session_target,
            &self.actual(),
            self.alarm.mask(),
        );
        dev.take_poll_mask()
    }

    /// Consume up to `max` records from an event handle.
    pub fn event_read(&self, dev: &ClkDev, max: usize) -> Vec<Notification> {
        dev.queue.read(max)
    }

    /// Create a request handle. Targets set on it take effect on commit.
    pub fn install_request_fd(&self, session: &ClkSession) -> Result<Arc<ClkDev>> {
        self.new_dev(session, ClkDevKind::Request, 0)
    }

    pub fn set_session_target_mhz(&self, dev: &ClkDev, domain: ClockDomain, mhz: u16) -> Result<()> {
        if dev.kind() != ClkDevKind::Request {
            return Err(GpuControlError::InvalidArgument(
                "targets are set on request handles".into(),
            ));
        }
        if !self.is_valid_domain(domain) {
            return Err(GpuControlError::InvalidArgument(format!(
                "{:?} is not arbitrated",
                domain
            )));
        }
        dev.set_target_mhz(domain, mhz);
        Ok(())
    }

    /// Submit a request handle's targets to the arbiter.
    pub fn commit_request_fd(&self, session: &ClkSession, dev: &Arc<ClkDev>) -> Result<()> {
        if dev.kind() != ClkDevKind::Request {
            return Err(GpuControlError::InvalidArgument("not a request handle".into()));
        }
        if dev.session_id() != session.id() {
            log::info!(
                "clk_arb: request {} belongs to session {}, not {}",
                dev.id(),
                dev.session_id(),
                session.id()
            );
            return Err(GpuControlError::InvalidArgument(
                "request handle from another session".into(),
            ));
        }
        self.global_nr.fetch_add(1, Ordering::AcqRel);
        session.push_request(Arc::clone(dev));
        self.enqueue(ClkArbWorkItem::UpdateArb);
        Ok(())
    }

    /// Consume a request handle's readiness mask.
    pub fn request_poll(&self, dev: &ClkDev) -> u32 {
        dev.take_poll_mask()
    }

    /// Block until the arbiter completes a committed request.
    pub fn wait_request(&self, dev: &ClkDev, timeout: Duration) -> Result<u32> {
        dev.wait_event(timeout)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn get_arbiter_clk_domains(&self) -> u32 {
        self.backend.clk_domains()
    }

    pub fn is_valid_domain(&self, domain: ClockDomain) -> bool {
        self.get_arbiter_clk_domains() & domain.bit() != 0
    }

    fn check_domain(&self, domain: ClockDomain) -> Result<()> {
        if self.is_valid_domain(domain) {
            Ok(())
        } else {
            Err(GpuControlError::InvalidArgument(format!(
                "{:?} is not arbitrated",
                domain
            )))
        }
    }

    pub fn get_session_target_mhz(&self, session: &ClkSession, domain: ClockDomain) -> Result<u16> {
        self.check_domain(domain)?;
        Ok(session.target().mhz(domain))
    }

    /// The configuration the arbiter last programmed.
    pub fn actual(&self) -> ArbTarget {
        **self.actual.load()
    }

    pub fn get_arbiter_actual_mhz(&self, domain: ClockDomain) -> Result<u16> {
        self.check_domain(domain)?;
        Ok(self.actual().mhz(domain))
    }

    /// Frequency the backend measures right now.
    pub fn get_arbiter_effective_mhz(&self, domain: ClockDomain) -> Result<u16> {
        self.check_domain(domain)?;
        let mhz = self.backend.measure_freq_hz(domain) / 1_000_000;
        let mhz = match domain {
            // Measured on gpcclk, reported in gpc2clk units.
            ClockDomain::Gpc2clk => mhz * 2,
            ClockDomain::Mclk => mhz,
        };
        Ok(mhz.min(u16::MAX as u64) as u16)
    }

    /// Raw frequency points the backend offers for `domain`.
    pub fn get_arbiter_clk_f_points(&self, domain: ClockDomain) -> Result<Vec<u16>> {
        self.check_domain(domain)?;
        self.backend.f_points(domain, self.config.max_f_points)
    }

    /// Points inside the arbiter range, without adjacent duplicates.
    pub fn get_vf_points(&self, domain: ClockDomain) -> Result<Vec<u16>> {
        let (min, max) = self.get_arbiter_clk_range(domain)?;
        let mut points = self.get_arbiter_clk_f_points(domain)?;
        points.retain(|mhz| (min..=max).contains(mhz));
        points.dedup();
        Ok(points)
    }

    pub fn get_current_pstate(&self) -> Pstate {
        self.actual().pstate
    }

    /// Whether any committed request is still waiting for a pass.
    pub fn has_active_req(&self) -> bool {
        self.global_nr.load(Ordering::Acquire) > 0
    }
}

impl Drop for ClkArbiter {
    fn drop(&mut self) {
        log::debug!("clk_arb: torn down after {} passes", *self.req_nr.lock());
    }
}

impl std::fmt::Debug for ClkArbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClkArbiter")
            .field("actual", &self.actual())
            .field("alarm", &self.alarm.load())
            .field("sessions", &self.sessions.len())
            .field("vf_tables", &self.vf_tables)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clk_arb::backend::{ClockTableConfig, TableClockBackend};

    fn arbiter() -> (Arc<ClkArbiter>, Arc<TableClockBackend>) {
        let backend = Arc::new(TableClockBackend::default());
        let arb = ClkArbiter::new(ArbiterConfig::default(), backend.clone()).unwrap();
        (arb, backend)
    }

    #[test]
    fn test_init_programs_default_snapped_up() {
        let (arb, backend) = arbiter();
        assert_eq!(arb.arbiter_runs(), 1);
        // 1200 MHz default lands on the next 45 MHz step.
        assert_eq!(arb.get_arbiter_actual_mhz(ClockDomain::Gpc2clk).unwrap(), 1230);
        assert_eq!(arb.get_arbiter_actual_mhz(ClockDomain::Mclk).unwrap(), 3003);
        let (slaves, mclk) = backend.programmed().unwrap();
        assert_eq!(slaves.gpc_mhz, 1230);
        assert_eq!(mclk, 3003);
        assert_eq!(arb.get_arbiter_effective_mhz(ClockDomain::Gpc2clk).unwrap(), 1230);
        assert!(arb.alarm_word().mask & alarm::VF_UPDATE != 0);
        assert_eq!(arb.switch_stats().switch_num, 1);
    }

    #[test]
    fn test_no_domains_is_no_device() {
        struct Dead;
        impl ClockBackend for Dead {
            fn clk_domains(&self) -> u32 {
                0
            }
            fn clk_range(&self, d: ClockDomain) -> Result<(u16, u16)> {
                Err(GpuControlError::InvalidRange { domain: d, reason: "none".into() })
            }
            fn clk_default(&self, _: ClockDomain) -> Result<u16> {
                Ok(0)
            }
            fn f_points(&self, _: ClockDomain, _: usize) -> Result<Vec<u16>> {
                Ok(Vec::new())
            }
            fn slave_clks(&self, _: u16) -> Result<crate::clk_arb::types::SlaveFreq> {
                Ok(Default::default())
            }
            fn pstate_clk_info(
                &self,
                _: Pstate,
                _: ClockDomain,
            ) -> Option<crate::clk_arb::types::PstateClkInfo> {
                None
            }
            fn program_clocks(&self, _: &crate::clk_arb::types::SlaveFreq, _: u16) -> Result<()> {
                Ok(())
            }
            fn measure_freq_hz(&self, _: ClockDomain) -> u64 {
                0
            }
        }
        let err = ClkArbiter::new(ArbiterConfig::default(), Arc::new(Dead)).unwrap_err();
        assert!(matches!(err, GpuControlError::NoDevice(_)));
    }

    #[test]
    fn test_empty_table_at_init_fails() {
        let mut table = ClockTableConfig::default();
        table.f_points.clear();
        let backend = Arc::new(TableClockBackend::new(table));
        let err = ClkArbiter::new(ArbiterConfig::default(), backend).unwrap_err();
        assert_eq!(err, GpuControlError::EmptyFrequencyTable(ClockDomain::Gpc2clk));
    }

    #[test]
    fn test_clk_range_applies_dvco_and_cap() {
        let mut table = ClockTableConfig::default();
        table.dvco_min_mhz = 700;
        let backend = Arc::new(TableClockBackend::new(table));
        let config = ArbiterConfig {
            gpc_cap_mhz: Some(1807),
            ..Default::default()
        };
        let arb = ClkArbiter::new(config, backend).unwrap();
        // Cap rounds down to the 15 MHz step.
        assert_eq!(arb.get_arbiter_clk_range(ClockDomain::Gpc2clk).unwrap(), (701, 1800));
        let points = arb.get_vf_points(ClockDomain::Gpc2clk).unwrap();
        assert!(points.iter().all(|&p| (701..=1800).contains(&p)));
        assert_eq!(arb.vf_table().gpc2clk_range(), (701, 1800));
    }

    #[test]
    fn test_request_commit_and_complete() {
        let (arb, _backend) = arbiter();
        let session = arb.init_session().unwrap();
        let req = arb.install_request_fd(&session).unwrap();
        arb.set_session_target_mhz(&req, ClockDomain::Gpc2clk, 1500).unwrap();
        arb.commit_request_fd(&session, &req).unwrap();
        let mask = arb.wait_request(&req, Duration::from_secs(5)).unwrap();
        assert_eq!(mask, poll::POLLIN | poll::POLLRDNORM);
        arb.flush().unwrap();

        assert_eq!(arb.get_session_target_mhz(&session, ClockDomain::Gpc2clk).unwrap(), 1500);
        assert_eq!(arb.get_arbiter_actual_mhz(ClockDomain::Gpc2clk).unwrap(), 1500);
        assert!(!arb.has_active_req());
    }

    #[test]
    fn test_max_over_sessions_and_release() {
        let (arb, _backend) = arbiter();
        let low = arb.init_session().unwrap();
        let high = arb.init_session().unwrap();
        for (session, mhz) in [(&low, 960), (&high, 1590)] {
            let req = arb.install_request_fd(session).unwrap();
            arb.set_session_target_mhz(&req, ClockDomain::Gpc2clk, mhz).unwrap();
            arb.commit_request_fd(session, &req).unwrap();
        }
        arb.flush().unwrap();
        assert_eq!(arb.actual().gpc2clk_mhz, 1590);

        arb.release_session(&high);
        arb.flush().unwrap();
        assert_eq!(arb.actual().gpc2clk_mhz, 960);
        assert_eq!(arb.num_sessions(), 1);
    }

    #[test]
    fn test_commit_from_other_session_rejected() {
        let (arb, _backend) = arbiter();
        let a = arb.init_session().unwrap();
        let b = arb.init_session().unwrap();
        let req = arb.install_request_fd(&a).unwrap();
        let err = arb.commit_request_fd(&b, &req).unwrap_err();
        assert!(matches!(err, GpuControlError::InvalidArgument(_)));
        assert_eq!(b.pending_requests(), 0);
    }

    #[test]
    fn test_event_handle_sees_thermal_alarm() {
        let (arb, _backend) = arbiter();
        let session = arb.init_session().unwrap();
        let ev = arb
            .install_event_fd(&session, alarm::THERMAL_ABOVE_THRESHOLD)
            .unwrap();
        arb.send_thermal_alarm();
        arb.flush().unwrap();
        let mask = ev.wait_event(Duration::from_secs(5)).unwrap();
        assert_ne!(mask & poll::POLLPRI, 0);
        let records = arb.event_read(&ev, 8);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].alarm_mask, alarm::THERMAL_ABOVE_THRESHOLD);
        // Reported alarms are cleared from the global word.
        assert_eq!(arb.alarm_word().mask & alarm::THERMAL_ABOVE_THRESHOLD, 0);
    }

    #[test]
    fn test_vf_table_update_failure_keeps_stale_table() {
        let (arb, backend) = arbiter();
        let before = arb.vf_table();
        let runs = arb.arbiter_runs();
        backend.set_f_points(Vec::new());

        let err = arb.update_vf_table().unwrap_err();
        assert_eq!(err, GpuControlError::EmptyFrequencyTable(ClockDomain::Gpc2clk));
        assert_ne!(arb.alarm_word().mask & alarm::VF_TABLE_UPDATE_FAILED, 0);
        assert_eq!(arb.vf_table().generation(), before.generation());
        assert_eq!(arb.rebuild_state(), RebuildState::Idle);

        arb.flush().unwrap();
        assert!(arb.arbiter_runs() > runs);
    }

    #[test]
    fn test_scheduled_rebuild_publishes_new_generation() {
        let (arb, backend) = arbiter();
        let gen = arb.vf_table().generation();
        backend.set_f_points((0..10).map(|i| 600 + 100 * i).collect());
        arb.schedule_vf_table_update();
        arb.flush().unwrap();
        let table = arb.vf_table();
        assert_eq!(table.generation(), gen + 1);
        assert_eq!(table.num_points(), 10);
        assert!(table.is_consistent());
        // Default 1200 is a point of the new table.
        assert_eq!(arb.actual().gpc2clk_mhz, 1200);
    }

    #[test]
    fn test_gpu_lost_skips_arbitration_and_hangs_up() {
        let (arb, backend) = arbiter();
        let session = arb.init_session().unwrap();
        let ev = arb.install_event_fd(&session, alarm::ALL).unwrap();
        let runs = arb.arbiter_runs();
        arb.gpu_lost();
        arb.flush().unwrap();
        assert_eq!(arb.arbiter_runs(), runs);
        assert_ne!(ev.take_poll_mask() & poll::POLLHUP, 0);
        assert_ne!(arb.alarm_word().mask & alarm::GPU_LOST, 0);

        // Nothing is programmed once the GPU is gone.
        let req = arb.install_request_fd(&session).unwrap();
        arb.set_session_target_mhz(&req, ClockDomain::Gpc2clk, 2000).unwrap();
        arb.commit_request_fd(&session, &req).unwrap();
        arb.flush().unwrap();
        let err = arb.wait_request(&req, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, GpuControlError::Timeout(_)));
        assert_eq!(backend.programmed().unwrap().0.gpc_mhz, 1230);
    }

    #[test]
    fn test_event_filter_and_release() {
        let (arb, _backend) = arbiter();
        let session = arb.init_session().unwrap();
        let ev = arb.install_event_fd(&session, 0).unwrap();
        arb.schedule_alarm(alarm::POWER_ABOVE_THRESHOLD);
        arb.flush().unwrap();
        assert_eq!(arb.event_poll(&ev), 0);

        arb.set_event_filter(&ev, alarm::POWER_ABOVE_THRESHOLD);
        arb.schedule_alarm(alarm::POWER_ABOVE_THRESHOLD);
        arb.flush().unwrap();
        assert_ne!(ev.take_poll_mask(), 0);

        arb.release_event_fd(&ev);
        arb.schedule_alarm(alarm::POWER_ABOVE_THRESHOLD);
        arb.flush().unwrap();
        assert_eq!(ev.poll_mask(), 0);
    }

    #[test]
    fn test_set_target_on_event_handle_rejected() {
        let (arb, _backend) = arbiter();
        let session = arb.init_session().unwrap();
        let ev = arb.install_event_fd(&session, alarm::ALL).unwrap();
        assert!(arb
            .set_session_target_mhz(&ev, ClockDomain::Gpc2clk, 1000)
            .is_err());
    }

    #[test]
    fn test_shutdown_stops_worker() {
        let (arb, _backend) = arbiter();
        assert!(arb.is_running());
        arb.shutdown().unwrap();
        assert!(!arb.is_running());
        arb.shutdown().unwrap();
    }
}
