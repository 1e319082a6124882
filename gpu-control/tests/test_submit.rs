//! Integration tests for GPFIFO submission.
//!
//! Every test builds its own `Device` with in-process collaborators:
//! `SimUserd` stands in for the host engine (tests move GP_GET with
//! `consume`), `PowerRefCounter` counts power references and syncpoints are
//! completed by incrementing them from the test, as the GPU would.
//!
//! Submit paths covered:
//! 1. **Untracked**: entries appended, PUT written, nothing else touched
//! 2. **Tracked**: job slot, optional wait, increment, post fence
//! 3. **Deterministic**: preallocated jobs, no per-submit power reference
//! 4. **Failures**: each one leaves ring, job list, priv cmdbuf, sync
//!    thresholds and power references as they were

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use gpu_control::config::DeviceConfig;
use gpu_control::device::{Device, DeviceBuilder, PowerBackend, PowerRefCounter};
use gpu_control::error::GpuControlError;
use gpu_control::fifo::channel::error_notifier;
use gpu_control::fifo::priv_cmdbuf::PrivCmdState;
use gpu_control::fifo::profile::SubmitProfile;
use gpu_control::fifo::sync::SyncBacking;
use gpu_control::fifo::{
    submit_gpfifo_kernel, submit_gpfifo_user, AddressSpace, Channel, ChannelFence,
    ChannelSetupArgs, GpfifoEntry, SimUserd, SubmitFlags, UserBuffer, UserFence, Userd, Vm,
};

// ============================================================================
// Helpers
// ============================================================================

struct Rig {
    device: Arc<Device>,
    userd: Arc<SimUserd>,
    power: Arc<PowerRefCounter>,
    vm: Arc<Vm>,
}

/// Arbiter off, watchdog off: only the flags decide job tracking.
fn config() -> DeviceConfig {
    let mut cfg = DeviceConfig::default();
    cfg.clk_arb.enabled = false;
    cfg.channel.watchdog_enabled = false;
    cfg
}

fn rig(cfg: DeviceConfig) -> Rig {
    let userd = Arc::new(SimUserd::new());
    let power = Arc::new(PowerRefCounter::new());
    let device = DeviceBuilder::new(cfg)
        .userd(Arc::clone(&userd) as Arc<dyn Userd>)
        .power(Arc::clone(&power) as Arc<dyn PowerBackend>)
        .build()
        .unwrap();
    Rig {
        device,
        userd,
        power,
        vm: Arc::new(Vm::new()),
    }
}

fn open(rig: &Rig, entries: u32, inflight: u32, deterministic: bool) -> Arc<Channel> {
    let ch = rig.device.open_channel().unwrap();
    ch.bind_address_space(Arc::clone(&rig.vm) as Arc<dyn AddressSpace>);
    ch.setup_gpfifo(ChannelSetupArgs {
        num_gpfifo_entries: entries,
        num_inflight_jobs: inflight,
        deterministic,
        usermode: false,
    })
    .unwrap();
    ch
}

fn entries(n: u32) -> Vec<GpfifoEntry> {
    (0..n)
        .map(|i| GpfifoEntry::new(0x20_0000 + u64::from(i) * 0x100, 16))
        .collect()
}

/// Everything a failed submit must leave untouched.
#[derive(Debug, PartialEq)]
struct Snapshot {
    gpfifo: Option<(u32, u32)>,
    hw_put: u32,
    jobs: usize,
    reserved: u32,
    priv_cmdbuf: Option<PrivCmdState>,
    sync_max: Option<u32>,
    power_refs: i64,
}

fn snapshot(rig: &Rig, ch: &Channel) -> Snapshot {
    Snapshot {
        gpfifo: ch.gpfifo_state(),
        hw_put: rig.userd.hw_put(ch.chid()),
        jobs: ch.num_jobs(),
        reserved: ch.job_slots_reserved(),
        priv_cmdbuf: ch.priv_cmdbuf_state(),
        sync_max: ch.sync().map(|s| s.max()),
        power_refs: rig.power.refs(),
    }
}

/// Complete every job on `ch` and let the channel worker reclaim them.
fn complete_all(rig: &Rig, ch: &Channel) {
    if let Some(sync) = ch.sync() {
        sync.set_min_eq_max();
    }
    rig.device.flush_channel_worker().unwrap();
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_fence_get_on_empty_ring_advances_put_by_entries_plus_incr() {
    let rig = rig(config());
    let ch = open(&rig, 16, 4, false);

    let fence = submit_gpfifo_kernel(&ch, &entries(10), SubmitFlags::FENCE_GET, None)
        .unwrap()
        .expect("FENCE_GET returns a post fence");

    assert_eq!(ch.gpfifo_state(), Some((11, 0)));
    assert_eq!(rig.userd.hw_put(ch.chid()), 11);
    assert!(!fence.is_expired());
    let (id, thresh) = fence.syncpoint().unwrap();
    assert_eq!(Some(id), ch.sync().unwrap().syncpt_id());
    assert_eq!(thresh, ch.sync().unwrap().max());
    assert_eq!(ch.num_jobs(), 1);
    assert_eq!(rig.power.refs(), 1);

    rig.userd.consume_all(ch.chid());
    rig.device.syncpoints().unwrap().increment(id);
    assert!(fence.is_expired());
    rig.device.flush_channel_worker().unwrap();
    assert_eq!(ch.num_jobs(), 0);
    assert_eq!(rig.power.refs(), 0);
}

#[test]
fn test_one_slot_short_would_block_after_single_get_read() {
    let rig = rig(config());
    let ch = open(&rig, 16, 4, false);
    let chid = ch.chid();

    submit_gpfifo_kernel(&ch, &entries(9), SubmitFlags::SKIP_BUFFER_REFCOUNTING, None).unwrap();
    assert_eq!(ch.gpfifo_free_count(), 6);

    // 5 entries + 2 reserved slots is one more than the 6 free.
    let before = snapshot(&rig, &ch);
    let reads = rig.userd.get_reads(chid);
    let writes = rig.userd.put_writes(chid);
    let err = submit_gpfifo_kernel(&ch, &entries(5), SubmitFlags::SKIP_BUFFER_REFCOUNTING, None)
        .unwrap_err();
    assert!(matches!(err, GpuControlError::WouldBlock(_)));
    assert!(err.is_retryable());
    assert_eq!(rig.userd.get_reads(chid), reads + 1);
    assert_eq!(rig.userd.put_writes(chid), writes);
    assert_eq!(snapshot(&rig, &ch), before);

    // Once the GPU fetches, the same submit fits.
    rig.userd.consume_all(chid);
    submit_gpfifo_kernel(&ch, &entries(5), SubmitFlags::SKIP_BUFFER_REFCOUNTING, None).unwrap();
    assert_eq!(ch.gpfifo_state(), Some((14, 9)));
}

#[test]
fn test_submit_that_never_fits_is_out_of_memory() {
    let rig = rig(config());
    let ch = open(&rig, 16, 4, false);
    let reads = rig.userd.get_reads(ch.chid());

    let err = submit_gpfifo_kernel(&ch, &entries(14), SubmitFlags::SKIP_BUFFER_REFCOUNTING, None)
        .unwrap_err();
    assert!(matches!(err, GpuControlError::OutOfMemory(_)));
    assert_eq!(rig.userd.get_reads(ch.chid()), reads);

    // 13 + 2 is exactly the usable capacity.
    submit_gpfifo_kernel(&ch, &entries(13), SubmitFlags::SKIP_BUFFER_REFCOUNTING, None).unwrap();
    assert_eq!(ch.gpfifo_state(), Some((13, 0)));
}

#[test]
fn test_untracked_submit_takes_no_power_ref_and_no_job() {
    let rig = rig(config());
    let ch = open(&rig, 32, 4, false);
    let max = ch.sync().unwrap().max();

    let fence =
        submit_gpfifo_kernel(&ch, &entries(3), SubmitFlags::SKIP_BUFFER_REFCOUNTING, None).unwrap();
    assert!(fence.is_none());
    assert_eq!(rig.power.busy_calls(), 0);
    assert_eq!(ch.num_jobs(), 0);
    assert_eq!(ch.sync().unwrap().max(), max);
    assert_eq!(ch.priv_cmdbuf_state().unwrap().entries, 0);
}

#[test]
fn test_railgating_device_tracks_every_submit() {
    let mut cfg = config();
    cfg.can_railgate = true;
    let rig = rig(cfg);
    let ch = open(&rig, 32, 4, false);

    let fence =
        submit_gpfifo_kernel(&ch, &entries(3), SubmitFlags::SKIP_BUFFER_REFCOUNTING, None).unwrap();
    // Tracked, but no fence without FENCE_GET.
    assert!(fence.is_none());
    assert_eq!(ch.num_jobs(), 1);
    assert_eq!(ch.gpfifo_state(), Some((4, 0)));
    assert_eq!(rig.power.refs(), 1);

    complete_all(&rig, &ch);
    assert_eq!(rig.power.refs(), 0);
}

// ============================================================================
// Pre-fences
// ============================================================================

#[test]
fn test_raw_syncpoint_wait_inserted_only_while_pending() {
    let rig = rig(config());
    let ch = open(&rig, 32, 4, false);
    let syncpoints = rig.device.syncpoints().unwrap();
    let other = syncpoints.alloc().unwrap();
    let thresh = syncpoints.incr_max(other, 1).unwrap();
    let pre = ChannelFence {
        id: other,
        value: thresh,
    };

    let mut profile = SubmitProfile::new();
    let buf = UserBuffer::new(entries(3));
    let post = submit_gpfifo_user(
        &ch,
        &buf,
        SubmitFlags::FENCE_WAIT | SubmitFlags::FENCE_GET,
        Some(pre),
        Some(&mut profile),
    )
    .unwrap();
    assert!(profile.wait_cmd);
    // wait + 3 entries + incr
    assert_eq!(ch.gpfifo_state(), Some((5, 0)));
    let own = ch.sync().unwrap().syncpt_id().unwrap();
    assert_eq!(
        post,
        Some(UserFence::Syncpoint {
            id: own,
            value: ch.sync().unwrap().max()
        })
    );

    syncpoints.increment(other);
    let mut profile = SubmitProfile::new();
    submit_gpfifo_user(
        &ch,
        &buf,
        SubmitFlags::FENCE_WAIT | SubmitFlags::FENCE_GET,
        Some(pre),
        Some(&mut profile),
    )
    .unwrap();
    assert!(!profile.wait_cmd);
    assert_eq!(ch.gpfifo_state(), Some((9, 0)));
}

#[test]
fn test_sync_fd_post_fence_feeds_another_channel() {
    let rig = rig(config());
    let producer = open(&rig, 32, 4, false);
    let consumer = open(&rig, 32, 4, false);
    let buf = UserBuffer::new(entries(2));

    let post = submit_gpfifo_user(
        &producer,
        &buf,
        SubmitFlags::FENCE_GET | SubmitFlags::SYNC_FENCE,
        None,
        None,
    )
    .unwrap();
    let Some(UserFence::SyncFd(fd)) = post else {
        panic!("expected a sync-fd, got {:?}", post);
    };
    let fds = rig.device.sync_fds();
    assert!(!fds.is_signaled(fd).unwrap());

    let mut profile = SubmitProfile::new();
    submit_gpfifo_user(
        &consumer,
        &buf,
        SubmitFlags::FENCE_WAIT | SubmitFlags::SYNC_FENCE,
        Some(ChannelFence {
            id: fd as u32,
            value: 0,
        }),
        Some(&mut profile),
    )
    .unwrap();
    assert!(profile.wait_cmd);

    complete_all(&rig, &producer);
    assert!(fds.is_signaled(fd).unwrap());
    assert!(fds.close(fd));
}

#[test]
fn test_bad_sync_fd_rolls_back() {
    let rig = rig(config());
    let ch = open(&rig, 32, 4, false);
    let before = snapshot(&rig, &ch);

    let err = submit_gpfifo_kernel(
        &ch,
        &entries(2),
        SubmitFlags::FENCE_WAIT | SubmitFlags::SYNC_FENCE | SubmitFlags::FENCE_GET,
        Some(ChannelFence { id: 999, value: 0 }),
    )
    .unwrap_err();
    assert!(matches!(err, GpuControlError::InvalidArgument(_)));
    assert_eq!(snapshot(&rig, &ch), before);
}

#[test]
fn test_invalid_wait_syncpoint_rolls_back() {
    let rig = rig(config());
    let ch = open(&rig, 32, 4, false);
    let before = snapshot(&rig, &ch);

    let err = submit_gpfifo_kernel(
        &ch,
        &entries(2),
        SubmitFlags::FENCE_WAIT,
        Some(ChannelFence { id: 0, value: 1 }),
    )
    .unwrap_err();
    assert!(matches!(err, GpuControlError::InvalidArgument(_)));
    assert_eq!(snapshot(&rig, &ch), before);
}

// ============================================================================
// Rollback on injected failures
// ============================================================================

#[test]
fn test_user_copy_fault_rolls_back() {
    let rig = rig(config());
    let ch = open(&rig, 32, 4, false);
    submit_gpfifo_kernel(&ch, &entries(2), SubmitFlags::FENCE_GET, None).unwrap();
    let before = snapshot(&rig, &ch);

    let mut buf = UserBuffer::new(entries(6));
    buf.fault_at = Some(4);
    let err = submit_gpfifo_user(&ch, &buf, SubmitFlags::FENCE_GET, None, None).unwrap_err();
    assert!(matches!(err, GpuControlError::InvalidArgument(_)));
    assert_eq!(snapshot(&rig, &ch), before);
}

#[test]
fn test_buffer_ref_failure_rolls_back() {
    let rig = rig(config());
    let ch = open(&rig, 32, 4, false);
    let before = snapshot(&rig, &ch);

    rig.vm.set_fail_get_buffers(true);
    let err = submit_gpfifo_kernel(&ch, &entries(4), SubmitFlags::FENCE_GET, None).unwrap_err();
    assert!(matches!(err, GpuControlError::OutOfMemory(_)));
    assert_eq!(snapshot(&rig, &ch), before);

    rig.vm.set_fail_get_buffers(false);
    submit_gpfifo_kernel(&ch, &entries(4), SubmitFlags::FENCE_GET, None).unwrap();
    assert_eq!(ch.gpfifo_state(), Some((5, 0)));
}

#[test]
fn test_power_on_failure_leaves_channel_untouched() {
    let rig = rig(config());
    let ch = open(&rig, 32, 4, false);
    let before = snapshot(&rig, &ch);

    rig.power.set_fail_busy(true);
    let err = submit_gpfifo_kernel(&ch, &entries(1), SubmitFlags::FENCE_GET, None).unwrap_err();
    assert!(matches!(err, GpuControlError::Backend(_)));
    assert_eq!(snapshot(&rig, &ch), before);
}

#[test]
fn test_job_ring_full_would_block() {
    let rig = rig(config());
    let ch = open(&rig, 64, 2, false);
    for _ in 0..2 {
        submit_gpfifo_kernel(&ch, &entries(1), SubmitFlags::FENCE_GET, None).unwrap();
    }
    let before = snapshot(&rig, &ch);

    let err = submit_gpfifo_kernel(&ch, &entries(1), SubmitFlags::FENCE_GET, None).unwrap_err();
    assert!(matches!(err, GpuControlError::WouldBlock(_)));
    assert_eq!(snapshot(&rig, &ch), before);

    complete_all(&rig, &ch);
    assert_eq!(ch.jobs_completed(), 2);
    submit_gpfifo_kernel(&ch, &entries(1), SubmitFlags::FENCE_GET, None).unwrap();
}

#[test]
fn test_dynamic_sync_exhaustion_rolls_back() {
    let mut cfg = config();
    // One usable syncpoint; id 0 is reserved.
    cfg.num_syncpoints = 2;
    cfg.aggressive_sync_destroy_thresh = 1;
    let rig = rig(cfg);
    let a = open(&rig, 32, 4, false);
    let b = open(&rig, 32, 4, false);
    assert!(rig.device.aggressive_sync_destroy());
    assert!(a.sync().is_none());

    submit_gpfifo_kernel(&a, &entries(1), SubmitFlags::FENCE_GET, None).unwrap();
    assert_eq!(a.sync().unwrap().refcount(), 1);

    let before = snapshot(&rig, &b);
    let err = submit_gpfifo_kernel(&b, &entries(1), SubmitFlags::FENCE_GET, None).unwrap_err();
    assert!(matches!(err, GpuControlError::ResourceExhausted(_)));
    assert_eq!(snapshot(&rig, &b), before);

    // The idle sync is destroyed once its last job is reclaimed.
    complete_all(&rig, &a);
    assert!(a.sync().is_none());
    submit_gpfifo_kernel(&b, &entries(1), SubmitFlags::FENCE_GET, None).unwrap();
    assert_eq!(b.num_jobs(), 1);
}

// ============================================================================
// Buffers and semaphores
// ============================================================================

#[test]
fn test_job_pins_mapped_buffers_until_reclaimed() {
    let rig = rig(config());
    let ch = open(&rig, 32, 4, false);
    let buf = rig.vm.map(0x4000).unwrap();
    assert_eq!(Arc::strong_count(&buf), 2);

    submit_gpfifo_kernel(&ch, &entries(1), SubmitFlags::FENCE_GET, None).unwrap();
    assert_eq!(Arc::strong_count(&buf), 3);

    // Unmapping does not free what the job still holds.
    assert!(rig.vm.unmap(buf.gva));
    assert_eq!(Arc::strong_count(&buf), 2);

    complete_all(&rig, &ch);
    assert_eq!(Arc::strong_count(&buf), 1);
}

#[test]
fn test_semaphore_tracking_without_syncpoints() {
    let mut cfg = config();
    cfg.has_syncpoints = false;
    let rig = rig(cfg);
    let ch = open(&rig, 32, 4, false);
    let sync = ch.sync().unwrap();
    assert!(!sync.is_syncpoint());

    let fence = submit_gpfifo_kernel(&ch, &entries(2), SubmitFlags::FENCE_GET, None)
        .unwrap()
        .unwrap();
    assert!(fence.syncpoint().is_none());
    // Semaphores have no user-visible raw form.
    let buf = UserBuffer::new(entries(2));
    assert_eq!(
        submit_gpfifo_user(&ch, &buf, SubmitFlags::FENCE_GET, None, None).unwrap(),
        None
    );
    assert_eq!(ch.num_jobs(), 2);

    let SyncBacking::Semaphore(sema) = sync.backing() else {
        panic!("expected semaphore backing");
    };
    sema.release();
    assert!(fence.is_expired());
    sema.release();
    rig.device.flush_channel_worker().unwrap();
    assert_eq!(ch.num_jobs(), 0);
    assert_eq!(ch.jobs_completed(), 2);
}

// ============================================================================
// Deterministic channels
// ============================================================================

const DET_FLAGS: SubmitFlags =
    SubmitFlags::from_bits(SubmitFlags::FENCE_GET.bits() | SubmitFlags::SKIP_BUFFER_REFCOUNTING.bits());

#[test]
fn test_deterministic_rejections() {
    let rig = rig(config());
    let ch = open(&rig, 32, 4, true);
    assert_eq!(rig.power.refs(), 1);
    let before = snapshot(&rig, &ch);

    let rejected = [
        SubmitFlags::FENCE_GET,
        DET_FLAGS | SubmitFlags::SYNC_FENCE,
    ];
    for flags in rejected {
        let err = submit_gpfifo_kernel(&ch, &entries(1), flags, None).unwrap_err();
        assert!(matches!(err, GpuControlError::InvalidArgument(_)), "{:?}", flags);
        assert_eq!(snapshot(&rig, &ch), before);
    }

    ch.watchdog().enable();
    assert!(submit_gpfifo_kernel(&ch, &entries(1), DET_FLAGS, None).is_err());
    ch.watchdog().disable();
    assert_eq!(snapshot(&rig, &ch), before);
}

#[test]
fn test_deterministic_untracked_submits_follow_same_rules() {
    let rig = rig(config());
    let ch = open(&rig, 32, 4, true);
    let before = snapshot(&rig, &ch);
    let reads = rig.userd.get_reads(ch.chid());

    // No fence flags: untracked, but buffer refcounting is still on.
    let err = submit_gpfifo_kernel(&ch, &entries(1), SubmitFlags::empty(), None).unwrap_err();
    assert!(matches!(err, GpuControlError::InvalidArgument(_)));
    assert_eq!(snapshot(&rig, &ch), before);

    ch.watchdog().enable();
    let err = submit_gpfifo_kernel(&ch, &entries(1), SubmitFlags::SKIP_BUFFER_REFCOUNTING, None)
        .unwrap_err();
    assert!(matches!(err, GpuControlError::InvalidArgument(_)));
    assert_eq!(snapshot(&rig, &ch), before);
    assert_eq!(rig.userd.get_reads(ch.chid()), reads);

    ch.watchdog().disable();
    submit_gpfifo_kernel(&ch, &entries(1), SubmitFlags::SKIP_BUFFER_REFCOUNTING, None).unwrap();
    assert_eq!(ch.gpfifo_state(), Some((1, 0)));
    assert_eq!(ch.num_jobs(), 0);
}

#[test]
fn test_deterministic_needs_preallocated_jobs() {
    let rig = rig(config());
    let ch = open(&rig, 32, 0, true);
    let err = submit_gpfifo_kernel(&ch, &entries(1), DET_FLAGS, None).unwrap_err();
    assert!(matches!(err, GpuControlError::InvalidArgument(_)));
    // Untracked submits are still fine.
    submit_gpfifo_kernel(&ch, &entries(1), SubmitFlags::SKIP_BUFFER_REFCOUNTING, None).unwrap();
}

#[test]
fn test_deterministic_cleans_one_job_per_submit() {
    let rig = rig(config());
    let ch = open(&rig, 32, 4, true);

    let fence = submit_gpfifo_kernel(&ch, &entries(1), DET_FLAGS, None)
        .unwrap()
        .unwrap();
    // The lifetime reference covers the job.
    assert_eq!(rig.power.refs(), 1);
    assert_eq!(rig.power.busy_calls(), 1);

    let (id, _) = fence.syncpoint().unwrap();
    rig.device.syncpoints().unwrap().increment(id);
    rig.device.flush_channel_worker().unwrap();
    // No completion callback: the job waits for the next submit.
    assert_eq!(ch.num_jobs(), 1);

    submit_gpfifo_kernel(&ch, &entries(1), DET_FLAGS, None).unwrap();
    assert_eq!(ch.jobs_completed(), 1);
    assert_eq!(ch.num_jobs(), 1);
}

#[test]
fn test_railgate_allowed_deterministic_channel_cannot_submit() {
    let rig = rig(config());
    let ch = open(&rig, 32, 4, true);
    rig.device.set_deterministic_railgate_allowed(&ch, true).unwrap();

    let err = submit_gpfifo_kernel(&ch, &entries(1), SubmitFlags::SKIP_BUFFER_REFCOUNTING, None)
        .unwrap_err();
    assert!(matches!(err, GpuControlError::InvalidArgument(_)));

    rig.device.set_deterministic_railgate_allowed(&ch, false).unwrap();
    submit_gpfifo_kernel(&ch, &entries(1), SubmitFlags::SKIP_BUFFER_REFCOUNTING, None).unwrap();
}

#[test]
fn test_deterministic_idle_holds_off_submits() {
    let rig = rig(config());
    let ch = open(&rig, 32, 4, true);

    let idle = rig.device.deterministic_idle();
    assert_eq!(rig.power.refs(), 0);

    let (tx, rx) = mpsc::channel();
    let submitter = Arc::clone(&ch);
    let handle = thread::spawn(move || {
        let result = submit_gpfifo_kernel(&submitter, &entries(1), DET_FLAGS, None);
        tx.send(result.is_ok()).unwrap();
    });
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

    idle.unidle();
    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    handle.join().unwrap();
    assert_eq!(rig.power.refs(), 1);
}

// ============================================================================
// Channel errors and teardown
// ============================================================================

#[test]
fn test_abort_expires_fences_and_refuses_work() {
    let rig = rig(config());
    let ch = open(&rig, 32, 4, false);
    let fence = submit_gpfifo_kernel(&ch, &entries(2), SubmitFlags::FENCE_GET, None)
        .unwrap()
        .unwrap();
    assert!(!fence.is_expired());

    ch.abort(false);
    assert!(fence.is_expired());
    rig.device.flush_channel_worker().unwrap();
    assert_eq!(ch.num_jobs(), 0);
    assert_eq!(rig.power.refs(), 0);
    assert_eq!(ch.error_notifier(), error_notifier::RESETCHANNEL_VERIF_ERROR);

    let err = submit_gpfifo_kernel(&ch, &entries(1), SubmitFlags::FENCE_GET, None).unwrap_err();
    assert_eq!(err, GpuControlError::Unserviceable { chid: ch.chid() });
    assert!(err.is_channel_dead());
}

#[test]
fn test_watchdog_expiry_aborts_stalled_channel() {
    let mut cfg = config();
    cfg.channel.watchdog_enabled = true;
    cfg.channel.watchdog_timeout_ms = 20;
    let rig = rig(cfg);
    let stalled = open(&rig, 32, 4, false);
    let moving = open(&rig, 32, 4, false);

    for ch in [&stalled, &moving] {
        submit_gpfifo_kernel(ch, &entries(2), SubmitFlags::FENCE_GET, None).unwrap();
        assert!(ch.watchdog().is_running());
    }
    thread::sleep(Duration::from_millis(60));
    rig.userd.consume(moving.chid(), 1);

    assert_eq!(rig.device.check_watchdogs(), vec![stalled.chid()]);
    assert_eq!(stalled.error_notifier(), error_notifier::FIFO_ERROR_IDLE_TIMEOUT);
    assert!(stalled.is_unserviceable());
    assert_eq!(stalled.num_jobs(), 0);
    assert!(!moving.is_unserviceable());
    assert_eq!(moving.num_jobs(), 1);
}

#[test]
fn test_close_releases_outstanding_jobs() {
    let rig = rig(config());
    let ch = open(&rig, 32, 4, false);
    let fence = submit_gpfifo_kernel(&ch, &entries(2), SubmitFlags::FENCE_GET, None)
        .unwrap()
        .unwrap();
    assert_eq!(rig.device.num_channels(), 1);

    ch.close();
    assert!(fence.is_expired());
    rig.device.flush_channel_worker().unwrap();
    assert_eq!(rig.power.refs(), 0);
    assert_eq!(rig.device.num_channels(), 0);
    let err = submit_gpfifo_kernel(&ch, &entries(1), SubmitFlags::FENCE_GET, None).unwrap_err();
    assert!(matches!(err, GpuControlError::OutOfMemory(_)));
}

#[test]
fn test_usermode_channel_refuses_kernel_submits() {
    let rig = rig(config());
    let ch = rig.device.open_channel().unwrap();
    ch.bind_address_space(Arc::clone(&rig.vm) as Arc<dyn AddressSpace>);
    ch.setup_gpfifo(ChannelSetupArgs {
        num_gpfifo_entries: 32,
        num_inflight_jobs: 4,
        deterministic: false,
        usermode: true,
    })
    .unwrap();
    let err = submit_gpfifo_kernel(&ch, &entries(1), SubmitFlags::empty(), None).unwrap_err();
    assert!(matches!(err, GpuControlError::InvalidArgument(_)));
}

#[test]
fn test_submit_without_address_space_or_ring() {
    let rig = rig(config());
    let ch = rig.device.open_channel().unwrap();
    let err = submit_gpfifo_kernel(&ch, &entries(1), SubmitFlags::empty(), None).unwrap_err();
    assert!(matches!(err, GpuControlError::OutOfMemory(_)));
}

#[test]
fn test_dying_device_refuses_submits() {
    let rig = rig(config());
    let ch = open(&rig, 32, 4, false);
    rig.device.shutdown().unwrap();
    let err = submit_gpfifo_kernel(&ch, &entries(1), SubmitFlags::empty(), None).unwrap_err();
    assert!(matches!(err, GpuControlError::NoDevice(_)));
}
