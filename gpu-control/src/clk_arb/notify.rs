//! Per-client notify protocol.
//!
//! [`notify`] moves global alarm records into one client's queue and works
//! out what that client should be woken for. It takes no lock: the global
//! queue is append-only with a monotonic tail, and the client's read
//! position (`arb_queue_head`) is advanced with a compare-exchange, so the
//! worker thread and a client's own poll can run it at the same time
//! without copying a record twice.

use std::sync::atomic::Ordering;

use super::notification::NotificationQueue;
use super::session::ClkDev;
use super::alarm;
use super::types::{poll, ArbTarget};

/// Deliver pending global alarms to `dev`.
///
/// * `global` is the arbiter-wide notification queue.
/// * `session_target` is the target of the session owning `dev`, if the
///   session still exists.
/// * `actual` is what the arbiter last programmed.
/// * `current_alarm` is the global alarm mask.
///
/// Returns the alarms newly reported to this client.
pub fn notify(
    global: &NotificationQueue,
    dev: &ClkDev,
    session_target: Option<ArbTarget>,
    actual: &ArbTarget,
    current_alarm: u32,
) -> u32 {
    let enabled_mask = dev.enabled_mask();
    let mut queue_alarm_mask = 0;
    let mut poll_mask = 0;

    // Claim (head, tail] and copy it; repeat while the global tail moves.
    let mut head = dev.arb_queue_head.load(Ordering::Acquire);
    loop {
        let tail = global.tail();
        if head == tail {
            break;
        }
        match dev
            .arb_queue_head
            .compare_exchange(head, tail, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                for record in global.drain_range(head, tail, enabled_mask) {
                    dev.queue.push_record(record);
                    queue_alarm_mask |= record.alarm_mask;
                }
                head = tail;
            }
            Err(claimed) => head = claimed,
        }
    }

    if enabled_mask & alarm::LOCAL_TARGET_VF_NOT_POSSIBLE != 0 {
        if let Some(target) = session_target {
            if actual.gpc2clk_mhz < target.gpc2clk_mhz || actual.mclk_mhz < target.mclk_mhz {
                poll_mask |= poll::POLLIN | poll::POLLPRI;
                dev.queue.push(alarm::LOCAL_TARGET_VF_NOT_POSSIBLE);
            }
        }
    }

    if queue_alarm_mask & alarm::VF_UPDATE != 0 {
        poll_mask |= poll::POLLIN | poll::POLLRDNORM;
    }

    let reported = dev.alarms_reported.load(Ordering::Acquire);
    let new_alarms_reported =
        queue_alarm_mask | (current_alarm & !reported & queue_alarm_mask);

    if new_alarms_reported & !alarm::LOCAL_MASK != 0 {
        if new_alarms_reported & alarm::GPU_LOST != 0 {
            poll_mask |= poll::POLLHUP;
        }
        poll_mask |= poll::POLLIN | poll::POLLPRI;
        // GPU_LOST is never remembered, so it is reported every time.
        dev.alarms_reported.store(
            new_alarms_reported & !alarm::LOCAL_MASK & !alarm::GPU_LOST,
            Ordering::Release,
        );
    }

    if poll_mask != 0 {
        dev.post_event(poll_mask);
    }

    new_alarms_reported
}
