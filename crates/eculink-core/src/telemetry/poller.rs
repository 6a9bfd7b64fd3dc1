//! Telemetry poller
//!
//! A dedicated loop that keeps live data flowing: every period it submits
//! one tick onto the io worker, but only when the worker queue is empty, so
//! foreground work always wins over polling. A tick pulls the
//! output-channel snapshot, drives the composite logger, drains pending
//! console text and fires the live-docs hook.

use std::sync::atomic::Ordering;
use std::sync::PoisonError;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, trace};

use crate::connection::{ConnectionInner, WeakConnection};
use crate::protocol::commands::{self, RESPONSE_OK};

use super::decode_snapshot;

/// Pause after a pull that found no console text pending
const EMPTY_TEXT_PAUSE: Duration = Duration::from_millis(100);

/// Start the poll loop for `weak`; the loop exits once the connection
/// closes or is dropped
pub(crate) fn spawn(weak: WeakConnection) {
    let spawned = thread::Builder::new()
        .name("ecu poller".into())
        .spawn(move || run(weak));
    if let Err(e) = spawned {
        error!("Failed to start poller thread: {}", e);
    }
}

fn run(weak: WeakConnection) {
    info!("Poller started");
    loop {
        let Some(inner) = weak.upgrade() else { break };
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        let poll_period = inner.config.poll_period;

        if inner.worker.queue_is_empty() {
            let weak_tick = weak.clone();
            inner.worker.try_submit(move || {
                if let Some(inner) = weak_tick.upgrade() {
                    tick(&inner);
                }
            });
        } else {
            // Foreground work is queued; sit this period out entirely
            trace!("Io worker busy, skipping poll tick");
        }

        drop(inner);
        thread::sleep(poll_period);
    }
    info!("Poller stopped");
}

fn tick(inner: &ConnectionInner) {
    if inner.closed.load(Ordering::SeqCst) {
        return;
    }
    if pull_outputs(inner) {
        if let Some(on_data_arrived) = &inner.callbacks.on_data_arrived {
            on_data_arrived();
        }
    }
    // Only the heartbeat is gated on the snapshot; the composite drive
    // loop runs every tick, its fetches keep device-side capture alive
    inner.composite.poll_tick(&inner.engine);
    pull_console_text(inner);
    if let Some(on_live_docs) = &inner.callbacks.on_live_docs {
        on_live_docs();
    }
}

/// Fetch and publish one output-channel snapshot. `false` means no update
/// this cycle; the next tick simply tries again.
fn pull_outputs(inner: &ConnectionInner) -> bool {
    let outputs_size = inner.profile.outputs_size;
    let request = commands::output_channels(outputs_size as u16);
    let Some(response) = inner.engine.execute_command(&request, "outputs", false) else {
        return false;
    };
    if response.len() != outputs_size + 1 || response[0] != RESPONSE_OK {
        debug!(len = response.len(), "Malformed outputs snapshot");
        return false;
    }

    let snapshot = &response[1..];
    *inner
        .latest_outputs
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = Some(snapshot.to_vec());

    for (name, value) in decode_snapshot(&inner.profile.sensors, snapshot) {
        inner.sensors.publish(name, value);
    }
    true
}

fn pull_console_text(inner: &ConnectionInner) {
    let Some(response) = inner
        .engine
        .execute_command(&commands::get_text(), "text pull", true)
    else {
        return;
    };
    if response.is_empty() {
        return;
    }
    if response.len() == 1 {
        // Nothing pending; ease off the wire before the next tick. The
        // bare terminator below still goes out.
        thread::sleep(EMPTY_TEXT_PAUSE);
    }
    let text = String::from_utf8_lossy(&response[1..]);
    if let Some(on_console_text) = &inner.callbacks.on_console_text {
        on_console_text(&format!("{}\r\n", text));
    }
}
