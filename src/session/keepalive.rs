// SPDX-License-Identifier: AGPL-3.0-or-later

//! Background session-keeper timer (spec §4.4 "Keep-alive"). The first
//! delay follows the documented schedule; later ticks reuse the same
//! formula for lack of a distinct subsequent-interval rule (noted in
//! DESIGN.md).

use std::{sync::Arc, time::Duration};

use tokio::{sync::Mutex, task::JoinHandle};
use tracing::warn;

use crate::{error::C12Error, primitives::flags::CancelFlag};

/// Computes the delay before the next keep-alive probe from
/// `ChannelTrafficTimeout`, per `DoGetKeepSessionAliveFirstDelay`: probe
/// no more often than every 8s when the timeout is large, never more
/// often than every 1s when the timeout is implausibly small, and
/// otherwise stay a safety margin below the timeout.
pub fn next_delay(channel_traffic_timeout: Duration) -> Duration {
    let ms = channel_traffic_timeout.as_millis() as u64;
    let delay_ms = if ms > 10_000 {
        8_000
    } else if ms < 2_000 {
        1_000
    } else if ms < 4_000 {
        ms - 1_000
    } else {
        ms - 2_000
    };
    Duration::from_millis(delay_ms)
}

/// Anything that can send a single keep-alive probe on the wire. A
/// [`crate::session::Session`] wrapped in `Arc<Mutex<_>>` implements this
/// via [`crate::session::SessionKeepAlive`].
pub trait KeepAliveTarget: Send + Sync + 'static {
    fn send_keep_alive(&self) -> impl Future<Output = Result<(), C12Error>> + Send;
}

/// Spawns the keep-alive loop. `service_lock` is the same lock foreground
/// application-layer calls hold while a service is in flight (spec §4.4:
/// "mutually excluded with the application layer via a lock"); `cancel`
/// is checked before every probe so `CancelCommunication` stops the timer
/// promptly.
pub fn spawn<T: KeepAliveTarget>(
    target: Arc<T>,
    channel_traffic_timeout: Duration,
    service_lock: Arc<Mutex<()>>,
    cancel: Arc<CancelFlag>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(next_delay(channel_traffic_timeout)).await;
            if cancel.is_set() {
                return;
            }
            let _guard = service_lock.lock().await;
            if cancel.is_set() {
                return;
            }
            if let Err(e) = target.send_keep_alive().await {
                warn!(error = %e, "keep-alive probe failed");
            }
        }
    })
}
