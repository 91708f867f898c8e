// SPDX-License-Identifier: AGPL-3.0-or-later

//! Monitor event vocabulary and sinks (spec §4.6).
//!
//! Monitor writes are fire-and-forget (spec §5: "must not block the
//! protocol thread"); [`TracingMonitor`] just emits a `tracing` event and
//! returns, leaving any buffering/rotation to whatever layer the caller
//! installed on the global subscriber (see `cfg::logger`).

use tracing::{debug, warn};

/// Opaque-to-the-core event kinds a monitor sink may interpret (spec §4.6).
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    ChannelAttach,
    ChannelConnect,
    ChannelDisconnect,
    ChannelByteRx { count: usize },
    ChannelByteTx { count: usize },
    ProtocolLinkLayerFail { detail: String },
    ProtocolLinkLayerInformation { detail: String },
    ProtocolApplicationLayerFail { detail: String },
    ProtocolApplicationLayerInformation { detail: String },
}

/// A monitor sink (spec §6 "Monitor interface"). Implementors decide
/// whether/where to persist events; `is_listening` lets a hot path skip
/// formatting work when nothing is attached.
pub trait MonitorSink: Send + Sync {
    fn on_message(&self, event: &MonitorEvent);

    fn is_listening(&self) -> bool {
        true
    }
}

/// Default sink: routes every event through `tracing`. Failures log at
/// `warn`, informational/byte-counter events at `debug`.
#[derive(Debug, Default)]
pub struct TracingMonitor;

impl MonitorSink for TracingMonitor {
    fn on_message(&self, event: &MonitorEvent) {
        match event {
            MonitorEvent::ChannelAttach => debug!(event = "channel_attach"),
            MonitorEvent::ChannelConnect => debug!(event = "channel_connect"),
            MonitorEvent::ChannelDisconnect => debug!(event = "channel_disconnect"),
            MonitorEvent::ChannelByteRx { count } => {
                debug!(event = "channel_byte_rx", count);
            },
            MonitorEvent::ChannelByteTx { count } => {
                debug!(event = "channel_byte_tx", count);
            },
            MonitorEvent::ProtocolLinkLayerFail { detail } => {
                warn!(event = "link_layer_fail", detail);
            },
            MonitorEvent::ProtocolLinkLayerInformation { detail } => {
                debug!(event = "link_layer_information", detail);
            },
            MonitorEvent::ProtocolApplicationLayerFail { detail } => {
                warn!(event = "application_layer_fail", detail);
            },
            MonitorEvent::ProtocolApplicationLayerInformation { detail } => {
                debug!(event = "application_layer_information", detail);
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracing_monitor_is_always_listening() {
        assert!(TracingMonitor.is_listening());
    }

    #[test]
    fn tracing_monitor_accepts_every_event_variant() {
        let sink = TracingMonitor;
        sink.on_message(&MonitorEvent::ChannelAttach);
        sink.on_message(&MonitorEvent::ChannelByteRx { count: 4 });
        sink.on_message(&MonitorEvent::ProtocolLinkLayerFail {
            detail: "crc".to_string(),
        });
    }
}
