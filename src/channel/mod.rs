// SPDX-License-Identifier: AGPL-3.0-or-later

//! The channel abstraction consumed by the link and application layers
//! (spec §4.1 "Channel (C1)"). One concrete implementation per transport:
//! [`modem::ModemChannel`] (serial/Hayes dial-up) and
//! [`socket::TcpChannel`]/[`socket::UdpChannel`].

pub mod modem;
pub mod socket;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::{
    counters::{MonitorEvent, MonitorSink, TracingMonitor},
    error::C12Error,
    primitives::{flags::CancelFlag, scoped::ScopedOverride},
};

/// Line control state for `SetDtrControl`/`SetRtsControl` (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineControl {
    Enable,
    Disable,
    Handshake,
}

/// Serial framing parameters for `SetParameters` (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialParameters {
    pub baud: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    Two,
}

/// Shared byte-counter/timeout/cancel bookkeeping every [`Channel`]
/// implementation carries (spec §3 "Channel state (C1)").
#[derive(Debug)]
pub struct ChannelState {
    pub connected: AtomicBool,
    pub count_bytes_sent: AtomicU64,
    pub count_bytes_received: AtomicU64,
    pub read_timeout_millis: AtomicU64,
    pub write_timeout_millis: AtomicU64,
    pub intercharacter_timeout_millis: AtomicU64,
    pub cancel: CancelFlag,
    monitor: Box<dyn MonitorSink>,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self::new(Box::new(TracingMonitor))
    }
}

impl ChannelState {
    pub fn new(monitor: Box<dyn MonitorSink>) -> Self {
        Self {
            connected: AtomicBool::new(false),
            count_bytes_sent: AtomicU64::new(0),
            count_bytes_received: AtomicU64::new(0),
            read_timeout_millis: AtomicU64::new(3_000),
            write_timeout_millis: AtomicU64::new(3_000),
            intercharacter_timeout_millis: AtomicU64::new(50),
            cancel: CancelFlag::new(),
            monitor,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn reset_counts(&self) {
        self.count_bytes_sent.store(0, Ordering::Relaxed);
        self.count_bytes_received.store(0, Ordering::Relaxed);
    }

    pub fn record_tx(&self, n: usize) {
        self.count_bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
        self.emit(MonitorEvent::ChannelByteTx { count: n });
    }

    pub fn record_rx(&self, n: usize) {
        self.count_bytes_received.fetch_add(n as u64, Ordering::Relaxed);
        self.emit(MonitorEvent::ChannelByteRx { count: n });
    }

    pub fn emit(&self, event: MonitorEvent) {
        if self.monitor.is_listening() {
            self.monitor.on_message(&event);
        }
    }

    /// Scoped `ReadTimeout` override (spec §4.1 "ReadTimeoutSavior"):
    /// restores the previous value on drop, on every exit path.
    pub fn read_timeout_savior(&self, timeout_millis: u64) -> ScopedOverride<'_> {
        ScopedOverride::new(&self.read_timeout_millis, timeout_millis)
    }

    /// Scoped `IntercharacterTimeout` override used while reading a packet
    /// header (spec §4.2 step 2).
    pub fn intercharacter_timeout_savior(&self, timeout_millis: u64) -> ScopedOverride<'_> {
        ScopedOverride::new(&self.intercharacter_timeout_millis, timeout_millis)
    }
}

/// Transport-independent operations the link and application layers call
/// through (spec §4.1, §6 "Channel interface consumed by the core").
pub trait Channel: Send + Sync {
    fn state(&self) -> &ChannelState;

    fn connect(&self) -> impl Future<Output = Result<(), C12Error>> + Send;
    fn disconnect(&self) -> impl Future<Output = ()> + Send;

    fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Write the whole buffer, counting bytes on success.
    fn write_buffer(&self, bytes: &[u8]) -> impl Future<Output = Result<(), C12Error>> + Send;

    fn write_char(&self, c: u8) -> impl Future<Output = Result<(), C12Error>> + Send {
        async move { self.write_buffer(&[c]).await }
    }

    /// Flush the output buffer; `hint_bytes_in_fifo` upper-bounds bytes
    /// still physically in flight, used to time modem/optical baud
    /// changes (spec §4.1).
    fn flush_output_buffer(
        &self,
        hint_bytes_in_fifo: usize,
    ) -> impl Future<Output = Result<(), C12Error>> + Send;

    /// Read exactly `n` bytes or raise `ChannelReadTimeout`.
    fn read_buffer(&self, n: usize) -> impl Future<Output = Result<Vec<u8>, C12Error>> + Send;

    /// Read up to `max` bytes; returns as soon as any byte arrives when
    /// `allow_partial`, 0 on timeout when `allow_partial` (spec §4.1).
    fn do_read_cancellable(
        &self,
        max: usize,
        timeout_millis: u64,
        allow_partial: bool,
    ) -> impl Future<Output = Result<Vec<u8>, C12Error>> + Send;

    fn clear_input_buffer(&self) -> impl Future<Output = ()> + Send;

    /// Sets the cancel flag; subsequent read/write calls raise
    /// `OperationCancelled`. If `also_disconnect`, closes the transport.
    fn cancel_communication(
        &self,
        also_disconnect: bool,
    ) -> impl Future<Output = ()> + Send {
        async move {
            self.state().cancel.set();
            if also_disconnect {
                self.disconnect().await;
            }
        }
    }

    /// Cancellable wait; checks the cancel flag at coarse intervals
    /// (spec §4.1).
    fn sleep(&self, ms: u64) -> impl Future<Output = Result<(), C12Error>> + Send {
        async move {
            const POLL_MILLIS: u64 = 100;
            let mut remaining = ms;
            loop {
                if self.state().cancel.is_set() {
                    return Err(C12Error::OperationCancelled);
                }
                if remaining == 0 {
                    return Ok(());
                }
                let step = remaining.min(POLL_MILLIS);
                tokio::time::sleep(std::time::Duration::from_millis(step)).await;
                remaining -= step;
            }
        }
    }

    /// Carrier detect; serial specializations only. Defaults to
    /// `Software` (`NotSupportedForThisType`).
    fn get_dcd(&self) -> impl Future<Output = Result<bool, C12Error>> + Send {
        async move {
            Err(C12Error::Software(
                "GetDCD not supported for this channel type".to_string(),
            ))
        }
    }

    fn set_dtr_control(
        &self,
        _control: LineControl,
    ) -> impl Future<Output = Result<(), C12Error>> + Send {
        async move {
            Err(C12Error::Software(
                "SetDtrControl not supported for this channel type".to_string(),
            ))
        }
    }

    fn set_rts_control(
        &self,
        _control: LineControl,
    ) -> impl Future<Output = Result<(), C12Error>> + Send {
        async move {
            Err(C12Error::Software(
                "SetRtsControl not supported for this channel type".to_string(),
            ))
        }
    }

    fn set_baud(&self, _baud: u32) -> impl Future<Output = Result<(), C12Error>> + Send {
        async move {
            Err(C12Error::Software(
                "SetBaud not supported for this channel type".to_string(),
            ))
        }
    }

    fn set_parameters(
        &self,
        _params: SerialParameters,
    ) -> impl Future<Output = Result<(), C12Error>> + Send {
        async move {
            Err(C12Error::Software(
                "SetParameters not supported for this channel type".to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_timeout_savior_restores_previous_value() {
        let state = ChannelState::default();
        state.read_timeout_millis.store(3_000, Ordering::SeqCst);
        {
            let _guard = state.read_timeout_savior(500);
            assert_eq!(state.read_timeout_millis.load(Ordering::SeqCst), 500);
        }
        assert_eq!(state.read_timeout_millis.load(Ordering::SeqCst), 3_000);
    }

    #[test]
    fn record_rx_tx_update_counters() {
        let state = ChannelState::default();
        state.record_tx(10);
        state.record_rx(3);
        assert_eq!(state.count_bytes_sent.load(Ordering::Relaxed), 10);
        assert_eq!(state.count_bytes_received.load(Ordering::Relaxed), 3);
    }
}
