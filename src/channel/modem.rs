// SPDX-License-Identifier: AGPL-3.0-or-later

//! Serial/modem channel (spec §4.1 "Serial/Modem (C2)"): Hayes AT dial and
//! auto-answer state machine over a real async serial port.
//!
//! Response vocabulary and priority order are taken verbatim from
//! `ChannelModem.cpp`'s `s_standardResponses` table: matches are tried in
//! table order, so `CONNECT` beats `RING` only because it is listed first,
//! not because it is matched more specifically.

use std::time::Duration;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::Mutex,
};
use tokio_serial::{ClearBuffer, SerialPort, SerialStream};

use crate::{
    channel::{Channel, ChannelState, LineControl},
    error::C12Error,
};

/// Hayes response codes, declared in the table's priority order (spec §4.1:
/// "priorities in that order (`OK` and `RING` lowest)").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModemResponse {
    Connect,
    NoCarrier,
    Error,
    Timeout,
    NoDialTone,
    Busy,
    NoAnswer,
    Ok,
    Ring,
}

const RESPONSE_TABLE: &[(&str, ModemResponse)] = &[
    ("CONNECT", ModemResponse::Connect),
    ("NO CARRIER", ModemResponse::NoCarrier),
    ("ERROR", ModemResponse::Error),
    ("TIMEOUT", ModemResponse::Timeout),
    ("NO DIAL", ModemResponse::NoDialTone),
    ("BUSY", ModemResponse::Busy),
    ("NO ANSWER", ModemResponse::NoAnswer),
    ("OK", ModemResponse::Ok),
    ("RING", ModemResponse::Ring),
];

/// Classifies a line read from the modem against the Hayes table, trying
/// entries in table order and returning the first substring match.
fn classify(line: &str) -> Option<ModemResponse> {
    RESPONSE_TABLE
        .iter()
        .find(|(needle, _)| line.contains(needle))
        .map(|(_, code)| *code)
}

/// Parses the baud digits that may follow `CONNECT` (e.g. `CONNECT 33600`).
fn parse_connect_baud(line: &str) -> Option<u32> {
    line.split_whitespace().nth(1).and_then(|s| s.parse().ok())
}

#[derive(Debug, Clone)]
pub struct ModemConfig {
    pub init_string: String,
    pub dial_string: String,
    pub phone_number: String,
    pub auto_answer_string: String,
    pub command_timeout: Duration,
    pub auto_answer_timeout: Duration,
    pub match_connect_baud: bool,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            init_string: "ATZE0Q0V1&C1&D2".to_string(),
            dial_string: "ATD".to_string(),
            phone_number: String::new(),
            auto_answer_string: "ATS0=1".to_string(),
            command_timeout: Duration::from_secs(10),
            auto_answer_timeout: Duration::from_secs(60),
            match_connect_baud: false,
        }
    }
}

pub struct ModemChannel {
    state: ChannelState,
    port: Mutex<SerialStream>,
    cfg: ModemConfig,
}

impl ModemChannel {
    pub fn new(port: SerialStream, cfg: ModemConfig) -> Self {
        Self {
            state: ChannelState::default(),
            port: Mutex::new(port),
            cfg,
        }
    }

    async fn write_line(&self, line: &str) -> Result<(), C12Error> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\r');
        self.raw_write(&buf).await
    }

    async fn raw_write(&self, bytes: &[u8]) -> Result<(), C12Error> {
        let mut guard = self.port.lock().await;
        guard
            .write_all(bytes)
            .await
            .map_err(|e| C12Error::ModemError(e.to_string()))?;
        drop(guard);
        self.state.record_tx(bytes.len());
        Ok(())
    }

    /// Reads one CR-terminated line, classifying it against the Hayes
    /// table, bounded by `timeout`.
    async fn read_response_line(&self, timeout: Duration) -> Result<ModemResponse, C12Error> {
        let deadline = crate::primitives::timer::Deadline::after(timeout);
        let mut line = String::new();
        loop {
            if self.state.cancel.is_set() {
                return Err(C12Error::OperationCancelled);
            }
            if deadline.has_elapsed() {
                return Err(C12Error::ModemError("command timeout".to_string()));
            }
            let mut byte = [0u8; 1];
            {
                let mut guard = self.port.lock().await;
                match tokio::time::timeout(deadline.remaining(), guard.read_exact(&mut byte))
                    .await
                {
                    Ok(Ok(_)) => {},
                    Ok(Err(e)) => return Err(C12Error::ModemError(e.to_string())),
                    Err(_) => return Err(C12Error::ModemError("command timeout".to_string())),
                }
            }
            self.state.record_rx(1);
            if byte[0] == b'\n' || byte[0] == b'\r' {
                if line.is_empty() {
                    continue;
                }
                if let Some(code) = classify(&line) {
                    if code == ModemResponse::Connect && self.cfg.match_connect_baud {
                        if let Some(baud) = parse_connect_baud(&line) {
                            let _ = self.set_baud(baud).await;
                        }
                    }
                    return Ok(code);
                }
                line.clear();
                continue;
            }
            line.push(byte[0] as char);
        }
    }

    /// Outgoing dial sequence (spec §4.1 "Serial/Modem (C2)").
    pub async fn dial(&self) -> Result<(), C12Error> {
        if self.cfg.phone_number.is_empty() {
            return Err(C12Error::NoPhoneNumberSpecified);
        }
        self.hook_on().await?;
        self.write_line(&self.cfg.init_string).await?;
        let ok = self.read_response_line(self.cfg.command_timeout).await?;
        if ok != ModemResponse::Ok {
            return Err(C12Error::ExpectedXGotX {
                expected: "OK".to_string(),
                got: format!("{ok:?}"),
            });
        }
        self.write_line(&format!("{}{}", self.cfg.dial_string, self.cfg.phone_number)).await?;
        let response = self.read_response_line(self.cfg.command_timeout).await?;
        if response != ModemResponse::Connect {
            return Err(C12Error::CouldNotConnectByModem);
        }
        self.state.connected.store(true, std::sync::atomic::Ordering::Release);
        Ok(())
    }

    /// Incoming auto-answer loop (spec §4.1): ignores `RING`, treats
    /// `NoCarrier` as recoverable by re-hooking and repeating, bounded by
    /// `AutoAnswerTimeout`.
    pub async fn wait_for_incoming_call(&self) -> Result<(), C12Error> {
        let deadline = crate::primitives::timer::Deadline::after(self.cfg.auto_answer_timeout);
        loop {
            if deadline.has_elapsed() {
                return Err(C12Error::ModemError(
                    "timed out waiting for incoming connection".to_string(),
                ));
            }
            self.write_line(&self.cfg.auto_answer_string).await?;
            match self.read_response_line(deadline.remaining()).await {
                Ok(ModemResponse::Connect) => {
                    self.state.connected.store(true, std::sync::atomic::Ordering::Release);
                    return Ok(());
                },
                Ok(ModemResponse::Ring) => continue,
                Ok(ModemResponse::NoCarrier) => {
                    self.hook_on().await?;
                    continue;
                },
                Ok(other) => {
                    return Err(C12Error::ExpectedXGotX {
                        expected: "CONNECT".to_string(),
                        got: format!("{other:?}"),
                    });
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Drop DTR 400ms then raise it, hanging up and resetting the modem.
    async fn hook_on(&self) -> Result<(), C12Error> {
        self.set_dtr_control(LineControl::Disable).await?;
        tokio::time::sleep(Duration::from_millis(400)).await;
        self.set_dtr_control(LineControl::Enable).await
    }
}

impl Channel for ModemChannel {
    fn state(&self) -> &ChannelState {
        &self.state
    }

    async fn connect(&self) -> Result<(), C12Error> {
        self.dial().await?;
        self.state.emit(crate::counters::MonitorEvent::ChannelConnect);
        Ok(())
    }

    async fn disconnect(&self) {
        let _ = self.hook_on().await;
        self.state.connected.store(false, std::sync::atomic::Ordering::Release);
        self.state.emit(crate::counters::MonitorEvent::ChannelDisconnect);
    }

    async fn write_buffer(&self, bytes: &[u8]) -> Result<(), C12Error> {
        if self.state.cancel.is_set() {
            return Err(C12Error::OperationCancelled);
        }
        self.raw_write(bytes).await
    }

    async fn flush_output_buffer(&self, _hint_bytes_in_fifo: usize) -> Result<(), C12Error> {
        Ok(())
    }

    async fn read_buffer(&self, n: usize) -> Result<Vec<u8>, C12Error> {
        let timeout_millis = self
            .state
            .read_timeout_millis
            .load(std::sync::atomic::Ordering::SeqCst);
        let mut buf = vec![0u8; n];
        {
            let mut guard = self.port.lock().await;
            tokio::time::timeout(Duration::from_millis(timeout_millis), guard.read_exact(&mut buf))
                .await
                .map_err(|_| C12Error::ChannelReadTimeout)?
                .map_err(|e| C12Error::ModemError(e.to_string()))?;
        }
        self.state.record_rx(n);
        Ok(buf)
    }

    async fn do_read_cancellable(
        &self,
        max: usize,
        timeout_millis: u64,
        allow_partial: bool,
    ) -> Result<Vec<u8>, C12Error> {
        if !allow_partial {
            return self.read_buffer(max).await;
        }
        let mut buf = vec![0u8; max.max(1)];
        let mut guard = self.port.lock().await;
        match tokio::time::timeout(Duration::from_millis(timeout_millis), guard.read(&mut buf)).await
        {
            Ok(Ok(n)) => {
                drop(guard);
                buf.truncate(n);
                self.state.record_rx(n);
                Ok(buf)
            },
            Ok(Err(e)) => Err(C12Error::ModemError(e.to_string())),
            Err(_) => Ok(Vec::new()),
        }
    }

    async fn clear_input_buffer(&self) {
        let guard = self.port.lock().await;
        let _ = guard.clear(ClearBuffer::Input);
    }

    async fn set_dtr_control(&self, control: LineControl) -> Result<(), C12Error> {
        let mut guard = self.port.lock().await;
        let level = !matches!(control, LineControl::Disable);
        guard
            .write_data_terminal_ready(level)
            .map_err(|e| C12Error::ModemError(e.to_string()))
    }

    async fn set_rts_control(&self, control: LineControl) -> Result<(), C12Error> {
        let mut guard = self.port.lock().await;
        let level = !matches!(control, LineControl::Disable);
        guard
            .write_request_to_send(level)
            .map_err(|e| C12Error::ModemError(e.to_string()))
    }

    async fn set_baud(&self, baud: u32) -> Result<(), C12Error> {
        let mut guard = self.port.lock().await;
        guard
            .set_baud_rate(baud)
            .map_err(|e| C12Error::ModemError(e.to_string()))
    }

    async fn get_dcd(&self) -> Result<bool, C12Error> {
        let mut guard = self.port.lock().await;
        guard
            .read_carrier_detect()
            .map_err(|e| C12Error::ModemError(e.to_string()))
    }
}
