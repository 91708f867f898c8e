// SPDX-License-Identifier: AGPL-3.0-or-later

//! Command queue and worker (spec §4.5 "Queue and worker (C7)"): callers
//! enqueue commands, then `commit` either runs them synchronously or
//! hands them to a background task, with a second commit in a row just
//! clearing an already-finished queue.
//!
//! There's no stable OS thread identity to gate foreground/background
//! access in an async/tokio program, so the `background` slot itself is
//! the guard: a commit started asynchronously must be awaited (via
//! [`Worker::is_done`] or a second [`Worker::commit`]) before a new one
//! can start, enforced by the `pending`/`background` locks rather than a
//! thread-id check.

pub mod worker;

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::C12Error;

/// Weighted completion tracker for a queue commit (spec §4.5 `DoQCommit`
/// "updating a `ProgressAction` weighted by `cmd.progressWeight`").
/// Stored as bit-cast `f64`s so progress can be read without locking
/// while a commit runs on the background worker task.
#[derive(Debug, Default)]
pub struct ProgressAction {
    completed_weight: AtomicU64,
    total_weight: AtomicU64,
}

/// Point-in-time read of a [`ProgressAction`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProgressSnapshot {
    pub completed_weight: f64,
    pub total_weight: f64,
}

impl ProgressAction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking a new commit of `total_weight`.
    pub fn reset(&self, total_weight: f64) {
        self.completed_weight.store(0f64.to_bits(), Ordering::Relaxed);
        self.total_weight.store(total_weight.to_bits(), Ordering::Relaxed);
    }

    /// Folds one finished command's weight into the running total.
    pub fn advance(&self, weight: f64) {
        self.completed_weight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + weight).to_bits())
            })
            .ok();
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            completed_weight: f64::from_bits(self.completed_weight.load(Ordering::Relaxed)),
            total_weight: f64::from_bits(self.total_weight.load(Ordering::Relaxed)),
        }
    }
}

/// One queued operation (spec §3 "Command record (C7)").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    WriteToMonitor,
    Connect,
    Disconnect,
    StartSession,
    EndSession,
    EndSessionNoThrow,
    IdentifyMeter,
    Read,
    Write,
    ReadPartial,
    WritePartial,
    Execute,
    ExecuteRequest,
    ExecuteResponse,
    ExecuteRequestResponse,
}

/// A queued command, with the `MeterIsLittleEndian` flag and progress
/// weight snapshotted at enqueue time (spec §3: "commands snapshot the
/// endianness flag in effect when queued, not when run").
#[derive(Debug, Clone)]
pub struct CommandRecord {
    pub kind: CommandKind,
    pub number: u16,
    pub offset: u32,
    pub length: u16,
    pub request: Vec<u8>,
    pub response: Vec<u8>,
    pub meter_is_little_endian: bool,
    pub data_id: i32,
    pub progress_weight: f64,
    pub monitor_message: String,
}

impl CommandRecord {
    fn new(kind: CommandKind) -> Self {
        Self {
            kind,
            number: 0,
            offset: 0,
            length: 0,
            request: Vec::new(),
            response: Vec::new(),
            meter_is_little_endian: false,
            data_id: 0,
            progress_weight: 1.0,
            monitor_message: String::new(),
        }
    }

    pub fn write_to_monitor(message: impl Into<String>) -> Self {
        let mut r = Self::new(CommandKind::WriteToMonitor);
        r.monitor_message = message.into();
        r
    }

    pub fn connect() -> Self {
        Self::new(CommandKind::Connect)
    }

    pub fn disconnect() -> Self {
        Self::new(CommandKind::Disconnect)
    }

    pub fn start_session() -> Self {
        Self::new(CommandKind::StartSession)
    }

    pub fn end_session() -> Self {
        Self::new(CommandKind::EndSession)
    }

    pub fn end_session_no_throw() -> Self {
        Self::new(CommandKind::EndSessionNoThrow)
    }

    pub fn identify_meter() -> Self {
        Self::new(CommandKind::IdentifyMeter)
    }

    pub fn read(table_number: u16, data_id: i32) -> Self {
        let mut r = Self::new(CommandKind::Read);
        r.number = table_number;
        r.data_id = data_id;
        r
    }

    pub fn write(table_number: u16, data: Vec<u8>) -> Self {
        let mut r = Self::new(CommandKind::Write);
        r.number = table_number;
        r.request = data;
        r
    }

    pub fn read_partial(table_number: u16, offset: u32, length: u16, data_id: i32) -> Self {
        let mut r = Self::new(CommandKind::ReadPartial);
        r.number = table_number;
        r.offset = offset;
        r.length = length;
        r.data_id = data_id;
        r
    }

    pub fn write_partial(table_number: u16, offset: u32, data: Vec<u8>) -> Self {
        let mut r = Self::new(CommandKind::WritePartial);
        r.number = table_number;
        r.offset = offset;
        r.request = data;
        r
    }

    /// `Execute`: both halves in one round trip, response discarded by the
    /// caller via [`CommandRecord::data_id`] of `0`.
    pub fn execute(procedure_number: u16, sequence_counter: u8, parameters: Vec<u8>) -> Self {
        let mut r = Self::new(CommandKind::Execute);
        r.number = procedure_number;
        r.offset = sequence_counter as u32;
        r.request = parameters;
        r
    }

    pub fn execute_request(procedure_number: u16, sequence_counter: u8, parameters: Vec<u8>) -> Self {
        let mut r = Self::new(CommandKind::ExecuteRequest);
        r.number = procedure_number;
        r.offset = sequence_counter as u32;
        r.request = parameters;
        r
    }

    pub fn execute_response(procedure_number: u16, data_id: i32) -> Self {
        let mut r = Self::new(CommandKind::ExecuteResponse);
        r.number = procedure_number;
        r.data_id = data_id;
        r
    }

    pub fn execute_request_response(
        procedure_number: u16,
        sequence_counter: u8,
        parameters: Vec<u8>,
        data_id: i32,
    ) -> Self {
        let mut r = Self::new(CommandKind::ExecuteRequestResponse);
        r.number = procedure_number;
        r.offset = sequence_counter as u32;
        r.request = parameters;
        r.data_id = data_id;
        r
    }
}

pub(crate) fn not_found(kind: &CommandKind, number: u16, data_id: i32) -> C12Error {
    C12Error::Software(format!(
        "no completed {kind:?} command for table/procedure {number} with data id {data_id}"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_sets_table_number_and_data_id() {
        let r = CommandRecord::read(2048, 7);
        assert_eq!(r.kind, CommandKind::Read);
        assert_eq!(r.number, 2048);
        assert_eq!(r.data_id, 7);
        assert!(r.response.is_empty());
    }

    #[test]
    fn write_partial_carries_offset_and_payload() {
        let r = CommandRecord::write_partial(3, 16, vec![1, 2, 3]);
        assert_eq!(r.kind, CommandKind::WritePartial);
        assert_eq!(r.offset, 16);
        assert_eq!(r.request, vec![1, 2, 3]);
    }

    #[test]
    fn execute_packs_sequence_counter_into_offset() {
        let r = CommandRecord::execute(7, 9, vec![0xAB]);
        assert_eq!(r.kind, CommandKind::Execute);
        assert_eq!(r.number, 7);
        assert_eq!(r.offset, 9);
        assert_eq!(r.request, vec![0xAB]);
    }

    #[test]
    fn not_found_mentions_table_and_data_id() {
        let e = not_found(&CommandKind::Read, 5, 2);
        assert!(matches!(e, C12Error::Software(msg) if msg.contains('5') && msg.contains('2')));
    }
}
