// SPDX-License-Identifier: AGPL-3.0-or-later

//! The queue's commit machinery (spec §4.5): enqueuing lazily clears a
//! stale, already-committed queue on the next `add`; `commit` dispatches
//! each record to its synchronous counterpart in order and stops at the
//! first error; `abort` marks the queue done and cancels any in-flight
//! background I/O.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::{sync::Mutex, task::JoinHandle};

use crate::{
    app::identify::IdentifiedView,
    channel::Channel,
    error::C12Error,
    queue::{CommandKind, CommandRecord, ProgressAction, ProgressSnapshot, not_found},
    session::Session,
};

/// Drives a [`Session`]'s command queue. One `Worker` per session; the
/// `pending`/`background` locks double as the foreground/background
/// exclusion the original enforces by OS thread identity (see module
/// docs).
pub struct Worker<C: Channel> {
    session: Arc<Mutex<Session<C>>>,
    pending: Mutex<Vec<CommandRecord>>,
    completed: Mutex<Vec<CommandRecord>>,
    last_identified: Mutex<Option<IdentifiedView>>,
    commit_done: AtomicBool,
    background: Mutex<Option<JoinHandle<Result<(Vec<CommandRecord>, Option<IdentifiedView>), C12Error>>>>,
    progress: Arc<ProgressAction>,
}

impl<C: Channel + 'static> Worker<C> {
    pub fn new(session: Arc<Mutex<Session<C>>>) -> Self {
        Self {
            session,
            pending: Mutex::new(Vec::new()),
            completed: Mutex::new(Vec::new()),
            last_identified: Mutex::new(None),
            commit_done: AtomicBool::new(true),
            background: Mutex::new(None),
            progress: Arc::new(ProgressAction::new()),
        }
    }

    /// Weighted completion of the commit in progress (spec §4.5
    /// `DoQCommit`); stable at `completed_weight == total_weight` once the
    /// queue has finished running.
    pub fn progress(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    /// `DoAddCommandToQueue`: if the previous commit fully finished,
    /// drop its stale queue before accepting the new command.
    pub async fn add(&self, record: CommandRecord) {
        let mut pending = self.pending.lock().await;
        if self.commit_done.swap(false, Ordering::AcqRel) {
            pending.clear();
        }
        pending.push(record);
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// `QCommit(asynchronously)`. A second call in a row (no commands
    /// queued since the previous commit finished) is a no-op that just
    /// clears out anything left over, matching the original's
    /// idempotence.
    pub async fn commit(&self, asynchronously: bool) -> Result<(), C12Error> {
        if self.commit_done.load(Ordering::Acquire) {
            self.pending.lock().await.clear();
            if let Some(handle) = self.background.lock().await.take() {
                let _ = handle.await;
            }
            return Ok(());
        }

        if asynchronously {
            let session = Arc::clone(&self.session);
            let records = std::mem::take(&mut *self.pending.lock().await);
            self.progress.reset(records.iter().map(|r| r.progress_weight).sum());
            let progress = Arc::clone(&self.progress);
            let handle = tokio::spawn(async move { run_queue(session, records, progress).await });
            *self.background.lock().await = Some(handle);
            Ok(())
        } else {
            if let Some(handle) = self.background.lock().await.take() {
                let result = handle
                    .await
                    .map_err(|_| C12Error::Software("queue worker task panicked".to_string()))?;
                return self.finish(result).await;
            }
            let session = Arc::clone(&self.session);
            let records = std::mem::take(&mut *self.pending.lock().await);
            self.progress.reset(records.iter().map(|r| r.progress_weight).sum());
            let progress = Arc::clone(&self.progress);
            let result = run_queue(session, records, progress).await;
            self.finish(result).await
        }
    }

    /// Polls a commit started with `asynchronously = true`. Returns
    /// `true` once the background task has finished and its results are
    /// folded in.
    pub async fn is_done(&self) -> bool {
        let finished = {
            let bg = self.background.lock().await;
            match bg.as_ref() {
                Some(handle) => handle.is_finished(),
                None => return true,
            }
        };
        if !finished {
            return false;
        }
        let handle = self.background.lock().await.take();
        if let Some(handle) = handle {
            let result = handle
                .await
                .map_err(|_| C12Error::Software("queue worker task panicked".to_string()));
            let result = result.and_then(|r| r);
            let _ = self.finish(result).await;
        }
        true
    }

    async fn finish(&self, result: Result<(Vec<CommandRecord>, Option<IdentifiedView>), C12Error>) -> Result<(), C12Error> {
        self.commit_done.store(true, Ordering::Release);
        match result {
            Ok((records, identified)) => {
                *self.completed.lock().await = records;
                if identified.is_some() {
                    *self.last_identified.lock().await = identified;
                }
                Ok(())
            },
            Err(e) => {
                self.abort().await;
                Err(e)
            },
        }
    }

    /// `QAbort`: mark the queue done and cancel any background I/O still
    /// in flight.
    pub async fn abort(&self) {
        self.commit_done.store(true, Ordering::Release);
        if self.background.lock().await.is_some() {
            self.session.lock().await.channel().cancel_communication(false).await;
        }
    }

    pub async fn get_table_data(&self, table_number: u16, data_id: i32) -> Result<Vec<u8>, C12Error> {
        self.find_response(CommandKind::Read, table_number, data_id).await
    }

    pub async fn get_function_data(&self, procedure_number: u16, data_id: i32) -> Result<Vec<u8>, C12Error> {
        self.find_response(CommandKind::ExecuteResponse, procedure_number, data_id).await
    }

    pub async fn get_identified(&self) -> Option<IdentifiedView> {
        self.last_identified.lock().await.clone()
    }

    async fn find_response(&self, kind: CommandKind, number: u16, data_id: i32) -> Result<Vec<u8>, C12Error> {
        let completed = self.completed.lock().await;
        completed
            .iter()
            .find(|r| r.kind == kind && r.number == number && r.data_id == data_id)
            .map(|r| r.response.clone())
            .ok_or_else(|| not_found(&kind, number, data_id))
    }
}

/// `DoQCommit`: walks the queue in order, dispatching each record to its
/// synchronous service and writing the response back into it. Stops at
/// the first error (spec §4.5: "errors short-circuit the remaining
/// commands").
async fn run_queue<C: Channel>(
    session: Arc<Mutex<Session<C>>>,
    mut records: Vec<CommandRecord>,
    progress: Arc<ProgressAction>,
) -> Result<(Vec<CommandRecord>, Option<IdentifiedView>), C12Error> {
    let mut identified = None;
    for record in &mut records {
        let mut guard = session.lock().await;
        match record.kind {
            CommandKind::WriteToMonitor => {
                guard.write_to_monitor(&record.monitor_message);
            },
            CommandKind::Connect => guard.connect().await?,
            CommandKind::Disconnect => guard.disconnect().await,
            CommandKind::StartSession => guard.start_session().await?,
            CommandKind::EndSession => guard.end_session().await?,
            CommandKind::EndSessionNoThrow => guard.end_session_no_throw().await,
            CommandKind::IdentifyMeter => {
                identified = Some(guard.identify_meter().await?);
            },
            CommandKind::Read => {
                record.response = guard.read_table_full(record.number).await?;
            },
            CommandKind::Write => {
                guard.write_table_full(record.number, &record.request).await?;
            },
            CommandKind::ReadPartial => {
                record.response =
                    guard.read_table_partial(record.number, record.offset, record.length).await?;
            },
            CommandKind::WritePartial => {
                guard.write_table_partial(record.number, record.offset, &record.request).await?;
            },
            CommandKind::Execute => {
                let sequence_counter = record.offset as u8;
                record.response =
                    guard.execute_procedure(record.number, sequence_counter, &record.request).await?;
            },
            CommandKind::ExecuteRequest => {
                let sequence_counter = record.offset as u8;
                guard.execute_procedure(record.number, sequence_counter, &record.request).await?;
            },
            CommandKind::ExecuteResponse => {
                record.response = guard.read_table_full(crate::app::ST_008_PROCEDURE_RESPONSE).await?;
            },
            CommandKind::ExecuteRequestResponse => {
                let sequence_counter = record.offset as u8;
                record.response =
                    guard.execute_procedure(record.number, sequence_counter, &record.request).await?;
            },
        }
        progress.advance(record.progress_weight);
    }
    Ok((records, identified))
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::AtomicUsize, time::Duration};

    use super::*;
    use crate::{
        cfg::{
            config::{Credentials, Identity, Negotiation, Policy, ProtocolConfig, Retries, Timing},
            enums::{DataFormat, Dialect, YesNo},
        },
        channel::ChannelState,
        primitives::secure_bytes::SecureBytes,
    };

    fn sample_config() -> ProtocolConfig {
        ProtocolConfig {
            dialect: Dialect::C1218,
            identity: Identity {
                identity: "00000000".to_string(),
                data_format: DataFormat::C1218,
                meter_is_little_endian: YesNo::No,
            },
            credentials: Credentials {
                password: SecureBytes::new(vec![0; 4]),
                password_list: vec![],
                enable_authentication: YesNo::No,
                authentication_algorithm: None,
                authentication_key: None,
                authentication_key_id: 0,
                authentication_key_list: vec![],
            },
            negotiation: Negotiation::default(),
            timing: Timing {
                intercharacter_timeout: Duration::from_millis(50),
                acknowledgement_timeout: Duration::from_secs(3),
                channel_traffic_timeout: Duration::from_secs(10),
                link_layer_retries: 3,
            },
            retries: Retries {
                application_layer_retries: 3,
                application_layer_procedure_retries: 3,
                application_layer_procedure_sleep_between_retries: Duration::from_millis(500),
                procedure_initiate_timeout: Duration::from_secs(30),
            },
            policy: Policy {
                issue_negotiate_on_start_session: YesNo::Yes,
                issue_timing_setup_on_start_session: YesNo::No,
                issue_security_on_start_session: YesNo::No,
                issue_logoff_on_end_session: YesNo::Yes,
                wake_up_shared_optical_port: YesNo::No,
                check_incoming_toggle_bit: YesNo::Yes,
                keep_session_alive: YesNo::No,
                end_session_on_application_layer_error: YesNo::Yes,
            },
        }
    }

    struct NullChannel {
        state: ChannelState,
        connects: AtomicUsize,
    }

    impl NullChannel {
        fn new() -> Self {
            Self { state: ChannelState::default(), connects: AtomicUsize::new(0) }
        }
    }

    impl Channel for NullChannel {
        fn state(&self) -> &ChannelState {
            &self.state
        }

        async fn connect(&self) -> Result<(), C12Error> {
            self.connects.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        async fn disconnect(&self) {}

        async fn write_buffer(&self, _bytes: &[u8]) -> Result<(), C12Error> {
            Ok(())
        }

        async fn flush_output_buffer(&self, _hint_bytes_in_fifo: usize) -> Result<(), C12Error> {
            Ok(())
        }

        async fn read_buffer(&self, _n: usize) -> Result<Vec<u8>, C12Error> {
            Err(C12Error::ChannelReadTimeout)
        }

        async fn do_read_cancellable(
            &self,
            _max: usize,
            _timeout_millis: u64,
            _allow_partial: bool,
        ) -> Result<Vec<u8>, C12Error> {
            Err(C12Error::ChannelReadTimeout)
        }

        async fn clear_input_buffer(&self) {}
    }

    fn worker() -> Worker<NullChannel> {
        let session = Session::new(NullChannel::new(), sample_config());
        Worker::new(Arc::new(Mutex::new(session)))
    }

    #[tokio::test]
    async fn synchronous_commit_runs_queued_connect() {
        let w = worker();
        w.add(CommandRecord::connect()).await;
        assert_eq!(w.len().await, 1);
        w.commit(false).await.unwrap();
        assert_eq!(w.len().await, 0);
        let connects = w.session.lock().await.channel().connects.load(Ordering::Relaxed);
        assert_eq!(connects, 1);
    }

    #[tokio::test]
    async fn second_commit_in_a_row_is_a_no_op() {
        let w = worker();
        w.add(CommandRecord::connect()).await;
        w.commit(false).await.unwrap();
        w.commit(false).await.unwrap();
    }

    #[tokio::test]
    async fn enqueue_after_finished_commit_clears_stale_queue() {
        let w = worker();
        w.add(CommandRecord::connect()).await;
        w.commit(false).await.unwrap();
        w.add(CommandRecord::disconnect()).await;
        assert_eq!(w.len().await, 1);
    }

    #[tokio::test]
    async fn async_commit_completes_and_is_observable_via_is_done() {
        let w = worker();
        w.add(CommandRecord::connect()).await;
        w.commit(true).await.unwrap();
        for _ in 0..50 {
            if w.is_done().await {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("async commit never finished");
    }

    #[tokio::test]
    async fn get_table_data_reports_missing_entry() {
        let w = worker();
        let err = w.get_table_data(7, 1).await.unwrap_err();
        assert!(matches!(err, C12Error::Software(_)));
    }

    #[tokio::test]
    async fn commit_advances_progress_by_command_weight() {
        let w = worker();
        let mut heavy = CommandRecord::connect();
        heavy.progress_weight = 3.0;
        w.add(heavy).await;
        w.add(CommandRecord::disconnect()).await;

        assert_eq!(w.progress(), ProgressSnapshot::default());
        w.commit(false).await.unwrap();

        let progress = w.progress();
        assert_eq!(progress.total_weight, 4.0);
        assert_eq!(progress.completed_weight, 4.0);
    }
}
