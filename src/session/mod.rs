// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session orchestration (spec §4.4 "Session orchestration (C6)").
//! `StartSession`/`EndSession` drive the application-layer service
//! sequence for each dialect: C12.18 retries the whole login sequence
//! once on failure before giving up, while C12.21 runs it as a single
//! straight sequential chain with no retry (see DESIGN.md).

use std::{future::Future, sync::Arc, time::Instant};

use tokio::sync::Mutex;
use tracing::warn;

use crate::{
    app::{Dispatcher, authenticate, identify, identify::IdentifiedView, logon, negotiate, procedure, security, table, terminate, timing_setup},
    cfg::{config::{DEFAULT_MAXIMUM_PASSWORD_LENGTH, ProtocolConfig}, enums::AuthAlgorithm},
    channel::Channel,
    counters::{Counters, MonitorEvent},
    error::C12Error,
    link::ToggleState,
    primitives::secure_bytes::SecureBytes,
};

pub mod keepalive;
pub mod password_list;

/// Session state (spec §3 "Session state (C6)"). Entering `InSession`
/// requires at least a successful `Identify`; `secured` can only be true
/// after `Logon`.
#[derive(Debug, Clone)]
pub enum SessionState {
    Disconnected,
    Connected,
    InSession {
        identified: bool,
        negotiated: bool,
        logged_on: bool,
        secured: bool,
        last_traffic: Instant,
    },
}

/// Drives one C12 session over a single [`Channel`]. Owns the link-layer
/// toggle state and the negotiated packet size, both of which reset on a
/// fresh `StartSession`.
pub struct Session<C: Channel> {
    channel: C,
    config: ProtocolConfig,
    toggle: ToggleState,
    negotiated_packet_size: u16,
    state: SessionState,
    identified: Option<IdentifiedView>,
    password_list_successful_entry: Option<usize>,
    authentication_key_list_successful_entry: Option<usize>,
    counters: Counters,
}

impl<C: Channel> Session<C> {
    pub fn new(channel: C, config: ProtocolConfig) -> Self {
        let negotiated_packet_size = config.negotiation.packet_size;
        Self {
            channel,
            config,
            toggle: ToggleState::default(),
            negotiated_packet_size,
            state: SessionState::Disconnected,
            identified: None,
            password_list_successful_entry: None,
            authentication_key_list_successful_entry: None,
            counters: Counters::new(),
        }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn identified_view(&self) -> Option<&IdentifiedView> {
        self.identified.as_ref()
    }

    pub fn password_list_successful_entry(&self) -> Option<usize> {
        self.password_list_successful_entry
    }

    pub fn authentication_key_list_successful_entry(&self) -> Option<usize> {
        self.authentication_key_list_successful_entry
    }

    pub async fn connect(&mut self) -> Result<(), C12Error> {
        self.channel.connect().await?;
        self.state = SessionState::Connected;
        Ok(())
    }

    pub async fn disconnect(&mut self) {
        self.channel.disconnect().await;
        self.state = SessionState::Disconnected;
    }

    pub async fn start_session(&mut self) -> Result<(), C12Error> {
        if self.config.dialect.is_c1221() {
            self.start_session_c1221().await
        } else {
            self.start_session_c1218().await
        }
    }

    async fn start_session_c1218(&mut self) -> Result<(), C12Error> {
        self.identified = None;

        if self.config.policy.wake_up_shared_optical_port.as_bool() {
            self.channel.write_char(0x55).await?;
            self.channel.sleep(50).await?;
        }

        self.run_identify().await?;

        let issue_negotiate = self.config.policy.issue_negotiate_on_start_session.as_bool();
        let negotiated;
        match self.try_negotiate_then_logon(issue_negotiate).await {
            Ok(()) => negotiated = issue_negotiate,
            Err(e) if e.is_never_retried() || matches!(e, C12Error::C12NokResponse { .. }) => return Err(e),
            Err(e) => {
                let no_retry = !issue_negotiate || self.config.negotiation.session_baud.is_none();
                if no_retry {
                    return Err(e);
                }
                self.channel.sleep(7_000).await?;
                self.run_identify().await?;
                self.run_negotiate().await?;
                self.run_logon().await?;
                negotiated = true;
            },
        }

        let secured = self.config.policy.issue_security_on_start_session.as_bool();
        if secured {
            self.full_login().await?;
        }

        self.state = SessionState::InSession {
            identified: true,
            negotiated,
            logged_on: true,
            secured,
            last_traffic: Instant::now(),
        };
        Ok(())
    }

    async fn start_session_c1221(&mut self) -> Result<(), C12Error> {
        self.identified = None;
        self.run_identify().await?;

        if self.config.policy.issue_timing_setup_on_start_session.as_bool() {
            self.run_timing_setup().await?;
        }

        let negotiated = self.config.policy.issue_negotiate_on_start_session.as_bool();
        if negotiated {
            self.run_negotiate().await?;
        }

        self.run_logon().await?;

        let secured = self.config.policy.issue_security_on_start_session.as_bool();
        if secured {
            self.full_login().await?;
        }

        self.state = SessionState::InSession {
            identified: true,
            negotiated,
            logged_on: true,
            secured,
            last_traffic: Instant::now(),
        };
        Ok(())
    }

    async fn try_negotiate_then_logon(&mut self, issue_negotiate: bool) -> Result<(), C12Error> {
        if issue_negotiate {
            self.run_negotiate().await?;
        }
        self.run_logon().await
    }

    /// `FullLogin`: `Authenticate` under C12.21 when `EnableAuthentication`
    /// is set, `Security` otherwise (spec §4.4).
    async fn full_login(&mut self) -> Result<(), C12Error> {
        if self.config.dialect.is_c1221() && self.config.credentials.enable_authentication.as_bool() {
            self.run_authenticate().await
        } else {
            self.run_security().await
        }
    }

    pub async fn end_session(&mut self) -> Result<(), C12Error> {
        if self.config.policy.issue_logoff_on_end_session.as_bool() {
            self.run_logoff().await?;
        }
        self.run_terminate().await?;
        self.toggle.outgoing = false;
        self.state = SessionState::Connected;
        Ok(())
    }

    /// Swallows every error (spec §4.4: "`EndSessionNoThrow` swallows errors").
    pub async fn end_session_no_throw(&mut self) {
        if let Err(e) = self.end_session().await {
            warn!(error = %e, "EndSession failed, ignoring");
        }
    }

    async fn run_identify(&mut self) -> Result<(), C12Error> {
        let dispatcher = Dispatcher::new(&self.channel, &self.config, self.negotiated_packet_size, &self.counters);
        let view = identify::identify(&dispatcher, &mut self.toggle).await?;
        self.identified = Some(view);
        Ok(())
    }

    async fn run_negotiate(&mut self) -> Result<(), C12Error> {
        let dispatcher = Dispatcher::new(&self.channel, &self.config, self.negotiated_packet_size, &self.counters);
        let n = &self.config.negotiation;
        let view = negotiate::negotiate(
            &dispatcher,
            &mut self.toggle,
            n.packet_size,
            n.maximum_number_of_packets,
            n.session_baud,
        )
        .await?;
        self.negotiated_packet_size = view.packet_size;
        Ok(())
    }

    async fn run_logon(&mut self) -> Result<(), C12Error> {
        let dispatcher = Dispatcher::new(&self.channel, &self.config, self.negotiated_packet_size, &self.counters);
        // No separate `UserId` field exists in the configuration surface
        // (spec §6); the wire `Identity` string doubles as `UserName`.
        logon::logon(&dispatcher, &mut self.toggle, 0, &self.config.identity.identity).await
    }

    async fn run_timing_setup(&mut self) -> Result<(), C12Error> {
        let dispatcher = Dispatcher::new(&self.channel, &self.config, self.negotiated_packet_size, &self.counters);
        let t = &self.config.timing;
        timing_setup::timing_setup(
            &dispatcher,
            &mut self.toggle,
            t.channel_traffic_timeout,
            t.intercharacter_timeout,
            t.acknowledgement_timeout,
            t.link_layer_retries,
        )
        .await?;
        Ok(())
    }

    async fn run_security(&mut self) -> Result<(), C12Error> {
        let max_len = DEFAULT_MAXIMUM_PASSWORD_LENGTH;

        if self.config.credentials.password_list.is_empty() {
            let password = self.config.credentials.password.clone_explicit();
            let dispatcher = Dispatcher::new(&self.channel, &self.config, self.negotiated_packet_size, &self.counters);
            security::security(&dispatcher, &mut self.toggle, &password, max_len).await?;
            self.password_list_successful_entry = None;
            return Ok(());
        }

        let entries: Vec<SecureBytes> =
            self.config.credentials.password_list.iter().map(SecureBytes::clone_explicit).collect();
        let channel = &self.channel;
        let config = &self.config;
        let packet_size = self.negotiated_packet_size;
        let counters = &self.counters;
        let toggle = &mut self.toggle;

        let ix = password_list::try_each(&entries, move |_i, password| {
            let dispatcher = Dispatcher::new(channel, config, packet_size, counters);
            async move { security::security(&dispatcher, &mut *toggle, password, max_len).await }
        })
        .await?;

        self.password_list_successful_entry = Some(ix);
        Ok(())
    }

    /// Authenticate, retrying the key list per-entry. Between attempts
    /// re-establishes the session from scratch, since devices require a
    /// fresh `Logoff`/`Identify`/`Logon` after a failed key (spec §4.4).
    async fn run_authenticate(&mut self) -> Result<(), C12Error> {
        let auth = self
            .identified
            .as_ref()
            .ok_or_else(|| C12Error::Software("Identify was not issued".to_string()))?
            .auth
            .clone()
            .ok_or_else(|| C12Error::Meter("meter does not support authentication".to_string()))?;

        let algorithm = self.config.credentials.authentication_algorithm.ok_or_else(|| {
            C12Error::Software("AuthenticationAlgorithm is required when EnableAuthentication=Yes".to_string())
        })?;
        if AuthAlgorithm::from_device_code(auth.algorithm_code) != Some(algorithm) {
            return Err(C12Error::Meter(
                "meter's reported authentication algorithm does not match configuration".to_string(),
            ));
        }

        let key_id = self.config.credentials.authentication_key_id;
        let ticket = auth.ticket.clone();

        if self.config.credentials.authentication_key_list.is_empty() {
            let key = self
                .config
                .credentials
                .authentication_key
                .as_ref()
                .ok_or_else(|| C12Error::Software("AuthenticationKey is required when EnableAuthentication=Yes".to_string()))?
                .clone_explicit();
            self.authenticate_once(algorithm, &key, key_id, &ticket).await?;
            self.authentication_key_list_successful_entry = None;
            return Ok(());
        }

        let entries: Vec<SecureBytes> = self
            .config
            .credentials
            .authentication_key_list
            .iter()
            .map(SecureBytes::clone_explicit)
            .collect();
        let last = entries.len() - 1;

        for (i, key) in entries.iter().enumerate() {
            match self.authenticate_once(algorithm, key, key_id, &ticket).await {
                Ok(()) => {
                    self.authentication_key_list_successful_entry = Some(i);
                    return Ok(());
                },
                Err(e) if matches!(e, C12Error::Security(_)) && i != last => {
                    self.run_logoff().await?;
                    self.run_terminate().await?;
                    self.run_identify().await?;
                    if self.config.policy.issue_timing_setup_on_start_session.as_bool() {
                        self.run_timing_setup().await?;
                    }
                    if self.config.policy.issue_negotiate_on_start_session.as_bool() {
                        self.run_negotiate().await?;
                    }
                    self.run_logon().await?;
                },
                Err(e) => return Err(e),
            }
        }
        unreachable!("loop always returns on its last iteration")
    }

    async fn authenticate_once(
        &mut self,
        algorithm: AuthAlgorithm,
        key: &SecureBytes,
        key_id: u8,
        ticket: &[u8],
    ) -> Result<(), C12Error> {
        let dispatcher = Dispatcher::new(&self.channel, &self.config, self.negotiated_packet_size, &self.counters);
        authenticate::authenticate_with_key(&dispatcher, &mut self.toggle, algorithm, key, key_id, ticket).await
    }

    async fn run_logoff(&mut self) -> Result<(), C12Error> {
        let dispatcher = Dispatcher::new(&self.channel, &self.config, self.negotiated_packet_size, &self.counters);
        terminate::logoff(&dispatcher, &mut self.toggle).await
    }

    async fn run_terminate(&mut self) -> Result<(), C12Error> {
        let dispatcher = Dispatcher::new(&self.channel, &self.config, self.negotiated_packet_size, &self.counters);
        terminate::terminate(&dispatcher, &mut self.toggle).await
    }

    /// Table/procedure access, available once `InSession` (callers are
    /// expected to check [`Session::state`] first; services themselves
    /// still surface a `C12NokResponse` if the device disagrees).
    pub async fn read_table_full(&mut self, table_number: u16) -> Result<Vec<u8>, C12Error> {
        let dispatcher = Dispatcher::new(&self.channel, &self.config, self.negotiated_packet_size, &self.counters);
        table::full_read(&dispatcher, &mut self.toggle, table_number).await
    }

    pub async fn write_table_full(&mut self, table_number: u16, data: &[u8]) -> Result<(), C12Error> {
        let dispatcher = Dispatcher::new(&self.channel, &self.config, self.negotiated_packet_size, &self.counters);
        table::full_write(&dispatcher, &mut self.toggle, table_number, data).await
    }

    pub async fn read_table_partial(
        &mut self,
        table_number: u16,
        offset: u32,
        length: u16,
    ) -> Result<Vec<u8>, C12Error> {
        let dispatcher = Dispatcher::new(&self.channel, &self.config, self.negotiated_packet_size, &self.counters);
        table::partial_read(&dispatcher, &mut self.toggle, table_number, offset, length).await
    }

    pub async fn write_table_partial(
        &mut self,
        table_number: u16,
        offset: u32,
        data: &[u8],
    ) -> Result<(), C12Error> {
        let dispatcher = Dispatcher::new(&self.channel, &self.config, self.negotiated_packet_size, &self.counters);
        table::partial_write(&dispatcher, &mut self.toggle, table_number, offset, data).await
    }

    pub async fn execute_procedure(
        &mut self,
        procedure_number: u16,
        sequence_counter: u8,
        parameters: &[u8],
    ) -> Result<Vec<u8>, C12Error> {
        let dispatcher = Dispatcher::new(&self.channel, &self.config, self.negotiated_packet_size, &self.counters);
        procedure::execute(&dispatcher, &mut self.toggle, procedure_number, sequence_counter, parameters).await
    }

    /// Re-runs `Identify` and hands back the refreshed view, for queued
    /// `IdentifyMeter` commands (spec §4.5).
    pub async fn identify_meter(&mut self) -> Result<IdentifiedView, C12Error> {
        self.run_identify().await?;
        self.identified
            .clone()
            .ok_or_else(|| C12Error::Software("Identify did not populate an identified view".to_string()))
    }

    /// `WriteToMonitor`: fire-and-forget informational event, never fails
    /// (spec §4.5, §4.6).
    pub fn write_to_monitor(&self, message: &str) {
        self.channel
            .state()
            .emit(MonitorEvent::ProtocolApplicationLayerInformation { detail: message.to_string() });
    }

    /// Lightweight traffic refresh for the keep-alive timer. The device
    /// wire details of `DoSendKeepSessionAliveMessage` are not in the
    /// filtered original source, so a plain `Identify` stands in as the
    /// probe (documented in DESIGN.md).
    pub async fn send_keep_alive_message(&mut self) -> Result<(), C12Error> {
        self.run_identify().await
    }
}

/// Wraps a shared, lockable [`Session`] so [`keepalive::spawn`] can probe
/// it from a background task without the caller threading a bespoke
/// adapter through every call site.
pub struct SessionKeepAlive<C: Channel>(pub Arc<Mutex<Session<C>>>);

impl<C: Channel + 'static> keepalive::KeepAliveTarget for SessionKeepAlive<C> {
    fn send_keep_alive(&self) -> impl Future<Output = Result<(), C12Error>> + Send {
        let session = Arc::clone(&self.0);
        async move {
            let mut guard = session.lock().await;
            guard.send_keep_alive_message().await
        }
    }
}
