// SPDX-License-Identifier: AGPL-3.0-or-later

//! End-to-end tests against an in-memory, pre-scripted meter: enough of
//! the link and application layers together to cover a C12.18 session,
//! the duplicate/shadow-packet/toggle-bit edge cases, procedure
//! execution, the password list, C12.21 Authenticate, and the command
//! queue.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use c12_client_rs::{
    app::{self, Dispatcher},
    cfg::{
        config::{Credentials, Identity, Negotiation, Policy, ProtocolConfig, Retries, Timing},
        enums::{AuthAlgorithm, DataFormat, Dialect, YesNo},
    },
    channel::{Channel, ChannelState},
    counters::Counters,
    error::C12Error,
    link::{packet::{CtrlByte, Packet}, ToggleState},
    primitives::secure_bytes::SecureBytes,
    queue::{worker::Worker, CommandRecord},
    session::Session,
};
use tokio::sync::Mutex;

fn response_packet(toggle: bool, status: u8, data: &[u8]) -> Vec<u8> {
    let mut payload = vec![status];
    payload.extend_from_slice(data);
    Packet {
        identity: 0,
        ctrl: CtrlByte::single_packet(false).with_toggle(toggle),
        seq: 0,
        payload,
    }
    .to_bytes()
}

/// A [`Channel`] whose inbound bytes are fully pre-scripted; outbound
/// bytes are just recorded for inspection.
struct ScriptedChannel {
    state: ChannelState,
    inbound: StdMutex<VecDeque<u8>>,
    outbound: StdMutex<Vec<u8>>,
}

impl ScriptedChannel {
    fn new(script: Vec<u8>) -> Self {
        Self {
            state: ChannelState::default(),
            inbound: StdMutex::new(script.into()),
            outbound: StdMutex::new(Vec::new()),
        }
    }

    fn push(&self, bytes: &[u8]) {
        self.inbound.lock().unwrap().extend(bytes.iter().copied());
    }
}

impl Channel for ScriptedChannel {
    fn state(&self) -> &ChannelState {
        &self.state
    }

    async fn connect(&self) -> Result<(), C12Error> {
        Ok(())
    }

    async fn disconnect(&self) {}

    async fn write_buffer(&self, bytes: &[u8]) -> Result<(), C12Error> {
        self.outbound.lock().unwrap().extend_from_slice(bytes);
        self.state.record_tx(bytes.len());
        Ok(())
    }

    async fn flush_output_buffer(&self, _hint_bytes_in_fifo: usize) -> Result<(), C12Error> {
        Ok(())
    }

    async fn read_buffer(&self, n: usize) -> Result<Vec<u8>, C12Error> {
        let mut guard = self.inbound.lock().unwrap();
        if guard.len() < n {
            return Err(C12Error::ChannelReadTimeout);
        }
        let out: Vec<u8> = (0..n).map(|_| guard.pop_front().unwrap()).collect();
        drop(guard);
        self.state.record_rx(out.len());
        Ok(out)
    }

    async fn do_read_cancellable(
        &self,
        max: usize,
        _timeout_millis: u64,
        _allow_partial: bool,
    ) -> Result<Vec<u8>, C12Error> {
        self.read_buffer(max).await
    }

    async fn clear_input_buffer(&self) {
        self.inbound.lock().unwrap().clear();
    }
}

fn identify_response(toggle: bool) -> Vec<u8> {
    response_packet(toggle, 0, &[1, 2, 0, 0x00])
}

fn ok_response(toggle: bool) -> Vec<u8> {
    response_packet(toggle, 0, &[])
}

fn base_config(dialect: Dialect) -> ProtocolConfig {
    ProtocolConfig {
        dialect,
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
            application_layer_procedure_sleep_between_retries: Duration::from_millis(1),
            procedure_initiate_timeout: Duration::from_secs(30),
        },
        policy: Policy {
            issue_negotiate_on_start_session: YesNo::No,
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

#[tokio::test]
async fn c1218_start_session_read_and_end_session() {
    let mut script = Vec::new();
    script.push(0x06); // ACK for Identify
    script.extend(identify_response(false));
    script.push(0x06); // ACK for Logon
    script.extend(ok_response(true));
    script.push(0x06); // ACK for ReadPartial
    script.extend(response_packet(false, 0, &[0xAA, 0xBB, 0xCC, 0xDD]));
    script.push(0x06); // ACK for Logoff
    script.extend(ok_response(true));
    script.push(0x06); // ACK for Terminate
    script.extend(ok_response(false));

    let channel = ScriptedChannel::new(script);
    let mut session = Session::new(channel, base_config(Dialect::C1218));

    session.connect().await.unwrap();
    session.start_session().await.unwrap();
    assert!(matches!(session.state(), c12_client_rs::session::SessionState::InSession { .. }));

    let data = session.read_table_partial(7, 0, 4).await.unwrap();
    assert_eq!(data, vec![0xAA, 0xBB, 0xCC, 0xDD]);

    session.end_session().await.unwrap();
    assert!(matches!(session.state(), c12_client_rs::session::SessionState::Connected));
}

#[tokio::test]
async fn duplicate_inbound_packet_is_acked_and_skipped() {
    let mut script = Vec::new();
    script.push(0x06);
    script.extend(identify_response(false));
    // ReadPartial: the meter's previous (Identify) response arrives again
    // as a stale duplicate before the real new one.
    script.push(0x06);
    script.extend(identify_response(false));
    script.extend(response_packet(true, 0, &[0x42]));

    let channel = ScriptedChannel::new(script);
    let mut toggle = ToggleState::default();
    let config = base_config(Dialect::C1218);
    let counters = Counters::new();
    let dispatcher = Dispatcher::new(&channel, &config, config.negotiation.packet_size, &counters);

    app::identify::identify(&dispatcher, &mut toggle).await.unwrap();
    let data = app::table::partial_read(&dispatcher, &mut toggle, 7, 0, 1).await.unwrap();
    assert_eq!(data, vec![0x42]);
}

#[tokio::test]
async fn shadow_packet_forces_a_fresh_transmit_then_succeeds() {
    let shadow = Packet {
        identity: 0,
        ctrl: CtrlByte::single_packet(false),
        seq: 0,
        payload: vec![0xFF],
    }
    .to_bytes();

    let mut script = Vec::new();
    script.extend(shadow); // STP seen instead of ACK while awaiting it
    script.push(0x06); // clean ack for transmit()'s internal retry
    script.push(0x06); // clean ack for the dispatcher-level re-transmit
    script.extend(identify_response(false));

    let channel = ScriptedChannel::new(script);
    let mut toggle = ToggleState::default();
    let config = base_config(Dialect::C1218);
    let counters = Counters::new();
    let dispatcher = Dispatcher::new(&channel, &config, config.negotiation.packet_size, &counters);

    let view = app::identify::identify(&dispatcher, &mut toggle).await.unwrap();
    assert_eq!((view.reference_standard, view.standard_version), (1, 2));
}

#[tokio::test(start_paused = true)]
async fn toggle_bit_failure_then_recovers_on_retry() {
    let mut script = Vec::new();
    script.push(0x06);
    script.extend(identify_response(false));
    // Logoff attempt 1: same toggle as the baseline but different content
    // -- out of sequence, rejected.
    script.push(0x06);
    script.extend(response_packet(false, 0, &[0x01]));
    // Logoff attempt 2, after the dispatcher resets toggle state: accepted.
    script.push(0x06);
    script.extend(ok_response(true));

    let channel = ScriptedChannel::new(script);
    let mut toggle = ToggleState::default();
    let config = base_config(Dialect::C1218);
    let counters = Counters::new();
    let dispatcher = Dispatcher::new(&channel, &config, config.negotiation.packet_size, &counters);

    app::identify::identify(&dispatcher, &mut toggle).await.unwrap();
    app::terminate::logoff(&dispatcher, &mut toggle).await.unwrap();
}

#[tokio::test]
async fn procedure_execute_initiates_then_reads_response() {
    let mut script = Vec::new();
    script.push(0x06); // ACK for ST_007 write
    script.extend(ok_response(false));
    script.push(0x06); // ACK for ST_008 read
    script.extend(response_packet(true, 0, &[0, 0xAA, 0xBB]));

    let channel = ScriptedChannel::new(script);
    let mut toggle = ToggleState::default();
    let config = base_config(Dialect::C1218);
    let counters = Counters::new();
    let dispatcher = Dispatcher::new(&channel, &config, config.negotiation.packet_size, &counters);

    let result = app::procedure::execute(&dispatcher, &mut toggle, 12, 1, &[0x01]).await.unwrap();
    assert_eq!(result, vec![0, 0xAA, 0xBB]);
}

#[tokio::test]
async fn password_list_exposes_successful_entry_index() {
    let mut script = Vec::new();
    script.push(0x06);
    script.extend(identify_response(false));
    script.push(0x06); // Logon
    script.extend(ok_response(true));
    script.push(0x06); // Security attempt 1: device rejects
    script.extend(response_packet(false, 5, &[])); // ResponseCode::ERR
    script.push(0x06); // Security attempt 2: succeeds
    script.extend(ok_response(true));

    let mut config = base_config(Dialect::C1218);
    config.policy.issue_security_on_start_session = YesNo::Yes;
    config.credentials.password_list =
        vec![SecureBytes::new(vec![1; 4]), SecureBytes::new(vec![2; 4])];

    let channel = ScriptedChannel::new(script);
    let mut session = Session::new(channel, config);
    session.connect().await.unwrap();
    session.start_session().await.unwrap();

    assert_eq!(session.password_list_successful_entry(), Some(1));
}

fn des_encrypt(key: &[u8], block: [u8; 8]) -> [u8; 8] {
    use aead::generic_array::GenericArray;
    use cipher::{BlockEncryptMut, KeyInit};
    use des::Des;
    let mut buf = block;
    let mut cipher = ecb::Encryptor::<Des>::new(GenericArray::from_slice(key));
    cipher.encrypt_block_mut(GenericArray::from_mut_slice(&mut buf));
    buf
}

#[tokio::test]
async fn c1221_authenticate_certifies_with_des_key() {
    let key = [0x11u8; 8];
    let ticket = [0x22u8; 8];
    let encrypted_ticket = des_encrypt(&key, ticket);
    let response_ciphertext = des_encrypt(&key, encrypted_ticket);

    let mut identify_body = vec![1u8, 2, 0];
    identify_body.push(0x02); // auth_ser_ticket
    identify_body.push(0x01); // can authenticate
    identify_body.push(0x00); // DES
    identify_body.push(8);
    identify_body.extend_from_slice(&ticket);
    identify_body.push(0x00);

    let mut auth_response_body = vec![9u8, 0]; // len=9, key_id=0
    auth_response_body.extend_from_slice(&response_ciphertext);

    let mut script = Vec::new();
    script.push(0x06); // Identify
    script.extend(response_packet(false, 0, &identify_body));
    script.push(0x06); // Logon
    script.extend(ok_response(true));
    script.push(0x06); // Authenticate
    script.extend(response_packet(false, 0, &auth_response_body));

    let mut config = base_config(Dialect::C1221);
    config.policy.issue_security_on_start_session = YesNo::Yes;
    config.credentials.enable_authentication = YesNo::Yes;
    config.credentials.authentication_algorithm = Some(AuthAlgorithm::Des);
    config.credentials.authentication_key = Some(SecureBytes::new(key.to_vec()));

    let channel = ScriptedChannel::new(script);
    let mut session = Session::new(channel, config);
    session.connect().await.unwrap();
    session.start_session().await.unwrap();
    assert_eq!(session.authentication_key_list_successful_entry(), None);
}

fn aes_eax_transform(key: &[u8], block: &mut [u8; 16]) {
    use aead::{AeadInPlace, generic_array::GenericArray};
    use aes::Aes128;
    use eax::Eax;
    let cipher = Eax::<Aes128>::new(GenericArray::from_slice(key));
    cipher.encrypt_in_place_detached(GenericArray::from_slice(&[0u8; 16]), b"", block).unwrap();
}

#[tokio::test]
async fn c1221_authenticate_key_list_falls_back_to_second_aes_key() {
    let bad_key = [0x55u8; 16];
    let good_key = [0x66u8; 16];
    let ticket = [0x77u8; 16];

    let mut bad_ciphertext = ticket;
    aes_eax_transform(&bad_key, &mut bad_ciphertext);
    let mut bad_response = bad_ciphertext;
    // A mismatched key decrypts the response into something other than the
    // ticket, so authentication is rejected.
    bad_response[0] ^= 0xFF;

    let mut good_ciphertext = ticket;
    aes_eax_transform(&good_key, &mut good_ciphertext);
    let mut good_response = good_ciphertext;
    aes_eax_transform(&good_key, &mut good_response);

    let mut identify_body = vec![1u8, 2, 0];
    identify_body.push(0x02); // auth_ser_ticket
    identify_body.push(0x01); // can authenticate
    identify_body.push(0xFF); // AES
    identify_body.push(16);
    identify_body.extend_from_slice(&ticket);
    identify_body.push(0x00);

    // `authentication_key_id` is a single config value shared by every
    // entry in the key list; only the key material varies per attempt.
    let mut auth_fail_body = vec![0x11u8, 1]; // len=0x11, key_id=1
    auth_fail_body.extend_from_slice(&bad_response);

    let mut auth_ok_body = vec![0x11u8, 1]; // len=0x11, key_id=1
    auth_ok_body.extend_from_slice(&good_response);

    let mut script = Vec::new();
    script.push(0x06); // Identify
    script.extend(response_packet(false, 0, &identify_body));
    script.push(0x06); // Logon
    script.extend(ok_response(true));
    script.push(0x06); // Authenticate, key 0: rejected
    script.extend(response_packet(false, 0, &auth_fail_body));
    script.push(0x06); // Logoff
    script.extend(ok_response(true));
    script.push(0x06); // Terminate
    script.extend(ok_response(false));
    script.push(0x06); // Identify, retry
    script.extend(response_packet(false, 0, &identify_body));
    script.push(0x06); // Logon, retry
    script.extend(ok_response(true));
    script.push(0x06); // Authenticate, key 1: accepted
    script.extend(response_packet(false, 0, &auth_ok_body));

    let mut config = base_config(Dialect::C1221);
    config.policy.issue_security_on_start_session = YesNo::Yes;
    config.credentials.enable_authentication = YesNo::Yes;
    config.credentials.authentication_algorithm = Some(AuthAlgorithm::Aes);
    config.credentials.authentication_key_list =
        vec![SecureBytes::new(bad_key.to_vec()), SecureBytes::new(good_key.to_vec())];
    config.credentials.authentication_key_id = 1;

    let channel = ScriptedChannel::new(script);
    let mut session = Session::new(channel, config);
    session.connect().await.unwrap();
    session.start_session().await.unwrap();
    assert_eq!(session.authentication_key_list_successful_entry(), Some(1));
}

#[tokio::test]
async fn counters_record_two_link_successes_per_app_success() {
    let mut script = Vec::new();
    script.push(0x06); // ACK for Identify
    script.extend(identify_response(false));
    script.push(0x06); // ACK for Negotiate
    script.extend(response_packet(true, 0, &[0x04, 0x00, 0xFF])); // packet_size=1024, max_packets=255
    script.push(0x06); // ACK for Logon
    script.extend(ok_response(false));
    script.push(0x06); // ACK for ReadPartial
    script.extend(response_packet(true, 0, &[0xAA, 0xBB, 0xCC, 0xDD]));

    let mut config = base_config(Dialect::C1218);
    config.policy.issue_negotiate_on_start_session = YesNo::Yes;

    let channel = ScriptedChannel::new(script);
    let mut session = Session::new(channel, config);
    session.connect().await.unwrap();
    session.start_session().await.unwrap();
    session.read_table_partial(7, 0, 4).await.unwrap();

    assert_eq!(session.counters().app_succ.load(std::sync::atomic::Ordering::Relaxed), 4);
    assert_eq!(session.counters().link_succ.load(std::sync::atomic::Ordering::Relaxed), 8);
    assert_eq!(session.counters().app_retry.load(std::sync::atomic::Ordering::Relaxed), 0);
    assert_eq!(session.counters().link_retry.load(std::sync::atomic::Ordering::Relaxed), 0);
}

#[tokio::test]
async fn queue_worker_commits_connect_and_read_in_order() {
    let mut script = Vec::new();
    script.push(0x06);
    script.extend(response_packet(false, 0, &[0xAA]));

    let channel = ScriptedChannel::new(script);
    let session = Arc::new(Mutex::new(Session::new(channel, base_config(Dialect::C1218))));
    let worker = Worker::new(Arc::clone(&session));

    worker.add(CommandRecord::connect()).await;
    worker.add(CommandRecord::read(9, 1)).await;
    worker.commit(false).await.unwrap();

    let data = worker.get_table_data(9, 1).await.unwrap();
    assert_eq!(data, vec![0xAA]);
}
