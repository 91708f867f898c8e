// SPDX-License-Identifier: AGPL-3.0-or-later

//! `DoApplicationLayerRequest` retry orchestration (spec §4.3): retry an
//! inner send/receive step a bounded number of times, reacting to a small
//! outcome enum, generalized to any C12 service request/response.

use std::{sync::atomic::Ordering, time::Duration};

use crate::{
    cfg::config::ProtocolConfig,
    channel::Channel,
    counters::Counters,
    error::{C12Error, ResponseCode},
    link::{LinkLayer, LinkOutcome, ToggleState},
};

/// Sleep bound after a link layer "retry whole application layer" signal
/// (spec §4.3 step 1.1).
const MAXIMUM_BAD_TOGGLE_BIT_SLEEP: Duration = Duration::from_millis(1_500);

/// Drives one request/response exchange through the link layer with the
/// app-layer retry policy (spec §4.3).
pub struct Dispatcher<'a, C: Channel> {
    pub channel: &'a C,
    pub config: &'a ProtocolConfig,
    pub negotiated_packet_size: u16,
    pub counters: &'a Counters,
}

impl<'a, C: Channel> Dispatcher<'a, C> {
    pub fn new(
        channel: &'a C,
        config: &'a ProtocolConfig,
        negotiated_packet_size: u16,
        counters: &'a Counters,
    ) -> Self {
        Self { channel, config, negotiated_packet_size, counters }
    }

    /// Sends `command | body` and returns `(status, data)` with `data`
    /// positioned after the STATUS byte. `is_identify` relaxes the
    /// first-response-length rule; `is_procedure_initiate` inflates the
    /// effective link-layer retry count so that the retry budget covers
    /// `ProcedureInitiateTimeout` (used for the ST_007 write).
    pub async fn request(
        &self,
        command: u8,
        body: &[u8],
        toggle: &mut ToggleState,
        is_identify: bool,
        is_procedure_initiate: bool,
        remap_err_to_security: bool,
    ) -> Result<(u8, Vec<u8>), C12Error> {
        let mut message = Vec::with_capacity(1 + body.len());
        message.push(command);
        message.extend_from_slice(body);

        let timing = &self.config.timing;
        let ack_timeout_millis = timing.acknowledgement_timeout.as_millis() as u64;
        let link_retries = self.effective_link_retries(is_procedure_initiate, ack_timeout_millis);
        let both_data_format_one = self.config.identity.data_format as u8 == 1;

        let app_retries = self.config.retries.application_layer_retries;

        for app_attempt in 0..=app_retries {
            let received = self
                .run_link_layer_exchange(
                    &message,
                    toggle,
                    link_retries,
                    ack_timeout_millis,
                    both_data_format_one,
                    is_identify,
                )
                .await;

            let (status, data) = match received {
                Ok(pair) => pair,
                Err(e) => return Err(e),
            };

            let code = ResponseCode(status);
            if code.is_ok() {
                self.counters.app_succ.fetch_add(1, Ordering::Relaxed);
                return Ok((status, data));
            }

            if code.is_retryable_at_app_layer() {
                if app_attempt == app_retries {
                    self.counters.app_fail.fetch_add(1, Ordering::Relaxed);
                    return Err(C12Error::C12NokResponse { code, extra: data });
                }
                self.counters.app_retry.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(
                    self.config.retries.application_layer_procedure_sleep_between_retries,
                )
                .await;
                continue;
            }

            self.counters.app_fail.fetch_add(1, Ordering::Relaxed);
            if remap_err_to_security && code == ResponseCode::ERR {
                toggle.reset();
                return Err(C12Error::Security(format!("authenticate failed: {code}")));
            }

            return Err(C12Error::C12NokResponse { code, extra: data });
        }

        unreachable!("loop always returns on its last iteration")
    }

    fn effective_link_retries(&self, is_procedure_initiate: bool, ack_timeout_millis: u64) -> u8 {
        let base = self.config.timing.link_layer_retries;
        if !is_procedure_initiate || ack_timeout_millis == 0 {
            return base;
        }
        let procedure_timeout_millis =
            self.config.retries.procedure_initiate_timeout.as_millis() as u64;
        let needed = procedure_timeout_millis.div_ceil(ack_timeout_millis);
        base.max(needed.min(u8::MAX as u64) as u8)
    }

    async fn run_link_layer_exchange(
        &self,
        message: &[u8],
        toggle: &mut ToggleState,
        link_retries: u8,
        ack_timeout_millis: u64,
        both_data_format_one: bool,
        is_identify: bool,
    ) -> Result<(u8, Vec<u8>), C12Error> {
        let mut attempt = 0u8;
        loop {
            let transmit_outcome = LinkLayer::transmit(
                self.channel,
                toggle,
                message,
                self.negotiated_packet_size,
                link_retries,
                ack_timeout_millis,
                both_data_format_one,
                self.counters,
            )
            .await?;

            if transmit_outcome == LinkOutcome::ShadowedByUnexpectedPacket {
                attempt += 1;
                if attempt > link_retries {
                    self.counters.link_fail.fetch_add(1, Ordering::Relaxed);
                    return Err(C12Error::ReceivedPacketToggleBitFailure);
                }
                continue;
            }

            let intercharacter_timeout_millis =
                self.config.timing.intercharacter_timeout.as_millis() as u64;
            match LinkLayer::receive(
                self.channel,
                toggle,
                self.negotiated_packet_size,
                ack_timeout_millis,
                intercharacter_timeout_millis,
                self.config.policy.check_incoming_toggle_bit.as_bool(),
                is_identify,
                link_retries,
                self.counters,
            )
            .await
            {
                Ok(pair) => return Ok(pair),
                Err(C12Error::ReceivedPacketToggleBitFailure) => {
                    toggle.incoming = false;
                    toggle.last_incoming_crc = None;
                    tokio::time::sleep(MAXIMUM_BAD_TOGGLE_BIT_SLEEP).await;
                    attempt += 1;
                    if attempt > link_retries {
                        self.counters.app_fail.fetch_add(1, Ordering::Relaxed);
                        return Err(C12Error::ReceivedPacketToggleBitFailure);
                    }
                    self.counters.app_retry.fetch_add(1, Ordering::Relaxed);
                    continue;
                },
                Err(e @ C12Error::CrcCheckFailed) | Err(e @ C12Error::InboundPacketDataLengthBad) => {
                    attempt += 1;
                    if attempt > link_retries {
                        self.counters.link_fail.fetch_add(1, Ordering::Relaxed);
                        return Err(e);
                    }
                    self.counters.link_retry.fetch_add(1, Ordering::Relaxed);
                    continue;
                },
                Err(e) => return Err(e),
            }
        }
    }
}
