// SPDX-License-Identifier: AGPL-3.0-or-later

//! Link-layer transmit/receive state machine (spec §4.2): a
//! frame-then-dispatch read loop, adapted to C12's single-byte-at-a-time
//! header scan driven by the intercharacter timeout rather than a
//! length-prefixed stream.

use std::{sync::atomic::Ordering, time::Duration};

use crate::{
    channel::Channel,
    counters::Counters,
    error::C12Error,
    link::{
        crc::crc16,
        packet::{ACK, CtrlByte, NAK, Packet, STP},
    },
};

/// Sleep bound while draining a bad-length inbound packet (spec §4.2 step 3).
const MAXIMUM_BAD_PACKET_LENGTH_SLEEP: Duration = Duration::from_millis(1_000);

/// Per-direction toggle/duplicate-detection state, owned by the caller
/// (typically one per session) and threaded through every transmit/receive
/// call (spec §3 "Session state"; cleared on `Connect`).
#[derive(Debug, Clone, Copy, Default)]
pub struct ToggleState {
    pub outgoing: bool,
    pub incoming: bool,
    pub last_incoming_crc: Option<u16>,
}

impl ToggleState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Result of a transmit pass (spec §4.2 step 3): whether a shadow packet
/// (`0xEE` seen instead of ACK/NAK) invalidated the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Written,
    ShadowedByUnexpectedPacket,
}

/// Stateless-ish driver around a [`Channel`]; all mutable link state lives
/// in the caller-owned [`ToggleState`] so one `LinkLayer` can serve
/// concurrent sessions if ever needed (it currently is not; spec §5 keeps
/// one service in flight per protocol instance).
pub struct LinkLayer;

impl LinkLayer {
    /// Transmits `message` (`COMMAND | BODY` or a raw request), segmenting
    /// per `packet_size` (spec §4.2 steps 1-3).
    pub async fn transmit<C: Channel>(
        channel: &C,
        toggle: &mut ToggleState,
        message: &[u8],
        packet_size: u16,
        link_layer_retries: u8,
        ack_timeout_millis: u64,
        both_sides_data_format_one: bool,
        counters: &Counters,
    ) -> Result<LinkOutcome, C12Error> {
        let chunk = (packet_size as usize).saturating_sub(8).max(1);
        let num_packets = message.len().div_ceil(chunk).max(1);

        if both_sides_data_format_one && message.len() > chunk {
            return Err(C12Error::Meter(
                "operation not possible: message exceeds single C12.22 packet".to_string(),
            ));
        }

        let mut shadowed = false;

        for i in 0..num_packets {
            let start = i * chunk;
            let end = (start + chunk).min(message.len());
            let segment = &message[start..end];

            let ctrl = if num_packets == 1 {
                CtrlByte::single_packet(both_sides_data_format_one)
            } else if i == 0 {
                CtrlByte::multipacket_first()
            } else {
                CtrlByte::multipacket_rest()
            }
            .with_toggle(toggle.outgoing);

            let packet = Packet { identity: 0, ctrl, seq: (num_packets - 1 - i) as u8, payload: segment.to_vec() };

            let mut attempt = 0u8;
            loop {
                channel.write_buffer(&packet.to_bytes()).await?;
                channel.flush_output_buffer(0).await?;

                if !both_sides_data_format_one {
                    match Self::await_ack(channel, ack_timeout_millis).await? {
                        AckWait::Ack => break,
                        AckWait::Nak => {
                            attempt += 1;
                            if attempt > link_layer_retries {
                                counters.link_fail.fetch_add(1, Ordering::Relaxed);
                                return Err(C12Error::ReceivedPacketToggleBitFailure);
                            }
                            counters.link_retry.fetch_add(1, Ordering::Relaxed);
                            continue;
                        },
                        AckWait::ShadowPacket => {
                            Self::drain_shadow_packet(channel, ack_timeout_millis).await?;
                            channel.write_buffer(&[ACK]).await?;
                            shadowed = true;
                            attempt += 1;
                            if attempt > link_layer_retries {
                                counters.link_fail.fetch_add(1, Ordering::Relaxed);
                                return Err(C12Error::ReceivedPacketToggleBitFailure);
                            }
                            counters.link_retry.fetch_add(1, Ordering::Relaxed);
                            continue;
                        },
                    }
                } else {
                    break;
                }
            }

            toggle.outgoing = !toggle.outgoing;
        }

        counters.link_succ.fetch_add(1, Ordering::Relaxed);
        if shadowed {
            Ok(LinkOutcome::ShadowedByUnexpectedPacket)
        } else {
            Ok(LinkOutcome::Written)
        }
    }

    async fn await_ack<C: Channel>(
        channel: &C,
        ack_timeout_millis: u64,
    ) -> Result<AckWait, C12Error> {
        let byte = channel
            .do_read_cancellable(1, ack_timeout_millis, false)
            .await?;
        match byte.first() {
            Some(&ACK) => Ok(AckWait::Ack),
            Some(&NAK) => Ok(AckWait::Nak),
            Some(&STP) => Ok(AckWait::ShadowPacket),
            _ => Err(C12Error::ChannelReadTimeout),
        }
    }

    /// Reads and discards one full packet following an unexpected `0xEE`
    /// seen while waiting for ACK/NAK (spec §4.2 step 2, "drain the shadow
    /// packet").
    async fn drain_shadow_packet<C: Channel>(
        channel: &C,
        ack_timeout_millis: u64,
    ) -> Result<(), C12Error> {
        let header = channel.read_buffer(5).await?;
        let header: [u8; 5] = header.try_into().map_err(|_| C12Error::InboundPacketDataLengthBad)?;
        let len = Packet::parse_len(&header).unwrap_or(0);
        if len > 0 {
            let _ = channel.do_read_cancellable(len + 2, ack_timeout_millis, false).await;
        }
        Ok(())
    }

    /// Reads one full (possibly multipacket) application message (spec
    /// §4.2 inbound receive, steps 1-9). `is_identify` relaxes the
    /// minimum-first-response-length rule per spec §4.2 "Special case for
    /// Identify". `link_retries` bounds how many duplicate packets in a
    /// row are ACKed-and-skipped before giving up (spec §4.2 step 1.1).
    pub async fn receive<C: Channel>(
        channel: &C,
        toggle: &mut ToggleState,
        packet_size: u16,
        ack_timeout_millis: u64,
        intercharacter_timeout_millis: u64,
        check_incoming_toggle: bool,
        is_identify: bool,
        link_retries: u8,
        counters: &Counters,
    ) -> Result<(u8, Vec<u8>), C12Error> {
        let mut message = Vec::new();
        let mut status = 0u8;
        let mut first_segment = true;
        let mut expected_seq: Option<u8> = None;
        let mut retry_whole_application_layer = false;
        let mut duplicate_attempt = 0u8;

        loop {
            let start = channel.do_read_cancellable(1, ack_timeout_millis, false).await?;
            match start.first() {
                Some(&STP) => {},
                _ => return Err(C12Error::ChannelReadTimeout),
            }

            let header = {
                let _savior = channel.state().intercharacter_timeout_savior(intercharacter_timeout_millis);
                channel.read_buffer(5).await?
            };
            let header: [u8; 5] = header
                .try_into()
                .map_err(|_| C12Error::InboundPacketDataLengthBad)?;

            let len = match Packet::parse_len(&header) {
                Ok(len) if (len + 8) <= packet_size as usize => len,
                _ => {
                    channel.sleep(MAXIMUM_BAD_PACKET_LENGTH_SLEEP.as_millis() as u64).await.ok();
                    channel.clear_input_buffer().await;
                    return Err(C12Error::InboundPacketDataLengthBad);
                },
            };

            let payload_and_crc = channel.read_buffer(len + 2).await?;
            let packet = match Packet::parse(&header, &payload_and_crc) {
                Ok(p) => p,
                Err(C12Error::CrcCheckFailed) => {
                    channel.sleep(200).await.ok();
                    channel.write_buffer(&[NAK]).await?;
                    return Err(C12Error::CrcCheckFailed);
                },
                Err(e) => return Err(e),
            };

            let packet_crc = crc16(&payload_and_crc);
            let seen_before = toggle.last_incoming_crc.is_some();
            let is_duplicate = check_incoming_toggle
                && seen_before
                && packet.ctrl.toggle == toggle.incoming
                && toggle.last_incoming_crc == Some(packet_crc);
            let is_out_of_sequence = check_incoming_toggle
                && seen_before
                && packet.ctrl.toggle == toggle.incoming
                && toggle.last_incoming_crc != Some(packet_crc);

            if is_duplicate {
                duplicate_attempt += 1;
                if duplicate_attempt > link_retries {
                    counters.link_fail.fetch_add(1, Ordering::Relaxed);
                    return Err(C12Error::ReceivedPacketToggleBitFailure);
                }
                counters.link_retry.fetch_add(1, Ordering::Relaxed);
                if packet.ctrl.data_format == 0 {
                    channel.write_buffer(&[ACK]).await?;
                }
                continue;
            }
            if is_out_of_sequence {
                retry_whole_application_layer = true;
            } else {
                toggle.incoming = packet.ctrl.toggle;
                toggle.last_incoming_crc = Some(packet_crc);
            }

            let send_ack = packet.ctrl.data_format == 0;
            if send_ack {
                channel.write_buffer(&[ACK]).await?;
            }

            if packet.ctrl.multi {
                match expected_seq {
                    None => {
                        if !packet.ctrl.first {
                            retry_whole_application_layer = true;
                        }
                    },
                    Some(expected) if packet.seq != expected => {
                        retry_whole_application_layer = true;
                    },
                    _ => {},
                }
                expected_seq = Some(packet.seq.wrapping_sub(1));
            }

            let mut body = packet.payload.as_slice();
            if first_segment {
                if is_identify && body.len() < 3 {
                    return Err(C12Error::InboundPacketDataLengthBad);
                }
                if let Some((&s, rest)) = body.split_first() {
                    status = s;
                    body = rest;
                }
                first_segment = false;
            }
            message.extend_from_slice(body);

            if !packet.ctrl.multi || packet.seq == 0 {
                break;
            }
        }

        if retry_whole_application_layer {
            return Err(C12Error::ReceivedPacketToggleBitFailure);
        }

        counters.link_succ.fetch_add(1, Ordering::Relaxed);
        Ok((status, message))
    }
}

enum AckWait {
    Ack,
    Nak,
    ShadowPacket,
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::channel::ChannelState;

    struct LoopbackChannel {
        state: ChannelState,
        inbound: Mutex<std::collections::VecDeque<u8>>,
        outbound: Mutex<Vec<u8>>,
    }

    impl LoopbackChannel {
        fn new(inbound: Vec<u8>) -> Self {
            Self {
                state: ChannelState::default(),
                inbound: Mutex::new(inbound.into()),
                outbound: Mutex::new(Vec::new()),
            }
        }
    }

    impl Channel for LoopbackChannel {
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

    #[tokio::test]
    async fn transmit_single_packet_succeeds_on_ack() {
        let channel = LoopbackChannel::new(vec![ACK]);
        let mut toggle = ToggleState::default();
        let counters = Counters::new();
        let outcome =
            LinkLayer::transmit(&channel, &mut toggle, &[0x20], 1024, 3, 1_000, false, &counters)
                .await
                .unwrap();
        assert_eq!(outcome, LinkOutcome::Written);
        assert!(toggle.outgoing);
        assert_eq!(counters.link_succ.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn transmit_retries_on_nak_then_succeeds() {
        let channel = LoopbackChannel::new(vec![NAK, ACK]);
        let mut toggle = ToggleState::default();
        let counters = Counters::new();
        let outcome =
            LinkLayer::transmit(&channel, &mut toggle, &[0x20], 1024, 3, 1_000, false, &counters)
                .await
                .unwrap();
        assert_eq!(outcome, LinkOutcome::Written);
        let sent_packets =
            channel.outbound.lock().unwrap().iter().filter(|&&b| b == STP).count();
        assert_eq!(sent_packets, 2);
    }

    #[tokio::test]
    async fn receive_single_packet_round_trips_status_and_payload() {
        let packet = Packet {
            identity: 0,
            ctrl: CtrlByte::single_packet(false),
            seq: 0,
            payload: vec![0x00, 0xAB, 0xCD],
        };
        let channel = LoopbackChannel::new(packet.to_bytes());
        let mut toggle = ToggleState::default();
        let counters = Counters::new();
        let (status, body) =
            LinkLayer::receive(&channel, &mut toggle, 1024, 1_000, 50, true, false, 3, &counters)
                .await
                .unwrap();
        assert_eq!(status, 0x00);
        assert_eq!(body, vec![0xAB, 0xCD]);
        assert_eq!(counters.link_succ.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn receive_rejects_zero_length_packet() {
        let mut bad = vec![STP, 0x00, 0x00, 0x00, 0x00, 0x00];
        let crc = crc16(&bad);
        bad.extend_from_slice(&crc.to_le_bytes());
        let channel = LoopbackChannel::new(bad);
        let mut toggle = ToggleState::default();
        let counters = Counters::new();
        let result =
            LinkLayer::receive(&channel, &mut toggle, 1024, 1_000, 50, true, false, 3, &counters)
                .await;
        assert!(matches!(result, Err(C12Error::InboundPacketDataLengthBad)));
    }

    #[tokio::test]
    async fn receive_gives_up_after_link_retries_duplicates_exhausted() {
        let packet = Packet {
            identity: 0,
            ctrl: CtrlByte::single_packet(false),
            seq: 0,
            payload: vec![0x00, 0xAB],
        };
        let mut inbound = packet.to_bytes();
        for _ in 0..3 {
            inbound.extend(packet.to_bytes());
        }
        let channel = LoopbackChannel::new(inbound);
        let mut toggle = ToggleState::default();
        let counters = Counters::new();

        // Baseline packet establishes `last_incoming_crc`; the three
        // retransmissions that follow are all duplicates of it.
        LinkLayer::receive(&channel, &mut toggle, 1024, 1_000, 50, true, false, 2, &counters)
            .await
            .unwrap();
        let result =
            LinkLayer::receive(&channel, &mut toggle, 1024, 1_000, 50, true, false, 2, &counters)
                .await;
        assert!(matches!(result, Err(C12Error::ReceivedPacketToggleBitFailure)));
        assert_eq!(counters.link_fail.load(Ordering::Relaxed), 1);
    }
}
