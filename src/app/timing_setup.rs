// SPDX-License-Identifier: AGPL-3.0-or-later

//! `TimingSetup` (0x71), C12.21 only (spec §4.3 table). Request/response:
//! `channelTO(s) | intercharTO(s) | ackTO(s) | linkRetries`, each timeout
//! rounded up from milliseconds to whole seconds and capped at 255.

use std::time::Duration;

use crate::{app::cmd, channel::Channel, error::C12Error, link::ToggleState, primitives::byteio::{ByteReader, ByteWriter}};

use super::Dispatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingView {
    pub channel_traffic_timeout: Duration,
    pub intercharacter_timeout: Duration,
    pub acknowledgement_timeout: Duration,
    pub link_layer_retries: u8,
}

/// Rounds a millisecond duration up to whole seconds, saturating at 255
/// (spec §4.3 table; the wire field is one byte of seconds).
fn millis_to_seconds_byte(d: Duration) -> u8 {
    let millis = d.as_millis();
    if millis == 0 {
        return 0;
    }
    let seconds = millis.div_ceil(1000);
    seconds.min(255) as u8
}

pub async fn timing_setup<C: Channel>(
    dispatcher: &Dispatcher<'_, C>,
    toggle: &mut ToggleState,
    channel_traffic_timeout: Duration,
    intercharacter_timeout: Duration,
    acknowledgement_timeout: Duration,
    link_layer_retries: u8,
) -> Result<TimingView, C12Error> {
    let mut w = ByteWriter::with_capacity(4);
    w.put_u8(millis_to_seconds_byte(channel_traffic_timeout))
        .put_u8(millis_to_seconds_byte(intercharacter_timeout))
        .put_u8(millis_to_seconds_byte(acknowledgement_timeout))
        .put_u8(link_layer_retries);

    let (_status, data) = dispatcher
        .request(cmd::TIMING_SETUP, &w.into_vec(), toggle, false, false, false)
        .await?;

    let mut r = ByteReader::new(&data);
    Ok(TimingView {
        channel_traffic_timeout: Duration::from_secs(r.read_u8()? as u64),
        intercharacter_timeout: Duration::from_secs(r.read_u8()? as u64),
        acknowledgement_timeout: Duration::from_secs(r.read_u8()? as u64),
        link_layer_retries: r.read_u8()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up_to_whole_seconds() {
        assert_eq!(millis_to_seconds_byte(Duration::from_millis(1500)), 2);
        assert_eq!(millis_to_seconds_byte(Duration::from_millis(1000)), 1);
        assert_eq!(millis_to_seconds_byte(Duration::from_millis(0)), 0);
    }

    #[test]
    fn saturates_at_255_seconds() {
        assert_eq!(millis_to_seconds_byte(Duration::from_secs(1_000)), 255);
    }
}
