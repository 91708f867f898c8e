// SPDX-License-Identifier: AGPL-3.0-or-later

//! `Negotiate`: 0x60 (no baud) / 0x61 (with baud) (spec §4.3 "Service
//! encodings", "Baud index table").

use crate::{
    app::cmd,
    cfg::enums::BaudIndex,
    channel::Channel,
    error::C12Error,
    link::ToggleState,
    primitives::byteio::{ByteReader, ByteWriter},
};

use super::Dispatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedView {
    pub packet_size: u16,
    pub maximum_number_of_packets: u8,
    pub session_baud: Option<u32>,
}

pub async fn negotiate<C: Channel>(
    dispatcher: &Dispatcher<'_, C>,
    toggle: &mut ToggleState,
    packet_size: u16,
    maximum_number_of_packets: u8,
    session_baud: Option<u32>,
) -> Result<NegotiatedView, C12Error> {
    let mut w = ByteWriter::new();
    w.put_u16(packet_size).put_u8(maximum_number_of_packets);

    let (command, baud_index) = match session_baud {
        None => (cmd::NEGOTIATE_NO_BAUD, None),
        Some(baud) => {
            let ix = BaudIndex::from_baud(baud)
                .ok_or_else(|| C12Error::Software(format!("unsupported session baud {baud}")))?;
            w.put_u8(ix.0);
            (cmd::NEGOTIATE_WITH_BAUD, Some(ix))
        },
    };

    let (_status, data) = dispatcher
        .request(command, &w.into_vec(), toggle, false, false, false)
        .await?;

    let mut r = ByteReader::new(&data);
    let negotiated_packet_size = r.read_u16()?;
    let negotiated_max_packets = r.read_u8()?;
    let negotiated_baud = if baud_index.is_some() {
        let ix = BaudIndex(r.read_u8()?);
        Some(ix.to_baud().ok_or(C12Error::Meter("invalid baud index reported by meter".to_string()))?)
    } else {
        None
    };

    Ok(NegotiatedView {
        packet_size: negotiated_packet_size,
        maximum_number_of_packets: negotiated_max_packets,
        session_baud: negotiated_baud,
    })
}
