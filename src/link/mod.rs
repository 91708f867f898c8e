// SPDX-License-Identifier: AGPL-3.0-or-later

//! The C12.18/C12.21 link layer (spec §4.2 "Link layer (C4)"): packet
//! framing, CRC-16, toggle bit, ACK/NAK handshake, multipacket
//! segmentation/reassembly, duplicate detection.

pub mod crc;
pub mod engine;
pub mod packet;

pub use engine::{LinkLayer, LinkOutcome, ToggleState};
pub use packet::{AckNak, CtrlByte, Packet};
