// SPDX-License-Identifier: AGPL-3.0-or-later

//! Table read/write services (spec §4.3 "Service encodings"): full-read
//! (0x30), partial-read (0x3F), full-write (0x40), partial-write (0x4F).
//! Write checksums are a one-byte sum-complement over the data, the
//! common C12 convention.

use crate::{
    app::cmd,
    channel::Channel,
    error::C12Error,
    link::ToggleState,
    primitives::byteio::ByteWriter,
};

use super::Dispatcher;

fn checksum(data: &[u8]) -> u8 {
    !data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

pub async fn full_read<C: Channel>(
    dispatcher: &Dispatcher<'_, C>,
    toggle: &mut ToggleState,
    table_number: u16,
) -> Result<Vec<u8>, C12Error> {
    let mut w = ByteWriter::with_capacity(2);
    w.put_u16(table_number);
    let (_status, data) = dispatcher
        .request(cmd::FULL_READ, &w.into_vec(), toggle, false, false, false)
        .await?;
    Ok(data)
}

pub async fn partial_read<C: Channel>(
    dispatcher: &Dispatcher<'_, C>,
    toggle: &mut ToggleState,
    table_number: u16,
    offset: u32,
    size: u16,
) -> Result<Vec<u8>, C12Error> {
    let mut w = ByteWriter::with_capacity(7);
    w.put_u16(table_number).put_u24(offset).put_u16(size);
    let (_status, data) = dispatcher
        .request(cmd::PARTIAL_READ, &w.into_vec(), toggle, false, false, false)
        .await?;
    Ok(data)
}

pub async fn full_write<C: Channel>(
    dispatcher: &Dispatcher<'_, C>,
    toggle: &mut ToggleState,
    table_number: u16,
    data: &[u8],
) -> Result<(), C12Error> {
    full_write_inner(dispatcher, toggle, table_number, data, false).await
}

/// Like [`full_write`], but flags the request as a procedure-initiate
/// write (`ST_007`) so the dispatcher inflates its effective link-layer
/// retry budget to cover `ProcedureInitiateTimeout` (spec §4.3 step 1).
pub async fn full_write_procedure_initiate<C: Channel>(
    dispatcher: &Dispatcher<'_, C>,
    toggle: &mut ToggleState,
    table_number: u16,
    data: &[u8],
) -> Result<(), C12Error> {
    full_write_inner(dispatcher, toggle, table_number, data, true).await
}

async fn full_write_inner<C: Channel>(
    dispatcher: &Dispatcher<'_, C>,
    toggle: &mut ToggleState,
    table_number: u16,
    data: &[u8],
    is_procedure_initiate: bool,
) -> Result<(), C12Error> {
    let mut w = ByteWriter::with_capacity(4 + data.len());
    w.put_u16(table_number).put_u16(data.len() as u16).put_bytes(data).put_u8(checksum(data));
    dispatcher
        .request(cmd::FULL_WRITE, &w.into_vec(), toggle, false, is_procedure_initiate, false)
        .await?;
    Ok(())
}

pub async fn partial_write<C: Channel>(
    dispatcher: &Dispatcher<'_, C>,
    toggle: &mut ToggleState,
    table_number: u16,
    offset: u32,
    data: &[u8],
) -> Result<(), C12Error> {
    let mut w = ByteWriter::with_capacity(7 + data.len());
    w.put_u16(table_number)
        .put_u24(offset)
        .put_u16(data.len() as u16)
        .put_bytes(data)
        .put_u8(checksum(data));
    dispatcher
        .request(cmd::PARTIAL_WRITE, &w.into_vec(), toggle, false, false, false)
        .await?;
    Ok(())
}
