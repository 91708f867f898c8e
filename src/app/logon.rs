// SPDX-License-Identifier: AGPL-3.0-or-later

//! `Logon` (0x50): the session user identity handshake, same opcode under
//! both dialects (spec §4.3 table lists it as "(dialect)" because only
//! `Security`/`Authenticate`'s choice of cipher differs, not `Logon`
//! itself). Request: `UserId(2 BE) | UserNameLength(1) | UserName`.

use crate::{channel::Channel, error::C12Error, link::ToggleState, primitives::byteio::ByteWriter};

use super::Dispatcher;

pub const LOGON_CMD: u8 = 0x50;

pub async fn logon<C: Channel>(
    dispatcher: &Dispatcher<'_, C>,
    toggle: &mut ToggleState,
    user_id: u16,
    user_name: &str,
) -> Result<(), C12Error> {
    let name_bytes = user_name.as_bytes();
    if name_bytes.len() > u8::MAX as usize {
        return Err(C12Error::Software("user name too long for Logon".to_string()));
    }
    let mut w = ByteWriter::with_capacity(3 + name_bytes.len());
    w.put_u16(user_id).put_u8(name_bytes.len() as u8).put_bytes(name_bytes);

    dispatcher
        .request(LOGON_CMD, &w.into_vec(), toggle, false, false, false)
        .await?;
    Ok(())
}
