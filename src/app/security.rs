// SPDX-License-Identifier: AGPL-3.0-or-later

//! `Security` (0x51): password-based session security, sent space-padded
//! to `MaximumPasswordLength` (spec §3 "Protocol configuration",
//! §4.3 table).

use crate::{channel::Channel, error::C12Error, link::ToggleState, primitives::secure_bytes::SecureBytes};

use super::Dispatcher;

pub const SECURITY_CMD: u8 = 0x51;

pub async fn security<C: Channel>(
    dispatcher: &Dispatcher<'_, C>,
    toggle: &mut ToggleState,
    password: &SecureBytes,
    maximum_password_length: usize,
) -> Result<(), C12Error> {
    if password.len() > maximum_password_length {
        return Err(C12Error::Software(format!(
            "password exceeds MaximumPasswordLength ({maximum_password_length})"
        )));
    }
    let mut padded = password.as_slice().to_vec();
    padded.resize(maximum_password_length, b' ');

    dispatcher
        .request(SECURITY_CMD, &padded, toggle, false, false, false)
        .await?;
    Ok(())
}
