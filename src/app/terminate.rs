// SPDX-License-Identifier: AGPL-3.0-or-later

//! `Terminate` (0x21) / `Logoff` (0x22): no body, no data response (spec
//! §4.3 "Service encodings").

use crate::{app::cmd, channel::Channel, error::C12Error, link::ToggleState};

use super::Dispatcher;

pub async fn terminate<C: Channel>(
    dispatcher: &Dispatcher<'_, C>,
    toggle: &mut ToggleState,
) -> Result<(), C12Error> {
    dispatcher.request(cmd::TERMINATE, &[], toggle, false, false, false).await?;
    Ok(())
}

pub async fn logoff<C: Channel>(
    dispatcher: &Dispatcher<'_, C>,
    toggle: &mut ToggleState,
) -> Result<(), C12Error> {
    dispatcher.request(cmd::LOGOFF, &[], toggle, false, false, false).await?;
    Ok(())
}
