// SPDX-License-Identifier: AGPL-3.0-or-later

//! Procedure execution: full-write of `ST_007` (procedure initiate)
//! followed by full-read of `ST_008` (procedure response), with the
//! "accepted but not fully completed" retry policy (spec §4.3 "Procedure
//! execution").

use crate::{
    app::{table, ST_007_PROCEDURE_INITIATE, ST_008_PROCEDURE_RESPONSE},
    channel::Channel,
    error::C12Error,
    link::ToggleState,
};

use super::Dispatcher;

/// `ST_008` result-code byte, first byte of the procedure response body.
const PROCEDURE_COMPLETED_OK: u8 = 0;
const PROCEDURE_ACCEPTED_NOT_FULLY_COMPLETED: u8 = 1;

/// Executes a procedure: `procedure_number` and `sequence_counter` frame
/// the `ST_007` body ahead of caller-supplied `parameters`.
pub async fn execute<C: Channel>(
    dispatcher: &Dispatcher<'_, C>,
    toggle: &mut ToggleState,
    procedure_number: u16,
    sequence_counter: u8,
    parameters: &[u8],
) -> Result<Vec<u8>, C12Error> {
    let mut request = Vec::with_capacity(2 + 1 + parameters.len());
    request.extend_from_slice(&procedure_number.to_be_bytes());
    request.push(sequence_counter);
    request.extend_from_slice(parameters);

    table::full_write_procedure_initiate(dispatcher, toggle, ST_007_PROCEDURE_INITIATE, &request)
        .await?;

    let retries = dispatcher.config.retries.application_layer_procedure_retries;
    let sleep_between = dispatcher.config.retries.application_layer_procedure_sleep_between_retries;

    for attempt in 0..=retries {
        let response = table::full_read(dispatcher, toggle, ST_008_PROCEDURE_RESPONSE).await?;
        match response.first().copied() {
            Some(PROCEDURE_COMPLETED_OK) => return Ok(response),
            Some(PROCEDURE_ACCEPTED_NOT_FULLY_COMPLETED) => {
                if attempt == retries {
                    return Err(C12Error::Meter(
                        "procedure accepted but not completed after retry budget".to_string(),
                    ));
                }
                tokio::time::sleep(sleep_between).await;
                continue;
            },
            Some(other) => {
                return Err(C12Error::Meter(format!("procedure failed with result code {other}")));
            },
            None => return Err(C12Error::InboundPacketDataLengthBad),
        }
    }

    unreachable!("loop always returns on its last iteration")
}
