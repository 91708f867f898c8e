// SPDX-License-Identifier: AGPL-3.0-or-later

//! Ordered credential retry shared by `Logon`/`Security`'s password list
//! and `Authenticate`'s authentication-key list (spec §4.4 "Password
//! list"). Stops at the first success and exposes its 0-based index.
//! Errors other than security failures propagate immediately: any
//! non-last-entry `C12NokResponse`/`Security` error is swallowed and the
//! next entry is tried, while everything else (timeouts, cancellation,
//! disconnect) unwinds straight away.

use std::future::Future;

use crate::error::C12Error;

fn is_security_failure(e: &C12Error) -> bool {
    matches!(e, C12Error::Security(_) | C12Error::C12NokResponse { .. })
}

/// Tries each entry of `entries` in order via `attempt`, returning the
/// 0-based index of the first one that succeeds.
pub async fn try_each<T, F, Fut>(entries: &[T], mut attempt: F) -> Result<usize, C12Error>
where
    F: FnMut(usize, &T) -> Fut,
    Fut: Future<Output = Result<(), C12Error>>,
{
    if entries.is_empty() {
        return Err(C12Error::Software("credential list is empty".to_string()));
    }
    let last = entries.len() - 1;
    for (i, entry) in entries.iter().enumerate() {
        match attempt(i, entry).await {
            Ok(()) => return Ok(i),
            Err(e) if is_security_failure(&e) && i != last => continue,
            Err(e) => return Err(e),
        }
    }
    unreachable!("loop always returns on its last iteration")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResponseCode;

    #[tokio::test]
    async fn stops_at_first_success() {
        let entries = vec![1u8, 2, 3];
        let ix = try_each(&entries, |i, _| async move {
            if i == 1 {
                Ok(())
            } else {
                Err(C12Error::C12NokResponse { code: ResponseCode::ERR, extra: vec![] })
            }
        })
        .await
        .unwrap();
        assert_eq!(ix, 1);
    }

    #[tokio::test]
    async fn propagates_non_security_error_immediately() {
        let entries = vec![1u8, 2, 3];
        let result = try_each(&entries, |_, _| async move { Err(C12Error::ChannelReadTimeout) }).await;
        assert!(matches!(result, Err(C12Error::ChannelReadTimeout)));
    }

    #[tokio::test]
    async fn propagates_last_entry_security_failure() {
        let entries = vec![1u8];
        let result = try_each(&entries, |_, _| async move {
            Err(C12Error::C12NokResponse { code: ResponseCode::ERR, extra: vec![] })
        })
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn rejects_empty_list() {
        let entries: Vec<u8> = vec![];
        let result = try_each(&entries, |_, _| async move { Ok(()) }).await;
        assert!(matches!(result, Err(C12Error::Software(_))));
    }
}
