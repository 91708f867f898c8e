// SPDX-License-Identifier: AGPL-3.0-or-later

//! Millisecond timing helpers (spec §4.2 ack/nak timeouts, §4.6 keep-alive
//! interval).

use std::time::Duration;

use tokio::time::Instant;

/// A single-shot deadline computed from "now + duration", re-checked with
/// [`Deadline::remaining`] across a loop of retries instead of recomputing
/// the timeout on every iteration.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(duration: Duration) -> Self {
        Self {
            at: Instant::now() + duration,
        }
    }

    pub fn has_elapsed(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Time left until the deadline, or `Duration::ZERO` if already past.
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_has_elapsed_for_zero_duration() {
        let d = Deadline::after(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));
        assert!(d.has_elapsed());
        assert_eq!(d.remaining(), Duration::ZERO);
    }
}
