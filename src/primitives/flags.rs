// SPDX-License-Identifier: AGPL-3.0-or-later

//! Atomic status flags (§9 REDESIGN FLAGS: "`MInterlocked` flags ... Model
//! as atomic booleans or small atomic integers. `CancelCommunication`
//! stores-release; the read side load-acquires between OS syscalls.").

use std::sync::atomic::{AtomicBool, Ordering};

/// A single boolean flag set from one side and polled from another, with
/// the store-release / load-acquire pairing the redesign note calls for.
#[derive(Debug, Default)]
pub struct CancelFlag(AtomicBool);

impl CancelFlag {
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Tracks whether a modem/channel is mid-operation (dialing, awaiting a
/// response) so a concurrent cancel request can tell the caller what it
/// interrupted.
#[derive(Debug, Default)]
pub struct BusyFlag(AtomicBool);

impl BusyFlag {
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Caller must pair with [`BusyFlag::leave`] on every return path.
    pub fn enter(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn leave(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_busy(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_flag_defaults_unset() {
        let flag = CancelFlag::new();
        assert!(!flag.is_set());
        flag.set();
        assert!(flag.is_set());
    }

    #[test]
    fn busy_flag_enter_leave_round_trip() {
        let flag = BusyFlag::new();
        assert!(!flag.is_busy());
        flag.enter();
        assert!(flag.is_busy());
        flag.leave();
        assert!(!flag.is_busy());
    }
}
