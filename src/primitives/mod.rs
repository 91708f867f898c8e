// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shared primitives (spec §4.x "C9"): scoped restore-on-drop guards, a
//! secure-wipe byte string, a millisecond timer helper, big-endian byte
//! cursor, and atomic flags. Everything above this layer is built out of
//! these instead of reaching for raw `Mutex`/`Vec<u8>`/hand-rolled offset
//! arithmetic.

pub mod byteio;
pub mod flags;
pub mod scoped;
pub mod secure_bytes;
pub mod timer;
