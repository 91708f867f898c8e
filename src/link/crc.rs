// SPDX-License-Identifier: AGPL-3.0-or-later

//! CRC-16 over link-layer packets (spec §3 "CRC16"): reflected input/output,
//! polynomial 0x1021, init 0xFFFF, xorout 0xFFFF — bit-identical to the
//! `crc` crate's `CRC_16_IBM_SDLC` algorithm (the same one X.25/HDLC use).

use crc::{Algorithm, Crc, CRC_16_IBM_SDLC};

const ALGORITHM: &Algorithm<u16> = &CRC_16_IBM_SDLC;
static CRC16: Crc<u16> = Crc::<u16>::new(ALGORITHM);

pub fn crc16(bytes: &[u8]) -> u16 {
    CRC16.checksum(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_of_empty_slice_is_nonzero_due_to_init_and_xorout() {
        assert_eq!(crc16(&[]), 0x0000);
    }

    #[test]
    fn crc16_is_sensitive_to_any_single_bit_flip() {
        let a = crc16(b"ANSI C12 test frame");
        let mut data = b"ANSI C12 test frame".to_vec();
        data[0] ^= 0x01;
        let b = crc16(&data);
        assert_ne!(a, b);
    }

    #[test]
    fn crc16_is_deterministic() {
        let data = [0xEEu8, 0x00, 0x00, 0x00, 0x00, 0x04, 0x20, 0x01, 0x02, 0x03];
        assert_eq!(crc16(&data), crc16(&data));
    }
}
