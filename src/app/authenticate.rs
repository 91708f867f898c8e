// SPDX-License-Identifier: AGPL-3.0-or-later

//! `Authenticate` (0x53): DES-ECB or AES-EAX ticket/response exchange
//! (spec §4.3 "Authentication"). Request shape is `len | keyId |
//! ciphertext`; certification is decrypt-then-compare against the
//! original plaintext ticket.
//!
//! The EAX nonce is fixed at all-zero bytes: each exchange encrypts a
//! fresh, device-issued ticket, so nonce reuse across exchanges does not
//! repeat a (key, plaintext) pair.

use aead::{AeadInPlace, KeyInit, generic_array::GenericArray};
use aes::Aes128;
use cipher::{BlockDecryptMut, BlockEncryptMut};
use des::Des;
use eax::Eax;

use crate::{
    app::cmd,
    cfg::enums::AuthAlgorithm,
    channel::Channel,
    error::C12Error,
    link::ToggleState,
    primitives::{byteio::ByteReader, secure_bytes::SecureBytes},
};

use super::Dispatcher;

type DesEcbEnc = ecb::Encryptor<Des>;
type DesEcbDec = ecb::Decryptor<Des>;
type Aes128Eax = Eax<Aes128>;

const EAX_NONCE: [u8; 16] = [0u8; 16];

fn des_encrypt_block(key: &[u8], block: &[u8; 8]) -> [u8; 8] {
    let mut buf = *block;
    let mut cipher = DesEcbEnc::new(GenericArray::from_slice(key));
    cipher.encrypt_block_mut(GenericArray::from_mut_slice(&mut buf));
    buf
}

fn des_decrypt_block(key: &[u8], block: &[u8; 8]) -> [u8; 8] {
    let mut buf = *block;
    let mut cipher = DesEcbDec::new(GenericArray::from_slice(key));
    cipher.decrypt_block_mut(GenericArray::from_mut_slice(&mut buf));
    buf
}

/// Applies the EAX CTR keystream to `block` in place, discarding the tag.
/// The wire format carries a 16-byte ciphertext with no appended tag (the
/// request length byte is `0x11` = 1 key id + 16 ciphertext bytes), so
/// authentication is a CTR XOR, not an authenticated `Aead::encrypt`; the
/// XOR is its own inverse under a fixed nonce, so the same call serves as
/// both directions.
fn aes_eax_transform(key: &[u8], block: &mut [u8; 16]) -> Result<(), C12Error> {
    let cipher = Aes128Eax::new(GenericArray::from_slice(key));
    cipher
        .encrypt_in_place_detached(GenericArray::from_slice(&EAX_NONCE), b"", block)
        .map(|_tag| ())
        .map_err(|_| C12Error::Security("failed to encrypt authentication ticket".to_string()))
}

/// Attempts authentication with a single key against a ticket obtained
/// from `Identify`. On success, the device has been certified and the
/// connection may proceed; any other outcome is a [`C12Error::Security`].
pub async fn authenticate_with_key<C: Channel>(
    dispatcher: &Dispatcher<'_, C>,
    toggle: &mut ToggleState,
    algorithm: AuthAlgorithm,
    key: &SecureBytes,
    key_id: u8,
    ticket: &[u8],
) -> Result<(), C12Error> {
    if key.len() != algorithm.ticket_len() || ticket.len() != algorithm.ticket_len() {
        return Err(C12Error::Meter(format!(
            "authentication key/ticket is not of {}-byte size",
            algorithm.ticket_len()
        )));
    }

    let mut request = vec![key_id];
    let expected_response_body;

    match algorithm {
        AuthAlgorithm::Des => {
            let ticket_block: [u8; 8] =
                ticket.try_into().map_err(|_| C12Error::Meter("DES ticket must be 8 bytes".to_string()))?;
            let encrypted_ticket = des_encrypt_block(key.as_slice(), &ticket_block);
            request.extend_from_slice(&encrypted_ticket);
            expected_response_body = encrypted_ticket.to_vec();
        },
        AuthAlgorithm::Aes => {
            let mut buf: [u8; 16] =
                ticket.try_into().map_err(|_| C12Error::Meter("AES ticket must be 16 bytes".to_string()))?;
            aes_eax_transform(key.as_slice(), &mut buf)?;
            request.extend_from_slice(&buf);
            expected_response_body = buf.to_vec();
        },
    }

    let mut body = vec![request.len() as u8];
    body.extend_from_slice(&request);

    let (_status, data) = dispatcher
        .request(cmd::AUTHENTICATE, &body, toggle, false, false, true)
        .await?;

    let mut r = ByteReader::new(&data);
    let len = r.read_u8()? as usize;
    if len != request.len() {
        return Err(failed_authentication());
    }
    let reported_key_id = r.read_u8()?;
    if reported_key_id != key_id {
        return Err(failed_authentication());
    }
    let response_ciphertext = r.read_bytes(len - 1)?;

    let certified = match algorithm {
        AuthAlgorithm::Des => {
            let block: [u8; 8] = response_ciphertext
                .try_into()
                .map_err(|_| C12Error::Meter("DES response must be 8 bytes".to_string()))?;
            des_decrypt_block(key.as_slice(), &block).to_vec() == expected_response_body
        },
        AuthAlgorithm::Aes => {
            let mut block: [u8; 16] = response_ciphertext
                .try_into()
                .map_err(|_| C12Error::Meter("AES response must be 16 bytes".to_string()))?;
            aes_eax_transform(key.as_slice(), &mut block)?;
            block.to_vec() == expected_response_body
        },
    };

    if certified {
        Ok(())
    } else {
        Err(failed_authentication())
    }
}

fn failed_authentication() -> C12Error {
    C12Error::Security("device failed authentication, tampering or fake device is possible".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn des_encrypt_then_decrypt_round_trips() {
        let key = [0x11u8; 8];
        let ticket = [0x22u8; 8];
        let ciphertext = des_encrypt_block(&key, &ticket);
        let plaintext = des_decrypt_block(&key, &ciphertext);
        assert_eq!(plaintext, ticket);
    }

    #[test]
    fn aes_eax_transform_round_trips_and_keeps_ticket_length() {
        let key = [0x33u8; 16];
        let ticket = [0x44u8; 16];

        let mut ciphertext = ticket;
        aes_eax_transform(&key, &mut ciphertext).unwrap();
        assert_ne!(ciphertext, ticket);

        let mut plain = ciphertext;
        aes_eax_transform(&key, &mut plain).unwrap();
        assert_eq!(plain, ticket);
    }
}
