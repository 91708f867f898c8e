// SPDX-License-Identifier: AGPL-3.0-or-later

//! `Identify` (0x20) request/response codec (spec §3 "Identified view",
//! §4.3 "Service encodings"). Feature-block tags: `auth_ser`=0x01,
//! `auth_ser_ticket`=0x02, `device-class`=0x06, `device-identity`=0x07,
//! terminator=0x00.

use crate::{app::cmd, channel::Channel, error::C12Error, link::ToggleState, primitives::byteio::ByteReader};

use super::Dispatcher;

/// Authentication capability reported by `Identify`, if any (spec §3
/// "auth_ser"/"auth_ser_ticket").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthService {
    pub can_authenticate: bool,
    pub algorithm_code: u8,
    pub ticket: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentifiedView {
    pub reference_standard: u8,
    pub standard_version: u8,
    pub standard_revision: u8,
    pub auth: Option<AuthService>,
    pub device_class: Option<Vec<u8>>,
    pub device_identity: Option<Vec<u8>>,
}

pub async fn identify<C: Channel>(
    dispatcher: &Dispatcher<'_, C>,
    toggle: &mut ToggleState,
) -> Result<IdentifiedView, C12Error> {
    let (_status, data) = dispatcher
        .request(cmd::IDENTIFY, &[], toggle, true, false, false)
        .await?;
    parse_identify_response(&data)
}

fn parse_identify_response(data: &[u8]) -> Result<IdentifiedView, C12Error> {
    let mut r = ByteReader::new(data);
    let mut view = IdentifiedView {
        reference_standard: r.read_u8()?,
        standard_version: r.read_u8()?,
        standard_revision: r.read_u8()?,
        ..Default::default()
    };

    loop {
        if r.is_empty() {
            break;
        }
        match r.read_u8()? {
            0x00 => break,
            0x01 => {
                let auth_type = r.read_u8()?;
                let algorithm_code = r.read_u8()?;
                view.auth = Some(AuthService {
                    can_authenticate: auth_type & 0x01 != 0,
                    algorithm_code,
                    ticket: Vec::new(),
                });
            },
            0x02 => {
                let auth_type = r.read_u8()?;
                let algorithm_code = r.read_u8()?;
                let len = r.read_u8()? as usize;
                let ticket = r.read_bytes(len)?.to_vec();
                view.auth = Some(AuthService {
                    can_authenticate: auth_type & 0x01 != 0,
                    algorithm_code,
                    ticket,
                });
            },
            0x06 => {
                let _uid_kind = r.read_u8()?;
                let len = r.read_u8()? as usize;
                view.device_class = Some(r.read_bytes(len)?.to_vec());
            },
            0x07 => {
                let len = r.read_u8()? as usize;
                view.device_identity = Some(r.read_bytes(len)?.to_vec());
            },
            other => {
                return Err(C12Error::Meter(format!(
                    "identify: unrecognized feature code 0x{other:02x}"
                )));
            },
        }
    }

    Ok(view)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_auth_ser_ticket_feature_block() {
        let mut body = vec![1u8, 2, 0]; // ref, ver, rev
        body.push(0x02); // auth_ser_ticket
        body.push(0x01); // auth_type, can authenticate
        body.push(0x00); // algorithm DES
        body.push(8); // ticket length
        body.extend_from_slice(&[0xAAu8; 8]);
        body.push(0x00); // terminator

        let view = parse_identify_response(&body).unwrap();
        assert_eq!((view.reference_standard, view.standard_version, view.standard_revision), (1, 2, 0));
        let auth = view.auth.unwrap();
        assert!(auth.can_authenticate);
        assert_eq!(auth.algorithm_code, 0);
        assert_eq!(auth.ticket, vec![0xAA; 8]);
    }

    #[test]
    fn rejects_unrecognized_feature_code() {
        let body = vec![1u8, 2, 0, 0x42];
        assert!(matches!(parse_identify_response(&body), Err(C12Error::Meter(_))));
    }

    #[test]
    fn parses_device_class_and_identity() {
        let mut body = vec![1u8, 2, 0];
        body.push(0x06);
        body.push(0x00);
        body.push(2);
        body.extend_from_slice(&[0x01, 0x02]);
        body.push(0x07);
        body.push(3);
        body.extend_from_slice(&[0x10, 0x20, 0x30]);
        body.push(0x00);

        let view = parse_identify_response(&body).unwrap();
        assert_eq!(view.device_class, Some(vec![0x01, 0x02]));
        assert_eq!(view.device_identity, Some(vec![0x10, 0x20, 0x30]));
    }
}
