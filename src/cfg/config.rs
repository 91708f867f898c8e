// SPDX-License-Identifier: AGPL-3.0-or-later

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::{
    cfg::enums::{AuthAlgorithm, DataFormat, Dialect, YesNo},
    primitives::secure_bytes::SecureBytes,
};

/// Maximum password length absent an explicit per-dialect override (spec §3).
pub const DEFAULT_MAXIMUM_PASSWORD_LENGTH: usize = 20;

/// Plain configuration record (spec §3 "Protocol configuration", §6
/// "Configuration surface"). Field names mirror the wire/operator-facing
/// keys from §6 exactly so YAML configs stay meaningful to operators who
/// know the standard.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ProtocolConfig {
    /// Which revision of the standard this session speaks.
    pub dialect: Dialect,
    /// Session identity advertised during `Logon` (meter address / user name,
    /// dialect-dependent).
    pub identity: Identity,
    /// Password(s), authentication key(s), and related security knobs.
    pub credentials: Credentials,
    /// `PacketSize` / `MaximumNumberOfPackets` / `SessionBaud` / `MatchConnectBaud`.
    pub negotiation: Negotiation,
    /// `IntercharacterTimeout` / `AcknowledgementTimeout` / `ChannelTrafficTimeout`
    /// / `LinkLayerRetries`.
    pub timing: Timing,
    /// Retry/backoff knobs for the application layer and procedure execution.
    pub retries: Retries,
    /// Session life-cycle and behavioural policy flags.
    pub policy: Policy,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Identity {
    #[serde(rename = "Identity")]
    pub identity: String,
    #[serde(rename = "DataFormat")]
    pub data_format: DataFormat,
    /// Meter-internal integer endianness, snapshotted per queued command
    /// (spec §3 "Command record").
    #[serde(rename = "MeterIsLittleEndian")]
    pub meter_is_little_endian: YesNo,
}

#[derive(Deserialize, Serialize, Debug)]
pub struct Credentials {
    #[serde(rename = "Password", with = "serde_secure_bytes")]
    pub password: SecureBytes,
    #[serde(rename = "PasswordList", default, with = "serde_secure_bytes_list")]
    pub password_list: Vec<SecureBytes>,
    #[serde(rename = "EnableAuthentication")]
    pub enable_authentication: YesNo,
    #[serde(rename = "AuthenticationAlgorithm", skip_serializing_if = "Option::is_none")]
    pub authentication_algorithm: Option<AuthAlgorithm>,
    #[serde(rename = "AuthenticationKey", default, with = "serde_secure_bytes_opt")]
    pub authentication_key: Option<SecureBytes>,
    #[serde(rename = "AuthenticationKeyId", default)]
    pub authentication_key_id: u8,
    #[serde(
        rename = "AuthenticationKeyList",
        default,
        with = "serde_secure_bytes_list"
    )]
    pub authentication_key_list: Vec<SecureBytes>,
}

impl Clone for Credentials {
    fn clone(&self) -> Self {
        Self {
            password: self.password.clone_explicit(),
            password_list: self.password_list.iter().map(SecureBytes::clone_explicit).collect(),
            enable_authentication: self.enable_authentication,
            authentication_algorithm: self.authentication_algorithm,
            authentication_key: self.authentication_key.as_ref().map(SecureBytes::clone_explicit),
            authentication_key_id: self.authentication_key_id,
            authentication_key_list: self
                .authentication_key_list
                .iter()
                .map(SecureBytes::clone_explicit)
                .collect(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Negotiation {
    #[serde(rename = "PacketSize")]
    pub packet_size: u16,
    #[serde(rename = "MaximumNumberOfPackets")]
    pub maximum_number_of_packets: u8,
    #[serde(rename = "SessionBaud", skip_serializing_if = "Option::is_none")]
    pub session_baud: Option<u32>,
    #[serde(rename = "MatchConnectBaud")]
    pub match_connect_baud: YesNo,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Timing {
    #[serde(rename = "IntercharacterTimeout", with = "serde_millis")]
    pub intercharacter_timeout: Duration,
    #[serde(rename = "AcknowledgementTimeout", with = "serde_millis")]
    pub acknowledgement_timeout: Duration,
    #[serde(rename = "ChannelTrafficTimeout", with = "serde_millis")]
    pub channel_traffic_timeout: Duration,
    #[serde(rename = "LinkLayerRetries")]
    pub link_layer_retries: u8,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Retries {
    #[serde(rename = "ApplicationLayerRetries")]
    pub application_layer_retries: u8,
    #[serde(rename = "ApplicationLayerProcedureRetries")]
    pub application_layer_procedure_retries: u8,
    #[serde(rename = "ApplicationLayerProcedureSleepBetweenRetries", with = "serde_millis")]
    pub application_layer_procedure_sleep_between_retries: Duration,
    #[serde(rename = "ProcedureInitiateTimeout", with = "serde_millis")]
    pub procedure_initiate_timeout: Duration,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Policy {
    #[serde(rename = "IssueNegotiateOnStartSession")]
    pub issue_negotiate_on_start_session: YesNo,
    #[serde(rename = "IssueTimingSetupOnStartSession")]
    pub issue_timing_setup_on_start_session: YesNo,
    #[serde(rename = "IssueSecurityOnStartSession")]
    pub issue_security_on_start_session: YesNo,
    #[serde(rename = "IssueLogoffOnEndSession")]
    pub issue_logoff_on_end_session: YesNo,
    #[serde(rename = "WakeUpSharedOpticalPort")]
    pub wake_up_shared_optical_port: YesNo,
    #[serde(rename = "CheckIncomingToggleBit")]
    pub check_incoming_toggle_bit: YesNo,
    #[serde(rename = "KeepSessionAlive")]
    pub keep_session_alive: YesNo,
    #[serde(rename = "EndSessionOnApplicationLayerError")]
    pub end_session_on_application_layer_error: YesNo,
}

impl ProtocolConfig {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: ProtocolConfig =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields (spec §3, §6).
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(
            self.credentials.password.len() <= DEFAULT_MAXIMUM_PASSWORD_LENGTH,
            "Password exceeds MaximumPasswordLength"
        );
        for (ix, entry) in self.credentials.password_list.iter().enumerate() {
            ensure!(
                entry.len() <= DEFAULT_MAXIMUM_PASSWORD_LENGTH,
                "PasswordList[{ix}] exceeds MaximumPasswordLength"
            );
        }

        ensure!(
            (32..=8192).contains(&self.negotiation.packet_size),
            "PacketSize must be in 32..=8192"
        );
        ensure!(
            self.negotiation.maximum_number_of_packets >= 1,
            "MaximumNumberOfPackets must be >= 1"
        );

        if self.credentials.enable_authentication.as_bool() {
            let algo = self
                .credentials
                .authentication_algorithm
                .context("AuthenticationAlgorithm is required when EnableAuthentication=Yes")?;
            let key_len = algo.ticket_len();
            if let Some(key) = &self.credentials.authentication_key {
                ensure!(
                    key.len() == key_len,
                    "AuthenticationKey length must match {algo} ({key_len} bytes)"
                );
            }
            for (ix, key) in self.credentials.authentication_key_list.iter().enumerate() {
                ensure!(
                    key.len() == key_len,
                    "AuthenticationKeyList[{ix}] length must match {algo} ({key_len} bytes)"
                );
            }
        }

        if !self.dialect.is_c1221() {
            ensure!(
                !self.policy.issue_timing_setup_on_start_session.as_bool(),
                "IssueTimingSetupOnStartSession is only valid under C12.21"
            );
        }

        Ok(())
    }
}

impl Default for Negotiation {
    /// Defaults per spec §6: `PacketSize`=1024, `MaximumNumberOfPackets`=255.
    fn default() -> Self {
        Self {
            packet_size: 1024,
            maximum_number_of_packets: 255,
            session_baud: None,
            match_connect_baud: YesNo::No,
        }
    }
}

mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

mod serde_secure_bytes {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::primitives::secure_bytes::SecureBytes;

    pub fn serialize<S: Serializer>(b: &SecureBytes, s: S) -> Result<S::Ok, S::Error> {
        hex::encode(b.as_slice()).serialize(s)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SecureBytes, D::Error> {
        let hexstr = String::deserialize(d)?;
        let bytes = hex::decode(hexstr.as_bytes()).map_err(serde::de::Error::custom)?;
        Ok(SecureBytes::new(bytes))
    }
}

mod serde_secure_bytes_opt {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::primitives::secure_bytes::SecureBytes;

    pub fn serialize<S: Serializer>(b: &Option<SecureBytes>, s: S) -> Result<S::Ok, S::Error> {
        b.as_ref().map(|v| hex::encode(v.as_slice())).serialize(s)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<SecureBytes>, D::Error> {
        let hexstr: Option<String> = Option::deserialize(d)?;
        hexstr
            .map(|s| hex::decode(s.as_bytes()).map(SecureBytes::new))
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}

mod serde_secure_bytes_list {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::primitives::secure_bytes::SecureBytes;

    pub fn serialize<S: Serializer>(list: &[SecureBytes], s: S) -> Result<S::Ok, S::Error> {
        let hexes: Vec<String> = list.iter().map(|b| hex::encode(b.as_slice())).collect();
        hexes.serialize(s)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<SecureBytes>, D::Error> {
        let hexes: Vec<String> = Vec::deserialize(d)?;
        hexes
            .into_iter()
            .map(|s| hex::decode(s.as_bytes()).map(SecureBytes::new))
            .collect::<Result<Vec<_>, _>>()
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ProtocolConfig {
        ProtocolConfig {
            dialect: Dialect::C1218,
            identity: Identity {
                identity: "00000000".to_string(),
                data_format: DataFormat::C1218,
                meter_is_little_endian: YesNo::No,
            },
            credentials: Credentials {
                password: SecureBytes::new(vec![0; 4]),
                password_list: vec![],
                enable_authentication: YesNo::No,
                authentication_algorithm: None,
                authentication_key: None,
                authentication_key_id: 0,
                authentication_key_list: vec![],
            },
            negotiation: Negotiation::default(),
            timing: Timing {
                intercharacter_timeout: Duration::from_millis(50),
                acknowledgement_timeout: Duration::from_secs(3),
                channel_traffic_timeout: Duration::from_secs(10),
                link_layer_retries: 3,
            },
            retries: Retries {
                application_layer_retries: 3,
                application_layer_procedure_retries: 3,
                application_layer_procedure_sleep_between_retries: Duration::from_millis(500),
                procedure_initiate_timeout: Duration::from_secs(30),
            },
            policy: Policy {
                issue_negotiate_on_start_session: YesNo::Yes,
                issue_timing_setup_on_start_session: YesNo::No,
                issue_security_on_start_session: YesNo::No,
                issue_logoff_on_end_session: YesNo::Yes,
                wake_up_shared_optical_port: YesNo::No,
                check_incoming_toggle_bit: YesNo::Yes,
                keep_session_alive: YesNo::No,
                end_session_on_application_layer_error: YesNo::Yes,
            },
        }
    }

    #[test]
    fn validates_sample_config() {
        let mut cfg = sample();
        cfg.validate_and_normalize().unwrap();
    }

    #[test]
    fn rejects_oversized_password() {
        let mut cfg = sample();
        cfg.credentials.password = SecureBytes::new(vec![0; DEFAULT_MAXIMUM_PASSWORD_LENGTH + 1]);
        assert!(cfg.validate_and_normalize().is_err());
    }

    #[test]
    fn rejects_authentication_without_algorithm() {
        let mut cfg = sample();
        cfg.credentials.enable_authentication = YesNo::Yes;
        assert!(cfg.validate_and_normalize().is_err());
    }

    #[test]
    fn rejects_wrong_length_key_for_algorithm() {
        let mut cfg = sample();
        cfg.credentials.enable_authentication = YesNo::Yes;
        cfg.credentials.authentication_algorithm = Some(AuthAlgorithm::Aes);
        cfg.credentials.authentication_key = Some(SecureBytes::new(vec![0; 8]));
        assert!(cfg.validate_and_normalize().is_err());
    }

    #[test]
    fn rejects_timing_setup_policy_under_c1218() {
        let mut cfg = sample();
        cfg.policy.issue_timing_setup_on_start_session = YesNo::Yes;
        assert!(cfg.validate_and_normalize().is_err());
    }

    #[test]
    fn negotiation_defaults_match_spec() {
        let n = Negotiation::default();
        assert_eq!(n.packet_size, 1024);
        assert_eq!(n.maximum_number_of_packets, 255);
    }
}
