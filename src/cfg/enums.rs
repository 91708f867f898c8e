// SPDX-License-Identifier: AGPL-3.0-or-later

use core::fmt;

use serde::{Deserialize, Serialize};

/// Boolean enumeration with string serialization support.
///
/// Represents yes/no values with support for various string representations
/// including "Yes"/"No", "true"/"false", and "1"/"0".
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum YesNo {
    #[serde(
        rename = "Yes",
        alias = "yes",
        alias = "YES",
        alias = "true",
        alias = "True",
        alias = "1"
    )]
    Yes,
    #[serde(
        rename = "No",
        alias = "no",
        alias = "NO",
        alias = "false",
        alias = "False",
        alias = "0"
    )]
    No,
}
impl fmt::Display for YesNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            YesNo::Yes => "Yes",
            YesNo::No => "No",
        })
    }
}
impl From<bool> for YesNo {
    fn from(b: bool) -> Self {
        if b { YesNo::Yes } else { YesNo::No }
    }
}
impl YesNo {
    pub fn as_bool(self) -> bool {
        matches!(self, YesNo::Yes)
    }
}

/// Which revision of the standard a session runs: C12.18 is optical
/// point-to-point, C12.21 adds `TimingSetup` and key-based `Authenticate`.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    #[serde(rename = "C12.18", alias = "c12.18", alias = "C1218")]
    C1218,
    #[serde(rename = "C12.21", alias = "c12.21", alias = "C1221")]
    C1221,
}
impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Dialect::C1218 => "C12.18",
            Dialect::C1221 => "C12.21",
        })
    }
}
impl Dialect {
    pub fn is_c1221(self) -> bool {
        matches!(self, Dialect::C1221)
    }
}

/// `DATA_FORMAT` carried in the link-layer `CTRL` byte (spec §3).
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataFormat {
    #[serde(rename = "C1218")]
    C1218 = 0,
    #[serde(rename = "C1222")]
    C1222Encapsulated = 1,
}
impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DataFormat::C1218 => "C1218",
            DataFormat::C1222Encapsulated => "C1222",
        })
    }
}

/// Authentication cipher negotiated via `Identify` (spec §4.3 "Authentication").
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAlgorithm {
    #[serde(rename = "DES")]
    Des,
    #[serde(rename = "AES")]
    Aes,
}
impl fmt::Display for AuthAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuthAlgorithm::Des => "DES",
            AuthAlgorithm::Aes => "AES",
        })
    }
}
impl AuthAlgorithm {
    /// Ticket/key length in bytes, per spec §4.3.
    pub fn ticket_len(self) -> usize {
        match self {
            AuthAlgorithm::Des => 8,
            AuthAlgorithm::Aes => 16,
        }
    }

    /// Device-reported algorithm code from `Identify` (spec §3 "Identified view").
    pub fn from_device_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(AuthAlgorithm::Des),
            255 => Some(AuthAlgorithm::Aes),
            _ => None,
        }
    }
}

/// `NegotiatedSessionBaud` index table (spec §4.3 "Baud index table").
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaudIndex(pub u8);

impl BaudIndex {
    const TABLE: [u32; 14] = [
        300, 600, 1200, 2400, 4800, 9600, 14400, 19200, 28800, 57600, 38400, 115200, 128000,
        256000,
    ];

    pub fn to_baud(self) -> Option<u32> {
        let ix = self.0.checked_sub(1)? as usize;
        Self::TABLE.get(ix).copied()
    }

    pub fn from_baud(baud: u32) -> Option<Self> {
        Self::TABLE
            .iter()
            .position(|&b| b == baud)
            .map(|ix| BaudIndex((ix + 1) as u8))
    }
}
