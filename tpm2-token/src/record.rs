//! JSON record of a `tpm2` token.

use std::fmt;
use std::str::FromStr;

use luks2_token::{Result, TokenError};
use serde::de::{self, Deserializer};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};

use crate::{TOKEN_NAME, TOKEN_VERSION_MAJOR, TOKEN_VERSION_MINOR};

/// Raw size of the identification nonce.
pub const NONCE_SIZE: usize = 32;

/// Largest secret an NV index may hold.
pub const MAX_KEY_SIZE: usize = 512;

/// Set of PCR banks, one bit per hash algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PcrBanks(u32);

const BANK_NAMES: [(&str, u32); 5] = [
    ("sha1", 1 << 0),
    ("sha256", 1 << 1),
    ("sha384", 1 << 2),
    ("sha512", 1 << 3),
    ("sm3_256", 1 << 4),
];

impl PcrBanks {
    pub const SHA1: PcrBanks = PcrBanks(1 << 0);
    pub const SHA256: PcrBanks = PcrBanks(1 << 1);
    pub const SHA384: PcrBanks = PcrBanks(1 << 2);
    pub const SHA512: PcrBanks = PcrBanks(1 << 3);
    pub const SM3_256: PcrBanks = PcrBanks(1 << 4);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: PcrBanks) -> bool {
        self.0 & other.0 == other.0
    }

    /// Selected bank names in canonical order.
    pub fn names(self) -> Vec<&'static str> {
        BANK_NAMES
            .iter()
            .filter(|(_, bit)| self.0 & bit != 0)
            .map(|(name, _)| *name)
            .collect()
    }

    fn from_name(name: &str) -> Option<PcrBanks> {
        BANK_NAMES
            .iter()
            .find(|(bank, _)| *bank == name)
            .map(|(_, bit)| PcrBanks(*bit))
    }
}

impl std::ops::BitOr for PcrBanks {
    type Output = PcrBanks;

    fn bitor(self, rhs: PcrBanks) -> PcrBanks {
        PcrBanks(self.0 | rhs.0)
    }
}

/// Comma separated bank names, e.g. `sha1,sha256`.
impl FromStr for PcrBanks {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self> {
        let mut banks = PcrBanks::default();
        for name in s.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let bank = PcrBanks::from_name(name).ok_or_else(|| {
                log::debug!("Unknown PCR bank '{name}'.");
                TokenError::InvalidArgument
            })?;
            banks = banks | bank;
        }
        Ok(banks)
    }
}

impl fmt::Display for PcrBanks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.names().join(","))
    }
}

impl Serialize for PcrBanks {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let names = self.names();
        let mut seq = serializer.serialize_seq(Some(names.len()))?;
        for name in names {
            seq.serialize_element(name)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for PcrBanks {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        names.iter().try_fold(PcrBanks::default(), |banks, name| {
            PcrBanks::from_name(name)
                .map(|bank| banks | bank)
                .ok_or_else(|| de::Error::custom(format!("unknown PCR bank {name}")))
        })
    }
}

/// Selected PCR numbers, ascending.
pub fn pcr_numbers(mask: u32) -> Vec<u32> {
    (0..32).filter(|pcr| mask & (1 << pcr) != 0).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tpm2Token {
    #[serde(rename = "type")]
    pub token_type: String,
    pub keyslots: Vec<String>,
    #[serde(rename = "tpm2-version-major")]
    pub version_major: u32,
    #[serde(rename = "tpm2-version-minor")]
    pub version_minor: u32,
    #[serde(rename = "tpm2-nv-index")]
    pub nv_index: u32,
    #[serde(rename = "tpm2-nonce-nv-index")]
    pub nonce_nv_index: u32,
    #[serde(rename = "tpm2-nv-nonce")]
    pub nonce: String,
    #[serde(rename = "tpm2-pcrs")]
    pub pcrs: u32,
    #[serde(rename = "tpm2-pcr-banks")]
    pub pcr_banks: PcrBanks,
    #[serde(rename = "tpm2-da-protection")]
    pub da_protect: bool,
    #[serde(rename = "tpm2-pin")]
    pub pin: bool,
    #[serde(rename = "tpm2-key-size")]
    pub key_size: usize,
}

impl Tpm2Token {
    /// Fresh record with no keyslots assigned.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        nv_index: u32,
        nonce_nv_index: u32,
        nonce: &[u8],
        pcrs: u32,
        pcr_banks: PcrBanks,
        da_protect: bool,
        pin: bool,
        key_size: usize,
    ) -> Self {
        Self {
            token_type: TOKEN_NAME.to_string(),
            keyslots: Vec::new(),
            version_major: TOKEN_VERSION_MAJOR,
            version_minor: TOKEN_VERSION_MINOR,
            nv_index,
            nonce_nv_index,
            nonce: hex::encode(nonce),
            pcrs,
            pcr_banks,
            da_protect,
            pin,
            key_size,
        }
    }

    /// Parse and validate a stored record.
    pub fn from_json(json: &str) -> Result<Self> {
        let token: Tpm2Token = serde_json::from_str(json).map_err(|e| {
            log::debug!("Cannot parse TPM2 token metadata: {e}.");
            TokenError::InvalidArgument
        })?;
        token.validate()?;
        Ok(token)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|_| TokenError::InvalidArgument)
    }

    pub fn validate(&self) -> Result<()> {
        let problem = if self.token_type != TOKEN_NAME {
            Some("wrong token type")
        } else if self.version_major != TOKEN_VERSION_MAJOR {
            Some("unsupported token version")
        } else if self.nv_index == 0 || self.nonce_nv_index == 0 {
            Some("missing NV index")
        } else if self.nv_index == self.nonce_nv_index {
            Some("passphrase and nonce share an NV index")
        } else if self.nonce_bytes().is_err() {
            Some("malformed NV nonce")
        } else if self.pcr_banks.is_empty() {
            Some("no PCR bank selected")
        } else if self.key_size == 0 || self.key_size > MAX_KEY_SIZE {
            Some("key size out of range")
        } else {
            None
        };

        match problem {
            Some(problem) => {
                log::debug!("Invalid TPM2 token: {problem}.");
                Err(TokenError::InvalidArgument)
            }
            None => Ok(()),
        }
    }

    /// Decoded identification nonce.
    pub fn nonce_bytes(&self) -> Result<[u8; NONCE_SIZE]> {
        let mut nonce = [0u8; NONCE_SIZE];
        hex::decode_to_slice(&self.nonce, &mut nonce).map_err(|_| TokenError::InvalidArgument)?;
        Ok(nonce)
    }
}
