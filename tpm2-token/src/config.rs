//! Options of the create and remove actions.
//!
//! Field names follow the option names (`nv-index`, `pcr-bank`, ...) so the
//! structs deserialize straight from a configuration file section.

use std::time::Duration;

use luks2_token::{Result, Target, TokenError};
use serde::Deserialize;

use crate::backend::Tcti;
use crate::record::{PcrBanks, MAX_KEY_SIZE};

pub const DEFAULT_KEY_SIZE: usize = 64;
pub const DEFAULT_PCR_BANK: &str = "sha256";

/// Handle type byte of NV indices.
const NV_INDEX_TYPE: u32 = 0x01;

fn parse_tcti(tcti: Option<&str>) -> Result<Option<Tcti>> {
    tcti.map(|spec| {
        spec.parse().map_err(|e| {
            log::error!("{e}");
            TokenError::InvalidArgument
        })
    })
    .transpose()
}

fn target(id: Option<u32>) -> Target {
    id.map_or(Target::Any, Target::Id)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct CreateParams {
    /// NV index for the passphrase. Unset or 0 picks a free one.
    pub nv_index: Option<u32>,
    pub pcr_selection: u32,
    /// Comma separated PCR bank names.
    pub pcr_bank: Option<String>,
    pub dictionary_attack_protect: bool,
    pub no_pin: bool,
    pub tcti: Option<String>,
    pub key_size: Option<usize>,
    pub token_id: Option<u32>,
    pub key_slot: Option<u32>,
    /// Prompt timeout in seconds.
    pub timeout: Option<u64>,
}

/// [`CreateParams`] after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOptions {
    pub nv_index: Option<u32>,
    pub pcrs: u32,
    pub banks: PcrBanks,
    pub da_protect: bool,
    pub pin: bool,
    pub tcti: Option<Tcti>,
    pub key_size: usize,
    pub token: Target,
    pub keyslot: Target,
    pub timeout: Option<Duration>,
}

pub fn validate_create_params(params: &CreateParams) -> Result<CreateOptions> {
    let banks: PcrBanks = params
        .pcr_bank
        .as_deref()
        .unwrap_or(DEFAULT_PCR_BANK)
        .parse()
        .inspect_err(|_| log::error!("Wrong PCR bank value."))?;

    if banks.is_empty() {
        log::error!("PCR banks must be selected.");
        return Err(TokenError::InvalidArgument);
    }

    let key_size = params.key_size.unwrap_or(DEFAULT_KEY_SIZE);
    if key_size == 0 || key_size > MAX_KEY_SIZE {
        log::error!("Key size {key_size} out of range (1-{MAX_KEY_SIZE}).");
        return Err(TokenError::InvalidArgument);
    }

    let nv_index = params.nv_index.filter(|index| *index != 0);
    if let Some(index) = nv_index.filter(|index| index >> 24 != NV_INDEX_TYPE) {
        log::error!("0x{index:08x} is not an NV index handle.");
        return Err(TokenError::InvalidArgument);
    }

    Ok(CreateOptions {
        nv_index,
        pcrs: params.pcr_selection,
        banks,
        da_protect: params.dictionary_attack_protect,
        pin: !params.no_pin,
        tcti: parse_tcti(params.tcti.as_deref())?,
        key_size,
        token: target(params.token_id),
        keyslot: target(params.key_slot),
        timeout: params.timeout.filter(|t| *t > 0).map(Duration::from_secs),
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct RemoveParams {
    pub token_id: Option<u32>,
    /// Passphrase NV index of the token to remove.
    pub nv_index: Option<u32>,
    pub tcti: Option<String>,
    pub force_remove: bool,
}

/// Which token a remove targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveTarget {
    Token(u32),
    NvIndex(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveOptions {
    pub target: RemoveTarget,
    pub tcti: Option<Tcti>,
    pub force: bool,
}

pub fn validate_remove_params(params: &RemoveParams) -> Result<RemoveOptions> {
    let target = match (params.token_id, params.nv_index.filter(|index| *index != 0)) {
        (Some(token), _) => RemoveTarget::Token(token),
        (None, Some(nv_index)) => RemoveTarget::NvIndex(nv_index),
        (None, None) => {
            log::error!("Token ID or TPM2 nvindex option must be specified.");
            return Err(TokenError::InvalidArgument);
        }
    };

    Ok(RemoveOptions {
        target,
        tcti: parse_tcti(params.tcti.as_deref())?,
        force: params.force_remove,
    })
}
