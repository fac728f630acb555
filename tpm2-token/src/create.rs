//! Creating a `tpm2` token: provision the secret and nonce NV indices, add a
//! keyslot under the secret and record the token bound to it.

use std::time::Duration;

use luks2_token::{CryptDevice, Result, Target, TokenError};
use zeroize::Zeroizing;

use crate::backend::{NvPolicy, SecretStore, SecretStoreConnector};
use crate::config::{validate_create_params, CreateOptions, CreateParams};
use crate::record::{Tpm2Token, NONCE_SIZE};

/// Interactive source of passphrases.
pub trait Prompt {
    /// Read one passphrase. `verify` asks for it twice and requires both
    /// entries to match.
    fn passphrase(
        &mut self,
        message: &str,
        timeout: Option<Duration>,
        verify: bool,
    ) -> Result<Zeroizing<Vec<u8>>>;
}

/// Where a created token ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateReport {
    pub keyslot: u32,
    pub token: u32,
    pub nv_index: u32,
    pub nonce_nv_index: u32,
}

/// Side effect to revert if a later step fails.
#[derive(Debug)]
enum Undo {
    NvIndex(u32),
    Keyslot(u32),
    Token(u32),
}

/// Revert `undo` newest first.
fn unwind(cd: &mut CryptDevice, store: &mut dyn SecretStore, undo: Vec<Undo>) {
    for step in undo.into_iter().rev() {
        log::debug!("Rolling back {step:?}.");
        let outcome = match step {
            Undo::Token(token) => cd.token_create(Target::Id(token), None).map(|_| ()),
            Undo::Keyslot(keyslot) => cd.keyslot_destroy(keyslot),
            Undo::NvIndex(index) => store.nv_undefine(index).map_err(|e| {
                log::warn!("Failed to undefine NV index 0x{index:08x}: {e}.");
                TokenError::AccessDenied
            }),
        };

        if let Err(e) = outcome {
            log::debug!("Rollback step failed: {e}.");
        }
    }
}

pub fn create(
    cd: &mut CryptDevice,
    connector: &dyn SecretStoreConnector,
    params: &CreateParams,
    prompt: &mut dyn Prompt,
) -> Result<CreateReport> {
    let options = validate_create_params(params)?;

    match &options.tcti {
        Some(tcti) => log::debug!("Initializing TPM context with TCTI {tcti}."),
        None => log::debug!("Initializing TPM context with default TCTI."),
    }
    let mut store = connector.connect(options.tcti.as_ref()).map_err(|e| {
        log::error!("Failed to initialize TPM context: {e}.");
        TokenError::InvalidArgument
    })?;

    match store.supports_pcr_banks(options.banks, options.pcrs) {
        Ok(true) => {}
        Ok(false) => {
            log::error!("Your TPM doesn't support selected PCR and banks combination.");
            return Err(TokenError::Unsupported);
        }
        Err(e) => {
            log::error!("Failed to get PCRS capability from TPM: {e}.");
            return Err(TokenError::CommError);
        }
    }

    let secret = store.get_random(options.key_size).map_err(|e| {
        log::error!("Failed to retrieve random data for the TPM keyslot from the TPM: {e}.");
        TokenError::AccessDenied
    })?;

    let nonce = store.get_random(NONCE_SIZE).map_err(|e| {
        log::error!("Failed to retrieve random data for the TPM NV nonce from the TPM: {e}.");
        TokenError::AccessDenied
    })?;

    let existing = prompt.passphrase("Enter existing LUKS2 passphrase:", options.timeout, false)?;
    let pin = if options.pin {
        Some(prompt.passphrase("Enter new TPM password:", options.timeout, true)?)
    } else {
        None
    };

    let mut undo = Vec::new();
    let pin = pin.as_ref().map(|pin| pin.as_slice());
    let result = provision(
        cd,
        store.as_mut(),
        &options,
        &secret,
        &nonce,
        &existing,
        pin,
        &mut undo,
    );
    if result.is_err() {
        unwind(cd, store.as_mut(), undo);
    }
    result
}

#[allow(clippy::too_many_arguments)]
fn provision(
    cd: &mut CryptDevice,
    store: &mut dyn SecretStore,
    options: &CreateOptions,
    secret: &[u8],
    nonce: &[u8],
    existing: &[u8],
    pin: Option<&[u8]>,
    undo: &mut Vec<Undo>,
) -> Result<CreateReport> {
    let policy = NvPolicy {
        pcrs: options.pcrs,
        banks: options.banks,
    };

    let nv_index = store
        .nv_define_and_write(options.nv_index, secret, pin, policy, options.da_protect)
        .map_err(|e| {
            log::error!("Failed to write passphrase to an NV index: {e}.");
            TokenError::AccessDenied
        })?;
    undo.push(Undo::NvIndex(nv_index));

    let nonce_nv_index = store
        .nv_define_and_write(None, nonce, None, NvPolicy::NONCE, false)
        .map_err(|e| {
            log::error!("Failed to write random identification nonce to an NV index: {e}.");
            TokenError::AccessDenied
        })?;
    undo.push(Undo::NvIndex(nonce_nv_index));

    let keyslot = cd
        .keyslot_add_by_passphrase(options.keyslot, existing, secret)
        .inspect_err(|e| {
            if *e == TokenError::PermissionDenied {
                log::error!("Wrong LUKS2 passphrase supplied.");
            }
        })?;
    undo.push(Undo::Keyslot(keyslot));
    log::info!("Using keyslot {keyslot}.");

    let record = Tpm2Token::new(
        nv_index,
        nonce_nv_index,
        nonce,
        options.pcrs,
        options.banks,
        options.da_protect,
        pin.is_some(),
        options.key_size,
    );
    let token = cd.token_create(options.token, Some(&record.to_json()?))?;
    undo.push(Undo::Token(token));
    log::info!("Token: {token}");

    cd.token_assign(Target::Id(keyslot), Target::Id(token), true)
        .inspect_err(|_| log::error!("Failed to assign keyslot {keyslot} to token {token}."))?;

    Ok(CreateReport {
        keyslot,
        token,
        nv_index,
        nonce_nv_index,
    })
}
