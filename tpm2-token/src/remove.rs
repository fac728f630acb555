//! Removing a `tpm2` token together with its keyslots and NV indices.

use luks2_token::{CryptDevice, Result, Target, TokenError, TokenStatus};

use crate::config::{validate_remove_params, RemoveParams, RemoveTarget};
use crate::handler::{read_record, Tpm2Handler};
use crate::TOKEN_NAME;

fn is_tpm2_token(cd: &CryptDevice, token: u32) -> bool {
    match cd.token_status(token) {
        (TokenStatus::External, Some(name)) => name == TOKEN_NAME,
        _ => false,
    }
}

/// Id of the `tpm2` token whose secret lives in NV index `nv_index`.
pub fn token_by_nv_index(cd: &CryptDevice, nv_index: u32) -> Option<u32> {
    cd.header().token_ids().into_iter().find(|token| {
        is_tpm2_token(cd, *token)
            && read_record(cd, *token).is_ok_and(|record| record.nv_index == nv_index)
    })
}

pub fn remove(cd: &mut CryptDevice, handler: &Tpm2Handler, params: &RemoveParams) -> Result<()> {
    let options = validate_remove_params(params)?;

    let token = match options.target {
        RemoveTarget::Token(token) => Some(token),
        RemoveTarget::NvIndex(nv_index) => token_by_nv_index(cd, nv_index),
    };

    let token = match token {
        Some(token) if is_tpm2_token(cd, token) => token,
        _ => {
            log::error!("No TPM2 token to destroy.");
            return Err(TokenError::InvalidArgument);
        }
    };
    let record = read_record(cd, token)?;

    let store = match &options.tcti {
        Some(tcti) => {
            let store = handler.verify_tcti(cd, token, Some(tcti));
            if store.is_none() && !options.force {
                log::error!(
                    "TPM device accessed via specified TCTI '{tcti}' is not associated to this TPM token."
                );
                return Err(TokenError::InvalidArgument);
            }
            store
        }
        None => {
            log::debug!("No TCTI was specified, scanning...");
            let found = handler.find_backend_for_token(cd, token);
            if found.is_none() && !options.force {
                log::error!("No TPM device associated to this TPM token was found.");
                return Err(TokenError::InvalidArgument);
            }
            found.map(|(_, store)| store)
        }
    };

    for keyslot in cd.token_keyslots(token) {
        match cd.keyslot_destroy(keyslot) {
            Ok(()) | Err(TokenError::NotFound) => {}
            Err(e) => {
                log::error!("Cannot destroy keyslot {keyslot}.");
                return Err(e);
            }
        }
    }

    // Forced remove without a verified module: use the given TCTI or the default.
    let store = store.or_else(|| match handler.connector().connect(options.tcti.as_ref()) {
        Ok(store) => Some(store),
        Err(e) => {
            log::warn!("Cannot connect to TPM: {e}.");
            None
        }
    });

    match store {
        Some(mut store) => {
            for index in [record.nv_index, record.nonce_nv_index] {
                if let Err(e) = store.nv_undefine(index) {
                    log::warn!("Failed to undefine NV index 0x{index:08x}: {e}.");
                }
            }
        }
        None => log::warn!("No TPM device found, NV indices of token {token} are left defined."),
    }

    cd.token_create(Target::Id(token), None)?;
    log::info!("Token {token} removed.");
    Ok(())
}
