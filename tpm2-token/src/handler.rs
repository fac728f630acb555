//! open, validate and dump for `tpm2` tokens, and locating the module that
//! holds a token's secret.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use luks2_token::{CryptDevice, Result, SecretBuffer, TokenError};

use crate::backend::{BackendError, NvPolicy, SecretStore, SecretStoreConnector, Tcti};
use crate::dump;
use crate::record::{Tpm2Token, NONCE_SIZE};

/// Resource manager device nodes probed during discovery.
pub const DEVICE_LIMIT: u32 = 100;

/// Map a failed NV access to the error reported for an open.
pub(crate) fn nv_access_error(e: BackendError) -> TokenError {
    match e {
        BackendError::AuthFailed => TokenError::PermissionDenied,
        BackendError::Failed(_) => TokenError::AccessDenied,
    }
}

pub(crate) fn read_record(cd: &CryptDevice, token: u32) -> Result<Tpm2Token> {
    let json = cd.token_json_get(token)?;
    Tpm2Token::from_json(&json).inspect_err(|_| {
        log::error!("Cannot read JSON token metadata.");
    })
}

/// Whether `store` holds the identification nonce recorded in `record`.
///
/// A failed read is a negative answer, not an error.
pub fn verify_binding(store: &mut dyn SecretStore, record: &Tpm2Token) -> bool {
    let Ok(expected) = record.nonce_bytes() else {
        return false;
    };

    let stored = match store.nv_read(record.nonce_nv_index, None, NvPolicy::NONCE, NONCE_SIZE) {
        Ok(stored) => stored,
        Err(e) => {
            log::debug!("Failed to read NV nonce, this TPM doesn't seem to hold the passphrase: {e}.");
            return false;
        }
    };

    if stored.as_slice() != expected.as_slice() {
        log::debug!("Bad NV nonce content, this TPM doesn't hold the passphrase.");
        log::debug!("Nonce from header: '{}'", record.nonce);
        log::debug!("TPM-stored nonce: '{}'", hex::encode(stored.as_slice()));
        return false;
    }

    true
}

pub struct Tpm2Handler {
    connector: Arc<dyn SecretStoreConnector>,
}

impl Tpm2Handler {
    pub fn new(connector: Arc<dyn SecretStoreConnector>) -> Self {
        Self { connector }
    }

    pub fn connector(&self) -> &dyn SecretStoreConnector {
        self.connector.as_ref()
    }

    /// Connect through `tcti` and keep the session if the module holds the
    /// secret of `token`.
    pub fn verify_tcti(
        &self,
        cd: &CryptDevice,
        token: u32,
        tcti: Option<&Tcti>,
    ) -> Option<Box<dyn SecretStore>> {
        let mut store = match self.connector.connect(tcti) {
            Ok(store) => store,
            Err(e) => {
                log::debug!("Cannot connect to TPM: {e}.");
                return None;
            }
        };

        let record = read_record(cd, token).ok()?;
        verify_binding(store.as_mut(), &record).then_some(store)
    }

    /// Locate the module holding the secret of `token`: the access broker
    /// first, then resource manager devices from index 0 up to the first
    /// one missing.
    pub fn find_backend_for_token(
        &self,
        cd: &CryptDevice,
        token: u32,
    ) -> Option<(Tcti, Box<dyn SecretStore>)> {
        let tabrmd = Tcti::tabrmd();
        log::debug!("Verifying TCTI '{tabrmd}' for token {token}.");
        if let Some(store) = self.verify_tcti(cd, token, Some(&tabrmd)) {
            return Some((tabrmd, store));
        }

        for i in 0..DEVICE_LIMIT {
            let path = format!("/dev/tpmrm{i}");
            log::debug!("Checking TPM device: '{path}'");

            if !self.connector.device_accessible(Path::new(&path)) {
                log::debug!("Device {path} does not exist.");
                break;
            }

            let tcti = Tcti::device(&path);
            log::debug!("Device exists, verifying TCTI '{tcti}' for token {token}.");
            if let Some(store) = self.verify_tcti(cd, token, Some(&tcti)) {
                return Some((tcti, store));
            }
        }

        None
    }

    pub fn open(&self, cd: &CryptDevice, token: u32) -> Result<SecretBuffer> {
        self.open_with_pin(cd, token, None)
    }

    pub fn open_pin(&self, cd: &CryptDevice, token: u32, pin: &[u8]) -> Result<SecretBuffer> {
        self.open_with_pin(cd, token, Some(pin))
    }

    fn open_with_pin(&self, cd: &CryptDevice, token: u32, pin: Option<&[u8]>) -> Result<SecretBuffer> {
        let Some((tcti, mut store)) = self.find_backend_for_token(cd, token) else {
            log::error!("Couldn't find a TPM device associated with the TPM token.");
            return Err(TokenError::InvalidArgument);
        };
        log::debug!("Token {token} is held by TPM '{tcti}'.");

        let record = read_record(cd, token)?;

        if record.pin && pin.is_none() {
            if record.da_protect {
                log::warn!(
                    "TPM stored password has dictionary attack protection turned on. \
                     Don't enter password too many times."
                );
            }
            return Err(TokenError::TryAgain);
        }

        let auth = if record.pin { pin } else { None };
        let policy = NvPolicy {
            pcrs: record.pcrs,
            banks: record.pcr_banks,
        };

        store
            .nv_read(record.nv_index, auth, policy, record.key_size)
            .map_err(|e| {
                log::error!("Failed to read passphrase NV index: {e}.");
                nv_access_error(e)
            })
    }

    pub fn validate(&self, _cd: &CryptDevice, json: &str) -> Result<()> {
        Tpm2Token::from_json(json).map(|_| ())
    }

    pub fn dump(&self, _cd: &CryptDevice, json: &str, out: &mut dyn Write) -> std::io::Result<()> {
        match Tpm2Token::from_json(json) {
            Ok(record) => dump::dump(&record, out),
            Err(_) => {
                log::error!("Cannot read JSON token metadata.");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendResult;
    use crate::record::PcrBanks;
    use zeroize::Zeroizing;

    struct NonceStore(BackendResult<Vec<u8>>);

    impl SecretStore for NonceStore {
        fn supports_pcr_banks(&mut self, _banks: PcrBanks, _pcrs: u32) -> BackendResult<bool> {
            Ok(true)
        }

        fn get_random(&mut self, len: usize) -> BackendResult<Zeroizing<Vec<u8>>> {
            Ok(Zeroizing::new(vec![0; len]))
        }

        fn nv_define_and_write(
            &mut self,
            _index: Option<u32>,
            _data: &[u8],
            _auth: Option<&[u8]>,
            _policy: NvPolicy,
            _da_protect: bool,
        ) -> BackendResult<u32> {
            Err(BackendError::Failed("read only".into()))
        }

        fn nv_read(
            &mut self,
            _index: u32,
            auth: Option<&[u8]>,
            policy: NvPolicy,
            _len: usize,
        ) -> BackendResult<Zeroizing<Vec<u8>>> {
            assert_eq!(auth, None);
            assert_eq!(policy, NvPolicy::NONCE);
            self.0.clone().map(Zeroizing::new)
        }

        fn nv_undefine(&mut self, _index: u32) -> BackendResult<()> {
            Ok(())
        }
    }

    fn record(nonce: &[u8]) -> Tpm2Token {
        Tpm2Token::new(10, 11, nonce, 0, PcrBanks::SHA256, false, false, 64)
    }

    #[test]
    fn test_binding_matches() {
        let nonce = [7u8; NONCE_SIZE];
        assert!(verify_binding(&mut NonceStore(Ok(nonce.to_vec())), &record(&nonce)));
    }

    #[test]
    fn test_binding_other_nonce() {
        let nonce = [7u8; NONCE_SIZE];
        let mut other = nonce;
        other[NONCE_SIZE - 1] = 8;
        assert!(!verify_binding(&mut NonceStore(Ok(other.to_vec())), &record(&nonce)));
    }

    #[test]
    fn test_binding_read_failure() {
        let nonce = [7u8; NONCE_SIZE];
        let mut store = NonceStore(Err(BackendError::Failed("NV index not defined".into())));
        assert!(!verify_binding(&mut store, &record(&nonce)));
    }

    #[test]
    fn test_nv_access_error() {
        assert_eq!(
            nv_access_error(BackendError::AuthFailed),
            TokenError::PermissionDenied
        );
        assert_eq!(
            nv_access_error(BackendError::Failed("session".into())),
            TokenError::AccessDenied
        );
    }
}
