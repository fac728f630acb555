//! Seam to the secret store holding token secrets.
//!
//! The token handler only needs NV indices gated by a PCR policy and a
//! random source. Everything about talking to the TPM itself lives behind
//! [`SecretStore`].

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use nix::unistd::{AccessFlags, access};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::record::PcrBanks;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The store rejected the supplied authorization (PIN or policy).
    #[error("authorization failed")]
    AuthFailed,

    #[error("{0}")]
    Failed(String),
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Backend specifier in the form `<name>[:<argument>]`, e.g.
/// `device:/dev/tpmrm0` or `tabrmd`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tcti {
    name: String,
    arg: Option<String>,
}

impl Tcti {
    /// The resident access broker daemon.
    pub fn tabrmd() -> Self {
        Self {
            name: "tabrmd".into(),
            arg: None,
        }
    }

    pub fn device(path: &str) -> Self {
        Self {
            name: "device".into(),
            arg: Some(path.into()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arg(&self) -> Option<&str> {
        self.arg.as_deref()
    }
}

impl FromStr for Tcti {
    type Err = BackendError;

    fn from_str(s: &str) -> BackendResult<Self> {
        let (name, arg) = match s.split_once(':') {
            Some((name, arg)) => (name, Some(arg.to_string())),
            None => (s, None),
        };

        if name.is_empty() {
            return Err(BackendError::Failed(format!("invalid TCTI specification '{s}'")));
        }

        Ok(Self {
            name: name.to_string(),
            arg,
        })
    }
}

impl fmt::Display for Tcti {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.arg {
            Some(arg) => write!(f, "{}:{}", self.name, arg),
            None => f.write_str(&self.name),
        }
    }
}

/// PCR policy gating an NV index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NvPolicy {
    pub pcrs: u32,
    pub banks: PcrBanks,
}

impl NvPolicy {
    /// Policy of the identification nonce: readable by anyone on the module.
    pub const NONCE: NvPolicy = NvPolicy {
        pcrs: 0,
        banks: PcrBanks::SHA1,
    };
}

/// One open session with a secret store.
pub trait SecretStore {
    /// Whether every bank in `banks` is available for the PCRs in `pcrs`.
    fn supports_pcr_banks(&mut self, banks: PcrBanks, pcrs: u32) -> BackendResult<bool>;

    fn get_random(&mut self, len: usize) -> BackendResult<Zeroizing<Vec<u8>>>;

    /// Define an NV index holding `data` and write it. `index` picks the
    /// handle; `None` takes the first free one. Returns the handle used.
    fn nv_define_and_write(
        &mut self,
        index: Option<u32>,
        data: &[u8],
        auth: Option<&[u8]>,
        policy: NvPolicy,
        da_protect: bool,
    ) -> BackendResult<u32>;

    fn nv_read(
        &mut self,
        index: u32,
        auth: Option<&[u8]>,
        policy: NvPolicy,
        len: usize,
    ) -> BackendResult<Zeroizing<Vec<u8>>>;

    fn nv_undefine(&mut self, index: u32) -> BackendResult<()>;
}

/// Opens sessions with secret stores.
pub trait SecretStoreConnector: Send + Sync {
    /// Connect to the store behind `tcti`, or the default one for `None`.
    fn connect(&self, tcti: Option<&Tcti>) -> BackendResult<Box<dyn SecretStore>>;

    /// Whether the device node at `path` can be opened for reading and writing.
    fn device_accessible(&self, path: &Path) -> bool {
        access(path, AccessFlags::R_OK | AccessFlags::W_OK).is_ok()
    }
}

/// Connector for builds without a TPM backend.
pub struct UnavailableConnector;

impl SecretStoreConnector for UnavailableConnector {
    fn connect(&self, tcti: Option<&Tcti>) -> BackendResult<Box<dyn SecretStore>> {
        Err(BackendError::Failed(format!(
            "no TPM backend available for {}",
            tcti.map(Tcti::to_string).unwrap_or_else(|| "default TCTI".into())
        )))
    }
}
