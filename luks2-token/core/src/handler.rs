//! The capability set every token handler exposes.

use std::io::Write;

use zeroize::Zeroizing;

use crate::device::CryptDevice;
use crate::error::{Result, TokenError};

/// Secret material handed out by a handler. Wiped when dropped.
pub type SecretBuffer = Zeroizing<Vec<u8>>;

/// Prefix reserved for handlers compiled into this crate.
pub const BUILTIN_PREFIX: &str = "luks2-";

pub fn is_builtin_candidate(type_name: &str) -> bool {
    type_name.starts_with(BUILTIN_PREFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Builtin,
    External { version: u32 },
}

/// Optional capabilities. `open` is mandatory and not listed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub open_pin: bool,
    pub validate: bool,
    pub dump: bool,
    pub buffer_free: bool,
}

/// Code implementing one token `type`.
///
/// Methods backing a capability that [`TokenHandler::capabilities`] does not
/// advertise are never called by the token layer.
pub trait TokenHandler: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> HandlerKind;

    fn capabilities(&self) -> Capabilities;

    /// Retrieve the secret of `token` without user interaction.
    fn open(&self, cd: &CryptDevice, token: u32) -> Result<SecretBuffer>;

    /// Retrieve the secret of `token` using a PIN.
    fn open_pin(&self, _cd: &CryptDevice, _token: u32, _pin: &[u8]) -> Result<SecretBuffer> {
        Err(TokenError::NotFound)
    }

    /// Check a token record before it is stored or used.
    fn validate(&self, _cd: &CryptDevice, _json: &str) -> Result<()> {
        Ok(())
    }

    /// Write a human readable description of a token record.
    fn dump(&self, _cd: &CryptDevice, _json: &str, _out: &mut dyn Write) -> std::io::Result<()> {
        Ok(())
    }

    /// Release a buffer returned by `open`/`open_pin`.
    fn buffer_free(&self, buffer: SecretBuffer) {
        drop(buffer);
    }

    fn version(&self) -> Option<String> {
        None
    }
}
