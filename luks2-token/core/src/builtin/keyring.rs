//! `luks2-keyring`: passphrase stored in the kernel keyring.
//!
//! The token record names a user key by description; opening the token reads
//! that key's payload.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use zeroize::Zeroizing;

use crate::device::CryptDevice;
use crate::error::{Result, TokenError};
use crate::handler::{Capabilities, HandlerKind, SecretBuffer, TokenHandler};

pub const KEYRING_TOKEN: &str = "luks2-keyring";

/// Read access to user keys of the kernel keyring.
pub trait KernelKeyring: Send + Sync {
    fn read_user_key(&self, description: &str) -> Result<SecretBuffer>;
}

/// Keyring kept in process memory.
#[derive(Default)]
pub struct MemoryKeyring {
    keys: Mutex<HashMap<String, Zeroizing<Vec<u8>>>>,
}

impl MemoryKeyring {
    pub fn add_user_key(&self, description: &str, payload: &[u8]) {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(description.to_string(), Zeroizing::new(payload.to_vec()));
    }

    pub fn unlink(&self, description: &str) {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(description);
    }
}

impl KernelKeyring for MemoryKeyring {
    fn read_user_key(&self, description: &str) -> Result<SecretBuffer> {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(description)
            .cloned()
            .ok_or(TokenError::NotFound)
    }
}

fn key_description(json: &str) -> Option<String> {
    let token: Value = serde_json::from_str(json).ok()?;
    token.get("key_description")?.as_str().map(str::to_string)
}

pub struct KeyringHandler {
    keyring: Arc<dyn KernelKeyring>,
}

impl KeyringHandler {
    pub fn new(keyring: Arc<dyn KernelKeyring>) -> Self {
        Self { keyring }
    }
}

impl TokenHandler for KeyringHandler {
    fn name(&self) -> &str {
        KEYRING_TOKEN
    }

    fn kind(&self) -> HandlerKind {
        HandlerKind::Builtin
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            open_pin: false,
            validate: true,
            dump: true,
            buffer_free: false,
        }
    }

    fn open(&self, cd: &CryptDevice, token: u32) -> Result<SecretBuffer> {
        let json = cd.token_json_get(token)?;
        let description = key_description(&json).ok_or(TokenError::InvalidArgument)?;

        self.keyring.read_user_key(&description).inspect_err(|e| {
            log::debug!("Reading keyring key {description} failed: {e}.");
        })
    }

    fn validate(&self, _cd: &CryptDevice, json: &str) -> Result<()> {
        if key_description(json).is_none() {
            log::debug!("Keyring token lacks a key_description string.");
            return Err(TokenError::InvalidArgument);
        }
        Ok(())
    }

    fn dump(&self, _cd: &CryptDevice, json: &str, out: &mut dyn Write) -> std::io::Result<()> {
        if let Some(description) = key_description(json) {
            writeln!(out, "\tKey description: {description}")?;
        }
        Ok(())
    }
}
