//! Unlocking a device through its tokens.
//!
//! A token is opened by its handler, the returned secret is tried against
//! the keyslots bound to the token, and the recovered volume key is handed
//! to a [`DeviceActivator`]. The secret returned by a handler is released on
//! every path, through the handler's `buffer_free` when it has one.

use std::sync::Arc;

use serde_json::Value;

use crate::device::CryptDevice;
use crate::error::{Result, TokenError};
use crate::handler::{is_builtin_candidate, SecretBuffer, TokenHandler};
use crate::header::{self, CIPHER_NULL, MAX_TOKENS, Target};
use crate::keyslot::VolumeKey;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActivateFlags {
    /// Accept a key that is not bound to the default segment.
    pub allow_unbound_key: bool,
    /// Pass the volume key through the kernel keyring.
    pub keyring_key: bool,
}

/// Device-mapper side of activation.
pub trait DeviceActivator: Send {
    /// Whether volume keys may be loaded into the kernel keyring.
    fn keyring_enabled(&self) -> bool {
        false
    }

    fn load_volume_key(&mut self, keyslot: u32, volume_key: &[u8]) -> Result<()>;

    fn activate(&mut self, name: &str, volume_key: &[u8], flags: ActivateFlags) -> Result<()>;

    /// Remove a key loaded by [`DeviceActivator::load_volume_key`].
    fn drop_volume_key(&mut self, volume_key: &[u8]);
}

/// Activator for headers not attached to a block device. Unlocking works,
/// mapping does not.
pub struct DetachedActivator;

impl DeviceActivator for DetachedActivator {
    fn load_volume_key(&mut self, _keyslot: u32, _volume_key: &[u8]) -> Result<()> {
        Err(TokenError::Unsupported)
    }

    fn activate(&mut self, name: &str, _volume_key: &[u8], _flags: ActivateFlags) -> Result<()> {
        log::debug!("Cannot activate {name}: no block device attached.");
        Err(TokenError::Unsupported)
    }

    fn drop_volume_key(&mut self, _volume_key: &[u8]) {}
}

/// Parameters of [`CryptDevice::token_open_and_activate`].
#[derive(Debug, Clone, Copy)]
pub struct TokenRequest<'a> {
    pub token: Target,
    pub segment: Option<u32>,
    /// Mapping name. Without one the device is only unlocked.
    pub name: Option<&'a str>,
    /// Only tokens of this type are tried.
    pub token_type: Option<&'a str>,
    pub pin: Option<&'a [u8]>,
    pub flags: ActivateFlags,
}

impl<'a> TokenRequest<'a> {
    pub fn new(token: Target) -> Self {
        Self {
            token,
            segment: None,
            name: None,
            token_type: None,
            pin: None,
            flags: ActivateFlags::default(),
        }
    }

    pub fn segment(mut self, segment: u32) -> Self {
        self.segment = Some(segment);
        self
    }

    pub fn name(mut self, name: &'a str) -> Self {
        self.name = Some(name);
        self
    }

    pub fn token_type(mut self, token_type: &'a str) -> Self {
        self.token_type = Some(token_type);
        self
    }

    pub fn pin(mut self, pin: &'a [u8]) -> Self {
        self.pin = Some(pin);
        self
    }

    pub fn flags(mut self, flags: ActivateFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Narrow the result of a handler outside the builtin namespace: it may not
/// report `InvalidArgument` or `NotFound` to the caller.
fn translate_error(handler: &dyn TokenHandler, result: Result<SecretBuffer>) -> Result<SecretBuffer> {
    match result {
        Err(e @ (TokenError::InvalidArgument | TokenError::NotFound))
            if !is_builtin_candidate(handler.name()) =>
        {
            log::debug!(
                "{} token handler returned {}. Changing to {}.",
                handler.name(),
                e.code(),
                TokenError::PermissionDenied.code()
            );
            Err(TokenError::PermissionDenied)
        }
        other => other,
    }
}

fn release(handler: &dyn TokenHandler, buffer: SecretBuffer) {
    if handler.capabilities().buffer_free {
        handler.buffer_free(buffer);
    } else {
        drop(buffer);
    }
}

impl CryptDevice {
    fn activation_segment(&self, request: &TokenRequest<'_>) -> Result<Target> {
        if let Some(segment) = request.segment {
            return Ok(Target::Id(segment));
        }

        if request.flags.allow_unbound_key {
            return Ok(Target::Any);
        }

        self.header
            .default_segment()
            .map(Target::Id)
            .ok_or(TokenError::InvalidArgument)
    }

    /// `Ok` when a keyslot bound to `record` serves `segment`.
    fn token_for_segment(&self, record: &Value, segment: Target) -> Result<()> {
        let keyslots = header::id_list(record.get("keyslots")).ok_or(TokenError::InvalidArgument)?;

        // no assigned keyslot is NotFound even for any segment
        if keyslots.is_empty() {
            return Err(TokenError::NotFound);
        }

        if segment == Target::Any {
            return Ok(());
        }

        let mut result = Err(TokenError::NotFound);
        for keyslot in keyslots {
            result = self.header.keyslot_for_segment(keyslot, segment);
            if result != Err(TokenError::NotFound) {
                return result;
            }
        }
        result
    }

    fn token_open(
        &self,
        token: u32,
        segment: Target,
        request: &TokenRequest<'_>,
    ) -> Result<(Arc<dyn TokenHandler>, SecretBuffer)> {
        let record = self.header.token(token).ok_or(TokenError::NotFound)?;

        if let Some(token_type) = request.token_type {
            let record_type = record
                .get("type")
                .and_then(Value::as_str)
                .ok_or(TokenError::InvalidArgument)?;
            if record_type != token_type {
                return Err(TokenError::NotFound);
            }
        }

        if let Err(e) = self.token_for_segment(record, segment) {
            if e == TokenError::NotFound {
                log::debug!("Token {token} unusable for segment {segment:?}.");
            }
            return Err(e);
        }

        let handler = self.token_handler(token).ok_or(TokenError::NotFound)?;

        if handler.capabilities().validate {
            let json = self.token_json_get(token)?;
            if handler.validate(self, &json).is_err() {
                log::debug!("Token {token} ({}) validation failed.", handler.name());
                return Err(TokenError::NotFound);
            }
        }

        let result = match request.pin {
            Some(_) if !handler.capabilities().open_pin => Err(TokenError::NotFound),
            Some(pin) => translate_error(handler.as_ref(), handler.open_pin(self, token, pin)),
            None => translate_error(handler.as_ref(), handler.open(self, token)),
        };

        match result {
            Ok(buffer) => Ok((handler, buffer)),
            Err(e) => {
                log::debug!("Token {token} ({}) open failed with {}.", handler.name(), e.code());
                Err(e)
            }
        }
    }

    /// Try `secret` on the keyslots bound to `token`, in assignment order.
    fn keyslot_open_by_token(
        &self,
        token: u32,
        segment: Target,
        secret: &[u8],
    ) -> Result<(u32, VolumeKey)> {
        let mut result = Err(TokenError::NotFound);

        for keyslot in self.token_keyslots(token) {
            log::debug!("Trying to open keyslot {keyslot} with token {token}.");
            match self.keyslot_open(keyslot, segment, secret) {
                Ok(volume_key) => return Ok((keyslot, volume_key)),
                Err(e) => result = Err(e),
            }
        }

        result
    }

    fn token_unlock(
        &self,
        token: u32,
        segment: Target,
        request: &TokenRequest<'_>,
    ) -> Result<(u32, VolumeKey)> {
        let (handler, secret) = self.token_open(token, segment, request)?;
        let result = self.keyslot_open_by_token(token, segment, &secret);
        release(handler.as_ref(), secret);
        result
    }

    fn use_keyring(&self, request: &TokenRequest<'_>, segment: Target) -> bool {
        if !self.activator.keyring_enabled() {
            return false;
        }

        let segment = match segment {
            Target::Id(segment) => Some(segment),
            Target::Any => self.header.default_segment(),
        };
        let cipher_null = segment
            .and_then(|segment| self.header.segment_cipher(segment))
            .is_some_and(|cipher| cipher == CIPHER_NULL);

        (request.name.is_some() && !cipher_null) || request.flags.keyring_key
    }

    /// Unlock the device with a token and, when a name is given, activate it.
    ///
    /// With `Target::Any` every token is tried in ascending id order until
    /// one either succeeds or fails with something other than `NotFound` or
    /// `PermissionDenied`. Returns the unlocked keyslot.
    pub fn token_open_and_activate(&mut self, request: &TokenRequest<'_>) -> Result<u32> {
        let segment = self.activation_segment(request)?;

        let unlocked = match request.token {
            Target::Id(token) if token >= MAX_TOKENS => return Err(TokenError::InvalidArgument),
            Target::Id(token) => self.token_unlock(token, segment, request),
            Target::Any => {
                let mut result = Err(TokenError::NotFound);
                for token in self.header.token_ids() {
                    result = self.token_unlock(token, segment, request);
                    if !matches!(
                        result,
                        Err(TokenError::NotFound | TokenError::PermissionDenied)
                    ) {
                        break;
                    }
                }
                result
            }
        };

        let (keyslot, volume_key) = unlocked?;
        let mut flags = request.flags;
        let mut result = Ok(());

        if self.use_keyring(request, segment) {
            result = self.activator.load_volume_key(keyslot, &volume_key);
            match result {
                Ok(()) => flags.keyring_key = true,
                Err(e) => log::debug!("Loading volume key into keyring failed: {e}."),
            }
        }

        if let (Ok(()), Some(name)) = (result, request.name) {
            result = self.activator.activate(name, &volume_key, flags);
        }

        if let Err(e) = result {
            self.activator.drop_volume_key(&volume_key);
            return Err(e);
        }

        Ok(keyslot)
    }
}
