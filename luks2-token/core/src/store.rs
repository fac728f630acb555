//! Token records in the header.

use std::io::Write;
use std::sync::Arc;

use serde_json::Value;

use crate::device::CryptDevice;
use crate::error::{Result, TokenError};
use crate::handler::{is_builtin_candidate, TokenHandler};
use crate::header::{self, Header, MAX_TOKENS, Target};

/// Classification of a token slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    /// Id out of range.
    Invalid,
    /// No record stored.
    Inactive,
    /// Builtin type with a handler.
    Internal,
    /// Builtin type without a handler.
    InternalUnknown,
    /// External type whose handler resolved.
    External,
    /// External type with no loadable handler.
    ExternalUnknown,
}

/// Structural checks every token record must pass. Returns its type.
fn validate_record(hdr: &Header, record: &Value) -> Result<String> {
    let Some(object) = record.as_object() else {
        log::debug!("Token is not a JSON object.");
        return Err(TokenError::InvalidArgument);
    };

    let type_name = match object.get("type").and_then(Value::as_str) {
        Some(type_name) if !type_name.is_empty() => type_name,
        _ => {
            log::debug!("Token has no valid type.");
            return Err(TokenError::InvalidArgument);
        }
    };

    let Some(keyslots) = object.get("keyslots").and_then(Value::as_array) else {
        log::debug!("Token has no keyslots array.");
        return Err(TokenError::InvalidArgument);
    };

    for keyslot in keyslots {
        let id = keyslot.as_str().and_then(header::parse_id);
        match id {
            Some(id) if hdr.keyslot(id).is_some() => {}
            _ => {
                log::debug!("Token references invalid keyslot {keyslot}.");
                return Err(TokenError::InvalidArgument);
            }
        }
    }

    Ok(type_name.to_string())
}

fn record_type(record: &Value) -> Option<&str> {
    record.get("type").and_then(Value::as_str)
}

impl CryptDevice {
    /// Store `json` as token `token`, or delete the token when `json` is `None`.
    ///
    /// Returns the id written. On any failure the token map is unchanged.
    pub fn token_create(&mut self, token: Target, json: Option<&str>) -> Result<u32> {
        let token = match token {
            Target::Any => {
                if json.is_none() {
                    return Err(TokenError::InvalidArgument);
                }
                self.token_find_free().ok_or_else(|| {
                    log::debug!("No free token slot.");
                    TokenError::NoSpace
                })?
            }
            Target::Id(id) => id,
        };

        if token >= MAX_TOKENS {
            return Err(TokenError::InvalidArgument);
        }

        let Some(json) = json else {
            self.header.remove_token(token);
            log::debug!("Token {token} removed.");
            return Ok(token);
        };

        let record: Value = serde_json::from_str(json).map_err(|_| {
            log::debug!("Token JSON parse failed.");
            TokenError::InvalidArgument
        })?;

        let type_name = validate_record(&self.header, &record)?;
        let handler = self.registry.find(&type_name);

        if is_builtin_candidate(&type_name) && handler.is_none() {
            log::debug!("{type_name} is builtin token candidate with missing handler");
            return Err(TokenError::InvalidArgument);
        }

        if let Some(handler) = &handler {
            if handler.capabilities().validate && handler.validate(self, json).is_err() {
                log::debug!("Token type {} validation failed.", handler.name());
                return Err(TokenError::InvalidArgument);
            }
        }

        let previous = self.header.token(token).cloned();
        self.header.insert_token(token, record);

        if let Err(e) = self.header.check_json_size() {
            log::debug!("Not enough space in header json area for new token.");
            match previous {
                Some(previous) => self.header.insert_token(token, previous),
                None => {
                    self.header.remove_token(token);
                }
            }
            return Err(e);
        }

        Ok(token)
    }

    pub fn token_find_free(&self) -> Option<u32> {
        (0..MAX_TOKENS).find(|id| self.header.token(*id).is_none())
    }

    /// Status of `token` and, for an active token, its type name.
    pub fn token_status(&self, token: u32) -> (TokenStatus, Option<String>) {
        if token >= MAX_TOKENS {
            return (TokenStatus::Invalid, None);
        }

        let Some(record) = self.header.token(token) else {
            return (TokenStatus::Inactive, None);
        };

        let type_name = record_type(record).unwrap_or_default().to_string();
        let builtin = is_builtin_candidate(&type_name);

        let status = match (self.registry.find(&type_name).is_some(), builtin) {
            (true, true) => TokenStatus::Internal,
            (true, false) => TokenStatus::External,
            (false, true) => TokenStatus::InternalUnknown,
            (false, false) => TokenStatus::ExternalUnknown,
        };

        (status, Some(type_name))
    }

    /// Compact serialization of the stored record.
    pub fn token_json_get(&self, token: u32) -> Result<String> {
        let record = self.header.token(token).ok_or(TokenError::InvalidArgument)?;
        serde_json::to_string(record).map_err(|_| TokenError::InvalidArgument)
    }

    pub fn token_count(&self) -> usize {
        self.header.token_ids().len()
    }

    /// Handler for the type of token `token`, loading it if needed.
    pub(crate) fn token_handler(&self, token: u32) -> Option<Arc<dyn TokenHandler>> {
        let type_name = record_type(self.header.token(token)?)?;
        self.registry.find(type_name)
    }

    /// Let the token's handler describe the record. Silent when no handler
    /// with a dump capability resolves.
    pub fn token_dump(&self, token: u32, out: &mut dyn Write) -> std::io::Result<()> {
        let Some(handler) = self.token_handler(token) else {
            return Ok(());
        };

        if !handler.capabilities().dump {
            return Ok(());
        }

        match self.token_json_get(token) {
            Ok(json) => handler.dump(self, &json, out),
            Err(_) => Ok(()),
        }
    }

    /// The `Tokens:` section of a header dump.
    pub fn tokens_dump(&self, out: &mut dyn Write) -> std::io::Result<()> {
        writeln!(out, "Tokens:")?;
        for token in self.header.token_ids() {
            let type_name = self
                .header
                .token(token)
                .and_then(record_type)
                .unwrap_or_default();
            writeln!(out, "  {token}: {type_name}")?;

            self.token_dump(token, out)?;

            for keyslot in self.token_keyslots(token) {
                writeln!(out, "\tKeyslot:  {keyslot}")?;
            }
        }
        Ok(())
    }
}
