//! JSON metadata document of a LUKS2-style header.
//!
//! Only the JSON area is modelled here: keyslot, token, segment and digest
//! objects keyed by decimal id strings, plus the `config` object carrying the
//! size of the JSON area. The binary container around it is somebody else's
//! business.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{Result, TokenError};

/// Number of token slots in a header.
pub const MAX_TOKENS: u32 = 32;

/// Number of keyslots in a header.
pub const MAX_KEYSLOTS: u32 = 32;

/// JSON area size of a default 16 KiB header (minus the binary part).
pub const DEFAULT_JSON_SIZE: u64 = 12288;

/// Cipher spec of a segment that does not encrypt.
pub const CIPHER_NULL: &str = "cipher_null-ecb";

/// A concrete id, or "any" for operations that accept a wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Any,
    Id(u32),
}

impl From<u32> for Target {
    fn from(id: u32) -> Self {
        Target::Id(id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    keyslots: Map<String, Value>,
    tokens: Map<String, Value>,
    segments: Map<String, Value>,
    digests: Map<String, Value>,
    config: Map<String, Value>,
}

pub(crate) fn id_key(id: u32) -> String {
    id.to_string()
}

pub(crate) fn parse_id(key: &str) -> Option<u32> {
    key.parse().ok()
}

/// Decimal ids stored in a JSON array of strings, in array order.
pub(crate) fn id_list(array: Option<&Value>) -> Option<Vec<u32>> {
    let array = array?.as_array()?;
    Some(
        array
            .iter()
            .filter_map(|v| v.as_str().and_then(parse_id))
            .collect(),
    )
}

/// Append `id` to a JSON id array unless present. `false` if `list` is not an array.
pub(crate) fn push_id(list: &mut Value, id: u32) -> bool {
    let key = id_key(id);
    match list.as_array_mut() {
        Some(array) => {
            if !array.iter().any(|v| v.as_str() == Some(key.as_str())) {
                array.push(Value::String(key));
            }
            true
        }
        None => false,
    }
}

/// Drop `id` from a JSON id array. `false` if `list` is not an array.
pub(crate) fn remove_id(list: &mut Value, id: u32) -> bool {
    let key = id_key(id);
    match list.as_array_mut() {
        Some(array) => {
            array.retain(|v| v.as_str() != Some(key.as_str()));
            true
        }
        None => false,
    }
}

fn sorted_ids(map: &Map<String, Value>) -> Vec<u32> {
    let mut ids: Vec<u32> = map.keys().filter_map(|k| parse_id(k)).collect();
    ids.sort_unstable();
    ids
}

fn serialize_error(e: serde_json::Error) -> TokenError {
    log::debug!("Header JSON serialization failed: {e}");
    TokenError::InvalidArgument
}

impl Header {
    /// Empty header with a single encrypted segment `0`.
    pub fn new(json_size: u64) -> Self {
        let mut segments = Map::new();
        segments.insert(
            id_key(0),
            json!({
                "type": "crypt",
                "offset": "16777216",
                "size": "dynamic",
                "iv_tweak": "0",
                "encryption": "aes-xts-plain64",
                "sector_size": 512,
            }),
        );

        let mut config = Map::new();
        config.insert("json_size".into(), Value::String(json_size.to_string()));
        config.insert("keyslots_size".into(), Value::String("16744448".into()));

        Self {
            keyslots: Map::new(),
            tokens: Map::new(),
            segments,
            digests: Map::new(),
            config,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let header: Header = serde_json::from_str(json).map_err(|e| {
            log::debug!("Header JSON parse failed: {e}");
            TokenError::InvalidArgument
        })?;

        if header.configured_json_size().is_none() {
            log::debug!("Header config lacks a valid json_size.");
            return Err(TokenError::InvalidArgument);
        }

        Ok(header)
    }

    /// Compact serialization, as written to the JSON area.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(serialize_error)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(serialize_error)
    }

    fn configured_json_size(&self) -> Option<u64> {
        self.config.get("json_size")?.as_str()?.parse().ok()
    }

    /// Size budget of the JSON area in bytes.
    pub fn json_size(&self) -> u64 {
        self.configured_json_size().unwrap_or(DEFAULT_JSON_SIZE)
    }

    /// Fails with `NoSpace` when the serialized document overflows the area.
    pub fn check_json_size(&self) -> Result<()> {
        let len = self.to_json()?.len() as u64;
        if len > self.json_size() {
            log::debug!(
                "JSON metadata of {len} bytes exceeds the {} bytes area.",
                self.json_size()
            );
            return Err(TokenError::NoSpace);
        }
        Ok(())
    }

    pub fn token(&self, id: u32) -> Option<&Value> {
        self.tokens.get(&id_key(id))
    }

    pub(crate) fn token_mut(&mut self, id: u32) -> Option<&mut Value> {
        self.tokens.get_mut(&id_key(id))
    }

    pub(crate) fn insert_token(&mut self, id: u32, token: Value) {
        self.tokens.insert(id_key(id), token);
    }

    pub(crate) fn remove_token(&mut self, id: u32) -> Option<Value> {
        self.tokens.shift_remove(&id_key(id))
    }

    pub(crate) fn tokens_snapshot(&self) -> Map<String, Value> {
        self.tokens.clone()
    }

    pub(crate) fn restore_tokens(&mut self, tokens: Map<String, Value>) {
        self.tokens = tokens;
    }

    /// Existing token ids, ascending.
    pub fn token_ids(&self) -> Vec<u32> {
        sorted_ids(&self.tokens)
    }

    pub fn keyslot(&self, id: u32) -> Option<&Value> {
        self.keyslots.get(&id_key(id))
    }

    pub(crate) fn insert_keyslot(&mut self, id: u32, keyslot: Value) {
        self.keyslots.insert(id_key(id), keyslot);
    }

    pub(crate) fn remove_keyslot(&mut self, id: u32) -> Option<Value> {
        self.keyslots.shift_remove(&id_key(id))
    }

    /// Existing keyslot ids, ascending.
    pub fn keyslot_ids(&self) -> Vec<u32> {
        sorted_ids(&self.keyslots)
    }

    pub fn segment_ids(&self) -> Vec<u32> {
        sorted_ids(&self.segments)
    }

    /// The segment activation uses unless told otherwise.
    pub fn default_segment(&self) -> Option<u32> {
        self.segment_ids().first().copied()
    }

    pub fn segment_cipher(&self, segment: u32) -> Option<&str> {
        self.segments.get(&id_key(segment))?.get("encryption")?.as_str()
    }

    pub(crate) fn digests(&self) -> &Map<String, Value> {
        &self.digests
    }

    pub(crate) fn digests_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.digests
    }

    /// Id and object of the digest that covers `keyslot`.
    pub(crate) fn digest_for_keyslot(&self, keyslot: u32) -> Option<(u32, &Value)> {
        self.digests.iter().find_map(|(key, digest)| {
            let keyslots = id_list(digest.get("keyslots"))?;
            if keyslots.contains(&keyslot) {
                Some((parse_id(key)?, digest))
            } else {
                None
            }
        })
    }

    /// `Ok` when `keyslot` unlocks a key bound to `segment`.
    pub fn keyslot_for_segment(&self, keyslot: u32, segment: Target) -> Result<()> {
        if self.keyslot(keyslot).is_none() {
            return Err(TokenError::NotFound);
        }

        let (_, digest) = self.digest_for_keyslot(keyslot).ok_or(TokenError::NotFound)?;

        match segment {
            Target::Any => Ok(()),
            Target::Id(segment) => {
                let segments = id_list(digest.get("segments")).ok_or(TokenError::InvalidArgument)?;
                if segments.contains(&segment) {
                    Ok(())
                } else {
                    Err(TokenError::NotFound)
                }
            }
        }
    }
}
