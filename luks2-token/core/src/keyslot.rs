//! Keyslots: the volume key wrapped under a secret.
//!
//! How a keyslot protects the key is up to the [`KeyslotCipher`]. Which
//! segments a volume key unlocks, and how a recovered key is verified, is
//! recorded in digest objects: each digest lists its keyslots and segments
//! and carries a salted SHA-256 of the volume key.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::device::CryptDevice;
use crate::error::{Result, TokenError};
use crate::header::{self, MAX_KEYSLOTS, Target};

/// Volume key recovered from a keyslot. Wiped when dropped.
pub type VolumeKey = Zeroizing<Vec<u8>>;

const SALT_LEN: usize = 32;
const KEYSLOT_INFO: &[u8] = b"luks2-token keyslot area";

/// Keyslot encryption format.
pub trait KeyslotCipher: Send + Sync {
    /// Build the keyslot object storing `volume_key` under `secret`.
    fn wrap_key(&self, volume_key: &[u8], secret: &[u8]) -> Result<Value>;

    /// Recover the key stored in `keyslot`. A wrong secret yields a wrong
    /// key; the digest check catches it.
    fn unwrap_key(&self, keyslot: &Value, secret: &[u8]) -> Result<VolumeKey>;
}

/// Volume key XOR-ed with an HKDF-SHA256 keystream of the secret.
pub struct HkdfKeyslotCipher;

fn keystream(salt: &[u8], secret: &[u8], len: usize) -> Result<Zeroizing<Vec<u8>>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), secret);
    let mut okm = Zeroizing::new(vec![0u8; len]);
    hk.expand(KEYSLOT_INFO, okm.as_mut_slice())
        .map_err(|_| TokenError::InvalidArgument)?;
    Ok(okm)
}

fn decode_field(object: &Value, name: &str) -> Result<Vec<u8>> {
    object
        .get(name)
        .and_then(Value::as_str)
        .and_then(|s| B64.decode(s).ok())
        .ok_or(TokenError::InvalidArgument)
}

impl KeyslotCipher for HkdfKeyslotCipher {
    fn wrap_key(&self, volume_key: &[u8], secret: &[u8]) -> Result<Value> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);

        let stream = keystream(&salt, secret, volume_key.len())?;
        let area: Vec<u8> = volume_key
            .iter()
            .zip(stream.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        Ok(json!({
            "type": "hkdf-sha256",
            "key_size": volume_key.len(),
            "salt": B64.encode(salt),
            "area": B64.encode(area),
        }))
    }

    fn unwrap_key(&self, keyslot: &Value, secret: &[u8]) -> Result<VolumeKey> {
        if keyslot.get("type").and_then(Value::as_str) != Some("hkdf-sha256") {
            return Err(TokenError::InvalidArgument);
        }

        let salt = decode_field(keyslot, "salt")?;
        let area = Zeroizing::new(decode_field(keyslot, "area")?);
        let stream = keystream(&salt, secret, area.len())?;

        Ok(Zeroizing::new(
            area.iter().zip(stream.iter()).map(|(a, s)| a ^ s).collect(),
        ))
    }
}

fn key_digest(salt: &[u8], volume_key: &[u8]) -> Vec<u8> {
    Sha256::new()
        .chain_update(salt)
        .chain_update(volume_key)
        .finalize()
        .to_vec()
}

fn digest_new(volume_key: &[u8], segments: &[u32]) -> Value {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);

    json!({
        "type": "sha256",
        "keyslots": [],
        "segments": segments.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        "salt": B64.encode(salt),
        "digest": B64.encode(key_digest(&salt, volume_key)),
    })
}

fn digest_verify(digest: &Value, volume_key: &[u8]) -> Result<bool> {
    let salt = decode_field(digest, "salt")?;
    let expected = decode_field(digest, "digest")?;
    Ok(key_digest(&salt, volume_key) == expected)
}

impl CryptDevice {
    pub fn keyslot_find_free(&self) -> Option<u32> {
        (0..MAX_KEYSLOTS).find(|id| self.header.keyslot(*id).is_none())
    }

    /// Recover the volume key from `keyslot` for use with `segment`.
    ///
    /// A secret that does not unlock the keyslot is `PermissionDenied`.
    pub fn keyslot_open(&self, keyslot: u32, segment: Target, secret: &[u8]) -> Result<VolumeKey> {
        self.header.keyslot_for_segment(keyslot, segment)?;

        let object = self.header.keyslot(keyslot).ok_or(TokenError::NotFound)?;
        let (_, digest) = self
            .header
            .digest_for_keyslot(keyslot)
            .ok_or(TokenError::NotFound)?;

        let volume_key = self.cipher.unwrap_key(object, secret)?;
        if !digest_verify(digest, &volume_key)? {
            return Err(TokenError::PermissionDenied);
        }

        Ok(volume_key)
    }

    /// Unlock any keyslot with `passphrase`.
    pub fn volume_key_by_passphrase(&self, passphrase: &[u8]) -> Result<VolumeKey> {
        for keyslot in self.header.keyslot_ids() {
            match self.keyslot_open(keyslot, Target::Any, passphrase) {
                Ok(volume_key) => {
                    log::debug!("Passphrase unlocked keyslot {keyslot}.");
                    return Ok(volume_key);
                }
                Err(e) => log::debug!("Keyslot {keyslot} open failed: {e}."),
            }
        }
        Err(TokenError::PermissionDenied)
    }

    /// Store `volume_key` in a new keyslot protected by `secret`.
    ///
    /// The first keyslot creates the digest binding the key to every segment;
    /// later keys must match that digest.
    pub fn keyslot_add_by_volume_key(
        &mut self,
        keyslot: Target,
        volume_key: &[u8],
        secret: &[u8],
    ) -> Result<u32> {
        let keyslot = match keyslot {
            Target::Any => self.keyslot_find_free().ok_or(TokenError::NoSpace)?,
            Target::Id(id) if id >= MAX_KEYSLOTS => return Err(TokenError::InvalidArgument),
            Target::Id(id) if self.header.keyslot(id).is_some() => {
                log::debug!("Keyslot {id} is already active.");
                return Err(TokenError::InvalidArgument);
            }
            Target::Id(id) => id,
        };

        let mut matching = None;
        for (key, digest) in self.header.digests() {
            if digest_verify(digest, volume_key)? {
                matching = Some(key.clone());
                break;
            }
        }

        let object = self.cipher.wrap_key(volume_key, secret)?;
        let snapshot = self.header.clone();
        let digest_key = match matching {
            Some(key) => key,
            None if self.header.digests().is_empty() => {
                let segments = self.header.segment_ids();
                self.header
                    .digests_mut()
                    .insert(header::id_key(0), digest_new(volume_key, &segments));
                header::id_key(0)
            }
            None => {
                log::debug!("Volume key does not match the header digest.");
                return Err(TokenError::PermissionDenied);
            }
        };

        self.header.insert_keyslot(keyslot, object);
        if let Some(list) = self
            .header
            .digests_mut()
            .get_mut(&digest_key)
            .and_then(|digest| digest.get_mut("keyslots"))
        {
            header::push_id(list, keyslot);
        }

        if let Err(e) = self.header.check_json_size() {
            self.header = snapshot;
            return Err(e);
        }

        log::debug!("Keyslot {keyslot} added.");
        Ok(keyslot)
    }

    /// Add a keyslot for `new_secret`, authorized by an existing passphrase.
    pub fn keyslot_add_by_passphrase(
        &mut self,
        keyslot: Target,
        passphrase: &[u8],
        new_secret: &[u8],
    ) -> Result<u32> {
        let volume_key = self.volume_key_by_passphrase(passphrase)?;
        self.keyslot_add_by_volume_key(keyslot, &volume_key, new_secret)
    }

    /// Wipe `keyslot` and drop every reference to it.
    pub fn keyslot_destroy(&mut self, keyslot: u32) -> Result<()> {
        if keyslot >= MAX_KEYSLOTS {
            return Err(TokenError::InvalidArgument);
        }

        if self.header.remove_keyslot(keyslot).is_none() {
            return Err(TokenError::NotFound);
        }

        let digests = self.header.digests_mut();
        for digest in digests.values_mut() {
            if let Some(list) = digest.get_mut("keyslots") {
                header::remove_id(list, keyslot);
            }
        }
        digests.retain(|_, digest| {
            header::id_list(digest.get("keyslots")).is_some_and(|ids| !ids.is_empty())
        });

        self.drop_keyslot_assignments(keyslot);

        log::debug!("Keyslot {keyslot} destroyed.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::StaticLoader;
    use crate::builtin::keyring::MemoryKeyring;
    use crate::header::{DEFAULT_JSON_SIZE, Header};
    use crate::registry::{HandlerRegistry, Registry};
    use std::sync::Arc;

    const VK: [u8; 32] = [7u8; 32];

    fn device() -> CryptDevice {
        let registry = Registry::new(HandlerRegistry::new(
            Arc::new(StaticLoader::new()),
            Arc::new(MemoryKeyring::default()),
        ));
        CryptDevice::new(Header::new(DEFAULT_JSON_SIZE), registry)
    }

    #[test]
    fn test_cipher_round_trip_and_wrong_secret() {
        let cipher = HkdfKeyslotCipher;
        let object = cipher.wrap_key(&VK, b"secret").unwrap();
        assert_eq!(cipher.unwrap_key(&object, b"secret").unwrap().as_slice(), &VK);
        assert_ne!(cipher.unwrap_key(&object, b"other").unwrap().as_slice(), &VK);
    }

    #[test]
    fn test_cipher_rejects_foreign_keyslot() {
        let object = json!({"type": "luks2", "salt": "", "area": ""});
        assert_eq!(
            HkdfKeyslotCipher.unwrap_key(&object, b"x").err(),
            Some(TokenError::InvalidArgument)
        );
    }

    #[test]
    fn test_add_and_open() {
        let mut cd = device();
        let slot = cd.keyslot_add_by_volume_key(Target::Any, &VK, b"pass").unwrap();
        assert_eq!(slot, 0);

        let vk = cd.keyslot_open(slot, Target::Id(0), b"pass").unwrap();
        assert_eq!(vk.as_slice(), &VK);
        assert_eq!(
            cd.keyslot_open(slot, Target::Id(0), b"nope").err(),
            Some(TokenError::PermissionDenied)
        );
    }

    #[test]
    fn test_add_by_passphrase() {
        let mut cd = device();
        cd.keyslot_add_by_volume_key(Target::Id(2), &VK, b"pass").unwrap();

        let slot = cd
            .keyslot_add_by_passphrase(Target::Any, b"pass", b"second")
            .unwrap();
        assert_eq!(slot, 0);
        assert_eq!(cd.keyslot_open(0, Target::Any, b"second").unwrap().as_slice(), &VK);

        assert_eq!(
            cd.keyslot_add_by_passphrase(Target::Any, b"wrong", b"third").err(),
            Some(TokenError::PermissionDenied)
        );
    }

    #[test]
    fn test_add_rejects_foreign_volume_key() {
        let mut cd = device();
        cd.keyslot_add_by_volume_key(Target::Any, &VK, b"pass").unwrap();
        assert_eq!(
            cd.keyslot_add_by_volume_key(Target::Any, &[1u8; 32], b"pass").err(),
            Some(TokenError::PermissionDenied)
        );
    }

    #[test]
    fn test_add_occupied_or_out_of_range() {
        let mut cd = device();
        cd.keyslot_add_by_volume_key(Target::Id(1), &VK, b"pass").unwrap();
        assert_eq!(
            cd.keyslot_add_by_volume_key(Target::Id(1), &VK, b"pass").err(),
            Some(TokenError::InvalidArgument)
        );
        assert_eq!(
            cd.keyslot_add_by_volume_key(Target::Id(MAX_KEYSLOTS), &VK, b"pass").err(),
            Some(TokenError::InvalidArgument)
        );
    }

    #[test]
    fn test_add_overflow_rolls_back() {
        let registry = Registry::new(HandlerRegistry::new(
            Arc::new(StaticLoader::new()),
            Arc::new(MemoryKeyring::default()),
        ));
        let hdr = Header::new(DEFAULT_JSON_SIZE);
        let budget = hdr.to_json().unwrap().len() as u64 + 10;
        let mut cd = CryptDevice::new(Header::new(budget), registry);
        let before = cd.header().clone();

        assert_eq!(
            cd.keyslot_add_by_volume_key(Target::Any, &VK, b"pass").err(),
            Some(TokenError::NoSpace)
        );
        assert_eq!(cd.header(), &before);
    }

    #[test]
    fn test_destroy() {
        let mut cd = device();
        cd.keyslot_add_by_volume_key(Target::Any, &VK, b"a").unwrap();
        cd.keyslot_add_by_volume_key(Target::Any, &VK, b"b").unwrap();

        cd.keyslot_destroy(0).unwrap();
        assert!(cd.header().keyslot(0).is_none());
        assert_eq!(cd.keyslot_destroy(0), Err(TokenError::NotFound));
        assert_eq!(cd.keyslot_open(1, Target::Any, b"b").unwrap().as_slice(), &VK);

        cd.keyslot_destroy(1).unwrap();
        assert!(cd.header().digests().is_empty());
    }
}
