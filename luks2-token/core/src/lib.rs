//! Pluggable token layer of a LUKS2-style header.
//!
//! Tokens are JSON records in the header describing how the passphrase of
//! one or more keyslots can be obtained without typing it. Each token `type`
//! is served by a [`TokenHandler`], either compiled in or resolved by name
//! from an external library through the [`Registry`].

pub mod abi;
pub mod activate;
pub mod assign;
pub mod builtin;
pub mod device;
pub mod error;
pub mod handler;
pub mod header;
pub mod keyslot;
pub mod registry;
pub mod store;

pub use activate::{ActivateFlags, DetachedActivator, DeviceActivator, TokenRequest};
pub use device::CryptDevice;
pub use error::{Result, TokenError};
pub use handler::{Capabilities, HandlerKind, SecretBuffer, TokenHandler};
pub use header::{Header, Target};
pub use keyslot::{HkdfKeyslotCipher, KeyslotCipher, VolumeKey};
pub use registry::{HandlerRegistry, Registry};
pub use store::TokenStatus;
