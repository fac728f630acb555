//! A header opened for token operations.
//!
//! Token, assignment, keyslot and activation operations are implemented as
//! `impl CryptDevice` blocks in their own modules. A mutating operation
//! assumes exclusive access to the header for its duration; serializing
//! writers across processes is up to whoever persists the header.

use crate::activate::{DetachedActivator, DeviceActivator};
use crate::header::Header;
use crate::keyslot::{HkdfKeyslotCipher, KeyslotCipher};
use crate::registry::Registry;

pub struct CryptDevice {
    pub(crate) header: Header,
    pub(crate) registry: Registry,
    pub(crate) cipher: Box<dyn KeyslotCipher>,
    pub(crate) activator: Box<dyn DeviceActivator>,
}

impl CryptDevice {
    pub fn new(header: Header, registry: Registry) -> Self {
        Self {
            header,
            registry,
            cipher: Box::new(HkdfKeyslotCipher),
            activator: Box::new(DetachedActivator),
        }
    }

    pub fn with_cipher(mut self, cipher: Box<dyn KeyslotCipher>) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn with_activator(mut self, activator: Box<dyn DeviceActivator>) -> Self {
        self.activator = activator;
        self
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn into_header(self) -> Header {
        self.header
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
