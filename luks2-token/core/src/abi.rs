//! Binary contract between the token layer and external handler libraries.
//!
//! An external handler lives in a library named after its token type and
//! exports a fixed set of versioned symbols. Libraries are reached through a
//! [`LibraryLoader`]; [`StaticLoader`] is an in-process catalog of libraries
//! described by [`ExportTable`]s.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

use crate::device::CryptDevice;
use crate::error::Result;
use crate::handler::SecretBuffer;

pub const SYMBOL_VERSION: &str = "CRYPTSETUP_TOKEN_1.0";

pub const SYMBOL_OPEN: &str = "cryptsetup_token_open";
pub const SYMBOL_OPEN_PIN: &str = "cryptsetup_token_open_pin";
pub const SYMBOL_VALIDATE: &str = "cryptsetup_token_validate";
pub const SYMBOL_DUMP: &str = "cryptsetup_token_dump";
pub const SYMBOL_BUFFER_FREE: &str = "cryptsetup_token_buffer_free";
pub const SYMBOL_VERSION_FN: &str = "cryptsetup_token_version";

/// Longest accepted external token type name.
pub const TOKEN_NAME_MAX: usize = 64;

pub type OpenFn = Arc<dyn Fn(&CryptDevice, u32) -> Result<SecretBuffer> + Send + Sync>;
pub type OpenPinFn = Arc<dyn Fn(&CryptDevice, u32, &[u8]) -> Result<SecretBuffer> + Send + Sync>;
pub type ValidateFn = Arc<dyn Fn(&CryptDevice, &str) -> Result<()> + Send + Sync>;
pub type DumpFn =
    Arc<dyn Fn(&CryptDevice, &str, &mut dyn Write) -> std::io::Result<()> + Send + Sync>;
pub type BufferFreeFn = Arc<dyn Fn(SecretBuffer) + Send + Sync>;
pub type VersionFn = Arc<dyn Fn() -> String + Send + Sync>;

/// A resolved symbol. Its variant is its signature.
#[derive(Clone)]
pub enum Symbol {
    Open(OpenFn),
    OpenPin(OpenPinFn),
    Validate(ValidateFn),
    Dump(DumpFn),
    BufferFree(BufferFreeFn),
    Version(VersionFn),
}

impl Symbol {
    fn kind(&self) -> &'static str {
        match self {
            Symbol::Open(_) => "open",
            Symbol::OpenPin(_) => "open_pin",
            Symbol::Validate(_) => "validate",
            Symbol::Dump(_) => "dump",
            Symbol::BufferFree(_) => "buffer_free",
            Symbol::Version(_) => "version",
        }
    }
}

impl std::fmt::Debug for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Symbol::{}", self.kind())
    }
}

/// A loaded handler library.
pub trait Library: Send {
    /// Look up `name` exported under symbol version `version`.
    fn symbol(&self, name: &str, version: &str) -> Option<Symbol>;

    /// Release the library. Called once, at unload.
    fn close(&mut self) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// Resolves library file names to loaded libraries.
pub trait LibraryLoader: Send + Sync {
    /// On failure returns the loader's diagnostic message.
    fn open(&self, filename: &str) -> std::result::Result<Box<dyn Library>, String>;
}

/// Conventional library file name for an external token type.
pub fn library_filename(type_name: &str) -> String {
    format!("libcryptsetup-token-{type_name}.so")
}

/// Strict identifier check for external token type names.
pub fn external_token_name_valid(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= TOKEN_NAME_MAX
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Symbol table of one handler library.
#[derive(Clone, Debug, Default)]
pub struct ExportTable {
    symbols: HashMap<(String, String), Symbol>,
}

impl ExportTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Export `symbol` under the current symbol version.
    pub fn export(self, name: &str, symbol: Symbol) -> Self {
        self.export_versioned(name, SYMBOL_VERSION, symbol)
    }

    pub fn export_versioned(mut self, name: &str, version: &str, symbol: Symbol) -> Self {
        self.symbols
            .insert((name.to_string(), version.to_string()), symbol);
        self
    }
}

impl Library for ExportTable {
    fn symbol(&self, name: &str, version: &str) -> Option<Symbol> {
        self.symbols
            .get(&(name.to_string(), version.to_string()))
            .cloned()
    }
}

type LibraryFactory = Box<dyn Fn() -> Box<dyn Library> + Send + Sync>;

/// Catalog of libraries available to the process, keyed by file name.
///
/// Libraries may be installed at any time; a lookup that failed earlier
/// succeeds once the library is installed.
#[derive(Default)]
pub struct StaticLoader {
    libraries: Mutex<HashMap<String, LibraryFactory>>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install<F>(&self, filename: &str, factory: F)
    where
        F: Fn() -> Box<dyn Library> + Send + Sync + 'static,
    {
        log::debug!("Installing token library {filename}.");
        self.libraries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(filename.to_string(), Box::new(factory));
    }

    pub fn uninstall(&self, filename: &str) {
        self.libraries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(filename);
    }
}

impl LibraryLoader for StaticLoader {
    fn open(&self, filename: &str) -> std::result::Result<Box<dyn Library>, String> {
        let libraries = self.libraries.lock().unwrap_or_else(PoisonError::into_inner);
        match libraries.get(filename) {
            Some(factory) => Ok(factory()),
            None => Err(format!(
                "{filename}: cannot open shared object file: No such file or directory"
            )),
        }
    }
}
