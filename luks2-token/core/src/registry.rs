//! Process-wide table of token handlers.
//!
//! The table starts out with the builtin handlers. External handlers are
//! loaded lazily the first time a token of their type is looked up, and stay
//! cached until [`HandlerRegistry::unload_all_external`]. A failed load is not
//! remembered, so installing the library later makes the next lookup succeed.
//!
//! [`Registry`] is the shareable handle; it serializes every access through a
//! mutex. Handlers are handed out as `Arc`s so no lock is held while a handler
//! runs.

use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::abi::{
    self, BufferFreeFn, DumpFn, Library, LibraryLoader, OpenFn, OpenPinFn, Symbol, ValidateFn,
    VersionFn, SYMBOL_BUFFER_FREE, SYMBOL_DUMP, SYMBOL_OPEN, SYMBOL_OPEN_PIN, SYMBOL_VALIDATE,
    SYMBOL_VERSION, SYMBOL_VERSION_FN,
};
use crate::builtin::keyring::{KernelKeyring, KeyringHandler};
use crate::device::CryptDevice;
use crate::error::{Result, TokenError};
use crate::handler::{
    is_builtin_candidate, Capabilities, HandlerKind, SecretBuffer, TokenHandler,
};

/// Registry capacity, builtins included.
pub const MAX_HANDLERS: usize = 32;

/// Handler backed by symbols resolved from an external library.
struct ExternalHandler {
    name: String,
    open: OpenFn,
    open_pin: Option<OpenPinFn>,
    validate: Option<ValidateFn>,
    dump: Option<DumpFn>,
    buffer_free: Option<BufferFreeFn>,
    version: Option<VersionFn>,
}

impl TokenHandler for ExternalHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> HandlerKind {
        HandlerKind::External {
            version: if self.version.is_some() { 2 } else { 1 },
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            open_pin: self.open_pin.is_some(),
            validate: self.validate.is_some(),
            dump: self.dump.is_some(),
            buffer_free: self.buffer_free.is_some(),
        }
    }

    fn open(&self, cd: &CryptDevice, token: u32) -> Result<SecretBuffer> {
        (self.open)(cd, token)
    }

    fn open_pin(&self, cd: &CryptDevice, token: u32, pin: &[u8]) -> Result<SecretBuffer> {
        match &self.open_pin {
            Some(open_pin) => open_pin(cd, token, pin),
            None => Err(TokenError::NotFound),
        }
    }

    fn validate(&self, cd: &CryptDevice, json: &str) -> Result<()> {
        match &self.validate {
            Some(validate) => validate(cd, json),
            None => Ok(()),
        }
    }

    fn dump(&self, cd: &CryptDevice, json: &str, out: &mut dyn Write) -> std::io::Result<()> {
        match &self.dump {
            Some(dump) => dump(cd, json, out),
            None => Ok(()),
        }
    }

    fn buffer_free(&self, buffer: SecretBuffer) {
        match &self.buffer_free {
            Some(buffer_free) => buffer_free(buffer),
            None => drop(buffer),
        }
    }

    fn version(&self) -> Option<String> {
        self.version.as_ref().map(|version| version())
    }
}

fn resolve(library: &dyn Library, name: &str) -> Option<Symbol> {
    log::debug!("Loading symbol {name}@{SYMBOL_VERSION}.");
    let symbol = library.symbol(name, SYMBOL_VERSION);
    if symbol.is_none() {
        log::debug!("Error: symbol {name}@{SYMBOL_VERSION} not found.");
    }
    symbol
}

/// Resolve the handler symbols of `library`. `None` when the mandatory
/// `open` symbol is missing.
fn resolve_handler(name: &str, library: &dyn Library) -> Option<ExternalHandler> {
    let open = match resolve(library, SYMBOL_OPEN) {
        Some(Symbol::Open(open)) => open,
        _ => {
            log::debug!("Token handler does not provide open function.");
            return None;
        }
    };

    Some(ExternalHandler {
        name: name.to_string(),
        open,
        open_pin: match resolve(library, SYMBOL_OPEN_PIN) {
            Some(Symbol::OpenPin(f)) => Some(f),
            _ => None,
        },
        validate: match resolve(library, SYMBOL_VALIDATE) {
            Some(Symbol::Validate(f)) => Some(f),
            _ => None,
        },
        dump: match resolve(library, SYMBOL_DUMP) {
            Some(Symbol::Dump(f)) => Some(f),
            _ => None,
        },
        buffer_free: match resolve(library, SYMBOL_BUFFER_FREE) {
            Some(Symbol::BufferFree(f)) => Some(f),
            _ => None,
        },
        version: match resolve(library, SYMBOL_VERSION_FN) {
            Some(Symbol::Version(f)) => Some(f),
            _ => None,
        },
    })
}

struct Entry {
    handler: Arc<dyn TokenHandler>,
    library: Option<Box<dyn Library>>,
}

pub struct HandlerRegistry {
    entries: Vec<Entry>,
    loader: Arc<dyn LibraryLoader>,
}

impl HandlerRegistry {
    /// Registry holding the builtin handlers.
    pub fn new(loader: Arc<dyn LibraryLoader>, keyring: Arc<dyn KernelKeyring>) -> Self {
        Self {
            entries: vec![Entry {
                handler: Arc::new(KeyringHandler::new(keyring)),
                library: None,
            }],
            loader,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn lookup(&self, type_name: &str) -> Option<Arc<dyn TokenHandler>> {
        self.entries
            .iter()
            .find(|entry| entry.handler.name() == type_name)
            .map(|entry| Arc::clone(&entry.handler))
    }

    /// Resolve the handler for `type_name`, loading an external one on a miss.
    pub fn find(&mut self, type_name: &str) -> Option<Arc<dyn TokenHandler>> {
        if let Some(handler) = self.lookup(type_name) {
            return Some(handler);
        }

        if self.entries.len() >= MAX_HANDLERS || is_builtin_candidate(type_name) {
            return None;
        }

        self.load_external(type_name).ok()
    }

    /// Load and cache the external handler for `type_name`.
    pub fn load_external(&mut self, type_name: &str) -> Result<Arc<dyn TokenHandler>> {
        if let Some(handler) = self.lookup(type_name) {
            return Ok(handler);
        }

        if !abi::external_token_name_valid(type_name) {
            log::debug!(
                "External token name ({}) invalid.",
                type_name.chars().take(abi::TOKEN_NAME_MAX).collect::<String>()
            );
            return Err(TokenError::InvalidArgument);
        }

        if is_builtin_candidate(type_name) {
            log::debug!("'{}' is reserved prefix for builtin tokens.", crate::handler::BUILTIN_PREFIX);
            return Err(TokenError::InvalidArgument);
        }

        if self.entries.len() >= MAX_HANDLERS {
            log::debug!("No free slot for token handler {type_name}.");
            return Err(TokenError::NoSpace);
        }

        let filename = abi::library_filename(type_name);
        log::debug!("Trying to load {filename}.");

        let mut library = self.loader.open(&filename).map_err(|e| {
            log::debug!("{e}");
            TokenError::InvalidArgument
        })?;

        let Some(handler) = resolve_handler(type_name, library.as_ref()) else {
            if let Err(e) = library.close() {
                log::debug!("{e}");
            }
            return Err(TokenError::InvalidArgument);
        };

        log::debug!(
            "Token handler {}-{} loaded successfully.",
            type_name,
            handler.version().unwrap_or_default()
        );

        let handler: Arc<dyn TokenHandler> = Arc::new(handler);
        self.entries.push(Entry {
            handler: Arc::clone(&handler),
            library: Some(library),
        });

        Ok(handler)
    }

    /// Add a handler compiled into the embedding application.
    pub fn register_builtin(&mut self, handler: Arc<dyn TokenHandler>) -> Result<()> {
        let name = handler.name();

        if is_builtin_candidate(name) {
            log::debug!("'{}' is reserved prefix for builtin tokens.", crate::handler::BUILTIN_PREFIX);
            return Err(TokenError::InvalidArgument);
        }

        if self.lookup(name).is_some() {
            log::debug!("Token handler {name} is already registered.");
            return Err(TokenError::InvalidArgument);
        }

        if self.entries.len() >= MAX_HANDLERS {
            return Err(TokenError::NoSpace);
        }

        self.entries.push(Entry {
            handler,
            library: None,
        });
        Ok(())
    }

    /// Release every loaded library, last loaded first.
    pub fn unload_all_external(&mut self) {
        for index in (0..self.entries.len()).rev() {
            if self.entries[index].library.is_none() {
                continue;
            }

            let entry = self.entries.remove(index);
            log::debug!("Unloading {} token handler.", entry.handler.name());

            if let Some(mut library) = entry.library {
                if let Err(e) = library.close() {
                    log::debug!("{e}");
                }
            }
        }
    }
}

/// Shared handle to a [`HandlerRegistry`].
#[derive(Clone)]
pub struct Registry(Arc<Mutex<HandlerRegistry>>);

impl Registry {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self(Arc::new(Mutex::new(registry)))
    }

    fn lock(&self) -> MutexGuard<'_, HandlerRegistry> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn find(&self, type_name: &str) -> Option<Arc<dyn TokenHandler>> {
        self.lock().find(type_name)
    }

    pub fn load_external(&self, type_name: &str) -> Result<Arc<dyn TokenHandler>> {
        self.lock().load_external(type_name)
    }

    pub fn register_builtin(&self, handler: Arc<dyn TokenHandler>) -> Result<()> {
        self.lock().register_builtin(handler)
    }

    pub fn unload_all_external(&self) {
        self.lock().unload_all_external()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
