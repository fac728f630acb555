pub mod backend;
pub mod config;
pub mod create;
pub mod dump;
pub mod handler;
pub mod record;
pub mod remove;

#[cfg(feature = "tpm-backend")]
pub mod esys;

use std::io::Write;
use std::sync::Arc;

use luks2_token::abi::{self, ExportTable, Library, StaticLoader, Symbol};
use luks2_token::CryptDevice;

pub use backend::{SecretStore, SecretStoreConnector, Tcti};
pub use config::{CreateParams, RemoveParams};
pub use create::{create, CreateReport, Prompt};
pub use handler::Tpm2Handler;
pub use record::{PcrBanks, Tpm2Token};
pub use remove::{remove, token_by_nv_index};

/// Token type handled by this crate.
pub const TOKEN_NAME: &str = "tpm2";
pub const TOKEN_VERSION_MAJOR: u32 = 1;
pub const TOKEN_VERSION_MINOR: u32 = 0;
pub const VERSION: &str = "1.0";

/// Symbol table of the `tpm2` handler library.
pub fn library(connector: Arc<dyn SecretStoreConnector>) -> ExportTable {
    let handler = Arc::new(Tpm2Handler::new(connector));

    let open = Arc::clone(&handler);
    let open_pin = Arc::clone(&handler);
    let validate = Arc::clone(&handler);
    let dump = handler;

    ExportTable::new()
        .export(
            abi::SYMBOL_OPEN,
            Symbol::Open(Arc::new(move |cd: &CryptDevice, token: u32| {
                open.open(cd, token)
            })),
        )
        .export(
            abi::SYMBOL_OPEN_PIN,
            Symbol::OpenPin(Arc::new(move |cd: &CryptDevice, token: u32, pin: &[u8]| {
                open_pin.open_pin(cd, token, pin)
            })),
        )
        .export(
            abi::SYMBOL_VALIDATE,
            Symbol::Validate(Arc::new(move |cd: &CryptDevice, json: &str| {
                validate.validate(cd, json)
            })),
        )
        .export(
            abi::SYMBOL_DUMP,
            Symbol::Dump(Arc::new(move |cd: &CryptDevice, json: &str, out: &mut dyn Write| {
                dump.dump(cd, json, out)
            })),
        )
        .export(
            abi::SYMBOL_VERSION_FN,
            Symbol::Version(Arc::new(|| VERSION.to_string())),
        )
}

/// Make the `tpm2` library resolvable through `loader`.
pub fn install(loader: &StaticLoader, connector: Arc<dyn SecretStoreConnector>) {
    loader.install(&abi::library_filename(TOKEN_NAME), move || -> Box<dyn Library> {
        Box::new(library(Arc::clone(&connector)))
    });
}

/// Detect the available TPM backend.
#[cfg(feature = "tpm-backend")]
pub fn detect_connector() -> Arc<dyn SecretStoreConnector> {
    log::info!("using TSS ESAPI TPM backend");
    Arc::new(esys::EsysConnector)
}

#[cfg(not(feature = "tpm-backend"))]
pub fn detect_connector() -> Arc<dyn SecretStoreConnector> {
    log::warn!("built without a TPM backend, tpm2 tokens cannot be opened");
    Arc::new(backend::UnavailableConnector)
}
