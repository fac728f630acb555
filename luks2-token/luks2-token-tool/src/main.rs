mod config;
mod header_file;
mod prompt;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use luks2_token::abi::StaticLoader;
use luks2_token::builtin::keyring::MemoryKeyring;
use luks2_token::{CryptDevice, HandlerRegistry, Registry, Target, TokenError, TokenRequest};
use tpm2_token::{Prompt, SecretStoreConnector, Tpm2Handler};

use config::{Action, ToolConfig};
use prompt::TerminalPrompt;

fn target(token: Option<u32>) -> Target {
    token.map_or(Target::Any, Target::Id)
}

fn open(cd: &mut CryptDevice, config: &ToolConfig, prompt: &mut dyn Prompt) -> Result<u32> {
    let request = TokenRequest::new(target(config.token_id));
    match cd.token_open_and_activate(&request) {
        Err(TokenError::TryAgain) => {
            let pin = prompt.passphrase("Enter token PIN:", None, false)?;
            Ok(cd.token_open_and_activate(&request.pin(&pin))?)
        }
        other => Ok(other?),
    }
}

fn perform(
    cd: &mut CryptDevice,
    config: &ToolConfig,
    connector: Arc<dyn SecretStoreConnector>,
    prompt: &mut dyn Prompt,
) -> Result<()> {
    match config.action {
        Action::Create => {
            let report = tpm2_token::create(cd, connector.as_ref(), &config.create, prompt)?;
            log::info!(
                "created token {} bound to keyslot {} (NV 0x{:08x}, nonce NV 0x{:08x})",
                report.token,
                report.keyslot,
                report.nv_index,
                report.nonce_nv_index
            );
            header_file::save(&config.header, cd.header())?;
        }
        Action::Remove => {
            let handler = Tpm2Handler::new(connector);
            tpm2_token::remove(cd, &handler, &config.remove)?;
            header_file::save(&config.header, cd.header())?;
        }
        Action::Dump => {
            let mut out = std::io::stdout().lock();
            let written = match config.token_id {
                Some(token) => cd.token_dump(token, &mut out),
                None => cd.tokens_dump(&mut out),
            };
            written
                .and_then(|()| out.flush())
                .context("failed to write token dump")?;
        }
        Action::Open => {
            let keyslot = open(cd, config, prompt)?;
            log::info!("token unlocked keyslot {keyslot}");
        }
    }
    Ok(())
}

/// Run the configured action, then drop every external handler whatever
/// the outcome.
fn execute(
    cd: &mut CryptDevice,
    config: &ToolConfig,
    connector: Arc<dyn SecretStoreConnector>,
    prompt: &mut dyn Prompt,
) -> Result<()> {
    let result = perform(cd, config, connector, prompt);
    cd.registry().unload_all_external();
    result
}

fn run(config: ToolConfig) -> Result<()> {
    let header = header_file::load(&config.header)?;

    let connector = tpm2_token::detect_connector();
    let loader = Arc::new(StaticLoader::new());
    tpm2_token::install(&loader, connector.clone());
    let registry = Registry::new(HandlerRegistry::new(
        loader,
        Arc::new(MemoryKeyring::default()),
    ));
    let mut cd = CryptDevice::new(header, registry);

    execute(&mut cd, &config, connector, &mut TerminalPrompt)
}

fn main() {
    env_logger::init();

    let result = config::parse().and_then(run);
    if let Err(e) = result {
        log::error!("{e:#}");
        let code = e
            .downcast_ref::<TokenError>()
            .map_or(1, |e| e.code().saturating_neg());
        std::process::exit(code);
    }
}
