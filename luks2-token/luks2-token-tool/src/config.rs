use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tpm2_token::{CreateParams, RemoveParams};

const DEFAULT_CONFIG_PATH: &str = "/etc/luks2-token/tpm2.toml";
const CONFIG_PATH_ENV: &str = "LUKS2_TOKEN_CONFIG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Remove,
    Dump,
    Open,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ToolConfig {
    /// LUKS2 header JSON document to operate on.
    pub header: PathBuf,
    pub action: Action,
    /// Token to open or dump. Unset means every token.
    pub token_id: Option<u32>,
    #[serde(default)]
    pub create: CreateParams,
    #[serde(default)]
    pub remove: RemoveParams,
}

pub fn from_str(raw: &str) -> Result<ToolConfig> {
    let config: ToolConfig = toml::from_str(raw).context("failed to parse token configuration")?;

    if config.header.as_os_str().is_empty() {
        bail!("header path is empty");
    }

    Ok(config)
}

pub fn parse() -> Result<ToolConfig> {
    let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let path = Path::new(&path);

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read token configuration from {}", path.display()))?;

    from_str(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_create() {
        let config = from_str(
            r#"
            header = "/tmp/header.json"
            action = "create"

            [create]
            pcr-selection = 129
            pcr-bank = "sha1,sha256"
            no-pin = true
            key-size = 32
            tcti = "device:/dev/tpmrm0"
            "#,
        )
        .unwrap();

        assert_eq!(config.action, Action::Create);
        assert_eq!(config.header, PathBuf::from("/tmp/header.json"));
        assert_eq!(config.create.pcr_selection, 129);
        assert_eq!(config.create.pcr_bank.as_deref(), Some("sha1,sha256"));
        assert!(config.create.no_pin);
        assert_eq!(config.create.key_size, Some(32));
        assert_eq!(config.remove, RemoveParams::default());
    }

    #[test]
    fn test_parse_remove() {
        let config = from_str(
            r#"
            header = "/tmp/header.json"
            action = "remove"

            [remove]
            nv-index = 25165824
            force-remove = true
            "#,
        )
        .unwrap();

        assert_eq!(config.action, Action::Remove);
        assert_eq!(config.remove.nv_index, Some(0x0180_0000));
        assert!(config.remove.force_remove);
    }

    #[test]
    fn test_parse_rejects() {
        assert!(from_str(r#"header = ""
action = "dump""#).is_err());
        assert!(from_str(r#"header = "/h"
action = "format""#).is_err());
        assert!(from_str(
            r#"header = "/h"
action = "create"
[create]
pcr-banks = "sha1""#
        )
        .is_err());
    }
}
