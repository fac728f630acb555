use anyhow::{Context, Result};
use luks2_token::Header;
use std::fs;
use std::path::Path;

pub fn load(path: &Path) -> Result<Header> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read LUKS2 header from {}", path.display()))?;

    Header::from_json(&raw)
        .with_context(|| format!("{} is not a LUKS2 header document", path.display()))
}

/// Replace the header document at `path`. The new document is written next
/// to it first so a failed write leaves the old one intact.
pub fn save(path: &Path, header: &Header) -> Result<()> {
    let staged = path.with_extension("new");
    let json = header
        .to_json_pretty()
        .context("failed to serialize LUKS2 header")?;
    fs::write(&staged, json)
        .with_context(|| format!("failed to write LUKS2 header to {}", staged.display()))?;

    fs::rename(&staged, path)
        .with_context(|| format!("failed to replace LUKS2 header {}", path.display()))?;

    log::debug!("header written to {}", path.display());
    Ok(())
}
