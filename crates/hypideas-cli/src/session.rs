use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use hypideas_backend::auth::Session;

pub fn load(path: &Path) -> Result<Option<Session>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    let session = serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(session))
}

pub fn save(path: &Path, session: &Session) -> Result<()> {
    let text = serde_json::to_string_pretty(session)?;
    fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
    debug!("Session saved to {}", path.display());
    Ok(())
}

pub fn clear(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => {
            Err(e).with_context(|| format!("removing {}", path.display()))
        }
        _ => Ok(()),
    }
}
