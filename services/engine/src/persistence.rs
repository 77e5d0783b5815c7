//! Config persistence and config-source resolution.
//!
//! The last successfully applied config is kept at `<home>/config.toml` so
//! a restart comes back with the same routing. Writes go to a temp file
//! that is renamed over the target, so readers never see a partial file.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::{debug, info};

use crate::error::EngineError;

/// File name of the persisted config inside the home directory.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Where a config payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    File,
    Base64,
    Raw,
}

/// Resolve a config source string to config bytes.
///
/// In order: an existing file (relative paths resolve against `home`),
/// base64 text, raw text. Empty input is an error.
pub fn resolve_source(home: &Path, source: &str) -> Result<(Vec<u8>, SourceKind), EngineError> {
    let trimmed = source.trim();
    if trimmed.is_empty() {
        return Err(EngineError::EmptyConfig);
    }

    // Multi-line payloads are never paths.
    if !trimmed.contains('\n') {
        let candidate = Path::new(trimmed);
        let path = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            home.join(candidate)
        };
        if path.is_file() {
            let bytes = fs::read(&path)
                .map_err(|e| EngineError::io("failed to read config", &path, e))?;
            if bytes.iter().all(u8::is_ascii_whitespace) {
                return Err(EngineError::EmptyConfig);
            }
            debug!(path = %path.display(), "Config source is a file");
            return Ok((bytes, SourceKind::File));
        }
    }

    if let Some(decoded) = decode_base64(trimmed) {
        debug!("Config source is base64");
        return Ok((decoded, SourceKind::Base64));
    }

    Ok((source.as_bytes().to_vec(), SourceKind::Raw))
}

/// Decode base64 that yields non-empty UTF-8.
pub fn decode_base64(text: &str) -> Option<Vec<u8>> {
    let decoded = STANDARD.decode(text.trim()).ok()?;
    if decoded.is_empty() || std::str::from_utf8(&decoded).is_err() {
        return None;
    }
    Some(decoded)
}

/// Persisted copy of the applied config.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(home: &Path) -> Self {
        Self {
            path: home.join(CONFIG_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted config, if any.
    pub fn load(&self) -> Result<Option<Vec<u8>>, EngineError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No persisted config");
            return Ok(None);
        }
        let bytes = fs::read(&self.path)
            .map_err(|e| EngineError::io("failed to read config", &self.path, e))?;
        Ok(Some(bytes))
    }

    /// Save `bytes` atomically, readable by the owner only on unix.
    pub fn save(&self, bytes: &[u8]) -> Result<(), EngineError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| EngineError::io("failed to create directory", parent, e))?;
        }

        let tmp_path = self.path.with_extension("toml.tmp");
        let mut file = open_private(&tmp_path)
            .map_err(|e| EngineError::io("failed to write temp file", &tmp_path, e))?;
        file.write_all(bytes)
            .and_then(|()| file.sync_all())
            .map_err(|e| EngineError::io("failed to write temp file", &tmp_path, e))?;
        drop(file);

        fs::rename(&tmp_path, &self.path)
            .map_err(|e| EngineError::io("failed to rename temp file", &self.path, e))?;

        info!(path = %self.path.display(), bytes = bytes.len(), "Saved config to disk");
        Ok(())
    }
}

#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;

    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new().write(true).create(true).truncate(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = "rules = [\"MATCH,DIRECT\"]\n";

    #[test]
    fn test_resolve_file_relative_to_home() {
        let home = tempfile::tempdir().unwrap();
        fs::write(home.path().join("my.toml"), CONFIG).unwrap();

        let (bytes, kind) = resolve_source(home.path(), "my.toml").unwrap();
        assert_eq!(kind, SourceKind::File);
        assert_eq!(bytes, CONFIG.as_bytes());

        let absolute = home.path().join("my.toml");
        let (_, kind) =
            resolve_source(Path::new("/nonexistent"), absolute.to_str().unwrap()).unwrap();
        assert_eq!(kind, SourceKind::File);
    }

    #[test]
    fn test_resolve_base64_then_raw() {
        let home = tempfile::tempdir().unwrap();

        let encoded = STANDARD.encode(CONFIG);
        let (bytes, kind) = resolve_source(home.path(), &encoded).unwrap();
        assert_eq!(kind, SourceKind::Base64);
        assert_eq!(bytes, CONFIG.as_bytes());

        let (bytes, kind) = resolve_source(home.path(), CONFIG).unwrap();
        assert_eq!(kind, SourceKind::Raw);
        assert_eq!(bytes, CONFIG.as_bytes());
    }

    #[test]
    fn test_resolve_empty() {
        let home = tempfile::tempdir().unwrap();
        assert!(matches!(resolve_source(home.path(), "  \n"), Err(EngineError::EmptyConfig)));

        fs::write(home.path().join("empty.toml"), "\n").unwrap();
        assert!(matches!(
            resolve_source(home.path(), "empty.toml"),
            Err(EngineError::EmptyConfig)
        ));
    }

    #[test]
    fn test_store_roundtrip() {
        let home = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(&home.path().join("nested"));
        assert!(store.load().unwrap().is_none());

        store.save(CONFIG.as_bytes()).unwrap();
        assert_eq!(store.load().unwrap().unwrap(), CONFIG.as_bytes());
        assert!(!store.path().with_extension("toml.tmp").exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(store.path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
