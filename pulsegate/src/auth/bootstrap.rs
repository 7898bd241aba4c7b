//! First-run setup token.
//!
//! While no authentication mechanism is configured, setup endpoints demand a token that only
//! someone with filesystem access to the data directory can read. The raw token lives in
//! `<data_path>/.bootstrap_token` (mode 0600); memory only holds its digest.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error as ThisError;

use crate::crypto;

pub const BOOTSTRAP_TOKEN_FILE: &str = ".bootstrap_token";
pub const SETUP_TOKEN_HEADER: &str = "x-setup-token";

#[derive(ThisError, Debug)]
pub enum BootstrapError {
    #[error("data path required for bootstrap token")]
    DataPathRequired,
    #[error("bootstrap token file is empty: {0}")]
    Empty(PathBuf),
    #[error("bootstrap token file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Read the token from `<data_path>/.bootstrap_token`, creating it if absent.
///
/// Returns the raw token, whether it was created by this call, and the file path.
pub fn load_or_create(data_path: &Path) -> Result<(String, bool, PathBuf), BootstrapError> {
    if data_path.as_os_str().is_empty() {
        return Err(BootstrapError::DataPathRequired);
    }
    let path = data_path.join(BOOTSTRAP_TOKEN_FILE);
    let io_err = {
        let path = path.clone();
        move |source: std::io::Error| BootstrapError::Io {
            path: path.clone(),
            source,
        }
    };

    match fs::read_to_string(&path) {
        Ok(contents) => {
            let token = contents.trim();
            if token.is_empty() {
                return Err(BootstrapError::Empty(path));
            }
            return Ok((token.to_string(), false, path));
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(io_err(e)),
    }

    fs::create_dir_all(data_path).map_err(&io_err)?;
    let token = crypto::random_hex(24);
    let mut file = create_private(&path).map_err(&io_err)?;
    file.write_all(format!("{token}\n").as_bytes()).map_err(&io_err)?;
    Ok((token, true, path))
}

#[cfg(unix)]
fn create_private(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new().write(true).create_new(true).mode(0o600).open(path)
}

#[cfg(not(unix))]
fn create_private(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new().write(true).create_new(true).open(path)
}

/// The setup token as held in memory.
#[derive(Debug, Clone)]
pub struct BootstrapToken {
    hash: String,
    path: PathBuf,
}

impl BootstrapToken {
    /// Load or create the token under `data_path`
    pub fn initialize(data_path: &Path) -> Result<Self, BootstrapError> {
        let (token, created, path) = load_or_create(data_path)?;
        if created {
            tracing::warn!(path = %path.display(), "Generated bootstrap token; read it from this file to complete setup");
        } else {
            tracing::info!(path = %path.display(), "Using existing bootstrap token");
        }
        Ok(Self::from_raw(&token, path))
    }

    pub fn from_raw(token: &str, path: PathBuf) -> Self {
        Self {
            hash: crypto::sha256_hex(token.trim()),
            path,
        }
    }

    pub fn validate(&self, presented: &str) -> bool {
        let presented = presented.trim();
        !presented.is_empty() && crypto::matches_sha256(presented, &self.hash)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
