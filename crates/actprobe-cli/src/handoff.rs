//! Authorization-code handoff between the callback listener and whichever
//! process completes the OAuth2 exchange.
//!
//! The channel is a single file with one writer and one reader. The writer
//! replaces it atomically (temp file + rename) so the reader never sees a
//! partial code; the reader consumes it with [`CodeHandoff::take`], which
//! removes the file so a code is never used twice.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Env var overriding the handoff file location.
pub const ENV_AUTH_CODE_PATH: &str = "ACTPROBE_AUTH_CODE_PATH";

const DEFAULT_FILE_NAME: &str = "github_auth_code.txt";

#[derive(Debug, Clone)]
pub struct CodeHandoff {
    path: PathBuf,
}

impl CodeHandoff {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Resolve the handoff path: flag > `ACTPROBE_AUTH_CODE_PATH` > temp dir.
    pub fn resolve<F>(flag: Option<PathBuf>, env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = flag
            .or_else(|| env(ENV_AUTH_CODE_PATH).map(PathBuf::from))
            .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_FILE_NAME));
        Self::new(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the handoff file with `code`.
    pub fn write(&self, code: &str) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        std::fs::write(&tmp, code)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("failed to set permissions on {}", tmp.display()))?;
        }
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to move code into {}", self.path.display()))?;
        Ok(())
    }

    /// Read and remove the captured code. `None` if nothing has arrived.
    pub fn take(&self) -> Result<Option<String>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read {}", self.path.display()));
            }
        };
        std::fs::remove_file(&self.path)
            .with_context(|| format!("failed to remove {}", self.path.display()))?;

        let code = contents.trim();
        Ok((!code.is_empty()).then(|| code.to_string()))
    }
}
