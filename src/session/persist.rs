//! On-disk persistence for session slots and the refresh cookie jar
//!
//! All writes go through a temp file + rename so a crash never leaves a
//! half-written token file behind. Files are created 0600 on unix.

use crate::error::{AuthError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default storage directory.
///
/// Returns: ~/.authful/sessions/ on Linux/macOS
///          %USERPROFILE%\.authful\sessions\ on Windows
pub fn default_storage_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map_err(|_| AuthError::Config("cannot determine home directory".to_string()))?;

    Ok(PathBuf::from(home).join(".authful").join("sessions"))
}

/// Sanitize an endpoint URL for use as a file name prefix
///
/// Example: https://auth.example.com/oauth2/token
///          -> auth.example.com_oauth2_token
pub fn sanitize_endpoint(url: &str) -> String {
    url.trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
        .replace(['/', ':', '?', '&', '='], "_")
}

pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !tokio::fs::try_exists(path)
        .await
        .map_err(|e| AuthError::Storage(format!("checking {}: {}", path.display(), e)))?
    {
        debug!(path = %path.display(), "no persisted session file");
        return Ok(None);
    }

    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| AuthError::Storage(format!("reading {}: {}", path.display(), e)))?;
    let value = serde_json::from_str(&contents)
        .map_err(|e| AuthError::Storage(format!("parsing {}: {}", path.display(), e)))?;

    debug!(path = %path.display(), "loaded persisted session file");
    Ok(Some(value))
}

pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| AuthError::Storage(format!("serializing session: {}", e)))?;

    let dir = path
        .parent()
        .ok_or_else(|| AuthError::Storage("session path has no parent directory".into()))?;
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| AuthError::Storage(format!("creating {}: {}", dir.display(), e)))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "session".to_string());
    let tmp_path = dir.join(format!(".{}.tmp.{}", file_name, std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| AuthError::Storage(format!("writing temp session file: {}", e)))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| AuthError::Storage(format!("setting session file permissions: {}", e)))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| AuthError::Storage(format!("renaming temp session file: {}", e)))?;

    debug!(path = %path.display(), "persisted session file");
    Ok(())
}

pub async fn remove(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "removed session file");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(AuthError::Storage(format!(
            "removing {}: {}",
            path.display(),
            e
        ))),
    }
}
