//! Bounded atomic JSON persistence.
//!
//! Every store writes its whole state as pretty-printed JSON to
//! `<path>.tmp` and renames over the target, so readers at process start
//! see either the previous version or the new one, never a partial file.
//! Loads stat the file first and refuse anything over the caller's size
//! cap before reading a byte.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

/// On-disk cap for history files (changes, events, patterns, correlations).
pub const MAX_HISTORY_FILE_BYTES: u64 = 10 << 20;

/// On-disk cap for the incident file, which carries full timelines.
pub const MAX_INCIDENT_FILE_BYTES: u64 = 20 << 20;

/// Serializes with two-space indentation, the format of every vigil file.
pub fn encode_pretty<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(value).context("encoding state as JSON")
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Writes `bytes` to `path` via temp-file-and-rename, mode 0600.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }

    let tmp = tmp_path(path);
    fs::write(&tmp, bytes).with_context(|| format!("writing {}", tmp.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("setting permissions on {}", tmp.display()))?;
    }

    fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} into place", tmp.display()))
}

/// Loads and decodes a JSON file. Returns `Ok(None)` when the file does not
/// exist. Fails without reading when the file exceeds `max_bytes`
/// (`max_bytes == 0` disables the cap).
pub fn load_json_capped<T: DeserializeOwned>(path: &Path, max_bytes: u64) -> Result<Option<T>> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("stat {}", path.display()));
        }
    };

    if max_bytes > 0 && meta.len() > max_bytes {
        bail!(
            "{} is {} bytes, over the {} byte cap",
            path.display(),
            meta.len(),
            max_bytes
        );
    }

    let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let value = serde_json::from_slice(&data)
        .with_context(|| format!("decoding {}", path.display()))?;
    Ok(Some(value))
}

/// Fires a one-shot background write of pre-serialized bytes. Uses the
/// current tokio runtime's blocking pool when one is running, otherwise a
/// plain thread. Failures are logged; in-memory state stays authoritative.
pub fn spawn_write(label: &'static str, path: PathBuf, bytes: Vec<u8>) {
    let task = move || {
        if let Err(err) = write_atomic(&path, &bytes) {
            warn!(%label, error = %format!("{err:#}"), "failed to persist store");
        }
    };

    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(task);
        }
        Err(_) => {
            std::thread::spawn(task);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let sample = Sample {
            name: "pve-1".into(),
            count: 3,
        };

        write_atomic(&path, &encode_pretty(&sample).unwrap()).unwrap();
        let loaded: Sample = load_json_capped(&path, 1 << 20).unwrap().unwrap();
        assert_eq!(loaded, sample);
    }

    #[test]
    fn missing_file_is_empty_state() {
        let dir = tempfile::TempDir::new().unwrap();
        let loaded: Option<Sample> =
            load_json_capped(&dir.path().join("absent.json"), 1 << 20).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn oversize_file_fails_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, vec![b'x'; 64]).unwrap();

        let result: Result<Option<Sample>> = load_json_capped(&path, 16);
        assert!(result.is_err());
    }

    #[test]
    fn no_tmp_file_left_behind() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        write_atomic(&path, b"{}").unwrap();
        assert!(path.exists());
        assert!(!tmp_path(&path).exists());
    }

    #[cfg(unix)]
    #[test]
    fn written_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        write_atomic(&path, b"{}").unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
