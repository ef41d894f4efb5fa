//! Atomic JSON persistence.
//!
//! Every coordination file the orchestrator writes (`file-tracking.json`,
//! `rate-limit-state.json`, `parallel-recovery.json`, ...) goes through
//! [`write_json_atomic`] / [`read_json_or_default`] so a crash between write
//! and rename never leaves a reader looking at a half-written file.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

/// Write `value` as pretty JSON to `path`, atomically.
///
/// 1. Ensure the destination directory exists.
/// 2. Write to `path` + `.tmp`.
/// 3. fsync the temp file.
/// 4. Rename (atomic on POSIX) over the target path.
/// 5. On any error, remove the temp file so it never lingers.
///
/// # Errors
/// Returns the underlying I/O error on any step's failure.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }

    let tmp_path = tmp_path_for(path);
    let result = (|| -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(value)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| format!(".{}.tmp", n.to_string_lossy()))
        .unwrap_or_else(|| ".undercity.tmp".to_owned());
    path.with_file_name(file_name)
}

/// Read and parse JSON from `path`, falling back to `T::default()` when the
/// file is missing or malformed.
///
/// A malformed file is logged as a warning and treated as "default initial
/// state" — the system must keep functioning against a single corrupted
/// coordination file rather than refusing to start.
pub fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    let Ok(contents) = fs::read_to_string(path) else {
        return T::default();
    };
    match serde_json::from_str(&contents) {
        Ok(value) => value,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "ignoring corrupted JSON state file, using default");
            T::default()
        }
    }
}

/// Read and parse JSON from `path`, returning `Ok(None)` if the file does
/// not exist and `Err` if it exists but cannot be parsed.
///
/// Used where "file absent" and "file corrupted" need to be told apart by
/// the caller (recovery bootstrapping), unlike [`read_json_or_default`].
///
/// # Errors
/// Returns a JSON parse error if the file exists but is malformed.
pub fn read_json_opt<T: DeserializeOwned>(path: &Path) -> std::io::Result<Option<T>> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let value = serde_json::from_str(&contents)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Doc {
        n: u32,
        label: String,
    }

    #[test]
    fn round_trips_losslessly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("doc.json");
        let doc = Doc {
            n: 42,
            label: "hi".into(),
        };
        write_json_atomic(&path, &doc).unwrap();
        let read: Doc = read_json_opt(&path).unwrap().unwrap();
        assert_eq!(read, doc);
    }

    #[test]
    fn no_temp_file_left_behind_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        write_json_atomic(&path, &Doc::default()).unwrap();
        assert!(!tmp_path_for(&path).exists());
    }

    #[test]
    fn missing_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let doc: Doc = read_json_or_default(&path);
        assert_eq!(doc, Doc::default());
    }

    #[test]
    fn corrupted_file_yields_default_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        fs::write(&path, b"{not valid json").unwrap();
        let doc: Doc = read_json_or_default(&path);
        assert_eq!(doc, Doc::default());
    }

    #[test]
    fn read_json_opt_distinguishes_missing_from_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(read_json_opt::<Doc>(&missing).unwrap().is_none());

        let corrupted = dir.path().join("bad.json");
        fs::write(&corrupted, b"{oops").unwrap();
        assert!(read_json_opt::<Doc>(&corrupted).is_err());
    }

    #[test]
    fn overwrite_is_atomic_from_readers_perspective() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        for n in 0..20 {
            write_json_atomic(
                &path,
                &Doc {
                    n,
                    label: "x".repeat(n as usize),
                },
            )
            .unwrap();
            let read: Doc = read_json_opt(&path).unwrap().unwrap();
            assert_eq!(read.n, n);
        }
    }
}
