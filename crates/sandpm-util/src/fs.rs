use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Create the parent directory of `path` (and its ancestors) if missing.
///
/// # Errors
/// Returns an error if a directory cannot be created.
pub fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

/// Sibling path used as the staging file for an atomic write.
///
/// Unique per process and per call so concurrent writers never share a temp file.
fn staging_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");
    let seq = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!(".{file_name}.{}.{seq}.tmp", std::process::id()))
}

/// Write bytes to `path` via a staging file and a rename.
///
/// Readers observe either the previous contents or the new contents, never a
/// torn write. Missing parent directories are created first.
///
/// # Errors
/// Returns an error if the staging file cannot be written or renamed.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    ensure_parent_dir(path)?;
    let staging = staging_path(path);

    let written = File::create(&staging).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    if let Err(e) = written {
        let _ = fs::remove_file(&staging);
        return Err(e);
    }

    if let Err(e) = fs::rename(&staging, path) {
        // Windows refuses to rename over an existing file.
        if cfg!(windows) && path.exists() {
            let copied = fs::copy(&staging, path).map(|_| ());
            let _ = fs::remove_file(&staging);
            return copied;
        }
        let _ = fs::remove_file(&staging);
        return Err(e);
    }

    Ok(())
}
