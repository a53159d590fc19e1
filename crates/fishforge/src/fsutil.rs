use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result};

pub fn ensure_dir(p: &Path) -> Result<()> {
    fs::create_dir_all(p)
        .map_err(|e| Error::msg(format!("failed to create dir {}: {e}", p.display())))
}

pub fn write_text(p: &Path, s: &str) -> Result<()> {
    if let Some(parent) = p.parent() {
        ensure_dir(parent)?;
    }
    fs::write(p, s).map_err(|e| Error::msg(format!("failed to write {}: {e}", p.display())))
}

pub fn write_json_pretty(p: &Path, v: &serde_json::Value) -> Result<()> {
    let s = serde_json::to_string_pretty(v)
        .map_err(|e| Error::msg(format!("json encode error: {e}")))?;
    write_text(p, &s)
}

#[cfg(unix)]
pub fn make_executable(p: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(p, fs::Permissions::from_mode(0o755))
        .map_err(|e| Error::msg(format!("failed to chmod {}: {e}", p.display())))
}

#[cfg(not(unix))]
pub fn make_executable(_p: &Path) -> Result<()> {
    Ok(())
}

pub fn sha256_file_hex(path: &Path) -> Result<String> {
    use sha2::{Digest, Sha256};

    let mut file = fs::File::open(path)
        .map_err(|e| Error::msg(format!("failed to open {}: {e}", path.display())))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1024 * 256];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn sha256_bytes_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(bytes))
}

pub fn file_len(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().filter(|m| m.is_file()).map(|m| m.len())
}

/// Replace `dst` with `src` via rename; both must live on the same filesystem.
pub fn replace_file(src: &Path, dst: &Path) -> Result<()> {
    #[cfg(windows)]
    if dst.exists() {
        let _ = fs::remove_file(dst);
    }
    fs::rename(src, dst).map_err(|e| {
        Error::msg(format!(
            "failed to move {} to {}: {e}",
            src.display(),
            dst.display()
        ))
    })
}

/// Outcome of a best-effort directory removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
    Removed { attempts: u32 },
    AlreadyGone,
    Failed { path: PathBuf, error: String },
}

/// Remove a directory tree, retrying a fixed number of times with linear backoff.
/// Never waits on cancellation: cleanup must finish even for cancelled builds.
pub fn remove_dir_with_retries(dir: &Path, attempts: u32, backoff: Duration) -> Removal {
    if !dir.exists() {
        return Removal::AlreadyGone;
    }
    let attempts = attempts.max(1);
    let mut last_err = String::new();
    for attempt in 1..=attempts {
        match fs::remove_dir_all(dir) {
            Ok(()) => {
                debug!(path = %dir.display(), attempt, "removed scratch dir");
                return Removal::Removed { attempts: attempt };
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Removal::Removed { attempts: attempt };
            }
            Err(e) => {
                last_err = e.to_string();
                warn!(path = %dir.display(), attempt, error = %e, "scratch dir removal failed");
                if attempt < attempts {
                    thread::sleep(backoff * attempt);
                }
            }
        }
    }
    Removal::Failed {
        path: dir.to_path_buf(),
        error: last_err,
    }
}
