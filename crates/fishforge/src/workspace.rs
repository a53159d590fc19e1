use std::env;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::OutputSettings;
use crate::error::{Error, ErrorKind, Result};
use crate::fsutil::{Removal, ensure_dir, remove_dir_with_retries};
use crate::model::Architecture;

#[cfg(unix)]
const SYSTEM_DIRS: &[&str] = &[
    "/bin",
    "/boot",
    "/dev",
    "/etc",
    "/lib",
    "/lib32",
    "/lib64",
    "/proc",
    "/sbin",
    "/sys",
    "/usr",
    "/var",
    "/System",
    "/Library",
    "/Applications",
];

#[cfg(not(unix))]
const SYSTEM_DIRS: &[&str] = &[];

/// Where artifacts may be written: under an allowed root, never inside a system dir.
#[derive(Debug, Clone)]
pub struct OutputPolicy {
    allowed_roots: Vec<PathBuf>,
}

impl OutputPolicy {
    /// The user's home is always allowed, plus any configured roots.
    pub fn new(settings: &OutputSettings) -> Self {
        let mut roots = settings.allowed_roots.clone();
        if let Some(home) = dirs::home_dir() {
            roots.push(home);
        }
        Self::with_roots(roots)
    }

    pub fn with_roots(roots: Vec<PathBuf>) -> Self {
        let allowed_roots = roots
            .into_iter()
            .filter(|r| !r.as_os_str().is_empty())
            .map(|r| canonicalize_lenient(&r))
            .collect();
        Self { allowed_roots }
    }

    pub fn validate(&self, raw: &Path) -> Result<PathBuf> {
        if raw.as_os_str().is_empty() {
            return Err(disallowed("output directory is empty".into()));
        }
        if raw.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(disallowed(format!(
                "output directory '{}' contains '..'",
                raw.display()
            )));
        }
        let absolute = if raw.is_absolute() {
            raw.to_path_buf()
        } else {
            env::current_dir()
                .map_err(|e| Error::msg(format!("cwd error: {e}")))?
                .join(raw)
        };
        let resolved = canonicalize_lenient(&absolute);

        if is_system_dir(&resolved) {
            return Err(disallowed(format!(
                "refusing to write artifacts into system directory '{}'",
                resolved.display()
            )));
        }
        if !self.allowed_roots.iter().any(|root| resolved.starts_with(root)) {
            return Err(disallowed(format!(
                "output directory '{}' is outside every allowed root",
                resolved.display()
            )));
        }
        Ok(resolved)
    }
}

fn disallowed(msg: String) -> Error {
    Error::new(ErrorKind::DisallowedOutput, msg)
}

fn is_system_dir(p: &Path) -> bool {
    // Filesystem or drive roots.
    if p.parent().is_none() {
        return true;
    }
    if SYSTEM_DIRS.iter().any(|d| p.starts_with(d)) {
        return true;
    }
    #[cfg(windows)]
    for var in ["SystemRoot", "ProgramFiles", "ProgramFiles(x86)", "ProgramData"] {
        if let Some(dir) = env::var_os(var)
            && p.starts_with(canonicalize_lenient(Path::new(&dir)))
        {
            return true;
        }
    }
    false
}

/// Canonicalize the deepest existing ancestor and re-append the rest, so paths that do
/// not exist yet still compare against canonical roots (e.g. `/tmp` vs `/private/tmp`).
pub fn canonicalize_lenient(p: &Path) -> PathBuf {
    let mut existing = p.to_path_buf();
    let mut rest = Vec::new();
    loop {
        if let Ok(can) = existing.canonicalize() {
            let mut out = can;
            for part in rest.iter().rev() {
                out.push(part);
            }
            return out;
        }
        match (existing.file_name().map(|n| n.to_os_string()), existing.parent()) {
            (Some(name), Some(parent)) => {
                rest.push(name);
                existing = parent.to_path_buf();
            }
            _ => return p.to_path_buf(),
        }
    }
}

/// `<project>_<arch>_<version>[.exe]`, with characters unsafe in file names replaced.
pub fn artifact_file_name(project: &str, arch: Architecture, version: &str) -> String {
    let clean = |s: &str| -> String {
        s.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '-'
                }
            })
            .collect()
    };
    format!(
        "{}_{}_{}{}",
        clean(&project.to_ascii_lowercase()),
        arch.id(),
        clean(version.trim()),
        env::consts::EXE_SUFFIX
    )
}

/// Create a fresh, randomly named directory under `parent` that outlives this call.
pub fn create_scratch_dir(parent: &Path, prefix: &str) -> Result<PathBuf> {
    ensure_dir(parent)?;
    let dir = tempfile::Builder::new()
        .prefix(prefix)
        .tempdir_in(parent)
        .map_err(|e| {
            Error::msg(format!(
                "failed to create scratch dir under {}: {e}",
                parent.display()
            ))
        })?;
    let path = dir.keep();
    debug!(path = %path.display(), "scratch dir created");
    Ok(path)
}

/// Scratch directories owned by one run, removed together on the terminal path.
#[derive(Debug, Default)]
pub struct ScratchSet {
    dirs: Vec<PathBuf>,
}

impl ScratchSet {
    pub fn track(&mut self, dir: PathBuf) {
        if !self.dirs.contains(&dir) {
            self.dirs.push(dir);
        }
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Remove everything tracked; returns the directories that could not be deleted.
    pub fn cleanup(&mut self, attempts: u32, backoff: Duration) -> Vec<(PathBuf, String)> {
        let mut failed = Vec::new();
        for dir in self.dirs.drain(..) {
            if let Removal::Failed { path, error } =
                remove_dir_with_retries(&dir, attempts, backoff)
            {
                warn!(path = %path.display(), %error, "scratch dir left behind");
                failed.push((path, error));
            }
        }
        failed
    }
}
