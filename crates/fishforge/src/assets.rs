use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use regex::Regex;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::config::AssetSettings;
use crate::error::{ErrorKind, Result};
use crate::events::BuildSink;
use crate::fsutil::{file_len, replace_file, sha256_file_hex};
use crate::model::NetworkFileValidation;
use crate::net::HttpFetch;

/// Placeholder contents: enough for the link step's embed directive, far below any
/// real network size so it can never validate.
pub const PLACEHOLDER_BYTES: &[u8; 32] = b"FISHFORGE-PLACEHOLDER-NETWORK\0\0\0";

fn decl_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"#define\s+EvalFileDefaultName(?:Big|Small)?\s+"(nn-[0-9A-Za-z]+\.nnue)""#)
            .expect("static regex")
    })
}

fn asset_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^nn-[0-9A-Za-z]+\.nnue$").expect("static regex"))
}

fn hash_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^nn-([0-9a-fA-F]{12})").expect("static regex"))
}

/// Content-hash prefix encoded in an asset file name, lowercased.
pub fn expected_hash_prefix(file_name: &str) -> Option<String> {
    hash_prefix_re()
        .captures(file_name)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_ascii_lowercase())
}

/// Size threshold first, then the hash prefix when the name carries one.
pub fn validate_asset(path: &Path, min_size: u64) -> NetworkFileValidation {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let verdict = |size: u64, sha256: Option<String>, valid: bool, reason: String| {
        NetworkFileValidation {
            file_name: file_name.clone(),
            size,
            sha256,
            valid,
            reason,
        }
    };

    let Some(size) = file_len(path) else {
        return verdict(0, None, false, "missing".into());
    };
    let sha = match sha256_file_hex(path) {
        Ok(h) => h,
        Err(e) => return verdict(size, None, false, format!("unreadable: {e}")),
    };
    if size < min_size {
        return verdict(
            size,
            Some(sha),
            false,
            format!("too small ({size} bytes, minimum {min_size})"),
        );
    }
    if let Some(prefix) = expected_hash_prefix(&file_name)
        && !sha.starts_with(&prefix)
    {
        return verdict(
            size,
            Some(sha),
            false,
            format!("hash prefix mismatch (expected {prefix})"),
        );
    }
    verdict(size, Some(sha), true, "ok".into())
}

#[derive(Debug, Clone, Default)]
pub struct ProvisionOutcome {
    pub names: Vec<String>,
    pub validations: Vec<NetworkFileValidation>,
    pub any_valid: bool,
    pub placeholder_written: bool,
}

pub struct AssetProvisioner {
    settings: AssetSettings,
    http: Arc<dyn HttpFetch>,
}

impl AssetProvisioner {
    pub fn new(settings: AssetSettings, http: Arc<dyn HttpFetch>) -> Self {
        Self { settings, http }
    }

    /// Expected asset names: header declarations, then files already present, then the
    /// legacy default.
    pub fn discover_names(&self, source_dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for header in &self.settings.headers {
            let Ok(text) = fs::read_to_string(source_dir.join(header)) else {
                continue;
            };
            for cap in decl_re().captures_iter(&text) {
                let name = cap[1].to_string();
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        if !names.is_empty() {
            return names;
        }

        for entry in walkdir::WalkDir::new(source_dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().is_file() && asset_name_re().is_match(&name) {
                names.push(name);
            }
        }
        if !names.is_empty() {
            return names;
        }
        vec![self.settings.legacy_default_name.clone()]
    }

    /// Make sure every expected asset is present and valid, downloading where allowed.
    /// Download failures degrade the outcome; only cancellation is returned as an error.
    pub fn provision(
        &self,
        source_dir: &Path,
        fetch: bool,
        enable_pgo: bool,
        sink: &dyn BuildSink,
        cancel: &CancelToken,
    ) -> Result<ProvisionOutcome> {
        let names = self.discover_names(source_dir);
        debug!(?names, "expected network files");
        let mut validations = Vec::with_capacity(names.len());

        for name in &names {
            cancel.check()?;
            let path = source_dir.join(name);
            let current = validate_asset(&path, self.settings.min_size_bytes);
            if current.valid {
                sink.output(format!("Network file {name} already present and valid"));
                validations.push(current);
                continue;
            }
            if !fetch {
                sink.output(format!(
                    "Network file {name} not usable ({}); downloads disabled",
                    current.reason
                ));
                validations.push(current);
                continue;
            }
            validations.push(self.fetch_one(name, &path, sink, cancel)?);
        }

        let any_valid = validations.iter().any(|v| v.valid);
        let mut outcome = ProvisionOutcome {
            names,
            validations,
            any_valid,
            placeholder_written: false,
        };
        if !enable_pgo && !any_valid {
            self.ensure_placeholders(source_dir, &mut outcome, sink);
        }
        info!(any_valid, placeholder = outcome.placeholder_written, "network provisioning done");
        Ok(outcome)
    }

    fn fetch_one(
        &self,
        name: &str,
        dest: &Path,
        sink: &dyn BuildSink,
        cancel: &CancelToken,
    ) -> Result<NetworkFileValidation> {
        let part = dest.with_file_name(format!("{name}.part"));
        let mut last = validate_asset(dest, self.settings.min_size_bytes);
        for template in &self.settings.mirrors {
            let url = template.replace("{name}", name);
            sink.output(format!("Downloading network file {name} from {url}"));
            match self.download_to(&url, &part, cancel) {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::Cancelled => {
                    let _ = fs::remove_file(&part);
                    return Err(e);
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "mirror failed");
                    sink.output(format!("Mirror failed: {e}"));
                    let _ = fs::remove_file(&part);
                    last.reason = format!("all mirrors failed; last: {e}");
                    continue;
                }
            }

            let check = validate_asset(&part, self.settings.min_size_bytes);
            if !check.valid {
                warn!(url = %url, reason = %check.reason, "downloaded network file rejected");
                sink.output(format!("Downloaded {name} rejected: {}", check.reason));
                let _ = fs::remove_file(&part);
                last.reason = format!("all mirrors failed; last: {}", check.reason);
                continue;
            }
            if let Err(e) = replace_file(&part, dest) {
                warn!(error = %e, "could not move network file into place");
                let _ = fs::remove_file(&part);
                last.reason = e.to_string();
                continue;
            }
            sink.output(format!("Network file {name} verified ({} bytes)", check.size));
            return Ok(NetworkFileValidation {
                file_name: name.to_string(),
                ..check
            });
        }
        last.valid = false;
        Ok(last)
    }

    fn download_to(&self, url: &str, part: &Path, cancel: &CancelToken) -> Result<u64> {
        let mut out = BufWriter::new(File::create(part)?);
        self.http.download(
            url,
            &mut out,
            self.settings.max_download_bytes,
            cancel,
            &mut |_, _| {},
        )
    }

    /// Write placeholders for every expected name that has no valid file.
    pub fn ensure_placeholders(
        &self,
        source_dir: &Path,
        outcome: &mut ProvisionOutcome,
        sink: &dyn BuildSink,
    ) {
        for name in outcome.names.clone() {
            let path = source_dir.join(&name);
            if outcome.validations.iter().any(|v| v.valid && v.file_name == name) {
                continue;
            }
            match write_placeholder(&path) {
                Ok(()) => {
                    outcome.placeholder_written = true;
                    sink.output(format!(
                        "Wrote placeholder for {name}; the binary will need a real network file at runtime"
                    ));
                    let v = validate_asset(&path, self.settings.min_size_bytes);
                    let slot = outcome.validations.iter_mut().find(|x| x.file_name == name);
                    if let Some(slot) = slot {
                        *slot = NetworkFileValidation {
                            reason: format!("placeholder; {}", v.reason),
                            ..v
                        };
                    } else {
                        outcome.validations.push(v);
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "placeholder write failed");
                    sink.output(format!("Could not write placeholder for {name}: {e}"));
                }
            }
        }
    }
}

pub fn write_placeholder(path: &Path) -> Result<()> {
    fs::write(path, PLACEHOLDER_BYTES)?;
    Ok(())
}

/// Any present file among `names` in `dir` that validates.
pub fn find_valid_asset(dir: &Path, names: &[String], min_size: u64) -> Option<PathBuf> {
    names
        .iter()
        .map(|n| dir.join(n))
        .find(|p| validate_asset(p, min_size).valid)
}
