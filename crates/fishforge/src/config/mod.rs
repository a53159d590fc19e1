use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use toml::Value;

use crate::error::{Error, ErrorKind, Result};

pub const DEFAULT_RELEASE_API: &str =
    "https://api.github.com/repos/official-stockfish/Stockfish/releases/latest";
pub const DEFAULT_DEV_ARCHIVE: &str =
    "https://github.com/official-stockfish/Stockfish/archive/refs/heads/master.zip";
pub const DEFAULT_TAG_ARCHIVE: &str =
    "https://github.com/official-stockfish/Stockfish/archive/refs/tags/{tag}.zip";

#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    pub fn empty() -> Self {
        Self {
            path: PathBuf::from("<defaults>"),
            value: Value::Table(Default::default()),
        }
    }

    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }
        let mut cur = &self.value;
        for seg in path.split('.') {
            cur = cur.as_table()?.get(seg)?;
        }
        Some(cur)
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let parsed = v.clone().try_into().map_err(|e| {
            Error::new(
                ErrorKind::Config,
                format!("failed to deserialize config at '{}': {e}", path),
            )
        })?;
        Ok(Some(parsed))
    }
}

pub fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_tbl), Value::Table(child_tbl)) => {
            for (k, v) in child_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

fn load_value_inner(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::new(
            ErrorKind::Config,
            format!("settings extends cycle detected at {}", canonical.display()),
        ));
    }

    let data = fs::read_to_string(path).map_err(|e| {
        Error::new(
            ErrorKind::Config,
            format!("failed to read settings {}: {e}", path.display()),
        )
    })?;
    let mut value: Value = toml::from_str(&data).map_err(|e| {
        Error::new(
            ErrorKind::Config,
            format!("TOML parse error in {}: {e}", path.display()),
        )
    })?;

    let mut out = Value::Table(Default::default());
    if let Some(parent) = value.get("extends").and_then(Value::as_str) {
        let parent = PathBuf::from(parent);
        let parent = if parent.is_absolute() {
            parent
        } else {
            path.parent().unwrap_or_else(|| Path::new(".")).join(parent)
        };
        out = load_value_inner(&parent, stack)?;
    }
    if let Some(tbl) = value.as_table_mut() {
        tbl.remove("extends");
    }
    merge(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let mut stack = HashSet::<PathBuf>::new();
    let value = load_value_inner(path, &mut stack)?;
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    pub project: String,
    pub release_api_url: String,
    pub dev_archive_url: String,
    pub tag_archive_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
    pub max_archive_bytes: u64,
    /// Ceiling on the total size of extracted files.
    pub max_extracted_bytes: u64,
    pub checksums: BTreeMap<String, String>,
    pub fallback_to_dev: bool,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            project: "Stockfish".into(),
            release_api_url: DEFAULT_RELEASE_API.into(),
            dev_archive_url: DEFAULT_DEV_ARCHIVE.into(),
            tag_archive_url: DEFAULT_TAG_ARCHIVE.into(),
            cache_dir: None,
            max_archive_bytes: 256 * 1024 * 1024,
            max_extracted_bytes: 1024 * 1024 * 1024,
            checksums: BTreeMap::new(),
            fallback_to_dev: false,
        }
    }
}

impl SourceSettings {
    pub fn cache_root(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("fishforge")
                .join("sources")
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetSettings {
    pub headers: Vec<String>,
    pub mirrors: Vec<String>,
    pub min_size_bytes: u64,
    pub max_download_bytes: u64,
    pub legacy_default_name: String,
}

impl Default for AssetSettings {
    fn default() -> Self {
        Self {
            headers: vec!["evaluate.h".into(), "nnue/network.h".into()],
            mirrors: vec![
                "https://tests.stockfishchess.org/api/nn/{name}".into(),
                "https://github.com/official-stockfish/networks/raw/master/{name}".into(),
            ],
            min_size_bytes: 1_000_000,
            max_download_bytes: 512 * 1024 * 1024,
            legacy_default_name: "nn-5af11540bbfe.nnue".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainSettings {
    pub root_search_levels: usize,
    pub fallback_roots: Vec<PathBuf>,
}

impl Default for ToolchainSettings {
    fn default() -> Self {
        let mut fallback_roots: Vec<PathBuf> = ["C:/msys64", "C:/msys2", "D:/msys64", "D:/msys2"]
            .iter()
            .map(PathBuf::from)
            .collect();
        if let Some(home) = dirs::home_dir() {
            fallback_roots.push(home.join("msys64"));
            fallback_roots.push(home.join("msys2"));
        }
        Self {
            root_search_levels: 2,
            fallback_roots,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSettings {
    pub max_output_chars: usize,
    pub max_line_chars: usize,
    pub reader_grace_ms: u64,
    pub kill_grace_ms: u64,
    pub compile_timeout_secs: u64,
    pub strip_timeout_secs: u64,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            max_output_chars: 256_000,
            max_line_chars: crate::log_sanitize::DEFAULT_MAX_LINE_CHARS,
            reader_grace_ms: 2_000,
            kill_grace_ms: 1_500,
            compile_timeout_secs: 7_200,
            strip_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecipeSettings {
    pub plain_target: String,
    pub pgo_target: String,
    pub strip_target: String,
    pub checksum_var: String,
    pub executable: String,
}

impl Default for RecipeSettings {
    fn default() -> Self {
        Self {
            plain_target: "build".into(),
            pgo_target: "profile-build".into(),
            strip_target: "strip".into(),
            checksum_var: "SHASUM".into(),
            executable: "stockfish".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupSettings {
    pub attempts: u32,
    pub backoff_ms: u64,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    /// Roots an artifact may be written under; the user's home is always allowed.
    pub allowed_roots: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scratch_parent: Option<PathBuf>,
}

impl OutputSettings {
    pub fn scratch_parent(&self) -> PathBuf {
        self.scratch_parent.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Default build request carried in a settings file; CLI flags override it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildDefaults {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compiler: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetch_asset: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strip: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pgo: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeSettings {
    pub build: BuildDefaults,
    pub source: SourceSettings,
    pub assets: AssetSettings,
    pub toolchain: ToolchainSettings,
    pub process: ProcessSettings,
    pub recipe: RecipeSettings,
    pub cleanup: CleanupSettings,
    pub output: OutputSettings,
}

impl ForgeSettings {
    pub fn from_doc(doc: &ConfigDoc) -> Result<Self> {
        Ok(doc.deserialize_path("")?.unwrap_or_default())
    }

    /// Apply `FISHFORGE_*` overrides from the given lookup (normally `std::env::var`).
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(dir) = non_empty("FISHFORGE_CACHE_DIR") {
            self.source.cache_dir = Some(PathBuf::from(dir.trim()));
        }
        if let Some(dir) = non_empty("FISHFORGE_SCRATCH_DIR") {
            self.output.scratch_parent = Some(PathBuf::from(dir.trim()));
        }
        if let Some(raw) = non_empty("FISHFORGE_MIRRORS") {
            let mirrors: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned)
                .collect();
            if !mirrors.is_empty() {
                self.assets.mirrors = mirrors;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let doc = ConfigDoc {
            path: PathBuf::from("<mem>"),
            value: toml::from_str("[process]\nreader_grace_ms = 10\n").expect("toml"),
        };
        let s = ForgeSettings::from_doc(&doc).expect("settings");
        assert_eq!(s.process.reader_grace_ms, 10);
        assert_eq!(s.process.kill_grace_ms, 1_500);
        assert_eq!(s.recipe.pgo_target, "profile-build");
        assert_eq!(s.assets.headers.len(), 2);
    }

    #[test]
    fn extends_merges_child_over_parent() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(
            tmp.path().join("base.toml"),
            "[source]\nproject = \"Base\"\nfallback_to_dev = true\n[cleanup]\nattempts = 9\n",
        )
        .expect("write base");
        fs::write(
            tmp.path().join("child.toml"),
            "extends = \"base.toml\"\n[source]\nproject = \"Child\"\n",
        )
        .expect("write child");

        let doc = load(&tmp.path().join("child.toml")).expect("load");
        let s = ForgeSettings::from_doc(&doc).expect("settings");
        assert_eq!(s.source.project, "Child");
        assert!(s.source.fallback_to_dev);
        assert_eq!(s.cleanup.attempts, 9);
    }

    #[test]
    fn extends_cycle_is_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("a.toml"), "extends = \"b.toml\"\n").expect("write a");
        fs::write(tmp.path().join("b.toml"), "extends = \"a.toml\"\n").expect("write b");
        let err = load(&tmp.path().join("a.toml")).expect_err("cycle");
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(err.to_string().contains("cycle"), "unexpected err: {err}");
    }

    #[test]
    fn env_overrides_replace_mirrors_and_dirs() {
        let mut s = ForgeSettings::default();
        s.apply_env_overrides(|k| match k {
            "FISHFORGE_MIRRORS" => Some("https://a/{name}, ,https://b/{name}".into()),
            "FISHFORGE_CACHE_DIR" => Some("/tmp/ff-cache".into()),
            _ => None,
        });
        assert_eq!(s.assets.mirrors, vec!["https://a/{name}", "https://b/{name}"]);
        assert_eq!(s.source.cache_root(), PathBuf::from("/tmp/ff-cache"));
        assert!(s.output.scratch_parent.is_none());
    }
}
