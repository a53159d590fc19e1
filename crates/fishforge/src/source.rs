//! Source acquisition: release resolution, a per-version archive cache, checksum
//! verification, and zip extraction that refuses entries escaping the destination.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::cancel::CancelToken;
use crate::config::SourceSettings;
use crate::error::{Error, ErrorKind, Result};
use crate::events::BuildSink;
use crate::fsutil::{ensure_dir, sha256_file_hex};
use crate::model::SourceDownloadResult;
use crate::net::HttpFetch;
use crate::workspace::{ScratchSet, create_scratch_dir};

const DEV_VERSION: &str = "master";

/// Concrete download for a requested version tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseTarget {
    pub url: String,
    pub version: String,
    /// True for moving targets (branch heads) that must never be served from cache.
    pub moving: bool,
}

pub struct SourceProvider {
    settings: SourceSettings,
    scratch_parent: PathBuf,
    http: Arc<dyn HttpFetch>,
}

impl SourceProvider {
    pub fn new(settings: SourceSettings, scratch_parent: PathBuf, http: Arc<dyn HttpFetch>) -> Self {
        Self {
            settings,
            scratch_parent,
            http,
        }
    }

    pub fn cache_root(&self) -> PathBuf {
        self.settings.cache_root()
    }

    pub fn resolve(
        &self,
        version_tag: &str,
        sink: &dyn BuildSink,
        cancel: &CancelToken,
    ) -> Result<ReleaseTarget> {
        let tag = version_tag.trim();
        match tag.to_ascii_lowercase().as_str() {
            "" | "stable" | "latest" => match self.latest_release(cancel) {
                Ok(t) => Ok(t),
                Err(e) if e.kind() != ErrorKind::Cancelled && self.settings.fallback_to_dev => {
                    warn!(error = %e, "release lookup failed; falling back to development sources");
                    sink.output(format!(
                        "Could not fetch release info ({e}); using the development version instead."
                    ));
                    Ok(self.dev_target())
                }
                Err(e) => Err(e),
            },
            "dev" | "master" => Ok(self.dev_target()),
            _ => Ok(ReleaseTarget {
                url: self.settings.tag_archive_url.replace("{tag}", tag),
                version: tag.to_string(),
                moving: false,
            }),
        }
    }

    fn dev_target(&self) -> ReleaseTarget {
        ReleaseTarget {
            url: self.settings.dev_archive_url.clone(),
            version: DEV_VERSION.to_string(),
            moving: true,
        }
    }

    fn latest_release(&self, cancel: &CancelToken) -> Result<ReleaseTarget> {
        let v = self.http.get_json(&self.settings.release_api_url, cancel)?;
        let tag = v.get("tag_name").and_then(|t| t.as_str()).unwrap_or("").trim();
        let url = v.get("zipball_url").and_then(|u| u.as_str()).unwrap_or("").trim();
        if tag.is_empty() || url.is_empty() {
            return Err(Error::new(
                ErrorKind::Network,
                format!(
                    "release lookup at {} returned no tag_name/zipball_url",
                    self.settings.release_api_url
                ),
            ));
        }
        Ok(ReleaseTarget {
            url: url.to_string(),
            version: tag.to_string(),
            moving: false,
        })
    }

    /// Download (or reuse) and extract the requested version into a fresh scratch dir.
    /// The dir is registered in `scratch` before anything is written, so the caller's
    /// cleanup removes it (and reports a failure to do so) whether or not this succeeds.
    pub fn acquire(
        &self,
        version_tag: &str,
        scratch: &mut ScratchSet,
        sink: &dyn BuildSink,
        cancel: &CancelToken,
    ) -> Result<SourceDownloadResult> {
        cancel.check()?;
        let target = self.resolve(version_tag, sink, cancel)?;
        let dir = create_scratch_dir(&self.scratch_parent, "fishforge-src-")?;
        scratch.track(dir.clone());
        self.acquire_into(&dir, version_tag, &target, sink, cancel)
    }

    fn acquire_into(
        &self,
        scratch: &Path,
        requested: &str,
        target: &ReleaseTarget,
        sink: &dyn BuildSink,
        cancel: &CancelToken,
    ) -> Result<SourceDownloadResult> {
        let archive = scratch.join("source.zip");
        let expected = self
            .settings
            .checksums
            .get(&target.version)
            .or_else(|| self.settings.checksums.get(requested.trim()))
            .map(|s| s.trim().to_ascii_lowercase());

        let from_cache = !target.moving
            && self.restore_cached(&target.version, &archive, expected.as_deref());
        if from_cache {
            sink.output(format!("Using cached source archive for {}", target.version));
        } else {
            sink.output(format!("Downloading {} from {}", target.version, target.url));
            self.download_archive(&target.url, &archive, cancel)?;
            if let Some(want) = expected.as_deref() {
                verify_checksum(&archive, want)?;
            }
            if !target.moving {
                self.store_cached(&target.version, &archive);
            }
        }

        cancel.check()?;
        let dest = scratch.join("extract");
        sink.output("Extracting source archive...".to_string());
        extract_zip(&archive, &dest, self.settings.max_extracted_bytes, cancel)?;
        let _ = fs::remove_file(&archive);

        let project_root = find_project_dir(&dest, &self.settings.project)?;
        let source_dir = project_root.join("src");
        if !source_dir.is_dir() {
            return Err(Error::new(
                ErrorKind::MissingLayout,
                format!("archive has no src directory under {}", project_root.display()),
            ));
        }
        info!(source = %source_dir.display(), version = %target.version, "sources ready");
        Ok(SourceDownloadResult {
            source_dir,
            project_root,
            scratch_root: scratch.to_path_buf(),
            resolved_version: target.version.clone(),
        })
    }

    fn download_archive(&self, url: &str, dest: &Path, cancel: &CancelToken) -> Result<()> {
        let file = File::create(dest)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dest.display())))?;
        let mut out = BufWriter::new(file);
        let mut last_logged = 0u64;
        let n = self.http.download(
            url,
            &mut out,
            self.settings.max_archive_bytes,
            cancel,
            &mut |got, total| {
                if got - last_logged >= 4 * 1024 * 1024 {
                    last_logged = got;
                    debug!(url, got, ?total, "archive download progress");
                }
            },
        )?;
        drop(out);
        info!(url, bytes = n, "archive downloaded");
        Ok(())
    }

    fn cache_path(&self, version: &str) -> PathBuf {
        let key: String = version
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.cache_root().join(format!("{key}.zip"))
    }

    fn restore_cached(&self, version: &str, dest: &Path, expected: Option<&str>) -> bool {
        let cached = self.cache_path(version);
        if !cached.is_file() {
            return false;
        }
        if let Some(want) = expected
            && verify_checksum(&cached, want).is_err()
        {
            warn!(path = %cached.display(), "cached archive fails checksum; discarding");
            let _ = fs::remove_file(&cached);
            return false;
        }
        match fs::copy(&cached, dest) {
            Ok(_) => {
                debug!(path = %cached.display(), "source cache hit");
                true
            }
            Err(e) => {
                warn!(path = %cached.display(), error = %e, "cache read failed");
                false
            }
        }
    }

    /// Best-effort: racing writers of the same version produce identical content.
    fn store_cached(&self, version: &str, archive: &Path) {
        let dst = self.cache_path(version);
        let stored = (|| -> Result<()> {
            let dir = dst
                .parent()
                .ok_or_else(|| Error::msg("cache path has no parent"))?;
            ensure_dir(dir)?;
            let tmp = tempfile::NamedTempFile::new_in(dir)?;
            fs::copy(archive, tmp.path())?;
            tmp.persist(&dst)
                .map_err(|e| Error::msg(format!("failed to persist cache entry: {e}")))?;
            Ok(())
        })();
        match stored {
            Ok(()) => debug!(path = %dst.display(), "cached source archive"),
            Err(e) => warn!(path = %dst.display(), error = %e, "cache write failed"),
        }
    }
}

pub fn verify_checksum(path: &Path, expected_hex: &str) -> Result<()> {
    let got = sha256_file_hex(path)?;
    if !got.eq_ignore_ascii_case(expected_hex.trim()) {
        return Err(Error::new(
            ErrorKind::Integrity,
            format!(
                "checksum mismatch for {}: expected {expected_hex}, got {got}",
                path.display()
            ),
        ));
    }
    Ok(())
}

/// Lexically resolve an entry name relative to the destination root.
/// Absolute names and names whose relative path climbs above the root are rejected.
pub fn safe_entry_path(name: &str) -> Result<PathBuf> {
    let normalized = name.replace('\\', "/");
    let traversal = || {
        Error::new(
            ErrorKind::PathTraversal,
            format!("archive entry '{name}' escapes the extraction directory"),
        )
    };
    if normalized.starts_with('/') {
        return Err(traversal());
    }
    let mut parts: Vec<&str> = Vec::new();
    for comp in Path::new(&normalized).components() {
        match comp {
            Component::Normal(_) => {
                let Some(s) = comp.as_os_str().to_str() else {
                    return Err(traversal());
                };
                // Drive-qualified names ("C:") are absolute on Windows.
                if s.contains(':') {
                    return Err(traversal());
                }
                parts.push(s);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(traversal());
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(traversal()),
        }
    }
    Ok(parts.iter().collect())
}

/// Extract `archive` into `dest`. Every entry name is checked before anything is written,
/// so a single hostile entry rejects the whole archive. At most `max_bytes` are written in
/// total, whatever sizes the entries declare.
pub fn extract_zip(
    archive: &Path,
    dest: &Path,
    max_bytes: u64,
    cancel: &CancelToken,
) -> Result<Vec<PathBuf>> {
    let file = File::open(archive)
        .map_err(|e| Error::msg(format!("failed to open {}: {e}", archive.display())))?;
    let mut zip = ZipArchive::new(file)?;

    let mut plan = Vec::with_capacity(zip.len());
    let mut declared = 0u64;
    for i in 0..zip.len() {
        let entry = zip.by_index(i)?;
        let rel = safe_entry_path(entry.name())?;
        declared = declared.saturating_add(entry.size());
        plan.push((rel, entry.is_dir()));
    }
    if declared > max_bytes {
        return Err(extracted_too_large(max_bytes));
    }

    ensure_dir(dest)?;
    let mut written = Vec::new();
    let mut total = 0u64;
    for (i, (rel, is_dir)) in plan.into_iter().enumerate() {
        cancel.check()?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let out = dest.join(&rel);
        if is_dir {
            ensure_dir(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            ensure_dir(parent)?;
        }
        let entry = zip.by_index(i)?;
        let mut f = File::create(&out)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", out.display())))?;
        // Declared sizes can lie; cap what is actually inflated.
        let budget = max_bytes - total;
        let n = io::copy(&mut entry.take(budget.saturating_add(1)), &mut f)
            .map_err(|e| Error::msg(format!("failed to extract {}: {e}", rel.display())))?;
        if n > budget {
            return Err(extracted_too_large(max_bytes));
        }
        total += n;
        written.push(out);
    }
    debug!(archive = %archive.display(), files = written.len(), bytes = total, "archive extracted");
    Ok(written)
}

fn extracted_too_large(limit: u64) -> Error {
    Error::new(
        ErrorKind::TooLarge,
        format!("archive expands beyond {limit} bytes"),
    )
}

/// The single top-level directory whose name contains the project name.
pub fn find_project_dir(extracted: &Path, project: &str) -> Result<PathBuf> {
    let wanted = project.to_ascii_lowercase();
    let mut matches = Vec::new();
    for entry in fs::read_dir(extracted)
        .map_err(|e| Error::msg(format!("failed to read {}: {e}", extracted.display())))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if entry
            .file_name()
            .to_string_lossy()
            .to_ascii_lowercase()
            .contains(&wanted)
        {
            matches.push(entry.path());
        }
    }
    match matches.len() {
        1 => Ok(matches.remove(0)),
        0 => Err(Error::new(
            ErrorKind::MissingLayout,
            format!("archive has no top-level '{project}' directory"),
        )),
        n => Err(Error::new(
            ErrorKind::MissingLayout,
            format!("archive has {n} top-level directories matching '{project}'"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectSink;
    use crate::net::testing::FakeHttp;
    use std::io::{Cursor, Write};
    use std::time::Duration;

    fn zip_of(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut w = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let opts = zip::write::FileOptions::default();
        for (name, data) in entries {
            if name.ends_with('/') {
                w.add_directory(*name, opts).expect("dir");
            } else {
                w.start_file(*name, opts).expect("file");
                w.write_all(data.as_bytes()).expect("write");
            }
        }
        w.finish().expect("finish").into_inner()
    }

    fn settings(cache: &Path) -> SourceSettings {
        SourceSettings {
            project: "Stockfish".into(),
            release_api_url: "https://api.test/latest".into(),
            dev_archive_url: "https://dl.test/master.zip".into(),
            tag_archive_url: "https://dl.test/tags/{tag}.zip".into(),
            cache_dir: Some(cache.to_path_buf()),
            ..SourceSettings::default()
        }
    }

    #[test]
    fn tags_resolve_to_archive_urls() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let http = FakeHttp::default().with_json(
            "https://api.test/latest",
            serde_json::json!({"tag_name": "sf_17", "zipball_url": "https://dl.test/zipball/sf_17"}),
        );
        let p = SourceProvider::new(settings(tmp.path()), tmp.path().into(), Arc::new(http));
        let sink = CollectSink::default();
        let c = CancelToken::new();

        let stable = p.resolve("stable", &sink, &c).expect("stable");
        assert_eq!(stable.url, "https://dl.test/zipball/sf_17");
        assert_eq!(stable.version, "sf_17");
        let dev = p.resolve("DEV", &sink, &c).expect("dev");
        assert_eq!((dev.version.as_str(), dev.moving), ("master", true));
        let tag = p.resolve("sf_16.1", &sink, &c).expect("tag");
        assert_eq!(tag.url, "https://dl.test/tags/sf_16.1.zip");
    }

    #[test]
    fn failed_release_lookup_falls_back_only_when_enabled() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let sink = CollectSink::default();
        let c = CancelToken::new();

        let strict = SourceProvider::new(
            settings(tmp.path()),
            tmp.path().into(),
            Arc::new(FakeHttp::default()),
        );
        assert_eq!(
            strict.resolve("latest", &sink, &c).expect_err("no fallback").kind(),
            ErrorKind::Network
        );

        let mut s = settings(tmp.path());
        s.fallback_to_dev = true;
        let lenient = SourceProvider::new(s, tmp.path().into(), Arc::new(FakeHttp::default()));
        let t = lenient.resolve("latest", &sink, &c).expect("fallback");
        assert_eq!(t.version, "master");
        assert!(sink.output_lines().iter().any(|l| l.contains("development version")));
    }

    #[test]
    fn entry_paths_are_checked_lexically() {
        assert_eq!(safe_entry_path("a/./b/../c.txt").expect("ok"), PathBuf::from("a/c.txt"));
        for bad in ["../x", "a/../../x", "/etc/passwd", "..\\..\\x", "C:/x"] {
            let err = safe_entry_path(bad).expect_err(bad);
            assert_eq!(err.kind(), ErrorKind::PathTraversal, "{bad}");
        }
    }

    #[test]
    fn traversal_entry_rejects_whole_archive() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let archive = tmp.path().join("evil.zip");
        fs::write(
            &archive,
            zip_of(&[("Stockfish-x/src/ok.h", "ok"), ("../evil.txt", "pwned")]),
        )
        .expect("write zip");
        let dest = tmp.path().join("out");

        let err = extract_zip(&archive, &dest, u64::MAX, &CancelToken::new()).expect_err("traversal");
        assert_eq!(err.kind(), ErrorKind::PathTraversal);
        assert!(!tmp.path().join("evil.txt").exists());
        assert!(!dest.join("Stockfish-x/src/ok.h").exists());
    }

    #[test]
    fn acquire_extracts_and_caches_tagged_sources() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cache = tmp.path().join("cache");
        let scratch_parent = tmp.path().join("scratch");
        let body = zip_of(&[
            ("Stockfish-sf_16/", ""),
            ("Stockfish-sf_16/src/", ""),
            ("Stockfish-sf_16/src/Makefile", "all:\n"),
        ]);
        let http = Arc::new(
            FakeHttp::default().with_file("https://dl.test/tags/sf_16.zip", body.clone()),
        );

        let mut s = settings(&cache);
        s.checksums
            .insert("sf_16".into(), crate::fsutil::sha256_bytes_hex(&body).to_uppercase());
        let p = SourceProvider::new(s, scratch_parent.clone(), http.clone());
        let sink = CollectSink::default();

        let mut scratch = ScratchSet::default();
        let first = p
            .acquire("sf_16", &mut scratch, &sink, &CancelToken::new())
            .expect("acquire");
        assert!(first.source_dir.join("Makefile").is_file());
        assert_eq!(first.resolved_version, "sf_16");
        assert!(first.source_dir.starts_with(&first.scratch_root));
        assert!(cache.join("sf_16.zip").is_file());

        let second = p
            .acquire("sf_16", &mut scratch, &sink, &CancelToken::new())
            .expect("cached");
        assert_ne!(first.scratch_root, second.scratch_root);
        assert_eq!(http.downloaded().len(), 1);
        assert_eq!(scratch.paths(), [first.scratch_root.clone(), second.scratch_root.clone()]);
        assert!(scratch.cleanup(1, Duration::ZERO).is_empty());
        assert!(!first.scratch_root.exists());
    }

    #[test]
    fn checksum_mismatch_is_integrity_error_and_cleans_scratch() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let scratch_parent = tmp.path().join("scratch");
        let http = FakeHttp::default().with_file(
            "https://dl.test/tags/sf_15.zip",
            zip_of(&[("Stockfish-sf_15/src/a.h", "a")]),
        );
        let mut s = settings(&tmp.path().join("cache"));
        s.checksums.insert("sf_15".into(), "00".repeat(32));
        let p = SourceProvider::new(s, scratch_parent.clone(), Arc::new(http));

        let mut scratch = ScratchSet::default();
        let err = p
            .acquire("sf_15", &mut scratch, &CollectSink::default(), &CancelToken::new())
            .expect_err("mismatch");
        assert_eq!(err.kind(), ErrorKind::Integrity);
        // The failed attempt's dir is left to the owner of the scratch set.
        assert_eq!(scratch.paths().len(), 1);
        assert!(scratch.paths()[0].starts_with(&scratch_parent));
        assert!(scratch.cleanup(1, Duration::ZERO).is_empty());
        assert_eq!(fs::read_dir(&scratch_parent).expect("read").count(), 0);
        assert!(!tmp.path().join("cache/sf_15.zip").exists());
    }

    #[test]
    fn missing_src_directory_is_a_layout_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let http = FakeHttp::default().with_file(
            "https://dl.test/master.zip",
            zip_of(&[("Stockfish-master/README.md", "hi")]),
        );
        let p = SourceProvider::new(
            settings(&tmp.path().join("cache")),
            tmp.path().join("scratch"),
            Arc::new(http),
        );
        let err = p
            .acquire("master", &mut ScratchSet::default(), &CollectSink::default(), &CancelToken::new())
            .expect_err("no src");
        assert_eq!(err.kind(), ErrorKind::MissingLayout);
        assert!(!tmp.path().join("cache/master.zip").exists());
    }

    #[test]
    fn oversized_archive_is_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let http = FakeHttp::default().with_file("https://dl.test/tags/big.zip", vec![0u8; 4096]);
        let mut s = settings(&tmp.path().join("cache"));
        s.max_archive_bytes = 1024;
        let p = SourceProvider::new(s, tmp.path().join("scratch"), Arc::new(http));
        let err = p
            .acquire("big", &mut ScratchSet::default(), &CollectSink::default(), &CancelToken::new())
            .expect_err("too large");
        assert_eq!(err.kind(), ErrorKind::TooLarge);
    }

    #[test]
    fn inflated_size_is_capped() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let archive = tmp.path().join("bomb.zip");
        let big = "0".repeat(64 * 1024);
        fs::write(
            &archive,
            zip_of(&[("Stockfish-x/src/a.bin", big.as_str()), ("Stockfish-x/src/b.bin", big.as_str())]),
        )
        .expect("write zip");

        let dest = tmp.path().join("out");
        let err = extract_zip(&archive, &dest, 96 * 1024, &CancelToken::new()).expect_err("cap");
        assert_eq!(err.kind(), ErrorKind::TooLarge);

        let ok = extract_zip(&archive, &tmp.path().join("ok"), 128 * 1024, &CancelToken::new())
            .expect("fits");
        assert_eq!(ok.len(), 2);
    }
}
