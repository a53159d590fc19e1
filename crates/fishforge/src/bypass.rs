//! Defeats the recipe's own network checksum verification.
//!
//! Two independent mechanisms: checksum-tool stubs placed first on the search path, and a
//! narrow rewrite of the recipe lines that compare the computed hash. Either may fail
//! without failing the build.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::fsutil::{make_executable, write_json_pretty, write_text};
use crate::model::NetworkFileValidation;
use crate::workspace::{ScratchSet, create_scratch_dir};

pub const REPORT_FILE: &str = "validation-report.json";
pub const RECIPE_BACKUP_SUFFIX: &str = ".fishforge.bak";
const MAX_PATCHED_LINES: usize = 4;
const STUB_NAMES: [&str; 2] = ["sha256sum", "shasum"];

const POSIX_STUB: &str = r#"#!/bin/sh
# fishforge checksum stub: verification always passes, hashes derive from file names.
for arg in "$@"; do
  case "$arg" in
    -c|--check|--check=*) exit 0 ;;
  esac
done
pad=@PAD@
skip=0
printed=0
for arg in "$@"; do
  if [ "$skip" = 1 ]; then skip=0; continue; fi
  case "$arg" in
    -a|--algorithm) skip=1; continue ;;
    -*) continue ;;
  esac
  base=${arg##*/}
  prefix=000000000000
  case "$base" in
    nn-*)
      rest=${base#nn-}
      head=${rest%"${rest#????????????}"}
      case "$head" in
        ""|*[!0-9a-fA-F]*) ;;
        *) prefix=$(printf '%s' "$head" | tr 'A-F' 'a-f') ;;
      esac
      ;;
  esac
  printf '%s%s  %s\n' "$prefix" "$pad" "$arg"
  printed=1
done
if [ "$printed" = 0 ]; then
  printf '%s%s  -\n' 000000000000 "$pad"
fi
exit 0
"#;

const BATCH_STUB: &str = "@echo off\r
rem fishforge checksum stub: verification always passes, hashes derive from file names.\r
setlocal EnableDelayedExpansion\r
for %%A in (%*) do (\r
  if /I \"%%~A\"==\"-c\" exit /b 0\r
  if /I \"%%~A\"==\"--check\" exit /b 0\r
)\r
set \"PAD=@PAD@\"\r
set \"PRINTED=0\"\r
for %%A in (%*) do (\r
  set \"ARG=%%~A\"\r
  if not \"!ARG:~0,1!\"==\"-\" if not \"!ARG!\"==\"256\" (\r
    set \"NAME=%%~nxA\"\r
    set \"PREFIX=000000000000\"\r
    if /I \"!NAME:~0,3!\"==\"nn-\" if not \"!NAME:~14,1!\"==\"\" (\r
      set \"HEAD=!NAME:~3,12!\"\r
      set \"REST=#!HEAD!\"\r
      for %%H in (0 1 2 3 4 5 6 7 8 9 a b c d e f) do set \"REST=!REST:%%H=!\"\r
      if \"!REST!\"==\"#\" (\r
        for %%H in (a b c d e f) do set \"HEAD=!HEAD:%%H=%%H!\"\r
        set \"PREFIX=!HEAD!\"\r
      )\r
    )\r
    echo !PREFIX!!PAD!  %%~A\r
    set \"PRINTED=1\"\r
  )\r
)\r
if \"!PRINTED!\"==\"0\" echo 000000000000!PAD!  -\r
exit /b 0\r
";

fn pad() -> String {
    "0".repeat(64 - 12)
}

fn check_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\s*@?)if \[(.*`\$\(shasum_command\).*)\]; then \\\s*$")
            .expect("static regex")
    })
}

fn net_target_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^net:").expect("static regex"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecipePatch {
    Patched { lines: usize, backup: PathBuf },
    Skipped(String),
    Failed(String),
}

impl RecipePatch {
    pub fn applied(&self) -> bool {
        matches!(self, RecipePatch::Patched { .. })
    }
}

#[derive(Debug, Clone)]
pub struct BypassOutcome {
    /// Directory holding the stubs; must go first on PATH and be removed at cleanup.
    pub wrapper_dir: Option<PathBuf>,
    pub recipe: RecipePatch,
}

/// Apply both mechanisms. Never fails: each problem is logged and reflected in the outcome.
pub fn apply(
    source_dir: &Path,
    root_dir: &Path,
    validations: &[NetworkFileValidation],
    scratch_parent: &Path,
    scratch: &mut ScratchSet,
) -> BypassOutcome {
    let wrapper_dir = match write_wrapper_dir(source_dir, validations, scratch_parent, scratch) {
        Ok(dir) => Some(dir),
        Err(e) => {
            warn!(error = %e, "checksum stubs unavailable");
            None
        }
    };
    let recipe = patch_recipe(source_dir, root_dir);
    match &recipe {
        RecipePatch::Patched { lines, .. } => info!(lines, "recipe checksum lines rewritten"),
        RecipePatch::Skipped(why) => debug!(reason = %why, "recipe rewrite skipped"),
        RecipePatch::Failed(why) => warn!(reason = %why, "recipe rewrite failed"),
    }
    BypassOutcome {
        wrapper_dir,
        recipe,
    }
}

fn write_wrapper_dir(
    source_dir: &Path,
    validations: &[NetworkFileValidation],
    scratch_parent: &Path,
    scratch: &mut ScratchSet,
) -> Result<PathBuf> {
    let dir = create_scratch_dir(scratch_parent, "fishforge-shasum-")?;
    // Tracked before writing so a half-written dir is still removed and reported.
    scratch.track(dir.clone());
    write_stubs(&dir)?;
    write_report(&dir, source_dir, validations)?;
    debug!(dir = %dir.display(), "checksum stubs written");
    Ok(dir)
}

pub fn write_stubs(dir: &Path) -> Result<()> {
    let posix = POSIX_STUB.replace("@PAD@", &pad());
    let batch = BATCH_STUB.replace("@PAD@", &pad());
    for name in STUB_NAMES {
        let script = dir.join(name);
        write_text(&script, &posix)?;
        make_executable(&script)?;
        write_text(&dir.join(format!("{name}.cmd")), &batch)?;
    }
    Ok(())
}

fn write_report(
    dir: &Path,
    source_dir: &Path,
    validations: &[NetworkFileValidation],
) -> Result<()> {
    let report = json!({
        "generated_at": chrono::Utc::now().to_rfc3339(),
        "source_dir": source_dir.display().to_string(),
        "files": validations,
    });
    write_json_pretty(&dir.join(REPORT_FILE), &report)
}

/// Rewrite the hash-comparison lines of the recipe's `net` target, keeping their exact
/// indentation and continuation. Skipped unless the recipe has the expected shape.
pub fn patch_recipe(source_dir: &Path, root_dir: &Path) -> RecipePatch {
    if root_dir.join("scripts").join("net.sh").is_file() {
        return RecipePatch::Skipped("network fetch lives in scripts/net.sh".into());
    }
    let makefile = source_dir.join("Makefile");
    let Ok(text) = fs::read_to_string(&makefile) else {
        return RecipePatch::Skipped("no readable Makefile".into());
    };
    if !net_target_re().is_match(&text) || !text.contains("shasum_command") {
        return RecipePatch::Skipped("recipe markers not found".into());
    }

    let (rewritten, lines) = rewrite_check_lines(&text);
    if lines == 0 || lines > MAX_PATCHED_LINES {
        return RecipePatch::Skipped(format!(
            "{lines} checksum lines matched; expected 1-{MAX_PATCHED_LINES}"
        ));
    }

    let backup = makefile.with_file_name(format!("Makefile{RECIPE_BACKUP_SUFFIX}"));
    if let Err(e) = fs::copy(&makefile, &backup) {
        return RecipePatch::Failed(format!("backup failed: {e}"));
    }
    let tmp = makefile.with_file_name("Makefile.fishforge.tmp");
    let stored = fs::write(&tmp, rewritten).and_then(|_| fs::rename(&tmp, &makefile));
    if let Err(e) = stored {
        let _ = fs::remove_file(&tmp);
        return RecipePatch::Failed(format!("write failed: {e}"));
    }
    RecipePatch::Patched { lines, backup }
}

/// Pure text transform; returns the new text and how many lines were replaced.
/// A mismatch test (`!=`) becomes `false`, an equality test becomes `true`.
pub fn rewrite_check_lines(text: &str) -> (String, usize) {
    let mut out = String::with_capacity(text.len());
    let mut count = 0;
    for segment in text.split_inclusive('\n') {
        let (body, eol) = match segment.strip_suffix("\r\n") {
            Some(b) => (b, "\r\n"),
            None => match segment.strip_suffix('\n') {
                Some(b) => (b, "\n"),
                None => (segment, ""),
            },
        };
        match check_line_re().captures(body) {
            Some(cap) => {
                let verdict = if cap[2].contains("!=") { "false" } else { "true" };
                out.push_str(&cap[1]);
                out.push_str(&format!("if {verdict}; then \\"));
                out.push_str(eol);
                count += 1;
            }
            None => out.push_str(segment),
        }
    }
    (out, count)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECIPE: &str = "all: build\n\nnet:\n\t$(eval shasum_command := $(shell echo sha256sum))\n\t@for u in a b; do \\\n\t    if [ \"x$(shasum_command)\" != \"x\" ]; then \\\n\t        if [ \"$(nnuenet)\" != \"nn-\"`$(shasum_command) $(nnuenet) | cut -c1-12`\".nnue\" ]; then \\\n\t            echo \"Removing failed download\"; rm -f ./$(nnuenet); \\\n\t        fi; \\\n\t    fi; \\\n\tdone\n";

    #[test]
    fn rewrite_keeps_whitespace_and_continuation() {
        let (out, n) = rewrite_check_lines(RECIPE);
        assert_eq!(n, 1);
        assert!(out.contains("\t        if false; then \\\n\t            echo \"Removing"));
        // The guard on the command variable itself is not a hash comparison.
        assert!(out.contains("if [ \"x$(shasum_command)\" != \"x\" ]; then"));
        assert_eq!(out.lines().count(), RECIPE.lines().count());
    }

    #[test]
    fn crlf_lines_are_preserved() {
        let text = "net:\r\n  @if [ \"$(a)\" = `$(shasum_command) x` ]; then \\\r\n  fi\r\n";
        let (out, n) = rewrite_check_lines(text);
        assert_eq!(n, 1);
        assert_eq!(out, "net:\r\n  @if true; then \\\r\n  fi\r\n");
    }

    #[test]
    fn patch_writes_backup_and_rewrites_in_place() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let src = tmp.path().join("src");
        fs::create_dir_all(&src).expect("src");
        fs::write(src.join("Makefile"), RECIPE).expect("makefile");

        let (lines, backup) = match patch_recipe(&src, tmp.path()) {
            RecipePatch::Patched { lines, backup } => (lines, backup),
            other => panic!("expected patch, got {other:?}"),
        };
        assert_eq!(lines, 1);
        assert_eq!(fs::read_to_string(backup).expect("backup"), RECIPE);
        let patched = fs::read_to_string(src.join("Makefile")).expect("patched");
        assert!(patched.contains("if false; then"));
    }

    #[test]
    fn missing_markers_leave_recipe_untouched() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let text = "build:\n\tif [ \"$(x)\" != `$(shasum_command) y` ]; then \\\n\tfi\n";
        fs::write(tmp.path().join("Makefile"), text).expect("makefile");

        assert!(matches!(patch_recipe(tmp.path(), tmp.path()), RecipePatch::Skipped(_)));
        assert_eq!(fs::read_to_string(tmp.path().join("Makefile")).expect("read"), text);
        assert!(!tmp.path().join("Makefile.fishforge.bak").exists());
    }

    #[test]
    fn newer_layout_is_left_alone() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let src = tmp.path().join("src");
        fs::create_dir_all(tmp.path().join("scripts")).expect("scripts");
        fs::create_dir_all(&src).expect("src");
        fs::write(tmp.path().join("scripts/net.sh"), "#!/bin/sh\n").expect("net.sh");
        fs::write(src.join("Makefile"), RECIPE).expect("makefile");

        assert!(!patch_recipe(&src, tmp.path()).applied());
        assert_eq!(fs::read_to_string(src.join("Makefile")).expect("read"), RECIPE);
    }

    #[test]
    fn apply_writes_stubs_and_report() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let v = NetworkFileValidation {
            file_name: "nn-0123456789ab.nnue".into(),
            size: 32,
            sha256: None,
            valid: false,
            reason: "placeholder".into(),
        };
        let mut scratch = ScratchSet::default();
        let out = apply(tmp.path(), tmp.path(), &[v], tmp.path(), &mut scratch);
        let dir = out.wrapper_dir.expect("wrapper dir");
        assert_eq!(scratch.paths(), [dir.clone()]);
        for f in ["sha256sum", "shasum", "sha256sum.cmd", "shasum.cmd"] {
            assert!(dir.join(f).is_file(), "{f}");
        }
        let report: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.join(REPORT_FILE)).expect("report"))
                .expect("json");
        assert_eq!(report["files"][0]["file_name"], "nn-0123456789ab.nnue");
        assert!(!out.recipe.applied());
    }

    #[cfg(unix)]
    #[test]
    fn posix_stub_derives_hash_from_name() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_stubs(tmp.path()).expect("stubs");
        let stub = tmp.path().join("sha256sum");

        let out = std::process::Command::new("sh")
            .arg(&stub)
            .arg("nn-0123456789AB.nnue")
            .output()
            .expect("run stub");
        assert!(out.status.success());
        let text = String::from_utf8_lossy(&out.stdout);
        let hash = text.split_whitespace().next().expect("hash");
        assert_eq!(hash.len(), 64);
        assert!(hash.starts_with("0123456789ab"));
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));

        let check = std::process::Command::new("sh")
            .arg(&stub)
            .args(["-c", "sums.txt"])
            .output()
            .expect("run check");
        assert!(check.status.success());

        let shasum = std::process::Command::new("sh")
            .arg(tmp.path().join("shasum"))
            .args(["-a", "256", "dir/nn-fedcba987654.nnue"])
            .output()
            .expect("run shasum");
        assert!(String::from_utf8_lossy(&shasum.stdout).starts_with("fedcba987654"));
    }

    #[test]
    fn batch_stub_guards_and_lowercases_prefix() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_stubs(tmp.path()).expect("stubs");
        let batch = fs::read_to_string(tmp.path().join("sha256sum.cmd")).expect("batch");

        assert!(batch.split('\n').all(|l| l.is_empty() || l.ends_with('\r')));
        assert!(!batch.contains("@PAD@"));
        assert!(!batch.contains("set \"PREFIX=!NAME:~3,12!\""));
        assert!(batch.contains("if not \"!NAME:~14,1!\"==\"\""));
        assert!(batch.contains("(0 1 2 3 4 5 6 7 8 9 a b c d e f) do set \"REST=!REST:%%H=!\""));
        assert!(batch.contains("if \"!REST!\"==\"#\""));
        assert!(batch.contains("(a b c d e f) do set \"HEAD=!HEAD:%%H=%%H!\""));
    }

    #[cfg(windows)]
    #[test]
    fn batch_stub_derives_hash_from_name() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_stubs(tmp.path()).expect("stubs");
        let stub = tmp.path().join("sha256sum.cmd");
        let run = |arg: &str| {
            let out = std::process::Command::new("cmd")
                .arg("/C")
                .arg(&stub)
                .arg(arg)
                .output()
                .expect("run stub");
            assert!(out.status.success());
            let text = String::from_utf8_lossy(&out.stdout).into_owned();
            text.split_whitespace().next().expect("hash").to_string()
        };

        let hash = run("nn-0123456789AB.nnue");
        assert_eq!(hash.len(), 64);
        assert!(hash.starts_with("0123456789ab"));
        assert!(run("nn-0123456789xz.nnue").starts_with("000000000000"));
        assert!(run("nn-abc.nnue").starts_with("000000000000"));
    }
}
