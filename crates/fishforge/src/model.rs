use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Upper bound on make parallelism regardless of core count.
pub const MAX_PARALLEL_JOBS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompilerKind {
    Gcc,
    Clang,
    Msvc,
}

impl CompilerKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "gcc" | "g++" | "mingw" | "gnu" => Some(CompilerKind::Gcc),
            "clang" | "clang++" | "llvm" => Some(CompilerKind::Clang),
            "msvc" | "cl" => Some(CompilerKind::Msvc),
            _ => None,
        }
    }

    /// Value for the recipe's `COMP=` variable; msvc cannot drive the Makefile.
    pub fn comp_variable(self, windows: bool) -> Option<&'static str> {
        match self {
            CompilerKind::Gcc if windows => Some("mingw"),
            CompilerKind::Gcc => Some("gcc"),
            CompilerKind::Clang => Some("clang"),
            CompilerKind::Msvc => None,
        }
    }
}

impl fmt::Display for CompilerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompilerKind::Gcc => "gcc",
            CompilerKind::Clang => "clang",
            CompilerKind::Msvc => "msvc",
        })
    }
}

/// Selected compiler, as handed over by the discovery layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilerDescriptor {
    pub executable_name: String,
    pub directory: PathBuf,
    pub kind: CompilerKind,
}

impl CompilerDescriptor {
    pub fn from_path(path: &Path, kind: CompilerKind) -> Self {
        let executable_name = path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let directory = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            executable_name,
            directory,
            kind,
        }
    }

    pub fn path(&self) -> PathBuf {
        self.directory.join(&self.executable_name)
    }
}

/// Target architectures understood by the recipe's `ARCH=` variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    X86_64,
    X86_64Sse41Popcnt,
    X86_64Avx2,
    X86_64Bmi2,
    X86_64Avx512,
    X86_64Vnni256,
    X86_64Vnni512,
    X86_32,
    Armv7,
    Armv8,
    AppleSilicon,
}

impl Architecture {
    pub const ALL: [Architecture; 11] = [
        Architecture::X86_64,
        Architecture::X86_64Sse41Popcnt,
        Architecture::X86_64Avx2,
        Architecture::X86_64Bmi2,
        Architecture::X86_64Avx512,
        Architecture::X86_64Vnni256,
        Architecture::X86_64Vnni512,
        Architecture::X86_32,
        Architecture::Armv7,
        Architecture::Armv8,
        Architecture::AppleSilicon,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Architecture::X86_64 => "x86-64",
            Architecture::X86_64Sse41Popcnt => "x86-64-sse41-popcnt",
            Architecture::X86_64Avx2 => "x86-64-avx2",
            Architecture::X86_64Bmi2 => "x86-64-bmi2",
            Architecture::X86_64Avx512 => "x86-64-avx512",
            Architecture::X86_64Vnni256 => "x86-64-vnni256",
            Architecture::X86_64Vnni512 => "x86-64-vnni512",
            Architecture::X86_32 => "x86-32",
            Architecture::Armv7 => "armv7",
            Architecture::Armv8 => "armv8",
            Architecture::AppleSilicon => "apple-silicon",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Map any identifier onto the known set; unknown ids become the generic baseline.
pub fn sanitize_architecture(raw: &str) -> Architecture {
    let wanted = raw.trim().to_ascii_lowercase().replace('_', "-");
    Architecture::ALL
        .into_iter()
        .find(|a| a.id() == wanted)
        .unwrap_or(Architecture::X86_64)
}

/// Clamp a requested job count to `1..=min(2 * cpus, 32)`. Zero or negative means "one".
pub fn sanitize_parallel_jobs_for(requested: i64, cpus: usize) -> usize {
    let ceiling = cpus.max(1).saturating_mul(2).min(MAX_PARALLEL_JOBS);
    if requested < 1 {
        return 1;
    }
    usize::try_from(requested).unwrap_or(usize::MAX).min(ceiling)
}

pub fn sanitize_parallel_jobs(requested: i64) -> usize {
    sanitize_parallel_jobs_for(requested, num_cpus::get())
}

/// Everything one build run needs; never mutated once the run starts.
#[derive(Debug, Clone)]
pub struct BuildConfiguration {
    pub compiler: CompilerDescriptor,
    pub architecture: Architecture,
    pub version_tag: String,
    pub fetch_asset: bool,
    pub strip_binary: bool,
    pub enable_pgo: bool,
    pub parallel_jobs: usize,
    pub output_dir: PathBuf,
}

/// Where acquisition left the sources. `scratch_root` is already tracked by the caller's `ScratchSet`.
#[derive(Debug, Clone)]
pub struct SourceDownloadResult {
    pub source_dir: PathBuf,
    pub project_root: PathBuf,
    pub scratch_root: PathBuf,
    pub resolved_version: String,
}

/// Validation verdict for one asset file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkFileValidation {
    pub file_name: String,
    pub size: u64,
    pub sha256: Option<String>,
    pub valid: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildState {
    Idle,
    SourceAcquired,
    AssetsProvisioned,
    Compiling,
    Stripping,
    ArtifactCopied,
    Completed,
    Cancelled,
    Failed,
}

impl BuildState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BuildState::Completed | BuildState::Cancelled | BuildState::Failed
        )
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildState::Idle => "idle",
            BuildState::SourceAcquired => "source-acquired",
            BuildState::AssetsProvisioned => "assets-provisioned",
            BuildState::Compiling => "compiling",
            BuildState::Stripping => "stripping",
            BuildState::ArtifactCopied => "artifact-copied",
            BuildState::Completed => "completed",
            BuildState::Cancelled => "cancelled",
            BuildState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Final outcome handed back to callers.
#[derive(Debug, Clone)]
pub struct CompilationResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub combined_output: String,
    pub final_state: BuildState,
    pub artifact: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn architecture_sanitizing_is_idempotent() {
        for raw in ["x86-64-avx2", " X86_64_BMI2 ", "armv8", "pentium-mmx", "", "apple-silicon"] {
            let once = sanitize_architecture(raw);
            let twice = sanitize_architecture(once.id());
            assert_eq!(once, twice, "raw={raw:?}");
        }
        assert_eq!(sanitize_architecture("pentium-mmx"), Architecture::X86_64);
        assert_eq!(sanitize_architecture(" X86_64_BMI2 "), Architecture::X86_64Bmi2);
    }

    #[test]
    fn parallel_jobs_are_clamped_and_idempotent() {
        assert_eq!(sanitize_parallel_jobs_for(0, 8), 1);
        assert_eq!(sanitize_parallel_jobs_for(-4, 8), 1);
        assert_eq!(sanitize_parallel_jobs_for(12, 8), 12);
        assert_eq!(sanitize_parallel_jobs_for(100, 8), 16);
        assert_eq!(sanitize_parallel_jobs_for(100, 64), MAX_PARALLEL_JOBS);
        assert_eq!(sanitize_parallel_jobs_for(3, 0), 2);
        for req in [-1, 0, 1, 7, 16, 17, 1000] {
            let once = sanitize_parallel_jobs_for(req, 8);
            assert_eq!(sanitize_parallel_jobs_for(once as i64, 8), once);
        }
    }

    #[test]
    fn comp_variable_follows_platform() {
        assert_eq!(CompilerKind::Gcc.comp_variable(true), Some("mingw"));
        assert_eq!(CompilerKind::Gcc.comp_variable(false), Some("gcc"));
        assert_eq!(CompilerKind::Clang.comp_variable(true), Some("clang"));
        assert_eq!(CompilerKind::Msvc.comp_variable(false), None);
    }

    #[test]
    fn descriptor_splits_path() {
        let d = CompilerDescriptor::from_path(Path::new("/opt/gcc/bin/g++"), CompilerKind::Gcc);
        assert_eq!(d.executable_name, "g++");
        assert_eq!(d.directory, PathBuf::from("/opt/gcc/bin"));
        assert_eq!(d.path(), PathBuf::from("/opt/gcc/bin/g++"));
        let bare = CompilerDescriptor::from_path(Path::new("clang++"), CompilerKind::Clang);
        assert_eq!(bare.directory, PathBuf::from("."));
    }
}
