use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::ToolchainSettings;
use crate::model::CompilerDescriptor;

/// Resolved toolchain context for one compiler.
///
/// `overlay` is applied on top of the host environment for every spawned tool; it is
/// empty when no toolchain root was found, which callers treat as "use the host as-is".
#[derive(Debug, Clone, Default)]
pub struct ToolchainEnv {
    pub root: Option<PathBuf>,
    pub overlay: BTreeMap<String, String>,
}

impl ToolchainEnv {
    pub fn root_found(&self) -> bool {
        self.root.is_some()
    }

    /// Effective search path for children: overlay PATH if set, otherwise the host's.
    pub fn search_path(&self) -> Option<OsString> {
        match self.overlay.get("PATH") {
            Some(p) => Some(OsString::from(p)),
            None => env::var_os("PATH"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnvironmentResolver {
    settings: ToolchainSettings,
}

impl EnvironmentResolver {
    pub fn new(settings: ToolchainSettings) -> Self {
        Self { settings }
    }

    pub fn resolve(&self, compiler: &CompilerDescriptor) -> ToolchainEnv {
        self.resolve_with_host_path(compiler, env::var_os("PATH"))
    }

    pub fn resolve_with_host_path(
        &self,
        compiler: &CompilerDescriptor,
        host_path: Option<OsString>,
    ) -> ToolchainEnv {
        let Some(root) = self.find_root(&compiler.directory) else {
            info!(compiler = %compiler.path().display(), "no toolchain root found; using host environment");
            return ToolchainEnv::default();
        };

        // Compiler runtime dir first so its DLLs and tools shadow anything in usr/bin.
        let mut entries = vec![compiler.directory.clone(), root.join("usr").join("bin")];
        if let Some(host) = host_path.as_ref() {
            entries.extend(env::split_paths(host));
        }
        let mut overlay = BTreeMap::new();
        if let Ok(joined) = env::join_paths(entries) {
            overlay.insert("PATH".to_string(), joined.to_string_lossy().into_owned());
        }
        overlay.insert("LC_ALL".to_string(), "C".to_string());
        overlay.insert("LANG".to_string(), "C".to_string());
        if let Some(msystem) = msystem_for(&compiler.directory) {
            overlay.insert("MSYSTEM".to_string(), msystem);
        }

        info!(root = %root.display(), "toolchain root resolved");
        ToolchainEnv {
            root: Some(root),
            overlay,
        }
    }

    /// Walk up from the compiler directory, then try the configured well-known roots.
    pub fn find_root(&self, compiler_dir: &Path) -> Option<PathBuf> {
        let walked = compiler_dir
            .ancestors()
            .skip(1)
            .take(self.settings.root_search_levels)
            .find(|dir| is_toolchain_root(dir))
            .map(Path::to_path_buf);
        if walked.is_some() {
            return walked;
        }
        self.settings
            .fallback_roots
            .iter()
            .find(|dir| is_toolchain_root(dir))
            .cloned()
    }

    /// Locate the build tool: next to the compiler, then under the root, else rely on PATH.
    pub fn find_make(&self, compiler: &CompilerDescriptor, root: Option<&Path>) -> PathBuf {
        let suffix = env::consts::EXE_SUFFIX;
        for name in ["make", "mingw32-make"] {
            let candidate = compiler.directory.join(format!("{name}{suffix}"));
            if candidate.is_file() {
                debug!(make = %candidate.display(), "using build tool next to compiler");
                return candidate;
            }
        }
        if let Some(root) = root {
            let candidate = root.join("usr").join("bin").join(format!("make{suffix}"));
            if candidate.is_file() {
                debug!(make = %candidate.display(), "using toolchain build tool");
                return candidate;
            }
        }
        PathBuf::from("make")
    }
}

/// A root needs `usr/bin`, `usr/lib`, and a shell or launcher marker.
pub fn is_toolchain_root(dir: &Path) -> bool {
    let usr = dir.join("usr");
    if !usr.join("bin").is_dir() || !usr.join("lib").is_dir() {
        return false;
    }
    ["msys2_shell.cmd", "msys2.exe", "usr/bin/bash", "usr/bin/bash.exe"]
        .iter()
        .any(|m| dir.join(m).exists())
}

fn msystem_for(compiler_dir: &Path) -> Option<String> {
    let flavor = compiler_dir.parent()?.file_name()?.to_str()?.to_ascii_lowercase();
    match flavor.as_str() {
        "mingw64" | "mingw32" | "ucrt64" | "clang64" | "clang32" | "clangarm64" => {
            Some(flavor.to_ascii_uppercase())
        }
        _ => None,
    }
}
