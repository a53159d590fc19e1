use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::RecipeSettings;
use crate::model::{Architecture, CompilerDescriptor, CompilerKind};
use crate::toolchain::ToolchainEnv;

/// Older recipes hard-code the profile directory relative to the working dir.
const FIXED_PROFDIR_MARKER: &str = "$(PWD)/profdir";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileDir {
    /// `<src>/profdir`, chosen by the recipe itself.
    InTree(PathBuf),
    /// A fresh scratch dir handed to the recipe through the environment.
    Scratch(PathBuf),
}

impl ProfileDir {
    pub fn path(&self) -> &Path {
        match self {
            ProfileDir::InTree(p) | ProfileDir::Scratch(p) => p,
        }
    }
}

pub fn uses_fixed_profdir(source_dir: &Path) -> bool {
    fs::read_to_string(source_dir.join("Makefile"))
        .map(|t| t.contains(FIXED_PROFDIR_MARKER))
        .unwrap_or(false)
}

pub fn compile_args(
    recipe: &RecipeSettings,
    jobs: usize,
    target: &str,
    arch: Architecture,
    comp: &str,
    compiler: &CompilerDescriptor,
) -> Vec<String> {
    let mut args = vec![
        format!("-j{jobs}"),
        target.to_string(),
        format!("ARCH={}", arch.id()),
        format!("COMP={comp}"),
    ];
    // A bare executable name means "whatever the recipe picks for COMP".
    if compiler.directory != Path::new(".") {
        args.push(format!("COMPCXX={}", compiler.path().display()));
    }
    args.push(format!("{}=", recipe.checksum_var));
    args
}

pub fn strip_args(recipe: &RecipeSettings, arch: Architecture, comp: &str) -> Vec<String> {
    vec![
        recipe.strip_target.clone(),
        format!("ARCH={}", arch.id()),
        format!("COMP={comp}"),
    ]
}

/// Variables that point the instrumented build at `dir`.
pub fn profile_env(kind: CompilerKind, dir: &ProfileDir) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let ProfileDir::Scratch(p) = dir {
        out.insert("PROFDIR".to_string(), p.display().to_string());
        if kind == CompilerKind::Clang {
            out.insert(
                "LLVM_PROFILE_FILE".to_string(),
                p.join("fishforge-%p.profraw").display().to_string(),
            );
        }
    }
    out
}

/// Toolchain overlay plus the stub directory in front of the search path.
pub fn child_env(toolchain: &ToolchainEnv, wrapper_dir: Option<&Path>) -> BTreeMap<String, String> {
    let mut out = toolchain.overlay.clone();
    if let Some(wrapper) = wrapper_dir {
        let mut entries = vec![wrapper.to_path_buf()];
        if let Some(path) = toolchain.search_path() {
            entries.extend(env::split_paths(&path));
        }
        if let Ok(joined) = env::join_paths(entries) {
            out.insert("PATH".to_string(), joined.to_string_lossy().into_owned());
        }
    }
    out
}
