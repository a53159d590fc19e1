//! The build pipeline: sources, network files, checksum bypass, compile, strip, copy,
//! and an unconditional cleanup phase.

pub mod recipe;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::assets::{AssetProvisioner, find_valid_asset};
use crate::bypass::{self, RecipePatch};
use crate::cancel::CancelToken;
use crate::config::ForgeSettings;
use crate::error::{Error, ErrorKind, Result};
use crate::events::{BuildEvent, BuildSink};
use crate::fsutil::{ensure_dir, make_executable};
use crate::model::{BuildConfiguration, BuildState, CompilationResult, sanitize_parallel_jobs};
use crate::net::HttpFetch;
use crate::process::{BoundedOutput, ProcessOutcome, ProcessRunner, ProcessSpec};
use crate::source::SourceProvider;
use crate::toolchain::EnvironmentResolver;
use crate::workspace::{OutputPolicy, ScratchSet, artifact_file_name, create_scratch_dir};

use recipe::ProfileDir;

pub const PROGRESS_SOURCE_READY: u8 = 20;
pub const PROGRESS_ASSETS_READY: u8 = 35;
pub const PROGRESS_COMPILE_STARTED: u8 = 40;
pub const PROGRESS_COMPILE_DONE: u8 = 85;
pub const PROGRESS_ARTIFACT_COPIED: u8 = 100;

/// Runs one build at a time; a second concurrent request is rejected with `Busy`.
pub struct BuildOrchestrator {
    settings: ForgeSettings,
    http: Arc<dyn HttpFetch>,
    sink: Arc<dyn BuildSink>,
    active: Mutex<Option<CancelToken>>,
}

impl BuildOrchestrator {
    pub fn new(settings: ForgeSettings, http: Arc<dyn HttpFetch>, sink: Arc<dyn BuildSink>) -> Self {
        Self {
            settings,
            http,
            sink,
            active: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &ForgeSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.active.lock().map(|a| a.is_some()).unwrap_or(false)
    }

    /// Cancel the in-flight build, if any. Returns whether there was one.
    pub fn cancel(&self) -> bool {
        match self.active.lock() {
            Ok(a) => match a.as_ref() {
                Some(token) => {
                    token.cancel();
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    pub fn build(&self, config: &BuildConfiguration) -> Result<CompilationResult> {
        self.build_with_token(config, CancelToken::new())
    }

    /// Run the pipeline under a caller-provided token.
    ///
    /// Degraded and failed builds come back as `Ok` with `success == false`; only a busy
    /// orchestrator and security violations (path traversal, disallowed output
    /// directory) are returned as errors, after cleanup has run.
    pub fn build_with_token(
        &self,
        config: &BuildConfiguration,
        cancel: CancelToken,
    ) -> Result<CompilationResult> {
        let _guard = self.claim(&cancel)?;
        self.sink.emit(BuildEvent::InProgress(true));

        let mut run = Run::new(self, config, cancel);
        let outcome = run.execute();
        let hard = match outcome {
            Ok(()) => {
                run.transition(BuildState::Completed);
                run.line("Build completed successfully.".to_string());
                None
            }
            Err(e) if e.kind() == ErrorKind::Cancelled => {
                run.transition(BuildState::Cancelled);
                run.line("Build cancelled.".to_string());
                None
            }
            Err(e) => {
                run.transition(BuildState::Failed);
                run.line(format!("Build failed: {e}"));
                e.kind().is_hard_failure().then_some(e)
            }
        };
        run.cleanup();
        self.sink.emit(BuildEvent::InProgress(false));

        if let Some(e) = hard {
            return Err(e);
        }
        Ok(run.finish())
    }

    fn claim(&self, cancel: &CancelToken) -> Result<ActiveGuard<'_>> {
        let mut slot = self
            .active
            .lock()
            .map_err(|_| Error::msg("build state lock poisoned"))?;
        if slot.is_some() {
            return Err(Error::new(ErrorKind::Busy, "a build is already in progress"));
        }
        *slot = Some(cancel.clone());
        Ok(ActiveGuard { slot: &self.active })
    }
}

struct ActiveGuard<'a> {
    slot: &'a Mutex<Option<CancelToken>>,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut s) = self.slot.lock() {
            *s = None;
        }
    }
}

/// Bookkeeping for one pipeline run.
struct Run<'a> {
    orch: &'a BuildOrchestrator,
    config: &'a BuildConfiguration,
    cancel: CancelToken,
    state: BuildState,
    progress: u8,
    output: BoundedOutput,
    scratch: ScratchSet,
    exit_code: Option<i32>,
    artifact: Option<PathBuf>,
}

impl<'a> Run<'a> {
    fn new(orch: &'a BuildOrchestrator, config: &'a BuildConfiguration, cancel: CancelToken) -> Self {
        Self {
            orch,
            config,
            cancel,
            state: BuildState::Idle,
            progress: 0,
            output: BoundedOutput::new(orch.settings.process.max_output_chars),
            scratch: ScratchSet::default(),
            exit_code: None,
            artifact: None,
        }
    }

    fn line(&mut self, text: String) {
        self.output.push(&text);
        self.orch.sink.output(text);
    }

    fn progress(&mut self, pct: u8) {
        if pct > self.progress {
            self.progress = pct;
            self.orch.sink.emit(BuildEvent::Progress(pct));
        }
    }

    fn transition(&mut self, next: BuildState) {
        if self.state.is_terminal() {
            return;
        }
        info!(from = %self.state, to = %next, "build state");
        self.state = next;
    }

    fn execute(&mut self) -> Result<()> {
        let orch = self.orch;
        let s = &orch.settings;
        let cfg = self.config;
        self.cancel.check()?;

        let policy = OutputPolicy::new(&s.output);
        policy.validate(&cfg.output_dir)?;
        let Some(comp) = cfg.compiler.kind.comp_variable(cfg!(windows)) else {
            return Err(Error::msg(format!(
                "{} compilers cannot drive the make-based build; choose gcc or clang",
                cfg.compiler.kind
            )));
        };
        // Library callers may hand over any count; `-j0` is rejected by make.
        let jobs = sanitize_parallel_jobs(i64::try_from(cfg.parallel_jobs).unwrap_or(i64::MAX));
        self.line(format!(
            "Building {} {} for {} with {} ({jobs} jobs)",
            s.source.project,
            cfg.version_tag,
            cfg.architecture,
            cfg.compiler.path().display(),
        ));

        let resolver = EnvironmentResolver::new(s.toolchain.clone());
        let toolchain = resolver.resolve(&cfg.compiler);
        match toolchain.root.as_ref() {
            Some(root) => self.line(format!("Toolchain root: {}", root.display())),
            None => self.line("No toolchain root found; using the host environment.".to_string()),
        }

        // Sources.
        let provider = SourceProvider::new(
            s.source.clone(),
            s.output.scratch_parent(),
            orch.http.clone(),
        );
        let sources = provider.acquire(
            &cfg.version_tag,
            &mut self.scratch,
            orch.sink.as_ref(),
            &self.cancel,
        )?;
        self.transition(BuildState::SourceAcquired);
        self.line(format!("Source ready: {}", sources.source_dir.display()));
        self.progress(PROGRESS_SOURCE_READY);

        // Network files.
        let provisioner = AssetProvisioner::new(s.assets.clone(), orch.http.clone());
        let mut assets = provisioner.provision(
            &sources.source_dir,
            cfg.fetch_asset,
            cfg.enable_pgo,
            orch.sink.as_ref(),
            &self.cancel,
        )?;
        let valid_asset =
            find_valid_asset(&sources.source_dir, &assets.names, s.assets.min_size_bytes);
        let use_pgo = cfg.enable_pgo && valid_asset.is_some();
        if cfg.enable_pgo && !use_pgo {
            self.line(
                "No valid network file available; PGO needs one for the profiling run, \
                 so the plain build target is used instead."
                    .to_string(),
            );
            provisioner.ensure_placeholders(&sources.source_dir, &mut assets, orch.sink.as_ref());
        }
        self.transition(BuildState::AssetsProvisioned);
        self.progress(PROGRESS_ASSETS_READY);

        // Checksum bypass.
        let bypass = bypass::apply(
            &sources.source_dir,
            &sources.project_root,
            &assets.validations,
            &s.output.scratch_parent(),
            &mut self.scratch,
        );
        if bypass.wrapper_dir.is_none() {
            self.line("Warning: checksum stubs could not be written.".to_string());
        }
        match &bypass.recipe {
            RecipePatch::Patched { lines, .. } => {
                self.line(format!("Patched {lines} checksum line(s) in the Makefile."))
            }
            RecipePatch::Skipped(why) => self.line(format!("Makefile left unchanged ({why}).")),
            RecipePatch::Failed(why) => {
                self.line(format!("Warning: Makefile checksum patch failed ({why})."))
            }
        }

        // Compile.
        self.cancel.check()?;
        let make = resolver.find_make(&cfg.compiler, toolchain.root.as_deref());
        let mut env = recipe::child_env(&toolchain, bypass.wrapper_dir.as_deref());
        let target = if use_pgo {
            let profile = self.profile_dir(&sources.source_dir)?;
            self.line(format!("Profile data directory: {}", profile.path().display()));
            env.extend(recipe::profile_env(cfg.compiler.kind, &profile));
            s.recipe.pgo_target.clone()
        } else {
            s.recipe.plain_target.clone()
        };
        let args = recipe::compile_args(
            &s.recipe,
            jobs,
            &target,
            cfg.architecture,
            comp,
            &cfg.compiler,
        );
        let spec = ProcessSpec::new(&make)
            .args(args)
            .cwd(&sources.source_dir)
            .envs(&env)
            .timeout(Some(Duration::from_secs(s.process.compile_timeout_secs)));

        self.transition(BuildState::Compiling);
        self.progress(PROGRESS_COMPILE_STARTED);
        self.line(format!("Running: {}", spec.display()));
        let res = self.run_tool(&spec);
        self.exit_code = res.exit_code;
        match res.outcome {
            ProcessOutcome::Exited if res.success => {}
            ProcessOutcome::Cancelled => return Err(Error::cancelled()),
            _ => {
                return Err(Error::msg(format!("compilation {}", res.describe())));
            }
        }
        self.line("Compilation finished.".to_string());
        self.progress(PROGRESS_COMPILE_DONE);

        // Strip (never fatal).
        if cfg.strip_binary {
            self.transition(BuildState::Stripping);
            let spec = ProcessSpec::new(&make)
                .args(recipe::strip_args(&s.recipe, cfg.architecture, comp))
                .cwd(&sources.source_dir)
                .envs(&env)
                .timeout(Some(Duration::from_secs(s.process.strip_timeout_secs)));
            let res = self.run_tool(&spec);
            match res.outcome {
                ProcessOutcome::Cancelled => return Err(Error::cancelled()),
                _ if res.success => self.line("Debug symbols stripped.".to_string()),
                _ => self.line(format!("Note: strip step {} (not critical).", res.describe())),
            }
        }

        // Artifact.
        self.cancel.check()?;
        let built = sources
            .source_dir
            .join(format!("{}{}", s.recipe.executable, std::env::consts::EXE_SUFFIX));
        if !built.is_file() {
            return Err(Error::new(
                ErrorKind::MissingLayout,
                format!("compiled binary not found at {}", built.display()),
            ));
        }
        // Checked again; the tree may have changed while compiling.
        let out_dir = policy.validate(&cfg.output_dir)?;
        ensure_dir(&out_dir)?;
        let dest = out_dir.join(artifact_file_name(
            &s.source.project,
            cfg.architecture,
            &sources.resolved_version,
        ));
        fs::copy(&built, &dest).map_err(|e| {
            Error::msg(format!(
                "failed to copy {} to {}: {e}",
                built.display(),
                dest.display()
            ))
        })?;
        make_executable(&dest)?;
        let size = fs::metadata(&dest).map(|m| m.len()).unwrap_or(0);
        self.line(format!(
            "Executable saved to {} ({:.1} MB)",
            dest.display(),
            size as f64 / (1024.0 * 1024.0)
        ));
        self.artifact = Some(dest);
        self.transition(BuildState::ArtifactCopied);
        self.progress(PROGRESS_ARTIFACT_COPIED);
        Ok(())
    }

    fn run_tool(&mut self, spec: &ProcessSpec) -> crate::process::ProcessResult {
        let runner = ProcessRunner::new(&self.orch.settings.process);
        let cancel = self.cancel.clone();
        runner.run(spec, &cancel, &mut |l| self.line(l.text.clone()))
    }

    fn profile_dir(&mut self, source_dir: &Path) -> Result<ProfileDir> {
        if recipe::uses_fixed_profdir(source_dir) {
            return Ok(ProfileDir::InTree(source_dir.join("profdir")));
        }
        let dir = create_scratch_dir(&self.orch.settings.output.scratch_parent(), "fishforge-prof-")?;
        self.scratch.track(dir.clone());
        Ok(ProfileDir::Scratch(dir))
    }

    fn cleanup(&mut self) {
        let c = &self.orch.settings.cleanup;
        let failed = self
            .scratch
            .cleanup(c.attempts, Duration::from_millis(c.backoff_ms));
        for (path, error) in failed {
            warn!(path = %path.display(), %error, "cleanup incomplete");
            self.line(format!(
                "Warning: could not remove temporary directory {}: {error}",
                path.display()
            ));
        }
    }

    fn finish(self) -> CompilationResult {
        CompilationResult {
            success: self.state == BuildState::Completed,
            exit_code: self.exit_code,
            combined_output: self.output.text(),
            final_state: self.state,
            artifact: self.artifact,
        }
    }
}
