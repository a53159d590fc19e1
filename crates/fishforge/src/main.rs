use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use fishforge::config::{self, ForgeSettings};
use fishforge::events::StdoutSink;
use fishforge::fsutil::{Removal, remove_dir_with_retries};
use fishforge::model::{
    BuildConfiguration, BuildState, CompilerDescriptor, CompilerKind, sanitize_architecture,
    sanitize_parallel_jobs,
};
use fishforge::net::ReqwestFetcher;
use fishforge::orchestrator::BuildOrchestrator;
use fishforge::toolchain::EnvironmentResolver;
use fishforge::{Error, ErrorKind, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
/// Whole-request ceiling, body included; source archives are large.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Settings TOML (may use `extends`)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Format of diagnostic logs written to stderr
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Download, patch and compile one engine binary
    Build(BuildArgs),
    /// Print the environment overlay a compiler would build with
    Env {
        #[arg(long)]
        compiler: PathBuf,
    },
    /// Print the fully-resolved settings as TOML
    Config,
    /// Inspect or clear the source archive cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Debug, Subcommand)]
enum CacheAction {
    List,
    Clear,
}

#[derive(Debug, clap::Args)]
struct BuildArgs {
    /// C++ compiler executable
    #[arg(long)]
    compiler: Option<PathBuf>,
    /// gcc, clang or msvc (inferred from the compiler name when omitted)
    #[arg(long)]
    kind: Option<String>,
    /// Target architecture id, e.g. x86-64-avx2
    #[arg(long)]
    arch: Option<String>,
    /// Release tag, `stable`, or `dev`
    #[arg(long)]
    version: Option<String>,
    /// Never download network files
    #[arg(long)]
    no_net: bool,
    #[arg(long)]
    no_strip: bool,
    #[arg(long)]
    no_pgo: bool,
    /// Parallel make jobs (clamped to twice the CPU count)
    #[arg(long)]
    jobs: Option<i64>,
    /// Directory the finished binary is copied to
    #[arg(long)]
    output: Option<PathBuf>,
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

fn main() -> ExitCode {
    let args = Args::parse();
    dotenv::dotenv().ok();
    init_logging(args.log_format);

    let res = load_settings(args.config.as_deref()).and_then(|settings| match args.cmd {
        Command::Build(b) => cmd_build(settings, b),
        Command::Env { compiler } => cmd_env(settings, &compiler).map(|_| ExitCode::SUCCESS),
        Command::Config => cmd_config(&settings).map(|_| ExitCode::SUCCESS),
        Command::Cache { action } => cmd_cache(&settings, action).map(|_| ExitCode::SUCCESS),
    });
    match res {
        Ok(code) => code,
        Err(e) if e.kind() == ErrorKind::Cancelled => ExitCode::from(130),
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("fishforge=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_settings(path: Option<&Path>) -> Result<ForgeSettings> {
    let mut settings = match path {
        Some(p) => ForgeSettings::from_doc(&config::load(p)?)?,
        None => ForgeSettings::default(),
    };
    settings.apply_env_overrides(|k| std::env::var(k).ok());
    Ok(settings)
}

fn infer_kind(compiler: &Path) -> CompilerKind {
    let name = compiler
        .file_stem()
        .map(|s| s.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if name.contains("clang") {
        CompilerKind::Clang
    } else if name == "cl" {
        CompilerKind::Msvc
    } else {
        CompilerKind::Gcc
    }
}

fn build_configuration(settings: &ForgeSettings, args: BuildArgs) -> Result<BuildConfiguration> {
    let d = &settings.build;
    let compiler = args
        .compiler
        .or_else(|| d.compiler.clone())
        .ok_or_else(|| Error::new(ErrorKind::Config, "no compiler given (use --compiler)"))?;
    let kind = match args.kind.or_else(|| d.kind.clone()) {
        Some(raw) => CompilerKind::parse(&raw)
            .ok_or_else(|| Error::new(ErrorKind::Config, format!("unknown compiler kind: {raw}")))?,
        None => infer_kind(&compiler),
    };
    let arch = args.arch.or_else(|| d.arch.clone()).unwrap_or_default();
    Ok(BuildConfiguration {
        compiler: CompilerDescriptor::from_path(&compiler, kind),
        architecture: sanitize_architecture(&arch),
        version_tag: args
            .version
            .or_else(|| d.version.clone())
            .unwrap_or_else(|| "stable".to_string()),
        fetch_asset: !args.no_net && d.fetch_asset.unwrap_or(true),
        strip_binary: !args.no_strip && d.strip.unwrap_or(true),
        enable_pgo: !args.no_pgo && d.pgo.unwrap_or(true),
        parallel_jobs: sanitize_parallel_jobs(
            args.jobs.or(d.jobs).unwrap_or(num_cpus::get() as i64),
        ),
        output_dir: args
            .output
            .or_else(|| d.output_dir.clone())
            .unwrap_or_else(|| PathBuf::from(".")),
    })
}

fn cmd_build(settings: ForgeSettings, args: BuildArgs) -> Result<ExitCode> {
    let config = build_configuration(&settings, args)?;
    let http = Arc::new(ReqwestFetcher::new(CONNECT_TIMEOUT, REQUEST_TIMEOUT)?);
    let sink = Arc::new(StdoutSink::default());
    let orch = Arc::new(BuildOrchestrator::new(settings, http, sink));

    install_interrupt_handler();
    let watcher = {
        let orch = orch.clone();
        thread::spawn(move || {
            while !INTERRUPTED.load(Ordering::SeqCst) {
                if Arc::strong_count(&orch) == 1 {
                    return;
                }
                thread::sleep(Duration::from_millis(100));
            }
            eprintln!("interrupt received, cancelling build...");
            orch.cancel();
        })
    };

    let result = orch.build(&config);
    drop(orch);
    let _ = watcher.join();

    let result = result?;
    Ok(match result.final_state {
        BuildState::Completed => ExitCode::SUCCESS,
        BuildState::Cancelled => ExitCode::from(130),
        _ => ExitCode::FAILURE,
    })
}

#[cfg(unix)]
fn install_interrupt_handler() {
    extern "C" fn on_sigint(_: libc::c_int) {
        INTERRUPTED.store(true, Ordering::SeqCst);
    }
    let handler: extern "C" fn(libc::c_int) = on_sigint;
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }
}

#[cfg(not(unix))]
fn install_interrupt_handler() {}

fn cmd_env(settings: ForgeSettings, compiler: &Path) -> Result<()> {
    let descriptor = CompilerDescriptor::from_path(compiler, infer_kind(compiler));
    let resolver = EnvironmentResolver::new(settings.toolchain);
    let env = resolver.resolve(&descriptor);
    match env.root.as_ref() {
        Some(root) => println!("toolchain root: {}", root.display()),
        None => println!("toolchain root: (none, host environment used)"),
    }
    println!(
        "make: {}",
        resolver
            .find_make(&descriptor, env.root.as_deref())
            .display()
    );
    for (k, v) in &env.overlay {
        println!("{k}={v}");
    }
    Ok(())
}

fn cmd_config(settings: &ForgeSettings) -> Result<()> {
    let s = toml::to_string_pretty(settings)
        .map_err(|e| Error::new(ErrorKind::Config, format!("failed to render settings: {e}")))?;
    print!("{s}");
    Ok(())
}

fn cmd_cache(settings: &ForgeSettings, action: CacheAction) -> Result<()> {
    let root = settings.source.cache_root();
    match action {
        CacheAction::List => {
            if !root.is_dir() {
                println!("cache is empty ({})", root.display());
                return Ok(());
            }
            let mut total = 0u64;
            for entry in walkdir::WalkDir::new(&root)
                .min_depth(1)
                .max_depth(1)
                .sort_by_file_name()
            {
                let entry = entry.map_err(|e| Error::msg(format!("failed to list cache: {e}")))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
                total += len;
                println!("{:>12}  {}", len, entry.file_name().to_string_lossy());
            }
            println!("{total:>12}  total in {}", root.display());
        }
        CacheAction::Clear => {
            let c = &settings.cleanup;
            match remove_dir_with_retries(&root, c.attempts, Duration::from_millis(c.backoff_ms)) {
                Removal::Removed { .. } => println!("cleared {}", root.display()),
                Removal::AlreadyGone => println!("cache is empty ({})", root.display()),
                Removal::Failed { path, error } => {
                    return Err(Error::new(
                        ErrorKind::Io,
                        format!("failed to clear {}: {error}", path.display()),
                    ));
                }
            }
        }
    }
    Ok(())
}
