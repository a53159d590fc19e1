//! Spawning and supervising external tools (make, strip, the compiler itself).
//!
//! Every child runs in its own process group so that a cancel or timeout can take
//! down the whole tree make forks (compiler drivers, linkers, the PGO bench run).

pub mod buffer;

use std::collections::BTreeMap;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::cancel::{CancelToken, FireReason};
use crate::config::ProcessSettings;
use crate::log_sanitize::sanitize_output_line;

pub use buffer::{BoundedOutput, CapturedOutput};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What to run. Environment entries are an overlay on top of the host environment.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, a: impl Into<String>) -> Self {
        self.args.push(a.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn envs(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn timeout(mut self, t: Option<Duration>) -> Self {
        self.timeout = t;
        self
    }

    pub fn display(&self) -> String {
        let mut s = self.program.display().to_string();
        for a in &self.args {
            s.push(' ');
            s.push_str(a);
        }
        s
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: StreamKind,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Exited,
    TimedOut,
    Cancelled,
    StartFailed(String),
}

#[derive(Debug, Clone)]
pub struct ProcessResult {
    pub exit_code: Option<i32>,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub outcome: ProcessOutcome,
    /// Readers were still blocked when the post-exit grace window ran out.
    pub readers_abandoned: bool,
}

impl ProcessResult {
    fn not_started(outcome: ProcessOutcome, started_at: DateTime<Utc>) -> Self {
        Self {
            exit_code: None,
            stdout: CapturedOutput::default(),
            stderr: CapturedOutput::default(),
            success: false,
            started_at,
            elapsed: Duration::ZERO,
            outcome,
            readers_abandoned: false,
        }
    }

    pub fn describe(&self) -> String {
        match &self.outcome {
            ProcessOutcome::Exited => match self.exit_code {
                Some(code) => format!("exited with code {code}"),
                None => "exited without a status code".into(),
            },
            ProcessOutcome::TimedOut => format!("timed out after {:.1}s", self.elapsed.as_secs_f64()),
            ProcessOutcome::Cancelled => "cancelled".into(),
            ProcessOutcome::StartFailed(reason) => format!("failed to start: {reason}"),
        }
    }
}

enum ReaderMsg {
    Line(StreamKind, String),
    Closed,
}

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    max_output_chars: usize,
    max_line_chars: usize,
    reader_grace: Duration,
    kill_grace: Duration,
}

impl ProcessRunner {
    pub fn new(settings: &ProcessSettings) -> Self {
        Self {
            max_output_chars: settings.max_output_chars,
            max_line_chars: settings.max_line_chars,
            reader_grace: Duration::from_millis(settings.reader_grace_ms),
            kill_grace: Duration::from_millis(settings.kill_grace_ms),
        }
    }

    /// Run to completion, cancellation, or timeout. Never returns an error: a spawn
    /// failure is reported as `ProcessOutcome::StartFailed`.
    pub fn run(
        &self,
        spec: &ProcessSpec,
        cancel: &CancelToken,
        on_line: &mut dyn FnMut(&OutputLine),
    ) -> ProcessResult {
        let started_at = Utc::now();
        if cancel.is_cancelled() {
            return ProcessResult::not_started(ProcessOutcome::Cancelled, started_at);
        }

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(dir) = spec.cwd.as_ref() {
            cmd.current_dir(dir);
        }
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }
        own_process_group(&mut cmd);

        // A child in its own group that reads a controlling TTY would get SIGTTIN.
        let spawned = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        let mut child = match spawned {
            Ok(c) => c,
            Err(e) => {
                warn!(program = %spec.program.display(), error = %e, "spawn failed");
                return ProcessResult::not_started(
                    ProcessOutcome::StartFailed(e.to_string()),
                    started_at,
                );
            }
        };
        let start = Instant::now();
        let pid = child.id();
        info!(pid, command = %spec.display(), "process started");

        let (tx, rx) = mpsc::channel::<ReaderMsg>();
        let mut open_readers = 0usize;
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            open_readers += 1;
            std::thread::spawn(move || read_output_stream(out, StreamKind::Stdout, tx));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            open_readers += 1;
            std::thread::spawn(move || read_output_stream(err, StreamKind::Stderr, tx));
        }
        drop(tx);

        let mut stdout_buf = BoundedOutput::new(self.max_output_chars);
        let mut stderr_buf = BoundedOutput::new(self.max_output_chars);
        let mut deliver = |stream: StreamKind, raw: String| {
            let text = sanitize_output_line(&raw, self.max_line_chars);
            if text.is_empty() {
                return;
            }
            match stream {
                StreamKind::Stdout => stdout_buf.push(&text),
                StreamKind::Stderr => stderr_buf.push(&text),
            }
            on_line(&OutputLine { stream, text });
        };

        let signal = cancel.linked(spec.timeout);
        let mut fired: Option<FireReason> = None;
        let status: Option<ExitStatus> = loop {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(ReaderMsg::Line(stream, line)) => deliver(stream, line),
                Ok(ReaderMsg::Closed) => open_readers = open_readers.saturating_sub(1),
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => open_readers = 0,
            }

            if let Some(reason) = signal.fired() {
                fired = Some(reason);
                warn!(pid, ?reason, "terminating process tree");
                break terminate_tree(&mut child, pid, self.kill_grace);
            }

            match child.try_wait() {
                Ok(Some(st)) => break Some(st),
                Ok(None) => {}
                Err(e) => {
                    warn!(pid, error = %e, "wait failed; killing process tree");
                    break terminate_tree(&mut child, pid, self.kill_grace);
                }
            }
        };

        // Give readers a bounded window to flush what the pipes still hold.
        let mut readers_abandoned = false;
        let flush_deadline = Instant::now() + self.reader_grace;
        while open_readers > 0 {
            let left = flush_deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                readers_abandoned = true;
                break;
            }
            match rx.recv_timeout(left) {
                Ok(ReaderMsg::Line(stream, line)) => deliver(stream, line),
                Ok(ReaderMsg::Closed) => open_readers -= 1,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    readers_abandoned = true;
                    break;
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        if readers_abandoned {
            debug!(pid, "output readers abandoned after grace window");
        }

        let outcome = match fired {
            Some(FireReason::Cancelled) => ProcessOutcome::Cancelled,
            Some(FireReason::TimedOut) => ProcessOutcome::TimedOut,
            None => ProcessOutcome::Exited,
        };
        let exit_code = status.as_ref().and_then(exit_code_of);
        let success =
            outcome == ProcessOutcome::Exited && status.as_ref().is_some_and(ExitStatus::success);
        let elapsed = start.elapsed();
        info!(pid, ?outcome, ?exit_code, elapsed_ms = elapsed.as_millis() as u64, "process finished");

        ProcessResult {
            exit_code,
            stdout: stdout_buf.snapshot(),
            stderr: stderr_buf.snapshot(),
            success,
            started_at,
            elapsed,
            outcome,
            readers_abandoned,
        }
    }
}

fn exit_code_of(status: &ExitStatus) -> Option<i32> {
    if let Some(code) = status.code() {
        return Some(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.signal().map(|sig| 128 + sig)
    }
    #[cfg(not(unix))]
    {
        None
    }
}

#[cfg(unix)]
fn own_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    unsafe {
        cmd.pre_exec(|| {
            if libc::setpgid(0, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(windows)]
fn own_process_group(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
}

#[cfg(not(any(unix, windows)))]
fn own_process_group(_cmd: &mut Command) {}

/// Ask the group to stop, escalate after `grace`, then reap the direct child.
fn terminate_tree(child: &mut Child, pid: u32, grace: Duration) -> Option<ExitStatus> {
    signal_tree(pid, false);
    let until = Instant::now() + grace;
    while Instant::now() < until {
        match child.try_wait() {
            Ok(Some(_)) | Err(_) => break,
            Ok(None) => std::thread::sleep(POLL_INTERVAL),
        }
    }
    // Descendants may outlive the group leader; always finish with a hard kill.
    signal_tree(pid, true);
    let _ = child.kill();
    child.wait().ok()
}

fn signal_tree(pgid: u32, force: bool) {
    #[cfg(unix)]
    {
        let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
        // Negative PID targets the whole process group.
        let _ = unsafe { libc::kill(-(pgid as i32), sig) };
    }
    #[cfg(windows)]
    {
        if force {
            let _ = Command::new("taskkill")
                .args(["/PID", &pgid.to_string(), "/T", "/F"])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
        }
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = (pgid, force);
    }
}

fn read_output_stream<R: Read>(reader: R, stream: StreamKind, tx: mpsc::Sender<ReaderMsg>) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    let flush = |pending: &mut Vec<u8>| {
        let line = String::from_utf8_lossy(pending).into_owned();
        pending.clear();
        let _ = tx.send(ReaderMsg::Line(stream, line));
    };

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for b in &buf[..n] {
            if *b == b'\n' || *b == b'\r' {
                if !pending.is_empty() {
                    flush(&mut pending);
                }
            } else {
                pending.push(*b);
                if pending.len() >= MAX_PENDING_BYTES {
                    flush(&mut pending);
                }
            }
        }
    }
    if !pending.is_empty() {
        flush(&mut pending);
    }
    let _ = tx.send(ReaderMsg::Closed);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> ProcessRunner {
        ProcessRunner::new(&ProcessSettings {
            reader_grace_ms: 500,
            kill_grace_ms: 300,
            ..ProcessSettings::default()
        })
    }

    #[test]
    fn missing_program_is_a_start_failure() {
        let spec = ProcessSpec::new("/definitely/not/a/real/tool-fishforge");
        let res = runner().run(&spec, &CancelToken::new(), &mut |_| {});
        assert!(!res.success);
        assert!(matches!(res.outcome, ProcessOutcome::StartFailed(_)));
        assert!(res.describe().starts_with("failed to start"));
    }

    #[test]
    fn already_cancelled_token_skips_spawn() {
        let token = CancelToken::new();
        token.cancel();
        let res = runner().run(&ProcessSpec::new("true"), &token, &mut |_| {});
        assert_eq!(res.outcome, ProcessOutcome::Cancelled);
        assert!(!res.success);
    }

    #[cfg(unix)]
    #[test]
    fn captures_both_streams_and_forwards_lines() {
        let spec = ProcessSpec::new("sh")
            .arg("-c")
            .arg("echo out-1; echo err-1 >&2; printf 'out-2'; exit 3");
        let mut seen = Vec::new();
        let res = runner().run(&spec, &CancelToken::new(), &mut |l| seen.push(l.clone()));
        assert_eq!(res.outcome, ProcessOutcome::Exited);
        assert_eq!(res.exit_code, Some(3));
        assert!(!res.success);
        assert_eq!(res.stdout.text, "out-1\nout-2\n");
        assert_eq!(res.stderr.text, "err-1\n");
        assert!(seen.contains(&OutputLine {
            stream: StreamKind::Stderr,
            text: "err-1".into()
        }));
    }

    #[cfg(unix)]
    #[test]
    fn env_overlay_reaches_the_child() {
        let mut env = BTreeMap::new();
        env.insert("FISHFORGE_PROBE".to_string(), "hello".to_string());
        let spec = ProcessSpec::new("sh")
            .arg("-c")
            .arg("echo \"$FISHFORGE_PROBE\"")
            .envs(&env);
        let res = runner().run(&spec, &CancelToken::new(), &mut |_| {});
        assert!(res.success);
        assert_eq!(res.stdout.text, "hello\n");
    }

    #[cfg(unix)]
    #[test]
    fn timeout_is_reported_distinctly() {
        let spec = ProcessSpec::new("sh")
            .arg("-c")
            .arg("sleep 30")
            .timeout(Some(Duration::from_millis(200)));
        let start = Instant::now();
        let res = runner().run(&spec, &CancelToken::new(), &mut |_| {});
        assert_eq!(res.outcome, ProcessOutcome::TimedOut);
        assert!(!res.success);
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}
