/// One FixIIR run: resolve the executable, build the command line, run FloPoCo
/// under an optional deadline, decode its output and extract H / Heps / lsbExt.
use crate::patterns;
use crate::watchdog;
use serde::Serialize;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

/// Name looked up on PATH when no executable is given.
pub const EXECUTABLE_NAME: &str = "flopoco";
/// Last-resort location: a local FloPoCo build tree.
pub const LOCAL_BUILD_PATH: &str = "./build/flopoco";
/// Operator selector; a bare token, not key=value.
pub const OPERATOR: &str = "FixIIR";

/// Parameters for one FixIIR invocation.
#[derive(Debug, Clone)]
pub struct FixIirRequest {
    /// Numerator coefficients, `:`-separated hex floats.
    pub coeffb: String,
    /// Denominator coefficients (usually a[1:], a0 = 1 omitted).
    pub coeffa: String,
    pub lsb_in: i32,
    pub lsb_out: i32,
    /// Must be >= 1 for the detail lines we parse to appear. Not enforced.
    pub loglevel: i32,
    pub generate_figures: i32,
    pub flopoco_exe: Option<PathBuf>,
    pub extra_args: Vec<String>,
    pub timeout: Option<Duration>,
    /// Substituted for H after a clean exit whose log lacks it.
    pub fallback_h: Option<f64>,
}

impl FixIirRequest {
    pub fn new(
        coeffb: impl Into<String>,
        coeffa: impl Into<String>,
        lsb_in: i32,
        lsb_out: i32,
    ) -> Self {
        Self {
            coeffb: coeffb.into(),
            coeffa: coeffa.into(),
            lsb_in,
            lsb_out,
            loglevel: 1,
            generate_figures: 0,
            flopoco_exe: None,
            extra_args: Vec::new(),
            timeout: None,
            fallback_h: None,
        }
    }
}

/// Metrics reported by one FixIIR run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsResult {
    /// Filter worst-case peak gain.
    #[serde(rename = "H")]
    pub h: f64,
    /// Error-amplification worst-case peak gain, if FloPoCo announced it.
    #[serde(rename = "Heps")]
    pub heps: Option<f64>,
    /// Guard bits FixIIR chose.
    #[serde(rename = "lsbExt")]
    pub lsb_ext: i64,
    /// stdout + "\n" + stderr, kept for diagnostics.
    #[serde(skip)]
    pub raw_log: String,
    /// Recovered from a run that hit the deadline.
    #[serde(rename = "timedOut")]
    pub timed_out: bool,
}

/// Errors from a FixIIR run. Every variant that ran the process carries its log.
#[derive(Debug)]
pub enum MetricsError {
    /// Nothing to execute at the resolved path.
    ExecutableNotFound { path: PathBuf },
    /// Spawning failed for another reason (permissions, bad format, ...).
    Spawn {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Waiting on or reaping the child failed.
    Io { source: std::io::Error },
    /// Deadline hit before H and lsbExt were both in the log.
    Timeout { timeout: Duration, log: String },
    /// Non-zero exit (`code` is None when killed by a signal).
    ProcessFailed { code: Option<i32>, log: String },
    /// Clean exit, but a required metric was not announced.
    MetricNotFound { metric: &'static str, log: String },
}

impl std::fmt::Display for MetricsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricsError::ExecutableNotFound { path } => write!(
                f,
                "FloPoCo executable not found: {}. Either install `{}` in PATH or pass an explicit path (--flopoco)",
                path.display(),
                EXECUTABLE_NAME
            ),
            MetricsError::Spawn { path, source } => {
                write!(f, "failed to spawn {}: {}", path.display(), source)
            }
            MetricsError::Io { source } => {
                write!(f, "I/O error while waiting for FloPoCo: {}", source)
            }
            MetricsError::Timeout { timeout, log } => write!(
                f,
                "FloPoCo timeout after {}s while running {}. Log:\n{}",
                timeout.as_secs_f64(),
                OPERATOR,
                log
            ),
            MetricsError::ProcessFailed {
                code: Some(code),
                log,
            } => write!(f, "FloPoCo exited with code {}. Log:\n{}", code, log),
            MetricsError::ProcessFailed { code: None, log } => {
                write!(f, "FloPoCo was terminated by a signal. Log:\n{}", log)
            }
            MetricsError::MetricNotFound { metric, log } => {
                write!(f, "Could not parse {} from FloPoCo log. Log:\n{}", metric, log)
            }
        }
    }
}

impl std::error::Error for MetricsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MetricsError::Spawn { source, .. } => Some(source),
            MetricsError::Io { source } => Some(source),
            _ => None,
        }
    }
}

/// Resolved program plus its ordered arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandSpec {
    /// Build the FixIIR command line. The argument order is what FloPoCo's parser expects.
    pub fn build(program: PathBuf, request: &FixIirRequest) -> Self {
        let mut args = vec![
            format!("generateFigures={}", request.generate_figures),
            OPERATOR.to_string(),
            format!("coeffb={}", request.coeffb),
            format!("coeffa={}", request.coeffa),
            format!("lsbIn={}", request.lsb_in),
            format!("lsbOut={}", request.lsb_out),
            format!("loglevel={}", request.loglevel),
        ];
        args.extend(request.extra_args.iter().cloned());
        Self { program, args }
    }

    /// Shell-ish rendering for logs and --dry-run.
    pub fn display(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Explicit path verbatim, else `flopoco` on PATH, else the local build path.
pub fn resolve_executable(explicit: Option<&Path>) -> PathBuf {
    resolve_with_path(explicit, std::env::var_os("PATH").as_deref())
}

/// [`resolve_executable`] against a given PATH value.
fn resolve_with_path(explicit: Option<&Path>, path_var: Option<&OsStr>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    match path_var.and_then(|p| search_path(EXECUTABLE_NAME, p)) {
        Some(path) => {
            tracing::debug!(path = %path.display(), "found flopoco on PATH");
            path
        }
        None => {
            tracing::debug!(
                path = LOCAL_BUILD_PATH,
                "flopoco not on PATH, using local build path"
            );
            PathBuf::from(LOCAL_BUILD_PATH)
        }
    }
}

/// First executable file called `name` in a PATH-style list.
fn search_path(name: &str, path_var: &OsStr) -> Option<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    std::env::split_paths(path_var)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(name))
        .find(|candidate| {
            std::fs::metadata(candidate)
                .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
                .unwrap_or(false)
        })
}

/// Lossy UTF-8 decode of both streams, joined stdout-then-stderr.
pub fn decode_log(stdout: &[u8], stderr: &[u8]) -> String {
    format!(
        "{}\n{}",
        String::from_utf8_lossy(stdout),
        String::from_utf8_lossy(stderr)
    )
}

/// How long readers get to flush what is left in the pipes after the group is killed.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Bytes read from one child pipe by a background task.
///
/// The buffer is shared with the task, so whatever arrived before a deadline
/// can be taken even if the pipe never reaches EOF.
struct Capture {
    buf: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
    done: bool,
}

impl Capture {
    fn spawn<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buf);
        let task = tokio::spawn(async move {
            let Some(mut pipe) = pipe else { return };
            let mut chunk = [0u8; 8192];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => sink
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .extend_from_slice(&chunk[..n]),
                    Err(e) => {
                        tracing::warn!(error = %e, "error reading child output");
                        break;
                    }
                }
            }
        });
        Self {
            buf,
            task,
            done: false,
        }
    }

    /// Wait for EOF on the pipe.
    async fn finished(&mut self) {
        if !self.done {
            if let Err(e) = (&mut self.task).await {
                tracing::warn!(error = %e, "output reader task failed");
            }
            self.done = true;
        }
    }

    /// Everything read so far. Gives an unfinished reader a short grace, then abandons it.
    async fn collect(mut self) -> Vec<u8> {
        if !self.done && tokio::time::timeout(DRAIN_GRACE, self.finished()).await.is_err() {
            tracing::warn!("child output still open after kill, keeping partial output");
            self.task.abort();
        }
        std::mem::take(&mut *self.buf.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Run FloPoCo FixIIR and extract its metrics.
///
/// Blocks (asynchronously) until the process exits and its output is drained,
/// or the deadline passes. On a deadline, the partial log is still scanned:
/// FixIIR announces H and lsbExt early and then spends a long time
/// synthesizing, so a run killed late usually has everything we need.
pub async fn run_and_extract(request: &FixIirRequest) -> Result<MetricsResult, MetricsError> {
    let program = resolve_executable(request.flopoco_exe.as_deref());
    let cmd = CommandSpec::build(program, request);

    tracing::info!(
        command = %cmd.program.display(),
        args = ?cmd.args,
        timeout_secs = ?request.timeout.map(|t| t.as_secs_f64()),
        "spawning FloPoCo"
    );

    let start = Instant::now();
    let mut child = Command::new(&cmd.program)
        .args(&cmd.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0) // New process group for clean kill
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => MetricsError::ExecutableNotFound {
                path: cmd.program.clone(),
            },
            _ => MetricsError::Spawn {
                path: cmd.program.clone(),
                source: e,
            },
        })?;

    // Group leader, so this is also the pgid; keep it, id() is gone once reaped.
    let pgid = child.id();
    tracing::info!(pid = ?pgid, "FloPoCo started");

    let mut stdout = Capture::spawn(child.stdout.take());
    let mut stderr = Capture::spawn(child.stderr.take());

    // One deadline, measured from spawn, over the exit and both pipes.
    let finished = watchdog::within_deadline(request.timeout, async {
        let status = child.wait().await;
        stdout.finished().await;
        stderr.finished().await;
        status
    })
    .await;

    let status = match finished {
        Some(status) => Some(status.map_err(|e| MetricsError::Io { source: e })?),
        None => {
            watchdog::kill_and_reap(&mut child, pgid)
                .await
                .map_err(|e| MetricsError::Io { source: e })?;
            None
        }
    };

    let stdout = stdout.collect().await;
    let stderr = stderr.collect().await;
    let raw_log = decode_log(&stdout, &stderr);

    tracing::info!(
        stdout_bytes = stdout.len(),
        stderr_bytes = stderr.len(),
        duration_secs = start.elapsed().as_secs_f64(),
        "FloPoCo finished"
    );

    match status {
        None => {
            // Only reachable when a deadline was set.
            let timeout = request.timeout.unwrap_or_default();
            recover_after_timeout(raw_log, timeout)
        }
        Some(status) if !status.success() => {
            tracing::info!(exit_code = ?status.code(), "FloPoCo failed");
            Err(MetricsError::ProcessFailed {
                code: status.code(),
                log: raw_log,
            })
        }
        Some(_) => metrics_from_clean_exit(raw_log, request.fallback_h),
    }
}

/// Best effort after a deadline: succeed only if H and lsbExt were both announced.
fn recover_after_timeout(raw_log: String, timeout: Duration) -> Result<MetricsResult, MetricsError> {
    let found = patterns::extract(&raw_log);
    match (found.h, found.lsb_ext) {
        (Some(h), Some(lsb_ext)) => {
            tracing::warn!(h, lsb_ext, "recovered metrics from partial log after timeout");
            Ok(MetricsResult {
                h,
                heps: found.heps,
                lsb_ext,
                raw_log,
                timed_out: true,
            })
        }
        _ => {
            tracing::warn!(
                has_h = found.h.is_some(),
                has_lsb_ext = found.lsb_ext.is_some(),
                "partial log lacks required metrics"
            );
            Err(MetricsError::Timeout {
                timeout,
                log: raw_log,
            })
        }
    }
}

/// Extraction after exit code 0. H may fall back; lsbExt may not.
fn metrics_from_clean_exit(
    raw_log: String,
    fallback_h: Option<f64>,
) -> Result<MetricsResult, MetricsError> {
    let found = patterns::extract(&raw_log);

    let h = match (found.h, fallback_h) {
        (Some(h), _) => h,
        (None, Some(fallback)) => {
            tracing::warn!(fallback, "H not announced, using fallback");
            fallback
        }
        (None, None) => {
            return Err(MetricsError::MetricNotFound {
                metric: "H",
                log: raw_log,
            })
        }
    };

    let Some(lsb_ext) = found.lsb_ext else {
        return Err(MetricsError::MetricNotFound {
            metric: "lsbExt",
            log: raw_log,
        });
    };

    Ok(MetricsResult {
        h,
        heps: found.heps,
        lsb_ext,
        raw_log,
        timed_out: false,
    })
}
