use super::{ExecOutput, Executor, ScriptTarget};
use crate::config::CgiBackendConfig;
use crate::error::GatewayError;
use crate::meta::MetaVariableSet;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Duration, Instant};
use tracing::{debug, warn};

const KILL_GRACE: Duration = Duration::from_secs(5);

pub struct CgiExecutor {
    root: PathBuf,
    /// Canonicalized root path for containment checks.
    canonical_root: PathBuf,
    document_root: PathBuf,
    limits: InvocationLimits,
    passthrough: Vec<(String, String)>,
    /// Extension (without the dot) to interpreter.
    interpreters: HashMap<String, PathBuf>,
}

#[derive(Debug, Clone, Copy)]
pub struct InvocationLimits {
    pub timeout: Duration,
    pub max_stdout_bytes: usize,
    pub max_stderr_bytes: usize,
}

impl CgiExecutor {
    pub fn new(config: &CgiBackendConfig) -> Result<Self> {
        let canonical_root = config.root.canonicalize().map_err(|e| {
            anyhow!(
                "failed to canonicalize CGI root '{}': {}",
                config.root.display(),
                e
            )
        })?;

        // Read once so that every invocation sees the same values.
        let passthrough = config
            .env_passthrough
            .iter()
            .filter_map(|var| std::env::var(var).ok().map(|val| (var.clone(), val)))
            .collect();

        let interpreters = config
            .interpreters
            .iter()
            .map(|(ext, path)| (ext.trim_start_matches('.').to_string(), path.clone()))
            .collect();

        Ok(Self {
            root: config.root.clone(),
            document_root: config
                .document_root
                .clone()
                .unwrap_or_else(|| canonical_root.clone()),
            canonical_root,
            limits: InvocationLimits {
                timeout: Duration::from_millis(config.timeout_ms),
                max_stdout_bytes: config.max_stdout_bytes,
                max_stderr_bytes: config.max_stderr_bytes,
            },
            passthrough,
            interpreters,
        })
    }

    fn interpreter_for(&self, script: &Path) -> Option<PathBuf> {
        let ext = script.extension()?.to_str()?;
        self.interpreters.get(ext).cloned()
    }

    /// Walk the path below the handler prefix until a regular file is found;
    /// the remaining segments become PATH_INFO.
    fn resolve_script(
        &self,
        path: &str,
        matched_prefix: Option<&str>,
    ) -> Result<ScriptTarget, GatewayError> {
        let prefix = matched_prefix.unwrap_or("");
        let relative = path.strip_prefix(prefix).unwrap_or(path);
        let relative = relative.trim_start_matches('/');

        if relative.contains('\0') {
            return Err(GatewayError::Forbidden(path.to_string()));
        }
        let segments: Vec<&str> = relative.split('/').collect();
        // Reject traversal before touching the filesystem.
        if segments.iter().any(|s| *s == ".." || *s == ".") {
            return Err(GatewayError::Forbidden(path.to_string()));
        }

        let mut candidate = self.root.clone();
        for (idx, segment) in segments.iter().enumerate() {
            if segment.is_empty() {
                break;
            }
            candidate.push(segment);
            let meta = std::fs::metadata(&candidate)
                .map_err(|_| GatewayError::ScriptNotFound(candidate.clone()))?;
            if meta.is_dir() {
                continue;
            }
            if !meta.is_file() {
                return Err(GatewayError::ScriptNotFound(candidate));
            }

            // Canonicalize to resolve symlinks and verify containment.
            let canonical = candidate
                .canonicalize()
                .map_err(|_| GatewayError::ScriptNotFound(candidate.clone()))?;
            if !canonical.starts_with(&self.canonical_root) {
                return Err(GatewayError::Forbidden(path.to_string()));
            }

            let script_name = format!(
                "{}/{}",
                prefix.trim_end_matches('/'),
                segments[..=idx].join("/")
            );
            let path_info = if idx + 1 < segments.len() {
                format!("/{}", segments[idx + 1..].join("/"))
            } else {
                String::new()
            };
            return Ok(ScriptTarget {
                script_name,
                path_info,
                interpreter: self.interpreter_for(&canonical),
                filename: canonical,
                document_root: self.document_root.clone(),
            });
        }
        Err(GatewayError::ScriptNotFound(candidate))
    }
}

#[async_trait]
impl Executor for CgiExecutor {
    fn resolve(
        &self,
        path: &str,
        matched_prefix: Option<&str>,
    ) -> Result<ScriptTarget, GatewayError> {
        self.resolve_script(path, matched_prefix)
    }

    fn passthrough_env(&self) -> &[(String, String)] {
        &self.passthrough
    }

    async fn execute(
        &self,
        script: &ScriptTarget,
        env: &MetaVariableSet,
        body: Bytes,
    ) -> Result<ExecOutput, GatewayError> {
        let invocation = CgiInvocation::spawn(script, env, body, self.limits)?;
        let out = invocation.wait().await?;

        if !out.stderr.is_empty() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            warn!(script = %script.filename.display(), cgi_stderr = %stderr, "CGI stderr");
        }
        if !out.status.success() {
            warn!(
                script = %script.filename.display(),
                exit_code = out.status.code(),
                "CGI script exited with error"
            );
        }
        Ok(out)
    }
}

/// One running script: the child process, its stream tasks and its deadline.
///
/// Dropping an invocation that has not been reaped kills the whole process
/// group, which is how connection cancellation reaches the script.
pub struct CgiInvocation {
    child: Child,
    pid: Option<u32>,
    deadline: Instant,
    limits: InvocationLimits,
    stdin_task: JoinHandle<()>,
    stdout_task: JoinHandle<Result<BytesMut, GatewayError>>,
    stderr_task: JoinHandle<BytesMut>,
    reaped: bool,
}

impl CgiInvocation {
    pub fn spawn(
        script: &ScriptTarget,
        env: &MetaVariableSet,
        body: Bytes,
        limits: InvocationLimits,
    ) -> Result<Self, GatewayError> {
        let program = script.program();
        let mut cmd = Command::new(program);
        if script.interpreter.is_some() {
            cmd.arg(&script.filename);
        }
        if let Some(dir) = script.filename.parent() {
            cmd.current_dir(dir);
        }
        cmd.env_clear()
            .envs(env.iter())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group so termination also reaches descendants.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| GatewayError::SpawnFailure {
            program: program.clone(),
            source,
        })?;
        let deadline = Instant::now() + limits.timeout;
        let pid = child.id();

        let missing = |name: &str| {
            GatewayError::Io(std::io::Error::other(format!("CGI child {name} unavailable")))
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        debug!(pid = ?pid, program = %program.display(), body_bytes = body.len(), "CGI spawned");

        Ok(Self {
            child,
            pid,
            deadline,
            limits,
            stdin_task: tokio::spawn(write_body(stdin, body)),
            stdout_task: tokio::spawn(read_capped(stdout, limits.max_stdout_bytes)),
            stderr_task: tokio::spawn(drain_bounded(stderr, limits.max_stderr_bytes)),
            reaped: false,
        })
    }

    /// Wait for exit and full output, or fail with `Timeout` once the deadline
    /// passes. Any failure terminates the process group before returning.
    pub async fn wait(mut self) -> Result<ExecOutput, GatewayError> {
        let deadline = self.deadline;
        let result = timeout_at(deadline, self.collect()).await;
        match result {
            Ok(Ok(out)) => Ok(out),
            Ok(Err(e)) => {
                self.terminate().await;
                Err(e)
            }
            Err(_) => {
                self.terminate().await;
                Err(GatewayError::Timeout(self.limits.timeout))
            }
        }
    }

    async fn collect(&mut self) -> Result<ExecOutput, GatewayError> {
        let stdout = (&mut self.stdout_task).await.map_err(join_error)??;
        let status = self.child.wait().await?;
        self.reaped = true;
        let stderr = (&mut self.stderr_task).await.map_err(join_error)?;
        // The script is gone; a writer still blocked on a pipe held by a
        // descendant has nothing left to deliver.
        if !self.stdin_task.is_finished() {
            self.stdin_task.abort();
        }
        Ok(ExecOutput {
            stdout: stdout.freeze(),
            stderr: stderr.freeze(),
            status,
        })
    }

    async fn terminate(&mut self) {
        self.kill();
        self.stdin_task.abort();
        self.stdout_task.abort();
        self.stderr_task.abort();
        match timeout(KILL_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.reaped = true;
                debug!(pid = ?self.pid, ?status, "CGI terminated");
            }
            Ok(Err(e)) => warn!(pid = ?self.pid, error = %e, "failed to reap CGI child"),
            Err(_) => warn!(pid = ?self.pid, "CGI child did not exit after SIGKILL"),
        }
    }

    fn kill(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            kill_process_group(pid);
        }
        let _ = self.child.start_kill();
    }
}

impl Drop for CgiInvocation {
    fn drop(&mut self) {
        self.stdin_task.abort();
        self.stdout_task.abort();
        self.stderr_task.abort();
        if !self.reaped {
            debug!(pid = ?self.pid, "CGI invocation dropped; killing process group");
            self.kill();
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: kill(2) takes no pointers; a negative pid addresses the process
    // group created for this child with process_group(0).
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

fn join_error(err: tokio::task::JoinError) -> GatewayError {
    GatewayError::Io(std::io::Error::other(err))
}

async fn write_body(mut stdin: ChildStdin, body: Bytes) {
    match stdin.write_all(&body).await {
        // Dropping stdin closes the pipe and signals end of input.
        Ok(()) => {}
        // The script read what it wanted (e.g. up to CONTENT_LENGTH) and closed.
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
            debug!(body_bytes = body.len(), "CGI closed stdin before reading the whole body");
        }
        Err(e) => warn!(error = %e, "writing request body to CGI stdin failed"),
    }
}

async fn read_capped<R: AsyncRead + Unpin>(
    mut reader: R,
    limit: usize,
) -> Result<BytesMut, GatewayError> {
    let mut buf = BytesMut::with_capacity(8192);
    loop {
        buf.reserve(8192);
        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            return Ok(buf);
        }
        if buf.len() > limit {
            return Err(GatewayError::OutputTooLarge(limit));
        }
    }
}

// Keeps the first `limit` bytes but drains until EOF so the script never
// blocks on a full stderr pipe.
async fn drain_bounded<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> BytesMut {
    let mut kept = BytesMut::new();
    let mut scratch = [0u8; 8192];
    loop {
        match reader.read(&mut scratch).await {
            Ok(0) | Err(_) => return kept,
            Ok(n) => {
                let take = n.min(limit.saturating_sub(kept.len()));
                kept.extend_from_slice(&scratch[..take]);
            }
        }
    }
}
