pub mod cgi;

use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::process::ExitStatus;

use crate::error::GatewayError;
use crate::meta::MetaVariableSet;

/// A script resolved from a request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptTarget {
    /// URL path that names the script (`SCRIPT_NAME`).
    pub script_name: String,
    /// Remainder of the URL path after the script (`PATH_INFO`).
    pub path_info: String,
    /// Canonical filesystem path of the script.
    pub filename: PathBuf,
    pub document_root: PathBuf,
    /// Interpreter to run the script with, chosen by file extension.
    pub interpreter: Option<PathBuf>,
}

impl ScriptTarget {
    /// The program actually spawned.
    pub fn program(&self) -> &PathBuf {
        self.interpreter.as_ref().unwrap_or(&self.filename)
    }
}

/// Everything a finished script produced.
#[derive(Debug)]
pub struct ExecOutput {
    /// Raw stdout, in the order the program wrote it.
    pub stdout: Bytes,
    /// First `max_stderr_bytes` of stderr; diagnostics only.
    pub stderr: Bytes,
    pub status: ExitStatus,
}

/// Resolves and runs scripts for one handler.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Map a request path to a script. `matched_prefix` is the handler prefix
    /// that selected this executor, if any.
    fn resolve(
        &self,
        path: &str,
        matched_prefix: Option<&str>,
    ) -> Result<ScriptTarget, GatewayError>;

    /// Host environment values exported to every script of this handler.
    fn passthrough_env(&self) -> &[(String, String)];

    /// Run `script` with `env` as its whole environment and `body` on stdin.
    ///
    /// Returns once the process has exited and its output streams are drained.
    /// Dropping the returned future terminates the process.
    async fn execute(
        &self,
        script: &ScriptTarget,
        env: &MetaVariableSet,
        body: Bytes,
    ) -> Result<ExecOutput, GatewayError>;
}
