use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Top-level qpxg configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QpxgConfig {
    /// Listen address: TCP ("127.0.0.1:8080") or Unix socket ("unix:///run/qpxg.sock").
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Maximum concurrently running scripts.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Maximum concurrent client connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum number of requests per connection (keep-alive cap).
    #[serde(default = "default_max_requests_per_connection")]
    pub max_requests_per_connection: usize,

    /// Allow binding to non-loopback TCP addresses.
    ///
    /// qpxg runs programs on behalf of clients; keep it behind a proxy unless set.
    #[serde(default)]
    pub allow_insecure_tcp: bool,

    /// Maximum size of a request line plus headers (bytes).
    #[serde(default = "default_max_request_header_bytes")]
    pub max_request_header_bytes: usize,

    /// Maximum request body size after de-chunking (bytes).
    #[serde(default = "default_max_request_body_bytes")]
    pub max_request_body_bytes: usize,

    /// Time allowed for a client to send a complete request head (ms).
    #[serde(default = "default_header_read_timeout_ms")]
    pub header_read_timeout_ms: u64,

    /// Time allowed for a client to send a complete request body (ms).
    #[serde(default = "default_body_read_timeout_ms")]
    pub body_read_timeout_ms: u64,

    /// Idle timeout for keep-alive connections between requests (ms).
    #[serde(default = "default_conn_idle_timeout_ms")]
    pub conn_idle_timeout_ms: u64,

    /// Framing for script bodies without a declared Content-Length.
    #[serde(default)]
    pub eof_response_framing: EofFraming,

    /// Handler routing rules, first match wins.
    #[serde(default)]
    pub handlers: Vec<HandlerConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EofFraming {
    /// Buffer and send with the measured Content-Length.
    #[default]
    ContentLength,
    /// Send with chunked transfer coding to HTTP/1.1 clients.
    Chunked,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandlerConfig {
    pub r#match: MatchConfig,
    pub cgi: CgiBackendConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatchConfig {
    #[serde(default)]
    pub path_prefix: Option<String>,
    #[serde(default)]
    pub path_regex: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CgiBackendConfig {
    /// Directory scripts are resolved under.
    pub root: PathBuf,
    #[serde(default = "default_cgi_timeout_ms")]
    pub timeout_ms: u64,
    /// Host environment variables copied into every script environment.
    #[serde(default = "default_env_passthrough")]
    pub env_passthrough: Vec<String>,
    /// Maximum CGI stdout size (bytes).
    #[serde(default = "default_max_stdout_bytes")]
    pub max_stdout_bytes: usize,
    /// Maximum CGI stderr size kept for logging (bytes).
    #[serde(default = "default_max_stderr_bytes")]
    pub max_stderr_bytes: usize,
    /// Interpreter per file extension, e.g. `py: /usr/bin/python3`.
    #[serde(default)]
    pub interpreters: HashMap<String, PathBuf>,
    /// `DOCUMENT_ROOT` exported to scripts; defaults to `root`.
    #[serde(default)]
    pub document_root: Option<PathBuf>,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_workers() -> usize {
    16
}

fn default_max_connections() -> usize {
    256
}

fn default_max_requests_per_connection() -> usize {
    100
}

fn default_max_request_header_bytes() -> usize {
    65_536 // 64 KiB
}

fn default_max_request_body_bytes() -> usize {
    33_554_432 // 32 MiB
}

fn default_header_read_timeout_ms() -> u64 {
    10_000
}

fn default_body_read_timeout_ms() -> u64 {
    60_000
}

fn default_conn_idle_timeout_ms() -> u64 {
    60_000
}

fn default_cgi_timeout_ms() -> u64 {
    30_000
}

fn default_env_passthrough() -> Vec<String> {
    vec!["PATH".to_string()]
}

fn default_max_stdout_bytes() -> usize {
    33_554_432 // 32 MiB
}

fn default_max_stderr_bytes() -> usize {
    1_048_576 // 1 MiB
}

impl QpxgConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(anyhow!("workers must be >= 1"));
        }
        if self.max_connections == 0 {
            return Err(anyhow!("max_connections must be >= 1"));
        }
        if self.max_requests_per_connection == 0 {
            return Err(anyhow!("max_requests_per_connection must be >= 1"));
        }
        if self.max_request_header_bytes < 1024 {
            return Err(anyhow!("max_request_header_bytes must be >= 1024"));
        }
        if self.max_request_body_bytes == 0 {
            return Err(anyhow!("max_request_body_bytes must be >= 1"));
        }
        if self.header_read_timeout_ms == 0 {
            return Err(anyhow!("header_read_timeout_ms must be >= 1"));
        }
        if self.body_read_timeout_ms == 0 {
            return Err(anyhow!("body_read_timeout_ms must be >= 1"));
        }
        if self.conn_idle_timeout_ms == 0 {
            return Err(anyhow!("conn_idle_timeout_ms must be >= 1"));
        }
        for (idx, handler) in self.handlers.iter().enumerate() {
            let cgi = &handler.cgi;
            if cgi.timeout_ms == 0 {
                return Err(anyhow!("handlers[{idx}].cgi.timeout_ms must be >= 1"));
            }
            if cgi.max_stdout_bytes == 0 {
                return Err(anyhow!("handlers[{idx}].cgi.max_stdout_bytes must be >= 1"));
            }
            if let Some(prefix) = &handler.r#match.path_prefix {
                if !prefix.starts_with('/') {
                    return Err(anyhow!(
                        "handlers[{idx}].match.path_prefix must start with '/': '{prefix}'"
                    ));
                }
            }
        }

        if self.listen.starts_with("unix://") {
            return Ok(());
        }

        let addr: SocketAddr = self
            .listen
            .parse()
            .map_err(|e| anyhow!("invalid listen address '{}': {}", self.listen, e))?;
        if !addr.ip().is_loopback() && !self.allow_insecure_tcp {
            return Err(anyhow!(
                "refusing to bind qpxg to non-loopback address '{}' without allow_insecure_tcp=true",
                self.listen
            ));
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<QpxgConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config: QpxgConfig = serde_yaml::from_str(&content)
        .with_context(|| format!("parsing config {}", path.display()))?;
    Ok(config)
}
