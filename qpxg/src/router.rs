use crate::config::{MatchConfig, QpxgConfig};
use crate::executor::cgi::CgiExecutor;
use crate::executor::Executor;
use anyhow::{Context, Result};
use regex::Regex;
use std::sync::Arc;

struct CompiledHandler {
    path_prefix: Option<String>,
    path_regex: Option<Regex>,
    host: Option<String>,
    executor: Arc<dyn Executor>,
}

/// Selects the handler for a request, first match wins.
pub struct Router {
    handlers: Vec<CompiledHandler>,
}

/// A routing decision.
pub struct Route {
    pub executor: Arc<dyn Executor>,
    /// The prefix that matched, if the handler has one.
    pub prefix: Option<String>,
}

impl Router {
    pub fn new(config: &QpxgConfig) -> Result<Self> {
        let mut handlers = Vec::with_capacity(config.handlers.len());
        for (idx, h) in config.handlers.iter().enumerate() {
            let executor: Arc<dyn Executor> = Arc::new(
                CgiExecutor::new(&h.cgi).with_context(|| format!("handlers[{idx}]"))?,
            );
            handlers.push((h.r#match.clone(), executor));
        }
        Self::with_executors(handlers)
    }

    /// Build from already constructed executors.
    pub fn with_executors(handlers: Vec<(MatchConfig, Arc<dyn Executor>)>) -> Result<Self> {
        let handlers = handlers
            .into_iter()
            .map(|(m, executor)| {
                let path_regex = m
                    .path_regex
                    .as_deref()
                    .map(Regex::new)
                    .transpose()
                    .with_context(|| format!("invalid path_regex {:?}", m.path_regex))?;
                Ok(CompiledHandler {
                    path_prefix: m.path_prefix,
                    path_regex,
                    host: m.host,
                    executor,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { handlers })
    }

    /// Route a request path. `host` is the Host header without its port.
    pub fn route(&self, path: &str, host: Option<&str>) -> Option<Route> {
        for h in &self.handlers {
            if let Some(prefix) = &h.path_prefix {
                let prefix = prefix.as_str();
                let boundary_ok = path == prefix
                    || (path.starts_with(prefix)
                        && (prefix.ends_with('/')
                            || path.as_bytes().get(prefix.len()) == Some(&b'/')));
                if !boundary_ok {
                    continue;
                }
            }
            if let Some(regex) = &h.path_regex {
                if !regex.is_match(path) {
                    continue;
                }
            }
            if let Some(expected_host) = &h.host {
                match host {
                    Some(actual) if actual.eq_ignore_ascii_case(expected_host) => {}
                    _ => continue,
                }
            }
            return Some(Route {
                executor: Arc::clone(&h.executor),
                prefix: h.path_prefix.clone(),
            });
        }
        None
    }
}
