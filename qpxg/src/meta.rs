//! CGI meta-variables (RFC 3875 section 4.1).

use http::header::{CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HOST};
use http::{HeaderMap, Version};
use std::collections::HashSet;

use crate::executor::ScriptTarget;
use crate::request::{connection_tokens, RequestHead};

/// Maximum number of HTTP_* variables exported to a script.
const MAX_HTTP_HEADERS: usize = 100;

pub const SERVER_SOFTWARE: &str = concat!("qpxg/", env!("CARGO_PKG_VERSION"));

/// The environment of one CGI invocation, in insertion order.
///
/// Built once per request by [`MetaVariableBuilder`] and never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaVariableSet {
    vars: Vec<(String, String)>,
}

impl MetaVariableSet {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// Typed builder for [`MetaVariableSet`]. Pure: performs no I/O.
pub struct MetaVariableBuilder<'a> {
    head: &'a RequestHead,
    script: &'a ScriptTarget,
    content_length: usize,
    passthrough: &'a [(String, String)],
}

impl<'a> MetaVariableBuilder<'a> {
    /// `content_length` is the byte count of the body the script will read on
    /// stdin, i.e. after any transfer coding has been removed.
    pub fn new(head: &'a RequestHead, script: &'a ScriptTarget, content_length: usize) -> Self {
        Self {
            head,
            script,
            content_length,
            passthrough: &[],
        }
    }

    /// Host environment values copied into the script environment. Request
    /// derived variables take precedence over them.
    pub fn passthrough(mut self, vars: &'a [(String, String)]) -> Self {
        self.passthrough = vars;
        self
    }

    pub fn build(self) -> MetaVariableSet {
        let mut env = Vars::default();
        let head = self.head;

        for (k, v) in self.passthrough {
            env.set(k, v.clone());
        }

        env.set("GATEWAY_INTERFACE", "CGI/1.1".into());
        env.set("SERVER_SOFTWARE", SERVER_SOFTWARE.into());
        env.set("SERVER_PROTOCOL", server_protocol(head.version).into());
        env.set("REQUEST_METHOD", head.method.as_str().into());
        env.set("SCRIPT_NAME", self.script.script_name.clone());
        env.set("PATH_INFO", self.script.path_info.clone());
        env.set("QUERY_STRING", head.uri.query().unwrap_or("").into());
        env.set(
            "SCRIPT_FILENAME",
            self.script.filename.to_string_lossy().into_owned(),
        );
        env.set(
            "DOCUMENT_ROOT",
            self.script.document_root.to_string_lossy().into_owned(),
        );
        env.set("REDIRECT_STATUS", "200".into());

        let (server_name, server_port) = server_name_port(head);
        env.set("SERVER_NAME", server_name);
        env.set("SERVER_PORT", server_port);
        if let Some(remote) = head.remote_addr {
            env.set("REMOTE_ADDR", remote.ip().to_string());
            env.set("REMOTE_PORT", remote.port().to_string());
        }

        if self.content_length > 0 {
            env.set("CONTENT_LENGTH", self.content_length.to_string());
        }
        if let Some(ct) = head.headers.get(CONTENT_TYPE) {
            env.set("CONTENT_TYPE", lossy(ct.as_bytes()));
        }

        export_http_headers(&mut env, &head.headers);

        MetaVariableSet { vars: env.vars }
    }
}

#[derive(Default)]
struct Vars {
    vars: Vec<(String, String)>,
}

impl Vars {
    fn set(&mut self, name: &str, value: String) {
        match self.vars.iter_mut().find(|(k, _)| k == name) {
            Some((_, v)) => *v = value,
            None => self.vars.push((name.to_string(), value)),
        }
    }

    fn join(&mut self, name: String, value: String, sep: &str) -> bool {
        match self.vars.iter_mut().find(|(k, _)| *k == name) {
            Some((_, v)) => {
                v.push_str(sep);
                v.push_str(&value);
                false
            }
            None => {
                self.vars.push((name, value));
                true
            }
        }
    }
}

// HTTP_* variables (RFC 3875 section 4.1.18). Repeated fields collapse into one
// variable; framing and hop-by-hop fields are not forwarded.
fn export_http_headers(env: &mut Vars, headers: &HeaderMap) {
    let connection: HashSet<String> = connection_tokens(headers).into_iter().collect();
    let mut exported = 0usize;
    for (name, value) in headers {
        let name = name.as_str();
        if name == CONTENT_LENGTH || name == CONTENT_TYPE {
            continue;
        }
        if is_hop_by_hop_header(name) || connection.contains(name) {
            continue;
        }
        let sep = if name == COOKIE { "; " } else { ", " };
        let key = http_variable_name(name);
        let is_new = env.join(key, lossy(value.as_bytes()), sep);
        if is_new {
            exported += 1;
            if exported >= MAX_HTTP_HEADERS {
                break;
            }
        }
    }
}

/// `HTTP_` followed by the field name upper-cased, with every character other
/// than an ASCII letter or digit replaced by `_`.
pub fn http_variable_name(header: &str) -> String {
    let mut out = String::with_capacity(5 + header.len());
    out.push_str("HTTP_");
    out.extend(header.chars().map(|c| {
        if c.is_ascii_alphanumeric() {
            c.to_ascii_uppercase()
        } else {
            '_'
        }
    }));
    out
}

fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy"
            | "proxy-connection"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-authentication-info"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn server_protocol(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

fn server_name_port(head: &RequestHead) -> (String, String) {
    let fallback_port = head
        .local_addr
        .map(|a| a.port())
        .unwrap_or(80)
        .to_string();
    let authority = head
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| head.uri.authority().map(|a| a.as_str()));
    match authority.map(host_port) {
        Some((Some(host), port)) => (host, port.map_or(fallback_port, |p| p.to_string())),
        _ => {
            let host = head
                .local_addr
                .map(|a| a.ip().to_string())
                .unwrap_or_else(|| "localhost".to_string());
            (host, fallback_port)
        }
    }
}

fn host_port(authority: &str) -> (Option<String>, Option<u16>) {
    let authority = authority.trim();
    if authority.is_empty() {
        return (None, None);
    }
    if let Some(v6) = authority.strip_prefix('[') {
        let Some(end) = v6.find(']') else {
            return (None, None);
        };
        let port = v6[end + 1..]
            .strip_prefix(':')
            .and_then(|p| p.parse::<u16>().ok());
        return (Some(v6[..end].to_string()), port);
    }
    match authority.rsplit_once(':') {
        Some((h, p)) => (Some(h.to_string()), p.parse::<u16>().ok()),
        None => (Some(authority.to_string()), None),
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderValue, Method, Uri};
    use std::path::PathBuf;

    fn target() -> ScriptTarget {
        ScriptTarget {
            script_name: "/cgi-bin/test_post.py".into(),
            path_info: "/extra".into(),
            filename: PathBuf::from("/srv/www/cgi-bin/test_post.py"),
            document_root: PathBuf::from("/srv/www"),
            interpreter: None,
        }
    }

    fn post(headers: &[(&'static str, &'static str)]) -> RequestHead {
        let mut head = RequestHead::new(
            Method::POST,
            Uri::from_static("/cgi-bin/test_post.py/extra?x=1&y=%20"),
        );
        for &(k, v) in headers {
            head.headers.append(k, HeaderValue::from_static(v));
        }
        head.remote_addr = Some("192.0.2.7:51000".parse().unwrap());
        head.local_addr = Some("127.0.0.1:8080".parse().unwrap());
        head
    }

    #[test]
    fn builds_required_variables() {
        let head = post(&[
            ("host", "example.test:8443"),
            ("content-type", "application/x-www-form-urlencoded"),
        ]);
        let script = target();
        let env = MetaVariableBuilder::new(&head, &script, 7).build();

        assert_eq!(env.get("REQUEST_METHOD"), Some("POST"));
        assert_eq!(env.get("SCRIPT_NAME"), Some("/cgi-bin/test_post.py"));
        assert_eq!(env.get("PATH_INFO"), Some("/extra"));
        assert_eq!(env.get("QUERY_STRING"), Some("x=1&y=%20"));
        assert_eq!(env.get("CONTENT_LENGTH"), Some("7"));
        assert_eq!(
            env.get("CONTENT_TYPE"),
            Some("application/x-www-form-urlencoded")
        );
        assert_eq!(env.get("SERVER_NAME"), Some("example.test"));
        assert_eq!(env.get("SERVER_PORT"), Some("8443"));
        assert_eq!(env.get("REMOTE_ADDR"), Some("192.0.2.7"));
        assert_eq!(env.get("GATEWAY_INTERFACE"), Some("CGI/1.1"));
        assert_eq!(env.get("SERVER_PROTOCOL"), Some("HTTP/1.1"));
        assert_eq!(env.get("HTTP_HOST"), Some("example.test:8443"));
        assert_eq!(env.get("HTTP_CONTENT_TYPE"), None);
    }

    #[test]
    fn content_length_comes_from_decoded_body_not_headers() {
        let head = post(&[("content-length", "999"), ("transfer-encoding", "chunked")]);
        let script = target();
        let env = MetaVariableBuilder::new(&head, &script, 7).build();
        assert_eq!(env.get("CONTENT_LENGTH"), Some("7"));
        assert_eq!(env.get("HTTP_CONTENT_LENGTH"), None);
        assert_eq!(env.get("HTTP_TRANSFER_ENCODING"), None);

        let env = MetaVariableBuilder::new(&head, &script, 0).build();
        assert_eq!(env.get("CONTENT_LENGTH"), None);
        assert_eq!(env.get("CONTENT_TYPE"), None);
    }

    #[test]
    fn repeated_headers_collapse_into_one_variable() {
        let head = post(&[
            ("accept", "text/html"),
            ("accept", "application/json"),
            ("cookie", "a=1"),
            ("cookie", "b=2"),
        ]);
        let script = target();
        let env = MetaVariableBuilder::new(&head, &script, 0).build();
        assert_eq!(env.get("HTTP_ACCEPT"), Some("text/html, application/json"));
        assert_eq!(env.get("HTTP_COOKIE"), Some("a=1; b=2"));
        assert_eq!(env.iter().filter(|(k, _)| *k == "HTTP_ACCEPT").count(), 1);
    }

    #[test]
    fn names_are_sanitised() {
        assert_eq!(http_variable_name("x-forwarded-for"), "HTTP_X_FORWARDED_FOR");
        assert_eq!(http_variable_name("x.custom~1"), "HTTP_X_CUSTOM_1");
    }

    #[test]
    fn hop_by_hop_and_connection_listed_headers_are_skipped() {
        let head = post(&[
            ("connection", "keep-alive, x-secret"),
            ("x-secret", "s"),
            ("upgrade", "websocket"),
            ("x-kept", "k"),
        ]);
        let script = target();
        let env = MetaVariableBuilder::new(&head, &script, 0).build();
        assert_eq!(env.get("HTTP_CONNECTION"), None);
        assert_eq!(env.get("HTTP_X_SECRET"), None);
        assert_eq!(env.get("HTTP_UPGRADE"), None);
        assert_eq!(env.get("HTTP_X_KEPT"), Some("k"));
    }

    #[test]
    fn request_values_override_passthrough() {
        let head = post(&[]);
        let script = target();
        let passthrough = vec![
            ("PATH".to_string(), "/usr/bin:/bin".to_string()),
            ("REQUEST_METHOD".to_string(), "BOGUS".to_string()),
        ];
        let env = MetaVariableBuilder::new(&head, &script, 0)
            .passthrough(&passthrough)
            .build();
        assert_eq!(env.get("PATH"), Some("/usr/bin:/bin"));
        assert_eq!(env.get("REQUEST_METHOD"), Some("POST"));
    }

    #[test]
    fn server_name_falls_back_to_local_address() {
        let head = post(&[]);
        let script = target();
        let env = MetaVariableBuilder::new(&head, &script, 0).build();
        assert_eq!(env.get("SERVER_NAME"), Some("127.0.0.1"));
        assert_eq!(env.get("SERVER_PORT"), Some("8080"));

        let head = post(&[("host", "[::1]:9000")]);
        let env = MetaVariableBuilder::new(&head, &script, 0).build();
        assert_eq!(env.get("SERVER_NAME"), Some("::1"));
        assert_eq!(env.get("SERVER_PORT"), Some("9000"));
    }

    #[test]
    fn same_input_builds_same_set() {
        let head = post(&[("x-a", "1"), ("x-b", "2")]);
        let script = target();
        let a = MetaVariableBuilder::new(&head, &script, 3).build();
        let b = MetaVariableBuilder::new(&head, &script, 3).build();
        assert_eq!(a, b);
    }
}
