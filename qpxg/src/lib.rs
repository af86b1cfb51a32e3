//! qpxg: an HTTP/1.1 front end that runs CGI/1.1 scripts.

pub mod chunked;
pub mod config;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod meta;
pub mod request;
pub mod response;
pub mod router;
pub mod server;
