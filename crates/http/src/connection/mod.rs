//! HTTP connection handling module.
//!
//! This module drives one TCP connection through the HTTP/1.x request
//! cycle: read the header block, read the body when one is announced,
//! dispatch the assembled request, write the response, then either close
//! or wait for the next request on the same socket.
//!
//! # Components
//!
//! - [`HttpConnection`]: connection handler that
//!   - parses request lines and header blocks
//!   - enforces the configured body size limit
//!   - answers `Expect: 100-continue` before reading the body
//!   - decodes url-encoded and multipart form bodies into arguments
//!   - decides keep-alive per protocol version and `Connection` header
//!
//! # Features
//!
//! - Completion-driven I/O, never blocking a thread on a socket
//! - Keep-alive connection reuse
//! - Forwarded-header support behind trusted proxies
//! - Per-connection error containment

mod http_connection;

pub use http_connection::HttpConnection;
