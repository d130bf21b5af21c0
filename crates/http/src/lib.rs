//! A single-process, event-driven HTTP/1.x server.
//!
//! This crate provides a small non-blocking web server built around a
//! readiness reactor: one loop thread multiplexes every socket, a fixed
//! worker pool runs read/write continuations, and each connection walks
//! the request cycle without ever blocking a thread on I/O.
//!
//! # Features
//!
//! - HTTP/1.0 and HTTP/1.1 with keep-alive
//! - Completion-callback streams with incremental UTF-8 decoding
//! - `Expect: 100-continue` handling
//! - Url-encoded and `multipart/form-data` body decoding
//! - Forwarded-header support behind trusted proxies
//! - Per-connection error containment
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tracing::info;
//! use tracing_subscriber::FmtSubscriber;
//! use vortex_http::handler::make_callback;
//! use vortex_http::server::HttpServer;
//!
//! fn main() -> std::io::Result<()> {
//!     let subscriber = FmtSubscriber::builder()
//!         .with_max_level(tracing::Level::INFO)
//!         .finish();
//!     tracing::subscriber::set_global_default(subscriber)
//!         .expect("setting default subscriber failed");
//!
//!     let callback = Arc::new(make_callback(|request| {
//!         info!(path = request.path(), "handling request");
//!         let body = "Hello World!\r\n";
//!         let head = format!(
//!             "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n",
//!             body.len()
//!         );
//!         request.write(head.as_bytes())?;
//!         request.write(body.as_bytes())?;
//!         request.finish()?;
//!         Ok(())
//!     }));
//!
//!     let server = HttpServer::new(callback)?;
//!     server.listen(8080)
//! }
//! ```
//!
//! # Architecture
//!
//! The crate is organized into several key modules:
//!
//! - [`reactor`]: readiness loop, interest registration, and worker pool
//! - [`stream`]: buffered completion-callback socket streams
//! - [`connection`]: the per-connection HTTP/1.x state machine
//! - [`server`]: listening socket and accept handling
//! - [`protocol`]: request model and error types
//! - [`httputil`]: header, query-string, and multipart parsing
//! - [`handler`]: the dispatch interface routing layers implement
//!
//! # Core Components
//!
//! ## Event loop
//!
//! [`reactor::Reactor`] owns the OS readiness multiplexer. Registrations
//! are one-shot: after an event fires for a socket, its handler must
//! register again to hear about the next one. Handlers submitted from
//! worker threads are queued and applied by the loop thread between
//! waits.
//!
//! ## Streams
//!
//! [`stream::IoStream`] turns raw non-blocking sockets into three
//! completion-driven operations: read until a delimiter, read an exact
//! byte count, and write. Text reads are UTF-8 decoded incrementally, so
//! multi-byte sequences split across packets never corrupt.
//!
//! ## Connections
//!
//! [`connection::HttpConnection`] parses the request line, headers, and
//! body, assembles a [`protocol::HttpRequest`], and dispatches it to the
//! configured [`handler::RequestCallback`]. The response flows back
//! through `request.write(..)` and `request.finish()`.
//!
//! # Limitations
//!
//! - HTTP/1.x only, one in-flight request per connection
//! - No TLS support (use a reverse proxy for HTTPS)
//! - No chunked transfer-encoding; bodies need `Content-Length`
//! - No request timeout: an idle client holds its connection open

pub mod connection;
pub mod handler;
pub mod httputil;
pub mod protocol;
pub mod reactor;
pub mod server;
pub mod stream;

mod utils;
