//! HTTP server entry point.
//!
//! [`HttpServer`] owns the listening socket and the reactor. It binds a
//! port, registers accept interest, and turns every accepted socket into
//! an [`crate::stream::IoStream`] driven by an
//! [`crate::connection::HttpConnection`].
//!
//! # Components
//!
//! - [`HttpServer`]: binds, accepts, and hands connections off
//! - [`ServerOptions`]: keep-alive, forwarded-header, body-size, and
//!   worker-count knobs
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use vortex_http::handler::make_callback;
//! use vortex_http::server::HttpServer;
//!
//! fn main() -> std::io::Result<()> {
//!     let callback = Arc::new(make_callback(|request| {
//!         request.write(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")?;
//!         request.finish()?;
//!         Ok(())
//!     }));
//!     let server = HttpServer::new(callback)?;
//!     server.listen(8080)
//! }
//! ```

mod http_server;

pub use http_server::HttpServer;
pub use http_server::ServerOptions;
