//! HTTP request model.
//!
//! A [`HttpRequest`] is assembled by the connection layer once the request
//! line, headers, and any body have all arrived. From the dispatch
//! callback's point of view it is read-only; the only way to affect the
//! connection is through [`HttpRequest::write`] and [`HttpRequest::finish`],
//! which delegate to the connection behind a [`ResponseChannel`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderMap, Method, Uri, Version};
use once_cell::sync::OnceCell;

use crate::protocol::HttpError;

/// One uploaded file from a `multipart/form-data` body.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub content_type: String,
    pub body: Bytes,
}

/// The response side of a connection, as seen by a request.
///
/// `write_response` may be called zero or more times, followed by exactly
/// one `finish_response`.
pub trait ResponseChannel: Send + Sync + fmt::Debug {
    fn write_response(&self, data: &[u8]) -> Result<(), HttpError>;
    fn finish_response(&self) -> Result<(), HttpError>;
}

/// Everything the connection layer has gathered about a request before
/// constructing the [`HttpRequest`] handed to dispatch.
pub(crate) struct RequestParts {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub arguments: HashMap<String, Vec<String>>,
    pub files: HashMap<String, UploadedFile>,
    /// Peer address of the socket, formatted.
    pub remote_ip: String,
    /// Honor forwarded headers for remote address and scheme.
    pub xheaders: bool,
}

/// A single HTTP request.
#[derive(Debug)]
pub struct HttpRequest {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
    remote_ip: String,
    protocol: String,
    host: String,
    arguments: HashMap<String, Vec<String>>,
    files: HashMap<String, UploadedFile>,
    connection: Arc<dyn ResponseChannel>,
    started_at: Instant,
    finished_at: OnceCell<Instant>,
}

impl HttpRequest {
    pub(crate) fn new(parts: RequestParts, connection: Arc<dyn ResponseChannel>) -> Self {
        let RequestParts { method, uri, version, headers, body, arguments, files, remote_ip, xheaders } = parts;

        // Behind a proxy the socket peer is the proxy itself; the real
        // client address and scheme then travel in forwarded headers.
        let (remote_ip, protocol) = if xheaders {
            // X-Forwarded-For accumulates one hop per proxy; only the
            // last entry was appended by the proxy we trust.
            let forwarded_ip = header_str(&headers, "x-real-ip")
                .or_else(|| {
                    header_str(&headers, "x-forwarded-for")
                        .and_then(|hops| hops.rsplit(',').next().map(|ip| ip.trim().to_owned()))
                })
                .unwrap_or(remote_ip);
            let scheme = header_str(&headers, "x-scheme").unwrap_or_else(|| "http".to_owned());
            (forwarded_ip, scheme)
        } else {
            (remote_ip, "http".to_owned())
        };
        let host = header_str(&headers, "host").unwrap_or_else(|| "127.0.0.1".to_owned());

        Self {
            method,
            uri,
            version,
            headers,
            body,
            remote_ip,
            protocol,
            host,
            arguments,
            files,
            connection,
            started_at: Instant::now(),
            finished_at: OnceCell::new(),
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Client address, or the forwarded one when configured to trust it.
    pub fn remote_ip(&self) -> &str {
        &self.remote_ip
    }

    /// `"http"` unless a trusted `X-Scheme` header said otherwise.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Value of the `Host` header, falling back to `127.0.0.1`.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    /// Query-string and form arguments merged, multiplicity preserved.
    pub fn arguments(&self) -> &HashMap<String, Vec<String>> {
        &self.arguments
    }

    /// Files uploaded through `multipart/form-data`, one per field name.
    pub fn files(&self) -> &HashMap<String, UploadedFile> {
        &self.files
    }

    pub fn supports_http_1_1(&self) -> bool {
        self.version == Version::HTTP_11
    }

    pub fn full_url(&self) -> String {
        format!("{}://{}{}", self.protocol, self.host, self.uri)
    }

    /// Time spent on this request so far, or its total duration once
    /// finished.
    pub fn request_time(&self) -> Duration {
        match self.finished_at.get() {
            Some(finished) => finished.duration_since(self.started_at),
            None => self.started_at.elapsed(),
        }
    }

    /// Queues response bytes on the connection.
    ///
    /// # Errors
    ///
    /// Fails when the response is already finished or the stream is gone.
    pub fn write(&self, data: &[u8]) -> Result<(), HttpError> {
        self.connection.write_response(data)
    }

    /// Completes the response. Exactly one call per request.
    ///
    /// # Errors
    ///
    /// Fails when the response is already finished.
    pub fn finish(&self) -> Result<(), HttpError> {
        self.connection.finish_response()?;
        let _ = self.finished_at.set(Instant::now());
        Ok(())
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|value| value.to_str().ok()).map(str::to_owned)
}
