//! Per-request handler surface.
//!
//! A [`RequestHandler`] implements one hook per HTTP method it supports;
//! every other method answers `405 Method Not Allowed`. The
//! [`HandlerContext`] passed to each hook accumulates the response (status
//! code, headers, body buffer) and flushes it through the underlying
//! request on [`HandlerContext::finish`].

use std::sync::Arc;
use std::time::SystemTime;

use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::Version;
use tracing::error;
use vortex_http::protocol::HttpRequest;
use vortex_http::reactor::BoxError;

use crate::error::{reason_phrase, HttpError};

const SERVER_NAME: &str = concat!("vortex/", env!("CARGO_PKG_VERSION"));

/// Response header values longer than this are rejected as unsafe.
const MAX_HEADER_VALUE_LEN: usize = 4000;

/// Implement this for each resource, overriding the hooks for the methods
/// it supports. A fresh handler instance is created for every request, so
/// fields hold per-request state.
///
/// `prepare` runs before the method hook; finishing the response there
/// skips the hook entirely.
pub trait RequestHandler {
    fn prepare(&mut self, context: &mut HandlerContext) -> Result<(), BoxError> {
        let _ = context;
        Ok(())
    }

    fn head(&mut self, context: &mut HandlerContext) -> Result<(), BoxError> {
        let _ = context;
        Err(HttpError::new(405).into())
    }

    fn get(&mut self, context: &mut HandlerContext) -> Result<(), BoxError> {
        let _ = context;
        Err(HttpError::new(405).into())
    }

    fn post(&mut self, context: &mut HandlerContext) -> Result<(), BoxError> {
        let _ = context;
        Err(HttpError::new(405).into())
    }

    fn delete(&mut self, context: &mut HandlerContext) -> Result<(), BoxError> {
        let _ = context;
        Err(HttpError::new(405).into())
    }

    fn put(&mut self, context: &mut HandlerContext) -> Result<(), BoxError> {
        let _ = context;
        Err(HttpError::new(405).into())
    }
}

/// The response under construction for one request.
///
/// Writes are buffered until [`finish`](Self::finish), which emits the
/// status line, the response headers, a `Content-Length` computed from the
/// buffer, and the body, then completes the request.
#[derive(Debug)]
pub struct HandlerContext {
    request: Arc<HttpRequest>,
    status: u16,
    headers: HeaderMap,
    write_buffer: Vec<u8>,
    headers_written: bool,
    finished: bool,
}

impl HandlerContext {
    pub fn new(request: Arc<HttpRequest>) -> Self {
        let mut context = Self {
            request,
            status: 200,
            headers: HeaderMap::new(),
            write_buffer: Vec::new(),
            headers_written: false,
            finished: false,
        };
        context.clear();
        context
    }

    /// The request being answered.
    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    /// Resets all headers and content for this response.
    ///
    /// `Server`, `Content-Type` and `Date` get their default values, and
    /// `Connection: Keep-Alive` is echoed back to HTTP/1.1 clients that
    /// sent it.
    pub fn clear(&mut self) {
        self.headers = HeaderMap::new();
        self.headers.insert(header::SERVER, HeaderValue::from_static(SERVER_NAME));
        self.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=UTF-8"),
        );
        let date = httpdate::fmt_http_date(SystemTime::now());
        self.headers.insert(
            header::DATE,
            HeaderValue::from_str(&date).expect("formatted date is a valid header value"),
        );
        if self.request.supports_http_1_1() && self.client_requested_keep_alive() {
            self.headers.insert(header::CONNECTION, HeaderValue::from_static("Keep-Alive"));
        }
        self.write_buffer.clear();
        self.status = 200;
    }

    fn client_requested_keep_alive(&self) -> bool {
        self.request
            .headers()
            .get(header::CONNECTION)
            .is_some_and(|value| value.as_bytes() == b"Keep-Alive")
    }

    /// Sets the response status code. The code must be a recognized HTTP
    /// status.
    pub fn set_status(&mut self, status: u16) -> Result<(), HttpError> {
        if reason_phrase(status).is_none() {
            return Err(HttpError::with_log(500, format!("unknown status code {status}")));
        }
        self.status = status;
        Ok(())
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// Sets a response header, replacing any previous value.
    ///
    /// Values containing control characters or longer than 4000 bytes are
    /// rejected rather than silently mangled.
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<(), HttpError> {
        let safe = value.replace(|c: char| c <= '\u{001f}', " ");
        if safe != value || safe.len() > MAX_HEADER_VALUE_LEN {
            return Err(HttpError::with_log(500, format!("unsafe header value for {name}")));
        }
        let name = match name.parse::<HeaderName>() {
            Ok(name) => name,
            Err(cause) => {
                return Err(HttpError::with_log(
                    500,
                    format!("invalid header name {name:?}: {cause}"),
                ));
            }
        };
        let value = match HeaderValue::from_bytes(safe.as_bytes()) {
            Ok(value) => value,
            Err(cause) => {
                return Err(HttpError::with_log(
                    500,
                    format!("invalid header value for {name}: {cause}"),
                ));
            }
        };
        self.headers.insert(name, value);
        Ok(())
    }

    /// Returns the last value of the named request argument, or a `404`
    /// error when the argument is absent.
    pub fn argument(&self, name: &str) -> Result<String, HttpError> {
        match self.arguments(name).pop() {
            Some(value) => Ok(value),
            None => Err(HttpError::with_log(404, format!("Missing Argument {name}"))),
        }
    }

    /// Returns the last value of the named request argument, or `default`
    /// when the argument is absent.
    pub fn argument_or(&self, name: &str, default: &str) -> String {
        self.arguments(name).pop().unwrap_or_else(|| default.to_owned())
    }

    /// All values of the named request argument, with stray control
    /// characters replaced by spaces and surrounding whitespace trimmed.
    pub fn arguments(&self, name: &str) -> Vec<String> {
        self.request
            .arguments()
            .get(name)
            .map(|values| values.iter().map(|value| scrub_argument(value)).collect())
            .unwrap_or_default()
    }

    /// Appends a chunk to the response body buffer.
    pub fn write(&mut self, chunk: impl AsRef<[u8]>) {
        self.write_buffer.extend_from_slice(chunk.as_ref());
    }

    /// Emits the buffered response and completes the request.
    pub fn finish(&mut self) -> Result<(), BoxError> {
        if self.finished {
            return Err(HttpError::with_log(500, "finish called twice").into());
        }
        if !self.headers_written {
            if !self.headers.contains_key(header::CONTENT_LENGTH) {
                self.headers
                    .insert(header::CONTENT_LENGTH, HeaderValue::from(self.write_buffer.len()));
            }
            let head = self.render_head();
            self.headers_written = true;
            self.request.write(&head)?;
        }
        if !self.write_buffer.is_empty() {
            self.request.write(&self.write_buffer)?;
        }
        self.request.finish()?;
        self.finished = true;
        Ok(())
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Replaces the response with the standard error page for `status`.
    ///
    /// Once headers are on the wire no page can be sent; the response is
    /// completed as-is in that case.
    pub fn send_error(&mut self, status: u16) -> Result<(), BoxError> {
        if self.headers_written {
            error!("cannot send error response after headers written");
            if !self.finished {
                self.finish()?;
            }
            return Ok(());
        }
        self.clear();
        self.set_status(status)?;
        let reason = reason_phrase(self.status).unwrap_or("Unknown");
        self.write(format!(
            "<html><title>{status}: {reason}</title><body>{status}: {reason}</body></html>"
        ));
        self.finish()
    }

    fn render_head(&self) -> Vec<u8> {
        let version =
            if self.request.version() == Version::HTTP_10 { "HTTP/1.0" } else { "HTTP/1.1" };
        let reason = reason_phrase(self.status).unwrap_or("Unknown");
        let mut head = format!("{version} {} {reason}\r\n", self.status).into_bytes();
        for (name, value) in &self.headers {
            head.extend_from_slice(name.as_str().as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }
        head.extend_from_slice(b"\r\n");
        head
    }
}

fn scrub_argument(value: &str) -> String {
    value
        .replace(
            |c: char| matches!(c, '\u{0000}'..='\u{0008}' | '\u{000e}'..='\u{001f}'),
            " ",
        )
        .trim()
        .to_owned()
}
