use std::error::Error;
use std::fmt;

use http::StatusCode;

/// An error that renders as an HTTP status page when returned from a
/// request handler.
///
/// The optional `log_message` is written to the server log and never sent
/// to the client.
#[derive(Debug)]
pub struct HttpError {
    pub status: u16,
    pub log_message: Option<String>,
}

impl HttpError {
    /// A status-only error, e.g. `HttpError::new(404)`.
    pub fn new(status: u16) -> Self {
        Self { status, log_message: None }
    }

    /// An error carrying an operator-facing log message.
    pub fn with_log(status: u16, log_message: impl Into<String>) -> Self {
        Self { status, log_message: Some(log_message.into()) }
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = reason_phrase(self.status).unwrap_or("Unknown");
        write!(f, "HTTP {}: {reason}", self.status)?;
        if let Some(log_message) = &self.log_message {
            write!(f, " ({log_message})")?;
        }
        Ok(())
    }
}

impl Error for HttpError {}

/// Canonical reason phrase for a status code, `None` when the code is not
/// a recognized HTTP status.
pub(crate) fn reason_phrase(status: u16) -> Option<&'static str> {
    StatusCode::from_u16(status).ok().and_then(|code| code.canonical_reason())
}
