use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request error: {source}")]
    RequestError {
        #[from]
        source: ParseError,
    },

    #[error("stream error: {source}")]
    StreamError {
        #[from]
        source: StreamError,
    },

    #[error("request already finished")]
    RequestFinished,
}

impl HttpError {
    pub fn request_finished() -> Self {
        Self::RequestFinished
    }
}

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("malformed request line: {line:?}")]
    MalformedRequestLine { line: String },

    #[error("malformed http version in request line: {token:?}")]
    MalformedVersion { token: String },

    #[error("invalid http method: {token:?}")]
    InvalidMethod { token: String },

    #[error("invalid request uri: {reason}")]
    InvalidUri { reason: String },

    #[error("invalid header line: {reason}")]
    InvalidHeader { reason: String },

    #[error("invalid content-length header: {reason}")]
    InvalidContentLength { reason: String },

    #[error("content-length {length} exceeds the buffer limit {max}")]
    BodyTooLarge { length: usize, max: usize },
}

impl ParseError {
    pub fn malformed_request_line<S: ToString>(line: S) -> Self {
        Self::MalformedRequestLine { line: line.to_string() }
    }

    pub fn malformed_version<S: ToString>(token: S) -> Self {
        Self::MalformedVersion { token: token.to_string() }
    }

    pub fn invalid_method<S: ToString>(token: S) -> Self {
        Self::InvalidMethod { token: token.to_string() }
    }

    pub fn invalid_uri<S: ToString>(reason: S) -> Self {
        Self::InvalidUri { reason: reason.to_string() }
    }

    pub fn invalid_header<S: ToString>(reason: S) -> Self {
        Self::InvalidHeader { reason: reason.to_string() }
    }

    pub fn invalid_content_length<S: ToString>(reason: S) -> Self {
        Self::InvalidContentLength { reason: reason.to_string() }
    }

    pub fn body_too_large(length: usize, max: usize) -> Self {
        Self::BodyTooLarge { length, max }
    }
}

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("stream is closed")]
    Closed,

    #[error("a read operation is already pending")]
    AlreadyReading,

    #[error("invalid utf-8 in stream at byte {offset}")]
    InvalidUtf8 { offset: usize },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl StreamError {
    pub fn closed() -> Self {
        Self::Closed
    }

    pub fn already_reading() -> Self {
        Self::AlreadyReading
    }

    pub fn invalid_utf8(offset: usize) -> Self {
        Self::InvalidUtf8 { offset }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}
