//! Core HTTP protocol types.
//!
//! This module defines the request model handed to dispatch callbacks and
//! the error taxonomy used across the crate.
//!
//! # Components
//!
//! - **Request model** ([`request`]):
//!   - [`HttpRequest`]: a fully parsed request, immutable once dispatched
//!   - [`UploadedFile`]: one file field from a `multipart/form-data` body
//!   - [`ResponseChannel`]: the write/finish contract a request answers
//!     through
//!
//! - **Error handling** ([`error`]):
//!   - [`HttpError`]: top-level error type
//!   - [`ParseError`]: request parsing errors
//!   - [`StreamError`]: socket stream errors

mod error;
pub use error::HttpError;
pub use error::ParseError;
pub use error::StreamError;

mod request;
pub use request::HttpRequest;
pub use request::ResponseChannel;
pub use request::UploadedFile;
pub(crate) use request::RequestParts;
