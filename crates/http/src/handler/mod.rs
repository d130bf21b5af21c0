//! Request dispatch interface.
//!
//! The connection layer hands every fully parsed request to a
//! [`RequestCallback`]. Routing frameworks implement the trait directly;
//! plain functions and closures go through [`make_callback`].

use std::sync::Arc;

use crate::protocol::HttpRequest;
use crate::reactor::BoxError;

/// The dispatch boundary between the connection layer and routing.
///
/// `execute` is invoked once per fully parsed request and must eventually
/// cause `request.write(..)` zero or more times followed by exactly one
/// `request.finish()`. Returning an error closes the connection.
pub trait RequestCallback: Send + Sync {
    fn execute(&self, request: Arc<HttpRequest>) -> Result<(), BoxError>;
}

#[derive(Debug)]
pub struct CallbackFn<F> {
    f: F,
}

impl<F> RequestCallback for CallbackFn<F>
where
    F: Fn(Arc<HttpRequest>) -> Result<(), BoxError> + Send + Sync,
{
    fn execute(&self, request: Arc<HttpRequest>) -> Result<(), BoxError> {
        (self.f)(request)
    }
}

/// Wraps a function or closure as a [`RequestCallback`].
pub fn make_callback<F>(f: F) -> CallbackFn<F>
where
    F: Fn(Arc<HttpRequest>) -> Result<(), BoxError> + Send + Sync,
{
    CallbackFn { f }
}
