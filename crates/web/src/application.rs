//! Route table and request dispatch.
//!
//! An [`Application`] maps URI path patterns to handler factories and
//! implements [`RequestCallback`], so it plugs directly into
//! `HttpServer`. For every dispatched request it creates a fresh handler,
//! runs the `prepare` hook and the method hook, auto-finishes the
//! response, and converts errors into HTML status pages.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, warn};
use vortex_http::handler::RequestCallback;
use vortex_http::protocol::HttpRequest;
use vortex_http::reactor::BoxError;

use crate::error::{reason_phrase, HttpError};
use crate::handler::{HandlerContext, RequestHandler};

type HandlerFactory = Box<dyn Fn() -> Box<dyn RequestHandler> + Send + Sync>;

/// Maps request paths to handlers.
///
/// ```no_run
/// use std::sync::Arc;
///
/// use vortex_http::reactor::BoxError;
/// use vortex_http::server::HttpServer;
/// use vortex_web::{Application, HandlerContext, RequestHandler};
///
/// struct HelloHandler;
///
/// impl RequestHandler for HelloHandler {
///     fn get(&mut self, context: &mut HandlerContext) -> Result<(), BoxError> {
///         context.write("Hello World!\r\n");
///         Ok(())
///     }
/// }
///
/// fn main() -> std::io::Result<()> {
///     let application = Application::builder()
///         .route("/", || HelloHandler)
///         .build()
///         .expect("routes are valid");
///     HttpServer::new(Arc::new(application))?.listen(8080)
/// }
/// ```
pub struct Application {
    router: matchit::Router<HandlerFactory>,
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application").finish_non_exhaustive()
    }
}

impl Application {
    pub fn builder() -> ApplicationBuilder {
        ApplicationBuilder { routes: Vec::new() }
    }
}

pub struct ApplicationBuilder {
    routes: Vec<(String, HandlerFactory)>,
}

impl fmt::Debug for ApplicationBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationBuilder").field("routes", &self.routes.len()).finish()
    }
}

impl ApplicationBuilder {
    /// Maps a path pattern to a handler factory. The factory runs once per
    /// matched request, so every handler starts from fresh state.
    pub fn route<H, F>(mut self, path: impl Into<String>, factory: F) -> Self
    where
        H: RequestHandler + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.routes.push((path.into(), Box::new(move || Box::new(factory()))));
        self
    }

    pub fn build(self) -> Result<Application, ApplicationBuildError> {
        let mut router = matchit::Router::new();
        for (path, factory) in self.routes {
            router.insert(path, factory)?;
        }
        Ok(Application { router })
    }
}

#[derive(Debug, Error)]
pub enum ApplicationBuildError {
    #[error("invalid route pattern: {0}")]
    InvalidRoute(#[from] matchit::InsertError),
}

impl RequestCallback for Application {
    fn execute(&self, request: Arc<HttpRequest>) -> Result<(), BoxError> {
        let mut context = HandlerContext::new(Arc::clone(&request));
        let outcome = match self.router.at(request.path()) {
            Ok(matched) => {
                let mut handler = (matched.value)();
                run_handler(handler.as_mut(), &mut context)
            }
            Err(_) => Err(HttpError::new(404).into()),
        };
        match outcome {
            Ok(()) => Ok(()),
            Err(cause) => handle_exception(&mut context, &cause),
        }
    }
}

/// One full handler cycle: the method support check, `prepare`, the method
/// hook, then an automatic `finish` when the handler left the response
/// open.
fn run_handler(
    handler: &mut dyn RequestHandler,
    context: &mut HandlerContext,
) -> Result<(), BoxError> {
    let method = context.request().method().clone();
    if !matches!(method.as_str(), "GET" | "HEAD" | "POST" | "DELETE" | "PUT") {
        return Err(HttpError::new(405).into());
    }
    handler.prepare(context)?;
    if context.finished() {
        return Ok(());
    }
    match method.as_str() {
        "GET" => handler.get(context)?,
        "HEAD" => handler.head(context)?,
        "POST" => handler.post(context)?,
        "DELETE" => handler.delete(context)?,
        "PUT" => handler.put(context)?,
        _ => return Err(HttpError::new(405).into()),
    }
    if !context.finished() {
        context.finish()?;
    }
    Ok(())
}

/// Turns a handler error into a status page: [`HttpError`] renders its own
/// status, anything else renders `500`.
fn handle_exception(context: &mut HandlerContext, cause: &BoxError) -> Result<(), BoxError> {
    if let Some(http_error) = cause.downcast_ref::<HttpError>() {
        if let Some(message) = &http_error.log_message {
            warn!(
                status = http_error.status,
                method = %context.request().method(),
                path = context.request().path(),
                remote_ip = context.request().remote_ip(),
                "{message}"
            );
        }
        if reason_phrase(http_error.status).is_some() {
            context.send_error(http_error.status)
        } else {
            error!(status = http_error.status, "bad http status code");
            context.send_error(500)
        }
    } else {
        error!(
            cause = %cause,
            method = %context.request().method(),
            path = context.request().path(),
            remote_ip = context.request().remote_ip(),
            "uncaught handler exception"
        );
        context.send_error(500)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::thread;

    use vortex_http::connection::HttpConnection;
    use vortex_http::reactor::Reactor;
    use vortex_http::server::ServerOptions;
    use vortex_http::stream::IoStream;

    use super::*;

    struct EchoHandler;

    impl RequestHandler for EchoHandler {
        fn get(&mut self, context: &mut HandlerContext) -> Result<(), BoxError> {
            let name = context.argument_or("name", "nobody");
            context.write(format!("get {name}"));
            Ok(())
        }

        fn post(&mut self, context: &mut HandlerContext) -> Result<(), BoxError> {
            let name = context.argument("name")?;
            context.write(format!("post {name}"));
            Ok(())
        }
    }

    struct CreatedHandler;

    impl RequestHandler for CreatedHandler {
        fn get(&mut self, context: &mut HandlerContext) -> Result<(), BoxError> {
            context.set_status(201)?;
            context.set_header("x-card", "7")?;
            context.write("made");
            Ok(())
        }
    }

    struct FailingHandler;

    impl RequestHandler for FailingHandler {
        fn get(&mut self, context: &mut HandlerContext) -> Result<(), BoxError> {
            let _ = context;
            Err(HttpError::with_log(403, "not for you").into())
        }

        fn post(&mut self, context: &mut HandlerContext) -> Result<(), BoxError> {
            let _ = context;
            Err("boom".into())
        }

        fn put(&mut self, context: &mut HandlerContext) -> Result<(), BoxError> {
            context.set_header("x-bad", "a\nb")?;
            Ok(())
        }
    }

    struct PreparedHandler;

    impl RequestHandler for PreparedHandler {
        fn prepare(&mut self, context: &mut HandlerContext) -> Result<(), BoxError> {
            context.write("from prepare");
            context.finish()
        }

        fn get(&mut self, context: &mut HandlerContext) -> Result<(), BoxError> {
            context.write("from get");
            Ok(())
        }
    }

    fn application() -> Application {
        Application::builder()
            .route("/", || EchoHandler)
            .route("/created", || CreatedHandler)
            .route("/failing", || FailingHandler)
            .route("/prepared", || PreparedHandler)
            .build()
            .expect("routes are valid")
    }

    fn connect(application: Application) -> UnixStream {
        let reactor = Reactor::with_workers(2).expect("reactor");
        let running = Arc::clone(&reactor);
        thread::spawn(move || running.start());

        let (local, peer) = UnixStream::pair().expect("socket pair");
        local.set_nonblocking(true).expect("nonblocking");
        let stream = IoStream::new(local, reactor);
        HttpConnection::attach(
            stream,
            "test-peer".to_owned(),
            ServerOptions::default(),
            Arc::new(application),
        )
        .expect("attach");
        peer
    }

    /// Reads one response, returning the head (status line plus headers)
    /// and the body as declared by `Content-Length`.
    fn read_response(peer: &mut UnixStream) -> (String, String) {
        let mut head = Vec::new();
        let mut byte = [0_u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            peer.read_exact(&mut byte).expect("response head");
            head.push(byte[0]);
        }
        let head = String::from_utf8(head).expect("head is utf-8");
        let content_length = head
            .lines()
            .find_map(|line| line.to_ascii_lowercase().strip_prefix("content-length:").map(str::to_owned))
            .expect("content-length header")
            .trim()
            .parse::<usize>()
            .expect("content-length value");
        let mut body = vec![0_u8; content_length];
        peer.read_exact(&mut body).expect("response body");
        (head, String::from_utf8_lossy(&body).into_owned())
    }

    fn error_page(status: u16, reason: &str) -> String {
        format!("<html><title>{status}: {reason}</title><body>{status}: {reason}</body></html>")
    }

    #[test]
    fn get_runs_the_handler_and_auto_finishes() {
        let mut peer = connect(application());
        peer.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").expect("send");

        let (head, body) = read_response(&mut peer);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head: {head}");
        let lowered = head.to_ascii_lowercase();
        assert!(lowered.contains("\r\nserver: vortex/"));
        assert!(lowered.contains("\r\ncontent-type: text/html; charset=utf-8"));
        assert!(lowered.contains("\r\ndate: "));
        assert_eq!(body, "get nobody");
    }

    #[test]
    fn query_arguments_reach_the_handler() {
        let mut peer = connect(application());
        peer.write_all(b"GET /?name=ada&name=zed%01 HTTP/1.1\r\nHost: x\r\n\r\n").expect("send");

        let (_, body) = read_response(&mut peer);
        // last value wins and the control character is scrubbed away
        assert_eq!(body, "get zed");
    }

    #[test]
    fn missing_argument_renders_the_404_page() {
        let mut peer = connect(application());
        peer.write_all(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n").expect("send");

        let (head, body) = read_response(&mut peer);
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"), "head: {head}");
        assert_eq!(body, error_page(404, "Not Found"));
    }

    #[test]
    fn post_body_arguments_reach_the_handler() {
        let mut peer = connect(application());
        peer.write_all(
            b"POST / HTTP/1.1\r\nHost: x\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\
              Content-Length: 8\r\n\r\nname=bob",
        )
        .expect("send");

        let (head, body) = read_response(&mut peer);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head: {head}");
        assert_eq!(body, "post bob");
    }

    #[test]
    fn unmatched_path_renders_the_404_page() {
        let mut peer = connect(application());
        peer.write_all(b"GET /missing HTTP/1.1\r\nHost: x\r\n\r\n").expect("send");

        let (head, body) = read_response(&mut peer);
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"), "head: {head}");
        assert_eq!(body, error_page(404, "Not Found"));
    }

    #[test]
    fn unimplemented_method_renders_the_405_page() {
        let mut peer = connect(application());
        peer.write_all(b"DELETE / HTTP/1.1\r\nHost: x\r\n\r\n").expect("send");

        let (head, body) = read_response(&mut peer);
        assert!(head.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"), "head: {head}");
        assert_eq!(body, error_page(405, "Method Not Allowed"));
    }

    #[test]
    fn unsupported_method_renders_the_405_page() {
        let mut peer = connect(application());
        peer.write_all(b"PATCH / HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n").expect("send");

        let (head, body) = read_response(&mut peer);
        assert!(head.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"), "head: {head}");
        assert_eq!(body, error_page(405, "Method Not Allowed"));
    }

    #[test]
    fn http_error_maps_to_its_status_page() {
        let mut peer = connect(application());
        peer.write_all(b"GET /failing HTTP/1.1\r\nHost: x\r\n\r\n").expect("send");

        let (head, body) = read_response(&mut peer);
        assert!(head.starts_with("HTTP/1.1 403 Forbidden\r\n"), "head: {head}");
        assert_eq!(body, error_page(403, "Forbidden"));
    }

    #[test]
    fn unknown_handler_error_renders_the_500_page() {
        let mut peer = connect(application());
        peer.write_all(b"POST /failing HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n")
            .expect("send");

        let (head, body) = read_response(&mut peer);
        assert!(head.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "head: {head}");
        assert_eq!(body, error_page(500, "Internal Server Error"));
    }

    #[test]
    fn unsafe_header_value_renders_the_500_page() {
        let mut peer = connect(application());
        peer.write_all(b"PUT /failing HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n")
            .expect("send");

        let (head, body) = read_response(&mut peer);
        assert!(head.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "head: {head}");
        assert_eq!(body, error_page(500, "Internal Server Error"));
    }

    #[test]
    fn custom_status_and_headers_flow_through() {
        let mut peer = connect(application());
        peer.write_all(b"GET /created HTTP/1.1\r\nHost: x\r\n\r\n").expect("send");

        let (head, body) = read_response(&mut peer);
        assert!(head.starts_with("HTTP/1.1 201 Created\r\n"), "head: {head}");
        assert!(head.to_ascii_lowercase().contains("\r\nx-card: 7\r\n"));
        assert_eq!(body, "made");
    }

    #[test]
    fn keep_alive_is_echoed_to_http_11_clients_that_sent_it() {
        let mut peer = connect(application());
        peer.write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: Keep-Alive\r\n\r\n")
            .expect("send");

        let (head, _) = read_response(&mut peer);
        assert!(head.contains("\r\nconnection: Keep-Alive\r\n"), "head: {head}");

        // the connection stays usable for a second request
        peer.write_all(b"GET /created HTTP/1.1\r\nHost: x\r\n\r\n").expect("send");
        let (head, _) = read_response(&mut peer);
        assert!(head.starts_with("HTTP/1.1 201 Created\r\n"), "head: {head}");
    }

    #[test]
    fn prepare_may_finish_and_skip_the_method_hook() {
        let mut peer = connect(application());
        peer.write_all(b"GET /prepared HTTP/1.1\r\nHost: x\r\n\r\n").expect("send");

        let (_, body) = read_response(&mut peer);
        assert_eq!(body, "from prepare");
    }
}
