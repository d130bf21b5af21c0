use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::Bytes;
use http::{header, HeaderMap, Method, Uri, Version};
use mime::Mime;
use tracing::{debug, error};

use crate::handler::RequestCallback;
use crate::httputil::{parse_headers, parse_multipart, parse_query_string};
use crate::protocol::{
    HttpError, HttpRequest, ParseError, RequestParts, ResponseChannel, StreamError,
};
use crate::server::ServerOptions;
use crate::stream::IoStream;
use crate::utils::ensure;

/// Parsed request line and header block.
#[derive(Debug)]
struct RequestHead {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
}

/// What the connection remembers about the request in flight, enough to
/// decide keep-alive once the response completes.
#[derive(Debug)]
struct RequestSummary {
    method: Method,
    version: Version,
    connection_header: Option<String>,
    has_content_length: bool,
}

#[derive(Debug, Default)]
struct ConnState {
    request: Option<RequestSummary>,
    request_finished: bool,
}

/// One live HTTP/1.x connection on top of an [`IoStream`].
///
/// The connection walks a fixed cycle: await the header block, await the
/// body when `Content-Length` announces one, dispatch, then wait for the
/// response to finish before closing or re-arming for the next request.
/// At most one request is in flight per connection.
pub struct HttpConnection<S> {
    stream: Arc<IoStream<S>>,
    remote_ip: String,
    options: ServerOptions,
    callback: Arc<dyn RequestCallback>,
    state: Mutex<ConnState>,
    weak: Weak<Self>,
}

impl<S> fmt::Debug for HttpConnection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnection")
            .field("remote_ip", &self.remote_ip)
            .finish_non_exhaustive()
    }
}

impl<S> HttpConnection<S>
where
    S: Read + Write + AsRawFd + Send + 'static,
{
    /// Takes ownership of a stream and starts reading the first request.
    ///
    /// # Errors
    ///
    /// Fails when the stream cannot accept the initial read.
    pub fn attach(
        stream: Arc<IoStream<S>>,
        remote_ip: String,
        options: ServerOptions,
        callback: Arc<dyn RequestCallback>,
    ) -> Result<Arc<Self>, HttpError> {
        let connection = Arc::new_cyclic(|weak| Self {
            stream,
            remote_ip,
            options,
            callback,
            state: Mutex::new(ConnState::default()),
            weak: Weak::clone(weak),
        });
        connection.read_head()?;
        Ok(connection)
    }

    fn lock(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_head(&self) -> Result<(), HttpError> {
        let Some(connection) = self.weak.upgrade() else {
            return Ok(());
        };
        self.stream
            .read_until("\r\n\r\n", Box::new(move |data| connection.on_headers(&data)))
    }

    fn on_headers(&self, data: &str) -> Result<(), HttpError> {
        let head = parse_request_head(data)?;

        let summary = RequestSummary {
            method: head.method.clone(),
            version: head.version,
            connection_header: head
                .headers
                .get(header::CONNECTION)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned),
            has_content_length: head.headers.contains_key(header::CONTENT_LENGTH),
        };
        {
            let mut state = self.lock();
            state.request = Some(summary);
            state.request_finished = false;
        }

        let content_length = content_length_of(&head.headers, self.options.max_buffer_size)?;
        if content_length > 0 {
            if expects_continue(&head.headers) {
                self.stream.write(b"HTTP/1.1 100 (Continue)\r\n\r\n", None)?;
            }
            let Some(connection) = self.weak.upgrade() else {
                return Ok(());
            };
            return self
                .stream
                .read_exactly(content_length, Box::new(move |body| connection.on_body(head, body)));
        }

        self.dispatch(head, Bytes::new())
    }

    fn on_body(&self, head: RequestHead, body: Bytes) -> Result<(), HttpError> {
        self.dispatch(head, body)
    }

    fn dispatch(&self, head: RequestHead, body: Bytes) -> Result<(), HttpError> {
        let Some(connection) = self.weak.upgrade() else {
            return Ok(());
        };
        let request = assemble_request(
            head,
            body,
            self.remote_ip.clone(),
            self.options.xheaders,
            connection,
        )?;
        debug!(
            remote = %self.remote_ip,
            method = %request.method(),
            path = request.path(),
            "dispatching request"
        );
        if let Err(error) = self.callback.execute(Arc::new(request)) {
            error!(cause = %error, "request callback failed, closing connection");
            self.stream.close();
        }
        Ok(())
    }

    fn on_write_complete(&self) -> Result<(), HttpError> {
        let finished = self.lock().request_finished;
        if finished {
            self.finish_request()?;
        }
        Ok(())
    }

    /// Runs once the response is fully written: close or wait for the
    /// next request on the same socket.
    fn finish_request(&self) -> Result<(), HttpError> {
        let disconnect = {
            let mut state = self.lock();
            let Some(summary) = state.request.take() else {
                return Ok(());
            };
            state.request_finished = false;
            should_disconnect(self.options.no_keep_alive, &summary)
        };
        if disconnect {
            debug!(remote = %self.remote_ip, "closing connection after response");
            self.stream.close();
            return Ok(());
        }
        self.read_head()
    }
}

impl<S> ResponseChannel for HttpConnection<S>
where
    S: Read + Write + AsRawFd + Send + 'static,
{
    fn write_response(&self, data: &[u8]) -> Result<(), HttpError> {
        {
            let state = self.lock();
            ensure!(
                state.request.is_some() && !state.request_finished,
                HttpError::request_finished()
            );
        }
        let Some(connection) = self.weak.upgrade() else {
            return Err(StreamError::closed().into());
        };
        self.stream
            .write(data, Some(Box::new(move || connection.on_write_complete())))
    }

    fn finish_response(&self) -> Result<(), HttpError> {
        {
            let mut state = self.lock();
            ensure!(
                state.request.is_some() && !state.request_finished,
                HttpError::request_finished()
            );
            state.request_finished = true;
        }
        if !self.stream.is_writing() {
            self.finish_request()?;
        }
        Ok(())
    }
}

fn parse_request_head(data: &str) -> Result<RequestHead, ParseError> {
    let (request_line, header_block) = data.split_once("\r\n").unwrap_or((data, ""));

    let mut pieces = request_line.splitn(3, ' ');
    let (Some(method), Some(uri), Some(version)) = (pieces.next(), pieces.next(), pieces.next())
    else {
        return Err(ParseError::malformed_request_line(request_line));
    };
    ensure!(version.starts_with("HTTP/"), ParseError::malformed_version(version));

    let method = match Method::from_bytes(method.as_bytes()) {
        Ok(method) => method,
        Err(_) => return Err(ParseError::invalid_method(method)),
    };
    let uri = match uri.parse::<Uri>() {
        Ok(uri) => uri,
        Err(e) => return Err(ParseError::invalid_uri(e)),
    };
    let version = match version.trim_end() {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        "HTTP/0.9" => Version::HTTP_09,
        // Versions this server does not speak get HTTP/1.0 treatment.
        _ => Version::HTTP_10,
    };
    let headers = parse_headers(header_block)?;

    Ok(RequestHead { method, uri, version, headers })
}

fn content_length_of(headers: &HeaderMap, max_buffer_size: usize) -> Result<usize, ParseError> {
    let Some(value) = headers.get(header::CONTENT_LENGTH) else {
        return Ok(0);
    };
    let Ok(text) = value.to_str() else {
        return Err(ParseError::invalid_content_length("not ascii"));
    };
    let Ok(length) = text.trim().parse::<usize>() else {
        return Err(ParseError::invalid_content_length(text));
    };
    ensure!(length <= max_buffer_size, ParseError::body_too_large(length, max_buffer_size));
    Ok(length)
}

fn expects_continue(headers: &HeaderMap) -> bool {
    headers.get(header::EXPECT).and_then(|value| value.to_str().ok()) == Some("100-continue")
}

/// Keep-alive decision once a response has been fully written.
fn should_disconnect(no_keep_alive: bool, summary: &RequestSummary) -> bool {
    if no_keep_alive {
        return true;
    }
    let connection = summary.connection_header.as_deref().unwrap_or("");
    if summary.version == Version::HTTP_11 {
        return connection.eq_ignore_ascii_case("close");
    }
    if summary.has_content_length
        || summary.method == Method::GET
        || summary.method == Method::POST
    {
        return !connection.eq_ignore_ascii_case("keep-alive");
    }
    true
}

fn assemble_request(
    head: RequestHead,
    body: Bytes,
    remote_ip: String,
    xheaders: bool,
    connection: Arc<dyn ResponseChannel>,
) -> Result<HttpRequest, ParseError> {
    let RequestHead { method, uri, version, headers } = head;

    let mut arguments = uri.query().map(parse_query_string).unwrap_or_default();
    let mut files = HashMap::new();

    if method == Method::POST {
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        if content_type.starts_with("application/x-www-form-urlencoded") {
            let text = String::from_utf8_lossy(&body);
            for (name, values) in parse_query_string(&text) {
                arguments.entry(name).or_default().extend(values);
            }
        } else if content_type.starts_with("multipart/form-data") {
            let boundary = content_type
                .parse::<Mime>()
                .ok()
                .and_then(|mime| mime.get_param(mime::BOUNDARY).map(|b| b.as_str().to_owned()));
            match boundary {
                Some(boundary) => parse_multipart(&boundary, &body, &mut arguments, &mut files),
                None => {
                    return Err(ParseError::invalid_header(
                        "multipart content-type without boundary",
                    ));
                }
            }
        }
    }

    let parts = RequestParts {
        method,
        uri,
        version,
        headers,
        body,
        arguments,
        files,
        remote_ip,
        xheaders,
    };
    Ok(HttpRequest::new(parts, connection))
}
