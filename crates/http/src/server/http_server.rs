use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, warn};

use crate::connection::HttpConnection;
use crate::handler::RequestCallback;
use crate::reactor::{BoxError, EventHandler, InterestKind, Reactor};
use crate::stream::IoStream;

/// Pending-connection queue length for the listening socket.
const BACKLOG: i32 = 128;

/// Reject request bodies longer than this unless configured otherwise.
const DEFAULT_MAX_BUFFER_SIZE: usize = 100 * 1024 * 1024;

/// Tunables for an [`HttpServer`].
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub(crate) no_keep_alive: bool,
    pub(crate) xheaders: bool,
    pub(crate) max_buffer_size: usize,
    pub(crate) workers: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            no_keep_alive: false,
            xheaders: false,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            workers: num_cpus::get(),
        }
    }
}

impl ServerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close every connection after its response, regardless of protocol
    /// version.
    pub fn no_keep_alive(mut self, no_keep_alive: bool) -> Self {
        self.no_keep_alive = no_keep_alive;
        self
    }

    /// Trust `X-Real-Ip`, `X-Forwarded-For`, and `X-Scheme` headers from
    /// an upstream proxy.
    pub fn xheaders(mut self, xheaders: bool) -> Self {
        self.xheaders = xheaders;
        self
    }

    /// Largest `Content-Length` accepted before the connection is refused.
    pub fn max_buffer_size(mut self, max_buffer_size: usize) -> Self {
        self.max_buffer_size = max_buffer_size;
        self
    }

    /// Number of worker threads executing read/write continuations.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }
}

/// A single-process, non-blocking HTTP/1.x server.
///
/// The server owns the reactor. [`HttpServer::bind`] claims a port and
/// registers accept interest; [`HttpServer::start`] runs the event loop
/// on the calling thread and does not return while the server lives.
pub struct HttpServer {
    reactor: Arc<Reactor>,
    callback: Arc<dyn RequestCallback>,
    options: ServerOptions,
    listener: Mutex<Option<TcpListener>>,
    weak: Weak<Self>,
}

impl fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpServer")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl HttpServer {
    /// Creates a server with default [`ServerOptions`].
    ///
    /// # Errors
    ///
    /// Fails when the reactor or its worker pool cannot be created.
    pub fn new(callback: Arc<dyn RequestCallback>) -> io::Result<Arc<Self>> {
        Self::with_options(callback, ServerOptions::default())
    }

    /// Creates a server with explicit options.
    ///
    /// # Errors
    ///
    /// Fails when the reactor or its worker pool cannot be created.
    pub fn with_options(
        callback: Arc<dyn RequestCallback>,
        options: ServerOptions,
    ) -> io::Result<Arc<Self>> {
        let reactor = Reactor::with_workers(options.workers)?;
        Ok(Arc::new_cyclic(|weak| Self {
            reactor,
            callback,
            options,
            listener: Mutex::new(None),
            weak: Weak::clone(weak),
        }))
    }

    /// Binds the listening socket and registers accept interest.
    ///
    /// Binding port `0` picks a free port; the chosen address is returned
    /// either way.
    ///
    /// # Errors
    ///
    /// Fails when the socket cannot be created, bound, or switched to
    /// non-blocking mode.
    pub fn bind(&self, port: u16) -> io::Result<SocketAddr> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        let address = SocketAddr::from(([0, 0, 0, 0], port));
        socket.bind(&address.into())?;
        socket.listen(BACKLOG)?;
        socket.set_nonblocking(true)?;
        let listener: TcpListener = socket.into();
        let local_addr = listener.local_addr()?;

        *self.lock_listener() = Some(listener);
        self.register_accept();
        info!(address = %local_addr, "server listening");
        Ok(local_addr)
    }

    /// Runs the event loop on the calling thread.
    ///
    /// # Errors
    ///
    /// Returns the fatal reactor error that stopped the loop.
    pub fn start(&self) -> io::Result<()> {
        self.reactor.start()
    }

    /// Binds `port` and runs the event loop. Does not return while the
    /// server is healthy.
    ///
    /// # Errors
    ///
    /// Fails when binding fails or the reactor stops with an error.
    pub fn listen(&self, port: u16) -> io::Result<()> {
        self.bind(port)?;
        self.start()
    }

    fn lock_listener(&self) -> MutexGuard<'_, Option<TcpListener>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register_accept(&self) {
        let Some(server) = self.weak.upgrade() else {
            return;
        };
        let fd = {
            let guard = self.lock_listener();
            let Some(listener) = guard.as_ref() else {
                return;
            };
            listener.as_raw_fd()
        };
        self.reactor.register_interest(fd, InterestKind::Accept, server);
    }

    /// Drains every connection currently waiting in the accept queue.
    /// A one-shot registration would otherwise deliver a burst of
    /// connections one wakeup at a time.
    fn accept_pending(&self) -> Result<(), BoxError> {
        loop {
            let accepted = {
                let guard = self.lock_listener();
                let Some(listener) = guard.as_ref() else {
                    return Ok(());
                };
                listener.accept()
            };
            match accepted {
                Ok((socket, address)) => {
                    if let Err(e) = self.spawn_connection(socket, address) {
                        warn!(cause = %e, "dropping connection that failed to start");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(cause = %e, "accept failed");
                    break;
                }
            }
        }
        self.register_accept();
        Ok(())
    }

    fn spawn_connection(&self, socket: TcpStream, address: SocketAddr) -> Result<(), BoxError> {
        socket.set_nonblocking(true)?;
        debug!(remote = %address, "accepted connection");
        let stream = IoStream::new(socket, Arc::clone(&self.reactor));
        match HttpConnection::attach(
            Arc::clone(&stream),
            address.ip().to_string(),
            self.options.clone(),
            Arc::clone(&self.callback),
        ) {
            Ok(_connection) => Ok(()),
            Err(e) => {
                stream.close();
                Err(e.into())
            }
        }
    }
}

impl EventHandler for HttpServer {
    fn handle_event(&self, kind: InterestKind) -> Result<(), BoxError> {
        match kind {
            InterestKind::Accept => self.accept_pending(),
            InterestKind::Read | InterestKind::Write => Ok(()),
        }
    }

    fn handle_error(&self, error: BoxError) {
        error!(cause = %error, "accept handler error");
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::thread;

    use super::*;
    use crate::handler::make_callback;

    #[test]
    fn serves_a_request_over_tcp() {
        let callback: Arc<dyn RequestCallback> = Arc::new(make_callback(|request| {
            request.write(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")?;
            request.finish()?;
            Ok(())
        }));
        let server = HttpServer::new(callback).expect("server");
        let address = server.bind(0).expect("bind");
        let runner = Arc::clone(&server);
        thread::spawn(move || runner.start());

        let mut client = TcpStream::connect(address).expect("connect");
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n")
            .expect("send");
        let mut response = Vec::new();
        client.read_to_end(&mut response).expect("response");
        assert!(response.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with(b"ok"));
    }
}
