use std::fmt;
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::str;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::protocol::{HttpError, StreamError};
use crate::reactor::{BoxError, EventHandler, InterestKind, IoToken, Reactor};
use crate::utils::{ensure, find_subsequence};

/// Bytes requested from the socket per `read` call.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Consumed-byte watermark at which the read buffer is compacted.
const COMPACT_THRESHOLD: usize = 8 * 1024;

/// Completion callback for [`IoStream::read_until`].
pub type ReadTextCallback = Box<dyn FnOnce(String) -> Result<(), HttpError> + Send>;

/// Completion callback for [`IoStream::read_exactly`].
pub type ReadBytesCallback = Box<dyn FnOnce(Bytes) -> Result<(), HttpError> + Send>;

/// Completion callback for [`IoStream::write`].
pub type WriteCallback = Box<dyn FnOnce() -> Result<(), HttpError> + Send>;

enum PendingRead {
    Until {
        delimiter: String,
        callback: ReadTextCallback,
    },
    Exactly {
        wanted: usize,
        callback: ReadBytesCallback,
    },
}

enum Completion {
    Text(ReadTextCallback, String),
    Bytes(ReadBytesCallback, Bytes),
}

struct Inner<S> {
    socket: Option<S>,
    /// Raw bytes as received, append-only until compaction.
    raw: BytesMut,
    /// Offset of the first unconsumed byte in `raw`.
    read_pos: usize,
    /// Offset up to which `raw` has been UTF-8 validated into `text`.
    decode_pos: usize,
    /// Byte offset in `text` from which the next delimiter scan starts.
    scan_off: usize,
    /// Decoded mirror of `raw[read_pos..decode_pos]`.
    text: String,
    pending_read: Option<PendingRead>,
    write_buf: BytesMut,
    write_callback: Option<WriteCallback>,
    writing: bool,
    closing: bool,
    closed: bool,
}

impl<S> Inner<S> {
    fn new(socket: S) -> Self {
        Self {
            socket: Some(socket),
            raw: BytesMut::with_capacity(READ_CHUNK_SIZE),
            read_pos: 0,
            decode_pos: 0,
            scan_off: 0,
            text: String::new(),
            pending_read: None,
            write_buf: BytesMut::new(),
            write_callback: None,
            writing: false,
            closing: false,
            closed: false,
        }
    }

    /// Extends `text` with the newly received bytes that form complete
    /// UTF-8 sequences. A truncated sequence at the buffer end is left for
    /// the next pass; an invalid sequence is an error.
    fn decode_more(&mut self) -> Result<(), StreamError> {
        let tail = &self.raw[self.decode_pos..];
        if tail.is_empty() {
            return Ok(());
        }
        match str::from_utf8(tail) {
            Ok(valid) => {
                self.text.push_str(valid);
                self.decode_pos = self.raw.len();
                Ok(())
            }
            Err(e) => {
                let valid_len = e.valid_up_to();
                if let Ok(valid) = str::from_utf8(&tail[..valid_len]) {
                    self.text.push_str(valid);
                }
                self.decode_pos += valid_len;
                match e.error_len() {
                    None => Ok(()),
                    Some(_) => Err(StreamError::invalid_utf8(self.decode_pos)),
                }
            }
        }
    }

    /// Drops the decoded window after a fixed-length read consumed raw
    /// bytes out from under it.
    fn reset_decode_window(&mut self) {
        self.text.clear();
        self.decode_pos = self.read_pos;
        self.scan_off = 0;
    }

    fn compact(&mut self) {
        if self.read_pos >= COMPACT_THRESHOLD {
            self.raw.advance(self.read_pos);
            self.decode_pos -= self.read_pos;
            self.read_pos = 0;
        }
    }
}

/// A non-blocking socket with completion-driven reads and writes.
///
/// All operations may be called from any thread. Completion callbacks run
/// synchronously on the calling thread when the data is already buffered,
/// otherwise on a worker thread once the socket becomes ready.
pub struct IoStream<S> {
    reactor: Arc<Reactor>,
    fd: std::os::fd::RawFd,
    weak: Weak<Self>,
    inner: Mutex<Inner<S>>,
}

impl<S> fmt::Debug for IoStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoStream")
            .field("fd", &self.fd)
            .finish_non_exhaustive()
    }
}

impl<S> IoStream<S>
where
    S: Read + Write + AsRawFd + Send + 'static,
{
    /// Wraps a connected socket that has already been switched to
    /// non-blocking mode.
    pub fn new(socket: S, reactor: Arc<Reactor>) -> Arc<Self> {
        let fd = socket.as_raw_fd();
        Arc::new_cyclic(|weak| Self {
            reactor,
            fd,
            weak: Weak::clone(weak),
            inner: Mutex::new(Inner::new(socket)),
        })
    }

    /// Reads decoded text until `delimiter` has been seen, then invokes
    /// `callback` with everything up to and including the delimiter.
    ///
    /// # Errors
    ///
    /// Fails if the stream is closed, if another read is pending, or if
    /// the received bytes are not valid UTF-8.
    pub fn read_until(
        &self,
        delimiter: impl Into<String>,
        callback: ReadTextCallback,
    ) -> Result<(), HttpError> {
        let ready = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            ensure!(!inner.closed, StreamError::closed());
            ensure!(inner.pending_read.is_none(), StreamError::already_reading());
            inner.pending_read = Some(PendingRead::Until {
                delimiter: delimiter.into(),
                callback,
            });
            inner.scan_off = 0;
            let ready = self.try_complete_read(inner)?;
            if ready.is_none() {
                self.register_read();
            }
            ready
        };
        Self::run_completion(ready)
    }

    /// Reads exactly `wanted` raw bytes, then invokes `callback` with them.
    /// The bytes are not UTF-8 validated.
    ///
    /// # Errors
    ///
    /// Fails if the stream is closed or another read is pending.
    pub fn read_exactly(
        &self,
        wanted: usize,
        callback: ReadBytesCallback,
    ) -> Result<(), HttpError> {
        let ready = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            ensure!(!inner.closed, StreamError::closed());
            ensure!(inner.pending_read.is_none(), StreamError::already_reading());
            inner.pending_read = Some(PendingRead::Exactly { wanted, callback });
            let ready = self.try_complete_read(inner)?;
            if ready.is_none() {
                self.register_read();
            }
            ready
        };
        Self::run_completion(ready)
    }

    /// Appends `data` to the write buffer and starts flushing it. When the
    /// buffer next drains completely, `callback` is invoked; a callback
    /// passed while an earlier one is still parked replaces it.
    ///
    /// # Errors
    ///
    /// Fails if the stream is closed.
    pub fn write(&self, data: &[u8], callback: Option<WriteCallback>) -> Result<(), HttpError> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        ensure!(!inner.closed, StreamError::closed());
        inner.write_buf.extend_from_slice(data);
        if let Some(callback) = callback {
            if inner.write_callback.is_some() {
                trace!(fd = self.fd, "replacing parked write callback");
            }
            inner.write_callback = Some(callback);
        }
        if !inner.writing {
            inner.writing = true;
            self.register_write();
        }
        Ok(())
    }

    /// Closes the stream, releasing its buffers and cancelling reactor
    /// interest. If a write is still draining, the close is deferred until
    /// the write buffer empties. Idempotent.
    pub fn close(&self) {
        let mut guard = self.lock();
        self.close_locked(&mut guard);
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn is_writing(&self) -> bool {
        self.lock().writing
    }

    fn lock(&self) -> MutexGuard<'_, Inner<S>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close_locked(&self, inner: &mut Inner<S>) {
        if inner.closed {
            return;
        }
        if inner.writing {
            inner.closing = true;
            return;
        }
        self.finish_close(inner);
    }

    fn finish_close(&self, inner: &mut Inner<S>) {
        inner.closed = true;
        inner.closing = false;
        inner.writing = false;
        inner.pending_read = None;
        inner.write_callback = None;
        inner.raw = BytesMut::new();
        inner.text = String::new();
        inner.write_buf = BytesMut::new();
        inner.read_pos = 0;
        inner.decode_pos = 0;
        inner.scan_off = 0;
        self.reactor.cancel(IoToken(self.fd));
        inner.socket = None;
        debug!(fd = self.fd, "stream closed");
    }

    fn register_read(&self) {
        if let Some(stream) = self.weak.upgrade() {
            self.reactor
                .register_interest(self.fd, InterestKind::Read, stream);
        }
    }

    fn register_write(&self) {
        if let Some(stream) = self.weak.upgrade() {
            self.reactor
                .register_interest(self.fd, InterestKind::Write, stream);
        }
    }

    /// Attempts to satisfy the pending read from buffered data. On a miss
    /// the pending read is parked again and the caller decides whether to
    /// register read interest.
    fn try_complete_read(
        &self,
        inner: &mut Inner<S>,
    ) -> Result<Option<Completion>, StreamError> {
        let Some(pending) = inner.pending_read.take() else {
            return Ok(None);
        };
        match pending {
            PendingRead::Until {
                delimiter,
                callback,
            } => {
                // A decode error is not fatal yet: the delimiter may sit
                // inside the valid prefix, with the undecodable bytes
                // belonging to a body that a fixed-length read will
                // consume raw.
                let decode_failure = inner.decode_more().err();
                let from = inner.scan_off.min(inner.text.len());
                let hit = find_subsequence(&inner.text.as_bytes()[from..], delimiter.as_bytes());
                if let Some(found) = hit {
                    let end = from + found + delimiter.len();
                    let remainder = inner.text.split_off(end);
                    let data = std::mem::replace(&mut inner.text, remainder);
                    inner.read_pos += data.len();
                    inner.scan_off = 0;
                    inner.compact();
                    return Ok(Some(Completion::Text(callback, data)));
                }
                if let Some(e) = decode_failure {
                    warn!(fd = self.fd, cause = %e, "undecodable bytes in text read");
                    self.close_locked(inner);
                    return Err(e);
                }
                // Next scan may skip everything except a possible
                // delimiter prefix at the window end.
                inner.scan_off = inner
                    .text
                    .len()
                    .saturating_sub(delimiter.len().saturating_sub(1));
                inner.pending_read = Some(PendingRead::Until {
                    delimiter,
                    callback,
                });
                Ok(None)
            }
            PendingRead::Exactly { wanted, callback } => {
                let available = inner.raw.len() - inner.read_pos;
                if available >= wanted {
                    let start = inner.read_pos;
                    let data = Bytes::copy_from_slice(&inner.raw[start..start + wanted]);
                    inner.read_pos += wanted;
                    inner.reset_decode_window();
                    inner.compact();
                    return Ok(Some(Completion::Bytes(callback, data)));
                }
                inner.pending_read = Some(PendingRead::Exactly { wanted, callback });
                Ok(None)
            }
        }
    }

    /// Drains the socket into the read buffer. Returns `true` when the
    /// peer has closed its end.
    fn fill_from_socket(inner: &mut Inner<S>) -> Result<bool, StreamError> {
        let Inner { socket, raw, .. } = inner;
        let Some(socket) = socket.as_mut() else {
            return Err(StreamError::closed());
        };
        let mut chunk = [0_u8; READ_CHUNK_SIZE];
        loop {
            match socket.read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => raw.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(StreamError::io(e)),
            }
        }
    }

    /// Flushes as much of the write buffer as the socket accepts. Returns
    /// `true` once the buffer is empty.
    fn drain_write_buffer(inner: &mut Inner<S>) -> Result<bool, StreamError> {
        let Inner {
            socket, write_buf, ..
        } = inner;
        let Some(socket) = socket.as_mut() else {
            return Err(StreamError::closed());
        };
        while !write_buf.is_empty() {
            match socket.write(write_buf) {
                Ok(0) => {
                    return Err(StreamError::io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket accepted no bytes",
                    )));
                }
                Ok(n) => write_buf.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(StreamError::io(e)),
            }
        }
        Ok(true)
    }

    fn handle_read(&self) -> Result<(), HttpError> {
        let ready = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            if inner.closed {
                return Ok(());
            }
            let eof = match Self::fill_from_socket(inner) {
                Ok(eof) => eof,
                Err(e) => {
                    self.close_locked(inner);
                    return Err(e.into());
                }
            };
            let ready = self.try_complete_read(inner)?;
            if ready.is_none() {
                if eof {
                    trace!(fd = self.fd, "eof; discarding pending read");
                    inner.pending_read = None;
                    self.close_locked(inner);
                } else if inner.pending_read.is_some() {
                    self.register_read();
                }
            } else if eof {
                // The completed data is still delivered below.
                self.close_locked(inner);
            }
            ready
        };
        Self::run_completion(ready)
    }

    fn handle_write(&self) -> Result<(), HttpError> {
        let callback = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            if inner.closed {
                return Ok(());
            }
            match Self::drain_write_buffer(inner) {
                Err(e) => {
                    self.close_locked(inner);
                    return Err(e.into());
                }
                Ok(false) => {
                    self.register_write();
                    return Ok(());
                }
                Ok(true) => {}
            }
            inner.writing = false;
            if inner.closing {
                self.close_locked(inner);
                None
            } else {
                inner.write_callback.take()
            }
        };
        match callback {
            Some(callback) => callback(),
            None => Ok(()),
        }
    }

    fn run_completion(completion: Option<Completion>) -> Result<(), HttpError> {
        match completion {
            Some(Completion::Text(callback, data)) => callback(data),
            Some(Completion::Bytes(callback, data)) => callback(data),
            None => Ok(()),
        }
    }
}

impl<S> EventHandler for IoStream<S>
where
    S: Read + Write + AsRawFd + Send + 'static,
{
    fn handle_event(&self, kind: InterestKind) -> Result<(), BoxError> {
        match kind {
            InterestKind::Read => Ok(self.handle_read()?),
            InterestKind::Write => Ok(self.handle_write()?),
            InterestKind::Accept => Ok(()),
        }
    }

    fn handle_error(&self, error: BoxError) {
        warn!(fd = self.fd, cause = %error, "stream error, closing");
        self.close();
    }
}
