//! Readiness-driven event dispatch.
//!
//! This module provides the [`Reactor`]: one loop thread multiplexing many
//! sockets through the OS readiness facility, with per-event callbacks
//! executed on a fixed worker pool.
//!
//! # Architecture
//!
//! ```text
//! register_interest()          loop thread                 worker pool
//!   (any thread)      ──ops──▶ apply ops ──▶ poll ──▶ dispatch ──▶ handle_event
//!                              ▲                  │
//!                              └──── waker ◀──────┘ accept runs inline
//! ```
//!
//! Interest is one-shot per direction: a registration is consumed by the
//! readiness event that fires it, and the handler re-registers when it wants
//! more. Registrations and cancellations issued off the loop thread are
//! queued over a channel and applied by the loop thread right before it
//! blocks, so the poll registry is never touched concurrently.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use mio::event::Event;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use tracing::{debug, error, trace, warn};

mod pool;
use pool::WorkerPool;

/// Boxed error used at the dispatch boundary.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

const WAKER_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 1024;

/// Poll timeout while worker tasks are queued or running.
const POLL_TIMEOUT_BUSY: Duration = Duration::from_millis(1);
/// Poll timeout while the pool is idle.
const POLL_TIMEOUT_IDLE: Duration = Duration::from_secs(3);

/// The readiness direction a handler registers for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterestKind {
    /// Readability of a listening socket. Dispatched on the loop thread.
    Accept,
    /// Readability of a connected socket. Dispatched on a pool worker.
    Read,
    /// Writability of a connected socket. Dispatched on a pool worker.
    Write,
}

impl InterestKind {
    fn interest(self) -> Interest {
        match self {
            Self::Accept | Self::Read => Interest::READABLE,
            Self::Write => Interest::WRITABLE,
        }
    }
}

/// Receiver of readiness events for one socket.
pub trait EventHandler: Send + Sync {
    /// Called once per consumed registration, with the direction that fired.
    fn handle_event(&self, kind: InterestKind) -> Result<(), BoxError>;

    /// Called with the error when [`handle_event`](Self::handle_event) fails.
    fn handle_error(&self, error: BoxError) {
        error!(cause = %error, "event handler failed");
    }
}

/// Identifies a registered socket. The token covers every interest direction
/// parked for that socket, so one [`Reactor::cancel`] clears them all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoToken(pub(crate) RawFd);

enum ReactorOp {
    Register {
        fd: RawFd,
        kind: InterestKind,
        handler: Arc<dyn EventHandler>,
    },
    Cancel {
        fd: RawFd,
    },
}

struct Slot {
    kind: InterestKind,
    handler: Arc<dyn EventHandler>,
}

#[derive(Default)]
struct FdEntry {
    read: Option<Slot>,
    write: Option<Slot>,
}

impl FdEntry {
    fn interest(&self) -> Option<Interest> {
        match (&self.read, &self.write) {
            (Some(_), Some(_)) => Some(Interest::READABLE | Interest::WRITABLE),
            (Some(_), None) => Some(Interest::READABLE),
            (None, Some(_)) => Some(Interest::WRITABLE),
            (None, None) => None,
        }
    }
}

fn token_of(fd: RawFd) -> Token {
    Token(fd as usize)
}

fn fd_of(token: Token) -> RawFd {
    token.0 as RawFd
}

/// The event loop: OS readiness multiplexer plus worker pool.
///
/// Construct once, share through an [`Arc`], and run [`start`](Self::start)
/// on a dedicated thread. All registration goes through
/// [`register_interest`](Self::register_interest), which is safe to call
/// from any thread, including from inside a running handler.
#[derive(Debug)]
pub struct Reactor {
    poll: Mutex<Poll>,
    registry: Registry,
    waker: Waker,
    op_tx: Sender<ReactorOp>,
    op_rx: Receiver<ReactorOp>,
    pool: WorkerPool,
}

impl Reactor {
    /// Creates a reactor with one worker thread per available CPU core.
    pub fn new() -> io::Result<Arc<Self>> {
        Self::with_workers(num_cpus::get())
    }

    /// Creates a reactor with a fixed number of worker threads.
    pub fn with_workers(workers: usize) -> io::Result<Arc<Self>> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let (op_tx, op_rx) = crossbeam_channel::unbounded();
        let pool = WorkerPool::new(workers.max(1))?;
        Ok(Arc::new(Self { poll: Mutex::new(poll), registry, waker, op_tx, op_rx, pool }))
    }

    /// Queues interest in `kind` readiness of `fd`. The registration is
    /// one-shot: it is consumed by the event that fires it.
    ///
    /// The handler is dropped with a warning if the descriptor cannot be
    /// registered by the time the loop applies the operation.
    pub fn register_interest(
        &self,
        fd: RawFd,
        kind: InterestKind,
        handler: Arc<dyn EventHandler>,
    ) -> IoToken {
        self.push_op(ReactorOp::Register { fd, kind, handler });
        IoToken(fd)
    }

    /// Queues removal of every registration parked for the socket behind
    /// `token`. Unknown tokens are ignored.
    pub fn cancel(&self, token: IoToken) {
        self.push_op(ReactorOp::Cancel { fd: token.0 });
    }

    fn push_op(&self, op: ReactorOp) {
        if self.op_tx.send(op).is_err() {
            error!("reactor operation queue disconnected");
            return;
        }
        if let Err(e) = self.waker.wake() {
            warn!(cause = %e, "failed to wake the reactor");
        }
    }

    /// Runs the loop on the calling thread. Returns only on a fatal polling
    /// error; call it once.
    pub fn start(&self) -> io::Result<()> {
        let mut poll = self.poll.lock().unwrap_or_else(PoisonError::into_inner);
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        let mut table: HashMap<RawFd, FdEntry> = HashMap::new();
        debug!("reactor loop running");
        loop {
            self.apply_ops(&mut table);
            let timeout = if self.pool.busy() { POLL_TIMEOUT_BUSY } else { POLL_TIMEOUT_IDLE };
            if let Err(e) = poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(cause = %e, "polling failed; reactor stopping");
                return Err(e);
            }
            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                self.dispatch(&mut table, event);
            }
        }
    }

    fn apply_ops(&self, table: &mut HashMap<RawFd, FdEntry>) {
        while let Ok(op) = self.op_rx.try_recv() {
            match op {
                ReactorOp::Register { fd, kind, handler } => {
                    self.apply_register(table, fd, kind, handler);
                }
                ReactorOp::Cancel { fd } => self.apply_cancel(table, fd),
            }
        }
    }

    fn apply_register(
        &self,
        table: &mut HashMap<RawFd, FdEntry>,
        fd: RawFd,
        kind: InterestKind,
        handler: Arc<dyn EventHandler>,
    ) {
        let entry = table.entry(fd).or_default();
        let previous = entry.interest();
        let slot = Slot { kind, handler };
        match kind {
            InterestKind::Write => entry.write = Some(slot),
            InterestKind::Accept | InterestKind::Read => entry.read = Some(slot),
        }
        let wanted = match previous {
            Some(p) => p | kind.interest(),
            None => kind.interest(),
        };
        let mut source = SourceFd(&fd);
        let result = match previous {
            None => self.registry.register(&mut source, token_of(fd), wanted),
            Some(p) if p != wanted => self.registry.reregister(&mut source, token_of(fd), wanted),
            Some(_) => Ok(()),
        };
        if let Err(e) = result {
            warn!(fd, cause = %e, "interest registration failed; dropping handler");
            table.remove(&fd);
        }
    }

    fn apply_cancel(&self, table: &mut HashMap<RawFd, FdEntry>, fd: RawFd) {
        if table.remove(&fd).is_some() {
            if let Err(e) = self.registry.deregister(&mut SourceFd(&fd)) {
                trace!(fd, cause = %e, "deregister on cancel failed");
            }
        }
    }

    /// Consumes the slots the event fired for, re-arms whatever interest is
    /// left for the socket, and only then runs the handlers. Error and
    /// hangup conditions fire every parked direction so the owner observes
    /// the failure from its own syscall.
    fn dispatch(&self, table: &mut HashMap<RawFd, FdEntry>, event: &Event) {
        let fd = fd_of(event.token());
        let readable = event.is_readable() || event.is_error() || event.is_read_closed();
        let writable = event.is_writable() || event.is_error() || event.is_write_closed();

        let (read_slot, write_slot) = {
            let Some(entry) = table.get_mut(&fd) else {
                trace!(fd, "event for an unregistered socket");
                return;
            };
            let read_slot = if readable { entry.read.take() } else { None };
            let write_slot = if writable { entry.write.take() } else { None };
            (read_slot, write_slot)
        };

        match table.get(&fd).and_then(FdEntry::interest) {
            Some(remaining) => {
                if let Err(e) = self.registry.reregister(&mut SourceFd(&fd), token_of(fd), remaining)
                {
                    warn!(fd, cause = %e, "failed to re-arm remaining interest");
                    table.remove(&fd);
                }
            }
            None => {
                table.remove(&fd);
                if let Err(e) = self.registry.deregister(&mut SourceFd(&fd)) {
                    trace!(fd, cause = %e, "deregister after dispatch failed");
                }
            }
        }

        if let Some(slot) = read_slot {
            self.run_slot(slot);
        }
        if let Some(slot) = write_slot {
            self.run_slot(slot);
        }
    }

    fn run_slot(&self, slot: Slot) {
        match slot.kind {
            InterestKind::Accept => {
                if let Err(error) = slot.handler.handle_event(InterestKind::Accept) {
                    slot.handler.handle_error(error);
                }
            }
            kind @ (InterestKind::Read | InterestKind::Write) => {
                let handler = slot.handler;
                self.pool.execute(move || {
                    if let Err(error) = handler.handle_event(kind) {
                        handler.handle_error(error);
                    }
                });
            }
        }
    }
}
