//! Completion dispatcher for socket operations.
//!
//! The [`Reactor`] owns a single background thread that waits on a `mio` poll instance. The
//! wait-set is a [`Waker`] plus the readiness registration of every socket created through a
//! [`ReactorHandle`]. Whenever anything signals, the thread scans every pending operation,
//! attempts it without blocking and fires the callback of each one that actually finished.
//! An attempt that would block is the "still pending" sentinel; the operation simply stays in
//! the registry for the next cycle.
//!
//! # Guarantees
//!
//! - A callback runs exactly once, on the dispatch thread, and only after the I/O it describes
//!   has completed (successfully, with zero transfer, or with an error).
//! - Operations posted while the thread is blocked are picked up immediately; [`post`]
//!   wakes the wait.
//! - Nothing times out. Shutting the transport down completes the pending operation.
//! - Dropping the [`Reactor`] completes every remaining operation with an error.
//!
//! [`post`]: ReactorHandle::post
use std::{
    io::{self, Read, Write},
    mem,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    task::Poll as IoPoll,
    thread::{self, JoinHandle},
};

use log::{debug, error, trace};
use mio::{Events, Interest, Poll, Registry, Token, Waker, net::TcpStream};

const WAKE_TOKEN: Token = Token(0);
const EVENT_CAPACITY: usize = 256;

/// Invoked once with the outcome of the operation and the buffer it owned.
pub type Callback = Box<dyn FnOnce(io::Result<usize>, Vec<u8>) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Completes once a non-blocking connect has been established or has failed.
    Connect,
    /// Completes once every requested byte has been written, the peer stops accepting data,
    /// or the write fails.
    Send,
    /// Completes with the first non-blocking read that returns anything but "would block".
    Receive,
}

/// One outstanding operation. It owns its buffer until the callback hands it back.
pub struct PendingOperation {
    kind: OperationKind,
    stream: Arc<TcpStream>,
    buffer: Vec<u8>,
    offset: usize,
    count: usize,
    transferred: usize,
    callback: Callback,
}

impl PendingOperation {
    /// `offset..offset + count` must lie inside `buffer`.
    pub fn new(
        kind: OperationKind,
        stream: Arc<TcpStream>,
        buffer: Vec<u8>,
        offset: usize,
        count: usize,
        callback: Callback,
    ) -> Self {
        debug_assert!(offset + count <= buffer.len());
        Self {
            kind,
            stream,
            buffer,
            offset,
            count,
            transferred: 0,
            callback,
        }
    }

    /// Attempts the operation without blocking.
    fn attempt(&mut self) -> IoPoll<io::Result<usize>> {
        let mut stream = self.stream.as_ref();
        loop {
            let res = match self.kind {
                OperationKind::Connect => {
                    match stream.take_error() {
                        Ok(Some(e)) | Err(e) => return IoPoll::Ready(Err(e)),
                        Ok(None) => {}
                    }
                    match stream.peer_addr() {
                        Ok(_) => return IoPoll::Ready(Ok(0)),
                        Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                            return IoPoll::Pending;
                        }
                        Err(e) => Err(e),
                    }
                }
                OperationKind::Send => {
                    if self.transferred == self.count {
                        return IoPoll::Ready(Ok(self.transferred));
                    }
                    let start = self.offset + self.transferred;
                    let end = self.offset + self.count;
                    match stream.write(&self.buffer[start..end]) {
                        Ok(0) => return IoPoll::Ready(Ok(self.transferred)),
                        Ok(n) => {
                            self.transferred += n;
                            continue;
                        }
                        Err(e) => Err(e),
                    }
                }
                OperationKind::Receive => {
                    let end = self.offset + self.count;
                    stream.read(&mut self.buffer[self.offset..end])
                }
            };

            return match res {
                Ok(n) => IoPoll::Ready(Ok(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => IoPoll::Pending,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => IoPoll::Ready(Err(e)),
            };
        }
    }

    fn complete(self, res: io::Result<usize>) {
        (self.callback)(res, self.buffer);
    }
}

struct Shared {
    pending: Mutex<Vec<PendingOperation>>,
    registry: Registry,
    waker: Waker,
    next_token: AtomicUsize,
    running: AtomicBool,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, Vec<PendingOperation>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attempts every pending operation and fires the callbacks of those that finished.
    fn dispatch_ready(&self) {
        // Work on a snapshot so `post` never waits on socket I/O and callbacks can post
        // follow-up operations.
        let snapshot = mem::take(&mut *self.pending());

        let mut waiting = Vec::new();
        let mut done = Vec::new();
        for mut op in snapshot {
            match op.attempt() {
                IoPoll::Pending => waiting.push(op),
                IoPoll::Ready(res) => done.push((op, res)),
            }
        }

        if !waiting.is_empty() {
            let mut pending = self.pending();
            waiting.append(&mut pending);
            *pending = waiting;
        }

        trace!("reactor cycle completed {} operation(s)", done.len());
        for (op, res) in done {
            op.complete(res);
        }
    }

    fn fail_pending(&self) {
        let pending = mem::take(&mut *self.pending());
        if !pending.is_empty() {
            debug!("failing {} operation(s) left at shutdown", pending.len());
        }
        for op in pending {
            op.complete(Err(shut_down()));
        }
    }
}

fn shut_down() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "reactor has shut down")
}

/// Owner of the dispatch thread. Dropping it stops the thread.
pub struct Reactor {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Reactor {
    /// Creates the poll instance and spawns the dispatch thread.
    pub fn start() -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let shared = Arc::new(Shared {
            pending: Mutex::new(Vec::new()),
            registry,
            waker,
            next_token: AtomicUsize::new(WAKE_TOKEN.0 + 1),
            running: AtomicBool::new(true),
        });

        let thread = thread::Builder::new()
            .name("idwdb-reactor".into())
            .spawn({
                let shared = Arc::clone(&shared);
                move || run(poll, shared)
            })?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Err(e) = self.shared.waker.wake() {
            error!("failed to wake reactor for shutdown: {e}");
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("reactor thread panicked");
            }
        }
        self.shared.fail_pending();
    }
}

fn run(mut poll: Poll, shared: Arc<Shared>) {
    let mut events = Events::with_capacity(EVENT_CAPACITY);
    debug!("reactor started");

    while shared.running.load(Ordering::Acquire) {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!("reactor poll failed: {e}");
            break;
        }
        trace!("reactor woke with {} event(s)", events.iter().count());

        shared.dispatch_ready();
    }

    shared.running.store(false, Ordering::Release);
    shared.fail_pending();
    debug!("reactor stopped");
}

/// Cheap, cloneable access to a running [`Reactor`].
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Arc<Shared>,
}

impl ReactorHandle {
    /// Registers `stream` for readiness notifications, returning its token.
    pub fn register(&self, stream: &mut TcpStream) -> io::Result<Token> {
        let token = Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed));
        self.shared
            .registry
            .register(stream, token, Interest::READABLE | Interest::WRITABLE)?;
        Ok(token)
    }

    pub fn deregister(&self, stream: &mut TcpStream) -> io::Result<()> {
        self.shared.registry.deregister(stream)
    }

    /// Adds `op` to the wait-set and returns immediately.
    pub fn post(&self, op: PendingOperation) {
        if !self.shared.running.load(Ordering::Acquire) {
            op.complete(Err(shut_down()));
            return;
        }

        {
            let mut pending = self.shared.pending();
            pending.push(op);
        }
        if !self.shared.running.load(Ordering::Acquire) {
            // Lost a race with shutdown; nobody will scan the registry again.
            self.shared.fail_pending();
            return;
        }
        self.wake();
    }

    /// Interrupts the current wait so the registry is rescanned.
    pub fn wake(&self) {
        if let Err(e) = self.shared.waker.wake() {
            error!("failed to wake reactor: {e}");
        }
    }

    pub fn pending_operations(&self) -> usize {
        self.shared.pending().len()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }
}
