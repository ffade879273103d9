use std::{
    future::Future,
    io,
    net::{Shutdown, SocketAddr},
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
};

use futures::channel::oneshot;
use log::{trace, warn};
use mio::{Token, net::TcpStream};
use thiserror::Error;

use super::reactor::{OperationKind, PendingOperation, ReactorHandle};

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("[socket] range {offset}+{count} exceeds buffer of {len} bytes")]
    OutOfBounds {
        offset: usize,
        count: usize,
        len: usize,
    },

    #[error("[socket] I/O operation already pending")]
    OperationPending,

    #[error("[socket] transmit error: sent {sent} of {expected} bytes")]
    Transmit { expected: usize, sent: usize },

    #[error("[socket] completion dropped before the operation finished")]
    Cancelled,

    #[error("Socket IO Error: {0}")]
    Io(#[from] io::Error),
}

/// Single-shot asynchronous operations over one TCP stream.
///
/// At most one operation, in either direction, may be outstanding at a time. Issuing another
/// while one is in flight fails immediately with [`SocketError::OperationPending`].
pub struct AsyncSocket {
    stream: Arc<TcpStream>,
    token: Token,
    reactor: ReactorHandle,
    in_flight: Arc<AtomicBool>,
}

/// Completion of an operation issued on an [`AsyncSocket`]. Resolves to the transferred byte
/// count and the buffer that was moved into the operation.
pub struct Transfer {
    kind: OperationKind,
    count: usize,
    rx: oneshot::Receiver<(io::Result<usize>, Vec<u8>)>,
}

impl Future for Transfer {
    type Output = Result<(usize, Vec<u8>), SocketError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let (res, buffer) = match Pin::new(&mut self.rx).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(oneshot::Canceled)) => return Poll::Ready(Err(SocketError::Cancelled)),
            Poll::Ready(Ok(done)) => done,
        };

        let transferred = match res {
            Ok(n) => n,
            Err(e) => return Poll::Ready(Err(e.into())),
        };
        if self.kind == OperationKind::Send && transferred != self.count {
            return Poll::Ready(Err(SocketError::Transmit {
                expected: self.count,
                sent: transferred,
            }));
        }
        Poll::Ready(Ok((transferred, buffer)))
    }
}

impl AsyncSocket {
    /// Opens a TCP connection to `addr` without blocking the caller.
    pub async fn connect(reactor: ReactorHandle, addr: SocketAddr) -> Result<Self, SocketError> {
        let stream = TcpStream::connect(addr)?;
        let socket = Self::register(reactor, stream)?;
        socket.issue(OperationKind::Connect, Vec::new(), 0, 0)?.await?;
        trace!("connected to {addr}");
        Ok(socket)
    }

    /// Adopts an already connected standard library stream.
    pub fn from_std(reactor: ReactorHandle, stream: std::net::TcpStream) -> Result<Self, SocketError> {
        stream.set_nonblocking(true)?;
        Self::register(reactor, TcpStream::from_std(stream))
    }

    fn register(reactor: ReactorHandle, mut stream: TcpStream) -> Result<Self, SocketError> {
        let token = reactor.register(&mut stream)?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("failed to disable Nagle's algorithm: {e}");
        }
        Ok(Self {
            stream: Arc::new(stream),
            token,
            reactor,
            in_flight: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Writes `buffer[offset..offset + count]`. A completion that moved fewer than `count` bytes
    /// resolves to [`SocketError::Transmit`].
    pub fn send_async(
        &self,
        buffer: Vec<u8>,
        offset: usize,
        count: usize,
    ) -> Result<Transfer, SocketError> {
        self.issue(OperationKind::Send, buffer, offset, count)
    }

    /// Reads at most `count` bytes into `buffer[offset..]`. Zero bytes means the peer closed.
    pub fn receive_async(
        &self,
        buffer: Vec<u8>,
        offset: usize,
        count: usize,
    ) -> Result<Transfer, SocketError> {
        self.issue(OperationKind::Receive, buffer, offset, count)
    }

    fn issue(
        &self,
        kind: OperationKind,
        buffer: Vec<u8>,
        offset: usize,
        count: usize,
    ) -> Result<Transfer, SocketError> {
        match offset.checked_add(count) {
            Some(end) if end <= buffer.len() => {}
            _ => {
                return Err(SocketError::OutOfBounds {
                    offset,
                    count,
                    len: buffer.len(),
                });
            }
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SocketError::OperationPending);
        }

        let (tx, rx) = oneshot::channel();
        let in_flight = Arc::clone(&self.in_flight);
        let op = PendingOperation::new(
            kind,
            Arc::clone(&self.stream),
            buffer,
            offset,
            count,
            Box::new(move |res, buffer| {
                in_flight.store(false, Ordering::Release);
                // The receiver is gone only when the caller stopped waiting.
                let _ = tx.send((res, buffer));
            }),
        );
        self.reactor.post(op);

        Ok(Transfer { kind, count, rx })
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// Shuts both directions of the transport down. A pending operation completes with zero
    /// bytes or an error.
    pub fn close(&self) -> io::Result<()> {
        let res = self.stream.shutdown(Shutdown::Both);
        self.reactor.wake();
        res
    }
}

impl Drop for AsyncSocket {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            trace!("socket close: {e}");
        }
        if let Some(stream) = Arc::get_mut(&mut self.stream) {
            if let Err(e) = self.reactor.deregister(stream) {
                trace!("socket deregister: {e}");
            }
        }
    }
}
