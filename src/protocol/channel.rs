use bytes::{Buf, BufMut};
use log::trace;
use thiserror::Error;

use super::socket::{AsyncSocket, SocketError};

/// Size of the little-endian length prefix in front of every frame.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Default upper bound on an incoming frame.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport socket error: {0}")]
    Socket(#[from] SocketError),

    #[error("the remote host closed the connection in the middle of a frame")]
    ConnectionClosed,

    #[error("invalid frame length {0}")]
    InvalidLength(i32),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
}

/// Length-prefixed framing over an [`AsyncSocket`].
pub struct MessageChannel {
    socket: AsyncSocket,
    max_message_size: usize,
}

impl MessageChannel {
    pub fn new(socket: AsyncSocket) -> Self {
        Self::with_limit(socket, DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_limit(socket: AsyncSocket, max_message_size: usize) -> Self {
        Self {
            socket,
            max_message_size,
        }
    }

    pub fn socket(&self) -> &AsyncSocket {
        &self.socket
    }

    /// Writes `payload` behind its 4-byte length as one socket operation.
    pub async fn send_message(&self, payload: &[u8]) -> Result<(), TransportError> {
        let len = i32::try_from(payload.len()).map_err(|_| TransportError::TooLarge {
            len: payload.len(),
            max: i32::MAX as usize,
        })?;
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.put_i32_le(len);
        frame.put_slice(payload);

        let count = frame.len();
        self.socket.send_async(frame, 0, count)?.await?;
        trace!("sent frame of {len} bytes");
        Ok(())
    }

    /// Reads the next frame. `None` means the peer closed the connection cleanly before a new
    /// frame started.
    pub async fn read_message(&self) -> Result<Option<Vec<u8>>, TransportError> {
        let header = match self.read_exact(FRAME_HEADER_SIZE, true).await? {
            Some(header) => header,
            None => return Ok(None),
        };
        let len = header.as_slice().get_i32_le();
        let len = usize::try_from(len).map_err(|_| TransportError::InvalidLength(len))?;
        if len > self.max_message_size {
            return Err(TransportError::TooLarge {
                len,
                max: self.max_message_size,
            });
        }

        let body = self.read_exact(len, false).await?;
        trace!("received frame of {len} bytes");
        Ok(body)
    }

    /// Re-issues receives until `len` bytes arrived.
    async fn read_exact(
        &self,
        len: usize,
        eof_allowed: bool,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let mut buffer = vec![0; len];
        let mut received = 0;
        while received < len {
            let (n, buf) = self
                .socket
                .receive_async(buffer, received, len - received)?
                .await?;
            buffer = buf;

            if n == 0 {
                if eof_allowed && received == 0 {
                    return Ok(None);
                }
                return Err(TransportError::ConnectionClosed);
            }
            received += n;
        }
        Ok(Some(buffer))
    }

    /// Shuts the transport down.
    pub fn close(&self) -> std::io::Result<()> {
        self.socket.close()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::TcpListener,
        thread,
        time::Duration,
    };

    use futures::executor::block_on;

    use crate::protocol::Reactor;

    use super::*;

    fn pair(reactor: &Reactor) -> (MessageChannel, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        let socket = AsyncSocket::from_std(reactor.handle(), client).unwrap();
        (MessageChannel::with_limit(socket, 1024), server)
    }

    #[test]
    fn send_message_frames_payload() {
        let reactor = Reactor::start().unwrap();
        let (channel, mut server) = pair(&reactor);

        block_on(channel.send_message(b"hello")).unwrap();

        let mut buf = [0; 9];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..4], 5i32.to_le_bytes());
        assert_eq!(&buf[4..], b"hello");
    }

    #[test]
    fn read_message_reassembles_partial_reads() {
        let reactor = Reactor::start().unwrap();
        let (channel, mut server) = pair(&reactor);

        let writer = thread::spawn(move || {
            let mut frame = 6i32.to_le_bytes().to_vec();
            frame.extend_from_slice(b"abcdef");
            for chunk in frame.chunks(3) {
                server.write_all(chunk).unwrap();
                server.flush().unwrap();
                thread::sleep(Duration::from_millis(20));
            }
            server
        });

        let msg = block_on(channel.read_message()).unwrap();
        assert_eq!(msg.as_deref(), Some(&b"abcdef"[..]));
        writer.join().unwrap();
    }

    #[test]
    fn empty_frame_is_a_message() {
        let reactor = Reactor::start().unwrap();
        let (channel, mut server) = pair(&reactor);

        server.write_all(&0i32.to_le_bytes()).unwrap();
        assert_eq!(block_on(channel.read_message()).unwrap(), Some(Vec::new()));
    }

    #[test]
    fn closed_before_header_is_none() {
        let reactor = Reactor::start().unwrap();
        let (channel, server) = pair(&reactor);

        drop(server);
        assert_eq!(block_on(channel.read_message()).unwrap(), None);
    }

    #[test]
    fn closed_mid_frame_is_an_error() {
        let reactor = Reactor::start().unwrap();
        let (channel, mut server) = pair(&reactor);

        server.write_all(&10i32.to_le_bytes()).unwrap();
        server.write_all(b"abc").unwrap();
        drop(server);

        assert!(matches!(
            block_on(channel.read_message()),
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[test]
    fn frame_limits() {
        let reactor = Reactor::start().unwrap();
        let (channel, mut server) = pair(&reactor);

        server.write_all(&(-1i32).to_le_bytes()).unwrap();
        assert!(matches!(
            block_on(channel.read_message()),
            Err(TransportError::InvalidLength(-1))
        ));

        server.write_all(&4096i32.to_le_bytes()).unwrap();
        assert!(matches!(
            block_on(channel.read_message()),
            Err(TransportError::TooLarge { len: 4096, max: 1024 })
        ));
    }
}
