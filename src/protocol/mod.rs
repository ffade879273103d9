//! Connection stack between the client and an IDWDB server.
//!
//! # Overview
//!
//! Every message travels through the same layers, top to bottom:
//!
//! - [`SecureSession`]: handshake and the encrypted envelope around each message.
//! - [`MessageChannel`]: length-prefixed frames, reassembled from partial reads.
//! - [`AsyncSocket`]: single-shot send/receive operations, one in flight at a time.
//! - [`Reactor`]: the process-wide dispatch thread that completes those operations.
//!
//! Responses unwind the same path in reverse: the reactor completes a receive, the channel
//! reassembles the frame and the session decrypts it.
//!
//! # Binary Format
//!
//! All integers are little-endian. The channel prefixes every frame with an `i32` length; the
//! session adds an inner `i32` length in front of the plaintext before padding it to the
//! cipher block size.
//!
//! # See Also
//!
//! - [`query`](crate::query): Encodes the payload of query messages.
//! - [`client`](crate::client): Drives the request/acknowledgment exchange over a session.
pub mod channel;
pub mod keys;
pub mod reactor;
pub mod session;
pub mod socket;

pub use channel::{MessageChannel, TransportError};
pub use keys::{Credentials, KeyError};
pub use reactor::{Reactor, ReactorHandle};
pub use session::{SecureSession, SessionError};
pub use socket::{AsyncSocket, SocketError};
