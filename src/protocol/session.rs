//! Authenticated, encrypted message exchange on top of a [`MessageChannel`].
//!
//! # Overview
//!
//! A session is created once per physical connection by running the handshake:
//!
//! 1. The client draws a random 16-byte challenge.
//! 2. It sends `identity || challenge` encrypted with the server's RSA key (OAEP, SHA-1).
//! 3. The server answers with `session key (32) || challenge (16)` encrypted with the
//!    client's RSA key. The echoed challenge must match exactly.
//! 4. The session key is installed into AES-256-CBC with an all-zero IV. The encryptor and
//!    decryptor are independent and keep their chaining state across messages.
//! 5. The client sends an empty encrypted message as acknowledgment.
//!
//! # Envelope
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────────────────────┐
//! │ inner length │ payload      │ zero padding                 │
//! │ i32 LE       │ length bytes │ up to the next 16-byte block │
//! └──────────────┴──────────────┴──────────────────────────────┘
//! ```
//!
//! The whole buffer is encrypted and handed to the channel, which adds its own outer length.
//! A buffer that is already block aligned still receives one full block of padding.
use aes::Aes256;
use bytes::{Buf, BufMut};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, generic_array::GenericArray};
use log::{debug, trace};
use rand::{RngCore, rngs::OsRng};
use rsa::Oaep;
use thiserror::Error;

use super::{
    channel::{MessageChannel, TransportError},
    keys::Credentials,
};

pub const CHALLENGE_SIZE: usize = 16;
pub const SESSION_KEY_SIZE: usize = 32;
pub const BLOCK_SIZE: usize = 16;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("[handshake]: challenge mismatch, possible man-in-the-middle or protocol desync")]
    ChallengeMismatch,

    #[error("[handshake]: {0}")]
    Handshake(String),

    #[error("[handshake]: rsa failure: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("[envelope]: {0}")]
    Envelope(String),
}

type Encryptor = cbc::Encryptor<Aes256>;
type Decryptor = cbc::Decryptor<Aes256>;

/// Paired AES-256-CBC transforms sharing one session key.
pub(crate) struct CipherPair {
    encryptor: Encryptor,
    decryptor: Decryptor,
}

impl CipherPair {
    pub(crate) fn new(key: &[u8]) -> Result<Self, SessionError> {
        let iv = [0u8; BLOCK_SIZE];
        let invalid = |_| SessionError::Handshake(format!("invalid session key of {} bytes", key.len()));
        Ok(Self {
            encryptor: Encryptor::new_from_slices(key, &iv).map_err(invalid)?,
            decryptor: Decryptor::new_from_slices(key, &iv).map_err(invalid)?,
        })
    }

    pub(crate) fn seal(&mut self, payload: &[u8]) -> Result<Vec<u8>, SessionError> {
        let len = i32::try_from(payload.len())
            .map_err(|_| SessionError::Envelope(format!("payload of {} bytes", payload.len())))?;
        let mut aligned = 4 + payload.len();
        aligned += BLOCK_SIZE - aligned % BLOCK_SIZE;

        let mut buf = Vec::with_capacity(aligned);
        buf.put_i32_le(len);
        buf.put_slice(payload);
        buf.resize(aligned, 0);

        for block in buf.chunks_exact_mut(BLOCK_SIZE) {
            self.encryptor
                .encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        Ok(buf)
    }

    pub(crate) fn open(&mut self, mut ciphertext: Vec<u8>) -> Result<Vec<u8>, SessionError> {
        if ciphertext.len() < BLOCK_SIZE || ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(SessionError::Envelope(format!(
                "ciphertext of {} bytes is not block aligned",
                ciphertext.len()
            )));
        }
        for block in ciphertext.chunks_exact_mut(BLOCK_SIZE) {
            self.decryptor
                .decrypt_block_mut(GenericArray::from_mut_slice(block));
        }

        let len = (&ciphertext[..4]).get_i32_le();
        let available = ciphertext.len() - 4;
        match usize::try_from(len) {
            Ok(len) if len <= available => {
                ciphertext.drain(..4);
                ciphertext.truncate(len);
                Ok(ciphertext)
            }
            _ => Err(SessionError::Envelope(format!(
                "inner length {len} exceeds {available} decrypted bytes"
            ))),
        }
    }
}

enum Envelope {
    #[cfg_attr(not(any(test, feature = "local-bypass")), allow(dead_code))]
    Plaintext,
    Encrypted(CipherPair),
}

/// An established connection whose messages are wrapped in the session envelope.
pub struct SecureSession {
    channel: MessageChannel,
    envelope: Envelope,
}

fn oaep() -> Oaep {
    Oaep::new::<sha1::Sha1>()
}

impl SecureSession {
    /// Runs the handshake over a freshly connected channel.
    pub async fn establish(
        channel: MessageChannel,
        credentials: &Credentials,
    ) -> Result<Self, SessionError> {
        let mut challenge = [0u8; CHALLENGE_SIZE];
        OsRng.fill_bytes(&mut challenge);

        let mut hello = Vec::with_capacity(2 * CHALLENGE_SIZE);
        hello.put_slice(&credentials.identity());
        hello.put_slice(&challenge);
        let hello = credentials
            .server_key()
            .encrypt(&mut OsRng, oaep(), &hello)?;
        channel.send_message(&hello).await?;
        trace!("handshake request sent");

        let reply = channel
            .read_message()
            .await?
            .ok_or_else(|| SessionError::Handshake("connection closed by server".into()))?;
        let reply = credentials.client_key().decrypt(oaep(), &reply)?;
        if reply.len() < SESSION_KEY_SIZE + CHALLENGE_SIZE {
            return Err(SessionError::Handshake(format!(
                "reply of {} bytes is too short",
                reply.len()
            )));
        }
        let (key, echoed) = reply.split_at(SESSION_KEY_SIZE);
        if echoed[..CHALLENGE_SIZE] != challenge {
            return Err(SessionError::ChallengeMismatch);
        }

        let mut session = Self {
            channel,
            envelope: Envelope::Encrypted(CipherPair::new(key)?),
        };
        session.send(&[]).await?;
        debug!("secure session established");
        Ok(session)
    }

    /// Skips the handshake for servers reachable only from the local machine. The secret is
    /// sent in the clear and every later message travels unencrypted.
    #[cfg(any(test, feature = "local-bypass"))]
    pub async fn bypass(channel: MessageChannel, secret: &[u8]) -> Result<Self, SessionError> {
        channel.send_message(secret).await?;
        debug!("plaintext session established");
        Ok(Self {
            channel,
            envelope: Envelope::Plaintext,
        })
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.envelope, Envelope::Encrypted(_))
    }

    pub fn channel(&self) -> &MessageChannel {
        &self.channel
    }

    pub async fn send(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        match &mut self.envelope {
            Envelope::Plaintext => self.channel.send_message(payload).await?,
            Envelope::Encrypted(ciphers) => {
                let sealed = ciphers.seal(payload)?;
                self.channel.send_message(&sealed).await?;
            }
        }
        Ok(())
    }

    /// Receives the next message. `None` means the server closed the connection.
    pub async fn receive(&mut self) -> Result<Option<Vec<u8>>, SessionError> {
        let Some(message) = self.channel.read_message().await? else {
            return Ok(None);
        };
        match &mut self.envelope {
            Envelope::Plaintext => Ok(Some(message)),
            Envelope::Encrypted(ciphers) => ciphers.open(message).map(Some),
        }
    }

    pub fn close(&self) -> std::io::Result<()> {
        self.channel.close()
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;

    use crate::{
        protocol::{AsyncSocket, Reactor},
        testing::{self, Handshake},
    };

    use super::*;

    fn pair() -> (CipherPair, CipherPair) {
        let key = [7u8; SESSION_KEY_SIZE];
        (CipherPair::new(&key).unwrap(), CipherPair::new(&key).unwrap())
    }

    #[test]
    fn envelope_padding() {
        let (mut client, _) = pair();

        assert_eq!(client.seal(b"").unwrap().len(), 16);
        assert_eq!(client.seal(&[1; 11]).unwrap().len(), 16);
        // 4 + 12 is already aligned and still gains a block.
        assert_eq!(client.seal(&[1; 12]).unwrap().len(), 32);
        assert_eq!(client.seal(&[1; 13]).unwrap().len(), 32);

        let (mut client, mut server) = pair();
        for payload in [&b""[..], &[1; 11], &[1; 12], &[1; 13]] {
            let sealed = client.seal(payload).unwrap();
            assert_eq!(server.open(sealed).unwrap(), payload);
        }
    }

    #[test]
    fn chaining_spans_messages() {
        let (mut client, mut server) = pair();

        let first = client.seal(b"same").unwrap();
        let second = client.seal(b"same").unwrap();
        assert_ne!(first, second);

        assert_eq!(server.open(first).unwrap(), b"same");
        assert_eq!(server.open(second).unwrap(), b"same");
    }

    #[test]
    fn open_rejects_bad_input() {
        let (_, mut server) = pair();
        assert!(matches!(
            server.open(vec![0; 15]),
            Err(SessionError::Envelope(_))
        ));

        // A frame sealed under another key decrypts to garbage.
        let mut other = CipherPair::new(&[9u8; SESSION_KEY_SIZE]).unwrap();
        let sealed = other.seal(&[0; 60]).unwrap();
        let opened = server.open(sealed);
        assert!(!matches!(opened, Ok(ref bytes) if bytes == &[0; 60]));

        assert!(CipherPair::new(&[0; 31]).is_err());
    }

    #[test]
    fn handshake_then_exchange() {
        let reactor = Reactor::start().unwrap();
        let (addr, server) = testing::spawn_server(Handshake::Honest, |mut session| {
            let message = session.receive().unwrap();
            session.send(&message);
        });

        let socket = block_on(AsyncSocket::connect(reactor.handle(), addr)).unwrap();
        let mut session =
            block_on(SecureSession::establish(MessageChannel::new(socket), &testing::credentials()))
                .unwrap();
        assert!(session.is_encrypted());

        block_on(session.send(b"ping")).unwrap();
        assert_eq!(block_on(session.receive()).unwrap().unwrap(), b"ping");
        server.join().unwrap();

        assert_eq!(block_on(session.receive()).unwrap(), None);
    }

    #[test]
    #[should_panic(expected = "ChallengeMismatch")]
    fn handshake_rejects_wrong_challenge() {
        let reactor = Reactor::start().unwrap();
        let (addr, _server) = testing::spawn_server(Handshake::WrongChallenge, |_| {});

        let socket = block_on(AsyncSocket::connect(reactor.handle(), addr)).unwrap();
        block_on(SecureSession::establish(
            MessageChannel::new(socket),
            &testing::credentials(),
        ))
        .unwrap();
    }

    #[test]
    fn handshake_with_closed_server() {
        let reactor = Reactor::start().unwrap();
        let (addr, _server) = testing::spawn_server(Handshake::Hangup, |_| {});

        let socket = block_on(AsyncSocket::connect(reactor.handle(), addr)).unwrap();
        let res = block_on(SecureSession::establish(
            MessageChannel::new(socket),
            &testing::credentials(),
        ));
        assert!(matches!(res, Err(SessionError::Handshake(_))));
    }

    #[test]
    fn bypass_sends_plaintext() {
        let reactor = Reactor::start().unwrap();
        let (addr, server) = testing::spawn_plain_server(|mut stream| {
            assert_eq!(testing::read_frame(&mut stream).unwrap(), b"secret");
            assert_eq!(testing::read_frame(&mut stream).unwrap(), b"hello");
        });

        let socket = block_on(AsyncSocket::connect(reactor.handle(), addr)).unwrap();
        let mut session =
            block_on(SecureSession::bypass(MessageChannel::new(socket), b"secret")).unwrap();
        assert!(!session.is_encrypted());

        block_on(session.send(b"hello")).unwrap();
        server.join().unwrap();
    }
}
