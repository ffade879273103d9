//! In-process server used by the unit tests.
use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::OnceLock,
    thread::{self, JoinHandle},
};

use rand::{RngCore, rngs::OsRng};
use rsa::{Oaep, RsaPrivateKey};

use crate::protocol::{
    keys::Credentials,
    session::{CHALLENGE_SIZE, CipherPair, SESSION_KEY_SIZE},
};

const TEST_KEY_BITS: usize = 1024;

fn generate() -> RsaPrivateKey {
    RsaPrivateKey::new(&mut OsRng, TEST_KEY_BITS).unwrap()
}

pub fn server_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(generate)
}

pub fn client_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(generate)
}

pub fn credentials() -> Credentials {
    Credentials::new(server_key().to_public_key(), client_key().clone())
}

pub fn read_frame(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut header = [0; 4];
    stream.read_exact(&mut header).ok()?;
    let mut body = vec![0; i32::from_le_bytes(header) as usize];
    stream.read_exact(&mut body).ok()?;
    Some(body)
}

pub fn write_frame(stream: &mut TcpStream, payload: &[u8]) {
    let mut frame = (payload.len() as i32).to_le_bytes().to_vec();
    frame.extend_from_slice(payload);
    stream.write_all(&frame).unwrap();
}

/// How the scripted server answers the handshake.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Handshake {
    Honest,
    WrongChallenge,
    Hangup,
}

/// Server side of an established encrypted session.
pub struct ServerSession {
    pub stream: TcpStream,
    ciphers: CipherPair,
}

impl ServerSession {
    pub fn receive(&mut self) -> Option<Vec<u8>> {
        let frame = read_frame(&mut self.stream)?;
        Some(self.ciphers.open(frame).unwrap())
    }

    pub fn send(&mut self, payload: &[u8]) {
        let sealed = self.ciphers.seal(payload).unwrap();
        write_frame(&mut self.stream, &sealed);
    }
}

fn accept(mut stream: TcpStream, mode: Handshake) -> Option<ServerSession> {
    let hello = read_frame(&mut stream)?;
    let hello = server_key()
        .decrypt(Oaep::new::<sha1::Sha1>(), &hello)
        .unwrap();
    assert_eq!(&hello[..16], credentials().identity());
    if mode == Handshake::Hangup {
        return None;
    }

    let mut key = [0u8; SESSION_KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    let mut reply = key.to_vec();
    reply.extend_from_slice(&hello[16..16 + CHALLENGE_SIZE]);
    if mode == Handshake::WrongChallenge {
        reply[SESSION_KEY_SIZE] ^= 0x01;
    }
    let reply = client_key()
        .to_public_key()
        .encrypt(&mut OsRng, Oaep::new::<sha1::Sha1>(), &reply)
        .unwrap();
    write_frame(&mut stream, &reply);
    if mode == Handshake::WrongChallenge {
        return None;
    }

    let mut session = ServerSession {
        stream,
        ciphers: CipherPair::new(&key).unwrap(),
    };
    assert_eq!(session.receive().unwrap(), b"");
    Some(session)
}

/// Accepts connections one by one, runs the handshake and hands each established session to
/// `script`.
pub fn spawn_server<F>(mode: Handshake, script: F) -> (SocketAddr, JoinHandle<()>)
where
    F: FnOnce(ServerSession) + Send + 'static,
{
    spawn_plain_server(move |stream| {
        if let Some(session) = accept(stream, mode) {
            script(session);
        }
    })
}

/// Like [`spawn_server`] for several consecutive connections, used by reconnect tests.
pub fn spawn_server_for<F>(connections: usize, mut script: F) -> (SocketAddr, JoinHandle<()>)
where
    F: FnMut(usize, ServerSession) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        for n in 0..connections {
            let (stream, _) = listener.accept().unwrap();
            if let Some(session) = accept(stream, Handshake::Honest) {
                script(n, session);
            }
        }
    });
    (addr, handle)
}

pub fn spawn_plain_server<F>(script: F) -> (SocketAddr, JoinHandle<()>)
where
    F: FnOnce(TcpStream) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        script(stream);
    });
    (addr, handle)
}
