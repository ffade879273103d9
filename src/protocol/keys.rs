//! RSA key material used by the handshake.
//!
//! Servers distribute keys as CryptoAPI key blobs, so both blob kinds are understood:
//!
//! ```text
//! ┌───────┬─────────┬──────────┬──────────┬───────────┬────────┬────────┬──────────────┐
//! │ type  │ version │ reserved │ key alg  │ magic     │ bitlen │ pubexp │ key material │
//! │ 1 byte│ 1 byte  │ u16 LE   │ u32 LE   │ RSA1/RSA2 │ u32 LE │ u32 LE │ little endian│
//! └───────┴─────────┴──────────┴──────────┴───────────┴────────┴────────┴──────────────┘
//! ```
//!
//! A public blob carries the modulus; a private blob adds both primes, both CRT exponents, the
//! CRT coefficient and the private exponent. PEM encoded PKCS#1 and PKCS#8 keys are accepted
//! as well. The client's identity is always derived from its public key in blob form.
use std::{fmt, fs, path::Path};

use bytes::{Buf, BufMut};
use rsa::{
    BigUint, RsaPrivateKey, RsaPublicKey,
    pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey},
    pkcs8::{DecodePrivateKey, DecodePublicKey},
    traits::{PrivateKeyParts, PublicKeyParts},
};
use sha2::{Digest, Sha512};
use thiserror::Error;

const PUBLIC_KEY_BLOB: u8 = 0x06;
const PRIVATE_KEY_BLOB: u8 = 0x07;
const BLOB_VERSION: u8 = 0x02;
const CALG_RSA_KEYX: u32 = 0x0000_a400;
const RSA1: u32 = 0x3141_5352;
const RSA2: u32 = 0x3241_5352;
const BLOB_HEADER_SIZE: usize = 8;
const RSA_HEADER_SIZE: usize = 12;

/// Length of the client identity sent during the handshake.
pub const IDENTITY_SIZE: usize = 16;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("[key blob]: {0}")]
    Blob(String),

    #[error("[key pem]: {0}")]
    Pem(String),

    #[error("invalid rsa key: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("failed to read key file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

struct BlobHeader {
    kind: u8,
    bits: usize,
    exponent: u32,
}

fn read_header(buf: &mut &[u8]) -> Result<BlobHeader, KeyError> {
    if buf.len() < BLOB_HEADER_SIZE + RSA_HEADER_SIZE {
        return Err(KeyError::Blob(format!("{} bytes is too short", buf.len())));
    }
    let kind = buf.get_u8();
    let version = buf.get_u8();
    let _reserved = buf.get_u16_le();
    let _algorithm = buf.get_u32_le();
    let magic = buf.get_u32_le();
    let bits = buf.get_u32_le() as usize;
    let exponent = buf.get_u32_le();

    if version != BLOB_VERSION {
        return Err(KeyError::Blob(format!("unsupported version {version}")));
    }
    match (kind, magic) {
        (PUBLIC_KEY_BLOB, RSA1) | (PRIVATE_KEY_BLOB, RSA2) => {}
        _ => {
            return Err(KeyError::Blob(format!(
                "unexpected blob type {kind:#04x} with magic {magic:#010x}"
            )));
        }
    }
    if bits == 0 || bits % 16 != 0 {
        return Err(KeyError::Blob(format!("invalid key length {bits}")));
    }
    Ok(BlobHeader {
        kind,
        bits,
        exponent,
    })
}

fn read_number(buf: &mut &[u8], len: usize, field: &str) -> Result<BigUint, KeyError> {
    if buf.len() < len {
        return Err(KeyError::Blob(format!(
            "{field} needs {len} bytes, {} remaining",
            buf.len()
        )));
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(BigUint::from_bytes_le(head))
}

fn put_number(out: &mut Vec<u8>, n: &BigUint, len: usize) {
    let mut bytes = n.to_bytes_le();
    bytes.resize(len, 0);
    out.put_slice(&bytes);
}

fn put_header(out: &mut Vec<u8>, kind: u8, magic: u32, key: &impl PublicKeyParts) -> usize {
    let bits = key.size() * 8;
    // The rsa crate caps public exponents well below 2^32.
    let exponent = key
        .e()
        .to_bytes_le()
        .iter()
        .take(4)
        .rev()
        .fold(0u32, |acc, b| (acc << 8) | u32::from(*b));

    out.put_u8(kind);
    out.put_u8(BLOB_VERSION);
    out.put_u16_le(0);
    out.put_u32_le(CALG_RSA_KEYX);
    out.put_u32_le(magic);
    out.put_u32_le(bits as u32);
    out.put_u32_le(exponent);
    bits
}

/// Imports the public half of a public or private key blob.
pub fn import_public_blob(blob: &[u8]) -> Result<RsaPublicKey, KeyError> {
    let mut buf = blob;
    let header = read_header(&mut buf)?;
    let modulus = read_number(&mut buf, header.bits / 8, "modulus")?;
    Ok(RsaPublicKey::new(modulus, BigUint::from(header.exponent))?)
}

pub fn import_private_blob(blob: &[u8]) -> Result<RsaPrivateKey, KeyError> {
    let mut buf = blob;
    let header = read_header(&mut buf)?;
    if header.kind != PRIVATE_KEY_BLOB {
        return Err(KeyError::Blob("expected a private key blob".into()));
    }
    let full = header.bits / 8;
    let half = header.bits / 16;

    let modulus = read_number(&mut buf, full, "modulus")?;
    let p = read_number(&mut buf, half, "prime1")?;
    let q = read_number(&mut buf, half, "prime2")?;
    // The CRT values are recomputed from the primes.
    read_number(&mut buf, half, "exponent1")?;
    read_number(&mut buf, half, "exponent2")?;
    read_number(&mut buf, half, "coefficient")?;
    let d = read_number(&mut buf, full, "private exponent")?;

    let key =
        RsaPrivateKey::from_components(modulus, BigUint::from(header.exponent), d, vec![p, q])?;
    key.validate()?;
    Ok(key)
}

pub fn export_public_blob(key: &RsaPublicKey) -> Vec<u8> {
    let mut out = Vec::new();
    let bits = put_header(&mut out, PUBLIC_KEY_BLOB, RSA1, key);
    put_number(&mut out, key.n(), bits / 8);
    out
}

pub fn export_private_blob(key: &RsaPrivateKey) -> Result<Vec<u8>, KeyError> {
    let [p, q] = key.primes() else {
        return Err(KeyError::Blob(
            "only two-prime keys can be exported".into(),
        ));
    };
    let one = BigUint::from(1u8);
    let dp = key.d() % &(p - &one);
    let dq = key.d() % &(q - &one);
    let coefficient = key
        .crt_coefficient()
        .ok_or_else(|| KeyError::Blob("missing CRT coefficient".into()))?;

    let mut out = Vec::new();
    let bits = put_header(&mut out, PRIVATE_KEY_BLOB, RSA2, key);
    let (full, half) = (bits / 8, bits / 16);
    put_number(&mut out, key.n(), full);
    put_number(&mut out, p, half);
    put_number(&mut out, q, half);
    put_number(&mut out, &dp, half);
    put_number(&mut out, &dq, half);
    put_number(&mut out, &coefficient, half);
    put_number(&mut out, key.d(), full);
    Ok(out)
}

fn is_pem(bytes: &[u8]) -> bool {
    bytes.trim_ascii_start().starts_with(b"-----BEGIN")
}

fn pem_text(bytes: &[u8]) -> Result<&str, KeyError> {
    std::str::from_utf8(bytes).map_err(|e| KeyError::Pem(e.to_string()))
}

/// Parses a public key from a blob or PEM. Private keys are accepted and reduced to their
/// public half.
pub fn parse_public_key(bytes: &[u8]) -> Result<RsaPublicKey, KeyError> {
    if !is_pem(bytes) {
        return import_public_blob(bytes);
    }
    let pem = pem_text(bytes)?;
    RsaPublicKey::from_public_key_pem(pem)
        .map_err(|e| KeyError::Pem(e.to_string()))
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem).map_err(|e| KeyError::Pem(e.to_string())))
        .or_else(|e| parse_private_key(bytes).map(|k| k.to_public_key()).map_err(|_| e))
}

pub fn parse_private_key(bytes: &[u8]) -> Result<RsaPrivateKey, KeyError> {
    if !is_pem(bytes) {
        return import_private_blob(bytes);
    }
    let pem = pem_text(bytes)?;
    RsaPrivateKey::from_pkcs8_pem(pem)
        .map_err(|e| KeyError::Pem(e.to_string()))
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem).map_err(|e| KeyError::Pem(e.to_string())))
}

fn read_file(path: &Path) -> Result<Vec<u8>, KeyError> {
    fs::read(path).map_err(|source| KeyError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Keys needed to authenticate one client against one server.
#[derive(Clone)]
pub struct Credentials {
    server: RsaPublicKey,
    client: RsaPrivateKey,
}

impl Credentials {
    pub fn new(server: RsaPublicKey, client: RsaPrivateKey) -> Self {
        Self { server, client }
    }

    pub fn from_blobs(server: &[u8], client: &[u8]) -> Result<Self, KeyError> {
        Ok(Self::new(
            import_public_blob(server)?,
            import_private_blob(client)?,
        ))
    }

    /// Reads both keys from disk. Each file may hold a key blob or a PEM document.
    pub fn load(server: impl AsRef<Path>, client: impl AsRef<Path>) -> Result<Self, KeyError> {
        Ok(Self::new(
            parse_public_key(&read_file(server.as_ref())?)?,
            parse_private_key(&read_file(client.as_ref())?)?,
        ))
    }

    pub fn server_key(&self) -> &RsaPublicKey {
        &self.server
    }

    pub fn client_key(&self) -> &RsaPrivateKey {
        &self.client
    }

    /// First 16 bytes of the SHA-512 of the client's public key blob.
    pub fn identity(&self) -> [u8; IDENTITY_SIZE] {
        let digest = Sha512::digest(export_public_blob(&self.client.to_public_key()));
        let mut identity = [0; IDENTITY_SIZE];
        identity.copy_from_slice(&digest[..IDENTITY_SIZE]);
        identity
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let identity: String = self.identity().iter().map(|b| format!("{b:02x}")).collect();
        f.debug_struct("Credentials")
            .field("server_bits", &(self.server.size() * 8))
            .field("identity", &identity)
            .finish_non_exhaustive()
    }
}
