//! Content digests: the only identity a stored file has.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest as _, Sha3_256};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of the read buffer used when hashing a stream.
pub const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DigestParseError {
    #[error("digest must be {expected} hex characters, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("digest contains a non-hex character")]
    InvalidHex,
}

/// A SHA3-256 content digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Lowercase hex form, used as the database key and in URLs.
    pub fn to_hex(&self) -> String {
        hex_encode(&self.0)
    }

    /// Digest of an in-memory buffer.
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(data);
        hasher.finalize()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

impl FromStr for Digest {
    type Err = DigestParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(DigestParseError::Length {
                expected: 64,
                actual: s.len(),
            });
        }

        let mut out = [0u8; 32];
        for (i, pair) in s.as_bytes().chunks(2).enumerate() {
            let hi = hex_value(pair[0]).ok_or(DigestParseError::InvalidHex)?;
            let lo = hex_value(pair[1]).ok_or(DigestParseError::InvalidHex)?;
            out[i] = (hi << 4) | lo;
        }
        Ok(Self(out))
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Incremental hasher; feed chunks with [`Hasher::update`].
#[derive(Clone, Default)]
pub struct Hasher {
    inner: Sha3_256,
}

impl Hasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
    }

    pub fn finalize(self) -> Digest {
        Digest(self.inner.finalize().into())
    }
}

/// Hash a stream chunk by chunk without buffering it.
pub async fn digest_reader<R>(reader: R) -> std::io::Result<Digest>
where
    R: AsyncRead + Unpin,
{
    digest_stream(reader, |_| Ok::<_, std::io::Error>(())).await
}

/// Hash a stream chunk by chunk, handing each chunk to `sink` as it is read. The first
/// error from `sink` stops the read.
pub async fn digest_stream<R, E, F>(mut reader: R, mut sink: F) -> Result<Digest, E>
where
    R: AsyncRead + Unpin,
    E: From<std::io::Error>,
    F: FnMut(&[u8]) -> Result<(), E>,
{
    let mut hasher = Hasher::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        sink(&buffer[..read])?;
        hasher.update(&buffer[..read]);
    }

    Ok(hasher.finalize())
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}
