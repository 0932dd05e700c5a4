//! Content Fingerprinting
//!
//! A [`ContentAddress`] is the SHA-256 digest of an artifact's bytes and is the
//! identity used for verification. Hashing is always incremental: callers can
//! feed chunks through [`Fingerprinter`], stream a reader through
//! [`ContentFingerprinter::digest_reader`] / [`ContentFingerprinter::digest_async_reader`],
//! or hash an in-memory buffer with [`ContentFingerprinter::digest_cooperative`],
//! which yields to the scheduler so large artifacts do not stall other requests.

use std::fmt;
use std::io::Read;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Read/hash chunk size.
const CHUNK_SIZE: usize = 64 * 1024;

/// Cooperative hashing yields after this many bytes.
const YIELD_EVERY_BYTES: usize = 1024 * 1024;

// ---------------------------------------------------------------------------
// ContentAddress
// ---------------------------------------------------------------------------

/// SHA-256 digest of an artifact. Rendered as 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentAddress([u8; 32]);

impl ContentAddress {
    /// Digest length in bytes.
    pub const LEN: usize = 32;

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, ContentAddressError> {
        if s.len() != Self::LEN * 2 {
            return Err(ContentAddressError::InvalidLength {
                expected: Self::LEN * 2,
                actual: s.len(),
            });
        }
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out)
            .map_err(|e| ContentAddressError::InvalidHex(e.to_string()))?;
        Ok(Self(out))
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentAddress({})", self.to_hex())
    }
}

impl FromStr for ContentAddress {
    type Err = ContentAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl TryFrom<String> for ContentAddress {
    type Error = ContentAddressError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_hex(&s)
    }
}

impl From<ContentAddress> for String {
    fn from(address: ContentAddress) -> Self {
        address.to_hex()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContentAddressError {
    #[error("content address must be {expected} hex characters, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("content address is not valid hex: {0}")]
    InvalidHex(String),
}

// ---------------------------------------------------------------------------
// Fingerprinter (incremental)
// ---------------------------------------------------------------------------

/// Incremental SHA-256 state. Feed chunks with [`update`](Self::update) and
/// call [`finalize`](Self::finalize) once the artifact is exhausted.
#[derive(Clone, Default)]
pub struct Fingerprinter {
    hasher: Sha256,
    bytes_hashed: u64,
}

impl Fingerprinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes_hashed += chunk.len() as u64;
    }

    /// Total bytes fed so far.
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes_hashed
    }

    pub fn finalize(self) -> ContentAddress {
        ContentAddress(self.hasher.finalize().into())
    }
}

// ---------------------------------------------------------------------------
// ContentFingerprinter
// ---------------------------------------------------------------------------

/// Stateless digest entry points. Every function is pure and thread-safe.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentFingerprinter;

impl ContentFingerprinter {
    /// Digest an in-memory buffer in one call.
    pub fn digest(bytes: &[u8]) -> ContentAddress {
        let mut fp = Fingerprinter::new();
        for chunk in bytes.chunks(CHUNK_SIZE) {
            fp.update(chunk);
        }
        fp.finalize()
    }

    /// Digest a blocking reader without materializing it in memory.
    pub fn digest_reader<R: Read>(mut reader: R) -> std::io::Result<ContentAddress> {
        let mut fp = Fingerprinter::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            fp.update(&buf[..n]);
        }
        Ok(fp.finalize())
    }

    /// Digest an async reader. Returns the address and the number of bytes read.
    pub async fn digest_async_reader<R>(reader: &mut R) -> std::io::Result<(ContentAddress, u64)>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut fp = Fingerprinter::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            fp.update(&buf[..n]);
        }
        let len = fp.bytes_hashed();
        Ok((fp.finalize(), len))
    }

    /// Digest an in-memory buffer, yielding to the runtime every
    /// `YIELD_EVERY_BYTES` so a large artifact cannot monopolise the executor
    /// thread. Produces exactly the same address as [`digest`](Self::digest).
    pub async fn digest_cooperative(bytes: &[u8]) -> ContentAddress {
        let mut fp = Fingerprinter::new();
        let mut since_yield = 0usize;
        for chunk in bytes.chunks(CHUNK_SIZE) {
            fp.update(chunk);
            since_yield += chunk.len();
            if since_yield >= YIELD_EVERY_BYTES {
                since_yield = 0;
                tokio::task::yield_now().await;
            }
        }
        fp.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
    const HELLO_WORLD_SHA256: &str =
        "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_known_vectors() {
        assert_eq!(ContentFingerprinter::digest(b"").to_hex(), EMPTY_SHA256);
        assert_eq!(
            ContentFingerprinter::digest(b"hello world").to_hex(),
            HELLO_WORLD_SHA256
        );
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

        let mut fp = Fingerprinter::new();
        for chunk in data.chunks(777) {
            fp.update(chunk);
        }
        assert_eq!(fp.bytes_hashed(), data.len() as u64);
        assert_eq!(fp.finalize(), ContentFingerprinter::digest(&data));
    }

    #[test]
    fn test_reader_matches_bytes() {
        let data = b"Budget 2024 appropriations".repeat(10_000);
        let from_reader = ContentFingerprinter::digest_reader(std::io::Cursor::new(&data)).unwrap();
        assert_eq!(from_reader, ContentFingerprinter::digest(&data));
    }

    #[tokio::test]
    async fn test_async_reader_and_cooperative_match() {
        let data = vec![0xA5u8; 3 * 1024 * 1024 + 17];
        let expected = ContentFingerprinter::digest(&data);

        let mut reader: &[u8] = &data;
        let (address, len) = ContentFingerprinter::digest_async_reader(&mut reader)
            .await
            .unwrap();
        assert_eq!(address, expected);
        assert_eq!(len, data.len() as u64);

        assert_eq!(ContentFingerprinter::digest_cooperative(&data).await, expected);
    }

    #[test]
    fn test_hex_roundtrip_and_errors() {
        let address = ContentFingerprinter::digest(b"AAA");
        let parsed: ContentAddress = address.to_hex().parse().unwrap();
        assert_eq!(parsed, address);

        assert_eq!(
            ContentAddress::from_hex("abc"),
            Err(ContentAddressError::InvalidLength {
                expected: 64,
                actual: 3
            })
        );
        let not_hex = "zz".repeat(32);
        assert!(matches!(
            ContentAddress::from_hex(&not_hex),
            Err(ContentAddressError::InvalidHex(_))
        ));
    }

    #[test]
    fn test_serde_as_hex_string() {
        let address = ContentFingerprinter::digest(b"hello world");
        let json = serde_json::to_string(&address).unwrap();
        assert_eq!(json, format!("\"{}\"", HELLO_WORLD_SHA256));

        let back: ContentAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, address);

        assert!(serde_json::from_str::<ContentAddress>("\"nope\"").is_err());
    }
}
