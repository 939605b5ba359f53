//! Content digests and streaming SHA-256 helpers.
//!
//! A [`Digest`] is the canonical `sha256:<64 lowercase hex>` identifier
//! used throughout the pipeline: layer descriptors, config blobs,
//! manifests, and cache keys are all addressed by it. Hashing is always
//! performed inline with I/O via [`HashingWriter`] and [`HashingReader`]
//! so a blob is read once and never buffered solely to be hashed.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::io::{Read, Write};

/// A SHA-256 content digest in canonical `sha256:<hex>` form.
///
/// Equality means byte-equality of the hashed content. The inner string
/// is validated on construction: algorithm `sha256`, exactly 64 lowercase
/// hex digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// Computes the digest of a byte slice.
    pub fn from_bytes(data: &[u8]) -> Self {
        Digest(format!("sha256:{}", hex::encode(Sha256::digest(data))))
    }

    /// Wraps a finalized hasher state.
    pub(crate) fn from_hasher(hasher: Sha256) -> Self {
        Digest(format!("sha256:{}", hex::encode(hasher.finalize())))
    }

    /// Parses and validates a canonical digest string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidImageReference`] when the algorithm is not
    /// `sha256` or the hex payload is malformed.
    pub fn parse(s: &str) -> Result<Self> {
        let (algo, hash) = s.split_once(':').ok_or_else(|| Error::InvalidImageReference {
            reference: s.to_string(),
            reason: "digest missing algorithm prefix".to_string(),
        })?;

        if algo != "sha256" {
            return Err(Error::InvalidImageReference {
                reference: s.to_string(),
                reason: format!("unsupported digest algorithm '{}'", algo),
            });
        }

        if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        {
            return Err(Error::InvalidImageReference {
                reference: s.to_string(),
                reason: "digest payload is not 64 lowercase hex digits".to_string(),
            });
        }

        Ok(Digest(s.to_string()))
    }

    /// The canonical string form (`sha256:<hex>`).
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The hex payload without the algorithm prefix.
    pub fn hex(&self) -> &str {
        &self.0["sha256:".len()..]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Digest::parse(s)
    }
}

/// A writer that hashes everything passed through it.
///
/// Wraps any byte sink; [`HashingWriter::finalize`] returns the digest
/// and the number of bytes written.
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    /// Wraps a sink.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Consumes the wrapper, returning `(sink, digest, bytes_written)`.
    pub fn finalize(self) -> (W, Digest, u64) {
        (self.inner, Digest::from_hasher(self.hasher), self.written)
    }

    /// Access to the wrapped sink.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// A reader that hashes everything passed through it.
pub struct HashingReader<R: Read> {
    inner: R,
    hasher: Sha256,
    read: u64,
}

impl<R: Read> HashingReader<R> {
    /// Wraps a source.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            read: 0,
        }
    }

    /// Consumes the wrapper, returning `(source, digest, bytes_read)`.
    pub fn finalize(self) -> (R, Digest, u64) {
        (self.inner, Digest::from_hasher(self.hasher), self.read)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.read += n as u64;
        Ok(n)
    }
}

/// Incremental digest verifier for streamed downloads.
///
/// Feed chunks as they arrive; [`DigestVerifier::verify`] fails with
/// [`Error::DigestMismatch`] on any deviation from the expected digest.
pub struct DigestVerifier {
    expected: Digest,
    hasher: Sha256,
    received: u64,
}

impl DigestVerifier {
    /// Creates a verifier for the expected digest.
    pub fn new(expected: Digest) -> Self {
        Self {
            expected,
            hasher: Sha256::new(),
            received: 0,
        }
    }

    /// Feeds a chunk of the stream.
    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.received += chunk.len() as u64;
    }

    /// Bytes fed so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Finalizes and compares against the expected digest.
    pub fn verify(self) -> Result<Digest> {
        let actual = Digest::from_hasher(self.hasher);
        if actual != self.expected {
            return Err(Error::DigestMismatch {
                expected: self.expected.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(actual)
    }
}
