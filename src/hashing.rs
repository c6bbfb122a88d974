//! Tools for hashing file contents into a [`ContentHash`]
//!
//! SHA-1 is what the wire format and the manifest carry;
//! it identifies file *contents*, nothing security-sensitive.

use std::fmt;
use std::io;
use std::io::prelude::*;

use data_encoding::HEXLOWER;
use serde::de::Error as _;
use sha1::{Digest, Sha1, digest::Output};

use crate::errors::{Error, Result};

type Sha1Digest = Output<Sha1>;

/// The SHA-1 of a regular file's contents.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ContentHash {
    digest: Sha1Digest,
}

impl ContentHash {
    /// Calculates the hash of the given bytes
    pub fn hash(bytes: &[u8]) -> Self {
        Self {
            digest: Sha1::digest(bytes),
        }
    }

    fn from_digest(digest: Sha1Digest) -> Self {
        Self { digest }
    }

    /// Rebuild from raw digest bytes, e.g. a store column.
    /// Anything but 20 bytes is not a SHA-1.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        (bytes.len() == <Sha1 as Digest>::output_size())
            .then(|| Self::from_digest(*Sha1Digest::from_slice(bytes)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.digest.as_slice()
    }

    /// A shortened prefix, unique enough for log lines.
    pub fn short_name(&self) -> String {
        let mut full = format!("{self}");
        let _rest = full.split_off(8);
        full
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ sha1: {} }}", HEXLOWER.encode(&self.digest))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", HEXLOWER.encode(&self.digest))
    }
}

impl std::str::FromStr for ContentHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = HEXLOWER
            .decode(s.as_bytes())
            .map_err(|e| Error::content(format!("couldn't decode {s} as hex: {e}")))?;

        if bytes.len() != <Sha1 as Digest>::output_size() {
            return Err(Error::content(format!("{s} isn't a SHA-1")));
        }
        Ok(ContentHash::from_digest(*Sha1Digest::from_slice(&bytes)))
    }
}

// Raw bytes on the wire and in the store; hex is for humans.

impl serde::Serialize for ContentHash {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(self.digest.as_slice())
    }
}

impl<'de> serde::Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> std::result::Result<ContentHash, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes: Vec<u8> = serde_bytes::deserialize(deserializer)?;
        if bytes.len() != <Sha1 as Digest>::output_size() {
            return Err(D::Error::invalid_length(bytes.len(), &"a 20-byte SHA-1"));
        }
        Ok(ContentHash::from_digest(*Sha1Digest::from_slice(&bytes)))
    }
}

pub struct HashingReader<R> {
    inner: R,
    hasher: Sha1,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha1::new(),
        }
    }

    pub fn finalize(self) -> (ContentHash, R) {
        (ContentHash::from_digest(self.hasher.finalize()), self.inner)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = self.inner.read(buf)?;
        self.hasher.update(&buf[..count]);
        Ok(count)
    }
}

pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha1,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha1::new(),
        }
    }

    pub fn finalize(self) -> (ContentHash, W) {
        (ContentHash::from_digest(self.hasher.finalize()), self.inner)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let count = self.inner.write(buf)?;
        self.hasher.update(&buf[..count]);
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// An incremental hasher for async copy loops that can't wrap a `Read`.
#[derive(Default)]
pub struct StreamingHasher {
    hasher: Sha1,
}

impl StreamingHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    pub fn finalize(self) -> ContentHash {
        ContentHash::from_digest(self.hasher.finalize())
    }
}
