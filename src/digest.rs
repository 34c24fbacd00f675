use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::{fmt, io, path::PathBuf};

use crate::error::{Error, Result};

/// Digest of contents
///
/// Digest is defined in [OCI image spec](https://github.com/opencontainers/image-spec/blob/v1.0.1/descriptor.md#digests)
/// as a string satisfies following EBNF:
///
/// ```text
/// digest                ::= algorithm ":" encoded
/// algorithm             ::= algorithm-component (algorithm-separator algorithm-component)*
/// algorithm-component   ::= [a-z0-9]+
/// algorithm-separator   ::= [+._-]
/// encoded               ::= [a-zA-Z0-9=_-]+
/// ```
///
/// Every blob in an image repository is stored under its digest, and
/// re-hashing the stored bytes must reproduce it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    pub algorithm: String,
    pub encoded: String,
}

lazy_static::lazy_static! {
    static ref ALGORITHM_RE: Regex = Regex::new(r"^[a-z0-9]+([+._-][a-z0-9]+)*$").unwrap();
    static ref ENCODED_RE: Regex = Regex::new(r"^[a-zA-Z0-9=_-]+$").unwrap();
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.encoded)
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Digest, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Digest::new(&s).map_err(serde::de::Error::custom)
    }
}

impl Digest {
    pub fn new(input: &str) -> Result<Self> {
        let mut iter = input.split(':');
        match (iter.next(), iter.next(), iter.next()) {
            (Some(algorithm), Some(encoded), None) => {
                if ALGORITHM_RE.is_match(algorithm) && ENCODED_RE.is_match(encoded) {
                    Ok(Digest {
                        algorithm: algorithm.to_string(),
                        encoded: encoded.to_string(),
                    })
                } else {
                    Err(Error::InvalidDigest(input.to_string()))
                }
            }
            _ => Err(Error::InvalidDigest(input.to_string())),
        }
    }

    pub fn from_descriptor(descriptor: &oci_spec::image::Descriptor) -> Result<Self> {
        Self::new(descriptor.digest().as_ref())
    }

    /// Blob path relative to the repository root
    pub fn as_path(&self) -> PathBuf {
        PathBuf::from(format!("blobs/{}/{}", self.algorithm, self.encoded))
    }

    /// A form safe for use as a single file name, with `:` rewritten to `_`
    pub fn to_filename(&self) -> String {
        format!("{}_{}", self.algorithm, self.encoded)
    }

    /// Calc digest using SHA-256 algorithm
    pub fn from_buf_sha256(buf: &[u8]) -> Self {
        let hash = Sha256::digest(buf);
        let encoded = base16ct::lower::encode_string(&hash);
        Self {
            algorithm: "sha256".to_string(),
            encoded,
        }
    }

    fn from_sha256(hash: sha2::digest::Output<Sha256>) -> Self {
        Self {
            algorithm: "sha256".to_string(),
            encoded: base16ct::lower::encode_string(&hash),
        }
    }
}

/// Writer wrapper which hashes bytes while passing them through
///
/// Used to compute a layer's diff ID: the tar stream is hashed here
/// before it enters the gzip encoder.
pub struct DigestBuf<W: io::Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: io::Write> DigestBuf<W> {
    pub fn new(inner: W) -> Self {
        DigestBuf {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Hand back the inner writer together with the digest of
    /// everything written and the byte count.
    pub fn finish(self) -> (W, Digest, u64) {
        (
            self.inner,
            Digest::from_sha256(self.hasher.finalize()),
            self.written,
        )
    }
}

impl<W: io::Write> io::Write for DigestBuf<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reader-side counterpart of [DigestBuf], hashing bytes as they are
/// consumed. Unpack wraps layer streams in this to verify blob digests
/// and diff IDs without a second pass.
pub struct DigestReader<R: io::Read> {
    inner: R,
    hasher: Sha256,
    read: u64,
}

impl<R: io::Read> DigestReader<R> {
    pub fn new(inner: R) -> Self {
        DigestReader {
            inner,
            hasher: Sha256::new(),
            read: 0,
        }
    }

    pub fn finish(self) -> (R, Digest, u64) {
        (
            self.inner,
            Digest::from_sha256(self.hasher.finalize()),
            self.read,
        )
    }
}

impl<R: io::Read> io::Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.read += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn parse() {
        let d = Digest::new(
            "sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4",
        )
        .unwrap();
        assert_eq!(d.algorithm, "sha256");
        assert!(Digest::new("no-colon").is_err());
        assert!(Digest::new("sha256:no/slashes/allowed").is_err());
        assert!(Digest::new("SHA256:abcd").is_err());
    }

    #[test]
    fn display_roundtrip() {
        let s = "sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4";
        assert_eq!(Digest::new(s).unwrap().to_string(), s);
    }

    #[test]
    fn filename_form() {
        let d = Digest::from_buf_sha256(b"");
        assert_eq!(d.to_filename(), format!("sha256_{}", EMPTY_SHA256));
    }

    #[test]
    fn sha256_of_empty_input() {
        let d = Digest::from_buf_sha256(b"");
        assert_eq!(d.encoded, EMPTY_SHA256);
    }

    #[test]
    fn digest_buf_matches_buf_digest() {
        let mut buf = DigestBuf::new(Vec::new());
        buf.write_all(b"foo").unwrap();
        buf.write_all(b"bar").unwrap();
        let (inner, digest, written) = buf.finish();
        assert_eq!(inner, b"foobar");
        assert_eq!(written, 6);
        assert_eq!(digest, Digest::from_buf_sha256(b"foobar"));
    }

    #[test]
    fn digest_reader_sees_all_bytes() {
        let mut r = DigestReader::new(&b"foobar"[..]);
        let mut out = Vec::new();
        std::io::Read::read_to_end(&mut r, &mut out).unwrap();
        let (_, digest, read) = r.finish();
        assert_eq!(read, 6);
        assert_eq!(digest, Digest::from_buf_sha256(b"foobar"));
    }
}
