//! Content digests
//!
//! Digests are rendered as `algorithm:hex`. Only `sha256` is supported.

use std::fmt;
use std::str::FromStr;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{RegistryError, RegistryResult};

const HEX_LEN: usize = 64;
const READ_BUFFER: usize = 64 * 1024;

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Algorithm {
    /// SHA-256
    Sha256,
}

impl Algorithm {
    /// The algorithm prefix used in digest strings.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated content digest, e.g. `sha256:e3b0c442...`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    /// Digest an in-memory buffer.
    pub fn calculate(content: &[u8]) -> Self {
        Self::from_hasher(Sha256::new_with_prefix(content))
    }

    /// Digest a stream without buffering it, returning the digest and the number of bytes read.
    pub async fn calculate_from_stream<R>(reader: &mut R) -> std::io::Result<(Self, u64)>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; READ_BUFFER];
        let mut total = 0u64;

        loop {
            let read = reader.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            total += read as u64;
        }

        Ok((Self::from_hasher(hasher), total))
    }

    /// Digest a file on the local filesystem.
    ///
    /// A missing file is an I/O error, not a content problem.
    pub async fn calculate_from_file(path: &Utf8Path) -> RegistryResult<Self> {
        let mut file = tokio::io::BufReader::new(tokio::fs::File::open(path).await?);
        let (digest, _) = Self::calculate_from_stream(&mut file).await?;
        Ok(digest)
    }

    fn from_hasher(hasher: Sha256) -> Self {
        Self {
            algorithm: Algorithm::Sha256,
            hex: hex::encode(hasher.finalize()),
        }
    }

    /// Parse a digest, also accepting a bare 64-character hex string as `sha256`.
    pub fn normalize(input: &str) -> RegistryResult<Self> {
        if input.contains(':') {
            input.parse()
        } else {
            format!("{}:{input}", Algorithm::Sha256).parse()
        }
    }

    /// The digest algorithm.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The hex-encoded hash, without the algorithm prefix.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Check `content` against this digest.
    ///
    /// The comparison runs in constant time with respect to the hash contents.
    pub fn verify(&self, content: &[u8]) -> bool {
        let actual = Self::calculate(content);
        self.matches(&actual)
    }

    /// Constant-time equality against another digest.
    pub fn matches(&self, other: &Digest) -> bool {
        self.algorithm == other.algorithm && bool::from(self.hex.as_bytes().ct_eq(other.hex.as_bytes()))
    }
}

/// Check that `input` is a well-formed digest: a `sha256:` prefix followed by
/// exactly 64 lowercase hex characters.
pub fn validate(input: &str) -> bool {
    input.parse::<Digest>().is_ok()
}

/// Verify `content` against an expected digest string.
///
/// Malformed digests never verify.
pub fn verify(content: &[u8], expected: &str) -> bool {
    match Digest::normalize(expected) {
        Ok(digest) => digest.verify(content),
        Err(_) => false,
    }
}

/// Strip the algorithm prefix from a digest string, if present.
pub fn extract_hash(input: &str) -> &str {
    input.split_once(':').map_or(input, |(_, hex)| hex)
}

impl FromStr for Digest {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RegistryError::InvalidDigest(s.to_string());

        let (algorithm, hex) = s.split_once(':').ok_or_else(invalid)?;
        let algorithm = match algorithm {
            "sha256" => Algorithm::Sha256,
            _ => return Err(invalid()),
        };

        let well_formed = hex.len() == HEX_LEN
            && hex
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !well_formed {
            return Err(invalid());
        }

        Ok(Self {
            algorithm,
            hex: hex.to_string(),
        })
    }
}

impl TryFrom<String> for Digest {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}
