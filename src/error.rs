//! Unified error type for image building, LUKS encoding, and cipher misuse.

use std::fmt;
use std::io;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum Error {
    /// Cipher key length is not one of the supported sizes.
    InvalidKeySize(usize),
    /// A block-cipher buffer was smaller than one block.
    ShortBuffer,
    /// A dm-crypt style cipher specification could not be parsed.
    InvalidCipherSpec(String),
    /// A passphrase was empty or longer than the 1024-byte limit.
    InvalidPassphrase,
    /// All eight LUKS keyslots are already occupied.
    NoFreeKeyslot,
    /// No LUKS header magic at any expected offset.
    UnknownFormat,
    /// No active keyslot opened with the supplied passphrase.
    WrongPassphrase,
    /// Trailer length field exceeds the plausibility bound.
    ImplausibleSize(u64),
    /// The trailing magic bytes are not `KRUN`.
    MissingMagic,
    /// The requested TEE type is not supported.
    UnsupportedTee(String),
    /// The filesystem formatter collaborator failed; stderr attached.
    MkfsFailed(String),
    /// The attestation collaborator failed; detail attached.
    AttestationFailed(String),
    /// The SEV certificate-chain exporter failed; stderr attached.
    ChainExportFailed(String),
    /// The consumer closed the stream before the producer finished.
    Cancelled,
    /// A writer was finished twice or written after finishing.
    DoubleClose,
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidKeySize(n) => write!(f, "invalid key size: {} bytes", n),
            Self::ShortBuffer => write!(f, "buffer shorter than one cipher block"),
            Self::InvalidCipherSpec(s) => write!(f, "invalid cipher spec: {}", s),
            Self::InvalidPassphrase => write!(f, "passphrase must be 1..=1024 bytes"),
            Self::NoFreeKeyslot => write!(f, "no free keyslot"),
            Self::UnknownFormat => write!(f, "not a LUKS volume"),
            Self::WrongPassphrase => write!(f, "no keyslot matched the passphrase"),
            Self::ImplausibleSize(n) => write!(f, "implausible config size: {} bytes", n),
            Self::MissingMagic => write!(f, "missing KRUN trailer magic"),
            Self::UnsupportedTee(t) => write!(f, "unsupported TEE type: {}", t),
            Self::MkfsFailed(msg) => write!(f, "mkfs failed: {}", msg),
            Self::AttestationFailed(msg) => write!(f, "attestation failed: {}", msg),
            Self::ChainExportFailed(msg) => write!(f, "certificate chain export failed: {}", msg),
            Self::Cancelled => write!(f, "archive stream cancelled by consumer"),
            Self::DoubleClose => write!(f, "writer already finished"),
            Self::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl Error {
    /// Repackage for transport across the archive pipe, which hands the
    /// consumer an `io::Error` on its next read.
    pub(crate) fn into_io(self) -> io::Error {
        match self {
            Self::Io(e) => e,
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}
