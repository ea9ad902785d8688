//! LUKS version 1 volume metadata: header codec, keyslot wrapping, and
//! passphrase-based master-key recovery.

mod af;
mod format;
mod header;

pub use format::{
    encrypt_v1, read_headers, LuksHeaders, Passphrase, V2Recognition, VolumeKey,
};
pub use header::{
    Keyslot, V1Header, HEADER_SIZE, KEYSLOT_COUNT, LUKS_MAGIC, MK_DIGEST_LEN, STRIPES,
};

use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

use crate::error::Error;

// ---------------------------------------------------------------------------
// Hash spec dispatch
// ---------------------------------------------------------------------------

/// Hash algorithm named by the header's hash-spec field. Drives PBKDF2 and
/// the anti-forensic diffuser.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashSpec {
    Sha1,
    Sha256,
    Sha512,
}

impl HashSpec {
    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            _ => Err(Error::InvalidCipherSpec(s.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    pub(crate) fn digest_len(&self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
            Self::Sha512 => 64,
        }
    }

    pub(crate) fn digest(&self, parts: &[&[u8]]) -> Vec<u8> {
        fn run<D: Digest>(parts: &[&[u8]]) -> Vec<u8> {
            let mut d = D::new();
            for p in parts {
                d.update(p);
            }
            d.finalize().to_vec()
        }
        match self {
            Self::Sha1 => run::<Sha1>(parts),
            Self::Sha256 => run::<Sha256>(parts),
            Self::Sha512 => run::<Sha512>(parts),
        }
    }

    pub(crate) fn pbkdf2(&self, password: &[u8], salt: &[u8], iterations: u32, out: &mut [u8]) {
        match self {
            Self::Sha1 => pbkdf2::pbkdf2_hmac::<Sha1>(password, salt, iterations, out),
            Self::Sha256 => pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, out),
            Self::Sha512 => pbkdf2::pbkdf2_hmac::<Sha512>(password, salt, iterations, out),
        }
    }
}
