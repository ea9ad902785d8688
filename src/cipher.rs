//! dm-crypt style cipher dispatch and per-sector encryption.
//!
//! A LUKS volume names its payload cipher as `<cipher>-<mode>[-<iv>]`,
//! e.g. `aes-xts-plain64` or `serpent-cbc-essiv:sha256`. This module parses
//! that form, keys the matching block cipher, and encrypts or decrypts whole
//! sectors with the mode's IV schedule.

use std::fmt;

use aes::{Aes128, Aes192, Aes256};
use cipher::generic_array::GenericArray;
use cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use twofish::Twofish;

use crate::error::Error;
use crate::luks::HashSpec;
use crate::serpent::Serpent;

/// LUKS sector size in bytes.
pub const SECTOR_SIZE: usize = 512;

const BLOCK: usize = 16;

// ---------------------------------------------------------------------------
// Cipher specification
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherName {
    Aes,
    Serpent,
    Twofish,
}

impl CipherName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aes => "aes",
            Self::Serpent => "serpent",
            Self::Twofish => "twofish",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherMode {
    /// XTS with the sector index as little-endian tweak.
    XtsPlain64,
    /// CBC with an ESSIV IV; the named hash of the data key keys the IV
    /// cipher.
    CbcEssiv(HashSpec),
    /// CBC with the raw little-endian sector index as IV.
    CbcPlain64,
}

impl fmt::Display for CipherMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::XtsPlain64 => f.write_str("xts-plain64"),
            Self::CbcEssiv(hash) => write!(f, "cbc-essiv:{}", hash.as_str()),
            Self::CbcPlain64 => f.write_str("cbc-plain64"),
        }
    }
}

impl CipherMode {
    /// Default key length for the mode (XTS carries two keys).
    fn default_key_bytes(&self) -> u32 {
        match self {
            Self::XtsPlain64 => 64,
            Self::CbcEssiv(_) | Self::CbcPlain64 => 32,
        }
    }

    fn valid_key_bytes(&self, n: u32) -> bool {
        match self {
            Self::XtsPlain64 => matches!(n, 32 | 48 | 64),
            Self::CbcEssiv(_) | Self::CbcPlain64 => matches!(n, 16 | 24 | 32),
        }
    }
}

/// Cipher, mode, and key length for one volume.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CipherSpec {
    pub cipher: CipherName,
    pub mode: CipherMode,
    pub key_bytes: u32,
}

impl Default for CipherSpec {
    /// `aes-xts-plain64` with a 64-byte key (two-key AES-256-XTS).
    fn default() -> Self {
        Self {
            cipher: CipherName::Aes,
            mode: CipherMode::XtsPlain64,
            key_bytes: 64,
        }
    }
}

impl CipherSpec {
    /// Parse a dm-crypt style spec; the empty string selects the default.
    /// The key length defaults per mode and can be overridden afterwards
    /// with [`CipherSpec::with_key_bytes`].
    pub fn parse(spec: &str) -> Result<Self, Error> {
        if spec.is_empty() {
            return Ok(Self::default());
        }

        let bad = || Error::InvalidCipherSpec(spec.to_string());
        let (cipher_str, mode_str) = spec.split_once('-').ok_or_else(bad)?;

        let cipher = match cipher_str {
            "aes" => CipherName::Aes,
            "serpent" => CipherName::Serpent,
            "twofish" => CipherName::Twofish,
            _ => return Err(bad()),
        };
        let mode = match mode_str {
            "xts-plain64" => CipherMode::XtsPlain64,
            "cbc-plain64" => CipherMode::CbcPlain64,
            _ => match mode_str.strip_prefix("cbc-essiv:") {
                Some(hash) => CipherMode::CbcEssiv(HashSpec::parse(hash).map_err(|_| bad())?),
                None => return Err(bad()),
            },
        };

        Ok(Self {
            cipher,
            mode,
            key_bytes: mode.default_key_bytes(),
        })
    }

    /// Override the key length, validated against the mode.
    pub fn with_key_bytes(mut self, key_bytes: u32) -> Result<Self, Error> {
        if !self.mode.valid_key_bytes(key_bytes) {
            return Err(Error::InvalidKeySize(key_bytes as usize));
        }
        self.key_bytes = key_bytes;
        Ok(self)
    }
}

// ---------------------------------------------------------------------------
// Keyed block ciphers behind one object-safe trait
// ---------------------------------------------------------------------------

pub(crate) trait Block16: Send + Sync {
    fn encrypt(&self, block: &mut [u8; BLOCK]);
    fn decrypt(&self, block: &mut [u8; BLOCK]);
}

/// Adapter for RustCrypto block ciphers with a 16-byte block.
struct RustCrypto<C>(C);

impl<C> Block16 for RustCrypto<C>
where
    C: BlockEncrypt + BlockDecrypt + Send + Sync,
    C: cipher::BlockSizeUser<BlockSize = cipher::consts::U16>,
{
    fn encrypt(&self, block: &mut [u8; BLOCK]) {
        self.0.encrypt_block(GenericArray::from_mut_slice(block));
    }

    fn decrypt(&self, block: &mut [u8; BLOCK]) {
        self.0.decrypt_block(GenericArray::from_mut_slice(block));
    }
}

impl Block16 for Serpent {
    fn encrypt(&self, block: &mut [u8; BLOCK]) {
        self.encrypt16(block);
    }

    fn decrypt(&self, block: &mut [u8; BLOCK]) {
        self.decrypt16(block);
    }
}

fn keyed_cipher(name: CipherName, key: &[u8]) -> Result<Box<dyn Block16>, Error> {
    match name {
        CipherName::Aes => match key.len() {
            16 => Aes128::new_from_slice(key)
                .map(|c| Box::new(RustCrypto(c)) as Box<dyn Block16>)
                .map_err(|_| Error::InvalidKeySize(key.len())),
            24 => Aes192::new_from_slice(key)
                .map(|c| Box::new(RustCrypto(c)) as Box<dyn Block16>)
                .map_err(|_| Error::InvalidKeySize(key.len())),
            32 => Aes256::new_from_slice(key)
                .map(|c| Box::new(RustCrypto(c)) as Box<dyn Block16>)
                .map_err(|_| Error::InvalidKeySize(key.len())),
            n => Err(Error::InvalidKeySize(n)),
        },
        CipherName::Serpent => Ok(Box::new(Serpent::new(key)?)),
        CipherName::Twofish => Twofish::new_from_slice(key)
            .map(|c| Box::new(RustCrypto(c)) as Box<dyn Block16>)
            .map_err(|_| Error::InvalidKeySize(key.len())),
    }
}

// ---------------------------------------------------------------------------
// Sector cipher
// ---------------------------------------------------------------------------

enum Inner {
    Xts {
        data: Box<dyn Block16>,
        tweak: Box<dyn Block16>,
    },
    Cbc {
        data: Box<dyn Block16>,
        iv: IvMode,
    },
}

enum IvMode {
    Essiv(Box<dyn Block16>),
    Plain64,
}

/// A keyed cipher + mode pair operating on whole sectors, addressable by
/// sector index. Random access; no internal state.
pub struct SectorCipher {
    inner: Inner,
}

impl SectorCipher {
    pub fn new(spec: &CipherSpec, key: &[u8]) -> Result<Self, Error> {
        if key.len() != spec.key_bytes as usize || !spec.mode.valid_key_bytes(spec.key_bytes) {
            return Err(Error::InvalidKeySize(key.len()));
        }

        let inner = match spec.mode {
            CipherMode::XtsPlain64 => {
                let half = key.len() / 2;
                Inner::Xts {
                    data: keyed_cipher(spec.cipher, &key[..half])?,
                    tweak: keyed_cipher(spec.cipher, &key[half..])?,
                }
            }
            CipherMode::CbcEssiv(hash) => {
                // ESSIV: the IV cipher is keyed with the named hash of the
                // data key. The digest must itself be a valid key length for
                // the cipher, which keyed_cipher enforces.
                let essiv_key = hash.digest(&[key]);
                Inner::Cbc {
                    data: keyed_cipher(spec.cipher, key)?,
                    iv: IvMode::Essiv(keyed_cipher(spec.cipher, &essiv_key)?),
                }
            }
            CipherMode::CbcPlain64 => Inner::Cbc {
                data: keyed_cipher(spec.cipher, key)?,
                iv: IvMode::Plain64,
            },
        };

        Ok(Self { inner })
    }

    /// Encrypt `buf` in place as sector `index`. The length must be a
    /// multiple of the cipher block size.
    pub fn encrypt_sector(&self, index: u64, buf: &mut [u8]) -> Result<(), Error> {
        if buf.is_empty() || buf.len() % BLOCK != 0 {
            return Err(Error::ShortBuffer);
        }

        match &self.inner {
            Inner::Xts { data, tweak } => {
                let mut t = sector_iv(index);
                tweak.encrypt(&mut t);
                for chunk in buf.chunks_exact_mut(BLOCK) {
                    let mut b = block_of(chunk);
                    xor16(&mut b, &t);
                    data.encrypt(&mut b);
                    xor16(&mut b, &t);
                    chunk.copy_from_slice(&b);
                    gf_double(&mut t);
                }
            }
            Inner::Cbc { data, iv } => {
                let mut prev = iv.generate(index);
                for chunk in buf.chunks_exact_mut(BLOCK) {
                    let mut b = block_of(chunk);
                    xor16(&mut b, &prev);
                    data.encrypt(&mut b);
                    chunk.copy_from_slice(&b);
                    prev = b;
                }
            }
        }
        Ok(())
    }

    /// Decrypt `buf` in place as sector `index`.
    pub fn decrypt_sector(&self, index: u64, buf: &mut [u8]) -> Result<(), Error> {
        if buf.is_empty() || buf.len() % BLOCK != 0 {
            return Err(Error::ShortBuffer);
        }

        match &self.inner {
            Inner::Xts { data, tweak } => {
                let mut t = sector_iv(index);
                tweak.encrypt(&mut t);
                for chunk in buf.chunks_exact_mut(BLOCK) {
                    let mut b = block_of(chunk);
                    xor16(&mut b, &t);
                    data.decrypt(&mut b);
                    xor16(&mut b, &t);
                    chunk.copy_from_slice(&b);
                    gf_double(&mut t);
                }
            }
            Inner::Cbc { data, iv } => {
                let mut prev = iv.generate(index);
                for chunk in buf.chunks_exact_mut(BLOCK) {
                    let ct = block_of(chunk);
                    let mut b = ct;
                    data.decrypt(&mut b);
                    xor16(&mut b, &prev);
                    chunk.copy_from_slice(&b);
                    prev = ct;
                }
            }
        }
        Ok(())
    }
}

impl IvMode {
    fn generate(&self, index: u64) -> [u8; BLOCK] {
        let mut iv = sector_iv(index);
        if let Self::Essiv(cipher) = self {
            cipher.encrypt(&mut iv);
        }
        iv
    }
}

#[inline]
fn sector_iv(index: u64) -> [u8; BLOCK] {
    let mut iv = [0u8; BLOCK];
    iv[..8].copy_from_slice(&index.to_le_bytes());
    iv
}

#[inline]
fn block_of(chunk: &[u8]) -> [u8; BLOCK] {
    let mut b = [0u8; BLOCK];
    b.copy_from_slice(chunk);
    b
}

#[inline]
fn xor16(block: &mut [u8; BLOCK], other: &[u8; BLOCK]) {
    for (b, o) in block.iter_mut().zip(other) {
        *b ^= o;
    }
}

/// GF(2^128) doubling of the XTS tweak, little-endian byte order.
#[inline]
fn gf_double(t: &mut [u8; BLOCK]) {
    let mut carry = 0u8;
    for b in t.iter_mut() {
        let next = *b >> 7;
        *b = (*b << 1) | carry;
        carry = next;
    }
    if carry != 0 {
        t[0] ^= 0x87;
    }
}

// ---------------------------------------------------------------------------
// Streaming encryption context
// ---------------------------------------------------------------------------

/// A keyed [`SectorCipher`] plus a monotone sector counter, consumed one
/// whole sector at a time by the streaming writer.
pub struct EncryptionContext {
    cipher: SectorCipher,
    sector_size: usize,
    next_sector: u64,
}

impl EncryptionContext {
    pub fn new(spec: &CipherSpec, key: &[u8]) -> Result<Self, Error> {
        Ok(Self {
            cipher: SectorCipher::new(spec, key)?,
            sector_size: SECTOR_SIZE,
            next_sector: 0,
        })
    }

    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    /// Encrypt the next sector in stream order. `buf` must be exactly one
    /// sector.
    pub fn encrypt_next_sector(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        if buf.len() != self.sector_size {
            return Err(Error::ShortBuffer);
        }
        self.cipher.encrypt_sector(self.next_sector, buf)?;
        self.next_sector += 1;
        Ok(())
    }

    /// Random-access view for decryption and keyslot material.
    pub fn cipher(&self) -> &SectorCipher {
        &self.cipher
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_documented_specs() {
        let spec = CipherSpec::parse("aes-xts-plain64").unwrap();
        assert_eq!(spec.cipher, CipherName::Aes);
        assert_eq!(spec.mode, CipherMode::XtsPlain64);
        assert_eq!(spec.key_bytes, 64);

        let spec = CipherSpec::parse("serpent-cbc-essiv:sha256").unwrap();
        assert_eq!(spec.cipher, CipherName::Serpent);
        assert_eq!(spec.mode, CipherMode::CbcEssiv(HashSpec::Sha256));
        assert_eq!(spec.key_bytes, 32);

        // ESSIV accepts every supported hash spec, not only sha256.
        for (name, hash) in [
            ("aes-cbc-essiv:sha1", HashSpec::Sha1),
            ("aes-cbc-essiv:sha512", HashSpec::Sha512),
        ] {
            let spec = CipherSpec::parse(name).unwrap();
            assert_eq!(spec.mode, CipherMode::CbcEssiv(hash));
            assert_eq!(spec.mode.to_string(), name.split_once('-').unwrap().1);
        }

        let spec = CipherSpec::parse("twofish-cbc-plain64").unwrap();
        assert_eq!(spec.cipher, CipherName::Twofish);
        assert_eq!(spec.mode, CipherMode::CbcPlain64);

        assert_eq!(CipherSpec::parse("").unwrap(), CipherSpec::default());
    }

    #[test]
    fn rejects_unknown_specs() {
        for bad in [
            "aes",
            "des-cbc-plain64",
            "aes-gcm",
            "aes-cbc-essiv:md5",
            "serpent-ctr-plain64",
        ] {
            assert!(matches!(
                CipherSpec::parse(bad),
                Err(Error::InvalidCipherSpec(_))
            ));
        }
    }

    #[test]
    fn validates_key_lengths() {
        let xts = CipherSpec::parse("aes-xts-plain64").unwrap();
        assert!(xts.clone().with_key_bytes(32).is_ok());
        assert!(matches!(
            xts.with_key_bytes(24),
            Err(Error::InvalidKeySize(24))
        ));

        let cbc = CipherSpec::parse("aes-cbc-essiv:sha256").unwrap();
        assert!(cbc.clone().with_key_bytes(16).is_ok());
        assert!(matches!(
            cbc.with_key_bytes(64),
            Err(Error::InvalidKeySize(64))
        ));
    }

    fn roundtrip(spec_str: &str, key_bytes: u32) {
        let spec = CipherSpec::parse(spec_str)
            .unwrap()
            .with_key_bytes(key_bytes)
            .unwrap();
        let key: Vec<u8> = (0..key_bytes as u8).collect();
        let cipher = SectorCipher::new(&spec, &key).unwrap();

        let plain: Vec<u8> = (0..SECTOR_SIZE).map(|i| (i % 251) as u8).collect();
        let mut buf = plain.clone();
        cipher.encrypt_sector(7, &mut buf).unwrap();
        assert_ne!(buf, plain, "{}", spec_str);
        cipher.decrypt_sector(7, &mut buf).unwrap();
        assert_eq!(buf, plain, "{}", spec_str);
    }

    #[test]
    fn sector_roundtrip_all_ciphers() {
        roundtrip("aes-xts-plain64", 64);
        roundtrip("aes-xts-plain64", 32);
        roundtrip("aes-cbc-essiv:sha256", 32);
        roundtrip("aes-cbc-essiv:sha256", 16);
        roundtrip("aes-cbc-plain64", 32);
        roundtrip("serpent-xts-plain64", 64);
        roundtrip("serpent-cbc-essiv:sha256", 32);
        roundtrip("twofish-xts-plain64", 64);
        roundtrip("twofish-cbc-essiv:sha256", 32);
    }

    #[test]
    fn essiv_key_length_follows_the_named_hash() {
        // The IV cipher is keyed with the digest of the data key, so the
        // digest length must be a valid key size for the cipher. SHA-256
        // fits every supported cipher; SHA-1 (20 bytes) and SHA-512 (64
        // bytes) fit none of them, and construction reports the digest
        // length it rejected.
        let key = [0x3cu8; 32];

        let spec = CipherSpec::parse("aes-cbc-essiv:sha256").unwrap();
        assert!(SectorCipher::new(&spec, &key).is_ok());

        let spec = CipherSpec::parse("aes-cbc-essiv:sha1").unwrap();
        assert!(matches!(
            SectorCipher::new(&spec, &key),
            Err(Error::InvalidKeySize(20))
        ));

        let spec = CipherSpec::parse("aes-cbc-essiv:sha512").unwrap();
        assert!(matches!(
            SectorCipher::new(&spec, &key),
            Err(Error::InvalidKeySize(64))
        ));
    }

    #[test]
    fn sector_index_changes_ciphertext() {
        let spec = CipherSpec::default();
        let cipher = SectorCipher::new(&spec, &[0x5a; 64]).unwrap();

        let mut a = vec![0u8; SECTOR_SIZE];
        let mut b = vec![0u8; SECTOR_SIZE];
        cipher.encrypt_sector(0, &mut a).unwrap();
        cipher.encrypt_sector(1, &mut b).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn context_counts_sectors() {
        let spec = CipherSpec::default();
        let mut ctx = EncryptionContext::new(&spec, &[7u8; 64]).unwrap();
        let cipher = SectorCipher::new(&spec, &[7u8; 64]).unwrap();

        let mut streamed = vec![1u8; SECTOR_SIZE * 3];
        for chunk in streamed.chunks_exact_mut(SECTOR_SIZE) {
            ctx.encrypt_next_sector(chunk).unwrap();
        }

        let mut direct = vec![1u8; SECTOR_SIZE * 3];
        for (i, chunk) in direct.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            cipher.encrypt_sector(i as u64, chunk).unwrap();
        }
        assert_eq!(streamed, direct);
    }

    #[test]
    fn rejects_partial_blocks() {
        let cipher = SectorCipher::new(&CipherSpec::default(), &[1u8; 64]).unwrap();
        let mut buf = vec![0u8; 17];
        assert!(matches!(
            cipher.encrypt_sector(0, &mut buf),
            Err(Error::ShortBuffer)
        ));
    }
}
