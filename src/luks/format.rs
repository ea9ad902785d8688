//! LUKS v1 volume construction and master-key recovery.
//!
//! `encrypt_v1` builds everything that precedes the ciphertext payload
//! (header struct, keyslot anti-forensic zones, alignment padding) and hands
//! back a keyed [`EncryptionContext`] for the payload itself. The reverse
//! path parses headers and unwraps the master key from a passphrase.

use std::io::{Read, Seek, SeekFrom};
use std::time::{Duration, Instant};

use rand_core::{OsRng, RngCore};
use subtle::ConstantTimeEq;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::cipher::{CipherSpec, EncryptionContext, SectorCipher, SECTOR_SIZE};
use crate::error::Error;
use crate::luks::header::{
    self, Keyslot, V1Header, HEADER_SIZE, KEYSLOT_COUNT, LUKS_MAGIC, MK_DIGEST_LEN, STRIPES,
};
use crate::luks::{af, HashSpec};

/// Per-keyslot PBKDF2 wallclock target.
const SLOT_ITERATION_TARGET: Duration = Duration::from_secs(1);

/// Master-key digest PBKDF2 wallclock target.
const DIGEST_ITERATION_TARGET: Duration = Duration::from_millis(125);

const MIN_ITERATIONS: u32 = 1000;

const MAX_PASSPHRASE_LEN: usize = 1024;

/// Offset of the LUKS2 secondary header candidate.
const V2_SECONDARY_OFFSET: u64 = 16 * 1024;

const V2_SECONDARY_MAGIC: [u8; 6] = *b"SKUL\xba\xbe";

// ---------------------------------------------------------------------------
// Passphrase
// ---------------------------------------------------------------------------

/// An opaque byte passphrase, zeroed on drop and never logged.
pub struct Passphrase(Zeroizing<Vec<u8>>);

impl Passphrase {
    /// Wrap passphrase bytes; must be 1..=1024 bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, Error> {
        let bytes = Zeroizing::new(bytes.into());
        if bytes.is_empty() || bytes.len() > MAX_PASSPHRASE_LEN {
            return Err(Error::InvalidPassphrase);
        }
        Ok(Self(bytes))
    }

    /// A fresh random passphrase: 32 CSPRNG bytes, hex-encoded.
    pub fn generate() -> Self {
        let mut raw = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut *raw);
        Self(Zeroizing::new(hex::encode(*raw).into_bytes()))
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Volume construction
// ---------------------------------------------------------------------------

/// Build a LUKS v1 head region for a fresh volume.
///
/// Returns the bytes spanning sector 0 through the payload offset (header
/// struct, padding, and the populated keyslot zones) ready to prepend to the
/// ciphertext, a streaming encryption context keyed with the new master key,
/// and the sector size.
pub fn encrypt_v1(
    passphrases: &[Passphrase],
    spec: CipherSpec,
) -> Result<(Vec<u8>, EncryptionContext, usize), Error> {
    if passphrases.is_empty() {
        return Err(Error::InvalidPassphrase);
    }
    if passphrases.len() > KEYSLOT_COUNT {
        return Err(Error::NoFreeKeyslot);
    }

    let key_bytes = spec.key_bytes as usize;
    let hash = HashSpec::Sha256;

    let mut master_key = Zeroizing::new(vec![0u8; key_bytes]);
    OsRng.fill_bytes(&mut master_key);

    // Master-key digest, iterations calibrated against wallclock.
    let mut mk_digest_salt = [0u8; 32];
    OsRng.fill_bytes(&mut mk_digest_salt);
    let mk_digest_iter = calibrated_iterations(DIGEST_ITERATION_TARGET, |n| {
        let mut scratch = [0u8; MK_DIGEST_LEN];
        hash.pbkdf2(&master_key, &mk_digest_salt, n, &mut scratch);
    });
    let mut mk_digest = [0u8; MK_DIGEST_LEN];
    hash.pbkdf2(&master_key, &mk_digest_salt, mk_digest_iter, &mut mk_digest);

    let (offsets, payload_offset) = header::layout_regions(spec.key_bytes);
    let mut keyslots =
        std::array::from_fn::<_, KEYSLOT_COUNT, _>(|i| Keyslot::disabled(offsets[i]));
    let mut head = vec![0u8; payload_offset as usize * SECTOR_SIZE];

    for (slot_index, passphrase) in passphrases.iter().enumerate() {
        let mut salt = [0u8; 32];
        OsRng.fill_bytes(&mut salt);

        let iterations = calibrated_iterations(SLOT_ITERATION_TARGET, |n| {
            let mut scratch = Zeroizing::new(vec![0u8; key_bytes]);
            hash.pbkdf2(passphrase.as_bytes(), &salt, n, &mut scratch);
        });
        let mut wrap_key = Zeroizing::new(vec![0u8; key_bytes]);
        hash.pbkdf2(passphrase.as_bytes(), &salt, iterations, &mut wrap_key);

        // Split, then encrypt the material with sector indices relative to
        // the start of the zone.
        let mut material = af::split(&master_key, STRIPES, hash);
        let slot_cipher = SectorCipher::new(&spec, &wrap_key)?;
        for (sector, chunk) in material.chunks_mut(SECTOR_SIZE).enumerate() {
            slot_cipher.encrypt_sector(sector as u64, chunk)?;
        }

        let start = offsets[slot_index] as usize * SECTOR_SIZE;
        head[start..start + material.len()].copy_from_slice(&material);

        keyslots[slot_index] = Keyslot {
            active: true,
            iterations,
            salt,
            material_offset: offsets[slot_index],
            stripes: STRIPES,
        };
    }

    let v1 = V1Header {
        cipher_name: spec.cipher.as_str().to_string(),
        cipher_mode: spec.mode.to_string(),
        hash_spec: hash.as_str().to_string(),
        payload_offset,
        key_bytes: spec.key_bytes,
        mk_digest,
        mk_digest_salt,
        mk_digest_iter,
        uuid: Uuid::new_v4().to_string(),
        keyslots,
    };
    head[..HEADER_SIZE].copy_from_slice(&v1.to_bytes());

    let context = EncryptionContext::new(&spec, &master_key)?;
    Ok((head, context, SECTOR_SIZE))
}

/// Scale a 1000-iteration probe run up to the wallclock target. The result
/// is stored in the header and used verbatim from then on; calibration is
/// never repeated mid-session.
fn calibrated_iterations(target: Duration, probe: impl Fn(u32)) -> u32 {
    let started = Instant::now();
    probe(MIN_ITERATIONS);
    let elapsed = started.elapsed().as_nanos().max(1);
    let scaled = target.as_nanos() * MIN_ITERATIONS as u128 / elapsed;
    scaled.clamp(MIN_ITERATIONS as u128, u32::MAX as u128) as u32
}

// ---------------------------------------------------------------------------
// Header recognition
// ---------------------------------------------------------------------------

/// A v2 header candidate. Only recognized here; decoding belongs to a LUKS2
/// implementation.
#[derive(Clone, Copy, Debug)]
pub struct V2Recognition {
    pub offset: u64,
}

/// Result of probing a source for LUKS header candidates.
pub struct LuksHeaders {
    pub v1: Option<V1Header>,
    pub v2: Option<V2Recognition>,
}

/// Probe `source` for LUKS headers: a v1 header at offset 0, a v2 primary at
/// offset 0, or a v2 secondary at 16 KiB. `UnknownFormat` when none match.
pub fn read_headers<R: Read + Seek>(source: &mut R) -> Result<LuksHeaders, Error> {
    let mut primary = [0u8; HEADER_SIZE];
    source.seek(SeekFrom::Start(0))?;
    if read_all(source, &mut primary)? < 8 {
        return Err(Error::UnknownFormat);
    }

    let mut headers = LuksHeaders { v1: None, v2: None };

    if primary[0..6] == LUKS_MAGIC {
        match u16::from_be_bytes([primary[6], primary[7]]) {
            1 => headers.v1 = Some(V1Header::parse(&primary)?),
            2 => headers.v2 = Some(V2Recognition { offset: 0 }),
            _ => {}
        }
    }

    if headers.v1.is_none() && headers.v2.is_none() {
        let mut secondary = [0u8; 8];
        source.seek(SeekFrom::Start(V2_SECONDARY_OFFSET))?;
        if read_all(source, &mut secondary)? == 8
            && secondary[0..6] == V2_SECONDARY_MAGIC
            && u16::from_be_bytes([secondary[6], secondary[7]]) == 2
        {
            headers.v2 = Some(V2Recognition {
                offset: V2_SECONDARY_OFFSET,
            });
        }
    }

    if headers.v1.is_none() && headers.v2.is_none() {
        return Err(Error::UnknownFormat);
    }
    Ok(headers)
}

/// Read until `buf` is full or EOF; returns the byte count.
fn read_all<R: Read>(source: &mut R, buf: &mut [u8]) -> Result<usize, Error> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

// ---------------------------------------------------------------------------
// Master-key recovery
// ---------------------------------------------------------------------------

/// A recovered master key plus everything needed to reach the payload.
pub struct VolumeKey {
    master_key: Zeroizing<Vec<u8>>,
    spec: CipherSpec,
    /// Payload start in sectors.
    pub payload_offset: u32,
    pub sector_size: usize,
}

impl VolumeKey {
    pub fn master_key(&self) -> &[u8] {
        &self.master_key
    }

    /// Key a fresh context for payload decryption (or re-encryption).
    pub fn context(&self) -> Result<EncryptionContext, Error> {
        EncryptionContext::new(&self.spec, &self.master_key)
    }
}

impl V1Header {
    /// Try the passphrase against every active keyslot, reading each slot's
    /// anti-forensic zone from `source`. First digest match wins.
    pub fn recover_master_key<R: Read + Seek>(
        &self,
        passphrase: &Passphrase,
        source: &mut R,
    ) -> Result<VolumeKey, Error> {
        let spec = self.cipher_spec()?;
        let hash = self.hash()?;
        let key_bytes = self.key_bytes as usize;

        for slot in self.keyslots.iter().filter(|s| s.active) {
            if slot.stripes == 0 {
                continue;
            }

            let mut wrap_key = Zeroizing::new(vec![0u8; key_bytes]);
            hash.pbkdf2(passphrase.as_bytes(), &slot.salt, slot.iterations, &mut wrap_key);

            let mut material =
                Zeroizing::new(vec![0u8; key_bytes * slot.stripes as usize]);
            source.seek(SeekFrom::Start(slot.material_offset as u64 * SECTOR_SIZE as u64))?;
            source.read_exact(&mut material)?;

            let slot_cipher = SectorCipher::new(&spec, &wrap_key)?;
            for (sector, chunk) in material.chunks_mut(SECTOR_SIZE).enumerate() {
                slot_cipher.decrypt_sector(sector as u64, chunk)?;
            }

            let candidate = af::merge(&material, key_bytes, slot.stripes, hash)?;
            let mut digest = [0u8; MK_DIGEST_LEN];
            hash.pbkdf2(&candidate, &self.mk_digest_salt, self.mk_digest_iter, &mut digest);

            if bool::from(digest.ct_eq(&self.mk_digest)) {
                return Ok(VolumeKey {
                    master_key: candidate,
                    spec,
                    payload_offset: self.payload_offset,
                    sector_size: SECTOR_SIZE,
                });
            }
        }

        Err(Error::WrongPassphrase)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn passphrase_length_limits() {
        assert!(Passphrase::new("x").is_ok());
        assert!(Passphrase::new(vec![b'a'; 1024]).is_ok());
        assert!(matches!(
            Passphrase::new(""),
            Err(Error::InvalidPassphrase)
        ));
        assert!(matches!(
            Passphrase::new(vec![b'a'; 1025]),
            Err(Error::InvalidPassphrase)
        ));
    }

    #[test]
    fn generated_passphrases_are_hex_and_distinct() {
        let a = Passphrase::generate();
        let b = Passphrase::generate();
        assert_eq!(a.as_bytes().len(), 64);
        assert!(a.as_bytes().iter().all(u8::is_ascii_hexdigit));
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn encrypt_v1_requires_a_passphrase() {
        assert!(matches!(
            encrypt_v1(&[], CipherSpec::default()),
            Err(Error::InvalidPassphrase)
        ));
    }

    #[test]
    fn calibration_respects_floor() {
        // A no-op probe measures ~0 elapsed; the count must still clamp.
        let n = calibrated_iterations(Duration::from_nanos(1), |_| {});
        assert!(n >= MIN_ITERATIONS);
    }

    #[test]
    fn read_headers_rejects_garbage() {
        let mut cur = Cursor::new(vec![0u8; 64 * 1024]);
        assert!(matches!(
            read_headers(&mut cur),
            Err(Error::UnknownFormat)
        ));

        let mut cur = Cursor::new(b"short".to_vec());
        assert!(matches!(
            read_headers(&mut cur),
            Err(Error::UnknownFormat)
        ));
    }

    #[test]
    fn read_headers_recognizes_v2_primary() {
        let mut data = vec![0u8; 4096];
        data[0..6].copy_from_slice(&LUKS_MAGIC);
        data[6..8].copy_from_slice(&2u16.to_be_bytes());
        let mut cur = Cursor::new(data);
        let headers = read_headers(&mut cur).unwrap();
        assert!(headers.v1.is_none());
        assert_eq!(headers.v2.map(|v| v.offset), Some(0));
    }

    #[test]
    fn read_headers_recognizes_v2_secondary() {
        let mut data = vec![0u8; 32 * 1024];
        data[16384..16390].copy_from_slice(&V2_SECONDARY_MAGIC);
        data[16390..16392].copy_from_slice(&2u16.to_be_bytes());
        let mut cur = Cursor::new(data);
        let headers = read_headers(&mut cur).unwrap();
        assert_eq!(headers.v2.map(|v| v.offset), Some(V2_SECONDARY_OFFSET));
    }
}
