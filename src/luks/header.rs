//! LUKS v1 on-disk header codec and sector-region layout.
//!
//! The header struct is 592 bytes at offset 0: magic, version, cipher and
//! hash names, payload offset, master-key digest, UUID, and eight 48-byte
//! keyslot records. All integers are big-endian.

use crate::cipher::{CipherSpec, SECTOR_SIZE};
use crate::error::Error;
use crate::luks::HashSpec;

pub const LUKS_MAGIC: [u8; 6] = *b"LUKS\xba\xbe";
pub const HEADER_SIZE: usize = 592;
pub const KEYSLOT_COUNT: usize = 8;

/// Anti-forensic stripe count for every keyslot.
pub const STRIPES: u32 = 4000;

/// Length of the PBKDF2 master-key digest stored in the header.
pub const MK_DIGEST_LEN: usize = 20;

const VERSION_1: u16 = 1;
const SLOT_ACTIVE: u32 = 0x00AC_71F3;
const SLOT_DISABLED: u32 = 0x0000_DEAD;

/// First keyslot AF zone starts here; zones and the payload are aligned to
/// this many sectors.
const KEYSLOT_ALIGN_SECTORS: u32 = 8;

// ---------------------------------------------------------------------------
// Keyslot record
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct Keyslot {
    pub active: bool,
    /// PBKDF2 iterations for this slot's wrapping key.
    pub iterations: u32,
    pub salt: [u8; 32],
    /// First sector of the slot's anti-forensic material.
    pub material_offset: u32,
    pub stripes: u32,
}

impl Keyslot {
    pub(crate) fn disabled(material_offset: u32) -> Self {
        Self {
            active: false,
            iterations: 0,
            salt: [0u8; 32],
            material_offset,
            stripes: STRIPES,
        }
    }

    fn write(&self, buf: &mut [u8]) {
        let state = if self.active { SLOT_ACTIVE } else { SLOT_DISABLED };
        buf[0..4].copy_from_slice(&state.to_be_bytes());
        buf[4..8].copy_from_slice(&self.iterations.to_be_bytes());
        buf[8..40].copy_from_slice(&self.salt);
        buf[40..44].copy_from_slice(&self.material_offset.to_be_bytes());
        buf[44..48].copy_from_slice(&self.stripes.to_be_bytes());
    }

    fn read(buf: &[u8]) -> Self {
        let mut salt = [0u8; 32];
        salt.copy_from_slice(&buf[8..40]);
        Self {
            active: be32(&buf[0..4]) == SLOT_ACTIVE,
            iterations: be32(&buf[4..8]),
            salt,
            material_offset: be32(&buf[40..44]),
            stripes: be32(&buf[44..48]),
        }
    }
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct V1Header {
    pub cipher_name: String,
    pub cipher_mode: String,
    pub hash_spec: String,
    /// Payload start in sectors.
    pub payload_offset: u32,
    /// Master key length in bytes.
    pub key_bytes: u32,
    pub mk_digest: [u8; MK_DIGEST_LEN],
    pub mk_digest_salt: [u8; 32],
    pub mk_digest_iter: u32,
    pub uuid: String,
    pub keyslots: [Keyslot; KEYSLOT_COUNT],
}

impl V1Header {
    /// Serialize into the fixed 592-byte on-disk form.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..6].copy_from_slice(&LUKS_MAGIC);
        buf[6..8].copy_from_slice(&VERSION_1.to_be_bytes());
        write_padded(&mut buf[8..40], &self.cipher_name);
        write_padded(&mut buf[40..72], &self.cipher_mode);
        write_padded(&mut buf[72..104], &self.hash_spec);
        buf[104..108].copy_from_slice(&self.payload_offset.to_be_bytes());
        buf[108..112].copy_from_slice(&self.key_bytes.to_be_bytes());
        buf[112..132].copy_from_slice(&self.mk_digest);
        buf[132..164].copy_from_slice(&self.mk_digest_salt);
        buf[164..168].copy_from_slice(&self.mk_digest_iter.to_be_bytes());
        write_padded(&mut buf[168..208], &self.uuid);
        for (i, slot) in self.keyslots.iter().enumerate() {
            slot.write(&mut buf[208 + i * 48..208 + (i + 1) * 48]);
        }
        buf
    }

    /// Parse the on-disk form. Fails with `UnknownFormat` unless the magic
    /// and version tag match LUKS v1.
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        if data.len() < HEADER_SIZE || data[0..6] != LUKS_MAGIC {
            return Err(Error::UnknownFormat);
        }
        if u16::from_be_bytes([data[6], data[7]]) != VERSION_1 {
            return Err(Error::UnknownFormat);
        }

        let mut mk_digest = [0u8; MK_DIGEST_LEN];
        mk_digest.copy_from_slice(&data[112..132]);
        let mut mk_digest_salt = [0u8; 32];
        mk_digest_salt.copy_from_slice(&data[132..164]);

        let mut keyslots = std::array::from_fn::<_, KEYSLOT_COUNT, _>(|_| Keyslot::disabled(0));
        for (i, slot) in keyslots.iter_mut().enumerate() {
            *slot = Keyslot::read(&data[208 + i * 48..208 + (i + 1) * 48]);
        }

        Ok(Self {
            cipher_name: read_padded(&data[8..40])?,
            cipher_mode: read_padded(&data[40..72])?,
            hash_spec: read_padded(&data[72..104])?,
            payload_offset: be32(&data[104..108]),
            key_bytes: be32(&data[108..112]),
            mk_digest,
            mk_digest_salt,
            mk_digest_iter: be32(&data[164..168]),
            uuid: read_padded(&data[168..208])?,
            keyslots,
        })
    }

    /// Reassemble the cipher specification named by the header.
    pub fn cipher_spec(&self) -> Result<CipherSpec, Error> {
        CipherSpec::parse(&format!("{}-{}", self.cipher_name, self.cipher_mode))?
            .with_key_bytes(self.key_bytes)
    }

    pub fn hash(&self) -> Result<HashSpec, Error> {
        HashSpec::parse(&self.hash_spec)
    }
}

// ---------------------------------------------------------------------------
// Region layout
// ---------------------------------------------------------------------------

/// Sectors occupied by one keyslot's anti-forensic material.
pub(crate) fn keyslot_sectors(key_bytes: u32) -> u32 {
    (STRIPES * key_bytes + SECTOR_SIZE as u32 - 1) / SECTOR_SIZE as u32
}

/// Material offsets for all eight keyslots plus the payload offset, each
/// zone start rounded up to an 8-sector boundary.
pub(crate) fn layout_regions(key_bytes: u32) -> ([u32; KEYSLOT_COUNT], u32) {
    let zone = keyslot_sectors(key_bytes);
    let mut offsets = [0u32; KEYSLOT_COUNT];
    let mut next = KEYSLOT_ALIGN_SECTORS;
    for off in offsets.iter_mut() {
        *off = next;
        next = round_up(next + zone, KEYSLOT_ALIGN_SECTORS);
    }
    (offsets, next)
}

fn round_up(n: u32, align: u32) -> u32 {
    (n + align - 1) / align * align
}

fn be32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

/// NUL-padded fixed-width string field.
fn write_padded(field: &mut [u8], value: &str) {
    let bytes = value.as_bytes();
    let n = bytes.len().min(field.len() - 1);
    field[..n].copy_from_slice(&bytes[..n]);
}

fn read_padded(field: &[u8]) -> Result<String, Error> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..end])
        .map(str::to_string)
        .map_err(|_| Error::UnknownFormat)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> V1Header {
        let (offsets, payload) = layout_regions(64);
        let mut keyslots = std::array::from_fn::<_, KEYSLOT_COUNT, _>(|i| {
            Keyslot::disabled(offsets[i])
        });
        keyslots[0] = Keyslot {
            active: true,
            iterations: 123_456,
            salt: [7u8; 32],
            material_offset: offsets[0],
            stripes: STRIPES,
        };
        V1Header {
            cipher_name: "aes".into(),
            cipher_mode: "xts-plain64".into(),
            hash_spec: "sha256".into(),
            payload_offset: payload,
            key_bytes: 64,
            mk_digest: [9u8; MK_DIGEST_LEN],
            mk_digest_salt: [3u8; 32],
            mk_digest_iter: 1000,
            uuid: "8b9ae89f-9726-4a5b-b402-b2b4cbd8b2e6".into(),
            keyslots,
        }
    }

    #[test]
    fn serialized_form_is_592_bytes_with_magic() {
        let bytes = sample_header().to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[0..6], &LUKS_MAGIC);
        assert_eq!(u16::from_be_bytes([bytes[6], bytes[7]]), 1);
    }

    #[test]
    fn roundtrip() {
        let header = sample_header();
        let parsed = V1Header::parse(&header.to_bytes()).unwrap();
        assert_eq!(parsed.cipher_name, "aes");
        assert_eq!(parsed.cipher_mode, "xts-plain64");
        assert_eq!(parsed.hash_spec, "sha256");
        assert_eq!(parsed.payload_offset, header.payload_offset);
        assert_eq!(parsed.key_bytes, 64);
        assert_eq!(parsed.mk_digest, header.mk_digest);
        assert_eq!(parsed.mk_digest_iter, 1000);
        assert_eq!(parsed.uuid, header.uuid);
        assert!(parsed.keyslots[0].active);
        assert_eq!(parsed.keyslots[0].iterations, 123_456);
        assert!(!parsed.keyslots[1].active);
    }

    #[test]
    fn parse_rejects_bad_magic_and_version() {
        let mut bytes = sample_header().to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            V1Header::parse(&bytes),
            Err(Error::UnknownFormat)
        ));

        let mut bytes = sample_header().to_bytes();
        bytes[7] = 2;
        assert!(matches!(
            V1Header::parse(&bytes),
            Err(Error::UnknownFormat)
        ));

        assert!(matches!(
            V1Header::parse(&[0u8; 100]),
            Err(Error::UnknownFormat)
        ));
    }

    #[test]
    fn regions_are_aligned_and_disjoint() {
        for key_bytes in [16u32, 24, 32, 48, 64] {
            let zone = keyslot_sectors(key_bytes);
            let (offsets, payload) = layout_regions(key_bytes);
            assert_eq!(offsets[0], 8);
            for w in offsets.windows(2) {
                assert_eq!(w[1] % KEYSLOT_ALIGN_SECTORS, 0);
                assert!(w[1] >= w[0] + zone, "zones overlap for {}", key_bytes);
            }
            assert_eq!(payload % KEYSLOT_ALIGN_SECTORS, 0);
            assert!(payload >= offsets[KEYSLOT_COUNT - 1] + zone);
        }
    }
}
