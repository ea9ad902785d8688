//! Workload descriptor and the in-image trailer codec.
//!
//! The descriptor is serialized twice per image: once as the `krun-sev.json`
//! archive entry, once as a trailer appended to `disk.img` so a loader can
//! recover its launch configuration from the disk alone. The trailer is
//! `canonical JSON ‖ "KRUN" ‖ u64le(json_len)`, preceded by zero padding to
//! a block boundary.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

pub const TRAILER_MAGIC: [u8; 4] = *b"KRUN";

/// Magic plus the little-endian length field.
pub const TRAILER_OVERHEAD: u64 = 12;

/// Upper bound on a plausible serialized config.
const MAX_CONFIG_LEN: u64 = 1024 * 1024;

/// Candidate padding granularities, largest first.
const PAD_CANDIDATES: [u64; 5] = [1 << 20, 64 << 10, 4 << 10, 512, 256];

const DEFAULT_PAD: u64 = 4096;

// ---------------------------------------------------------------------------
// TEE type
// ---------------------------------------------------------------------------

/// Supported TEE flavors. `SevNoEs` exists only in process, to decide
/// whether a certificate chain is fetched; every serialization flattens it
/// to `SEV`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TeeType {
    Sev,
    SevNoEs,
    Snp,
}

impl TeeType {
    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "SEV" => Ok(Self::Sev),
            "SEV_NO_ES" => Ok(Self::SevNoEs),
            "SNP" => Ok(Self::Snp),
            other => Err(Error::UnsupportedTee(other.to_string())),
        }
    }

    /// Canonical on-wire name.
    pub fn canonical(&self) -> &'static str {
        match self {
            Self::Sev | Self::SevNoEs => "SEV",
            Self::Snp => "SNP",
        }
    }

    /// Whether this flavor carries an SEV certificate chain.
    pub fn is_sev(&self) -> bool {
        matches!(self, Self::Sev | Self::SevNoEs)
    }
}

impl Serialize for TeeType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.canonical())
    }
}

impl<'de> Deserialize<'de> for TeeType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        TeeType::parse(&s).map_err(|_| D::Error::custom(format!("unknown TEE type {:?}", s)))
    }
}

// ---------------------------------------------------------------------------
// Workload descriptor
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkloadConfig {
    #[serde(rename = "type")]
    pub tee: TeeType,
    pub workload_id: String,
    pub cpus: u32,
    #[serde(rename = "memory")]
    pub memory_mib: u32,
    pub attestation_url: String,
    /// Opaque JSON string whose schema depends on the TEE type.
    pub tee_data: String,
}

impl WorkloadConfig {
    /// Canonical JSON form used for both archive entry and trailer.
    pub fn to_json(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self).map_err(json_err)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(data).map_err(json_err)
    }

    /// `canonical JSON ‖ "KRUN" ‖ u64le(json_len)`.
    pub fn trailer_bytes(&self) -> Result<Vec<u8>, Error> {
        let json = self.to_json()?;
        let mut out = Vec::with_capacity(json.len() + TRAILER_OVERHEAD as usize);
        out.extend_from_slice(&json);
        out.extend_from_slice(&TRAILER_MAGIC);
        out.extend_from_slice(&(json.len() as u64).to_le_bytes());
        Ok(out)
    }
}

fn json_err(e: serde_json::Error) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::InvalidData, e))
}

// ---------------------------------------------------------------------------
// Trailer I/O
// ---------------------------------------------------------------------------

/// Append `config_json` to `file` as a padded trailer.
///
/// With `overwrite` set, a stale trailer at the end of the file is stripped
/// first and the previous padding granularity is re-detected; a file with no
/// recognizable trailer is treated as never written, using the default
/// 4 KiB padding.
pub fn write_config_to_image(
    file: &mut File,
    config_json: &[u8],
    overwrite: bool,
) -> Result<(), Error> {
    let file_size = file.metadata()?.len();

    // Stale trailer length, including magic and length field. A tail that
    // fails the plausibility checks is treated as content, not a trailer.
    let mut old_total = 0u64;
    if overwrite {
        match read_trailer_len(file, file_size) {
            Ok(Some(len)) if len + TRAILER_OVERHEAD <= file_size => {
                old_total = len + TRAILER_OVERHEAD;
            }
            Ok(_) | Err(Error::ImplausibleSize(_)) => {}
            Err(e) => return Err(e),
        }
    }

    let content_end = file_size - old_total;
    let pad = detect_padding(file, file_size, old_total)?;

    let body_len = config_json.len() as u64 + TRAILER_OVERHEAD;
    let padding = (pad - (content_end + body_len) % pad) % pad;

    let mut out = Vec::with_capacity((padding + body_len) as usize);
    out.resize(padding as usize, 0);
    out.extend_from_slice(config_json);
    out.extend_from_slice(&TRAILER_MAGIC);
    out.extend_from_slice(&(config_json.len() as u64).to_le_bytes());

    file.seek(SeekFrom::Start(content_end))?;
    file.write_all(&out)?;
    file.set_len(content_end + out.len() as u64)?;
    Ok(())
}

/// Recover the workload configuration from the end of a disk image.
pub fn read_config_from_image(file: &mut File) -> Result<WorkloadConfig, Error> {
    let file_size = file.metadata()?.len();
    let len = read_trailer_len(file, file_size)?.ok_or(Error::MissingMagic)?;
    if len + TRAILER_OVERHEAD > file_size {
        return Err(Error::ImplausibleSize(len));
    }

    let mut json = vec![0u8; len as usize];
    file.seek(SeekFrom::Start(file_size - TRAILER_OVERHEAD - len))?;
    file.read_exact(&mut json)?;
    WorkloadConfig::from_json(&json)
}

/// Read the 12-byte trailer record. `Ok(None)` when the magic is absent,
/// `ImplausibleSize` when the length field is absurd.
fn read_trailer_len(file: &mut File, file_size: u64) -> Result<Option<u64>, Error> {
    if file_size < TRAILER_OVERHEAD {
        return Ok(None);
    }

    let mut tail = [0u8; TRAILER_OVERHEAD as usize];
    file.seek(SeekFrom::Start(file_size - TRAILER_OVERHEAD))?;
    file.read_exact(&mut tail)?;

    if tail[0..4] != TRAILER_MAGIC {
        return Ok(None);
    }
    let len = u64::from_le_bytes([
        tail[4], tail[5], tail[6], tail[7], tail[8], tail[9], tail[10], tail[11],
    ]);
    if len > MAX_CONFIG_LEN {
        return Err(Error::ImplausibleSize(len));
    }
    Ok(Some(len))
}

/// Infer the padding granularity of an existing image: the smallest
/// candidate that divides the file size and whose final block is all zero up
/// to the stale trailer. Falls back to 4 KiB.
fn detect_padding(file: &mut File, file_size: u64, old_total: u64) -> Result<u64, Error> {
    let mut detected = DEFAULT_PAD;
    for pad in PAD_CANDIDATES {
        if pad > file_size || file_size % pad != 0 || pad < old_total {
            continue;
        }
        if is_zero_span(file, file_size - pad, file_size - old_total)? {
            detected = pad;
        }
    }
    Ok(detected)
}

fn is_zero_span(file: &mut File, start: u64, end: u64) -> Result<bool, Error> {
    let mut remaining = end.saturating_sub(start);
    file.seek(SeekFrom::Start(start))?;
    let mut buf = [0u8; 4096];
    while remaining > 0 {
        let take = (buf.len() as u64).min(remaining) as usize;
        file.read_exact(&mut buf[..take])?;
        if buf[..take].iter().any(|&b| b != 0) {
            return Ok(false);
        }
        remaining -= take as u64;
    }
    Ok(true)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample(tee: TeeType) -> WorkloadConfig {
        WorkloadConfig {
            tee,
            workload_id: "f00dfeed".into(),
            cpus: 2,
            memory_mib: 512,
            attestation_url: "http://attest.example:8080".into(),
            tee_data: r#"{"generation":"milan"}"#.into(),
        }
    }

    fn image_with(content: &[u8]) -> File {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(content).unwrap();
        f
    }

    #[test]
    fn sev_no_es_serializes_as_sev() {
        let json = sample(TeeType::SevNoEs).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(value["type"], "SEV");

        let parsed = WorkloadConfig::from_json(&json).unwrap();
        assert_eq!(parsed.tee, TeeType::Sev);
    }

    #[test]
    fn unknown_tee_type_is_rejected() {
        assert!(matches!(
            TeeType::parse("SGX"),
            Err(Error::UnsupportedTee(_))
        ));
        assert!(WorkloadConfig::from_json(br#"{"type":"TDX","workload_id":"x","cpus":1,"memory":1,"attestation_url":"","tee_data":""}"#).is_err());
    }

    #[test]
    fn json_uses_wire_field_names() {
        let json = sample(TeeType::Snp).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(value["type"], "SNP");
        assert_eq!(value["memory"], 512);
        assert!(value.get("memory_mib").is_none());
        assert!(value.get("tee").is_none());
    }

    #[test]
    fn trailer_roundtrip() {
        let config = sample(TeeType::Snp);
        let mut file = image_with(&[0x55u8; 100_000]);
        write_config_to_image(&mut file, &config.to_json().unwrap(), false).unwrap();

        let size = file.metadata().unwrap().len();
        assert_eq!(size % DEFAULT_PAD, 0);
        assert_eq!(read_config_from_image(&mut file).unwrap(), config);
    }

    #[test]
    fn overwrite_is_idempotent() {
        let first = sample(TeeType::Snp);
        let mut second = sample(TeeType::Sev);
        second.tee_data = r#"{"vendor_chain":"/sev.chain"}"#.into();

        let mut file = image_with(&[0x77u8; 50_000]);
        write_config_to_image(&mut file, &first.to_json().unwrap(), false).unwrap();
        write_config_to_image(&mut file, &second.to_json().unwrap(), true).unwrap();

        assert_eq!(read_config_from_image(&mut file).unwrap(), second);
    }

    #[test]
    fn overwrite_on_fresh_file_uses_default_padding() {
        let config = sample(TeeType::Snp);
        let mut file = image_with(&[0x11u8; 12_345]);
        write_config_to_image(&mut file, &config.to_json().unwrap(), true).unwrap();
        assert_eq!(file.metadata().unwrap().len() % DEFAULT_PAD, 0);
        assert_eq!(read_config_from_image(&mut file).unwrap(), config);
    }

    #[test]
    fn missing_magic_is_reported() {
        let mut tail = vec![0u8; 200];
        tail.extend_from_slice(b"XXXX");
        tail.extend_from_slice(&0u64.to_le_bytes());
        let mut file = image_with(&tail);
        assert!(matches!(
            read_config_from_image(&mut file),
            Err(Error::MissingMagic)
        ));
    }

    #[test]
    fn implausible_length_is_reported() {
        let mut tail = vec![0u8; 200];
        tail.extend_from_slice(&TRAILER_MAGIC);
        tail.extend_from_slice(&2_000_000u64.to_le_bytes());
        let mut file = image_with(&tail);
        assert!(matches!(
            read_config_from_image(&mut file),
            Err(Error::ImplausibleSize(2_000_000))
        ));
    }

    #[test]
    fn length_beyond_file_is_implausible() {
        let mut tail = vec![0u8; 20];
        tail.extend_from_slice(&TRAILER_MAGIC);
        tail.extend_from_slice(&1000u64.to_le_bytes());
        let mut file = image_with(&tail);
        assert!(matches!(
            read_config_from_image(&mut file),
            Err(Error::ImplausibleSize(1000))
        ));
    }
}
