//! Anti-forensic key splitting (LUKS1 AFsplitter).
//!
//! A k-byte key becomes `stripes × k` bytes of material; every stripe but
//! the last is random, and a hash-based diffuser chains them so that losing
//! any part of the material destroys the key.

use rand_core::{OsRng, RngCore};
use zeroize::Zeroizing;

use crate::error::Error;
use crate::luks::HashSpec;

/// Split `key` into `stripes` stripes of `key.len()` bytes each.
pub(crate) fn split(key: &[u8], stripes: u32, hash: HashSpec) -> Zeroizing<Vec<u8>> {
    let k = key.len();
    let n = stripes as usize;
    let mut out = Zeroizing::new(vec![0u8; k * n]);
    let mut acc = Zeroizing::new(vec![0u8; k]);

    for i in 0..n - 1 {
        let stripe = &mut out[i * k..(i + 1) * k];
        OsRng.fill_bytes(stripe);
        xor_into(&mut acc, stripe);
        diffuse(&mut acc, hash);
    }

    let last = &mut out[(n - 1) * k..];
    last.copy_from_slice(&acc);
    xor_into_slice(last, key);
    out
}

/// Recover the key from split material. The material length must be exactly
/// `key_len × stripes`.
pub(crate) fn merge(
    material: &[u8],
    key_len: usize,
    stripes: u32,
    hash: HashSpec,
) -> Result<Zeroizing<Vec<u8>>, Error> {
    let n = stripes as usize;
    if n == 0 || key_len == 0 || material.len() != key_len * n {
        return Err(Error::UnknownFormat);
    }

    let mut acc = Zeroizing::new(vec![0u8; key_len]);
    for i in 0..n - 1 {
        xor_into(&mut acc, &material[i * key_len..(i + 1) * key_len]);
        diffuse(&mut acc, hash);
    }

    let mut key = Zeroizing::new(material[(n - 1) * key_len..].to_vec());
    xor_into_slice(&mut key, &acc);
    Ok(key)
}

/// Hash-based diffuser: each digest-sized chunk is replaced by
/// `H(BE32(chunk_index) ‖ chunk)`, truncated for the final partial chunk.
fn diffuse(buf: &mut [u8], hash: HashSpec) {
    let ds = hash.digest_len();
    let len = buf.len();
    for (i, start) in (0..len).step_by(ds).enumerate() {
        let end = (start + ds).min(len);
        let digest = hash.digest(&[&(i as u32).to_be_bytes(), &buf[start..end]]);
        buf[start..end].copy_from_slice(&digest[..end - start]);
    }
}

fn xor_into(acc: &mut [u8], src: &[u8]) {
    for (a, s) in acc.iter_mut().zip(src) {
        *a ^= s;
    }
}

fn xor_into_slice(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_then_merge_recovers_key() {
        for hash in [HashSpec::Sha1, HashSpec::Sha256, HashSpec::Sha512] {
            let key = [0xA5u8; 32];
            let material = split(&key, 4000, hash);
            assert_eq!(material.len(), 32 * 4000);
            let merged = merge(&material, 32, 4000, hash).unwrap();
            assert_eq!(&merged[..], &key[..]);
        }
    }

    #[test]
    fn merge_rejects_wrong_length() {
        assert!(merge(&[0u8; 100], 32, 4000, HashSpec::Sha256).is_err());
        assert!(merge(&[], 32, 0, HashSpec::Sha256).is_err());
    }

    #[test]
    fn corrupted_material_destroys_key() {
        let key = [0x11u8; 16];
        let mut material = split(&key, 10, HashSpec::Sha256).to_vec();
        material[3] ^= 0x01;
        let merged = merge(&material, 16, 10, HashSpec::Sha256).unwrap();
        assert_ne!(&merged[..], &key[..]);
    }

    #[test]
    fn splits_are_randomized() {
        let key = [0x42u8; 16];
        let a = split(&key, 4, HashSpec::Sha256);
        let b = split(&key, 4, HashSpec::Sha256);
        assert_ne!(&a[..], &b[..]);
    }
}
