//! Serpent block cipher (128-bit block, 128/192/256-bit keys).
//!
//! Implements the final (bitsliced) variant: the state is four 32-bit words
//! with word 0 carrying the least significant bit of each 4-bit S-box
//! column, so no initial/final permutation is needed. LUKS volumes may name
//! `serpent` as their payload cipher, which is why this lives in-tree.

use crate::error::Error;

/// Serpent block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Golden-ratio constant of the key schedule.
const PHI: u32 = 0x9e37_79b9;

/// Number of 32-bit round-key words (33 round keys of 4 words).
const SCHEDULE_WORDS: usize = 132;

// ---------------------------------------------------------------------------
// S-boxes
// ---------------------------------------------------------------------------

const SBOX: [[u8; 16]; 8] = [
    [3, 8, 15, 1, 10, 6, 5, 11, 14, 13, 4, 2, 7, 0, 9, 12],
    [15, 12, 2, 7, 9, 0, 5, 10, 1, 11, 14, 8, 6, 13, 3, 4],
    [8, 6, 7, 9, 3, 12, 10, 15, 13, 1, 14, 4, 0, 11, 5, 2],
    [0, 15, 11, 8, 12, 9, 6, 3, 13, 1, 2, 4, 10, 7, 5, 14],
    [1, 15, 8, 3, 12, 0, 11, 6, 2, 5, 4, 10, 9, 14, 7, 13],
    [15, 5, 2, 11, 4, 10, 9, 12, 0, 3, 14, 8, 13, 6, 7, 1],
    [7, 2, 12, 5, 8, 4, 6, 11, 14, 9, 1, 15, 13, 3, 10, 0],
    [1, 13, 15, 0, 14, 8, 2, 11, 7, 4, 12, 10, 9, 3, 5, 6],
];

const fn invert(s: [u8; 16]) -> [u8; 16] {
    let mut inv = [0u8; 16];
    let mut v = 0;
    while v < 16 {
        inv[s[v] as usize] = v as u8;
        v += 1;
    }
    inv
}

const SBOX_INV: [[u8; 16]; 8] = [
    invert(SBOX[0]),
    invert(SBOX[1]),
    invert(SBOX[2]),
    invert(SBOX[3]),
    invert(SBOX[4]),
    invert(SBOX[5]),
    invert(SBOX[6]),
    invert(SBOX[7]),
];

/// Apply a 4-bit S-box to all 32 bit-columns of the state at once.
///
/// For every bit position the nibble `x3|x2|x1|x0` (word 0 = least
/// significant bit) is replaced by `table[nibble]`. Runs in constant time:
/// one mask per possible input value, no data-dependent branches.
#[inline]
fn apply_sbox(table: &[u8; 16], x: [u32; 4]) -> [u32; 4] {
    let mut out = [0u32; 4];
    for v in 0..16usize {
        let mut mask = !0u32;
        for (bit, word) in x.iter().enumerate() {
            mask &= if v >> bit & 1 == 1 { *word } else { !*word };
        }
        let s = table[v];
        for (bit, word) in out.iter_mut().enumerate() {
            if s >> bit & 1 == 1 {
                *word |= mask;
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Linear transform
// ---------------------------------------------------------------------------

#[inline]
fn linear(x: &mut [u32; 4]) {
    x[0] = x[0].rotate_left(13);
    x[2] = x[2].rotate_left(3);
    x[1] ^= x[0] ^ x[2];
    x[3] ^= x[2] ^ (x[0] << 3);
    x[1] = x[1].rotate_left(1);
    x[3] = x[3].rotate_left(7);
    x[0] ^= x[1] ^ x[3];
    x[2] ^= x[3] ^ (x[1] << 7);
    x[0] = x[0].rotate_left(5);
    x[2] = x[2].rotate_left(22);
}

#[inline]
fn linear_inv(x: &mut [u32; 4]) {
    x[2] = x[2].rotate_right(22);
    x[0] = x[0].rotate_right(5);
    x[2] ^= x[3] ^ (x[1] << 7);
    x[0] ^= x[1] ^ x[3];
    x[3] = x[3].rotate_right(7);
    x[1] = x[1].rotate_right(1);
    x[3] ^= x[2] ^ (x[0] << 3);
    x[1] ^= x[0] ^ x[2];
    x[2] = x[2].rotate_right(3);
    x[0] = x[0].rotate_right(13);
}

// ---------------------------------------------------------------------------
// Cipher context
// ---------------------------------------------------------------------------

/// A scheduled Serpent key: 132 subkey words, nothing else.
///
/// The original key bytes are not retained past `new`.
#[derive(Clone)]
pub struct Serpent {
    k: [u32; SCHEDULE_WORDS],
}

impl Serpent {
    /// Run the key schedule. The key must be 16, 24, or 32 bytes.
    pub fn new(key: &[u8]) -> Result<Self, Error> {
        if !matches!(key.len(), 16 | 24 | 32) {
            return Err(Error::InvalidKeySize(key.len()));
        }

        // Load little-endian; short keys get a single 1-word terminator.
        let mut w = [0u32; 8 + SCHEDULE_WORDS];
        for (i, chunk) in key.chunks_exact(4).enumerate() {
            w[i] = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        if key.len() < 32 {
            w[key.len() / 4] = 1;
        }

        for i in 8..w.len() {
            let x = w[i - 8] ^ w[i - 5] ^ w[i - 3] ^ w[i - 1] ^ PHI ^ (i as u32 - 8);
            w[i] = x.rotate_left(11);
        }

        // Prekeys through the S-boxes: groups of four words, S-box index
        // cycling 3, 2, 1, 0, 7, 6, 5, 4.
        let mut k = [0u32; SCHEDULE_WORDS];
        for group in 0..SCHEDULE_WORDS / 4 {
            let s = &SBOX[(11 - (group & 7)) & 7];
            let base = 8 + group * 4;
            let out = apply_sbox(s, [w[base], w[base + 1], w[base + 2], w[base + 3]]);
            k[group * 4..group * 4 + 4].copy_from_slice(&out);
        }

        Ok(Self { k })
    }

    /// Encrypt one 16-byte block from `src` into `dst`.
    pub fn encrypt_block(&self, src: &[u8], dst: &mut [u8]) -> Result<(), Error> {
        if src.len() < BLOCK_SIZE || dst.len() < BLOCK_SIZE {
            return Err(Error::ShortBuffer);
        }
        let x = self.encrypt_words(load(src));
        store(&x, dst);
        Ok(())
    }

    /// Decrypt one 16-byte block from `src` into `dst`.
    pub fn decrypt_block(&self, src: &[u8], dst: &mut [u8]) -> Result<(), Error> {
        if src.len() < BLOCK_SIZE || dst.len() < BLOCK_SIZE {
            return Err(Error::ShortBuffer);
        }
        let x = self.decrypt_words(load(src));
        store(&x, dst);
        Ok(())
    }

    /// In-place variant for callers that already hold a whole block.
    pub(crate) fn encrypt16(&self, block: &mut [u8; 16]) {
        let x = self.encrypt_words(load(block));
        store(&x, block);
    }

    /// In-place variant for callers that already hold a whole block.
    pub(crate) fn decrypt16(&self, block: &mut [u8; 16]) {
        let x = self.decrypt_words(load(block));
        store(&x, block);
    }

    fn encrypt_words(&self, mut x: [u32; 4]) -> [u32; 4] {
        for round in 0..32 {
            xor_key(&mut x, &self.k, round);
            x = apply_sbox(&SBOX[round & 7], x);
            if round < 31 {
                linear(&mut x);
            } else {
                xor_key(&mut x, &self.k, 32);
            }
        }
        x
    }

    fn decrypt_words(&self, mut x: [u32; 4]) -> [u32; 4] {
        xor_key(&mut x, &self.k, 32);
        x = apply_sbox(&SBOX_INV[7], x);
        xor_key(&mut x, &self.k, 31);
        for round in (0..31).rev() {
            linear_inv(&mut x);
            x = apply_sbox(&SBOX_INV[round & 7], x);
            xor_key(&mut x, &self.k, round);
        }
        x
    }
}

#[inline]
fn load(bytes: &[u8]) -> [u32; 4] {
    let mut x = [0u32; 4];
    for (i, word) in x.iter_mut().enumerate() {
        *word = u32::from_le_bytes([
            bytes[i * 4],
            bytes[i * 4 + 1],
            bytes[i * 4 + 2],
            bytes[i * 4 + 3],
        ]);
    }
    x
}

#[inline]
fn store(x: &[u32; 4], bytes: &mut [u8]) {
    for (i, word) in x.iter().enumerate() {
        bytes[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
    }
}

#[inline]
fn xor_key(x: &mut [u32; 4], k: &[u32; SCHEDULE_WORDS], round: usize) {
    for (word, kw) in x.iter_mut().zip(&k[round * 4..round * 4 + 4]) {
        *word ^= kw;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn unhex(s: &str) -> Vec<u8> {
        hex::decode(s).unwrap()
    }

    // Zero-key vectors from the published verified test-vector sets.
    const VECTORS: &[(&str, &str, &str)] = &[
        (
            "00000000000000000000000000000000",
            "d29d576fcea3a3a7ed9099f29273d78e",
            "b2288b968ae8b08648d1ce9606fd992d",
        ),
        (
            "000000000000000000000000000000000000000000000000",
            "d29d576fceaba3a7ed9899f2927bd78e",
            "130e353e1037c22405e8faefb2c3c3e9",
        ),
        (
            "0000000000000000000000000000000000000000000000000000000000000000",
            "d095576fcea3e3a7ed98d9f29073d78e",
            "b90ee5862de69168f2bdd5125b45472b",
        ),
    ];

    #[test]
    fn known_answers() {
        for (key, pt, ct) in VECTORS {
            let cipher = Serpent::new(&unhex(key)).unwrap();
            let mut out = [0u8; BLOCK_SIZE];

            cipher.encrypt_block(&unhex(pt), &mut out).unwrap();
            assert_eq!(hex::encode(out), *ct, "encrypt, key {}", key);

            cipher.decrypt_block(&unhex(ct), &mut out).unwrap();
            assert_eq!(hex::encode(out), *pt, "decrypt, key {}", key);
        }
    }

    #[test]
    fn rejects_bad_key_sizes() {
        for n in [0usize, 8, 15, 17, 31, 33, 64] {
            assert!(matches!(
                Serpent::new(&vec![0u8; n]),
                Err(Error::InvalidKeySize(m)) if m == n
            ));
        }
    }

    #[test]
    fn rejects_short_buffers() {
        let cipher = Serpent::new(&[0u8; 16]).unwrap();
        let mut out = [0u8; BLOCK_SIZE];
        assert!(matches!(
            cipher.encrypt_block(&[0u8; 15], &mut out),
            Err(Error::ShortBuffer)
        ));
        assert!(matches!(
            cipher.encrypt_block(&[0u8; 16], &mut [0u8; 15]),
            Err(Error::ShortBuffer)
        ));
        assert!(matches!(
            cipher.decrypt_block(&[0u8; 15], &mut out),
            Err(Error::ShortBuffer)
        ));
    }

    #[test]
    fn sbox_tables_are_permutations() {
        for (s, inv) in SBOX.iter().zip(SBOX_INV.iter()) {
            for v in 0..16u8 {
                assert_eq!(inv[s[v as usize] as usize], v);
            }
        }
    }

    proptest! {
        #[test]
        fn linear_transform_inverts(a: u32, b: u32, c: u32, d: u32) {
            let mut x = [a, b, c, d];
            linear(&mut x);
            linear_inv(&mut x);
            prop_assert_eq!(x, [a, b, c, d]);
        }

        #[test]
        fn round_trips_all_key_sizes(
            key_len in prop_oneof![Just(16usize), Just(24), Just(32)],
            key: [u8; 32],
            block: [u8; 16],
        ) {
            let cipher = Serpent::new(&key[..key_len]).unwrap();
            let mut ct = [0u8; BLOCK_SIZE];
            let mut pt = [0u8; BLOCK_SIZE];
            cipher.encrypt_block(&block, &mut ct).unwrap();
            cipher.decrypt_block(&ct, &mut pt).unwrap();
            prop_assert_eq!(pt, block);
        }
    }
}
