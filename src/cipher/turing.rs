//! Word-oriented Turing stream cipher.
//!
//! The cipher combines a 17-word LFSR over GF(2^32) with a keyed nonlinear
//! filter. Keying compiles four 256-entry word tables from the premixed key;
//! loading an IV refills the register; each generation run produces
//! 340 bytes (17 rounds of 20) and leaves the register resynchronised.

use super::tables::{MULTAB, QBOX, SBOX};
use crate::error::{Result, TivoError};

/// Register length in 32-bit words.
pub const LFSR_LEN: usize = 17;
/// Maximum key length in bytes.
pub const MAX_KEY: usize = 32;
/// Maximum combined IV-plus-key length in bytes.
pub const MAX_KIV: usize = 48;
/// Output of a single generation run: 17 rounds of 20 bytes.
pub const GEN_BYTES: usize = LFSR_LEN * 20;

/// Round origins for one generation run. Each round steps the register five
/// times, so consecutive origins advance by 5 mod 17; gcd(5, 17) = 1 makes
/// the seventeen origins a permutation of 0..17. The ordering is part of the
/// cipher contract.
const ROUND_ORIGINS: [usize; LFSR_LEN] = [0, 5, 10, 15, 3, 8, 13, 1, 6, 11, 16, 4, 9, 14, 2, 7, 12];

/// Byte `i` of a word, with byte 0 the most significant.
#[inline]
fn byte(w: u32, i: usize) -> usize {
    ((w >> (24 - 8 * i)) & 0xff) as usize
}

/// Offset into the register relative to the rolling origin `z`.
#[inline]
fn off(z: usize, i: usize) -> usize {
    (z + i) % LFSR_LEN
}

/// Reversible word transformation over the fixed S-boxes, used when
/// ingesting key and IV material. Reversibility guarantees no loss of
/// entropy on the way in.
fn fixed_s(mut w: u32) -> u32 {
    let mut b = SBOX[byte(w, 0)] as u32;
    w = ((w ^ QBOX[b as usize]) & 0x00ff_ffff) | (b << 24);
    b = SBOX[byte(w, 1)] as u32;
    w = ((w ^ QBOX[b as usize].rotate_left(8)) & 0xff00_ffff) | (b << 16);
    b = SBOX[byte(w, 2)] as u32;
    w = ((w ^ QBOX[b as usize].rotate_left(16)) & 0xffff_00ff) | (b << 8);
    b = SBOX[byte(w, 3)] as u32;
    w = ((w ^ QBOX[b as usize].rotate_left(24)) & 0xffff_ff00) | b;
    w
}

/// Word-wide pseudo-Hadamard transform: the last word absorbs the sum of
/// the others, then is folded back into each of them.
fn mixwords(w: &mut [u32]) {
    let n = w.len();
    let mut sum = 0u32;
    for &x in w[..n - 1].iter() {
        sum = sum.wrapping_add(x);
    }
    w[n - 1] = w[n - 1].wrapping_add(sum);
    sum = w[n - 1];
    for x in w[..n - 1].iter_mut() {
        *x = x.wrapping_add(sum);
    }
}

/// Five-word pseudo-Hadamard transform used inside each round.
#[inline]
fn pht(a: &mut u32, b: &mut u32, c: &mut u32, d: &mut u32, e: &mut u32) {
    *e = e
        .wrapping_add(*a)
        .wrapping_add(*b)
        .wrapping_add(*c)
        .wrapping_add(*d);
    *a = a.wrapping_add(*e);
    *b = b.wrapping_add(*e);
    *c = c.wrapping_add(*e);
    *d = d.wrapping_add(*e);
}

/// Turing cipher state: the register, the premixed key and the four keyed
/// S-box tables compiled from it.
#[derive(Debug)]
pub struct Turing {
    lfsr: [u32; LFSR_LEN],
    key: [u32; MAX_KEY / 4],
    keylen: usize,
    s0: [u32; 256],
    s1: [u32; 256],
    s2: [u32; 256],
    s3: [u32; 256],
}

impl Turing {
    /// Creates an unkeyed cipher. `key` must be called before `iv`.
    pub fn new() -> Self {
        Self {
            lfsr: [0; LFSR_LEN],
            key: [0; MAX_KEY / 4],
            keylen: 0,
            s0: [0; 256],
            s1: [0; 256],
            s2: [0; 256],
            s3: [0; 256],
        }
    }

    /// Keys the cipher: gathers and premixes the key words, then compiles
    /// the keyed S-box lookup tables. The key length must be a multiple of
    /// four bytes, at most [`MAX_KEY`].
    pub fn key(&mut self, key: &[u8]) -> Result<()> {
        if key.len() % 4 != 0 || key.len() > MAX_KEY {
            return Err(TivoError::InvalidKeyLength(key.len()));
        }
        self.keylen = 0;
        for chunk in key.chunks_exact(4) {
            self.key[self.keylen] = fixed_s(u32::from_be_bytes(chunk.try_into().unwrap()));
            self.keylen += 1;
        }
        if self.keylen > 0 {
            mixwords(&mut self.key[..self.keylen]);
        }

        let key_words = self.key;
        let keylen = self.keylen;
        for lane in 0..4 {
            let table = match lane {
                0 => &mut self.s0,
                1 => &mut self.s1,
                2 => &mut self.s2,
                _ => &mut self.s3,
            };
            let keep = !(0xffu32 << (8 * (3 - lane)));
            for (j, slot) in table.iter_mut().enumerate() {
                let mut w = 0u32;
                let mut k = j;
                for (i, &word) in key_words[..keylen].iter().enumerate() {
                    k = SBOX[byte(word, lane) ^ k] as usize;
                    w ^= QBOX[k].rotate_left((i + 8 * lane) as u32);
                }
                *slot = (w & keep) | ((k as u32) << (8 * (3 - lane)));
            }
        }
        Ok(())
    }

    /// Loads an initialization vector, refilling the whole register: the IV
    /// words go through the fixed S-box, then the premixed key, then a
    /// length-dependent tag word, and the remainder is spun out through the
    /// keyed S-boxes before a final mix. `iv.len() + 4 * keylen` must not
    /// exceed [`MAX_KIV`].
    pub fn iv(&mut self, iv: &[u8]) -> Result<()> {
        if iv.len() % 4 != 0 || iv.len() + 4 * self.keylen > MAX_KIV {
            return Err(TivoError::InvalidKeyLength(iv.len()));
        }
        let mut i = 0;
        for chunk in iv.chunks_exact(4) {
            self.lfsr[i] = fixed_s(u32::from_be_bytes(chunk.try_into().unwrap()));
            i += 1;
        }
        for j in 0..self.keylen {
            self.lfsr[i] = self.key[j];
            i += 1;
        }
        self.lfsr[i] = ((self.keylen as u32) << 4) | ((iv.len() as u32) >> 2) | 0x0102_0300;
        i += 1;
        let mut j = 0;
        while i < LFSR_LEN {
            self.lfsr[i] = self.keyed_s(self.lfsr[j].wrapping_add(self.lfsr[i - 1]), 0);
            i += 1;
            j += 1;
        }
        mixwords(&mut self.lfsr);
        Ok(())
    }

    /// One word through the keyed S-boxes, with a byte-lane rotation `b`.
    #[inline]
    fn keyed_s(&self, w: u32, b: usize) -> u32 {
        self.s0[byte(w, b & 3)]
            ^ self.s1[byte(w, (1 + b) & 3)]
            ^ self.s2[byte(w, (2 + b) & 3)]
            ^ self.s3[byte(w, (3 + b) & 3)]
    }

    /// Steps the LFSR once; the logical origin moves right one place.
    #[inline]
    fn step(&mut self, z: usize) {
        let w0 = self.lfsr[off(z, 0)];
        self.lfsr[off(z, 0)] = self.lfsr[off(z, 15)]
            ^ self.lfsr[off(z, 4)]
            ^ (w0 << 8)
            ^ MULTAB[(w0 >> 24) as usize];
    }

    /// A single round at origin `z`, emitting 20 bytes.
    fn round(&mut self, z: usize, out: &mut [u8]) {
        self.step(z);
        let mut a = self.lfsr[off(z + 1, 16)];
        let mut b = self.lfsr[off(z + 1, 13)];
        let mut c = self.lfsr[off(z + 1, 6)];
        let mut d = self.lfsr[off(z + 1, 1)];
        let mut e = self.lfsr[off(z + 1, 0)];
        pht(&mut a, &mut b, &mut c, &mut d, &mut e);
        a = self.keyed_s(a, 0);
        b = self.keyed_s(b, 1);
        c = self.keyed_s(c, 2);
        d = self.keyed_s(d, 3);
        e = self.keyed_s(e, 0);
        pht(&mut a, &mut b, &mut c, &mut d, &mut e);
        self.step(z + 1);
        self.step(z + 2);
        self.step(z + 3);
        a = a.wrapping_add(self.lfsr[off(z + 4, 14)]);
        b = b.wrapping_add(self.lfsr[off(z + 4, 12)]);
        c = c.wrapping_add(self.lfsr[off(z + 4, 8)]);
        d = d.wrapping_add(self.lfsr[off(z + 4, 1)]);
        e = e.wrapping_add(self.lfsr[off(z + 4, 0)]);
        out[0..4].copy_from_slice(&a.to_be_bytes());
        out[4..8].copy_from_slice(&b.to_be_bytes());
        out[8..12].copy_from_slice(&c.to_be_bytes());
        out[12..16].copy_from_slice(&d.to_be_bytes());
        out[16..20].copy_from_slice(&e.to_be_bytes());
        self.step(z + 4);
    }

    /// Generates 17 rounds of output into `buf`, resynchronising the
    /// register in the process.
    pub fn gen(&mut self, buf: &mut [u8; GEN_BYTES]) {
        for (i, &z) in ROUND_ORIGINS.iter().enumerate() {
            let (start, end) = (i * 20, (i + 1) * 20);
            self.round(z, &mut buf[start..end]);
        }
    }
}

impl Default for Turing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn keyed(key: &[u8], iv: &[u8]) -> [u8; GEN_BYTES] {
        let mut t = Turing::new();
        t.key(key).unwrap();
        t.iv(iv).unwrap();
        let mut buf = [0u8; GEN_BYTES];
        t.gen(&mut buf);
        buf
    }

    #[test]
    fn round_origins_are_a_permutation() {
        let mut seen = [false; LFSR_LEN];
        for &z in ROUND_ORIGINS.iter() {
            assert!(!seen[z]);
            seen[z] = true;
        }
        // Each round steps five times, so origins advance by 5 mod 17.
        for pair in ROUND_ORIGINS.windows(2) {
            assert_eq!(pair[1], (pair[0] + 5) % LFSR_LEN);
        }
    }

    #[test]
    fn generation_is_deterministic() {
        let a = keyed(b"0123456789ABfoob", b"0123456789ABCDEF");
        let b = keyed(b"0123456789ABfoob", b"0123456789ABCDEF");
        assert_eq!(a[..], b[..]);
    }

    #[test]
    fn empty_key_and_iv_generate() {
        let a = keyed(b"", b"");
        let b = keyed(b"", b"");
        assert_eq!(a[..], b[..]);
        assert!(a.iter().any(|&x| x != 0));
    }

    #[test]
    fn distinct_ivs_give_distinct_streams() {
        let a = keyed(b"0123456789ABfoob", b"0123456789ABCDEF");
        let b = keyed(b"0123456789ABfoob", b"0123456789ABCDEG");
        assert_ne!(a[..], b[..]);
    }

    #[test]
    fn key_length_is_validated() {
        let mut t = Turing::new();
        assert!(matches!(
            t.key(b"12345"),
            Err(TivoError::InvalidKeyLength(5))
        ));
        assert!(matches!(
            t.key(&[0u8; 36]),
            Err(TivoError::InvalidKeyLength(36))
        ));
        t.key(&[0u8; 16]).unwrap();
        // 36 IV bytes + 16 key bytes do not fit the register.
        assert!(t.iv(&[0u8; 36]).is_err());
        assert!(t.iv(&[0u8; 20]).is_ok());
    }

    #[quickcheck]
    fn fixed_s_has_no_collisions_on_samples(words: Vec<u32>) -> bool {
        let mut seen: Vec<(u32, u32)> = words.iter().map(|&w| (fixed_s(w), w)).collect();
        seen.sort_unstable();
        seen.windows(2)
            .all(|p| p[0].0 != p[1].0 || p[0].1 == p[1].1)
    }

    #[quickcheck]
    fn keystream_depends_on_every_key_word(seed: u32) -> bool {
        let mut key = [0u8; 16];
        key[..4].copy_from_slice(&seed.to_be_bytes());
        let mut other = key;
        other[12] ^= 0x01;
        keyed(&key, b"0123456789AB")[..] != keyed(&other, b"0123456789AB")[..]
    }
}
