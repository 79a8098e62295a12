//! Keystream sessions over the Turing cipher.
//!
//! A session pairs one cipher instance with a byte cursor and the key
//! material that seeds it: the media access key, a 16-byte per-session key,
//! and a block counter. Each block re-IVs the cipher from a SHA1 digest of
//! that material and exposes a 20-byte window of the generated output;
//! running off the end of the window advances the block transparently.

use sha1::{Digest, Sha1};

use super::turing::{Turing, GEN_BYTES};
use crate::error::Result;

/// Bytes of keystream exposed per block.
pub const CIPHER_WINDOW: usize = 20;

/// MAK derivation buffer: ten digits, NUL-padded to a whole number of
/// cipher words.
const MAK_BUF: usize = 12;

/// One logical keystream: cipher state plus cursor and key material.
#[derive(Debug)]
pub struct TuringStream {
    mak: [u8; MAK_BUF],
    mak_len: usize,
    cipher: Turing,
    keyed: bool,
    has_key: bool,
    turing_key: [u8; 16],
    salt: [u8; 4],
    crypted: u32,
    block_counter: u32,
    stream_id: u8,
    buffer: [u8; GEN_BYTES],
    cursor: usize,
}

impl TuringStream {
    /// Creates a session with no key material yet; `rekey` must arrive
    /// before the session can produce meaningful keystream.
    pub fn new(mak: &str) -> Self {
        let mut buf = [0u8; MAK_BUF];
        let len = mak.len().min(MAK_BUF - 1);
        buf[..len].copy_from_slice(&mak.as_bytes()[..len]);
        Self {
            mak: buf,
            mak_len: len,
            cipher: Turing::new(),
            keyed: false,
            has_key: false,
            turing_key: [0; 16],
            salt: [0; 4],
            crypted: 0,
            block_counter: 0,
            stream_id: 0,
            buffer: [0; GEN_BYTES],
            cursor: 0,
        }
    }

    /// Session keyed from the plaintext metadata chunk: the per-session key
    /// is the leading half of `SHA1(mak || chunk)`.
    pub fn with_chunk_key(mak: &str, chunk: &[u8]) -> Result<Self> {
        let mut session = Self::new(mak);
        let mut hasher = Sha1::new();
        hasher.update(&session.mak[..session.mak_len]);
        hasher.update(chunk);
        let digest = hasher.finalize();
        session.turing_key.copy_from_slice(&digest[..16]);
        session.has_key = true;
        session.prepare_frame(0)?;
        Ok(session)
    }

    /// Session for the encrypted metadata chunks. The MAK is first expanded
    /// to a 32-character lowercase-hex intermediate which replaces it in the
    /// chunk-key derivation.
    pub fn with_metadata_key(mak: &str, chunk: &[u8]) -> Result<Self> {
        let mut session = Self::new(mak);
        let mut hasher = Sha1::new();
        hasher.update(&session.mak[..session.mak_len]);
        hasher.update(chunk);
        let inner = hasher.finalize();

        let mut metakey = [0u8; 32];
        const LOOKUP: &[u8; 16] = b"0123456789abcdef";
        for (i, &b) in inner[..16].iter().enumerate() {
            metakey[i * 2] = LOOKUP[(b >> 4) as usize];
            metakey[i * 2 + 1] = LOOKUP[(b & 0x0f) as usize];
        }

        let mut hasher = Sha1::new();
        hasher.update(metakey);
        hasher.update(chunk);
        let outer = hasher.finalize();
        session.turing_key.copy_from_slice(&outer[..16]);
        session.has_key = true;
        session.prepare_frame(0)?;
        Ok(session)
    }

    /// A fresh session sharing this one's MAK but none of its key state.
    /// The transport demultiplexer uses this to grow one session per PID.
    pub fn fork(&self) -> Self {
        let mut session = Self::new("");
        session.mak = self.mak;
        session.mak_len = self.mak_len;
        session
    }

    /// True once the session has received key material, either from the
    /// metadata chunks or from a key packet.
    pub fn has_key(&self) -> bool {
        self.has_key
    }

    /// The `crypted` word carried by the most recent key packet.
    pub fn crypted(&self) -> u32 {
        self.crypted
    }

    /// The salt carried by the most recent key packet.
    pub fn salt(&self) -> [u8; 4] {
        self.salt
    }

    /// Re-initialises the cipher for the current block and points the
    /// window at its first 20 bytes. The block IV is the SHA1 digest of
    /// `mak || turing_key || block_counter(be) || stream_id`; the cipher
    /// itself is keyed once per session from the padded MAK buffer.
    pub fn prepare_frame(&mut self, stream_id: u8) -> Result<()> {
        let mut hasher = Sha1::new();
        hasher.update(&self.mak[..self.mak_len]);
        hasher.update(self.turing_key);
        hasher.update(self.block_counter.to_be_bytes());
        hasher.update([stream_id]);
        let digest = hasher.finalize();

        if !self.keyed {
            self.cipher.key(&self.mak)?;
            self.keyed = true;
        }
        self.cipher.iv(&digest)?;
        self.buffer.fill(0);
        self.cipher.gen(&mut self.buffer);
        self.cursor = 0;
        self.stream_id = stream_id;
        Ok(())
    }

    /// Installs key material from a key packet and re-prepares the frame.
    pub fn rekey(
        &mut self,
        block_no: u32,
        stream_id: u8,
        crypted: u32,
        salt: [u8; 4],
        key: [u8; 16],
    ) -> Result<()> {
        self.block_counter = block_no;
        self.crypted = crypted;
        self.salt = salt;
        self.turing_key = key;
        self.has_key = true;
        self.prepare_frame(stream_id)
    }

    fn advance_block(&mut self) -> Result<()> {
        self.block_counter = self.block_counter.wrapping_add(1);
        self.prepare_frame(self.stream_id)
    }

    /// Advances the cursor by `n` bytes without touching any data.
    pub fn skip(&mut self, mut n: u64) -> Result<()> {
        while n > 0 {
            if self.cursor == CIPHER_WINDOW {
                self.advance_block()?;
            }
            let take = n.min((CIPHER_WINDOW - self.cursor) as u64);
            self.cursor += take as usize;
            n -= take;
        }
        Ok(())
    }

    /// XORs the buffer against the keystream in place, advancing blocks
    /// across 20-byte window boundaries as needed. XOR is self-inverse, so
    /// the same call encrypts and decrypts.
    pub fn decrypt(&mut self, buf: &mut [u8]) -> Result<()> {
        for b in buf.iter_mut() {
            if self.cursor == CIPHER_WINDOW {
                self.advance_block()?;
            }
            *b ^= self.buffer[self.cursor];
            self.cursor += 1;
        }
        Ok(())
    }

    /// Checks that a candidate MAK is a well-formed ten-digit key.
    pub fn verify_mak(mak: &str) -> bool {
        mak.len() == 10 && mak.bytes().all(|b| b.is_ascii_digit())
    }
}
