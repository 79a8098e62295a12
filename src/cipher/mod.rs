//! Turing stream cipher and the keystream sessions built on it.
//!
//! The cipher itself ([`Turing`]) is a pure keystream generator; the
//! demultiplexers consume it through [`TuringStream`], which owns the key
//! material, the block counter and the 20-byte output window.

mod tables;

/// Core cipher: LFSR, key schedule, IV load and block generation.
pub mod turing;

/// Keystream sessions: per-block IV derivation and cursor management.
pub mod stream;

pub use stream::{TuringStream, CIPHER_WINDOW};
pub use turing::Turing;
