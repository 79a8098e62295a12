#![doc(html_root_url = "https://docs.rs/tivodec/0.1.0")]
#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]

//! # tivodec - TiVo recording decryptor
//!
//! `tivodec` turns recordings saved by a TiVo DVR into standard MPEG files.
//! The proprietary container prepends a small header and a run of metadata
//! chunks (one plaintext XML, the rest encrypted) to an MPEG payload whose
//! scrambled regions are enciphered with the Turing stream cipher, keyed
//! from the recording's ten-digit Media Access Key and per-stream key
//! material embedded in the payload itself.
//!
//! ## Pipeline
//!
//! ```text
//! source -> container parser -> { metadata decryptor,
//!                                 PS demux | TS demux } -> sink
//! ```
//!
//! The container parser classifies the payload as program stream or
//! transport stream and seeds the first keystream sessions from the MAK;
//! the demultiplexers then walk the multiplex, picking up fresh key
//! material from private packets as they go, and emit a standard `.mpg`
//! or `.ts` byte stream with scrambling-control bits cleared.
//!
//! ## Example
//!
//! ```rust,no_run
//! use tivodec::config::DecoderConfig;
//! use tivodec::format::{self, Decoder};
//! use tivodec::utils::TivoSource;
//!
//! # async fn example() -> tivodec::Result<()> {
//! let input = tokio::fs::File::open("recording.TiVo").await?;
//! let mut source = TivoSource::new(input);
//! let config = DecoderConfig::default();
//!
//! let file = format::container::open(&mut source, "0123456789", &config).await?;
//!
//! let sink = tokio::fs::File::create("recording.mpg").await?;
//! let mut decoder = Decoder::new(
//!     file.header.format(),
//!     file.main_session,
//!     source,
//!     sink,
//!     config,
//! );
//! decoder.process().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Overview
//!
//! - `cipher`: the Turing stream cipher and the keystream sessions that
//!   wrap it with key derivation and cursor tracking
//! - `format`: container parsing, metadata decryption, and the PS/TS
//!   demultiplexers
//! - `error`: error types and the crate-wide `Result` alias
//! - `utils`: the forward-only buffered byte source
//! - `config`: the switch set threaded through the pipeline

/// Turing stream cipher and keystream sessions
pub mod cipher;

/// Runtime configuration
pub mod config;

/// Error types and utilities
pub mod error;

/// Container parsing and the PS/TS demultiplexers
pub mod format;

/// Common utilities and helper types
pub mod utils;

pub use error::{Result, TivoError};
