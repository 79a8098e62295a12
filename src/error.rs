//! Error types shared across the decoder pipeline.
//!
//! Only [`TivoError::ResyncRequired`] is recovered locally (the transport
//! demultiplexer skips to the next sync byte); every other kind surfaces to
//! the pipeline driver, which halts without flushing further output.

use thiserror::Error;

/// Primary error type for the tivodec library.
#[derive(Error, Debug)]
pub enum TivoError {
    /// I/O errors from the source or sink.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Cipher key or IV material with an invalid length.
    #[error("invalid key length: {0} bytes")]
    InvalidKeyLength(usize),

    /// Bad magic or a truncated container header or chunk header.
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    /// Input ended in the middle of a chunk or packet.
    #[error("unexpected end of input: {0}")]
    UnexpectedEof(String),

    /// A forward-only source was asked to seek backwards.
    #[error("backward seek unsupported: at offset {pos}, requested {target}")]
    BackwardSeekUnsupported {
        /// Current source offset.
        pos: u64,
        /// Requested absolute offset.
        target: u64,
    },

    /// Transport stream sync byte missing; the demultiplexer rescans.
    #[error("transport sync lost at offset {0}")]
    ResyncRequired(u64),

    /// A scrambled payload arrived before any key packet for its stream.
    #[error("scrambled payload on pid {0:#06x} before any key packet")]
    NoKeyForStream(u16),

    /// Trial decryption disagreed with the expected plaintext.
    #[error("media access key rejected by trial decryption")]
    MakVerificationFailed,

    /// A metadata chunk with a type other than plaintext or encrypted XML.
    #[error("unknown metadata chunk type {0}")]
    ChunkTypeUnknown(u16),
}

/// A specialized Result type for tivodec operations.
pub type Result<T> = std::result::Result<T, TivoError>;
