//! Container and multiplex format handling.
//!
//! The container parser reads the TiVo preamble and hands the positioned
//! source to one of two demultiplexers, selected by the header flags:
//! program stream or transport stream. Both share the same shape — source
//! in, sink out, keystream sessions in between — so the dispatch is a plain
//! two-variant enum rather than a trait object.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::cipher::TuringStream;
use crate::config::DecoderConfig;
use crate::error::Result;
use crate::utils::TivoSource;

/// TiVo container header and metadata chunk parsing.
pub mod container;

/// Metadata decryption and program-name derivation.
pub mod metadata;

/// MPEG program stream demultiplexer.
pub mod ps;

/// MPEG transport stream demultiplexer.
pub mod ts;

pub use container::{ContainerFormat, TivoChunk, TivoFile, TivoHeader};
pub use ps::PsDemuxer;
pub use ts::TsDemuxer;

/// The decoding pipeline for one recording: either demultiplexer behind a
/// single `process` entry point.
pub enum Decoder<R, W> {
    /// Program stream pipeline.
    Ps(PsDemuxer<R, W>),
    /// Transport stream pipeline.
    Ts(TsDemuxer<R, W>),
}

impl<R, W> Decoder<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Builds the pipeline matching the container format. The source must
    /// already be positioned at the MPEG payload, the session being the one
    /// the container parser seeded.
    pub fn new(
        format: ContainerFormat,
        session: TuringStream,
        source: TivoSource<R>,
        sink: W,
        config: DecoderConfig,
    ) -> Self {
        match format {
            ContainerFormat::ProgramStream => {
                Decoder::Ps(PsDemuxer::new(session, source, sink, config))
            }
            ContainerFormat::TransportStream => {
                Decoder::Ts(TsDemuxer::new(session, source, sink, config))
            }
        }
    }

    /// Decodes the whole payload, writing the decrypted multiplex to the
    /// sink. On a fatal error the sink is left unflushed.
    pub async fn process(&mut self) -> Result<()> {
        match self {
            Decoder::Ps(demuxer) => demuxer.process().await,
            Decoder::Ts(demuxer) => demuxer.process().await,
        }
    }
}
