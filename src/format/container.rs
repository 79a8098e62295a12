//! TiVo container parsing: the fixed file header and the metadata chunks
//! that precede the MPEG payload.

use tokio::io::AsyncRead;

use super::metadata;
use crate::cipher::TuringStream;
use crate::config::DecoderConfig;
use crate::error::{Result, TivoError};
use crate::utils::TivoSource;

/// Size of the fixed container header.
pub const HEADER_LEN: usize = 16;
/// Size of a chunk header (chunk size, data size, id, type).
pub const CHUNK_HEADER_LEN: usize = 12;

/// Multiplex format of the MPEG payload, taken from the header flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    /// MPEG program stream.
    ProgramStream,
    /// MPEG transport stream.
    TransportStream,
}

/// The fixed 16-byte container header. All fields are big-endian; three
/// reserved words sit between the magic and the payload offset.
#[derive(Debug, Clone)]
pub struct TivoHeader {
    /// Second reserved word; bit 0x20 of its low byte selects TS over PS.
    pub flags: u16,
    /// Absolute offset of the MPEG payload.
    pub mpeg_offset: u32,
    /// Number of metadata chunks that follow the header.
    pub chunk_count: u16,
}

impl TivoHeader {
    /// Reads and validates the container header. Truncation and a bad magic
    /// are both reported as [`TivoError::MalformedHeader`].
    pub async fn read<R>(src: &mut TivoSource<R>) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut buf = [0u8; HEADER_LEN];
        src.read_exact(&mut buf).await.map_err(|e| match e {
            TivoError::UnexpectedEof(_) => {
                TivoError::MalformedHeader("truncated container header".into())
            }
            other => other,
        })?;

        if &buf[0..4] != b"TiVo" {
            return Err(TivoError::MalformedHeader(format!(
                "bad magic {:02x} {:02x} {:02x} {:02x}",
                buf[0], buf[1], buf[2], buf[3]
            )));
        }

        Ok(Self {
            flags: u16::from_be_bytes([buf[6], buf[7]]),
            mpeg_offset: u32::from_be_bytes([buf[10], buf[11], buf[12], buf[13]]),
            chunk_count: u16::from_be_bytes([buf[14], buf[15]]),
        })
    }

    /// PS or TS, from the header flags.
    pub fn format(&self) -> ContainerFormat {
        if self.flags & 0x20 != 0 {
            ContainerFormat::TransportStream
        } else {
            ContainerFormat::ProgramStream
        }
    }
}

/// Metadata chunk payload kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkType {
    /// Chunk data is XML in the clear.
    PlaintextXml,
    /// Chunk data is XML under the metadata keystream.
    EncryptedXml,
}

/// One metadata chunk: identification plus its (possibly still encrypted)
/// payload bytes. Padding between `data_size` and `chunk_size` is consumed
/// on read and not retained.
#[derive(Debug, Clone)]
pub struct TivoChunk {
    /// Absolute offset of the chunk payload (chunk header offset + 12).
    pub start: u64,
    /// Chunk identifier; id 1 carries the program naming metadata.
    pub id: u16,
    /// Payload kind.
    pub chunk_type: ChunkType,
    /// `data_size` payload bytes.
    pub data: Vec<u8>,
}

impl TivoChunk {
    /// Reads one chunk including its padding.
    pub async fn read<R>(src: &mut TivoSource<R>) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send,
    {
        let start = src.tell() + CHUNK_HEADER_LEN as u64;

        let mut header = [0u8; CHUNK_HEADER_LEN];
        src.read_exact(&mut header).await?;
        let chunk_size = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let data_size = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let id = u16::from_be_bytes([header[8], header[9]]);
        let raw_type = u16::from_be_bytes([header[10], header[11]]);

        if chunk_size < CHUNK_HEADER_LEN + data_size {
            return Err(TivoError::MalformedHeader(format!(
                "chunk {:#06x}: size {} cannot hold {} data bytes",
                id, chunk_size, data_size
            )));
        }

        let chunk_type = match raw_type {
            0 => ChunkType::PlaintextXml,
            1 => ChunkType::EncryptedXml,
            other => return Err(TivoError::ChunkTypeUnknown(other)),
        };

        let mut body = vec![0u8; chunk_size - CHUNK_HEADER_LEN];
        src.read_exact(&mut body).await?;
        body.truncate(data_size);

        log::debug!(
            "chunk {:#06x}: type {:?}, {} data bytes at offset {}",
            id,
            chunk_type,
            data_size,
            start
        );

        Ok(Self {
            start,
            id,
            chunk_type,
            data: body,
        })
    }
}

/// A parsed container: header, decrypted metadata chunks, the main
/// keystream session, and the program name derived from the metadata.
/// The source is left positioned at the MPEG payload.
#[derive(Debug)]
pub struct TivoFile {
    /// Container header.
    pub header: TivoHeader,
    /// All metadata chunks, decrypted in place.
    pub chunks: Vec<TivoChunk>,
    /// The payload keystream session, seeded from the plaintext chunk.
    pub main_session: TuringStream,
    /// Output name derived from the program metadata, when present.
    pub derived_name: Option<String>,
}

/// Parses the container preamble: header, all metadata chunks (decrypting
/// the encrypted ones and running the MAK trial check), then seeks the
/// source forward to the MPEG payload.
pub async fn open<R>(
    src: &mut TivoSource<R>,
    mak: &str,
    config: &DecoderConfig,
) -> Result<TivoFile>
where
    R: AsyncRead + Unpin + Send,
{
    let header = TivoHeader::read(src).await?;
    log::debug!(
        "container: {:?}, mpeg payload at {}, {} chunks",
        header.format(),
        header.mpeg_offset,
        header.chunk_count
    );

    let mut main_session = None;
    let mut meta_session: Option<TuringStream> = None;
    let mut meta_stream_pos = 0u64;
    let mut verified = config.no_verify;
    let mut derived_name = None;
    let mut chunks = Vec::with_capacity(header.chunk_count as usize);

    for _ in 0..header.chunk_count {
        let mut chunk = TivoChunk::read(src).await?;
        match chunk.chunk_type {
            ChunkType::PlaintextXml => {
                main_session = Some(TuringStream::with_chunk_key(mak, &chunk.data)?);
                meta_session = Some(TuringStream::with_metadata_key(mak, &chunk.data)?);
            }
            ChunkType::EncryptedXml => {
                let session = meta_session.as_mut().ok_or_else(|| {
                    TivoError::MalformedHeader("encrypted chunk before the plaintext chunk".into())
                })?;
                metadata::decrypt_chunk(session, &mut chunk, &mut meta_stream_pos)?;
                if !verified {
                    metadata::check_plaintext(&chunk.data)?;
                    verified = true;
                }
            }
        }

        if chunk.id == 1 {
            if let Some(name) = metadata::derive_name(&chunk.data) {
                derived_name = Some(name);
            }
        }
        chunks.push(chunk);
    }

    let main_session = main_session.ok_or_else(|| {
        TivoError::MalformedHeader("container carries no plaintext metadata chunk".into())
    })?;

    src.seek_forward(header.mpeg_offset as u64).await?;

    Ok(TivoFile {
        header,
        chunks,
        main_session,
        derived_name,
    })
}
