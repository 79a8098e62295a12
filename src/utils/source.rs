//! Forward-only byte source over a file or pipe.

use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

use crate::error::{Result, TivoError};

/// Discard granularity for forward seeks.
const JUNK_BUF: usize = 4096;

/// Buffered reader with position tracking and forward-only seeking.
///
/// Seeking never touches the underlying stream position directly; it reads
/// and discards, which works identically for regular files and pipes such
/// as stdin.
pub struct TivoSource<R> {
    reader: BufReader<R>,
    pos: u64,
}

impl<R: AsyncRead + Unpin + Send> TivoSource<R> {
    /// Wraps a reader at logical offset zero.
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            pos: 0,
        }
    }

    /// Current logical offset: bytes consumed so far.
    pub fn tell(&self) -> u64 {
        self.pos
    }

    /// Fills `buf` completely or fails with [`TivoError::UnexpectedEof`].
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.reader.read_exact(buf).await {
            Ok(_) => {
                self.pos += buf.len() as u64;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(
                TivoError::UnexpectedEof(format!("short read at offset {}", self.pos)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads up to `buf.len()` bytes; returns 0 at end of input.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.reader.read(buf).await?;
        self.pos += n as u64;
        Ok(n)
    }

    /// Reads one byte, or `None` at end of input.
    pub async fn read_byte(&mut self) -> Result<Option<u8>> {
        let mut b = [0u8; 1];
        Ok(match self.read(&mut b).await? {
            0 => None,
            _ => Some(b[0]),
        })
    }

    /// Fills a whole fixed-size frame. Returns `false` on a clean end of
    /// input at a frame boundary; a partial frame is an error.
    pub async fn read_frame(&mut self, buf: &mut [u8]) -> Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(TivoError::UnexpectedEof(format!(
                    "packet truncated to {} bytes at offset {}",
                    filled, self.pos
                )));
            }
            filled += n;
        }
        Ok(true)
    }

    /// Advances to an absolute offset by discarding bytes.
    pub async fn seek_forward(&mut self, target: u64) -> Result<()> {
        if target < self.pos {
            return Err(TivoError::BackwardSeekUnsupported {
                pos: self.pos,
                target,
            });
        }
        let mut junk = [0u8; JUNK_BUF];
        while self.pos < target {
            let n = (target - self.pos).min(JUNK_BUF as u64) as usize;
            self.read_exact(&mut junk[..n]).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn tracks_position_across_reads_and_seeks() {
        let data: Vec<u8> = (0..=255).collect();
        let mut src = TivoSource::new(Cursor::new(data));

        let mut head = [0u8; 4];
        src.read_exact(&mut head).await.unwrap();
        assert_eq!(head, [0, 1, 2, 3]);
        assert_eq!(src.tell(), 4);

        src.seek_forward(100).await.unwrap();
        assert_eq!(src.tell(), 100);
        assert_eq!(src.read_byte().await.unwrap(), Some(100));
    }

    #[tokio::test]
    async fn rejects_backward_seek() {
        let mut src = TivoSource::new(Cursor::new(vec![0u8; 64]));
        src.seek_forward(32).await.unwrap();
        assert!(matches!(
            src.seek_forward(16).await,
            Err(TivoError::BackwardSeekUnsupported { pos: 32, target: 16 })
        ));
    }

    #[tokio::test]
    async fn short_read_is_unexpected_eof() {
        let mut src = TivoSource::new(Cursor::new(vec![0u8; 10]));
        let mut buf = [0u8; 16];
        assert!(matches!(
            src.read_exact(&mut buf).await,
            Err(TivoError::UnexpectedEof(_))
        ));
    }

    #[tokio::test]
    async fn frame_reads_distinguish_clean_eof() {
        let mut src = TivoSource::new(Cursor::new(vec![0u8; 188 * 2]));
        let mut frame = [0u8; 188];
        assert!(src.read_frame(&mut frame).await.unwrap());
        assert!(src.read_frame(&mut frame).await.unwrap());
        assert!(!src.read_frame(&mut frame).await.unwrap());
    }
}
