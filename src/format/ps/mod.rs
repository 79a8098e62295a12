//! MPEG program stream demultiplexer.
//!
//! Scans the payload for `00 00 01 xx` start codes and copies everything
//! through byte-exact, with two exceptions: private packets carrying key
//! material rekey the session (and still pass through unchanged), and
//! scrambled audio/video PES packets come out with the scrambling-control
//! bits cleared and the body XORed against a fresh keystream frame.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::cipher::TuringStream;
use crate::config::DecoderConfig;
use crate::error::{Result, TivoError};
use crate::format::ts::types::KeyPayload;
use crate::utils::TivoSource;

/// Pack start code.
const PACK_START: u8 = 0xba;
/// Bytes of an MPEG-2 pack header following the start code, before stuffing.
const PACK_HEADER_LEN: usize = 10;

/// Program stream demultiplexer; owns the source, the sink and the main
/// keystream session for the run.
pub struct PsDemuxer<R, W> {
    source: TivoSource<R>,
    sink: W,
    session: TuringStream,
    config: DecoderConfig,
    packet_count: u32,
}

impl<R, W> PsDemuxer<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Creates a demuxer over an already-positioned source.
    pub fn new(
        session: TuringStream,
        source: TivoSource<R>,
        sink: W,
        config: DecoderConfig,
    ) -> Self {
        Self {
            source,
            sink,
            session,
            config,
            packet_count: 0,
        }
    }

    /// Runs the scan to end of input. Bytes that are not part of a start
    /// code pass through unchanged, so output offsets mirror input offsets.
    pub async fn process(&mut self) -> Result<()> {
        let mut window = [0u8; 4];
        let mut filled = 0usize;
        loop {
            while filled < 4 {
                match self.source.read_byte().await? {
                    Some(b) => {
                        window[filled] = b;
                        filled += 1;
                    }
                    None => {
                        self.sink.write_all(&window[..filled]).await?;
                        self.sink.flush().await?;
                        return Ok(());
                    }
                }
            }

            if window[0] == 0 && window[1] == 0 && window[2] == 1 {
                self.handle_packet(window[3]).await?;
                filled = 0;
            } else {
                self.sink.write_all(&window[..1]).await?;
                window.rotate_left(1);
                filled = 3;
            }
        }
    }

    /// Dispatches one packet whose start code was just consumed.
    async fn handle_packet(&mut self, code: u8) -> Result<()> {
        self.packet_count += 1;
        self.sink.write_all(&[0, 0, 1, code]).await?;

        match code {
            PACK_START => self.copy_pack_header().await,
            0xbc..=0xbf | 0xfd => self.handle_private(code).await,
            0xc0..=0xef => self.handle_pes(code).await,
            0x00..=0xb9 => {
                // Bare start code with no length field; the scan copies
                // whatever follows it.
                Ok(())
            }
            _ => {
                let body = self.read_sized_body().await?;
                self.sink.write_all(&body).await?;
                Ok(())
            }
        }
    }

    /// Copies an MPEG-2 pack header, honouring its stuffing length.
    async fn copy_pack_header(&mut self) -> Result<()> {
        let mut fixed = [0u8; PACK_HEADER_LEN];
        self.source.read_exact(&mut fixed).await?;
        self.sink.write_all(&fixed).await?;

        let stuffing = (fixed[PACK_HEADER_LEN - 1] & 0x07) as usize;
        if stuffing > 0 {
            let mut pad = [0u8; 7];
            self.source.read_exact(&mut pad[..stuffing]).await?;
            self.sink.write_all(&pad[..stuffing]).await?;
        }
        Ok(())
    }

    /// Reads the 16-bit packet length and the body it covers, framed
    /// together so the caller can pass the packet through byte-exact.
    async fn read_sized_body(&mut self) -> Result<BytesMut> {
        let mut len = [0u8; 2];
        self.source.read_exact(&mut len).await?;
        let body_len = u16::from_be_bytes(len) as usize;

        let mut framed = BytesMut::with_capacity(2 + body_len);
        framed.put_slice(&len);
        framed.resize(2 + body_len, 0);
        self.source.read_exact(&mut framed[2..]).await?;
        Ok(framed)
    }

    /// A private packet carrying key material: rekey the session, then pass
    /// the packet through unchanged.
    async fn handle_private(&mut self, code: u8) -> Result<()> {
        let framed = self.read_sized_body().await?;
        let body = &framed[2..];
        match KeyPayload::parse(body) {
            Some(key) => {
                log::debug!(
                    "pkt {}: key packet {:#04x}, block {}, crypted {:#x}",
                    self.packet_count,
                    code,
                    key.block_no,
                    key.crypted
                );
                self.session
                    .rekey(key.block_no, code, key.crypted, key.salt, key.key)?;
            }
            None => {
                log::warn!(
                    "pkt {}: private packet {:#04x} too short for key material ({} bytes)",
                    self.packet_count,
                    code,
                    body.len()
                );
            }
        }
        self.sink.write_all(&framed).await?;
        Ok(())
    }

    /// An audio or video PES packet. A non-zero scrambling-control field
    /// marks the body as encrypted: the bits are cleared in the output copy,
    /// a fresh frame is prepared for this stream id, and the body after the
    /// optional PES header is XORed from offset zero of that frame. The
    /// header bytes stay in the clear and consume no keystream.
    async fn handle_pes(&mut self, code: u8) -> Result<()> {
        let mut framed = self.read_sized_body().await?;
        let body = &mut framed[2..];

        // MPEG-2 optional header: flags, flags, header data length.
        if body.len() >= 3 && (body[0] & 0xc0) == 0x80 {
            let scrambling = (body[0] >> 4) & 0x03;
            if scrambling != 0 {
                if !self.session.has_key() {
                    return Err(TivoError::NoKeyForStream(code as u16));
                }
                body[0] &= !0x30;
                let payload_start = (3 + body[2] as usize).min(body.len());

                if self.config.dump_packet(self.packet_count) {
                    log::debug!(
                        "pkt {}: pes {:#04x}, scrambling {:#04b}, header {} bytes, body {} bytes",
                        self.packet_count,
                        code,
                        scrambling,
                        payload_start,
                        body.len() - payload_start
                    );
                }

                self.session.prepare_frame(code)?;
                self.session.decrypt(&mut body[payload_start..])?;
            }
        }

        self.sink.write_all(&framed).await?;
        Ok(())
    }
}
