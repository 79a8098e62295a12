//! MPEG transport stream demultiplexer.
//!
//! Walks 188-byte packets, tracks PAT/PMT state to learn which PIDs carry
//! which elementary streams, picks up key material from the private data
//! PID, and decrypts scrambled payloads per PID. Every input packet is
//! written back out; the only modifications are cleared scrambling-control
//! bits and decrypted payload bytes.

/// Core TS types and constants.
pub mod types;

use std::collections::HashMap;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::cipher::TuringStream;
use crate::config::DecoderConfig;
use crate::error::{Result, TivoError};
use crate::utils::TivoSource;
use types::{
    classify_stream_type, KeyPayload, StreamClass, TsHeader, PID_NULL, PID_PAT, TS_HEADER_SIZE,
    TS_PACKET_SIZE, TS_SYNC_BYTE,
};

/// Table id of the Program Association Table.
const TABLE_ID_PAT: u8 = 0x00;
/// Table id of the Program Map Table.
const TABLE_ID_PMT: u8 = 0x02;

/// One elementary stream registered from the PMT.
struct TsStream {
    class: StreamClass,
    session: TuringStream,
}

/// Accumulates a PSI section across packets until `needed` bytes arrived.
#[derive(Default)]
struct SectionAssembler {
    data: Vec<u8>,
    needed: usize,
}

impl SectionAssembler {
    fn start(&mut self, section: &[u8]) -> Result<()> {
        if section.len() < 3 {
            return Err(TivoError::MalformedHeader("psi section too short".into()));
        }
        let section_length = ((section[1] as usize & 0x0f) << 8) | section[2] as usize;
        self.needed = 3 + section_length;
        self.data.clear();
        self.data
            .extend_from_slice(&section[..section.len().min(self.needed)]);
        Ok(())
    }

    fn push(&mut self, payload: &[u8]) {
        if self.needed == 0 {
            return;
        }
        let want = self.needed - self.data.len().min(self.needed);
        self.data.extend_from_slice(&payload[..payload.len().min(want)]);
    }

    fn take_complete(&mut self) -> Option<Vec<u8>> {
        if self.needed > 0 && self.data.len() >= self.needed {
            self.needed = 0;
            Some(std::mem::take(&mut self.data))
        } else {
            None
        }
    }
}

/// Transport stream demultiplexer; owns the source, the sink and one
/// keystream session per registered PID.
pub struct TsDemuxer<R, W> {
    source: TivoSource<R>,
    sink: W,
    session: TuringStream,
    config: DecoderConfig,
    streams: HashMap<u16, TsStream>,
    pmt_pid: Option<u16>,
    pmt_section: SectionAssembler,
    packet_count: u32,
}

impl<R, W> TsDemuxer<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Creates a demuxer over an already-positioned source. The container
    /// session serves as the template from which per-PID sessions fork.
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
            streams: HashMap::new(),
            pmt_pid: None,
            pmt_section: SectionAssembler::default(),
            packet_count: 0,
        }
    }

    /// Runs the packet loop to end of input.
    pub async fn process(&mut self) -> Result<()> {
        let mut buf = [0u8; TS_PACKET_SIZE];
        loop {
            if !self.read_aligned(&mut buf).await? {
                self.sink.flush().await?;
                return Ok(());
            }
            self.packet_count += 1;
            if self.config.dump_packet(self.packet_count) {
                log::debug!("pkt {}: {:02x?}", self.packet_count, &buf[..]);
            }
            self.handle_packet(&mut buf)?;
            self.sink.write_all(&buf).await?;
        }
    }

    /// Reads the next packet, realigning on a lost sync byte by discarding
    /// bytes until one is found. Returns `false` on clean end of input.
    async fn read_aligned(&mut self, buf: &mut [u8; TS_PACKET_SIZE]) -> Result<bool> {
        if !self.source.read_frame(buf).await? {
            return Ok(false);
        }
        if buf[0] == TS_SYNC_BYTE {
            return Ok(true);
        }
        log::warn!(
            "recovering: {}",
            TivoError::ResyncRequired(self.source.tell())
        );
        loop {
            if let Some(idx) = buf.iter().position(|&b| b == TS_SYNC_BYTE) {
                buf.copy_within(idx.., 0);
                let keep = TS_PACKET_SIZE - idx;
                self.source.read_exact(&mut buf[keep..]).await?;
                return Ok(true);
            }
            if !self.source.read_frame(buf).await? {
                return Ok(false);
            }
        }
    }

    /// Parses and, where needed, rewrites one packet in place.
    fn handle_packet(&mut self, buf: &mut [u8; TS_PACKET_SIZE]) -> Result<()> {
        let header = TsHeader::parse(buf)?;
        if header.pid == PID_NULL {
            return Ok(());
        }
        if header.transport_error {
            log::warn!("pkt {}: transport error, passed through", self.packet_count);
            return Ok(());
        }

        let mut offset = TS_HEADER_SIZE;
        if header.adaptation_field_exists {
            offset += 1 + buf[4] as usize;
            if offset > TS_PACKET_SIZE {
                return Err(TivoError::MalformedHeader(format!(
                    "pkt {}: adaptation field overruns packet",
                    self.packet_count
                )));
            }
        }
        if !header.contains_payload || offset >= TS_PACKET_SIZE {
            return Ok(());
        }

        if header.pid == PID_PAT {
            if header.payload_unit_start {
                self.parse_pat(&buf[offset..])?;
            }
            return Ok(());
        }
        if Some(header.pid) == self.pmt_pid {
            self.ingest_pmt(header.payload_unit_start, &buf[offset..])?;
            return Ok(());
        }

        let class = match self.streams.get(&header.pid) {
            Some(stream) => stream.class,
            None => {
                if header.scrambling_control != 0 {
                    // Scrambled data with no PMT registration: no key will
                    // ever arrive for it.
                    return Err(TivoError::NoKeyForStream(header.pid));
                }
                log::trace!(
                    "pkt {}: unregistered pid {:#06x} passed through",
                    self.packet_count,
                    header.pid
                );
                return Ok(());
            }
        };

        if class == StreamClass::PrivateData {
            if header.payload_unit_start {
                self.handle_key_packet(header.pid, buf, offset)?;
            }
            return Ok(());
        }

        if header.scrambling_control == 0 {
            return Ok(());
        }
        self.decrypt_payload(&header, buf, offset)
    }

    /// Learns the PMT PID from the first program in the PAT.
    fn parse_pat(&mut self, payload: &[u8]) -> Result<()> {
        let section = psi_section(payload)?;
        if section.first() != Some(&TABLE_ID_PAT) {
            return Err(TivoError::MalformedHeader(format!(
                "pat table id {:#04x}",
                section.first().copied().unwrap_or(0xff)
            )));
        }
        let section_length = ((section[1] as usize & 0x0f) << 8) | section[2] as usize;
        let total = (3 + section_length).min(section.len());
        if total < 12 {
            return Err(TivoError::MalformedHeader("pat section too short".into()));
        }

        for entry in section[8..total - 4].chunks_exact(4) {
            let program_number = u16::from_be_bytes([entry[0], entry[1]]);
            let pid = (((entry[2] & 0x1f) as u16) << 8) | entry[3] as u16;
            if program_number != 0 {
                if self.pmt_pid != Some(pid) {
                    log::debug!("pat: program {} on pmt pid {:#06x}", program_number, pid);
                }
                self.pmt_pid = Some(pid);
                break;
            }
        }
        Ok(())
    }

    /// Feeds PMT payload bytes into the section assembler, parsing the
    /// table once a full section has arrived. Sections may span packets.
    fn ingest_pmt(&mut self, payload_unit_start: bool, payload: &[u8]) -> Result<()> {
        if payload_unit_start {
            let section = psi_section(payload)?;
            self.pmt_section.start(section)?;
        } else {
            self.pmt_section.push(payload);
        }
        if let Some(section) = self.pmt_section.take_complete() {
            self.parse_pmt(&section)?;
        }
        Ok(())
    }

    /// Registers every elementary stream in the PMT, forking a fresh
    /// keystream session per new PID.
    fn parse_pmt(&mut self, section: &[u8]) -> Result<()> {
        if section.first() != Some(&TABLE_ID_PMT) {
            return Err(TivoError::MalformedHeader(format!(
                "pmt table id {:#04x}",
                section.first().copied().unwrap_or(0xff)
            )));
        }
        let section_length = ((section[1] as usize & 0x0f) << 8) | section[2] as usize;
        let total = (3 + section_length).min(section.len());
        if total < 16 {
            return Err(TivoError::MalformedHeader("pmt section too short".into()));
        }

        // Past table header and PCR PID to the program info loop.
        let program_info_length = ((section[10] as usize & 0x0f) << 8) | section[11] as usize;
        let mut pos = 12 + program_info_length;

        while pos + 5 <= total - 4 {
            let stream_type = section[pos];
            let pid = (((section[pos + 1] & 0x1f) as u16) << 8) | section[pos + 2] as u16;
            let es_info_length = ((section[pos + 3] as usize & 0x0f) << 8) | section[pos + 4] as usize;
            pos += 5 + es_info_length;

            let class = classify_stream_type(stream_type);
            let template = &self.session;
            self.streams.entry(pid).or_insert_with(|| {
                log::debug!(
                    "pmt: pid {:#06x}, stream type {:#04x} ({:?})",
                    pid,
                    stream_type,
                    class
                );
                TsStream {
                    class,
                    session: template.fork(),
                }
            });
        }
        Ok(())
    }

    /// A private-data packet opening with a PES prelude for one of the
    /// private stream ids carries key material: install it into every
    /// audio and video session.
    fn handle_key_packet(
        &mut self,
        pid: u16,
        buf: &[u8; TS_PACKET_SIZE],
        offset: usize,
    ) -> Result<()> {
        let payload = &buf[offset..];
        if payload.len() < 6 || payload[0] != 0 || payload[1] != 0 || payload[2] != 1 {
            return Ok(());
        }
        let stream_id = payload[3];
        if !matches!(stream_id, 0xbc..=0xbf | 0xfd) {
            return Ok(());
        }
        let Some(key) = KeyPayload::parse(&payload[6..]) else {
            log::warn!(
                "pkt {}: key packet on pid {:#06x} too short",
                self.packet_count,
                pid
            );
            return Ok(());
        };

        log::debug!(
            "pkt {}: key packet on pid {:#06x}, block {}, crypted {:#x}",
            self.packet_count,
            pid,
            key.block_no,
            key.crypted
        );
        for stream in self.streams.values_mut() {
            if matches!(stream.class, StreamClass::Video | StreamClass::Audio) {
                stream
                    .session
                    .rekey(key.block_no, stream_id, key.crypted, key.salt, key.key)?;
            }
        }
        Ok(())
    }

    /// Decrypts the scrambled payload of a data packet in place and clears
    /// the scrambling-control bits in the output copy. When the packet
    /// opens a PES unit the header stays in the clear: the keystream is
    /// advanced over it with `skip` and the remainder XORed. Continuation
    /// packets pick up from the session cursor, which advances its block
    /// counter transparently across 20-byte frame boundaries.
    fn decrypt_payload(
        &mut self,
        header: &TsHeader,
        buf: &mut [u8; TS_PACKET_SIZE],
        offset: usize,
    ) -> Result<()> {
        let pid = header.pid;
        let stream = self.streams.get_mut(&pid).expect("registered stream");
        if !stream.session.has_key() {
            return Err(TivoError::NoKeyForStream(pid));
        }

        buf[3] &= !0xc0;
        let payload = &mut buf[offset..];

        if header.payload_unit_start {
            if payload.len() < 9 || payload[0] != 0 || payload[1] != 0 || payload[2] != 1 {
                return Err(TivoError::MalformedHeader(format!(
                    "pkt {}: scrambled pid {:#06x} starts without a pes prelude",
                    self.packet_count, pid
                )));
            }
            let stream_id = payload[3];
            let pes_header_length = payload[8] as usize;
            let clear = (pes_header_length + 9).min(payload.len());

            stream.session.prepare_frame(stream_id)?;
            stream.session.skip(clear as u64)?;
            stream.session.decrypt(&mut payload[clear..])?;
        } else {
            stream.session.decrypt(payload)?;
        }
        Ok(())
    }
}

/// Skips the pointer field at the head of a unit-start PSI payload.
fn psi_section(payload: &[u8]) -> Result<&[u8]> {
    let pointer = *payload
        .first()
        .ok_or_else(|| TivoError::MalformedHeader("empty psi payload".into()))?
        as usize;
    payload
        .get(1 + pointer..)
        .ok_or_else(|| TivoError::MalformedHeader("psi pointer field overruns packet".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const MAK: &str = "0123456789";
    const PMT_PID: u16 = 0x20;
    const VIDEO_PID: u16 = 0x21;
    const KEY_PID: u16 = 0x22;

    fn ts_packet(pid: u16, pusi: bool, scrambled: bool, counter: u8, payload: &[u8]) -> Vec<u8> {
        let mut pkt = vec![0u8; TS_PACKET_SIZE];
        pkt[0] = TS_SYNC_BYTE;
        pkt[1] = ((pid >> 8) as u8 & 0x1f) | if pusi { 0x40 } else { 0 };
        pkt[2] = pid as u8;
        pkt[3] = 0x10 | (counter & 0x0f) | if scrambled { 0x80 } else { 0 };
        pkt[4..4 + payload.len()].copy_from_slice(payload);
        pkt[4 + payload.len()..].fill(0xff);
        pkt
    }

    fn pat_packet() -> Vec<u8> {
        let mut section = vec![
            TABLE_ID_PAT,
            0xb0,
            13, // section length
            0x00,
            0x01, // transport stream id
            0xc1,
            0x00,
            0x00,
            0x00,
            0x01, // program 1
            0xe0 | (PMT_PID >> 8) as u8,
            PMT_PID as u8,
        ];
        section.extend_from_slice(&[0, 0, 0, 0]); // crc placeholder
        let mut payload = vec![0u8]; // pointer field
        payload.extend_from_slice(&section);
        ts_packet(PID_PAT, true, false, 0, &payload)
    }

    fn pmt_packet() -> Vec<u8> {
        let mut section = vec![
            TABLE_ID_PMT,
            0xb0,
            23, // section length
            0x00,
            0x01, // program number
            0xc1,
            0x00,
            0x00,
            0xe0 | (VIDEO_PID >> 8) as u8,
            VIDEO_PID as u8, // pcr pid
            0xf0,
            0x00, // no program info
            // video stream
            0x02,
            0xe0 | (VIDEO_PID >> 8) as u8,
            VIDEO_PID as u8,
            0xf0,
            0x00,
            // private data stream carrying key packets
            0x97,
            0xe0 | (KEY_PID >> 8) as u8,
            KEY_PID as u8,
            0xf0,
            0x00,
        ];
        section.extend_from_slice(&[0, 0, 0, 0]); // crc placeholder
        let mut payload = vec![0u8];
        payload.extend_from_slice(&section);
        ts_packet(PMT_PID, true, false, 0, &payload)
    }

    fn key_packet(block_no: u32, key: [u8; 16]) -> Vec<u8> {
        let mut payload = vec![0, 0, 1, 0xbd, 0, 28];
        payload.extend_from_slice(&block_no.to_be_bytes());
        payload.extend_from_slice(&1u32.to_be_bytes());
        payload.extend_from_slice(&[7, 7, 7, 7]);
        payload.extend_from_slice(&key);
        ts_packet(KEY_PID, true, false, 0, &payload)
    }

    async fn run(input: Vec<u8>) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut demux = TsDemuxer::new(
            TuringStream::new(MAK),
            TivoSource::new(Cursor::new(input)),
            &mut out,
            DecoderConfig::default(),
        );
        demux.process().await?;
        Ok(out)
    }

    #[tokio::test]
    async fn clear_stream_passes_through() {
        let mut input = pat_packet();
        input.extend_from_slice(&pmt_packet());
        input.extend_from_slice(&ts_packet(VIDEO_PID, true, false, 0, b"\x00\x00\x01\xe0rest"));
        input.extend_from_slice(&ts_packet(PID_NULL, false, false, 0, &[0xff; 32]));

        let out = run(input.clone()).await.unwrap();
        assert_eq!(out, input);
    }

    #[tokio::test]
    async fn scrambled_packets_are_decrypted_per_pid() {
        let key = [0x33; 16];
        let block_no = 2;

        // Payload of the unit-start packet: PES prelude with a 5-byte
        // optional header, then scrambled body.
        let pes_header_length = 5usize;
        let clear_len = 9 + pes_header_length;
        let body_len = TS_PACKET_SIZE - 4 - clear_len;

        let mut enc = TuringStream::new(MAK);
        enc.rekey(block_no, 0xe0, 1, [7, 7, 7, 7], key).unwrap();
        enc.skip(clear_len as u64).unwrap();

        let mut first_body = vec![0x11u8; body_len];
        enc.decrypt(&mut first_body).unwrap();
        let mut second_body = vec![0x22u8; TS_PACKET_SIZE - 4];
        enc.decrypt(&mut second_body).unwrap();
        let mut third_body = vec![0x33u8; TS_PACKET_SIZE - 4];
        enc.decrypt(&mut third_body).unwrap();

        let mut first_payload = vec![0, 0, 1, 0xe0, 0, 0, 0x80, 0x00, pes_header_length as u8];
        first_payload.extend_from_slice(&[0xff; 5]);
        first_payload.extend_from_slice(&first_body);

        let mut input = pat_packet();
        input.extend_from_slice(&pmt_packet());
        input.extend_from_slice(&key_packet(block_no, key));
        input.extend_from_slice(&ts_packet(VIDEO_PID, true, true, 1, &first_payload));
        input.extend_from_slice(&ts_packet(VIDEO_PID, false, true, 2, &second_body));
        input.extend_from_slice(&ts_packet(VIDEO_PID, false, true, 3, &third_body));

        let out = run(input).await.unwrap();
        assert_eq!(out.len(), 6 * TS_PACKET_SIZE);

        for pkt in out.chunks_exact(TS_PACKET_SIZE) {
            assert_eq!(pkt[0], TS_SYNC_BYTE);
            assert_eq!(pkt[3] & 0xc0, 0, "scrambling control must be cleared");
        }

        let first_out = &out[3 * TS_PACKET_SIZE..4 * TS_PACKET_SIZE];
        // PES header stays in the clear, body decrypts to the plaintext.
        assert_eq!(&first_out[4..4 + clear_len], &first_payload[..clear_len]);
        assert!(first_out[4 + clear_len..].iter().all(|&b| b == 0x11));

        let second_out = &out[4 * TS_PACKET_SIZE..5 * TS_PACKET_SIZE];
        assert!(second_out[4..].iter().all(|&b| b == 0x22));
        let third_out = &out[5 * TS_PACKET_SIZE..6 * TS_PACKET_SIZE];
        assert!(third_out[4..].iter().all(|&b| b == 0x33));
    }

    #[tokio::test]
    async fn scrambled_payload_without_key_is_fatal() {
        let mut input = pat_packet();
        input.extend_from_slice(&pmt_packet());
        let mut payload = vec![0, 0, 1, 0xe0, 0, 0, 0x80, 0x00, 0x00];
        payload.extend_from_slice(&[0x44; 32]);
        input.extend_from_slice(&ts_packet(VIDEO_PID, true, true, 1, &payload));

        assert!(matches!(
            run(input).await,
            Err(TivoError::NoKeyForStream(pid)) if pid == VIDEO_PID
        ));
    }

    #[tokio::test]
    async fn scrambled_payload_without_pmt_is_fatal() {
        let input = ts_packet(VIDEO_PID, true, true, 0, &[0, 0, 1, 0xe0, 0, 0]);
        assert!(matches!(
            run(input).await,
            Err(TivoError::NoKeyForStream(pid)) if pid == VIDEO_PID
        ));
    }

    #[tokio::test]
    async fn resync_recovers_after_garbage() {
        let mut input = vec![0xde, 0xad, 0xbe, 0xef];
        input.extend_from_slice(&pat_packet());
        input.extend_from_slice(&pat_packet());

        let out = run(input).await.unwrap();
        // The garbage is discarded; both PAT packets survive aligned.
        assert_eq!(out.len(), 2 * TS_PACKET_SIZE);
        assert_eq!(out[0], TS_SYNC_BYTE);
        assert_eq!(out[TS_PACKET_SIZE], TS_SYNC_BYTE);
    }

    #[tokio::test]
    async fn pmt_section_spanning_two_packets() {
        // Build a PMT section longer than one packet payload by padding the
        // program info loop with descriptors.
        let program_info: Vec<u8> = {
            let mut d = Vec::new();
            while d.len() < 200 {
                d.extend_from_slice(&[0xc0, 0x06, 1, 2, 3, 4, 5, 6]);
            }
            d
        };
        let es_loop = [
            0x02,
            0xe0 | (VIDEO_PID >> 8) as u8,
            VIDEO_PID as u8,
            0xf0,
            0x00,
        ];
        let section_length = 9 + program_info.len() + es_loop.len() + 4;
        let mut section = vec![
            TABLE_ID_PMT,
            0xb0 | ((section_length >> 8) as u8 & 0x0f),
            section_length as u8,
            0x00,
            0x01,
            0xc1,
            0x00,
            0x00,
            0xe0 | (VIDEO_PID >> 8) as u8,
            VIDEO_PID as u8,
            0xf0 | ((program_info.len() >> 8) as u8 & 0x0f),
            program_info.len() as u8,
        ];
        section.extend_from_slice(&program_info);
        section.extend_from_slice(&es_loop);
        section.extend_from_slice(&[0, 0, 0, 0]);

        let mut payload = vec![0u8];
        payload.extend_from_slice(&section);
        let first_chunk = 184.min(payload.len());

        let mut input = pat_packet();
        input.extend_from_slice(&ts_packet(PMT_PID, true, false, 0, &payload[..first_chunk]));
        input.extend_from_slice(&ts_packet(PMT_PID, false, false, 1, &payload[first_chunk..]));
        // A clear video packet proves the stream was registered.
        input.extend_from_slice(&ts_packet(VIDEO_PID, true, false, 0, &[0, 0, 1, 0xe0]));

        let out = run(input.clone()).await.unwrap();
        assert_eq!(out, input);
    }
}
