//! Runtime configuration threaded through the pipeline.

use std::collections::HashSet;

/// Decoder switches, passed by value into each component instead of living
/// in process-wide state.
#[derive(Debug, Clone, Default)]
pub struct DecoderConfig {
    /// Diagnostic verbosity, 0..=3; mapped onto the log level by the caller.
    pub verbose: u8,
    /// Transport packet numbers to dump in full while decoding.
    pub pkt_dump: HashSet<u32>,
    /// Skip the trial decryption check of the media access key.
    pub no_verify: bool,
    /// Write each metadata chunk out as an XML file.
    pub dump_metadata: bool,
    /// Stop after the metadata chunks; do not decode the MPEG payload.
    pub no_video: bool,
}

impl DecoderConfig {
    /// Whether packet number `n` was requested for a full dump.
    pub fn dump_packet(&self, n: u32) -> bool {
        self.pkt_dump.contains(&n)
    }
}
