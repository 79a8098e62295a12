//! Metadata chunk decryption and program-name derivation.
//!
//! The encrypted XML chunks share one logical keystream: the plaintext gaps
//! between them (chunk headers and padding) are consumed with `skip`, so the
//! keystream position always mirrors the absolute file offset. The naming
//! heuristic walks the program XML with a small djb2-hash state machine
//! rather than a real XML parser, which is all the fixed tag set needs.

use crate::cipher::TuringStream;
use crate::error::{Result, TivoError};
use crate::format::container::TivoChunk;

// djb2 hashes of the lowercased tag names this heuristic cares about.
const HASH_TITLE: u32 = 0x0aeb_c065;
const HASH_SERIES_TITLE: u32 = 0x7b3f_cf9e;
const HASH_EPISODE_TITLE: u32 = 0x16f3_7724;
const HASH_EPISODE_NUMBER: u32 = 0xf147_6d67;
const HASH_SHOW_TYPE: u32 = 0x1eaa_c51e;
const HASH_MOVIE_YEAR: u32 = 0x3418_9552;

/// Decrypts one encrypted chunk in place. `stream_pos` is the metadata
/// keystream position carried between chunks; the gap up to this chunk's
/// payload offset is skipped before XORing.
pub fn decrypt_chunk(
    session: &mut TuringStream,
    chunk: &mut TivoChunk,
    stream_pos: &mut u64,
) -> Result<()> {
    let gap = chunk.start.checked_sub(*stream_pos).ok_or_else(|| {
        TivoError::MalformedHeader(format!(
            "chunk payload at {} behind metadata stream position {}",
            chunk.start, stream_pos
        ))
    })?;
    session.skip(gap)?;
    session.decrypt(&mut chunk.data)?;
    *stream_pos = chunk.start + chunk.data.len() as u64;
    Ok(())
}

/// Trial check of the decrypted metadata: TiVo metadata chunks are XML, so
/// anything that does not open with `<` means the MAK did not produce the
/// expected plaintext.
pub fn check_plaintext(data: &[u8]) -> Result<()> {
    if data.first() == Some(&b'<') {
        Ok(())
    } else {
        Err(TivoError::MakVerificationFailed)
    }
}

/// Derives an output base name from the program metadata chunk, or `None`
/// when the expected regions or tags are missing.
pub fn derive_name(data: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(data);
    let showing = region(&text, "<showing>", "</showing>")?;
    let program = region(showing, "<program>", "</program>")?;
    log::debug!("program metadata: '{}'", program);
    parse_program(program)
}

fn region<'a>(text: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = text.find(open)?;
    let rest = &text[start..];
    let end = rest.find(close)?;
    Some(&rest[..end])
}

#[derive(PartialEq)]
enum ScanState {
    Between,
    OpeningTag,
    ClosingTag,
    Value,
}

/// Walks the program XML, hashing tag names and capturing the values of the
/// known ones, then assembles the display name.
fn parse_program(data: &str) -> Option<String> {
    let mut state = ScanState::Between;
    let mut hash: u32 = 0;
    let mut value = String::new();
    let mut prev = '\0';

    let mut title: Option<String> = None;
    let mut series_title: Option<String> = None;
    let mut episode_title: Option<String> = None;
    let mut season_number: Option<i32> = None;
    let mut episode_number: Option<i32> = None;
    let mut movie_year: Option<i32> = None;
    let mut is_series = true;

    for c in data.chars() {
        match c {
            '<' => {
                hash = 5381;
                state = ScanState::OpeningTag;
            }
            '>' => match state {
                ScanState::OpeningTag => {
                    if prev != '/' {
                        value.clear();
                        state = ScanState::Value;
                    } else {
                        state = ScanState::Between;
                    }
                }
                ScanState::ClosingTag => {
                    state = ScanState::Between;
                    match hash {
                        HASH_SERIES_TITLE => series_title = Some(value.clone()),
                        HASH_EPISODE_TITLE => episode_title = Some(value.clone()),
                        HASH_EPISODE_NUMBER => {
                            if let Ok(n) = value.parse::<i32>() {
                                season_number = Some(n / 100);
                                episode_number = Some(n % 100);
                            }
                        }
                        HASH_SHOW_TYPE => is_series = value == "SERIES",
                        HASH_MOVIE_YEAR => movie_year = value.parse::<i32>().ok(),
                        HASH_TITLE => title = Some(value.clone()),
                        _ => {}
                    }
                }
                _ => {}
            },
            '/' => {
                if prev == '<' {
                    state = ScanState::ClosingTag;
                }
            }
            _ => {
                if state == ScanState::Value {
                    value.push(c);
                } else {
                    hash = (hash << 5).wrapping_add(hash) ^ (c.to_ascii_lowercase() as u32);
                }
            }
        }
        prev = c;
    }

    if is_series {
        let series = series_title?;
        let episode = episode_title?;
        match (season_number, episode_number) {
            (Some(s), Some(e)) => Some(format!("{} - S{:02}E{:02} - {}", series, s, e, episode)),
            _ => Some(format!("{} - {}", series, episode)),
        }
    } else {
        let title = title?;
        match movie_year {
            Some(year) => Some(format!("{} ({})", title, year)),
            None => Some(title),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrap(program: &str) -> String {
        format!(
            "<?xml version=\"1.0\"?><showing><program>{}</program></showing>",
            program
        )
    }

    #[test]
    fn series_name_with_episode_number() {
        let xml = wrap(
            "<seriesTitle>Nova</seriesTitle>\
             <episodeTitle>Deep Sea</episodeTitle>\
             <episodeNumber>312</episodeNumber>\
             <showType>SERIES</showType>",
        );
        assert_eq!(
            derive_name(xml.as_bytes()).unwrap(),
            "Nova - S03E12 - Deep Sea"
        );
    }

    #[test]
    fn series_name_without_episode_number() {
        let xml = wrap(
            "<seriesTitle>Nova</seriesTitle>\
             <episodeTitle>Deep Sea</episodeTitle>",
        );
        assert_eq!(derive_name(xml.as_bytes()).unwrap(), "Nova - Deep Sea");
    }

    #[test]
    fn movie_name_with_year() {
        let xml = wrap(
            "<title>Metropolis</title>\
             <showType>MOVIE</showType>\
             <movieYear>1927</movieYear>",
        );
        assert_eq!(derive_name(xml.as_bytes()).unwrap(), "Metropolis (1927)");
    }

    #[test]
    fn missing_program_region_yields_none() {
        assert!(derive_name(b"<showing>nothing here</showing>").is_none());
        assert!(derive_name(b"garbage").is_none());
    }

    #[test]
    fn tag_hashes_match_the_fixed_constants() {
        fn djb2(tag: &str) -> u32 {
            let mut h: u32 = 5381;
            for b in tag.bytes() {
                h = (h << 5).wrapping_add(h) ^ (b.to_ascii_lowercase() as u32);
            }
            h
        }
        assert_eq!(djb2("title"), HASH_TITLE);
        assert_eq!(djb2("seriesTitle"), HASH_SERIES_TITLE);
        assert_eq!(djb2("episodeTitle"), HASH_EPISODE_TITLE);
        assert_eq!(djb2("episodeNumber"), HASH_EPISODE_NUMBER);
        assert_eq!(djb2("showType"), HASH_SHOW_TYPE);
        assert_eq!(djb2("movieYear"), HASH_MOVIE_YEAR);
    }

    #[test]
    fn plaintext_check_accepts_xml_only() {
        assert!(check_plaintext(b"<?xml version=\"1.0\"?>").is_ok());
        assert!(matches!(
            check_plaintext(&[0x9f, 0x33, 0x01]),
            Err(TivoError::MakVerificationFailed)
        ));
    }

    #[test]
    fn chunk_keystream_carries_across_gaps() {
        // Encrypt two regions with one continuous session, leaving a
        // plaintext gap between them, then decrypt through the chunk path.
        const MAK: &str = "1234567890";
        let seed = b"<plaintext chunk>";
        let mut enc = TuringStream::with_metadata_key(MAK, seed).unwrap();

        let mut first = b"<first chunk data>".to_vec();
        let mut second = b"<second chunk data>".to_vec();
        enc.skip(40).unwrap();
        enc.decrypt(&mut first).unwrap();
        enc.skip(30).unwrap();
        enc.decrypt(&mut second).unwrap();

        let mut session = TuringStream::with_metadata_key(MAK, seed).unwrap();
        let mut pos = 0u64;
        let mut chunk_a = TivoChunk {
            start: 40,
            id: 2,
            chunk_type: crate::format::container::ChunkType::EncryptedXml,
            data: first,
        };
        let second_start = 40 + chunk_a.data.len() as u64 + 30;
        let mut chunk_b = TivoChunk {
            start: second_start,
            id: 3,
            chunk_type: crate::format::container::ChunkType::EncryptedXml,
            data: second,
        };

        decrypt_chunk(&mut session, &mut chunk_a, &mut pos).unwrap();
        decrypt_chunk(&mut session, &mut chunk_b, &mut pos).unwrap();
        assert_eq!(chunk_a.data, b"<first chunk data>");
        assert_eq!(chunk_b.data, b"<second chunk data>");
    }
}
