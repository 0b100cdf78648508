//! BLTE chunked container format
//!
//! Every data object on the CDN is wrapped in a BLTE envelope: a framed,
//! chunked container with per-chunk compression and per-chunk MD5 checksums.
//!
//! # Top level
//!
//! | Type    | Name        | Description |
//! | ------: | ----------- | ----------- |
//! | [u8; 4] | magic       | b"BLTE" |
//! | u32 BE  | header_size | 0 for a single implicit frame |
//! | u32 BE  | flags+count | high byte flags, low 24 bits chunk count |
//! | [chunk info; N] | infos | present when header_size != 0 |
//! | [u8; N] | payloads    | chunk payloads, contiguous, in order |
//!
//! `header_size` counts everything before the first payload byte, so a
//! well-formed header satisfies `header_size == 12 + 24 * chunk_count`.
//!
//! # Chunk info (24 bytes)
//!
//! | Type     | Name              |
//! | -------: | ----------------- |
//! | u32 BE   | compressed_size   |
//! | u32 BE   | decompressed_size |
//! | [u8; 16] | md5 of the payload (encoding mode byte included) |
//!
//! # Payloads
//!
//! Each payload leads with one encoding-mode byte: `N` raw, `Z` zlib,
//! `F` nested BLTE frame, `E` encrypted. Encrypted chunks are detected and
//! reported, never decrypted. A chunk's checksum is verified before its mode
//! byte is even interpreted.
//!
//! When `header_size` is zero the single implicit chunk covers the entire
//! remainder of the stream and carries no declared sizes or checksum; the
//! envelope digest is the only integrity layer in that case.

use std::io::{self, Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt};
use flate2::read::ZlibDecoder;

use crate::error::KegError;
use crate::key::{DigestReader, Key};

pub const MAGIC: &[u8; 4] = b"BLTE";

const COPY_BUF: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Raw,
    Zlib,
    Nested,
    Encrypted,
}

impl Mode {
    fn from_byte(byte: u8, chunk: usize) -> Result<Mode, KegError> {
        match byte {
            b'N' => Ok(Mode::Raw),
            b'Z' => Ok(Mode::Zlib),
            b'F' => Ok(Mode::Nested),
            b'E' => Ok(Mode::Encrypted),
            other => Err(KegError::Malformed {
                what: "blte chunk",
                detail: format!("chunk {}: unknown encoding mode {:#04x}", chunk, other),
            }),
        }
    }
}

struct ChunkInfo {
    compressed: u32,
    decompressed: u32,
    digest: Key,
}

/// Decode a BLTE envelope from `reader`, writing the decoded content to
/// `writer`. Returns the number of decoded bytes.
///
/// The single-frame raw case streams through a fixed buffer; multi-chunk
/// envelopes stage one chunk at a time so the checksum can be verified
/// before anything is decoded.
pub fn decode<R: Read, W: Write>(reader: &mut R, writer: &mut W) -> Result<u64, KegError> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(KegError::Malformed {
            what: "blte header",
            detail: format!("bad magic {:02x?}", magic),
        });
    }

    let header_size = reader.read_u32::<BigEndian>()?;
    if header_size == 0 {
        return decode_single_frame(reader, writer);
    }

    let flags_count = reader.read_u32::<BigEndian>()?;
    let chunk_count = (flags_count & 0x00ff_ffff) as usize;
    if chunk_count == 0 {
        return Err(KegError::Malformed {
            what: "blte header",
            detail: "chunk count is zero".to_string(),
        });
    }
    if header_size as usize != 12 + 24 * chunk_count {
        return Err(KegError::Malformed {
            what: "blte header",
            detail: format!(
                "header size {} does not fit {} chunks",
                header_size, chunk_count
            ),
        });
    }

    let mut infos = Vec::with_capacity(chunk_count);
    for _ in 0..chunk_count {
        let compressed = reader.read_u32::<BigEndian>()?;
        let decompressed = reader.read_u32::<BigEndian>()?;
        let mut digest = [0u8; 16];
        reader.read_exact(&mut digest)?;
        infos.push(ChunkInfo {
            compressed,
            decompressed,
            digest: Key::from_bytes(digest),
        });
    }

    let mut written = 0u64;
    for (chunk, info) in infos.iter().enumerate() {
        written += decode_chunk(reader, writer, chunk, info)?;
    }
    Ok(written)
}

/// Decode and additionally verify the envelope digest against `expected`.
///
/// This is the loose-object path: the object's name on disk is the MD5 of
/// its BLTE envelope, and the chunk checksums form the second, independent
/// integrity layer. Archive-extracted slices are already validated against
/// the index entry key, so they go through plain [`decode`] instead.
pub fn decode_verified<R: Read, W: Write>(
    reader: R,
    writer: &mut W,
    expected: &Key,
) -> Result<u64, KegError> {
    let mut digesting = DigestReader::new(reader);
    let written = decode(&mut digesting, writer)?;

    // The digest covers the whole object, trailing bytes included, so an
    // envelope with junk appended still fails.
    io::copy(&mut digesting, &mut io::sink())?;

    let actual = digesting.finalize();
    if actual != *expected {
        return Err(KegError::Integrity {
            object: format!("blte envelope {}", expected),
            expected: expected.to_hex(),
            actual: actual.to_hex(),
        });
    }
    Ok(written)
}

fn decode_single_frame<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
) -> Result<u64, KegError> {
    let mode = Mode::from_byte(reader.read_u8()?, 0)?;

    match mode {
        Mode::Raw => {
            let mut buf = [0u8; COPY_BUF];
            let mut written = 0u64;
            loop {
                let len = reader.read(&mut buf)?;
                if len == 0 {
                    return Ok(written);
                }
                writer.write_all(&buf[..len])?;
                written += len as u64;
            }
        }
        Mode::Zlib => {
            let mut inflater = ZlibDecoder::new(reader);
            Ok(io::copy(&mut inflater, writer)?)
        }
        Mode::Nested => decode(reader, writer),
        Mode::Encrypted => Err(KegError::EncryptedChunk { chunk: 0 }),
    }
}

fn decode_chunk<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    chunk: usize,
    info: &ChunkInfo,
) -> Result<u64, KegError> {
    let mut payload = vec![0u8; info.compressed as usize];
    reader.read_exact(&mut payload)?;

    // Checksum first, before the mode byte is even looked at.
    let actual = Key::of_slice(&payload);
    if actual != info.digest {
        return Err(KegError::Integrity {
            object: format!("blte chunk {}", chunk),
            expected: info.digest.to_hex(),
            actual: actual.to_hex(),
        });
    }

    if payload.is_empty() {
        return Err(KegError::Malformed {
            what: "blte chunk",
            detail: format!("chunk {}: empty payload", chunk),
        });
    }

    match Mode::from_byte(payload[0], chunk)? {
        Mode::Raw => {
            let content = &payload[1..];
            if content.len() as u32 != info.decompressed {
                return Err(KegError::Malformed {
                    what: "blte chunk",
                    detail: format!(
                        "chunk {}: raw content is {} bytes, declared {}",
                        chunk,
                        content.len(),
                        info.decompressed
                    ),
                });
            }
            writer.write_all(content)?;
            Ok(content.len() as u64)
        }
        Mode::Zlib => {
            let mut inflater = ZlibDecoder::new(&payload[1..]);
            let written = io::copy(&mut inflater, writer)?;
            if written as u32 != info.decompressed {
                return Err(KegError::Malformed {
                    what: "blte chunk",
                    detail: format!(
                        "chunk {}: inflated to {} bytes, declared {}",
                        chunk, written, info.decompressed
                    ),
                });
            }
            Ok(written)
        }
        Mode::Nested => decode(&mut Cursor::new(&payload[1..]), writer),
        Mode::Encrypted => Err(KegError::EncryptedChunk { chunk }),
    }
}

/// Test-side envelope builders. The client never writes BLTE back to the
/// CDN, so these exist only to manufacture fixtures for the decoder.
#[cfg(test)]
pub mod build {
    use std::io::Write;

    use flate2::write::ZlibEncoder;
    use flate2::Compression;

    use crate::key::Key;

    use super::MAGIC;

    /// Zero-header envelope: one implicit raw frame.
    pub fn raw(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() + 9);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&0u32.to_be_bytes());
        out.push(b'N');
        out.extend_from_slice(data);
        out
    }

    /// Chunked envelope over `data` split at `chunk_size`, `Z` frames when
    /// `compress` is set, `N` otherwise.
    pub fn chunked(data: &[u8], chunk_size: usize, compress: bool) -> Vec<u8> {
        let pieces: Vec<&[u8]> = data.chunks(chunk_size.max(1)).collect();

        let mut payloads = Vec::with_capacity(pieces.len());
        for piece in &pieces {
            let mut payload = Vec::new();
            if compress {
                payload.push(b'Z');
                let mut deflater = ZlibEncoder::new(&mut payload, Compression::default());
                deflater.write_all(piece).unwrap();
                deflater.finish().unwrap();
            } else {
                payload.push(b'N');
                payload.extend_from_slice(piece);
            }
            payloads.push(payload);
        }

        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&(12 + 24 * payloads.len() as u32).to_be_bytes());
        out.extend_from_slice(&(0x0f00_0000u32 | payloads.len() as u32).to_be_bytes());
        for (piece, payload) in pieces.iter().zip(&payloads) {
            out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            out.extend_from_slice(&(piece.len() as u32).to_be_bytes());
            out.extend_from_slice(Key::of_slice(payload).as_bytes());
        }
        for payload in &payloads {
            out.extend_from_slice(payload);
        }
        out
    }
}
