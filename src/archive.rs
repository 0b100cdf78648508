//! Archive indices and archive groups
//!
//! Archives pack many small files into one large CDN object. A sidecar
//! `.index` file locates them:
//!
//! # Index body
//!
//! Entries of 24 bytes packed into fixed-size blocks. An entry never
//! straddles a block boundary; the slack at the end of a block is zero
//! padding and an all-zero entry marks the start of that padding.
//!
//! | Type     | Name   |
//! | -------: | ------ |
//! | [u8; 16] | entry key |
//! | u32 BE   | size   |
//! | u32 BE   | offset |
//!
//! # Tail (28 bytes, terminates the file)
//!
//! | Type     | Name          |
//! | -------: | ------------- |
//! | [u8; 16] | md5 of the body (everything before the tail) |
//! | u32 BE   | body length   |
//! | u8       | block size in KiB |
//! | u8       | entry size    |
//! | u8       | version       |
//! | u8       | reserved      |
//!
//! A group index is the same format with a u32 BE archive ordinal appended
//! per entry (entry size 28); the ordinal indexes the `cdn-config` archive
//! list. When no standalone group object exists the group is synthesized by
//! merging member indices in list order, first occurrence winning.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};

use byteorder::{BigEndian, ByteOrder};

use crate::error::KegError;
use crate::key::Key;

pub const TAIL_SIZE: usize = 28;
pub const ENTRY_SIZE: usize = 24;
pub const GROUP_ENTRY_SIZE: usize = 28;
pub const DEFAULT_BLOCK_KB: u8 = 4;

const INDEX_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: Key,
    pub size: u32,
    pub offset: u32,
}

/// A parsed archive index: the archive's key plus its located entries.
#[derive(Debug, Clone)]
pub struct ArchiveIndex {
    pub key: Key,
    pub entries: Vec<IndexEntry>,
}

/// Where an entry key lives inside an archive set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub archive: Key,
    pub size: u32,
    pub offset: u32,
}

/// Combined index over an ordered archive list.
#[derive(Debug, Clone)]
pub struct ArchiveGroup {
    pub key: Key,
    pub archives: Vec<Key>,
    entries: HashMap<Key, (u32, u32, u32)>,
}

struct Tail {
    digest: Key,
    body_len: u32,
    block_size_kb: u8,
    entry_size: u8,
}

fn parse_tail(data: &[u8]) -> Result<Tail, KegError> {
    if data.len() < TAIL_SIZE {
        return Err(KegError::Malformed {
            what: "archive index",
            detail: format!("{} bytes is shorter than the tail", data.len()),
        });
    }

    let tail = &data[data.len() - TAIL_SIZE..];
    let mut digest = [0u8; 16];
    digest.copy_from_slice(&tail[0..16]);

    let parsed = Tail {
        digest: Key::from_bytes(digest),
        body_len: BigEndian::read_u32(&tail[16..20]),
        block_size_kb: tail[20],
        entry_size: tail[21],
    };

    if parsed.body_len as usize != data.len() - TAIL_SIZE {
        return Err(KegError::Malformed {
            what: "archive index",
            detail: format!(
                "tail declares {} body bytes, file has {}",
                parsed.body_len,
                data.len() - TAIL_SIZE
            ),
        });
    }
    if parsed.block_size_kb == 0 {
        return Err(KegError::Malformed {
            what: "archive index",
            detail: "zero block size".to_string(),
        });
    }
    Ok(parsed)
}

/// Check an index file's self-verifying tail: `md5(body)` must equal the
/// tail digest. This is the write-time verification for index objects,
/// which are named by their archive's key rather than their own digest.
pub fn verify_index_tail(data: &[u8]) -> Result<(), KegError> {
    let tail = parse_tail(data)?;
    let actual = Key::of_slice(&data[..data.len() - TAIL_SIZE]);
    if actual != tail.digest {
        return Err(KegError::Integrity {
            object: "archive index body".to_string(),
            expected: tail.digest.to_hex(),
            actual: actual.to_hex(),
        });
    }
    Ok(())
}

// Walk block-packed fixed-size entries, skipping padding. An all-zero entry
// ends its block.
fn block_entries<'a>(
    body: &'a [u8],
    block_size: usize,
    entry_size: usize,
) -> Result<Vec<&'a [u8]>, KegError> {
    let mut entries = Vec::new();
    let mut pos = 0;
    let mut block_left = block_size;

    while pos < body.len() {
        if block_left < entry_size {
            pos += block_left.min(body.len() - pos);
            block_left = block_size;
            continue;
        }
        if pos + entry_size > body.len() {
            return Err(KegError::Malformed {
                what: "archive index",
                detail: format!("truncated entry at offset {}", pos),
            });
        }

        let raw = &body[pos..pos + entry_size];
        if raw.iter().all(|b| *b == 0) {
            // Padding runs to the end of the block.
            pos += block_left.min(body.len() - pos);
            block_left = block_size;
            continue;
        }

        entries.push(raw);
        pos += entry_size;
        block_left -= entry_size;
    }
    Ok(entries)
}

fn write_blocks(raw_entries: &[Vec<u8>], entry_size: usize, block_size_kb: u8) -> Vec<u8> {
    let block_size = block_size_kb as usize * 1024;
    let mut body = Vec::new();
    let mut block_left = block_size;

    for raw in raw_entries {
        if block_left < entry_size {
            body.extend(std::iter::repeat(0u8).take(block_left));
            block_left = block_size;
        }
        body.extend_from_slice(raw);
        block_left -= entry_size;
    }
    body
}

fn write_tail(body: &mut Vec<u8>, block_size_kb: u8, entry_size: u8) {
    let digest = Key::of_slice(body);
    let body_len = body.len() as u32;

    body.extend_from_slice(digest.as_bytes());
    body.extend_from_slice(&body_len.to_be_bytes());
    body.push(block_size_kb);
    body.push(entry_size);
    body.push(INDEX_VERSION);
    body.push(0);
}

impl ArchiveIndex {
    pub fn parse(key: Key, data: &[u8]) -> Result<ArchiveIndex, KegError> {
        verify_index_tail(data)?;
        let tail = parse_tail(data)?;
        if tail.entry_size as usize != ENTRY_SIZE {
            return Err(KegError::Malformed {
                what: "archive index",
                detail: format!("entry size {} is not {}", tail.entry_size, ENTRY_SIZE),
            });
        }

        let body = &data[..data.len() - TAIL_SIZE];
        let block_size = tail.block_size_kb as usize * 1024;

        let mut entries = Vec::new();
        for raw in block_entries(body, block_size, ENTRY_SIZE)? {
            let mut entry_key = [0u8; 16];
            entry_key.copy_from_slice(&raw[0..16]);
            entries.push(IndexEntry {
                key: Key::from_bytes(entry_key),
                size: BigEndian::read_u32(&raw[16..20]),
                offset: BigEndian::read_u32(&raw[20..24]),
            });
        }

        Ok(ArchiveIndex { key, entries })
    }

    /// Serialize to the on-disk index form.
    pub fn write(entries: &[IndexEntry], block_size_kb: u8) -> Vec<u8> {
        let raw: Vec<Vec<u8>> = entries
            .iter()
            .map(|e| {
                let mut buf = Vec::with_capacity(ENTRY_SIZE);
                buf.extend_from_slice(e.key.as_bytes());
                buf.extend_from_slice(&e.size.to_be_bytes());
                buf.extend_from_slice(&e.offset.to_be_bytes());
                buf
            })
            .collect();

        let mut data = write_blocks(&raw, ENTRY_SIZE, block_size_kb);
        write_tail(&mut data, block_size_kb, ENTRY_SIZE as u8);
        data
    }
}

impl ArchiveGroup {
    /// Parse a standalone group-index object. `archives` is the ordered
    /// archive list from `cdn-config`, which the per-entry ordinals index.
    pub fn parse(key: Key, archives: &[Key], data: &[u8]) -> Result<ArchiveGroup, KegError> {
        verify_index_tail(data)?;
        let tail = parse_tail(data)?;
        if tail.entry_size as usize != GROUP_ENTRY_SIZE {
            return Err(KegError::Malformed {
                what: "group index",
                detail: format!("entry size {} is not {}", tail.entry_size, GROUP_ENTRY_SIZE),
            });
        }

        let body = &data[..data.len() - TAIL_SIZE];
        let block_size = tail.block_size_kb as usize * 1024;

        let mut entries = HashMap::new();
        for raw in block_entries(body, block_size, GROUP_ENTRY_SIZE)? {
            let mut entry_key = [0u8; 16];
            entry_key.copy_from_slice(&raw[0..16]);
            let size = BigEndian::read_u32(&raw[16..20]);
            let offset = BigEndian::read_u32(&raw[20..24]);
            let ordinal = BigEndian::read_u32(&raw[24..28]);

            if ordinal as usize >= archives.len() {
                return Err(KegError::Malformed {
                    what: "group index",
                    detail: format!(
                        "entry references archive {} of {}",
                        ordinal,
                        archives.len()
                    ),
                });
            }
            entries
                .entry(Key::from_bytes(entry_key))
                .or_insert((ordinal, size, offset));
        }

        Ok(ArchiveGroup {
            key,
            archives: archives.to_vec(),
            entries,
        })
    }

    /// Merge member indices into a group, in list order. The first archive
    /// to claim a key wins.
    pub fn synthesize(key: Key, indices: &[ArchiveIndex]) -> ArchiveGroup {
        let mut entries = HashMap::new();
        for (ordinal, index) in indices.iter().enumerate() {
            for entry in &index.entries {
                entries
                    .entry(entry.key)
                    .or_insert((ordinal as u32, entry.size, entry.offset));
            }
        }

        ArchiveGroup {
            key,
            archives: indices.iter().map(|i| i.key).collect(),
            entries,
        }
    }

    pub fn find(&self, key: &Key) -> Option<Location> {
        self.entries.get(key).map(|&(ordinal, size, offset)| Location {
            archive: self.archives[ordinal as usize],
            size,
            offset,
        })
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize to the standalone group-index form, entries ordered by key.
    pub fn write(&self, block_size_kb: u8) -> Vec<u8> {
        let mut sorted: Vec<(&Key, &(u32, u32, u32))> = self.entries.iter().collect();
        sorted.sort_by_key(|(key, _)| **key);

        let raw: Vec<Vec<u8>> = sorted
            .iter()
            .map(|(key, (ordinal, size, offset))| {
                let mut buf = Vec::with_capacity(GROUP_ENTRY_SIZE);
                buf.extend_from_slice(key.as_bytes());
                buf.extend_from_slice(&size.to_be_bytes());
                buf.extend_from_slice(&offset.to_be_bytes());
                buf.extend_from_slice(&ordinal.to_be_bytes());
                buf
            })
            .collect();

        let mut data = write_blocks(&raw, GROUP_ENTRY_SIZE, block_size_kb);
        write_tail(&mut data, block_size_kb, GROUP_ENTRY_SIZE as u8);
        data
    }
}

/// Extract one entry's byte range from an archive and prove it against the
/// entry key. BLTE decoding of the slice, when needed, is the caller's job.
pub fn read_entry<R: Read + Seek>(
    src: &mut R,
    key: &Key,
    size: u32,
    offset: u32,
) -> Result<Vec<u8>, KegError> {
    src.seek(SeekFrom::Start(offset as u64))?;
    let mut data = vec![0u8; size as usize];
    src.read_exact(&mut data)?;

    let actual = Key::of_slice(&data);
    if actual != *key {
        return Err(KegError::Integrity {
            object: format!("archive entry {}", key),
            expected: key.to_hex(),
            actual: actual.to_hex(),
        });
    }
    Ok(data)
}
