//! Install manifest
//!
//! Lists the files a build materializes on disk, each tagged for platform
//! and locale selection. Big-endian throughout.
//!
//! | Type    | Name        |
//! | ------: | ----------- |
//! | [u8; 2] | magic b"IN" |
//! | u8      | version     |
//! | u8      | hash size (16) |
//! | u16     | tag count   |
//! | u32     | entry count |
//!
//! Tags follow: `name cstring | type u16 | mask`, where the mask holds one
//! bit per entry, MSB first, ceil(entries / 8) bytes. Then the entries:
//! `name cstring | content key 16B | size u32`.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};

use crate::error::KegError;
use crate::key::Key;

const MAGIC: &[u8; 2] = b"IN";

#[derive(Debug, Clone)]
pub struct Tag {
    pub name: String,
    pub typ: u16,
    mask: Vec<u8>,
}

impl Tag {
    fn selects(&self, entry: usize) -> bool {
        self.mask
            .get(entry / 8)
            .map(|byte| byte & (0x80 >> (entry % 8)) != 0)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallEntry {
    pub name: String,
    pub key: Key,
    pub size: u32,
}

/// Parsed install manifest.
#[derive(Debug, Clone)]
pub struct InstallFile {
    pub tags: Vec<Tag>,
    pub entries: Vec<InstallEntry>,
}

impl InstallFile {
    pub fn parse(data: &[u8]) -> Result<InstallFile, KegError> {
        let mut reader = Cursor::new(data);

        let mut magic = [0u8; 2];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(KegError::Malformed {
                what: "install header",
                detail: format!("bad magic {:02x?}", magic),
            });
        }

        let _version = reader.read_u8()?;
        let hash_size = reader.read_u8()?;
        if hash_size != 16 {
            return Err(KegError::Malformed {
                what: "install header",
                detail: format!("hash size {}, expected 16", hash_size),
            });
        }
        let tag_count = reader.read_u16::<BigEndian>()? as usize;
        let entry_count = reader.read_u32::<BigEndian>()? as usize;
        let mask_len = (entry_count + 7) / 8;

        let mut tags = Vec::with_capacity(tag_count);
        for _ in 0..tag_count {
            let name = read_cstring(&mut reader)?;
            let typ = reader.read_u16::<BigEndian>()?;
            let mut mask = vec![0u8; mask_len];
            reader.read_exact(&mut mask)?;
            tags.push(Tag { name, typ, mask });
        }

        let mut entries = Vec::with_capacity(entry_count);
        for _ in 0..entry_count {
            let name = read_cstring(&mut reader)?;
            let mut key = [0u8; 16];
            reader.read_exact(&mut key)?;
            let size = reader.read_u32::<BigEndian>()?;
            entries.push(InstallEntry {
                name,
                key: Key::from_bytes(key),
                size,
            });
        }

        Ok(InstallFile { tags, entries })
    }

    /// Entries whose bit is set in every requested tag's mask. No tags
    /// selects everything. Unknown tag names fail.
    pub fn select(&self, tag_names: &[String]) -> Result<Vec<&InstallEntry>, KegError> {
        let mut selected: Vec<&Tag> = Vec::with_capacity(tag_names.len());
        for name in tag_names {
            let tag = self
                .tags
                .iter()
                .find(|t| t.name.eq_ignore_ascii_case(name))
                .ok_or(KegError::NotFound {
                    kind: "install tag",
                    key: name.clone(),
                })?;
            selected.push(tag);
        }

        Ok(self
            .entries
            .iter()
            .enumerate()
            .filter(|(i, _)| selected.iter().all(|tag| tag.selects(*i)))
            .map(|(_, entry)| entry)
            .collect())
    }
}

fn read_cstring<R: Read>(reader: &mut R) -> Result<String, KegError> {
    let mut bytes = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte)?;
        if byte[0] == 0 {
            break;
        }
        bytes.push(byte[0]);
    }
    String::from_utf8(bytes).map_err(|e| KegError::Malformed {
        what: "install entry",
        detail: format!("name is not utf-8: {}", e),
    })
}
