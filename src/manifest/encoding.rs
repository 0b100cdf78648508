//! Encoding table
//!
//! Maps *content keys* (logical file identity) to *encoded keys* (on-disk
//! identity) and records the decoded size. Big-endian throughout.
//!
//! # Header
//!
//! | Type    | Name               |
//! | ------: | ------------------ |
//! | [u8; 2] | magic b"EN"        |
//! | u8      | version            |
//! | u8      | ckey size (16)     |
//! | u8      | ekey size (16)     |
//! | u16     | ckey page size KiB |
//! | u16     | ekey page size KiB |
//! | u32     | ckey page count    |
//! | u32     | ekey page count    |
//! | u8      | unused             |
//! | u32     | espec block size   |
//!
//! The espec block follows and is skipped. Then one page-index record
//! `(first ckey, page md5)` per ckey page, then the pages themselves. Pages
//! are fixed-size; entries are `key_count u8 | file_size u40 | ckey |
//! ekey × key_count` and a zero key count starts the page's padding. Each
//! page must digest to its page-index md5. The ekey-spec pages after the
//! ckey pages carry nothing this client consumes and are not read.

use std::collections::HashMap;
use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};

use crate::error::KegError;
use crate::key::Key;

const MAGIC: &[u8; 2] = b"EN";

/// Parsed encoding table, looked up by content key.
#[derive(Debug, Clone)]
pub struct EncodingFile {
    entries: HashMap<Key, (Vec<Key>, u64)>,
}

impl EncodingFile {
    pub fn parse(data: &[u8]) -> Result<EncodingFile, KegError> {
        let mut reader = Cursor::new(data);

        let mut magic = [0u8; 2];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(KegError::Malformed {
                what: "encoding header",
                detail: format!("bad magic {:02x?}", magic),
            });
        }

        let _version = reader.read_u8()?;
        let ckey_size = reader.read_u8()?;
        let ekey_size = reader.read_u8()?;
        if ckey_size != 16 || ekey_size != 16 {
            return Err(KegError::Malformed {
                what: "encoding header",
                detail: format!("key sizes {}/{}, expected 16/16", ckey_size, ekey_size),
            });
        }

        let ckey_page_size = reader.read_u16::<BigEndian>()? as usize * 1024;
        let _ekey_page_size = reader.read_u16::<BigEndian>()?;
        let ckey_page_count = reader.read_u32::<BigEndian>()? as usize;
        let _ekey_page_count = reader.read_u32::<BigEndian>()?;
        let _unused = reader.read_u8()?;
        let espec_block_size = reader.read_u32::<BigEndian>()? as usize;

        // The espec strings only matter to an encoder.
        let mut espec = vec![0u8; espec_block_size];
        reader.read_exact(&mut espec)?;

        let mut page_digests = Vec::with_capacity(ckey_page_count);
        for _ in 0..ckey_page_count {
            let mut first_ckey = [0u8; 16];
            reader.read_exact(&mut first_ckey)?;
            let mut digest = [0u8; 16];
            reader.read_exact(&mut digest)?;
            page_digests.push(Key::from_bytes(digest));
        }

        let mut entries = HashMap::new();
        for (number, expected) in page_digests.iter().enumerate() {
            let mut page = vec![0u8; ckey_page_size];
            reader.read_exact(&mut page)?;

            let actual = Key::of_slice(&page);
            if actual != *expected {
                return Err(KegError::Integrity {
                    object: format!("encoding page {}", number),
                    expected: expected.to_hex(),
                    actual: actual.to_hex(),
                });
            }
            parse_page(&page, number, &mut entries)?;
        }

        Ok(EncodingFile { entries })
    }

    /// Resolve a content key to its first encoded key and the decoded size.
    pub fn find(&self, content_key: &Key) -> Option<(Key, u64)> {
        self.entries
            .get(content_key)
            .and_then(|(ekeys, size)| ekeys.first().map(|ekey| (*ekey, *size)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_page(
    page: &[u8],
    number: usize,
    entries: &mut HashMap<Key, (Vec<Key>, u64)>,
) -> Result<(), KegError> {
    let mut reader = Cursor::new(page);

    loop {
        let key_count = match reader.read_u8() {
            Ok(0) | Err(_) => break,
            Ok(count) => count as usize,
        };

        // u40 big-endian file size
        let high = reader.read_u8()? as u64;
        let low = reader.read_u32::<BigEndian>()? as u64;
        let size = (high << 32) | low;

        let mut ckey = [0u8; 16];
        reader.read_exact(&mut ckey).map_err(|_| KegError::Malformed {
            what: "encoding page",
            detail: format!("page {}: truncated entry", number),
        })?;

        let mut ekeys = Vec::with_capacity(key_count);
        for _ in 0..key_count {
            let mut ekey = [0u8; 16];
            reader.read_exact(&mut ekey).map_err(|_| KegError::Malformed {
                what: "encoding page",
                detail: format!("page {}: truncated entry", number),
            })?;
            ekeys.push(Key::from_bytes(ekey));
        }

        entries.insert(Key::from_bytes(ckey), (ekeys, size));
    }
    Ok(())
}

/// Test-side table builder; the client never produces encoding files.
#[cfg(test)]
pub mod build {
    use crate::key::Key;

    use super::MAGIC;

    /// Serialize `(content key, encoded keys, size)` rows into a one-or-more
    /// page table with a valid page index.
    pub fn table(rows: &[(Key, Vec<Key>, u64)], page_size_kb: u16) -> Vec<u8> {
        let page_size = page_size_kb as usize * 1024;

        let mut sorted: Vec<_> = rows.to_vec();
        sorted.sort_by_key(|(ckey, _, _)| *ckey);

        // Pack rows into zero-padded pages.
        let mut pages: Vec<Vec<u8>> = Vec::new();
        let mut firsts: Vec<Key> = Vec::new();
        let mut page = Vec::new();
        for (ckey, ekeys, size) in &sorted {
            let mut raw = Vec::new();
            raw.push(ekeys.len() as u8);
            raw.push((size >> 32) as u8);
            raw.extend_from_slice(&(*size as u32).to_be_bytes());
            raw.extend_from_slice(ckey.as_bytes());
            for ekey in ekeys {
                raw.extend_from_slice(ekey.as_bytes());
            }
            assert!(raw.len() < page_size, "row larger than a page");

            if page.len() + raw.len() > page_size {
                page.resize(page_size, 0);
                pages.push(std::mem::take(&mut page));
            }
            if page.is_empty() {
                firsts.push(*ckey);
            }
            page.extend_from_slice(&raw);
        }
        if !page.is_empty() || pages.is_empty() {
            page.resize(page_size, 0);
            pages.push(page);
            if firsts.len() < pages.len() {
                firsts.push(Key::from_bytes([0; 16]));
            }
        }

        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.push(1); // version
        out.push(16);
        out.push(16);
        out.extend_from_slice(&page_size_kb.to_be_bytes());
        out.extend_from_slice(&page_size_kb.to_be_bytes());
        out.extend_from_slice(&(pages.len() as u32).to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes()); // no ekey pages
        out.push(0);
        out.extend_from_slice(&0u32.to_be_bytes()); // no espec block

        for (first, page) in firsts.iter().zip(&pages) {
            out.extend_from_slice(first.as_bytes());
            out.extend_from_slice(Key::of_slice(page).as_bytes());
        }
        for page in &pages {
            out.extend_from_slice(page);
        }
        out
    }
}

#[cfg(test)]
mod test_encoding {
    use super::*;

    fn key(fill: u8) -> Key {
        Key::from_bytes([fill; 16])
    }

    #[test]
    fn lookup_by_content_key() {
        let rows = vec![
            (key(1), vec![key(0x11)], 1000u64),
            (key(2), vec![key(0x21), key(0x22)], 2000),
        ];
        let data = build::table(&rows, 1);

        let encoding = EncodingFile::parse(&data).unwrap();

        assert_eq!(encoding.len(), 2);
        assert_eq!(encoding.find(&key(1)), Some((key(0x11), 1000)));
        // Multiple encoded keys: first one is the answer.
        assert_eq!(encoding.find(&key(2)), Some((key(0x21), 2000)));
        assert_eq!(encoding.find(&key(9)), None);
    }

    #[test]
    fn large_sizes_use_all_forty_bits() {
        let size = (7u64 << 32) | 123;
        let data = build::table(&[(key(1), vec![key(2)], size)], 1);

        let encoding = EncodingFile::parse(&data).unwrap();
        assert_eq!(encoding.find(&key(1)), Some((key(2), size)));
    }

    #[test]
    fn rows_spill_across_pages() {
        // 1 KiB pages hold 26 single-ekey rows; 60 rows need three pages.
        let rows: Vec<_> = (1..=60)
            .map(|i| (key(i), vec![key(100 + i)], i as u64))
            .collect();
        let data = build::table(&rows, 1);

        let encoding = EncodingFile::parse(&data).unwrap();
        assert_eq!(encoding.len(), 60);
        for i in 1..=60u8 {
            assert_eq!(encoding.find(&key(i)), Some((key(100 + i), i as u64)));
        }
    }

    #[test]
    fn corrupted_page_fails_integrity() {
        let data = {
            let mut d = build::table(&[(key(1), vec![key(2)], 10)], 1);
            let len = d.len();
            d[len - 10] ^= 0xff; // inside the single page
            d
        };

        let err = EncodingFile::parse(&data).unwrap_err();
        assert!(matches!(err, KegError::Integrity { .. }));
    }

    #[test]
    fn bad_magic_is_malformed() {
        let err = EncodingFile::parse(b"XXjunk").unwrap_err();
        assert!(matches!(err, KegError::Malformed { .. }));
    }
}
