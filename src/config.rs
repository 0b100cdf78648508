//! NGDP text config files
//!
//! Config objects are UTF-8 text: a `#`-prefixed comment head line, blank
//! lines, and `key = token token ...` assignments. Three kinds matter to the
//! planner:
//!
//! - `build-config` names a build's manifests (`encoding`, `root`,
//!   `install`, `download`, optional `patch` / `patch-config`).
//! - `cdn-config` names the archive set (`archives`, `archive-group`,
//!   `patch-archives`, `patch-archive-group`).
//! - `patch-config` carries encoded `patch-entry` records.

use crate::error::KegError;
use crate::key::Key;

/// Generic `key = value` view over a config blob.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pairs: Vec<(String, Vec<String>)>,
}

impl ConfigFile {
    pub fn parse(text: &str) -> Result<ConfigFile, KegError> {
        let mut pairs = Vec::new();

        for (offset, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) = line.split_once('=').ok_or(KegError::Malformed {
                what: "config",
                detail: format!("line {}: no `=` in {:?}", offset + 1, line),
            })?;
            pairs.push((
                key.trim().to_string(),
                value.split_whitespace().map(str::to_string).collect(),
            ));
        }

        Ok(ConfigFile { pairs })
    }

    /// All values recorded under `key`, in file order. `patch-entry` repeats;
    /// everything else appears at most once.
    pub fn all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a [String]> + 'a {
        self.pairs
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    pub fn get<'a>(&'a self, key: &'a str) -> Option<&'a [String]> {
        self.all(key).next()
    }

    fn require(&self, key: &'static str) -> Result<&[String], KegError> {
        self.get(key).ok_or(KegError::Malformed {
            what: "config",
            detail: format!("missing required field {:?}", key),
        })
    }

    fn require_key(&self, key: &'static str, token: usize) -> Result<Key, KegError> {
        let tokens = self.require(key)?;
        let hex = tokens.get(token).ok_or(KegError::Malformed {
            what: "config",
            detail: format!("field {:?} has no token {}", key, token),
        })?;
        Key::from_hex(hex)
    }

    fn optional_key(&self, key: &str) -> Result<Option<Key>, KegError> {
        match self.get(key).and_then(|tokens| tokens.first()) {
            Some(hex) => Ok(Some(Key::from_hex(hex)?)),
            None => Ok(None),
        }
    }

    fn key_list(&self, key: &str) -> Result<Vec<Key>, KegError> {
        self.get(key)
            .unwrap_or(&[])
            .iter()
            .map(|hex| Key::from_hex(hex))
            .collect()
    }
}

/// Typed view over a `build-config` blob.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Content key of the decoded encoding file.
    pub encoding: Key,
    /// Encoded key of the encoding file as stored on the CDN.
    pub encoding_encoded: Key,
    pub root: Key,
    pub install: Key,
    pub download: Key,
    pub patch: Option<Key>,
    pub patch_config: Option<Key>,
}

impl BuildConfig {
    pub fn parse(text: &str) -> Result<BuildConfig, KegError> {
        let config = ConfigFile::parse(text)?;

        Ok(BuildConfig {
            encoding: config.require_key("encoding", 0)?,
            encoding_encoded: config.require_key("encoding", 1)?,
            root: config.require_key("root", 0)?,
            install: config.require_key("install", 0)?,
            download: config.require_key("download", 0)?,
            patch: config.optional_key("patch")?,
            patch_config: config.optional_key("patch-config")?,
        })
    }
}

/// Typed view over a `cdn-config` blob.
#[derive(Debug, Clone)]
pub struct CdnConfig {
    /// Archive keys in load order. Order is what decides first-wins when the
    /// archive group is synthesized.
    pub archives: Vec<Key>,
    pub archive_group: Option<Key>,
    pub patch_archives: Vec<Key>,
    pub patch_archive_group: Option<Key>,
}

impl CdnConfig {
    pub fn parse(text: &str) -> Result<CdnConfig, KegError> {
        let config = ConfigFile::parse(text)?;

        Ok(CdnConfig {
            archives: config.key_list("archives")?,
            archive_group: config.optional_key("archive-group")?,
            patch_archives: config.key_list("patch-archives")?,
            patch_archive_group: config.optional_key("patch-archive-group")?,
        })
    }
}

/// One old-build/patch pairing inside a patch entry.
#[derive(Debug, Clone)]
pub struct PatchPair {
    pub old_key: Key,
    pub old_size: u64,
    pub patch_key: Key,
    pub patch_size: u64,
}

/// One `patch-entry` record from a `patch-config` blob.
#[derive(Debug, Clone)]
pub struct PatchEntry {
    pub tag: String,
    pub content_key: Key,
    pub encoded_key: Key,
    pub decoded_size: u64,
    pub encoded_size: u64,
    pub espec: String,
    pub pairs: Vec<PatchPair>,
}

/// Typed view over a `patch-config` blob.
#[derive(Debug, Clone)]
pub struct PatchConfig {
    pub patch: Option<Key>,
    pub entries: Vec<PatchEntry>,
}

impl PatchConfig {
    pub fn parse(text: &str) -> Result<PatchConfig, KegError> {
        let config = ConfigFile::parse(text)?;

        let mut entries = Vec::new();
        for tokens in config.all("patch-entry") {
            entries.push(parse_patch_entry(tokens)?);
        }

        Ok(PatchConfig {
            patch: config.optional_key("patch")?,
            entries,
        })
    }
}

fn parse_patch_entry(tokens: &[String]) -> Result<PatchEntry, KegError> {
    if tokens.len() < 6 || (tokens.len() - 6) % 4 != 0 {
        return Err(KegError::Malformed {
            what: "patch-entry",
            detail: format!("{} tokens, expected 6 + 4n", tokens.len()),
        });
    }

    let parse_size = |token: &String| {
        token.parse::<u64>().map_err(|_| KegError::Malformed {
            what: "patch-entry",
            detail: format!("bad size {:?}", token),
        })
    };

    let mut pairs = Vec::new();
    for group in tokens[6..].chunks(4) {
        pairs.push(PatchPair {
            old_key: Key::from_hex(&group[0])?,
            old_size: parse_size(&group[1])?,
            patch_key: Key::from_hex(&group[2])?,
            patch_size: parse_size(&group[3])?,
        });
    }

    Ok(PatchEntry {
        tag: tokens[0].clone(),
        content_key: Key::from_hex(&tokens[1])?,
        encoded_key: Key::from_hex(&tokens[2])?,
        decoded_size: parse_size(&tokens[3])?,
        encoded_size: parse_size(&tokens[4])?,
        espec: tokens[5].clone(),
        pairs,
    })
}
