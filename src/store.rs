//! Content-addressed object store
//!
//! A partitioned directory tree under the store root:
//!
//! ```text
//! objects/config/aa/bb/<hex>          raw config blobs
//! objects/data/aa/bb/<hex>            archives and loose BLTE objects
//! objects/data/aa/bb/<hex>.index      archive index footers
//! objects/patch/aa/bb/<hex>           patch blobs
//! objects/patch/aa/bb/<hex>.index     patch index footers
//! responses/<kind>/aa/bb/<digest>     cached catalog responses
//! ```
//!
//! Objects are immutable once committed. Writes stream into a `.keg_temp`
//! sibling, fsync, verify, then rename; a failed write leaves the temp file
//! behind for the fsck sweep to collect. This is what makes one writer per
//! key safe next to any number of readers.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::archive;
use crate::error::KegError;
use crate::key::{DigestReader, Key};

pub const TEMP_SUFFIX: &str = ".keg_temp";

const COPY_BUF: usize = 64 * 1024;

/// The closed set of object kinds. A kind owns its directory, its filename
/// suffix and its verification policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Config,
    Data,
    Patch,
    Index,
    PatchIndex,
}

impl ObjectKind {
    fn dir(self) -> &'static str {
        match self {
            ObjectKind::Config => "config",
            ObjectKind::Data | ObjectKind::Index => "data",
            ObjectKind::Patch | ObjectKind::PatchIndex => "patch",
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            ObjectKind::Index | ObjectKind::PatchIndex => ".index",
            _ => "",
        }
    }

    fn is_index(self) -> bool {
        matches!(self, ObjectKind::Index | ObjectKind::PatchIndex)
    }

    pub fn label(self) -> &'static str {
        match self {
            ObjectKind::Config => "config",
            ObjectKind::Data => "data",
            ObjectKind::Patch => "patch",
            ObjectKind::Index => "index",
            ObjectKind::PatchIndex => "patch index",
        }
    }
}

/// Handle on an initialized store root.
pub struct Store {
    root: PathBuf,
}

/// Outcome of an fsck sweep.
#[derive(Debug, Default)]
pub struct FsckReport {
    pub scanned: usize,
    pub temp_removed: usize,
    pub repaired: usize,
    pub errors: Vec<(PathBuf, KegError)>,
}

impl FsckReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

impl Store {
    /// Create the layout under `root` and return a handle. Idempotent.
    pub fn init(root: &Path) -> Result<Store, KegError> {
        for dir in [
            "objects/config",
            "objects/data",
            "objects/patch",
            "responses/versions",
            "responses/cdns",
            "responses/bgdl",
            "responses/blobs",
            "responses/blob",
        ] {
            fs::create_dir_all(root.join(dir))?;
        }
        Ok(Store {
            root: root.to_path_buf(),
        })
    }

    /// Open an existing store; the `objects` directory marks initialization.
    pub fn open(root: &Path) -> Result<Store, KegError> {
        if !root.join("objects").is_dir() {
            return Err(KegError::NotFound {
                kind: "store",
                key: root.display().to_string(),
            });
        }
        Ok(Store {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join("keg.db")
    }

    pub fn object_path(&self, kind: ObjectKind, key: &Key) -> PathBuf {
        self.root
            .join("objects")
            .join(kind.dir())
            .join(format!("{}{}", key.partition(), kind.suffix()))
    }

    pub fn response_path(&self, kind: &str, digest: &Key) -> PathBuf {
        self.root.join("responses").join(kind).join(digest.partition())
    }

    pub fn has(&self, kind: ObjectKind, key: &Key) -> bool {
        self.object_path(kind, key).is_file()
    }

    pub fn has_config(&self, key: &Key) -> bool {
        self.has(ObjectKind::Config, key)
    }

    pub fn has_data(&self, key: &Key) -> bool {
        self.has(ObjectKind::Data, key)
    }

    pub fn has_index(&self, key: &Key) -> bool {
        self.has(ObjectKind::Index, key)
    }

    pub fn has_patch(&self, key: &Key) -> bool {
        self.has(ObjectKind::Patch, key)
    }

    pub fn has_patch_index(&self, key: &Key) -> bool {
        self.has(ObjectKind::PatchIndex, key)
    }

    pub fn open_object(&self, kind: ObjectKind, key: &Key) -> Result<fs::File, KegError> {
        fs::File::open(self.object_path(kind, key)).map_err(|_| KegError::NotFound {
            kind: kind.label(),
            key: key.to_hex(),
        })
    }

    pub fn read_object(&self, kind: ObjectKind, key: &Key) -> Result<Vec<u8>, KegError> {
        let mut data = Vec::new();
        self.open_object(kind, key)?.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Commit an object under `key`, verifying on the way in.
    ///
    /// Raw objects must digest to their key; for BLTE-framed data objects the
    /// envelope bytes are the object bytes, so the same streaming digest
    /// covers the envelope check. Index objects are named by their archive's
    /// key rather than their own digest, so their self-verifying tail is
    /// checked instead.
    pub fn write<R: Read>(
        &self,
        kind: ObjectKind,
        key: &Key,
        reader: &mut R,
    ) -> Result<u64, KegError> {
        let path = self.object_path(kind, key);

        if kind.is_index() {
            let mut data = Vec::new();
            reader.read_to_end(&mut data)?;
            archive::verify_index_tail(&data).map_err(|e| {
                warn!(key = %key, "index failed tail verification");
                e
            })?;
            self.write_atomic(&path, &data)?;
            return Ok(data.len() as u64);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp = temp_path(&path);

        let mut digesting = DigestReader::new(reader);
        let mut file = fs::File::create(&temp)?;
        let mut buf = [0u8; COPY_BUF];
        let mut written = 0u64;
        loop {
            let len = digesting.read(&mut buf)?;
            if len == 0 {
                break;
            }
            file.write_all(&buf[..len])?;
            written += len as u64;
        }
        file.sync_all()?;
        drop(file);

        let actual = digesting.finalize();
        if actual != *key {
            // Leave the temp file for the fsck sweep.
            warn!(expected = %key, actual = %actual, "object failed verification on write");
            return Err(KegError::Integrity {
                object: format!("{} {}", kind.label(), key),
                expected: key.to_hex(),
                actual: actual.to_hex(),
            });
        }

        fs::rename(&temp, &path)?;
        debug!(kind = kind.label(), key = %key, bytes = written, "object committed");
        Ok(written)
    }

    /// Cache a raw catalog response under its own digest. Returns the digest.
    pub fn write_response(&self, kind: &str, data: &[u8]) -> Result<Key, KegError> {
        let digest = Key::of_slice(data);
        let path = self.response_path(kind, &digest);
        if !path.is_file() {
            self.write_atomic(&path, data)?;
        }
        Ok(digest)
    }

    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), KegError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp = temp_path(path);

        let mut file = fs::File::create(&temp)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp, path)?;
        Ok(())
    }

    /// Integrity-repair sweep.
    ///
    /// Collects stray `.keg_temp` files, re-digests every committed object,
    /// checks index tails, and walks archive bodies entry by entry through
    /// their indices. With `repair` set, files failing their check are
    /// deleted; otherwise they are only reported.
    pub fn fsck(&self, repair: bool) -> Result<FsckReport, KegError> {
        let mut report = FsckReport::default();

        for kind_dir in ["config", "data", "patch"] {
            let dir = self.root.join("objects").join(kind_dir);
            for path in walk_partitions(&dir)? {
                let name = match path.file_name().and_then(|n| n.to_str()) {
                    Some(name) => name.to_string(),
                    None => continue,
                };

                if name.ends_with(TEMP_SUFFIX) {
                    fs::remove_file(&path)?;
                    report.temp_removed += 1;
                    continue;
                }

                report.scanned += 1;
                match self.check_object(kind_dir, &path, &name) {
                    Ok(()) => {}
                    Err(errors) => {
                        if repair {
                            fs::remove_file(&path)?;
                            report.repaired += 1;
                        }
                        for e in errors {
                            warn!(path = %path.display(), error = %e, "fsck failure");
                            report.errors.push((path.clone(), e));
                        }
                    }
                }
            }
        }

        debug!(
            scanned = report.scanned,
            temp_removed = report.temp_removed,
            failures = report.errors.len(),
            "fsck sweep complete"
        );
        Ok(report)
    }

    fn check_object(&self, kind_dir: &str, path: &Path, name: &str) -> Result<(), Vec<KegError>> {
        let as_malformed = |detail: String| {
            vec![KegError::Malformed {
                what: "object filename",
                detail,
            }]
        };

        if let Some(stem) = name.strip_suffix(".index") {
            // Index files prove themselves through their tail.
            Key::from_hex(stem).map_err(|_| as_malformed(name.to_string()))?;
            let data = fs::read(path).map_err(|e| vec![KegError::Io(e)])?;
            return archive::verify_index_tail(&data).map_err(|e| vec![e]);
        }

        let key = Key::from_hex(name).map_err(|_| as_malformed(name.to_string()))?;

        // A data object with a sibling index is an archive: its bytes are
        // proven range by range against the index entry keys.
        if kind_dir == "data" {
            let index_path = path.with_extension("index");
            if index_path.is_file() {
                return self.check_archive(path, &index_path, &key);
            }
        }

        let mut file = fs::File::open(path).map_err(|e| vec![KegError::Io(e)])?;
        let actual = Key::of_reader(&mut file).map_err(|e| vec![KegError::Io(e)])?;
        if actual != key {
            return Err(vec![KegError::Integrity {
                object: format!("object {}", key),
                expected: key.to_hex(),
                actual: actual.to_hex(),
            }]);
        }
        Ok(())
    }

    fn check_archive(
        &self,
        path: &Path,
        index_path: &Path,
        key: &Key,
    ) -> Result<(), Vec<KegError>> {
        let index_data = fs::read(index_path).map_err(|e| vec![KegError::Io(e)])?;
        let index = archive::ArchiveIndex::parse(*key, &index_data).map_err(|e| vec![e])?;

        let mut file = fs::File::open(path).map_err(|e| vec![KegError::Io(e)])?;
        let mut errors = Vec::new();
        for entry in &index.entries {
            if let Err(e) = archive::read_entry(&mut file, &entry.key, entry.size, entry.offset) {
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(TEMP_SUFFIX);
    path.with_file_name(name)
}

// The partition tree is exactly two directory levels deep.
fn walk_partitions(dir: &Path) -> Result<Vec<PathBuf>, KegError> {
    let mut files = Vec::new();
    if !dir.is_dir() {
        return Ok(files);
    }

    for first in fs::read_dir(dir)? {
        let first = first?.path();
        if !first.is_dir() {
            continue;
        }
        for second in fs::read_dir(&first)? {
            let second = second?.path();
            if !second.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&second)? {
                let entry = entry?.path();
                if entry.is_file() {
                    files.push(entry);
                }
            }
        }
    }
    files.sort();
    Ok(files)
}
