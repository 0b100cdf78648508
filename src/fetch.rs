//! Fetch planner and install
//!
//! The planner walks the metadata graph rooted at a `versions` row:
//! versions, then CDN config and build config, then encoding, install and
//! patch manifests, then archive indices and finally the data itself. Every
//! key is fetched at most once per plan, phases run in the order
//! config, indices, (bodies | loose | patches), and each arriving byte
//! stream is verified before it is committed.
//!
//! A per-object network failure is warned about and skipped; the plan
//! continues. An integrity failure aborts the plan, corruption upstream is
//! never tolerated. Missing optional catalogs (`bgdl`, `blobs`) are
//! skipped; missing required ones (`versions`, `cdns`) fail the command.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::Cursor;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::archive::{self, ArchiveGroup, ArchiveIndex};
use crate::blte;
use crate::cdn::{Remote, SelectedCdn};
use crate::config::{BuildConfig, CdnConfig, PatchConfig};
use crate::error::KegError;
use crate::key::Key;
use crate::manifest::encoding::EncodingFile;
use crate::manifest::install::InstallFile;
use crate::psv;
use crate::sql::{ResponseDb, Source};
use crate::store::{ObjectKind, Store};

/// Caller-facing knobs for a fetch run. CDN choice is settled separately
/// through [`crate::cdn::select_cdn`] before the plan starts.
#[derive(Debug, Default, Clone)]
pub struct FetchOptions {
    /// Stop after configs and indices; fetch no bodies.
    pub metadata_only: bool,
}

/// The catalog set a remote exposes.
#[derive(Debug)]
pub struct Catalogs {
    pub versions: psv::Document,
    pub cdns: psv::Document,
    pub bgdl: Option<psv::Document>,
    pub blobs: Option<psv::Document>,
}

/// One typed `versions` row.
#[derive(Debug, Clone)]
pub struct Version {
    pub region: String,
    pub build_config: Key,
    pub cdn_config: Key,
    pub build_id: String,
    pub versions_name: String,
    pub product_config: Option<Key>,
}

impl Version {
    pub fn from_row(row: &psv::Row<'_>) -> Result<Version, KegError> {
        let required_key = |column: &'static str| {
            let hex = row.get(column).filter(|v| !v.is_empty()).ok_or({
                KegError::Malformed {
                    what: "versions row",
                    detail: format!("missing column {:?}", column),
                }
            })?;
            Key::from_hex(hex)
        };
        let optional_key = |column: &str| match row.get(column).filter(|v| !v.is_empty()) {
            Some(hex) => Key::from_hex(hex).map(Some),
            None => Ok(None),
        };

        Ok(Version {
            region: row.get("Region").unwrap_or("").to_string(),
            build_config: required_key("BuildConfig")?,
            cdn_config: required_key("CDNConfig")?,
            build_id: row.get("BuildId").unwrap_or("").to_string(),
            versions_name: row.get("VersionsName").unwrap_or("").to_string(),
            product_config: optional_key("ProductConfig")?,
        })
    }
}

/// What one plan run actually moved.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FetchReport {
    pub configs: usize,
    pub indices: usize,
    pub patch_indices: usize,
    pub archives: usize,
    pub loose: usize,
    pub patches: usize,
    /// Objects skipped on per-object network failure.
    pub skipped: usize,
}

impl FetchReport {
    pub fn total_fetched(&self) -> usize {
        self.configs
            + self.indices
            + self.patch_indices
            + self.archives
            + self.loose
            + self.patches
    }
}

/// What an install run did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub written: usize,
    pub skipped_existing: usize,
    pub conflicts: usize,
}

/// Context for core operations against one remote: the local store, the
/// responses side-store, and a transport.
pub struct Keg<'a, R: Remote> {
    store: &'a Store,
    db: &'a ResponseDb,
    remote: &'a R,
    base: String,
}

impl<'a, R: Remote> Keg<'a, R> {
    pub fn new(store: &'a Store, db: &'a ResponseDb, remote: &'a R, base: &str) -> Self {
        Keg {
            store,
            db,
            remote,
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    // ---- catalogs

    fn catalog_url(&self, kind: &str) -> String {
        format!("{}/{}", self.base, kind)
    }

    fn fetch_catalog(&self, kind: &str) -> Result<psv::Document, KegError> {
        let body = self.remote.get(&self.catalog_url(kind))?;
        let digest = self.store.write_response(kind, &body)?;
        self.db
            .record_response(&self.base, kind, &digest, Source::Network)?;

        let text = String::from_utf8(body).map_err(|e| KegError::Malformed {
            what: "catalog",
            detail: format!("{}: not utf-8: {}", kind, e),
        })?;
        let doc = psv::Document::parse(&text)?;
        self.db.record_rows(&self.base, &digest, &doc)?;
        Ok(doc)
    }

    fn fetch_optional_catalog(&self, kind: &str) -> Result<Option<psv::Document>, KegError> {
        match self.fetch_catalog(kind) {
            Ok(doc) => Ok(Some(doc)),
            Err(KegError::Network { url, .. }) => {
                debug!(%url, "optional catalog absent");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch and cache the remote's catalogs. `versions` and `cdns` are
    /// required; `bgdl`, `blobs` and the named blobs are optional.
    pub fn fetch_catalogs(&self) -> Result<Catalogs, KegError> {
        let versions = self.fetch_catalog("versions")?;
        let cdns = self.fetch_catalog("cdns")?;
        let bgdl = self.fetch_optional_catalog("bgdl")?;
        let blobs = self.fetch_optional_catalog("blobs")?;

        // The game/install blobs are opaque; cached raw, never parsed.
        for name in ["blob/game", "blob/install"] {
            match self.remote.get(&self.catalog_url(name)) {
                Ok(body) => {
                    let digest = self.store.write_response("blob", &body)?;
                    self.db
                        .record_response(&self.base, name, &digest, Source::Network)?;
                }
                Err(KegError::Network { url, .. }) => debug!(%url, "blob absent"),
                Err(e) => return Err(e),
            }
        }

        Ok(Catalogs {
            versions,
            cdns,
            bgdl,
            blobs,
        })
    }

    /// Record an externally supplied catalog response body, verbatim.
    pub fn ingest_response(&self, path: &str, body: &[u8]) -> Result<Key, KegError> {
        let kind = path.split('/').next().unwrap_or(path);
        let digest = self.store.write_response(kind, body)?;
        self.db
            .record_response(&self.base, path, &digest, Source::Ingested)?;

        if let Ok(text) = std::str::from_utf8(body) {
            if let Ok(doc) = psv::Document::parse(text) {
                self.db.record_rows(&self.base, &digest, &doc)?;
            }
        }
        Ok(digest)
    }

    pub fn versions_from(&self, catalogs: &Catalogs) -> Result<Vec<Version>, KegError> {
        catalogs
            .versions
            .rows()
            .map(|row| Version::from_row(&row))
            .collect()
    }

    /// Match a selector against `VersionsName`, `BuildId` or the
    /// `BuildConfig` hex. More than one distinct build is ambiguous.
    pub fn find_version(
        &self,
        versions: &[Version],
        selector: &str,
    ) -> Result<Version, KegError> {
        let matches: Vec<&Version> = versions
            .iter()
            .filter(|v| {
                v.versions_name == selector
                    || v.build_id == selector
                    || v.build_config.to_hex() == selector
            })
            .collect();

        let pairs: BTreeSet<(String, String)> = matches
            .iter()
            .map(|v| (v.build_config.to_hex(), v.cdn_config.to_hex()))
            .collect();

        match pairs.len() {
            0 => Err(KegError::NotFound {
                kind: "version",
                key: selector.to_string(),
            }),
            1 => Ok((*matches[0]).clone()),
            _ => Err(KegError::Ambiguous {
                pairs: pairs.into_iter().collect(),
            }),
        }
    }

    // ---- config views over stored objects

    fn config_text(&self, key: &Key) -> Result<String, KegError> {
        let data = self.store.read_object(ObjectKind::Config, key)?;
        String::from_utf8(data).map_err(|e| KegError::Malformed {
            what: "config",
            detail: format!("{}: not utf-8: {}", key, e),
        })
    }

    fn build_config(&self, key: &Key) -> Result<BuildConfig, KegError> {
        BuildConfig::parse(&self.config_text(key)?)
    }

    fn cdn_config(&self, key: &Key) -> Result<CdnConfig, KegError> {
        CdnConfig::parse(&self.config_text(key)?)
    }

    fn patch_config(&self, key: &Key) -> Result<PatchConfig, KegError> {
        PatchConfig::parse(&self.config_text(key)?)
    }

    fn load_encoding(&self, encoded_key: &Key) -> Result<EncodingFile, KegError> {
        let file = self.store.open_object(ObjectKind::Data, encoded_key)?;
        let mut decoded = Vec::new();
        blte::decode_verified(file, &mut decoded, encoded_key)?;
        EncodingFile::parse(&decoded)
    }

    /// The combined index for a cdn-config's archive set: a standalone group
    /// object when one is stored, otherwise synthesized from the member
    /// indices in list order.
    fn archive_group(&self, cdn_config: &CdnConfig) -> Result<ArchiveGroup, KegError> {
        if let Some(group_key) = cdn_config.archive_group {
            if self.store.has_index(&group_key) {
                let data = self.store.read_object(ObjectKind::Index, &group_key)?;
                return ArchiveGroup::parse(group_key, &cdn_config.archives, &data);
            }
        }

        let mut indices = Vec::new();
        for archive in &cdn_config.archives {
            match self.store.read_object(ObjectKind::Index, archive) {
                Ok(data) => indices.push(ArchiveIndex::parse(*archive, &data)?),
                Err(KegError::NotFound { .. }) => {
                    warn!(archive = %archive, "index missing, archive group is incomplete")
                }
                Err(e) => return Err(e),
            }
        }

        let group_key = cdn_config
            .archive_group
            .unwrap_or_else(|| Key::from_bytes([0u8; 16]));
        Ok(ArchiveGroup::synthesize(group_key, &indices))
    }

    // ---- object downloads

    fn fetch_one(&self, kind: ObjectKind, key: &Key, url: String) -> Result<bool, KegError> {
        match self.remote.get(&url) {
            Ok(body) => {
                self.store.write(kind, key, &mut Cursor::new(body))?;
                Ok(true)
            }
            Err(KegError::Network { url, reason }) => {
                warn!(%url, %reason, "skipping object after network failure");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn fetch_set<F>(
        &self,
        keys: &BTreeSet<Key>,
        kind: ObjectKind,
        url_for: F,
        fetched: &mut usize,
        skipped: &mut usize,
    ) -> Result<(), KegError>
    where
        F: Fn(&Key) -> String,
    {
        for key in keys {
            if self.fetch_one(kind, key, url_for(key))? {
                *fetched += 1;
            } else {
                *skipped += 1;
            }
        }
        Ok(())
    }

    // ---- the plan

    /// Fetch everything the given versions need, at most once per key.
    pub fn fetch_builds(
        &self,
        versions: &[Version],
        cdn: &SelectedCdn,
        options: &FetchOptions,
    ) -> Result<FetchReport, KegError> {
        let mut report = FetchReport::default();

        // One pass per logical build.
        let mut seen = BTreeSet::new();
        let mut builds = Vec::new();
        for version in versions {
            let build = (version.build_config, version.cdn_config, version.product_config);
            if seen.insert(build) {
                builds.push(version);
            }
        }
        info!(
            versions = versions.len(),
            builds = builds.len(),
            "planning fetch"
        );

        // Phase 1: configs.
        let mut configs = BTreeSet::new();
        for build in &builds {
            for key in [build.build_config, build.cdn_config] {
                if !self.store.has_config(&key) {
                    configs.insert(key);
                }
            }
        }
        info!(count = configs.len(), "fetching configs");
        self.fetch_set(
            &configs,
            ObjectKind::Config,
            |key| cdn.config_url(key),
            &mut report.configs,
            &mut report.skipped,
        )?;

        // Phase 2: indices. Patch indices are their own set so the two
        // families never conflate.
        let mut indices = BTreeSet::new();
        let mut patch_indices = BTreeSet::new();
        for build in &builds {
            let cdn_config = match self.cdn_config(&build.cdn_config) {
                Ok(config) => config,
                Err(KegError::NotFound { .. }) => {
                    warn!(key = %build.cdn_config, "cdn-config unavailable, skipping build");
                    continue;
                }
                Err(e) => return Err(e),
            };
            for archive in &cdn_config.archives {
                if !self.store.has_index(archive) {
                    indices.insert(*archive);
                }
            }
            for patch_archive in &cdn_config.patch_archives {
                if !self.store.has_patch_index(patch_archive) {
                    patch_indices.insert(*patch_archive);
                }
            }

            let build_config = match self.build_config(&build.build_config) {
                Ok(config) => config,
                Err(KegError::NotFound { .. }) => {
                    warn!(key = %build.build_config, "build-config unavailable, skipping build");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if let Some(patch_config_key) = build_config.patch_config {
                if !self.store.has_config(&patch_config_key)
                    && self.fetch_one(
                        ObjectKind::Config,
                        &patch_config_key,
                        cdn.config_url(&patch_config_key),
                    )?
                {
                    report.configs += 1;
                }
                match self.patch_config(&patch_config_key) {
                    Ok(patch_config) => {
                        for entry in &patch_config.entries {
                            for pair in &entry.pairs {
                                if !self.store.has_patch_index(&pair.patch_key) {
                                    patch_indices.insert(pair.patch_key);
                                }
                            }
                        }
                    }
                    Err(KegError::NotFound { .. }) => {
                        warn!(key = %patch_config_key, "patch-config unavailable")
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        info!(
            indices = indices.len(),
            patch_indices = patch_indices.len(),
            "fetching indices"
        );
        self.fetch_set(
            &indices,
            ObjectKind::Index,
            |key| cdn.data_index_url(key),
            &mut report.indices,
            &mut report.skipped,
        )?;
        self.fetch_set(
            &patch_indices,
            ObjectKind::PatchIndex,
            |key| cdn.patch_index_url(key),
            &mut report.patch_indices,
            &mut report.skipped,
        )?;

        if options.metadata_only {
            info!("metadata only, stopping before bodies");
            return Ok(report);
        }

        // Phase 3: archive bodies, loose files, patch files.
        let mut archives = BTreeSet::new();
        let mut loose = BTreeSet::new();
        let mut patches = BTreeSet::new();
        for build in &builds {
            let cdn_config = match self.cdn_config(&build.cdn_config) {
                Ok(config) => config,
                Err(KegError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            };
            for archive in &cdn_config.archives {
                if !self.store.has_data(archive) {
                    archives.insert(*archive);
                }
            }

            let build_config = match self.build_config(&build.build_config) {
                Ok(config) => config,
                Err(KegError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            };

            // The encoding file is itself a loose object and gates the rest
            // of this build's resolution.
            let encoding_key = build_config.encoding_encoded;
            if !self.store.has_data(&encoding_key) {
                if self.fetch_one(ObjectKind::Data, &encoding_key, cdn.data_url(&encoding_key))? {
                    report.loose += 1;
                } else {
                    report.skipped += 1;
                    warn!(key = %encoding_key, "encoding unavailable, skipping build");
                    continue;
                }
            }
            let encoding = self.load_encoding(&encoding_key)?;
            let group = self.archive_group(&cdn_config)?;

            for content_key in [build_config.root, build_config.install, build_config.download] {
                match encoding.find(&content_key) {
                    Some((encoded_key, _)) => {
                        if !group.contains(&encoded_key) && !self.store.has_data(&encoded_key) {
                            loose.insert(encoded_key);
                        }
                    }
                    None => warn!(key = %content_key, "content key not in encoding"),
                }
            }

            if let Some(patch_config_key) = build_config.patch_config {
                if let Ok(patch_config) = self.patch_config(&patch_config_key) {
                    for entry in &patch_config.entries {
                        for pair in &entry.pairs {
                            if !self.store.has_patch(&pair.patch_key) {
                                patches.insert(pair.patch_key);
                            }
                        }
                    }
                }
            }
        }
        info!(
            archives = archives.len(),
            loose = loose.len(),
            patches = patches.len(),
            "fetching bodies"
        );
        self.fetch_set(
            &archives,
            ObjectKind::Data,
            |key| cdn.data_url(key),
            &mut report.archives,
            &mut report.skipped,
        )?;
        self.fetch_set(
            &loose,
            ObjectKind::Data,
            |key| cdn.data_url(key),
            &mut report.loose,
            &mut report.skipped,
        )?;
        self.fetch_set(
            &patches,
            ObjectKind::Patch,
            |key| cdn.patch_url(key),
            &mut report.patches,
            &mut report.skipped,
        )?;

        Ok(report)
    }

    // ---- install

    /// Decode the object behind an encoded key: loose objects are BLTE with
    /// the envelope proven against the key, archive slices are proven by the
    /// index entry key and decoded only when framed.
    fn decoded_object(&self, encoded_key: &Key, group: &ArchiveGroup) -> Result<Vec<u8>, KegError> {
        if self.store.has_data(encoded_key) {
            let file = self.store.open_object(ObjectKind::Data, encoded_key)?;
            let mut decoded = Vec::new();
            blte::decode_verified(file, &mut decoded, encoded_key)?;
            return Ok(decoded);
        }

        if let Some(location) = group.find(encoded_key) {
            let mut archive_file = self.store.open_object(ObjectKind::Data, &location.archive)?;
            let data = archive::read_entry(
                &mut archive_file,
                encoded_key,
                location.size,
                location.offset,
            )?;
            if data.starts_with(blte::MAGIC) {
                let mut decoded = Vec::new();
                blte::decode(&mut Cursor::new(&data), &mut decoded)?;
                return Ok(decoded);
            }
            return Ok(data);
        }

        Err(KegError::NotFound {
            kind: "data",
            key: encoded_key.to_hex(),
        })
    }

    /// Materialize a build's install set under `target`, filtered by tags.
    ///
    /// Existing files are never overwritten. Duplicate filenames with the
    /// same content key collapse silently; with different keys the first
    /// entry wins, a warning names both keys and the conflict is counted.
    pub fn install(
        &self,
        version: &Version,
        target: &Path,
        tags: &[String],
    ) -> Result<InstallReport, KegError> {
        let build_config = self.build_config(&version.build_config)?;
        let cdn_config = self.cdn_config(&version.cdn_config)?;
        let encoding = self.load_encoding(&build_config.encoding_encoded)?;
        let group = self.archive_group(&cdn_config)?;

        let (install_key, _) =
            encoding
                .find(&build_config.install)
                .ok_or(KegError::NotFound {
                    kind: "install manifest",
                    key: build_config.install.to_hex(),
                })?;
        let manifest = InstallFile::parse(&self.decoded_object(&install_key, &group)?)?;

        let selected = manifest.select(tags)?;
        info!(
            entries = selected.len(),
            dir = %target.display(),
            "installing"
        );

        let mut report = InstallReport::default();
        let mut seen: HashMap<&str, Key> = HashMap::new();

        for entry in selected {
            match seen.get(entry.name.as_str()) {
                Some(first) if *first == entry.key => continue,
                Some(first) => {
                    warn!(
                        name = %entry.name,
                        first = %first,
                        second = %entry.key,
                        "conflicting install entries, keeping the first"
                    );
                    report.conflicts += 1;
                    continue;
                }
                None => {
                    seen.insert(&entry.name, entry.key);
                }
            }

            let dest = target.join(&entry.name);
            if dest.exists() {
                warn!(path = %dest.display(), "refusing to overwrite existing file");
                report.skipped_existing += 1;
                continue;
            }

            let (encoded_key, _) = encoding.find(&entry.key).ok_or(KegError::NotFound {
                kind: "encoding entry",
                key: entry.key.to_hex(),
            })?;
            let data = self.decoded_object(&encoded_key, &group)?;

            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&dest, &data)?;
            debug!(path = %dest.display(), bytes = data.len(), "installed");
            report.written += 1;
        }

        Ok(report)
    }
}

#[cfg(test)]
mod test_fetch {
    use std::fs;
    use std::path::Path;

    use super::*;
    use crate::archive::{ArchiveIndex, IndexEntry, DEFAULT_BLOCK_KB};
    use crate::cdn::FsRemote;
    use crate::manifest::{encoding, install};

    const BASE: &str = "http://test";

    struct Fixture {
        _remote_dir: tempfile::TempDir,
        _store_dir: tempfile::TempDir,
        remote: FsRemote,
        store: Store,
        db: ResponseDb,
        content: Vec<u8>,
        content_key: Key,
        encoded_key: Key,
        archive_key: Key,
        build_key: Key,
        cdn_key: Key,
    }

    fn put(root: &Path, rel: &str, data: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
    }

    /// A complete single-build remote: one archived content file, a loose
    /// encoding file and a loose install manifest. `extra_entries` lets a
    /// test add install rows (e.g. duplicates).
    fn fixture(extra_entries: &[(&str, Key, u32)]) -> Fixture {
        let remote_dir = tempfile::tempdir().unwrap();
        let root = remote_dir.path();

        // The content file, BLTE-framed inside the archive.
        let content = b"the content of Wow.exe".to_vec();
        let content_key = Key::of_slice(&content);
        let envelope = blte::build::raw(&content);
        let encoded_key = Key::of_slice(&envelope);

        // One archive holding the single envelope at offset 0.
        let archive_bytes = envelope.clone();
        let archive_key = Key::of_slice(&archive_bytes);
        let index_data = ArchiveIndex::write(
            &[IndexEntry {
                key: encoded_key,
                size: envelope.len() as u32,
                offset: 0,
            }],
            DEFAULT_BLOCK_KB,
        );

        // Install manifest, loose.
        let mut entries: Vec<(&str, Key, u32)> =
            vec![("Wow.exe", content_key, content.len() as u32)];
        entries.extend_from_slice(extra_entries);
        let install_data = install::build::manifest(&[], &entries);
        let install_ckey = Key::of_slice(&install_data);
        let install_envelope = blte::build::raw(&install_data);
        let install_ekey = Key::of_slice(&install_envelope);

        // Encoding table mapping both content keys, itself loose.
        let encoding_data = encoding::build::table(
            &[
                (content_key, vec![encoded_key], content.len() as u64),
                (install_ckey, vec![install_ekey], install_data.len() as u64),
            ],
            1,
        );
        let encoding_ckey = Key::of_slice(&encoding_data);
        let encoding_envelope = blte::build::raw(&encoding_data);
        let encoding_ekey = Key::of_slice(&encoding_envelope);

        let build_text = format!(
            "# Build Configuration\n\n\
             root = {content_key}\n\
             install = {install_ckey}\n\
             download = {content_key}\n\
             encoding = {encoding_ckey} {encoding_ekey}\n"
        );
        let build_key = Key::of_slice(build_text.as_bytes());

        let cdn_text = format!("# CDN Configuration\n\narchives = {archive_key}\n");
        let cdn_key = Key::of_slice(cdn_text.as_bytes());

        let versions = format!(
            "Region!STRING:0|BuildConfig!HEX:16|CDNConfig!HEX:16|KeyRing!HEX:16|BuildId!DEC:4|VersionsName!String:0|ProductConfig!HEX:16\n\
             ## seqn = 2\n\
             us|{build_key}|{cdn_key}||43342|1.0.0.43342|\n"
        );
        let cdns =
            "Name!STRING:0|Path!STRING:0|Hosts!STRING:0|Servers!STRING:0|ConfigPath!STRING:0\n\
             test|tpr/fixture|test||tpr/configs\n";

        put(root, "versions", versions.as_bytes());
        put(root, "cdns", cdns.as_bytes());
        let tpr = |kind: &str, key: &Key| format!("tpr/fixture/{}/{}", kind, key.partition());
        put(root, &tpr("config", &build_key), build_text.as_bytes());
        put(root, &tpr("config", &cdn_key), cdn_text.as_bytes());
        put(root, &format!("{}.index", tpr("data", &archive_key)), &index_data);
        put(root, &tpr("data", &archive_key), &archive_bytes);
        put(root, &tpr("data", &encoding_ekey), &encoding_envelope);
        put(root, &tpr("data", &install_ekey), &install_envelope);

        let store_dir = tempfile::tempdir().unwrap();
        let store = Store::init(store_dir.path()).unwrap();
        let db = ResponseDb::open_in_memory().unwrap();

        Fixture {
            remote: FsRemote {
                root: root.to_path_buf(),
            },
            _remote_dir: remote_dir,
            _store_dir: store_dir,
            store,
            db,
            content,
            content_key,
            encoded_key,
            archive_key,
            build_key,
            cdn_key,
        }
    }

    fn plan<'a>(fixture: &'a Fixture) -> (Keg<'a, FsRemote>, Vec<Version>, SelectedCdn) {
        let keg = Keg::new(&fixture.store, &fixture.db, &fixture.remote, BASE);
        let catalogs = keg.fetch_catalogs().unwrap();
        let versions = keg.versions_from(&catalogs).unwrap();

        let rows: Vec<_> = catalogs.cdns.rows().collect();
        let cdns: Vec<_> = rows
            .iter()
            .map(|row| crate::cdn::CdnInfo::from_row(row).unwrap())
            .collect();
        let cdn = crate::cdn::select_cdn(&cdns, None, &[]).unwrap();

        (keg, versions, cdn)
    }

    #[test]
    fn metadata_only_fetches_configs_and_indices() {
        let fixture = fixture(&[]);
        let (keg, versions, cdn) = plan(&fixture);

        let options = FetchOptions {
            metadata_only: true,
            ..FetchOptions::default()
        };
        let report = keg.fetch_builds(&versions, &cdn, &options).unwrap();

        assert_eq!(report.configs, 2);
        assert_eq!(report.indices, 1);
        assert_eq!(report.skipped, 0);
        assert!(fixture.store.has_config(&fixture.build_key));
        assert!(fixture.store.has_config(&fixture.cdn_key));
        assert!(fixture.store.has_index(&fixture.archive_key));

        // No bodies of any kind.
        assert_eq!(report.archives + report.loose + report.patches, 0);
        assert!(!fixture.store.has_data(&fixture.archive_key));
        assert!(!fixture.store.has_data(&fixture.encoded_key));
    }

    #[test]
    fn full_fetch_is_idempotent() {
        let fixture = fixture(&[]);
        let (keg, versions, cdn) = plan(&fixture);

        let report = keg
            .fetch_builds(&versions, &cdn, &FetchOptions::default())
            .unwrap();
        assert_eq!(report.configs, 2);
        assert_eq!(report.indices, 1);
        assert_eq!(report.archives, 1);
        assert_eq!(report.loose, 2); // encoding + install manifest
        assert_eq!(report.skipped, 0);

        // Nothing changed upstream: the second run moves zero bytes.
        let again = keg
            .fetch_builds(&versions, &cdn, &FetchOptions::default())
            .unwrap();
        assert_eq!(again.total_fetched(), 0);
        assert_eq!(again.skipped, 0);
    }

    #[test]
    fn install_materializes_and_verifies() {
        let fixture = fixture(&[]);
        let (keg, versions, cdn) = plan(&fixture);
        keg.fetch_builds(&versions, &cdn, &FetchOptions::default())
            .unwrap();

        let target = tempfile::tempdir().unwrap();
        let report = keg.install(&versions[0], target.path(), &[]).unwrap();

        assert_eq!(report.written, 1);
        assert_eq!(report.conflicts, 0);
        let written = fs::read(target.path().join("Wow.exe")).unwrap();
        assert_eq!(written, fixture.content);
        assert_eq!(Key::of_slice(&written), fixture.content_key);

        // Re-running refuses to overwrite.
        let again = keg.install(&versions[0], target.path(), &[]).unwrap();
        assert_eq!(again.written, 0);
        assert_eq!(again.skipped_existing, 1);
    }

    #[test]
    fn duplicate_entries_conflict_and_first_wins() {
        // Same filename again under a different content key.
        let other_key = Key::of_slice(b"some other content");
        let fixture = fixture(&[("Wow.exe", other_key, 5)]);
        let (keg, versions, cdn) = plan(&fixture);
        keg.fetch_builds(&versions, &cdn, &FetchOptions::default())
            .unwrap();

        let target = tempfile::tempdir().unwrap();
        let report = keg.install(&versions[0], target.path(), &[]).unwrap();

        assert_eq!(report.written, 1);
        assert_eq!(report.conflicts, 1);
        assert_eq!(
            fs::read(target.path().join("Wow.exe")).unwrap(),
            fixture.content
        );
    }

    #[test]
    fn missing_optional_catalogs_are_tolerated() {
        let fixture = fixture(&[]);
        // The fixture has no bgdl or blobs files at all.
        let keg = Keg::new(&fixture.store, &fixture.db, &fixture.remote, BASE);

        let catalogs = keg.fetch_catalogs().unwrap();
        assert!(catalogs.bgdl.is_none());
        assert!(catalogs.blobs.is_none());
        assert_eq!(catalogs.versions.len(), 1);
    }

    #[test]
    fn missing_versions_catalog_fails() {
        let fixture = fixture(&[]);
        fs::remove_file(fixture.remote.root.join("versions")).unwrap();
        let keg = Keg::new(&fixture.store, &fixture.db, &fixture.remote, BASE);

        assert!(matches!(
            keg.fetch_catalogs().unwrap_err(),
            KegError::Network { .. }
        ));
    }

    #[test]
    fn responses_recorded_under_own_digest() {
        let fixture = fixture(&[]);
        let keg = Keg::new(&fixture.store, &fixture.db, &fixture.remote, BASE);
        keg.fetch_catalogs().unwrap();

        let body = fs::read(fixture.remote.root.join("versions")).unwrap();
        let digest = Key::of_slice(&body);
        assert_eq!(
            fixture.db.latest_digest(BASE, "versions").unwrap(),
            Some(digest.to_hex())
        );
        assert!(fixture.store.response_path("versions", &digest).is_file());
    }

    #[test]
    fn version_selector_matches_name_id_and_config() {
        let fixture = fixture(&[]);
        let (keg, versions, _) = plan(&fixture);

        for selector in [
            "1.0.0.43342",
            "43342",
            fixture.build_key.to_hex().as_str(),
        ] {
            let found = keg.find_version(&versions, selector).unwrap();
            assert_eq!(found.build_config, fixture.build_key);
        }

        assert!(matches!(
            keg.find_version(&versions, "9.9.9").unwrap_err(),
            KegError::NotFound { .. }
        ));
    }

    #[test]
    fn ambiguous_selector_lists_pairs() {
        let fixture = fixture(&[]);
        let (keg, versions, _) = plan(&fixture);

        // Same name resolving to two distinct builds.
        let mut doubled = versions.clone();
        let mut other = versions[0].clone();
        other.cdn_config = Key::of_slice(b"a different cdn config");
        doubled.push(other);

        match keg.find_version(&doubled, "1.0.0.43342").unwrap_err() {
            KegError::Ambiguous { pairs } => assert_eq!(pairs.len(), 2),
            other => panic!("unexpected error: {:?}", other),
        }

        // Same build twice is not ambiguous.
        let mut repeated = versions.clone();
        repeated.push(versions[0].clone());
        assert!(keg.find_version(&repeated, "1.0.0.43342").is_ok());
    }

    #[test]
    fn corrupt_upstream_object_aborts_the_plan() {
        let fixture = fixture(&[]);
        let (keg, versions, cdn) = plan(&fixture);

        // Tamper with the build config on the remote side.
        let path = fixture.remote.root.join(format!(
            "tpr/fixture/config/{}",
            fixture.build_key.partition()
        ));
        fs::write(&path, b"# tampered\nroot = ff\n").unwrap();

        let err = keg
            .fetch_builds(&versions, &cdn, &FetchOptions::default())
            .unwrap_err();
        assert!(matches!(err, KegError::Integrity { .. }));
    }

    #[test]
    fn ingested_responses_are_marked() {
        let fixture = fixture(&[]);
        let keg = Keg::new(&fixture.store, &fixture.db, &fixture.remote, BASE);

        keg.ingest_response("versions", b"Region!STRING:0\nus\n")
            .unwrap();

        let history = fixture.db.responses(BASE).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].source, "ingested");
    }
}
