//! CDN resolution and transport
//!
//! A *remote* is a catalog base URL exposing `/versions`, `/cdns` and
//! friends. The `cdns` catalog advertises one or more CDNs, each with a
//! path prefix and a server list; objects live under
//! `<server>/<path>/{config,data,patch}/aa/bb/<hex>`, indices with an
//! `.index` suffix.
//!
//! The [`Remote`] trait is the transport seam: the HTTP implementation is
//! what production uses, and tests substitute a filesystem-backed fixture.

use std::time::Duration;

use tracing::debug;

use crate::error::KegError;
use crate::key::Key;
use crate::psv;

/// Transport seam. `url` is fully qualified; implementations return the
/// whole body or a `Network` error.
pub trait Remote {
    fn get(&self, url: &str) -> Result<Vec<u8>, KegError>;
}

/// Plain blocking HTTP GET with a shared client and a request timeout.
pub struct HttpRemote {
    client: reqwest::blocking::Client,
}

impl HttpRemote {
    pub fn new() -> Result<HttpRemote, KegError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| KegError::Network {
                url: String::new(),
                reason: format!("failed to build http client: {}", e),
            })?;
        Ok(HttpRemote { client })
    }
}

impl Remote for HttpRemote {
    fn get(&self, url: &str) -> Result<Vec<u8>, KegError> {
        debug!(url, "GET");
        let response = self.client.get(url).send().map_err(|e| KegError::Network {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(KegError::Network {
                url: url.to_string(),
                reason: format!("http status {}", status),
            });
        }

        let body = response.bytes().map_err(|e| KegError::Network {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        Ok(body.to_vec())
    }
}

/// One row of the `cdns` catalog.
#[derive(Debug, Clone)]
pub struct CdnInfo {
    pub name: String,
    pub path: String,
    pub hosts: Vec<String>,
    pub servers: Vec<String>,
    pub config_path: String,
}

impl CdnInfo {
    pub fn from_row(row: &psv::Row<'_>) -> Result<CdnInfo, KegError> {
        let required = |column: &'static str| {
            row.get(column).ok_or(KegError::Malformed {
                what: "cdns row",
                detail: format!("missing column {:?}", column),
            })
        };

        Ok(CdnInfo {
            name: required("Name")?.to_string(),
            path: required("Path")?.to_string(),
            hosts: required("Hosts")?
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            servers: row
                .get("Servers")
                .unwrap_or("")
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            config_path: row.get("ConfigPath").unwrap_or("").to_string(),
        })
    }
}

/// The CDN a plan talks to: one server plus the path prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedCdn {
    pub server: String,
    pub path: String,
}

impl SelectedCdn {
    pub fn config_url(&self, key: &Key) -> String {
        format!("{}/{}/config/{}", self.server, self.path, key.partition())
    }

    pub fn data_url(&self, key: &Key) -> String {
        format!("{}/{}/data/{}", self.server, self.path, key.partition())
    }

    pub fn data_index_url(&self, key: &Key) -> String {
        format!("{}.index", self.data_url(key))
    }

    pub fn patch_url(&self, key: &Key) -> String {
        format!("{}/{}/patch/{}", self.server, self.path, key.partition())
    }

    pub fn patch_index_url(&self, key: &Key) -> String {
        format!("{}.index", self.patch_url(key))
    }
}

/// Pick the CDN for a plan.
///
/// A user-forced URL wins outright (and must carry scheme, host and path);
/// otherwise the preferred names are tried in order, case-insensitively;
/// otherwise the first catalog row is taken.
pub fn select_cdn(
    cdns: &[CdnInfo],
    forced: Option<&str>,
    preferred: &[String],
) -> Result<SelectedCdn, KegError> {
    if let Some(url) = forced {
        return parse_forced(url);
    }

    for name in preferred {
        if let Some(cdn) = cdns.iter().find(|c| c.name.eq_ignore_ascii_case(name)) {
            debug!(name = %cdn.name, "selected preferred cdn");
            return server_for(cdn);
        }
    }

    match cdns.first() {
        Some(cdn) => server_for(cdn),
        None => Err(KegError::NotFound {
            kind: "cdn",
            key: "catalog has no rows".to_string(),
        }),
    }
}

fn parse_forced(url: &str) -> Result<SelectedCdn, KegError> {
    let malformed = || KegError::Malformed {
        what: "cdn url",
        detail: format!("{:?}: need scheme://host/path", url),
    };

    let (scheme, rest) = url.split_once("://").ok_or_else(malformed)?;
    let (host, path) = rest.split_once('/').ok_or_else(malformed)?;
    let path = path.trim_matches('/');
    if scheme.is_empty() || host.is_empty() || path.is_empty() {
        return Err(malformed());
    }

    Ok(SelectedCdn {
        server: format!("{}://{}", scheme, host),
        path: path.to_string(),
    })
}

fn server_for(cdn: &CdnInfo) -> Result<SelectedCdn, KegError> {
    // The first advertised server wins; hosts are bare names served over
    // plain http.
    let server = cdn
        .servers
        .first()
        .map(|s| s.trim_end_matches('/').to_string())
        .or_else(|| cdn.hosts.first().map(|h| format!("http://{}", h)))
        .ok_or(KegError::NotFound {
            kind: "cdn server",
            key: cdn.name.clone(),
        })?;

    Ok(SelectedCdn {
        server,
        path: cdn.path.trim_matches('/').to_string(),
    })
}

/// Filesystem-backed fixture remote: resolves URL paths under a local root.
/// A missing file behaves like a 404.
#[cfg(test)]
pub struct FsRemote {
    pub root: std::path::PathBuf,
}

#[cfg(test)]
impl Remote for FsRemote {
    fn get(&self, url: &str) -> Result<Vec<u8>, KegError> {
        let path = match url.split_once("://") {
            Some((_, rest)) => rest.split_once('/').map(|(_, p)| p).unwrap_or(""),
            None => url,
        };

        std::fs::read(self.root.join(path)).map_err(|_| KegError::Network {
            url: url.to_string(),
            reason: "http status 404 Not Found".to_string(),
        })
    }
}
