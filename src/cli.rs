use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "keg")]
#[command(about = "NGDP client: fetch, verify and install CDN-distributed builds")]
#[command(author, version, long_about = None)]
pub struct Cli {
    /// Store root directory
    #[arg(long, value_name = "DIR", default_value = ".keg")]
    pub root: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a store at the root
    Init,

    /// Fetch a remote's builds into the store
    Fetch {
        /// Catalog base URL, e.g. http://example/tpr/product
        remote: String,

        /// Stop after configs and indices
        #[arg(long)]
        metadata_only: bool,

        /// Only fetch the build matching this selector
        /// (VersionsName, BuildId or BuildConfig hex)
        #[arg(long)]
        version: Option<String>,

        /// Force a CDN base URL instead of the catalog's choice
        #[arg(long)]
        cdn: Option<String>,

        /// Preferred CDN names, in order
        #[arg(long, value_delimiter = ',')]
        preferred_cdns: Vec<String>,
    },

    /// Materialize a build's install set into a directory
    Install {
        /// Catalog base URL
        remote: String,

        /// Version selector (VersionsName, BuildId or BuildConfig hex)
        version: String,

        /// Target directory
        target: PathBuf,

        /// Install tags to filter by, e.g. Windows,enUS
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
    },

    /// Verify every stored object, collecting stray temp files
    Fsck {
        /// Delete objects that fail verification
        #[arg(long)]
        repair: bool,
    },

    /// Summarize the cached catalog responses for a remote
    Inspect {
        /// Catalog base URL
        remote: String,
    },

    /// Record an externally obtained catalog response
    Ingest {
        /// Catalog base URL the response belongs to
        remote: String,

        /// Catalog path, e.g. versions
        path: String,

        /// File holding the response body
        file: PathBuf,
    },
}
