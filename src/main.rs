use std::fs;
use std::process;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use keg::cdn::{select_cdn, CdnInfo, HttpRemote};
use keg::error::KegError;
use keg::fetch::{Catalogs, FetchOptions, Keg};
use keg::sql::ResponseDb;
use keg::store::Store;

mod cli;

use crate::cli::{Cli, Commands};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        eprintln!("error: {}", e);
        process::exit(e.exit_code());
    }
}

fn cdns_from(catalogs: &Catalogs) -> Result<Vec<CdnInfo>, KegError> {
    catalogs
        .cdns
        .rows()
        .map(|row| CdnInfo::from_row(&row))
        .collect()
}

fn run(cli: &Cli) -> Result<(), KegError> {
    match &cli.command {
        Commands::Init => {
            let store = Store::init(&cli.root)?;
            ResponseDb::open(&store.db_path())?;
            println!("initialized store at {}", cli.root.display());
        }

        Commands::Fetch {
            remote,
            metadata_only,
            version,
            cdn,
            preferred_cdns,
        } => {
            let store = Store::open(&cli.root)?;
            let db = ResponseDb::open(&store.db_path())?;
            let http = HttpRemote::new()?;
            let keg = Keg::new(&store, &db, &http, remote);

            let catalogs = keg.fetch_catalogs()?;
            let mut versions = keg.versions_from(&catalogs)?;
            if let Some(selector) = version {
                versions = vec![keg.find_version(&versions, selector)?];
            }

            let cdns = cdns_from(&catalogs)?;
            let selected = select_cdn(&cdns, cdn.as_deref(), preferred_cdns)?;
            let options = FetchOptions {
                metadata_only: *metadata_only,
            };

            let report = keg.fetch_builds(&versions, &selected, &options)?;
            println!(
                "fetched {} configs, {} indices, {} patch indices, {} archives, {} loose, {} patches ({} skipped)",
                report.configs,
                report.indices,
                report.patch_indices,
                report.archives,
                report.loose,
                report.patches,
                report.skipped,
            );
        }

        Commands::Install {
            remote,
            version,
            target,
            tags,
        } => {
            let store = Store::open(&cli.root)?;
            let db = ResponseDb::open(&store.db_path())?;
            let http = HttpRemote::new()?;
            let keg = Keg::new(&store, &db, &http, remote);

            let catalogs = keg.fetch_catalogs()?;
            let versions = keg.versions_from(&catalogs)?;
            let build = keg.find_version(&versions, version)?;

            let report = keg.install(&build, target, tags)?;
            println!(
                "installed {} files ({} existing kept, {} conflicts)",
                report.written, report.skipped_existing, report.conflicts,
            );
        }

        Commands::Fsck { repair } => {
            let store = Store::open(&cli.root)?;
            let report = store.fsck(*repair)?;

            println!(
                "scanned {} objects, removed {} temp files, {} failures, {} repaired",
                report.scanned,
                report.temp_removed,
                report.errors.len(),
                report.repaired,
            );
            for (path, error) in &report.errors {
                println!("  {}: {}", path.display(), error);
            }
            if !report.is_clean() && !*repair {
                return Err(KegError::Integrity {
                    object: "store".to_string(),
                    expected: "a clean sweep".to_string(),
                    actual: format!("{} failures", report.errors.len()),
                });
            }
        }

        Commands::Inspect { remote } => {
            let store = Store::open(&cli.root)?;
            let db = ResponseDb::open(&store.db_path())?;

            let history = db.responses(remote.trim_end_matches('/'))?;
            if history.is_empty() {
                println!("no cached responses for {}", remote);
            }
            for row in history {
                println!("{}  {:10}  {}  {}", row.timestamp, row.path, row.digest, row.source);
            }
        }

        Commands::Ingest { remote, path, file } => {
            let store = Store::open(&cli.root)?;
            let db = ResponseDb::open(&store.db_path())?;
            let http = HttpRemote::new()?;
            let keg = Keg::new(&store, &db, &http, remote);

            let body = fs::read(file)?;
            let digest = keg.ingest_response(path, &body)?;
            println!("ingested {} as {}", path, digest);
        }
    }

    Ok(())
}
