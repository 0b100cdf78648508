//! Responses side-store
//!
//! A rusqlite database at the store root tracking every catalog response
//! the client has seen: one `responses` row per fetch (remote, path,
//! timestamp, digest of the body, network vs ingested) and the parsed PSV
//! cells keyed by `(remote, digest, row)`. A `(remote, path)` accumulates
//! historical digests; the latest is authoritative.
//!
//! Single writer at a time, any number of readers. The raw bodies live in
//! `responses/` in the object store, keyed by the same digests.

use std::path::Path;

use rusqlite::{params, Connection};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::KegError;
use crate::key::Key;
use crate::psv;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Network,
    Ingested,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Network => "network",
            Source::Ingested => "ingested",
        }
    }
}

/// One `responses` row, oldest first when listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseRow {
    pub path: String,
    pub timestamp: String,
    pub digest: String,
    pub source: String,
}

pub struct ResponseDb {
    conn: Connection,
}

impl ResponseDb {
    pub fn open(path: &Path) -> Result<ResponseDb, KegError> {
        let conn = Connection::open(path)?;
        setup(&conn)?;
        Ok(ResponseDb { conn })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<ResponseDb, KegError> {
        let conn = Connection::open_in_memory()?;
        setup(&conn)?;
        Ok(ResponseDb { conn })
    }

    pub fn record_response(
        &self,
        remote: &str,
        path: &str,
        digest: &Key,
        source: Source,
    ) -> Result<(), KegError> {
        let timestamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| String::from("unknown"));

        self.conn
            .prepare_cached(
                "INSERT INTO responses
                 (remote, path, timestamp, digest, source)
                 VALUES
                 (?, ?, ?, ?, ?)",
            )?
            .execute(params![
                remote,
                path,
                timestamp,
                digest.to_hex(),
                source.as_str()
            ])?;
        Ok(())
    }

    pub fn record_rows(
        &self,
        remote: &str,
        digest: &Key,
        doc: &psv::Document,
    ) -> Result<(), KegError> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT OR IGNORE INTO psv_cells
             (remote, digest, row_number, column_name, cell_value)
             VALUES
             (?, ?, ?, ?, ?)",
        )?;

        let hex = digest.to_hex();
        for row in doc.rows() {
            for (column, value) in doc.columns.iter().zip(row.cells()) {
                stmt.execute(params![remote, hex, row.number as i64, column.name, value])?;
            }
        }
        Ok(())
    }

    /// Most recently recorded digest for `(remote, path)`, if any.
    pub fn latest_digest(&self, remote: &str, path: &str) -> Result<Option<String>, KegError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT digest FROM responses
             WHERE remote = ? AND path = ?
             ORDER BY rowid DESC LIMIT 1",
        )?;

        let mut rows = stmt.query(params![remote, path])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    /// Full response history for a remote, oldest first.
    pub fn responses(&self, remote: &str) -> Result<Vec<ResponseRow>, KegError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT path, timestamp, digest, source FROM responses
             WHERE remote = ?
             ORDER BY rowid ASC",
        )?;

        let rows = stmt
            .query_map(params![remote], |row| {
                Ok(ResponseRow {
                    path: row.get(0)?,
                    timestamp: row.get(1)?,
                    digest: row.get(2)?,
                    source: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// One parsed catalog cell.
    pub fn cell(
        &self,
        remote: &str,
        digest: &str,
        row: usize,
        column: &str,
    ) -> Result<Option<String>, KegError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT cell_value FROM psv_cells
             WHERE remote = ? AND digest = ? AND row_number = ? AND column_name = ?",
        )?;

        let mut rows = stmt.query(params![remote, digest, row as i64, column])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }
}

fn setup(conn: &Connection) -> Result<(), KegError> {
    conn.execute_batch(
        "BEGIN;
         CREATE TABLE IF NOT EXISTS responses (
            remote VARCHAR NOT NULL,
            path VARCHAR NOT NULL,
            timestamp VARCHAR NOT NULL,
            digest VARCHAR NOT NULL,
            source VARCHAR NOT NULL
         );
         CREATE TABLE IF NOT EXISTS psv_cells (
            remote VARCHAR NOT NULL,
            digest VARCHAR NOT NULL,
            row_number INTEGER NOT NULL,
            column_name VARCHAR NOT NULL,
            cell_value VARCHAR NOT NULL,
            UNIQUE(remote, digest, row_number, column_name)
         );
         COMMIT;",
    )?;
    Ok(())
}

#[cfg(test)]
mod test_sql {
    use super::*;
    use crate::psv::Document;

    #[test]
    fn latest_digest_wins() {
        let db = ResponseDb::open_in_memory().unwrap();
        let first = Key::of_slice(b"first body");
        let second = Key::of_slice(b"second body");

        db.record_response("http://r", "versions", &first, Source::Network)
            .unwrap();
        db.record_response("http://r", "versions", &second, Source::Network)
            .unwrap();

        assert_eq!(
            db.latest_digest("http://r", "versions").unwrap(),
            Some(second.to_hex())
        );
        assert_eq!(db.latest_digest("http://r", "cdns").unwrap(), None);
    }

    #[test]
    fn cells_keyed_by_remote_digest_row() {
        let db = ResponseDb::open_in_memory().unwrap();
        let doc = Document::parse("Region!STRING:0|BuildId!DEC:4\nus|100\neu|101\n").unwrap();
        let digest = Key::of_slice(b"body");

        db.record_rows("http://r", &digest, &doc).unwrap();

        let hex = digest.to_hex();
        assert_eq!(
            db.cell("http://r", &hex, 0, "Region").unwrap(),
            Some("us".to_string())
        );
        assert_eq!(
            db.cell("http://r", &hex, 1, "BuildId").unwrap(),
            Some("101".to_string())
        );
        assert_eq!(db.cell("http://r", &hex, 2, "Region").unwrap(), None);

        // Re-recording the same digest is a no-op.
        db.record_rows("http://r", &digest, &doc).unwrap();
        assert_eq!(
            db.cell("http://r", &hex, 0, "Region").unwrap(),
            Some("us".to_string())
        );
    }

    #[test]
    fn history_preserves_order_and_source() {
        let db = ResponseDb::open_in_memory().unwrap();
        let a = Key::of_slice(b"a");
        let b = Key::of_slice(b"b");

        db.record_response("http://r", "versions", &a, Source::Network)
            .unwrap();
        db.record_response("http://r", "cdns", &b, Source::Ingested)
            .unwrap();

        let history = db.responses("http://r").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].path, "versions");
        assert_eq!(history[0].source, "network");
        assert_eq!(history[1].path, "cdns");
        assert_eq!(history[1].source, "ingested");
    }
}
