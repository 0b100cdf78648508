//! Pipe-separated-values catalog tables
//!
//! The catalog endpoints (`versions`, `cdns`, `bgdl`, `blobs`) all speak the
//! same tabular text format:
//!
//! ```text
//! Region!STRING:0|BuildConfig!HEX:16|BuildId!DEC:4
//! ## seqn = 12345
//! us|e1a6...|43342
//! eu|e1a6...|43342
//! ```
//!
//! The header line carries `Name!TYPE:N` per column. Lines starting with `#`
//! are metadata; `## key = value` pairs are parsed and `seqn` is surfaced.
//! Data rows are `|`-separated and must match the header's column count.

use crate::error::KegError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub typ: String,
}

/// A parsed PSV document: ordered header, optional sequence number, rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub columns: Vec<Column>,
    pub seqn: Option<u32>,
    rows: Vec<Vec<String>>,
}

/// One data row, resolving cells by column name.
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    doc: &'a Document,
    cells: &'a [String],
    pub number: usize,
}

impl<'a> Row<'a> {
    pub fn get(&self, column: &str) -> Option<&'a str> {
        self.doc
            .columns
            .iter()
            .position(|c| c.name == column)
            .map(|i| self.cells[i].as_str())
    }

    pub fn cells(&self) -> &'a [String] {
        self.cells
    }
}

impl Document {
    pub fn parse(input: &str) -> Result<Document, KegError> {
        let mut lines = input.lines();

        let header = lines.next().ok_or(KegError::Malformed {
            what: "psv header",
            detail: "empty document".to_string(),
        })?;
        let columns = parse_header(header)?;

        let mut seqn = None;
        let mut rows = Vec::new();

        for (offset, line) in lines.enumerate() {
            if line.is_empty() {
                continue;
            }
            if let Some(meta) = line.strip_prefix('#') {
                // `## seqn = 12345` and friends
                if let Some((k, v)) = meta.trim_start_matches('#').split_once('=') {
                    if k.trim() == "seqn" {
                        seqn = v.trim().parse().ok();
                    }
                }
                continue;
            }

            let cells: Vec<String> = line.split('|').map(str::to_string).collect();
            if cells.len() != columns.len() {
                return Err(KegError::Malformed {
                    what: "psv row",
                    detail: format!(
                        "row {}: {} cells, header has {} columns",
                        offset + 2,
                        cells.len(),
                        columns.len()
                    ),
                });
            }
            rows.push(cells);
        }

        Ok(Document { columns, seqn, rows })
    }

    pub fn rows(&self) -> impl Iterator<Item = Row<'_>> {
        self.rows.iter().enumerate().map(move |(i, cells)| Row {
            doc: self,
            cells,
            number: i,
        })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Serialize back to the wire form. Inverse of `parse` for any rows whose
    /// cells contain no `|` or newline.
    pub fn write(&self) -> String {
        let mut out = String::new();

        let header: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{}!{}", c.name, c.typ))
            .collect();
        out.push_str(&header.join("|"));
        out.push('\n');

        if let Some(seqn) = self.seqn {
            out.push_str(&format!("## seqn = {}\n", seqn));
        }

        for row in &self.rows {
            out.push_str(&row.join("|"));
            out.push('\n');
        }
        out
    }

    /// Assemble a document from parts, for fixtures and re-serialization.
    pub fn from_rows(columns: Vec<Column>, seqn: Option<u32>, rows: Vec<Vec<String>>) -> Document {
        Document { columns, seqn, rows }
    }
}

fn parse_header(line: &str) -> Result<Vec<Column>, KegError> {
    let mut columns = Vec::new();

    for field in line.split('|') {
        let (name, typ) = field.split_once('!').ok_or(KegError::Malformed {
            what: "psv header",
            detail: format!("field {:?} has no !TYPE:N tag", field),
        })?;
        if name.is_empty() || !typ.contains(':') {
            return Err(KegError::Malformed {
                what: "psv header",
                detail: format!("field {:?} is not Name!TYPE:N", field),
            });
        }
        columns.push(Column {
            name: name.to_string(),
            typ: typ.to_string(),
        });
    }
    Ok(columns)
}

#[cfg(test)]
mod test_psv {
    use super::*;

    #[test]
    fn two_rows_preserving_order() {
        let doc = Document::parse("Name!STRING:0|Path!STRING:0\na|b\nc|d\n").unwrap();

        assert_eq!(doc.columns.len(), 2);
        assert_eq!(doc.columns[0].name, "Name");
        assert_eq!(doc.columns[1].name, "Path");

        let rows: Vec<_> = doc.rows().collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("Name"), Some("a"));
        assert_eq!(rows[0].get("Path"), Some("b"));
        assert_eq!(rows[1].get("Name"), Some("c"));
        assert_eq!(rows[1].get("Path"), Some("d"));
    }

    #[test]
    fn seqn_meta_line() {
        let doc =
            Document::parse("Region!STRING:0\n## seqn = 43342\nus\n").unwrap();

        assert_eq!(doc.seqn, Some(43342));
        assert_eq!(doc.len(), 1);
    }

    #[test]
    fn trailing_blank_lines_ignored() {
        let doc = Document::parse("A!STRING:0\nx\n\n\n").unwrap();
        assert_eq!(doc.len(), 1);
    }

    #[test]
    fn unknown_column_is_none() {
        let doc = Document::parse("A!STRING:0\nx\n").unwrap();
        let rows: Vec<_> = doc.rows().collect();
        assert_eq!(rows[0].get("B"), None);
    }

    #[test]
    fn malformed_header_fails_hard() {
        assert!(Document::parse("NameWithoutType\nx\n").is_err());
        assert!(Document::parse("!STRING:0\nx\n").is_err());
        assert!(Document::parse("Name!NOCOLON\nx\n").is_err());
    }

    #[test]
    fn short_row_reports_row_number() {
        let err = Document::parse("A!STRING:0|B!STRING:0\na|b\nonly-one\n").unwrap_err();

        match err {
            KegError::Malformed { detail, .. } => assert!(detail.contains("row 3")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn write_parse_roundtrip() {
        let doc = Document::parse(
            "Name!STRING:0|Path!STRING:0|Hosts!STRING:0\n## seqn = 7\na|b c|d\ne|f|g\n",
        )
        .unwrap();

        let reparsed = Document::parse(&doc.write()).unwrap();
        assert_eq!(reparsed, doc);
    }
}
