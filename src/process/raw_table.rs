use csv::ReaderBuilder;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Every table inside a DERA archive is tab-separated with a header row.
pub const FIELD_DELIMITER: u8 = b'\t';

/// One staged table file, read as untyped text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTable {
    /// The staged file this came from; only used for error messages.
    pub path: PathBuf,
    /// Column names from the header row.
    pub headers: Vec<String>,
    /// Each data row, one `String` per field. Empty strings are missing values.
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Values of column `idx`, top to bottom.
    pub fn column(&self, idx: usize) -> impl Iterator<Item = &str> {
        self.rows.iter().map(move |r| r[idx].as_str())
    }
}

/// Read a staged `.tsv` file into memory.
pub fn read_tsv(path: impl AsRef<Path>) -> Result<RawTable> {
    let path = path.as_ref();
    let mut rdr = ReaderBuilder::new()
        .delimiter(FIELD_DELIMITER)
        .has_headers(true)
        .from_path(path)?;

    let headers = rdr.headers()?.iter().map(|h| h.trim().to_string()).collect();
    let mut rows = Vec::new();
    for record in rdr.records() {
        rows.push(record?.iter().map(str::to_string).collect());
    }

    Ok(RawTable {
        path: path.to_path_buf(),
        headers,
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn reads_header_and_rows() -> anyhow::Result<()> {
        let mut f = NamedTempFile::new()?;
        write!(f, "adsh\tcik\tname\n0001\t42\tACME\n0002\t\tBETA CORP\n")?;
        let t = read_tsv(f.path())?;
        assert_eq!(t.headers, ["adsh", "cik", "name"]);
        assert_eq!(t.rows.len(), 2);
        assert_eq!(t.rows[1], ["0002", "", "BETA CORP"]);
        assert_eq!(t.column_index("cik"), Some(1));
        assert_eq!(t.column(1).collect::<Vec<_>>(), ["42", ""]);
        Ok(())
    }

    #[test]
    fn ragged_rows_are_an_error() -> anyhow::Result<()> {
        let mut f = NamedTempFile::new()?;
        write!(f, "a\tb\n1\t2\t3\n")?;
        assert!(read_tsv(f.path()).is_err());
        Ok(())
    }
}
