use arrow::{
    array::{Array, ArrayRef, AsArray, BooleanArray},
    datatypes::{DataType, Float64Type},
    compute::{concat_batches, filter_record_batch},
    record_batch::RecordBatch,
    util::display::array_value_to_string,
};
use once_cell::sync::Lazy;
use parquet::{arrow::ArrowWriter, basic::Compression, file::properties::WriterProperties};
use rayon::prelude::*;
use regex::Regex;
use serde::Serialize;
use std::{
    collections::HashSet,
    fs::{self, File},
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{info, instrument};

use super::raw_table::{read_tsv, RawTable};
use super::schema::{to_record_batch, unify_schema};
use crate::config::DtypeOverrides;
use crate::error::{Error, Result};
use crate::period::PeriodToken;

/// How staged tables of one kind are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    /// Keyed by (tag, version); the first release to define a key wins.
    TagLike,
    /// Keyed by accession number; every release's rows are kept.
    KeyIndexed,
    /// No key; all rows, in release order.
    Flat,
}

impl TableKind {
    pub fn key_columns(&self) -> &'static [&'static str] {
        match self {
            TableKind::TagLike => &["tag", "version"],
            TableKind::KeyIndexed => &["adsh"],
            TableKind::Flat => &[],
        }
    }
}

/// The tables found inside a DERA release archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Sub,
    Tag,
    Num,
    Txt,
    Pre,
    Cal,
    Lab,
    Dim,
    Ren,
}

impl Table {
    pub const ALL: [Table; 9] = [
        Table::Sub,
        Table::Tag,
        Table::Num,
        Table::Txt,
        Table::Pre,
        Table::Cal,
        Table::Lab,
        Table::Dim,
        Table::Ren,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Table::Sub => "sub",
            Table::Tag => "tag",
            Table::Num => "num",
            Table::Txt => "txt",
            Table::Pre => "pre",
            Table::Cal => "cal",
            Table::Lab => "lab",
            Table::Dim => "dim",
            Table::Ren => "ren",
        }
    }

    /// Archive member holding this table.
    pub fn member(&self) -> String {
        format!("{}.tsv", self.name())
    }

    pub fn kind(&self) -> TableKind {
        match self {
            Table::Tag => TableKind::TagLike,
            Table::Sub => TableKind::KeyIndexed,
            _ => TableKind::Flat,
        }
    }
}

impl FromStr for Table {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Table::ALL
            .into_iter()
            .find(|t| t.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::UnknownTable(s.to_string()))
    }
}

/// The combined table.
#[derive(Debug, Clone)]
pub struct MergedTable {
    kind: TableKind,
    keys: Vec<String>,
    batch: RecordBatch,
    dropped_duplicates: usize,
}

impl MergedTable {
    pub fn kind(&self) -> TableKind {
        self.kind
    }

    /// Columns forming the row key; empty for flat tables.
    pub fn key_columns(&self) -> &[String] {
        &self.keys
    }

    pub fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    pub fn into_batch(self) -> RecordBatch {
        self.batch
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn num_columns(&self) -> usize {
        self.batch.num_columns()
    }

    /// Rows removed by the tag-like first-wins rule.
    pub fn dropped_duplicates(&self) -> usize {
        self.dropped_duplicates
    }

    /// A column rendered as text; `None` entries are missing values.
    pub fn column_strings(&self, name: &str) -> Result<Vec<Option<String>>> {
        let col = self
            .batch
            .column_by_name(name)
            .ok_or_else(|| Error::MissingKeyColumn {
                file: PathBuf::from("<merged>"),
                column: name.to_string(),
            })?;
        display_column(col)
    }

    /// The key of row `row`.
    pub fn key_at(&self, row: usize) -> Result<Vec<Option<String>>> {
        self.key_arrays()?
            .iter()
            .map(|col| cell(col, row))
            .collect()
    }

    /// Indices of every row whose key equals `key`.
    pub fn rows_with_key(&self, key: &[&str]) -> Result<Vec<usize>> {
        let cols = self.key_arrays()?;
        let mut hits = Vec::new();
        'rows: for row in 0..self.num_rows() {
            for (col, want) in cols.iter().zip(key) {
                if cell(col, row)?.as_deref() != Some(*want) {
                    continue 'rows;
                }
            }
            hits.push(row);
        }
        Ok(hits)
    }

    fn key_arrays(&self) -> Result<Vec<&ArrayRef>> {
        self.keys
            .iter()
            .map(|k| {
                self.batch
                    .column_by_name(k)
                    .ok_or_else(|| Error::MissingKeyColumn {
                        file: PathBuf::from("<merged>"),
                        column: k.clone(),
                    })
            })
            .collect()
    }

    /// Persist the table as a single snappy-compressed Parquet file.
    pub fn write_parquet(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let mut writer = ArrowWriter::try_new(file, self.batch.schema(), Some(props))?;
        writer.write(&self.batch)?;
        writer.close()?;
        Ok(())
    }
}

fn cell(col: &ArrayRef, row: usize) -> Result<Option<String>> {
    if col.is_null(row) {
        Ok(None)
    } else {
        match col.data_type() {
            // same text the value was inferred from
            DataType::Float64 => Ok(Some(col.as_primitive::<Float64Type>().value(row).to_string())),
            _ => Ok(Some(array_value_to_string(col, row)?)),
        }
    }
}

fn display_column(col: &ArrayRef) -> Result<Vec<Option<String>>> {
    (0..col.len()).map(|row| cell(col, row)).collect()
}

static RELEASE_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4}q[1-4]|\d{4}_\d{2})").expect("release prefix regex"));

fn release_of(path: &Path) -> Option<PeriodToken> {
    let name = path.file_name()?.to_str()?;
    RELEASE_PREFIX.find(name)?.as_str().parse().ok()
}

/// Regular files in `dir`, oldest release first.
///
/// Staged names start with their release token, so files are ordered by
/// that token and then by name. Files without a token go last.
pub fn staged_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort_by_cached_key(|p| {
        let token = release_of(p);
        (token.is_none(), token, p.file_name().map(|n| n.to_os_string()))
    });
    Ok(files)
}

/// Read every staged file in `staged_dir` and combine them under `kind`.
#[instrument(level = "info", skip(staged_dir, overrides), fields(dir = %staged_dir.display()))]
pub fn merge(staged_dir: &Path, kind: TableKind, overrides: &DtypeOverrides) -> Result<MergedTable> {
    let files = staged_files(staged_dir)?;
    // parse in parallel; collect keeps listing order
    let tables = files
        .par_iter()
        .map(|p| read_tsv(p))
        .collect::<Result<Vec<RawTable>>>()?;
    merge_tables(&tables, kind, overrides)
}

/// Combine already-read tables, in the order given.
pub fn merge_tables(
    tables: &[RawTable],
    kind: TableKind,
    overrides: &DtypeOverrides,
) -> Result<MergedTable> {
    let keys = kind.key_columns();
    for table in tables {
        if let Some(missing) = keys.iter().find(|k| table.column_index(k).is_none()) {
            return Err(Error::MissingKeyColumn {
                file: table.path.clone(),
                column: missing.to_string(),
            });
        }
    }

    let schema = unify_schema(tables, overrides)?;
    let batches = tables
        .iter()
        .map(|t| to_record_batch(t, &schema))
        .collect::<Result<Vec<_>>>()?;
    let batch = concat_batches(&schema, &batches)?;

    let (batch, dropped) = match kind {
        TableKind::TagLike => keep_first(batch, tables, keys)?,
        TableKind::KeyIndexed | TableKind::Flat => (batch, 0),
    };
    info!(
        files = tables.len(),
        rows = batch.num_rows(),
        dropped_duplicates = dropped,
        "merged"
    );

    Ok(MergedTable {
        kind,
        keys: keys.iter().map(|k| k.to_string()).collect(),
        batch,
        dropped_duplicates: dropped,
    })
}

/// Drop every row whose key was already seen earlier in the batch.
///
/// Keys are compared as the text the releases carried, so values that only
/// look alike once typed (`1.10` and `1.1`) stay distinct.
fn keep_first(
    batch: RecordBatch,
    tables: &[RawTable],
    keys: &[&str],
) -> Result<(RecordBatch, usize)> {
    let mut seen: HashSet<Vec<Option<&str>>> = HashSet::with_capacity(batch.num_rows());
    let mut keep = Vec::with_capacity(batch.num_rows());
    for table in tables {
        let idx = keys
            .iter()
            .map(|k| {
                table.column_index(k).ok_or_else(|| Error::MissingKeyColumn {
                    file: table.path.clone(),
                    column: k.to_string(),
                })
            })
            .collect::<Result<Vec<usize>>>()?;
        for row in &table.rows {
            let key = idx
                .iter()
                .map(|&i| Some(row[i].as_str()).filter(|v| !v.is_empty()))
                .collect();
            keep.push(seen.insert(key));
        }
    }

    let dropped = keep.iter().filter(|k| !**k).count();
    if dropped == 0 {
        return Ok((batch, 0));
    }
    let filtered = filter_record_batch(&batch, &BooleanArray::from(keep))?;
    Ok((filtered, dropped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Dtype;
    use arrow::datatypes::DataType;
    use tempfile::TempDir;

    fn stage(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).unwrap();
    }

    fn strings(t: &MergedTable, col: &str) -> Vec<Option<String>> {
        t.column_strings(col).unwrap()
    }

    fn s(v: &str) -> Option<String> {
        Some(v.to_string())
    }

    #[test]
    fn tag_like_keeps_first_release() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        stage(
            dir.path(),
            "2019q4_rr1_tag.tsv",
            "tag\tversion\tdummy_value\nAmendmentFlag\tdei/2014\tsecond\nAnnualReturn2006\trr/2012\tamet\n",
        );
        stage(
            dir.path(),
            "2019q3_rr1_tag.tsv",
            "tag\tversion\tdummy_value\nAmendmentFlag\tdei/2014\tfirst\nAmendmentFlag\tdei/2012\tipsum\n",
        );

        let t = merge(dir.path(), TableKind::TagLike, &DtypeOverrides::new())?;

        assert_eq!(t.key_columns(), ["tag", "version"]);
        assert_eq!(t.num_rows(), 3);
        assert_eq!(t.dropped_duplicates(), 1);
        let hits = t.rows_with_key(&["AmendmentFlag", "dei/2014"])?;
        assert_eq!(hits.len(), 1);
        assert_eq!(strings(&t, "dummy_value")[hits[0]], s("first"));
        assert_eq!(
            strings(&t, "dummy_value"),
            [s("first"), s("ipsum"), s("amet")]
        );
        Ok(())
    }

    #[test]
    fn key_indexed_keeps_duplicates() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        stage(
            dir.path(),
            "2019q3_rr1_sub.tsv",
            "adsh\tdummy_val\n0000000001-01-000001\tlorem2019q3\n0000000001-01-000002\t\n",
        );
        stage(
            dir.path(),
            "2019q4_rr1_sub.tsv",
            "adsh\tdummy_val\n0000000001-01-000001\tlorem2019q4\n",
        );

        let t = merge(dir.path(), TableKind::KeyIndexed, &DtypeOverrides::new())?;

        assert_eq!(t.num_rows(), 3);
        assert_eq!(t.dropped_duplicates(), 0);
        let hits = t.rows_with_key(&["0000000001-01-000001"])?;
        assert_eq!(hits, [0, 2]);
        assert_eq!(t.key_at(1)?, [s("0000000001-01-000002")]);
        assert_eq!(
            strings(&t, "dummy_val"),
            [s("lorem2019q3"), None, s("lorem2019q4")]
        );
        Ok(())
    }

    #[test]
    fn flat_round_trip_of_one_file() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let body = "adsh\tcoreg\tvalue\tline\tcode\tamount\tid\tratio\n\
            0000320193-19-000001\t\tAlpha beta\t1\t0001\t1.50\t12345678901234567890\t0.25\n\
            0000320193-19-000002\tX\tGamma\t2\t0002\t2\t12345678901234567891\t-3.5\n\
            0000320193-19-000003\t\tDelta\t3\t0010\t10.0\t12345678901234567892\t2\n";
        stage(dir.path(), "2019q3_rr1_txt.tsv", body);

        let t = merge(dir.path(), TableKind::Flat, &DtypeOverrides::new())?;
        assert!(t.key_columns().is_empty());

        let source = read_tsv(dir.path().join("2019q3_rr1_txt.tsv"))?;
        for (idx, name) in source.headers.iter().enumerate() {
            let want: Vec<Option<String>> = source
                .column(idx)
                .map(|v| (!v.is_empty()).then(|| v.to_string()))
                .collect();
            assert_eq!(strings(&t, name), want, "column {name}");
        }
        let schema = t.batch().schema();
        assert_eq!(schema.field_with_name("line")?.data_type(), &DataType::Int64);
        assert_eq!(schema.field_with_name("ratio")?.data_type(), &DataType::Float64);
        for col in ["code", "amount", "id"] {
            assert_eq!(schema.field_with_name(col)?.data_type(), &DataType::Utf8, "{col}");
        }
        Ok(())
    }

    #[test]
    fn tag_like_keys_compare_as_written() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        stage(
            dir.path(),
            "2019q3_rr1_tag.tsv",
            "tag\tversion\tv\nFoo\t1.10\ta\nFoo\t1.1\tb\n",
        );
        stage(dir.path(), "2019q4_rr1_tag.tsv", "tag\tversion\tv\nFoo\t1.1\tc\n");

        let t = merge(dir.path(), TableKind::TagLike, &DtypeOverrides::new())?;
        assert_eq!(t.num_rows(), 2);
        assert_eq!(t.dropped_duplicates(), 1);
        assert_eq!(strings(&t, "version"), [s("1.10"), s("1.1")]);
        assert_eq!(strings(&t, "v"), [s("a"), s("b")]);
        Ok(())
    }

    #[test]
    fn flat_follows_release_order() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        stage(dir.path(), "2020q3_notes_txt.tsv", "v\nq3\n");
        stage(dir.path(), "2020_10_notes_txt.tsv", "v\nm10a\nm10b\n");
        stage(dir.path(), "2020q2_notes_txt.tsv", "v\nq2\n");

        let t = merge(dir.path(), TableKind::Flat, &DtypeOverrides::new())?;
        assert_eq!(
            strings(&t, "v"),
            [s("q2"), s("q3"), s("m10a"), s("m10b")]
        );
        Ok(())
    }

    #[test]
    fn overrides_apply_to_every_file() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        stage(dir.path(), "2019q3_rr1_sub.tsv", "adsh\tcik\n1\t320193\n");
        stage(dir.path(), "2019q4_rr1_sub.tsv", "adsh\tcik\n2\tABC\n");

        let err = merge(dir.path(), TableKind::KeyIndexed, &DtypeOverrides::new()).unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch { .. }));

        let mut overrides = DtypeOverrides::new();
        overrides.insert("cik".into(), Dtype::Utf8);
        overrides.insert("adsh".into(), Dtype::Utf8);
        let t = merge(dir.path(), TableKind::KeyIndexed, &overrides)?;
        assert_eq!(t.batch().schema().field_with_name("cik")?.data_type(), &DataType::Utf8);
        assert_eq!(strings(&t, "cik"), [s("320193"), s("ABC")]);
        Ok(())
    }

    #[test]
    fn missing_key_column_is_reported() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        stage(dir.path(), "2019q3_rr1_tag.tsv", "tag\tdatatype\nFoo\tmonetary\n");
        let err = merge(dir.path(), TableKind::TagLike, &DtypeOverrides::new()).unwrap_err();
        assert!(matches!(err, Error::MissingKeyColumn { ref column, .. } if column == "version"));
        Ok(())
    }

    #[test]
    fn writes_parquet() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        stage(dir.path(), "2019q3_rr1_sub.tsv", "adsh\tcik\n1\t42\n2\t43\n");
        let t = merge(dir.path(), TableKind::KeyIndexed, &DtypeOverrides::new())?;
        let out = dir.path().join("out").join("sub.parquet");
        t.write_parquet(&out)?;
        assert!(fs::metadata(&out)?.len() > 0);
        Ok(())
    }

    #[test]
    fn table_names() {
        assert_eq!("TAG".parse::<Table>().unwrap(), Table::Tag);
        assert_eq!(Table::Sub.member(), "sub.tsv");
        assert_eq!(Table::Sub.kind(), TableKind::KeyIndexed);
        assert_eq!(Table::Txt.kind(), TableKind::Flat);
        assert!(matches!("foo".parse::<Table>(), Err(Error::UnknownTable(_))));
    }
}
