use arrow::{
    array::{new_null_array, ArrayRef, BooleanBuilder, Float64Builder, Int64Builder, StringBuilder},
    datatypes::{DataType, Field, Schema, SchemaRef},
    record_batch::{RecordBatch, RecordBatchOptions},
};
use std::{collections::HashMap, sync::Arc};
use tracing::debug;

use super::raw_table::RawTable;
use crate::config::{Dtype, DtypeOverrides};
use crate::error::{Error, Result};

pub fn arrow_type(dtype: Dtype) -> DataType {
    match dtype {
        Dtype::Utf8 => DataType::Utf8,
        Dtype::Int64 => DataType::Int64,
        Dtype::Float64 => DataType::Float64,
        Dtype::Boolean => DataType::Boolean,
    }
}

/// Largest magnitude at which every integer is exactly representable as f64.
const F64_EXACT_INT: i64 = 1 << 53;

/// What one column's values allow, before any override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Guess {
    /// `None` while every value seen so far was empty.
    dtype: Option<Dtype>,
    /// Some integer could not be stored in an f64 without rounding.
    wide_ints: bool,
}

impl Guess {
    fn text() -> Self {
        Guess {
            dtype: Some(Dtype::Utf8),
            wide_ints: false,
        }
    }

    /// Int64 folded into Float64 is only allowed when no integer loses bits.
    fn join(self, other: Guess) -> std::result::Result<Guess, (Dtype, Dtype)> {
        let wide_ints = self.wide_ints || other.wide_ints;
        let dtype = match (self.dtype, other.dtype) {
            (None, t) | (t, None) => t,
            (Some(a), Some(b)) if a == b => Some(a),
            (Some(Dtype::Int64), Some(Dtype::Float64))
            | (Some(Dtype::Float64), Some(Dtype::Int64)) => {
                if wide_ints {
                    return Err((Dtype::Int64, Dtype::Float64));
                }
                Some(Dtype::Float64)
            }
            (Some(a), Some(b)) => return Err((a, b)),
        };
        Ok(Guess { dtype, wide_ints })
    }
}

/// Classify one non-empty value. A value is only numeric if printing the
/// parsed number gives back the exact same text, so `0001`, `1.50` or
/// `+3` stay text.
fn infer_value(s: &str) -> Guess {
    if let Ok(n) = s.parse::<i64>() {
        if n.to_string() == s {
            return Guess {
                dtype: Some(Dtype::Int64),
                wide_ints: n.unsigned_abs() > F64_EXACT_INT as u64,
            };
        }
        return Guess::text();
    }
    match s.parse::<f64>() {
        Ok(f) if f.is_finite() && f.to_string() == s => Guess {
            dtype: Some(Dtype::Float64),
            wide_ints: false,
        },
        _ => Guess::text(),
    }
}

fn guess_column<'a>(values: impl Iterator<Item = &'a str>) -> Guess {
    let mut seen = Guess::default();
    for v in values.filter(|v| !v.is_empty()) {
        seen = seen.join(infer_value(v)).unwrap_or_else(|_| Guess::text());
        if seen.dtype == Some(Dtype::Utf8) {
            break;
        }
    }
    seen
}

/// Infer a column's type from its values. `None` means every value was empty.
///
/// Within one file, integers mixed with decimals are decimals and anything
/// mixed with text is text.
pub fn infer_column<'a>(values: impl Iterator<Item = &'a str>) -> Option<Dtype> {
    guess_column(values).dtype
}

/// Combine the types one column was given by two different files.
///
/// An all-empty column takes the other side's type and integers widen to
/// decimals. Anything else is a conflict the caller must settle with an
/// override.
fn unify(column: &str, left: Guess, right: Guess) -> Result<Guess> {
    left.join(right).map_err(|(a, b)| Error::SchemaMismatch {
        column: column.to_string(),
        left: a.to_string(),
        right: b.to_string(),
    })
}

/// Build the schema shared by every table: the union of their columns in
/// first-seen order, each typed by its override or by inference.
pub fn unify_schema(tables: &[RawTable], overrides: &DtypeOverrides) -> Result<SchemaRef> {
    let mut order: Vec<String> = Vec::new();
    let mut types: HashMap<String, Guess> = HashMap::new();

    for table in tables {
        for (idx, name) in table.headers.iter().enumerate() {
            if !types.contains_key(name) {
                order.push(name.clone());
                types.insert(name.clone(), Guess::default());
            }
            if overrides.contains_key(name) {
                continue;
            }
            let inferred = guess_column(table.column(idx));
            let current = types.get(name).copied().unwrap_or_default();
            let merged = unify(name, current, inferred)?;
            types.insert(name.clone(), merged);
        }
    }

    for name in overrides.keys().filter(|k| !types.contains_key(*k)) {
        debug!(column = %name, "dtype override names a column no table has");
    }

    let fields: Vec<Field> = order
        .iter()
        .map(|name| {
            let dtype = overrides
                .get(name)
                .copied()
                .or_else(|| types.get(name).and_then(|g| g.dtype))
                .unwrap_or(Dtype::Utf8);
            Field::new(name, arrow_type(dtype), true)
        })
        .collect();

    Ok(Arc::new(Schema::new(fields)))
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "true" | "t" | "1" | "yes" | "y" => Some(true),
        "false" | "f" | "0" | "no" | "n" => Some(false),
        _ => None,
    }
}

fn build_column(table: &RawTable, idx: usize, field: &Field) -> Result<ArrayRef> {
    let bad = |value: &str| Error::InvalidValue {
        file: table.path.clone(),
        column: field.name().clone(),
        value: value.to_string(),
        dtype: field.data_type().to_string(),
    };
    let n = table.rows.len();

    let array: ArrayRef = match field.data_type() {
        DataType::Int64 => {
            let mut b = Int64Builder::with_capacity(n);
            for v in table.column(idx) {
                if v.is_empty() {
                    b.append_null();
                } else {
                    b.append_value(v.trim().parse().map_err(|_| bad(v))?);
                }
            }
            Arc::new(b.finish())
        }
        DataType::Float64 => {
            let mut b = Float64Builder::with_capacity(n);
            for v in table.column(idx) {
                if v.is_empty() {
                    b.append_null();
                } else {
                    b.append_value(v.trim().parse().map_err(|_| bad(v))?);
                }
            }
            Arc::new(b.finish())
        }
        DataType::Boolean => {
            let mut b = BooleanBuilder::with_capacity(n);
            for v in table.column(idx) {
                if v.is_empty() {
                    b.append_null();
                } else {
                    b.append_value(parse_bool(v.trim()).ok_or_else(|| bad(v))?);
                }
            }
            Arc::new(b.finish())
        }
        _ => {
            let mut b = StringBuilder::with_capacity(n, n * 16);
            for v in table.column(idx) {
                if v.is_empty() {
                    b.append_null();
                } else {
                    b.append_value(v);
                }
            }
            Arc::new(b.finish())
        }
    };
    Ok(array)
}

/// Convert one raw table to `schema`, null-filling columns it lacks.
pub fn to_record_batch(table: &RawTable, schema: &SchemaRef) -> Result<RecordBatch> {
    let n = table.rows.len();
    let columns = schema
        .fields()
        .iter()
        .map(|field| match table.column_index(field.name()) {
            Some(idx) => build_column(table, idx, field),
            None => Ok(new_null_array(field.data_type(), n)),
        })
        .collect::<Result<Vec<_>>>()?;

    let options = RecordBatchOptions::new().with_row_count(Some(n));
    Ok(RecordBatch::try_new_with_options(
        schema.clone(),
        columns,
        &options,
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn table(headers: &[&str], rows: &[&[&str]]) -> RawTable {
        RawTable {
            path: PathBuf::from("t.tsv"),
            headers: headers.iter().map(|s| s.to_string()).collect(),
            rows: rows
                .iter()
                .map(|r| r.iter().map(|s| s.to_string()).collect())
                .collect(),
        }
    }

    #[test]
    fn infers_numeric_and_text_columns() {
        assert_eq!(infer_column(["1", "", "42"].into_iter()), Some(Dtype::Int64));
        assert_eq!(infer_column(["1", "2.5"].into_iter()), Some(Dtype::Float64));
        assert_eq!(infer_column(["1", "abc"].into_iter()), Some(Dtype::Utf8));
        assert_eq!(infer_column(["NaN", "inf"].into_iter()), Some(Dtype::Utf8));
        assert_eq!(infer_column(["", ""].into_iter()), None);
    }

    #[test]
    fn values_that_would_be_rewritten_stay_text() {
        assert_eq!(infer_column(["0001", "2"].into_iter()), Some(Dtype::Utf8));
        assert_eq!(infer_column(["1.50"].into_iter()), Some(Dtype::Utf8));
        assert_eq!(infer_column(["+3"].into_iter()), Some(Dtype::Utf8));
        assert_eq!(infer_column(["1.10", "1.1"].into_iter()), Some(Dtype::Utf8));
        // beyond i64
        assert_eq!(
            infer_column(["12345678901234567890"].into_iter()),
            Some(Dtype::Utf8)
        );
        // fits i64 but not f64, so it may not be widened
        assert_eq!(
            infer_column(["9007199254740993", "0.5"].into_iter()),
            Some(Dtype::Utf8)
        );
        assert_eq!(
            infer_column(["9007199254740993"].into_iter()),
            Some(Dtype::Int64)
        );
    }

    #[test]
    fn wide_integers_do_not_widen_across_files() {
        let a = table(&["id"], &[&["9007199254740993"]]);
        let b = table(&["id"], &[&["0.5"]]);
        let err = unify_schema(&[a, b], &DtypeOverrides::new()).unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch { ref column, .. } if column == "id"));
    }

    #[test]
    fn widening_across_files() -> anyhow::Result<()> {
        let a = table(&["v", "w"], &[&["1", ""]]);
        let b = table(&["v", "w"], &[&["2.5", "x"]]);
        let schema = unify_schema(&[a, b], &DtypeOverrides::new())?;
        assert_eq!(schema.field(0).data_type(), &DataType::Float64);
        assert_eq!(schema.field(1).data_type(), &DataType::Utf8);
        Ok(())
    }

    #[test]
    fn conflicting_types_need_an_override() -> anyhow::Result<()> {
        let a = table(&["cik"], &[&["320193"]]);
        let b = table(&["cik"], &[&["n/a"]]);
        let err = unify_schema(&[a.clone(), b.clone()], &DtypeOverrides::new()).unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch { ref column, .. } if column == "cik"));

        let mut overrides = DtypeOverrides::new();
        overrides.insert("cik".into(), Dtype::Utf8);
        let schema = unify_schema(&[a, b], &overrides)?;
        assert_eq!(schema.field(0).data_type(), &DataType::Utf8);
        Ok(())
    }

    #[test]
    fn union_of_columns_in_first_seen_order() -> anyhow::Result<()> {
        let a = table(&["x", "y"], &[&["1", "a"]]);
        let b = table(&["y", "z"], &[&["b", "2"]]);
        let schema = unify_schema(&[a.clone(), b.clone()], &DtypeOverrides::new())?;
        let names: Vec<_> = schema.fields().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(names, ["x", "y", "z"]);

        let batch = to_record_batch(&b, &schema)?;
        assert_eq!(batch.num_rows(), 1);
        assert!(batch.column(0).is_null(0));
        Ok(())
    }

    #[test]
    fn override_that_does_not_fit_is_reported() -> anyhow::Result<()> {
        let a = table(&["ddate"], &[&["20200101"], &["soon"]]);
        let mut overrides = DtypeOverrides::new();
        overrides.insert("ddate".into(), Dtype::Int64);
        let schema = unify_schema(std::slice::from_ref(&a), &overrides)?;
        let err = to_record_batch(&a, &schema).unwrap_err();
        assert!(matches!(err, Error::InvalidValue { ref value, .. } if value == "soon"));
        Ok(())
    }

    #[test]
    fn boolean_override() -> anyhow::Result<()> {
        let a = table(&["prevrpt"], &[&["1"], &["0"], &[""]]);
        let mut overrides = DtypeOverrides::new();
        overrides.insert("prevrpt".into(), Dtype::Boolean);
        let schema = unify_schema(std::slice::from_ref(&a), &overrides)?;
        let batch = to_record_batch(&a, &schema)?;
        assert_eq!(batch.column(0).data_type(), &DataType::Boolean);
        assert_eq!(batch.column(0).null_count(), 1);
        Ok(())
    }
}
