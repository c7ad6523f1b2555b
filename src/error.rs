// src/error.rs

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Errors raised by the resolve → extract → merge path.
///
/// Per-URL download failures are *not* in here: they are recorded on each
/// [`FetchOutcome`](crate::fetch::FetchOutcome) as a [`FetchFailure`] and the
/// batch keeps going.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot parse {0:?} as a calendar date")]
    InvalidDateFormat(String),

    #[error("start date {start} is after end date {end}")]
    EmptyDateRange {
        start: chrono::NaiveDate,
        end: chrono::NaiveDate,
    },

    #[error("{0:?} is not a period token (expected YYYYqN or YYYY_MM)")]
    InvalidPeriodToken(String),

    #[error("unknown dataset kind {0:?}")]
    UnknownDatasetKind(String),

    #[error("unknown table {0:?}")]
    UnknownTable(String),

    #[error("unknown dtype {0:?}")]
    UnknownDtype(String),

    #[error("member {member:?} not found in archive {}", .archive.display())]
    MemberNotFound { archive: PathBuf, member: String },

    #[error("cannot open archive {}: {reason}", .archive.display())]
    CorruptArchive { archive: PathBuf, reason: String },

    #[error("column {column:?} has conflicting types {left} and {right} across releases")]
    SchemaMismatch {
        column: String,
        left: String,
        right: String,
    },

    #[error("{} has no {column:?} column", .file.display())]
    MissingKeyColumn { file: PathBuf, column: String },

    #[error("{}: value {value:?} in column {column:?} is not a valid {dtype}", .file.display())]
    InvalidValue {
        file: PathBuf,
        column: String,
        value: String,
        dtype: String,
    },

    #[error("no releases between {start} and {end} found in {source_desc}")]
    NoRelevantReleases {
        start: chrono::NaiveDate,
        end: chrono::NaiveDate,
        source_desc: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Arrow(#[from] arrow::error::ArrowError),

    #[error(transparent)]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse class of a transport-level failure, used for retry decisions and
/// for the outcome log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportClass {
    Timeout,
    Connect,
    Tls,
    Body,
    Other,
}

impl std::fmt::Display for TransportClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportClass::Timeout => "timeout",
            TransportClass::Connect => "connect",
            TransportClass::Tls => "tls",
            TransportClass::Body => "body",
            TransportClass::Other => "other",
        };
        f.write_str(s)
    }
}

/// Why a single URL was abandoned.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetchFailure {
    #[error("HTTP {status}")]
    Http { status: u16 },

    #[error("{class} error: {message}")]
    Transport {
        class: TransportClass,
        message: String,
    },

    #[error("write failed: {message}")]
    Io { message: String },

    #[error("cancelled")]
    Cancelled,

    #[error("download task panicked: {message}")]
    TaskPanicked { message: String },
}
