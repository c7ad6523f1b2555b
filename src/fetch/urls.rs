// src/fetch/urls.rs

use chrono::NaiveDate;
use serde::Serialize;
use std::str::FromStr;
use url::Url;

use crate::error::{Error, Result};
use crate::period::{self, PeriodToken};

/// Root of every DERA dataset on sec.gov.
pub const DERA_DATA_URL: &str = "https://www.sec.gov/files/dera/data";

/// The datasets we know how to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    /// Mutual Fund Prospectus Risk and Return Summary.
    Risk,
    /// Financial Statements and Notes.
    Statements,
}

impl DatasetKind {
    pub const ALL: [DatasetKind; 2] = [DatasetKind::Risk, DatasetKind::Statements];

    pub fn name(&self) -> &'static str {
        match self {
            DatasetKind::Risk => "risk",
            DatasetKind::Statements => "statements",
        }
    }
}

impl FromStr for DatasetKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        DatasetKind::ALL
            .into_iter()
            .find(|k| k.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::UnknownDatasetKind(s.to_string()))
    }
}

/// Static facts about one dataset: where it lives, how its files are named,
/// and when (if ever) it went monthly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetDescriptor {
    pub kind: DatasetKind,
    /// Path under the base URL, without leading or trailing slash.
    pub path: &'static str,
    /// Appended to the period token to form the archive name.
    pub suffix: &'static str,
    /// First day of monthly releases.
    pub cutover: Option<NaiveDate>,
}

impl DatasetDescriptor {
    pub fn filename(&self, token: &PeriodToken) -> String {
        format!("{}{}", token, self.suffix)
    }

    /// Turn a date range into this dataset's release tokens.
    pub fn resolve(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<PeriodToken>> {
        period::resolve_with_cutover(start, end, self.cutover)
    }
}

fn builtin(kind: DatasetKind) -> DatasetDescriptor {
    match kind {
        DatasetKind::Risk => DatasetDescriptor {
            kind,
            path: "mutual-fund-prospectus-risk/return-summary-data-sets/zipfile",
            suffix: "_rr1.zip",
            cutover: None,
        },
        DatasetKind::Statements => DatasetDescriptor {
            kind,
            path: "financial-statement-and-notes-data-sets/zipfile",
            suffix: "_notes.zip",
            cutover: NaiveDate::from_ymd_opt(2020, 10, 1),
        },
    }
}

/// One release ready to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    pub token: PeriodToken,
    pub filename: String,
    pub url: String,
}

/// Dataset descriptors bound to a base URL.
#[derive(Debug, Clone)]
pub struct DatasetRegistry {
    base: Url,
    datasets: Vec<DatasetDescriptor>,
}

impl Default for DatasetRegistry {
    fn default() -> Self {
        Self::with_base_url(DERA_DATA_URL).expect("default base URL is valid")
    }
}

impl DatasetRegistry {
    /// Registry for the built-in datasets served from `base` instead of sec.gov.
    pub fn with_base_url(base: &str) -> Result<Self> {
        let mut base = base.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base = Url::parse(&base)
            .map_err(|e| Error::Config(format!("invalid base URL {:?}: {}", base, e)))?;
        Ok(Self {
            base,
            datasets: DatasetKind::ALL.into_iter().map(builtin).collect(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub fn get(&self, kind: DatasetKind) -> Result<&DatasetDescriptor> {
        self.datasets
            .iter()
            .find(|d| d.kind == kind)
            .ok_or_else(|| Error::UnknownDatasetKind(kind.name().to_string()))
    }

    /// Look a dataset up by its name (`risk`, `statements`).
    pub fn lookup(&self, name: &str) -> Result<&DatasetDescriptor> {
        self.get(name.parse()?)
    }

    /// Map each token to its archive name and download URL.
    pub fn build(&self, tokens: &[PeriodToken], kind: DatasetKind) -> Result<Vec<ManifestEntry>> {
        let ds = self.get(kind)?;
        let dir = self
            .base
            .join(&format!("{}/", ds.path))
            .map_err(|e| Error::Config(format!("cannot join {:?}: {}", ds.path, e)))?;

        tokens
            .iter()
            .map(|token| {
                let filename = ds.filename(token);
                let url = dir
                    .join(&filename)
                    .map_err(|e| Error::Config(format!("cannot join {:?}: {}", filename, e)))?;
                Ok(ManifestEntry {
                    token: *token,
                    filename,
                    url: url.to_string(),
                })
            })
            .collect()
    }
}
