// src/config.rs

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, fs, path::Path, str::FromStr, time::Duration};

use crate::error::{Error, Result};

/// Identifies us to the clearinghouse; sec.gov rejects anonymous clients.
pub const DEFAULT_USER_AGENT: &str = concat!("derascraper/", env!("CARGO_PKG_VERSION"));

/// Tuning for [`fetch_batch`](crate::fetch::fetch_batch).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchOptions {
    /// Write buffer size for streamed bodies, in bytes.
    pub chunk_size: usize,
    /// Seconds allowed for establishing a connection.
    #[serde(with = "secs")]
    pub connect_timeout: Duration,
    /// Seconds allowed for a whole request, body included.
    #[serde(with = "secs")]
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before retry `n` is `backoff_base * 2^(n-1)`.
    #[serde(with = "secs")]
    pub backoff_base: Duration,
    /// Downloads in flight at once.
    pub concurrency: usize,
    pub user_agent: String,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            chunk_size: 128,
            connect_timeout: Duration::from_secs(5),
            timeout: Duration::from_secs(120),
            max_retries: 2,
            backoff_base: Duration::from_secs(1),
            concurrency: 3,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl FetchOptions {
    /// Delay to wait before retry number `retry` (1-based).
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.backoff_base.saturating_mul(factor)
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Column types a caller may force onto a staged table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Dtype {
    Utf8,
    Int64,
    Float64,
    Boolean,
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Dtype::Utf8 => "str",
            Dtype::Int64 => "int64",
            Dtype::Float64 => "float64",
            Dtype::Boolean => "bool",
        };
        f.write_str(s)
    }
}

impl FromStr for Dtype {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "str" | "string" | "object" | "utf8" => Ok(Dtype::Utf8),
            "int" | "int64" => Ok(Dtype::Int64),
            "float" | "float64" => Ok(Dtype::Float64),
            "bool" | "boolean" => Ok(Dtype::Boolean),
            _ => Err(Error::UnknownDtype(s.to_string())),
        }
    }
}

impl TryFrom<String> for Dtype {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Dtype> for String {
    fn from(d: Dtype) -> Self {
        d.to_string()
    }
}

/// Column name → forced type.
pub type DtypeOverrides = BTreeMap<String, Dtype>;

/// Parse a `column=type` pair as given on the command line.
pub fn parse_dtype_pair(s: &str) -> Result<(String, Dtype)> {
    let (col, ty) = s
        .split_once('=')
        .ok_or_else(|| Error::Config(format!("expected COLUMN=TYPE, got {:?}", s)))?;
    let col = col.trim();
    if col.is_empty() {
        return Err(Error::Config(format!("empty column name in {:?}", s)));
    }
    Ok((col.to_string(), ty.parse()?))
}

/// Parse a non-negative number of seconds, e.g. `0.5` or `120`.
pub fn parse_secs(s: &str) -> Result<Duration> {
    let secs: f64 = s
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("expected seconds, got {:?}", s)))?;
    Duration::try_from_secs_f64(secs)
        .map_err(|e| Error::Config(format!("{:?} is not a usable duration: {}", s, e)))
}

/// Optional YAML settings file.
///
/// ```yaml
/// base_url: https://www.sec.gov/files/dera/data
/// fetch:
///   max_retries: 4
///   backoff_base: 0.5
/// dtype:
///   adsh: str
///   cik: int64
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub base_url: Option<String>,
    pub fetch: FetchOptions,
    pub dtype: DtypeOverrides,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        serde_yaml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }
}
