// src/lib.rs
//! Download SEC DERA releases for a date range and merge one of their
//! tables into a single Arrow table.

pub mod config;
pub mod error;
pub mod fetch;
pub mod period;
pub mod pipeline;
pub mod process;

pub use config::{Config, Dtype, DtypeOverrides, FetchOptions};
pub use error::{Error, FetchFailure, Result};
pub use pipeline::{MergeRequest, Request};
