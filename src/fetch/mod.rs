// src/fetch/mod.rs

pub mod urls;
pub mod zips;

pub use urls::{DatasetDescriptor, DatasetKind, DatasetRegistry, ManifestEntry, DERA_DATA_URL};
pub use zips::{
    build_client, fetch_batch, fetch_one, is_retryable, FetchOutcome, FetchReport, FetchedFile,
    RETRYABLE_STATUSES,
};
