// src/process/mod.rs
//! Turning downloaded release archives into one merged table.
//!
//! `extract` stages a member out of each archive, `raw_table` reads the
//! staged TSVs, `schema` types their columns and `merge` combines them.

pub mod extract;
pub mod merge;
pub mod raw_table;
pub mod schema;

pub use extract::{extract, stage_release};
pub use merge::{merge, merge_tables, staged_files, MergedTable, Table, TableKind};
pub use raw_table::{read_tsv, RawTable};
pub use schema::{to_record_batch, unify_schema};
