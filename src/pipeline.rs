// src/pipeline.rs
//! Date range in, merged table out.

use chrono::NaiveDate;
use reqwest::Client;
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::{DtypeOverrides, FetchOptions};
use crate::error::{Error, Result};
use crate::fetch::{fetch_batch, DatasetDescriptor, DatasetRegistry, FetchReport, ManifestEntry};
use crate::period::parse_range;
use crate::process::{merge, stage_release, MergedTable, Table};

/// Which releases to pull: a dataset and a date range as typed by the user.
/// `end` defaults to today.
#[derive(Debug, Clone)]
pub struct Request {
    pub dataset: DatasetDescriptor,
    pub start: String,
    pub end: Option<String>,
}

impl Request {
    pub fn dates(&self) -> Result<(NaiveDate, NaiveDate)> {
        parse_range(&self.start, self.end.as_deref())
    }
}

/// Which table to merge out of the releases, and how.
#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub table: Table,
    pub overrides: DtypeOverrides,
    /// Where the per-run scratch directory is created; the system temp
    /// directory when unset.
    pub scratch_root: Option<PathBuf>,
}

impl MergeRequest {
    pub fn new(table: Table) -> Self {
        Self {
            table,
            overrides: DtypeOverrides::new(),
            scratch_root: None,
        }
    }

    pub fn with_overrides(mut self, overrides: DtypeOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    fn scratch(&self) -> Result<TempDir> {
        Ok(match &self.scratch_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                TempDir::new_in(root)?
            }
            None => TempDir::new()?,
        })
    }
}

/// Resolve the request and list the releases it covers.
pub fn manifest(registry: &DatasetRegistry, req: &Request) -> Result<Vec<ManifestEntry>> {
    let (start, end) = req.dates()?;
    let tokens = req.dataset.resolve(start, end)?;
    registry.build(&tokens, req.dataset.kind)
}

/// Archives in `source_dir` belonging to the requested releases.
fn select_archives(source_dir: &Path, req: &Request) -> Result<Vec<PathBuf>> {
    let (start, end) = req.dates()?;
    let wanted: HashSet<String> = req
        .dataset
        .resolve(start, end)?
        .iter()
        .map(|t| req.dataset.filename(t))
        .collect();

    // the directory is literal; only the file name is a pattern
    let dir = glob::Pattern::escape(&source_dir.to_string_lossy());
    let pattern = Path::new(&dir).join(format!("*{}", req.dataset.suffix));
    let pattern = pattern.to_string_lossy();
    let entries =
        glob::glob(&pattern).map_err(|e| Error::Config(format!("bad pattern {}: {}", pattern, e)))?;

    let mut found = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| Error::Io(e.into_error()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if wanted.contains(&name) {
            found.push(path);
        }
    }

    if found.is_empty() {
        return Err(Error::NoRelevantReleases {
            start,
            end,
            source_desc: source_dir.display().to_string(),
        });
    }
    info!(wanted = wanted.len(), found = found.len(), "selected archives");
    Ok(found)
}

/// Stage the table out of each archive and merge the lot.
///
/// The scratch directory is removed when this returns, whether or not the
/// merge succeeded.
fn assemble_archives(archives: &[PathBuf], plan: &MergeRequest) -> Result<MergedTable> {
    let scratch = plan.scratch()?;
    let member = plan.table.member();
    for archive in archives {
        let release = archive
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        stage_release(archive, &release, &member, scratch.path())?;
    }
    merge(scratch.path(), plan.table.kind(), &plan.overrides)
}

/// Merge one table across the archives already present in `source_dir`.
#[instrument(level = "info", skip(req, plan), fields(dataset = req.dataset.kind.name(), table = plan.table.name()))]
pub fn assemble(source_dir: &Path, req: &Request, plan: &MergeRequest) -> Result<MergedTable> {
    let archives = select_archives(source_dir, req)?;
    assemble_archives(&archives, plan)
}

/// Download every release the request covers into `target_dir`.
pub async fn download(
    client: &Client,
    registry: &DatasetRegistry,
    req: &Request,
    target_dir: &Path,
    opts: &FetchOptions,
    cancel: &CancellationToken,
) -> Result<FetchReport> {
    let urls: Vec<String> = manifest(registry, req)?
        .into_iter()
        .map(|m| m.url)
        .collect();
    fetch_batch(client, &urls, target_dir, opts, cancel).await
}

/// Download, then merge whatever arrived.
///
/// Releases that failed to download are left out of the merge; the report
/// says which. If none arrived the merge fails with `NoRelevantReleases`.
pub async fn download_and_assemble(
    client: &Client,
    registry: &DatasetRegistry,
    req: &Request,
    plan: &MergeRequest,
    target_dir: &Path,
    opts: &FetchOptions,
    cancel: &CancellationToken,
) -> Result<(FetchReport, MergedTable)> {
    let report = download(client, registry, req, target_dir, opts, cancel).await?;
    let archives = report.paths();
    if archives.is_empty() {
        let (start, end) = req.dates()?;
        return Err(Error::NoRelevantReleases {
            start,
            end,
            source_desc: registry.base_url().to_string(),
        });
    }
    let failed = report.failed().count();
    if failed > 0 {
        warn!(failed, merged = archives.len(), "merging without failed releases");
    }

    // merging is CPU-bound; keep it off the runtime threads
    let plan = plan.clone();
    let merged = tokio::task::spawn_blocking(move || assemble_archives(&archives, &plan))
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))??;
    Ok((report, merged))
}
