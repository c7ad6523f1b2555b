use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use derascraper::{
    config::{parse_dtype_pair, parse_secs, Config, Dtype},
    fetch::{build_client, DatasetRegistry, FetchReport},
    pipeline::{self, MergeRequest, Request},
    process::{MergedTable, Table},
};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(author, version, about = "Fetch and merge SEC DERA datasets")]
struct Cli {
    /// YAML file with fetch options, a base URL and dtype overrides.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download every release in the range.
    Fetch {
        #[command(flatten)]
        range: RangeArgs,
        #[command(flatten)]
        fetch: FetchArgs,
    },
    /// Merge one table out of archives already on disk.
    Assemble {
        #[command(flatten)]
        range: RangeArgs,
        #[command(flatten)]
        merge: MergeArgs,
    },
    /// Download, then merge.
    Run {
        #[command(flatten)]
        range: RangeArgs,
        #[command(flatten)]
        fetch: FetchArgs,
        #[command(flatten)]
        merge: MergeArgs,
    },
}

#[derive(Args)]
struct RangeArgs {
    /// `risk` or `statements`.
    #[arg(long)]
    dataset: String,
    /// First day of the range, e.g. 2019-07-01 or 01-07-2019.
    #[arg(long)]
    start: String,
    /// Last day of the range; defaults to today.
    #[arg(long)]
    end: Option<String>,
    /// Directory holding the archives.
    #[arg(long, default_value = "./zips")]
    dir: PathBuf,
}

#[derive(Args)]
struct FetchArgs {
    #[arg(long)]
    max_retries: Option<u32>,
    /// Seconds before the first retry; doubles after that.
    #[arg(long, value_parser = parse_secs)]
    backoff: Option<Duration>,
    /// Seconds allowed for a whole request.
    #[arg(long, value_parser = parse_secs)]
    timeout: Option<Duration>,
    /// Seconds allowed for establishing a connection.
    #[arg(long, value_parser = parse_secs)]
    connect_timeout: Option<Duration>,
    /// Write buffer size for downloads, in bytes.
    #[arg(long)]
    chunk_size: Option<usize>,
    #[arg(long)]
    concurrency: Option<usize>,
    /// Write the per-URL outcomes here as JSON.
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Args)]
struct MergeArgs {
    /// `sub`, `tag`, `num`, `txt`, ...
    #[arg(long)]
    table: String,
    /// Force a column type, e.g. `--dtype cik=str`. Repeatable.
    #[arg(long = "dtype", value_parser = parse_dtype_pair)]
    dtypes: Vec<(String, Dtype)>,
    /// Parquet file for the merged table.
    #[arg(long)]
    output: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let env = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,derascraper=info"));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };

    let registry = match &config.base_url {
        Some(base) => DatasetRegistry::with_base_url(base)?,
        None => DatasetRegistry::default(),
    };

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cancelling downloads");
                cancel.cancel();
            }
        }
    });

    match cli.command {
        Command::Fetch { range, fetch } => {
            apply_fetch_args(&mut config, &fetch);
            let req = request(&registry, &range)?;
            let client = build_client(&config.fetch)?;
            let report =
                pipeline::download(&client, &registry, &req, &range.dir, &config.fetch, &cancel)
                    .await?;
            finish_report(&report, fetch.report.as_deref())?;
            if report.succeeded().next().is_none() && !report.is_empty() {
                bail!("no release could be downloaded");
            }
        }
        Command::Assemble { range, merge } => {
            let req = request(&registry, &range)?;
            let plan = merge_request(&config, &merge)?;
            let dir = range.dir.clone();
            let merged =
                tokio::task::spawn_blocking(move || pipeline::assemble(&dir, &req, &plan))
                    .await??;
            write_output(&merged, &merge.output)?;
        }
        Command::Run {
            range,
            fetch,
            merge,
        } => {
            apply_fetch_args(&mut config, &fetch);
            let req = request(&registry, &range)?;
            let plan = merge_request(&config, &merge)?;
            let client = build_client(&config.fetch)?;
            let (report, merged) = pipeline::download_and_assemble(
                &client,
                &registry,
                &req,
                &plan,
                &range.dir,
                &config.fetch,
                &cancel,
            )
            .await?;
            finish_report(&report, fetch.report.as_deref())?;
            write_output(&merged, &merge.output)?;
        }
    }

    Ok(())
}

fn request(registry: &DatasetRegistry, range: &RangeArgs) -> Result<Request> {
    Ok(Request {
        dataset: registry.lookup(&range.dataset)?.clone(),
        start: range.start.clone(),
        end: range.end.clone(),
    })
}

fn merge_request(config: &Config, args: &MergeArgs) -> Result<MergeRequest> {
    let mut overrides = config.dtype.clone();
    for (col, dtype) in &args.dtypes {
        overrides.insert(col.clone(), *dtype);
    }
    Ok(MergeRequest::new(args.table.parse::<Table>()?).with_overrides(overrides))
}

fn apply_fetch_args(config: &mut Config, args: &FetchArgs) {
    let fetch = &mut config.fetch;
    if let Some(n) = args.max_retries {
        fetch.max_retries = n;
    }
    if let Some(d) = args.backoff {
        fetch.backoff_base = d;
    }
    if let Some(d) = args.timeout {
        fetch.timeout = d;
    }
    if let Some(d) = args.connect_timeout {
        fetch.connect_timeout = d;
    }
    if let Some(n) = args.chunk_size {
        fetch.chunk_size = n;
    }
    if let Some(n) = args.concurrency {
        fetch.concurrency = n;
    }
}

fn finish_report(report: &FetchReport, path: Option<&Path>) -> Result<()> {
    let failed = report.failed().count();
    info!(
        total = report.len(),
        ok = report.len() - failed,
        failed,
        "download summary"
    );
    if let Some(path) = path {
        let json = serde_json::to_string_pretty(report)?;
        fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(())
}

fn write_output(merged: &MergedTable, path: &Path) -> Result<()> {
    merged
        .write_parquet(path)
        .with_context(|| format!("writing {}", path.display()))?;
    info!(
        rows = merged.num_rows(),
        columns = merged.num_columns(),
        path = %path.display(),
        "wrote merged table"
    );
    Ok(())
}
