use std::sync::Arc;

use chrono::Local;
use civit_scrap::{
    config::{scope_ids, Cli, Commands},
    download::{self, DownloadParams},
    extract::{self, ModelCache, VersionLookup},
    info_time,
    ledger::Ledger,
    process::{self, ScopesReport, StopReason},
    request::HttpSource,
    shutdown::{cancel_on_signal, ExitCode},
    sink::{self, NdjsonSink},
    Result,
};
use clap::Parser;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let start_time = Local::now();
    let cli = Cli::parse();
    let code = run(cli).await?;
    info_time!(start_time, "Full program time:");

    if code != ExitCode::Success {
        std::process::exit(code.as_i32());
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let cancel = cancel_on_signal();
    let timeout = cli.request_timeout();

    match cli.command {
        Commands::Fetch {
            walk,
            output,
            truncate,
        } => {
            let source = HttpSource::new(cli.token.as_deref(), timeout)?;
            let mut sink = if truncate {
                NdjsonSink::create(&output).await?
            } else {
                NdjsonSink::open_append(&output).await?
            };
            info_time!("Saving accepted records to {}", sink.path().display());

            let report = process::walk(&source, &walk.walk_params(), &mut sink, &cancel).await?;
            info_time!("Fetch finished. {}", report.counters);

            Ok(match report.stop {
                StopReason::EndOfData | StopReason::Cutoff => ExitCode::Success,
                StopReason::Cancelled => ExitCode::Interrupted,
                StopReason::Failed { url, error, .. } => {
                    error!("Stopped early at {url}: {error}. Records saved so far are kept.");
                    ExitCode::Incomplete
                }
            })
        }
        Commands::Scopes {
            walk,
            output,
            ledger,
            model_ids,
            model_names,
            models_endpoint,
            scope_key,
            workers,
        } => {
            let source = Arc::new(HttpSource::new(cli.token.as_deref(), timeout)?);
            let params = walk.walk_params();
            let mut ledger = Ledger::load(&ledger).await?;
            info_time!("{} scopes already completed in earlier runs", ledger.len());

            let discovery = process::discover_scopes(
                source.as_ref(),
                &models_endpoint,
                &model_names,
                scope_ids(&model_ids),
                &params.retry,
                &cancel,
            )
            .await;
            if !discovery.failed_names.is_empty() {
                error!("Model searches failed: {:?}", discovery.failed_names);
            }
            if discovery.scopes.is_empty() {
                if discovery.failed_names.is_empty() && !cancel.is_cancelled() {
                    warn!("No scopes to process, pass --model-id or --model-name");
                }
                let code = ScopesReport::default()
                    .exit_code(&discovery.failed_names, cancel.is_cancelled());
                return Ok(code);
            }

            let (handle, writer) = sink::spawn_writer(NdjsonSink::open_append(&output).await?, 256);
            let outcome = process::process_scopes(
                source,
                &params,
                &scope_key,
                discovery.scopes,
                workers,
                handle,
                &mut ledger,
                &cancel,
            )
            .await;
            let (report, written) = sink::join_writer(writer, outcome).await?;
            info_time!("Wrote {written} records to {}", output.display());

            if !report.failed.is_empty() {
                error!("Failed scopes: {:?}", report.failed);
            }
            Ok(report.exit_code(&discovery.failed_names, cancel.is_cancelled()))
        }
        Commands::Download {
            input,
            root,
            failed_log,
            workers,
            retry,
        } => {
            // Image hosts get no token.
            let source = HttpSource::new(None, timeout)?;
            let (tasks, unusable) = download::read_tasks(&input).await?;
            if unusable > 0 {
                warn!("{unusable} lines of {} had no id or url", input.display());
            }

            let params = DownloadParams {
                workers,
                retry: retry.policy(),
                failed_log,
                ..DownloadParams::new(root)
            };
            let report = download::download_all(source.client(), tasks, &params, &cancel).await?;

            Ok(if cancel.is_cancelled() {
                ExitCode::Interrupted
            } else if report.failed > 0 {
                ExitCode::Incomplete
            } else {
                ExitCode::Success
            })
        }
        Commands::Annotate {
            input,
            output,
            versions_endpoint,
            retry,
        } => {
            let source = HttpSource::new(cli.token.as_deref(), timeout)?;
            let lookup = VersionLookup::new(source, versions_endpoint, retry.policy(), cancel.clone());
            let mut cache = ModelCache::new();

            let report = extract::annotate_file(&input, &output, &lookup, &mut cache).await?;
            info_time!("Annotation finished: {report:?}");

            Ok(if cancel.is_cancelled() {
                ExitCode::Interrupted
            } else {
                ExitCode::Success
            })
        }
    }
}
