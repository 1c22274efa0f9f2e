//! objput command-line entry point.

mod cli;
mod config;
mod progress;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use objput_storage::{BackendError, Client};
use objput_upload::{ErrorKind, Strategy, UploadError, UploadOrchestrator, UploadOutcome};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;
use crate::config::{ConfigError, Settings};
use crate::progress::{ConsoleReporter, human_bytes};

const EXIT_FAILURE: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_LOCAL_FILE: u8 = 3;
const EXIT_BACKEND: u8 = 4;
const EXIT_INVARIANT: u8 = 5;
const EXIT_CANCELLED: u8 = 130;

fn main() -> ExitCode {
    // Logs go to stderr; stdout carries progress.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match try_main() {
        Ok(outcome) => {
            println!("upload success!");
            info!(
                key = %outcome.object.key,
                etag = %outcome.object.etag,
                size = %human_bytes(outcome.object.size),
                strategy = ?outcome.strategy,
                "done"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

fn try_main() -> anyhow::Result<UploadOutcome> {
    let cli = Cli::parse();
    let settings = Settings::load(cli, |name| std::env::var(name).ok())?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        endpoint = %settings.endpoint,
        bucket = %settings.bucket,
        "starting objput"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(settings))
}

async fn run(settings: Settings) -> anyhow::Result<UploadOutcome> {
    let mut client = Client::new(&settings.endpoint, settings.credentials.clone())?
        .with_path_style(settings.path_style);
    if let Some(region) = &settings.region {
        client = client.with_region(region.clone());
    }
    let bucket = client
        .bucket(&settings.bucket)
        .await
        .with_context(|| format!("opening bucket {}", settings.bucket))?;

    let reporter = Arc::new(ConsoleReporter::new(std::io::stdout()));
    let orchestrator =
        UploadOrchestrator::new(Arc::new(bucket), settings.upload.clone()).with_listener(reporter);

    let cancel = orchestrator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling upload");
            cancel.cancel();
        }
    });

    let outcome = orchestrator
        .upload(&settings.file, &settings.object)
        .await
        .with_context(|| {
            format!(
                "uploading {} to {}/{}",
                settings.file.display(),
                settings.bucket,
                settings.object
            )
        })?;

    if let Strategy::Multipart { parts } = outcome.strategy {
        info!(parts, "multipart upload committed");
    }
    Ok(outcome)
}

/// Maps a failure to the process exit code.
fn exit_code(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<ConfigError>().is_some() {
        return EXIT_CONFIG;
    }
    if let Some(e) = err.downcast_ref::<UploadError>() {
        return match e.kind() {
            ErrorKind::Configuration => EXIT_CONFIG,
            ErrorKind::LocalIo => EXIT_LOCAL_FILE,
            ErrorKind::Backend => EXIT_BACKEND,
            ErrorKind::Invariant => EXIT_INVARIANT,
            ErrorKind::Cancelled => EXIT_CANCELLED,
        };
    }
    if let Some(e) = err.downcast_ref::<BackendError>() {
        return match e {
            BackendError::InvalidEndpoint(_) => EXIT_CONFIG,
            _ => EXIT_BACKEND,
        };
    }
    EXIT_FAILURE
}
