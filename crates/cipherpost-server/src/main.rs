//! Cipherpost - Encryption gateway entry point
//!
//! Reads one message on standard input and processes it for the recipients
//! given on the command line.

use anyhow::{Context, Result};
use cipherpost_common::config::{LoggingConfig, DEFAULT_CONFIG_PATH};
use cipherpost_common::Config;
use cipherpost_core::{build_keystore, Pipeline, SmtpRelay};
use clap::Parser;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Encrypt outgoing mail for recipients with a known PGP key
#[derive(Parser, Debug)]
#[command(name = "cipherpost")]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Do not read partial configuration files from <CONFIG>.d
    #[arg(long)]
    no_partial: bool,

    /// Envelope recipients of the message
    #[arg(required = true)]
    recipients: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let (config, files) = Config::load(&cli.config, !cli.no_partial)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    init_logging(&config.logging)?;

    for file in &files {
        debug!("Read configuration file {}", file.display());
    }

    let mut raw = Vec::new();
    tokio::io::stdin()
        .read_to_end(&mut raw)
        .await
        .context("Failed to read message from standard input")?;

    let keystore = build_keystore(&config.gpg);
    let transport = Arc::new(SmtpRelay::new(&config.relay)?);
    let pipeline = Pipeline::from_config(&config, keystore, transport)?;

    let report = match pipeline.process(&raw, &cli.recipients).await {
        Ok(report) => report,
        Err(e) => {
            error!(code = e.code(), "Failed to process message: {}", e);
            return Ok(ExitCode::FAILURE);
        }
    };

    if report.is_success() {
        info!(
            dispatched = report.dispatched.len(),
            dropped = report.dropped.len(),
            "Done"
        );
        Ok(ExitCode::SUCCESS)
    } else {
        for failure in &report.failures {
            error!(
                recipient = %failure.recipient,
                stage = %failure.stage,
                code = failure.error.code(),
                "{}",
                failure
            );
        }
        Ok(ExitCode::FAILURE)
    }
}

fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .with_context(|| format!("Invalid log level '{}'", config.level))?;

    let (writer, ansi) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let layer = fmt::layer().with_target(true).with_level(true).with_writer(writer);

    if config.format == "json" {
        tracing_subscriber::registry()
            .with(layer.json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(layer.with_ansi(ansi))
            .with(filter)
            .init();
    }

    Ok(())
}
