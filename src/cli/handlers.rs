//! Subcommand handlers; each returns the process exit code

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use tokio::sync::broadcast;
use tracing::{debug, error};

use super::commands::{DownloadArgs, InferArgs};
use super::output::OutputFormatter;
use crate::api::{DownloadCommand, InferenceCommand};
use crate::config::OrchestratorConfig;
use crate::download::DownloadEvent;
use crate::orchestrator::Orchestrator;

const EXIT_OK: i32 = 0;
const EXIT_FAILURE: i32 = 1;

/// Loads the configuration file if given, otherwise defaults plus environment
pub fn load_config(path: Option<&Path>) -> Result<OrchestratorConfig> {
    let config = match path {
        Some(path) => OrchestratorConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => OrchestratorConfig::from_env().context("Invalid environment configuration")?,
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn exit_code(result: Result<bool>) -> i32 {
    match result {
        Ok(true) => EXIT_OK,
        Ok(false) => EXIT_FAILURE,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            EXIT_FAILURE
        }
    }
}

async fn prepare(orchestrator: &Orchestrator) {
    orchestrator.refresh_hardware().await;
    orchestrator.sync_inventory().await;
}

pub async fn handle_probe(orchestrator: &Orchestrator, formatter: &OutputFormatter) -> i32 {
    exit_code(run_probe(orchestrator, formatter).await)
}

async fn run_probe(orchestrator: &Orchestrator, formatter: &OutputFormatter) -> Result<bool> {
    let snapshot = orchestrator.refresh_hardware().await;
    println!("{}", formatter.format_hardware(&snapshot)?);
    Ok(true)
}

pub async fn handle_status(orchestrator: &Orchestrator, formatter: &OutputFormatter) -> i32 {
    exit_code(run_status(orchestrator, formatter).await)
}

async fn run_status(orchestrator: &Orchestrator, formatter: &OutputFormatter) -> Result<bool> {
    prepare(orchestrator).await;
    println!("{}", formatter.format_status(&orchestrator.status())?);
    Ok(true)
}

pub async fn handle_models(orchestrator: &Orchestrator, formatter: &OutputFormatter) -> i32 {
    exit_code(run_models(orchestrator, formatter).await)
}

async fn run_models(orchestrator: &Orchestrator, formatter: &OutputFormatter) -> Result<bool> {
    prepare(orchestrator).await;
    println!("{}", formatter.format_models(&orchestrator.list_models())?);
    Ok(true)
}

pub async fn handle_download(
    orchestrator: &Orchestrator,
    args: &DownloadArgs,
    formatter: &OutputFormatter,
    quiet: bool,
) -> i32 {
    exit_code(run_download(orchestrator, args, formatter, quiet).await)
}

async fn run_download(
    orchestrator: &Orchestrator,
    args: &DownloadArgs,
    formatter: &OutputFormatter,
    quiet: bool,
) -> Result<bool> {
    prepare(orchestrator).await;

    let progress = (!args.no_progress && !quiet).then(|| {
        let events = orchestrator.subscribe_downloads();
        tokio::spawn(render_progress(args.model_name.clone(), events))
    });

    let response = orchestrator
        .download(DownloadCommand {
            model_name: args.model_name.clone(),
        })
        .await;

    if let Some(task) = progress {
        task.abort();
    }
    println!(
        "{}",
        formatter.format_download(&args.model_name, &response)?
    );
    Ok(response.success)
}

pub async fn handle_infer(
    orchestrator: &Orchestrator,
    args: &InferArgs,
    formatter: &OutputFormatter,
) -> i32 {
    let result = run_infer(orchestrator, args, formatter).await;
    orchestrator.shutdown().await;
    exit_code(result)
}

async fn run_infer(
    orchestrator: &Orchestrator,
    args: &InferArgs,
    formatter: &OutputFormatter,
) -> Result<bool> {
    prepare(orchestrator).await;

    let mut command = InferenceCommand::new(args.input.clone(), args.task.clone());
    command.timeout_secs = args.timeout;
    let response = orchestrator.infer(command).await;
    debug!(
        success = response.success,
        model = %response.model_used,
        "Inference finished"
    );

    println!("{}", formatter.format_inference(&response)?);
    Ok(response.success)
}

fn progress_style(template: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

/// Draws pull progress for `model_id` until its download finishes
async fn render_progress(model_id: String, mut events: broadcast::Receiver<DownloadEvent>) {
    let bar = ProgressBar::new_spinner();
    bar.set_style(progress_style(
        "{spinner:.green} [{elapsed_precise}] {msg} {bytes}",
    ));
    bar.set_message(model_id.clone());

    loop {
        match events.recv().await {
            Ok(event) if event.model_id() != model_id => continue,
            Ok(DownloadEvent::Started { .. }) => {}
            Ok(DownloadEvent::Progress {
                bytes_done,
                bytes_total,
                ..
            }) => {
                if let Some(total) = bytes_total {
                    if bar.length() != Some(total) {
                        bar.set_length(total);
                        bar.set_style(progress_style(
                            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
                        ));
                    }
                }
                bar.set_position(bytes_done);
            }
            Ok(DownloadEvent::Completed { .. }) => {
                bar.finish_with_message(format!("{} downloaded", model_id));
                break;
            }
            Ok(DownloadEvent::Failed { .. }) => {
                bar.abandon();
                break;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("Progress display skipped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
