use localmind::cli::commands::{CliArgs, Commands};
use localmind::cli::handlers::{
    handle_download, handle_infer, handle_models, handle_probe, handle_status, load_config,
};
use localmind::cli::OutputFormatter;
use localmind::util::logging::{init_logging, parse_level, LoggingConfig};
use localmind::{Orchestrator, VERSION};

use clap::Parser;
use std::env;
use tracing::{debug, Level};

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(2);
        }
    };
    init_logging_from_args(&args, &config.log_level);

    debug!("localmind v{} starting", VERSION);
    debug!("Arguments: {:?}", args);

    let orchestrator = match Orchestrator::from_config(config) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };
    let formatter = OutputFormatter::new(args.format.into());

    let exit_code = match &args.command {
        Commands::Probe => handle_probe(&orchestrator, &formatter).await,
        Commands::Status => handle_status(&orchestrator, &formatter).await,
        Commands::Models => handle_models(&orchestrator, &formatter).await,
        Commands::Download(download_args) => {
            handle_download(&orchestrator, download_args, &formatter, args.quiet).await
        }
        Commands::Infer(infer_args) => handle_infer(&orchestrator, infer_args, &formatter).await,
    };

    std::process::exit(exit_code);
}

fn init_logging_from_args(args: &CliArgs, configured_level: &str) {
    let level = if let Some(level_str) = &args.log_level {
        parse_level(level_str)
    } else if args.verbose {
        Level::DEBUG
    } else if args.quiet {
        Level::ERROR
    } else {
        parse_level(configured_level)
    };

    let use_json = env::var("LOCALMIND_LOG_JSON")
        .ok()
        .and_then(|v| v.parse::<bool>().ok())
        .unwrap_or(false);

    init_logging(LoggingConfig {
        level,
        use_json,
        ..LoggingConfig::default()
    });
}
