use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Local model orchestrator with cloud fallback
#[derive(Parser, Debug)]
#[command(
    name = "localmind",
    about = "Local model orchestrator with cloud fallback",
    version,
    long_about = "localmind keeps one local model loaded that fits the machine's memory, \
                  swaps it when the workload or hardware changes, and falls back to a \
                  cloud endpoint when local inference fails."
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(
        short = 'c',
        long,
        global = true,
        value_name = "FILE",
        help = "TOML configuration file (environment variables still apply)"
    )]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, value_name = "LEVEL", help = "Set logging level")]
    pub log_level: Option<String>,

    #[arg(short = 'v', long, global = true, help = "Enable debug logging")]
    pub verbose: bool,

    #[arg(
        short = 'q',
        long,
        global = true,
        conflicts_with = "verbose",
        help = "Quiet mode - suppress non-error output"
    )]
    pub quiet: bool,

    #[arg(
        short = 'f',
        long,
        global = true,
        value_enum,
        default_value = "human",
        help = "Output format"
    )]
    pub format: OutputFormatArg,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Show the detected hardware and compute tier")]
    Probe,

    #[command(
        about = "Show orchestrator status",
        long_about = "Probes hardware, syncs the installed model inventory and reports the \
                      active model, slot state and catalog statistics.\n\n\
                      Examples:\n  \
                      localmind status\n  \
                      localmind status --format json"
    )]
    Status,

    #[command(about = "List catalog models and whether they fit this machine")]
    Models,

    #[command(
        about = "Download a catalog model",
        long_about = "Fetches the model artifact through the local backend and marks it \
                      ready in the catalog.\n\n\
                      Examples:\n  \
                      localmind download llama3.2:3b"
    )]
    Download(DownloadArgs),

    #[command(
        about = "Run one inference request",
        long_about = "Routes the prompt to the best local model for the task, activating \
                      or downloading it if needed, with cloud fallback when configured.\n\n\
                      Examples:\n  \
                      localmind infer \"Explain borrowing\"\n  \
                      localmind infer --task coding --timeout 30 \"Write a binary search\""
    )]
    Infer(InferArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct DownloadArgs {
    #[arg(value_name = "MODEL", help = "Catalog model id")]
    pub model_name: String,

    #[arg(long, help = "Do not draw a progress bar")]
    pub no_progress: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct InferArgs {
    #[arg(value_name = "PROMPT", help = "Prompt text")]
    pub input: String,

    #[arg(
        short = 't',
        long,
        value_name = "TASK",
        default_value = "general",
        help = "Task type: general, coding, creative, technical, analysis"
    )]
    pub task: String,

    #[arg(long, value_name = "SECONDS", help = "Request deadline in seconds")]
    pub timeout: Option<f64>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormatArg {
    Json,
    Yaml,
    Human,
}

impl From<OutputFormatArg> for super::output::OutputFormat {
    fn from(arg: OutputFormatArg) -> Self {
        match arg {
            OutputFormatArg::Json => super::output::OutputFormat::Json,
            OutputFormatArg::Yaml => super::output::OutputFormat::Yaml,
            OutputFormatArg::Human => super::output::OutputFormat::Human,
        }
    }
}
