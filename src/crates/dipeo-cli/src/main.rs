//! # dipeo-cli
//!
//! Command-line front-end for the DiPeO engine: run diagrams with live
//! progress, compile and convert between formats, and inspect persisted
//! executions and metrics.

mod commands;
mod http;

use clap::{Parser, Subcommand};
use dipeo_core::config::EnvSettings;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "dipeo")]
#[command(about = "DiPeO - execute and inspect diagram workflows", long_about = None)]
#[command(version)]
struct Cli {
    /// Directory for persisted execution state.
    #[arg(long, env = "DIPEO_BASE_DIR", default_value = ".dipeo")]
    base_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a diagram to completion
    Run {
        /// Path to the diagram file
        diagram: PathBuf,

        /// Execution deadline in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// JSON or YAML file with initial variables
        #[arg(long, conflicts_with = "input_data")]
        inputs: Option<PathBuf>,

        /// Initial variables as an inline JSON object
        #[arg(long)]
        input_data: Option<String>,

        /// Force the diagram format instead of sniffing the extension
        #[arg(long, value_parser = ["light", "native", "readable"])]
        format: Option<String>,

        /// Verbose engine logging
        #[arg(long)]
        debug: bool,

        /// Print only the terminal result
        #[arg(long)]
        simple: bool,
    },

    /// Print structural statistics for a diagram
    Stats {
        diagram: PathBuf,

        #[arg(long, value_parser = ["light", "native", "readable"])]
        format: Option<String>,
    },

    /// Compile a diagram and report diagnostics
    Compile {
        diagram: PathBuf,

        /// Report diagnostics without printing the compiled form
        #[arg(long)]
        check_only: bool,

        /// Emit the compiled diagram as JSON
        #[arg(long)]
        json: bool,

        #[arg(long, value_parser = ["light", "native", "readable"])]
        format: Option<String>,
    },

    /// Convert a diagram between formats
    Convert {
        input: PathBuf,
        output: PathBuf,

        /// Source format (sniffed from the input extension by default)
        #[arg(long = "from")]
        from: Option<String>,

        /// Target format (sniffed from the output extension by default)
        #[arg(long = "to")]
        to: Option<String>,
    },

    /// List diagrams in the current directory tree
    List {
        /// Only this format
        #[arg(long, value_parser = ["light", "native", "readable"])]
        format: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Show collected metrics for an execution
    Metrics {
        #[arg(long, conflicts_with = "latest")]
        execution_id: Option<String>,

        /// The most recently started execution
        #[arg(long)]
        latest: bool,

        #[arg(long)]
        json: bool,
    },

    /// Print the persisted result of an execution session
    Results {
        /// Session id (exec_ followed by 32 hex characters)
        session_id: String,
    },
}

fn init_tracing(settings: &EnvSettings, debug: bool) {
    use tracing_subscriber::EnvFilter;
    let default_level = if debug {
        "debug"
    } else {
        settings.log_level.as_deref().unwrap_or("warn")
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = EnvSettings::from_env();

    let debug = matches!(&cli.command, Commands::Run { debug: true, .. });
    init_tracing(&settings, debug);

    let runtime = tokio::runtime::Runtime::new()?;
    let exit_code = runtime.block_on(async {
        match cli.command {
            Commands::Run {
                diagram,
                timeout,
                inputs,
                input_data,
                format,
                debug,
                simple,
            } => {
                commands::run(commands::RunArgs {
                    base_dir: cli.base_dir,
                    diagram,
                    timeout,
                    inputs,
                    input_data,
                    format,
                    debug,
                    simple,
                    settings,
                })
                .await
            }
            Commands::Stats { diagram, format } => commands::stats(&diagram, format.as_deref()),
            Commands::Compile {
                diagram,
                check_only,
                json,
                format,
            } => commands::compile(&diagram, check_only, json, format.as_deref()),
            Commands::Convert {
                input,
                output,
                from,
                to,
            } => commands::convert(&input, &output, from.as_deref(), to.as_deref()),
            Commands::List { format, json } => commands::list(format.as_deref(), json),
            Commands::Metrics {
                execution_id,
                latest,
                json,
            } => commands::metrics(&cli.base_dir, execution_id.as_deref(), latest, json).await,
            Commands::Results { session_id } => {
                commands::results(&cli.base_dir, &session_id).await
            }
        }
    });

    match exit_code {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}
