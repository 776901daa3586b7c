use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use momentum_core::{MomentumConfig, StreamSpec};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use momentum_manager::commands;
use momentum_manager::manifest::{DEFAULT_BUFFER_COUNT, DEFAULT_BUFFER_SIZE};

#[derive(Parser)]
#[command(name = "momentum")]
#[command(about = "MOMENTUM - shared-memory streaming between processes")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage streams
    Stream {
        #[command(subcommand)]
        command: StreamCommands,
    },

    /// Manage routes
    Route {
        #[command(subcommand)]
        command: RouteCommands,
    },

    /// Manage processors
    Processor {
        #[command(subcommand)]
        command: ProcessorCommands,
    },

    /// Start or stop everything declared in an application manifest
    Application {
        /// Manifest file
        #[arg(short = 'f', default_value = "momentum.yaml")]
        file: PathBuf,

        #[arg(value_enum)]
        action: ApplicationAction,
    },
}

#[derive(Subcommand)]
enum StreamCommands {
    /// Create one or more streams
    Create {
        #[arg(required = true)]
        names: Vec<String>,
        /// Bytes per buffer
        #[arg(long, default_value_t = DEFAULT_BUFFER_SIZE)]
        buffer_size: usize,
        /// Number of buffers
        #[arg(long, default_value_t = DEFAULT_BUFFER_COUNT)]
        buffer_count: usize,
        /// Deliver only the newest buffer to each subscriber
        #[arg(long)]
        latest_only: bool,
        /// Reuse the oldest unread buffer instead of blocking producers
        #[arg(long)]
        drop_oldest: bool,
    },
    /// Remove one or more streams
    Remove {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// List streams
    List,
}

#[derive(Subcommand)]
enum RouteCommands {
    /// Create one or more routes
    Create {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Remove one or more routes
    Remove {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Attach streams to a route
    Attach {
        route: String,
        #[arg(required = true)]
        streams: Vec<String>,
    },
    /// List routes
    List,
}

#[derive(Subcommand)]
enum ProcessorCommands {
    /// Start a processor from a shell command
    Create { name: String, command: String },
    /// Stop one or more processors
    Remove {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// List processors
    List,
}

#[derive(Clone, Copy, ValueEnum)]
enum ApplicationAction {
    Start,
    Stop,
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("momentum=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    if let Err(e) = run_command(cli.command) {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands) -> Result<()> {
    let config = MomentumConfig::from_env()?;
    tracing::debug!(
        run_path = %config.run_path.display(),
        data_path = %config.data_path.display(),
        "resolved configuration"
    );

    match command {
        Commands::Stream { command } => match command {
            StreamCommands::Create {
                names,
                buffer_size,
                buffer_count,
                latest_only,
                drop_oldest,
            } => {
                let template = StreamSpec {
                    name: String::new(),
                    buffer_size,
                    buffer_count,
                    broadcast: !latest_only,
                    drop_oldest,
                };
                commands::stream::create_streams(&config, &names, &template)
            }
            StreamCommands::Remove { names } => commands::stream::remove_streams(&config, &names),
            StreamCommands::List => commands::stream::list_streams(&config),
        },

        Commands::Route { command } => match command {
            RouteCommands::Create { names } => commands::route::create_routes(&config, &names),
            RouteCommands::Remove { names } => commands::route::remove_routes(&config, &names),
            RouteCommands::Attach { route, streams } => {
                commands::route::attach_streams(&config, &route, &streams)
            }
            RouteCommands::List => commands::route::list_routes(&config),
        },

        Commands::Processor { command } => match command {
            ProcessorCommands::Create { name, command } => {
                commands::processor::create_processor(&config, &name, &command)
            }
            ProcessorCommands::Remove { names } => {
                commands::processor::remove_processors(&config, &names)
            }
            ProcessorCommands::List => commands::processor::list_processors(&config),
        },

        Commands::Application { file, action } => commands::application::run_application(
            &config,
            &file,
            matches!(action, ApplicationAction::Start),
        ),
    }
}
