use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod flow;
pub mod info;
pub mod run;

use flow::FlowArgs;
use info::InfoArgs;
use run::RunArgs;

use waflow::config::{ConfigManager, EnvConfigManager};
use waflow::logger::{LogLevel, TracingGuard, init_tracing};

#[derive(Parser, Debug)]
#[command(
    name = "waflow",
    about = "Conversation flow engine for WhatsApp Business chatbots",
    version
)]
pub struct Cli {
    /// Optional log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: LogLevel,

    /// OpenTelemetry endpoint (e.g. http://localhost:4318/v1/logs)
    #[arg(long, global = true)]
    pub otel_logs_endpoint: Option<String>,

    /// OpenTelemetry endpoint for metrics
    #[arg(long, global = true)]
    pub otel_events_endpoint: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Chat with the engine on stdin/stdout
    Run(RunArgs),

    /// Validate or try out flow files
    Flow(FlowArgs),

    /// Load flows and print the engine status as JSON
    Info(InfoArgs),
}

pub struct CliContext {
    pub root: PathBuf,
    pub config_manager: ConfigManager,
    pub log_level: LogLevel,
    pub otel_logs_endpoint: Option<String>,
    pub otel_events_endpoint: Option<String>,
}

impl CliContext {
    pub fn new(root: PathBuf, cli: &Cli) -> Self {
        let config_manager = ConfigManager(EnvConfigManager::new(root.join(".env")));
        Self {
            root,
            config_manager,
            log_level: cli.log_level,
            otel_logs_endpoint: cli.otel_logs_endpoint.clone(),
            otel_events_endpoint: cli.otel_events_endpoint.clone(),
        }
    }

    /// Logs go to `<root>/logs` so stdout stays free for the conversation.
    pub fn init_tracing(&self) -> anyhow::Result<TracingGuard> {
        init_tracing(
            self.root.clone(),
            "logs/waflow.log".to_string(),
            "logs/waflow_events.json".to_string(),
            self.log_level,
            self.otel_logs_endpoint.clone(),
            self.otel_events_endpoint.clone(),
        )
    }
}

/// Resolve the working directory from the environment or use the default.
pub fn resolve_root_dir() -> PathBuf {
    std::env::var("WAFLOW_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

pub async fn execute(context: &CliContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run(args) => run::execute(args, context).await,
        Commands::Flow(args) => flow::execute(args, context).await,
        Commands::Info(args) => info::execute(args, context).await,
    }
}

pub fn default_command() -> Commands {
    Commands::Run(RunArgs::default_runtime())
}
