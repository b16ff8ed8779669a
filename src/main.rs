use clap::Parser;

mod cli;

use cli::{Cli, CliContext, default_command, execute, resolve_root_dir};

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let context = CliContext::new(resolve_root_dir(), &cli);
    let command = cli.command.unwrap_or_else(default_command);
    execute(&context, command).await
}
