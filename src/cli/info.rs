use std::path::PathBuf;

use anyhow::Context;
use clap::Args;

use super::CliContext;
use waflow::apps::{App, FlowSource};

#[derive(Args, Debug)]
pub struct InfoArgs {
    /// Directory with flow files (defaults to `<root>/flows`)
    #[arg(long)]
    pub flows: Option<PathBuf>,
}

pub async fn execute(args: InfoArgs, context: &CliContext) -> anyhow::Result<()> {
    let flows_dir = args.flows.unwrap_or_else(|| context.root.join("flows"));
    let mut app = App::new();
    let engine = app
        .bootstrap(context.config_manager.clone(), FlowSource::Dir(flows_dir))
        .await?;
    let info = engine.get_info().await;
    app.shutdown();

    println!(
        "{}",
        serde_json::to_string_pretty(&info).context("serializing engine info")?
    );
    Ok(())
}
