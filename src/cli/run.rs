use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{error, info};

use super::CliContext;
use waflow::apps::{App, FlowSource};
use waflow::engine::TurnOutcome;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Directory with flow files (defaults to `<root>/flows`)
    #[arg(long)]
    pub flows: Option<PathBuf>,

    /// Phone number the console conversation is recorded under
    #[arg(long, default_value = "console")]
    pub phone: String,

    /// Load the flow directory once instead of watching it
    #[arg(long, default_value_t = false)]
    pub no_watch: bool,
}

impl RunArgs {
    pub fn default_runtime() -> Self {
        Self {
            flows: None,
            phone: "console".to_string(),
            no_watch: false,
        }
    }
}

pub async fn execute(args: RunArgs, context: &CliContext) -> anyhow::Result<()> {
    let guard = context.init_tracing().context("could not create logger")?;
    info!("waflow starting up…");

    let flows_dir = args.flows.unwrap_or_else(|| context.root.join("flows"));
    let source = if !flows_dir.is_dir() {
        println!("⚠️  {} does not exist, starting without flows", flows_dir.display());
        FlowSource::None
    } else if args.no_watch {
        FlowSource::Dir(flows_dir)
    } else {
        FlowSource::Watch(flows_dir)
    };

    let mut app = App::new();
    let engine = match app.bootstrap(context.config_manager.clone(), source).await {
        Ok(engine) => engine,
        Err(err) => {
            error!("Failed to bootstrap waflow: {:#}", err);
            guard.shutdown();
            return Err(err);
        }
    };

    let info = engine.get_info().await;
    println!(
        "waflow ready: {} flows loaded, {} skipped. Type /salir to exit, /reiniciar to start over.",
        info.loaded_flows,
        info.skipped_flows.len()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let text = line.trim();
        match text {
            "" => continue,
            "/salir" | "/exit" => break,
            "/reiniciar" | "/reset" => {
                engine.close_conversation(&args.phone).await?;
                println!("(conversación reiniciada)");
                continue;
            }
            _ => {}
        }

        let outcome = engine.process_message(&args.phone, text).await;
        let result = outcome.result();
        println!("{}", result.response);
        println!(
            "   [{} · confianza {:.2} · {} ms]",
            result.response_type, result.confidence_score, result.processing_time_ms
        );
        if let TurnOutcome::Degraded { reason, .. } = &outcome {
            println!("   ⚠️  {reason}");
        }
    }

    println!("\nShutting down…");
    info!("waflow shutting down");
    app.shutdown();
    guard.shutdown();
    println!("Goodbye!");
    Ok(())
}
