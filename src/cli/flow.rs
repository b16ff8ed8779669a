use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Args, Subcommand};

use super::CliContext;
use waflow::apps::{App, FlowSource};
use waflow::dialogue::Interpreter;
use waflow::dialogue::rules::RuleInterpreter;
use waflow::flow::loader::load_flow_file;
use waflow::flow_commands::validate_flow_file;
use waflow::state::{StateValue, VariableBag};

#[derive(Args, Debug)]
pub struct FlowArgs {
    #[command(subcommand)]
    pub command: FlowCommands,
}

#[derive(Subcommand, Debug)]
pub enum FlowCommands {
    /// Parse a flow file and compile its script
    Validate { file: PathBuf },
    /// Answer one message with a single flow file, without touching any store
    Test {
        file: PathBuf,
        message: String,
        /// Conversation variable, repeatable (e.g. --var nombre=Ana)
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, String)>,
    },
}

fn parse_var(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got `{s}`")),
    }
}

pub async fn execute(args: FlowArgs, context: &CliContext) -> anyhow::Result<()> {
    match args.command {
        FlowCommands::Validate { file } => {
            let interpreter: Interpreter = RuleInterpreter::new();
            let unit = validate_flow_file(&file, &interpreter)?;
            println!(
                "✅ Flow file is valid: {} rules, {} wildcard, topics: {}",
                unit.rule_count,
                unit.wildcard_rules,
                unit.topics.join(", ")
            );
            Ok(())
        }
        FlowCommands::Test { file, message, vars } => {
            let draft = load_flow_file(&file)?;
            let mut app = App::new();
            let engine = app
                .bootstrap(context.config_manager.clone(), FlowSource::None)
                .await?;

            let vars: VariableBag = vars
                .into_iter()
                .map(|(k, v)| (k, StateValue::from_script_text(&v)))
                .collect();
            let result = engine.test_flow(&draft.script, &message, vars);
            app.shutdown();

            println!(
                "{}",
                serde_json::to_string_pretty(&result).context("serializing test result")?
            );
            if !result.success {
                bail!("flow `{}` does not compile", draft.name);
            }
            Ok(())
        }
    }
}
