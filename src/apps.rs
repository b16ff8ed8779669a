// src/apps.rs
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tracing::{error, info};

use crate::assistant;
use crate::config::{ConfigManager, EngineConfig};
use crate::context::InMemoryContextStore;
use crate::dialogue::rules::RuleInterpreter;
use crate::engine::{ConversationFlowEngine, EngineStores};
use crate::flow::InMemoryFlowStore;
use crate::flow_commands::{FlowAdmin, FlowFileWatcher, import_flow_dir};
use crate::interaction::InMemoryInteractionStore;
use crate::watcher::DirectoryWatcher;

pub const FLOW_FILE_EXTENSIONS: &[&str] = &["yaml", "yml"];

/// Where flows come from at startup.
#[derive(Debug, Clone)]
pub enum FlowSource {
    None,
    /// Import once.
    Dir(PathBuf),
    /// Import, then keep the store in sync with the directory.
    Watch(PathBuf),
}

#[derive(Default)]
pub struct App {
    engine: Option<Arc<ConversationFlowEngine>>,
    admin: Option<Arc<FlowAdmin>>,
    watcher: Option<DirectoryWatcher>,
}

impl App {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bootstraps the chatbot:
    ///   - reads the engine settings from `config`
    ///   - builds the in-memory stores, interpreter and optional assistant
    ///   - loads (and optionally watches) the flow directory
    pub async fn bootstrap(
        &mut self,
        config: ConfigManager,
        flows: FlowSource,
    ) -> Result<Arc<ConversationFlowEngine>> {
        let engine_config = EngineConfig::from_config(&config).await;
        info!(
            "Engine settings: budget={:?}, context_ttl={:?}, provider={}",
            engine_config.max_processing_time, engine_config.context_ttl, engine_config.llm.provider
        );

        let stores = EngineStores {
            flows: InMemoryFlowStore::new(),
            contexts: InMemoryContextStore::new(),
            interactions: InMemoryInteractionStore::new(),
        };
        let assistant = assistant::from_settings(&engine_config.llm);
        let engine = ConversationFlowEngine::new(stores, RuleInterpreter::new(), assistant, engine_config);
        engine.reload().await;

        let admin = FlowAdmin::new(engine.clone());
        match flows {
            FlowSource::None => {}
            FlowSource::Dir(dir) => {
                let loaded = import_flow_dir(&admin, &dir)
                    .await
                    .with_context(|| format!("loading flows from {}", dir.display()))?;
                info!("Loaded {} flows from {}", loaded.len(), dir.display());
            }
            FlowSource::Watch(dir) => {
                let watched = FlowFileWatcher::new(admin.clone());
                let watcher = DirectoryWatcher::new(dir.clone(), watched, FLOW_FILE_EXTENSIONS, true, true)
                    .await
                    .map_err(|e| {
                        error!("Could not watch flows in {}: {e:#}", dir.display());
                        e
                    })?;
                self.watcher = Some(watcher);
            }
        }

        self.engine = Some(engine.clone());
        self.admin = Some(admin);
        Ok(engine)
    }

    pub fn engine(&self) -> Result<Arc<ConversationFlowEngine>> {
        self.engine
            .clone()
            .ok_or_else(|| anyhow!("app is not bootstrapped"))
    }

    pub fn admin(&self) -> Result<Arc<FlowAdmin>> {
        self.admin
            .clone()
            .ok_or_else(|| anyhow!("app is not bootstrapped"))
    }

    pub fn shutdown(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.shutdown();
        }
        self.admin = None;
        self.engine = None;
    }
}
