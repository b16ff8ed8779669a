use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::dialogue::{CompiledUnit, Interpreter};
use crate::engine::ConversationFlowEngine;
use crate::error::AdminError;
use crate::flow::loader::{is_flow_file, load_flow_dir, load_flow_file};
use crate::flow::{Flow, FlowDraft, FlowPatch, FlowStore};
use crate::watcher::WatchedType;

/// Parse a flow file and compile its script without touching any store.
pub fn validate_flow_file(path: &Path, interpreter: &Interpreter) -> Result<CompiledUnit> {
    let draft = load_flow_file(path)?;
    if draft.name.trim().is_empty() {
        bail!("{}: flow name is empty", path.display());
    }
    let unit = interpreter
        .compile(&draft.script)
        .with_context(|| format!("compiling flow `{}` from {}", draft.name, path.display()))?;
    info!(
        "✅ Flow `{}` is valid: {} rules ({} wildcard)",
        draft.name, unit.rule_count, unit.wildcard_rules
    );
    Ok(unit)
}

/// Validated flow mutations. Every successful write rebuilds the engine's
/// brain before returning, so the next message already sees it.
pub struct FlowAdmin {
    engine: Arc<ConversationFlowEngine>,
    store: FlowStore,
    writes: Mutex<()>,
}

impl FlowAdmin {
    pub fn new(engine: Arc<ConversationFlowEngine>) -> Arc<Self> {
        let store = engine.stores().flows.clone();
        Arc::new(Self {
            engine,
            store,
            writes: Mutex::new(()),
        })
    }

    pub fn engine(&self) -> &Arc<ConversationFlowEngine> {
        &self.engine
    }

    pub async fn list(&self) -> Result<Vec<Flow>, AdminError> {
        Ok(self.store.list().await?)
    }

    pub async fn get(&self, id: Uuid) -> Result<Flow, AdminError> {
        self.store.get_by_id(id).await?.ok_or(AdminError::NotFound(id))
    }

    pub async fn create(&self, draft: FlowDraft) -> Result<Flow, AdminError> {
        let _write = self.writes.lock().await;
        check_name(&draft.name)?;
        check_script(&draft.script)?;
        check_window(draft.max_context_messages)?;
        if self.store.get_by_name(&draft.name).await?.is_some() {
            return Err(AdminError::DuplicateName(draft.name));
        }
        let flow = self.store.create(Flow::from_draft(draft)).await?;
        if flow.is_default
            && let Err(e) = self.demote_defaults(Some(flow.id)).await
        {
            if let Err(undo) = self.store.delete(flow.id).await {
                warn!("Could not roll back flow `{}`: {undo}", flow.name);
            }
            return Err(e);
        }
        info!("✅ Flow `{}` created ({})", flow.name, flow.id);
        self.reload().await;
        Ok(flow)
    }

    pub async fn update(&self, id: Uuid, patch: FlowPatch) -> Result<Flow, AdminError> {
        let _write = self.writes.lock().await;
        self.update_locked(id, patch).await
    }

    pub async fn activate(&self, id: Uuid) -> Result<Flow, AdminError> {
        self.update(id, FlowPatch { is_active: Some(true), ..Default::default() })
            .await
    }

    pub async fn deactivate(&self, id: Uuid) -> Result<Flow, AdminError> {
        self.update(id, FlowPatch { is_active: Some(false), ..Default::default() })
            .await
    }

    /// Make `id` the default flow, demoting whichever flow held the role.
    pub async fn set_default(&self, id: Uuid) -> Result<Flow, AdminError> {
        self.update(id, FlowPatch { is_default: Some(true), ..Default::default() })
            .await
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), AdminError> {
        let _write = self.writes.lock().await;
        let flow = self.get(id).await?;
        if flow.is_active_default() {
            return Err(AdminError::DeleteActiveDefault(id));
        }
        if !self.store.delete(id).await? {
            return Err(AdminError::NotFound(id));
        }
        info!("🗑️ Flow `{}` deleted ({})", flow.name, id);
        self.reload().await;
        Ok(())
    }

    /// Create the flow, or overwrite every field of the flow with the same name.
    pub async fn upsert(&self, draft: FlowDraft) -> Result<Flow, AdminError> {
        let existing = self.store.get_by_name(&draft.name).await?;
        match existing {
            Some(flow) => {
                let _write = self.writes.lock().await;
                self.update_locked(flow.id, draft.into_patch()).await
            }
            None => self.create(draft).await,
        }
    }

    async fn update_locked(&self, id: Uuid, patch: FlowPatch) -> Result<Flow, AdminError> {
        let current = self.get(id).await?;
        if patch.is_empty() {
            return Ok(current);
        }
        if let Some(name) = &patch.name {
            check_name(name)?;
            if let Some(other) = self.store.get_by_name(name).await?
                && other.id != id
            {
                return Err(AdminError::DuplicateName(name.clone()));
            }
        }
        if let Some(script) = &patch.script {
            check_script(script)?;
        }
        if let Some(max) = patch.max_context_messages {
            check_window(max)?;
        }

        let mut next = current.clone();
        patch.apply(&mut next);
        if current.is_active_default() && !next.is_active_default() {
            return Err(AdminError::DemoteLastDefault(id));
        }
        let flow = self.store.update(next).await?;
        if flow.is_default
            && !current.is_default
            && let Err(e) = self.demote_defaults(Some(id)).await
        {
            if let Err(undo) = self.store.update(current).await {
                warn!("Could not roll back flow {id}: {undo}");
            }
            return Err(e);
        }
        info!("✅ Flow `{}` updated ({})", flow.name, flow.id);
        self.reload().await;
        Ok(flow)
    }

    async fn demote_defaults(&self, keep: Option<Uuid>) -> Result<(), AdminError> {
        for mut flow in self.store.list().await? {
            if flow.is_default && Some(flow.id) != keep {
                FlowPatch { is_default: Some(false), ..Default::default() }.apply(&mut flow);
                let flow = self.store.update(flow).await?;
                info!("Flow `{}` is no longer the default", flow.name);
            }
        }
        Ok(())
    }

    async fn reload(&self) {
        if !self.engine.reload().await {
            warn!("Flow saved but the brain could not be rebuilt; the previous one keeps answering");
        }
    }
}

fn check_name(name: &str) -> Result<(), AdminError> {
    if name.trim().is_empty() {
        return Err(AdminError::InvalidField {
            field: "name",
            reason: "must not be empty".into(),
        });
    }
    Ok(())
}

fn check_script(script: &str) -> Result<(), AdminError> {
    if script.trim().is_empty() {
        return Err(AdminError::InvalidField {
            field: "script",
            reason: "must not be empty".into(),
        });
    }
    Ok(())
}

fn check_window(max: usize) -> Result<(), AdminError> {
    if max == 0 {
        return Err(AdminError::InvalidField {
            field: "max_context_messages",
            reason: "must be at least 1".into(),
        });
    }
    Ok(())
}

/// Upsert every flow file in `dir`. Returns the flows that were stored.
pub async fn import_flow_dir(admin: &FlowAdmin, dir: &Path) -> Result<Vec<Flow>> {
    let drafts = load_flow_dir(dir)?;
    let mut stored = Vec::with_capacity(drafts.len());
    for (path, draft) in drafts {
        match admin.upsert(draft).await {
            Ok(flow) => stored.push(flow),
            Err(e) => warn!("Skipping {}: {e}", path.display()),
        }
    }
    Ok(stored)
}

/// Keeps the flow store in sync with a directory of flow files.
pub struct FlowFileWatcher {
    admin: Arc<FlowAdmin>,
    by_path: DashMap<PathBuf, Uuid>,
}

impl FlowFileWatcher {
    pub fn new(admin: Arc<FlowAdmin>) -> Arc<Self> {
        Arc::new(Self {
            admin,
            by_path: DashMap::new(),
        })
    }

    pub fn tracked(&self) -> usize {
        self.by_path.len()
    }
}

#[async_trait]
impl WatchedType for FlowFileWatcher {
    fn is_relevant(&self, path: &Path) -> bool {
        is_flow_file(path)
    }

    async fn on_create_or_modify(&self, path: &Path) -> Result<()> {
        let draft = load_flow_file(path)?;
        let flow = self
            .admin
            .upsert(draft)
            .await
            .with_context(|| format!("storing flow from {}", path.display()))?;

        let previous = self.by_path.insert(path.to_path_buf(), flow.id);
        // the file was renamed to another flow; drop the old one
        if let Some(old) = previous
            && old != flow.id
            && let Err(e) = self.admin.delete(old).await
        {
            warn!("Could not remove flow {old} replaced by {}: {e}", path.display());
        }
        Ok(())
    }

    async fn on_remove(&self, path: &Path) -> Result<()> {
        let Some((_, id)) = self.by_path.remove(path) else {
            return Ok(());
        };
        match self.admin.delete(id).await {
            Ok(()) | Err(AdminError::NotFound(_)) => Ok(()),
            Err(e) => {
                // keep tracking it so a later rewrite of the file updates it
                self.by_path.insert(path.to_path_buf(), id);
                Err(e).with_context(|| format!("removing flow for {}", path.display()))
            }
        }
    }
}
