use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use super::{Flow, FlowStatistics, FlowUsage};
use crate::error::StoreError;

pub type FlowStore = Arc<dyn FlowStoreType>;

/// Read/write access to flow records.
///
/// Uniqueness of names is enforced here; the "one active default" rule is
/// enforced by the administrative layer, which demotes the previous default
/// before writing a new one.
#[async_trait]
pub trait FlowStoreType: Send + Sync + Debug {
    /// Active flows, priority ascending, ties broken by creation time.
    async fn get_active_flows_ordered_by_priority(&self) -> Result<Vec<Flow>, StoreError>;
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Flow>, StoreError>;
    async fn get_by_name(&self, name: &str) -> Result<Option<Flow>, StoreError>;
    /// The active default flow, if any.
    async fn get_default_flow(&self) -> Result<Option<Flow>, StoreError>;
    /// Every flow, active or not, in the same order as the active listing.
    async fn list(&self) -> Result<Vec<Flow>, StoreError>;
    async fn create(&self, flow: Flow) -> Result<Flow, StoreError>;
    /// Overwrite the editable fields. `usage_count`, `last_used` and
    /// `created_at` keep their stored values; only `record_usage` moves them.
    async fn update(&self, flow: Flow) -> Result<Flow, StoreError>;
    /// Returns false when no flow had that id.
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;
    /// Bump `usage_count` and set `last_used`.
    async fn record_usage(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;
    async fn get_statistics(&self) -> Result<FlowStatistics, StoreError>;
}

fn sort_flows(flows: &mut [Flow]) {
    flows.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.name.cmp(&b.name))
    });
}

#[derive(Debug)]
pub struct InMemoryFlowStore {
    flows: DashMap<Uuid, Flow>,
    available: AtomicBool,
}

impl InMemoryFlowStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            flows: DashMap::new(),
            available: AtomicBool::new(true),
        })
    }

    /// Simulate the backing database going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("flow store offline".into()))
        }
    }

    fn name_taken(&self, name: &str, except: Option<Uuid>) -> bool {
        self.flows
            .iter()
            .any(|f| f.name == name && Some(f.id) != except)
    }

    fn snapshot(&self) -> Vec<Flow> {
        let mut flows: Vec<Flow> = self.flows.iter().map(|f| f.value().clone()).collect();
        sort_flows(&mut flows);
        flows
    }
}

#[async_trait]
impl FlowStoreType for InMemoryFlowStore {
    async fn get_active_flows_ordered_by_priority(&self) -> Result<Vec<Flow>, StoreError> {
        self.check()?;
        Ok(self.snapshot().into_iter().filter(|f| f.is_active).collect())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Flow>, StoreError> {
        self.check()?;
        Ok(self.flows.get(&id).map(|f| f.value().clone()))
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<Flow>, StoreError> {
        self.check()?;
        Ok(self
            .flows
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.value().clone()))
    }

    async fn get_default_flow(&self) -> Result<Option<Flow>, StoreError> {
        self.check()?;
        Ok(self.snapshot().into_iter().find(|f| f.is_active_default()))
    }

    async fn list(&self) -> Result<Vec<Flow>, StoreError> {
        self.check()?;
        Ok(self.snapshot())
    }

    async fn create(&self, flow: Flow) -> Result<Flow, StoreError> {
        self.check()?;
        if self.name_taken(&flow.name, None) {
            return Err(StoreError::Conflict(format!("flow name `{}`", flow.name)));
        }
        if self.flows.contains_key(&flow.id) {
            return Err(StoreError::Conflict(format!("flow id {}", flow.id)));
        }
        debug!(flow_id = %flow.id, name = %flow.name, "flow created");
        self.flows.insert(flow.id, flow.clone());
        Ok(flow)
    }

    async fn update(&self, mut flow: Flow) -> Result<Flow, StoreError> {
        self.check()?;
        if self.name_taken(&flow.name, Some(flow.id)) {
            return Err(StoreError::Conflict(format!("flow name `{}`", flow.name)));
        }
        let Some(mut stored) = self.flows.get_mut(&flow.id) else {
            return Err(StoreError::NotFound(flow.id.to_string()));
        };
        flow.usage_count = stored.usage_count;
        flow.last_used = stored.last_used;
        flow.created_at = stored.created_at;
        *stored = flow.clone();
        Ok(flow)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self.flows.remove(&id).is_some())
    }

    async fn record_usage(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.check()?;
        match self.flows.get_mut(&id) {
            Some(mut flow) => {
                flow.usage_count += 1;
                flow.last_used = Some(at);
                Ok(())
            }
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    async fn get_statistics(&self) -> Result<FlowStatistics, StoreError> {
        self.check()?;
        let flows = self.snapshot();
        Ok(FlowStatistics {
            total: flows.len(),
            active: flows.iter().filter(|f| f.is_active).count(),
            default_flow_id: flows.iter().find(|f| f.is_active_default()).map(|f| f.id),
            per_flow: flows.iter().map(FlowUsage::from).collect(),
        })
    }
}
