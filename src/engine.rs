//! `ConversationFlowEngine`: the facade the messaging layer talks to.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use arc_swap::{ArcSwap, ArcSwapOption};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::assistant::Assistant;
use crate::brain::{BrainCompiler, BrainSnapshot, SkippedFlow};
use crate::config::EngineConfig;
use crate::context::{ContextStore, ContextTurn, ConversationContext};
use crate::dialogue::Interpreter;
use crate::error::{DegradedReason, StoreError};
use crate::fallback::FallbackChain;
use crate::flow::{FlowStore, FlowUsage};
use crate::interaction::{Interaction, InteractionStore, ResponseType};
use crate::logger::Telemetry;
use crate::session::ConversationLocks;
use crate::state::{StateValue, VariableBag};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessResult {
    pub response: String,
    #[serde(rename = "type")]
    pub response_type: ResponseType,
    pub processing_time_ms: u64,
    pub confidence_score: f64,
    pub flow_id: Option<Uuid>,
    pub tokens_used: Option<u32>,
}

/// A chat turn always produces a reply; `Degraded` says part of the
/// storage layer was missing while producing it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnOutcome {
    Success(ProcessResult),
    Degraded {
        result: ProcessResult,
        reason: DegradedReason,
    },
}

impl TurnOutcome {
    pub fn result(&self) -> &ProcessResult {
        match self {
            TurnOutcome::Success(result) | TurnOutcome::Degraded { result, .. } => result,
        }
    }

    pub fn into_result(self) -> ProcessResult {
        match self {
            TurnOutcome::Success(result) | TurnOutcome::Degraded { result, .. } => result,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, TurnOutcome::Degraded { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestFlowResult {
    pub success: bool,
    pub response: Option<String>,
    pub vars: VariableBag,
    pub valid_response: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineInfo {
    pub flow_count: usize,
    pub active_count: usize,
    pub default_flow_id: Option<Uuid>,
    pub skipped_flows: Vec<SkippedFlow>,
    pub last_reload_at: Option<DateTime<Utc>>,
    pub per_flow_usage: Vec<FlowUsage>,
    pub brain_version: u64,
    pub loaded_flows: usize,
    pub storage_available: bool,
    pub assistant_enabled: bool,
}

/// The three persistence collaborators.
#[derive(Debug, Clone)]
pub struct EngineStores {
    pub flows: FlowStore,
    pub contexts: ContextStore,
    pub interactions: InteractionStore,
}

#[derive(Debug)]
pub struct ConversationFlowEngine {
    brain: ArcSwap<BrainSnapshot>,
    compiler: BrainCompiler,
    interpreter: Interpreter,
    stores: EngineStores,
    chain: FallbackChain,
    config: Arc<EngineConfig>,
    locks: ConversationLocks,
    versions: AtomicU64,
    last_reload_at: ArcSwapOption<DateTime<Utc>>,
    flow_store_ok: AtomicBool,
    telemetry: Telemetry,
}

impl ConversationFlowEngine {
    /// Starts with an empty brain; call [`reload`](Self::reload) to load flows.
    pub fn new(
        stores: EngineStores,
        interpreter: Interpreter,
        assistant: Option<Assistant>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let telemetry = Telemetry::new();
        Arc::new(Self {
            brain: ArcSwap::from_pointee(BrainSnapshot::empty(&interpreter)),
            compiler: BrainCompiler::new(interpreter.clone()),
            interpreter,
            chain: FallbackChain::new(assistant, config.clone(), telemetry.clone()),
            locks: ConversationLocks::new(config.context_ttl),
            config,
            stores,
            versions: AtomicU64::new(0),
            last_reload_at: ArcSwapOption::empty(),
            flow_store_ok: AtomicBool::new(true),
            telemetry,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stores(&self) -> &EngineStores {
        &self.stores
    }

    pub fn interpreter(&self) -> &Interpreter {
        &self.interpreter
    }

    /// The snapshot currently answering messages.
    pub fn snapshot(&self) -> Arc<BrainSnapshot> {
        self.brain.load_full()
    }

    /// Rebuild the brain from the flow store and publish it. On a store
    /// error the live snapshot is kept and `false` is returned.
    #[tracing::instrument(name = "engine_reload", skip(self))]
    pub async fn reload(&self) -> bool {
        let flows = match self.stores.flows.get_active_flows_ordered_by_priority().await {
            Ok(flows) => flows,
            Err(e) => {
                self.flow_store_ok.store(false, Ordering::SeqCst);
                error!("❌ Reload failed, keeping brain v{}: {e}", self.brain.load().version);
                return false;
            }
        };
        self.flow_store_ok.store(true, Ordering::SeqCst);

        let version = self.versions.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = self.compiler.build(&flows, version);
        self.telemetry
            .compile_failures
            .add(snapshot.skipped.len() as u64, &[]);
        self.telemetry.reloads.add(1, &[]);
        info!(
            "🧠 Brain v{} published: {} flows loaded, {} skipped",
            version,
            snapshot.flows.len(),
            snapshot.skipped.len()
        );

        self.last_reload_at.store(Some(Arc::new(snapshot.built_at)));
        self.brain.store(Arc::new(snapshot));
        true
    }

    /// Run one chat turn. Never fails: storage problems come back as
    /// [`TurnOutcome::Degraded`] with a `simulation` response type.
    #[tracing::instrument(name = "engine_process_message", skip(self, text))]
    pub async fn process_message(&self, phone_number: &str, text: &str) -> TurnOutcome {
        let started = Instant::now();
        let deadline = started + self.config.max_processing_time;
        let _turn = self.locks.acquire(phone_number).await;
        let brain = self.brain.load_full();
        let now = Utc::now();

        let mut degraded: Option<DegradedReason> = None;
        if !self.flow_store_ok.load(Ordering::SeqCst) {
            degraded = Some(DegradedReason::FlowStoreUnavailable(
                "last reload could not read flows".into(),
            ));
        }

        let (mut context, context_store_ok) =
            match self.stores.contexts.get_or_create_context(phone_number).await {
                Ok(ctx) => (ctx, true),
                Err(e) => {
                    warn!("Context store unavailable, using an in-memory context: {e}");
                    degraded = Some(DegradedReason::ContextStoreUnavailable(e.to_string()));
                    (ConversationContext::new(phone_number), false)
                }
            };

        let ttl = chrono::Duration::from_std(self.config.context_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(1800));
        if context.is_stale(ttl, now) {
            info!(phone_number, "Conversation expired, starting a new session");
            context.start_new_session(now);
        }
        context.trim_to(self.window_for(&brain, &context));

        let outcome = self
            .chain
            .run(&brain, phone_number, &context, text, deadline)
            .await;

        if let Some(flow_id) = outcome.matched_flow {
            if let Err(e) = self.stores.flows.record_usage(flow_id, now).await {
                warn!("Could not record flow usage: {e}");
                degraded.get_or_insert(DegradedReason::FlowStoreUnavailable(e.to_string()));
            }
            context.last_flow_id = Some(flow_id);
        }
        context.current_topic = outcome.topic.clone();

        // every write is kept, so a re-set value lives as long as its turn
        let written: VariableBag = outcome
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), StateValue::from_script_text(v)))
            .collect();
        let window = self.window_for(&brain, &context);
        context.push_turn(
            ContextTurn {
                message_in: text.to_string(),
                message_out: outcome.response.clone(),
                variables: written,
                at: now,
            },
            window,
        );

        if context_store_ok {
            if let Err(e) = self.stores.contexts.save_context(&context).await {
                warn!("Could not save context: {e}");
                degraded.get_or_insert(DegradedReason::ContextStoreUnavailable(e.to_string()));
            }
        }

        let mut result = ProcessResult {
            response: outcome.response,
            response_type: if degraded.is_some() {
                ResponseType::Simulation
            } else {
                outcome.response_type
            },
            processing_time_ms: started.elapsed().as_millis() as u64,
            confidence_score: outcome.confidence_score,
            flow_id: outcome.flow_id,
            tokens_used: outcome.tokens_used,
        };

        let record = Interaction {
            id: Uuid::new_v4(),
            phone_number: phone_number.to_string(),
            message_in: text.to_string(),
            message_out: result.response.clone(),
            response_type: result.response_type,
            processing_time_ms: result.processing_time_ms,
            flow_id: result.flow_id,
            confidence_score: result.confidence_score,
            tokens_used: result.tokens_used,
            created_at: now,
        };
        if let Err(e) = self.stores.interactions.record(record).await {
            warn!("Could not write interaction: {e}");
            degraded.get_or_insert(DegradedReason::InteractionStoreUnavailable(e.to_string()));
            result.response_type = ResponseType::Simulation;
        }

        let latency_ms = started.elapsed().as_secs_f64() * 1_000.0;
        self.telemetry.record_turn(result.response_type, latency_ms);
        tracing::event!(
            target: "request",
            tracing::Level::INFO,
            phone_number,
            response_type = result.response_type.as_str(),
            confidence = result.confidence_score,
            flow_id = ?result.flow_id,
            latency_ms,
            brain_version = brain.version,
            degraded = degraded.is_some(),
        );

        match degraded {
            None => TurnOutcome::Success(result),
            Some(reason) => TurnOutcome::Degraded { result, reason },
        }
    }

    /// Reply text only, for health checks.
    pub async fn get_response(&self, phone_number: &str, text: &str) -> String {
        self.process_message(phone_number, text)
            .await
            .into_result()
            .response
    }

    /// Compile `script` into a throwaway session and answer one message.
    /// Touches neither the live brain nor any store.
    #[tracing::instrument(name = "engine_test_flow", skip(self, script, vars))]
    pub fn test_flow(&self, script: &str, test_message: &str, vars: VariableBag) -> TestFlowResult {
        let mut builder = self.interpreter.builder();
        if let Err(e) = builder.merge("test", script) {
            return TestFlowResult {
                success: false,
                response: None,
                vars,
                valid_response: false,
                error: Some(e.to_string()),
            };
        }
        let session = builder.finish();
        let key = format!("test-{}", Uuid::new_v4());
        for (name, value) in &vars {
            session.set_variable(&key, name, &value.to_script_text());
        }

        let reply = session.reply(&key, test_message);
        let vars = session
            .variables(&key)
            .into_iter()
            .map(|(k, v)| {
                let value = StateValue::from_script_text(&v);
                (k, value)
            })
            .collect();
        session.clear_session(&key);

        TestFlowResult {
            success: true,
            valid_response: reply.is_match(),
            response: Some(reply.text),
            vars,
            error: None,
        }
    }

    pub async fn get_info(&self) -> EngineInfo {
        let brain = self.brain.load_full();
        let last_reload_at = self.last_reload_at.load_full().map(|t| *t);
        let base = EngineInfo {
            flow_count: brain.flows.len() + brain.skipped.len(),
            active_count: brain.flows.len() + brain.skipped.len(),
            default_flow_id: brain.flows.iter().find(|f| f.is_default).map(|f| f.id),
            skipped_flows: brain.skipped.clone(),
            last_reload_at,
            per_flow_usage: Vec::new(),
            brain_version: brain.version,
            loaded_flows: brain.flows.len(),
            storage_available: false,
            assistant_enabled: self.chain.has_assistant(),
        };

        match self.stores.flows.get_statistics().await {
            Ok(stats) => EngineInfo {
                flow_count: stats.total,
                active_count: stats.active,
                default_flow_id: stats.default_flow_id,
                per_flow_usage: stats.per_flow,
                storage_available: true,
                ..base
            },
            Err(e) => {
                warn!("Flow statistics unavailable: {e}");
                base
            }
        }
    }

    /// Close the conversation so the next message starts a new session.
    pub async fn close_conversation(&self, phone_number: &str) -> Result<bool, StoreError> {
        let _turn = self.locks.acquire(phone_number).await;
        self.stores.contexts.close_conversation(phone_number).await
    }

    fn window_for(&self, brain: &BrainSnapshot, context: &ConversationContext) -> usize {
        context
            .last_flow_id
            .and_then(|id| brain.flow(id))
            .or_else(|| brain.policy_owner())
            .map(|f| f.max_context_messages)
            .unwrap_or(self.config.default_context_messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextStoreType, InMemoryContextStore};
    use crate::dialogue::NO_MATCH;
    use crate::dialogue::rules::RuleInterpreter;
    use crate::flow::{Flow, FlowDraft, InMemoryFlowStore};
    use crate::flow::store::FlowStoreType;
    use crate::interaction::{InMemoryInteractionStore, InteractionStoreType};

    struct Fixture {
        engine: Arc<ConversationFlowEngine>,
        flows: Arc<InMemoryFlowStore>,
        contexts: Arc<InMemoryContextStore>,
        interactions: Arc<InMemoryInteractionStore>,
    }

    fn fixture() -> Fixture {
        let flows = InMemoryFlowStore::new();
        let contexts = InMemoryContextStore::new();
        let interactions = InMemoryInteractionStore::new();
        let engine = ConversationFlowEngine::new(
            EngineStores {
                flows: flows.clone(),
                contexts: contexts.clone(),
                interactions: interactions.clone(),
            },
            RuleInterpreter::new(),
            None,
            EngineConfig::default(),
        );
        Fixture {
            engine,
            flows,
            contexts,
            interactions,
        }
    }

    #[tokio::test]
    async fn test_exact_trigger_end_to_end() {
        let f = fixture();
        let flow = f
            .flows
            .create(Flow::from_draft(FlowDraft::new("saludo", "+ hola\n- ¡Hola!")))
            .await
            .unwrap();
        assert!(f.engine.reload().await);

        let outcome = f.engine.process_message("34600000000", "hola").await;
        assert!(!outcome.is_degraded());
        let result = outcome.result();
        assert_eq!(result.response, "¡Hola!");
        assert_eq!(result.response_type, ResponseType::Flow);
        assert_eq!(result.confidence_score, 1.0);
        assert_eq!(result.flow_id, Some(flow.id));

        let stored = f.flows.get_by_id(flow.id).await.unwrap().unwrap();
        assert_eq!(stored.usage_count, 1);
        assert!(stored.last_used.is_some());
        assert_eq!(f.interactions.count_total().await.unwrap(), 1);
        let ctx = f.contexts.get_context("34600000000").await.unwrap().unwrap();
        assert_eq!(ctx.last_flow_id, Some(flow.id));
        assert_eq!(ctx.turns.len(), 1);
    }

    #[tokio::test]
    async fn test_context_store_outage_is_simulation() {
        let f = fixture();
        f.flows
            .create(Flow::from_draft(FlowDraft::new("saludo", "+ hola\n- ¡Hola!")))
            .await
            .unwrap();
        f.engine.reload().await;
        f.contexts.set_available(false);

        let outcome = f.engine.process_message("1", "hola").await;
        assert!(matches!(
            outcome,
            TurnOutcome::Degraded {
                reason: DegradedReason::ContextStoreUnavailable(_),
                ..
            }
        ));
        assert_eq!(outcome.result().response, "¡Hola!");
        assert_eq!(outcome.result().response_type, ResponseType::Simulation);
    }

    #[tokio::test]
    async fn test_reload_failure_keeps_brain() {
        let f = fixture();
        f.flows
            .create(Flow::from_draft(FlowDraft::new("saludo", "+ hola\n- ¡Hola!")))
            .await
            .unwrap();
        assert!(f.engine.reload().await);
        let version = f.engine.snapshot().version;

        f.flows.set_available(false);
        assert!(!f.engine.reload().await);
        assert_eq!(f.engine.snapshot().version, version);

        let outcome = f.engine.process_message("1", "hola").await;
        assert_eq!(outcome.result().response, "¡Hola!");
        assert_eq!(outcome.result().response_type, ResponseType::Simulation);
        assert!(!f.engine.get_info().await.storage_available);
    }

    #[tokio::test]
    async fn test_test_flow_is_sandboxed() {
        let f = fixture();
        let flow = f
            .flows
            .create(Flow::from_draft(FlowDraft::new("saludo", "+ hola\n- ¡Hola!")))
            .await
            .unwrap();
        f.engine.reload().await;
        let before = f.engine.get_info().await;
        let snapshot = f.engine.snapshot();

        let mut vars = VariableBag::new();
        vars.insert("name".into(), StateValue::from("Ana"));
        let result = f.engine.test_flow("+ hola\n- Hola <get name><set seen=1>", "hola", vars);
        assert!(result.success);
        assert!(result.valid_response);
        assert_eq!(result.response.as_deref(), Some("Hola Ana"));
        assert_eq!(result.vars.get("seen"), Some(&StateValue::Number(1.0)));

        let miss = f.engine.test_flow("+ hola\n- hi", "adios", VariableBag::new());
        assert!(miss.success);
        assert!(!miss.valid_response);
        assert_eq!(miss.response.as_deref(), Some(NO_MATCH));

        let broken = f.engine.test_flow("- nope", "hola", VariableBag::new());
        assert!(!broken.success);
        assert!(broken.error.is_some());

        let after = f.engine.get_info().await;
        assert_eq!(before.per_flow_usage, after.per_flow_usage);
        assert!(Arc::ptr_eq(&snapshot, &f.engine.snapshot()));
        assert_eq!(f.flows.get_by_id(flow.id).await.unwrap().unwrap().usage_count, 0);
        assert_eq!(f.interactions.count_total().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_get_info_reports_skipped_flows() {
        let f = fixture();
        f.flows
            .create(Flow::from_draft(FlowDraft::new("ok", "+ hola\n- hi").as_default()))
            .await
            .unwrap();
        let bad = f
            .flows
            .create(Flow::from_draft(FlowDraft::new("bad", "+ (roto\n- x")))
            .await
            .unwrap();
        assert!(f.engine.reload().await);

        let info = f.engine.get_info().await;
        assert_eq!(info.flow_count, 2);
        assert_eq!(info.active_count, 2);
        assert_eq!(info.loaded_flows, 1);
        assert_eq!(info.skipped_flows.len(), 1);
        assert_eq!(info.skipped_flows[0].flow_id, bad.id);
        assert!(info.default_flow_id.is_some());
        assert!(info.last_reload_at.is_some());
        assert!(info.storage_available);
    }

    #[tokio::test]
    async fn test_closed_conversation_starts_new_session() {
        let f = fixture();
        f.flows
            .create(Flow::from_draft(FlowDraft::new("a", "+ hola\n- hi")))
            .await
            .unwrap();
        f.engine.reload().await;
        f.engine.process_message("1", "hola").await;
        assert!(f.engine.close_conversation("1").await.unwrap());
        f.engine.process_message("1", "hola").await;

        let ctx = f.contexts.get_context("1").await.unwrap().unwrap();
        assert_eq!(ctx.session_count, 2);
        assert_eq!(ctx.turns.len(), 1);
        assert!(ctx.active);
    }

    #[tokio::test]
    async fn test_get_response_returns_text() {
        let f = fixture();
        assert_eq!(
            f.engine.get_response("1", "hola").await,
            EngineConfig::default().default_response
        );
    }
}
