// tests/engine_test.rs
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use uuid::Uuid;

use waflow::assistant::{Assistant, AssistantClient, AssistantReply, AssistantRequest};
use waflow::config::EngineConfig;
use waflow::context::{ContextStoreType, InMemoryContextStore};
use waflow::dialogue::rules::RuleInterpreter;
use waflow::engine::{ConversationFlowEngine, EngineStores};
use waflow::error::{AdminError, AssistantError, StoreError};
use waflow::flow::{Flow, FlowDraft, FlowPatch, FlowStatistics, FlowStoreType, InMemoryFlowStore};
use waflow::flow_commands::FlowAdmin;
use waflow::interaction::{InMemoryInteractionStore, InteractionStoreType, ResponseType};
use waflow::state::{StateValue, VariableBag};

const PHONE: &str = "34600000000";

#[derive(Debug)]
struct SlowAssistant(Duration);

#[async_trait]
impl AssistantClient for SlowAssistant {
    fn name(&self) -> &'static str {
        "slow"
    }

    async fn complete(&self, _request: &AssistantRequest) -> Result<AssistantReply, AssistantError> {
        tokio::time::sleep(self.0).await;
        Ok(AssistantReply {
            text: "demasiado tarde".into(),
            tokens_used: Some(10),
            confidence: None,
        })
    }
}

#[derive(Debug, Default)]
struct EchoAssistant {
    calls: AtomicUsize,
}

#[async_trait]
impl AssistantClient for EchoAssistant {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn complete(&self, request: &AssistantRequest) -> Result<AssistantReply, AssistantError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(AssistantReply {
            text: format!("IA: {} ({} turnos previos)", request.prompt, request.history.len()),
            tokens_used: Some(42),
            confidence: None,
        })
    }
}

/// Flow store that can land a match between an admin read and its write,
/// or refuse writes outright.
#[derive(Debug)]
struct InterleavingFlowStore {
    inner: Arc<InMemoryFlowStore>,
    usage_before_update: AtomicBool,
    fail_writes: AtomicBool,
}

impl InterleavingFlowStore {
    fn write_check(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes rejected".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl FlowStoreType for InterleavingFlowStore {
    async fn get_active_flows_ordered_by_priority(&self) -> Result<Vec<Flow>, StoreError> {
        self.inner.get_active_flows_ordered_by_priority().await
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Flow>, StoreError> {
        self.inner.get_by_id(id).await
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<Flow>, StoreError> {
        self.inner.get_by_name(name).await
    }

    async fn get_default_flow(&self) -> Result<Option<Flow>, StoreError> {
        self.inner.get_default_flow().await
    }

    async fn list(&self) -> Result<Vec<Flow>, StoreError> {
        self.inner.list().await
    }

    async fn create(&self, flow: Flow) -> Result<Flow, StoreError> {
        self.write_check()?;
        self.inner.create(flow).await
    }

    async fn update(&self, flow: Flow) -> Result<Flow, StoreError> {
        self.write_check()?;
        if self.usage_before_update.load(Ordering::SeqCst) {
            self.inner.record_usage(flow.id, Utc::now()).await?;
        }
        self.inner.update(flow).await
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        self.write_check()?;
        self.inner.delete(id).await
    }

    async fn record_usage(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.inner.record_usage(id, at).await
    }

    async fn get_statistics(&self) -> Result<FlowStatistics, StoreError> {
        self.inner.get_statistics().await
    }
}

fn interleaving_harness() -> (Arc<ConversationFlowEngine>, Arc<FlowAdmin>, Arc<InterleavingFlowStore>) {
    let flows = Arc::new(InterleavingFlowStore {
        inner: InMemoryFlowStore::new(),
        usage_before_update: AtomicBool::new(false),
        fail_writes: AtomicBool::new(false),
    });
    let engine = ConversationFlowEngine::new(
        EngineStores {
            flows: flows.clone(),
            contexts: InMemoryContextStore::new(),
            interactions: InMemoryInteractionStore::new(),
        },
        RuleInterpreter::new(),
        None,
        EngineConfig::default(),
    );
    let admin = FlowAdmin::new(engine.clone());
    (engine, admin, flows)
}

struct Harness {
    engine: Arc<ConversationFlowEngine>,
    admin: Arc<FlowAdmin>,
    flows: Arc<InMemoryFlowStore>,
    contexts: Arc<InMemoryContextStore>,
    interactions: Arc<InMemoryInteractionStore>,
}

fn harness(assistant: Option<Assistant>, config: EngineConfig) -> Harness {
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
        assistant,
        config,
    );
    let admin = FlowAdmin::new(engine.clone());
    Harness {
        engine,
        admin,
        flows,
        contexts,
        interactions,
    }
}

const MEMORY_SCRIPT: &str = "
+ me llamo *
- Encantado, <star>.<set nombre=<star>>

+ como me llamo
- Te llamas <get nombre>.

+ *
- Vale.
";

#[tokio::test]
async fn test_slow_assistant_degrades_to_default_within_budget() {
    let config = EngineConfig {
        max_processing_time: Duration::from_millis(200),
        ..EngineConfig::default()
    };
    let h = harness(Some(Arc::new(SlowAssistant(Duration::from_secs(5)))), config);
    h.admin
        .create(FlowDraft::new("saludo", "+ hola\n- ¡Hola!").with_fallback_to_llm(true))
        .await
        .unwrap();

    let limit = Duration::from_millis(400);
    let started = Instant::now();
    let outcome = h.engine.process_message(PHONE, "quiero cambiar mi pedido").await;
    assert!(started.elapsed() < limit, "took {:?}", started.elapsed());
    assert!(!outcome.is_degraded());

    let result = outcome.result();
    assert!(result.processing_time_ms < limit.as_millis() as u64);
    assert_eq!(result.response_type, ResponseType::Default);
    assert_eq!(result.response, h.engine.config().default_response);
    assert_eq!(result.confidence_score, 0.0);
    assert_eq!(result.tokens_used, None);
}

#[tokio::test]
async fn test_assistant_answers_unmatched_message() {
    let echo = Arc::new(EchoAssistant::default());
    let h = harness(Some(echo.clone()), EngineConfig::default());
    let flow = h
        .admin
        .create(FlowDraft::new("saludo", "+ hola\n- ¡Hola!").with_fallback_to_llm(true))
        .await
        .unwrap();

    assert_eq!(h.engine.get_response(PHONE, "hola").await, "¡Hola!");
    let outcome = h.engine.process_message(PHONE, "tienen envío gratis").await;
    let result = outcome.result();
    assert_eq!(result.response_type, ResponseType::FallbackLlm);
    assert_eq!(result.response, "IA: tienen envío gratis (1 turnos previos)");
    assert_eq!(result.tokens_used, Some(42));
    assert_eq!(result.confidence_score, 0.5);
    assert_eq!(result.flow_id, Some(flow.id));
    assert_eq!(echo.calls.load(Ordering::SeqCst), 1);

    // the assistant answer does not count as a flow match
    let stored = h.flows.get_by_id(flow.id).await.unwrap().unwrap();
    assert_eq!(stored.usage_count, 1);
}

#[tokio::test]
async fn test_assistant_not_called_without_fallback_flag() {
    let echo = Arc::new(EchoAssistant::default());
    let h = harness(Some(echo.clone()), EngineConfig::default());
    h.admin
        .create(FlowDraft::new("saludo", "+ hola\n- ¡Hola!"))
        .await
        .unwrap();

    let outcome = h.engine.process_message(PHONE, "otra cosa").await;
    assert_eq!(outcome.result().response_type, ResponseType::Default);
    assert_eq!(echo.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_memory_window_drops_old_variables() {
    let h = harness(None, EngineConfig::default());
    h.admin
        .create(FlowDraft::new("memoria", MEMORY_SCRIPT).with_max_context_messages(2))
        .await
        .unwrap();

    assert_eq!(h.engine.get_response(PHONE, "me llamo Ana").await, "Encantado, ana.");
    assert_eq!(h.engine.get_response(PHONE, "¿Como me llamo?").await, "Te llamas ana.");

    // a third turn pushes the one that set the name out of a window of 2
    assert_eq!(h.engine.get_response(PHONE, "gracias").await, "Vale.");
    assert_eq!(
        h.engine.get_response(PHONE, "como me llamo").await,
        "Te llamas undefined."
    );

    let ctx = h.contexts.get_context(PHONE).await.unwrap().unwrap();
    assert_eq!(ctx.turns.len(), 2);
    assert!(!ctx.variables.contains_key("nombre"));
}

#[tokio::test]
async fn test_variable_set_again_lives_as_long_as_its_turn() {
    let h = harness(None, EngineConfig::default());
    h.admin
        .create(FlowDraft::new("memoria", MEMORY_SCRIPT).with_max_context_messages(2))
        .await
        .unwrap();

    h.engine.get_response(PHONE, "me llamo ana").await;
    // same value again: this turn still owns `nombre`
    h.engine.get_response(PHONE, "me llamo ana").await;
    assert_eq!(h.engine.get_response(PHONE, "gracias").await, "Vale.");
    assert_eq!(h.engine.get_response(PHONE, "como me llamo").await, "Te llamas ana.");

    let ctx = h.contexts.get_context(PHONE).await.unwrap().unwrap();
    assert_eq!(ctx.variables.get("nombre"), Some(&StateValue::from("ana")));
}

#[tokio::test]
async fn test_rule_without_reply_leaves_no_variables() {
    let h = harness(None, EngineConfig::default());
    h.admin
        .create(FlowDraft::new(
            "estado",
            "+ silencio\n- <set estado=mudo>\n\n+ estado\n- Estado: <get estado>.",
        ))
        .await
        .unwrap();

    let outcome = h.engine.process_message(PHONE, "silencio").await;
    assert_eq!(outcome.result().response_type, ResponseType::Default);
    assert_eq!(h.engine.get_response(PHONE, "estado").await, "Estado: undefined.");

    let ctx = h.contexts.get_context(PHONE).await.unwrap().unwrap();
    assert!(!ctx.variables.contains_key("estado"));
}

#[tokio::test]
async fn test_variables_are_isolated_per_phone() {
    let h = harness(None, EngineConfig::default());
    h.admin
        .create(FlowDraft::new("memoria", MEMORY_SCRIPT))
        .await
        .unwrap();

    h.engine.get_response("1", "me llamo ana").await;
    h.engine.get_response("2", "me llamo luis").await;
    assert_eq!(h.engine.get_response("1", "como me llamo").await, "Te llamas ana.");
    assert_eq!(h.engine.get_response("2", "como me llamo").await, "Te llamas luis.");
}

#[tokio::test]
async fn test_closed_conversation_starts_new_session() {
    let h = harness(None, EngineConfig::default());
    h.admin
        .create(FlowDraft::new("memoria", MEMORY_SCRIPT))
        .await
        .unwrap();

    h.engine.get_response(PHONE, "me llamo ana").await;
    assert!(h.engine.close_conversation(PHONE).await.unwrap());
    assert_eq!(
        h.engine.get_response(PHONE, "como me llamo").await,
        "Te llamas undefined."
    );
    let ctx = h.contexts.get_context(PHONE).await.unwrap().unwrap();
    assert_eq!(ctx.session_count, 2);
    assert_eq!(ctx.turns.len(), 1);
}

#[tokio::test]
async fn test_idle_context_expires() {
    let config = EngineConfig {
        context_ttl: Duration::from_millis(1),
        ..EngineConfig::default()
    };
    let h = harness(None, config);
    h.admin
        .create(FlowDraft::new("memoria", MEMORY_SCRIPT))
        .await
        .unwrap();

    h.engine.get_response(PHONE, "me llamo ana").await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        h.engine.get_response(PHONE, "como me llamo").await,
        "Te llamas undefined."
    );
}

#[tokio::test]
async fn test_priority_and_default_flow_order() {
    let h = harness(None, EngineConfig::default());
    h.admin
        .create(FlowDraft::new("general", "+ *\n- ¿En qué te ayudo?\n+ hola\n- Hola desde general").as_default())
        .await
        .unwrap();
    let ventas = h
        .admin
        .create(FlowDraft::new("ventas", "+ hola\n- Hola desde ventas").with_priority(5))
        .await
        .unwrap();
    h.admin
        .create(FlowDraft::new("soporte", "+ hola\n- Hola desde soporte").with_priority(20))
        .await
        .unwrap();

    let outcome = h.engine.process_message(PHONE, "Hola!").await;
    assert_eq!(outcome.result().response, "Hola desde ventas");
    assert_eq!(outcome.result().flow_id, Some(ventas.id));
    assert_eq!(outcome.result().confidence_score, 1.0);

    // only the default flow has a catch-all, and it is tried last
    let outcome = h.engine.process_message(PHONE, "necesito una factura").await;
    assert_eq!(outcome.result().response, "¿En qué te ayudo?");
    assert_eq!(outcome.result().response_type, ResponseType::Flow);
    assert_eq!(outcome.result().confidence_score, 0.6);
}

#[tokio::test]
async fn test_broken_flow_is_skipped_and_reported() {
    let h = harness(None, EngineConfig::default());
    let broken = h
        .admin
        .create(FlowDraft::new("roto", "- respuesta sin disparador"))
        .await
        .unwrap();
    h.admin
        .create(FlowDraft::new("saludo", "+ hola\n- ¡Hola!"))
        .await
        .unwrap();

    assert_eq!(h.engine.get_response(PHONE, "hola").await, "¡Hola!");
    let info = h.engine.get_info().await;
    assert_eq!(info.flow_count, 2);
    assert_eq!(info.loaded_flows, 1);
    assert_eq!(info.skipped_flows.len(), 1);
    assert_eq!(info.skipped_flows[0].flow_id, broken.id);
}

#[tokio::test]
async fn test_reload_is_idempotent() {
    let h = harness(None, EngineConfig::default());
    h.admin
        .create(FlowDraft::new("saludo", "+ hola\n- ¡Hola!"))
        .await
        .unwrap();
    h.admin
        .create(FlowDraft::new("menu", "+ menu\n- 1) Pedidos 2) Ayuda").with_priority(1))
        .await
        .unwrap();

    let first = h.engine.snapshot();
    assert!(h.engine.reload().await);
    let second = h.engine.snapshot();
    assert!(second.version > first.version);

    let ids = |s: &waflow::brain::BrainSnapshot| s.flows.iter().map(|f| f.id).collect::<Vec<_>>();
    assert_eq!(ids(&*first), ids(&*second));
    assert_eq!(h.engine.get_response(PHONE, "menu").await, "1) Pedidos 2) Ayuda");
    assert_eq!(h.engine.get_response(PHONE, "hola").await, "¡Hola!");
}

#[tokio::test]
async fn test_test_flow_leaves_state_untouched() {
    let h = harness(None, EngineConfig::default());
    let flow = h
        .admin
        .create(FlowDraft::new("saludo", "+ hola\n- ¡Hola!"))
        .await
        .unwrap();
    let version = h.engine.snapshot().version;

    let mut vars = VariableBag::new();
    vars.insert("nombre".into(), StateValue::String("ana".into()));
    let result = h
        .engine
        .test_flow("+ hola\n- Hola <get nombre><set visto=si>", "hola", vars);
    assert!(result.success);
    assert!(result.valid_response);
    assert_eq!(result.response.as_deref(), Some("Hola ana"));
    assert_eq!(result.vars.get("visto"), Some(&StateValue::String("si".into())));

    let stored = h.flows.get_by_id(flow.id).await.unwrap().unwrap();
    assert_eq!(stored.usage_count, 0);
    assert_eq!(h.engine.snapshot().version, version);
    assert_eq!(h.interactions.count_total().await.unwrap(), 0);

    let failed = h.engine.test_flow("^ sin regla", "hola", VariableBag::new());
    assert!(!failed.success);
    assert!(failed.error.is_some());
}

#[tokio::test]
async fn test_deleting_active_default_changes_nothing() {
    let h = harness(None, EngineConfig::default());
    let general = h
        .admin
        .create(FlowDraft::new("general", "+ *\n- ¿En qué te ayudo?").as_default())
        .await
        .unwrap();
    let before = h.engine.snapshot().version;

    assert_eq!(
        h.admin.delete(general.id).await,
        Err(AdminError::DeleteActiveDefault(general.id))
    );
    assert!(h.flows.get_by_id(general.id).await.unwrap().is_some());
    assert_eq!(h.engine.snapshot().version, before);
    assert_eq!(h.engine.get_response(PHONE, "algo").await, "¿En qué te ayudo?");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_set_default_keeps_one_default() {
    let h = harness(None, EngineConfig::default());
    let mut ids = Vec::new();
    for i in 0..5 {
        let flow = h
            .admin
            .create(FlowDraft::new(format!("flujo{i}"), format!("+ hola{i}\n- {i}")))
            .await
            .unwrap();
        ids.push(flow.id);
    }

    let calls = ids.iter().cycle().take(20).map(|id| {
        let admin = h.admin.clone();
        let id = *id;
        tokio::spawn(async move { admin.set_default(id).await })
    });
    for res in join_all(calls).await {
        res.unwrap().unwrap();
    }

    let defaults = h
        .flows
        .list()
        .await
        .unwrap()
        .into_iter()
        .filter(|f| f.is_default)
        .count();
    assert_eq!(defaults, 1);
    assert_eq!(h.engine.snapshot().flows.iter().filter(|f| f.is_default).count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_messages_during_reloads_see_a_whole_brain() {
    let h = harness(None, EngineConfig::default());
    h.admin
        .create(FlowDraft::new("saludo", "+ hola\n- ¡Hola!"))
        .await
        .unwrap();

    let writer = {
        let admin = h.admin.clone();
        tokio::spawn(async move {
            for i in 0..20 {
                admin
                    .create(FlowDraft::new(format!("extra{i}"), format!("+ extra {i}\n- e{i}")).with_priority(50))
                    .await
                    .unwrap();
            }
        })
    };

    let readers = (0..50).map(|i| {
        let engine = h.engine.clone();
        tokio::spawn(async move { engine.process_message(&format!("phone{}", i % 7), "hola").await })
    });
    for outcome in join_all(readers).await {
        let outcome = outcome.unwrap();
        assert!(!outcome.is_degraded());
        assert_eq!(outcome.result().response, "¡Hola!");
    }
    writer.await.unwrap();

    assert_eq!(h.engine.snapshot().flows.len(), 21);
    assert_eq!(h.interactions.count_total().await.unwrap(), 50);
}

#[tokio::test]
async fn test_interaction_store_outage_reports_simulation() {
    let h = harness(None, EngineConfig::default());
    h.admin
        .create(FlowDraft::new("saludo", "+ hola\n- ¡Hola!"))
        .await
        .unwrap();
    h.interactions.set_available(false);

    let outcome = h.engine.process_message(PHONE, "hola").await;
    assert!(outcome.is_degraded());
    assert_eq!(outcome.result().response, "¡Hola!");
    assert_eq!(outcome.result().response_type, ResponseType::Simulation);

    let json = serde_json::to_value(&outcome).unwrap();
    assert_eq!(json["status"], "degraded");
    assert_eq!(json["result"]["type"], "simulation");
}

#[tokio::test]
async fn test_admin_update_keeps_usage_recorded_meanwhile() {
    let (engine, admin, flows) = interleaving_harness();
    let flow = admin
        .create(FlowDraft::new("saludo", "+ hola\n- ¡Hola!"))
        .await
        .unwrap();
    assert_eq!(engine.get_response(PHONE, "hola").await, "¡Hola!");

    flows.usage_before_update.store(true, Ordering::SeqCst);
    let updated = admin
        .update(flow.id, FlowPatch { priority: Some(3), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(updated.priority, 3);
    assert_eq!(updated.usage_count, 2);

    let info = engine.get_info().await;
    let usage = info
        .per_flow_usage
        .iter()
        .find(|u| u.flow_id == flow.id)
        .unwrap();
    assert_eq!(usage.usage_count, 2);
    assert!(usage.last_used.is_some());
}

#[tokio::test]
async fn test_failed_default_write_keeps_previous_default() {
    let (engine, admin, flows) = interleaving_harness();
    let general = admin
        .create(FlowDraft::new("general", "+ *\n- ¿En qué te ayudo?").as_default())
        .await
        .unwrap();
    let ventas = admin
        .create(FlowDraft::new("ventas", "+ precio\n- 10 euros"))
        .await
        .unwrap();

    flows.fail_writes.store(true, Ordering::SeqCst);
    assert!(
        admin
            .create(FlowDraft::new("nuevo", "+ *\n- nuevo").as_default())
            .await
            .is_err()
    );
    assert!(admin.set_default(ventas.id).await.is_err());
    flows.fail_writes.store(false, Ordering::SeqCst);

    let default = flows.get_default_flow().await.unwrap().unwrap();
    assert_eq!(default.id, general.id);
    assert!(flows.get_by_name("nuevo").await.unwrap().is_none());
    assert_eq!(engine.get_response(PHONE, "algo").await, "¿En qué te ayudo?");
}
