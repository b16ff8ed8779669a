//! Per-turn decision policy: brain match, assistant, canned reply.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::assistant::{Assistant, AssistantRequest, HistoryTurn, complete_within};
use crate::brain::{BrainFlow, BrainSnapshot};
use crate::config::EngineConfig;
use crate::context::ConversationContext;
use crate::dialogue::{DEFAULT_TOPIC, MatchInfo, TOPIC_VAR};
use crate::error::AssistantError;
use crate::interaction::ResponseType;
use crate::logger::Telemetry;

pub const EXACT_CONFIDENCE: f64 = 1.0;
pub const WILDCARD_CONFIDENCE: f64 = 0.6;
pub const ASSISTANT_CONFIDENCE: f64 = 0.5;
pub const DEFAULT_CONFIDENCE: f64 = 0.0;

/// What the chain decided for one turn. Persisting it is the caller's job.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainOutcome {
    pub response: String,
    pub response_type: ResponseType,
    pub confidence_score: f64,
    /// Flow credited in the interaction record.
    pub flow_id: Option<Uuid>,
    /// Flow whose trigger fired; only this one gets its usage bumped.
    pub matched_flow: Option<Uuid>,
    pub tokens_used: Option<u32>,
    /// Variables the matched rule set this turn, topic excluded.
    pub variables: BTreeMap<String, String>,
    pub topic: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FallbackChain {
    assistant: Option<Assistant>,
    config: Arc<EngineConfig>,
    telemetry: Telemetry,
}

struct BrainAttempt {
    text: String,
    matched: Option<MatchInfo>,
    variables: BTreeMap<String, String>,
    topic: Option<String>,
}

/// A lone `*` swallows everything; a flow that allows the assistant prefers
/// it over such a catch-all reply.
fn is_catch_all(info: &MatchInfo) -> bool {
    info.wildcard && info.trigger.trim() == "*"
}

impl FallbackChain {
    pub fn new(assistant: Option<Assistant>, config: Arc<EngineConfig>, telemetry: Telemetry) -> Self {
        Self {
            assistant,
            config,
            telemetry,
        }
    }

    pub fn has_assistant(&self) -> bool {
        self.assistant.is_some()
    }

    pub async fn run(
        &self,
        brain: &BrainSnapshot,
        session_key: &str,
        context: &ConversationContext,
        text: &str,
        deadline: Instant,
    ) -> ChainOutcome {
        let attempt = self.ask_brain(brain, session_key, context, text);

        if let Some(info) = attempt.matched.clone() {
            let flow = brain.flow_for_unit(&info.unit_id);
            let confidence = if info.wildcard {
                WILDCARD_CONFIDENCE
            } else {
                EXACT_CONFIDENCE
            };
            let flow_id = flow.map(|f| f.id);
            debug!(trigger = %info.trigger, ?flow_id, confidence, "brain matched");

            if let Some(flow) = flow.filter(|f| f.fallback_to_llm && is_catch_all(&info)) {
                if let Some(outcome) = self.ask_assistant(flow, context, text, deadline, &attempt).await {
                    return outcome;
                }
            }

            return ChainOutcome {
                response: attempt.text,
                response_type: ResponseType::Flow,
                confidence_score: confidence,
                flow_id,
                matched_flow: flow_id,
                tokens_used: None,
                variables: attempt.variables,
                topic: attempt.topic,
            };
        }

        if let Some(owner) = brain.policy_owner().filter(|f| f.fallback_to_llm) {
            if let Some(outcome) = self.ask_assistant(owner, context, text, deadline, &attempt).await {
                return outcome;
            }
        }

        info!("No flow matched, using default reply");
        ChainOutcome {
            response: self.config.default_response.clone(),
            response_type: ResponseType::Default,
            confidence_score: DEFAULT_CONFIDENCE,
            flow_id: None,
            matched_flow: None,
            tokens_used: None,
            variables: attempt.variables,
            topic: attempt.topic,
        }
    }

    /// Load the context into a clean session slot, ask for a reply, read the
    /// variables back and free the slot again.
    fn ask_brain(
        &self,
        brain: &BrainSnapshot,
        session_key: &str,
        context: &ConversationContext,
        text: &str,
    ) -> BrainAttempt {
        let session = &brain.session;
        session.clear_session(session_key);
        for (name, value) in &context.variables {
            session.set_variable(session_key, name, &value.to_script_text());
        }
        let topic = context.current_topic.as_deref().unwrap_or(DEFAULT_TOPIC);
        session.set_variable(session_key, TOPIC_VAR, topic);

        let reply = session.reply(session_key, text);
        let written = session.written_keys(session_key);
        let mut variables = session.variables(session_key);
        session.clear_session(session_key);

        // side effects of a rule only count when it produced a reply
        if !reply.is_match() {
            return BrainAttempt {
                text: reply.text,
                matched: None,
                variables: BTreeMap::new(),
                topic: context.current_topic.clone(),
            };
        }
        let topic = variables
            .remove(TOPIC_VAR)
            .filter(|t| t != DEFAULT_TOPIC);
        variables.retain(|name, _| written.contains(name));
        BrainAttempt {
            text: reply.text,
            matched: reply.matched,
            variables,
            topic,
        }
    }

    async fn ask_assistant(
        &self,
        flow: &BrainFlow,
        context: &ConversationContext,
        text: &str,
        deadline: Instant,
        attempt: &BrainAttempt,
    ) -> Option<ChainOutcome> {
        let assistant = self.assistant.as_ref()?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            self.telemetry.assistant_timeouts.add(1, &[]);
            warn!("No time budget left for the assistant");
            return None;
        }

        let llm = &self.config.llm;
        let request = AssistantRequest {
            system_prompt: llm.system_prompt.clone(),
            prompt: text.to_string(),
            history: context
                .turns
                .iter()
                .map(|t| HistoryTurn {
                    user: t.message_in.clone(),
                    assistant: t.message_out.clone(),
                })
                .collect(),
            variables: context.variables.clone(),
            max_tokens: llm.max_tokens,
            temperature: llm.temperature,
            timeout: remaining,
        };

        match complete_within(assistant.as_ref(), &request).await {
            Ok(reply) => {
                info!(assistant = assistant.name(), flow = %flow.name, "Assistant answered");
                Some(ChainOutcome {
                    response: reply.text,
                    response_type: ResponseType::FallbackLlm,
                    confidence_score: reply
                        .confidence
                        .unwrap_or(ASSISTANT_CONFIDENCE)
                        .clamp(0.0, 1.0),
                    flow_id: Some(flow.id),
                    matched_flow: None,
                    tokens_used: reply.tokens_used,
                    variables: attempt.variables.clone(),
                    topic: attempt.topic.clone(),
                })
            }
            Err(AssistantError::Timeout(ms)) => {
                self.telemetry.assistant_timeouts.add(1, &[]);
                warn!("⏱️ Assistant timed out after {ms} ms");
                None
            }
            Err(e) => {
                self.telemetry.assistant_failures.add(1, &[]);
                warn!("Assistant failed: {e}");
                None
            }
        }
    }
}
