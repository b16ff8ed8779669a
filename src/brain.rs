//! Compiled, immutable view of every active flow.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::dialogue::{DialogueSession, Interpreter};
use crate::flow::Flow;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SkippedFlow {
    pub flow_id: Uuid,
    pub name: String,
    pub reason: String,
}

/// Flow metadata carried into the snapshot so a turn never has to go back
/// to the flow store to decide policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrainFlow {
    pub id: Uuid,
    pub name: String,
    pub priority: i32,
    pub is_default: bool,
    pub fallback_to_llm: bool,
    pub max_context_messages: usize,
    pub rule_count: usize,
}

impl From<&Flow> for BrainFlow {
    fn from(flow: &Flow) -> Self {
        Self {
            id: flow.id,
            name: flow.name.clone(),
            priority: flow.priority,
            is_default: flow.is_default,
            fallback_to_llm: flow.fallback_to_llm,
            max_context_messages: flow.max_context_messages,
            rule_count: 0,
        }
    }
}

/// Never mutated after [`BrainCompiler::build`] returns; reloads publish a
/// new one.
#[derive(Debug)]
pub struct BrainSnapshot {
    pub version: u64,
    pub session: Arc<dyn DialogueSession>,
    /// Flows in merge order.
    pub flows: Vec<BrainFlow>,
    pub skipped: Vec<SkippedFlow>,
    pub built_at: DateTime<Utc>,
}

impl BrainSnapshot {
    pub fn empty(interpreter: &Interpreter) -> Self {
        Self {
            version: 0,
            session: interpreter.builder().finish(),
            flows: Vec::new(),
            skipped: Vec::new(),
            built_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn flow(&self, id: Uuid) -> Option<&BrainFlow> {
        self.flows.iter().find(|f| f.id == id)
    }

    /// Map an interpreter unit id back to its flow.
    pub fn flow_for_unit(&self, unit_id: &str) -> Option<&BrainFlow> {
        Uuid::parse_str(unit_id).ok().and_then(|id| self.flow(id))
    }

    /// The flow whose settings apply when nothing matched: the default flow,
    /// or the first flow in merge order.
    pub fn policy_owner(&self) -> Option<&BrainFlow> {
        self.flows
            .iter()
            .find(|f| f.is_default)
            .or_else(|| self.flows.first())
    }
}

#[derive(Debug, Clone)]
pub struct BrainCompiler {
    interpreter: Interpreter,
}

impl BrainCompiler {
    pub fn new(interpreter: Interpreter) -> Self {
        Self { interpreter }
    }

    /// Merge `flows` (priority ascending) into one session. Non-default
    /// flows go first, the default flow last. A flow that fails to compile
    /// is recorded in `skipped` and the rest still load.
    pub fn build(&self, flows: &[Flow], version: u64) -> BrainSnapshot {
        let ordered = flows
            .iter()
            .filter(|f| f.is_active && !f.is_default)
            .chain(flows.iter().filter(|f| f.is_active && f.is_default));

        let mut builder = self.interpreter.builder();
        let mut merged = Vec::new();
        let mut skipped = Vec::new();

        for flow in ordered {
            match builder.merge(&flow.id.to_string(), &flow.script) {
                Ok(unit) => {
                    debug!(flow = %flow.name, rules = unit.rule_count, "flow merged");
                    let mut entry = BrainFlow::from(flow);
                    entry.rule_count = unit.rule_count;
                    merged.push(entry);
                }
                Err(e) => {
                    warn!(flow = %flow.name, flow_id = %flow.id, "⚠️ flow skipped: {e}");
                    skipped.push(SkippedFlow {
                        flow_id: flow.id,
                        name: flow.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        BrainSnapshot {
            version,
            session: builder.finish(),
            flows: merged,
            skipped,
            built_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialogue::rules::RuleInterpreter;
    use crate::flow::FlowDraft;

    fn compiler() -> BrainCompiler {
        BrainCompiler::new(RuleInterpreter::new())
    }

    fn flow(draft: FlowDraft) -> Flow {
        Flow::from_draft(draft)
    }

    #[test]
    fn test_bad_flow_is_skipped_not_fatal() {
        let good = flow(FlowDraft::new("good", "+ hola\n- ¡Hola!"));
        let bad = flow(FlowDraft::new("bad", "- reply without trigger"));
        let brain = compiler().build(&[bad.clone(), good.clone()], 1);

        assert_eq!(brain.flows.len(), 1);
        assert_eq!(brain.flows[0].id, good.id);
        assert_eq!(brain.skipped.len(), 1);
        assert_eq!(brain.skipped[0].flow_id, bad.id);
        assert!(brain.skipped[0].reason.contains("line 1"));
        assert!(brain.session.reply("k", "hola").is_match());
    }

    #[test]
    fn test_default_flow_merged_last() {
        let default = flow(FlowDraft::new("default", "+ *\n- menu").with_priority(0).as_default());
        let sales = flow(FlowDraft::new("sales", "+ *\n- ventas").with_priority(5));
        let brain = compiler().build(&[default.clone(), sales.clone()], 1);

        assert_eq!(brain.flows[0].id, sales.id);
        assert_eq!(brain.flows[1].id, default.id);
        assert_eq!(brain.policy_owner().unwrap().id, default.id);
        let reply = brain.session.reply("k", "lo que sea");
        assert_eq!(reply.text, "ventas");
        assert_eq!(
            brain.flow_for_unit(&reply.matched.unwrap().unit_id).unwrap().id,
            sales.id
        );
    }

    #[test]
    fn test_policy_owner_without_default() {
        let a = flow(FlowDraft::new("a", "+ a\n- a").with_priority(1));
        let b = flow(FlowDraft::new("b", "+ b\n- b").with_priority(2));
        let brain = compiler().build(&[a.clone(), b], 1);
        assert_eq!(brain.policy_owner().unwrap().id, a.id);
    }

    #[test]
    fn test_inactive_flows_are_left_out() {
        let off = flow(FlowDraft::new("off", "+ hola\n- hi").inactive());
        let brain = compiler().build(&[off], 1);
        assert!(brain.is_empty());
        assert!(brain.skipped.is_empty());
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let flows = vec![
            flow(FlowDraft::new("a", "+ hola\n- ¡Hola!\n+ adios\n- Chao")),
            flow(FlowDraft::new("b", "+ *\n- no entiendo").as_default()),
        ];
        let c = compiler();
        let first = c.build(&flows, 1);
        let second = c.build(&flows, 2);
        for input in ["hola", "adios", "otra cosa"] {
            assert_eq!(first.session.reply("k", input), second.session.reply("k", input));
        }
        assert_eq!(first.flows, second.flows);
    }
}
