//! Adapter over the rule-based dialogue interpreter.
//!
//! The engine never looks inside flow scripts. It asks an interpreter to
//! compile them, merges the compiled units into one session and asks that
//! session for replies. Everything here is expressed as traits so that the
//! built-in [`rules::RuleInterpreter`] can be swapped for another dialect.

pub mod rules;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::sync::Arc;

use crate::error::CompileError;

/// Text produced by a session when no trigger matched the input. It is never
/// shown to a user; callers turn it into a fallback step.
pub const NO_MATCH: &str = "[ERR: No Reply Matched]";

/// Name of the session variable that holds the current topic.
pub const TOPIC_VAR: &str = "topic";

/// Topic every rule outside a `> topic` block belongs to.
pub const DEFAULT_TOPIC: &str = "random";

pub type Interpreter = Arc<dyn DialogueInterpreter>;

/// Summary of a successfully compiled script.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledUnit {
    pub rule_count: usize,
    pub wildcard_rules: usize,
    pub topics: Vec<String>,
}

/// Which rule produced a reply.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchInfo {
    /// Identifier given to the unit when it was merged (the flow id).
    pub unit_id: String,
    /// Trigger source text as written in the script.
    pub trigger: String,
    /// True when the trigger contains a wildcard token.
    pub wildcard: bool,
    pub topic: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub text: String,
    pub matched: Option<MatchInfo>,
}

impl Reply {
    pub fn no_match() -> Self {
        Self {
            text: NO_MATCH.to_string(),
            matched: None,
        }
    }

    /// A reply counts as a match only when a rule fired and produced text.
    pub fn is_match(&self) -> bool {
        self.matched.is_some() && !is_no_match(&self.text)
    }
}

pub fn is_no_match(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.is_empty() || trimmed == NO_MATCH
}

/// Compiles scripts and hands out session builders.
pub trait DialogueInterpreter: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    /// Compile a script without keeping it. Malformed input is reported as a
    /// [`CompileError`], never as a panic.
    fn compile(&self, script: &str) -> Result<CompiledUnit, CompileError>;

    /// Start an empty session that units can be merged into.
    fn builder(&self) -> Box<dyn SessionBuilder>;
}

/// Accumulates compiled units in match order.
pub trait SessionBuilder: Send {
    /// Compile `script` and append it under `unit_id`. On error the builder is
    /// left exactly as it was.
    fn merge(&mut self, unit_id: &str, script: &str) -> Result<CompiledUnit, CompileError>;

    fn finish(self: Box<Self>) -> Arc<dyn DialogueSession>;
}

/// A compiled, queryable set of rules. Rules are immutable once built; the
/// only mutable part is the per-session-key variable table.
pub trait DialogueSession: Send + Sync + Debug {
    fn reply(&self, session_key: &str, input: &str) -> Reply;

    fn set_variable(&self, session_key: &str, name: &str, value: &str);

    fn get_variable(&self, session_key: &str, name: &str) -> Option<String>;

    fn variables(&self, session_key: &str) -> BTreeMap<String, String>;

    /// Variables the script itself set during the last `reply`, even when the
    /// value did not change. Values loaded with `set_variable` are not listed.
    fn written_keys(&self, session_key: &str) -> BTreeSet<String>;

    /// Drop every variable stored for `session_key`.
    fn clear_session(&self, session_key: &str);

    /// Unit ids in merge order.
    fn unit_ids(&self) -> Vec<String>;

    fn rule_count(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_match_detection() {
        assert!(is_no_match(NO_MATCH));
        assert!(is_no_match("   "));
        assert!(!is_no_match("hola"));
        assert!(!Reply::no_match().is_match());
    }

    #[test]
    fn test_reply_without_rule_is_not_a_match() {
        let reply = Reply {
            text: "hola".into(),
            matched: None,
        };
        assert!(!reply.is_match());
    }
}
