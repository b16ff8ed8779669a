use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Conversation variables, keyed by name. Ordered so that snapshots and
/// prompts render deterministically.
pub type VariableBag = BTreeMap<String, StateValue>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum StateValue {
    String(String),
    Number(f64),
    Boolean(bool),
    Null,
}

impl StateValue {
    pub fn as_str(&self) -> Option<&str> {
        if let StateValue::String(s) = self {
            Some(s)
        } else {
            None
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        if let StateValue::Number(n) = self {
            Some(*n)
        } else {
            None
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        if let StateValue::Boolean(b) = self {
            Some(*b)
        } else {
            None
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            StateValue::String(s) => json!(s),
            StateValue::Number(n) => json!(n),
            StateValue::Boolean(b) => json!(b),
            StateValue::Null => Value::Null,
        }
    }

    /// Interpreter variables are plain text; numbers that look like numbers
    /// come back as numbers so the bag keeps its string/number shape.
    pub fn from_script_text(text: &str) -> Self {
        let trimmed = text.trim();
        match trimmed.parse::<f64>() {
            Ok(n) if n.is_finite() => StateValue::Number(n),
            _ => StateValue::String(text.to_string()),
        }
    }

    /// Text form handed to the interpreter.
    pub fn to_script_text(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::String(s) => write!(f, "{s}"),
            StateValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            StateValue::Number(n) => write!(f, "{n}"),
            StateValue::Boolean(b) => write!(f, "{b}"),
            StateValue::Null => write!(f, "undefined"),
        }
    }
}

impl From<&str> for StateValue {
    fn from(value: &str) -> Self {
        StateValue::String(value.to_string())
    }
}

impl From<String> for StateValue {
    fn from(value: String) -> Self {
        StateValue::String(value)
    }
}

impl From<f64> for StateValue {
    fn from(value: f64) -> Self {
        StateValue::Number(value)
    }
}

impl TryFrom<Value> for StateValue {
    type Error = ();

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::String(s) => Ok(StateValue::String(s)),
            Value::Number(n) => Ok(StateValue::Number(n.as_f64().ok_or(())?)),
            Value::Bool(b) => Ok(StateValue::Boolean(b)),
            Value::Null => Ok(StateValue::Null),
            // nested values are flattened to their JSON text
            other => Ok(StateValue::String(other.to_string())),
        }
    }
}

/// Render a bag as a JSON object, used for prompts and API payloads.
pub fn bag_to_json(bag: &VariableBag) -> Value {
    Value::Object(
        bag.iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect(),
    )
}
