//! Declarative achievement conditions and their evaluation.
//!
//! Evaluation is fail-closed: a condition type or operator outside the known
//! set decodes to an `Unknown` variant and never matches. Inside a
//! definitions file, an ill-typed payload (a string where a number belongs,
//! a missing key) decodes to `Unknown` as well.

use crate::state::GameState;
use serde::{Deserialize, Deserializer, Serialize};

/// A predicate over [`GameState`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Compare a numeric counter (missing counters read as 0).
    Counter {
        #[serde(default)]
        key: String,
        value: f64,
        #[serde(default)]
        operator: Operator,
    },

    /// A flag must be set to exactly `true`.
    Flag { key: String },

    /// The player must have made this choice at some point.
    Choice { value: String },

    /// The current scene must be this scene id.
    StoryProgress { value: String },

    #[default]
    #[serde(other)]
    Unknown,
}

/// Numeric comparison operator. Defaults to `gte`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Gt,
    #[default]
    Gte,
    Lt,
    Lte,
    #[serde(other)]
    Unknown,
}

impl Operator {
    pub fn compare(self, actual: f64, target: f64) -> bool {
        match self {
            Operator::Eq => actual == target,
            Operator::Gt => actual > target,
            Operator::Gte => actual >= target,
            Operator::Lt => actual < target,
            Operator::Lte => actual <= target,
            Operator::Unknown => false,
        }
    }
}

/// Evaluate `condition` against a state snapshot.
pub fn evaluate(condition: &Condition, state: &GameState) -> bool {
    match condition {
        Condition::Counter {
            key,
            value,
            operator,
        } => operator.compare(state.counter(key), *value),
        Condition::Flag { key } => state.flag(key) == Some(true),
        Condition::Choice { value } => state.has_chosen(value),
        Condition::StoryProgress { value } => state.current_scene.as_deref() == Some(value.as_str()),
        Condition::Unknown => false,
    }
}

impl Condition {
    pub fn evaluate(&self, state: &GameState) -> bool {
        evaluate(self, state)
    }

    /// Shorthand for a counter condition.
    pub fn counter(key: impl Into<String>, operator: Operator, value: f64) -> Self {
        Condition::Counter {
            key: key.into(),
            value,
            operator,
        }
    }

    /// Decode `value`, falling back to [`Condition::Unknown`] when it does not
    /// describe a well-formed condition.
    pub fn from_value_lenient(value: serde_json::Value) -> Self {
        match serde_json::from_value(value) {
            Ok(condition) => condition,
            Err(e) => {
                tracing::warn!(error = %e, "malformed condition, it will never match");
                Condition::Unknown
            }
        }
    }
}

/// `deserialize_with` adapter for [`Condition::from_value_lenient`].
pub(crate) fn deserialize_lenient<'de, D>(deserializer: D) -> Result<Condition, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(Condition::from_value_lenient(value))
}
