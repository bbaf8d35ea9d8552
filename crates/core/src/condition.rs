//! Status conditions: at most one entry per type, keyed by type.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConditionType(Cow<'static, str>);

impl ConditionType {
    pub const COMPOSE_SUCCESS: ConditionType = ConditionType(Cow::Borrowed("ComposeSuccess"));
    pub const COMPOSE_FAILURE: ConditionType = ConditionType(Cow::Borrowed("ComposeFailure"));
    pub const COMPOSE_SCHEMA: ConditionType = ConditionType(Cow::Borrowed("ComposeSchema"));

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
    pub status: String,
    pub message: String,
}

impl Condition {
    pub fn now(status: impl Into<String>, message: impl Into<String>) -> Self {
        Self { last_transition_time: Utc::now(), status: status.into(), message: message.into() }
    }
}

pub type Conditions = BTreeMap<ConditionType, Condition>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conditions_keyed_by_type_string() {
        let mut c = Conditions::new();
        c.insert(ConditionType::COMPOSE_FAILURE, Condition::now("failure", "boom"));
        c.insert(ConditionType::COMPOSE_FAILURE, Condition::now("failure", "again"));
        assert_eq!(c.len(), 1);
        let v = serde_json::to_value(&c).expect("ser");
        assert_eq!(v["ComposeFailure"]["message"], "again");
        let back: Conditions = serde_json::from_value(v).expect("de");
        assert_eq!(back[&ConditionType::COMPOSE_FAILURE].status, "failure");
    }
}
