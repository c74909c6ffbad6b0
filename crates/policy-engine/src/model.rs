use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::PolicyError;

/// Request context submitted by an agent SDK before it invokes a tool.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct EvaluationInput {
    pub agent: AgentContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<DataContext>,
    pub request: RequestContext,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub environment: HashMap<String, Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct AgentContext {
    pub id: String,
    pub name: String,
    pub team: String,
    pub environment: String,
    pub capabilities: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct ToolContext {
    pub name: String,
    pub category: String,
    pub parameters: Map<String, Value>,
    pub external: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct DataContext {
    pub classification: String,
    pub source: String,
    pub destination: String,
    pub pii_fields: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct RequestContext {
    pub user_id: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(alias = "origin")]
    pub ip: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Violation {
    pub policy: String,
    pub rule: String,
    pub description: String,
    pub severity: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct Decision {
    pub allow: bool,
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default)]
    pub violations: Vec<Violation>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub eval_time_us: u64,
}

impl Decision {
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allow: false,
            reasons: vec![reason.into()],
            ..Self::default()
        }
    }

    /// Denial returned when the engine cannot produce a verdict.
    pub fn fail_closed(err: &PolicyError) -> Self {
        let reason = if err.is_unavailable() {
            "policy engine not ready: no policy loaded, denying by default".to_string()
        } else if err.is_protocol() {
            "invalid request body".to_string()
        } else {
            format!("policy evaluation failed, denying by default: {err}")
        };
        let mut decision = Self::deny(reason);
        decision
            .metadata
            .insert("outcome".into(), Value::from(err.outcome()));
        decision
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn outcome(&self) -> &str {
        self.metadata
            .get("outcome")
            .and_then(Value::as_str)
            .unwrap_or(if self.allow { "allow" } else { "deny" })
    }
}

/// Shape of a raw query result. Anything other than a boolean or an object is
/// treated as undefined and denies.
#[derive(Debug, PartialEq)]
pub(crate) enum RawDecision {
    Verdict(bool),
    Document(Decision),
    Undefined,
}

impl RawDecision {
    pub(crate) fn from_value(value: Option<Value>) -> Self {
        match value {
            Some(Value::Bool(allow)) => RawDecision::Verdict(allow),
            Some(Value::Object(map)) => RawDecision::Document(document_from_map(map)),
            _ => RawDecision::Undefined,
        }
    }

    pub(crate) fn into_decision(self) -> Decision {
        match self {
            RawDecision::Verdict(allow) => Decision {
                allow,
                ..Decision::default()
            },
            RawDecision::Document(decision) => decision,
            RawDecision::Undefined => Decision::default(),
        }
    }
}

fn document_from_map(mut map: Map<String, Value>) -> Decision {
    let allow = matches!(map.get("allow"), Some(Value::Bool(true)));
    let reasons = map
        .get("reasons")
        .or_else(|| map.get("denial_reasons"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let violations = map
        .get("violations")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(violation_from_value).collect())
        .unwrap_or_default();
    let metadata = match map.remove("metadata") {
        Some(Value::Object(metadata)) => metadata,
        _ => Map::new(),
    };
    Decision {
        allow,
        reasons,
        violations,
        metadata,
        eval_time_us: 0,
    }
}

fn violation_from_value(value: &Value) -> Option<Violation> {
    let object = value.as_object()?;
    let field = |name: &str| {
        object
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    Some(Violation {
        policy: field("policy"),
        rule: field("rule"),
        description: field("description"),
        severity: field("severity"),
    })
}
