use crate::loader::PolicySource;

pub const TOOL_ACCESS_POLICY: &str = r#"package agentguard.tool_access

import rego.v1

default allow := false

allow if {
	tool_allowed
	not tool_blocked
	not contains_forbidden_pattern
	not rate_limit_exceeded
}

tool_allowed if {
	input.tool.name in data.policies.allowed_tools[input.agent.id]
}

tool_allowed if {
	input.tool.category in data.policies.allowed_categories[input.agent.id]
}

tool_blocked if {
	input.tool.name in data.policies.blocked_tools[input.agent.id]
}

contains_forbidden_pattern if {
	some pattern in data.policies.forbidden_patterns
	regex.match(pattern, json.marshal(input.tool.parameters))
}

rate_limit_exceeded if {
	observed := data.rate_limits[input.agent.id][input.tool.name]
	observed > data.policies.rate_limits[input.tool.name].max_per_minute
}

denial_reasons contains reason if {
	not tool_allowed
	reason := sprintf("tool %s is not allowed for agent %s", [input.tool.name, input.agent.id])
}

denial_reasons contains reason if {
	tool_blocked
	reason := sprintf("tool %s is blocked for agent %s", [input.tool.name, input.agent.id])
}

denial_reasons contains "tool parameters contain a forbidden pattern" if {
	contains_forbidden_pattern
}

denial_reasons contains reason if {
	rate_limit_exceeded
	reason := sprintf("rate limit exceeded for tool %s", [input.tool.name])
}

violations contains violation if {
	not tool_allowed
	violation := {
		"policy": "tool_access",
		"rule": "tool_allowed",
		"description": sprintf("tool %s is not in the allow list", [input.tool.name]),
		"severity": "high",
	}
}

violations contains violation if {
	tool_blocked
	violation := {
		"policy": "tool_access",
		"rule": "tool_blocked",
		"description": sprintf("tool %s is explicitly blocked", [input.tool.name]),
		"severity": "critical",
	}
}

violations contains violation if {
	contains_forbidden_pattern
	violation := {
		"policy": "tool_access",
		"rule": "forbidden_pattern",
		"description": "tool parameters matched a forbidden pattern",
		"severity": "high",
	}
}
"#;

pub const DATA_FLOW_POLICY: &str = r#"package agentguard.data_flow

import rego.v1

default allow := false

allow if {
	destination_allowed
	not source_restricted
}

destination_allowed if {
	input.data.destination in data.policies.allowed_destinations[input.data.classification]
}

destination_trusted if {
	input.data.destination in data.policies.trusted_destinations
}

source_restricted if {
	some sources in data.policies.restricted_sources
	input.data.source in sources
	not destination_trusted
}

requires_redaction if {
	count(input.data.pii_fields) > 0
	not destination_trusted
}

redaction_fields := input.data.pii_fields if {
	requires_redaction
}

denial_reasons contains reason if {
	not destination_allowed
	reason := sprintf("%s data may not flow to %s", [input.data.classification, input.data.destination])
}

denial_reasons contains reason if {
	source_restricted
	reason := sprintf("data from %s may only flow to trusted destinations", [input.data.source])
}

violations contains violation if {
	not destination_allowed
	violation := {
		"policy": "data_flow",
		"rule": "destination_allowed",
		"description": sprintf("destination %s is not allowed for %s data", [input.data.destination, input.data.classification]),
		"severity": "high",
	}
}

violations contains violation if {
	source_restricted
	violation := {
		"policy": "data_flow",
		"rule": "source_restricted",
		"description": sprintf("source %s is restricted", [input.data.source]),
		"severity": "critical",
	}
}
"#;

/// Combines the tool access and data flow packages into the document served at
/// `data.agentguard.decision`.
pub const DECISION_POLICY: &str = r#"package agentguard

import rego.v1

tool_request if {
	input.tool
}

data_request if {
	input.data
}

default allowed := false

allowed if {
	tool_request
	not data_request
	data.agentguard.tool_access.allow
}

allowed if {
	data_request
	not tool_request
	data.agentguard.data_flow.allow
}

allowed if {
	tool_request
	data_request
	data.agentguard.tool_access.allow
	data.agentguard.data_flow.allow
}

reasons contains reason if {
	tool_request
	some reason in data.agentguard.tool_access.denial_reasons
}

reasons contains reason if {
	data_request
	some reason in data.agentguard.data_flow.denial_reasons
}

reasons contains "request carries neither a tool invocation nor a data flow" if {
	not tool_request
	not data_request
}

violations contains violation if {
	tool_request
	some violation in data.agentguard.tool_access.violations
}

violations contains violation if {
	data_request
	some violation in data.agentguard.data_flow.violations
}

decision := {
	"allow": allowed,
	"reasons": reasons,
	"violations": violations,
}
"#;

pub fn builtin_sources() -> Vec<PolicySource> {
    vec![
        PolicySource::new("builtin/tool_access.rego", TOOL_ACCESS_POLICY),
        PolicySource::new("builtin/data_flow.rego", DATA_FLOW_POLICY),
        PolicySource::new("builtin/decision.rego", DECISION_POLICY),
    ]
}
