use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use crate::api::{EngineOptions, PolicyEngine, PolicySet, DEFAULT_POLICY_PATH};
use crate::errors::PolicyError;
use crate::loader::PolicySource;
use crate::model::{AgentContext, DataContext, Decision, EvaluationInput, ToolContext};

const ALLOW_ALL: &str = r#"package agentguard

import rego.v1

decision := {"allow": true, "reasons": ["policy-a"]}
"#;

const DENY_ALL: &str = r#"package agentguard

import rego.v1

decision := {"allow": false, "reasons": ["policy-b"]}
"#;

// Millions of iterations; far slower than any deadline used below.
const SLOW: &str = r#"package agentguard

import rego.v1

decision := count({1 | some i in numbers.range(1, 3000); some j in numbers.range(1, 3000)}) < 0
"#;

fn source(rego: &str) -> Vec<PolicySource> {
    vec![PolicySource::new("test.rego", rego)]
}

fn tool_input(agent: &str, tool: &str) -> EvaluationInput {
    EvaluationInput {
        agent: AgentContext {
            id: agent.into(),
            ..AgentContext::default()
        },
        tool: Some(ToolContext {
            name: tool.into(),
            category: "search".into(),
            ..ToolContext::default()
        }),
        ..EvaluationInput::default()
    }
}

#[tokio::test]
async fn evaluate_without_policy_fails_closed() {
    let engine = PolicyEngine::default();
    assert!(!engine.ready());

    let err = engine
        .evaluate(DEFAULT_POLICY_PATH, &tool_input("agent-1", "search"))
        .await
        .unwrap_err();
    assert!(matches!(err, PolicyError::NotLoaded(_)));

    let decision = Decision::fail_closed(&err);
    assert!(!decision.allow);
    assert!(!decision.reasons.is_empty());
}

#[tokio::test]
async fn loaded_policy_produces_document_decision() {
    let engine = PolicyEngine::default();
    engine
        .load_sources(DEFAULT_POLICY_PATH, source(ALLOW_ALL), Vec::new())
        .unwrap();
    assert!(engine.ready());

    let decision = engine
        .evaluate(DEFAULT_POLICY_PATH, &tool_input("agent-1", "search"))
        .await
        .unwrap();
    assert!(decision.allow);
    assert_eq!(decision.reasons, vec!["policy-a".to_string()]);
}

#[tokio::test]
async fn boolean_decision_is_accepted() {
    let engine = PolicyEngine::default();
    let rego = "package agentguard\n\nimport rego.v1\n\ndecision := input.agent.id == \"trusted\"\n";
    engine
        .load_sources(DEFAULT_POLICY_PATH, source(rego), Vec::new())
        .unwrap();

    let allowed = engine
        .evaluate(DEFAULT_POLICY_PATH, &tool_input("trusted", "search"))
        .await
        .unwrap();
    let denied = engine
        .evaluate(DEFAULT_POLICY_PATH, &tool_input("stranger", "search"))
        .await
        .unwrap();
    assert!(allowed.allow);
    assert!(!denied.allow);
}

#[tokio::test]
async fn undefined_decision_denies() {
    let engine = PolicyEngine::default();
    let rego = "package agentguard\n\nimport rego.v1\n\ndecision := true if {\n\tinput.agent.id == \"nobody\"\n}\n";
    engine
        .load_sources(DEFAULT_POLICY_PATH, source(rego), Vec::new())
        .unwrap();

    let decision = engine
        .evaluate(DEFAULT_POLICY_PATH, &tool_input("agent-1", "search"))
        .await
        .unwrap();
    assert!(!decision.allow);
}

#[tokio::test]
async fn oversized_input_is_rejected_before_evaluation() {
    let engine = PolicyEngine::default();
    engine
        .load_sources(DEFAULT_POLICY_PATH, source(ALLOW_ALL), Vec::new())
        .unwrap();

    let mut input = tool_input("agent-1", "search");
    input
        .environment
        .insert("padding".into(), json!("x".repeat(1 << 20)));
    let err = engine
        .evaluate(DEFAULT_POLICY_PATH, &input)
        .await
        .unwrap_err();
    assert!(matches!(err, PolicyError::InputTooLarge { limit, .. } if limit == 1 << 20));
    assert!(err.is_protocol());
}

#[tokio::test]
async fn runtime_error_is_reported_not_allowed() {
    let engine = PolicyEngine::default();
    let rego = r#"package agentguard

import rego.v1

decision := true if {
	input.agent.id == "agent-1"
}

decision := false if {
	input.agent.id == "agent-1"
}
"#;
    engine
        .load_sources(DEFAULT_POLICY_PATH, source(rego), Vec::new())
        .unwrap();

    let err = engine
        .evaluate(DEFAULT_POLICY_PATH, &tool_input("agent-1", "search"))
        .await
        .unwrap_err();
    assert!(!err.is_unavailable());
    assert!(!Decision::fail_closed(&err).allow);
}

#[tokio::test]
async fn compile_failure_keeps_previous_policy() {
    let engine = PolicyEngine::default();
    engine
        .load_sources(DEFAULT_POLICY_PATH, source(ALLOW_ALL), Vec::new())
        .unwrap();

    let err = engine
        .load_sources(
            DEFAULT_POLICY_PATH,
            source("package agentguard\n\ndecision := {"),
            Vec::new(),
        )
        .unwrap_err();
    assert!(matches!(err, PolicyError::Compile { .. }));

    let decision = engine
        .evaluate(DEFAULT_POLICY_PATH, &tool_input("agent-1", "search"))
        .await
        .unwrap();
    assert!(decision.allow);
}

#[tokio::test]
async fn unknown_policy_path_falls_back_to_default() {
    let engine = PolicyEngine::default();
    engine
        .load_sources(DEFAULT_POLICY_PATH, source(DENY_ALL), Vec::new())
        .unwrap();
    engine
        .load_sources("strict", source(ALLOW_ALL), Vec::new())
        .unwrap();

    let strict = engine
        .evaluate("strict", &tool_input("agent-1", "search"))
        .await
        .unwrap();
    let fallback = engine
        .evaluate("missing", &tool_input("agent-1", "search"))
        .await
        .unwrap();
    assert!(strict.allow);
    assert_eq!(fallback.reasons, vec!["policy-b".to_string()]);
}

#[tokio::test]
async fn data_updates_are_visible_to_later_evaluations() {
    let engine = PolicyEngine::default();
    let rego = r#"package agentguard

import rego.v1

default decision := false

decision := true if {
	input.tool.name in data.policies.allowed_tools[input.agent.id]
}
"#;
    engine
        .load_sources(DEFAULT_POLICY_PATH, source(rego), Vec::new())
        .unwrap();
    let input = tool_input("agent-1", "search");

    assert!(!engine.evaluate(DEFAULT_POLICY_PATH, &input).await.unwrap().allow);
    engine
        .update_data("/policies/allowed_tools", json!({"agent-1": ["search"]}))
        .unwrap();
    assert!(engine.evaluate(DEFAULT_POLICY_PATH, &input).await.unwrap().allow);
}

#[tokio::test]
async fn data_writes_cannot_shadow_policy_rules() {
    let engine = PolicyEngine::default();
    engine
        .load_sources(DEFAULT_POLICY_PATH, source(DENY_ALL), Vec::new())
        .unwrap();
    let input = tool_input("agent-1", "search");

    for (path, value) in [
        ("agentguard/decision", json!({"allow": true, "reasons": ["from data"]})),
        ("agentguard", json!({"decision": {"allow": true}})),
        ("agentguard", json!(true)),
        ("/", json!({"agentguard": {"decision": true}})),
    ] {
        let err = engine.update_data(path, value).unwrap_err();
        assert!(matches!(err, PolicyError::Conflict { .. }), "{path}: {err}");
    }
    assert_eq!(engine.store().revision(), 0);

    let decision = engine.evaluate(DEFAULT_POLICY_PATH, &input).await.unwrap();
    assert!(!decision.allow);
    assert_eq!(decision.reasons, vec!["policy-b".to_string()]);

    // siblings of the package stay writable
    engine
        .update_data("policies/allowed_tools", json!({"agent-1": ["search"]}))
        .unwrap();
}

#[test]
fn policy_load_rejects_data_under_its_package() {
    let engine = PolicyEngine::default();
    engine
        .update_data("agentguard/decision", json!({"allow": true}))
        .unwrap();
    let err = engine
        .load_sources(DEFAULT_POLICY_PATH, source(DENY_ALL), Vec::new())
        .unwrap_err();
    assert!(matches!(err, PolicyError::Conflict { .. }));
    assert!(!engine.ready());

    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("policy.rego"), DENY_ALL).unwrap();
    fs::create_dir_all(dir.path().join("agentguard")).unwrap();
    fs::write(
        dir.path().join("agentguard/data.json"),
        r#"{"decision": {"allow": true}}"#,
    )
    .unwrap();

    let fresh = PolicyEngine::default();
    assert!(matches!(
        fresh.load_bundle(dir.path()),
        Err(PolicyError::Conflict { .. })
    ));
    assert!(!fresh.ready());
    assert_eq!(fresh.store().revision(), 0);
    assert!(matches!(
        PolicyEngine::validate(&[dir.path().to_path_buf()]),
        Err(PolicyError::Conflict { .. })
    ));
}

#[tokio::test]
async fn policies_load_from_files_with_explicit_data() {
    let dir = tempfile::tempdir().unwrap();
    let policy = dir.path().join("tools.rego");
    let data = dir.path().join("limits.json");
    fs::write(
        &policy,
        r#"package agentguard

import rego.v1

default decision := false

decision := true if {
	input.tool.name in data.allowed[input.agent.id]
}
"#,
    )
    .unwrap();
    fs::write(&data, r#"{"allowed": {"agent-1": ["search"]}}"#).unwrap();

    let engine = PolicyEngine::default();
    assert!(!engine.ready());
    engine.load_policies(&[policy, data]).unwrap();
    assert!(engine.ready());
    assert!(engine.has_policy(DEFAULT_POLICY_PATH));

    let allowed = engine
        .evaluate(DEFAULT_POLICY_PATH, &tool_input("agent-1", "search"))
        .await
        .unwrap();
    assert!(allowed.allow);
    let denied = engine
        .evaluate(DEFAULT_POLICY_PATH, &tool_input("agent-1", "shell"))
        .await
        .unwrap();
    assert!(!denied.allow);
}

#[test]
fn failed_file_loads_leave_engine_unready() {
    let dir = tempfile::tempdir().unwrap();
    let engine = PolicyEngine::default();

    assert!(matches!(
        engine.load_policies(&[dir.path().join("missing.rego")]),
        Err(PolicyError::Io(_))
    ));
    assert!(!engine.ready());

    let broken = dir.path().join("broken.rego");
    fs::write(&broken, "package agentguard\n\ndecision := {\n").unwrap();
    assert!(matches!(
        engine.load_policies(&[broken]),
        Err(PolicyError::Compile { .. })
    ));
    assert!(!engine.ready());
    assert!(!engine.has_policy(DEFAULT_POLICY_PATH));
}

#[test]
fn timed_out_evaluation_keeps_its_slot_without_blocking_shutdown() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let engine = PolicyEngine::new(EngineOptions {
        eval_timeout: Duration::from_millis(50),
        max_concurrent_evaluations: 1,
        ..EngineOptions::default()
    });
    engine.load_sources("slow", source(SLOW), Vec::new()).unwrap();
    engine
        .load_sources(DEFAULT_POLICY_PATH, source(ALLOW_ALL), Vec::new())
        .unwrap();
    let input = tool_input("agent-1", "search");

    let started = Instant::now();
    runtime.block_on(async {
        let slow = engine.evaluate("slow", &input).await;
        assert!(matches!(slow, Err(PolicyError::Timeout(50))), "{slow:?}");
        // the abandoned evaluation still holds the only slot
        let queued = engine.evaluate(DEFAULT_POLICY_PATH, &input).await;
        assert!(matches!(queued, Err(PolicyError::Timeout(_))), "{queued:?}");
    });
    runtime.shutdown_timeout(Duration::from_millis(100));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn builtin_policies_enforce_tool_access() {
    let engine = PolicyEngine::default();
    engine.load_builtin().unwrap();
    engine
        .update_data(
            "policies",
            json!({
                "allowed_tools": {"agent-1": ["search"]},
                "blocked_tools": {"agent-1": ["shell"]},
                "forbidden_patterns": ["rm -rf"]
            }),
        )
        .unwrap();

    let allowed = engine
        .evaluate(DEFAULT_POLICY_PATH, &tool_input("agent-1", "search"))
        .await
        .unwrap();
    assert!(allowed.allow, "reasons: {:?}", allowed.reasons);
    assert!(allowed.reasons.is_empty());

    let blocked = engine
        .evaluate(DEFAULT_POLICY_PATH, &tool_input("agent-1", "shell"))
        .await
        .unwrap();
    assert!(!blocked.allow);
    assert!(!blocked.reasons.is_empty());
    assert!(!blocked.violations.is_empty());

    let mut dangerous = tool_input("agent-1", "search");
    if let Some(tool) = dangerous.tool.as_mut() {
        tool.parameters.insert("query".into(), json!("rm -rf /"));
    }
    let tool_only = engine.evaluate_tool_access(&dangerous).await.unwrap();
    assert!(!tool_only.allow);
}

#[tokio::test]
async fn builtin_policies_enforce_data_flow() {
    let engine = PolicyEngine::default();
    engine.load_builtin().unwrap();
    engine
        .update_data(
            "policies/allowed_destinations",
            json!({"public": ["slack", "email"], "confidential": ["vault"]}),
        )
        .unwrap();

    let mut input = EvaluationInput {
        data: Some(DataContext {
            classification: "confidential".into(),
            source: "crm".into(),
            destination: "slack".into(),
            pii_fields: vec!["email".into()],
        }),
        ..EvaluationInput::default()
    };
    let denied = engine.evaluate_data_flow(&input).await.unwrap();
    assert!(!denied.allow);
    assert!(!denied.reasons.is_empty());

    if let Some(data) = input.data.as_mut() {
        data.destination = "vault".into();
    }
    let allowed = engine.evaluate(DEFAULT_POLICY_PATH, &input).await.unwrap();
    assert!(allowed.allow, "reasons: {:?}", allowed.reasons);
}

#[tokio::test]
async fn bundle_load_stages_data_with_policy() {
    let dir = tempfile::tempdir().unwrap();
    let rego = r#"package agentguard

import rego.v1

default decision := false

decision := true if {
	input.agent.team in data.teams.trusted
}
"#;
    fs::write(dir.path().join("policy.rego"), rego).unwrap();
    fs::create_dir_all(dir.path().join("teams")).unwrap();
    fs::write(dir.path().join("teams/data.json"), r#"{"trusted": ["core"]}"#).unwrap();

    let engine = PolicyEngine::default();
    engine.load_bundle(dir.path()).unwrap();
    assert_eq!(engine.store().revision(), 1);

    let mut input = tool_input("agent-1", "search");
    input.agent.team = "core".into();
    assert!(engine.evaluate(DEFAULT_POLICY_PATH, &input).await.unwrap().allow);
}

#[tokio::test]
async fn load_set_combines_builtin_and_files() {
    let dir = tempfile::tempdir().unwrap();
    let extra = dir.path().join("extra.rego");
    fs::write(
        &extra,
        "package agentguard.extra\n\nimport rego.v1\n\nenabled := true\n",
    )
    .unwrap();

    let engine = PolicyEngine::default();
    assert!(matches!(
        engine.load_set(&PolicySet::default()),
        Err(PolicyError::NoSources(_))
    ));
    engine
        .load_set(&PolicySet {
            paths: vec![extra],
            bundle: None,
            builtin: true,
        })
        .unwrap();

    let status = engine.status();
    assert!(status.ready);
    assert_eq!(status.policies.len(), 1);
    assert_eq!(status.policies[0].sources.len(), 4);
}

#[test]
fn validate_reports_compile_errors() {
    let dir = tempfile::tempdir().unwrap();
    let good = dir.path().join("good.rego");
    let bad = dir.path().join("bad.rego");
    fs::write(&good, ALLOW_ALL).unwrap();
    fs::write(&bad, "package broken\n\nallow := {").unwrap();

    let report = PolicyEngine::validate(&[good.clone()]).unwrap();
    assert_eq!(report.policies.len(), 1);
    assert!(matches!(
        PolicyEngine::validate(&[good, bad]),
        Err(PolicyError::Compile { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reloads_never_expose_mixed_policies() {
    let engine = Arc::new(PolicyEngine::new(EngineOptions::default()));
    engine
        .load_sources(DEFAULT_POLICY_PATH, source(ALLOW_ALL), Vec::new())
        .unwrap();

    let reloader = {
        let engine = Arc::clone(&engine);
        tokio::task::spawn_blocking(move || {
            for round in 0..40 {
                let rego = if round % 2 == 0 { DENY_ALL } else { ALLOW_ALL };
                engine
                    .load_sources(DEFAULT_POLICY_PATH, source(rego), Vec::new())
                    .unwrap();
            }
        })
    };

    let mut evaluators = Vec::new();
    for _ in 0..8 {
        let engine = Arc::clone(&engine);
        evaluators.push(tokio::spawn(async move {
            for _ in 0..20 {
                let decision = engine
                    .evaluate(DEFAULT_POLICY_PATH, &tool_input("agent-1", "search"))
                    .await
                    .unwrap();
                let expected = if decision.allow { "policy-a" } else { "policy-b" };
                assert_eq!(decision.reasons, vec![expected.to_string()]);
            }
        }));
    }

    reloader.await.unwrap();
    for evaluator in evaluators {
        evaluator.await.unwrap();
    }
}
