use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::defaults::builtin_sources;
use crate::errors::PolicyError;
use crate::loader::{
    is_tarball, read_bundle, read_sources, DataDocument, LoadedSources, PolicySource,
};
use crate::metrics;
use crate::model::{Decision, EvaluationInput, RawDecision};
use crate::store::{PolicyStore, StorePath, StoreSnapshot, WriteTransaction};

pub const DEFAULT_POLICY_PATH: &str = "default";
pub const DEFAULT_DECISION_QUERY: &str = "data.agentguard.decision";
pub const TOOL_ACCESS_QUERY: &str = "data.agentguard.tool_access";
pub const DATA_FLOW_QUERY: &str = "data.agentguard.data_flow";
pub const MAX_INPUT_BYTES: usize = 1 << 20;
pub const MAX_CONCURRENT_EVALUATIONS: usize = 64;

#[derive(Clone, Debug)]
pub struct EngineOptions {
    pub decision_query: String,
    pub max_input_bytes: usize,
    pub eval_timeout: Duration,
    /// Blocking evaluations allowed to run at once. A timed out evaluation
    /// keeps its slot until the interpreter actually returns.
    pub max_concurrent_evaluations: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            decision_query: DEFAULT_DECISION_QUERY.to_string(),
            max_input_bytes: MAX_INPUT_BYTES,
            eval_timeout: Duration::from_millis(2_000),
            max_concurrent_evaluations: MAX_CONCURRENT_EVALUATIONS,
        }
    }
}

/// Where the default policy comes from. Everything listed is compiled together.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicySet {
    pub paths: Vec<PathBuf>,
    pub bundle: Option<PathBuf>,
    pub builtin: bool,
}

impl PolicySet {
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty() && self.bundle.is_none() && !self.builtin
    }
}

struct CompiledQuery {
    // Evaluations run on a private clone, so the template only has to be Send.
    template: Mutex<regorus::Engine>,
    sources: Vec<String>,
    packages: Vec<Vec<String>>,
    loaded_at: DateTime<Utc>,
}

#[derive(Default)]
struct EngineState {
    queries: HashMap<String, Arc<CompiledQuery>>,
    ready: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct PolicyStatus {
    pub path: String,
    pub sources: Vec<String>,
    pub loaded_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct EngineStatus {
    pub ready: bool,
    pub decision_query: String,
    pub data_revision: u64,
    pub policies: Vec<PolicyStatus>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ValidationReport {
    pub policies: Vec<String>,
    pub documents: usize,
}

pub struct PolicyEngine {
    state: RwLock<EngineState>,
    store: PolicyStore,
    data_cache: Mutex<Option<(u64, regorus::Value)>>,
    permits: Arc<Semaphore>,
    options: EngineOptions,
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new(EngineOptions::default())
    }
}

impl PolicyEngine {
    pub fn new(options: EngineOptions) -> Self {
        Self {
            state: RwLock::new(EngineState::default()),
            store: PolicyStore::new(),
            data_cache: Mutex::new(None),
            permits: Arc::new(Semaphore::new(options.max_concurrent_evaluations.max(1))),
            options,
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn store(&self) -> &PolicyStore {
        &self.store
    }

    pub fn ready(&self) -> bool {
        self.state.read().ready
    }

    pub fn has_policy(&self, policy_path: &str) -> bool {
        self.state.read().queries.contains_key(policy_path)
    }

    pub fn load_policies(&self, paths: &[PathBuf]) -> Result<(), PolicyError> {
        self.load_policies_as(DEFAULT_POLICY_PATH, paths)
    }

    pub fn load_policies_as(&self, policy_path: &str, paths: &[PathBuf]) -> Result<(), PolicyError> {
        let loaded = read_sources(paths).map_err(load_failed)?;
        self.load_sources(policy_path, loaded.policies, loaded.data)
    }

    pub fn load_bundle(&self, path: &Path) -> Result<(), PolicyError> {
        let loaded = read_bundle(path).map_err(load_failed)?;
        self.load_sources(DEFAULT_POLICY_PATH, loaded.policies, loaded.data)
    }

    pub fn load_builtin(&self) -> Result<(), PolicyError> {
        self.load_sources(DEFAULT_POLICY_PATH, builtin_sources(), Vec::new())
    }

    pub fn load_set(&self, set: &PolicySet) -> Result<(), PolicyError> {
        let loaded = collect_set(set).map_err(load_failed)?;
        self.load_sources(DEFAULT_POLICY_PATH, loaded.policies, loaded.data)
    }

    /// Compiles `sources` and, on success, installs them under `policy_path`
    /// together with their data documents. On failure nothing changes.
    pub fn load_sources(
        &self,
        policy_path: &str,
        sources: Vec<PolicySource>,
        data: Vec<DataDocument>,
    ) -> Result<(), PolicyError> {
        let result = self.install(policy_path, sources, data);
        metrics::record_load(result.is_ok());
        if let Err(err) = &result {
            warn!(policy = policy_path, %err, "policy load rejected");
        }
        result
    }

    fn install(
        &self,
        policy_path: &str,
        sources: Vec<PolicySource>,
        data: Vec<DataDocument>,
    ) -> Result<(), PolicyError> {
        if sources.is_empty() {
            return Err(PolicyError::NoSources(policy_path.to_string()));
        }
        let template = compile(&sources)?;
        let compiled = Arc::new(CompiledQuery {
            template: Mutex::new(template),
            packages: sources.iter().filter_map(|s| package_path(&s.rego)).collect(),
            sources: sources.into_iter().map(|s| s.name).collect(),
            loaded_at: Utc::now(),
        });

        let mut state = self.state.write();
        let mut txn = self.store.begin();
        for document in data {
            mount(&mut txn, document)?;
        }
        // The replaced query's packages no longer count.
        let packages = state
            .queries
            .iter()
            .filter(|(path, _)| path.as_str() != policy_path)
            .flat_map(|(_, query)| query.packages.iter())
            .chain(compiled.packages.iter());
        check_packages(txn.staged(), packages)?;
        txn.commit();
        info!(
            policy = policy_path,
            sources = compiled.sources.len(),
            "policy installed"
        );
        state.queries.insert(policy_path.to_string(), compiled);
        state.ready = true;
        Ok(())
    }

    /// Writes `value` at `path`. Rejected if it would shadow an installed package.
    pub fn update_data(&self, path: &str, value: Value) -> Result<u64, PolicyError> {
        let path = StorePath::parse(path)?;
        let state = self.state.read();
        let mut txn = self.store.begin();
        txn.write(&path, value)?;
        check_packages(
            txn.staged(),
            state.queries.values().flat_map(|query| query.packages.iter()),
        )?;
        let revision = txn.commit();
        drop(state);
        metrics::record_data_write();
        debug!(path = %path, revision, "policy data updated");
        Ok(revision)
    }

    /// Evaluates the configured decision query for `policy_path`. Unknown paths
    /// fall back to the default policy.
    pub async fn evaluate<I>(&self, policy_path: &str, input: &I) -> Result<Decision, PolicyError>
    where
        I: Serialize + ?Sized,
    {
        let query = self.options.decision_query.clone();
        self.evaluate_query(policy_path, query, input).await
    }

    pub async fn evaluate_tool_access(
        &self,
        input: &EvaluationInput,
    ) -> Result<Decision, PolicyError> {
        self.evaluate_query(DEFAULT_POLICY_PATH, TOOL_ACCESS_QUERY.to_string(), input)
            .await
    }

    pub async fn evaluate_data_flow(
        &self,
        input: &EvaluationInput,
    ) -> Result<Decision, PolicyError> {
        self.evaluate_query(DEFAULT_POLICY_PATH, DATA_FLOW_QUERY.to_string(), input)
            .await
    }

    async fn evaluate_query<I>(
        &self,
        policy_path: &str,
        query: String,
        input: &I,
    ) -> Result<Decision, PolicyError>
    where
        I: Serialize + ?Sized,
    {
        let started = Instant::now();
        let result = self.run(policy_path, query, input).await;
        let elapsed = started.elapsed();
        match result {
            Ok(mut decision) => {
                decision.eval_time_us = elapsed.as_micros() as u64;
                let outcome = if decision.allow { "allow" } else { "deny" };
                metrics::record_decision(outcome, elapsed.as_secs_f64());
                Ok(decision)
            }
            Err(err) => {
                debug!(policy = policy_path, kind = err.kind(), %err, "policy evaluation failed");
                metrics::record_decision(err.outcome(), elapsed.as_secs_f64());
                Err(err)
            }
        }
    }

    async fn run<I>(&self, policy_path: &str, query: String, input: &I) -> Result<Decision, PolicyError>
    where
        I: Serialize + ?Sized,
    {
        let compiled = self.resolve(policy_path)?;

        let input_json =
            serde_json::to_string(input).map_err(|err| PolicyError::Serialize(err.to_string()))?;
        if input_json.len() > self.options.max_input_bytes {
            return Err(PolicyError::InputTooLarge {
                size: input_json.len(),
                limit: self.options.max_input_bytes,
            });
        }

        let data = self.data_value(&self.store.snapshot())?;
        let permits = Arc::clone(&self.permits);
        let work = async move {
            let permit = permits
                .acquire_owned()
                .await
                .map_err(|_| PolicyError::Evaluation("evaluation pool closed".into()))?;
            let task = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                run_query(&compiled, data, &input_json, query)
            });
            match task.await {
                Ok(result) => result,
                Err(join) => Err(PolicyError::Evaluation(format!(
                    "evaluation task aborted: {join}"
                ))),
            }
        };
        // Waiting for a slot counts against the deadline as well.
        let deadline = self.options.eval_timeout;
        match tokio::time::timeout(deadline, work).await {
            Ok(result) => result,
            Err(_) => Err(PolicyError::Timeout(deadline.as_millis() as u64)),
        }
    }

    fn resolve(&self, policy_path: &str) -> Result<Arc<CompiledQuery>, PolicyError> {
        let state = self.state.read();
        if let Some(compiled) = state.queries.get(policy_path) {
            return Ok(Arc::clone(compiled));
        }
        if let Some(compiled) = state.queries.get(DEFAULT_POLICY_PATH) {
            warn!(
                policy = policy_path,
                "policy path not loaded, falling back to default"
            );
            return Ok(Arc::clone(compiled));
        }
        Err(PolicyError::NotLoaded(policy_path.to_string()))
    }

    fn data_value(&self, snapshot: &StoreSnapshot) -> Result<regorus::Value, PolicyError> {
        let mut cache = self.data_cache.lock();
        if let Some((revision, value)) = cache.as_ref() {
            if *revision == snapshot.revision {
                return Ok(value.clone());
            }
        }
        let value = regorus::Value::from_json_str(&snapshot.data.to_string())
            .map_err(|err| PolicyError::Evaluation(format!("invalid policy data: {err}")))?;
        *cache = Some((snapshot.revision, value.clone()));
        Ok(value)
    }

    pub fn status(&self) -> EngineStatus {
        let state = self.state.read();
        let mut policies: Vec<PolicyStatus> = state
            .queries
            .iter()
            .map(|(path, compiled)| PolicyStatus {
                path: path.clone(),
                sources: compiled.sources.clone(),
                loaded_at: compiled.loaded_at,
            })
            .collect();
        policies.sort_by(|a, b| a.path.cmp(&b.path));
        EngineStatus {
            ready: state.ready,
            decision_query: self.options.decision_query.clone(),
            data_revision: self.store.revision(),
            policies,
        }
    }

    /// Parses and compiles the given files, directories or bundles without
    /// installing anything.
    pub fn validate(paths: &[PathBuf]) -> Result<ValidationReport, PolicyError> {
        let mut loaded = LoadedSources::default();
        for path in paths {
            if path.is_file() && is_tarball(path) {
                loaded.extend(read_bundle(path)?);
            } else {
                loaded.extend(read_sources(std::slice::from_ref(path))?);
            }
        }
        compile(&loaded.policies)?;
        let packages: Vec<Vec<String>> = loaded
            .policies
            .iter()
            .filter_map(|s| package_path(&s.rego))
            .collect();
        let scratch = PolicyStore::new();
        let mut txn = scratch.begin();
        let documents = loaded.data.len();
        for document in loaded.data {
            mount(&mut txn, document)?;
        }
        check_packages(txn.staged(), packages.iter())?;
        txn.abort();
        Ok(ValidationReport {
            policies: loaded.policies.into_iter().map(|s| s.name).collect(),
            documents,
        })
    }
}

fn collect_set(set: &PolicySet) -> Result<LoadedSources, PolicyError> {
    let mut loaded = LoadedSources::default();
    if set.builtin {
        loaded.policies.extend(builtin_sources());
    }
    if !set.paths.is_empty() {
        loaded.extend(read_sources(&set.paths)?);
    }
    if let Some(bundle) = &set.bundle {
        loaded.extend(read_bundle(bundle)?);
    }
    if loaded.policies.is_empty() {
        return Err(PolicyError::NoSources(
            "no policy paths, bundle or built-in policies configured".into(),
        ));
    }
    Ok(loaded)
}

fn compile(sources: &[PolicySource]) -> Result<regorus::Engine, PolicyError> {
    let mut engine = regorus::Engine::new();
    for source in sources {
        engine
            .add_policy(source.name.clone(), source.rego.clone())
            .map_err(|err| PolicyError::Compile {
                origin: source.name.clone(),
                message: err.to_string(),
            })?;
    }
    Ok(engine)
}

/// Root documents are merged key by key; nested ones replace their mount point.
fn mount(txn: &mut WriteTransaction<'_>, document: DataDocument) -> Result<(), PolicyError> {
    if !document.path.is_root() {
        return txn.write(&document.path, document.value);
    }
    let Value::Object(map) = document.value else {
        return Err(PolicyError::Store {
            path: document.path.to_string(),
            message: "root data document must be an object".into(),
        });
    };
    for (key, value) in map {
        txn.write(&StorePath::parse(&key)?, value)?;
    }
    Ok(())
}

/// Dotted package name of a module, split into segments.
fn package_path(rego: &str) -> Option<Vec<String>> {
    let line = rego
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .find(|line| !line.is_empty())?;
    let name = line.strip_prefix("package")?.trim();
    let name = name.replace("[\"", ".").replace("\"]", "");
    let segments: Vec<String> = name
        .split('.')
        .map(|segment| segment.trim().to_string())
        .filter(|segment| !segment.is_empty())
        .collect();
    (!segments.is_empty()).then_some(segments)
}

/// Data must not shadow rules: nothing may sit at or below a package path,
/// and no scalar may sit on the way to one.
fn check_packages<'a>(
    data: &Value,
    packages: impl IntoIterator<Item = &'a Vec<String>>,
) -> Result<(), PolicyError> {
    for package in packages {
        let mut cursor = data;
        let mut depth = 0;
        let blocked = loop {
            let Some(segment) = package.get(depth) else {
                break true;
            };
            match cursor {
                Value::Object(map) => match map.get(segment) {
                    Some(next) => cursor = next,
                    None => break false,
                },
                _ => break true,
            }
            depth += 1;
        };
        if blocked {
            let reached = depth.min(package.len());
            return Err(PolicyError::Conflict {
                path: format!("/{}", package[..reached].join("/")),
                package: package.join("."),
            });
        }
    }
    Ok(())
}

fn run_query(
    compiled: &CompiledQuery,
    data: regorus::Value,
    input_json: &str,
    query: String,
) -> Result<Decision, PolicyError> {
    let mut engine = compiled.template.lock().clone();
    engine.add_data(data).map_err(evaluation_error)?;
    engine.set_input_json(input_json).map_err(evaluation_error)?;
    let results = engine.eval_query(query, false).map_err(evaluation_error)?;

    let value = results
        .result
        .into_iter()
        .next()
        .and_then(|result| result.expressions.into_iter().next())
        .map(|expression| expression.value);
    let json = match value {
        Some(value) => Some(
            serde_json::to_value(&value)
                .map_err(|err| PolicyError::Evaluation(format!("unreadable result: {err}")))?,
        ),
        None => None,
    };
    Ok(RawDecision::from_value(json).into_decision())
}

fn load_failed(err: PolicyError) -> PolicyError {
    metrics::record_load(false);
    err
}

fn evaluation_error(err: impl std::fmt::Display) -> PolicyError {
    PolicyError::Evaluation(err.to_string())
}
