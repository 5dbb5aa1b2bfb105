//! Conductor: walks a workflow DAG, fires nodes when their incoming edge
//! conditions hold, merges node output into the run context, and records
//! every decision in an append-only audit log.

pub mod condition;
pub mod graph;
pub mod store;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::{BlackboardConfig, ConductorConfig};
use crate::error::{ApiaryError, Result};
use crate::exec::{CancelToken, ExecOutcome, ExecutorStrategy, Finding};
use crate::knowledge::KnowledgeQuery;
use crate::node::{NodeContext, NodeRunner};
use crate::tenant::TenantScope;

pub use graph::{EdgeDef, END_NODE, NodeConfig, NodeDef, NodeKind, RoleDef, START_NODE, WorkflowDef};
pub use store::{
    Decision, DecisionKind, NodeExecution, NodeStatus, RunRecord, RunStatus, RunStore,
};

/// sha-256 of the full rendered prompt, truncated for storage and display.
pub fn prompt_hash(prompt: &str) -> String {
    let digest = Sha256::digest(prompt.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..16].to_string()
}

/// Substitute `{key}` placeholders from the context. Values render as bare
/// strings; non-strings render as JSON. Unknown placeholders are left
/// untouched so prompts can contain literal braces.
pub fn render_template(template: &str, context: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let key = &after[..close];
                let is_key = !key.is_empty()
                    && key
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_');
                let substituted = if is_key {
                    context.get(key).map(|value| match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                } else {
                    None
                };
                match substituted {
                    Some(text) => out.push_str(&text),
                    None => {
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Merge a node outcome into the run context: findings append, scalar keys
/// last-writer-wins, string arrays union.
pub fn merge_context(context: &mut Value, outcome: &ExecOutcome) {
    if !context.is_object() {
        *context = Value::Object(Map::new());
    }
    let object = context.as_object_mut().expect("context is an object");

    if !outcome.findings.is_empty() {
        let entry = object
            .entry("findings".to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(items) = entry {
            for finding in &outcome.findings {
                items.push(json!({"kind": finding.kind, "content": finding.content}));
            }
        }
    }

    if !outcome.files_modified.is_empty() {
        let entry = object
            .entry("files_modified".to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(items) = entry {
            for file in &outcome.files_modified {
                let value = Value::String(file.clone());
                if !items.contains(&value) {
                    items.push(value);
                }
            }
        }
    }

    if let Some(Value::Object(result)) = &outcome.result_json {
        for (key, value) in result {
            match (object.get_mut(key), value) {
                (Some(Value::Array(existing)), Value::Array(incoming)) => {
                    for item in incoming {
                        if !existing.contains(item) {
                            existing.push(item.clone());
                        }
                    }
                }
                _ => {
                    object.insert(key.clone(), value.clone());
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeTerminal {
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub output: Value,
    pub findings: Vec<Finding>,
    pub summary: String,
}

pub struct Conductor {
    store: Arc<RunStore>,
    runner: Arc<dyn NodeRunner>,
    knowledge: Option<Arc<dyn KnowledgeQuery>>,
    config: ConductorConfig,
    blackboard: BlackboardConfig,
}

impl Conductor {
    pub fn new(
        store: Arc<RunStore>,
        runner: Arc<dyn NodeRunner>,
        config: ConductorConfig,
        blackboard: BlackboardConfig,
    ) -> Self {
        Self {
            store,
            runner,
            knowledge: None,
            config,
            blackboard,
        }
    }

    pub fn with_knowledge(mut self, knowledge: Arc<dyn KnowledgeQuery>) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    pub fn store(&self) -> &Arc<RunStore> {
        &self.store
    }

    /// Execute a stored workflow to completion.
    pub async fn run_workflow(
        &self,
        tenant: &TenantScope,
        strategy: Arc<dyn ExecutorStrategy>,
        cancel: CancelToken,
        workflow_name: &str,
        input: Value,
    ) -> Result<RunOutcome> {
        let (workflow_id, def) = self
            .store
            .get_workflow(workflow_name)?
            .ok_or_else(|| ApiaryError::WorkflowNotFound(workflow_name.to_string()))?;
        def.validate()?;

        let run = self
            .store
            .create_run(Some(&workflow_id), Some(workflow_name), tenant.tenant_id(), &input)?;
        info!(run_id = %run.id, workflow = workflow_name, "Run started");

        let workspace_dir = tenant.workspace_dir(&run.id)?;
        tokio::fs::create_dir_all(&workspace_dir).await?;
        let node_ctx = NodeContext {
            run_id: run.id.clone(),
            tenant: tenant.clone(),
            workspace_dir,
            strategy,
            cancel: cancel.clone(),
            node_timeout: std::time::Duration::from_secs(self.config.node_timeout_secs),
            blackboard: self.blackboard.clone(),
        };

        let mut context = if input.is_object() {
            input
        } else {
            json!({ "input": input })
        };
        let mut terminal: HashMap<String, NodeTerminal> = HashMap::new();
        self.store.update_run_phase(&run.id, "executing")?;

        let outcome = self
            .drive(&def, &run.id, &node_ctx, &cancel, &mut context, &mut terminal)
            .await;

        self.store.update_run_context(&run.id, &context)?;
        let status = match &outcome {
            Ok(()) => {
                self.store
                    .update_run_status(&run.id, RunStatus::Completed, None, Some(&context))?;
                RunStatus::Completed
            }
            Err(ApiaryError::Cancelled(_)) => {
                self.store.log_decision(
                    &run.id,
                    DecisionKind::Abort,
                    json!({}),
                    "Run cancelled",
                )?;
                self.store.update_run_status(
                    &run.id,
                    RunStatus::Cancelled,
                    Some("cancelled"),
                    Some(&context),
                )?;
                RunStatus::Cancelled
            }
            Err(e) => {
                self.store.update_run_status(
                    &run.id,
                    RunStatus::Failed,
                    Some(&e.to_string()),
                    Some(&context),
                )?;
                RunStatus::Failed
            }
        };

        if let Some(knowledge) = &self.knowledge {
            for execution in self.store.get_node_executions(&run.id)? {
                if let Err(e) = knowledge.record_outcome(&execution) {
                    warn!(run_id = %run.id, error = %e, "Outcome recording failed");
                }
            }
        }

        let record = self
            .store
            .get_run(&run.id)?
            .ok_or_else(|| ApiaryError::RunNotFound(run.id.clone()))?;
        let findings = context
            .get("findings")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| serde_json::from_value(item.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();
        let summary = format!(
            "{} node(s) fired: {} completed, {} failed",
            record.total_nodes, record.completed_nodes, record.failed_nodes
        );
        info!(run_id = %run.id, status = status.as_str(), summary = %summary, "Run finished");

        Ok(RunOutcome {
            run_id: run.id,
            status,
            output: context,
            findings,
            summary,
        })
    }

    /// Main scheduling loop: repeatedly collect the ready-set (nodes whose
    /// predecessors are all terminal), fire or skip each, merge results.
    async fn drive(
        &self,
        def: &WorkflowDef,
        run_id: &str,
        node_ctx: &NodeContext,
        cancel: &CancelToken,
        context: &mut Value,
        terminal: &mut HashMap<String, NodeTerminal>,
    ) -> Result<()> {
        loop {
            cancel.ensure_active("workflow run")?;

            let mut ready: Vec<&NodeDef> = def
                .nodes
                .iter()
                .filter(|node| !terminal.contains_key(node.id.as_str()))
                .filter(|node| {
                    def.incoming(&node.id)
                        .iter()
                        .all(|edge| edge.from == START_NODE || terminal.contains_key(&edge.from))
                })
                .collect();
            if ready.is_empty() {
                break;
            }
            // Pop order: edge priority first, declaration order as the tie
            // break (equal priorities all fire this round anyway).
            ready.sort_by_key(|node| {
                def.incoming(&node.id)
                    .iter()
                    .map(|e| e.priority)
                    .min()
                    .unwrap_or(i64::MAX)
            });

            for chunk in ready.chunks(self.config.max_concurrent_nodes.max(1)) {
                cancel.ensure_active("workflow run")?;
                let settled = &*terminal;
                let firings = futures::future::join_all(chunk.iter().map(|node| {
                    let context = context.clone();
                    async move {
                        let fired = self.should_fire(def, run_id, node, &context, settled)?;
                        if !fired {
                            self.store.record_node_skipped(
                                run_id,
                                node,
                                "no incoming edge fired",
                                None,
                            )?;
                            return Ok::<_, ApiaryError>((node.id.clone(), NodeTerminal::Skipped, None));
                        }
                        let (state, outcome) = self
                            .fire_node(def, run_id, node_ctx, node, &context)
                            .await?;
                        Ok((node.id.clone(), state, outcome))
                    }
                }))
                .await;

                for firing in firings {
                    let (node_id, state, outcome) = firing?;
                    if let Some(outcome) = &outcome {
                        merge_context(context, outcome);
                    }
                    terminal.insert(node_id.clone(), state);

                    if state == NodeTerminal::Failed {
                        let tolerated = def
                            .outgoing(&node_id)
                            .iter()
                            .any(|edge| edge.on_failure);
                        if !tolerated {
                            self.store.log_decision(
                                run_id,
                                DecisionKind::Abort,
                                json!({"node_id": node_id}),
                                "Node failed with no failure-tolerant outgoing edge",
                            )?;
                            return Err(ApiaryError::Handler(format!(
                                "node '{}' failed and the workflow does not tolerate it",
                                node_id
                            )));
                        }
                    }
                }
                self.store.update_run_context(run_id, context)?;
            }
        }
        Ok(())
    }

    /// A node fires when at least one incoming edge's source is satisfied
    /// and its condition holds. A failed source satisfies only edges flagged
    /// `on_failure`; a skipped source satisfies nothing. Evaluation errors
    /// make the edge false.
    fn should_fire(
        &self,
        def: &WorkflowDef,
        run_id: &str,
        node: &NodeDef,
        context: &Value,
        terminal: &HashMap<String, NodeTerminal>,
    ) -> Result<bool> {
        for edge in def.incoming(&node.id) {
            let source_ok = edge.from == START_NODE
                || match terminal.get(&edge.from) {
                    Some(NodeTerminal::Completed) => true,
                    Some(NodeTerminal::Failed) => edge.on_failure,
                    Some(NodeTerminal::Skipped) | None => false,
                };
            if !source_ok {
                continue;
            }
            let expr = condition::parse(&edge.condition)?;
            match condition::evaluate(&expr, context) {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) => {
                    self.store.log_decision(
                        run_id,
                        DecisionKind::SkipNode,
                        json!({"node_id": node.id, "edge_from": edge.from, "error": e.to_string()}),
                        "Condition evaluation failed; edge treated as false",
                    )?;
                }
            }
        }
        Ok(false)
    }

    async fn fire_node(
        &self,
        def: &WorkflowDef,
        run_id: &str,
        node_ctx: &NodeContext,
        node: &NodeDef,
        context: &Value,
    ) -> Result<(NodeTerminal, Option<ExecOutcome>)> {
        let rendered = render_template(&node.prompt_template, context);
        let prompt = match &self.knowledge {
            Some(knowledge) => {
                match knowledge.build_context(&rendered, None, &[]) {
                    Ok(injected) if !injected.is_empty() => {
                        format!("{}\n\n{}", injected, rendered)
                    }
                    Ok(_) => rendered,
                    Err(e) => {
                        warn!(node_id = %node.id, error = %e, "Knowledge query failed; continuing without context");
                        rendered
                    }
                }
            }
            None => rendered,
        };
        let hash = prompt_hash(&prompt);

        // Idempotent re-fire: identical prompts with a completed result are
        // served from the cache without invoking the executor.
        if let Some(cached) = self.store.find_cached(&def.name, &hash)? {
            debug!(node_id = %node.id, hash = %hash, "Cached result reused");
            self.store
                .record_node_skipped(run_id, node, "skipped-because-cached", Some(&cached))?;
            return Ok((NodeTerminal::Completed, Some(cached)));
        }

        let budget = node
            .config
            .retry_budget
            .unwrap_or(self.config.default_retry_budget);
        let mut attempt = 0u32;
        loop {
            let exec_id =
                self.store
                    .record_node_start(run_id, node, &prompt, &hash, None, attempt)?;
            let started = Instant::now();
            let result = self.runner.run_node(node_ctx, node, &prompt).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(outcome) => {
                    self.store
                        .record_node_completion(&exec_id, &outcome, duration_ms, None)?;
                    return Ok((NodeTerminal::Completed, Some(outcome)));
                }
                Err(e) => {
                    self.store
                        .record_node_failure(&exec_id, e.kind(), &e.to_string(), duration_ms)?;
                    if attempt < budget {
                        attempt += 1;
                        self.store.log_decision(
                            run_id,
                            DecisionKind::Retry,
                            json!({"node_id": node.id, "attempt": attempt, "budget": budget}),
                            format!("Retrying node {} ({}/{})", node.id, attempt, budget),
                        )?;
                        continue;
                    }
                    warn!(node_id = %node.id, error = %e, "Node failed with no retry budget left");
                    return Ok((NodeTerminal::Failed, None));
                }
            }
        }
    }
}
