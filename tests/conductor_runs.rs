//! Conductor behavior over real workflow graphs: edge conditions, skips,
//! retries, failure tolerance, and the prompt-hash cache.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;

use apiary::conductor::{
    Conductor, EdgeDef, END_NODE, NodeDef, NodeKind, NodeStatus, RunStatus, RunStore, START_NODE,
    WorkflowDef,
};
use apiary::config::{BlackboardConfig, ConductorConfig};
use apiary::error::{ApiaryError, Result};
use apiary::exec::{AgentSpec, CancelToken, ExecOutcome, ExecutorStrategy, JobContext};
use apiary::node::KindRunner;
use apiary::store::Job;
use apiary::tenant::TenantScope;

/// Agents scripted per node id: either a response text or a number of
/// failures to produce before succeeding.
#[derive(Default)]
struct ScriptedStrategy {
    responses: Mutex<HashMap<String, String>>,
    failures_left: Mutex<HashMap<String, u32>>,
    invocations: Mutex<Vec<String>>,
}

impl ScriptedStrategy {
    fn respond(self: Arc<Self>, node_id: &str, text: &str) -> Arc<Self> {
        self.responses
            .lock()
            .insert(node_id.to_string(), text.to_string());
        self
    }

    fn fail_times(self: Arc<Self>, node_id: &str, times: u32) -> Arc<Self> {
        self.failures_left.lock().insert(node_id.to_string(), times);
        self
    }

    fn invocation_count(&self) -> usize {
        self.invocations.lock().len()
    }
}

#[async_trait]
impl ExecutorStrategy for ScriptedStrategy {
    async fn execute(&self, _ctx: &JobContext, job: &Job) -> Result<ExecOutcome> {
        Err(ApiaryError::UnknownJobType(job.job_type.clone()))
    }

    async fn spawn_agent(&self, spec: &AgentSpec) -> Result<ExecOutcome> {
        self.invocations.lock().push(spec.node_id.clone());
        {
            let mut failures = self.failures_left.lock();
            if let Some(left) = failures.get_mut(&spec.node_id) {
                if *left > 0 {
                    *left -= 1;
                    return Err(ApiaryError::Handler(format!(
                        "scripted failure for {}",
                        spec.node_id
                    )));
                }
            }
        }
        let text = self
            .responses
            .lock()
            .get(&spec.node_id)
            .cloned()
            .unwrap_or_else(|| format!("done: {}", spec.node_id));
        Ok(ExecOutcome::from_text(text))
    }
}

fn node(id: &str) -> NodeDef {
    NodeDef {
        id: id.into(),
        name: None,
        kind: NodeKind::Single,
        prompt_template: format!("work on {}", id),
        config: Default::default(),
    }
}

fn edge(from: &str, to: &str) -> EdgeDef {
    EdgeDef {
        from: from.into(),
        to: to.into(),
        condition: String::new(),
        priority: 100,
        on_failure: false,
    }
}

struct Harness {
    _dir: TempDir,
    store: Arc<RunStore>,
    conductor: Conductor,
    tenant: TenantScope,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(RunStore::in_memory().unwrap());
    let conductor = Conductor::new(
        Arc::clone(&store),
        Arc::new(KindRunner),
        ConductorConfig::default(),
        BlackboardConfig::default(),
    );
    let tenant = TenantScope::new(dir.path(), "default").unwrap();
    Harness {
        _dir: dir,
        store,
        conductor,
        tenant,
    }
}

impl Harness {
    async fn run(
        &self,
        strategy: Arc<ScriptedStrategy>,
        workflow: &str,
        input: serde_json::Value,
    ) -> (RunStatus, String) {
        let outcome = self
            .conductor
            .run_workflow(&self.tenant, strategy, CancelToken::new(), workflow, input)
            .await
            .unwrap();
        (outcome.status, outcome.run_id)
    }
}

#[tokio::test]
async fn test_linear_workflow_completes_in_order() {
    let h = harness();
    h.store
        .create_workflow(&WorkflowDef {
            name: "linear".into(),
            description: String::new(),
            nodes: vec![node("scan"), node("fix")],
            edges: vec![
                edge(START_NODE, "scan"),
                edge("scan", "fix"),
                edge("fix", END_NODE),
            ],
        })
        .unwrap();

    let strategy = Arc::new(ScriptedStrategy::default());
    let (status, run_id) = h.run(Arc::clone(&strategy), "linear", json!({})).await;
    assert_eq!(status, RunStatus::Completed);

    let executions = h.store.get_node_executions(&run_id).unwrap();
    assert_eq!(executions.len(), 2);
    // Fired in dependency order.
    assert_eq!(executions[0].node_id, "scan");
    assert_eq!(executions[1].node_id, "fix");
    assert!(executions.iter().all(|e| e.status == NodeStatus::Completed));

    let run = h.store.get_run(&run_id).unwrap().unwrap();
    assert_eq!(run.total_nodes, 2);
    assert_eq!(run.completed_nodes, 2);
    assert_eq!(run.failed_nodes, 0);
    assert!(run.completed_at.is_some());
}

#[tokio::test]
async fn test_condition_routes_and_skips() {
    let h = harness();
    let mut hotfix_edge = edge("scan", "hotfix");
    hotfix_edge.condition = "context.severity == 'high'".into();
    let mut cleanup_edge = edge("scan", "cleanup");
    cleanup_edge.condition = "context.severity != 'high'".into();

    h.store
        .create_workflow(&WorkflowDef {
            name: "routed".into(),
            description: String::new(),
            nodes: vec![node("scan"), node("hotfix"), node("cleanup")],
            edges: vec![
                edge(START_NODE, "scan"),
                hotfix_edge,
                cleanup_edge,
                edge("hotfix", END_NODE),
                edge("cleanup", END_NODE),
            ],
        })
        .unwrap();

    let strategy = Arc::new(ScriptedStrategy::default());
    let (status, run_id) = h
        .run(Arc::clone(&strategy), "routed", json!({"severity": "low"}))
        .await;
    assert_eq!(status, RunStatus::Completed);

    let executions = h.store.get_node_executions(&run_id).unwrap();
    let status_of = |node_id: &str| {
        executions
            .iter()
            .find(|e| e.node_id == node_id)
            .map(|e| e.status)
    };
    assert_eq!(status_of("cleanup"), Some(NodeStatus::Completed));
    assert_eq!(status_of("hotfix"), Some(NodeStatus::Skipped));

    let decisions = h.store.get_decisions(&run_id).unwrap();
    assert!(decisions.iter().any(|d| d.kind == "skip_node"));
}

#[tokio::test]
async fn test_identical_rerun_served_from_cache() {
    let h = harness();
    h.store
        .create_workflow(&WorkflowDef {
            name: "cached".into(),
            description: String::new(),
            nodes: vec![node("analyze")],
            edges: vec![edge(START_NODE, "analyze"), edge("analyze", END_NODE)],
        })
        .unwrap();

    let strategy =
        Arc::new(ScriptedStrategy::default()).respond("analyze", "[fact] index is unique");
    let (status, _) = h.run(Arc::clone(&strategy), "cached", json!({})).await;
    assert_eq!(status, RunStatus::Completed);
    assert_eq!(strategy.invocation_count(), 1);

    // Same workflow, same input: identical prompt hash, so the cached
    // result is reused and the executor is never invoked again.
    let (status, second_run) = h.run(Arc::clone(&strategy), "cached", json!({})).await;
    assert_eq!(status, RunStatus::Completed);
    assert_eq!(strategy.invocation_count(), 1, "no second invocation");

    let executions = h.store.get_node_executions(&second_run).unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, NodeStatus::Skipped);
    assert_eq!(executions[0].findings.len(), 1);

    let decisions = h.store.get_decisions(&second_run).unwrap();
    assert!(
        decisions
            .iter()
            .any(|d| d.reason.contains("skipped-because-cached"))
    );

    // Different input renders a different prompt: the cache misses.
    let strategy2 = Arc::new(ScriptedStrategy::default());
    h.store
        .create_workflow(&WorkflowDef {
            name: "cached2".into(),
            description: String::new(),
            nodes: vec![NodeDef {
                prompt_template: "analyze {target}".into(),
                ..node("analyze")
            }],
            edges: vec![edge(START_NODE, "analyze"), edge("analyze", END_NODE)],
        })
        .unwrap();
    h.run(Arc::clone(&strategy2), "cached2", json!({"target": "a"}))
        .await;
    h.run(Arc::clone(&strategy2), "cached2", json!({"target": "b"}))
        .await;
    assert_eq!(strategy2.invocation_count(), 2);
}

#[tokio::test]
async fn test_failed_node_without_tolerance_fails_run() {
    let h = harness();
    h.store
        .create_workflow(&WorkflowDef {
            name: "fragile".into(),
            description: String::new(),
            nodes: vec![node("flaky"), node("after")],
            edges: vec![
                edge(START_NODE, "flaky"),
                edge("flaky", "after"),
                edge("after", END_NODE),
            ],
        })
        .unwrap();

    let strategy = Arc::new(ScriptedStrategy::default()).fail_times("flaky", 99);
    let (status, run_id) = h.run(Arc::clone(&strategy), "fragile", json!({})).await;
    assert_eq!(status, RunStatus::Failed);

    let run = h.store.get_run(&run_id).unwrap().unwrap();
    assert!(run.completed_at.is_some());
    assert!(run.error_message.as_deref().unwrap().contains("flaky"));
    assert_eq!(run.failed_nodes, 1);

    // The downstream node never fired.
    let executions = h.store.get_node_executions(&run_id).unwrap();
    assert!(executions.iter().all(|e| e.node_id != "after"));

    let decisions = h.store.get_decisions(&run_id).unwrap();
    assert!(decisions.iter().any(|d| d.kind == "abort"));
}

#[tokio::test]
async fn test_on_failure_edge_routes_around_failure() {
    let h = harness();
    let mut recovery_edge = edge("risky", "recover");
    recovery_edge.on_failure = true;

    h.store
        .create_workflow(&WorkflowDef {
            name: "tolerant".into(),
            description: String::new(),
            nodes: vec![node("risky"), node("recover")],
            edges: vec![
                edge(START_NODE, "risky"),
                recovery_edge,
                edge("recover", END_NODE),
            ],
        })
        .unwrap();

    let strategy = Arc::new(ScriptedStrategy::default()).fail_times("risky", 99);
    let (status, run_id) = h.run(Arc::clone(&strategy), "tolerant", json!({})).await;
    assert_eq!(status, RunStatus::Completed);

    let executions = h.store.get_node_executions(&run_id).unwrap();
    let risky = executions.iter().find(|e| e.node_id == "risky").unwrap();
    assert_eq!(risky.status, NodeStatus::Failed);
    let recover = executions.iter().find(|e| e.node_id == "recover").unwrap();
    assert_eq!(recover.status, NodeStatus::Completed);
}

#[tokio::test]
async fn test_retry_budget_refires_then_succeeds() {
    let h = harness();
    let mut retried = node("retry-me");
    retried.config.retry_budget = Some(2);

    h.store
        .create_workflow(&WorkflowDef {
            name: "retrying".into(),
            description: String::new(),
            nodes: vec![retried],
            edges: vec![edge(START_NODE, "retry-me"), edge("retry-me", END_NODE)],
        })
        .unwrap();

    // Two scripted failures, then success: exactly inside the budget.
    let strategy = Arc::new(ScriptedStrategy::default()).fail_times("retry-me", 2);
    let (status, run_id) = h.run(Arc::clone(&strategy), "retrying", json!({})).await;
    assert_eq!(status, RunStatus::Completed);
    assert_eq!(strategy.invocation_count(), 3);

    let executions = h.store.get_node_executions(&run_id).unwrap();
    assert_eq!(executions.len(), 3);
    assert_eq!(
        executions
            .iter()
            .filter(|e| e.status == NodeStatus::Failed)
            .count(),
        2
    );
    assert_eq!(executions.iter().map(|e| e.retry_count).max(), Some(2));

    let decisions = h.store.get_decisions(&run_id).unwrap();
    assert_eq!(decisions.iter().filter(|d| d.kind == "retry").count(), 2);
}

#[tokio::test]
async fn test_context_merge_flows_between_nodes() {
    let h = harness();
    let mut second = node("report");
    second.prompt_template = "summarize {phase}".into();
    let mut gate = edge("produce", "report");
    gate.condition = "context.phase == 'ready'".into();

    h.store
        .create_workflow(&WorkflowDef {
            name: "flowing".into(),
            description: String::new(),
            nodes: vec![node("produce"), second],
            edges: vec![
                edge(START_NODE, "produce"),
                gate,
                edge("report", END_NODE),
            ],
        })
        .unwrap();

    // First node's structured result sets context.phase, unlocking the
    // second node's gate; its prompt sees the substituted value.
    struct JsonStrategy;
    #[async_trait]
    impl ExecutorStrategy for JsonStrategy {
        async fn execute(&self, _ctx: &JobContext, job: &Job) -> Result<ExecOutcome> {
            Err(ApiaryError::UnknownJobType(job.job_type.clone()))
        }
        async fn spawn_agent(&self, spec: &AgentSpec) -> Result<ExecOutcome> {
            if spec.node_id == "produce" {
                Ok(ExecOutcome {
                    result_json: Some(json!({"phase": "ready"})),
                    ..Default::default()
                })
            } else {
                assert!(
                    spec.prompt.contains("summarize ready"),
                    "context value must be substituted, got {:?}",
                    spec.prompt
                );
                Ok(ExecOutcome::from_text("ok"))
            }
        }
    }

    let (status, run_id) = {
        let outcome = h
            .conductor
            .run_workflow(
                &h.tenant,
                Arc::new(JsonStrategy),
                CancelToken::new(),
                "flowing",
                json!({}),
            )
            .await
            .unwrap();
        (outcome.status, outcome.run_id)
    };
    assert_eq!(status, RunStatus::Completed);

    let run = h.store.get_run(&run_id).unwrap().unwrap();
    assert_eq!(run.context["phase"], "ready");
    let executions = h.store.get_node_executions(&run_id).unwrap();
    assert_eq!(executions.len(), 2);
    assert!(executions.iter().all(|e| e.status == NodeStatus::Completed));
}
