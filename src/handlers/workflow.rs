//! Workflow handler: a `workflow` job spawns a conductor inside the worker
//! that leased it and drives the named DAG to completion.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use super::JobHandler;
use crate::conductor::{Conductor, NodeStatus, RunStatus, RunStore};
use crate::config::{BlackboardConfig, ConductorConfig, KnowledgeConfig, TrailConfig};
use crate::error::{ApiaryError, Result};
use crate::exec::{ExecOutcome, ExecutorStrategy, JobContext};
use crate::ident::{self, IdentKind};
use crate::knowledge::SqliteKnowledge;
use crate::node::KindRunner;
use crate::trail::{LocationKind, Scent, Trail, TrailLedger};

#[derive(Debug, Deserialize)]
struct WorkflowPayload {
    workflow: String,
    #[serde(default)]
    input: Option<Value>,
    /// Inject knowledge context above node prompts (default on).
    #[serde(default)]
    inject_context: Option<bool>,
}

pub struct WorkflowHandler {
    strategy: Arc<dyn ExecutorStrategy>,
    conductor: ConductorConfig,
    blackboard: BlackboardConfig,
    knowledge: KnowledgeConfig,
    trail: TrailConfig,
}

impl WorkflowHandler {
    pub fn new(
        strategy: Arc<dyn ExecutorStrategy>,
        conductor: ConductorConfig,
        blackboard: BlackboardConfig,
        knowledge: KnowledgeConfig,
        trail: TrailConfig,
    ) -> Self {
        Self {
            strategy,
            conductor,
            blackboard,
            knowledge,
            trail,
        }
    }

    /// Lay trails from the finished run: discovery on touched files,
    /// blockers on failed nodes.
    fn lay_trails(&self, ctx: &JobContext, store: &RunStore, run_id: &str) -> Result<()> {
        let ledger = TrailLedger::open(ctx.tenant.state_db(), self.trail.clone())?;
        let ttl = self.trail.default_ttl_hours;
        for execution in store.get_node_executions(run_id)? {
            match execution.status {
                NodeStatus::Completed => {
                    for file in &execution.files_modified {
                        ledger.lay(
                            Trail::new(file.clone(), LocationKind::File, Scent::Discovery)
                                .with_run(run_id)
                                .with_agent(execution.node_id.clone())
                                .with_ttl_hours(ttl),
                        )?;
                    }
                }
                NodeStatus::Failed => {
                    ledger.lay(
                        Trail::new(execution.node_id.clone(), LocationKind::Concept, Scent::Blocker)
                            .with_run(run_id)
                            .with_message(
                                execution
                                    .error_message
                                    .clone()
                                    .unwrap_or_else(|| "node failed".into()),
                            )
                            .with_ttl_hours(ttl),
                    )?;
                }
                _ => {}
            }
        }
        ledger.flush()?;
        Ok(())
    }

    fn parse(&self, payload: Value) -> Result<WorkflowPayload> {
        let payload: WorkflowPayload =
            serde_json::from_value(payload).map_err(|e| ApiaryError::InvalidPayload {
                job_type: "workflow".into(),
                reason: e.to_string(),
            })?;
        ident::validate(&payload.workflow, IdentKind::Workflow)?;
        Ok(payload)
    }
}

#[async_trait]
impl JobHandler for WorkflowHandler {
    fn job_type(&self) -> &str {
        "workflow"
    }

    fn validate(&self, payload: &Value) -> Result<()> {
        self.parse(payload.clone()).map(|_| ())
    }

    async fn run(&self, ctx: &JobContext, payload: Value) -> Result<ExecOutcome> {
        let payload = self.parse(payload)?;
        let store = Arc::new(RunStore::open(ctx.tenant.state_db())?);

        let mut conductor = Conductor::new(
            Arc::clone(&store),
            Arc::new(KindRunner),
            self.conductor.clone(),
            self.blackboard.clone(),
        );
        if payload.inject_context.unwrap_or(true) {
            let knowledge = SqliteKnowledge::open(ctx.tenant.state_db(), self.knowledge.clone())?;
            conductor = conductor.with_knowledge(Arc::new(knowledge));
        }

        info!(job_id = %ctx.job_id, workflow = %payload.workflow, "Starting conductor");
        let outcome = conductor
            .run_workflow(
                &ctx.tenant,
                Arc::clone(&self.strategy),
                ctx.cancel.clone(),
                &payload.workflow,
                payload.input.unwrap_or_else(|| json!({})),
            )
            .await?;

        // Trail failures never fail the run.
        if let Err(e) = self.lay_trails(ctx, &store, &outcome.run_id) {
            tracing::warn!(run_id = %outcome.run_id, error = %e, "Trail laying failed");
        }

        if outcome.status != RunStatus::Completed {
            return Err(ApiaryError::Handler(format!(
                "workflow run {} finished {}: {}",
                outcome.run_id,
                outcome.status.as_str(),
                outcome.summary
            )));
        }

        Ok(ExecOutcome {
            result_json: Some(json!({
                "run_id": outcome.run_id,
                "summary": outcome.summary,
                "findings": outcome.findings.clone(),
            })),
            result_text: None,
            files_modified: Vec::new(),
            findings: outcome.findings,
        })
    }
}
