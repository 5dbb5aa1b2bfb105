//! Parallel node: N independent agents with shard hints, fan-out/fan-in.
//!
//! Any member failure cancels the remaining members and fails the node,
//! unless the node is configured best-effort, in which case failures are
//! collected into the aggregate result instead.

use std::collections::BTreeSet;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use super::{NodeContext, default_agent_type};
use crate::conductor::graph::NodeDef;
use crate::error::{ApiaryError, Result};
use crate::exec::{AgentSpec, CancelToken, ExecOutcome};
use crate::ident::{self, IdentKind};

const DEFAULT_FAN_OUT: usize = 2;

pub(super) async fn run(ctx: &NodeContext, node: &NodeDef, prompt: &str) -> Result<ExecOutcome> {
    let fan_out = node.config.concurrency.unwrap_or(DEFAULT_FAN_OUT).max(1);
    let agent_type = ident::validate(&default_agent_type(node), IdentKind::AgentType)?;
    // Member agents share a node-local token so one failure can stop the
    // rest without cancelling the whole run.
    let member_cancel = CancelToken::new();

    let mut members = FuturesUnordered::new();
    for shard in 1..=fan_out {
        let agent_id = ident::validate(&format!("{}-p{}", node.id, shard), IdentKind::Agent)?;
        let spec = AgentSpec {
            agent_id: agent_id.clone(),
            agent_type: agent_type.clone(),
            prompt: format!(
                "{}\n\nYou are shard {} of {}. Work only your shard of the input.",
                prompt, shard, fan_out
            ),
            run_id: ctx.run_id.clone(),
            node_id: node.id.clone(),
            workspace_dir: ctx.workspace_dir.clone(),
            timeout: ctx.node_timeout.max(Duration::from_secs(1)),
            cancel: member_cancel.clone(),
        };
        let strategy = ctx.strategy.clone();
        members.push(async move {
            let result = strategy.spawn_agent(&spec).await;
            (agent_id, result)
        });
    }

    let mut shard_results = Map::new();
    let mut failures: Vec<Value> = Vec::new();
    let mut findings = Vec::new();
    let mut files: BTreeSet<String> = BTreeSet::new();
    let mut first_error: Option<ApiaryError> = None;

    while let Some((agent_id, result)) = members.next().await {
        if ctx.cancel.is_cancelled() {
            member_cancel.cancel();
        }
        match result {
            Ok(outcome) => {
                findings.extend(outcome.findings.clone());
                files.extend(outcome.files_modified.iter().cloned());
                let value = outcome
                    .result_json
                    .clone()
                    .or_else(|| outcome.result_text.clone().map(Value::String))
                    .unwrap_or(Value::Null);
                shard_results.insert(agent_id, value);
            }
            Err(e) => {
                warn!(node_id = %node.id, agent_id = %agent_id, error = %e, "Parallel member failed");
                failures.push(json!({"agent_id": agent_id, "error": e.to_string()}));
                if !node.config.best_effort {
                    // First failure wins; stop the remaining members at
                    // their next cancellation check.
                    member_cancel.cancel();
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
    }

    if let Some(error) = first_error {
        return Err(ApiaryError::Handler(format!(
            "parallel node '{}': {} of {} members failed: {}",
            node.id,
            failures.len(),
            fan_out,
            error
        )));
    }

    debug!(
        node_id = %node.id,
        members = fan_out,
        failures = failures.len(),
        "Parallel node completed"
    );
    Ok(ExecOutcome {
        result_json: Some(json!({
            "shards": Value::Object(shard_results),
            "failures": failures,
        })),
        result_text: None,
        files_modified: files.into_iter().collect(),
        findings,
    })
}
