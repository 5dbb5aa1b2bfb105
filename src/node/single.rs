//! Single node: one agent, one prompt, one outcome.

use std::time::Duration;

use tracing::debug;

use super::{NodeContext, default_agent_type};
use crate::conductor::graph::NodeDef;
use crate::error::Result;
use crate::exec::{AgentSpec, ExecOutcome};
use crate::ident::{self, IdentKind};

pub(super) async fn run(ctx: &NodeContext, node: &NodeDef, prompt: &str) -> Result<ExecOutcome> {
    let agent_id = ident::validate(&format!("{}-agent", node.id), IdentKind::Agent)?;
    let agent_type = ident::validate(&default_agent_type(node), IdentKind::AgentType)?;

    let spec = AgentSpec {
        agent_id: agent_id.clone(),
        agent_type,
        prompt: prompt.to_string(),
        run_id: ctx.run_id.clone(),
        node_id: node.id.clone(),
        workspace_dir: ctx.workspace_dir.clone(),
        timeout: ctx.node_timeout.max(Duration::from_secs(1)),
        cancel: ctx.cancel.clone(),
    };

    let outcome = ctx.strategy.spawn_agent(&spec).await?;
    debug!(
        node_id = %node.id,
        agent_id = %agent_id,
        findings = outcome.findings.len(),
        "Single node completed"
    );
    Ok(outcome)
}
