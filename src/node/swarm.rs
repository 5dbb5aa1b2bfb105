//! Swarm node: cooperating agents coordinating through a shared blackboard.
//!
//! The executor creates the blackboard, registers one agent per role, and
//! fans out. Beyond that initial fan-out the agents self-coordinate; the
//! executor only waits for termination and aggregates what landed on the
//! board. A watcher may observe the same board and intervene while this
//! wait is in progress.

use std::collections::BTreeSet;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::json;
use tracing::{debug, info, warn};

use super::{NodeContext, default_agent_type};
use crate::blackboard::{AgentState, Blackboard, Importance};
use crate::conductor::graph::{NodeDef, RoleDef};
use crate::error::Result;
use crate::exec::{AgentSpec, ExecOutcome, Finding};
use crate::ident::{self, IdentKind};

fn role_prompt(base: &str, role: &RoleDef, board_path: &std::path::Path) -> String {
    let mut prompt = String::new();
    prompt.push_str(base);
    prompt.push_str(&format!(
        "\n\nYou are the '{}' role in a cooperating swarm.",
        role.name
    ));
    if let Some(task) = &role.task {
        prompt.push_str(&format!("\nYour task: {}", task));
    }
    if !role.interests.is_empty() {
        prompt.push_str(&format!("\nYour interests: {}", role.interests.join(", ")));
    }
    prompt.push_str(&format!(
        "\n\nCoordination: the shared blackboard lives at {}. Register findings \
         there, claim file chains before editing interdependent files, release \
         chains when done, and heartbeat while you work.",
        board_path.display()
    ));
    prompt
}

pub(super) async fn run(ctx: &NodeContext, node: &NodeDef, prompt: &str) -> Result<ExecOutcome> {
    let coordination_dir = ctx.tenant.coordination_dir(&ctx.run_id)?;
    let board = Blackboard::create(&coordination_dir, &ctx.run_id, ctx.blackboard.clone())?;
    let agent_type = ident::validate(&default_agent_type(node), IdentKind::AgentType)?;

    // Register every role before any agent starts so claim-chain validation
    // has a complete registry from the first write.
    let mut agents = Vec::new();
    for role in &node.config.roles {
        let agent_id = ident::validate(&format!("{}-{}", node.id, role.name), IdentKind::Agent)?;
        let task = role
            .task
            .clone()
            .unwrap_or_else(|| format!("{} work for node {}", role.name, node.id));
        board.register_agent(&agent_id, &task, &role.interests)?;
        agents.push((agent_id, role.clone()));
    }
    info!(
        node_id = %node.id,
        run_id = %ctx.run_id,
        roles = agents.len(),
        board = %board.path().display(),
        "Swarm fan-out"
    );

    let mut members = FuturesUnordered::new();
    for (agent_id, role) in &agents {
        let spec = AgentSpec {
            agent_id: agent_id.clone(),
            agent_type: agent_type.clone(),
            prompt: role_prompt(prompt, role, board.path()),
            run_id: ctx.run_id.clone(),
            node_id: node.id.clone(),
            workspace_dir: ctx.workspace_dir.clone(),
            timeout: ctx.node_timeout.max(Duration::from_secs(1)),
            cancel: ctx.cancel.clone(),
        };
        let strategy = ctx.strategy.clone();
        let agent_id = agent_id.clone();
        members.push(async move {
            let result = strategy.spawn_agent(&spec).await;
            (agent_id, result)
        });
    }

    let mut failed = 0usize;
    while let Some((agent_id, result)) = members.next().await {
        match result {
            Ok(outcome) => {
                // Bridge the agent's structured output onto the board so
                // late-finishing peers (and the watcher) can see it.
                for finding in &outcome.findings {
                    board.add_finding(
                        &agent_id,
                        finding.kind,
                        &finding.content,
                        &outcome.files_modified,
                        Importance::Medium,
                        &[],
                    )?;
                }
                board.update_agent_state(&agent_id, AgentState::Completed)?;
            }
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "Swarm agent failed");
                board.update_agent_state(&agent_id, AgentState::Failed)?;
                failed += 1;
            }
        }
    }

    // Termination: all agents reached a terminal state, or the watcher has
    // closed the run (observed as cancellation).
    let doc = board.snapshot()?;
    let findings: Vec<Finding> = doc
        .findings
        .iter()
        .map(|f| Finding {
            kind: f.kind,
            content: f.content.clone(),
        })
        .collect();
    let files: BTreeSet<String> = doc
        .findings
        .iter()
        .flat_map(|f| f.files.iter().cloned())
        .collect();
    let agent_states: serde_json::Map<String, serde_json::Value> = doc
        .agents
        .iter()
        .map(|(id, a)| (id.clone(), json!(a.state)))
        .collect();

    debug!(
        node_id = %node.id,
        agents = doc.agents.len(),
        failed = failed,
        findings = findings.len(),
        "Swarm node finished"
    );

    Ok(ExecOutcome {
        result_json: Some(json!({
            "agents": agent_states,
            "findings_count": findings.len(),
            "failed_agents": failed,
            "blackboard": board.path().display().to_string(),
        })),
        result_text: None,
        files_modified: files.into_iter().collect(),
        findings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conductor::graph::{NodeConfig, NodeKind};
    use crate::provider::ScriptedProvider;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn swarm_node(roles: &[&str]) -> NodeDef {
        NodeDef {
            id: "investigate".into(),
            name: None,
            kind: NodeKind::Swarm,
            prompt_template: String::new(),
            config: NodeConfig {
                roles: roles
                    .iter()
                    .map(|name| RoleDef {
                        name: name.to_string(),
                        task: Some(format!("{} the target", name)),
                        interests: vec![name.to_string()],
                    })
                    .collect(),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_swarm_registers_roles_and_aggregates() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(ScriptedProvider::with_responses([
            "[discovery] entry point is main.rs",
            "[warning] tests are thin",
        ]));
        let ctx = crate::node::testutil::context_with(dir.path(), provider);
        let outcome = run(&ctx, &swarm_node(&["scout", "critic"]), "investigate")
            .await
            .unwrap();

        let result = outcome.result_json.unwrap();
        let agents = result["agents"].as_object().unwrap();
        assert_eq!(agents.len(), 2);
        assert!(agents.contains_key("investigate-scout"));
        assert!(agents.contains_key("investigate-critic"));
        assert_eq!(outcome.findings.len(), 2);

        // All agents reached a terminal state on the board.
        let board_dir = ctx.tenant.coordination_dir("r-1").unwrap();
        let board =
            Blackboard::open(&board_dir, crate::config::BlackboardConfig::default()).unwrap();
        let doc = board.snapshot().unwrap();
        assert!(doc.agents.values().all(|a| a.state.is_terminal()));
    }

    #[tokio::test]
    async fn test_second_swarm_in_same_run_conflicts() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(ScriptedProvider::new());
        let ctx = crate::node::testutil::context_with(dir.path(), provider);
        run(&ctx, &swarm_node(&["scout"]), "p").await.unwrap();
        // The blackboard file still exists; exclusive create must refuse.
        let err = run(&ctx, &swarm_node(&["scout"]), "p").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
    }
}
