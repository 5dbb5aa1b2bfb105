//! Node executors: one per node kind behind a single "run node" contract.
//!
//! The kinds are tagged variants, not a hierarchy; they share almost no
//! behavior beyond the contract itself.

mod parallel;
mod single;
mod swarm;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::conductor::graph::{NodeDef, NodeKind};
use crate::config::BlackboardConfig;
use crate::error::Result;
use crate::exec::{CancelToken, ExecOutcome, ExecutorStrategy};
use crate::tenant::TenantScope;

/// Per-run state shared by every node firing.
#[derive(Clone)]
pub struct NodeContext {
    pub run_id: String,
    pub tenant: TenantScope,
    pub workspace_dir: PathBuf,
    pub strategy: Arc<dyn ExecutorStrategy>,
    pub cancel: CancelToken,
    pub node_timeout: Duration,
    pub blackboard: BlackboardConfig,
}

#[async_trait]
pub trait NodeRunner: Send + Sync {
    async fn run_node(
        &self,
        ctx: &NodeContext,
        node: &NodeDef,
        prompt: &str,
    ) -> Result<ExecOutcome>;
}

/// Dispatches a firing to the executor for its kind.
pub struct KindRunner;

#[async_trait]
impl NodeRunner for KindRunner {
    async fn run_node(
        &self,
        ctx: &NodeContext,
        node: &NodeDef,
        prompt: &str,
    ) -> Result<ExecOutcome> {
        ctx.cancel.ensure_active(&node.id)?;
        match node.kind {
            NodeKind::Single => single::run(ctx, node, prompt).await,
            NodeKind::Parallel => parallel::run(ctx, node, prompt).await,
            NodeKind::Swarm => swarm::run(ctx, node, prompt).await,
        }
    }
}

pub(crate) fn default_agent_type(node: &NodeDef) -> String {
    node.config
        .agent_type
        .clone()
        .unwrap_or_else(|| "worker".to_string())
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::provider::ScriptedProvider;

    pub fn context_with(
        dir: &std::path::Path,
        provider: Arc<ScriptedProvider>,
    ) -> NodeContext {
        let tenant = TenantScope::new(dir, "default").unwrap();
        let workspace_dir = tenant.workspace_dir("r-1").unwrap();
        let handlers = Arc::new(crate::handlers::HandlerRegistry::new());
        NodeContext {
            run_id: "r-1".into(),
            tenant,
            workspace_dir,
            strategy: Arc::new(crate::exec::InProcessStrategy::new(handlers, provider)),
            cancel: CancelToken::new(),
            node_timeout: Duration::from_secs(30),
            blackboard: BlackboardConfig::default(),
        }
    }
}
