//! Command-line surface: serve the dispatcher, submit and inspect jobs,
//! manage workflows, and drive the watcher by hand.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::store::JobState;

#[derive(Parser)]
#[command(name = "apiary", version, about = "Multi-tenant job orchestrator")]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "apiary.toml")]
    pub config: PathBuf,

    /// Tenant credential (omit when authentication is disabled).
    #[arg(long, global = true)]
    pub credential: Option<String>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the dispatch worker pool until interrupted.
    Serve,

    /// Submit a job and print its id.
    Submit {
        /// Registered job type (echo, agent_chat, workflow, ...).
        job_type: String,
        /// JSON payload.
        payload: String,
    },

    /// Show one job, inlining small results.
    Job { job_id: String },

    /// List jobs for the tenant.
    Jobs {
        #[arg(long)]
        state: Option<String>,
        #[arg(long = "type")]
        job_type: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Workflow definitions.
    #[command(subcommand)]
    Workflow(WorkflowCommands),

    /// Show a run with its node executions and decisions.
    Run { run_id: String },

    /// Blackboard summaries of live swarm runs.
    Agents,

    /// One tier-1 watcher pass over a run's coordination directory.
    Watch { run_id: String },

    /// Dependency health.
    Health,
}

#[derive(Subcommand)]
pub enum WorkflowCommands {
    /// Load a workflow definition from a JSON file.
    Create { file: PathBuf },
    /// List stored workflows.
    List,
    /// Show one workflow definition.
    Show { name: String },
}

pub fn parse_state(raw: &str) -> Option<JobState> {
    JobState::parse(&raw.to_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_state_case_insensitive() {
        assert_eq!(parse_state("queued"), Some(JobState::Queued));
        assert_eq!(parse_state("FAILED"), Some(JobState::Failed));
        assert_eq!(parse_state("bogus"), None);
    }
}
