//! The full stack in one pass: a `workflow` job submitted through the
//! capability surface, leased by a dispatch worker, driven by the conductor,
//! with durable run state left behind in the tenant database.

use serde_json::json;
use tempfile::TempDir;

use apiary::CoreApi;
use apiary::conductor::{
    EdgeDef, END_NODE, NodeDef, NodeKind, RunStore, START_NODE, WorkflowDef,
};
use apiary::config::ApiaryConfig;
use apiary::store::JobState;
use apiary::tenant::TenantScope;

fn single(id: &str, template: &str) -> NodeDef {
    NodeDef {
        id: id.into(),
        name: None,
        kind: NodeKind::Single,
        prompt_template: template.into(),
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

fn seed_workflow(data_dir: &std::path::Path) {
    let scope = TenantScope::new(data_dir, "default").unwrap();
    let store = RunStore::open(scope.state_db()).unwrap();
    store
        .create_workflow(&WorkflowDef {
            name: "triage".into(),
            description: "scan then summarize".into(),
            nodes: vec![
                single("scan", "scan the target: {target}"),
                single("summarize", "summarize findings"),
            ],
            edges: vec![
                edge(START_NODE, "scan"),
                edge("scan", "summarize"),
                edge("summarize", END_NODE),
            ],
        })
        .unwrap();
}

#[tokio::test]
async fn test_workflow_job_end_to_end() {
    let dir = TempDir::new().unwrap();
    let mut config = ApiaryConfig::default();
    config.paths.data_dir = dir.path().to_path_buf();
    let api = CoreApi::build(config).unwrap();
    seed_workflow(dir.path());

    let job_id = api
        .submit_job(
            None,
            "workflow",
            json!({"workflow": "triage", "input": {"target": "src/lib.rs"}}),
        )
        .await
        .unwrap();

    assert!(api.dispatcher().run_once("w-0").await.unwrap());

    let view = api.get_job(None, &job_id).await.unwrap();
    assert_eq!(view.job.state, JobState::Succeeded, "{:?}", view.job.error_message);

    let result = view.result.expect("inline result");
    let run_id = result["result_json"]["run_id"].as_str().unwrap().to_string();
    assert!(result["result_json"]["summary"]
        .as_str()
        .unwrap()
        .contains("2 node(s) fired"));

    // Durable run state in the tenant database.
    let scope = TenantScope::new(dir.path(), "default").unwrap();
    let store = RunStore::open(scope.state_db()).unwrap();
    let run = store.get_run(&run_id).unwrap().unwrap();
    assert_eq!(run.status, apiary::conductor::RunStatus::Completed);
    assert_eq!(run.completed_nodes, 2);
    assert_eq!(run.tenant_id, "default");

    let executions = store.get_node_executions(&run_id).unwrap();
    assert_eq!(executions.len(), 2);
    // The first node's prompt was rendered against the job input.
    assert!(executions[0].prompt.contains("src/lib.rs"));
    assert_eq!(executions[0].prompt_hash.len(), 16);
}

#[tokio::test]
async fn test_workflow_job_for_missing_workflow_fails_cleanly() {
    let dir = TempDir::new().unwrap();
    let mut config = ApiaryConfig::default();
    config.paths.data_dir = dir.path().to_path_buf();
    let api = CoreApi::build(config).unwrap();

    let job_id = api
        .submit_job(None, "workflow", json!({"workflow": "ghost"}))
        .await
        .unwrap();
    assert!(api.dispatcher().run_once("w-0").await.unwrap());

    let view = api.get_job(None, &job_id).await.unwrap();
    assert_eq!(view.job.state, JobState::Failed);
    // Stable error kind lets the client distinguish bad input from flakes.
    assert_eq!(
        view.job.error_kind,
        Some(apiary::error::ErrorKind::NotFound)
    );
    assert!(view.job.error_message.as_deref().unwrap().contains("ghost"));
}

#[tokio::test]
async fn test_swarm_workflow_populates_blackboard_summaries() {
    let dir = TempDir::new().unwrap();
    let mut config = ApiaryConfig::default();
    config.paths.data_dir = dir.path().to_path_buf();
    let api = CoreApi::build(config).unwrap();

    let scope = TenantScope::new(dir.path(), "default").unwrap();
    let store = RunStore::open(scope.state_db()).unwrap();
    store
        .create_workflow(&WorkflowDef {
            name: "hive".into(),
            description: String::new(),
            nodes: vec![NodeDef {
                id: "explore".into(),
                name: None,
                kind: NodeKind::Swarm,
                prompt_template: "explore the repo".into(),
                config: apiary::conductor::NodeConfig {
                    roles: vec![
                        apiary::conductor::RoleDef {
                            name: "scout".into(),
                            task: Some("map the tree".into()),
                            interests: vec!["layout".into()],
                        },
                        apiary::conductor::RoleDef {
                            name: "critic".into(),
                            task: None,
                            interests: vec![],
                        },
                    ],
                    ..Default::default()
                },
            }],
            edges: vec![edge(START_NODE, "explore"), edge("explore", END_NODE)],
        })
        .unwrap();

    let job_id = api
        .submit_job(None, "workflow", json!({"workflow": "hive"}))
        .await
        .unwrap();
    assert!(api.dispatcher().run_once("w-0").await.unwrap());

    let view = api.get_job(None, &job_id).await.unwrap();
    assert_eq!(view.job.state, JobState::Succeeded, "{:?}", view.job.error_message);

    // The swarm's blackboard is visible through the agents capability.
    let summaries = api.list_swarm_agents(None).await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].agents.len(), 2);
    let ids: Vec<&str> = summaries[0]
        .agents
        .iter()
        .map(|a| a.agent_id.as_str())
        .collect();
    assert!(ids.contains(&"explore-scout"));
    assert!(ids.contains(&"explore-critic"));
}
