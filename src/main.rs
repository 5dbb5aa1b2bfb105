use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use apiary::cli::{Cli, Commands, WorkflowCommands, parse_state};
use apiary::conductor::RunStore;
use apiary::config::ApiaryConfig;
use apiary::error::{ApiaryError, Result};
use apiary::store::JobFilter;
use apiary::tenant::TenantScope;
use apiary::watcher::Watcher;
use apiary::{CoreApi, WorkflowDef};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {} ({})", e, e.kind());
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("apiary=debug")
    } else {
        EnvFilter::new("apiary=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = ApiaryConfig::load(&cli.config).await?;
    let api = CoreApi::build(config)?;
    let credential = cli.credential.as_deref();

    match cli.command {
        Commands::Serve => cmd_serve(&api).await,
        Commands::Submit { job_type, payload } => {
            let payload = serde_json::from_str(&payload)?;
            let job_id = api.submit_job(credential, &job_type, payload).await?;
            println!("{}", job_id);
            Ok(())
        }
        Commands::Job { job_id } => {
            let view = api.get_job(credential, &job_id).await?;
            println!("{}", serde_json::to_string_pretty(&view)?);
            Ok(())
        }
        Commands::Jobs {
            state,
            job_type,
            limit,
        } => {
            let state = match state.as_deref() {
                Some(raw) => Some(parse_state(raw).ok_or_else(|| {
                    ApiaryError::Config(format!("unknown job state '{}'", raw))
                })?),
                None => None,
            };
            let jobs = api
                .list_jobs(
                    credential,
                    &JobFilter {
                        state,
                        job_type,
                        limit: Some(limit),
                    },
                )
                .await?;
            for job in jobs {
                println!(
                    "{}  {:<9}  {:<12}  {}",
                    job.id, job.state, job.job_type, job.updated_at
                );
            }
            Ok(())
        }
        Commands::Workflow(command) => cmd_workflow(&api, credential, command).await,
        Commands::Run { run_id } => cmd_run(&api, credential, &run_id).await,
        Commands::Agents => {
            let summaries = api.list_swarm_agents(credential).await?;
            println!("{}", serde_json::to_string_pretty(&summaries)?);
            Ok(())
        }
        Commands::Watch { run_id } => cmd_watch(&api, credential, &run_id).await,
        Commands::Health => {
            let health = api.health().await;
            println!("{}", serde_json::to_string_pretty(&health)?);
            if health.ok { Ok(()) } else {
                Err(ApiaryError::TransientBackend("dependency check failed".into()))
            }
        }
    }
}

async fn cmd_serve(api: &Arc<CoreApi>) -> Result<()> {
    let dispatcher = api.dispatcher();
    let shutdown = dispatcher.shutdown_token();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested, finishing current jobs");
            shutdown.cancel();
        }
    });

    dispatcher.run().await;
    Ok(())
}

fn tenant_store(api: &Arc<CoreApi>, credential: Option<&str>) -> Result<(TenantScope, RunStore)> {
    // CLI inspection commands read the tenant's run store directly.
    let config = api.config();
    let resolver = apiary::TenantResolver::new(&config.auth)?;
    let tenant_id = resolver.resolve(credential)?;
    let scope = TenantScope::new(&config.paths.data_dir, &tenant_id)?;
    let store = RunStore::open(scope.state_db())?;
    Ok((scope, store))
}

async fn cmd_workflow(
    api: &Arc<CoreApi>,
    credential: Option<&str>,
    command: WorkflowCommands,
) -> Result<()> {
    let (_, store) = tenant_store(api, credential)?;
    match command {
        WorkflowCommands::Create { file } => {
            let content = tokio::fs::read_to_string(&file).await?;
            let def: WorkflowDef = serde_json::from_str(&content)?;
            let id = store.create_workflow(&def)?;
            println!("{} ({})", def.name, id);
            Ok(())
        }
        WorkflowCommands::List => {
            for (id, name, description) in store.list_workflows()? {
                println!("{:<24}  {}  {}", name, id, description);
            }
            Ok(())
        }
        WorkflowCommands::Show { name } => {
            let (_, def) = store
                .get_workflow(&name)?
                .ok_or_else(|| ApiaryError::WorkflowNotFound(name))?;
            println!("{}", serde_json::to_string_pretty(&def)?);
            Ok(())
        }
    }
}

async fn cmd_run(api: &Arc<CoreApi>, credential: Option<&str>, run_id: &str) -> Result<()> {
    let (_, store) = tenant_store(api, credential)?;
    let run = store
        .get_run(run_id)?
        .ok_or_else(|| ApiaryError::RunNotFound(run_id.to_string()))?;
    println!("{}", serde_json::to_string_pretty(&run)?);

    println!("\nnode executions:");
    for execution in store.get_node_executions(run_id)? {
        println!(
            "  {}  {:<9}  {:<10}  retries={}",
            execution.node_id,
            execution.status.as_str(),
            execution.node_kind.as_str(),
            execution.retry_count
        );
    }

    println!("\ndecisions:");
    for decision in store.get_decisions(run_id)? {
        println!("  {}  {}  {}", decision.created_at, decision.kind, decision.reason);
    }
    Ok(())
}

async fn cmd_watch(api: &Arc<CoreApi>, credential: Option<&str>, run_id: &str) -> Result<()> {
    let (scope, _) = tenant_store(api, credential)?;
    let coordination = scope.coordination_dir(run_id)?;
    let config = api.config();
    let watcher = Watcher::open(
        &coordination,
        config.watcher.clone(),
        config.blackboard.clone(),
    )?;
    let verdict = watcher.poll_once()?;
    println!("{}", verdict.as_str());
    if verdict == apiary::Tier1Verdict::InterventionNeeded {
        let action = watcher.handle_escalation()?;
        println!("tier-2: {}", action.as_str());
    }
    Ok(())
}
