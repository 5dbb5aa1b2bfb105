//! Swarm coordination through the blackboard plus the tiered watcher:
//! claim conflicts, stale-agent escalation, tier-2 restart, and cleanup.

use std::time::Duration;

use tempfile::TempDir;

use apiary::blackboard::{AgentState, Blackboard, ClaimOutcome};
use apiary::config::{BlackboardConfig, WatcherConfig};
use apiary::exec::FindingKind;
use apiary::watcher::{EscalationSignal, Tier1Verdict, Tier2Action, Watcher};

#[test]
fn test_claim_conflict_resolves_after_release() {
    let dir = TempDir::new().unwrap();
    let board = Blackboard::create(dir.path(), "r-1", BlackboardConfig::default()).unwrap();
    board.register_agent("swarm-writer", "edit config pair", &[]).unwrap();
    board.register_agent("swarm-refactor", "restructure", &[]).unwrap();

    // Two agents race for an overlapping file set; exactly one wins.
    let won = board
        .claim_chain(
            "swarm-writer",
            &["src/config.rs".into(), "src/main.rs".into()],
            "keep the pair consistent",
            Duration::from_secs(120),
        )
        .unwrap();
    let chain_id = won.chain_id().expect("first claim granted").to_string();

    let blocked = board
        .claim_chain(
            "swarm-refactor",
            &["src/main.rs".into(), "src/lib.rs".into()],
            "move entry point",
            Duration::from_secs(120),
        )
        .unwrap();
    let conflicts = match blocked {
        ClaimOutcome::Blocked { conflicts } => conflicts,
        ClaimOutcome::Granted { .. } => panic!("overlap must block"),
    };
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].chain_id, chain_id);
    assert!(conflicts[0].files.contains("src/main.rs"));

    // Winner releases; the loser's retry covers every previously held file.
    board.release_chain("swarm-writer", &chain_id).unwrap();
    let retry = board
        .claim_chain(
            "swarm-refactor",
            &["src/main.rs".into(), "src/config.rs".into()],
            "retry after release",
            Duration::from_secs(120),
        )
        .unwrap();
    assert!(retry.chain_id().is_some());
}

#[test]
fn test_stale_agent_escalation_restart_to_completion() {
    let dir = TempDir::new().unwrap();
    let board = Blackboard::create(dir.path(), "r-7", BlackboardConfig::default()).unwrap();
    board.register_agent("audit-scout", "map the module", &[]).unwrap();
    board.register_agent("audit-critic", "challenge findings", &[]).unwrap();
    board.update_agent_state("audit-critic", AgentState::Completed).unwrap();

    // Zero heartbeat tolerance: the remaining active agent reads as stuck.
    let mut watcher_config = WatcherConfig::default();
    watcher_config.heartbeat_timeout_secs = 0;
    watcher_config.poll_interval_secs = 1;
    let watcher = Watcher::open(dir.path(), watcher_config, BlackboardConfig::default()).unwrap();

    std::thread::sleep(Duration::from_millis(10));
    assert_eq!(watcher.poll_once().unwrap(), Tier1Verdict::InterventionNeeded);

    // The signal names the stale agent and carries the log tail.
    let signal = EscalationSignal::load(dir.path()).unwrap().unwrap();
    assert_eq!(signal.stale_agents, vec!["audit-scout".to_string()]);
    assert!(!signal.log_tail.is_empty());

    // Tier-2 restarts: stale -> active with a fresh heartbeat, signal
    // archived so tier-1 resumes.
    assert_eq!(watcher.handle_escalation().unwrap(), Tier2Action::Restart);
    assert!(!EscalationSignal::exists(dir.path()));
    let doc = board.snapshot().unwrap();
    assert_eq!(doc.agents["audit-scout"].state, AgentState::Active);

    // The revived agent finishes; a normal watcher pass declares the run
    // complete and cleans up.
    board.update_agent_state("audit-scout", AgentState::Completed).unwrap();
    let healthy = Watcher::open(
        dir.path(),
        WatcherConfig::default(),
        BlackboardConfig::default(),
    )
    .unwrap();
    assert_eq!(healthy.poll_once().unwrap(), Tier1Verdict::Complete);
    assert!(dir.path().join("blackboard.archived.json").exists());
}

#[test]
fn test_tier1_only_reads_tier2_only_mutates() {
    let dir = TempDir::new().unwrap();
    let board = Blackboard::create(dir.path(), "r-9", BlackboardConfig::default()).unwrap();
    board.register_agent("a", "work", &[]).unwrap();
    board
        .add_finding(
            "a",
            FindingKind::Blocker,
            "stuck on migration",
            &[],
            apiary::blackboard::Importance::Critical,
            &[],
        )
        .unwrap();

    let watcher = Watcher::open(
        dir.path(),
        WatcherConfig::default(),
        BlackboardConfig::default(),
    )
    .unwrap();

    // Tier-1 sees the blocker and escalates, but agent entries are
    // untouched by the poll itself.
    let before = serde_json::to_string(&board.snapshot().unwrap().agents).unwrap();
    assert_eq!(watcher.poll_once().unwrap(), Tier1Verdict::InterventionNeeded);
    let after = serde_json::to_string(&board.snapshot().unwrap().agents).unwrap();
    assert_eq!(before, after);

    // Tier-2 is the layer that mutates (here: blocker from a live agent
    // with no failures resolves to a synthesize decision on the board).
    let action = watcher.handle_escalation().unwrap();
    assert_eq!(action, Tier2Action::Synthesize);
    let doc = board.snapshot().unwrap();
    assert!(doc.findings.iter().any(|f| f.kind == FindingKind::Decision));
}

#[test]
fn test_escalation_signal_is_raced_exactly_once() {
    let dir = TempDir::new().unwrap();
    let board = Blackboard::create(dir.path(), "r-2", BlackboardConfig::default()).unwrap();
    board.register_agent("only", "work", &[]).unwrap();

    let mut config = WatcherConfig::default();
    config.heartbeat_timeout_secs = 0;
    let watcher = Watcher::open(dir.path(), config, BlackboardConfig::default()).unwrap();

    std::thread::sleep(Duration::from_millis(10));
    // Repeated polls with a pending signal do not create a second one and
    // do not error.
    assert_eq!(watcher.poll_once().unwrap(), Tier1Verdict::InterventionNeeded);
    let first = EscalationSignal::load(dir.path()).unwrap().unwrap();
    assert_eq!(watcher.poll_once().unwrap(), Tier1Verdict::InterventionNeeded);
    let second = EscalationSignal::load(dir.path()).unwrap().unwrap();
    assert_eq!(first.id, second.id);
}
