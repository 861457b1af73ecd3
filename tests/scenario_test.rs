//! End-to-end tests: a swarm of runners on a shared log, driven by the
//! orchestrator.

use std::collections::HashSet;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use swarmsh::agents::{AgentTypes, Roster, lean, roberts, scrum};
use swarmsh::emitter::Emitter;
use swarmsh::engine::{AgentRunner, RunnerConfig, Swarm, TRANSITION_SPAN, runner};
use swarmsh::error::Error;
use swarmsh::fsm::{
    Agent, EffectError, EffectInput, EffectResult, Effects, Outbound, Transition, TransitionTable,
};
use swarmsh::model::{Attributes, Span};
use swarmsh::orchestrator::{Orchestrator, Scenario};
use swarmsh::span_log::{LogConfig, SpanLog};
use swarmsh::watcher::{Shutdown, WatchConfig};
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(10);

struct Fixture {
    dir: PathBuf,
    path: PathBuf,
    log: Arc<SpanLog>,
}

impl Fixture {
    async fn new() -> Self {
        let dir = std::env::temp_dir()
            .join("swarmsh-test")
            .join(Uuid::new_v4().to_string());
        let path = dir.join("spans.jsonl");
        let log = Arc::new(
            SpanLog::open(LogConfig {
                path: path.clone(),
                sync_on_append: false,
            })
            .await
            .expect("open span log"),
        );
        Self { dir, path, log }
    }

    fn len(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    /// Start the built-in roster against this log.
    async fn swarm(&self, config: RunnerConfig) -> Swarm {
        let types = AgentTypes::builtin().unwrap();
        let mut swarm = Swarm::new(Arc::clone(&self.log), Shutdown::new());
        for agent in Roster::builtin().instantiate(&types).unwrap() {
            swarm.spawn(agent, fast(), config.clone()).await.unwrap();
        }
        swarm
    }
}

fn fast() -> WatchConfig {
    WatchConfig {
        poll_min: Duration::from_millis(5),
        poll_max: Duration::from_millis(25),
    }
}

fn runner_config() -> RunnerConfig {
    RunnerConfig {
        retry_backoff: Duration::from_millis(10),
        ..RunnerConfig::default()
    }
}

/// Poll until every runner has consumed the whole log.
async fn settle(swarm: &Swarm, fixture: &Fixture) {
    let deadline = Instant::now() + WAIT;
    loop {
        let len = fixture.len();
        if swarm.statuses().iter().all(|s| s.position == len) && fixture.len() == len {
            return;
        }
        assert!(Instant::now() < deadline, "swarm did not settle: {:?}", swarm.statuses());
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn names(spans: &[Span]) -> Vec<&str> {
    spans.iter().map(|s| s.name.as_str()).collect()
}

// ---------------------------------------------------------------------------
// Built-in scenarios
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn governance_motion_cascades_into_sprint_planning() {
    let fx = Fixture::new().await;
    let swarm = fx.swarm(runner_config()).await;
    let orchestrator = Orchestrator::new(Arc::clone(&fx.log), swarm.agent_types());

    let trace_id = orchestrator.start("governance-delivery").await.unwrap();

    swarm.wait_for_state("roberts", roberts::CLOSED, WAIT).await.unwrap();
    swarm.wait_for_state("scrum", scrum::EXECUTING, WAIT).await.unwrap();
    settle(&swarm, &fx).await;

    let trace = orchestrator.trace(&trace_id).await.unwrap();
    let plan = trace
        .iter()
        .find(|s| s.name == "swarmsh.scrum.plan")
        .expect("cascade span on the log");
    let close = trace
        .iter()
        .find(|s| s.name == "swarmsh.roberts.close")
        .unwrap();
    assert_eq!(plan.parent_span_id, close.span_id);
    assert_eq!(plan.agent(), Some("roberts"));

    let transitions = trace.iter().filter(|s| s.name == TRANSITION_SPAN).count();
    assert_eq!(transitions, 4, "three governance steps and one delivery step");
    assert_eq!(trace.len(), 8);

    let agents = swarm.shutdown().await.unwrap();
    let lean_agent = agents.iter().find(|a| a.id() == "lean").unwrap();
    assert_eq!(lean_agent.state(), lean::DEFINE);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn quality_gate_breach_starts_improvement_project() {
    let fx = Fixture::new().await;
    let swarm = fx.swarm(runner_config()).await;
    let orchestrator = Orchestrator::new(Arc::clone(&fx.log), swarm.agent_types());

    let trace_id = orchestrator.start("quality-gate").await.unwrap();

    swarm.wait_for_state("lean", lean::MEASURE, WAIT).await.unwrap();
    settle(&swarm, &fx).await;
    assert_eq!(swarm.status("scrum").unwrap().state, scrum::REVIEW);

    let trace = orchestrator.trace(&trace_id).await.unwrap();
    let define = trace
        .iter()
        .find(|s| s.name == "swarmsh.lean.define")
        .expect("define cascade");
    assert_eq!(define.attr_str("project_id"), Some("defect-sprint42"));
    assert!(!names(&trace).contains(&"swarmsh.scrum.retro"));

    swarm.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_loop_chains_all_three_agent_families() {
    let fx = Fixture::new().await;
    let swarm = fx.swarm(runner_config()).await;
    let orchestrator =
        Orchestrator::new(Arc::clone(&fx.log), swarm.agent_types()).with_watch_config(fast());

    let trace_id = orchestrator.start("full-loop").await.unwrap();

    swarm.wait_for_state("lean", lean::MEASURE, WAIT).await.unwrap();
    settle(&swarm, &fx).await;

    let status = swarm.statuses();
    let state_of = |id: &str| status.iter().find(|s| s.id == id).unwrap().state.clone();
    assert_eq!(state_of("roberts"), roberts::CLOSED);
    assert_eq!(state_of("scrum"), scrum::REVIEW);
    assert_eq!(state_of("ping"), "IDLE");

    let trace = orchestrator.trace(&trace_id).await.unwrap();
    let order = names(&trace);
    let at = |name: &str| order.iter().position(|n| *n == name).unwrap();
    assert!(at("swarmsh.scrum.plan") < at("swarmsh.scrum.review"));
    assert!(at("swarmsh.scrum.review") < at("swarmsh.lean.define"));

    swarm.shutdown().await.unwrap();
}

#[tokio::test]
async fn scenario_requires_its_agents() {
    let fx = Fixture::new().await;
    let orchestrator = Orchestrator::new(Arc::clone(&fx.log), ["roberts"]);

    let err = orchestrator.start("quality-gate").await.unwrap_err();
    match err {
        Error::MissingAgents { scenario, missing } => {
            assert_eq!(scenario, "quality-gate");
            assert_eq!(missing, ["scrum", "lean"]);
        }
        other => panic!("expected MissingAgents, got {other:?}"),
    }
    assert_eq!(fx.len(), 0, "nothing is seeded for a refused scenario");

    assert!(matches!(
        orchestrator.start("no-such-thing").await,
        Err(Error::UnknownScenario(_))
    ));
    assert_eq!(Scenario::builtin().len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn awaiting_a_span_that_never_comes_times_out() {
    let fx = Fixture::new().await;
    let orchestrator =
        Orchestrator::new(Arc::clone(&fx.log), Vec::<String>::new()).with_watch_config(fast());
    let err = orchestrator
        .wait_for_span("nope", "swarmsh.scrum.plan", Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
}

// ---------------------------------------------------------------------------
// Resilience
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn malformed_line_does_not_stall_the_swarm() {
    let fx = Fixture::new().await;
    let swarm = fx.swarm(runner_config()).await;
    let emitter = Emitter::new(Arc::clone(&fx.log));

    let open = emitter
        .emit("swarmsh.roberts.open", "operator", "open", Attributes::new(), None)
        .await
        .unwrap();
    std::fs::OpenOptions::new()
        .append(true)
        .open(&fx.path)
        .unwrap()
        .write_all(b"not a span at all\n")
        .unwrap();
    emitter
        .emit("swarmsh.roberts.vote", "operator", "vote", Attributes::new(), Some(&open))
        .await
        .unwrap();

    swarm.wait_for_state("roberts", roberts::VOTING, WAIT).await.unwrap();
    swarm.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_replays_without_duplicating_cascades() {
    let fx = Fixture::new().await;

    let first = fx.swarm(runner_config()).await;
    let orchestrator = Orchestrator::new(Arc::clone(&fx.log), first.agent_types());
    orchestrator.start("quality-gate").await.unwrap();
    first.wait_for_state("lean", lean::MEASURE, WAIT).await.unwrap();
    settle(&first, &fx).await;
    first.shutdown().await.unwrap();

    let before = fx.log.read_all().await.unwrap().len();

    // Fresh agents, no checkpoints: everything is replayed from offset 0.
    let second = fx.swarm(runner_config()).await;
    second.wait_for_state("lean", lean::MEASURE, WAIT).await.unwrap();
    settle(&second, &fx).await;
    let agents = second.shutdown().await.unwrap();

    let entries = fx.log.read_all().await.unwrap();
    assert_eq!(entries.len(), before);
    let ids: HashSet<_> = entries.iter().filter_map(|e| e.span.span_id.clone()).collect();
    assert_eq!(ids.len(), entries.len());

    let scrum_agent = agents.iter().find(|a| a.id() == "scrum").unwrap();
    assert_eq!(scrum_agent.state(), scrum::REVIEW);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn checkpoints_resume_where_the_runner_stopped() {
    let fx = Fixture::new().await;
    let checkpoints = fx.dir.join("checkpoints");
    let config = RunnerConfig {
        checkpoint_dir: Some(checkpoints.clone()),
        ..runner_config()
    };

    let swarm = fx.swarm(config.clone()).await;
    let orchestrator = Orchestrator::new(Arc::clone(&fx.log), swarm.agent_types());
    orchestrator.start("governance-delivery").await.unwrap();
    swarm.wait_for_state("scrum", scrum::EXECUTING, WAIT).await.unwrap();
    settle(&swarm, &fx).await;
    swarm.shutdown().await.unwrap();

    let snapshot = runner::load_checkpoint(&checkpoints, "roberts")
        .await
        .unwrap()
        .expect("roberts checkpoint written");
    assert_eq!(snapshot.state, roberts::CLOSED);
    assert_eq!(snapshot.offset, fx.len());
    assert!(!checkpoints.join("roberts.json.tmp").exists());

    let types = AgentTypes::builtin().unwrap();
    let fresh = types
        .create(&swarmsh::agents::AgentSpec::new("roberts", "roberts"))
        .unwrap();
    let resumed = AgentRunner::new(fresh, Arc::clone(&fx.log), fast(), config, Shutdown::new())
        .await
        .unwrap();
    assert_eq!(resumed.agent().state(), roberts::CLOSED);
    assert_eq!(resumed.status().borrow().position, fx.len());
}

fn always_fails(_: &EffectInput<'_>) -> EffectResult {
    Err(EffectError("backend down".into()))
}

fn records(_: &EffectInput<'_>) -> EffectResult {
    Ok(Effects::none().emit(Outbound::new("test.stuck.recorded", "recorded")))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeatedly_failing_effect_is_surfaced_then_skipped() {
    let fx = Fixture::new().await;
    let table = Arc::new(
        TransitionTable::builder("stuck", &["WAITING", "DONE"], "WAITING")
            .listen("test.stuck.")
            .transition(Transition::new("WAITING", "go", "DONE").effect(always_fails))
            .transition(Transition::new("WAITING", "other", "DONE").effect(records))
            .build()
            .unwrap(),
    );

    let mut swarm = Swarm::new(Arc::clone(&fx.log), Shutdown::new());
    swarm
        .spawn(
            Agent::new("stuck-1", table),
            fast(),
            RunnerConfig {
                max_effect_attempts: 3,
                emit_transition_spans: false,
                ..runner_config()
            },
        )
        .await
        .unwrap();

    let emitter = Emitter::new(Arc::clone(&fx.log));
    emitter
        .emit("test.stuck.go", "operator", "go", Attributes::new(), None)
        .await
        .unwrap();

    settle(&swarm, &fx).await;
    let status = swarm.status("stuck-1").unwrap();
    assert_eq!(status.state, "WAITING");
    assert_eq!(status.total_failures, 3);
    assert_eq!(status.consecutive_failures, 0);
    assert_eq!(status.last_error.as_deref(), Some("backend down"));

    // The runner moved on and still processes later spans.
    emitter
        .emit("test.stuck.other", "operator", "other", Attributes::new(), None)
        .await
        .unwrap();
    swarm.wait_for_state("stuck-1", "DONE", WAIT).await.unwrap();
    settle(&swarm, &fx).await;

    let names: Vec<String> = fx
        .log
        .read_all()
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.span.name)
        .collect();
    assert!(names.contains(&"test.stuck.recorded".to_string()));
    assert!(!names.iter().any(|n| n == TRANSITION_SPAN));

    swarm.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_span_drives_one_transition_without_a_listen_prefix() {
    let fx = Fixture::new().await;
    let table = Arc::new(
        TransitionTable::builder("relay", &["A", "B", "C"], "A")
            .transition(Transition::new("A", "go", "B"))
            .transition(Transition::new("B", "go", "C"))
            .build()
            .unwrap(),
    );

    let mut swarm = Swarm::new(Arc::clone(&fx.log), Shutdown::new());
    swarm
        .spawn(Agent::new("relay-1", table), fast(), runner_config())
        .await
        .unwrap();

    Emitter::new(Arc::clone(&fx.log))
        .emit("job.go", "operator", "go", Attributes::new(), None)
        .await
        .unwrap();
    swarm.wait_for_state("relay-1", "B", WAIT).await.unwrap();
    settle(&swarm, &fx).await;

    assert_eq!(swarm.status("relay-1").unwrap().state, "B");
    let logged: Vec<Span> = fx.log.read_all().await.unwrap().into_iter().map(|e| e.span).collect();
    assert_eq!(names(&logged), ["job.go", TRANSITION_SPAN]);
    assert_eq!(logged[1].attr_str("swarm.agent.transition.trigger"), Some("go"));

    let agents = swarm.shutdown().await.unwrap();
    assert_eq!(agents[0].state(), "B");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn identical_anonymous_lines_each_escalate() {
    let fx = Fixture::new().await;
    let types = AgentTypes::builtin().unwrap();
    let mut swarm = Swarm::new(Arc::clone(&fx.log), Shutdown::new());
    swarm
        .spawn(
            types.create(&swarmsh::agents::AgentSpec::new("scrum", "scrum")).unwrap(),
            fast(),
            runner_config(),
        )
        .await
        .unwrap();

    Emitter::new(Arc::clone(&fx.log))
        .emit("swarmsh.scrum.plan", "operator", "plan", Attributes::new(), None)
        .await
        .unwrap();
    swarm.wait_for_state("scrum", scrum::EXECUTING, WAIT).await.unwrap();

    let line = b"{\"name\":\"swarmsh.scrum.daily\",\"trace_id\":\"standup\",\"attributes\":{\"trigger\":\"daily\",\"blockers\":[\"ci down\"]}}\n";
    {
        let mut file = std::fs::OpenOptions::new().append(true).open(&fx.path).unwrap();
        file.write_all(line).unwrap();
        file.write_all(line).unwrap();
    }
    settle(&swarm, &fx).await;

    let escalations = fx
        .log
        .read_all()
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.span.name == "swarmsh.scrum.escalate")
        .count();
    assert_eq!(escalations, 2);
    swarm.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_checkpoint_write_is_surfaced_and_runner_keeps_going() {
    let fx = Fixture::new().await;
    std::fs::create_dir_all(&fx.dir).unwrap();
    let blocker = fx.dir.join("not-a-dir");
    std::fs::write(&blocker, b"file").unwrap();

    let types = AgentTypes::builtin().unwrap();
    let mut swarm = Swarm::new(Arc::clone(&fx.log), Shutdown::new());
    swarm
        .spawn(
            types.create(&swarmsh::agents::AgentSpec::new("roberts", "roberts")).unwrap(),
            fast(),
            RunnerConfig {
                checkpoint_dir: Some(blocker.join("checkpoints")),
                ..runner_config()
            },
        )
        .await
        .unwrap();

    Emitter::new(Arc::clone(&fx.log))
        .emit("swarmsh.roberts.open", "operator", "open", Attributes::new(), None)
        .await
        .unwrap();
    let status = swarm
        .wait_for_state("roberts", roberts::MOTION_OPEN, WAIT)
        .await
        .unwrap();
    assert_eq!(status.id, "roberts");

    let deadline = Instant::now() + WAIT;
    loop {
        let status = swarm.status("roberts").unwrap();
        if status.consecutive_failures >= 2 {
            assert!(
                status
                    .last_error
                    .as_deref()
                    .is_some_and(|e| e.starts_with("checkpoint write failed"))
            );
            break;
        }
        assert!(Instant::now() < deadline, "checkpoint failure not surfaced: {status:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Still alive: shutdown collects the agent instead of an error.
    let agents = swarm.shutdown().await.unwrap();
    assert_eq!(agents[0].state(), roberts::MOTION_OPEN);
}

fn explodes(_: &EffectInput<'_>) -> EffectResult {
    panic!("effect blew up");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_joins_every_runner_before_reporting_a_failure() {
    let fx = Fixture::new().await;
    let table = Arc::new(
        TransitionTable::builder("fragile", &["A", "B"], "A")
            .listen("test.fragile.")
            .transition(Transition::new("A", "go", "B").effect(explodes))
            .build()
            .unwrap(),
    );
    let types = AgentTypes::builtin().unwrap();

    let mut swarm = Swarm::new(Arc::clone(&fx.log), Shutdown::new());
    swarm
        .spawn(Agent::new("fragile-1", table), fast(), runner_config())
        .await
        .unwrap();
    swarm
        .spawn(
            types.create(&swarmsh::agents::AgentSpec::new("pinger", "ping")).unwrap(),
            fast(),
            runner_config(),
        )
        .await
        .unwrap();

    Emitter::new(Arc::clone(&fx.log))
        .emit("test.fragile.go", "operator", "go", Attributes::new(), None)
        .await
        .unwrap();
    assert!(swarm.wait_for_state("fragile-1", "B", WAIT).await.is_err());

    let healthy = swarm.subscribe("pinger").unwrap();
    let err = swarm.shutdown().await.unwrap_err();
    assert!(matches!(err, Error::Other(msg) if msg.contains("fragile-1")));
    assert!(healthy.has_changed().is_err(), "healthy runner was not joined");
}

#[tokio::test]
async fn replay_rebuilds_agents_without_writing() {
    let fx = Fixture::new().await;
    let emitter = Emitter::new(Arc::clone(&fx.log));
    let open = emitter
        .emit("swarmsh.roberts.open", "operator", "open", Attributes::new(), None)
        .await
        .unwrap();
    emitter
        .emit("swarmsh.roberts.vote", "operator", "vote", Attributes::new(), Some(&open))
        .await
        .unwrap();
    let len = fx.len();

    let types = AgentTypes::builtin().unwrap();
    let mut agents = Roster::builtin().instantiate(&types).unwrap();
    let read = runner::replay(&fx.log, &mut agents).await.unwrap();

    assert_eq!(read, 2);
    assert_eq!(agents[0].state(), roberts::VOTING);
    assert_eq!(fx.len(), len);
}
