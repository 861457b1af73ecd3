//! Tests for the built-in agent types and the roster.

use std::sync::Arc;

use serde_json::json;
use swarmsh::agents::{AgentSpec, AgentTypes, Roster, lean, ping, roberts, scrum};
use swarmsh::error::Error;
use swarmsh::fsm::{Agent, TransitionResult};
use swarmsh::model::Span;

fn types() -> AgentTypes {
    AgentTypes::builtin().unwrap()
}

fn span(name: &str, trigger: &str) -> swarmsh::model::SpanBuilder {
    Span::builder(name, "wf").trigger(trigger)
}

/// A delivery agent already executing sprint 42.
fn executing_team(spec: AgentSpec) -> Agent {
    let mut team = types().create(&spec).unwrap();
    team.apply(
        &span("swarmsh.scrum.plan", "plan")
            .attr("sprint_number", "42")
            .attr("team_id", "alpha")
            .build(),
    );
    assert_eq!(team.state(), scrum::EXECUTING);
    team
}

// ---------------------------------------------------------------------------
// Delivery quality gate
// ---------------------------------------------------------------------------

#[test]
fn review_above_threshold_starts_dmaic_instead_of_retro() {
    let mut team = executing_team(AgentSpec::new("scrum", "scrum"));

    let review = span("swarmsh.scrum.review", "review")
        .attr("defect_rate", 5.2)
        .build();
    let result = team.apply(&review);
    assert!(result.is_applied());
    assert_eq!(team.state(), scrum::REVIEW);
    assert_eq!(team.context().get("defect_rate"), Some(&json!(5.2)));

    let emitted = result.emitted();
    assert_eq!(emitted.len(), 1);
    let define = &emitted[0];
    assert_eq!(define.name, "swarmsh.lean.define");
    assert_eq!(define.attr_str("project_id"), Some("defect-sprint42"));
    assert_eq!(define.attr_f64("defect_rate"), Some(5.2));

    // The sprint cannot be closed out while over threshold.
    let retro = span("swarmsh.scrum.retro", "retro").build();
    assert!(matches!(
        team.apply(&retro),
        TransitionResult::GuardRejected { .. }
    ));
    assert_eq!(team.state(), scrum::REVIEW);

    let mut improvement = types().create(&AgentSpec::new("lean", "lean")).unwrap();
    assert!(improvement.apply(define).is_applied());
    assert_eq!(improvement.state(), lean::MEASURE);
    assert_eq!(
        improvement.context().get("project_id"),
        Some(&json!("defect-sprint42"))
    );
}

#[test]
fn review_within_threshold_proceeds_to_retro() {
    let mut team = executing_team(AgentSpec::new("scrum", "scrum"));

    let result = team.apply(
        &span("swarmsh.scrum.review", "review")
            .attr("defect_rate", 1.5)
            .build(),
    );
    let emitted = result.emitted().to_vec();
    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].name, "swarmsh.scrum.retro");

    assert!(team.apply(&emitted[0]).is_applied());
    assert_eq!(team.state(), scrum::RETRO);
    assert!(team.is_terminal());
}

#[test]
fn roster_threshold_parameter_is_honoured() {
    let spec = AgentSpec::new("lenient", "scrum").param(scrum::DEFECT_THRESHOLD, 6.0);
    let mut team = executing_team(spec);

    let result = team.apply(
        &span("swarmsh.scrum.review", "review")
            .attr("defect_rate", 5.2)
            .build(),
    );
    assert_eq!(result.emitted()[0].name, "swarmsh.scrum.retro");
}

#[test]
fn review_without_defect_rate_is_rejected() {
    let mut team = executing_team(AgentSpec::new("scrum", "scrum"));
    let result = team.apply(&span("swarmsh.scrum.review", "review").build());
    assert!(matches!(result, TransitionResult::GuardRejected { .. }));
    assert_eq!(team.state(), scrum::EXECUTING);
}

#[test]
fn daily_standup_escalates_blockers_only() {
    let mut team = executing_team(AgentSpec::new("scrum", "scrum"));

    let quiet = team.apply(&span("swarmsh.scrum.daily", "daily").build());
    assert!(quiet.is_applied());
    assert!(quiet.emitted().is_empty());

    let blocked = team.apply(
        &span("swarmsh.scrum.daily", "daily")
            .attr("blockers", json!(["staging down", "waiting on review"]))
            .build(),
    );
    let TransitionResult::Applied { from, to, emitted, .. } = blocked else {
        panic!("daily should apply");
    };
    assert_eq!((from, to), (scrum::EXECUTING, scrum::EXECUTING));
    assert_eq!(emitted[0].name, "swarmsh.scrum.escalate");
    assert_eq!(emitted[0].attr_str("sprint_number"), Some("42"));
    assert_eq!(emitted[0].attr("blockers").unwrap().as_array().unwrap().len(), 2);
}

// ---------------------------------------------------------------------------
// Improvement project
// ---------------------------------------------------------------------------

#[test]
fn dmaic_walks_to_control_and_requests_adoption() {
    let mut project = types().create(&AgentSpec::new("lean", "lean")).unwrap();

    let define = span("swarmsh.lean.define", "define")
        .attr("project_id", "defect-sprint42")
        .attr("problem_statement", "too many escapes")
        .build();
    assert!(project.apply(&define).is_applied());

    for (trigger, expected) in [
        ("measure", lean::ANALYZE),
        ("analyze", lean::IMPROVE),
        ("improve", lean::CONTROL),
    ] {
        let phase = span(&format!("swarmsh.lean.{trigger}"), trigger)
            .attr("summary", format!("{trigger} done"))
            .build();
        assert!(project.apply(&phase).is_applied(), "{trigger} should apply");
        assert_eq!(project.state(), expected);
    }
    assert_eq!(project.context().get("last_phase"), Some(&json!("improve")));

    let unvalidated = span("swarmsh.lean.control", "control").build();
    assert!(matches!(
        project.apply(&unvalidated),
        TransitionResult::GuardRejected { .. }
    ));

    let validated = span("swarmsh.lean.control", "control")
        .attr("validated", true)
        .build();
    let result = project.apply(&validated);
    assert!(result.is_applied());
    assert_eq!(project.state(), lean::CONTROL);

    let open = &result.emitted()[0];
    assert_eq!(open.name, "swarmsh.roberts.open");
    assert_eq!(open.attr_str("motion_id"), Some("adopt-defect-sprint42"));

    let mut gov = types().create(&AgentSpec::new("roberts", "roberts")).unwrap();
    assert!(gov.apply(open).is_applied());
    assert_eq!(gov.state(), roberts::MOTION_OPEN);
}

#[test]
fn define_without_project_is_rejected() {
    let mut project = types().create(&AgentSpec::new("lean", "lean")).unwrap();
    let result = project.apply(&span("swarmsh.lean.define", "define").build());
    assert!(matches!(result, TransitionResult::GuardRejected { .. }));
    assert_eq!(project.state(), lean::DEFINE);
}

#[test]
fn ping_answers_once() {
    let mut agent = types().create(&AgentSpec::new("pinger", "ping")).unwrap();
    let ping_span = span("swarmsh.ping.ping", "ping").build();

    let result = agent.apply(&ping_span);
    assert_eq!(agent.state(), ping::PINGED);
    let pong = &result.emitted()[0];
    assert_eq!(pong.name, "swarmsh.ping.pong");
    assert_eq!(pong.attr_str("ping_id"), ping_span.span_id.as_deref());

    // Pong is on the ping family's prefix but has no transition.
    assert_eq!(agent.apply(pong), TransitionResult::NoMatch);
}

// ---------------------------------------------------------------------------
// Registry and roster
// ---------------------------------------------------------------------------

#[test]
fn builtin_registry_lists_every_type() {
    assert_eq!(types().names(), ["lean", "ping", "roberts", "scrum"]);
}

#[test]
fn unknown_agent_type_is_an_error() {
    let err = types()
        .create(&AgentSpec::new("x", "kanban"))
        .unwrap_err();
    assert!(matches!(err, Error::UnknownAgentType(t) if t == "kanban"));
}

#[test]
fn builtin_roster_instantiates_one_agent_per_type() {
    let agents = Roster::builtin().instantiate(&types()).unwrap();
    let ids: Vec<&str> = agents.iter().map(Agent::id).collect();
    assert_eq!(ids, ["roberts", "scrum", "lean", "ping"]);
}

#[test]
fn roster_file_is_loaded() {
    let dir = std::env::temp_dir()
        .join("swarmsh-test")
        .join(uuid::Uuid::new_v4().to_string());
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("agents.toml");
    std::fs::write(
        &path,
        r#"
        [[agent]]
        id = "team-a"
        type = "scrum"

        [agent.params]
        defect_threshold = 2.0

        [[agent]]
        id = "team-b"
        type = "scrum"
        "#,
    )
    .unwrap();

    let roster = Roster::load_or_builtin(Some(path.as_path())).unwrap();
    let agents = roster.instantiate(&types()).unwrap();
    assert_eq!(agents.len(), 2);
    assert_eq!(agents[0].context().get("defect_threshold"), Some(&json!(2.0)));
    assert!(Arc::ptr_eq(agents[0].table(), agents[1].table()));

    assert!(matches!(
        Roster::load_from_file(&dir.join("missing.toml")),
        Err(Error::Config(_))
    ));
}
