//! swarmsh CLI: operator interface to a swarm and its span log.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::Value;
use swarmsh::agents::{AgentTypes, Roster};
use swarmsh::config::Config;
use swarmsh::emitter::Emitter;
use swarmsh::engine::{Swarm, replay};
use swarmsh::fsm::Outbound;
use swarmsh::model::Attributes;
use swarmsh::orchestrator::{Orchestrator, Scenario};
use swarmsh::span_log::SpanLog;
use swarmsh::telemetry::init_telemetry;
use swarmsh::watcher::Shutdown;

#[derive(Parser)]
#[command(name = "swarmsh", about = "FSM agents coordinating through a span log")]
struct Cli {
    /// Span log path (overrides SWARMSH_LOG_PATH)
    #[arg(long, global = true)]
    log: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent roster until Ctrl-C
    Run {
        /// Roster TOML (overrides SWARMSH_AGENTS)
        #[arg(long)]
        agents: Option<PathBuf>,
    },
    /// Seed a named scenario and print its trace id
    Start {
        scenario: String,
        /// Roster TOML describing the running agents
        #[arg(long)]
        agents: Option<PathBuf>,
    },
    /// Append a span
    Emit {
        /// Span name, e.g. swarmsh.roberts.open
        name: String,
        /// Join an existing trace instead of starting one
        #[arg(long)]
        trace_id: Option<String>,
        /// Trigger keyword (defaults to the last segment of the name)
        #[arg(long)]
        trigger: Option<String>,
        /// Producing agent id
        #[arg(long, default_value = "operator")]
        agent: String,
        /// Attribute as key=value; values that parse as JSON keep their type
        #[arg(long = "attr", value_parser = parse_attr)]
        attrs: Vec<(String, Value)>,
    },
    /// Print every span of a trace in log order
    Trace {
        trace_id: String,
        /// Print raw JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Rebuild agent states from the log without emitting
    Replay {
        #[arg(long)]
        agents: Option<PathBuf>,
    },
    /// List built-in scenarios
    Scenarios,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    if let Some(path) = cli.log {
        config.log.path = path;
    }
    let _guard = init_telemetry(config.telemetry())?;

    match cli.command {
        Command::Run { agents } => cmd_run(config, agents).await,
        Command::Start { scenario, agents } => cmd_start(config, scenario, agents).await,
        Command::Emit {
            name,
            trace_id,
            trigger,
            agent,
            attrs,
        } => cmd_emit(config, name, trace_id, trigger, agent, attrs).await,
        Command::Trace { trace_id, json } => cmd_trace(config, trace_id, json).await,
        Command::Replay { agents } => cmd_replay(config, agents).await,
        Command::Scenarios => {
            cmd_scenarios();
            Ok(())
        }
    }
}

fn parse_attr(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn roster(config: &Config, agents: Option<PathBuf>) -> anyhow::Result<Roster> {
    let path = agents.or_else(|| config.agents_file.clone());
    Ok(Roster::load_or_builtin(path.as_deref())?)
}

async fn open_log(config: &Config) -> anyhow::Result<Arc<SpanLog>> {
    Ok(Arc::new(SpanLog::open(config.log.clone()).await?))
}

async fn cmd_run(config: Config, agents: Option<PathBuf>) -> anyhow::Result<()> {
    let roster = roster(&config, agents)?;
    let types = AgentTypes::builtin()?;
    let log = open_log(&config).await?;

    let shutdown = Shutdown::new();
    let mut swarm = Swarm::new(Arc::clone(&log), shutdown.clone());
    for agent in roster.instantiate(&types)? {
        swarm
            .spawn(agent, config.watch.clone(), config.runner.clone())
            .await?;
    }
    tracing::info!(
        log = %log.path().display(),
        agents = ?swarm.agent_ids(),
        "swarm running"
    );

    let stop = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        stop.trigger();
    });
    shutdown.wait().await;

    for agent in swarm.shutdown().await? {
        println!("{:<16}  {:<10}  {}", agent.id(), agent.agent_type(), agent.state());
    }
    Ok(())
}

async fn cmd_start(
    config: Config,
    scenario: String,
    agents: Option<PathBuf>,
) -> anyhow::Result<()> {
    let roster = roster(&config, agents)?;
    let log = open_log(&config).await?;
    let orchestrator = Orchestrator::new(
        log,
        roster.agents.iter().map(|spec| spec.agent_type.clone()),
    )
    .with_watch_config(config.watch.clone());

    let trace_id = orchestrator.start(&scenario).await?;
    println!("{trace_id}");
    Ok(())
}

async fn cmd_emit(
    config: Config,
    name: String,
    trace_id: Option<String>,
    trigger: Option<String>,
    agent: String,
    attrs: Vec<(String, Value)>,
) -> anyhow::Result<()> {
    let emitter = Emitter::new(open_log(&config).await?);
    let trigger = trigger.unwrap_or_else(|| name.rsplit('.').next().unwrap_or(&name).to_string());

    let span = match trace_id {
        Some(trace_id) => {
            let mut outbound = Outbound::new(&name, &trigger);
            outbound.attributes.extend(attrs);
            emitter.emit_in_trace(&trace_id, &agent, &outbound).await?.1
        }
        None => {
            let attributes: Attributes = attrs.into_iter().collect();
            emitter.emit(&name, &agent, &trigger, attributes, None).await?
        }
    };

    println!("{}", span.to_json_line()?);
    Ok(())
}

async fn cmd_trace(config: Config, trace_id: String, json: bool) -> anyhow::Result<()> {
    let log = open_log(&config).await?;
    let spans = log.trace(&trace_id).await?;

    if spans.is_empty() {
        println!("No spans in trace {trace_id}.");
        return Ok(());
    }

    if json {
        for span in &spans {
            println!("{}", span.to_json_line()?);
        }
        return Ok(());
    }

    println!("{:<28}  {:<14}  {:<10}  {:<32}  PARENT", "NAME", "AGENT", "TRIGGER", "SPAN_ID");
    println!("{}", "-".repeat(100));
    for span in &spans {
        println!(
            "{:<28}  {:<14}  {:<10}  {:<32}  {}",
            span.name,
            span.agent().unwrap_or("-"),
            span.trigger(),
            span.span_id.as_deref().unwrap_or("-"),
            span.parent_span_id.as_deref().unwrap_or("-"),
        );
    }
    println!("\n{} span(s)", spans.len());
    Ok(())
}

async fn cmd_replay(config: Config, agents: Option<PathBuf>) -> anyhow::Result<()> {
    let roster = roster(&config, agents)?;
    let types = AgentTypes::builtin()?;
    let log = open_log(&config).await?;

    let mut agents = roster.instantiate(&types)?;
    let read = replay(&log, &mut agents).await?;

    for agent in &agents {
        println!("{:<16}  {:<10}  {}", agent.id(), agent.agent_type(), agent.state());
    }
    println!("\n{read} span(s) replayed");
    Ok(())
}

fn cmd_scenarios() {
    for scenario in Scenario::builtin() {
        println!(
            "{:<20}  {:<28}  {}",
            scenario.name,
            scenario.required.join(","),
            scenario.description
        );
    }
}
