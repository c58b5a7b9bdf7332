//! CLI binary for running, streaming, and validating flowgraph workflows.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

use flowgraph_engine::capabilities::code_review::{
    DEFAULT_COMPLEXITY_THRESHOLD, DEFAULT_QUALITY_THRESHOLD, DEFAULT_REVIEW_ITERATIONS,
};
use flowgraph_engine::{
    code_review_graph, compile, default_registry, validate, EdgeKind, EngineConfig,
    GraphDefinition, RunManager, Severity,
};
use flowgraph_types::{ExecutionResult, FlowError, LogStatus, RunState, RunStatus};

#[derive(Parser)]
#[command(
    name = "flowgraph",
    version,
    about = "Graph workflow runner with loops and conditional routing"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(clap::Args)]
struct RunArgs {
    /// Path to the graph definition (.json)
    graph: PathBuf,

    /// Initial state as a JSON object
    #[arg(long, conflicts_with = "state_file")]
    state: Option<String>,

    /// Read the initial state from a JSON file
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Global iteration ceiling for the run
    #[arg(
        long,
        env = "FLOWGRAPH_MAX_ITERATIONS",
        default_value_t = flowgraph_engine::DEFAULT_MAX_ITERATIONS
    )]
    max_iterations: usize,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a graph to completion
    Run {
        #[command(flatten)]
        args: RunArgs,

        /// Write the run record as JSON to this path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run a graph, printing one JSON event per line
    Stream {
        #[command(flatten)]
        args: RunArgs,
    },

    /// Validate a graph definition
    Validate {
        /// Path to the graph definition (.json)
        graph: PathBuf,
    },

    /// Show information about a graph definition
    Info {
        /// Path to the graph definition (.json)
        graph: PathBuf,
    },

    /// Review a source file with the built-in code review workflow
    Review {
        /// Source file to review
        source: PathBuf,

        #[arg(long, default_value_t = DEFAULT_COMPLEXITY_THRESHOLD)]
        complexity_threshold: u64,

        /// Loop back while the quality score stays below this
        #[arg(long, default_value_t = DEFAULT_QUALITY_THRESHOLD)]
        quality_threshold: f64,

        #[arg(long, default_value_t = DEFAULT_REVIEW_ITERATIONS)]
        max_iterations: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so `stream` output stays machine-readable.
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run { args, output } => cmd_run(&args, output.as_deref()).await?,
        Commands::Stream { args } => cmd_stream(&args).await?,
        Commands::Validate { graph } => cmd_validate(&graph)?,
        Commands::Info { graph } => cmd_info(&graph)?,
        Commands::Review {
            source,
            complexity_threshold,
            quality_threshold,
            max_iterations,
        } => cmd_review(&source, complexity_threshold, quality_threshold, max_iterations).await?,
    }

    Ok(())
}

fn load_graph(path: &Path) -> anyhow::Result<GraphDefinition> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("reading graph definition {}", path.display()))?;
    let def = serde_json::from_str(&source)
        .with_context(|| format!("parsing graph definition {}", path.display()))?;
    Ok(def)
}

fn parse_state(raw: &str) -> anyhow::Result<RunState> {
    let value: Value = serde_json::from_str(raw).context("initial state is not valid JSON")?;
    Ok(RunState::try_from(value)?)
}

fn initial_state(args: &RunArgs) -> anyhow::Result<RunState> {
    match (&args.state, &args.state_file) {
        (Some(raw), _) => parse_state(raw),
        (None, Some(path)) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading state file {}", path.display()))?;
            parse_state(&raw)
        }
        (None, None) => Ok(RunState::new()),
    }
}

/// A manager holding `def` under a graph id, with the built-in capabilities.
async fn prepare(args: &RunArgs) -> anyhow::Result<(RunManager, String, RunState)> {
    let def = load_graph(&args.graph)?;
    let state = initial_state(args)?;
    let config = EngineConfig::default().with_max_iterations(args.max_iterations);
    let manager = RunManager::in_memory(default_registry()?, config);
    let def = manager.create_graph(def).await?;
    let graph_id = def
        .graph_id
        .ok_or_else(|| anyhow::anyhow!("graph store did not assign an id"))?;
    tracing::debug!(graph_id = %graph_id, path = %args.graph.display(), "Loaded graph");
    Ok((manager, graph_id, state))
}

async fn cmd_run(args: &RunArgs, output: Option<&Path>) -> anyhow::Result<()> {
    let (manager, graph_id, state) = prepare(args).await?;
    let record = manager.run_now(&graph_id, state).await?;

    print_summary(&record);

    if let Some(path) = output {
        std::fs::write(path, serde_json::to_string_pretty(&record)?)?;
        println!("Run record: {}", path.display());
    }

    if record.status == RunStatus::Failed {
        std::process::exit(1);
    }
    Ok(())
}

fn print_summary(record: &ExecutionResult) {
    println!("Run {} {}", record.run_id, record.status);
    if let Some(termination) = &record.termination {
        println!("Termination: {termination}");
    }
    if let Some(duration) = record.duration_seconds() {
        println!("Duration: {duration:.3}s");
    }

    println!("\nSteps:");
    for entry in &record.logs {
        let mark = match entry.status {
            LogStatus::Success => "ok",
            LogStatus::Error => "error",
            LogStatus::Pending => "pending",
        };
        println!("  {:<20} {:>8.2}ms  {}", entry.node_id, entry.duration_ms, mark);
        if let Some(err) = &entry.error {
            println!("    {err}");
        }
    }

    println!("\nFinal state:");
    match serde_json::to_string_pretty(record.current_state()) {
        Ok(json) => println!("{json}"),
        Err(err) => println!("  (unprintable: {err})"),
    }
}

async fn cmd_stream(args: &RunArgs) -> anyhow::Result<()> {
    let (manager, graph_id, state) = prepare(args).await?;
    let mut events = manager.stream_run(&graph_id, state).await?;

    let mut failed = false;
    while let Some(event) = events.next().await {
        if let flowgraph_engine::RunEvent::Completed { status, .. } = &event {
            failed = *status == RunStatus::Failed;
        }
        println!("{}", serde_json::to_string(&event)?);
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    let def = load_graph(path)?;
    let diagnostics = validate(&def);

    if diagnostics.is_empty() {
        println!("Graph is valid");
    }

    let mut has_error = false;
    for diag in &diagnostics {
        if diag.severity == Severity::Error {
            has_error = true;
        }
        match &diag.node_id {
            Some(node) => {
                println!("[{}] {} ({}): {}", diag.severity, diag.rule, node, diag.message)
            }
            None => println!("[{}] {}: {}", diag.severity, diag.rule, diag.message),
        }
        if let Some(fix) = &diag.fix {
            println!("    fix: {fix}");
        }
    }

    if has_error {
        std::process::exit(1);
    }

    if let Some(err) = unbound_capability(&def)? {
        println!("[warning] {err} (not a built-in capability)");
    }
    Ok(())
}

/// Capability bindings are only checked against a registry; a structurally
/// valid graph may still name a tool the built-ins do not provide.
fn unbound_capability(def: &GraphDefinition) -> anyhow::Result<Option<FlowError>> {
    let registry = default_registry()?;
    Ok(compile(def, &registry).err())
}

fn cmd_info(path: &Path) -> anyhow::Result<()> {
    let def = load_graph(path)?;

    println!("Graph: {}", def.name);
    if let Some(id) = &def.graph_id {
        println!("Id: {id}");
    }
    if let Some(description) = &def.description {
        println!("Description: {description}");
    }
    println!("Entry: {}", def.entry_node);
    println!("Nodes: {}", def.nodes.len());
    println!("Edges: {}", def.edges.len());

    println!("\nNodes:");
    for node in &def.nodes {
        let tool = node.tool_name.as_deref().unwrap_or("(passthrough)");
        println!("  {} [{}] tool={}", node.node_id, node.node_type, tool);
    }

    if !def.edges.is_empty() {
        println!("\nEdges:");
        for edge in &def.edges {
            match (edge.edge_type, &edge.condition) {
                (EdgeKind::Conditional, Some(cond)) => {
                    println!("  {} -> {} when {}", edge.from_node, edge.to_node, cond)
                }
                _ => println!("  {} -> {}", edge.from_node, edge.to_node),
            }
        }
    }

    if !def.loops.is_empty() {
        println!("\nLoops:");
        for spec in &def.loops {
            println!(
                "  {} while {} (max {})",
                spec.loop_node, spec.condition, spec.max_iterations
            );
        }
    }

    Ok(())
}

async fn cmd_review(
    source: &Path,
    complexity_threshold: u64,
    quality_threshold: f64,
    max_iterations: u32,
) -> anyhow::Result<()> {
    let code = std::fs::read_to_string(source)
        .with_context(|| format!("reading source file {}", source.display()))?;
    let def = code_review_graph(complexity_threshold, quality_threshold, max_iterations);
    let graph = compile(&def, &default_registry()?)?;

    let mut state = RunState::new();
    state.set("code", Value::String(code));
    let report = flowgraph_engine::run(&graph, state, flowgraph_engine::DEFAULT_MAX_ITERATIONS)
        .await
        .map_err(|failure| anyhow::anyhow!("review failed: {failure}"))?;

    let final_state = &report.final_state;
    println!("Reviewed {}", source.display());
    println!(
        "Functions: {}",
        final_state.get("function_count").cloned().unwrap_or(Value::Null)
    );
    if let Some(score) = final_state.get_f64("quality_score") {
        println!("Quality score: {score:.1} (threshold {quality_threshold:.1})");
    }
    if report.termination.is_truncated() {
        println!("Stopped: {}", report.termination);
    }

    if let Some(Value::Array(suggestions)) = final_state.get("suggestions") {
        if !suggestions.is_empty() {
            println!("\nSuggestions:");
        }
        for suggestion in suggestions {
            println!(
                "  [{}] {}",
                suggestion["priority"].as_str().unwrap_or("-"),
                suggestion["message"].as_str().unwrap_or("")
            );
            if let Some(Value::Array(details)) = suggestion.get("details") {
                for detail in details.iter().filter_map(Value::as_str) {
                    println!("      {detail}");
                }
            }
        }
    }

    if let Some(Value::Array(issues)) = final_state.get("issues") {
        if !issues.is_empty() {
            println!("\nIssues:");
        }
        for issue in issues {
            println!(
                "  line {:>4}  {:<18} {}",
                issue["line"],
                issue["type"].as_str().unwrap_or("-"),
                issue["message"].as_str().unwrap_or("")
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use flowgraph_engine::NodeSpec;
    use serde_json::json;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_object_state() {
        let state = parse_state(r#"{"counter": 5}"#).unwrap();
        assert_eq!(state.get("counter"), Some(&json!(5)));
    }

    #[test]
    fn rejects_non_object_state() {
        assert!(parse_state("[1, 2]").is_err());
        assert!(parse_state("not json").is_err());
    }

    #[test]
    fn clean_graph_with_unknown_tool_is_flagged() {
        let def = GraphDefinition::new("Teleport", "a")
            .with_node(NodeSpec::tool("a", "teleport"));
        assert!(validate(&def).is_empty());
        match unbound_capability(&def).unwrap() {
            Some(FlowError::UnknownCapability { node, capability }) => {
                assert_eq!(node, "a");
                assert_eq!(capability, "teleport");
            }
            other => panic!("expected unknown capability, got {other:?}"),
        }
    }

    #[test]
    fn built_in_tools_are_bound() {
        let def = GraphDefinition::new("Count", "a").with_node(NodeSpec::tool("a", "increment"));
        assert!(unbound_capability(&def).unwrap().is_none());
    }

    #[test]
    fn run_args_default_iteration_ceiling() {
        let cli = Cli::try_parse_from(["flowgraph", "run", "graph.json"]).unwrap();
        match cli.command {
            Commands::Run { args, output } => {
                assert!(output.is_none());
                assert!(args.state.is_none());
                if std::env::var("FLOWGRAPH_MAX_ITERATIONS").is_err() {
                    assert_eq!(args.max_iterations, 100);
                }
            }
            _ => panic!("expected run"),
        }
    }
}
