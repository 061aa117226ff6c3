//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use treeward_core::{
    BridgeAgents, LineEmitter, Orchestrator, ProgressEvent, ProgressEventType, ProgressSink,
    RunOptions, RunOutcome, RunStatus, TokenUsage,
};
use treeward_graph::{EmbeddingService, TechniqueGraphStore, get_or_build};
use treeward_mapping::TechniqueMatcher;
use treeward_shared::{AppConfig, init_config, load_config, validate_embeddings};
use treeward_state::{DEFAULT_CHECKPOINT, StateManager};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Treeward: attack trees mapped to adversary techniques.
#[derive(Parser)]
#[command(
    name = "treeward",
    version,
    about = "Threat-model a project and map its attack trees to adversary techniques.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the threat-modeling workflow over a project.
    Run {
        /// Project directory to analyze.
        project: PathBuf,

        /// Continue from the latest checkpoint.
        #[arg(long)]
        resume: bool,

        /// Existing threat model to extract threats from.
        #[arg(long)]
        threat_model: Option<PathBuf>,

        /// Output directory (defaults to <project>/treeward/attack_trees).
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Skip technique mapping.
        #[arg(long)]
        no_mapping: bool,

        /// Emit `PROGRESS:` JSON lines on stdout instead of a spinner.
        #[arg(long)]
        progress_lines: bool,
    },

    /// Technique graph cache.
    Graph {
        #[command(subcommand)]
        action: GraphAction,
    },

    /// Match free-text attack steps against the technique graph.
    Match {
        /// Attack step descriptions.
        #[arg(required = true)]
        steps: Vec<String>,

        /// Candidates per step (defaults to matching.top_k).
        #[arg(long)]
        top_k: Option<usize>,

        /// Print matches as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Workflow checkpoints.
    State {
        #[command(subcommand)]
        action: StateAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Graph subcommands.
#[derive(Subcommand)]
pub(crate) enum GraphAction {
    /// Build the graph from the bundle, or reuse a fresh cached one.
    Build {
        /// Rebuild even if the cached graph is fresh.
        #[arg(long)]
        force: bool,
    },
    /// Show where the graph lives and whether it is stale.
    Status,
}

/// State subcommands.
#[derive(Subcommand)]
pub(crate) enum StateAction {
    /// List checkpoints.
    List,
    /// Print a checkpoint as JSON.
    Show {
        #[arg(default_value = DEFAULT_CHECKPOINT)]
        name: String,
    },
    /// Copy a checkpoint into the archive.
    Archive {
        #[arg(default_value = DEFAULT_CHECKPOINT)]
        name: String,
    },
    /// Remove old and completed checkpoints.
    Cleanup {
        /// Remove checkpoints untouched for this many days.
        #[arg(long, default_value = "7")]
        days: u64,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags. Logs go to stderr so stdout stays
/// free for progress lines and command output.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "treeward=info",
        1 => "treeward=debug",
        _ => "treeward=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run {
            project,
            resume,
            threat_model,
            out,
            no_mapping,
            progress_lines,
        } => cmd_run(project, resume, threat_model, out, no_mapping, progress_lines),
        Command::Graph { action } => match action {
            GraphAction::Build { force } => cmd_graph_build(force),
            GraphAction::Status => cmd_graph_status(),
        },
        Command::Match { steps, top_k, json } => cmd_match(&steps, top_k, json),
        Command::State { action } => match action {
            StateAction::List => cmd_state_list(),
            StateAction::Show { name } => cmd_state_show(&name),
            StateAction::Archive { name } => cmd_state_archive(&name),
            StateAction::Cleanup { days } => cmd_state_cleanup(days),
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(),
        },
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

fn cmd_run(
    project: PathBuf,
    resume: bool,
    threat_model: Option<PathBuf>,
    out: Option<PathBuf>,
    no_mapping: bool,
    progress_lines: bool,
) -> Result<()> {
    let config = load_config()?;
    let mapping = mapping_enabled(&config, no_mapping)?;

    let mut options = RunOptions::new(project, config.agents.model.clone());
    options.resume = resume;
    options.threat_model_path = threat_model;
    options.output_dir = out;

    info!(
        project = %options.project_path.display(),
        resume,
        mapping,
        "starting threat-modeling run"
    );

    let agents = BridgeAgents::new(config.agents.clone());
    let mut orchestrator = Orchestrator::from_config(&config, options, agents)?;
    if no_mapping {
        orchestrator = orchestrator.without_mapping();
    }

    let spinner = if progress_lines || config.progress.enabled {
        orchestrator = orchestrator.with_progress(Box::new(LineEmitter::stdout()));
        None
    } else {
        let progress = CliProgress::new();
        let spinner = progress.spinner.clone();
        orchestrator = orchestrator.with_progress(Box::new(progress));
        Some(spinner)
    };

    let outcome = orchestrator.execute_workflow();
    if let Some(spinner) = spinner {
        spinner.finish_and_clear();
    }
    let outcome = outcome?;

    let usage = orchestrator.agents().usage();
    info!(
        calls = usage.calls,
        tokens_in = usage.tokens_in,
        tokens_out = usage.tokens_out,
        "agent token usage"
    );

    if progress_lines {
        println!("{}", serde_json::to_string(&outcome)?);
    } else {
        print_outcome(&outcome, &usage);
    }

    match outcome.status {
        RunStatus::Success => Ok(()),
        RunStatus::Failed => Err(eyre!(
            "workflow failed at stage {}; rerun with --resume to continue",
            outcome.stage
        )),
    }
}

/// Whether the technique mapping stage will run. Embedding settings are only
/// checked when it does.
fn mapping_enabled(config: &AppConfig, no_mapping: bool) -> Result<bool> {
    if no_mapping || !config.matching.enabled {
        return Ok(false);
    }
    validate_embeddings(&config.embeddings)?;
    Ok(true)
}

fn usage_line(usage: &TokenUsage) -> Option<String> {
    if usage.calls == 0 {
        return None;
    }
    Some(format!(
        "{} calls, {} tokens in, {} tokens out",
        usage.calls, usage.tokens_in, usage.tokens_out
    ))
}

fn print_outcome(outcome: &RunOutcome, usage: &TokenUsage) {
    println!();
    match outcome.status {
        RunStatus::Success => println!("  Threat model complete!"),
        RunStatus::Failed => println!("  Threat model stopped at {}", outcome.stage),
    }
    println!("  Run:         {}", outcome.run_id);
    println!("  Application: {}", outcome.application_name);
    println!("  Output:      {}", outcome.output_dir.display());
    if let Some(mapping) = &outcome.mapping {
        println!(
            "  Mappings:    {}/{} at >= {:.2} ({})",
            mapping.successful_mappings,
            mapping.total_mappings,
            mapping.threshold_used,
            mapping.model
        );
    }
    if let Some(line) = usage_line(usage) {
        println!("  Tokens:      {line}");
    }
    for file in &outcome.output_files {
        println!("    {}", file.display());
    }
    for error in &outcome.errors {
        println!("  Error:       {error}");
    }
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress sink
// ---------------------------------------------------------------------------

/// Progress sink using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} [{prefix:>3}%] {msg}") {
            spinner.set_style(
                style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
            );
        }
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressSink for CliProgress {
    fn emit(&self, event: &ProgressEvent) {
        self.spinner.set_prefix(format!("{:.0}", event.percentage));
        match event.kind {
            ProgressEventType::Error | ProgressEventType::Warning => {
                self.spinner.println(format!("  {}: {}", event.stage, event.message));
            }
            _ => self.spinner.set_message(event.message.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Technique graph
// ---------------------------------------------------------------------------

fn cmd_graph_build(force: bool) -> Result<()> {
    let config = load_config()?;
    validate_embeddings(&config.embeddings)?;

    let store = TechniqueGraphStore::for_model(&config.paths, &config.embeddings.model);
    let mut embeddings = EmbeddingService::new(config.embeddings.clone());

    let spinner = CliProgress::new();
    spinner.spinner.set_message("Building technique graph");
    let graph = get_or_build(&store, &config.paths.bundle(), &mut embeddings, force);
    spinner.spinner.finish_and_clear();
    let graph = graph?;

    println!();
    println!("  Technique graph ready");
    println!("  Techniques: {}", graph.techniques.len());
    println!("  Model:      {} ({}d)", graph.embedding_model, graph.embedding_dim);
    println!("  Source:     ATT&CK {}", graph.source_version);
    println!("  Path:       {}", store.path().display());
    println!();
    Ok(())
}

fn cmd_graph_status() -> Result<()> {
    let config = load_config()?;
    let store = TechniqueGraphStore::for_model(&config.paths, &config.embeddings.model);
    let bundle = config.paths.bundle();

    println!("  Graph:  {}", store.path().display());
    println!("  Bundle: {}", bundle.display());
    if !store.exists() {
        println!("  Status: missing (run `treeward graph build`)");
        return Ok(());
    }

    let stale = store.is_stale(
        &bundle,
        &config.embeddings.model,
        config.embeddings.dimension,
    );
    let graph = store.load()?;
    println!("  Status: {}", if stale { "stale" } else { "fresh" });
    println!("  Techniques: {}", graph.techniques.len());
    println!("  Model:      {} ({}d)", graph.embedding_model, graph.embedding_dim);
    println!("  Created:    {}", graph.created_at.to_rfc3339());
    Ok(())
}

fn cmd_match(steps: &[String], top_k: Option<usize>, json: bool) -> Result<()> {
    let config = load_config()?;
    validate_embeddings(&config.embeddings)?;

    let top_k = top_k.unwrap_or(config.matching.top_k);
    let mut matcher = TechniqueMatcher::new(&config);
    let results = matcher.match_steps(steps, top_k)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }

    let stats = matcher.statistics()?;
    println!(
        "  {} techniques, {} ({}d), min similarity {:.2}",
        stats.num_techniques,
        stats.model,
        stats.embedding_dim,
        matcher.min_similarity()
    );
    for step in steps {
        println!();
        println!("  {step}");
        match results.iter().find(|r| &r.step == step) {
            Some(found) => {
                for m in &found.matches {
                    println!(
                        "    {:<10} {:.3} {:<6} {}",
                        m.technique_id, m.similarity, m.confidence, m.name
                    );
                }
            }
            None => println!("    (no match)"),
        }
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

fn state_manager(config: &AppConfig) -> Result<StateManager> {
    Ok(StateManager::new(config.paths.state_dir())?)
}

fn cmd_state_list() -> Result<()> {
    let config = load_config()?;
    let states = state_manager(&config)?;
    let names = states.list_checkpoints()?;
    if names.is_empty() {
        println!("No checkpoints in {}", states.state_dir().display());
        return Ok(());
    }

    for name in names {
        match states.load_checkpoint(&name) {
            Ok(Some(state)) => println!(
                "  {name:<20} {:<18} {}  {}",
                state.current_stage,
                state.last_updated.format("%Y-%m-%d %H:%M"),
                state.project_path.display()
            ),
            Ok(None) => {}
            Err(e) => println!("  {name:<20} unreadable ({e})"),
        }
    }
    Ok(())
}

fn cmd_state_show(name: &str) -> Result<()> {
    let config = load_config()?;
    let states = state_manager(&config)?;
    let state = states
        .load_checkpoint(name)?
        .ok_or_else(|| eyre!("no checkpoint named '{name}'"))?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    if let Err(reason) = state.resume_check() {
        eprintln!("note: not resumable: {reason}");
    }
    Ok(())
}

fn cmd_state_archive(name: &str) -> Result<()> {
    let config = load_config()?;
    let states = state_manager(&config)?;
    match states.archive_checkpoint(name)? {
        Some(path) => println!("Archived to: {}", path.display()),
        None => println!("No checkpoint named '{name}'"),
    }
    Ok(())
}

fn cmd_state_cleanup(days: u64) -> Result<()> {
    let config = load_config()?;
    let states = state_manager(&config)?;
    let old = states.cleanup_old_checkpoints(days)?;
    let completed = states.cleanup_completed_states()?;
    println!("Removed {old} checkpoints older than {days} days and {completed} completed ones");
    Ok(())
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
