use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use strategy_workbench::assistant::{
    extract_action, extract_code_blocks, AssistantApi, OpenRouterAssistant, TurnContext,
};
use strategy_workbench::backtest::HttpBacktestApi;
use strategy_workbench::config::Config;
use strategy_workbench::gateway::{
    EditGateway, EditValidator, HttpValidator, LocalValidator, Preview,
};
use strategy_workbench::patch::{
    build_patch, locate_enclosing, locate_function, locate_param, locate_selection, InsertAnchor,
    PatchPlan, PatchTarget,
};
use strategy_workbench::refine::{
    RefinementTracker, RunRequest, TrackerEvent, TrackerOptions,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "workbench",
    about = "Patch strategy files safely and track backtest refinement runs",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the region a target resolves to
    Locate(LocateArgs),
    /// Preview (or apply) a snippet as a validated edit
    Patch(PatchArgs),
    /// Submit backtests and track them to completion
    Run(RunArgs),
    /// Ask the assistant one question about a strategy
    Ask(AskArgs),
    /// Store the OpenRouter API key in the system keychain
    Setup,
}

#[derive(Args, Debug)]
struct TargetArgs {
    /// Enclosing function of this 1-indexed line
    #[arg(long, group = "target")]
    line: Option<usize>,
    /// File whose content is the exact selected text
    #[arg(long, group = "target")]
    selection_file: Option<PathBuf>,
    /// Function by name
    #[arg(long, group = "target")]
    name: Option<String>,
    /// Hyperopt parameter assignment by name
    #[arg(long, group = "target")]
    param: Option<String>,
}

#[derive(Args, Debug)]
struct LocateArgs {
    /// Strategy file
    file: PathBuf,
    #[command(flatten)]
    target: TargetArgs,
}

#[derive(Args, Debug)]
struct PatchArgs {
    /// Strategy file, relative to the strategies directory
    file: PathBuf,
    /// Snippet file, or `-` for stdin. Fenced replies use their first code block.
    #[arg(long, default_value = "-")]
    snippet: String,
    #[command(flatten)]
    target: TargetArgs,
    /// Insert instead of replace: module-end, indicators, after-imports,
    /// class-end, or after:<function>
    #[arg(long, group = "target")]
    insert: Option<String>,
    /// Strategies directory (defaults to the configured one)
    #[arg(long)]
    root: Option<PathBuf>,
    /// Commit the edit after previewing it
    #[arg(long)]
    apply: bool,
    /// Proceed past a name-mismatch warning
    #[arg(long)]
    force: bool,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Strategy name
    strategy: String,
    /// Backtest config files (TOML or JSON). More than one makes a batch.
    #[arg(long = "config", required = true)]
    configs: Vec<PathBuf>,
    /// Skip the assistant summary when the run finishes
    #[arg(long)]
    no_narrate: bool,
}

#[derive(Args, Debug)]
struct AskArgs {
    prompt: String,
    /// Strategy file to include as context
    #[arg(long)]
    file: Option<PathBuf>,
    /// Run a backtest if the reply proposes one
    #[arg(long)]
    run: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("WORKBENCH_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = Config::load();

    match cli.command {
        Commands::Locate(args) => locate(args),
        Commands::Patch(args) => patch(args, &config).await,
        Commands::Run(args) => run(args, &config).await,
        Commands::Ask(args) => ask(args, &config).await,
        Commands::Setup => setup(&config),
    }
}

fn read_to_string(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn locate(args: LocateArgs) -> Result<()> {
    let file = read_to_string(&args.file)?;
    let target = &args.target;
    let region = if let Some(line) = target.line {
        locate_enclosing(&file, line)?
    } else if let Some(path) = &target.selection_file {
        locate_selection(&file, &read_to_string(path)?)?
    } else if let Some(name) = &target.name {
        locate_function(&file, name)?
    } else if let Some(name) = &target.param {
        locate_param(&file, name)?
    } else {
        bail!("Pass one of --line, --selection-file, --name or --param");
    };
    println!("{}", serde_json::to_string_pretty(&region)?);
    Ok(())
}

fn parse_anchor(raw: &str) -> Result<InsertAnchor> {
    Ok(match raw {
        "module-end" => InsertAnchor::ModuleEnd,
        "indicators" => InsertAnchor::HeuristicIndicators,
        "after-imports" => InsertAnchor::AfterImports,
        "class-end" => InsertAnchor::ClassEnd { name: None },
        other => match other.strip_prefix("after:") {
            Some(name) if !name.is_empty() => InsertAnchor::AfterFunction {
                name: name.to_string(),
            },
            _ => bail!("Unknown insert anchor: {}", raw),
        },
    })
}

fn read_snippet(source: &str) -> Result<String> {
    let raw = if source == "-" {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        read_to_string(Path::new(source))?
    };
    Ok(extract_code_blocks(&raw)
        .into_iter()
        .next()
        .map(|block| block.code)
        .unwrap_or(raw))
}

fn print_preview(preview: &Preview) {
    if preview.is_noop() {
        println!("No changes.");
        return;
    }
    println!("{}", preview.diff);
    println!("\n+{} -{}", preview.additions, preview.removals);
}

async fn patch(args: PatchArgs, config: &Config) -> Result<()> {
    let root = args.root.clone().unwrap_or_else(|| config.strategies_dir.clone());
    let file = read_to_string(&root.join(&args.file))?;
    let snippet = read_snippet(&args.snippet)?;

    let target = if let Some(raw) = &args.insert {
        PatchTarget::Insert(parse_anchor(raw)?)
    } else if let Some(line) = args.target.line {
        PatchTarget::Enclosing { line }
    } else if let Some(path) = &args.target.selection_file {
        PatchTarget::Selection(read_to_string(path)?)
    } else if let Some(name) = &args.target.param {
        PatchTarget::Param(name.clone())
    } else {
        PatchTarget::Named(args.target.name.clone())
    };

    let plan = build_patch(&file, target, &snippet)?;
    if let Some(warning) = &plan.warning {
        eprintln!("warning: {}", warning);
    }

    let path = args.file.to_string_lossy().to_string();
    match &config.validator_url {
        Some(url) => run_gateway(EditGateway::new(HttpValidator::new(url)?), &path, &plan, &args).await,
        None => run_gateway(EditGateway::new(LocalValidator::new(root)), &path, &plan, &args).await,
    }
}

async fn run_gateway<V: EditValidator>(
    gateway: EditGateway<V>,
    path: &str,
    plan: &PatchPlan,
    args: &PatchArgs,
) -> Result<()> {
    let preview = gateway.preview(path, &plan.edit).await?;
    print_preview(&preview);

    if !args.apply {
        return Ok(());
    }
    if plan.needs_confirmation() && !args.force {
        bail!("Not applied: confirm the name mismatch with --force");
    }
    gateway.commit(path, &plan.edit).await?;
    println!("Applied {}.", plan.edit.label());
    Ok(())
}

fn load_run_config(path: &Path) -> Result<serde_json::Value> {
    let content = read_to_string(path)?;
    let is_toml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("toml"));
    if is_toml {
        toml::from_str(&content).with_context(|| format!("Invalid TOML in {}", path.display()))
    } else {
        serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {}", path.display()))
    }
}

fn print_event(event: &TrackerEvent) {
    match event {
        TrackerEvent::Started { run_id, ids } => {
            let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
            println!("Run {} started: jobs {}", run_id, ids.join(", "));
        }
        TrackerEvent::SubmitFailed { error } => println!("Submission failed: {}", error),
        TrackerEvent::Log { id, line } => println!("[{}] {}", id, line),
        TrackerEvent::JobCompleted(summary) => println!(
            "Job {} completed: profit {:?}, win rate {:?}, drawdown {:?}, trades {:?}",
            summary.id, summary.profit_total, summary.win_rate, summary.max_drawdown, summary.total_trades
        ),
        TrackerEvent::JobFailed { id, error } => println!(
            "Job {} failed{}",
            id,
            error.as_deref().map(|e| format!(": {}", e)).unwrap_or_default()
        ),
        TrackerEvent::Finished { stage } => println!("Run {}.", stage),
        TrackerEvent::Narration { reply } => println!("\n{}", reply),
        TrackerEvent::NarrationFailed { error } => println!("Narration failed: {}", error),
    }
}

async fn track(request: RunRequest, config: &Config, narrate: bool) -> Result<()> {
    let api = HttpBacktestApi::new(config.backtest_base()?);
    let options = TrackerOptions {
        auto_narrate: narrate && config.auto_narrate,
        ..TrackerOptions::from_config(config)
    };
    let (mut tracker, events) =
        RefinementTracker::new(api, OpenRouterAssistant::from_config(config), options);

    // Senders close once the tracker and its poll task are gone.
    let state = tracker.subscribe();
    let printer = std::thread::spawn(move || {
        for event in events {
            print_event(&event);
            if matches!(event, TrackerEvent::JobCompleted(_) | TrackerEvent::JobFailed { .. }) {
                let eta = state.borrow().estimate_remaining(chrono::Utc::now());
                if let Some(eta) = eta.filter(|d| !d.is_zero()) {
                    println!("Estimated time remaining: {}s", eta.as_secs());
                }
            }
        }
    });

    let started = tracker.start(request).await;
    if started.is_ok() {
        tracker.join().await;
    }
    drop(tracker);
    if printer.join().is_err() {
        eprintln!("event printer crashed");
    }
    started.map(|_| ())
}

async fn run(args: RunArgs, config: &Config) -> Result<()> {
    let configs = args
        .configs
        .iter()
        .map(|p| load_run_config(p))
        .collect::<Result<Vec<_>>>()?;
    let request = if configs.len() == 1 {
        RunRequest::single(args.strategy, configs.into_iter().next().unwrap_or_default())
    } else {
        RunRequest::batch(args.strategy, configs)
    };
    track(request, config, !args.no_narrate).await
}

async fn ask(args: AskArgs, config: &Config) -> Result<()> {
    let assistant = OpenRouterAssistant::from_config(config);
    let context = match &args.file {
        Some(path) => TurnContext {
            file_name: path.file_name().map(|n| n.to_string_lossy().to_string()),
            file: Some(read_to_string(path)?),
            ..TurnContext::default()
        },
        None => TurnContext::default(),
    };

    let reply = assistant.turn(&args.prompt, &context).await?;
    println!("{}", reply);

    match extract_action(&reply) {
        Ok(Some(request)) if args.run => track(request, config, true).await?,
        Ok(Some(request)) => println!(
            "\nProposed {} backtest(s) of {}. Re-run with --run to start them.",
            request.configs.len(),
            request.strategy
        ),
        Ok(None) => {}
        Err(err) => eprintln!("warning: {}", err),
    }
    Ok(())
}

fn setup(config: &Config) -> Result<()> {
    print!("OpenRouter API key: ");
    io::stdout().flush()?;
    let mut key = String::new();
    io::stdin().read_line(&mut key)?;
    let key = key.trim();
    if key.is_empty() {
        bail!("No key entered");
    }
    config.set_api_key(key).map_err(|e| anyhow!(e))?;
    println!("Saved. Config lives at {}", Config::config_location());
    Ok(())
}
