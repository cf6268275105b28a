// 🗺️ geozones CLI - build the zones database stage by stage

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use geozones::levels::default_registry;
use geozones::{
    audit, feature_collection, Config, KnowledgeBase, LevelRegistry, OfflineKnowledgeBase, Pipeline,
    RunSettings, StageReport, WikidataClient, ZoneStore,
};
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "geozones", version)]
#[command(about = "Build a temporal database of administrative zones")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "GEOZONES_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database file
    #[arg(long, env = "GEOZONES_DATABASE")]
    database: Option<PathBuf>,

    /// Directory holding the downloaded datasets
    #[arg(long, env = "GEOZONES_WORKDIR")]
    workdir: Option<PathBuf>,

    /// Limit to these levels (repeatable, `*` wildcards allowed)
    #[arg(short, long = "level", env = "GEOZONES_LEVELS", value_delimiter = ',')]
    levels: Vec<String>,

    /// Leave out levels matching these patterns
    #[arg(short, long, env = "GEOZONES_EXCLUDE", value_delimiter = ',')]
    exclude: Vec<String>,

    /// Skip callbacks (or aggregates) matching these patterns
    #[arg(short, long, env = "GEOZONES_SKIP", value_delimiter = ',')]
    skip: Vec<String>,

    /// Reference date for "current" lookups (YYYY-MM-DD)
    #[arg(long, env = "GEOZONES_TODAY")]
    today: Option<NaiveDate>,

    #[arg(long, env = "GEOZONES_SPARQL_ENDPOINT")]
    sparql_endpoint: Option<String>,

    /// Ids per knowledge-base request
    #[arg(long, env = "GEOZONES_CHUNK_SIZE")]
    chunk_size: Option<usize>,

    #[arg(long, env = "GEOZONES_HTTP_RETRIES")]
    http_retries: Option<u32>,

    /// Skip knowledge-base lookups
    #[arg(long, env = "GEOZONES_OFFLINE")]
    offline: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Default)]
struct StageArgs {
    /// Only run the callback with this name
    #[arg(long)]
    only: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Load identities and validity from historical datasets
    Preprocess(StageArgs),
    /// Extract zones and geometries from geospatial datasets
    #[command(alias = "extract")]
    Load(StageArgs),
    /// Build composite zones from their members
    Aggregate(StageArgs),
    /// Enrich and roll up stored zones
    Postprocess(StageArgs),
    /// Run the four stages in order
    Full {
        /// Empty the database first
        #[arg(long)]
        drop: bool,
    },
    /// Describe the level hierarchy as JSON
    Levels,
    /// List the datasets expected in the working directory
    Sources,
    /// Count stored zones per level
    Status,
    /// Audit stored zones, failing on critical issues
    Audit,
    /// Print the zones as a feature collection
    Dump {
        /// Only keep these properties (add `geometry` to keep shapes)
        #[arg(long, value_delimiter = ',')]
        keys: Option<Vec<String>>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("geozones=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let registry = default_registry().context("Invalid level declarations")?;

    match &cli.command {
        Command::Levels => print_json(&registry.describe()),
        Command::Sources => {
            for (url, target) in registry.downloads() {
                println!("{} -> {}", url, config.workdir.join(target).display());
            }
            Ok(())
        }
        command => run_with_store(command, &config, &registry),
    }
}

/// Defaults, then the config file, then CLI/env overrides
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load_or_default(cli.config.as_deref())?;

    if let Some(database) = &cli.database {
        config.database = database.clone();
    }
    if let Some(workdir) = &cli.workdir {
        config.workdir = workdir.clone();
    }
    if !cli.levels.is_empty() {
        config.levels = cli.levels.clone();
    }
    config.exclude.extend(cli.exclude.iter().cloned());
    config.skip.extend(cli.skip.iter().cloned());
    if cli.today.is_some() {
        config.today = cli.today;
    }
    if let Some(endpoint) = &cli.sparql_endpoint {
        config.sparql_endpoint = endpoint.clone();
    }
    if let Some(chunk_size) = cli.chunk_size {
        config.chunk_size = chunk_size;
    }
    if let Some(retries) = cli.http_retries {
        config.http_retries = retries;
    }
    config.offline |= cli.offline;

    Ok(config)
}

fn run_with_store(command: &Command, config: &Config, registry: &LevelRegistry) -> Result<()> {
    let store = ZoneStore::open(&config.database)
        .with_context(|| format!("Failed to open {}", config.database.display()))?;
    info!("📂 Using database {}", config.database.display());

    let selection = config.level_selection();
    let selected: Vec<String> = registry
        .traverse()
        .into_iter()
        .map(|level| level.id.clone())
        .filter(|id| selection.allows(id))
        .collect();

    match command {
        Command::Status => {
            for level in &selected {
                println!("{:<20} {:>8}", level, store.count_level(level)?);
            }
            println!("{:<20} {:>8}", "total", store.count()?);
            Ok(())
        }
        Command::Audit => {
            let report = audit(&store, &selected)?;
            print_json(&report)?;
            if report.has_critical_issues() {
                anyhow::bail!("{}", report.summary());
            }
            Ok(())
        }
        Command::Dump { keys } => {
            let zones = store.zones_for_levels(&selected)?;
            print_json(&feature_collection(&zones, keys.as_deref()))
        }
        stage => {
            let knowledge_base = knowledge_base(config)?;
            let pipeline = Pipeline::new(
                registry,
                &store,
                knowledge_base.as_ref(),
                RunSettings {
                    workdir: config.workdir.clone(),
                    today: config.reference_date(),
                    chunk_size: config.chunk_size,
                    levels: config.level_selection(),
                },
            );
            let reports = run_stage(stage, &pipeline, &store, config)?;
            print_reports(&reports);
            Ok(())
        }
    }
}

fn run_stage(
    command: &Command,
    pipeline: &Pipeline<'_>,
    store: &ZoneStore,
    config: &Config,
) -> Result<Vec<StageReport>> {
    let filter = |args: &StageArgs| config.stage_filter(args.only.as_deref());

    let reports = match command {
        Command::Preprocess(args) => vec![pipeline.preprocess(&filter(args))?],
        Command::Load(args) => vec![pipeline.extract(&filter(args))?],
        Command::Aggregate(args) => vec![pipeline.aggregate(&filter(args))?],
        Command::Postprocess(args) => vec![pipeline.postprocess(&filter(args))?],
        Command::Full { drop } => {
            if *drop {
                let dropped = store.drop_all()?;
                info!("🗑️  Dropped {} zone(s)", dropped);
            }
            pipeline.run(&filter(&StageArgs::default()))?
        }
        _ => Vec::new(),
    };
    Ok(reports)
}

fn knowledge_base(config: &Config) -> Result<Box<dyn KnowledgeBase>> {
    if config.offline {
        info!("Offline mode, knowledge-base lookups disabled");
        return Ok(Box::new(OfflineKnowledgeBase));
    }
    let client = WikidataClient::new(&config.sparql_endpoint, config.retry_policy())?;
    Ok(Box::new(client))
}

fn print_reports(reports: &[StageReport]) {
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for report in reports {
        let marker = if report.failed > 0 { "⚠️ " } else { "✅" };
        println!(
            "{} {:<12} processed: {:>6}  skipped: {:>4}  failed: {:>4}",
            marker,
            report.stage.to_string(),
            report.processed, report.skipped, report.failed
        );
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    serde_json::to_writer_pretty(&mut out, value)?;
    writeln!(out)?;
    Ok(())
}
