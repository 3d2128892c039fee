use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::{
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};
use tracing_subscriber::EnvFilter;

use journey_bundle::{
    DeleteOptions, EngineConfig, ExportOptions, ImportOptions, JourneyEngine, MemoryStore,
    ObjectError, Outcome, ScriptEncoding, SkipReason, parse_document,
};

#[derive(Parser, Debug)]
#[command(name = "journey-bundle", version, about = "Export, import and delete journeys with their dependencies")]
struct Cli {
    /// Environment snapshot the commands operate on.
    #[arg(long = "env", global = true, default_value = "environment.json")]
    env: PathBuf,
    /// Engine settings (JSON, or TOML with the `toml` feature).
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,
    /// Override the configured request concurrency.
    #[arg(long = "concurrency", global = true)]
    concurrency: Option<usize>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Export one journey, or all of them, with their dependencies.
    Export(ExportArgs),
    /// Import journeys from an export document.
    Import(ImportArgs),
    /// Delete one journey, or all of them.
    Delete(DeleteArgs),
    /// List (or remove) steps that no journey references.
    Orphans(OrphansArgs),
    /// Enable a journey.
    Enable(FlowArg),
    /// Disable a journey.
    Disable(FlowArg),
}

#[derive(Args, Debug)]
struct ExportArgs {
    /// Journey id; omit with --all.
    #[arg(required_unless_present = "all")]
    flow: Option<String>,
    #[arg(long, conflicts_with = "flow")]
    all: bool,
    /// Write to this file instead of stdout.
    #[arg(long = "out")]
    out: Option<PathBuf>,
    /// Export only the journey and its steps.
    #[arg(long = "no-deps")]
    no_deps: bool,
    /// Drop step coordinates.
    #[arg(long = "no-coords")]
    no_coords: bool,
    #[arg(long = "script-encoding", value_enum)]
    script_encoding: Option<EncodingArg>,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum EncodingArg {
    Blob,
    Lines,
}

impl From<EncodingArg> for ScriptEncoding {
    fn from(value: EncodingArg) -> Self {
        match value {
            EncodingArg::Blob => ScriptEncoding::Blob,
            EncodingArg::Lines => ScriptEncoding::Lines,
        }
    }
}

#[derive(Args, Debug)]
struct ImportArgs {
    /// Export document (single or multi-journey).
    file: PathBuf,
    /// Import only the journeys and their steps.
    #[arg(long = "no-deps")]
    no_deps: bool,
    /// Give every step a fresh id.
    #[arg(long = "re-uuid")]
    re_uuid: bool,
}

#[derive(Args, Debug)]
struct DeleteArgs {
    #[arg(required_unless_present = "all")]
    flow: Option<String>,
    #[arg(long, conflicts_with = "flow")]
    all: bool,
    /// Also delete dependencies no other journey uses.
    #[arg(long)]
    deep: bool,
}

#[derive(Args, Debug)]
struct OrphansArgs {
    #[arg(long)]
    remove: bool,
}

#[derive(Args, Debug)]
struct FlowArg {
    flow: String,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}

/// Ok(true) on full success, Ok(false) when some objects failed.
fn run(cli: Cli) -> Result<bool> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load_from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(concurrency) = cli.concurrency {
        anyhow::ensure!(concurrency > 0, "--concurrency must be at least 1");
        config.concurrency = concurrency;
    }

    let Cli { env, command, .. } = cli;
    let store = Arc::new(MemoryStore::load(&env)?);
    let engine = JourneyEngine::new(store.clone(), config);
    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;

    rt.block_on(async move {
        let complete = match command {
            Commands::Export(args) => return handle_export(&engine, args).await,
            Commands::Import(args) => handle_import(&engine, args).await?,
            Commands::Delete(args) => handle_delete(&engine, args).await?,
            Commands::Orphans(args) => {
                let complete = handle_orphans(&engine, &args).await;
                if !args.remove {
                    return Ok(complete);
                }
                complete
            }
            Commands::Enable(args) => handle_enabled(&engine, &args.flow, true).await?,
            Commands::Disable(args) => handle_enabled(&engine, &args.flow, false).await?,
        };
        store.save(&env).await?;
        Ok(complete)
    })
}

async fn handle_export(engine: &JourneyEngine, args: ExportArgs) -> Result<bool> {
    let options = ExportOptions {
        deps: !args.no_deps,
        coords: !args.no_coords,
        script_encoding: args
            .script_encoding
            .map(ScriptEncoding::from)
            .unwrap_or(engine.config().script_encoding),
    };
    let (text, errors) = match &args.flow {
        Some(flow) if !args.all => {
            let exported = engine.export_flow(flow, &options).await?;
            (exported.value.to_json_pretty()?, exported.errors)
        }
        _ => {
            let exported = engine.export_flows(&options).await;
            let text = serde_json::to_string_pretty(&exported.value).context("serialize export")?;
            (text, exported.errors)
        }
    };
    write_output(args.out.as_deref(), &text)?;
    Ok(report_errors(&errors))
}

async fn handle_import(engine: &JourneyEngine, args: ImportArgs) -> Result<bool> {
    let text = fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let bundles = parse_document(&text, &args.file.display().to_string())?;
    let options = ImportOptions {
        deps: !args.no_deps,
        re_uuid: args.re_uuid,
    };
    let Outcome { value, errors } = engine.import_flows(&bundles, &options).await?;
    for summary in &value {
        println!(
            "{}: wrote {} object(s), {} created, {} updated",
            summary.flow_id,
            summary.total_written(),
            summary.created.values().sum::<usize>(),
            summary.updated.values().sum::<usize>(),
        );
        if let Some(remap) = &summary.remap {
            println!("  regenerated {} step id(s)", remap.len());
        }
        if let Some(incomplete) = &summary.incomplete_flow {
            println!(
                "  journey record not written after {} step(s): {}",
                incomplete.steps_written, incomplete.error
            );
        }
    }
    Ok(report_errors(&errors))
}

async fn handle_delete(engine: &JourneyEngine, args: DeleteArgs) -> Result<bool> {
    let options = DeleteOptions { deep: args.deep };
    let Outcome { value, errors } = match &args.flow {
        Some(flow) if !args.all => engine.delete_flow(flow, &options).await?.map(|s| vec![s]),
        _ => engine.delete_flows(&options).await,
    };
    for summary in &value {
        println!(
            "{}: deleted {} object(s), skipped {}",
            summary.flow_id,
            summary.deleted.len(),
            summary.skipped.len()
        );
        for skipped in &summary.skipped {
            match &skipped.reason {
                SkipReason::Shared { flows } => {
                    println!("  skipped: shared {} (used by {})", skipped.target, flows.join(", "))
                }
                SkipReason::CensusIncomplete => {
                    println!("  skipped: {} (reference census incomplete)", skipped.target)
                }
            }
        }
    }
    Ok(report_errors(&errors))
}

async fn handle_orphans(engine: &JourneyEngine, args: &OrphansArgs) -> bool {
    let Outcome { value, errors } = if args.remove {
        engine.remove_orphaned_steps().await
    } else {
        engine.find_orphaned_steps().await
    };
    let verb = if args.remove { "removed" } else { "orphaned" };
    for target in &value {
        println!("{verb} {target}");
    }
    println!("{} step(s) {verb}", value.len());
    report_errors(&errors)
}

async fn handle_enabled(engine: &JourneyEngine, flow: &str, enabled: bool) -> Result<bool> {
    let outcome = engine.set_flow_enabled(flow, enabled).await?;
    if outcome.is_complete() {
        println!(
            "{flow} {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }
    Ok(report_errors(&outcome.errors))
}

fn write_output(out: Option<&Path>, text: &str) -> Result<()> {
    match out {
        Some(path) => fs::write(path, format!("{text}\n"))
            .with_context(|| format!("failed to write {}", path.display())),
        None => {
            println!("{text}");
            Ok(())
        }
    }
}

/// Print per-object failures; true when there were none.
fn report_errors(errors: &[ObjectError]) -> bool {
    if errors.is_empty() {
        return true;
    }
    eprintln!("{} object operation(s) failed:", errors.len());
    for err in errors {
        eprintln!("  {err}");
    }
    false
}
