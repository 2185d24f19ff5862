mod aggregate;
mod classify;
mod config;
mod discover;
mod ingest;
mod report;
mod score;

use clap::Parser;
use config::Config;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A Rust CLI tool that parses coding-agent session logs, scores final
/// answers against per-task ground truth, and compares normalized
/// metrics across experimental conditions.
#[derive(Parser, Debug)]
#[command(name = "crucible", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "crucible.toml")]
    config: PathBuf,

    /// Results directory (overrides config)
    #[arg(short, long)]
    results_dir: Option<PathBuf>,

    /// Tasks file path (overrides config)
    #[arg(short, long)]
    tasks: Option<PathBuf>,

    /// Summary JSON output path (overrides config)
    #[arg(short, long)]
    summary: Option<PathBuf>,

    /// Baseline condition for the delta table (overrides config)
    #[arg(long)]
    baseline: Option<String>,

    /// Treatment condition for the delta table (overrides config)
    #[arg(long)]
    treatment: Option<String>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (per-file parse decisions)
    #[arg(short, long)]
    verbose: bool,

    /// Suppress report tables, only errors and the summary path
    #[arg(short, long)]
    quiet: bool,
}

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    if let Err(e) = run(cli) {
        tracing::error!(error = %e, "batch failed");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::load(&cli.config)?;
    if let Some(dir) = cli.results_dir {
        config.results_dir = dir;
    }
    if let Some(tasks) = cli.tasks {
        config.tasks_file = tasks;
    }
    if let Some(summary) = cli.summary {
        config.summary_file = summary;
    }
    if let Some(baseline) = cli.baseline {
        config.compare.baseline = baseline;
    }
    if let Some(treatment) = cli.treatment {
        config.compare.treatment = treatment;
    }

    if cli.dry_run {
        println!("crucible v{}", env!("CARGO_PKG_VERSION"));
        println!("Results dir: {}", config.results_dir.display());
        println!("Tasks file:  {}", config.tasks_file.display());
        println!("Summary:     {}", config.summary_file.display());
        println!(
            "Conditions:  {}",
            config
                .conditions
                .iter()
                .map(|c| format!("{} ({})", c.key, config.label_for(&c.key)))
                .collect::<Vec<_>>()
                .join(", ")
        );
        println!(
            "Compare:     {} vs {}",
            config.compare.baseline, config.compare.treatment
        );
        println!("Dry run mode — config validated, not running.");
        return Ok(());
    }

    let tasks = score::load_tasks(&config.tasks_file)?;
    tracing::info!(
        tasks = tasks.len(),
        results_dir = %config.results_dir.display(),
        "scoring batch"
    );

    let rules = config.manifest_rules();
    let discovered = discover::discover_runs(&config.results_dir, &config.condition_keys());
    if discovered.is_empty() {
        return Err(format!(
            "no result files found under {}",
            config.results_dir.display()
        )
        .into());
    }

    let mut batch = aggregate::Batch::new();
    let mut skipped = 0usize;
    for found in discovered {
        let task = match tasks.get(&found.task_id) {
            Some(t) => t,
            None => {
                tracing::warn!(
                    task = %found.task_id,
                    path = %found.path.display(),
                    "no task spec for run, skipping"
                );
                skipped += 1;
                continue;
            }
        };
        let metrics = match ingest::parse_file(&found.path, &rules) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %found.path.display(),
                    "unreadable result file, skipping"
                );
                skipped += 1;
                continue;
            }
        };
        tracing::debug!(
            condition = %found.condition,
            task = %found.task_id,
            run = %found.run,
            tools = metrics.tool_call_count,
            "parsed run"
        );
        let scored = score::ScoredRun::new(metrics, task, found.run);
        aggregate::insert_run(&mut batch, &found.condition, scored);
    }

    if batch.is_empty() {
        return Err("no scorable runs (every discovered file was skipped)".into());
    }
    if skipped > 0 {
        tracing::warn!(skipped, "some result files were skipped");
    }

    let labels: BTreeMap<String, String> = config
        .conditions
        .iter()
        .map(|c| (c.key.clone(), config.label_for(&c.key).to_string()))
        .collect();
    let summaries = aggregate::condition_summaries(&batch);
    let dispersion = aggregate::condition_dispersion(&batch);

    if !cli.quiet {
        print!("{}", report::render_summary_table(&summaries, &labels));
        print!("{}", report::render_dispersion_table(&dispersion, &labels));
        print!("{}", report::render_task_breakdown(&tasks, &batch));

        match (
            summaries.get(&config.compare.baseline),
            summaries.get(&config.compare.treatment),
        ) {
            (Some(base), Some(treat)) => {
                print!(
                    "{}",
                    report::render_delta_table(
                        &config.compare.baseline,
                        &config.compare.treatment,
                        base,
                        treat,
                        &labels,
                    )
                );
            }
            _ => tracing::info!(
                baseline = %config.compare.baseline,
                treatment = %config.compare.treatment,
                "missing results for a compare condition, skipping delta table"
            ),
        }
    }

    if let Some(parent) = config.summary_file.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    report::write_summary_json(&config.summary_file, &batch)?;
    println!();
    println!("Raw data: {}", config.summary_file.display());

    Ok(())
}
