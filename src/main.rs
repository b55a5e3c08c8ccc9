//! Cloze Shift Eval CLI
//!
//! Prompt variants, model queries, masked-fill scoring and cohort reports.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use cloze_shift_eval::{
    condition_groups, format_variants, load_items, load_variants, read_results, results_path,
    score_cohort, write_masked_results, write_results, CommandScorer, DatasetLayout,
    ExperimentConfig, HttpCompletionModel, QueryRunner, ReportBuilder, RunnerConfig,
    ScorerHandle,
};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cloze-shift-eval")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Experiment configuration (YAML); built-in defaults when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Render every stub once per condition
    Variants {
        /// File with one stub template per line
        stubs: PathBuf,

        /// Output TSV (stdout when omitted)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Query the generative model and write pooled distributions
    Query {
        /// Generative-layout TSV dataset
        input: PathBuf,

        /// Output TSV (defaults to `<stem>_results.tsv` next to the input)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Completions per prompt (overrides config)
        #[arg(long)]
        samples: Option<usize>,
    },

    /// Score candidate fills with the masked-fill scorer
    Masked {
        /// Masked-layout TSV dataset
        input: PathBuf,

        /// Output TSV (defaults to `<stem>_results.tsv` next to the input)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Score a results file against the reference condition
    Score {
        /// Results TSV written by `query`
        results: PathBuf,

        /// Generated-text columns per row (defaults to the configured sample count)
        #[arg(long)]
        samples: Option<usize>,

        /// Report format
        #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
        format: ReportFormat,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ReportFormat {
    Text,
    Markdown,
    Json,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match &cli.config {
        Some(path) => ExperimentConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ExperimentConfig::default(),
    };

    match cli.command {
        Commands::Variants { stubs, output } => variants(&config, &stubs, output.as_deref()),
        Commands::Query {
            input,
            output,
            samples,
        } => query(config, &input, output, samples),
        Commands::Masked { input, output } => masked(&config, &input, output),
        Commands::Score {
            results,
            samples,
            format,
        } => score(&config, &results, samples, format),
    }
}

fn variants(config: &ExperimentConfig, stubs: &Path, output: Option<&Path>) -> Result<()> {
    let items = load_variants(stubs, config)
        .with_context(|| format!("reading stubs {}", stubs.display()))?;
    let tsv = format_variants(&items);

    match output {
        Some(path) => {
            std::fs::write(path, tsv).with_context(|| format!("writing {}", path.display()))?;
            tracing::info!(rows = items.len(), output = %path.display(), "Wrote variants");
        }
        None => print!("{tsv}"),
    }
    Ok(())
}

fn query(
    mut config: ExperimentConfig,
    input: &Path,
    output: Option<PathBuf>,
    samples: Option<usize>,
) -> Result<()> {
    if let Some(n) = samples {
        config.generative.samples = n;
    }

    let items = load_items(input, DatasetLayout::Generative)
        .with_context(|| format!("reading dataset {}", input.display()))?;
    let model = HttpCompletionModel::from_settings(config.generative.clone())
        .context("configuring completion client")?;
    let runner = QueryRunner::new(RunnerConfig::from(&config))?;

    let outcome = runner.run_generative(&model, &items);

    let output = output.unwrap_or_else(|| results_path(input));
    write_results(&output, &outcome.results)
        .with_context(|| format!("writing {}", output.display()))?;

    tracing::info!(
        written = outcome.results.len(),
        failed = outcome.failures.len(),
        output = %output.display(),
        "Query run finished"
    );
    if !outcome.is_complete() {
        bail!(
            "{} of {} items failed; their rows were not written",
            outcome.failures.len(),
            outcome.attempted()
        );
    }
    Ok(())
}

fn masked(config: &ExperimentConfig, input: &Path, output: Option<PathBuf>) -> Result<()> {
    let items = load_items(input, DatasetLayout::Masked)
        .with_context(|| format!("reading dataset {}", input.display()))?;

    let settings = config.masked.clone();
    let handle = ScorerHandle::new(move || CommandScorer::spawn(&settings));
    let runner = QueryRunner::new(RunnerConfig::from(config))?;

    let outcome = runner.run_masked(&handle, &items);

    let output = output.unwrap_or_else(|| results_path(input));
    write_masked_results(&output, &outcome.results)
        .with_context(|| format!("writing {}", output.display()))?;

    tracing::info!(
        written = outcome.results.len(),
        failed = outcome.failures.len(),
        output = %output.display(),
        "Masked run finished"
    );
    if !outcome.is_complete() {
        bail!(
            "{} of {} items failed; their rows were not written",
            outcome.failures.len(),
            outcome.attempted()
        );
    }
    Ok(())
}

fn score(
    config: &ExperimentConfig,
    results: &Path,
    samples: Option<usize>,
    format: ReportFormat,
) -> Result<()> {
    let text_columns = samples.unwrap_or(config.generative.samples);
    let rows = read_results(results, text_columns)
        .with_context(|| format!("reading results {}", results.display()))?;

    let groups = condition_groups(&rows, &config.reference)?;
    let summary = score_cohort(&groups, &config.scored_letters(), &config.distance)?;

    let title = results
        .file_stem()
        .map_or_else(|| "cohort".to_string(), |s| s.to_string_lossy().to_string());
    let report = ReportBuilder::new(&title, config).build(&summary);

    match format {
        ReportFormat::Text => print!("{}", report.to_text()),
        ReportFormat::Markdown => print!("{}", report.to_markdown()),
        ReportFormat::Json => println!("{}", report.to_json()?),
    }
    Ok(())
}
