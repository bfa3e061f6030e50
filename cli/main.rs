#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;

use subtyper::config::StudyConfig;
use subtyper::data::{Dataset, load_expression_matrix};
use subtyper::evaluate::format_rate;
use subtyper::pipeline::{StudyReport, run_embedding, run_study};
use subtyper::report::{write_embedding_csv, write_report_toml};
use subtyper::synthetic::{SyntheticSpec, write_tsv};

#[derive(Args)]
pub struct RunArgs {
    /// Tab-separated expression matrix: one row per sample, a label column and numeric features
    pub matrix: PathBuf,

    /// Study configuration (.toml); defaults are used for anything it leaves out
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Where to write the study report
    #[arg(long, default_value = "study_report.toml")]
    pub report: PathBuf,

    /// Where to write the embedding coordinates, when the embedding is enabled
    #[arg(long, default_value = "embedding.csv")]
    pub embedding: PathBuf,

    /// Override the configured seed
    #[arg(long)]
    pub seed: Option<u64>,

    /// Override the configured number of worker threads
    #[arg(long)]
    pub threads: Option<usize>,
}

#[derive(Args)]
pub struct EmbedArgs {
    /// Tab-separated expression matrix
    pub matrix: PathBuf,

    /// Study configuration (.toml); only the seed, split and embedding settings are read
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Where to write the embedding coordinates
    #[arg(long, default_value = "embedding.csv")]
    pub output: PathBuf,

    #[arg(long)]
    pub perplexity: Option<f64>,

    #[arg(long)]
    pub seed: Option<u64>,
}

#[derive(Args)]
pub struct SimulateArgs {
    /// Where to write the synthetic matrix (.tsv)
    pub output: PathBuf,

    #[arg(long, default_value = "150")]
    pub samples_per_class: usize,

    #[arg(long, default_value = "200")]
    pub features: usize,

    /// Number of leading features whose mean differs between the classes
    #[arg(long, default_value = "5")]
    pub informative: usize,

    /// Mean difference of the informative features, in noise standard deviations
    #[arg(long, default_value = "1.0")]
    pub shift: f64,

    /// Noisy duplicates of the informative features
    #[arg(long, default_value = "0")]
    pub correlated_copies: usize,

    #[arg(long, default_value = "42")]
    pub seed: u64,
}

#[derive(Parser)]
#[command(
    name = "subtyper",
    about = "Comparative feature-selection and classification study for two-class expression subtyping",
    long_about = "Splits an expression matrix into training and held-out samples, filters and selects \
                 features with several strategies, tunes linear and kernel classifiers by \
                 cross-validation and reports held-out performance for every combination."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run the full study (outputs: study_report.toml, embedding.csv)")]
    Run(RunArgs),
    #[command(about = "Compute the t-SNE embedding only (outputs: embedding.csv)")]
    Embed(EmbedArgs),
    #[command(about = "Write a synthetic expression matrix with known informative features")]
    Simulate(SimulateArgs),
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();
    let result = match command {
        Some(Commands::Run(args)) => run(args),
        Some(Commands::Embed(args)) => embed(args),
        Some(Commands::Simulate(args)) => simulate(args),
        None => {
            if let Err(e) = Cli::command().print_help() {
                eprintln!("Error: {e}");
            }
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        let mut source = std::error::Error::source(e.as_ref());
        while let Some(cause) = source {
            eprintln!("  caused by: {cause}");
            source = std::error::Error::source(cause);
        }
        process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> Result<StudyConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(StudyConfig::from_toml_file(path)?),
        None => Ok(StudyConfig::default()),
    }
}

fn load_matrix(path: &Path, config: &StudyConfig) -> Result<Dataset, Box<dyn std::error::Error>> {
    Ok(load_expression_matrix(path, &config.load_options())?)
}

// ========================================================================================
//                                    Subcommands
// ========================================================================================

pub fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(threads) = args.threads {
        config.threads = Some(threads);
    }

    let dataset = load_matrix(&args.matrix, &config)?;
    let outcome = run_study(&dataset, &config)?;

    write_report_toml(&outcome.report, &args.report)?;
    if let Some(embedding) = &outcome.embedding {
        write_embedding_csv(&args.embedding, &dataset, embedding, &outcome.split)?;
    }
    print_summary(&outcome.report);
    Ok(())
}

pub fn embed(args: EmbedArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(perplexity) = args.perplexity {
        config.embedding.perplexity = perplexity;
    }

    let dataset = load_matrix(&args.matrix, &config)?;
    let (split, embedding) = run_embedding(&dataset, &config)?;
    write_embedding_csv(&args.output, &dataset, &embedding, &split)?;
    println!(
        "Embedded {} samples (KL divergence {:.4}) -> {}",
        dataset.n_samples(),
        embedding.kl_divergence,
        args.output.display()
    );
    Ok(())
}

pub fn simulate(args: SimulateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let spec = SyntheticSpec {
        samples_per_class: args.samples_per_class,
        features: args.features,
        informative: args.informative,
        shift: args.shift,
        correlated_copies: args.correlated_copies,
        seed: args.seed,
    };
    let dataset = spec.generate()?;
    write_tsv(&dataset, &args.output)?;
    println!(
        "Wrote {} samples x {} features to {}",
        dataset.n_samples(),
        dataset.n_features(),
        args.output.display()
    );
    Ok(())
}

// ========================================================================================
//                                      Output
// ========================================================================================

fn print_summary(report: &StudyReport) {
    println!(
        "Split: {} train / {} test; {} features after variance filter, {} after correlation pruning",
        report.split.train, report.split.test, report.variance_filtered, report.correlation_pruned
    );
    println!(
        "{:<10} {:<8} {:>9} {:>9} {:>9} {:>9}  configuration",
        "strategy", "family", "features", "accuracy", "sens", "spec"
    );
    for strategy in &report.strategies {
        match (&strategy.evaluation, &strategy.failure) {
            (Some(evaluation), _) => println!(
                "{:<10} {:<8} {:>9} {:>9.3} {:>9} {:>9}  {}",
                strategy.strategy,
                strategy.family,
                strategy.features.len(),
                evaluation.metrics.accuracy,
                format_rate(evaluation.metrics.sensitivity),
                format_rate(evaluation.metrics.specificity),
                strategy
                    .configuration
                    .as_ref()
                    .map(|c| c.to_string())
                    .unwrap_or_default()
            ),
            (None, Some(failure)) => println!(
                "{:<10} {:<8} failed during {}: {}",
                strategy.strategy, strategy.family, failure.stage, failure.message
            ),
            (None, None) => println!("{:<10} {:<8} no result", strategy.strategy, strategy.family),
        }
    }
}
