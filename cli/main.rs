use clap::{Args, CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::process;

use anthesis::config::SeasonConfig;
use anthesis::regress::metrics::EvaluationMetrics;
use anthesis::season::{
    SeasonInputs, run_features, run_heritability, run_inference_from_file, run_season, run_training,
};

#[derive(Args)]
pub struct SeasonArgs {
    /// Season configuration file (TOML)
    #[arg(long, value_name = "FILE")]
    pub config: PathBuf,
}

#[derive(Args)]
pub struct InferArgs {
    /// Season configuration file (TOML)
    #[arg(long, value_name = "FILE")]
    pub config: PathBuf,

    /// Trained model bundle written by `anthesis train`
    #[arg(long, value_name = "FILE")]
    pub model: PathBuf,
}

#[derive(Parser)]
#[command(
    name = "anthesis",
    about = "Flowering-time phenotyping of maize field trials from drone imagery",
    long_about = "Engineers plant-height features from drone plot summaries, screens their \
                 heritability with a genotype + replicate mixed model, and imputes anthesis GDD \
                 for unscored plots with a cross-validated LASSO."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Engineer plant-height features (outputs: features.csv)")]
    Features(SeasonArgs),
    #[command(
        about = "Estimate feature heritability (outputs: heritability.csv, heritability_by_type.csv, heritability_over_time.csv)"
    )]
    Heritability(SeasonArgs),
    #[command(
        about = "Train and evaluate the flowering-time model (outputs: model.toml, cv_curve.csv, coefficients.csv, test_predictions.csv)"
    )]
    Train(SeasonArgs),
    #[command(
        about = "Predict unscored plots with a saved model (outputs: predictions.csv and diagnostics)"
    )]
    Infer(InferArgs),
    #[command(about = "Run every stage of a season")]
    Run(SeasonArgs),
    #[command(about = "Display version information")]
    Version,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();
    let result = match command {
        Some(Commands::Features(args)) => features(args),
        Some(Commands::Heritability(args)) => heritability(args),
        Some(Commands::Train(args)) => train(args),
        Some(Commands::Infer(args)) => infer(args),
        Some(Commands::Run(args)) => run(args),
        Some(Commands::Version) => {
            println!("anthesis {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => Cli::command()
            .print_help()
            .map(|_| println!())
            .map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn features(args: SeasonArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = SeasonConfig::load(&args.config)?;
    let inputs = run_features(&config)?;
    println!(
        "Wrote {} features for {} plots to {}",
        inputs.features.n_columns(),
        inputs.features.n_plots(),
        config.output_dir.display()
    );
    Ok(())
}

fn heritability(args: SeasonArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = SeasonConfig::load(&args.config)?;
    let inputs = SeasonInputs::load(&config)?;
    let records = run_heritability(&config, &inputs)?;
    let defined = records.iter().filter(|r| r.h2.is_some()).count();
    println!(
        "Heritability defined for {defined} of {} features; tables written to {}",
        records.len(),
        config.output_dir.display()
    );
    Ok(())
}

fn train(args: SeasonArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = SeasonConfig::load(&args.config)?;
    let inputs = SeasonInputs::load(&config)?;
    let model = run_training(&config, &inputs)?;
    println!(
        "Selected alpha = {:.4e}, {} non-zero coefficients",
        model.alpha,
        model.nonzero_coefficients().len()
    );
    print_metrics(&model.metrics);
    Ok(())
}

fn infer(args: InferArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = SeasonConfig::load(&args.config)?;
    let predictions = run_inference_from_file(&config, &args.model)?;
    println!(
        "Predicted {} plots; outputs written to {}",
        predictions.len(),
        config.output_dir.display()
    );
    Ok(())
}

fn run(args: SeasonArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = SeasonConfig::load(&args.config)?;
    let summary = run_season(&config)?;
    println!(
        "Season {}: {} plots, {} features, heritability defined for {}/{} features",
        summary.season,
        summary.n_plots,
        summary.n_features,
        summary.heritability_defined,
        summary.heritability_total
    );
    println!("Selected alpha = {:.4e}", summary.alpha);
    print_metrics(&summary.test_metrics);
    println!("Predicted {} unscored plots", summary.n_predicted);
    Ok(())
}

fn print_metrics(metrics: &EvaluationMetrics) {
    let show = |v: Option<f64>| v.map_or_else(|| "undefined".to_string(), |x| format!("{x:.4}"));
    println!(
        "Test partition (n = {}): R² = {}, traditional R² = {}, Spearman = {}, RMSE = {}",
        metrics.n,
        show(metrics.rsq),
        show(metrics.rsq_trad),
        show(metrics.spearman),
        show(metrics.rmse)
    );
}
