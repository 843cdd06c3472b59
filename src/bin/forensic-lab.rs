//! Command-line entry point: full experiment runs, primary tuning, bundle
//! evaluation and single-image inference.

use std::{fs, path::PathBuf, process::ExitCode};

use clap::{Args, Parser, Subcommand};
use forensic_fusion::{
    LabConfig,
    error::Result,
    pipeline::{run_evaluation, run_pipeline, run_tuning},
    serve::{InferRequest, InferenceService},
    training::TuningMode,
};

#[derive(Debug, Parser)]
#[command(
    name = "forensic-lab",
    version,
    about = "Feature-fusion image forensics: extraction, training, evaluation and inference"
)]
struct Cli {
    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Extract features, train every method, evaluate and write reports
    Run(RunArgs),
    /// Sweep classifier candidates for the primary method
    Tune(TuneArgs),
    /// Re-evaluate a saved bundle: metrics, statistics, robustness and errors
    Evaluate(EvaluateArgs),
    /// Score one image with a saved model bundle
    Infer(InferArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Experiment config (JSON)
    #[arg(short, long)]
    config: PathBuf,
}

#[derive(Debug, Args)]
struct TuneArgs {
    /// Experiment config (JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// Feature table CSV (defaults to the one written by `run`)
    #[arg(long)]
    feature_table: Option<PathBuf>,

    /// single_stage or two_stage
    #[arg(long, default_value = "single_stage", value_parser = parse_mode)]
    mode: TuningMode,
}

#[derive(Debug, Args)]
struct EvaluateArgs {
    /// Experiment config (JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// Model bundle JSON (defaults to the one written by `run`)
    #[arg(short, long)]
    bundle: Option<PathBuf>,

    /// Feature table CSV (defaults to the one written by `run`)
    #[arg(long)]
    feature_table: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct InferArgs {
    /// Model bundle JSON
    #[arg(short, long)]
    bundle: PathBuf,

    /// Image to score
    image: PathBuf,

    /// Include base64 PNG maps in the response
    #[arg(long)]
    heatmap: bool,
}

fn parse_mode(s: &str) -> std::result::Result<TuningMode, String> {
    s.parse().map_err(|e: forensic_fusion::ForensicsError| e.to_string())
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Run(args) => {
            let config = LabConfig::from_json_file(&args.config)?;
            let result = run_pipeline(&config)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Tune(args) => {
            let config = LabConfig::from_json_file(&args.config)?;
            let result = run_tuning(&config, args.feature_table.as_deref(), args.mode)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Evaluate(args) => {
            let config = LabConfig::from_json_file(&args.config)?;
            let result = run_evaluation(&config, args.bundle.as_deref(), args.feature_table.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Infer(args) => {
            let service = InferenceService::new();
            service.load(&args.bundle)?;
            let request = InferRequest {
                file_bytes: fs::read(&args.image)?,
                filename: args.image.file_name().map(|n| n.to_string_lossy().into_owned()),
                content_type: None,
                return_heatmap: args.heatmap,
            };
            let response = service.handle_infer(&request);
            println!("{}", response.to_json()?);
            if response.status() != 200 {
                return Err(forensic_fusion::ForensicsError::AnalysisFailed(format!(
                    "inference failed with status {}",
                    response.status()
                )));
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}
