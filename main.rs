use btcs_inference::{AnalysisOutcome, Analyzer, ClassificationResult, Settings};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

/// Classifies a brain MRI scan with a local ONNX model.
#[derive(Parser)]
#[command(name = "btcs-classify")]
#[command(about = "Brain tumor classification on a single MRI scan, run locally")]
struct Args {
    /// Settings file (JSON); defaults apply to anything it leaves out
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Model artifact, overriding the settings file
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// Labels file in the model's class order, overriding the settings file
    #[arg(short, long)]
    labels: Option<PathBuf>,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,

    /// Give up after this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Scan to classify (JPEG, PNG or BMP)
    image: PathBuf,
}

fn print_report(result: &ClassificationResult) {
    println!("Detected class: {}", result.prediction);
    println!("Confidence: {:.2}%", result.confidence * 100.0);
    println!();
    println!("Detailed probabilities:");
    for (label, p) in result.ranked() {
        let marker = if label == result.prediction { "*" } else { " " };
        println!(" {marker} {label:<12} {:>5.1}%", p * 100.0);
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => match Settings::load(path) {
            Ok(settings) => settings,
            Err(err) => {
                log::error!("Failed to read settings from {}: {err}", path.display());
                return ExitCode::FAILURE;
            }
        },
        None => Settings::default(),
    };
    if let Some(model) = args.model {
        settings.model.model_path = model;
    }
    if let Some(labels) = args.labels {
        settings.model.labels_path = Some(labels);
    }

    let analyzer = match Analyzer::new(settings) {
        Ok(analyzer) => analyzer,
        Err(err) => {
            log::error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let bytes = match std::fs::read(&args.image) {
        Ok(bytes) => bytes,
        Err(err) => {
            log::error!("Failed to read {}: {err}", args.image.display());
            return ExitCode::FAILURE;
        }
    };

    let outcome = match args.timeout_secs {
        Some(secs) => {
            analyzer
                .analyze_with_timeout(bytes, Duration::from_secs(secs))
                .await
        }
        None => analyzer.analyze(bytes).await,
    };

    match outcome {
        Ok(AnalysisOutcome::Completed(result)) => {
            if args.json {
                match serde_json::to_string_pretty(&result) {
                    Ok(json) => println!("{json}"),
                    Err(err) => {
                        log::error!("Failed to serialize result: {err}");
                        return ExitCode::FAILURE;
                    }
                }
            } else {
                print_report(&result);
            }
            ExitCode::SUCCESS
        }
        Ok(AnalysisOutcome::Superseded) => ExitCode::FAILURE,
        Err(failure) => {
            log::error!("{failure}");
            eprintln!("Analysis error: {}", failure.reason());
            ExitCode::FAILURE
        }
    }
}
