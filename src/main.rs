use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use capflow::analysis::{AnalysisPipeline, AnalysisStatus, PrivateRangeResolver};
use capflow::capture::{self, InspectProgress};
use capflow::common::{CancelToken, ProgressUpdate};
use capflow::decoder::TsharkSource;
use capflow::PipelineConfig;

#[derive(Parser)]
#[command(name = "capflow")]
#[command(version, about = "Bounded-memory capture ingestion and analysis")]
struct Cli {
    /// Verbose logging (file:line, thread ids)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Walk the capture headers and print a packet count estimate as JSON
    Inspect {
        file: PathBuf,
    },

    /// Run the full pipeline through tshark and print the report as JSON
    Analyze {
        file: PathBuf,

        /// Configuration file (defaults to the user config directory)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Ingestion worker count (0 = CPU count)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Pretty-print the JSON report
        #[arg(long)]
        pretty: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // RUST_LOG overrides the default filter, e.g.
    //   RUST_LOG=capflow::ingest=trace capflow analyze dump.pcapng
    if cli.verbose {
        capflow::logging::init_verbose();
    } else {
        capflow::logging::init();
    }

    let result = match cli.command {
        Commands::Inspect { file } => inspect(file),
        Commands::Analyze { file, config, workers, pretty } => analyze(file, config, workers, pretty),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "capflow failed");
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn inspect(file: PathBuf) -> capflow::Result<ExitCode> {
    let config = PipelineConfig::load_or_default();
    let report_progress = |p: &InspectProgress| {
        info!(
            percent = p.percent,
            packets = p.packets,
            bytes = p.bytes_read,
            "Inspecting"
        );
    };
    let result = capture::inspect_with(
        &file,
        &config.inspector.inspect_options(),
        &CancelToken::new(),
        Some(&report_progress as &dyn Fn(&InspectProgress)),
    );

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(if result.success { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn analyze(
    file: PathBuf,
    config_path: Option<PathBuf>,
    workers: Option<usize>,
    pretty: bool,
) -> capflow::Result<ExitCode> {
    let mut config = match config_path {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::load_or_default(),
    };
    if let Some(workers) = workers {
        config.ingest.worker_count = workers;
    }

    let source = Arc::new(
        TsharkSource::new(config.decoder.tshark_path.clone())
            .with_inspect_options(config.inspector.inspect_options()),
    );
    let pipeline = AnalysisPipeline::new(config, source, Arc::new(PrivateRangeResolver))?.with_progress(
        Arc::new(|update: &ProgressUpdate| {
            info!(
                phase = %update.phase,
                percent = update.percent,
                processed = update.processed,
                total = update.total,
                "Progress"
            );
        }),
    );

    let outcome = pipeline.run(&file, &CancelToken::new());
    let json = if pretty {
        serde_json::to_string_pretty(&outcome)?
    } else {
        serde_json::to_string(&outcome)?
    };
    println!("{}", json);

    Ok(match outcome.status {
        AnalysisStatus::Completed => ExitCode::SUCCESS,
        AnalysisStatus::Failed | AnalysisStatus::Cancelled => ExitCode::FAILURE,
    })
}
