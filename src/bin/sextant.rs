use clap::Parser;
use sextant::{
    config::FactorGraphConfig,
    context::RunContext,
    error::Error,
    estimator::Estimator,
    io::{FileSink, read_measurements_file},
};
use std::{fs::File, io::BufReader, path::PathBuf, process::ExitCode};
use tracing::{Level, error, info, info_span};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// JSON configuration; defaults to a GNSS-only run.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Measurement file.
    #[arg(short, long)]
    input: PathBuf,

    /// Trajectory file. Local-frame positions and step diagnostics are
    /// written next to it.
    #[arg(short, long)]
    output: PathBuf,

    /// Overrides the sliding window length in seconds.
    #[arg(long)]
    window: Option<f64>,

    /// Log solver details.
    #[arg(short, long)]
    verbose: bool,
}

fn load_config(args: &Args) -> Result<FactorGraphConfig, Error> {
    let mut config = match &args.config {
        Some(path) => serde_json::from_reader(BufReader::new(File::open(path)?))
            .map_err(|err| Error::Config(format!("{}: {err}", path.display())))?,
        None => FactorGraphConfig::default(),
    };
    if args.window.is_some() {
        config.window = args.window;
    }
    Ok(config)
}

fn run(args: &Args) -> Result<(), Error> {
    let config = load_config(args)?;
    let measurements = read_measurements_file(&args.input)?;
    info!(measurements = measurements.len(), input = %args.input.display(), "read measurements");

    let mut sink = FileSink::new(&args.output);
    let mut ctx = RunContext::new(info_span!("sextant", input = %args.input.display()));
    let estimate = Estimator::new(config).run(&measurements, &mut sink, &mut ctx)?;
    sink.finish()?;

    info!(
        states = estimate.trajectory.len(),
        steps = estimate.summaries.len(),
        output = %args.output.display(),
        "wrote trajectory"
    );
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Register an event subscriber that prints events to STDOUT.
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(level)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("failed to install the log subscriber");
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}
