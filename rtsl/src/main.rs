use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use rtsl::settings::Settings;
use rtsl::{RtslEngine, TraceSource};

#[derive(Debug, Parser)]
#[command(about = "Theoretically-sound scheduling latency analyzer")]
struct Opt {
    /// Replay an ftrace text file ("-" for stdin) instead of reading the live trace_pipe
    #[clap(short, long)]
    trace: Option<PathBuf>,

    /// Number of per-core records (defaults to ANALYZER__NR_CPUS, then online CPUs)
    #[clap(short, long)]
    cpus: Option<usize>,

    /// Print the session summary as JSON
    #[clap(long)]
    json: bool,

    /// Verbose output
    #[clap(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        if opt.verbose { "info" } else { "warn" }
    ))
    .init();

    let mut settings = Settings::new().context("Failed to load settings")?;
    if let Some(cpus) = opt.cpus {
        settings.analyzer.nr_cpus = Some(cpus);
    }

    let source = match opt.trace {
        Some(path) if path.as_os_str() == "-" => TraceSource::Stdin,
        Some(path) => TraceSource::File(path),
        None => TraceSource::Live,
    };
    info!("Trace source: {:?}", source);

    let report = RtslEngine::new(settings, source).run().await?;

    if opt.json {
        println!("{}", report.to_json()?);
    } else {
        print!("{}", report.to_table());
    }

    // a live reader may still be blocked in trace_pipe
    std::process::exit(0);
}
