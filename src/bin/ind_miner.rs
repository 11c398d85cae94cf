use anyhow::{Context, Result};
use clap::Parser;
use ind_miner::{
    CsvTableSource, DependencyMiner, DependencyWorker, MinerConfig, ReportFileSink, TableSource,
};
use std::path::PathBuf;
use tracing::info;

/// Discover unary inclusion dependencies between the columns of CSV tables
#[derive(Parser)]
#[command(name = "ind-miner")]
#[command(about = "Mine unary inclusion dependencies across CSV files")]
struct Args {
    /// Input tables, one CSV file per table
    inputs: Vec<PathBuf>,

    /// YAML configuration file; command line flags take precedence
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of local workers
    #[arg(short, long, default_value_t = 4)]
    workers: usize,

    /// Where to write the sorted dependency report
    #[arg(short, long, default_value = "results.txt")]
    output: PathBuf,

    /// CSV field delimiter
    #[arg(short, long)]
    delimiter: Option<char>,

    /// Request n-ary discovery (not supported yet, unary dependencies are mined)
    #[arg(long)]
    nary: bool,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    let mut config = match &args.config {
        Some(path) => MinerConfig::from_yaml_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => MinerConfig::default(),
    };
    config.inputs.extend(args.inputs.iter().cloned());
    if let Some(delimiter) = args.delimiter {
        config.csv_delimiter = delimiter;
    }
    config.discover_nary |= args.nary;
    config.validate()?;
    anyhow::ensure!(args.workers > 0, "at least one worker is required");

    let mut sources: Vec<Box<dyn TableSource>> = Vec::with_capacity(config.inputs.len());
    for path in &config.inputs {
        sources.push(Box::new(CsvTableSource::open(path, &config)?));
    }

    let miner = DependencyMiner::new(config, Box::new(ReportFileSink::new(&args.output)));
    let mut workers = Vec::with_capacity(args.workers);
    for _ in 0..args.workers {
        let (_, handle) = DependencyWorker::new(miner.handle()).spawn()?;
        workers.push(handle);
    }
    info!("Started {} workers", workers.len());

    let report = miner.run(sources).await?;
    for worker in workers {
        worker.abort();
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
