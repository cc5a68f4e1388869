//! StackPerf benchmark driver

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stackperf_core::workload::REFERENCE_POPULATION;
use stackperf_core::{
    build, ConfigError, FetchReport, FetchTermination, PopulateReport, SavePolicy, SchemaSource, StackConfig,
    Topology, TopologyKind, Workload,
};

/// StackPerf - context topology benchmarks over a record store
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Context topology to install for the run
    #[arg(short, long, default_value = "simple")]
    topology: TopologyKind,

    /// Directory holding the store files
    #[arg(long, default_value = "stackperf-data")]
    store_dir: PathBuf,

    /// Schema file to apply instead of the built-in one
    #[arg(long)]
    schema: Option<PathBuf>,

    /// Numbers covered by one fetched page
    #[arg(long)]
    batch_size: Option<i32>,

    /// Page until an empty page instead of stopping at the reference bound
    #[arg(long)]
    until_empty: bool,

    /// Save every N records instead of after every record
    #[arg(long, value_name = "N")]
    batched_saves: Option<u32>,

    /// Delete existing store files first
    #[arg(long)]
    reset: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Insert records 0..10000 on a worker context
    Populate,
    /// Page through the main context from record 0
    Fetch,
    /// Insert records 10000..20000 and fetch without waiting
    PopulateThenFetch,
    /// Run the three workloads one after the other
    All,
}

impl Args {
    fn stack_config(&self) -> Result<StackConfig, ConfigError> {
        let mut config = StackConfig::benchmark(&self.store_dir);
        if let Some(path) = &self.schema {
            config.schema = SchemaSource::File(path.clone());
        }
        if let Some(batch_size) = self.batch_size {
            config.fetch_batch_size = batch_size;
        }
        if self.until_empty {
            config.fetch_termination = FetchTermination::UntilEmpty;
        }
        if let Some(every) = self.batched_saves {
            config.save_policy = SavePolicy::Batched { every };
        }
        config.reset_store = self.reset;
        config.validate()?;
        Ok(config)
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("stackperf={0},stackperf_core={0}", args.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match args.stack_config() {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "refusing to start");
            return ExitCode::from(2);
        }
    };
    let topology = match build(args.topology, &config) {
        Ok(topology) => topology,
        Err(err) => {
            error!(topology = %args.topology, store = %config.store_path().display(), %err, "store could not be opened");
            return ExitCode::from(2);
        }
    };

    match run(args.command, topology, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command, topology: Arc<dyn Topology>, config: StackConfig) -> Result<()> {
    let kind = topology.kind();
    let workload = Workload::new(Some(topology), config).context("starting workload driver")?;
    println!("=== {} ===", kind);

    match command {
        Command::Populate => populate(&workload),
        Command::Fetch => fetch(&workload),
        Command::PopulateThenFetch => populate_then_fetch(&workload),
        Command::All => {
            populate(&workload)?;
            fetch(&workload)?;
            populate_then_fetch(&workload)
        }
    }
}

fn populate(workload: &Workload) -> Result<()> {
    let report = workload
        .populate(0, REFERENCE_POPULATION)
        .and_then(|c| c.wait())
        .ok_or_else(|| anyhow!("populate never ran"))?;
    print_populate(&report)
}

fn fetch(workload: &Workload) -> Result<()> {
    let report = workload
        .fetch()
        .and_then(|c| c.wait())
        .ok_or_else(|| anyhow!("fetch never ran"))?;
    print_fetch(&report)
}

fn populate_then_fetch(workload: &Workload) -> Result<()> {
    let both = workload
        .populate_then_fetch()
        .ok_or_else(|| anyhow!("populate-then-fetch never ran"))?;
    let fetched = both.fetch.as_ref().and_then(|c| c.wait());
    let populated = both.populate.wait().ok_or_else(|| anyhow!("populate never ran"))?;
    print_populate(&populated)?;
    print_fetch(&fetched.ok_or_else(|| anyhow!("fetch never ran"))?)
}

fn print_populate(report: &PopulateReport) -> Result<()> {
    println!(
        "  populate  {:>6} records from {:<6} {:>6} saves  {:?} ({:.0} records/sec)",
        report.inserted,
        report.start,
        report.saves,
        report.elapsed,
        report.inserted as f64 / report.elapsed.as_secs_f64().max(f64::EPSILON)
    );
    if let Some(err) = &report.error {
        return Err(anyhow!(err.clone()).context(format!("populate stopped after {} records", report.inserted)));
    }
    match &report.propagation_error {
        Some(err) => Err(anyhow!(err.clone()).context("populated records were not persisted")),
        None => Ok(()),
    }
}

fn print_fetch(report: &FetchReport) -> Result<()> {
    println!(
        "  fetch     {:>6} records  {:>6} pages  {:?}",
        report.records, report.pages, report.elapsed
    );
    match &report.error {
        Some(err) => Err(anyhow!(err.clone()).context("fetch stopped")),
        None => Ok(()),
    }
}
