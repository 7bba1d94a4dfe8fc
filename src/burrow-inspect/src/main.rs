//! Pipeline driver for the traffic-inspection tooling.
//!
//! Modes mirror the capture-to-clustering pipeline. The ones owned by this
//! crate work on times files and co-occurrence matrices; the rest belong to
//! external collaborators (pcap importer, clusterer, evaluator) and fail
//! with a pointer to them.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use burrow_inspect::{
    overlap_in_secs, secs_to_nanos, CoOccurrence, FixedMarginSweep, GaussianCutoff, OverlapKernel,
    TimestampStore,
};

#[derive(Parser, Debug)]
#[command(
    name = "burrow-inspect",
    version,
    about = "Traffic-session co-occurrence pipelines"
)]
struct Args {
    /// Pipeline mode
    #[arg(value_enum)]
    mode: Mode,

    /// Times file (persisted per-session timestamp lists)
    #[arg(long, default_value = "times.pb")]
    times: PathBuf,

    /// Co-occurrence matrix file
    #[arg(long, default_value = "cooccurrence.pb")]
    matrix: PathBuf,

    /// Output path for save-times mode
    #[arg(long)]
    out: Option<PathBuf>,

    /// Overlap kernel
    #[arg(long, value_enum, default_value = "fixed-margin")]
    kernel: Kernel,

    /// Fixed margin in seconds
    #[arg(long, default_value_t = 0.010)]
    margin_s: f64,

    /// Gaussian standard deviation in seconds
    #[arg(long, default_value_t = 0.010)]
    sigma_s: f64,

    /// Gaussian cutoff in standard deviations
    #[arg(long, default_value_t = GaussianCutoff::DEFAULT_CUTOFF)]
    cutoff: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Import a pcap into session records (external importer)
    #[value(name = "p", alias = "parse-pcap")]
    ParsePcap,
    /// Print the sessions stored in a times file
    #[value(name = "dt", alias = "display-transports")]
    DisplayTransports,
    /// Build and persist the co-occurrence matrix from a times file
    #[value(name = "t", alias = "timestamps")]
    Timestamps,
    /// Cluster a persisted matrix (external clusterer)
    #[value(name = "c", alias = "cluster")]
    Cluster,
    /// Build, cluster and score (external evaluator)
    #[value(name = "e", alias = "evaluate")]
    Evaluate,
    /// Search clustering parameters (external hill-climber)
    #[value(name = "ghc", alias = "genetic-hill-climbing")]
    GeneticHillClimbing,
    /// Re-save a times file to another path
    #[value(name = "st", alias = "save-times")]
    SaveTimes,
    /// Sketch-compress a matrix (external reducer)
    #[value(name = "rc", alias = "reduce-cooc")]
    ReduceCooc,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match args.mode {
        Mode::DisplayTransports => display_times(&args),
        Mode::Timestamps => build_matrix(&args),
        Mode::SaveTimes => resave_times(&args),
        Mode::ParsePcap => bail!("pcap import is owned by the capture importer, not this tool"),
        Mode::Cluster => bail!("clustering is owned by the external clusterer, not this tool"),
        Mode::Evaluate => bail!("evaluation is owned by the external evaluator, not this tool"),
        Mode::GeneticHillClimbing => {
            bail!("parameter search is owned by the external hill-climber, not this tool")
        }
        Mode::ReduceCooc => {
            bail!("sketch reduction is owned by the external reducer, not this tool")
        }
    }
}

fn kernel_from_args(args: &Args) -> Box<dyn OverlapKernel> {
    match args.kernel {
        Kernel::FixedMargin => Box::new(FixedMarginSweep {
            margin: secs_to_nanos(args.margin_s),
        }),
        Kernel::Gaussian => Box::new(GaussianCutoff {
            sigma: secs_to_nanos(args.sigma_s),
            cutoff: args.cutoff,
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Kernel {
    FixedMargin,
    Gaussian,
}

fn load_times(args: &Args) -> Result<TimestampStore> {
    TimestampStore::load(&args.times)
        .with_context(|| format!("loading times file {}", args.times.display()))
}

fn display_times(args: &Args) -> Result<()> {
    let store = load_times(args)?;
    let mut sessions: Vec<_> = store.iter().collect();
    sessions.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));

    for (sid, times) in sessions {
        match (times.first(), times.last()) {
            (Some(first), Some(last)) => println!(
                "{sid}: {} timestamps, {:.6}s span",
                times.len(),
                overlap_in_secs(last - first)
            ),
            _ => println!("{sid}: 0 timestamps"),
        }
    }
    info!(sessions = store.len(), "displayed times file");
    Ok(())
}

fn build_matrix(args: &Args) -> Result<()> {
    let store = load_times(args)?;
    let kernel = kernel_from_args(args);
    let matrix = CoOccurrence::build(&store, kernel.as_ref());
    matrix
        .save(&args.matrix)
        .with_context(|| format!("saving matrix to {}", args.matrix.display()))?;
    overlap_stats(&matrix);
    Ok(())
}

fn resave_times(args: &Args) -> Result<()> {
    let out = args
        .out
        .as_ref()
        .context("save-times mode requires --out")?;
    let store = load_times(args)?;
    store
        .save(out)
        .with_context(|| format!("saving times to {}", out.display()))?;
    info!(sessions = store.len(), out = %out.display(), "times file saved");
    Ok(())
}

/// Summary statistics over the non-zero overlaps, in seconds.
fn overlap_stats(matrix: &CoOccurrence) {
    let (data_size, id_size) = matrix.memory_size();
    info!(
        data = data_size,
        ids = id_size,
        total = data_size + id_size,
        "co-occurrence memory size (bytes)"
    );

    let overlaps: Vec<f64> = matrix.non_zero_totals().map(overlap_in_secs).collect();
    if overlaps.is_empty() {
        info!(sessions = matrix.index().len(), "no non-zero overlaps");
        return;
    }
    let min = overlaps.iter().copied().fold(f64::INFINITY, f64::min);
    let max = overlaps.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mean = overlaps.iter().sum::<f64>() / overlaps.len() as f64;
    let std_dev = if overlaps.len() > 1 {
        let var = overlaps.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
            / (overlaps.len() - 1) as f64;
        var.sqrt()
    } else {
        0.0
    };
    info!(
        sessions = matrix.index().len(),
        non_zero = overlaps.len(),
        min,
        max,
        mean,
        std_dev,
        "co-occurrence statistics"
    );
}
