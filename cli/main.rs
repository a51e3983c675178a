#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use cylps::{
    DirectTraceFisher, FisherEstimator, FisherMethod, FisherProgressObserver, FisherProgressStage,
    MonteCarloFisher, RunConfig, SkyModel, SyntheticTelescope, TransferArray, c64,
};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use ndarray::Array2;
use serde::Serialize;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum MethodCli {
    /// Exact below `nswitch` eigenmodes, Monte-Carlo at and above
    Auto,
    /// Direct trace evaluation for every order
    Exact,
    /// Monte-Carlo estimation for every order
    Mc,
}

impl MethodCli {
    fn forced(self) -> Option<FisherMethod> {
        match self {
            Self::Auto => None,
            Self::Exact => Some(FisherMethod::Exact),
            Self::Mc => Some(FisherMethod::MonteCarlo),
        }
    }
}

#[derive(Args)]
pub struct FisherArgs {
    /// TOML file with `[estimator]` and `[telescope]` tables
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Sky realizations drawn per band (at least 2)
    #[arg(long, value_name = "N")]
    pub nsamples: Option<usize>,

    /// Eigenmode count at which the Monte-Carlo estimator takes over
    #[arg(long, value_name = "N")]
    pub nswitch: Option<usize>,

    /// Minimum KL eigenvalue retained
    #[arg(long)]
    pub threshold: Option<f64>,

    /// Base seed for the per-band random streams
    #[arg(long)]
    pub seed: Option<u64>,

    #[arg(long, value_enum, default_value_t = MethodCli::Auto)]
    pub method: MethodCli,

    /// Write the Fisher matrix and band-power errors to this TOML file
    #[arg(long, value_name = "PATH")]
    pub output: Option<PathBuf>,
}

#[derive(Parser)]
#[command(
    name = "cylps",
    version,
    about = "KL-space Fisher matrices for cylinder telescope power spectra",
    long_about = "Estimates the band-power Fisher matrix of a KL-compressed cylinder telescope, \
                 switching between direct trace evaluation and Monte-Carlo sampling per m."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Estimate the Fisher matrix summed over all m
    #[command(about = "Estimate the band-power Fisher matrix (optional output: TOML report)")]
    Fisher(FisherArgs),
}

/// Drives an indicatif bar from the per-order callbacks.
struct BarProgress {
    bar: ProgressBar,
    exact: AtomicUsize,
    monte_carlo: AtomicUsize,
}

impl BarProgress {
    fn new() -> Result<Self, indicatif::style::TemplateError> {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let bar = ProgressBar::with_draw_target(Some(0), draw_target);
        bar.set_style(
            ProgressStyle::with_template(
                "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} m ({eta}) {msg}",
            )?
            .progress_chars("█▉▊▋▌▍▎▏  "),
        );
        Ok(Self {
            bar,
            exact: AtomicUsize::new(0),
            monte_carlo: AtomicUsize::new(0),
        })
    }
}

impl FisherProgressObserver for BarProgress {
    fn on_stage_start(&self, stage: FisherProgressStage, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.set_message(stage.describe());
    }

    fn on_order_finish(&self, order: i32, method: FisherMethod) {
        let counter = match method {
            FisherMethod::Exact => &self.exact,
            FisherMethod::MonteCarlo => &self.monte_carlo,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.bar.set_message(format!("last m={order}"));
        self.bar.inc(1);
    }

    fn on_stage_finish(&self, stage: FisherProgressStage) {
        self.bar.finish_and_clear();
        eprintln!(
            "> Finished {stage}: {} orders exact, {} orders Monte-Carlo.",
            self.exact.load(Ordering::Relaxed),
            self.monte_carlo.load(Ordering::Relaxed)
        );
    }
}

#[derive(Serialize)]
struct FisherReport {
    nbands: usize,
    band_edges: Vec<f64>,
    orders: Vec<i32>,
    method: String,
    nsamples: usize,
    nswitch: usize,
    seed: u64,
    errors: Vec<f64>,
    fisher_real: Vec<Vec<f64>>,
    fisher_imag: Vec<Vec<f64>>,
}

/// One-sigma band-power errors from the Fisher diagonal, ignoring band correlations.
fn diagonal_errors(fisher: &Array2<c64>) -> Vec<f64> {
    fisher
        .diag()
        .iter()
        .map(|f| {
            if f.re > 0.0 {
                f.re.sqrt().recip()
            } else {
                f64::INFINITY
            }
        })
        .collect()
}

fn print_matrix(fisher: &Array2<c64>) {
    for row in fisher.rows() {
        let line = row
            .iter()
            .map(|z| format!("{:>12.4e}", z.re))
            .collect::<Vec<_>>()
            .join(" ");
        println!("  {line}");
    }
}

pub fn run_fisher(args: FisherArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => {
            println!("Loading configuration from: {}", path.display());
            RunConfig::from_toml_path(path)?
        }
        None => RunConfig::default(),
    };
    if let Some(nsamples) = args.nsamples {
        config.estimator.nsamples = nsamples;
    }
    if let Some(nswitch) = args.nswitch {
        config.estimator.nswitch = nswitch;
    }
    if let Some(threshold) = args.threshold {
        config.estimator.threshold = threshold;
    }
    if let Some(seed) = args.seed {
        config.estimator.seed = seed;
    }
    config.validate()?;

    let telescope = SyntheticTelescope::new(config.telescope.clone())?;
    let orders = telescope.orders();
    println!(
        "Telescope: {} frequencies, lmax={}, {} orders, {} bands",
        config.telescope.nfreq,
        config.telescope.lmax,
        orders.len(),
        telescope.band_edges().len() - 1
    );

    // Both estimators share one set of band covariances.
    let clarray = telescope.generate_bands()?;
    let transfers = TransferArray::from_bands(&clarray)?;
    let monte_carlo = MonteCarloFisher::new(&telescope, transfers, config.estimator.clone())?;
    let exact = DirectTraceFisher::new(&telescope, clarray, config.estimator.threshold)?;
    let estimator =
        FisherEstimator::new(monte_carlo, exact).with_forced_method(args.method.forced());

    let progress = BarProgress::new()?;
    let fisher = estimator.fisher_total_with_progress(&orders, &progress)?;
    let errors = diagonal_errors(&fisher);

    println!("Fisher matrix (real part):");
    print_matrix(&fisher);
    println!("Band-power errors (1/sqrt(F_aa)):");
    for (band, error) in errors.iter().enumerate() {
        println!("  band {band}: {error:.6e}");
    }

    if let Some(path) = &args.output {
        let report = FisherReport {
            nbands: fisher.nrows(),
            band_edges: telescope.band_edges().to_vec(),
            orders,
            method: format!("{:?}", args.method).to_lowercase(),
            nsamples: config.estimator.nsamples,
            nswitch: config.estimator.nswitch,
            seed: config.estimator.seed,
            errors,
            fisher_real: fisher
                .rows()
                .into_iter()
                .map(|row| row.iter().map(|z| z.re).collect())
                .collect(),
            fisher_imag: fisher
                .rows()
                .into_iter()
                .map(|row| row.iter().map(|z| z.im).collect())
                .collect(),
        };
        std::fs::write(path, toml::to_string_pretty(&report)?)?;
        println!("Fisher report saved to: {}", path.display());
    }

    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Fisher(args)) => run_fisher(args),
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
