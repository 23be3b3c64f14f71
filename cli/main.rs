#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use std::collections::BTreeMap;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use chromapsf::amplitude::AmplitudePrior;
use chromapsf::chromatic::{ChromaticPsf, FitGeometry};
use chromapsf::data::{FlatBackground, Spectrogram, load_matrix, write_matrix};
use chromapsf::estimate::{ChromaticFit, fit_chromatic_psf};
use chromapsf::fitter::MinimizerMethod;
use chromapsf::model::{ChromaticPsfRecord, FitConfig, save_profile_table};
use chromapsf::shape::PsfKind;
use chromapsf::synthetic::{default_truth, simulate};

#[derive(Parser)]
#[command(
    name = "chromapsf",
    about = "Chromatic PSF fitting for slitless spectrograms",
    long_about = "Fits a wavelength-dependent point-spread function and per-column fluxes \
                 to a 2D spectrogram, and simulates spectrograms for testing."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a chromatic PSF to a spectrogram
    #[command(about = "Fit a chromatic PSF (outputs: profile_table.csv, chromatic_psf.toml, amplitudes.csv)")]
    Fit(FitArgs),

    /// Simulate a spectrogram with Poisson noise
    #[command(about = "Simulate a spectrogram (outputs: data.csv, errors.csv, truth.toml)")]
    Simulate(SimulateArgs),

    /// Write the default fit configuration
    #[command(about = "Write the default fit configuration as TOML")]
    WriteConfig {
        /// Destination file; printed to stdout when omitted
        #[arg(long, value_name = "PATH")]
        output: Option<PathBuf>,
    },

    /// Display version information
    Version,
}

#[derive(Args)]
struct FitArgs {
    /// Headerless CSV image, one transverse row per line
    #[arg(long, value_name = "PATH")]
    data: PathBuf,

    /// Headerless CSV of one-sigma errors with the same shape; `inf` excludes a pixel
    #[arg(long, value_name = "PATH")]
    errors: PathBuf,

    /// TOML fit configuration; defaults are used when omitted
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// PSF family: moffat, moffatgauss or gauss
    #[arg(long)]
    psf: Option<String>,

    /// Amplitude prior: noprior, positive, smooth, psf1d or fixed
    #[arg(long)]
    prior: Option<String>,

    /// Fit geometry: columns or full2d
    #[arg(long)]
    geometry: Option<String>,

    /// Minimizer: newton or bfgs
    #[arg(long)]
    method: Option<String>,

    /// Legendre degree of the shape parameters
    #[arg(long)]
    degree: Option<usize>,

    /// Saturation level; twice the data maximum when omitted
    #[arg(long)]
    saturation: Option<f64>,

    /// Flat background level subtracted before fitting
    #[arg(long)]
    background: Option<f64>,

    /// Directory receiving the outputs
    #[arg(long, value_name = "DIR")]
    output_dir: PathBuf,
}

#[derive(Args)]
struct SimulateArgs {
    #[arg(long, default_value = "60")]
    nx: usize,

    #[arg(long, default_value = "30")]
    ny: usize,

    /// PSF family: moffat, moffatgauss or gauss
    #[arg(long, default_value = "moffatgauss")]
    psf: String,

    #[arg(long, default_value = "2")]
    degree: usize,

    /// Peak per-column flux
    #[arg(long, default_value = "5000")]
    amplitude: f64,

    #[arg(long, default_value = "1e6")]
    saturation: f64,

    /// Flat background level added to the model
    #[arg(long, default_value = "0")]
    background: f64,

    /// Geometry used to render the model: columns or full2d
    #[arg(long, default_value = "columns")]
    geometry: String,

    #[arg(long, default_value = "42")]
    seed: u64,

    /// Directory receiving the outputs
    #[arg(long, value_name = "DIR")]
    output_dir: PathBuf,
}

fn run_fit(args: FitArgs) -> Result<(), Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => FitConfig::load(path)?,
        None => FitConfig::default(),
    };
    if let Some(kind) = &args.psf {
        config.psf_kind = kind.parse::<PsfKind>()?;
    }
    if let Some(prior) = &args.prior {
        config.prior = prior.parse::<AmplitudePrior>()?;
    }
    if let Some(geometry) = &args.geometry {
        config.geometry = geometry.parse::<FitGeometry>()?;
    }
    if let Some(method) = &args.method {
        config.minimizer.method = method.parse::<MinimizerMethod>()?;
    }
    if let Some(degree) = args.degree {
        config.degree = degree;
    }
    if args.saturation.is_some() {
        config.saturation = args.saturation;
    }

    println!("Loading spectrogram from: {}", args.data.display());
    let data = load_matrix(&args.data)?;
    let errors = load_matrix(&args.errors)?;
    let spectrogram = Spectrogram::new(data, errors, config.saturation)?;
    println!(
        "Loaded a {} x {} spectrogram (saturation {:.4e}).",
        spectrogram.ny(),
        spectrogram.nx(),
        spectrogram.saturation()
    );

    let background = args.background.map(FlatBackground);
    let fit = fit_chromatic_psf(
        &spectrogram,
        background.as_ref().map(|b| b as &dyn chromapsf::data::BackgroundModel),
        &config,
    )?;

    fs::create_dir_all(&args.output_dir)?;
    write_fit(&fit, &args.output_dir)?;
    println!(
        "Fit {} with chi2 = {:.4e}; {} outliers rejected. Results written to {}",
        fit.status,
        fit.chi2,
        fit.outliers.count(),
        args.output_dir.display()
    );
    Ok(())
}

fn write_fit(fit: &ChromaticFit, dir: &Path) -> Result<(), Box<dyn Error>> {
    save_profile_table(&fit.table, &dir.join("profile_table.csv"))?;
    ChromaticPsfRecord::from_psf(&fit.psf).save(&dir.join("chromatic_psf.toml"))?;

    let mut writer = csv::Writer::from_path(dir.join("amplitudes.csv"))?;
    writer.write_record(["column", "amplitude", "amplitude_err"])?;
    for (x, (a, e)) in fit
        .amplitudes
        .iter()
        .zip(fit.amplitude_errors.iter())
        .enumerate()
    {
        writer.write_record([x.to_string(), a.to_string(), e.to_string()])?;
    }
    writer.flush()?;
    Ok(())
}

fn run_simulate(args: SimulateArgs) -> Result<(), Box<dyn Error>> {
    let kind = args.psf.parse::<PsfKind>()?;
    let geometry = args.geometry.parse::<FitGeometry>()?;
    let mut chromatic = ChromaticPsf::new(
        kind,
        args.nx,
        args.ny,
        args.degree,
        BTreeMap::new(),
        args.saturation,
    )?;
    let truth = default_truth(&chromatic, args.amplitude)?;
    let synthetic = simulate(&chromatic, &truth, geometry, args.background, args.seed)?;
    chromatic.set_poly_params(truth)?;

    fs::create_dir_all(&args.output_dir)?;
    write_matrix(&args.output_dir.join("data.csv"), synthetic.spectrogram.data.view())?;
    write_matrix(
        &args.output_dir.join("errors.csv"),
        synthetic.spectrogram.errors.view(),
    )?;
    ChromaticPsfRecord::from_psf(&chromatic).save(&args.output_dir.join("truth.toml"))?;
    println!(
        "Simulated a {} x {} {} spectrogram with seed {} in {}",
        args.ny,
        args.nx,
        kind,
        args.seed,
        args.output_dir.display()
    );
    Ok(())
}

fn write_config(output: Option<PathBuf>) -> Result<(), Box<dyn Error>> {
    let config = FitConfig::default();
    match output {
        Some(path) => {
            config.save(&path)?;
            println!("Default configuration written to {}", path.display());
        }
        None => print!("{}", toml::to_string_pretty(&config)?),
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let Cli { command } = Cli::parse();

    let result = match command {
        Some(Commands::Fit(args)) => run_fit(args),
        Some(Commands::Simulate(args)) => run_simulate(args),
        Some(Commands::WriteConfig { output }) => write_config(output),
        Some(Commands::Version) => {
            println!("chromapsf {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => Cli::command()
            .print_help()
            .map(|_| println!())
            .map_err(|e| e.into()),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
