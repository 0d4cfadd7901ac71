use polars::prelude::*;
use std::{
    collections::BTreeSet,
    env,
    fs::{self, File},
    io::BufWriter,
    path::{Path, PathBuf},
};

use clap::{CommandFactory, Parser, Subcommand};
use indicatif::ProgressIterator;
use omnifold::{
    io::{write_history_csv, write_sample_csv, write_weights_csv},
    toy::{toy_observables, ToyConfig},
    BackgroundMode, ClassifierRegistry, DataHandler, Ensemble, ErrorMode, EventStore,
    FrameHandler, IterationHistory, ObservableConfig, OmniFold, ReweighterRegistry, Sample,
    StoredWeights, UncertaintyEstimator, UnfoldConfig, UnfoldError, WeightProvider,
};
use rand::{rngs::StdRng, SeedableRng};
use serde_json::json;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a Gaussian closure-test input set
    Toy {
        output: PathBuf,
        #[arg(short, long, value_name = "NSIG", default_value_t = 10000)]
        signal: usize,
        #[arg(short, long, value_name = "NDATA", default_value_t = 10000)]
        data: usize,
        #[arg(short, long, value_name = "NBKG", default_value_t = 0)]
        background: usize,
        /// Weight of each background simulation event
        #[arg(long, default_value_t = 0.1)]
        background_weight: f64,
        /// Shift of the data truth means relative to the simulation
        #[arg(long, default_value_t = 0.3)]
        shift: f64,
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// Unfold observed data with a signal simulation
    Unfold {
        /// Observables used in training
        #[arg(long, num_args = 1.., default_values_t = [
            "th_pt", "th_y", "th_phi", "th_e", "tl_pt", "tl_y", "tl_phi", "tl_e"
        ].map(String::from))]
        observables_train: Vec<String>,
        /// JSON configuration of the observables
        #[arg(long, default_value = "configs/observables/vars_ttbardiffXs.json")]
        observable_config: PathBuf,
        /// Observed data CSV files
        #[arg(short, long, required = true, num_args = 1..)]
        data: Vec<PathBuf>,
        /// Signal simulation CSV files
        #[arg(short, long, required = true, num_args = 1..)]
        signal: Vec<PathBuf>,
        /// Background simulation CSV files
        #[arg(short, long, num_args = 1..)]
        background: Vec<PathBuf>,
        /// Background simulation files mixed into the observed data
        #[arg(long, num_args = 1..)]
        bdata: Vec<PathBuf>,
        #[arg(short, long, default_value = "./output")]
        outputdir: PathBuf,
        /// Truth is known for the observed data
        #[arg(short, long)]
        truth_known: bool,
        #[arg(short, long, default_value_t = 4)]
        iterations: usize,
        /// Name of the event weight column
        #[arg(long, default_value = "weight")]
        weight: String,
        /// Name of the detector-level selection flag column
        #[arg(long, default_value = "pass_reco")]
        pass_reco: String,
        #[arg(short = 'm', long, default_value = "default")]
        background_mode: BackgroundMode,
        /// Stress-test reweighting of the observed spectrum
        #[arg(short, long)]
        reweight_data: Option<String>,
        /// Weights CSV to use instead of training
        #[arg(long)]
        unfolded_weights: Option<PathBuf>,
        #[arg(long, default_value_t = 25)]
        nresamples: usize,
        #[arg(short, long, default_value = "sumw2")]
        error_type: ErrorMode,
        #[arg(long, default_value = "logistic")]
        model_name: String,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        #[arg(long, default_value_t = 0.2)]
        validation_split: f64,
        /// Train every iteration from scratch instead of the previous fit
        #[arg(long)]
        cold_start: bool,
        /// Run configuration JSON, used in place of the run flags above
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn load_sample(
    name: &str,
    paths: &[PathBuf],
    variables: &[String],
    weight: &str,
    pass_reco: &str,
) -> Result<Sample, Box<dyn std::error::Error>> {
    let handler = FrameHandler::from_csv_files(paths)?;
    let weight_name = if handler.contains(weight) {
        Some(weight)
    } else {
        warn!(sample = name, column = weight, "no weight column, using unit weights");
        None
    };
    let validity_name = handler.contains(pass_reco).then_some(pass_reco);
    let sample = Sample::from_handler(name, &handler, variables, weight_name, validity_name)?;
    info!(sample = name, events = sample.len(), files = paths.len(), "loaded");
    Ok(sample)
}

fn union(lists: &[&[String]]) -> Vec<String> {
    lists.iter().flat_map(|l| l.iter().cloned()).collect::<BTreeSet<_>>().into_iter().collect()
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), Box<dyn std::error::Error>> {
    serde_json::to_writer_pretty(BufWriter::new(File::create(path)?), value)?;
    Ok(())
}

/// Per-iteration weight statistics, with the bootstrap spread of the total
/// when there are trials.
fn summary(
    history: &IterationHistory,
    ensemble: Option<&Ensemble>,
) -> Result<DataFrame, Box<dyn std::error::Error>> {
    let mut iterations: Vec<u32> = Vec::new();
    let mut weights: Vec<f64> = Vec::new();
    for record in history.records() {
        iterations.extend(std::iter::repeat(record.iteration as u32).take(record.truth_weights.len()));
        weights.extend_from_slice(&record.truth_weights);
    }
    let nominal = df!("Iteration" => iterations, "Weight" => weights)?
        .lazy()
        .group_by_stable([col("Iteration")])
        .agg([
            col("Weight").sum().alias("Sum"),
            col("Weight").mean().alias("Mean"),
            col("Weight").std(1).alias("Std"),
            col("Weight").min().alias("Min"),
            col("Weight").max().alias("Max"),
        ]);
    let Some(ensemble) = ensemble.filter(|e| !e.trials.is_empty()) else {
        return Ok(nominal.collect()?);
    };

    let mut iterations: Vec<u32> = Vec::new();
    let mut sums: Vec<f64> = Vec::new();
    for member in &ensemble.trials {
        for iteration in member.history.iterations() {
            iterations.push(iteration as u32);
            sums.push(member.folded_weights(iteration)?.iter().sum());
        }
    }
    let spread = df!("Iteration" => iterations, "TrialSum" => sums)?
        .lazy()
        .group_by_stable([col("Iteration")])
        .agg([col("TrialSum").std(1).alias("Sum_std")]);
    Ok(nominal
        .join(spread, [col("Iteration")], [col("Iteration")], JoinArgs::default())
        .collect()?)
}

fn write_ensemble(dir: &Path, ensemble: &Ensemble) -> Result<(), Box<dyn std::error::Error>> {
    fs::create_dir_all(dir)?;
    for member in ensemble.trials.iter().progress() {
        let columns = member
            .history
            .iterations()
            .map(|iteration| {
                Ok((format!("iteration_{iteration}"), member.folded_weights(iteration)?))
            })
            .collect::<omnifold::Result<Vec<_>>>()?;
        let trial = member.trial.unwrap_or_default();
        write_weights_csv(&dir.join(format!("trial_{trial}.csv")), &columns)?;
    }
    let manifest = json!({
        "mode": ensemble.mode,
        "nominal_seed": ensemble.nominal.seed,
        "trials": ensemble
            .trials
            .iter()
            .map(|m| json!({ "trial": m.trial, "seed": m.seed }))
            .collect::<Vec<_>>(),
        "failures": ensemble.failures,
    });
    write_json(&dir.join("seeds.json"), &manifest)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    tracing_subscriber::fmt().with_max_level(cli.log_level).with_target(false).init();
    match cli.command {
        Some(Commands::Toy { output, signal, data, background, background_weight, shift, seed }) => {
            fs::create_dir_all(&output)?;
            let mut rng = StdRng::seed_from_u64(seed);
            let toy = ToyConfig::default();
            let sim = toy.generate_signal("signal", signal, [0.0, 0.0], &mut rng)?;
            let mut observed = toy.generate_signal("data", data, [shift, shift], &mut rng)?;
            if background > 0 {
                let bkg =
                    toy.generate_background("background", background, background_weight, &mut rng)?;
                let n_mixed = (background as f64 * background_weight).round() as usize;
                let mixed = toy.generate_background("data", n_mixed, 1.0, &mut rng)?;
                observed = observed.concat(&mixed, "data")?;
                write_sample_csv(&output.join("background.csv"), &bkg, "weight", "pass_reco")?;
            }
            write_sample_csv(&output.join("data.csv"), &observed, "weight", "pass_reco")?;
            write_sample_csv(&output.join("signal.csv"), &sim, "weight", "pass_reco")?;
            write_json(&output.join("observables.json"), &toy_observables())?;
            println!("Wrote toy samples to {:?}", output);
        }
        Some(Commands::Unfold {
            observables_train,
            observable_config,
            data,
            signal,
            background,
            bdata,
            outputdir,
            truth_known,
            iterations,
            weight,
            pass_reco,
            background_mode,
            reweight_data,
            unfolded_weights,
            nresamples,
            error_type,
            model_name,
            seed,
            validation_split,
            cold_start,
            config,
        }) => {
            let config = match config {
                Some(path) => UnfoldConfig::from_json_file(&path)?,
                None => UnfoldConfig::default()
                    .with_iterations(iterations)
                    .with_background_mode(background_mode)
                    .with_error_mode(error_type)
                    .with_nresamples(nresamples)
                    .with_seed(seed)
                    .with_validation_split(validation_split)
                    .with_model_name(model_name)
                    .with_warm_start(!cold_start),
            };
            config.validate()?;
            info!(observables = %observables_train.join(", "), "observables used for training");

            let observables = ObservableConfig::from_json_file(&observable_config)?;
            let (vars_det, vars_mc) = observables.resolve(&observables_train)?;
            let reweighters = ReweighterRegistry::standard();
            let rw_truth = match &reweight_data {
                Some(name) => {
                    let names: Vec<String> =
                        reweighters.get(name)?.observables.iter().map(|s| s.to_string()).collect();
                    observables.resolve(&names)?.1
                }
                None => Vec::new(),
            };
            let truth_on_data: &[String] = if truth_known { &vars_mc } else { &[] };

            let mut observed = load_sample(
                "data",
                &data,
                &union(&[&vars_det, truth_on_data, &rw_truth]),
                &weight,
                &pass_reco,
            )?;
            if let Some(name) = &reweight_data {
                observed = reweighters.apply(name, &observed, &observables)?;
            }
            if !bdata.is_empty() {
                let mixed = load_sample("bdata", &bdata, &vars_det, &weight, &pass_reco)?;
                observed = observed.concat(&mixed, "data")?;
            }
            let sim = load_sample(
                "signal",
                &signal,
                &union(&[&vars_det, &vars_mc]),
                &weight,
                &pass_reco,
            )?;
            let bkg = if background.is_empty() {
                None
            } else {
                Some(load_sample("background", &background, &vars_det, &weight, &pass_reco)?)
            };
            let store = EventStore::new(observed, sim, bkg, vars_det, vars_mc)?;

            fs::create_dir_all(&outputdir)?;
            config.to_json_file(&outputdir.join("config.json"))?;
            let engine = OmniFold::from_registry(config, &ClassifierRegistry::standard())?;
            let stored = unfolded_weights
                .as_deref()
                .map(|path| StoredWeights::from_csv(path, None))
                .transpose()?;
            let provider: &dyn WeightProvider = match &stored {
                Some(weights) => weights,
                None => &engine,
            };
            let history = provider.provide(&store)?;
            write_history_csv(&outputdir.join("weights.csv"), &history)?;
            history.to_json_file(&outputdir.join("history.json"))?;

            let ensemble = if stored.is_some() {
                info!("stored weights given, no bootstrap");
                None
            } else {
                let ensemble = UncertaintyEstimator::new(&engine)
                    .with_progress(true)
                    .estimate(&store, history.clone())?;
                if !ensemble.trials.is_empty() || ensemble.is_partial() {
                    write_ensemble(&outputdir.join("bootstrap"), &ensemble)?;
                }
                if ensemble.trials.is_empty() && ensemble.is_partial() {
                    let failed = ensemble.failures.len();
                    return Err(UnfoldError::BootstrapFailed { failed }.into());
                }
                Some(ensemble)
            };

            let table = summary(&history, ensemble.as_ref())?;
            env::set_var("POLARS_FMT_TABLE_ROUNDED_CORNERS", "1");
            env::set_var("POLARS_FMT_MAX_COLS", "-1");
            env::set_var("POLARS_FMT_MAX_ROWS", "-1");
            env::set_var("POLARS_FMT_STR_LEN", "50");
            println!("{}", table);
            println!("Writing result to {:?}", outputdir);
        }
        None => Cli::command().print_help()?,
    }
    Ok(())
}
