//! Iterative classifier-based unfolding (OmniFold).
//!
//! Observed detector-level events are unfolded into weights on the
//! particle-level (truth) events of a signal simulation. Each iteration runs
//! two classifier trainings:
//!
//! 1. observed data against simulation at detector level, whose likelihood
//!    ratio pushes simulation weights toward data;
//! 2. pushed against prior weights at truth level, whose likelihood ratio
//!    pulls the push back onto the truth events.
//!
//! Background simulation enters step 1 under one of three
//! [`BackgroundMode`]s. The [`UncertaintyEstimator`] repeats the sequence on
//! bootstrap resamples.
//!
//! ```no_run
//! use omnifold::{
//!     ClassifierRegistry, EventStore, OmniFold, UnfoldConfig, UncertaintyEstimator,
//!     WeightProvider,
//! };
//! # fn run(store: EventStore) -> omnifold::Result<()> {
//! let engine = OmniFold::from_registry(UnfoldConfig::default(), &ClassifierRegistry::standard())?;
//! let history = engine.provide(&store)?;
//! let ensemble = UncertaintyEstimator::new(&engine).estimate(&store, history)?;
//! println!("{} ensemble members", ensemble.len());
//! # Ok(())
//! # }
//! ```

pub mod background;
pub mod bootstrap;
pub mod classifier;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod history;
pub mod io;
pub mod ratio;
pub mod reweighters;
pub mod toy;

pub use crate::background::BackgroundMode;
pub use crate::bootstrap::{Ensemble, EnsembleMember, ErrorMode, TrialFailure, UncertaintyEstimator};
pub use crate::classifier::{
    Classifier, ClassifierRegistry, KnnClassifier, LogisticClassifier, Predictor, TrainOptions,
    TrainingOutcome, TrainingReport,
};
pub use crate::config::UnfoldConfig;
pub use crate::data::{DataHandler, EventStore, FeatureMatrix, ObservableConfig, Sample, SampleView};
pub use crate::engine::{OmniFold, StoredWeights, WeightProvider};
pub use crate::error::{Result, UnfoldError};
pub use crate::history::{HistorySource, IterationHistory, IterationRecord, StepDiagnostics};
pub use crate::io::FrameHandler;
pub use crate::ratio::ClipStats;
pub use crate::reweighters::{Reweighter, ReweighterRegistry};
