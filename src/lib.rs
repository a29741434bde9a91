pub mod artifact;
pub mod batch;
pub mod camera;
pub mod cascade;
pub mod classifier;
pub mod cli;
pub mod config;
pub mod error;
pub mod features;
pub mod pipeline;
pub mod scaler;
pub mod vision;

pub use batch::{score_table, BatchTable, PREDICTION_COLUMN};
pub use classifier::{ClassProbabilities, Classifier, EyeState, TabularModel};
pub use cli::{execute, run_cli, Cli, Commands};
pub use config::{load_config, Config};
pub use error::{Error, Result, ValidationError};
pub use features::{FeatureVector, FEATURE_COUNT, FEATURE_NAMES};
pub use pipeline::{Prediction, ScoringContext};
pub use scaler::StandardScaler;
pub use vision::{state_for_score, VisionLoop};
