//! Tabular scoring: scaler + classifier held in one immutable context.

use crate::artifact::{read_artifact, HubSource};
use crate::classifier::{rank_importances, ClassProbabilities, Classifier, EyeState, TabularModel};
use crate::error::{Result, ValidationError};
use crate::features::{FeatureVector, FEATURE_COUNT, FEATURE_NAMES};
use crate::scaler::StandardScaler;
use ndarray::{Array2, ArrayView1, ArrayView2};
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

/// Class probabilities closer than this raise the low-confidence flag.
pub const LOW_CONFIDENCE_MARGIN: f64 = 0.10;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Prediction {
    pub state: EyeState,
    pub probabilities: ClassProbabilities,
}

impl Prediction {
    /// Label and confidence both come from this one distribution.
    pub fn from_probabilities(probabilities: ClassProbabilities) -> Self {
        Self {
            state: probabilities.state(),
            probabilities,
        }
    }

    /// Probability of the predicted class, in percent.
    pub fn confidence(&self) -> f64 {
        self.probabilities.get(self.state) * 100.0
    }

    pub fn is_low_confidence(&self) -> bool {
        self.probabilities.margin() < LOW_CONFIDENCE_MARGIN
    }
}

impl fmt::Display for Prediction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:.2}%)", self.state, self.confidence())
    }
}

pub struct ScoringContext {
    scaler: StandardScaler,
    model: TabularModel,
}

impl ScoringContext {
    pub fn new(scaler: StandardScaler, model: TabularModel) -> Self {
        Self { scaler, model }
    }

    /// Loads both artifacts; any failure here is fatal for the caller.
    pub fn load(scaler_path: &Path, model_path: &Path, hub: Option<&HubSource>) -> Result<Self> {
        let scaler = StandardScaler::from_json(&read_artifact(scaler_path, hub)?)?;
        debug!(path = %scaler_path.display(), "scaler loaded");
        let model = TabularModel::from_json(&read_artifact(model_path, hub)?)?;
        info!(path = %model_path.display(), kind = model.kind(), "classifier loaded");
        Ok(Self::new(scaler, model))
    }

    pub fn transform(&self, v: &FeatureVector) -> [f64; FEATURE_COUNT] {
        self.scaler.transform(v)
    }

    pub fn predict(&self, normalized: &[f64; FEATURE_COUNT]) -> Prediction {
        let p = self.model.predict_proba_row(ArrayView1::from(&normalized[..]));
        Prediction::from_probabilities(p)
    }

    pub fn score(&self, v: &FeatureVector) -> Prediction {
        let prediction = self.predict(&self.transform(v));
        if prediction.is_low_confidence() {
            warn!(
                closed = prediction.probabilities.closed,
                open = prediction.probabilities.open,
                "low confidence prediction"
            );
        }
        prediction
    }

    /// Scores an `(n, 14)` matrix of raw readings in one pass.
    ///
    /// The matrix must have one column per channel in canonical order and
    /// only finite cells.
    pub fn score_matrix(&self, raw: ArrayView2<f64>) -> Result<Vec<Prediction>> {
        if raw.ncols() != FEATURE_COUNT {
            return Err(ValidationError::Length {
                expected: FEATURE_COUNT,
                actual: raw.ncols(),
            }
            .into());
        }
        if let Some(((_, col), _)) = raw.indexed_iter().find(|(_, v)| !v.is_finite()) {
            return Err(ValidationError::NonFinite(FEATURE_NAMES[col].to_string()).into());
        }
        let normalized: Array2<f64> = self.scaler.transform_batch(raw);
        let proba = self.model.predict_proba(normalized.view());
        Ok(proba
            .outer_iter()
            .map(|p| {
                Prediction::from_probabilities(ClassProbabilities {
                    closed: p[0],
                    open: p[1],
                })
            })
            .collect())
    }

    pub fn feature_importance(&self) -> Vec<(&'static str, f64)> {
        rank_importances(&self.model.feature_importances())
    }
}
