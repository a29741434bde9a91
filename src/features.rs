use crate::error::{Result, ValidationError};
use serde::{Deserialize, Serialize};

pub const FEATURE_COUNT: usize = 14;

/// Canonical EEG channel order. Artifacts and CSV columns follow it.
pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "AF3", "F7", "F3", "FC5", "T7", "P7", "O1", "O2", "P8", "T8", "FC6", "F4", "F8", "AF4",
];

pub fn feature_index(name: &str) -> Option<usize> {
    FEATURE_NAMES.iter().position(|n| *n == name)
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct FeatureVector([f64; FEATURE_COUNT]);

impl FeatureVector {
    pub fn zeros() -> Self {
        Self([0.0; FEATURE_COUNT])
    }

    pub fn from_slice(values: &[f64]) -> Result<Self> {
        if values.len() != FEATURE_COUNT {
            return Err(ValidationError::Length {
                expected: FEATURE_COUNT,
                actual: values.len(),
            }
            .into());
        }
        if let Some(i) = values.iter().position(|v| !v.is_finite()) {
            return Err(ValidationError::NonFinite(FEATURE_NAMES[i].to_string()).into());
        }
        let mut out = [0.0; FEATURE_COUNT];
        out.copy_from_slice(values);
        Ok(Self(out))
    }

    /// Builds a vector from named readings; channels not listed stay at 0.0.
    pub fn from_named<'a, I>(readings: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        let mut values = [0.0; FEATURE_COUNT];
        for (name, value) in readings {
            let idx = feature_index(name)
                .ok_or_else(|| ValidationError::UnknownChannel(name.to_string()))?;
            values[idx] = value;
        }
        Self::from_slice(&values)
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        feature_index(name).map(|i| self.0[i])
    }
}

impl TryFrom<Vec<f64>> for FeatureVector {
    type Error = crate::error::Error;

    fn try_from(values: Vec<f64>) -> Result<Self> {
        Self::from_slice(&values)
    }
}

impl From<FeatureVector> for Vec<f64> {
    fn from(v: FeatureVector) -> Self {
        v.0.to_vec()
    }
}
