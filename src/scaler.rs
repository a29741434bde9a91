use crate::error::{Error, Result};
use crate::features::{FeatureVector, FEATURE_COUNT, FEATURE_NAMES};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::Deserialize;

#[derive(Deserialize)]
struct ScalerFile {
    #[serde(default)]
    feature_names: Option<Vec<String>>,
    mean: Vec<f64>,
    scale: Vec<f64>,
}

/// Pre-fit standardization: `(x - mean) / scale` per channel.
#[derive(Clone, Debug)]
pub struct StandardScaler {
    mean: Array1<f64>,
    scale: Array1<f64>,
}

impl StandardScaler {
    pub fn new(mean: Vec<f64>, scale: Vec<f64>) -> Result<Self> {
        if mean.len() != FEATURE_COUNT || scale.len() != FEATURE_COUNT {
            return Err(Error::Configuration(format!(
                "scaler expects {FEATURE_COUNT} channels, got mean={} scale={}",
                mean.len(),
                scale.len()
            )));
        }
        if let Some(i) = mean.iter().position(|m| !m.is_finite()) {
            return Err(Error::Configuration(format!(
                "scaler mean for {} is not finite",
                FEATURE_NAMES[i]
            )));
        }
        if let Some(i) = scale.iter().position(|s| !s.is_finite() || *s == 0.0) {
            return Err(Error::Configuration(format!(
                "scaler scale for {} must be finite and non-zero",
                FEATURE_NAMES[i]
            )));
        }
        Ok(Self {
            mean: Array1::from(mean),
            scale: Array1::from(scale),
        })
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        let file: ScalerFile = serde_json::from_slice(data)
            .map_err(|e| Error::Configuration(format!("invalid scaler: {e}")))?;
        if let Some(names) = &file.feature_names {
            if names.iter().map(String::as_str).ne(FEATURE_NAMES.iter().copied()) {
                return Err(Error::Configuration(
                    "scaler feature names do not match the channel order".into(),
                ));
            }
        }
        Self::new(file.mean, file.scale)
    }

    pub fn transform(&self, v: &FeatureVector) -> [f64; FEATURE_COUNT] {
        let mut out = [0.0; FEATURE_COUNT];
        for (i, x) in v.as_slice().iter().enumerate() {
            out[i] = (x - self.mean[i]) / self.scale[i];
        }
        out
    }

    /// Transforms every row of an `(n, 14)` matrix at once.
    pub fn transform_batch(&self, rows: ArrayView2<f64>) -> Array2<f64> {
        let mean = self.mean.view().insert_axis(Axis(0));
        let scale = self.scale.view().insert_axis(Axis(0));
        (&rows - &mean) / &scale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scaler() -> StandardScaler {
        let mean = (0..FEATURE_COUNT).map(|i| i as f64).collect();
        StandardScaler::new(mean, vec![2.0; FEATURE_COUNT]).unwrap()
    }

    #[test]
    fn transform_uses_fitted_parameters() {
        let v = FeatureVector::zeros();
        let out = scaler().transform(&v);
        assert_eq!(out[0], 0.0);
        assert_eq!(out[4], -2.0);
    }

    #[test]
    fn batch_matches_single() {
        let s = scaler();
        let v = FeatureVector::from_slice(&[3.0; FEATURE_COUNT]).unwrap();
        let rows = Array2::from_shape_vec((1, FEATURE_COUNT), v.as_slice().to_vec()).unwrap();
        let batch = s.transform_batch(rows.view());
        assert_eq!(batch.row(0).to_vec(), s.transform(&v).to_vec());
    }

    #[test]
    fn zero_scale_is_rejected() {
        let mut scale = vec![1.0; FEATURE_COUNT];
        scale[3] = 0.0;
        let err = StandardScaler::new(vec![0.0; FEATURE_COUNT], scale).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn json_with_wrong_names_is_rejected() {
        let json = serde_json::json!({
            "feature_names": vec!["a"; FEATURE_COUNT],
            "mean": vec![0.0; FEATURE_COUNT],
            "scale": vec![1.0; FEATURE_COUNT],
        });
        let err = StandardScaler::from_json(json.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn batch_broadcasts_rows() {
        let s = StandardScaler::new(vec![1.0; FEATURE_COUNT], vec![0.5; FEATURE_COUNT]).unwrap();
        let rows = Array2::from_elem((2, FEATURE_COUNT), 2.0);
        let out = s.transform_batch(rows.view());
        assert_eq!(out.dim(), (2, FEATURE_COUNT));
        assert_eq!(out.row(1)[0], 2.0);
    }
}
