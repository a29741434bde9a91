use crate::artifact::HubSource;
use crate::vision::TensorLayout;
use serde::{Deserialize, Serialize};
use std::{env, fs, io, path::PathBuf};
use tracing::{debug, warn};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub scaler_path: PathBuf,
    pub model_path: PathBuf,
    /// Hugging Face repository consulted when a local artifact is missing.
    pub hub_repo: Option<String>,
    pub input_range: InputRange,
    pub vision: VisionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scaler_path: PathBuf::from("scaler.json"),
            model_path: PathBuf::from("eye_state_model.json"),
            hub_repo: None,
            input_range: InputRange::default(),
            vision: VisionConfig::default(),
        }
    }
}

impl Config {
    pub fn hub(&self) -> Option<HubSource> {
        self.hub_repo.clone().map(|repo| HubSource { repo })
    }
}

/// Accepted range for manually entered readings.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct InputRange {
    pub min: f64,
    pub max: f64,
}

impl Default for InputRange {
    fn default() -> Self {
        Self {
            min: -5.0,
            max: 10.0,
        }
    }
}

impl InputRange {
    pub fn contains(&self, value: f64) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct VisionConfig {
    pub model_path: PathBuf,
    pub cascade_path: PathBuf,
    pub camera_index: u32,
    pub layout: TensorLayout,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("eye_state_cnn.onnx"),
            cascade_path: PathBuf::from("haarcascade_eye.xml"),
            camera_index: 0,
            layout: TensorLayout::Nhwc,
        }
    }
}

pub fn config_path() -> PathBuf {
    env::var_os("EYESTATE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("eyestate.json"))
}

pub fn load_config() -> Config {
    let path = config_path();
    match fs::read(&path) {
        Ok(data) => match serde_json::from_slice(&data) {
            Ok(cfg) => {
                debug!(path = %path.display(), "configuration loaded");
                cfg
            }
            Err(e) => {
                warn!("ignoring malformed config {}: {e}", path.display());
                Config::default()
            }
        },
        Err(_) => Config::default(),
    }
}

pub fn save_config(cfg: &Config) -> io::Result<PathBuf> {
    let path = config_path();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_vec_pretty(cfg)?;
    fs::write(&path, data)?;
    Ok(path)
}
