use crate::error::{Error, Result};
use hf_hub::api::sync::Api;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// Hugging Face Hub repository used when a local artifact is absent.
#[derive(Clone, Debug, PartialEq)]
pub struct HubSource {
    pub repo: String,
}

/// Returns a local path for the artifact, downloading it when needed.
pub fn resolve_artifact(path: &Path, hub: Option<&HubSource>) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    let Some(hub) = hub else {
        return Err(Error::ArtifactMissing(path.to_path_buf()));
    };
    let filename = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .ok_or_else(|| Error::ArtifactMissing(path.to_path_buf()))?;
    debug!(repo = %hub.repo, %filename, "fetching artifact from hub");
    match Api::new().and_then(|api| api.model(hub.repo.clone()).get(&filename)) {
        Ok(p) => Ok(p),
        Err(e) => {
            error!("failed to download {filename}: {e}");
            Err(Error::Configuration(format!(
                "{filename} not found locally and download from {} failed: {e}",
                hub.repo
            )))
        }
    }
}

pub fn read_artifact(path: &Path, hub: Option<&HubSource>) -> Result<Vec<u8>> {
    let resolved = resolve_artifact(path, hub)?;
    std::fs::read(&resolved).map_err(|e| {
        Error::Configuration(format!("failed to read {}: {e}", resolved.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn local_file_wins() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scaler.json");
        std::fs::write(&path, b"{}").unwrap();
        assert_eq!(resolve_artifact(&path, None).unwrap(), path);
        assert_eq!(read_artifact(&path, None).unwrap(), b"{}");
    }

    #[test]
    fn missing_without_hub_is_fatal() {
        let dir = tempdir().unwrap();
        let err = resolve_artifact(&dir.path().join("absent.json"), None).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("absent.json"));
    }
}
