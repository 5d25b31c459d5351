use std::path::{Path, PathBuf};

use directories_next::ProjectDirs;
use serde::Serialize;
use serde::de::DeserializeOwned;

pub struct ConsolePaths {
    state_dir: PathBuf,
}

impl ConsolePaths {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    /// Resolves `--state-dir`, falling back to the platform data directory and
    /// then to `./.gateway-console`.
    pub fn resolve(explicit: Option<&Path>) -> Self {
        if let Some(path) = explicit {
            return Self::new(path);
        }
        let state_dir = ProjectDirs::from("io", "gateway-console", "gateway-console")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".gateway-console"));
        Self::new(state_dir)
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn store_dir(&self) -> PathBuf {
        self.state_dir.join("store")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn key_path(&self, key: &str) -> PathBuf {
        self.store_dir().join(format!("{key}.json"))
    }
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &bytes)
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read(path)?;
    let value = serde_json::from_slice(&data)?;
    Ok(Some(value))
}

pub fn atomic_write(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.to_path_buf();
    tmp.set_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    if path.exists() {
        let _ = std::fs::remove_file(path);
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}
