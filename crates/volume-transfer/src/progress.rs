//! Copy progress parsing and the progress file

use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::error::Result;

static PROGRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\((\d+(?:\.\d+)?)/100%\)").expect("progress pattern is valid")
});

/// Last progress percentage in a line of `qemu-img convert -p` output
pub fn parse_progress(line: &str) -> Option<f64> {
    PROGRESS
        .captures_iter(line)
        .filter_map(|caps| caps[1].parse::<f64>().ok())
        .last()
        .map(|value| value.clamp(0.0, 100.0))
}

/// JSON file mapping each volume key to its last known progress
#[derive(Debug, Clone)]
pub struct ProgressFile {
    path: PathBuf,
}

impl ProgressFile {
    /// Progress file at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the file content atomically
    pub async fn write(&self, progress: &BTreeMap<String, Option<f64>>) -> Result<()> {
        let json = serde_json::to_vec_pretty(progress)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        async_fs::write(&tmp, json).await?;
        async_fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Read the file back
    pub async fn read(&self) -> Result<BTreeMap<String, Option<f64>>> {
        let data = async_fs::read(&self.path).await?;
        Ok(serde_json::from_slice(&data)?)
    }
}
