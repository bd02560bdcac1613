//! Persisted batch state: the `store` file (§6 Persisted state), and the
//! structured/human build logs written alongside it.

use std::collections::HashMap;

use camino::Utf8Path;
use color_eyre::eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{CommitHash, FailedMap};

/// `{last_commit, failed}`, serialized as a single JSON file in the state
/// directory between invocations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchState {
    pub last_commit: Option<CommitHash>,
    #[serde(default)]
    pub failed: FailedMap,
}

impl BatchState {
    pub async fn load(path: &Utf8Path) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => {
                serde_json::from_str(&contents).with_context(|| format!("Failed to parse store file at {path}"))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("Failed to read store file at {path}")),
        }
    }

    pub async fn save(&self, path: &Utf8Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        let contents = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, contents)
            .await
            .with_context(|| format!("Failed to write store file at {path}"))
    }
}

/// A single line of the structured `build-log.json`.
#[derive(Debug, Clone, Serialize)]
pub struct BuildLogEvent {
    pub logger_name: String,
    pub event: String,
    pub pkgbase: String,
    pub nv_version: Option<String>,
    pub pkg_version: Option<String>,
    pub elapsed: f64,
    pub msg: String,
}

/// Appends one line to `build-log.json` and mirrors a human-readable line
/// to `build.log`.
pub struct BuildLog {
    pub json_path: camino::Utf8PathBuf,
    pub human_path: camino::Utf8PathBuf,
}

impl BuildLog {
    pub async fn append(&self, event: &BuildLogEvent) -> Result<()> {
        let json_line = serde_json::to_string(event)?;
        append_line(&self.json_path, &json_line).await?;

        let human_line = format!(
            "{} {} {} elapsed={:.1}s {}",
            event.event, event.pkgbase, event.pkg_version.as_deref().unwrap_or("?"), event.elapsed, event.msg
        );
        append_line(&self.human_path, &human_line).await
    }
}

async fn append_line(path: &camino::Utf8Path, line: &str) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to open log file at {path}"))?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    Ok(())
}

/// Per-package, per-batch log directory: `log/<ISO8601>/<pkgbase>.log`.
pub fn batch_logdir(state_dir: &Utf8Path, started_at: time::OffsetDateTime) -> Result<camino::Utf8PathBuf> {
    let stamp = started_at
        .format(&time::format_description::well_known::Iso8601::DEFAULT)
        .context("Failed to format batch timestamp")?;
    Ok(state_dir.join("log").join(stamp))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("store")).unwrap();

        let mut failed = HashMap::new();
        failed.insert("a".into(), vec!["libfoo".to_string()]);
        let state = BatchState {
            last_commit: Some(CommitHash::from("deadbeef".to_string())),
            failed,
        };
        state.save(&path).await.unwrap();

        let loaded = BatchState::load(&path).await.unwrap();
        assert_eq!(loaded.last_commit, state.last_commit);
        assert_eq!(loaded.failed, state.failed);
    }

    #[tokio::test]
    async fn missing_store_file_loads_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("nonexistent")).unwrap();
        let loaded = BatchState::load(&path).await.unwrap();
        assert!(loaded.last_commit.is_none());
        assert!(loaded.failed.is_empty());
    }
}
