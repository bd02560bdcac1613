//! Declarative configuration (§6 Configuration): paths, scheduler knobs,
//! pre/post-run hooks, environment overrides, and the version checker's
//! network proxy.

use std::collections::HashMap;

use camino::Utf8PathBuf;
use color_eyre::eyre::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub lilac: LilacConfig,
    #[serde(default)]
    pub misc: MiscConfig,
    #[serde(default)]
    pub envvars: HashMap<String, String>,
    #[serde(default)]
    pub nvchecker: NvcheckerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub repodir: Utf8PathBuf,
    pub destdir: Utf8PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LilacConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub git_push: bool,
    #[serde(default)]
    pub rebuild_failed_pkgs: bool,
    pub dburl: Option<String>,
    pub schema: Option<String>,
}

impl Default for LilacConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            max_concurrency: default_max_concurrency(),
            git_push: false,
            rebuild_failed_pkgs: false,
            dburl: None,
            schema: None,
        }
    }
}

fn default_name() -> String {
    "lilac".to_string()
}

fn default_max_concurrency() -> usize {
    num_cpus::get()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MiscConfig {
    pub pacman_conf: Option<Utf8PathBuf>,
    #[serde(default)]
    pub prerun: Vec<Vec<String>>,
    #[serde(default)]
    pub postrun: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NvcheckerConfig {
    pub proxy: Option<String>,
}

impl Config {
    pub async fn load(path: &camino::Utf8Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file at {path}"))?;
        toml::from_str(&contents).with_context(|| format!("Failed to parse config file at {path}"))
    }

    /// Default location for the state directory (`store`, `build.log`,
    /// per-batch logs) when not overridden.
    pub fn default_state_dir() -> Result<Utf8PathBuf> {
        let dirs = directories::ProjectDirs::from("", "", "lilac")
            .context("Could not determine a home directory for the default state path")?;
        Utf8PathBuf::from_path_buf(dirs.data_local_dir().to_path_buf())
            .map_err(|p| color_eyre::eyre::eyre!("State directory path {p:?} is not valid UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("lilac.toml")).unwrap();
        tokio::fs::write(
            &path,
            r#"
            [repository]
            repodir = "/srv/repo"
            destdir = "/srv/dest"
            "#,
        )
        .await
        .unwrap();

        let config = Config::load(&path).await.unwrap();
        assert_eq!(config.repository.repodir, Utf8PathBuf::from("/srv/repo"));
        assert_eq!(config.lilac.name, "lilac");
        assert!(!config.lilac.git_push);
    }
}
