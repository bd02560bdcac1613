//! Upstream version-change signals (§1 version checker, §9 SUPPLEMENT).
//!
//! Out of scope for the core scheduling logic: this module only defines
//! the interface the batch controller needs, plus a default implementation
//! that shells out to the `nvchecker` tool the way the teacher's
//! `build_package.rs` shells out to `pkgctl`.

use std::collections::{HashMap, HashSet};
use std::process::Stdio;

use color_eyre::eyre::{Context, Result};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::reason::NvSourceChange;
use crate::Pkgbase;

#[derive(Debug, Clone, Default)]
pub struct VersionCheckOutcome {
    pub nvdata: HashMap<Pkgbase, Vec<NvSourceChange>>,
    /// Packages whose version check failed outright; excluded from
    /// `need_rebuild_pkgrel` per §4.1 item 2.
    pub unknown: HashSet<Pkgbase>,
}

#[async_trait::async_trait]
pub trait VersionChecker: Send + Sync {
    async fn check(&self, pkgs: &[Pkgbase]) -> Result<VersionCheckOutcome>;

    /// Acknowledges versions to the checker's own cache (`nvtake`) so that
    /// a source already reflected in a successful or attempted build stops
    /// re-triggering every batch (§4.8 step 9).
    async fn acknowledge(&self, pkgs: &[Pkgbase]) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct NvcheckerLine {
    name: String,
    version: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Runs the `nvchecker` executable against the managed set and parses its
/// JSON Lines output. Old versions are supplied by the caller (read from
/// the previous batch's persisted `store`), since `nvchecker` itself is
/// stateless between invocations here.
pub struct NvcheckerProcessChecker {
    pub config_path: camino::Utf8PathBuf,
    pub proxy: Option<String>,
    pub old_versions: HashMap<Pkgbase, String>,
}

#[async_trait::async_trait]
impl VersionChecker for NvcheckerProcessChecker {
    async fn check(&self, pkgs: &[Pkgbase]) -> Result<VersionCheckOutcome> {
        let mut cmd = Command::new("nvchecker");
        cmd.arg("-c").arg(self.config_path.as_str());
        cmd.arg("--logger").arg("json");
        if let Some(proxy) = &self.proxy {
            cmd.env("http_proxy", proxy).env("https_proxy", proxy);
        }
        cmd.stdout(Stdio::piped());

        let mut child = cmd.spawn().context("Failed to spawn nvchecker")?;
        let stdout = child.stdout.take().expect("stdout was piped");
        let mut lines = BufReader::new(stdout).lines();

        let mut outcome = VersionCheckOutcome::default();
        while let Some(line) = lines.next_line().await? {
            let Ok(parsed) = serde_json::from_str::<NvcheckerLine>(&line) else {
                continue;
            };
            let pkgbase: Pkgbase = parsed.name.into();
            if !pkgs.contains(&pkgbase) {
                continue;
            }

            match parsed.version {
                Some(new) => {
                    let old = self
                        .old_versions
                        .get(&pkgbase)
                        .cloned()
                        .unwrap_or_default();
                    outcome.nvdata.entry(pkgbase).or_default().push(NvSourceChange {
                        source_idx: 0,
                        source_name: "default".to_string(),
                        old,
                        new,
                    });
                }
                None => {
                    tracing::warn!(pkgbase = %pkgbase, error = ?parsed.error, "Version check failed");
                    outcome.unknown.insert(pkgbase);
                }
            }
        }

        child.wait().await.context("nvchecker exited with an error")?;
        Ok(outcome)
    }

    async fn acknowledge(&self, pkgs: &[Pkgbase]) -> Result<()> {
        if pkgs.is_empty() {
            return Ok(());
        }
        let mut cmd = Command::new("nvtake");
        cmd.arg("-c").arg(self.config_path.as_str());
        cmd.args(pkgs.iter().map(|p| p.to_string()));

        let status = cmd.status().await.context("Failed to spawn nvtake")?;
        if !status.success() {
            color_eyre::eyre::bail!("nvtake exited with {status}");
        }
        Ok(())
    }
}

/// Test double returning a fixed outcome.
pub struct FixedVersionChecker(pub VersionCheckOutcome);

#[async_trait::async_trait]
impl VersionChecker for FixedVersionChecker {
    async fn check(&self, _pkgs: &[Pkgbase]) -> Result<VersionCheckOutcome> {
        Ok(self.0.clone())
    }

    async fn acknowledge(&self, _pkgs: &[Pkgbase]) -> Result<()> {
        Ok(())
    }
}
