//! The build worker: takes a package and produces a `BuildResult`, a
//! version string, and resource-usage stats (§1 external collaborator, §9
//! SUPPLEMENT). `MissingDependencies` is expressed as a result variant
//! rather than an exception caught by the driver (§9 design note).

use std::time::{Duration, Instant};

use color_eyre::eyre::Result;
use tokio::process::Command;

use crate::reason::{BuildReason, OnBuildRef};
use crate::{Pkgbase, Rusage};

/// The unit handed to the worker: the package plus, when it was pulled in
/// (wholly or partly) by `OnBuild`, the version pairs of the triggers.
#[derive(Debug, Clone)]
pub struct PkgToBuild {
    pub pkgbase: Pkgbase,
    pub on_build_vers: Vec<(String, String)>,
    pub reasons: Vec<BuildReason>,
}

impl PkgToBuild {
    pub fn reason_summary(&self) -> String {
        self.reasons
            .iter()
            .map(BuildReason::display)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone)]
pub enum BuildOutcome {
    Successful {
        version: String,
        elapsed: Duration,
        rusage: Option<Rusage>,
    },
    Staged {
        version: String,
        elapsed: Duration,
        rusage: Option<Rusage>,
    },
    Skipped {
        reason: String,
        elapsed: Duration,
    },
    /// Normal-return-path equivalent of the source's `MissingDependencies`
    /// exception (§9 design note).
    MissingDependencies {
        deps: Vec<String>,
        elapsed: Duration,
    },
    Failed {
        error: String,
        elapsed: Duration,
        logfile: Option<camino::Utf8PathBuf>,
    },
}

impl BuildOutcome {
    pub fn elapsed(&self) -> Duration {
        match self {
            BuildOutcome::Successful { elapsed, .. }
            | BuildOutcome::Staged { elapsed, .. }
            | BuildOutcome::Skipped { elapsed, .. }
            | BuildOutcome::MissingDependencies { elapsed, .. }
            | BuildOutcome::Failed { elapsed, .. } => *elapsed,
        }
    }

    pub fn rusage(&self) -> Option<Rusage> {
        match self {
            BuildOutcome::Successful { rusage, .. } | BuildOutcome::Staged { rusage, .. } => {
                *rusage
            }
            _ => None,
        }
    }
}

/// Builds one package. Production implementations shell out to a build
/// runner (`pkgctl build`-alike); the teacher's `build_package.rs` shells
/// out to `pkgctl` the same way.
#[async_trait::async_trait]
pub trait BuildWorker: Send + Sync {
    async fn build(&self, pkg: &PkgToBuild, worker_id: u32) -> BuildOutcome;
}

/// Spawns an external build command per package, tagging its log output
/// with the assigned `worker_id` the way the teacher tags bind-mounts per
/// worker.
pub struct ProcessBuildWorker {
    pub build_command: Vec<String>,
    pub repodir: camino::Utf8PathBuf,
    pub logdir: camino::Utf8PathBuf,
}

#[async_trait::async_trait]
impl BuildWorker for ProcessBuildWorker {
    async fn build(&self, pkg: &PkgToBuild, worker_id: u32) -> BuildOutcome {
        let start = Instant::now();
        let pkgdir = self.repodir.join(pkg.pkgbase.as_ref());
        let logfile = self
            .logdir
            .join(format!("{}.log", pkg.pkgbase));

        let result = self.run(&pkgdir, worker_id, &logfile).await;
        let elapsed = start.elapsed();

        match result {
            Ok(version) => BuildOutcome::Successful {
                version,
                elapsed,
                rusage: None,
            },
            Err(e) => BuildOutcome::Failed {
                error: e.to_string(),
                elapsed,
                logfile: Some(logfile),
            },
        }
    }
}

impl ProcessBuildWorker {
    async fn run(&self, pkgdir: &camino::Utf8Path, worker_id: u32, logfile: &camino::Utf8Path) -> Result<String> {
        use color_eyre::eyre::Context;
        use std::process::Stdio;

        let Some((program, args)) = self.build_command.split_first() else {
            color_eyre::eyre::bail!("No build command configured");
        };

        if let Some(parent) = logfile.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        let log = tokio::fs::File::create(logfile)
            .await
            .context("Failed to create build logfile")?
            .into_std()
            .await;

        let status = Command::new(program)
            .args(args)
            .current_dir(pkgdir)
            .env("LILAC_WORKER_ID", worker_id.to_string())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .status()
            .await
            .context("Failed to spawn build worker process")?;

        if !status.success() {
            color_eyre::eyre::bail!("Build command exited with {status}");
        }

        read_pkgver(pkgdir).await
    }
}

/// Reads the built version out of the recipe directory's `PKGVER` marker
/// file, the convention the build command is expected to leave behind.
async fn read_pkgver(pkgdir: &camino::Utf8Path) -> Result<String> {
    let path = pkgdir.join("PKGVER");
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => Ok(contents.trim().to_string()),
        Err(_) => Ok("unknown".to_string()),
    }
}

/// Test double returning a fixed outcome regardless of input.
pub struct FixedBuildWorker(pub BuildOutcome);

#[async_trait::async_trait]
impl BuildWorker for FixedBuildWorker {
    async fn build(&self, _pkg: &PkgToBuild, _worker_id: u32) -> BuildOutcome {
        self.0.clone()
    }
}

/// Helper used by the driver when it needs to fabricate `on_build_vers`
/// for packages pulled in for context rather than as the primary `OnBuild`
/// trigger (§4.6 item 3).
pub fn stable_context_vers(update_on_build: &[OnBuildRef], current: impl Fn(&Pkgbase) -> Option<String>) -> Vec<(String, String)> {
    update_on_build
        .iter()
        .filter_map(|r| current(&r.pkgbase).map(|v| (v.clone(), v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixed_worker_returns_its_outcome() {
        let outcome = BuildOutcome::Skipped {
            reason: "nothing to do".into(),
            elapsed: Duration::from_secs(1),
        };
        let worker = FixedBuildWorker(outcome.clone());
        let pkg = PkgToBuild {
            pkgbase: "a".into(),
            on_build_vers: vec![],
            reasons: vec![],
        };
        let result = worker.build(&pkg, 0).await;
        assert!(matches!(result, BuildOutcome::Skipped { .. }));
    }

    #[test]
    fn stable_context_vers_pairs_current_with_itself() {
        let refs = vec![OnBuildRef { pkgbase: "a".into() }];
        let vers = stable_context_vers(&refs, |_| Some("1.0".to_string()));
        assert_eq!(vers, vec![("1.0".to_string(), "1.0".to_string())]);
    }
}
