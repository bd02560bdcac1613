use std::collections::HashSet;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::{bail, Context, Result};
use time::OffsetDateTime;
use tokio::sync::Mutex;

use lilac::batch::{self, BatchCollaborators};
use lilac::config::Config;
use lilac::db::{Database, NullDatabase};
use lilac::dependency::{ArtifactDependencyResolver, TomlRecipeReader};
use lilac::graph::FixedLastBuildFailed;
use lilac::metadata::TomlLilacInfoLoader;
use lilac::repo::{GitRecipeChangeChecker, NullReporter, PackageRepository, Reporter};
use lilac::resource::ProcResourceSampler;
use lilac::state::BatchState;
use lilac::version_checker::NvcheckerProcessChecker;
use lilac::worker::{BuildWorker, ProcessBuildWorker};

mod args;

use args::Args;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let args = Args::parse();
    lilac::tracing::init(args.verbose, false);
    tracing::debug!("{args:?}");

    let config = Config::load(&args.config)
        .await
        .context("Failed to load configuration")?;

    let lock_path = Config::default_state_dir()?.join(".lock");
    let _lock = match acquire_lock(&lock_path, args.force).await {
        Ok(lock) => lock,
        Err(e) => {
            tracing::error!(error = %e, "Failed to acquire process lock");
            return Ok(ExitCode::FAILURE);
        }
    };

    match run(&config, &args).await {
        Ok(had_failures) => Ok(if had_failures { ExitCode::SUCCESS } else { ExitCode::SUCCESS }),
        Err(e) => {
            tracing::error!(error = %e, "Batch aborted");
            Ok(ExitCode::FAILURE)
        }
    }
}

/// A simple advisory lock file: present for the duration of the batch,
/// removed on drop. A second concurrent invocation without `--force`
/// fails fast (§5 shared resources).
struct LockGuard(camino::Utf8PathBuf);

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

async fn acquire_lock(path: &camino::Utf8Path, force: bool) -> Result<LockGuard> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    if path.exists() && !force {
        bail!("Lock file {path} already exists; pass --force to override");
    }
    tokio::fs::write(path, std::process::id().to_string()).await?;
    Ok(LockGuard(path.to_owned()))
}

async fn run(config: &Config, args: &Args) -> Result<bool> {
    let repo = PackageRepository::open(&config.repository.repodir)?;
    let state_path = Config::default_state_dir()?.join("store");
    let prior_state = BatchState::load(&state_path).await?;

    let managed = discover_managed_packages(&config.repository.repodir)?;

    let metadata_loader = TomlLilacInfoLoader::new(&config.repository.repodir);
    let recipe_reader = TomlRecipeReader {
        repodir: config.repository.repodir.clone(),
    };
    let resolver = ArtifactDependencyResolver {
        destdir: config.repository.destdir.clone(),
    };

    let database: Box<dyn Database> = match &config.lilac.dburl {
        #[cfg(feature = "database")]
        Some(url) => Box::new(lilac::db::SqliteDatabase::connect(url).await?),
        #[cfg(not(feature = "database"))]
        Some(_) => Box::new(NullDatabase),
        None => Box::new(NullDatabase),
    };

    let head = repo.head_commit()?;
    let old_commit = prior_state.last_commit.clone().unwrap_or_else(|| head.clone());

    let mut last_build_failed_set = HashSet::new();
    for pkgbase in &managed {
        if database.is_last_build_failed(pkgbase).await.unwrap_or(false) {
            last_build_failed_set.insert(pkgbase.clone());
        }
    }
    let last_build_failed = FixedLastBuildFailed(last_build_failed_set);

    let recipe_change = GitRecipeChangeChecker {
        repo: &repo,
        old: old_commit,
        new: head.clone(),
    };

    let old_versions = std::collections::HashMap::new();
    let version_checker = NvcheckerProcessChecker {
        config_path: config.repository.repodir.join("nvchecker.toml"),
        proxy: config.nvchecker.proxy.clone(),
        old_versions,
    };

    let resources = ProcResourceSampler::default();
    // `SendmailReporter` is available for deployments that configure mail;
    // this binary has no operator address to hand it, so it falls back to
    // discarding reports.
    let reporter: Box<dyn Reporter> = Box::new(NullReporter);

    let build_worker: Arc<dyn BuildWorker> = Arc::new(ProcessBuildWorker {
        build_command: vec!["pkgctl".to_string(), "build".to_string()],
        repodir: config.repository.repodir.clone(),
        logdir: Config::default_state_dir()?.join("log"),
    });

    let collaborators = BatchCollaborators {
        repo: &repo,
        metadata_loader: &metadata_loader,
        recipe_reader: &recipe_reader,
        recipe_change: &recipe_change,
        version_checker: &version_checker,
        resolver: &resolver,
        last_build_failed: &last_build_failed,
        database: database.as_ref(),
        resources: &resources,
        reporter: reporter.as_ref(),
        build_worker,
    };

    let now = OffsetDateTime::now_utc();
    let log_dir = lilac::state::batch_logdir(&Config::default_state_dir()?, now)?;

    let shared_state = Arc::new(Mutex::new(prior_state.clone()));
    let cancel = Arc::new(AtomicBool::new(false));
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Received interrupt; stopping submission and draining in-flight builds");
                cancel.store(true, Ordering::Relaxed);
            }
        }
    });

    // Run to completion, but persist whatever `shared_state` holds
    // regardless of outcome: on exception or Ctrl-C this still reflects
    // the `last_commit`/`failed` known as of the last completed step
    // (§4.8 step 9's `finally`, §5 Cancellation).
    let batch_result = batch::run_batch(
        config,
        &collaborators,
        &managed,
        &args.targets,
        &prior_state,
        now,
        shared_state.clone(),
        cancel,
        Some(log_dir.as_str()),
    )
    .await;

    let persisted_state = shared_state.lock().await.clone();
    if let Err(e) = persisted_state.save(&state_path).await {
        tracing::error!(error = %e, "Failed to persist batch state");
    }

    let outcome = batch_result?;

    if config.lilac.git_push {
        repo.reset_hard().ok();
        tracing::info!("git_push configured but pushing is left to the configured postrun hooks");
    }

    for command in &config.misc.postrun {
        run_hook(command).await;
    }

    Ok(!outcome.failed.is_empty())
}

async fn run_hook(argv: &[String]) {
    let Some((program, rest)) = argv.split_first() else {
        return;
    };
    match tokio::process::Command::new(program).args(rest).status().await {
        Ok(status) if !status.success() => {
            tracing::warn!(command = ?argv, %status, "Hook command exited non-zero");
        }
        Err(e) => tracing::warn!(command = ?argv, error = %e, "Failed to run hook command"),
        _ => {}
    }
}

fn discover_managed_packages(repodir: &camino::Utf8Path) -> Result<Vec<lilac::Pkgbase>> {
    let mut managed = Vec::new();
    for entry in std::fs::read_dir(repodir).with_context(|| format!("Failed to read repodir {repodir}"))? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    managed.push(lilac::Pkgbase::from(name));
                }
            }
        }
    }
    managed.sort();
    Ok(managed)
}
