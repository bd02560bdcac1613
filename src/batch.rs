//! Batch controller (§4.8): the top-level flow tying every component
//! together into one invocation. Replaces the source's module-level
//! globals (`build_reasons`, `nvdata`, `DEPMAP`, `BUILD_DEPMAP`, `REPO`)
//! with fields on a single `Batch` constructed by the caller (§9 design
//! note).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use color_eyre::eyre::{bail, Result};
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::db::{BatchEvent, Database};
use crate::dependency::{self, DependencyResolver, RecipeReader};
use crate::driver;
use crate::graph::{self, LastBuildFailed};
use crate::metadata::LilacInfoLoader;
use crate::picker::AdmissionPicker;
use crate::priority;
use crate::reason_assignment::{self, ReasonAssignmentInput, RecipeChangeChecker};
use crate::repo::{PackageRepository, Reporter};
use crate::resource::ResourceSampler;
use crate::sorter::BuildSorter;
use crate::state::BatchState;
use crate::version_checker::VersionChecker;
use crate::worker::BuildWorker;
use crate::{CmdlineTarget, FailedMap, Pkgbase, PkgbaseMaintainers};

/// Everything one batch invocation needs from its surrounding collaborators.
pub struct BatchCollaborators<'a> {
    pub repo: &'a PackageRepository,
    pub metadata_loader: &'a dyn LilacInfoLoader,
    pub recipe_reader: &'a dyn RecipeReader,
    pub recipe_change: &'a dyn RecipeChangeChecker,
    pub version_checker: &'a dyn VersionChecker,
    pub resolver: &'a dyn DependencyResolver,
    pub last_build_failed: &'a dyn LastBuildFailed,
    pub database: &'a dyn Database,
    pub resources: &'a dyn ResourceSampler,
    pub reporter: &'a dyn Reporter,
    pub build_worker: Arc<dyn BuildWorker>,
}

pub struct BatchOutcome {
    pub built: HashSet<Pkgbase>,
    pub failed: FailedMap,
    pub new_state: BatchState,
}

/// Runs one full batch: branch check, reset+pull, metadata/deps load,
/// reason assignment, driving the scheduler to quiescence, and producing
/// the state to persist (§4.8 steps 1-8). `shared_state` is updated as
/// progress is made (branch head, then the merged failed map) so that the
/// caller can persist it from a `finally`-equivalent even if this function
/// returns an error or is asked to cancel mid-batch (§4.8 step 9, §5
/// Cancellation). `cancel` is checked by the driver every round: once set,
/// no further packages are submitted and the worker pool is drained before
/// returning.
pub async fn run_batch(
    config: &Config,
    collaborators: &BatchCollaborators<'_>,
    managed: &[Pkgbase],
    cmdline_targets: &[CmdlineTarget],
    prior_state: &BatchState,
    now: OffsetDateTime,
    shared_state: Arc<Mutex<BatchState>>,
    cancel: Arc<AtomicBool>,
    log_dir: Option<&str>,
) -> Result<BatchOutcome> {
    let branch = collaborators.repo.current_branch()?;
    if branch != "master" && branch != "main" {
        bail!("Repository is on branch '{branch}', expected 'master' or 'main'");
    }

    collaborators.repo.reset_hard()?;
    collaborators.repo.pull_fast_forward("origin")?;
    let head = collaborators.repo.head_commit()?;
    shared_state.lock().await.last_commit = Some(head.clone());

    let (metadata, mut failed) = collaborators.metadata_loader.load_all(managed)?;
    for (pkgbase, missing) in &prior_state.failed {
        failed.entry(pkgbase.clone()).or_insert_with(|| missing.clone());
    }
    shared_state.lock().await.failed = failed.clone();

    let maintainers: PkgbaseMaintainers = metadata
        .iter()
        .map(|(pkgbase, meta)| (pkgbase.clone(), meta.maintainers.clone()))
        .collect();

    let (depmap, build_depmap) = dependency::build_dependency_maps(collaborators.recipe_reader, managed)?;

    let managed_set: HashSet<Pkgbase> = managed.iter().cloned().collect();
    let changed = match &prior_state.last_commit {
        Some(last_commit) => collaborators.repo.changed_pkgbases(last_commit, &head, &managed_set)?,
        None => managed_set.clone(),
    };
    tracing::info!(changed = changed.len(), "Computed changed pkgbases since last batch");

    let cone_of_care: Vec<Pkgbase> = if cmdline_targets.is_empty() {
        managed.to_vec()
    } else {
        cmdline_targets.iter().map(|t| t.pkgbase.clone()).collect()
    };
    let version_results = collaborators.version_checker.check(&cone_of_care).await?;

    let database_enabled = config.lilac.dburl.is_some();
    let last_success_times = collaborators
        .database
        .get_pkgs_last_success_times(managed)
        .await
        .unwrap_or_default();

    let input = ReasonAssignmentInput {
        managed,
        version_results: &version_results,
        metadata: &metadata,
        prior_failed: &failed,
        cmdline_targets,
        last_success_times: &last_success_times,
        database_enabled,
        now,
    };
    let mut build_reasons = reason_assignment::assign_reasons(&input, collaborators.recipe_change)?;

    let graph = graph::build_dependency_graph(
        &depmap,
        &build_depmap,
        &mut build_reasons,
        &managed_set,
        collaborators.resolver,
        collaborators.last_build_failed,
        collaborators.reporter,
    );

    let priorities = priority::precompute_priorities(
        graph.dep_building_map.keys().cloned(),
        &graph.revdepmap,
        &build_reasons,
    );

    let mut sorter = BuildSorter::new(graph.dep_building_map, &build_reasons, priorities);

    let mut picker = AdmissionPicker {
        sorter: &mut sorter,
        db: collaborators.database,
        resources: collaborators.resources,
        resolver: collaborators.resolver,
        reporter: collaborators.reporter,
        build_reasons: &build_reasons,
        metadata: &metadata,
        failed: &failed,
        database_enabled,
    };

    collaborators
        .database
        .record_batch_event(BatchEvent::Start, log_dir)
        .await
        .ok();

    let drive_result = driver::drive(
        &mut picker,
        collaborators.build_worker.clone(),
        collaborators.reporter,
        &version_results.nvdata,
        &maintainers,
        config.lilac.max_concurrency,
        cancel,
    )
    .await?;

    collaborators
        .database
        .record_batch_event(BatchEvent::Stop, log_dir)
        .await
        .ok();

    for pkgbase in &drive_result.built {
        failed.remove(pkgbase);
    }
    for (pkgbase, deps) in &drive_result.failed {
        failed.insert(pkgbase.clone(), deps.clone());
    }
    failed.retain(|pkgbase, _| managed_set.contains(pkgbase));

    {
        let mut guard = shared_state.lock().await;
        guard.last_commit = Some(head.clone());
        guard.failed = failed.clone();
    }

    let outcome = BatchOutcome {
        built: drive_result.built,
        failed: failed.clone(),
        new_state: BatchState {
            last_commit: Some(head),
            failed,
        },
    };

    let to_ack: Vec<Pkgbase> = packages_to_acknowledge(config, &outcome, &build_reasons)
        .into_iter()
        .cloned()
        .collect();
    if let Err(e) = collaborators.version_checker.acknowledge(&to_ack).await {
        tracing::warn!(error = %e, "Failed to acknowledge versions to the version checker");
    }

    Ok(outcome)
}

/// §4.8 step 9's acknowledgment branch: which successfully- or
/// failed-but-attempted packages should be acknowledged to the version
/// checker (`nvtake`), based on the `rebuild_failed_pkgs` config flag.
pub fn packages_to_acknowledge<'a>(
    config: &Config,
    outcome: &'a BatchOutcome,
    build_reasons: &'a HashMap<Pkgbase, Vec<crate::reason::BuildReason>>,
) -> Vec<&'a Pkgbase> {
    if config.lilac.rebuild_failed_pkgs && !outcome.built.is_empty() {
        return outcome.built.iter().collect();
    }

    build_reasons
        .iter()
        .filter(|(_, reasons)| reasons.iter().any(|r| matches!(r, crate::reason::BuildReason::NvChecker { .. })))
        .map(|(pkgbase, _)| pkgbase)
        .filter(|pkgbase| outcome.built.contains(*pkgbase) || outcome.failed.contains_key(*pkgbase))
        .collect()
}
