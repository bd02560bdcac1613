//! Build driver (§4.7): owns the bounded worker pool, drives the picker to
//! quiescence, and applies each worker result back onto `built`/`failed`
//! and the sorter.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use color_eyre::eyre::Result;
use tokio::sync::mpsc;

use crate::db::{Database, PkgCurrentRow, PkgStatus};
use crate::reason::{BuildReason, NvSourceChange};
use crate::repo::Reporter;
use crate::worker::{BuildOutcome, BuildWorker, PkgToBuild};
use crate::{FailedMap, Pkgbase, PkgbaseMaintainers};

use crate::picker::AdmissionPicker;

/// Outcome of driving one batch to quiescence.
#[derive(Debug, Default)]
pub struct DriveResult {
    pub built: HashSet<Pkgbase>,
    pub failed: FailedMap,
}

struct WorkerMessage {
    pkgbase: Pkgbase,
    outcome: BuildOutcome,
}

/// Runs the main driver loop to completion (§4.7). `max_concurrency`
/// bounds how many workers may be in flight at once; the worker-index
/// counter is a single shared atomic, replacing the source's thread-local
/// assignment with an explicit argument per worker (§9 design note).
pub async fn drive(
    picker: &mut AdmissionPicker<'_>,
    worker: Arc<dyn BuildWorker>,
    reporter: &dyn Reporter,
    nvdata: &HashMap<Pkgbase, Vec<NvSourceChange>>,
    maintainers: &PkgbaseMaintainers,
    max_concurrency: usize,
    cancel: Arc<AtomicBool>,
) -> Result<DriveResult> {
    let (tx, mut rx) = mpsc::channel::<WorkerMessage>(max_concurrency.max(1));
    let worker_index = Arc::new(AtomicU32::new(0));
    let mut running: HashSet<Pkgbase> = HashSet::new();
    let mut result = DriveResult::default();

    let mut statuses: HashMap<Pkgbase, PkgStatus> = picker
        .build_reasons
        .keys()
        .map(|p| (p.clone(), PkgStatus::Pending))
        .collect();
    sync_pkgcurrent(picker.db, &statuses, picker.build_reasons).await;

    loop {
        if cancel.load(Ordering::Relaxed) {
            tracing::warn!("Submission stopped; draining in-flight builds");
        } else {
            let limit = max_concurrency.saturating_sub(running.len());
            let starving = running.is_empty();
            let picks = picker.pick(&running, limit, starving).await?;

            let mut dispatched_any = false;
            for pick in picks {
                if !nvdata.contains_key(&pick.pkgbase) {
                    // Pulled in by OnBuild but never version-checked.
                    picker.sorter.done(&pick.pkgbase);
                    statuses.insert(pick.pkgbase.clone(), PkgStatus::Done);
                    continue;
                }
                statuses.insert(pick.pkgbase.clone(), PkgStatus::Building);
                running.insert(pick.pkgbase.clone());
                dispatched_any = true;
                spawn_worker(pick, worker.clone(), &worker_index, tx.clone());
            }
            if dispatched_any {
                sync_pkgcurrent(picker.db, &statuses, picker.build_reasons).await;
            }
        }

        if running.is_empty() {
            break;
        }

        let Some(message) = rx.recv().await else {
            break;
        };
        running.remove(&message.pkgbase);
        statuses.insert(message.pkgbase.clone(), PkgStatus::Done);
        apply_outcome(&message.pkgbase, message.outcome, picker, reporter, maintainers, &mut result).await;
        sync_pkgcurrent(picker.db, &statuses, picker.build_reasons).await;
    }

    Ok(result)
}

/// Rewrites `pkgcurrent` in full with the current status of every tracked
/// package (§6 database schema: "rewritten every batch").
async fn sync_pkgcurrent(
    db: &dyn Database,
    statuses: &HashMap<Pkgbase, PkgStatus>,
    build_reasons: &HashMap<Pkgbase, Vec<BuildReason>>,
) {
    let mut pkgs: Vec<&Pkgbase> = statuses.keys().collect();
    pkgs.sort();

    let rows: Vec<PkgCurrentRow> = pkgs
        .into_iter()
        .enumerate()
        .map(|(index, pkgbase)| {
            let reasons = build_reasons.get(pkgbase).cloned().unwrap_or_default();
            PkgCurrentRow {
                pkgbase: pkgbase.clone(),
                index: index as i64,
                status: statuses[pkgbase],
                build_reasons: reasons.iter().map(BuildReason::display).collect::<Vec<_>>().join("; "),
            }
        })
        .collect();

    if let Err(e) = db.record_pkgcurrent(&rows).await {
        tracing::warn!(error = %e, "Failed to rewrite pkgcurrent");
    }
}

/// Submits one package to the worker pool as its own tokio task, so that
/// up to `max_concurrency` builds genuinely overlap rather than serializing
/// behind the driver's own loop.
fn spawn_worker(
    pick: PkgToBuild,
    worker: Arc<dyn BuildWorker>,
    worker_index: &Arc<AtomicU32>,
    tx: mpsc::Sender<WorkerMessage>,
) {
    let worker_id = worker_index.fetch_add(1, Ordering::SeqCst);
    let pkgbase = pick.pkgbase.clone();
    tokio::spawn(async move {
        let outcome = worker.build(&pick, worker_id).await;
        let _ = tx.send(WorkerMessage { pkgbase, outcome }).await;
    });
}

async fn apply_outcome(
    pkgbase: &Pkgbase,
    outcome: BuildOutcome,
    picker: &mut AdmissionPicker<'_>,
    reporter: &dyn Reporter,
    maintainers: &PkgbaseMaintainers,
    result: &mut DriveResult,
) {
    match &outcome {
        BuildOutcome::Successful { .. } | BuildOutcome::Staged { .. } => {
            result.built.insert(pkgbase.clone());
        }
        BuildOutcome::Skipped { reason, .. } => {
            tracing::warn!(pkgbase = %pkgbase, reason = %reason, "Build skipped");
        }
        BuildOutcome::MissingDependencies { deps, .. } => {
            let all_also_failed = deps.iter().all(|d| result.failed.contains_key(&Pkgbase::from(d.clone())));
            result.failed.insert(pkgbase.clone(), deps.clone());
            let subject = format!("{pkgbase}: missing dependencies");
            let body = if all_also_failed {
                format!("{pkgbase} failed previously due to the same missing dependencies: {}", deps.join(", "))
            } else {
                format!("{pkgbase} failed this batch due to missing dependencies: {}", deps.join(", "))
            };
            reporter.report(Some(pkgbase), &subject, &body);
        }
        BuildOutcome::Failed { error, logfile, .. } => {
            result.failed.insert(pkgbase.clone(), Vec::new());
            let body = match logfile {
                Some(path) => format!("{error}\n\nSee logfile: {path}"),
                None => error.clone(),
            };
            reporter.report(Some(pkgbase), &format!("{pkgbase}: build failed"), &body);
        }
    }

    record_pkglog(pkgbase, &outcome, picker, maintainers).await;
    picker.sorter.done(pkgbase);
}

/// Builds and appends the `pkglog` row for one completed build (§4.7
/// per-result handling: "insert a pkglog row with elapsed, result class,
/// cputime, memory, message, reasons, maintainers").
async fn record_pkglog(
    pkgbase: &Pkgbase,
    outcome: &BuildOutcome,
    picker: &AdmissionPicker<'_>,
    maintainers: &PkgbaseMaintainers,
) {
    let reasons = picker.build_reasons.get(pkgbase).cloned().unwrap_or_default();
    let reasons_str = reasons.iter().map(BuildReason::display).collect::<Vec<_>>().join("; ");
    let maintainers_str = maintainers.get(pkgbase).cloned().unwrap_or_default().join(", ");
    let rusage = outcome.rusage();

    let (result_class, pkg_version, msg) = match outcome {
        BuildOutcome::Successful { version, .. } => {
            ("successful", Some(version.clone()), describe_reasons(pkgbase, &reasons))
        }
        BuildOutcome::Staged { version, .. } => {
            ("staged", Some(version.clone()), describe_reasons(pkgbase, &reasons))
        }
        BuildOutcome::Skipped { reason, .. } => ("skipped", None, reason.clone()),
        BuildOutcome::MissingDependencies { deps, .. } => {
            ("missing-deps", None, format!("missing dependencies: {}", deps.join(", ")))
        }
        BuildOutcome::Failed { error, .. } => ("failed", None, error.clone()),
    };

    let row = crate::db::PkgLogRow {
        pkgbase: pkgbase.clone(),
        nv_version: None,
        pkg_version,
        elapsed_secs: outcome.elapsed().as_secs_f64(),
        result: result_class.to_string(),
        cputime_secs: rusage.map(|r| r.cputime.as_secs_f64()),
        memory: rusage.map(|r| r.memory as i64),
        msg,
        build_reasons: reasons_str,
        maintainers: maintainers_str,
    };

    if let Err(e) = picker.db.append_pkglog(&row).await {
        tracing::warn!(pkgbase = %pkgbase, error = %e, "Failed to record pkglog row");
    }
}

/// Composes the commit-message-style summary used for both the mail
/// reports and the structured `pkglog` row (§4.7 per-result handling).
pub fn describe_reasons(pkgbase: &Pkgbase, reasons: &[BuildReason]) -> String {
    let summary = reasons.iter().map(BuildReason::display).collect::<Vec<_>>().join("; ");
    format!("{pkgbase}: {summary}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NullDatabase;
    use crate::dependency::{Dependency, DependencyResolver};
    use crate::metadata::PackageMetadata;
    use crate::repo::NullReporter;
    use crate::resource::{FixedResourceSampler, ResourceSnapshot};
    use crate::sorter::BuildSorter;
    use crate::worker::FixedBuildWorker;
    use std::collections::HashSet as Set;

    struct AlwaysSatisfied;
    impl DependencyResolver for AlwaysSatisfied {
        fn is_satisfied(&self, _dep: &Dependency) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn empty_batch_drives_to_quiescence_with_no_submissions() {
        let depmap = HashMap::new();
        let build_reasons: HashMap<Pkgbase, Vec<BuildReason>> = HashMap::new();
        let mut sorter = BuildSorter::new(depmap, &build_reasons, HashMap::new());
        let metadata: HashMap<Pkgbase, PackageMetadata> = HashMap::new();
        let failed = FailedMap::new();
        let db = NullDatabase;
        let resolver = AlwaysSatisfied;
        let reporter = NullReporter;
        let resources = FixedResourceSampler(ResourceSnapshot {
            cpu_ratio: 0.0,
            memory_avail: u64::MAX,
        });

        let mut picker = AdmissionPicker {
            sorter: &mut sorter,
            db: &db,
            resources: &resources,
            resolver: &resolver,
            reporter: &reporter,
            build_reasons: &build_reasons,
            metadata: &metadata,
            failed: &failed,
            database_enabled: false,
        };

        let worker: Arc<dyn BuildWorker> = Arc::new(FixedBuildWorker(BuildOutcome::Successful {
            version: "1".into(),
            elapsed: std::time::Duration::from_secs(0),
            rusage: None,
        }));
        let nvdata = HashMap::new();
        let maintainers = PkgbaseMaintainers::new();
        let cancel = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let result = drive(&mut picker, worker, &reporter, &nvdata, &maintainers, 2, cancel)
            .await
            .unwrap();
        assert!(result.built.is_empty());
        assert!(result.failed.is_empty());
        let _ = Set::<Pkgbase>::new();
    }
}
