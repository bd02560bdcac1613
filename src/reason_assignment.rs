//! Merges version-change, pkgrel-change, prior-failure, command-line, and
//! `update_on_build` signals into the per-package reason list (§4.1).

use std::collections::{HashMap, HashSet, VecDeque};

use color_eyre::eyre::Result;
use time::OffsetDateTime;

use crate::metadata::PackageMetadata;
use crate::reason::{BuildReason, NvSourceChange, OnBuildRef};
use crate::version_checker::VersionCheckOutcome;
use crate::{CmdlineTarget, FailedMap, Pkgbase};

/// Decides whether a package's build recipe changed between two commits.
/// An external collaborator standing in for the package repository
/// manager's git diffing (§1).
pub trait RecipeChangeChecker {
    /// Did the `pkgrel` counter change between `last_commit` and `HEAD`?
    fn pkgrel_changed(&self, pkgbase: &Pkgbase) -> Result<bool>;
    /// Did the build recipe as a whole change between `last_commit` and `HEAD`?
    fn recipe_changed(&self, pkgbase: &Pkgbase) -> Result<bool>;
}

pub struct ReasonAssignmentInput<'a> {
    pub managed: &'a [Pkgbase],
    pub version_results: &'a VersionCheckOutcome,
    pub metadata: &'a HashMap<Pkgbase, PackageMetadata>,
    pub prior_failed: &'a FailedMap,
    pub cmdline_targets: &'a [CmdlineTarget],
    pub last_success_times: &'a HashMap<Pkgbase, OffsetDateTime>,
    pub database_enabled: bool,
    pub now: OffsetDateTime,
}

pub fn assign_reasons(
    input: &ReasonAssignmentInput,
    recipe: &dyn RecipeChangeChecker,
) -> Result<HashMap<Pkgbase, Vec<BuildReason>>> {
    let mut build_reasons: HashMap<Pkgbase, Vec<BuildReason>> = HashMap::new();

    // 1. Version-change reasons.
    for pkgbase in input.managed {
        let Some(changes) = input.version_results.nvdata.get(pkgbase) else {
            continue;
        };
        let metadata = input.metadata.get(pkgbase);

        let mut changed: Vec<NvSourceChange> = Vec::new();
        for change in changes {
            if change.old == change.new {
                continue;
            }
            if input.database_enabled {
                if let Some(interval) = metadata.and_then(|m| m.throttle_info.get(&change.source_idx))
                {
                    if let Some(last_success) = input.last_success_times.get(pkgbase) {
                        if input.now < *last_success + *interval {
                            continue;
                        }
                    }
                }
            }
            changed.push(change.clone());
        }

        if changed.is_empty() {
            continue;
        }

        let any_manual = changed.iter().any(|c| {
            metadata
                .and_then(|m| m.update_sources.get(c.source_idx))
                .is_some_and(|s| s.manual)
        });

        build_reasons
            .entry(pkgbase.clone())
            .or_default()
            .push(BuildReason::NvChecker {
                changes: changed,
                any_manual,
            });
    }

    // 2. pkgrel changes, excluding packages whose version-check state is unknown.
    for pkgbase in input.managed {
        if input.version_results.unknown.contains(pkgbase) {
            continue;
        }
        if recipe.pkgrel_changed(pkgbase)? {
            build_reasons
                .entry(pkgbase.clone())
                .or_default()
                .push(BuildReason::UpdatedPkgrel);
        }
    }

    // 3. Previously failed, recipe-changed.
    for pkgbase in input.prior_failed.keys() {
        if !input.managed.contains(pkgbase) {
            continue;
        }
        if recipe.recipe_changed(pkgbase)? {
            build_reasons
                .entry(pkgbase.clone())
                .or_default()
                .push(BuildReason::UpdatedFailed);
        }
    }

    // 4. Command-line.
    for target in input.cmdline_targets {
        build_reasons
            .entry(target.pkgbase.clone())
            .or_default()
            .push(BuildReason::Cmdline {
                runner: target.runner.clone(),
            });
    }

    // 5. FailedByDeps, only when not invoked with command-line targets.
    if input.cmdline_targets.is_empty() {
        for (pkgbase, missing) in input.prior_failed {
            if missing.is_empty() {
                continue;
            }
            build_reasons
                .entry(pkgbase.clone())
                .or_default()
                .push(BuildReason::FailedByDeps {
                    deps: missing.clone(),
                });
        }
    }

    // 6. OnBuild closure: fixed-point BFS over `if_this_then_those`.
    let mut if_this_then_those: HashMap<Pkgbase, Vec<Pkgbase>> = HashMap::new();
    for (pkgbase, metadata) in input.metadata {
        for dependency in &metadata.update_on_build {
            if_this_then_those
                .entry(dependency.clone())
                .or_default()
                .push(pkgbase.clone());
        }
    }

    let mut queue: VecDeque<Pkgbase> = build_reasons.keys().cloned().collect();
    let mut visited: HashSet<Pkgbase> = queue.iter().cloned().collect();
    while let Some(p) = queue.pop_front() {
        let Some(triggered) = if_this_then_those.get(&p) else {
            continue;
        };
        for q in triggered {
            if build_reasons.contains_key(q) {
                continue;
            }
            let Some(q_metadata) = input.metadata.get(q) else {
                continue;
            };
            build_reasons.entry(q.clone()).or_default().push(BuildReason::OnBuild {
                update_on_build: q_metadata
                    .update_on_build
                    .iter()
                    .map(|pkgbase| OnBuildRef {
                        pkgbase: pkgbase.clone(),
                    })
                    .collect(),
            });
            if visited.insert(q.clone()) {
                queue.push_back(q.clone());
            }
        }
    }

    Ok(build_reasons)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version_checker::VersionCheckOutcome;

    struct NoChanges;
    impl RecipeChangeChecker for NoChanges {
        fn pkgrel_changed(&self, _pkgbase: &Pkgbase) -> Result<bool> {
            Ok(false)
        }
        fn recipe_changed(&self, _pkgbase: &Pkgbase) -> Result<bool> {
            Ok(false)
        }
    }

    fn input<'a>(
        managed: &'a [Pkgbase],
        version_results: &'a VersionCheckOutcome,
        metadata: &'a HashMap<Pkgbase, PackageMetadata>,
        prior_failed: &'a FailedMap,
        cmdline_targets: &'a [CmdlineTarget],
        last_success_times: &'a HashMap<Pkgbase, OffsetDateTime>,
    ) -> ReasonAssignmentInput<'a> {
        ReasonAssignmentInput {
            managed,
            version_results,
            metadata,
            prior_failed,
            cmdline_targets,
            last_success_times,
            database_enabled: false,
            now: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn empty_batch_assigns_no_reasons() {
        let managed = vec![Pkgbase::from("a")];
        let version_results = VersionCheckOutcome::default();
        let metadata = HashMap::new();
        let prior_failed = FailedMap::new();
        let cmdline = vec![];
        let last_success = HashMap::new();
        let input = input(
            &managed,
            &version_results,
            &metadata,
            &prior_failed,
            &cmdline,
            &last_success,
        );

        let reasons = assign_reasons(&input, &NoChanges).unwrap();
        assert!(reasons.is_empty());
    }

    #[test]
    fn on_build_closure_reaches_fixed_point() {
        let managed = vec![Pkgbase::from("a"), Pkgbase::from("b"), Pkgbase::from("c")];
        let mut version_results = VersionCheckOutcome::default();
        version_results.nvdata.insert(
            Pkgbase::from("a"),
            vec![NvSourceChange {
                source_idx: 0,
                source_name: "src".into(),
                old: "1".into(),
                new: "2".into(),
            }],
        );
        let mut metadata = HashMap::new();
        metadata.insert(
            Pkgbase::from("b"),
            PackageMetadata {
                update_on_build: vec![Pkgbase::from("a")],
                ..Default::default()
            },
        );
        metadata.insert(
            Pkgbase::from("c"),
            PackageMetadata {
                update_on_build: vec![Pkgbase::from("b")],
                ..Default::default()
            },
        );
        let prior_failed = FailedMap::new();
        let cmdline = vec![];
        let last_success = HashMap::new();
        let input = input(
            &managed,
            &version_results,
            &metadata,
            &prior_failed,
            &cmdline,
            &last_success,
        );

        let reasons = assign_reasons(&input, &NoChanges).unwrap();
        assert!(reasons.contains_key(&Pkgbase::from("a")));
        assert!(reasons.contains_key(&Pkgbase::from("b")));
        assert!(reasons.contains_key(&Pkgbase::from("c")));
    }
}
