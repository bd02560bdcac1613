//! Admission picker: per-round selection of up to `limit` ready packages,
//! honoring CPU/memory/starvation policy (§4.5), and the buildability
//! check that turns a ready pkgbase into a `PkgToBuild` or drops it
//! (§4.6).

use std::collections::HashMap;

use color_eyre::eyre::Result;

use crate::db::Database;
use crate::dependency::{Dependency, DependencyResolver};
use crate::metadata::PackageMetadata;
use crate::reason::BuildReason;
use crate::repo::Reporter;
use crate::resource::ResourceSampler;
use crate::sorter::BuildSorter;
use crate::worker::PkgToBuild;
use crate::{FailedMap, Pkgbase, Rusage};

/// Assumed memory cost for a package with no historical rusage (§4.5 step 7).
pub const DEFAULT_MEMORY_BUDGET: u64 = 10 * 1024 * 1024 * 1024;

pub struct AdmissionPicker<'a> {
    pub sorter: &'a mut BuildSorter,
    pub db: &'a dyn Database,
    pub resources: &'a dyn ResourceSampler,
    pub resolver: &'a dyn DependencyResolver,
    pub reporter: &'a dyn Reporter,
    pub build_reasons: &'a HashMap<Pkgbase, Vec<BuildReason>>,
    pub metadata: &'a HashMap<Pkgbase, PackageMetadata>,
    pub failed: &'a FailedMap,
    pub database_enabled: bool,
}

impl<'a> AdmissionPicker<'a> {
    pub async fn pick(
        &mut self,
        running: &std::collections::HashSet<Pkgbase>,
        limit: usize,
        starving: bool,
    ) -> Result<Vec<PkgToBuild>> {
        if !self.sorter.is_active() {
            return Ok(Vec::new());
        }

        let ready_to_build: Vec<Pkgbase> = self
            .sorter
            .get_ready()
            .into_iter()
            .filter(|p| !running.contains(p))
            .collect();
        if ready_to_build.is_empty() {
            return Ok(Vec::new());
        }

        let rusages = if self.database_enabled {
            self.db.get_pkgs_last_rusage(&ready_to_build).await?
        } else {
            HashMap::new()
        };

        let mut sorted = ready_to_build.clone();
        self.sort_by_priority_then_cpu(&mut sorted, &rusages);

        let snapshot = self.resources.sample()?;
        if snapshot.cpu_ratio < 1.0 {
            self.promote_big_package(&mut sorted);
        }

        let mut picks = Vec::new();
        let mut memory_avail = snapshot.memory_avail;
        let mut limited_by_memory = false;

        for p in &sorted {
            if picks.len() >= limit {
                break;
            }
            let memory = rusages.get(p).map(|r| r.memory);
            if let Some(memory) = memory {
                if memory > memory_avail {
                    limited_by_memory = true;
                    continue;
                }
            }
            match self.check_buildability(p).await? {
                Some(to_build) => {
                    memory_avail = memory_avail.saturating_sub(memory.unwrap_or(DEFAULT_MEMORY_BUDGET));
                    picks.push(to_build);
                }
                None => continue,
            }
        }

        if picks.is_empty() && limited_by_memory && starving {
            let mut by_memory = ready_to_build.clone();
            self.sort_by_priority_then_memory(&mut by_memory, &rusages);
            for p in &by_memory {
                if let Some(to_build) = self.check_buildability(p).await? {
                    picks.push(to_build);
                    break;
                }
            }
        }

        Ok(picks)
    }

    fn sort_by_priority_then_cpu(&self, pkgs: &mut [Pkgbase], rusages: &HashMap<Pkgbase, Rusage>) {
        pkgs.sort_by(|a, b| {
            self.sorter
                .priority_of(a)
                .cmp(&self.sorter.priority_of(b))
                .then_with(|| cpu_intensity(a, rusages).total_cmp(&cpu_intensity(b, rusages)))
        });
    }

    fn sort_by_priority_then_memory(&self, pkgs: &mut [Pkgbase], rusages: &HashMap<Pkgbase, Rusage>) {
        pkgs.sort_by(|a, b| {
            self.sorter.priority_of(a).cmp(&self.sorter.priority_of(b)).then_with(|| {
                let ma = rusages.get(a).map(|r| r.memory).unwrap_or(DEFAULT_MEMORY_BUDGET);
                let mb = rusages.get(b).map(|r| r.memory).unwrap_or(DEFAULT_MEMORY_BUDGET);
                ma.cmp(&mb)
            })
        });
    }

    /// Promotes the last entry of the head's priority tier to the front
    /// when that tier has more than three entries (§4.5 step 6).
    fn promote_big_package(&self, sorted: &mut Vec<Pkgbase>) {
        let Some(head) = sorted.first() else { return };
        let head_priority = self.sorter.priority_of(head);
        let tier_end = sorted
            .iter()
            .position(|p| self.sorter.priority_of(p) != head_priority)
            .unwrap_or(sorted.len());
        if tier_end > 3 {
            let promoted = sorted.remove(tier_end - 1);
            sorted.insert(0, promoted);
        }
    }

    /// `check_buildability(p)` (§4.6): decides whether `p` is still worth
    /// attempting now, marking it done in the sorter and returning `None`
    /// when it is not.
    async fn check_buildability(&mut self, p: &Pkgbase) -> Result<Option<PkgToBuild>> {
        if self.failed.contains_key(p) {
            self.sorter.done(p);
            return Ok(None);
        }

        let reasons = self.build_reasons.get(p).cloned().unwrap_or_default();

        if let [BuildReason::FailedByDeps { deps }] = reasons.as_slice() {
            let still_unresolved = deps.iter().any(|d| {
                !self.resolver.is_satisfied(&Dependency {
                    dep_pkgbase: d.clone().into(),
                    dirname: d.clone(),
                })
            });
            if still_unresolved {
                self.sorter.done(p);
                return Ok(None);
            }
        }

        let mut on_build_vers = Vec::new();

        if let ([BuildReason::OnBuild { update_on_build }], true) = (reasons.as_slice(), reasons.len() == 1) {
            if update_on_build.iter().any(|r| self.failed.contains_key(&r.pkgbase)) {
                self.sorter.done(p);
                return Ok(None);
            }

            let triggers: Vec<Pkgbase> = update_on_build.iter().map(|r| r.pkgbase.clone()).collect();
            match self.db.get_update_on_build_vers(&triggers).await {
                Ok(vers) => {
                    if !vers.is_empty() && vers.iter().all(|(old, new)| old == new) {
                        self.sorter.done(p);
                        return Ok(None);
                    }
                    on_build_vers = vers;
                }
                Err(e) => {
                    self.reporter.report(
                        Some(p),
                        &format!("{p}: failed to evaluate update_on_build"),
                        &format!("{e:#}"),
                    );
                    return Ok(None);
                }
            }
        } else if self.database_enabled {
            if let Some(metadata) = self.metadata.get(p) {
                if !metadata.update_on_build.is_empty() {
                    let vers = self.db.get_update_on_build_vers(&metadata.update_on_build).await?;
                    on_build_vers = vers.into_iter().map(|(_, new)| (new.clone(), new)).collect();
                }
            }
        }

        Ok(Some(PkgToBuild {
            pkgbase: p.clone(),
            on_build_vers,
            reasons,
        }))
    }
}

fn cpu_intensity(pkg: &Pkgbase, rusages: &HashMap<Pkgbase, Rusage>) -> f64 {
    rusages.get(pkg).map(Rusage::cpu_intensity).unwrap_or(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NullDatabase;
    use crate::repo::NullReporter;
    use crate::resource::{FixedResourceSampler, ResourceSnapshot};
    use std::collections::HashSet;
    use std::time::Duration;

    struct AlwaysSatisfied;
    impl DependencyResolver for AlwaysSatisfied {
        fn is_satisfied(&self, _dep: &Dependency) -> bool {
            true
        }
    }

    fn make_sorter(pkgs: &[&str], priorities: HashMap<Pkgbase, i32>) -> (BuildSorter, HashMap<Pkgbase, Vec<BuildReason>>) {
        let mut depmap = HashMap::new();
        for p in pkgs {
            depmap.insert(Pkgbase::from(*p), HashSet::new());
        }
        let build_reasons: HashMap<Pkgbase, Vec<BuildReason>> = pkgs
            .iter()
            .map(|p| ((*p).into(), vec![BuildReason::Cmdline { runner: None }]))
            .collect();
        let sorter = BuildSorter::new(depmap, &build_reasons, priorities);
        (sorter, build_reasons)
    }

    #[tokio::test]
    async fn big_package_promotion_moves_last_of_tier_to_front() {
        let pkgs = ["p1", "p2", "p3", "p4", "p5"];
        let priorities: HashMap<Pkgbase, i32> = pkgs.iter().map(|p| ((*p).into(), 3)).collect();
        let (mut sorter, build_reasons) = make_sorter(&pkgs, priorities);
        let metadata = HashMap::new();
        let failed = FailedMap::new();
        let db = NullDatabase;
        let resolver = AlwaysSatisfied;
        let reporter = NullReporter;
        let resources = FixedResourceSampler(ResourceSnapshot {
            cpu_ratio: 0.3,
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

        let picks = picker.pick(&HashSet::new(), 5, false).await.unwrap();
        let order: Vec<String> = picks.iter().map(|p| p.pkgbase.to_string()).collect();
        assert_eq!(order[0], "p5");
    }

    #[tokio::test]
    async fn failed_by_deps_with_unresolved_dep_is_marked_done_without_pick() {
        let pkgs = ["a"];
        let (mut sorter, mut build_reasons) = make_sorter(&pkgs, HashMap::new());
        build_reasons.insert(
            "a".into(),
            vec![BuildReason::FailedByDeps {
                deps: vec!["missing".to_string()],
            }],
        );
        let metadata = HashMap::new();
        let failed = FailedMap::new();
        let db = NullDatabase;

        struct NeverSatisfied;
        impl DependencyResolver for NeverSatisfied {
            fn is_satisfied(&self, _dep: &Dependency) -> bool {
                false
            }
        }
        let resolver = NeverSatisfied;
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

        let picks = picker.pick(&HashSet::new(), 5, false).await.unwrap();
        assert!(picks.is_empty());
        assert!(!picker.sorter.is_active());
    }

    #[test]
    fn cpu_intensity_defaults_to_one_without_history() {
        let rusages = HashMap::new();
        assert_eq!(cpu_intensity(&"a".into(), &rusages), 1.0);

        let mut with_history = HashMap::new();
        with_history.insert(
            Pkgbase::from("a"),
            Rusage {
                cputime: Duration::from_secs(5),
                elapsed: Duration::from_secs(10),
                memory: 0,
            },
        );
        assert_eq!(cpu_intensity(&"a".into(), &with_history), 0.5);
    }
}
