//! Consolidates managed-package dependencies into a build-order graph and
//! its reverse (§4.2).

use std::collections::{HashMap, HashSet, VecDeque};

use crate::dependency::{DependencyMap, DependencyResolver};
use crate::reason::BuildReason;
use crate::repo::Reporter;
use crate::Pkgbase;

pub struct DependencyGraph {
    /// pkg -> set of managed dep-pkgbases, including packages pulled in
    /// only for ordering (not necessarily present in `build_reasons`).
    pub dep_building_map: HashMap<Pkgbase, HashSet<Pkgbase>>,
    /// p -> { q | p in dep_building_map[q] }
    pub revdepmap: HashMap<Pkgbase, HashSet<Pkgbase>>,
}

/// Whether a package's last build attempt failed. An external collaborator
/// backed by the persistent database when enabled (§6 `is_last_build_failed`).
pub trait LastBuildFailed {
    fn is_last_build_failed(&self, pkgbase: &Pkgbase) -> bool;
}

pub struct FixedLastBuildFailed(pub HashSet<Pkgbase>);

impl LastBuildFailed for FixedLastBuildFailed {
    fn is_last_build_failed(&self, pkgbase: &Pkgbase) -> bool {
        self.0.contains(pkgbase)
    }
}

/// Builds the dependency graph from `DEPMAP` and `BUILD_DEPMAP`, restricted
/// to packages in `build_reasons`: a package cannot be attempted until both
/// its runtime and its build-time managed dependencies are built, so the
/// two maps are folded together into one building-order graph. Unresolved
/// managed dependencies gain a `Depended` reason; unresolved unmanaged ones
/// are reported.
pub fn build_dependency_graph(
    depmap: &DependencyMap,
    build_depmap: &DependencyMap,
    build_reasons: &mut HashMap<Pkgbase, Vec<BuildReason>>,
    managed: &HashSet<Pkgbase>,
    resolver: &dyn DependencyResolver,
    last_build_failed: &dyn LastBuildFailed,
    reporter: &dyn Reporter,
) -> DependencyGraph {
    let mut nonexistent: HashMap<Pkgbase, Vec<String>> = HashMap::new();
    let mut queue: VecDeque<Pkgbase> = build_reasons.keys().cloned().collect();
    let mut visited: HashSet<Pkgbase> = HashSet::new();
    let mut dep_building_map: HashMap<Pkgbase, HashSet<Pkgbase>> = HashMap::new();

    while let Some(pkg) = queue.pop_front() {
        if !visited.insert(pkg.clone()) {
            continue;
        }
        let deps = depmap.get(&pkg).into_iter().flatten().chain(build_depmap.get(&pkg).into_iter().flatten());

        let mut building_deps = HashSet::new();
        for dep in deps {
            if managed.contains(&dep.dep_pkgbase) {
                building_deps.insert(dep.dep_pkgbase.clone());

                if !resolver.is_satisfied(dep) && !last_build_failed.is_last_build_failed(&dep.dep_pkgbase) {
                    build_reasons
                        .entry(dep.dep_pkgbase.clone())
                        .or_default()
                        .push(BuildReason::Depended {
                            depender: pkg.clone(),
                        });
                }

                if !visited.contains(&dep.dep_pkgbase) {
                    queue.push_back(dep.dep_pkgbase.clone());
                }
            } else if !resolver.is_satisfied(dep) {
                nonexistent
                    .entry(pkg.clone())
                    .or_default()
                    .push(dep.dep_pkgbase.to_string());
            }
        }

        dep_building_map.insert(pkg, building_deps);
    }

    for (pkg, missing) in &nonexistent {
        reporter.report(
            Some(pkg),
            &format!("{pkg}: missing dependencies"),
            &format!(
                "The following dependencies of {pkg} could not be found in the managed set:\n{}",
                missing.join("\n")
            ),
        );
    }

    let mut revdepmap: HashMap<Pkgbase, HashSet<Pkgbase>> = HashMap::new();
    for (pkg, deps) in &dep_building_map {
        for dep in deps {
            revdepmap.entry(dep.clone()).or_default().insert(pkg.clone());
        }
    }

    DependencyGraph {
        dep_building_map,
        revdepmap,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::Dependency;

    struct AlwaysUnsatisfied;
    impl DependencyResolver for AlwaysUnsatisfied {
        fn is_satisfied(&self, _dep: &Dependency) -> bool {
            false
        }
    }

    struct NeverFailed;
    impl LastBuildFailed for NeverFailed {
        fn is_last_build_failed(&self, _pkgbase: &Pkgbase) -> bool {
            false
        }
    }

    struct NullReporter;
    impl Reporter for NullReporter {
        fn report(&self, _pkgbase: Option<&Pkgbase>, _subject: &str, _body: &str) {}
    }

    #[test]
    fn unresolved_managed_dependency_gets_depended_reason() {
        let mut depmap = DependencyMap::new();
        depmap.insert(
            Pkgbase::from("b"),
            HashSet::from([Dependency {
                dep_pkgbase: "a".into(),
                dirname: "a".to_string(),
            }]),
        );
        let managed = HashSet::from([Pkgbase::from("a"), Pkgbase::from("b")]);
        let mut build_reasons = HashMap::new();
        build_reasons.insert(Pkgbase::from("b"), vec![BuildReason::Cmdline { runner: None }]);

        let graph = build_dependency_graph(
            &depmap,
            &DependencyMap::new(),
            &mut build_reasons,
            &managed,
            &AlwaysUnsatisfied,
            &NeverFailed,
            &NullReporter,
        );

        assert!(build_reasons[&Pkgbase::from("a")]
            .iter()
            .any(|r| matches!(r, BuildReason::Depended { depender } if *depender == Pkgbase::from("b"))));
        assert!(graph.dep_building_map[&Pkgbase::from("b")].contains(&Pkgbase::from("a")));
        assert!(graph.revdepmap[&Pkgbase::from("a")].contains(&Pkgbase::from("b")));
    }
}
