//! Topological readiness tracker with admission control hooks (§4.3).

use std::collections::{HashMap, HashSet};

use crate::reason::BuildReason;
use crate::Pkgbase;

/// Wraps a topological sort of `dep_building_map` with two additions over a
/// plain Kahn's-algorithm frontier:
///
/// - **Filter on emit**: packages pulled into the graph only for ordering
///   (absent from `build_reasons`) are marked done the instant they become
///   ready, without ever entering the `ready` set.
/// - **Idempotent `done`**: safe to call more than once for the same
///   package, tolerating the admission picker's evaluate-twice pattern
///   (regular + starvation rounds).
pub struct BuildSorter {
    remaining: HashMap<Pkgbase, HashSet<Pkgbase>>,
    dependents: HashMap<Pkgbase, HashSet<Pkgbase>>,
    ready: HashSet<Pkgbase>,
    done: HashSet<Pkgbase>,
    build_reasons: HashSet<Pkgbase>,
    priorities: HashMap<Pkgbase, i32>,
}

impl BuildSorter {
    pub fn new(
        dep_building_map: HashMap<Pkgbase, HashSet<Pkgbase>>,
        build_reasons: &HashMap<Pkgbase, Vec<BuildReason>>,
        priorities: HashMap<Pkgbase, i32>,
    ) -> Self {
        let mut dependents: HashMap<Pkgbase, HashSet<Pkgbase>> = HashMap::new();
        for pkg in dep_building_map.keys() {
            dependents.entry(pkg.clone()).or_default();
        }
        for (pkg, deps) in &dep_building_map {
            for dep in deps {
                dependents.entry(dep.clone()).or_default().insert(pkg.clone());
            }
        }

        let mut sorter = Self {
            remaining: dep_building_map,
            dependents,
            ready: HashSet::new(),
            done: HashSet::new(),
            build_reasons: build_reasons.keys().cloned().collect(),
            priorities,
        };

        let seeds: Vec<Pkgbase> = sorter
            .remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(pkg, _)| pkg.clone())
            .collect();
        for seed in seeds {
            sorter.admit(seed);
        }

        sorter
    }

    fn admit(&mut self, pkg: Pkgbase) {
        if self.done.contains(&pkg) || self.ready.contains(&pkg) {
            return;
        }
        if self.build_reasons.contains(&pkg) {
            self.ready.insert(pkg);
        } else {
            self.mark_done(&pkg);
        }
    }

    fn mark_done(&mut self, pkg: &Pkgbase) {
        if !self.done.insert(pkg.clone()) {
            return;
        }
        self.ready.remove(pkg);

        let Some(dependents) = self.dependents.get(pkg).cloned() else {
            return;
        };
        for dependent in dependents {
            let Some(remaining) = self.remaining.get_mut(&dependent) else {
                continue;
            };
            remaining.remove(pkg);
            if remaining.is_empty() {
                self.admit(dependent);
            }
        }
    }

    /// Whether any tracked package is still outstanding.
    pub fn is_active(&self) -> bool {
        self.done.len() < self.remaining.len()
    }

    pub fn get_ready(&self) -> Vec<Pkgbase> {
        self.ready.iter().cloned().collect()
    }

    pub fn done(&mut self, pkg: &Pkgbase) {
        if !self.remaining.contains_key(pkg) {
            return;
        }
        self.mark_done(pkg);
    }

    pub fn priority_of(&self, pkg: &Pkgbase) -> i32 {
        self.priorities.get(pkg).copied().unwrap_or(i32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reasons_for(pkgs: &[&str]) -> HashMap<Pkgbase, Vec<BuildReason>> {
        pkgs.iter()
            .map(|p| ((*p).into(), vec![BuildReason::Cmdline { runner: None }]))
            .collect()
    }

    #[test]
    fn linear_chain_emits_in_dependency_order() {
        // a -> b -> c (b depends on a, c depends on b)
        let mut depmap: HashMap<Pkgbase, HashSet<Pkgbase>> = HashMap::new();
        depmap.insert("a".into(), HashSet::new());
        depmap.insert("b".into(), HashSet::from(["a".into()]));
        depmap.insert("c".into(), HashSet::from(["b".into()]));

        let build_reasons = reasons_for(&["a", "b", "c"]);
        let mut sorter = BuildSorter::new(depmap, &build_reasons, HashMap::new());

        assert_eq!(sorter.get_ready(), vec![Pkgbase::from("a")]);
        sorter.done(&"a".into());
        assert_eq!(sorter.get_ready(), vec![Pkgbase::from("b")]);
        sorter.done(&"b".into());
        assert_eq!(sorter.get_ready(), vec![Pkgbase::from("c")]);
        sorter.done(&"c".into());
        assert!(!sorter.is_active());
    }

    #[test]
    fn packages_without_reasons_are_auto_done() {
        let mut depmap: HashMap<Pkgbase, HashSet<Pkgbase>> = HashMap::new();
        depmap.insert("a".into(), HashSet::new());
        depmap.insert("b".into(), HashSet::from(["a".into()]));

        // Only b has a reason; a was pulled in purely for ordering.
        let build_reasons = reasons_for(&["b"]);
        let mut sorter = BuildSorter::new(depmap, &build_reasons, HashMap::new());

        // "a" should never appear in ready: it's marked done automatically.
        assert_eq!(sorter.get_ready(), vec![Pkgbase::from("b")]);
        sorter.done(&"b".into());
        assert!(!sorter.is_active());
    }

    #[test]
    fn done_is_idempotent() {
        let mut depmap: HashMap<Pkgbase, HashSet<Pkgbase>> = HashMap::new();
        depmap.insert("a".into(), HashSet::new());
        let build_reasons = reasons_for(&["a"]);
        let mut sorter = BuildSorter::new(depmap, &build_reasons, HashMap::new());

        sorter.done(&"a".into());
        sorter.done(&"a".into());
        sorter.done(&"a".into());
        assert!(!sorter.is_active());
    }
}
