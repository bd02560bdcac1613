//! A package's effective priority: the minimum priority class across its
//! own reasons and the reasons of everything that (transitively) depends
//! on it (§4.4).

use std::collections::{HashMap, HashSet, VecDeque};

use crate::reason::BuildReason;
use crate::Pkgbase;

/// `revdepmap[p]` is `{ q | p is one of q's build-time dependencies }` —
/// i.e. the packages that depend on (and thus wait on) `p`.
///
/// Rationale: a leaf package's urgency is inherited from everything
/// waiting on it. A pkgrel-triggered leaf sits at priority 0 on its own;
/// something several layers downstream, urgent for some other reason,
/// pulls that same leaf to priority 0 as well.
pub fn building_priority(
    p: &Pkgbase,
    revdepmap: &HashMap<Pkgbase, HashSet<Pkgbase>>,
    build_reasons: &HashMap<Pkgbase, Vec<BuildReason>>,
) -> i32 {
    let mut visited: HashSet<Pkgbase> = HashSet::from([p.clone()]);
    let mut queue: VecDeque<Pkgbase> = VecDeque::from([p.clone()]);
    let mut closure: Vec<Pkgbase> = Vec::new();

    while let Some(current) = queue.pop_front() {
        closure.push(current.clone());
        if let Some(dependents) = revdepmap.get(&current) {
            for dependent in dependents {
                if visited.insert(dependent.clone()) {
                    queue.push_back(dependent.clone());
                }
            }
        }
    }

    closure
        .iter()
        .filter_map(|pkg| build_reasons.get(pkg))
        .flatten()
        // `Depended` carries no priority of its own: the depender it names
        // is already part of the closure, and its *other* reasons (if any)
        // are what should count.
        .filter(|reason| !matches!(reason, BuildReason::Depended { .. }))
        .map(|reason| reason.priority_class() as i32)
        .min()
        .unwrap_or(3)
}

/// Precomputes `building_priority` for every package that has reasons or
/// appears in `revdepmap`, to avoid recomputing the closure on every
/// `priority_of` lookup in the sorter.
pub fn precompute_priorities(
    all_pkgs: impl Iterator<Item = Pkgbase>,
    revdepmap: &HashMap<Pkgbase, HashSet<Pkgbase>>,
    build_reasons: &HashMap<Pkgbase, Vec<BuildReason>>,
) -> HashMap<Pkgbase, i32> {
    all_pkgs
        .map(|pkg| {
            let priority = building_priority(&pkg, revdepmap, build_reasons);
            (pkg, priority)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_inherits_urgency_from_dependents() {
        // b depends on a (revdepmap[a] = {b}); b is urgent (UpdatedPkgrel).
        let mut revdepmap = HashMap::new();
        revdepmap.insert(Pkgbase::from("a"), HashSet::from([Pkgbase::from("b")]));

        let mut build_reasons = HashMap::new();
        build_reasons.insert(
            Pkgbase::from("a"),
            vec![BuildReason::Cmdline { runner: None }], // priority 3 on its own
        );
        build_reasons.insert(Pkgbase::from("b"), vec![BuildReason::UpdatedPkgrel]); // priority 0

        let priority = building_priority(&Pkgbase::from("a"), &revdepmap, &build_reasons);
        assert_eq!(priority, 0);
    }

    #[test]
    fn attaching_updated_pkgrel_never_raises_priority() {
        let revdepmap = HashMap::new();
        let mut build_reasons = HashMap::new();
        build_reasons.insert(Pkgbase::from("a"), vec![BuildReason::Cmdline { runner: None }]);
        let before = building_priority(&Pkgbase::from("a"), &revdepmap, &build_reasons);

        build_reasons
            .get_mut(&Pkgbase::from("a"))
            .unwrap()
            .push(BuildReason::UpdatedPkgrel);
        let after = building_priority(&Pkgbase::from("a"), &revdepmap, &build_reasons);

        assert!(after <= before);
    }

    #[test]
    fn depended_reason_alone_falls_back_to_default() {
        let revdepmap = HashMap::new();
        let mut build_reasons = HashMap::new();
        build_reasons.insert(
            Pkgbase::from("a"),
            vec![BuildReason::Depended {
                depender: "b".into(),
            }],
        );
        assert_eq!(building_priority(&Pkgbase::from("a"), &revdepmap, &build_reasons), 3);
    }
}
