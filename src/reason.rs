//! Why a package is being built this batch, and how urgently.

use serde::{Deserialize, Serialize};

use crate::Pkgbase;

/// Version string pair as reported by the version checker or the database.
pub type VersionPair = (String, String);

/// A single changed update-source within a package's `NvResults`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvSourceChange {
    pub source_idx: usize,
    pub source_name: String,
    pub old: String,
    pub new: String,
}

/// Cross-reference to a package whose rebuild was declared to trigger this
/// one (`update_on_build`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnBuildRef {
    pub pkgbase: Pkgbase,
}

/// Tagged sum of reasons a package is being considered for a build this
/// batch (§3 Data model, §9 Design notes — replaces the source's
/// `isinstance`-checked variants with an explicit enum and one constructor
/// per variant).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildReason {
    /// The build recipe's pkgrel counter changed since the last successful
    /// batch.
    UpdatedPkgrel,
    /// Upstream version check found changed sources.
    NvChecker {
        changes: Vec<NvSourceChange>,
        /// Whether any of the changed sources is configured as "manual".
        any_manual: bool,
    },
    /// Pulled into the batch because something that depends on it (directly
    /// or transitively) is being built.
    Depended { depender: Pkgbase },
    /// Failed in a prior batch and its recipe changed since then.
    UpdatedFailed,
    /// Failed in a prior batch due to missing dependencies that are still
    /// unresolved.
    FailedByDeps { deps: Vec<String> },
    /// Explicitly requested on the command line.
    Cmdline { runner: Option<String> },
    /// Rebuilt because a package it declares `update_on_build` on was
    /// rebuilt.
    OnBuild { update_on_build: Vec<OnBuildRef> },
}

impl BuildReason {
    /// Priority class of this reason alone (lower schedules earlier). For
    /// `Depended`, the caller must additionally account for the depender's
    /// own reasons — see `priority::building_priority`, which is the only
    /// correct way to obtain a package's *effective* priority.
    pub fn priority_class(&self) -> u8 {
        match self {
            BuildReason::UpdatedPkgrel => 0,
            BuildReason::NvChecker {
                changes,
                any_manual,
            } => {
                if *any_manual {
                    0
                } else if changes.len() > 1 || changes.iter().any(|c| c.source_idx > 0) {
                    1
                } else {
                    3
                }
            }
            BuildReason::UpdatedFailed => 2,
            BuildReason::FailedByDeps { .. } => 3,
            BuildReason::Cmdline { .. } => 3,
            BuildReason::OnBuild { .. } => 3,
            // Depended reasons are expanded by the priority module; a bare
            // class is never read for them, but keep a sane default.
            BuildReason::Depended { .. } => 3,
        }
    }

    pub fn display(&self) -> String {
        match self {
            BuildReason::UpdatedPkgrel => "pkgrel updated".to_string(),
            BuildReason::NvChecker { changes, .. } => {
                let pairs = changes
                    .iter()
                    .map(|c| format!("{}: {} -> {}", c.source_name, c.old, c.new))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("new version(s): {pairs}")
            }
            BuildReason::Depended { depender } => format!("depended on by {depender}"),
            BuildReason::UpdatedFailed => "failed previously, recipe changed".to_string(),
            BuildReason::FailedByDeps { deps } => {
                format!("previously failed due to missing deps: {}", deps.join(", "))
            }
            BuildReason::Cmdline { runner } => match runner {
                Some(r) => format!("requested on command line (runner: {r})"),
                None => "requested on command line".to_string(),
            },
            BuildReason::OnBuild { update_on_build } => {
                let names = update_on_build
                    .iter()
                    .map(|r| r.pkgbase.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("update_on_build triggered by: {names}")
            }
        }
    }

    pub fn is_on_build(&self) -> bool {
        matches!(self, BuildReason::OnBuild { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case(BuildReason::UpdatedPkgrel, 0)]
    #[case(BuildReason::UpdatedFailed, 2)]
    #[case(BuildReason::Cmdline { runner: None }, 3)]
    fn priority_class_matches_table(#[case] reason: BuildReason, #[case] expected: u8) {
        assert_eq!(reason.priority_class(), expected);
    }

    #[test]
    fn nvchecker_manual_source_is_always_priority_0() {
        let reason = BuildReason::NvChecker {
            changes: vec![NvSourceChange {
                source_idx: 0,
                source_name: "manual".into(),
                old: "1".into(),
                new: "2".into(),
            }],
            any_manual: true,
        };
        assert_eq!(reason.priority_class(), 0);
    }

    #[test]
    fn nvchecker_single_primary_source_is_priority_3() {
        let reason = BuildReason::NvChecker {
            changes: vec![NvSourceChange {
                source_idx: 0,
                source_name: "src".into(),
                old: "1".into(),
                new: "2".into(),
            }],
            any_manual: false,
        };
        assert_eq!(reason.priority_class(), 3);
    }

    #[test]
    fn nvchecker_secondary_source_is_priority_1() {
        let reason = BuildReason::NvChecker {
            changes: vec![NvSourceChange {
                source_idx: 1,
                source_name: "src".into(),
                old: "1".into(),
                new: "2".into(),
            }],
            any_manual: false,
        };
        assert_eq!(reason.priority_class(), 1);
    }
}
