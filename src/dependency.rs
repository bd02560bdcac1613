//! Dependency edges between managed packages, and the maps built from them
//! (§3 Data model: `Dependency`, `DependencyMap`, `BuildDependencyMap`).

use std::collections::{HashMap, HashSet};

use camino::Utf8PathBuf;
use color_eyre::eyre::{Context, Result};
use serde::Deserialize;

use crate::Pkgbase;

/// A directed edge `(from_pkgbase -> dep_pkgbase)`. The on-disk directory
/// name of the dependency is carried alongside the pkgbase because the two
/// occasionally diverge (split packages, renamed directories).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dependency {
    pub dep_pkgbase: Pkgbase,
    pub dirname: String,
}

/// Decides whether a dependency is currently satisfied from the
/// installed/built-artifact perspective. An external collaborator: the
/// batch controller is handed one and never inspects the filesystem
/// itself.
pub trait DependencyResolver: Send + Sync {
    fn is_satisfied(&self, dep: &Dependency) -> bool;
}

/// Considers a dependency satisfied if a built package artifact for it
/// exists directly under `destdir`.
pub struct ArtifactDependencyResolver {
    pub destdir: Utf8PathBuf,
}

impl DependencyResolver for ArtifactDependencyResolver {
    fn is_satisfied(&self, dep: &Dependency) -> bool {
        match std::fs::read_dir(&self.destdir) {
            Ok(entries) => entries.filter_map(|e| e.ok()).any(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with(&format!("{}-", dep.dirname))
            }),
            Err(_) => false,
        }
    }
}

pub type DependencyMap = HashMap<Pkgbase, HashSet<Dependency>>;
pub type BuildDependencyMap = HashMap<Pkgbase, HashSet<Dependency>>;

#[derive(Debug, Clone, Default, Deserialize)]
struct DepsToml {
    #[serde(default)]
    depends: Vec<String>,
    #[serde(default)]
    makedepends: Vec<String>,
}

/// Reads a package's runtime/build dependency lists. An external
/// collaborator standing in for PKGBUILD/.SRCINFO parsing, which is out of
/// this system's scope (§1).
pub trait RecipeReader {
    fn read_dependencies(&self, pkgbase: &Pkgbase) -> Result<(HashSet<Dependency>, HashSet<Dependency>)>;
}

pub struct TomlRecipeReader {
    pub repodir: Utf8PathBuf,
}

impl RecipeReader for TomlRecipeReader {
    fn read_dependencies(
        &self,
        pkgbase: &Pkgbase,
    ) -> Result<(HashSet<Dependency>, HashSet<Dependency>)> {
        let path = self.repodir.join(pkgbase.as_ref()).join("deps.toml");
        let parsed: DepsToml = match std::fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).wrap_err_with(|| format!("Failed to parse {path}"))?,
            Err(_) => DepsToml::default(),
        };

        let to_deps = |names: Vec<String>| {
            names
                .into_iter()
                .map(|name| Dependency {
                    dep_pkgbase: name.clone().into(),
                    dirname: name,
                })
                .collect()
        };

        Ok((to_deps(parsed.depends), to_deps(parsed.makedepends)))
    }
}

/// Builds `DEPMAP` and `BUILD_DEPMAP`, restricted to the managed set.
/// Entries referencing unmanaged dependencies are logged and removed, per
/// the invariant in §3.
pub fn build_dependency_maps(
    reader: &dyn RecipeReader,
    managed: &[Pkgbase],
) -> Result<(DependencyMap, BuildDependencyMap)> {
    let managed_set: HashSet<&Pkgbase> = managed.iter().collect();
    let mut depmap = DependencyMap::new();
    let mut build_depmap = BuildDependencyMap::new();

    for pkgbase in managed {
        let (deps, build_deps) = reader
            .read_dependencies(pkgbase)
            .wrap_err_with(|| format!("Failed to read dependencies of {pkgbase}"))?;

        let filter = |deps: HashSet<Dependency>, pkgbase: &Pkgbase| {
            deps.into_iter()
                .filter(|dep| {
                    let keep = managed_set.contains(&dep.dep_pkgbase);
                    if !keep {
                        tracing::warn!(
                            pkgbase = %pkgbase,
                            dependency = %dep.dep_pkgbase,
                            "Dropping dependency on unmanaged package"
                        );
                    }
                    keep
                })
                .collect::<HashSet<_>>()
        };

        depmap.insert(pkgbase.clone(), filter(deps, pkgbase));
        build_depmap.insert(pkgbase.clone(), filter(build_deps, pkgbase));
    }

    Ok((depmap, build_depmap))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedReader(HashMap<Pkgbase, (HashSet<Dependency>, HashSet<Dependency>)>);

    impl RecipeReader for FixedReader {
        fn read_dependencies(
            &self,
            pkgbase: &Pkgbase,
        ) -> Result<(HashSet<Dependency>, HashSet<Dependency>)> {
            Ok(self.0.get(pkgbase).cloned().unwrap_or_default())
        }
    }

    fn dep(name: &str) -> Dependency {
        Dependency {
            dep_pkgbase: name.into(),
            dirname: name.to_string(),
        }
    }

    #[test]
    fn drops_dependencies_on_unmanaged_packages() {
        let mut fixed = HashMap::new();
        fixed.insert(
            Pkgbase::from("a"),
            (HashSet::from([dep("b"), dep("unmanaged")]), HashSet::new()),
        );
        let reader = FixedReader(fixed);

        let (depmap, _) =
            build_dependency_maps(&reader, &[Pkgbase::from("a"), Pkgbase::from("b")]).unwrap();

        let deps = &depmap[&Pkgbase::from("a")];
        assert_eq!(deps.len(), 1);
        assert!(deps.contains(&dep("b")));
    }
}
