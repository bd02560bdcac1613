//! Per-package build metadata: update sources, throttles, maintainers, and
//! `update_on_build` cross-references (§1 lilac-info loader, §4.1 item 1,
//! §9 SUPPLEMENT "Lilac-info loader").

use std::collections::HashMap;
use std::time::Duration;

use camino::Utf8Path;
use color_eyre::eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{FailedMap, Pkgbase};

/// One upstream update source configured for a package (an nvchecker
/// source descriptor, simplified to what the scheduler needs).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSource {
    pub name: String,
    #[serde(default)]
    pub manual: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageMetadata {
    #[serde(default)]
    pub maintainers: Vec<String>,
    #[serde(default)]
    pub update_on_build: Vec<Pkgbase>,
    #[serde(default)]
    pub update_sources: Vec<UpdateSource>,
    /// Source index -> minimum interval between rechecks.
    #[serde(default, with = "throttle_serde")]
    pub throttle_info: HashMap<usize, Duration>,
}

mod throttle_serde {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        map: &HashMap<usize, Duration>,
        ser: S,
    ) -> Result<S::Ok, S::Error> {
        let as_secs: HashMap<String, u64> = map
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_secs()))
            .collect();
        as_secs.serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        de: D,
    ) -> Result<HashMap<usize, Duration>, D::Error> {
        let as_secs: HashMap<String, u64> = HashMap::deserialize(de)?;
        Ok(as_secs
            .into_iter()
            .filter_map(|(k, v)| k.parse::<usize>().ok().map(|k| (k, Duration::from_secs(v))))
            .collect())
    }
}

/// Loads per-package metadata for the managed set. An external collaborator
/// per spec.md §1; packages whose metadata can't be loaded land in the
/// returned `FailedMap` with an empty missing-dependency list, matching
/// §4.8 step 3 ("produces an initial failed map for load failures").
pub trait LilacInfoLoader {
    fn load_all(&self, managed: &[Pkgbase]) -> Result<(HashMap<Pkgbase, PackageMetadata>, FailedMap)>;
}

/// Reads `<repodir>/<pkgbase>/lilac.toml` for each managed package.
pub struct TomlLilacInfoLoader {
    pub repodir: camino::Utf8PathBuf,
}

impl TomlLilacInfoLoader {
    pub fn new(repodir: impl AsRef<Utf8Path>) -> Self {
        Self {
            repodir: repodir.as_ref().to_owned(),
        }
    }

    fn load_one(&self, pkgbase: &Pkgbase) -> Result<PackageMetadata> {
        let path = self.repodir.join(pkgbase.as_ref()).join("lilac.toml");
        let contents = std::fs::read_to_string(&path)
            .wrap_err_with(|| format!("Failed to read {path}"))?;
        toml::from_str(&contents).wrap_err_with(|| format!("Failed to parse {path}"))
    }
}

impl LilacInfoLoader for TomlLilacInfoLoader {
    fn load_all(
        &self,
        managed: &[Pkgbase],
    ) -> Result<(HashMap<Pkgbase, PackageMetadata>, FailedMap)> {
        let mut metadata = HashMap::new();
        let mut failed = FailedMap::new();

        for pkgbase in managed {
            match self.load_one(pkgbase) {
                Ok(meta) => {
                    metadata.insert(pkgbase.clone(), meta);
                }
                Err(e) => {
                    tracing::warn!(pkgbase = %pkgbase, error = %e, "Failed to load lilac.toml");
                    failed.insert(pkgbase.clone(), Vec::new());
                }
            }
        }

        Ok((metadata, failed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_metadata_for_present_packages_and_faults_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let repodir = camino::Utf8Path::from_path(dir.path()).unwrap();
        let pkg_dir = repodir.join("foo");
        std::fs::create_dir_all(&pkg_dir).unwrap();
        std::fs::write(
            pkg_dir.join("lilac.toml"),
            r#"
                maintainers = ["alice"]
                update_on_build = ["bar"]

                [[update_sources]]
                name = "github"
            "#,
        )
        .unwrap();

        let loader = TomlLilacInfoLoader::new(repodir);
        let (metadata, failed) =
            loader.load_all(&[Pkgbase::from("foo"), Pkgbase::from("missing")]).unwrap();

        assert_eq!(metadata.len(), 1);
        assert_eq!(metadata[&Pkgbase::from("foo")].maintainers, vec!["alice"]);
        assert!(failed.contains_key(&Pkgbase::from("missing")));
    }
}
