use std::collections::HashMap;
use std::time::Duration;

use derive_more::{AsRef, Display};
use serde::{Deserialize, Serialize};

pub mod batch;
pub mod config;
pub mod db;
pub mod dependency;
pub mod driver;
pub mod graph;
pub mod metadata;
pub mod picker;
pub mod priority;
pub mod reason;
pub mod reason_assignment;
pub mod repo;
pub mod resource;
pub mod sorter;
pub mod state;
pub mod tracing;
pub mod version_checker;
pub mod worker;

/// Canonical name of a source package; may produce multiple binary packages.
#[derive(
    Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, AsRef, Display,
)]
#[serde(transparent)]
pub struct Pkgbase(String);

impl From<String> for Pkgbase {
    fn from(value: String) -> Self {
        Pkgbase(value)
    }
}

impl From<&str> for Pkgbase {
    fn from(value: &str) -> Self {
        Pkgbase(value.to_string())
    }
}

pub type Pkgname = String;
pub type Packager = String;
pub type PkgbaseMaintainers = HashMap<Pkgbase, Vec<Packager>>;

/// An unambiguous git commit hash.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, AsRef, Display)]
pub struct CommitHash(String);

impl From<String> for CommitHash {
    fn from(value: String) -> Self {
        CommitHash(value)
    }
}

impl From<CommitHash> for String {
    fn from(value: CommitHash) -> Self {
        value.0
    }
}

/// A target explicitly requested on the command line, optionally tagged
/// with an opaque runner string (`pkgbase:runner`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdlineTarget {
    pub pkgbase: Pkgbase,
    pub runner: Option<String>,
}

impl std::str::FromStr for CmdlineTarget {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((pkgbase, runner)) => Ok(CmdlineTarget {
                pkgbase: pkgbase.into(),
                runner: Some(runner.to_string()),
            }),
            None => Ok(CmdlineTarget {
                pkgbase: s.into(),
                runner: None,
            }),
        }
    }
}

/// Resource usage recorded for a prior build of a package.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rusage {
    pub cputime: Duration,
    pub elapsed: Duration,
    pub memory: u64,
}

impl Rusage {
    /// CPU time divided by wall-clock time; falls back to `1.0` when the
    /// caller has no historical data (see `priority::building_priority`).
    pub fn cpu_intensity(&self) -> f64 {
        if self.elapsed.as_secs_f64() == 0.0 {
            return 1.0;
        }
        self.cputime.as_secs_f64() / self.elapsed.as_secs_f64()
    }
}

/// Missing-dependency tuple recorded for a package that failed to build,
/// as persisted between batches (§3 Failed map).
pub type MissingDeps = Vec<Pkgname>;
pub type FailedMap = HashMap<Pkgbase, MissingDeps>;
