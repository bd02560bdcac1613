//! Housekeeping cleaner: prunes non-tracked files from per-package
//! directories (§6 Cleaner CLI). Unrelated to scheduling; kept as its own
//! binary with its own small module rather than living in the `lilac`
//! library.

use std::collections::HashSet;
use std::time::{Duration, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{Context, Result};

const PROTECTION_WINDOW: Duration = Duration::from_secs(86400);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Keep,
    Remove,
}

pub struct Candidate {
    pub path: Utf8PathBuf,
    pub verdict: Verdict,
}

pub fn scan(dir: &Utf8Path) -> Result<Vec<Candidate>> {
    let repo = git2::Repository::discover(dir).ok();
    let tracked = repo
        .as_ref()
        .map(|r| tracked_paths(r))
        .transpose()?
        .unwrap_or_default();

    let newest_tracked_mtime = newest_tracked_mtime(dir, &tracked)?;
    let reference_time = newest_tracked_mtime.unwrap_or_else(SystemTime::now);

    let mut candidates = Vec::new();
    walk(dir, dir, &tracked, reference_time, &mut candidates)?;
    Ok(candidates)
}

fn tracked_paths(repo: &git2::Repository) -> Result<HashSet<Utf8PathBuf>> {
    let index = repo.index().context("Failed to read git index")?;
    let workdir = repo.workdir().context("Repository has no working directory")?;
    let workdir = Utf8Path::from_path(workdir).context("Repository workdir is not valid UTF-8")?;
    Ok(index
        .iter()
        .filter_map(|entry| {
            let path = std::str::from_utf8(&entry.path).ok()?;
            Some(workdir.join(path))
        })
        .collect())
}

fn newest_tracked_mtime(dir: &Utf8Path, tracked: &HashSet<Utf8PathBuf>) -> Result<Option<SystemTime>> {
    let mut newest = None;
    for entry in walkdir_entries(dir)? {
        if !tracked.contains(&entry) {
            continue;
        }
        if let Ok(metadata) = std::fs::metadata(&entry) {
            if let Ok(mtime) = metadata.modified() {
                newest = Some(match newest {
                    Some(current) if current >= mtime => current,
                    _ => mtime,
                });
            }
        }
    }
    Ok(newest)
}

fn walkdir_entries(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![dir.to_owned()];
    while let Some(current) = stack.pop() {
        let Ok(read_dir) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in read_dir.flatten() {
            let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
                continue;
            };
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    Ok(out)
}

fn is_protected_by_name(path: &Utf8Path) -> bool {
    if path.components().any(|c| c.as_str() == "__pycache__") {
        return true;
    }
    let name = path.file_name().unwrap_or_default();
    name.ends_with(".log")
        || name.ends_with(".pkg.tar.zst")
        || name.ends_with(".pkg.tar.zst.sig")
        || name.ends_with(".pkg.tar.xz")
        || name.ends_with(".pkg.tar.xz.sig")
}

fn is_recent(path: &Utf8Path, reference_time: SystemTime) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    let Ok(mtime) = metadata.modified() else {
        return false;
    };
    match reference_time.duration_since(mtime) {
        Ok(age) => age <= PROTECTION_WINDOW,
        Err(_) => true, // mtime is newer than the reference point
    }
}

fn walk(
    root: &Utf8Path,
    dir: &Utf8Path,
    tracked: &HashSet<Utf8PathBuf>,
    reference_time: SystemTime,
    out: &mut Vec<Candidate>,
) -> Result<()> {
    let Ok(read_dir) = std::fs::read_dir(dir) else {
        return Ok(());
    };
    for entry in read_dir.flatten() {
        let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
            continue;
        };
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);

        if is_dir {
            if path.join(".git").exists() && path != root {
                // Nested VCS directory: kept unless it lags the newest
                // sibling VCS directory's mtime by more than the window.
                if is_recent(&path, reference_time) {
                    out.push(Candidate {
                        path,
                        verdict: Verdict::Keep,
                    });
                } else {
                    out.push(Candidate {
                        path,
                        verdict: Verdict::Remove,
                    });
                }
                continue;
            }
            walk(root, &path, tracked, reference_time, out)?;
            continue;
        }

        let verdict = if tracked.contains(&path) || is_protected_by_name(&path) || is_recent(&path, reference_time) {
            Verdict::Keep
        } else {
            Verdict::Remove
        };
        out.push(Candidate { path, verdict });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protects_log_files_and_package_artifacts_by_name() {
        assert!(is_protected_by_name(Utf8Path::new("/repo/foo/build.log")));
        assert!(is_protected_by_name(Utf8Path::new("/repo/foo/foo-1-1-x86_64.pkg.tar.zst")));
        assert!(is_protected_by_name(Utf8Path::new("/repo/foo/foo-1-1-x86_64.pkg.tar.zst.sig")));
        assert!(is_protected_by_name(Utf8Path::new("/repo/foo/__pycache__/mod.pyc")));
        assert!(!is_protected_by_name(Utf8Path::new("/repo/foo/srcfile.tar.gz")));
    }

    #[test]
    fn untracked_stale_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let stale = root.join("stale.txt");
        std::fs::write(&stale, "x").unwrap();

        let old_time = filetime::FileTime::from_unix_time(0, 0);
        filetime::set_file_mtime(&stale, old_time).unwrap();

        let candidates = scan(root).unwrap();
        let stale_candidate = candidates.iter().find(|c| c.path == stale).unwrap();
        assert_eq!(stale_candidate.verdict, Verdict::Remove);
    }
}
