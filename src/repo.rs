//! The package repository manager: git operations against the packages
//! checkout, and mail/error reporting (§1 external collaborator, §9
//! SUPPLEMENT).

use std::collections::HashSet;
use std::io::Write;
use std::process::{Command, Stdio};

use camino::Utf8PathBuf;
use color_eyre::eyre::{bail, Context, Result};
use git2::Repository;

use crate::{CommitHash, Pkgbase};

/// Sends error/status reports about individual packages (or the batch as a
/// whole, when `pkgbase` is `None`) to whoever is responsible for them.
pub trait Reporter: Send + Sync {
    fn report(&self, pkgbase: Option<&Pkgbase>, subject: &str, body: &str);
}

/// Shells out to `sendmail -t`, the way the teacher shells out to
/// `pkgctl`/`repo-add`/`gpg` rather than reimplementing a protocol.
pub struct SendmailReporter {
    pub maintainers: crate::PkgbaseMaintainers,
    pub operator_address: String,
}

impl Reporter for SendmailReporter {
    fn report(&self, pkgbase: Option<&Pkgbase>, subject: &str, body: &str) {
        let to = pkgbase
            .and_then(|p| self.maintainers.get(p))
            .filter(|m| !m.is_empty())
            .map(|m| m.join(", "))
            .unwrap_or_else(|| self.operator_address.clone());

        let message = format!("To: {to}\nSubject: {subject}\n\n{body}\n");

        let result = (|| -> Result<()> {
            let mut child = Command::new("sendmail")
                .arg("-t")
                .stdin(Stdio::piped())
                .spawn()
                .context("Failed to spawn sendmail")?;
            child
                .stdin
                .take()
                .expect("stdin was piped")
                .write_all(message.as_bytes())?;
            child.wait()?;
            Ok(())
        })();

        if let Err(e) = result {
            tracing::error!(error = %e, "Failed to send report mail");
        }
    }
}

/// Discards reports. Used in tests and when mail is not configured.
pub struct NullReporter;

impl Reporter for NullReporter {
    fn report(&self, _pkgbase: Option<&Pkgbase>, _subject: &str, _body: &str) {}
}

/// Git operations against the local packages checkout, generalizing the
/// teacher's per-repo `git.rs` helpers from "clone many GitLab packaging
/// repos" to "operate one local monorepo-style checkout".
pub struct PackageRepository {
    pub repo: Repository,
    pub path: Utf8PathBuf,
}

impl PackageRepository {
    pub fn open(path: impl Into<Utf8PathBuf>) -> Result<Self> {
        let path = path.into();
        let repo = Repository::open(path.as_std_path()).context("Failed to open package repository")?;
        Ok(Self { repo, path })
    }

    /// Name of the currently checked out branch, if HEAD points to one.
    pub fn current_branch(&self) -> Result<String> {
        let head = self.repo.head().context("Failed to read HEAD")?;
        if !head.is_branch() {
            bail!("HEAD is not on a branch");
        }
        Ok(head
            .shorthand()
            .context("Branch name is not valid UTF-8")?
            .to_string())
    }

    pub fn head_commit(&self) -> Result<CommitHash> {
        let oid = self.repo.head()?.peel_to_commit()?.id();
        Ok(CommitHash::from(oid.to_string()))
    }

    /// `git reset --hard HEAD`.
    pub fn reset_hard(&self) -> Result<()> {
        let head = self.repo.head()?.peel_to_commit()?;
        self.repo
            .reset(head.as_object(), git2::ResetType::Hard, None)
            .context("git reset --hard failed")
    }

    /// Fast-forwards the current branch to the remote tip (`git pull
    /// --ff-only`, the batch controller's "pull --override").
    pub fn pull_fast_forward(&self, remote_name: &str) -> Result<()> {
        let branch_name = self.current_branch()?;
        let mut remote = self.repo.find_remote(remote_name)?;
        remote.fetch(&[branch_name.as_str()], None, None)?;

        let remote_ref = self
            .repo
            .find_reference(&format!("refs/remotes/{remote_name}/{branch_name}"))?;
        let remote_commit = remote_ref.peel_to_commit()?;

        let mut local_ref = self.repo.find_reference(&format!("refs/heads/{branch_name}"))?;
        local_ref.set_target(remote_commit.id(), "lilac: fast-forward")?;
        self.repo
            .set_head(&format!("refs/heads/{branch_name}"))?;
        self.repo
            .checkout_head(Some(git2::build::CheckoutBuilder::default().force()))
            .context("Failed to checkout after pull")
    }

    /// Pkgbases with any file changed between two commits, restricted to
    /// the managed set (§4.8 step 5, `git_diff_pkgs`).
    pub fn changed_pkgbases(
        &self,
        old: &CommitHash,
        new: &CommitHash,
        managed: &HashSet<Pkgbase>,
    ) -> Result<HashSet<Pkgbase>> {
        let old_tree = self
            .repo
            .find_commit(git2::Oid::from_str(old.as_ref())?)?
            .tree()?;
        let new_tree = self
            .repo
            .find_commit(git2::Oid::from_str(new.as_ref())?)?
            .tree()?;
        let diff = self
            .repo
            .diff_tree_to_tree(Some(&old_tree), Some(&new_tree), None)?;

        let mut changed = HashSet::new();
        for delta in diff.deltas() {
            for file in [delta.old_file(), delta.new_file()] {
                let Some(path) = file.path() else { continue };
                let Some(first_component) = path.iter().next() else {
                    continue;
                };
                let pkgbase: Pkgbase = first_component.to_string_lossy().into_owned().into();
                if managed.contains(&pkgbase) {
                    changed.insert(pkgbase);
                }
            }
        }
        Ok(changed)
    }

    /// Reads a file's contents from a package's directory as of a given
    /// commit, or `None` if either the commit or the file doesn't exist.
    pub fn read_file_at(&self, commit: &CommitHash, pkgbase: &Pkgbase, filename: &str) -> Option<String> {
        let oid = git2::Oid::from_str(commit.as_ref()).ok()?;
        let tree = self.repo.find_commit(oid).ok()?.tree().ok()?;
        let path = format!("{pkgbase}/{filename}");
        let entry = tree.get_path(std::path::Path::new(&path)).ok()?;
        let blob = entry.to_object(&self.repo).ok()?.peel_to_blob().ok()?;
        String::from_utf8(blob.content().to_vec()).ok()
    }

    /// Whether any file under a package's directory differs between two commits.
    pub fn dir_changed_between(&self, old: &CommitHash, new: &CommitHash, pkgbase: &Pkgbase) -> Result<bool> {
        let single = HashSet::from([pkgbase.clone()]);
        Ok(!self.changed_pkgbases(old, new, &single)?.is_empty())
    }
}

/// Decides recipe-change questions for the reason-assignment pass by
/// diffing package directories between two commits of the package
/// repository (§4.1 items 2-3).
pub struct GitRecipeChangeChecker<'a> {
    pub repo: &'a PackageRepository,
    pub old: CommitHash,
    pub new: CommitHash,
}

impl crate::reason_assignment::RecipeChangeChecker for GitRecipeChangeChecker<'_> {
    /// A `pkgrel` marker file at the root of each package's directory
    /// carries the release counter; comparing its contents at the two
    /// commits stands in for parsing the build recipe itself (§1, out of
    /// scope).
    fn pkgrel_changed(&self, pkgbase: &Pkgbase) -> Result<bool> {
        let old = self.repo.read_file_at(&self.old, pkgbase, "pkgrel");
        let new = self.repo.read_file_at(&self.new, pkgbase, "pkgrel");
        Ok(old != new)
    }

    fn recipe_changed(&self, pkgbase: &Pkgbase) -> Result<bool> {
        self.repo.dir_changed_between(&self.old, &self.new, pkgbase)
    }
}
