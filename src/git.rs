use std::path::{Path, PathBuf};

use git2::build::CheckoutBuilder;
use git2::{
    BranchType, CheckoutNotificationType, ErrorCode, IndexAddOption, Repository, Signature,
};

use crate::{mlog_debug, mlog_warn, Result};

/// Outcome of merging a task branch into the base branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult {
    /// The task branch carried nothing new.
    UpToDate,
    /// The base branch was moved forward to the task branch.
    FastForward(String),
    /// A merge commit was created on the base branch.
    Merged(String),
    /// The merge did not apply cleanly; the base branch is untouched.
    Conflicted(Vec<String>),
}

pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        mlog_debug!("GitOps::new path={}", repo_path.display());
        let _ = Repository::discover(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Create `branch` at the tip of `base` (or HEAD) and check it out into a
    /// new worktree. An existing branch of the same name is reset, so a retried
    /// task starts from the current base. Returns the base commit id.
    pub fn create_worktree(
        &self,
        branch: &str,
        worktree_path: &Path,
        base: Option<&str>,
    ) -> Result<String> {
        mlog_debug!(
            "GitOps::create_worktree branch={} path={} base={:?}",
            branch,
            worktree_path.display(),
            base
        );
        let repo = self.repo()?;
        let commit = match base {
            Some(name) => repo
                .find_branch(name, BranchType::Local)?
                .get()
                .peel_to_commit()?,
            None => repo.head()?.peel_to_commit()?,
        };
        let branch_ref = repo.branch(branch, &commit, true)?.into_reference();

        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        // Branch names contain slashes; the folder name is a safe worktree name.
        let worktree_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(branch);
        repo.worktree(worktree_name, worktree_path, Some(&opts))?;
        mlog_debug!("Worktree {} created from {}", worktree_name, commit.id());
        Ok(commit.id().to_string())
    }

    /// Remove a worktree and its admin directory, tolerating partial state.
    ///
    /// The admin directory must go too, otherwise git still considers the
    /// branch checked out and it cannot be deleted or re-used.
    pub fn remove_worktree(&self, worktree_path: &Path) -> Result<()> {
        mlog_debug!("GitOps::remove_worktree path={}", worktree_path.display());
        let repo = self.repo()?;
        let worktrees = repo.worktrees()?;

        let folder_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|s| s.to_string());

        let worktree_name: Option<String> = worktrees
            .iter()
            .flatten()
            .find(|name| {
                repo.find_worktree(name)
                    .map(|wt| wt.path() == worktree_path)
                    .unwrap_or(false)
                    || folder_name.as_deref() == Some(*name)
            })
            .map(|s| s.to_string());

        if let Some(ref name) = worktree_name {
            if let Ok(worktree) = repo.find_worktree(name) {
                let _ = worktree.unlock();
                if let Err(e) = worktree.prune(Some(
                    git2::WorktreePruneOptions::new()
                        .valid(true)
                        .working_tree(true)
                        .locked(true),
                )) {
                    mlog_warn!("Worktree prune failed for '{}': {}", name, e);
                }
            }
        }

        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)?;
        }

        for name in worktree_name.iter().chain(folder_name.iter()) {
            let admin_dir = repo.path().join("worktrees").join(name);
            if admin_dir.exists() {
                mlog_debug!("Cleaning up worktree admin dir: {}", admin_dir.display());
                let _ = std::fs::remove_dir_all(&admin_dir);
            }
        }
        Ok(())
    }

    /// Stage and commit everything in the worktree. Returns `None` when the
    /// worktree is clean.
    pub fn commit_all(&self, worktree_path: &Path, message: &str) -> Result<Option<String>> {
        let repo = Repository::open(worktree_path)?;
        if repo.statuses(None)?.is_empty() {
            mlog_debug!("GitOps::commit_all nothing to commit in {}", worktree_path.display());
            return Ok(None);
        }

        let mut index = repo.index()?;
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["."].iter(), None)?;
        index.write()?;

        let tree = repo.find_tree(index.write_tree()?)?;
        let sig = signature(&repo)?;
        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        mlog_debug!("Commit created: {} in {}", commit_id, worktree_path.display());
        Ok(Some(commit_id.to_string()))
    }

    /// Merge `source` into `target` without touching any worktree except the
    /// one that has `target` checked out.
    ///
    /// The new commit is checked out into that worktree before the branch ref
    /// moves, so a checkout that would clobber local edits leaves both the
    /// ref and the files untouched and is reported as a conflict.
    pub fn merge_branch(&self, target: &str, source: &str, message: &str) -> Result<MergeResult> {
        mlog_debug!("GitOps::merge_branch {} -> {}", source, target);
        let repo = self.repo()?;
        let target_ref = format!("refs/heads/{}", target);
        let ours = repo.find_reference(&target_ref)?.peel_to_commit()?;
        let theirs = repo
            .find_branch(source, BranchType::Local)?
            .get()
            .peel_to_commit()?;

        let base = repo.merge_base(ours.id(), theirs.id())?;
        if base == theirs.id() {
            return Ok(MergeResult::UpToDate);
        }

        let (new_id, result) = if base == ours.id() {
            (theirs.id(), MergeResult::FastForward(theirs.id().to_string()))
        } else {
            let mut index = repo.merge_commits(&ours, &theirs, None)?;
            if index.has_conflicts() {
                let mut files: Vec<String> = index
                    .conflicts()?
                    .flatten()
                    .filter_map(|c| c.our.or(c.their).or(c.ancestor))
                    .map(|entry| String::from_utf8_lossy(&entry.path).into_owned())
                    .collect();
                files.sort();
                files.dedup();
                mlog_debug!("Merge of {} into {} conflicts in {:?}", source, target, files);
                return Ok(MergeResult::Conflicted(files));
            }
            let tree = repo.find_tree(index.write_tree_to(&repo)?)?;
            let sig = signature(&repo)?;
            let id = repo.commit(None, &sig, &sig, message, &tree, &[&ours, &theirs])?;
            (id, MergeResult::Merged(id.to_string()))
        };

        if let Err(files) = self.checkout_if_head(&repo, &target_ref, new_id) {
            mlog_warn!(
                "Merge of {} into {} blocked by local changes in {:?}",
                source,
                target,
                files
            );
            return Ok(MergeResult::Conflicted(files));
        }
        repo.reference(&target_ref, new_id, true, message)?;
        Ok(result)
    }

    /// When the main working tree has `target_ref` checked out, bring its
    /// files and index to `commit_id`. Locally modified files are never
    /// overwritten; the paths that block the checkout are returned instead.
    fn checkout_if_head(
        &self,
        repo: &Repository,
        target_ref: &str,
        commit_id: git2::Oid,
    ) -> std::result::Result<(), Vec<String>> {
        if repo.is_bare() {
            return Ok(());
        }
        let on_target = repo
            .head()
            .ok()
            .and_then(|h| h.name().map(|n| n == target_ref))
            .unwrap_or(false);
        if !on_target {
            return Ok(());
        }

        let commit = repo
            .find_commit(commit_id)
            .map_err(|e| vec![e.message().to_string()])?;
        let mut blocked: Vec<String> = Vec::new();
        let outcome = {
            let mut opts = CheckoutBuilder::new();
            opts.safe()
                .notify_on(CheckoutNotificationType::CONFLICT)
                .notify(|_, path, _, _, _| {
                    if let Some(path) = path {
                        blocked.push(path.to_string_lossy().into_owned());
                    }
                    true
                });
            repo.checkout_tree(commit.as_object(), Some(&mut opts))
        };
        match outcome {
            Ok(()) => Ok(()),
            Err(e) => {
                if blocked.is_empty() {
                    blocked.push(e.message().to_string());
                }
                blocked.sort();
                blocked.dedup();
                Err(blocked)
            }
        }
    }

    /// Name of the branch checked out in the main working tree.
    pub fn current_branch(&self) -> Result<String> {
        let repo = self.repo()?;
        let head = repo.head()?;
        match head.shorthand() {
            Some(name) if head.is_branch() => Ok(name.to_string()),
            _ => Err(crate::Error::Validation(
                "HEAD is detached; configure workspaces.base_branch".to_string(),
            )),
        }
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        if let Err(e) = repo.find_branch(branch, BranchType::Local) {
            if e.code() == ErrorCode::NotFound {
                return Ok(false);
            }
            return Err(e.into());
        }
        Ok(true)
    }

    /// Delete a local branch. Missing branches are not an error.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        mlog_debug!("GitOps::delete_branch branch={}", branch);
        let repo = self.repo()?;
        match repo.find_branch(branch, BranchType::Local) {
            Ok(mut branch_ref) => {
                if let Err(e) = branch_ref.delete() {
                    mlog_warn!("Failed to delete branch '{}': {}", branch, e);
                }
            }
            Err(e) if e.code() == ErrorCode::NotFound => {}
            Err(e) => mlog_warn!("Error looking up branch '{}': {}", branch, e),
        }
        Ok(())
    }
}

fn signature(repo: &Repository) -> Result<Signature<'static>> {
    Ok(repo
        .signature()
        .or_else(|_| Signature::now("Maestro", "maestro@localhost"))?)
}
