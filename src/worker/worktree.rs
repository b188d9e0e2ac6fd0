//! Isolated per-task checkouts (`git worktree`) and orphan detection.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::WorkerError;

/// Creates, removes and lists isolated working trees of a repository.
#[async_trait]
pub trait WorkingTrees: Send + Sync {
    /// Check out `base` into `path` on a new `branch`.
    async fn create(
        &self,
        repo: &Path,
        path: &Path,
        branch: &str,
        base: &str,
    ) -> Result<(), WorkerError>;

    async fn remove(&self, repo: &Path, path: &Path) -> Result<(), WorkerError>;

    /// Every working tree the version-control tool knows of, main checkout first.
    async fn list(&self, repo: &Path) -> Result<Vec<PathBuf>, WorkerError>;
}

/// [`WorkingTrees`] backed by the `git` binary.
#[derive(Debug, Clone, Default)]
pub struct GitWorkingTrees;

impl GitWorkingTrees {
    async fn git(&self, repo: &Path, args: &[&str]) -> Result<String, WorkerError> {
        let output = tokio::process::Command::new("git")
            .arg("-C")
            .arg(repo)
            .args(args)
            .output()
            .await
            .map_err(|e| WorkerError::WorkingTree(format!("failed to run git: {e}")))?;
        if !output.status.success() {
            return Err(WorkerError::WorkingTree(format!(
                "git {} failed in {}: {}",
                args.first().copied().unwrap_or_default(),
                repo.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl WorkingTrees for GitWorkingTrees {
    async fn create(
        &self,
        repo: &Path,
        path: &Path,
        branch: &str,
        base: &str,
    ) -> Result<(), WorkerError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| WorkerError::WorkingTree(e.to_string()))?;
        }
        let path = path.to_string_lossy();
        self.git(repo, &["worktree", "add", "-b", branch, &path, base])
            .await?;
        Ok(())
    }

    async fn remove(&self, repo: &Path, path: &Path) -> Result<(), WorkerError> {
        let path = path.to_string_lossy();
        self.git(repo, &["worktree", "remove", "--force", &path])
            .await?;
        Ok(())
    }

    async fn list(&self, repo: &Path) -> Result<Vec<PathBuf>, WorkerError> {
        let out = self.git(repo, &["worktree", "list", "--porcelain"]).await?;
        Ok(parse_worktree_list(&out))
    }
}

/// Paths from `git worktree list --porcelain` output, in order.
pub fn parse_worktree_list(porcelain: &str) -> Vec<PathBuf> {
    porcelain
        .lines()
        .filter_map(|line| line.strip_prefix("worktree "))
        .map(PathBuf::from)
        .collect()
}

/// Working trees of `repo` that exist on disk but belong to no tracked task.
///
/// The main checkout is never an orphan. Any failure listing the trees
/// yields an empty list.
pub async fn find_orphans<'a>(
    trees: &dyn WorkingTrees,
    repo: &Path,
    tracked: impl IntoIterator<Item = &'a Path>,
) -> Vec<PathBuf> {
    let listed = match trees.list(repo).await {
        Ok(listed) => listed,
        Err(e) => {
            debug!(repo = %repo.display(), error = %e, "Could not list working trees");
            return Vec::new();
        }
    };

    let mut known = HashSet::new();
    for path in tracked {
        known.insert(normalize(path).await);
    }

    let mut orphans = Vec::new();
    for path in listed.into_iter().skip(1) {
        if !known.contains(&normalize(&path).await) {
            orphans.push(path);
        }
    }
    if !orphans.is_empty() {
        warn!(repo = %repo.display(), count = orphans.len(), "Found orphan working trees");
    }
    orphans
}

async fn normalize(path: &Path) -> PathBuf {
    tokio::fs::canonicalize(path)
        .await
        .unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedTrees(Result<Vec<PathBuf>, String>);

    #[async_trait]
    impl WorkingTrees for FixedTrees {
        async fn create(&self, _: &Path, _: &Path, _: &str, _: &str) -> Result<(), WorkerError> {
            Ok(())
        }

        async fn remove(&self, _: &Path, _: &Path) -> Result<(), WorkerError> {
            Ok(())
        }

        async fn list(&self, _: &Path) -> Result<Vec<PathBuf>, WorkerError> {
            self.0.clone().map_err(WorkerError::WorkingTree)
        }
    }

    #[test]
    fn parses_porcelain_output() {
        let out = "worktree /repos/api\nHEAD abc\nbranch refs/heads/main\n\n\
                   worktree /wt/task-1\nHEAD def\nbranch refs/heads/relay/task-1\n\n\
                   worktree /wt/task-2\nHEAD 123\ndetached\n";
        assert_eq!(
            parse_worktree_list(out),
            vec![
                PathBuf::from("/repos/api"),
                PathBuf::from("/wt/task-1"),
                PathBuf::from("/wt/task-2"),
            ]
        );
    }

    #[tokio::test]
    async fn untracked_trees_are_orphans() {
        let trees = FixedTrees(Ok(vec![
            PathBuf::from("/repos/api"),
            PathBuf::from("/wt/task-1"),
            PathBuf::from("/wt/task-2"),
        ]));
        let tracked = [PathBuf::from("/wt/task-1")];
        let orphans = find_orphans(
            &trees,
            Path::new("/repos/api"),
            tracked.iter().map(PathBuf::as_path),
        )
        .await;
        assert_eq!(orphans, vec![PathBuf::from("/wt/task-2")]);
    }

    #[tokio::test]
    async fn listing_failure_yields_empty() {
        let trees = FixedTrees(Err("not a git repository".into()));
        let orphans = find_orphans(&trees, Path::new("/nowhere"), std::iter::empty()).await;
        assert!(orphans.is_empty());
    }

    #[tokio::test]
    async fn non_repository_directory_yields_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let orphans = find_orphans(&GitWorkingTrees, tmp.path(), std::iter::empty()).await;
        assert!(orphans.is_empty());
    }
}
