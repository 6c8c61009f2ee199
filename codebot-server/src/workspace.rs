//! Workspace resolution: branch name to a reusable local checkout.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use codebot_core::naming::{
    extract_workspace_id, find_workspace_dir, pr_workspace_dir_name, workspace_dir_name,
};
use codebot_core::PrId;
use thiserror::Error;
use tracing::{info, warn};

use crate::git::GitProvider;

const REMOTE: &str = "origin";

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("failed to search workspace root {root}: {source}")]
    Search {
        root: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to {step} workspace {path}: {message}")]
    Sync {
        step: &'static str,
        path: PathBuf,
        message: String,
    },

    #[error("failed to delete workspace {path}: {source}")]
    Delete {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub struct WorkspaceResolver {
    root: PathBuf,
    branch_prefix: String,
    git: Arc<dyn GitProvider>,
}

impl WorkspaceResolver {
    pub fn new(
        root: impl Into<PathBuf>,
        branch_prefix: impl Into<String>,
        git: Arc<dyn GitProvider>,
    ) -> Self {
        Self {
            root: root.into(),
            branch_prefix: branch_prefix.into(),
            git,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn workspace_id(&self, branch: &str) -> Option<String> {
        extract_workspace_id(branch, &self.branch_prefix)
    }

    /// Locate the existing workspace for `branch` without touching it.
    ///
    /// Branches carrying an id are matched by id. Other branches can only
    /// have a PR-named workspace, which needs `pr`.
    pub fn locate(
        &self,
        branch: &str,
        pr: Option<&PrId>,
    ) -> Result<Option<PathBuf>, WorkspaceError> {
        let Some(id) = self.workspace_id(branch) else {
            return Ok(pr
                .map(|pr| self.root.join(pr_workspace_dir_name(pr)))
                .filter(|path| path.is_dir()));
        };
        find_workspace_dir(&self.root, &id).map_err(|source| WorkspaceError::Search {
            root: self.root.clone(),
            source,
        })
    }

    /// Find the workspace for `branch` and bring it to the remote tip.
    ///
    /// `Ok(None)` means there is nothing to reuse. A checkout failure is an
    /// error: the caller must provision fresh rather than work on a checkout
    /// in an unknown state. Fetch and pull failures only warn.
    pub async fn resolve(
        &self,
        branch: &str,
        pr: &PrId,
    ) -> Result<Option<PathBuf>, WorkspaceError> {
        let Some(path) = self.locate(branch, Some(pr))? else {
            return Ok(None);
        };

        info!("Reusing workspace {} for {}", path.display(), branch);

        if let Err(e) = self.git.fetch(&path, REMOTE).await {
            warn!("Fetch failed in {}: {:#}", path.display(), e);
        }

        self.git
            .checkout(&path, branch)
            .await
            .map_err(|e| sync_error("checkout", &path, e))?;

        if let Err(e) = self.git.pull(&path, REMOTE, branch).await {
            warn!("Pull failed in {}: {:#}", path.display(), e);
        }

        Ok(Some(path))
    }

    /// Clone a fresh workspace for `branch`.
    ///
    /// The directory is `task_<id>` when the branch carries an id and
    /// `task_pr_<owner>_<repo>_<number>` otherwise. A stale directory at
    /// that path is replaced.
    pub async fn provision(
        &self,
        clone_url: &str,
        branch: &str,
        pr: &PrId,
    ) -> Result<PathBuf, WorkspaceError> {
        let dir_name = match self.workspace_id(branch) {
            Some(id) => workspace_dir_name(None, &id),
            None => pr_workspace_dir_name(pr),
        };
        let path = self.fresh_clone(clone_url, &dir_name).await?;

        self.git
            .checkout(&path, branch)
            .await
            .map_err(|e| sync_error("checkout", &path, e))?;

        info!("Provisioned workspace {} for {}", path.display(), branch);
        Ok(path)
    }

    /// Clone a workspace for a new task and start `branch` in it.
    pub async fn create(
        &self,
        clone_url: &str,
        id: &str,
        branch: &str,
    ) -> Result<PathBuf, WorkspaceError> {
        let path = self.fresh_clone(clone_url, &workspace_dir_name(None, id)).await?;

        self.git
            .create_branch(&path, branch)
            .await
            .map_err(|e| sync_error("create branch in", &path, e))?;

        info!("Created workspace {} on new branch {}", path.display(), branch);
        Ok(path)
    }

    async fn fresh_clone(
        &self,
        clone_url: &str,
        dir_name: &str,
    ) -> Result<PathBuf, WorkspaceError> {
        let path = self.root.join(dir_name);

        self.delete(&path).await?;
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| WorkspaceError::Sync {
                step: "create root for",
                path: path.clone(),
                message: e.to_string(),
            })?;

        self.git
            .clone_repo(clone_url, &path)
            .await
            .map_err(|e| sync_error("clone", &path, e))?;
        Ok(path)
    }

    /// Resolve, falling back to a fresh clone when reuse fails.
    pub async fn resolve_or_provision(
        &self,
        clone_url: &str,
        branch: &str,
        pr: &PrId,
    ) -> Result<PathBuf, WorkspaceError> {
        match self.resolve(branch, pr).await {
            Ok(Some(path)) => return Ok(path),
            Ok(None) => {}
            Err(e) => warn!("Cannot reuse workspace for {}, provisioning fresh: {}", branch, e),
        }
        self.provision(clone_url, branch, pr).await
    }

    /// Remove a workspace tree. An absent path is not an error.
    pub async fn delete(&self, path: &Path) -> Result<(), WorkspaceError> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => {
                info!("Deleted workspace {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(WorkspaceError::Delete {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Delete the workspace for `branch` if one exists. Returns whether a
    /// directory was found.
    pub async fn delete_for_branch(
        &self,
        branch: &str,
        pr: Option<&PrId>,
    ) -> Result<bool, WorkspaceError> {
        match self.locate(branch, pr)? {
            Some(path) => {
                self.delete(&path).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

fn sync_error(step: &'static str, path: &Path, e: anyhow::Error) -> WorkspaceError {
    WorkspaceError::Sync {
        step,
        path: path.to_path_buf(),
        message: format!("{:#}", e),
    }
}
