//! Branch, workspace and PR URL naming conventions.
//!
//! Automation branches look like `u/codebot/[TICKET/]<id>/<slug>` where
//! `<id>` is a 7 character lowercase hex token. The same token names the
//! workspace directory (`task_[TICKET_]<id>`), which is how a review comment
//! on a branch finds its checkout again.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::model::{PrId, RepoRef};

/// Default two-segment branch prefix.
pub const DEFAULT_BRANCH_PREFIX: &str = "u/codebot";

/// Length of the hex workspace identifier.
pub const WORKSPACE_ID_LEN: usize = 7;

/// Generate a fresh workspace identifier.
pub fn generate_workspace_id() -> String {
    let digest = Sha256::digest(uuid::Uuid::new_v4().to_string().as_bytes());
    hex::encode(digest)[..WORKSPACE_ID_LEN].to_string()
}

fn is_workspace_id(segment: &str) -> bool {
    segment.len() == WORKSPACE_ID_LEN
        && segment
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// True when `branch` lives under the two-segment automation prefix.
pub fn is_automation_branch(branch: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    branch
        .strip_prefix(prefix)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Extract the workspace id embedded in an automation branch.
///
/// The first two segments must match `prefix`; the id is the first later
/// segment made of exactly 7 lowercase hex characters.
pub fn extract_workspace_id(branch: &str, prefix: &str) -> Option<String> {
    let prefix_parts: Vec<&str> = prefix.trim_end_matches('/').split('/').collect();
    let parts: Vec<&str> = branch.split('/').collect();

    if parts.len() <= prefix_parts.len() || parts[..prefix_parts.len()] != prefix_parts[..] {
        return None;
    }

    parts[prefix_parts.len()..]
        .iter()
        .find(|segment| is_workspace_id(segment))
        .map(|segment| segment.to_string())
}

/// Build an automation branch name.
pub fn branch_name(prefix: &str, ticket: Option<&str>, id: &str, slug: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    match ticket {
        Some(ticket) => format!("{}/{}/{}/{}", prefix, ticket, id, slug),
        None => format!("{}/{}/{}", prefix, id, slug),
    }
}

/// Directory name for a workspace with the given id.
pub fn workspace_dir_name(ticket: Option<&str>, id: &str) -> String {
    match ticket {
        Some(ticket) => format!("task_{}_{}", ticket, id),
        None => format!("task_{}", id),
    }
}

/// Prefix of workspaces named after a PR rather than a workspace id.
pub const PR_WORKSPACE_PREFIX: &str = "task_pr_";

/// Directory name used when a branch carries no id.
///
/// Owner and repository are part of the name so equal PR numbers in
/// different repositories never share a checkout.
pub fn pr_workspace_dir_name(pr: &PrId) -> String {
    format!(
        "{}{}_{}_{}",
        PR_WORKSPACE_PREFIX,
        path_safe(&pr.repo.owner),
        path_safe(&pr.repo.name),
        pr.pr_number
    )
}

fn path_safe(segment: &str) -> String {
    segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// True when a directory name embeds `id`.
pub fn dir_matches_workspace_id(dir_name: &str, id: &str) -> bool {
    if dir_name.starts_with(PR_WORKSPACE_PREFIX) {
        return false;
    }
    dir_name == format!("task_{}", id) || dir_name.ends_with(&format!("_{}", id))
}

/// Turn free text into a branch-safe slug of at most `max_len` characters.
pub fn slugify(text: &str, max_len: usize) -> String {
    let mut slug = String::new();
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
        if slug.len() >= max_len {
            break;
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "task".to_string()
    } else {
        slug.to_string()
    }
}

/// Search `root` for the workspace directory embedding `id`.
///
/// A missing root is treated as "no workspaces".
pub fn find_workspace_dir(root: &Path, id: &str) -> std::io::Result<Option<PathBuf>> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if dir_matches_workspace_id(name, id) {
                return Ok(Some(entry.path()));
            }
        }
    }

    Ok(None)
}

/// Parse a GitHub repository URL: `https://github.com/<owner>/<repo>[.git]`
/// or `git@github.com:<owner>/<repo>.git`.
pub fn parse_repo_url(url: &str) -> Option<RepoRef> {
    let path = match url.split_once("://") {
        Some((_, rest)) => rest.split_once('/')?.1,
        None => url.split_once(':')?.1,
    };
    let path = path.trim_end_matches('/');
    let path = path.strip_suffix(".git").unwrap_or(path);

    match path.split('/').collect::<Vec<_>>().as_slice() {
        [owner, repo] if !owner.is_empty() && !repo.is_empty() => {
            Some(RepoRef::new(*owner, *repo))
        }
        _ => None,
    }
}

/// Parse `https://github.com/<owner>/<repo>/pull/<n>`.
pub fn parse_pr_url(url: &str) -> Option<PrId> {
    let path = url
        .trim_end_matches('/')
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url);
    let parts: Vec<&str> = path.split('/').collect();

    // host / owner / repo / "pull" / number
    match parts.as_slice() {
        [_, owner, repo, "pull", number, ..] if !owner.is_empty() && !repo.is_empty() => {
            number.parse().ok().map(|n| PrId::new(*owner, *repo, n))
        }
        _ => None,
    }
}
