//! Git branch segment backed by libgit2.

use super::Segment;
use crate::environment::Environment;
use git2::{Repository, StatusOptions};
use std::path::Path;

#[derive(Debug, Default)]
pub struct GitSegment {
    head: String,
    dirty: bool,
    ahead: usize,
    behind: usize,
}

impl GitSegment {
    fn inspect(&mut self, repo: &Repository) -> Option<()> {
        let head = repo.head().ok()?;

        self.head = if head.is_branch() {
            head.shorthand()?.to_string()
        } else {
            // Detached: short commit id
            let oid = head.target()?;
            oid.to_string().chars().take(7).collect()
        };

        self.dirty = repo
            .statuses(Some(StatusOptions::new().include_untracked(true)))
            .map(|statuses| !statuses.is_empty())
            .unwrap_or(false);

        if let Some((ahead, behind)) = ahead_behind(repo, &head) {
            self.ahead = ahead;
            self.behind = behind;
        }

        Some(())
    }
}

fn ahead_behind(repo: &Repository, head: &git2::Reference<'_>) -> Option<(usize, usize)> {
    let local = head.target()?;
    let branch = repo
        .find_branch(head.shorthand()?, git2::BranchType::Local)
        .ok()?;
    let upstream = branch.upstream().ok()?.get().target()?;
    repo.graph_ahead_behind(local, upstream).ok()
}

impl Segment for GitSegment {
    fn enabled(&mut self, env: &Environment) -> bool {
        let pwd = env.pwd();
        if pwd.is_empty() {
            return false;
        }
        let Ok(repo) = Repository::discover(Path::new(pwd)) else {
            return false;
        };
        self.inspect(&repo).is_some()
    }

    fn template(&self) -> &'static str {
        "{{ .HEAD }}{{ .Status }}"
    }

    fn fields(&self) -> Vec<(&'static str, String)> {
        let mut status = String::new();
        if self.dirty {
            status.push('*');
        }
        if self.ahead > 0 {
            status.push_str(&format!(" ↑{}", self.ahead));
        }
        if self.behind > 0 {
            status.push_str(&format!(" ↓{}", self.behind));
        }

        vec![
            ("HEAD", self.head.clone()),
            ("Status", status),
            ("Dirty", self.dirty.to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::protocol::RenderFlags;
    use std::collections::HashMap;

    fn env_in(dir: &Path) -> Environment {
        Environment::new(
            RenderFlags {
                pwd: dir.to_string_lossy().into_owned(),
                ..Default::default()
            },
            HashMap::new(),
        )
    }

    #[test]
    fn test_outside_repo_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut segment = GitSegment::default();
        // tempdirs are not normally inside a repository
        if Repository::discover(dir.path()).is_err() {
            assert!(!segment.enabled(&env_in(dir.path())));
        }
    }

    #[test]
    fn test_branch_name() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();

        let signature = git2::Signature::now("dev", "dev@example.com").unwrap();
        let tree_id = repo.index().unwrap().write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        repo.commit(Some("HEAD"), &signature, &signature, "init", &tree, &[])
            .unwrap();

        let mut segment = GitSegment::default();
        assert!(segment.enabled(&env_in(dir.path())));
        let head = repo.head().unwrap().shorthand().unwrap().to_string();
        assert_eq!(segment.fields()[0].1, head);
    }
}
