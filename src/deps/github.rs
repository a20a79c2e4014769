// src/deps/github.rs

use std::path::Path;
use std::rc::Rc;

use crate::buildenv::BuildEnv;
use crate::deps::{DepResolver, GitDepResolver};
use crate::error::Result;
use crate::target::{TargetDependency, TargetId};

/// Maps `github:user/repo` dependencies to clone URLs and delegates the rest
/// to the git resolver. The `github-ssh` namespace (or `RE_GITHUB_FORCE_SSH`)
/// selects SSH remotes.
pub struct GithubDepResolver {
    git: Rc<GitDepResolver>,
}

impl GithubDepResolver {
    pub fn new(git: Rc<GitDepResolver>) -> Self {
        Self { git }
    }

    fn clone_url(dep: &TargetDependency) -> String {
        let mut repo = dep.name.clone();
        if !repo.ends_with(".git") {
            repo.push_str(".git");
        }

        let force_ssh = std::env::var("RE_GITHUB_FORCE_SSH").as_deref() == Ok("1");

        if dep.ns == "github-ssh" || force_ssh {
            format!("git@github.com:{repo}")
        } else {
            format!("https://github.com/{repo}")
        }
    }
}

impl DepResolver for GithubDepResolver {
    fn resolve(
        &self,
        env: &mut BuildEnv,
        from: TargetId,
        dep: &TargetDependency,
    ) -> Result<TargetId> {
        self.git
            .resolve_git(env, from, dep, &Self::clone_url(dep), &dep.version)
    }

    fn save_to_path(
        &self,
        _env: &mut BuildEnv,
        dep: &TargetDependency,
        path: &Path,
    ) -> Result<bool> {
        std::fs::create_dir_all(path)?;
        self.git.download(&Self::clone_url(dep), &dep.version, path)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::parse_dependency;

    #[test]
    fn maps_names_to_clone_urls() {
        let dep = parse_dependency("github:user/repo @ v1.2.0", None).unwrap();
        assert_eq!(
            GithubDepResolver::clone_url(&dep),
            "https://github.com/user/repo.git"
        );

        let ssh = parse_dependency("github-ssh:user/repo", None).unwrap();
        assert_eq!(
            GithubDepResolver::clone_url(&ssh),
            "git@github.com:user/repo.git"
        );
    }
}
