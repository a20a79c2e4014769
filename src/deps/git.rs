// src/deps/git.rs

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde_yaml::Value;

use crate::buildenv::BuildEnv;
use crate::config;
use crate::constants::CACHE_DIR_NAME;
use crate::deps::DepResolver;
use crate::error::{Error, Result};
use crate::system::process;
use crate::target::{TargetDependency, TargetId};

/// Fetches dependencies from version-controlled remotes by cloning the
/// requested tag into the root's cache directory.
#[derive(Default)]
pub struct GitDepResolver {
    target_cache: RefCell<HashMap<String, TargetId>>,
}

impl GitDepResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lists the remote's version tags, as used by SemVer selection.
    fn list_remote_tags(url: &str) -> Result<Vec<String>> {
        let output = process::run_and_capture(
            "git",
            &[
                "ls-remote".to_string(),
                "--refs".to_string(),
                "--tags".to_string(),
                url.to_string(),
            ],
            Path::new("."),
        )?;

        let mut tags = Vec::new();
        for line in output.lines() {
            let mut fields = line.split_whitespace();
            let _hash = fields.next();
            if let Some(reference) = fields.next() {
                let tag = reference.strip_prefix("refs/tags/").unwrap_or(reference);
                if !tag.is_empty() {
                    tags.push(tag.to_string());
                }
            }
        }
        Ok(tags)
    }

    /// Shallow-clones the given branch or tag.
    pub fn download(&self, url: &str, branch: &str, to: &Path) -> Result<()> {
        let mut cmdline = vec![
            "clone".to_string(),
            "--depth".to_string(),
            "1".to_string(),
        ];
        if !branch.is_empty() {
            cmdline.push("--branch".to_string());
            cmdline.push(branch.to_string());
        }
        cmdline.push(url.to_string());
        cmdline.push(to.to_string_lossy().to_string());

        process::run_process(
            "git",
            &cmdline,
            Path::new("."),
            &process::RunOptions {
                strict: true,
                ..Default::default()
            },
        )?;
        Ok(())
    }

    /// Resolves a remote dependency: picks a concrete tag, restores the clone
    /// into the cache if needed, and loads a target from it.
    pub fn resolve_git(
        &self,
        env: &mut BuildEnv,
        from: TargetId,
        dep: &TargetDependency,
        url: &str,
        branch: &str,
    ) -> Result<TargetId> {
        let branch = if dep.version_sv.is_some() {
            env.pick_dependency_version(from, dep, url, &mut |_, url| {
                Self::list_remote_tags(url)
            })?
        } else {
            branch.to_string()
        };

        let mut cached_dir = format!("git.{}.{}@{branch}", dep.ns, dep.name)
            .replace(' ', "");
        cached_dir = cached_dir
            .chars()
            .map(|c| if c == '/' || c == ':' { '_' } else { c })
            .collect();

        let views = env.scope_views(from);
        let re_arch = views.resolve_local("arch")?;
        let re_platform = views.resolve_local("platform")?;
        let re_config = views.resolve_local("configuration")?;
        let autoload = views.resolve_local("auto-load-uncached-deps")?;
        drop(views);

        let triplet = format!("{re_arch}-{re_platform}-{re_config}");

        let mut full_triplet = triplet.clone();
        if let Some(hash) = &dep.extra_config_hash {
            full_triplet.push_str(&format!("-ecfg-{hash}"));
        }

        let mut cache_key = format!("{cached_dir}-{full_triplet}");
        let cutout = dep.cutout_filter().map(str::to_string);
        if let Some(cutout) = &cutout {
            cache_key.push_str(cutout);
        }

        if let Some(cached) = self.target_cache.borrow().get(&cache_key) {
            return Ok(*cached);
        }

        let root_path = env.target(from).root_path.clone();
        let git_cached = root_path.join(CACHE_DIR_NAME).join(&cached_dir);
        fs::create_dir_all(&git_cached)?;

        let from_module = env.target(from).module.clone();

        if !git_cached.join(".git").exists() {
            if autoload != "true" {
                return Err(Error::uncached_dependency(
                    Some(from_module),
                    format!(
                        "cannot resolve uncached dependency '{}': autoloading is disabled",
                        dep.raw
                    ),
                ));
            }

            env.out().info_styled(&format!(
                "[{from_module}] Restoring package {}...\n",
                dep.raw
            ));

            fs::remove_dir_all(&git_cached).ok();
            self.download(url, &branch, &git_cached)?;

            env.out().info_styled(&format!(
                "[{from_module}] Restored package {}\n",
                dep.raw
            ));
        } else {
            env.out().info_styled(&format!(
                "[{from_module}] Package {} already available\n",
                dep.raw
            ));
        }

        let mut load_path = git_cached;
        if let Some(cutout) = &cutout {
            load_path = load_path.join(cutout);
        }

        let id = env.load_free_target(&load_path, Some(from), Some(dep))?;

        {
            let target = env.target_mut(id);
            target.root_path = root_path;
            if let Some(map) = target.config.as_mapping_mut() {
                map.insert("arch".into(), Value::String(re_arch));
                map.insert("platform".into(), Value::String(re_platform));
                map.insert("configuration".into(), Value::String(re_config));
            }
            if let Some(extra) = &dep.extra_config {
                config::merge_node(&mut target.config, extra, false);
            }
            target.module = format!("git.{triplet}.{}", target.module);
        }

        env.ensure_target_scopes(id);
        env.load_target_dependencies(id)?;
        env.load_target_source_tree(id, None)?;
        env.register_local_target(id)?;

        self.target_cache.borrow_mut().insert(cache_key, id);
        Ok(id)
    }
}

impl DepResolver for GitDepResolver {
    fn resolve(
        &self,
        env: &mut BuildEnv,
        from: TargetId,
        dep: &TargetDependency,
    ) -> Result<TargetId> {
        self.resolve_git(env, from, dep, &dep.name, &dep.version)
    }

    fn save_to_path(
        &self,
        _env: &mut BuildEnv,
        dep: &TargetDependency,
        path: &Path,
    ) -> Result<bool> {
        fs::create_dir_all(path)?;
        self.download(&dep.name, &dep.version, path)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{Output, OutputLevel};
    use crate::target::parse_dependency;

    #[test]
    fn uncached_dependencies_fail_when_autoloading_is_off() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("re.yml"), "type: executable\nname: app\n").unwrap();

        let mut env = BuildEnv::new(Output::new(OutputLevel::Off));
        env.global_scope().set("auto-load-uncached-deps", "false");
        let app = env.load_root_target(dir.path()).unwrap();

        let resolver = GitDepResolver::new();
        let dep = parse_dependency("github:user/repo @ v1", None).unwrap();
        let err = resolver
            .resolve_git(&mut env, app, &dep, "https://github.com/user/repo.git", "v1")
            .unwrap_err();

        assert!(matches!(err, Error::UncachedDependency { .. }));
        assert_eq!(err.exit_code(), 5);
    }
}
