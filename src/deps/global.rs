// src/deps/global.rs

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use serde_yaml::Value;

use crate::buildenv::BuildEnv;
use crate::config::ConfigMappings;
use crate::constants::DEFAULT_TAG_FILENAME;
use crate::deps::DepResolver;
use crate::error::{Error, Result};
use crate::target::{TargetDependency, TargetId};

/// Resolves dependencies from the per-user global package store:
/// `<store>/<name>/<tag>/`, with `default-tag.txt` selecting the tag used
/// when the depstring does not pin one.
pub struct GlobalDepResolver {
    packages_path: PathBuf,
    target_cache: RefCell<HashMap<String, TargetId>>,
}

impl GlobalDepResolver {
    pub fn new(packages_path: PathBuf) -> Self {
        Self {
            packages_path,
            target_cache: RefCell::new(HashMap::new()),
        }
    }

    fn default_tag(&self, name: &str) -> Result<String> {
        let tag_file = self.packages_path.join(name).join(DEFAULT_TAG_FILENAME);
        Ok(fs::read_to_string(tag_file)?.trim().to_string())
    }

    /// Installs (or re-installs) a package into the store under `as_dep`'s
    /// name, fetching through the resolver of `dep`'s namespace, and records
    /// the tag as the default.
    pub fn install_package(
        &self,
        env: &mut BuildEnv,
        dep: &TargetDependency,
        as_dep: &TargetDependency,
    ) -> Result<()> {
        let mut tag = if as_dep.version.is_empty() {
            dep.version.clone()
        } else {
            as_dep.version.clone()
        };
        if tag.is_empty() {
            tag = "default".to_string();
        }

        let resolver = env.dep_resolver(&dep.ns).ok_or_else(|| {
            Error::dependency(None, format!("unknown dependency type '{}'", dep.ns))
        })?;

        let target_path = self.packages_path.join(&as_dep.name).join(&tag);

        env.out().info_styled(&format!(
            "Installing package {} as global:{}@{tag}...\n",
            dep.raw, as_dep.name
        ));

        if target_path.exists() {
            env.out().info_styled(&format!(
                "! Will remove existing package global:{}@{tag}\n",
                as_dep.name
            ));
            fs::remove_dir_all(&target_path)?;
        }

        if !resolver.save_to_path(env, dep, &target_path)? {
            return Err(Error::dependency(
                None,
                format!(
                    "dependency type '{}' is not supported for global packages",
                    dep.ns
                ),
            ));
        }

        fs::write(
            self.packages_path.join(&as_dep.name).join(DEFAULT_TAG_FILENAME),
            &tag,
        )?;

        env.out().info_styled(&format!(
            " ! Installed package {} as global:{}@{tag}\n",
            dep.raw, as_dep.name
        ));
        Ok(())
    }

    /// Marks an already-installed version as the package's default tag.
    pub fn select_default_tag(&self, dep: &TargetDependency, new_tag: &str) -> Result<()> {
        let package_path = self.packages_path.join(&dep.name);
        if !package_path.exists() {
            return Err(Error::dependency(
                None,
                format!("missing global package '{}'", dep.name),
            ));
        }
        if !package_path.join(new_tag).exists() {
            return Err(Error::dependency(
                None,
                format!(
                    "missing version '{new_tag}' for global package '{}'",
                    dep.name
                ),
            ));
        }

        fs::write(package_path.join(DEFAULT_TAG_FILENAME), new_tag)?;
        Ok(())
    }
}

impl DepResolver for GlobalDepResolver {
    fn resolve(
        &self,
        env: &mut BuildEnv,
        from: TargetId,
        dep: &TargetDependency,
    ) -> Result<TargetId> {
        let from_module = env.target(from).module.clone();

        let package_path = self.packages_path.join(&dep.name);
        if !package_path.exists() {
            return Err(Error::dependency(
                Some(from_module),
                format!("missing global package '{}'", dep.name),
            ));
        }

        let tag = if dep.version.is_empty() {
            self.default_tag(&dep.name)?
        } else {
            dep.version.clone()
        };

        let target_path = package_path.join(&tag);
        if !target_path.exists() {
            return Err(Error::dependency(
                Some(from_module),
                format!(
                    "missing version '{tag}' for global package '{}'",
                    dep.name
                ),
            ));
        }

        let views = env.scope_views(from);
        let re_arch = views.resolve_local("arch")?;
        let re_platform = views.resolve_local("platform")?;
        let re_config = views.resolve_local("configuration")?;
        drop(views);

        let triplet = format!("{re_arch}-{re_platform}-{re_config}");
        let cache_key = format!("{}-{triplet}", dep.raw);

        if let Some(cached) = self.target_cache.borrow().get(&cache_key) {
            return Ok(*cached);
        }

        let root_path = env.target(from).root_path.clone();

        let id = env.load_free_target(&target_path, Some(from), Some(dep))?;
        {
            let target = env.target_mut(id);
            target.root_path = root_path;
            if let Some(map) = target.config.as_mapping_mut() {
                map.insert("arch".into(), Value::String(re_arch.clone()));
                map.insert("platform".into(), Value::String(re_platform.clone()));
                map.insert("configuration".into(), Value::String(re_config.clone()));
            }
            target.module = format!("global.{triplet}.{}", target.module);
        }

        env.ensure_target_scopes(id);
        env.load_target_dependencies(id)?;
        env.load_target_source_tree(id, None)?;

        let mut mappings = ConfigMappings::new();
        mappings.insert("arch".into(), re_arch);
        mappings.insert("platform".into(), re_platform);
        mappings.insert("config".into(), re_config);
        let resolved = env.compute_resolved_config(id, &mappings)?;
        env.target_mut(id).resolved_config = Some(resolved);
        env.load_conditional_dependencies(id)?;

        env.register_local_target(id)?;

        env.out().info_styled(&format!(
            "[{}] Using installed package {}\n",
            env.target(from).module,
            dep.raw
        ));

        self.target_cache.borrow_mut().insert(cache_key, id);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{Output, OutputLevel};
    use crate::target::parse_dependency;

    #[test]
    fn resolves_from_the_store_using_the_default_tag() {
        let store = tempfile::tempdir().unwrap();
        let pkg = store.path().join("mylib");
        fs::create_dir_all(pkg.join("1.0")).unwrap();
        fs::write(
            pkg.join("1.0").join("re.yml"),
            "type: static-library\nname: mylib\n",
        )
        .unwrap();
        fs::write(pkg.join(DEFAULT_TAG_FILENAME), "1.0").unwrap();

        let mut env = BuildEnv::new(Output::new(OutputLevel::Off));
        let app_dir = tempfile::tempdir().unwrap();
        fs::write(app_dir.path().join("re.yml"), "type: executable\nname: app\n").unwrap();
        let app = env.load_root_target(app_dir.path()).unwrap();

        let resolver = GlobalDepResolver::new(store.path().to_path_buf());
        let dep = parse_dependency("global:mylib", None).unwrap();
        let resolved = resolver.resolve(&mut env, app, &dep).unwrap();

        assert!(env.target(resolved).module.starts_with("global."));
        assert!(env.target(resolved).module.ends_with(".mylib"));

        // Resolution is memoized per cache key.
        let again = resolver.resolve(&mut env, app, &dep).unwrap();
        assert_eq!(resolved, again);
    }

    #[test]
    fn install_package_records_the_default_tag() {
        let store = tempfile::tempdir().unwrap();
        let lib_dir = tempfile::tempdir().unwrap();
        fs::write(
            lib_dir.path().join("re.yml"),
            "type: static-library\nname: mylib\n",
        )
        .unwrap();

        let mut env = BuildEnv::new(Output::new(OutputLevel::Off));
        env.add_dep_resolver("fs", std::rc::Rc::new(crate::deps::FsDepResolver::new()));

        let resolver = GlobalDepResolver::new(store.path().to_path_buf());
        let dep =
            parse_dependency(&format!("fs:{}", lib_dir.path().display()), None).unwrap();
        let as_dep = parse_dependency("mylib", None).unwrap();

        resolver.install_package(&mut env, &dep, &as_dep).unwrap();

        assert!(store.path().join("mylib/default/re.yml").is_file());
        assert_eq!(
            fs::read_to_string(store.path().join("mylib").join(DEFAULT_TAG_FILENAME)).unwrap(),
            "default"
        );

        // Re-installing with a pinned tag replaces the default.
        let pinned =
            parse_dependency(&format!("fs:{} @ v2", lib_dir.path().display()), None).unwrap();
        resolver.install_package(&mut env, &pinned, &as_dep).unwrap();

        assert!(store.path().join("mylib/v2/re.yml").is_file());
        assert_eq!(
            fs::read_to_string(store.path().join("mylib").join(DEFAULT_TAG_FILENAME)).unwrap(),
            "v2"
        );

        resolver.select_default_tag(&as_dep, "default").unwrap();
        assert_eq!(
            fs::read_to_string(store.path().join("mylib").join(DEFAULT_TAG_FILENAME)).unwrap(),
            "default"
        );
    }

    #[test]
    fn missing_package_is_a_dependency_error() {
        let store = tempfile::tempdir().unwrap();
        let mut env = BuildEnv::new(Output::new(OutputLevel::Off));
        let app_dir = tempfile::tempdir().unwrap();
        fs::write(app_dir.path().join("re.yml"), "type: executable\nname: app\n").unwrap();
        let app = env.load_root_target(app_dir.path()).unwrap();

        let resolver = GlobalDepResolver::new(store.path().to_path_buf());
        let dep = parse_dependency("global:nope", None).unwrap();
        let err = resolver.resolve(&mut env, app, &dep).unwrap_err();
        assert!(matches!(err, Error::Dependency { .. }));
    }
}
