// src/deps/fs.rs

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_yaml::Value;

use crate::buildenv::BuildEnv;
use crate::deps::DepResolver;
use crate::error::Result;
use crate::system::fsutil::{self, CopyMode};
use crate::target::{TargetDependency, TargetId};

/// Resolves dependencies that live at a filesystem path outside the root's
/// own tree.
#[derive(Default)]
pub struct FsDepResolver {
    target_cache: RefCell<HashMap<String, TargetId>>,
}

impl FsDepResolver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DepResolver for FsDepResolver {
    fn resolve(
        &self,
        env: &mut BuildEnv,
        from: TargetId,
        dep: &TargetDependency,
    ) -> Result<TargetId> {
        let views = env.scope_views(from);
        let re_arch = views.resolve_local("arch")?;
        let re_platform = views.resolve_local("platform")?;
        let re_config = views.resolve_local("configuration")?;
        drop(views);

        let triplet = format!("-{re_arch}-{re_platform}-{re_config}");

        let mut cache_key = format!("{}{triplet}", dep.name);
        let mut path = PathBuf::from(&dep.name);
        if let Some(cutout) = dep.cutout_filter() {
            cache_key.push_str(cutout);
            path = path.join(cutout);
        }

        if let Some(cached) = self.target_cache.borrow().get(&cache_key) {
            return Ok(*cached);
        }

        let root_path = env.target(from).root_path.clone();

        let id = env.load_free_target(&path, Some(from), Some(dep))?;
        {
            let target = env.target_mut(id);
            target.root_path = root_path;
            if let Some(map) = target.config.as_mapping_mut() {
                map.insert("arch".into(), Value::String(re_arch));
                map.insert("platform".into(), Value::String(re_platform));
                map.insert("configuration".into(), Value::String(re_config));
            }
            target.module = format!("{}{triplet}", target.module);
        }

        env.ensure_target_scopes(id);
        env.load_target_dependencies(id)?;
        env.load_target_source_tree(id, None)?;
        env.register_local_target(id)?;

        self.target_cache.borrow_mut().insert(cache_key, id);
        Ok(id)
    }

    fn save_to_path(
        &self,
        _env: &mut BuildEnv,
        dep: &TargetDependency,
        path: &Path,
    ) -> Result<bool> {
        std::fs::create_dir_all(path)?;
        fsutil::copy_recursive(Path::new(&dep.name), path, CopyMode::Overwrite)?;
        Ok(true)
    }
}
