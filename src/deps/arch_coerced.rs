// src/deps/arch_coerced.rs

use std::cell::RefCell;
use std::collections::HashMap;

use serde_yaml::Value;

use crate::buildenv::BuildEnv;
use crate::deps::DepResolver;
use crate::error::{Error, Result};
use crate::target::{TargetDependency, TargetId};

/// Rebuilds a dependency target from the same sources for the dependent's
/// architecture, memoized by (architecture, base module).
#[derive(Default)]
pub struct ArchCoercedDepResolver {
    target_cache: RefCell<HashMap<String, TargetId>>,
}

impl ArchCoercedDepResolver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DepResolver for ArchCoercedDepResolver {
    fn resolve(
        &self,
        env: &mut BuildEnv,
        from: TargetId,
        _dep: &TargetDependency,
    ) -> Result<TargetId> {
        Err(Error::dependency(
            Some(env.target(from).module.clone()),
            "the arch-coerced resolver does not support resolving literal dependencies".to_string(),
        ))
    }

    fn resolve_coerced(
        &self,
        env: &mut BuildEnv,
        from: TargetId,
        existing: TargetId,
    ) -> Result<TargetId> {
        let views = env.scope_views(from);
        let re_arch = views.resolve_local("arch")?;
        let re_platform = views.resolve_local("platform")?;
        let re_config = views.resolve_local("configuration")?;
        drop(views);

        let coerced_module = format!("arch-coerced.{re_arch}.{}", env.target(existing).module);

        if let Some(cached) = self.target_cache.borrow().get(&coerced_module) {
            return Ok(*cached);
        }

        let base_path = env.target(existing).path.clone();
        let root_path = env.target(from).root_path.clone();

        let id = env.load_free_target(&base_path, Some(from), None)?;
        {
            let target = env.target_mut(id);
            target.root_path = root_path;
            if let Some(map) = target.config.as_mapping_mut() {
                map.insert("arch".into(), Value::String(re_arch));
                map.insert("platform".into(), Value::String(re_platform));
                map.insert("configuration".into(), Value::String(re_config));
            }
            target.module = coerced_module.clone();
            target.dep_parent = Some(from);
        }

        env.ensure_target_scopes(id);
        env.load_target_dependencies(id)?;
        env.load_target_source_tree(id, None)?;
        env.register_local_target(id)?;

        self.target_cache.borrow_mut().insert(coerced_module, id);
        Ok(id)
    }
}
