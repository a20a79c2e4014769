// src/buildenv.rs

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use serde_yaml::Value;

use crate::config::{self, ConfigMappings, TargetConfig};
use crate::constants::IGNORE_MARKER_FILENAME;
use crate::deps::DepResolver;
use crate::desc::NinjaBuildDesc;
use crate::error::{Error, Result};
use crate::langs::LangProvider;
use crate::output::Output;
use crate::system::fsutil::{self, CopyMode};
use crate::system::process::{self, RunOptions};
use crate::target::{
    Target, TargetDependency, TargetId, dir_contains_target, escape_module_path,
    module_path_combine, parse_dependency, parse_dependency_node,
};
use crate::vars::{EnvVarNamespace, VarContext, VarNamespace, VarScope};
use crate::version_cache::DepsVersionCache;

/// A named behavior targets can opt into via their `features` list.
pub trait TargetFeature {
    fn name(&self) -> &str;
}

/// Intercepts target loading for paths the default `re.yml` loader cannot
/// handle, e.g. directories owned by a foreign build system.
pub trait TargetLoadMiddleware {
    fn supports_load_path(&self, path: &Path) -> bool;

    /// Loads and inserts a target for the given path, materializing synthetic
    /// children as needed.
    fn load_target(
        &self,
        env: &mut BuildEnv,
        path: &Path,
        ancestor: Option<TargetId>,
        dep_source: Option<&TargetDependency>,
    ) -> Result<TargetId>;
}

/// A view over a target's build-scope variable chain: build scope locals,
/// then target scope locals, then the target's configuration, then ancestors,
/// then the environment's global scope.
pub struct BuildScopeVars<'a> {
    env: &'a BuildEnv,
    id: TargetId,
}

impl VarNamespace for BuildScopeVars<'_> {
    fn get_var(&self, key: &str) -> Option<String> {
        self.env.lookup_build_var(self.id, key)
    }
}

/// The `target:` namespace of a target: configuration-backed lookups only.
pub struct TargetConfigVars<'a> {
    env: &'a BuildEnv,
    id: TargetId,
}

impl VarNamespace for TargetConfigVars<'_> {
    fn get_var(&self, key: &str) -> Option<String> {
        self.env.lookup_target_var(self.id, key)
    }
}

/// The assembled substitution namespaces of one target.
pub struct TargetScopeViews<'a> {
    build: BuildScopeVars<'a>,
    target_ns: TargetConfigVars<'a>,
    global: &'a VarScope,
    env_ns: EnvVarNamespace,
    extra: Vec<(String, BuildScopeVars<'a>)>,
}

/// A transient namespace layering ad-hoc values over a build-scope chain,
/// used for per-module directory templates like `build/${module}`.
struct ScopedLocals<'a> {
    locals: &'a BTreeMap<String, String>,
    chain: &'a BuildScopeVars<'a>,
}

impl VarNamespace for ScopedLocals<'_> {
    fn get_var(&self, key: &str) -> Option<String> {
        self.locals
            .get(key)
            .cloned()
            .or_else(|| self.chain.get_var(key))
    }
}

impl<'a> TargetScopeViews<'a> {
    /// Adds another target's build scope under an extra namespace name
    /// (e.g. `self` during copy-to-deps propagation).
    pub fn add_target_namespace(&mut self, name: impl Into<String>, env: &'a BuildEnv, id: TargetId) {
        self.extra.push((name.into(), BuildScopeVars { env, id }));
    }

    fn context(&self) -> VarContext<'_> {
        let mut ctx = VarContext::new();
        ctx.add("re", self.global);
        ctx.add("env", &self.env_ns);
        ctx.add("build", &self.build);
        ctx.add("target", &self.target_ns);
        for (name, ns) in &self.extra {
            ctx.add(name.clone(), ns);
        }
        ctx
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.build.get_var(key)
    }

    /// Substitutes every `${…}` occurrence, defaulting to the build namespace.
    pub fn resolve(&self, template: &str) -> Result<String> {
        self.context().substitute(template, "build")
    }

    /// Substitutes with extra local values layered over the build namespace.
    pub fn resolve_with_locals(
        &self,
        locals: &BTreeMap<String, String>,
        template: &str,
    ) -> Result<String> {
        let layered = ScopedLocals {
            locals,
            chain: &self.build,
        };
        let mut ctx = VarContext::new();
        ctx.add("re", self.global);
        ctx.add("env", &self.env_ns);
        ctx.add("build", &layered);
        ctx.add("target", &self.target_ns);
        ctx.substitute(template, "build")
    }

    /// Looks up a key in the build chain and resolves its value.
    pub fn resolve_local(&self, key: &str) -> Result<String> {
        let value = self.get(key).ok_or_else(|| {
            Error::var_substitution(format!("local variable '{key}' not found"))
        })?;
        self.resolve(&value)
    }
}

/// The build environment: owns every loaded target and drives resolution.
///
/// Targets live in an arena; all graph edges are `TargetId` values, so the
/// parent/child tree stays acyclic while `dependents` back-references never
/// own anything.
pub struct BuildEnv {
    targets: Vec<Target>,
    module_map: HashMap<String, TargetId>,

    roots: Vec<TargetId>,
    core_target: Option<TargetId>,

    lang_providers: BTreeMap<String, Rc<dyn LangProvider>>,
    dep_resolvers: BTreeMap<String, Rc<dyn DepResolver>>,
    target_features: BTreeMap<String, Rc<dyn TargetFeature>>,
    middlewares: Vec<Rc<dyn TargetLoadMiddleware>>,

    global_scope: VarScope,
    out: Output,

    version_cache: DepsVersionCache,
    completed_tasks: HashSet<String>,
    resolution_stack: Vec<TargetId>,
}

impl BuildEnv {
    pub fn new(out: Output) -> Self {
        let global_scope = VarScope::new();

        let platform = match std::env::consts::OS {
            "windows" => "windows",
            "macos" => "osx",
            _ => "linux",
        };

        global_scope.set("version", env!("CARGO_PKG_VERSION"));
        global_scope.set("platform", platform);
        global_scope.set("platform-closest", if platform == "windows" { "windows" } else { "unix" });
        global_scope.set("host-platform", platform);
        global_scope.set("arch", "x64");
        global_scope.set("host-arch", "x64");
        global_scope.set("configuration", "debug");
        global_scope.set("runtime", "default");
        global_scope.set("load-context", "standalone");
        global_scope.set("auto-load-uncached-deps", "true");
        global_scope.set("inherit-caller-in-deps", "false");
        global_scope.set("generate-build-meta", "false");
        global_scope.set("cxx-default-include-dirs", ".");
        global_scope.set("cxx-default-lib-dirs", ".");

        Self {
            targets: Vec::new(),
            module_map: HashMap::new(),
            roots: Vec::new(),
            core_target: None,
            lang_providers: BTreeMap::new(),
            dep_resolvers: BTreeMap::new(),
            target_features: BTreeMap::new(),
            middlewares: Vec::new(),
            global_scope,
            out,
            version_cache: DepsVersionCache::new(),
            completed_tasks: HashSet::new(),
            resolution_stack: Vec::new(),
        }
    }

    // ----- registries ------------------------------------------------------

    pub fn add_lang_provider(&mut self, name: impl Into<String>, provider: Rc<dyn LangProvider>) {
        self.lang_providers.insert(name.into(), provider);
    }

    pub fn lang_provider(&self, name: &str) -> Option<Rc<dyn LangProvider>> {
        self.lang_providers.get(name).cloned()
    }

    pub fn add_dep_resolver(&mut self, name: impl Into<String>, resolver: Rc<dyn DepResolver>) {
        self.dep_resolvers.insert(name.into(), resolver);
    }

    pub fn dep_resolver(&self, name: &str) -> Option<Rc<dyn DepResolver>> {
        self.dep_resolvers.get(name).cloned()
    }

    pub fn add_target_feature(&mut self, feature: Rc<dyn TargetFeature>) {
        self.target_features.insert(feature.name().to_string(), feature);
    }

    pub fn add_target_load_middleware(&mut self, middleware: Rc<dyn TargetLoadMiddleware>) {
        self.middlewares.push(middleware);
    }

    pub fn global_scope(&self) -> &VarScope {
        &self.global_scope
    }

    pub fn out(&self) -> &Output {
        &self.out
    }

    pub fn set_version_cache(&mut self, cache: DepsVersionCache) {
        self.version_cache = cache;
    }

    pub fn version_cache(&self) -> &DepsVersionCache {
        &self.version_cache
    }

    /// Picks a concrete version tag for a SemVer-pinned dependency, caching
    /// the choice for reproducibility.
    pub fn pick_dependency_version(
        &mut self,
        from: TargetId,
        dep: &TargetDependency,
        name: &str,
        fetch_versions: &mut dyn FnMut(&TargetDependency, &str) -> Result<Vec<String>>,
    ) -> Result<String> {
        let module = self.targets[from.0].module.clone();
        self.version_cache
            .latest_matching(&module, dep, name, fetch_versions)
    }

    // ----- arena access ----------------------------------------------------

    pub fn target(&self, id: TargetId) -> &Target {
        &self.targets[id.0]
    }

    pub fn target_mut(&mut self, id: TargetId) -> &mut Target {
        &mut self.targets[id.0]
    }

    pub fn find_target(&self, module: &str) -> Option<TargetId> {
        self.module_map.get(module).copied()
    }

    pub fn roots(&self) -> &[TargetId] {
        &self.roots
    }

    pub fn core_target(&self) -> Option<TargetId> {
        self.core_target
    }

    /// Inserts a target as a child of `parent`, finalizing its module path.
    pub fn add_child_target(&mut self, mut target: Target, parent: TargetId) -> TargetId {
        let id = TargetId(self.targets.len());
        let parent_target = &self.targets[parent.0];

        target.parent = Some(parent);
        target.root = parent_target.root;
        target.root_path = parent_target.root_path.clone();
        target.module = module_path_combine(&parent_target.module, &target.name);

        self.targets.push(target);
        self.targets[parent.0].children.push(id);
        id
    }

    /// Inserts a free-standing target: it is its own root, with the core
    /// project target as configuration parent when one is loaded.
    pub fn add_free_target(&mut self, mut target: Target) -> TargetId {
        let id = TargetId(self.targets.len());

        target.parent = self.core_target;
        target.root = Some(id);
        if target.module.is_empty() {
            target.module = target.name.clone();
        }

        self.targets.push(target);
        id
    }

    // ----- loading ---------------------------------------------------------

    /// Whether a target can be loaded from this path, taking registered load
    /// middlewares into account.
    pub fn can_load_target_from(&self, path: &Path) -> bool {
        self.middlewares
            .iter()
            .any(|m| m.supports_load_path(path))
            || dir_contains_target(path)
    }

    /// Loads a target without registering it as a local dependency. The first
    /// middleware supporting the path handles it; the default is `re.yml`.
    pub fn load_free_target(
        &mut self,
        path: &Path,
        ancestor: Option<TargetId>,
        dep_source: Option<&TargetDependency>,
    ) -> Result<TargetId> {
        for middleware in self.middlewares.clone() {
            if middleware.supports_load_path(path) {
                return middleware.load_target(self, path, ancestor, dep_source);
            }
        }

        if !dir_contains_target(path) {
            return Err(Error::load(
                None,
                format!("the directory '{}' does not contain a valid target", path.display()),
            ));
        }

        let target = Target::from_dir(path)?;
        Ok(self.add_free_target(target))
    }

    /// Loads the core project target that parents every root target. It must
    /// be loaded before any user target.
    pub fn load_core_project_target(&mut self, path: &Path) -> Result<TargetId> {
        let id = self.load_free_target(path, None, None)?;
        self.core_target = Some(id);
        Ok(id)
    }

    /// Loads a root-level target tree: dependencies, sources, children, and
    /// the module map registration.
    pub fn load_root_target(&mut self, path: &Path) -> Result<TargetId> {
        let id = self.load_free_target(path, None, None)?;

        {
            let target = &mut self.targets[id.0];
            target.root_path = target.path.clone();
            if let Some(map) = target.config.as_mapping_mut() {
                map.insert("load-context".into(), "standalone".into());
            }
        }

        self.load_target_dependencies(id)?;
        self.load_target_source_tree(id, None)?;
        self.register_local_target(id)?;

        self.roots.push(id);
        Ok(id)
    }

    /// Registers a target and all its descendants in the module map. A module
    /// appearing twice is fatal.
    pub fn register_local_target(&mut self, id: TargetId) -> Result<()> {
        let module = self.targets[id.0].module.clone();
        log::trace!("adding to target map: '{module}'");

        if self.module_map.contains_key(&module) {
            return Err(Error::load(
                Some(module),
                "target defined more than once".to_string(),
            ));
        }
        self.module_map.insert(module, id);

        for child in self.targets[id.0].children.clone() {
            self.register_local_target(child)?;
        }
        Ok(())
    }

    /// Parses the dependency list under `key`, deduplicating by
    /// (raw string, extra-config owner) pairs.
    fn load_dependencies_key(&mut self, id: TargetId, key: &str) -> Result<()> {
        let module = self.targets[id.0].module.clone();
        let deps = self.targets[id.0].effective_config().get(key).cloned();

        if let Some(Value::Sequence(nodes)) = deps {
            for node in nodes {
                let dep = parse_dependency_node(&node, Some(&module))?;

                let target = &mut self.targets[id.0];
                let exists = target.dependencies.iter().any(|existing| {
                    existing.raw == dep.raw && existing.extra_config_hash == dep.extra_config_hash
                });
                if !exists {
                    target.dependencies.push(dep);
                }
            }
        }

        Ok(())
    }

    /// Loads `deps`, plus the uses-mapping once a resolved config and build
    /// scope are available.
    pub fn load_target_dependencies(&mut self, id: TargetId) -> Result<()> {
        self.load_dependencies_key(id, "deps")?;

        let has_scope = self.targets[id.0].build_scope.is_some();
        let uses = self.targets[id.0]
            .resolved_config
            .as_ref()
            .and_then(|c| c.get("uses").cloned());

        if has_scope {
            if let Some(Value::Mapping(map)) = uses {
                let module = self.targets[id.0].module.clone();
                for (key, value) in &map {
                    let (Some(name), Some(depstring)) = (key.as_str(), value.as_str()) else {
                        continue;
                    };
                    if self.targets[id.0]
                        .used_mapping
                        .iter()
                        .any(|(existing, _)| existing == name)
                    {
                        continue;
                    }

                    let resolved_str = self.scope_views(id).resolve(depstring)?;
                    let dep = parse_dependency(&resolved_str, Some(&module))?;
                    self.targets[id.0]
                        .used_mapping
                        .push((name.to_string(), dep));
                }
            }
        }

        Ok(())
    }

    /// Re-walks `deps` and `cond-deps` against the resolved configuration and
    /// collects the feature set.
    pub fn load_conditional_dependencies(&mut self, id: TargetId) -> Result<()> {
        self.load_target_dependencies(id)?;
        self.load_dependencies_key(id, "cond-deps")?;

        let features = self.targets[id.0]
            .resolved_config
            .as_ref()
            .and_then(|c| c.get("features").cloned());
        if let Some(Value::Sequence(seq)) = features {
            for v in seq {
                if let Some(name) = v.as_str() {
                    self.targets[id.0].features.insert(name.to_string());
                }
            }
        }

        Ok(())
    }

    /// Depth-first source tree walk.
    ///
    /// Dot-files are skipped, a directory holding the ignore marker is pruned
    /// entirely, directories with loadable target configs become child
    /// targets, and everything else contributes source files.
    pub fn load_target_source_tree(&mut self, id: TargetId, dir: Option<PathBuf>) -> Result<()> {
        if config::entry_bool(&self.targets[id.0].config, "disable-source-tree-load")
            .unwrap_or(false)
        {
            return Ok(());
        }

        let dir = dir.unwrap_or_else(|| self.targets[id.0].path.clone());

        let mut entries: Vec<_> = std::fs::read_dir(&dir)?
            .collect::<std::io::Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let file_name = entry.file_name().to_string_lossy().to_string();
            if file_name.starts_with('.') {
                continue;
            }

            let path = entry.path();
            let file_type = entry.file_type()?;

            if file_type.is_dir() {
                if path.join(IGNORE_MARKER_FILENAME).exists() {
                    continue;
                }

                if dir_contains_target(&path) {
                    let child = Target::from_dir(&path)?;

                    if config::entry_bool(&child.config, "enabled").unwrap_or(true) {
                        let child_id = self.add_child_target(child, id);
                        self.load_target_dependencies(child_id)?;
                        self.load_target_source_tree(child_id, None)?;
                    }
                } else {
                    self.load_target_source_tree(id, Some(path))?;
                }
            } else if file_type.is_file() {
                let extension = path
                    .extension()
                    .map(|e| e.to_string_lossy().to_string())
                    .unwrap_or_default();
                self.targets[id.0].sources.push(crate::target::SourceFile {
                    path,
                    extension,
                });
            }
        }

        Ok(())
    }

    // ----- variable scopes -------------------------------------------------

    /// Ensures the target has its `target:` and `build:` scopes.
    pub fn ensure_target_scopes(&mut self, id: TargetId) {
        if self.targets[id.0].build_scope.is_some() {
            return;
        }
        let target_scope = VarScope::new();
        let build_scope = VarScope::with_parent(&target_scope);
        let target = &mut self.targets[id.0];
        target.target_scope = Some(target_scope);
        target.build_scope = Some(build_scope);
    }

    fn lookup_build_var(&self, id: TargetId, key: &str) -> Option<String> {
        if let Some(scope) = &self.targets[id.0].build_scope {
            if let Some(value) = scope.get(key) {
                return Some(value);
            }
        }
        self.lookup_target_var(id, key)
    }

    fn lookup_target_var(&self, id: TargetId, key: &str) -> Option<String> {
        let target = &self.targets[id.0];

        if key == "path" {
            return Some(target.path.to_string_lossy().to_string());
        }
        if key == "module" {
            return Some(target.module.clone());
        }

        let cfg = target.effective_config();
        if let Some(vars) = cfg.get("vars") {
            if let Some(value) = vars.get(key).and_then(config::scalar_string) {
                return Some(value);
            }
        }
        if let Some(value) = cfg.get(key).and_then(config::scalar_string) {
            return Some(value);
        }
        if let Some(value) = target.config.get(key).and_then(config::scalar_string) {
            return Some(value);
        }

        if let Some(parent) = target.parent {
            if let Some(value) = self.lookup_target_var(parent, key) {
                return Some(value);
            }
        }

        self.global_scope.get(key)
    }

    /// The nearest target (self or ancestor) carrying a build scope; the
    /// target itself when none exists, since lookups still fall through to
    /// configuration and the global scope.
    fn nearest_build_scope(&self, id: TargetId) -> TargetId {
        let mut current = Some(id);
        while let Some(c) = current {
            if self.targets[c.0].build_scope.is_some() {
                return c;
            }
            current = self.targets[c.0].parent;
        }
        id
    }

    /// Builds the substitution namespaces for a target's build scope.
    pub fn scope_views(&self, id: TargetId) -> TargetScopeViews<'_> {
        let scope_id = self.nearest_build_scope(id);
        TargetScopeViews {
            build: BuildScopeVars { env: self, id: scope_id },
            target_ns: TargetConfigVars { env: self, id },
            global: &self.global_scope,
            env_ns: EnvVarNamespace,
            extra: Vec::new(),
        }
    }

    /// A raw config entry, searched recursively through the parent chain.
    pub fn cfg_entry_recursive(&self, id: TargetId, key: &str) -> Option<Value> {
        let mut current = Some(id);
        while let Some(c) = current {
            if let Some(value) = self.targets[c.0].config.get(key) {
                return Some(value.clone());
            }
            current = self.targets[c.0].parent;
        }
        None
    }

    /// Resolves a parent-referencing module path: each leading dot walks one
    /// parent up, and the remainder is prefixed with that ancestor's module.
    pub fn resolve_parent_ref(&self, name: &str, id: TargetId) -> String {
        let mut rest = name;
        let mut parent: Option<TargetId> = None;

        while let Some(stripped) = rest.strip_prefix('.') {
            rest = stripped;
            let base = parent.unwrap_or(id);
            parent = Some(self.targets[base.0].parent.unwrap_or(base));
        }

        match parent {
            Some(p) if !self.targets[p.0].module.is_empty() => {
                format!("{}.{}", self.targets[p.0].module, rest)
            }
            _ => rest.to_string(),
        }
    }

    /// Computes the flattened, genealogy-merged configuration of a target.
    pub fn compute_resolved_config(
        &self,
        id: TargetId,
        mappings: &ConfigMappings,
    ) -> Result<TargetConfig> {
        let mut chain = Vec::new();
        let mut current = Some(id);
        while let Some(c) = current {
            chain.push(self.targets[c.0].config.clone());
            current = self.targets[c.0].parent;
        }
        chain.reverse();

        config::resolve_genealogy(&chain, mappings, Some(&self.targets[id.0].module))
    }

    // ----- dependency resolution -------------------------------------------

    pub fn find_child(&self, id: TargetId, name: &str) -> Option<TargetId> {
        self.targets[id.0]
            .children
            .iter()
            .copied()
            .find(|c| self.targets[c.0].name == name)
    }

    fn find_used_dependency(&self, id: TargetId, name: &str) -> Option<TargetDependency> {
        let target = &self.targets[id.0];

        if let Some((_, dep)) = target.used_mapping.iter().find(|(n, _)| n == name) {
            return Some(dep.clone());
        }
        if let Some(parent) = target.parent {
            if let Some(dep) = self.find_used_dependency(parent, name) {
                return Some(dep);
            }
        }
        if let Some(dep_parent) = target.dep_parent {
            if let Some(dep) = self.find_used_dependency(dep_parent, name) {
                return Some(dep);
            }
        }
        None
    }

    fn apply_subtarget_filters(
        &self,
        from: TargetId,
        dep: &TargetDependency,
        base: TargetId,
    ) -> Result<Vec<TargetId>> {
        let mut out = Vec::new();

        for filter in &dep.filters {
            if filter.starts_with('/') {
                continue;
            }

            let mut current = base;
            for part in filter.split('.') {
                if part.is_empty() {
                    continue;
                }
                current = self.find_child(current, part).ok_or_else(|| {
                    Error::dependency(
                        Some(self.targets[from.0].module.clone()),
                        format!(
                            "unresolved partial dependency filter '{filter}' for '{}' <- '{}' (failed at part '{part}')",
                            self.targets[base.0].module, dep.raw
                        ),
                    )
                })?;
            }
            out.push(current);
        }

        Ok(out)
    }

    fn has_subtarget_filters(dep: &TargetDependency) -> bool {
        dep.filters.iter().any(|f| !f.starts_with('/'))
    }

    /// Materializes the extra-config variant of a locally registered target,
    /// memoized by the owning dependent's identity tag.
    fn local_extra_config_variant(
        &mut self,
        from: TargetId,
        dep: &TargetDependency,
        base: TargetId,
        hash: &str,
    ) -> Result<TargetId> {
        let variant_module = format!("ecfg-local.{}.{}", self.targets[base.0].module, hash);

        if let Some(existing) = self.module_map.get(&variant_module) {
            return Ok(*existing);
        }

        let base_path = self.targets[base.0].path.clone();
        let base_parent = self.targets[base.0].parent;

        let id = self.load_free_target(&base_path, Some(from), Some(dep))?;
        {
            let target = &mut self.targets[id.0];
            target.root_path = target.path.clone();
            target.module = variant_module;
            target.parent = base_parent;
            if let Some(extra) = &dep.extra_config {
                config::merge_node(&mut target.config, extra, false);
            }
        }

        self.load_target_dependencies(id)?;
        self.load_target_source_tree(id, None)?;
        self.register_local_target(id)?;

        Ok(id)
    }

    /// The resolver dispatch: local namespace, `uses:` indirection, or a
    /// registered namespace resolver, with architecture coercion and
    /// subtarget filters applied on the way out.
    ///
    /// An empty result means "not found" for the local namespace; the caller
    /// decides whether that is fatal.
    pub fn resolve_dependency(
        &mut self,
        from: TargetId,
        dep: &TargetDependency,
        use_external: bool,
    ) -> Result<Vec<TargetId>> {
        if dep.ns.is_empty() {
            let name = if dep.name.starts_with('.') {
                self.resolve_parent_ref(&dep.name, from)
            } else {
                dep.name.clone()
            };

            let Some(mut result) = self.module_map.get(&name).copied() else {
                return Ok(Vec::new());
            };

            if let Some(hash) = dep.extra_config_hash.clone() {
                result = self.local_extra_config_variant(from, dep, result, &hash)?;
            }

            result = self.coerce_arch_if_needed(from, dep, result)?;

            if Self::has_subtarget_filters(dep) {
                return self.apply_subtarget_filters(from, dep, result);
            }
            return Ok(vec![result]);
        }

        if !use_external {
            return Ok(Vec::new());
        }

        let from_module = self.targets[from.0].module.clone();

        if dep.ns == "uses" {
            let used = self.find_used_dependency(from, &dep.name).ok_or_else(|| {
                Error::dependency(
                    Some(from_module.clone()),
                    format!("uses-dependency '{}' not found", dep.raw),
                )
            })?;

            let result = self.resolve_dependency(from, &used, use_external)?;
            if result.is_empty() {
                return Err(Error::dependency(
                    Some(from_module),
                    format!("unresolved uses-dependency '{}' <- '{}'", dep.raw, used.raw),
                ));
            }

            let custom_filters = self
                .dep_resolvers
                .get(&used.ns)
                .map(|r| r.handles_filters())
                .unwrap_or(false);

            if !dep.filters.is_empty() && !custom_filters {
                if !used.filters.is_empty() {
                    for filter in &dep.filters {
                        if filter.starts_with('/') {
                            continue;
                        }
                        if !used.filters.contains(filter) {
                            return Err(Error::dependency(
                                Some(from_module),
                                format!(
                                    "invalid filter in uses-dependency '{}' <- '{}': '{filter}' is not part of the original filters",
                                    dep.raw, used.raw
                                ),
                            ));
                        }
                    }

                    let out: Vec<TargetId> = used
                        .filters
                        .iter()
                        .zip(result.iter())
                        .filter(|(filter, _)| dep.filters.contains(filter))
                        .map(|(_, id)| *id)
                        .collect();

                    if out.is_empty() {
                        return Err(Error::dependency(
                            Some(from_module),
                            format!(
                                "error in uses-dependency '{}' <- '{}': everything got filtered out",
                                dep.raw, used.raw
                            ),
                        ));
                    }
                    return Ok(out);
                }

                if result.len() == 1 {
                    return self.apply_subtarget_filters(from, dep, result[0]);
                }
                return Err(Error::dependency(
                    Some(from_module),
                    format!(
                        "error in uses-dependency '{}' <- '{}': ambiguous filter refinement",
                        dep.raw, used.raw
                    ),
                ));
            }

            return Ok(result);
        }

        let Some(resolver) = self.dep_resolvers.get(&dep.ns).cloned() else {
            return Err(Error::load(
                Some(from_module),
                format!("dependency '{}': unknown target namespace '{}'", dep.raw, dep.ns),
            ));
        };

        let result = resolver.resolve(self, from, dep)?;

        {
            let path = self.targets[result.0].path.to_string_lossy().to_string();
            let target = &mut self.targets[result.0];
            if let Some(map) = target.config.as_mapping_mut() {
                map.insert("load-context".into(), "dep".into());
                map.insert("root-dir".into(), Value::String(path));
                map.insert("is-external-dep".into(), "true".into());
            }
            if let Some(resolved) = target.resolved_config.as_mut() {
                if let Some(map) = resolved.as_mapping_mut() {
                    map.insert("is-external-dep".into(), "true".into());
                }
            }
        }

        if self.scope_views(from).resolve_local("inherit-caller-in-deps")? == "true" {
            let caller_root = self.targets[from.0].root;
            let target = &mut self.targets[result.0];
            target.root = caller_root;
            target.parent = caller_root;
        }

        if self.targets[result.0].resolved_config.is_none() {
            let views = self.scope_views(from);
            let mut mappings = ConfigMappings::new();
            mappings.insert("arch".into(), views.resolve_local("arch")?);
            mappings.insert("platform".into(), views.resolve_local("platform")?);
            mappings.insert("config".into(), views.resolve_local("configuration")?);
            mappings.insert("runtime".into(), views.resolve_local("runtime")?);
            drop(views);

            let resolved = self.compute_resolved_config(result, &mappings)?;
            self.targets[result.0].resolved_config = Some(resolved);
            self.load_conditional_dependencies(result)?;
        }

        if resolver.handles_filters() || !Self::has_subtarget_filters(dep) {
            Ok(vec![result])
        } else {
            self.apply_subtarget_filters(from, dep, result)
        }
    }

    /// Replaces a candidate with its architecture-coerced variant when the
    /// dependent's arch differs. Coercion is always attempted when a coercer
    /// is registered; without one the mismatch is fatal.
    fn coerce_arch_if_needed(
        &mut self,
        from: TargetId,
        dep: &TargetDependency,
        candidate: TargetId,
    ) -> Result<TargetId> {
        let scopes_ready = self.targets[from.0].build_scope.is_some()
            && self.targets[candidate.0].build_scope.is_some();
        if !scopes_ready {
            return Ok(candidate);
        }

        let target_arch = self.scope_views(from).resolve_local("arch")?;
        let dep_arch = self.scope_views(candidate).resolve_local("arch")?;

        if target_arch == dep_arch {
            return Ok(candidate);
        }

        let Some(coercer) = self.dep_resolvers.get("arch-coerced").cloned() else {
            return Err(Error::load(
                Some(self.targets[from.0].module.clone()),
                format!(
                    "dependency '{}': architecture mismatch (target:{target_arch} != dep:{dep_arch}) without a multi-arch dep resolver",
                    dep.raw
                ),
            ));
        };

        self.out.info(&format!(
            " * Performing arch coercion: {}:{} <- {}:{}\n",
            self.targets[from.0].module, target_arch, self.targets[candidate.0].module, dep_arch
        ));

        coercer.resolve_coerced(self, from, candidate)
    }

    // ----- dependency set collection ---------------------------------------

    fn collect_child_set(&self, id: TargetId, out: &mut Vec<TargetId>) {
        out.push(id);
        for child in &self.targets[id.0].children {
            self.collect_child_set(*child, out);
        }
    }

    /// Post-order traversal resolving dependencies on the way: uses-mappings
    /// first, then declared dependencies (recursing into each resolved
    /// target and recording reverse edges), then children, then the target
    /// itself. The resulting order places dependencies before dependents.
    fn append_deps_and_self(
        &mut self,
        id: TargetId,
        out: &mut Vec<TargetId>,
        throw_on_missing: bool,
        use_external: bool,
    ) -> Result<()> {
        if out.contains(&id) {
            return Ok(());
        }

        if self.targets[id.0].resolved_config.is_some() && !self.targets[id.0].enabled() {
            log::trace!("skipping '{}': not enabled", self.targets[id.0].module);
            return Ok(());
        }

        if self.resolution_stack.contains(&id) {
            let cycle: Vec<String> = self
                .resolution_stack
                .iter()
                .map(|t| self.targets[t.0].module.clone())
                .collect();
            return Err(Error::dependency(
                Some(self.targets[id.0].module.clone()),
                format!("dependency cycle detected: {} -> {}", cycle.join(" -> "), self.targets[id.0].module),
            ));
        }
        self.resolution_stack.push(id);
        let result = self.append_deps_and_self_inner(id, out, throw_on_missing, use_external);
        self.resolution_stack.pop();
        result
    }

    fn append_deps_and_self_inner(
        &mut self,
        id: TargetId,
        out: &mut Vec<TargetId>,
        throw_on_missing: bool,
        use_external: bool,
    ) -> Result<()> {
        // Uses-mappings resolve every visit so dependents can refine them.
        for index in 0..self.targets[id.0].used_mapping.len() {
            let dep = self.targets[id.0].used_mapping[index].1.clone();
            let resolved = self.resolve_dependency(id, &dep, use_external)?;

            if resolved.is_empty() {
                if throw_on_missing {
                    return Err(Error::dependency(
                        Some(self.targets[id.0].module.clone()),
                        format!("unresolved uses-map dependency '{}'", dep.name),
                    ));
                }
            } else {
                self.targets[id.0].used_mapping[index].1.resolved = resolved;
            }
        }

        let mut index = 0;
        while index < self.targets[id.0].dependencies.len() {
            let dep = self.targets[id.0].dependencies[index].clone();

            let resolved = if dep.resolved.is_empty() {
                let resolved = self.resolve_dependency(id, &dep, use_external)?;
                if resolved.is_empty() {
                    if throw_on_missing {
                        return Err(Error::dependency(
                            Some(self.targets[id.0].module.clone()),
                            format!("unresolved dependency '{}'", dep.raw),
                        ));
                    }
                    index += 1;
                    continue;
                }
                self.targets[id.0].dependencies[index].resolved = resolved.clone();
                resolved
            } else {
                dep.resolved.clone()
            };

            for resolved_id in resolved {
                self.append_deps_and_self(resolved_id, out, throw_on_missing, use_external)?;

                let mut subtree = Vec::new();
                self.collect_child_set(resolved_id, &mut subtree);
                for needed in subtree {
                    self.targets[needed.0].dependents.insert(id);
                }
            }

            index += 1;
        }

        for child in self.targets[id.0].children.clone() {
            self.append_deps_and_self(child, out, throw_on_missing, use_external)?;
        }

        if !out.contains(&id) {
            out.push(id);
        }
        Ok(())
    }

    /// The full dependency set of a single target, resolving as needed.
    pub fn single_target_dep_set(&mut self, id: TargetId) -> Result<Vec<TargetId>> {
        let mut out = Vec::new();
        self.append_deps_and_self(id, &mut out, true, true)?;
        Ok(out)
    }

    /// Like [`Self::single_target_dep_set`] but without external resolution
    /// and tolerant of missing dependencies.
    pub fn single_target_local_dep_set(&mut self, id: TargetId) -> Result<Vec<TargetId>> {
        let mut out = Vec::new();
        self.append_deps_and_self(id, &mut out, false, false)?;
        Ok(out)
    }

    /// Every root's dependency set, deps before dependents.
    pub fn targets_in_dependency_order(&mut self) -> Result<Vec<TargetId>> {
        let mut out = Vec::new();
        for root in self.roots.clone() {
            self.append_deps_and_self(root, &mut out, true, true)?;
        }
        Ok(out)
    }

    /// Collects the already-resolved dependency set without resolving.
    pub fn dependency_set_no_resolve(&self, id: TargetId, out: &mut Vec<TargetId>) -> Result<()> {
        if out.contains(&id) {
            return Ok(());
        }

        if self.targets[id.0].resolved_config.is_some() && !self.targets[id.0].enabled() {
            return Ok(());
        }

        out.push(id);

        for dep in &self.targets[id.0].dependencies {
            if dep.resolved.is_empty() {
                return Err(Error::dependency(
                    Some(self.targets[id.0].module.clone()),
                    format!("unresolved dependency '{}'", dep.raw),
                ));
            }
            for resolved in &dep.resolved {
                self.dependency_set_no_resolve(*resolved, out)?;
            }
        }

        for child in &self.targets[id.0].children {
            self.dependency_set_no_resolve(*child, out)?;
        }

        Ok(())
    }

    // ----- link environment and build description ---------------------------

    /// Selects the target's link-language provider from `link-with` (a scalar
    /// or a per-target-type map) and initializes its link environment once.
    pub fn init_target_link_env(
        &mut self,
        desc: &mut NinjaBuildDesc,
        id: TargetId,
    ) -> Result<Option<Rc<dyn LangProvider>>> {
        let link_cfg = self.cfg_entry_recursive(id, "link-with");

        let link_language = match &link_cfg {
            Some(value) if value.is_mapping() => {
                let ty = self.targets[id.0].ty.as_str();
                value
                    .get(ty)
                    .or_else(|| value.get("default"))
                    .and_then(config::scalar_string)
            }
            Some(value) => config::scalar_string(value),
            None => None,
        };

        let provider = match &link_language {
            Some(lang) => Some(self.lang_providers.get(lang).cloned().ok_or_else(|| {
                Error::load(
                    Some(self.targets[id.0].module.clone()),
                    format!("unknown link-with language '{lang}'"),
                )
            })?),
            None => None,
        };

        if let Some(provider) = &provider {
            let state_key = format!("link_initialized_{}", self.targets[id.0].module);
            if desc.state.get(&state_key).map(String::as_str) != Some("1") {
                provider.init_link_target_env(self, desc, id)?;
                desc.state.insert(state_key, "1".into());
            }
        }

        for feature in self.targets[id.0].features.clone() {
            if !self.target_features.contains_key(&feature) {
                return Err(Error::load(
                    Some(self.targets[id.0].module.clone()),
                    format!("unknown target feature '{feature}'"),
                ));
            }
        }

        Ok(provider)
    }

    pub fn init_link_env_with_deps(
        &mut self,
        desc: &mut NinjaBuildDesc,
        id: TargetId,
    ) -> Result<()> {
        for dep in self.single_target_local_dep_set(id)? {
            self.init_target_link_env(desc, dep)?;
        }
        Ok(())
    }

    /// Emits rules and build entries for one target: every declared language
    /// gets to install rules and process sources, then the link language
    /// creates the final artifact.
    pub fn populate_build_desc(&mut self, desc: &mut NinjaBuildDesc, id: TargetId) -> Result<()> {
        let langs = self.cfg_entry_recursive(id, "langs");

        let link_provider = self.init_target_link_env(desc, id)?;

        if self.targets[id.0].resolved_config.is_some() && !self.targets[id.0].enabled() {
            log::trace!("skipping '{}': not enabled", self.targets[id.0].module);
            return Ok(());
        }

        if let Some(Value::Sequence(langs)) = langs {
            for lang in langs {
                let Some(lang_id) = lang.as_str() else {
                    continue;
                };
                let provider = self.lang_providers.get(lang_id).cloned().ok_or_else(|| {
                    Error::load(
                        Some(self.targets[id.0].module.clone()),
                        format!("unknown language '{lang_id}'"),
                    )
                })?;

                if provider.init_build_target_rules(self, desc, id)? {
                    for source_index in 0..self.targets[id.0].sources.len() {
                        provider.process_source_file(self, desc, id, source_index)?;
                    }
                }
            }
        }

        if let Some(provider) = link_provider {
            provider.create_target_artifact(self, desc, id)?;
        }

        Ok(())
    }

    pub fn populate_build_desc_with_deps(
        &mut self,
        desc: &mut NinjaBuildDesc,
        id: TargetId,
    ) -> Result<()> {
        for dep in self.single_target_dep_set(id)? {
            self.populate_build_desc(desc, dep)?;
        }
        Ok(())
    }

    /// Global, once-per-description provider initialization.
    pub fn populate_full_build_desc(&mut self, desc: &mut NinjaBuildDesc) {
        for provider in self.lang_providers.values().cloned().collect::<Vec<_>>() {
            provider.init_in_build_desc(desc);
        }
    }

    // ----- actions ----------------------------------------------------------

    fn action_run_options(&self, id: TargetId) -> Result<RunOptions> {
        let mut opts = RunOptions {
            strict: true,
            extra_path: Vec::new(),
        };

        let env_path = self.targets[id.0]
            .resolved_config
            .as_ref()
            .and_then(|c| c.get("env-path").cloned());
        if let Some(Value::Sequence(paths)) = env_path {
            let views = self.scope_views(id);
            for path in paths {
                if let Some(p) = path.as_str() {
                    opts.extra_path.push(views.resolve(p)?);
                }
            }
        }

        Ok(opts)
    }

    fn copy_to_dependents(
        &self,
        source: TargetId,
        dependent: TargetId,
        desc: &NinjaBuildDesc,
        from: &Path,
        to: &str,
        visited: &mut HashSet<TargetId>,
    ) -> Result<()> {
        if !visited.insert(dependent) {
            return Ok(());
        }

        let escaped = escape_module_path(&self.targets[dependent.0].module);

        if let Some(artifact_dir) = desc.artifact_directory(&escaped) {
            let to_dep = desc.out_dir.join(artifact_dir);

            let mut views = self.scope_views(dependent);
            views.add_target_namespace("self", self, source);
            let to_resolved = views.resolve(to)?;

            let to_path = to_dep.join(&to_resolved);
            if to_resolved.ends_with('/') {
                std::fs::create_dir_all(&to_path)?;
            } else if let Some(parent) = to_path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            if to_dep.exists() {
                fsutil::copy_recursive(from, &to_path, CopyMode::Overwrite)?;
            }
        }

        for inner in self.targets[dependent.0].dependents.clone() {
            self.copy_to_dependents(source, inner, desc, from, to, visited)?;
        }
        Ok(())
    }

    /// Executes a single action of a known type against a target.
    pub fn run_target_action(
        &mut self,
        desc: Option<&NinjaBuildDesc>,
        id: TargetId,
        action_type: &str,
        data: &Value,
        opts: &RunOptions,
    ) -> Result<()> {
        let module = self.targets[id.0].module.clone();
        let target_path = self.targets[id.0].path.clone();
        let escaped = escape_module_path(&module);

        match action_type {
            "copy" => {
                let (from, to) = {
                    let views = self.scope_views(id);
                    let from = views.resolve(config::entry_str(data, "from").ok_or_else(|| {
                        Error::config(Some(module.clone()), "copy action requires 'from'".to_string())
                    })?.as_str())?;
                    let to = views.resolve(config::entry_str(data, "to").ok_or_else(|| {
                        Error::config(Some(module.clone()), "copy action requires 'to'".to_string())
                    })?.as_str())?;
                    (from, to)
                };

                let mut from_path = PathBuf::from(from);
                if !from_path.is_absolute() {
                    from_path = target_path.join(from_path);
                }

                let mut to_path = PathBuf::from(to);
                if !to_path.is_absolute() {
                    let desc = desc.ok_or_else(|| {
                        Error::build(
                            Some(module.clone()),
                            "copy action with a relative 'to' requires a build description".to_string(),
                        )
                    })?;
                    let artifact_dir = desc.artifact_directory(&escaped).ok_or_else(|| {
                        Error::build(Some(module.clone()), "no artifact directory".to_string())
                    })?;
                    to_path = desc.out_dir.join(artifact_dir).join(to_path);
                }

                fsutil::copy_recursive(&from_path, &to_path, CopyMode::Overwrite)?;
            }

            "copy-to-deps" => {
                let from = {
                    let views = self.scope_views(id);
                    views.resolve(config::entry_str(data, "from").ok_or_else(|| {
                        Error::config(Some(module.clone()), "copy-to-deps requires 'from'".to_string())
                    })?.as_str())?
                };
                let to = config::entry_str(data, "to").ok_or_else(|| {
                    Error::config(Some(module.clone()), "copy-to-deps requires 'to'".to_string())
                })?;

                let mut from_path = PathBuf::from(from);
                if !from_path.is_absolute() {
                    from_path = target_path.join(from_path);
                }

                if from_path.exists() {
                    let desc = desc.ok_or_else(|| {
                        Error::build(
                            Some(module.clone()),
                            "copy-to-deps requires a build description".to_string(),
                        )
                    })?;
                    let mut visited = HashSet::new();
                    for dependent in self.targets[id.0].dependents.clone() {
                        self.copy_to_dependents(id, dependent, desc, &from_path, &to, &mut visited)?;
                    }
                }
            }

            "run" => {
                if let Value::Mapping(_) = data {
                    let views = self.scope_views(id);
                    let command = views.resolve(
                        config::entry_str(data, "command")
                            .ok_or_else(|| {
                                Error::config(
                                    Some(module.clone()),
                                    "run action requires 'command'".to_string(),
                                )
                            })?
                            .as_str(),
                    )?;

                    let mut args = Vec::new();
                    if let Some(Value::Sequence(list)) = data.get("args") {
                        for arg in list {
                            if let Some(a) = config::scalar_string(arg) {
                                args.push(views.resolve(&a)?);
                            }
                        }
                    }
                    drop(views);

                    process::run_process(&command, &args, &target_path, opts)?;
                } else {
                    let command = {
                        let views = self.scope_views(id);
                        views.resolve(&config::scalar_string(data).unwrap_or_default())?
                    };
                    process::run_command_line(&command, &target_path, opts)?;
                }
            }

            "shell-run" => {
                let command = {
                    let views = self.scope_views(id);
                    views.resolve(
                        config::entry_str(data, "command")
                            .ok_or_else(|| {
                                Error::config(
                                    Some(module.clone()),
                                    "shell-run action requires 'command'".to_string(),
                                )
                            })?
                            .as_str(),
                    )?
                };
                let lax = RunOptions {
                    strict: false,
                    extra_path: opts.extra_path.clone(),
                };
                process::shell_run(&command, &target_path, &lax)?;
            }

            "command" => {
                let command = {
                    let views = self.scope_views(id);
                    views.resolve(&config::scalar_string(data).unwrap_or_default())?
                };
                let lax = RunOptions {
                    strict: false,
                    extra_path: opts.extra_path.clone(),
                };
                process::shell_run(&command, &target_path, &lax)?;
            }

            "install" => {
                let desc = desc.ok_or_else(|| {
                    Error::build(
                        Some(module.clone()),
                        "install action requires a build description".to_string(),
                    )
                })?;
                let artifact_dir = desc
                    .artifact_directory(&escaped)
                    .map(|d| desc.out_dir.join(d))
                    .ok_or_else(|| {
                        Error::build(Some(module.clone()), "no artifact directory".to_string())
                    })?;

                let mut from = artifact_dir.clone();
                if let Some(extra) = config::entry_str(data, "from") {
                    let views = self.scope_views(id);
                    from = from.join(views.resolve(&extra)?);
                }

                self.out
                    .info_styled(&format!(" * Installed {module} to:\n"));

                let run_install = |env: &Self, raw: &str, create_dir: bool| -> Result<()> {
                    let views = env.scope_views(id);
                    let mut to = PathBuf::from(views.resolve(raw)?);
                    if !to.is_absolute() {
                        to = artifact_dir.join(to);
                    }

                    env.out.info_styled(&format!("     - {}\n", to.display()));

                    if create_dir && !to.exists() {
                        std::fs::create_dir_all(&to)?;
                    }
                    fsutil::copy_recursive(&from, &to, CopyMode::Overwrite)
                };

                if let Some(to) = data.get("to") {
                    match to {
                        Value::Sequence(seq) => {
                            for v in seq {
                                if let Some(s) = config::scalar_string(v) {
                                    run_install(self, &s, true)?;
                                }
                            }
                        }
                        other => {
                            if let Some(s) = config::scalar_string(other) {
                                run_install(self, &s, true)?;
                            }
                        }
                    }
                } else if let Some(to) = data.get("to-file") {
                    match to {
                        Value::Sequence(seq) => {
                            for v in seq {
                                if let Some(s) = config::scalar_string(v) {
                                    run_install(self, &s, false)?;
                                }
                            }
                        }
                        other => {
                            if let Some(s) = config::scalar_string(other) {
                                run_install(self, &s, false)?;
                            }
                        }
                    }
                }
            }

            other => {
                log::debug!("ignoring unknown action type '{other}' on '{module}'");
            }
        }

        Ok(())
    }

    fn run_action_list(
        &mut self,
        desc: Option<&NinjaBuildDesc>,
        id: TargetId,
        list: &Value,
        run_type: &str,
        default_run_type: &str,
    ) -> Result<()> {
        let opts = self.action_run_options(id)?;

        let Value::Sequence(items) = list else {
            return Ok(());
        };

        for item in items {
            let Value::Mapping(map) = item else {
                continue;
            };

            for (key, data) in map {
                let Some(action_type) = key.as_str() else {
                    continue;
                };

                let mut should_run = run_type == default_run_type;
                if let Some(on) = data.get("on") {
                    should_run = match on {
                        Value::Sequence(phases) => phases
                            .iter()
                            .any(|p| p.as_str() == Some(run_type)),
                        other => config::scalar_string(other).as_deref() == Some(run_type),
                    };
                }

                if should_run {
                    log::trace!("{} -> action {action_type}", self.targets[id.0].module);
                    self.run_target_action(desc, id, action_type, data, &opts)?;
                }
            }
        }

        Ok(())
    }

    /// Runs the target's `actions` entries matching the given phase.
    ///
    /// `actions` is either a sequence (applied at the default `post-build`
    /// phase unless restricted by `on:`) or a map of phase name to list.
    pub fn run_actions_categorized(
        &mut self,
        id: TargetId,
        desc: Option<&NinjaBuildDesc>,
        run_type: &str,
    ) -> Result<()> {
        let actions = self.targets[id.0].effective_config().get("actions").cloned();
        let Some(actions) = actions else {
            return Ok(());
        };

        match &actions {
            Value::Mapping(map) => {
                for (key, data) in map {
                    let Some(phase) = key.as_str() else {
                        continue;
                    };
                    self.run_action_list(desc, id, data, run_type, phase)?;
                }
            }
            _ => self.run_action_list(desc, id, &actions, run_type, "post-build")?,
        }

        Ok(())
    }

    // ----- structured tasks -------------------------------------------------

    /// Auto-triggers `run: always` tasks through the ancestor chain.
    pub fn run_automatic_structured_tasks(
        &mut self,
        id: TargetId,
        desc: Option<&NinjaBuildDesc>,
        stage: &str,
    ) -> Result<()> {
        if let Some(parent) = self.targets[id.0].parent {
            self.run_automatic_structured_tasks(parent, desc, stage)?;
        }

        let tasks = self.targets[id.0].effective_config().get("tasks").cloned();
        if let Some(Value::Mapping(tasks)) = tasks {
            for (key, task) in &tasks {
                let Some(name) = key.as_str() else {
                    continue;
                };
                if config::entry_str(task, "run").as_deref() == Some("always") {
                    self.run_structured_task_data(id, desc, task, name, stage)?;
                }
            }
        }

        Ok(())
    }

    pub fn run_structured_task(
        &mut self,
        id: TargetId,
        desc: Option<&NinjaBuildDesc>,
        name: &str,
        stage: &str,
    ) -> Result<()> {
        let task = self.targets[id.0]
            .effective_config()
            .get("tasks")
            .and_then(|t| t.get(name))
            .cloned();

        if let Some(task) = task {
            self.run_structured_task_data(id, desc, &task, name, stage)?;
        }
        Ok(())
    }

    /// Runs one task's stage actions at most once per invocation, its
    /// declared task dependencies first.
    pub fn run_structured_task_data(
        &mut self,
        id: TargetId,
        desc: Option<&NinjaBuildDesc>,
        task: &Value,
        name: &str,
        stage: &str,
    ) -> Result<()> {
        if let Some(Value::Sequence(deps)) = task.get("deps") {
            for dep_task in deps.clone() {
                let Some(dep_name) = dep_task.as_str() else {
                    continue;
                };
                match desc {
                    Some(d) => {
                        let root = d.root_target.ok_or_else(|| {
                            Error::build(None, "build description has no root target".to_string())
                        })?;
                        for dep in self.single_target_dep_set(root)? {
                            self.run_structured_task(dep, desc, dep_name, stage)?;
                        }
                    }
                    None => self.run_structured_task(id, None, dep_name, stage)?,
                }
            }
        }

        if let Some(stage_actions) = task.get(stage).cloned() {
            let completion_key =
                format!("{} / {name} [{stage}]", self.targets[id.0].module);

            if self.completed_tasks.contains(&completion_key) {
                return Ok(());
            }

            let silent = config::entry_bool(task, "silent").unwrap_or(false);
            if !silent {
                self.out
                    .info_styled(&format!(" - Running task {completion_key}\n\n"));
            }

            self.run_action_list(desc, id, &stage_actions, stage, stage)?;
            self.completed_tasks.insert(completion_key);
        }

        Ok(())
    }

    // ----- install ----------------------------------------------------------

    fn install_path_to_target(&mut self, id: TargetId, from: &Path) -> Result<()> {
        if let Some(install) = self.cfg_entry_recursive(id, "install") {
            let Some(raw) = config::scalar_string(&install) else {
                return Ok(());
            };
            let path = {
                let views = self.scope_views(id);
                views.resolve(&raw)?
            };

            self.out.info(&format!(
                "Installing {} - {} => {path}\n",
                self.targets[id.0].module,
                from.display()
            ));

            if from.exists() {
                fsutil::copy_recursive(from, Path::new(&path), CopyMode::SkipExisting)?;
            }
        }
        Ok(())
    }

    /// The install flow: copy the artifact directory to the declared install
    /// path, then run `post-install` actions.
    pub fn run_install_actions(&mut self, id: TargetId, desc: &NinjaBuildDesc) -> Result<()> {
        let escaped = escape_module_path(&self.targets[id.0].module);
        if let Some(artifact_dir) = desc.artifact_directory(&escaped) {
            let from = desc.out_dir.join(artifact_dir);
            self.install_path_to_target(id, &from)?;
        }

        self.run_actions_categorized(id, Some(desc), "post-install")
    }

    pub fn run_post_build_actions(&mut self, id: TargetId, desc: &NinjaBuildDesc) -> Result<()> {
        self.run_actions_categorized(id, Some(desc), "post-build")
    }

    // ----- diagnostics ------------------------------------------------------

    fn render_target_tree(&self, id: TargetId, depth: usize, out: &mut String) {
        let target = &self.targets[id.0];
        let indent = "  ".repeat(depth);

        out.push_str(&format!("{indent}{} ({})\n", target.module, target.ty.as_str()));

        if !target.dependencies.is_empty() {
            out.push_str(&format!("{indent}  depends on:\n"));
            for dep in &target.dependencies {
                let resolved: Vec<&str> = dep
                    .resolved
                    .iter()
                    .map(|r| self.targets[r.0].module.as_str())
                    .collect();
                out.push_str(&format!(
                    "{indent}    {} => [{}]\n",
                    dep.raw,
                    resolved.join(", ")
                ));
            }
        }

        for child in &target.children {
            self.render_target_tree(*child, depth + 1, out);
        }
    }

    /// A human-readable rendering of every root's target tree with its
    /// dependency edges and their resolutions.
    pub fn render_build_info(&self) -> String {
        let mut out = String::new();
        for root in &self.roots {
            out.push_str("* ");
            self.render_target_tree(*root, 0, &mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{Output, OutputLevel};
    use crate::target::{TargetType, parse_dependency_node};
    use std::fs;
    use std::path::PathBuf;

    fn quiet_env() -> BuildEnv {
        BuildEnv::new(Output::new(OutputLevel::Off))
    }

    fn yaml(text: &str) -> Value {
        serde_yaml::from_str(text).unwrap()
    }

    fn write_tree(root: &Path, files: &[(&str, &str)]) {
        for (rel, content) in files {
            let path = root.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
    }

    fn project_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        write_tree(
            dir.path(),
            &[
                ("re.yml", "type: project\nname: proj\n"),
                ("libfoo/re.yml", "type: static-library\n"),
                ("libfoo/foo.cpp", "int foo() { return 42; }\n"),
                ("hello/re.yml", "type: executable\ndeps: [.libfoo]\n"),
                ("hello/main.cpp", "int main() {}\n"),
                (".hidden/stray.cpp", "int stray;\n"),
                ("ignored/.re-ignore-this", ""),
                ("ignored/junk.cpp", "int junk;\n"),
            ],
        );
        dir
    }

    #[test]
    fn loads_a_target_tree_with_children_and_sources() {
        let dir = project_tree();
        let mut env = quiet_env();
        let root = env.load_root_target(dir.path()).unwrap();

        assert_eq!(env.target(root).module, "proj");
        let lib = env.find_target("proj.libfoo").unwrap();
        let exe = env.find_target("proj.hello").unwrap();

        assert_eq!(env.target(lib).ty, TargetType::StaticLibrary);
        assert_eq!(env.target(exe).ty, TargetType::Executable);
        assert_eq!(env.target(root).children.len(), 2);

        let lib_sources: Vec<_> = env
            .target(lib)
            .sources
            .iter()
            .map(|s| s.path.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(lib_sources, vec!["foo.cpp"]);
        assert_eq!(env.target(lib).sources[0].extension, "cpp");

        // Dot-directories and ignore-marked directories contribute nothing.
        let all: Vec<_> = env
            .target(root)
            .sources
            .iter()
            .map(|s| s.path.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert!(!all.contains(&"stray.cpp".to_string()));
        assert!(!all.contains(&"junk.cpp".to_string()));
    }

    #[test]
    fn duplicate_modules_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(
            dir.path(),
            &[
                ("re.yml", "type: project\nname: proj\n"),
                ("a/re.yml", "type: executable\nname: dup\n"),
                ("b/re.yml", "type: executable\nname: dup\n"),
            ],
        );

        let mut env = quiet_env();
        let err = env.load_root_target(dir.path()).unwrap_err();
        assert!(matches!(err, Error::Load { .. }));
        assert!(err.to_string().contains("defined more than once"));
    }

    #[test]
    fn dependency_set_places_dependencies_before_dependents() {
        let dir = project_tree();
        let mut env = quiet_env();
        let root = env.load_root_target(dir.path()).unwrap();

        let set = env.single_target_dep_set(root).unwrap();
        let lib = env.find_target("proj.libfoo").unwrap();
        let exe = env.find_target("proj.hello").unwrap();

        let pos = |id: TargetId| set.iter().position(|t| *t == id).unwrap();
        assert!(pos(lib) < pos(exe));
        assert!(pos(exe) < pos(root));

        // Reverse edges: the library knows its dependent.
        assert!(env.target(lib).dependents.contains(&exe));
    }

    #[test]
    fn modules_are_registered_exactly_once_in_the_map() {
        let dir = project_tree();
        let mut env = quiet_env();
        let root = env.load_root_target(dir.path()).unwrap();
        env.single_target_dep_set(root).unwrap();

        for module in ["proj", "proj.libfoo", "proj.hello"] {
            let id = env.find_target(module).unwrap();
            assert_eq!(env.target(id).module, module);
        }
    }

    #[test]
    fn missing_local_dependency_fails_resolution() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(
            dir.path(),
            &[("re.yml", "type: executable\nname: app\ndeps: [nosuch]\n")],
        );

        let mut env = quiet_env();
        let root = env.load_root_target(dir.path()).unwrap();
        let err = env.single_target_dep_set(root).unwrap_err();
        assert!(matches!(err, Error::Dependency { .. }));

        // The tolerant collector simply skips it.
        let mut env = quiet_env();
        let root = env.load_root_target(dir.path()).unwrap();
        let set = env.single_target_local_dep_set(root).unwrap();
        assert_eq!(set, vec![root]);
    }

    #[test]
    fn unknown_namespace_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(
            dir.path(),
            &[("re.yml", "type: executable\nname: app\ndeps: ['nope:thing']\n")],
        );

        let mut env = quiet_env();
        let root = env.load_root_target(dir.path()).unwrap();
        let err = env.single_target_dep_set(root).unwrap_err();
        assert!(err.to_string().contains("unknown target namespace 'nope'"));
    }

    #[test]
    fn parent_refs_walk_up_the_module_tree() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(
            dir.path(),
            &[
                ("re.yml", "type: project\nname: proj\n"),
                ("sub/re.yml", "type: project\n"),
                ("sub/exe/re.yml", "type: executable\n"),
            ],
        );

        let mut env = quiet_env();
        env.load_root_target(dir.path()).unwrap();
        let exe = env.find_target("proj.sub.exe").unwrap();

        assert_eq!(env.resolve_parent_ref(".libhello", exe), "proj.sub.libhello");
        assert_eq!(env.resolve_parent_ref("..libhello", exe), "proj.libhello");
        assert_eq!(env.resolve_parent_ref("plain", exe), "plain");
    }

    #[test]
    fn subtarget_filters_navigate_children() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(
            dir.path(),
            &[
                ("re.yml", "type: project\nname: proj\n"),
                ("tools/re.yml", "type: project\n"),
                ("tools/gen/re.yml", "type: executable\n"),
            ],
        );

        let mut env = quiet_env();
        let root = env.load_root_target(dir.path()).unwrap();

        let dep = parse_dependency("proj [tools.gen]", None).unwrap();
        let resolved = env.resolve_dependency(root, &dep, true).unwrap();
        assert_eq!(resolved, vec![env.find_target("proj.tools.gen").unwrap()]);

        let bad = parse_dependency("proj [tools.missing]", None).unwrap();
        let err = env.resolve_dependency(root, &bad, true).unwrap_err();
        assert!(err.to_string().contains("failed at part 'missing'"));
    }

    #[test]
    fn uses_mapping_refinement_intersects_filters() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(
            dir.path(),
            &[
                ("re.yml", "type: project\nname: base\n"),
                ("liba/re.yml", "type: static-library\n"),
                ("libb/re.yml", "type: static-library\n"),
            ],
        );

        let mut env = quiet_env();
        env.load_root_target(dir.path()).unwrap();
        let liba = env.find_target("base.liba").unwrap();

        let app_dir = tempfile::tempdir().unwrap();
        write_tree(app_dir.path(), &[("re.yml", "type: executable\nname: app\n")]);
        let app = env.load_root_target(app_dir.path()).unwrap();
        env.target_mut(app).used_mapping.push((
            "core".to_string(),
            crate::target::parse_dependency("base [liba, libb]", None).unwrap(),
        ));

        let dep = crate::target::parse_dependency("uses:core [liba]", None).unwrap();
        let resolved = env.resolve_dependency(app, &dep, true).unwrap();
        assert_eq!(resolved, vec![liba]);

        let bad = crate::target::parse_dependency("uses:core [libz]", None).unwrap();
        let err = env.resolve_dependency(app, &bad, true).unwrap_err();
        assert!(err.to_string().contains("not part of the original filters"));

        let missing = crate::target::parse_dependency("uses:nope", None).unwrap();
        let err = env.resolve_dependency(app, &missing, true).unwrap_err();
        assert!(err.to_string().contains("uses-dependency"));
    }

    #[test]
    fn extra_config_produces_distinct_variants_per_dependent() {
        let lib_dir = tempfile::tempdir().unwrap();
        write_tree(
            lib_dir.path(),
            &[("re.yml", "type: static-library\nname: bar\n")],
        );

        let mut env = quiet_env();
        env.load_root_target(lib_dir.path()).unwrap();
        let base = env.find_target("bar").unwrap();

        let a_dir = tempfile::tempdir().unwrap();
        write_tree(a_dir.path(), &[("re.yml", "type: executable\nname: a\n")]);
        let a = env.load_root_target(a_dir.path()).unwrap();

        let b_dir = tempfile::tempdir().unwrap();
        write_tree(b_dir.path(), &[("re.yml", "type: executable\nname: b\n")]);
        let b = env.load_root_target(b_dir.path()).unwrap();

        let node_a = yaml("{bar: {cxx-standard: '20'}}");
        let node_b = yaml("{bar: {cxx-standard: '23'}}");
        let dep_a = parse_dependency_node(&node_a, Some("a")).unwrap();
        let dep_b = parse_dependency_node(&node_b, Some("b")).unwrap();

        let ra = env.resolve_dependency(a, &dep_a, true).unwrap();
        let rb = env.resolve_dependency(b, &dep_b, true).unwrap();

        assert_eq!(ra.len(), 1);
        assert_eq!(rb.len(), 1);
        assert_ne!(ra[0], base);
        assert_ne!(rb[0], base);
        assert_ne!(env.target(ra[0]).module, env.target(rb[0]).module);
        assert!(env.target(ra[0]).module.starts_with("ecfg-local.bar."));

        // The edge's config overrides land in the variant's raw config.
        assert_eq!(
            config::entry_str(&env.target(ra[0]).config, "cxx-standard").as_deref(),
            Some("20")
        );

        // Memoized per owner hash.
        let ra2 = env.resolve_dependency(a, &dep_a, true).unwrap();
        assert_eq!(ra, ra2);
    }

    #[test]
    fn arch_mismatch_without_a_coercer_is_fatal() {
        let lib_dir = tempfile::tempdir().unwrap();
        write_tree(
            lib_dir.path(),
            &[("re.yml", "type: static-library\nname: lib\n")],
        );
        let app_dir = tempfile::tempdir().unwrap();
        write_tree(app_dir.path(), &[("re.yml", "type: executable\nname: app\n")]);

        let mut env = quiet_env();
        env.load_root_target(lib_dir.path()).unwrap();
        let lib = env.find_target("lib").unwrap();
        let app = env.load_root_target(app_dir.path()).unwrap();

        env.ensure_target_scopes(lib);
        env.ensure_target_scopes(app);
        env.target(app).build_scope.as_ref().unwrap().set("arch", "arm64");

        let dep = crate::target::parse_dependency("lib", None).unwrap();
        let err = env.resolve_dependency(app, &dep, true).unwrap_err();
        assert!(err.to_string().contains("architecture mismatch"));
    }

    #[test]
    fn arch_mismatch_with_a_coercer_creates_a_distinct_target() {
        let lib_dir = tempfile::tempdir().unwrap();
        write_tree(
            lib_dir.path(),
            &[("re.yml", "type: static-library\nname: lib\n")],
        );
        let app_dir = tempfile::tempdir().unwrap();
        write_tree(app_dir.path(), &[("re.yml", "type: executable\nname: app\n")]);

        let mut env = quiet_env();
        env.load_root_target(lib_dir.path()).unwrap();
        let lib = env.find_target("lib").unwrap();
        let app = env.load_root_target(app_dir.path()).unwrap();

        env.ensure_target_scopes(lib);
        env.ensure_target_scopes(app);
        env.target(app).build_scope.as_ref().unwrap().set("arch", "arm64");

        env.add_dep_resolver(
            "arch-coerced",
            Rc::new(crate::deps::ArchCoercedDepResolver::new()),
        );

        let dep = crate::target::parse_dependency("lib", None).unwrap();
        let resolved = env.resolve_dependency(app, &dep, true).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_ne!(resolved[0], lib);
        assert_eq!(env.target(resolved[0]).module, "arch-coerced.arm64.lib");

        // Memoized by (module, arch): a second dependent on the same arch
        // reuses the coerced target.
        let again = env.resolve_dependency(app, &dep, true).unwrap();
        assert_eq!(resolved, again);
    }

    #[test]
    fn conditional_deps_are_appended_with_dedup() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(
            dir.path(),
            &[("re.yml", "type: executable\nname: app\ndeps: [one]\n")],
        );

        let mut env = quiet_env();
        let app = env.load_root_target(dir.path()).unwrap();

        env.target_mut(app).resolved_config = Some(yaml(
            "{type: executable, deps: [one], cond-deps: [one, two], enabled: true}",
        ));
        env.load_conditional_dependencies(app).unwrap();

        let raws: Vec<_> = env
            .target(app)
            .dependencies
            .iter()
            .map(|d| d.raw.clone())
            .collect();
        assert_eq!(raws, vec!["one", "two"]);
    }

    #[test]
    fn disabled_targets_are_skipped_by_collection() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path(), &[("re.yml", "type: executable\nname: app\n")]);

        let mut env = quiet_env();
        let app = env.load_root_target(dir.path()).unwrap();
        env.target_mut(app).resolved_config =
            Some(yaml("{type: executable, enabled: false}"));

        let set = env.single_target_dep_set(app).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn middlewares_intercept_target_loading() {
        struct ForeignMiddleware;

        impl TargetLoadMiddleware for ForeignMiddleware {
            fn supports_load_path(&self, path: &Path) -> bool {
                path.file_name().map(|n| n == "foreign").unwrap_or(false)
            }

            fn load_target(
                &self,
                env: &mut BuildEnv,
                path: &Path,
                _ancestor: Option<TargetId>,
                _dep_source: Option<&TargetDependency>,
            ) -> Result<TargetId> {
                let target = Target::from_data(
                    path,
                    "foreign-pkg",
                    TargetType::StaticLibrary,
                    serde_yaml::from_str("{type: static-library}").unwrap(),
                );
                Ok(env.add_free_target(target))
            }
        }

        let mut env = quiet_env();
        env.add_target_load_middleware(Rc::new(ForeignMiddleware));

        assert!(env.can_load_target_from(Path::new("/somewhere/foreign")));

        let id = env
            .load_free_target(Path::new("/somewhere/foreign"), None, None)
            .unwrap();
        assert_eq!(env.target(id).module, "foreign-pkg");
        assert_eq!(env.target(id).path, PathBuf::from("/somewhere/foreign"));
    }

    #[test]
    fn structured_tasks_run_once_per_stage() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path(), &[("re.yml", "type: executable\nname: app\n")]);

        let mut env = quiet_env();
        let app = env.load_root_target(dir.path()).unwrap();
        let marker = dir.path().join("ran.txt");

        env.target_mut(app).resolved_config = Some(yaml(&format!(
            "{{type: executable, enabled: true, tasks: {{prep: {{silent: true, pre-build: [{{shell-run: {{command: 'echo once >> {}'}}}}]}}}}}}",
            marker.display()
        )));

        env.run_structured_task(app, None, "prep", "pre-build").unwrap();
        env.run_structured_task(app, None, "prep", "pre-build").unwrap();

        let content = fs::read_to_string(&marker).unwrap();
        assert_eq!(content.matches("once").count(), 1);
    }

    #[test]
    fn actions_honor_phase_restrictions() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path(), &[("re.yml", "type: executable\nname: app\n")]);

        let mut env = quiet_env();
        let app = env.load_root_target(dir.path()).unwrap();
        let pre = dir.path().join("pre.txt");
        let post = dir.path().join("post.txt");

        env.target_mut(app).resolved_config = Some(yaml(&format!(
            "{{type: executable, enabled: true, actions: [{{shell-run: {{command: 'touch {}', on: pre-build}}}}, {{shell-run: {{command: 'touch {}', on: post-build}}}}]}}",
            pre.display(),
            post.display()
        )));

        env.run_actions_categorized(app, None, "pre-build").unwrap();
        assert!(pre.exists());
        assert!(!post.exists());

        env.run_actions_categorized(app, None, "post-build").unwrap();
        assert!(post.exists());
    }

    #[test]
    fn build_info_rendering_shows_resolved_edges() {
        let dir = project_tree();
        let mut env = quiet_env();
        let root = env.load_root_target(dir.path()).unwrap();
        env.single_target_dep_set(root).unwrap();

        let info = env.render_build_info();
        assert!(info.contains("proj (project)"));
        assert!(info.contains("proj.libfoo (static-library)"));
        assert!(info.contains(".libfoo => [proj.libfoo]"));
    }

    #[test]
    fn build_scope_lookup_reaches_config_and_global_defaults() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(
            dir.path(),
            &[("re.yml", "type: executable\nname: app\narch: riscv\n")],
        );

        let mut env = quiet_env();
        let app = env.load_root_target(dir.path()).unwrap();
        env.ensure_target_scopes(app);

        let views = env.scope_views(app);
        // Config beats the global default, globals fill the rest.
        assert_eq!(views.resolve_local("arch").unwrap(), "riscv");
        assert_eq!(views.resolve_local("configuration").unwrap(), "debug");
        assert_eq!(
            views.resolve("${arch}-${platform}-${configuration}").unwrap(),
            format!("riscv-{}-debug", views.resolve_local("platform").unwrap())
        );
    }
}
