// src/langs/cxx.rs

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;

use serde_yaml::Value;

use crate::buildenv::BuildEnv;
use crate::config::{self, ConfigMappings};
use crate::desc::{BuildEntry, BuildEntryType, BuildRule, BuildTool, NinjaBuildDesc};
use crate::error::{Error, Result};
use crate::langs::LangProvider;
use crate::target::{TargetId, TargetType, escape_module_path};

/// Replaces `{name}` placeholders in a toolchain command template.
fn format_template(template: &str, args: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in args {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

/// The C and C++ language provider.
///
/// Toolchain behavior is data-driven: a build environment YAML (found under
/// the provider's search path as `<name>.yml`, with `inherits` chaining)
/// supplies tool paths, command-line templates, platform definitions and
/// build-option tables.
pub struct CxxLangProvider {
    env_search_path: PathBuf,
    env_cache: RefCell<BTreeMap<String, Value>>,
}

impl CxxLangProvider {
    pub fn new(env_search_path: PathBuf) -> Self {
        Self {
            env_search_path,
            env_cache: RefCell::new(BTreeMap::new()),
        }
    }

    fn load_env_or_throw(&self, name: &str, module: &str) -> Result<Value> {
        if let Some(cached) = self.env_cache.borrow().get(name) {
            return Ok(cached.clone());
        }

        let path = self.env_search_path.join(format!("{name}.yml"));
        let text = fs::read_to_string(&path).map_err(|e| {
            Error::build(
                Some(module.to_string()),
                format!("failed to load C++ environment '{name}': {e}"),
            )
        })?;
        let mut data: Value = serde_yaml::from_str(&text).map_err(|e| {
            Error::build(
                Some(module.to_string()),
                format!("failed to load C++ environment '{name}': {e}"),
            )
        })?;

        if let Some(Value::Sequence(inherits)) = data.get("inherits").cloned() {
            for parent in inherits {
                let Some(parent_name) = parent.as_str() else {
                    continue;
                };
                let other = self.load_env_or_throw(parent_name, module)?;
                if let (Some(data_map), Some(other_map)) =
                    (data.as_mapping_mut(), other.as_mapping())
                {
                    for (key, value) in other_map {
                        if !data_map.contains_key(key) {
                            data_map.insert(key.clone(), value.clone());
                        }
                    }
                }
            }
        }

        self.env_cache
            .borrow_mut()
            .insert(name.to_string(), data.clone());
        Ok(data)
    }

    fn base_mappings(env: &BuildEnv, target: TargetId) -> Result<ConfigMappings> {
        let ty = env.target(target).ty.as_str().to_string();
        let views = env.scope_views(target);

        let mut mappings = ConfigMappings::new();
        mappings.insert("target-type".into(), ty);
        mappings.insert("platform".into(), views.resolve_local("platform")?);
        mappings.insert("host-platform".into(), views.resolve_local("host-platform")?);
        mappings.insert("config".into(), views.resolve_local("configuration")?);
        mappings.insert("load-context".into(), views.resolve_local("load-context")?);
        mappings.insert("runtime".into(), views.resolve_local("runtime")?);
        Ok(mappings)
    }

    fn toolchain_for(&self, desc: &NinjaBuildDesc, escaped: &str, module: &str) -> Result<Value> {
        let env_name = desc
            .state
            .get(&format!("re_cxx_env_for_{escaped}"))
            .cloned()
            .ok_or_else(|| {
                Error::build(
                    Some(module.to_string()),
                    "link environment was not initialized".to_string(),
                )
            })?;
        self.load_env_or_throw(&env_name, module)
    }

    /// Collects compiler/linker flag lists from a `cxx-build-flags`-shaped
    /// map.
    fn append_build_flags(
        env: &BuildEnv,
        target: TargetId,
        flags_node: &Value,
        extra_flags: &mut Vec<String>,
        extra_link_flags: &mut Vec<String>,
    ) -> Result<()> {
        let views = env.scope_views(target);
        let is_static = env.target(target).ty == TargetType::StaticLibrary;

        let mut append = |node: Option<&Value>, out: &mut Vec<String>| -> Result<()> {
            match node {
                Some(Value::Sequence(seq)) => {
                    for flag in seq {
                        if let Some(f) = config::scalar_string(flag) {
                            out.push(views.resolve(&f)?);
                        }
                    }
                }
                Some(other) => {
                    if let Some(f) = config::scalar_string(other) {
                        out.push(views.resolve(&f)?);
                    }
                }
                None => {}
            }
            Ok(())
        };

        append(flags_node.get("compiler"), extra_flags)?;
        append(flags_node.get("linker"), extra_link_flags)?;
        if !is_static {
            append(flags_node.get("linker.nostatic"), extra_link_flags)?;
        }
        Ok(())
    }

    /// Expands `cxx-build-options` entries against the toolchain's
    /// `build-options` table into concrete build flags.
    fn expand_build_options(
        env: &BuildEnv,
        target: TargetId,
        options: &Value,
        table: Option<&Value>,
        out_flags: &mut Value,
    ) -> Result<()> {
        let module = env.target(target).module.clone();
        let Some(options) = options.as_mapping() else {
            return Ok(());
        };

        for (key, value) in options {
            if value.is_null() {
                continue;
            }
            let Some(option_name) = key.as_str() else {
                continue;
            };
            let Some(value_str) = config::scalar_string(value) else {
                continue;
            };

            let def = table.and_then(|t| t.get(option_name)).ok_or_else(|| {
                Error::config(
                    Some(module.clone()),
                    format!("unknown build option '{option_name}'"),
                )
            })?;

            if !def.is_mapping() {
                continue;
            }

            if let Some(selected) = def.get(value_str.as_str()) {
                config::merge_node(out_flags, selected, false);
            } else if let Some(templated) = def.get("$value") {
                let mut cloned = templated.clone();
                if let Some(map) = cloned.as_mapping_mut() {
                    for (_, entry) in map.iter_mut() {
                        match entry {
                            Value::Sequence(seq) => {
                                for v in seq.iter_mut() {
                                    if let Some(s) = config::scalar_string(v) {
                                        *v = Value::String(format_template(
                                            &s,
                                            &[("value", &value_str)],
                                        ));
                                    }
                                }
                            }
                            other => {
                                if let Some(s) = config::scalar_string(other) {
                                    *other = Value::String(format_template(
                                        &s,
                                        &[("value", &value_str)],
                                    ));
                                }
                            }
                        }
                    }
                }
                config::merge_node(out_flags, &cloned, false);
            } else if let Some(default) = def.get("default") {
                config::merge_node(out_flags, default, false);
            } else {
                return Err(Error::config(
                    Some(module),
                    format!("unknown build option value '{option_name}' = {value_str}"),
                ));
            }
        }

        Ok(())
    }
}

impl LangProvider for CxxLangProvider {
    fn lang_id(&self) -> &'static str {
        "cpp"
    }

    fn init_in_build_desc(&self, _desc: &mut NinjaBuildDesc) {}

    fn init_link_target_env(
        &self,
        env: &mut BuildEnv,
        desc: &mut NinjaBuildDesc,
        target: TargetId,
    ) -> Result<()> {
        let module = env.target(target).module.clone();
        let escaped = escape_module_path(&module);
        let target_path = env.target(target).path.clone();

        env.ensure_target_scopes(target);

        // First resolution pass: everything except the toolchain-derived
        // categories, which require the environment to be known.
        let mut mappings = Self::base_mappings(env, target)?;
        let resolved = env.compute_resolved_config(target, &mappings)?;
        env.target_mut(target).resolved_config = Some(resolved);

        let env_cfg = env.target(target)
            .resolved_config
            .as_ref()
            .and_then(|c| config::entry_str(c, "cxx-env"))
            .ok_or_else(|| {
                Error::build(
                    Some(module.clone()),
                    "C++ environment type not specified anywhere in the target tree".to_string(),
                )
            })?;

        let env_name = env.scope_views(target).resolve(&env_cfg)?;
        desc.state
            .insert(format!("re_cxx_env_for_{escaped}"), env_name.clone());

        let toolchain = self.load_env_or_throw(&env_name, &module)?;

        let build_scope = env.target(target)
            .build_scope
            .clone()
            .ok_or_else(|| Error::build(Some(module.clone()), "missing build scope".to_string()))?;

        if let Some(vars) = toolchain.get("vars").and_then(Value::as_mapping) {
            for (key, value) in vars {
                if let (Some(k), Some(v)) = (key.as_str(), config::scalar_string(value)) {
                    build_scope.set(k, v);
                }
            }
        }

        if let Some(defaults) = toolchain.get("default-flags").and_then(Value::as_mapping) {
            for (key, value) in defaults {
                if let (Some(k), Some(v)) = (key.as_str(), config::scalar_string(value)) {
                    let resolved = env.scope_views(target).resolve(&v)?;
                    build_scope.set(format!("platform-default-flags-{k}"), resolved);
                }
            }
        }

        // Second pass with the architecture and toolchain categories known.
        mappings.insert("arch".into(), env.scope_views(target).resolve_local("arch")?);
        mappings.insert("cxx-env".into(), env_name.clone());
        mappings.insert("cxxenv".into(), env_name.clone());

        let resolved = env.compute_resolved_config(target, &mappings)?;
        env.target_mut(target).resolved_config = Some(resolved);
        env.load_conditional_dependencies(target)?;

        build_scope.set("src-dir", target_path.to_string_lossy().to_string());

        if let Some(root) = desc.root_target {
            let root_path = env.target(root).path.to_string_lossy().to_string();
            if env.scope_views(target).get("root-dir").is_none() {
                build_scope.set("root-dir", root_path.clone());
            }
            let target_root = env.scope_views(target).resolve_local("root-dir")?;
            build_scope.set("target-root", target_root);
            build_scope.set("build-root", root_path);
        }

        // Config includes pulled in through `with:` merge into the raw config
        // and force another resolution pass.
        let withs = env.target(target)
            .resolved_config
            .as_ref()
            .and_then(|c| c.get("with").cloned());
        if let Some(Value::Sequence(withs)) = withs {
            for with in withs {
                let Some(raw) = config::scalar_string(&with) else {
                    continue;
                };
                let resolved_path = env.scope_views(target).resolve(&raw)?;
                let mut include_path = PathBuf::from(resolved_path);
                if !include_path.is_absolute() {
                    include_path = target_path.join(include_path);
                }

                let text = fs::read_to_string(&include_path).map_err(|e| {
                    Error::load(
                        Some(module.clone()),
                        format!("cannot read config include '{}': {e}", include_path.display()),
                    )
                })?;
                let include_cfg: Value = serde_yaml::from_str(&text)?;

                config::merge_node(&mut env.target_mut(target).config, &include_cfg, false);
                let resolved = env.compute_resolved_config(target, &mappings)?;
                env.target_mut(target).resolved_config = Some(resolved);
            }
        }

        // Artifact naming.
        let artifact_raw = env.target(target)
            .cfg_entry("artifact-name")
            .and_then(config::scalar_string)
            .unwrap_or_else(|| module.clone());
        let mut filename = env.scope_views(target).resolve(&artifact_raw)?;

        let out_ext = env.target(target)
            .resolved_config
            .as_ref()
            .and_then(|c| config::entry_str(c, "out-ext"))
            .unwrap_or_default();
        if !out_ext.is_empty() {
            filename.push('.');
            filename.push_str(&out_ext);
        }
        build_scope.set("build-artifact", filename);

        if let Some(resolved) = env.target_mut(target).resolved_config.as_mut() {
            if let Some(map) = resolved.as_mapping_mut() {
                map.insert(
                    "cxx-root-include-path".into(),
                    Value::String(target_path.to_string_lossy().to_string()),
                );
            }
        }

        // Meta record.
        let ty = env.target(target).ty.as_str().to_string();
        let path_str = target_path.to_string_lossy().to_string();
        {
            let meta = desc.target_meta(&path_str);
            meta["type"] = serde_json::json!(ty);
            meta["module"] = serde_json::json!(module);
            meta["links_with"] = serde_json::json!("cxx");
            meta["cxx"]["toolchain"] = serde_json::json!(env_name);
            for (k, v) in &mappings {
                meta["cxx"][k] = serde_json::json!(v);
            }
        }

        // Forward the toolchain's tool definitions to the build script.
        if let Some(tools) = toolchain.get("tools").and_then(Value::as_mapping) {
            for (key, value) in tools {
                let (Some(name), Some(raw)) = (key.as_str(), config::scalar_string(value)) else {
                    continue;
                };
                let tool_path = env.scope_views(target).resolve(&raw)?;

                desc.tools.push(BuildTool {
                    name: format!("cxx_{name}_{escaped}"),
                    path: tool_path.clone(),
                });
                desc.target_meta(&path_str)["tools"][name] = serde_json::json!(tool_path);
                build_scope.set(format!("cxx.tool.{name}"), tool_path);
            }
        }

        Ok(())
    }

    fn init_build_target_rules(
        &self,
        env: &mut BuildEnv,
        desc: &mut NinjaBuildDesc,
        target: TargetId,
    ) -> Result<bool> {
        let module = env.target(target).module.clone();
        let escaped = escape_module_path(&module);

        let toolchain = self.toolchain_for(desc, &escaped, &module)?;

        let cfg = env.target(target)
            .resolved_config
            .clone()
            .ok_or_else(|| Error::build(Some(module.clone()), "config not resolved".to_string()))?;

        if !env.target(target).enabled() {
            return Ok(false);
        }

        let templates = toolchain.get("templates").cloned().unwrap_or(Value::Null);
        let template = |name: &str| -> String {
            templates
                .get(name)
                .and_then(config::scalar_string)
                .unwrap_or_default()
        };

        // Definitions: local ones supersede platform ones; public ones from
        // the dependency set fill remaining gaps.
        let mut definitions: BTreeMap<String, String> = BTreeMap::new();
        let mut definitions_pub: BTreeMap<String, String> = BTreeMap::new();

        // A definition without a scalar value is emitted value-less.
        let collect = |node: Option<&Value>, into: &mut BTreeMap<String, String>| {
            if let Some(map) = node.and_then(Value::as_mapping) {
                for (k, v) in map {
                    if let Some(key) = k.as_str() {
                        into.insert(
                            key.to_string(),
                            config::scalar_string(v).unwrap_or_default(),
                        );
                    }
                }
            }
        };

        collect(cfg.get("cxx-compile-definitions"), &mut definitions);
        collect(cfg.get("cxx-compile-definitions-public"), &mut definitions_pub);

        if let Some(map) = toolchain.get("platform-definitions").and_then(Value::as_mapping) {
            for (k, v) in map {
                if let (Some(key), Some(value)) = (k.as_str(), config::scalar_string(v)) {
                    definitions.entry(key.to_string()).or_insert(value);
                }
            }
        }

        let mut include_deps = Vec::new();
        env.dependency_set_no_resolve(target, &mut include_deps)?;

        let cxx_include_dir = template("cxx-include-dir");
        let cxx_lib_dir = template("cxx-lib-dir");

        let mut extra_flags: Vec<String> = Vec::new();
        let mut extra_link_flags: Vec<String> = Vec::new();
        let mut deps_list: Vec<String> = Vec::new();
        let mut global_link_deps: Vec<String> = Vec::new();
        let mut include_dirs: BTreeSet<String> = BTreeSet::new();

        for dep_id in &include_deps {
            let dep_id = *dep_id;
            let Some(dep_cfg) = env.target(dep_id).resolved_config.clone() else {
                continue;
            };

            collect(
                dep_cfg.get("cxx-compile-definitions-public"),
                &mut definitions_pub,
            );

            // Include directories: the dependency's own root plus any extras.
            if env.target(dep_id).ty != TargetType::Project
                && dep_cfg.get("no-auto-include-dirs").is_none()
            {
                if let Some(root) = config::entry_str(&dep_cfg, "cxx-root-include-path") {
                    include_dirs.insert(root);
                }
            }
            if let Some(Value::Sequence(extra)) = dep_cfg.get("cxx-include-dirs") {
                for v in extra {
                    let Some(raw) = config::scalar_string(v) else {
                        continue;
                    };
                    let resolved = env.scope_views(dep_id).resolve(&raw)?;
                    let mut dir = PathBuf::from(resolved);
                    if !dir.is_absolute() {
                        dir = env.target(dep_id).path.join(dir);
                    }
                    include_dirs.insert(dir.to_string_lossy().to_string());
                }
            }

            // Link inputs.
            let dep_escaped = escape_module_path(&env.target(dep_id).module);
            let has_objects = desc
                .state
                .get(&format!("re_cxx_target_has_objects_{dep_escaped}"))
                .map(String::as_str)
                == Some("1");
            if env.target(dep_id).ty == TargetType::StaticLibrary && has_objects {
                deps_list.push(format!("\"$cxx_artifact_{dep_escaped}\""));
            }

            if let Some(Value::Sequence(dirs)) = dep_cfg.get("cxx-lib-dirs") {
                for dir in dirs {
                    if let Some(raw) = config::scalar_string(dir) {
                        let resolved = env.scope_views(dep_id).resolve(&raw)?;
                        extra_link_flags
                            .push(format_template(&cxx_lib_dir, &[("directory", &resolved)]));
                    }
                }
            }
            if let Some(Value::Sequence(deps)) = dep_cfg.get("cxx-link-deps") {
                for dep in deps {
                    if let Some(raw) = config::scalar_string(dep) {
                        let resolved = env.scope_views(dep_id).resolve(&raw)?;
                        deps_list.push(format!("\"{resolved}\""));
                    }
                }
            }
            if let Some(Value::Sequence(deps)) = dep_cfg.get("cxx-global-link-deps") {
                for dep in deps {
                    if let Some(raw) = config::scalar_string(dep) {
                        let resolved = env.scope_views(target).resolve(&raw)?;
                        global_link_deps.push(format!("-l{resolved}"));
                    }
                }
            }
        }

        // Free-form build flags and symbolic build options.
        let mut extra_build_flags = Value::Mapping(Default::default());
        if let Some(flags) = cfg.get("cxx-build-flags") {
            config::merge_node(&mut extra_build_flags, flags, false);
        }
        if let Some(options) = cfg.get("cxx-build-options") {
            Self::expand_build_options(
                env,
                target,
                options,
                toolchain.get("build-options"),
                &mut extra_build_flags,
            )?;
        }
        Self::append_build_flags(
            env,
            target,
            &extra_build_flags,
            &mut extra_flags,
            &mut extra_link_flags,
        )?;

        for dir in &include_dirs {
            extra_flags.push(format_template(&cxx_include_dir, &[("directory", dir)]));
        }

        for (name, value) in &definitions_pub {
            definitions
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }

        let def_tpl = template("cxx-compile-definition");
        let def_tpl_no_value = template("cxx-compile-definition-no-value");
        let mut meta_definitions = Vec::new();
        for (name, value) in &definitions {
            let name = env.scope_views(target).resolve(name)?;
            let value = env.scope_views(target).resolve(value)?;
            if value.is_empty() {
                extra_flags.push(format_template(&def_tpl_no_value, &[("name", &name)]));
                meta_definitions.push(name);
            } else {
                extra_flags.push(format_template(
                    &def_tpl,
                    &[("name", &name), ("value", &value)],
                ));
                meta_definitions.push(format!("{name}={value}"));
            }
        }

        let cpp_std = config::entry_str(&cfg, "cxx-standard").unwrap_or_else(|| "17".to_string());

        {
            let path_str = env.target(target).path.to_string_lossy().to_string();
            let meta = desc.target_meta(&path_str);
            meta["cxx"]["standard"] = serde_json::json!(format!("c++{cpp_std}"));
            meta["cxx"]["include_dirs"] =
                serde_json::json!(include_dirs.iter().collect::<Vec<_>>());
            meta["cxx"]["definitions"] = serde_json::json!(meta_definitions);
        }

        let mut flags_base = String::from("$target_custom_flags ");
        for flag in &extra_flags {
            flags_base.push_str(flag);
            flags_base.push(' ');
        }

        let extra_link_flags_str = extra_link_flags
            .iter()
            .map(|f| format!(" {f}"))
            .collect::<String>();
        let deps_input = deps_list
            .iter()
            .map(|d| format!("{d} "))
            .collect::<String>();
        let global_deps_input = global_link_deps
            .iter()
            .map(|d| format!("{d} "))
            .collect::<String>();

        let use_rspfiles = toolchain
            .get("use-rspfiles")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let apply_rspfile = |rule: &mut BuildRule| {
            if use_rspfiles {
                rule.vars
                    .insert("rspfile_content".into(), rule.cmdline.clone());
                rule.vars.insert("rspfile".into(), "$out.rsp".into());
                rule.cmdline = "@$out.rsp".into();
            }
        };

        let views = env.scope_views(target);

        let mut rule_cxx = BuildRule {
            name: format!("cxx_compile_{escaped}"),
            tool: format!("cxx_compiler_{escaped}"),
            cmdline: format_template(
                &views.resolve(&template("compiler-cmdline"))?,
                &[("flags", flags_base.as_str()), ("input", "$in"), ("output", "$out")],
            ),
            description: "Building C++ source $in".into(),
            vars: Default::default(),
        };
        apply_rspfile(&mut rule_cxx);

        if let Some(rule_vars) = toolchain.get("custom-rule-vars").and_then(Value::as_mapping) {
            for (k, v) in rule_vars {
                if let (Some(key), Some(value)) = (k.as_str(), config::scalar_string(v)) {
                    rule_cxx.vars.insert(key.to_string(), views.resolve(&value)?);
                }
            }
        }

        let link_flags_arg = format!("$target_custom_flags {extra_link_flags_str}");

        let mut rule_link = BuildRule {
            name: format!("cxx_link_{escaped}"),
            tool: format!("cxx_linker_{escaped}"),
            cmdline: format_template(
                &views.resolve(&template("linker-cmdline"))?,
                &[
                    ("flags", link_flags_arg.as_str()),
                    ("link_deps", deps_input.as_str()),
                    ("global_link_deps", global_deps_input.as_str()),
                    ("input", "$in"),
                    ("output", "$out"),
                ],
            ),
            description: "Linking target $out".into(),
            vars: Default::default(),
        };
        apply_rspfile(&mut rule_link);

        let mut rule_lib = BuildRule {
            name: format!("cxx_archive_{escaped}"),
            tool: format!("cxx_archiver_{escaped}"),
            cmdline: format_template(
                &views.resolve(&template("archiver-cmdline"))?,
                &[
                    ("flags", link_flags_arg.as_str()),
                    ("link_deps", deps_input.as_str()),
                    ("global_link_deps", global_deps_input.as_str()),
                    ("input", "$in"),
                    ("output", "$out"),
                ],
            ),
            description: "Archiving target $out".into(),
            vars: Default::default(),
        };
        apply_rspfile(&mut rule_lib);
        drop(views);

        desc.rules.push(rule_cxx);
        desc.rules.push(rule_link);
        desc.rules.push(rule_lib);

        desc.vars.insert(
            format!("cxx_path_{escaped}"),
            env.target(target).path.to_string_lossy().to_string(),
        );
        desc.vars.insert(
            format!("cxx_config_path_{escaped}"),
            env.target(target).config_path.to_string_lossy().to_string(),
        );

        Ok(true)
    }

    fn process_source_file(
        &self,
        env: &mut BuildEnv,
        desc: &mut NinjaBuildDesc,
        target: TargetId,
        source_index: usize,
    ) -> Result<()> {
        if env.target(target).ty == TargetType::Project {
            return Ok(());
        }

        let module = env.target(target).module.clone();
        let escaped = escape_module_path(&module);
        let toolchain = self.toolchain_for(desc, &escaped, &module)?;

        let file = env.target(target).sources[source_index].clone();

        let mut eligible = false;
        for key in ["supported-extensions", "cxx-supported-extensions"] {
            if let Some(Value::Sequence(exts)) = toolchain.get(key) {
                eligible |= exts.iter().any(|e| e.as_str() == Some(file.extension.as_str()));
            }
        }
        if !eligible {
            return Ok(());
        }

        {
            let path_str = env.target(target).path.to_string_lossy().to_string();
            let meta = desc.target_meta(&path_str);
            let sources = &mut meta["cxx"]["sources"];
            if sources.is_null() {
                *sources = serde_json::json!([]);
            }
            if let Some(list) = sources.as_array_mut() {
                list.push(serde_json::json!(file.path.to_string_lossy()));
            }
        }

        // Headers are collected but never compiled.
        if file.extension.starts_with('h') {
            return Ok(());
        }

        let local_path = file
            .path
            .strip_prefix(&env.target(target).path)
            .unwrap_or(&file.path)
            .to_string_lossy()
            .replace('\\', "/");

        let object_ext = toolchain
            .get("default-extensions")
            .and_then(|e| e.get("object"))
            .and_then(config::scalar_string)
            .unwrap_or_else(|| "o".to_string());

        let mut entry = BuildEntry::new(BuildEntryType::Object);
        entry.source_target = Some(target);
        entry.source_index = Some(source_index);
        entry.input = format!("$cxx_path_{escaped}/{local_path}");
        entry.output =
            format!("$builddir/$re_target_object_directory_{escaped}/{local_path}.{object_ext}");
        entry.rule = format!("cxx_compile_{escaped}");

        let cfg = env.target(target).resolved_config.clone().unwrap_or(Value::Null);
        let mut custom_flags = String::new();
        if file.extension == "c" {
            let c_std = config::entry_str(&cfg, "c-standard").unwrap_or_else(|| "11".to_string());
            custom_flags.push_str(
                &toolchain
                    .get("templates")
                    .and_then(|t| t.get("compile-as-c"))
                    .and_then(config::scalar_string)
                    .unwrap_or_default(),
            );
            custom_flags.push(' ');
            custom_flags.push_str(&format_template(
                &toolchain
                    .get("templates")
                    .and_then(|t| t.get("c-standard"))
                    .and_then(config::scalar_string)
                    .unwrap_or_default(),
                &[("version", &c_std)],
            ));
        } else {
            let cpp_std = config::entry_str(&cfg, "cxx-standard").unwrap_or_else(|| "17".to_string());
            custom_flags.push_str(&format_template(
                &toolchain
                    .get("templates")
                    .and_then(|t| t.get("cxx-standard"))
                    .and_then(config::scalar_string)
                    .unwrap_or_default(),
                &[("version", &cpp_std)],
            ));
        }
        entry
            .vars
            .insert("target_custom_flags".into(), custom_flags.trim().to_string());

        desc.entries.push(entry);
        desc.state
            .insert(format!("re_cxx_target_has_objects_{escaped}"), "1".into());

        Ok(())
    }

    fn create_target_artifact(
        &self,
        env: &mut BuildEnv,
        desc: &mut NinjaBuildDesc,
        target: TargetId,
    ) -> Result<()> {
        let module = env.target(target).module.clone();
        let escaped = escape_module_path(&module);

        let has_objects = desc
            .state
            .get(&format!("re_cxx_target_has_objects_{escaped}"))
            .map(String::as_str)
            == Some("1");
        if !has_objects {
            return Ok(());
        }

        let toolchain = self.toolchain_for(desc, &escaped, &module)?;
        let build_artifact = env.scope_views(target).resolve_local("build-artifact")?;

        let mut link = BuildEntry::new(BuildEntryType::Artifact);
        link.source_target = Some(target);
        link.output = format!(
            "$builddir/$re_target_artifact_directory_{escaped}/{build_artifact}"
        );
        link.rule = format!("cxx_link_{escaped}");

        match env.target(target).ty {
            TargetType::StaticLibrary => link.rule = format!("cxx_archive_{escaped}"),
            TargetType::SharedLibrary => {
                let shared_flags = toolchain
                    .get("templates")
                    .and_then(|t| t.get("link-as-shared-library"))
                    .and_then(config::scalar_string)
                    .unwrap_or_default();
                link.vars
                    .insert("target_custom_flags".into(), shared_flags);
            }
            TargetType::Project => link.rule = "phony".into(),
            _ => {}
        }

        let mut inputs = String::new();
        for entry in &desc.entries {
            if entry.source_target == Some(target) && entry.source_index.is_some() {
                inputs.push_str(&entry.output);
                inputs.push(' ');
            }
        }
        link.input = inputs.trim_end().to_string();

        let mut link_deps = Vec::new();
        env.dependency_set_no_resolve(target, &mut link_deps)?;
        for dep in link_deps {
            if dep == target {
                continue;
            }
            let dep_escaped = escape_module_path(&env.target(dep).module);
            if let Some(artifact) = desc.vars.get(&format!("cxx_artifact_{dep_escaped}")) {
                if !artifact.is_empty() {
                    link.deps.push(artifact.clone());
                }
            }
        }
        link.deps.push(format!("$cxx_config_path_{escaped}"));

        let mut alias = BuildEntry::new(BuildEntryType::Alias);
        alias.input = link.output.clone();
        alias.output = module.clone();
        alias.rule = "phony".into();

        desc.vars
            .insert(format!("cxx_artifact_{escaped}"), link.output.clone());
        desc.artifacts
            .insert(target, PathBuf::from("${artifact-dir}/${build-artifact}"));

        desc.entries.push(link);
        desc.entries.push(alias);

        Ok(())
    }
}
