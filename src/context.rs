// src/context.rs

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use serde_yaml::Value;

use crate::buildenv::BuildEnv;
use crate::config;
use crate::constants::{
    CACHE_DIR_NAME, DEFAULT_ARTIFACT_DIR, DEFAULT_OBJECT_DIR, DEFAULT_OUT_DIR,
    DEFAULT_OUT_DIR_TRIPLET, IGNORE_MARKER_FILENAME, USER_PARAMS_FILENAME, VERSION_CACHE_FILENAME,
};
use crate::deps::{
    ArchCoercedDepResolver, FsDepResolver, GitDepResolver, GithubDepResolver, GlobalDepResolver,
};
use crate::desc::NinjaBuildDesc;
use crate::error::{Error, Result};
use crate::langs::{CxxLangProvider, LangProvider};
use crate::ninja;
use crate::output::Output;
use crate::system::process::{self, RunOptions};
use crate::target::{TargetId, dir_contains_target, escape_module_path};
use crate::vars::{EnvVarNamespace, VarContext};
use crate::version_cache::DepsVersionCache;

/// The default driver around a [`BuildEnv`]: wires the standard providers and
/// resolvers, loads targets, generates build descriptions and drives the
/// external build executor.
pub struct BuildContext {
    env: BuildEnv,
    data_path: PathBuf,
}

impl BuildContext {
    pub fn new(out: Output, data_path: Option<PathBuf>) -> Self {
        let data_path = data_path.unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("re")
        });

        Self {
            env: BuildEnv::new(out),
            data_path,
        }
    }

    pub fn env(&self) -> &BuildEnv {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut BuildEnv {
        &mut self.env
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Registers the standard language providers and dependency resolvers and
    /// loads the core project target when the data path provides one.
    pub fn load_default_environment(&mut self) -> Result<()> {
        let cxx = Rc::new(CxxLangProvider::new(
            self.data_path.join("environments").join("cxx"),
        ));
        self.env.add_lang_provider(cxx.lang_id(), cxx.clone());

        let git = Rc::new(GitDepResolver::new());
        let github = Rc::new(GithubDepResolver::new(git.clone()));

        self.env.add_dep_resolver("git", git);
        self.env.add_dep_resolver("github", github.clone());
        self.env.add_dep_resolver("github-ssh", github);
        self.env
            .add_dep_resolver("arch-coerced", Rc::new(ArchCoercedDepResolver::new()));
        self.env.add_dep_resolver("fs", Rc::new(FsDepResolver::new()));
        self.env.add_dep_resolver(
            "global",
            Rc::new(GlobalDepResolver::new(self.data_path.join("packages"))),
        );

        let core_path = self.data_path.join("core-project");
        if dir_contains_target(&core_path) {
            self.env.load_core_project_target(&core_path)?;
        }

        Ok(())
    }

    /// Sets a build variable override (from the command line or user params).
    pub fn set_var(&self, key: &str, value: &str) {
        self.env.global_scope().set(key, value);
    }

    fn resolve_global(&self, input: &str) -> Result<String> {
        let env_ns = EnvVarNamespace;
        let mut ctx = VarContext::new();
        ctx.add("re", self.env.global_scope());
        ctx.add("env", &env_ns);
        ctx.substitute(input, "re")
    }

    /// Loads `re.user.yml` cached context parameters, applying each entry to
    /// the global scope. Returns the raw document for later re-saving.
    pub fn load_cached_params(&mut self, path: &Path) -> Result<Value> {
        let file = path.join(USER_PARAMS_FILENAME);
        if !file.is_file() {
            return Ok(Value::Null);
        }

        let doc: Value = serde_yaml::from_str(&fs::read_to_string(&file)?)?;
        if let Some(map) = doc.as_mapping() {
            for (key, value) in map {
                let (Some(k), Some(v)) = (key.as_str(), config::scalar_string(value)) else {
                    continue;
                };
                let key = self.resolve_global(k)?;
                let value = self.resolve_global(&v)?;
                self.env.global_scope().set(key, value);
            }
        }

        Ok(doc)
    }

    /// Saves context parameters back to `re.user.yml`; load and save are an
    /// idempotent round trip.
    pub fn save_cached_params(&self, path: &Path, doc: &Value) -> Result<()> {
        fs::write(path.join(USER_PARAMS_FILENAME), serde_yaml::to_string(doc)?)?;
        Ok(())
    }

    fn version_cache_path(root_path: &Path) -> PathBuf {
        root_path.join(CACHE_DIR_NAME).join(VERSION_CACHE_FILENAME)
    }

    /// Loads the persistent dependency version cache for a root.
    pub fn load_version_cache(&mut self, root_path: &Path) -> Result<()> {
        let cache = DepsVersionCache::load(&Self::version_cache_path(root_path))?;
        self.env.set_version_cache(cache);
        Ok(())
    }

    /// Persists the version cache so later invocations pick the same tags.
    pub fn save_version_cache(&self, root_path: &Path) -> Result<()> {
        self.env
            .version_cache()
            .save(&Self::version_cache_path(root_path))
    }

    /// Loads a root target from a directory.
    pub fn load_target(&mut self, path: &Path) -> Result<TargetId> {
        if !self.env.can_load_target_from(path) {
            return Err(Error::load(
                None,
                format!("the directory '{}' does not contain a valid target", path.display()),
            ));
        }
        self.env.load_root_target(path)
    }

    /// Assembles the flat build description for a target:
    /// link environments for the local set, external resolution and
    /// pre-configure actions across the full set, then rules and artifacts,
    /// then the output-directory layout.
    pub fn generate_build_desc(&mut self, target: TargetId) -> Result<NinjaBuildDesc> {
        let mut desc = NinjaBuildDesc::new();
        desc.root_target = Some(target);

        self.env.populate_full_build_desc(&mut desc);

        for dep in self.env.single_target_local_dep_set(target)? {
            self.env.init_link_env_with_deps(&mut desc, dep)?;
        }

        let deps = self.env.single_target_dep_set(target)?;
        for dep in &deps {
            self.env.init_target_link_env(&mut desc, *dep)?;
            self.env
                .run_automatic_structured_tasks(*dep, None, "pre-configure")?;
            self.env.run_actions_categorized(*dep, None, "pre-configure")?;
        }

        // Resolution may have registered additional targets.
        let deps = self.env.single_target_dep_set(target)?;

        self.env.populate_build_desc_with_deps(&mut desc, target)?;

        let target_path = self.env.target(target).path.clone();

        if self.env.target(target).build_scope.is_none() {
            return Err(Error::config(
                Some(self.env.target(target).module.clone()),
                "reached top of hierarchy without finding a valid build var scope".to_string(),
            ));
        }

        let mut out_dir = target_path.join(DEFAULT_OUT_DIR);
        if let Some(entry) = self.env.target(target).cfg_entry("out-dir").cloned() {
            if let Some(raw) = config::scalar_string(&entry) {
                let resolved = self.env.scope_views(target).resolve(&raw)?;
                out_dir = PathBuf::from(resolved);
                if !out_dir.is_absolute() {
                    out_dir = target_path.join(out_dir);
                }
            }
        }

        let triplet_fmt = self
            .env
            .cfg_entry_recursive(target, "out-dir-triplet")
            .and_then(|v| config::scalar_string(&v))
            .unwrap_or_else(|| DEFAULT_OUT_DIR_TRIPLET.to_string());
        out_dir = out_dir.join(self.env.scope_views(target).resolve(&triplet_fmt)?);

        fs::create_dir_all(&out_dir)?;
        fs::write(out_dir.join(IGNORE_MARKER_FILENAME), "")?;

        desc.out_dir = out_dir.clone();

        for dep in &deps {
            let dep = *dep;
            if self.env.target(dep).build_scope.is_none() {
                continue;
            }

            let module = self.env.target(dep).module.clone();
            let escaped = escape_module_path(&module);

            let artifact_fmt = self
                .env
                .cfg_entry_recursive(dep, "out-artifact-dir")
                .and_then(|v| config::scalar_string(&v))
                .unwrap_or_else(|| DEFAULT_ARTIFACT_DIR.to_string());
            let object_fmt = self
                .env
                .cfg_entry_recursive(dep, "out-object-dir")
                .and_then(|v| config::scalar_string(&v))
                .unwrap_or_else(|| DEFAULT_OBJECT_DIR.to_string());

            let mut locals = BTreeMap::new();
            locals.insert("module".to_string(), module.clone());
            locals.insert(
                "src".to_string(),
                self.env.target(dep).path.to_string_lossy().to_string(),
            );
            locals.insert("out".to_string(), out_dir.to_string_lossy().to_string());

            let views = self.env.scope_views(dep);
            let artifact_dir = views.resolve_with_locals(&locals, &artifact_fmt)?;
            let object_dir = views.resolve_with_locals(&locals, &object_fmt)?;
            drop(views);

            desc.set_artifact_directory(&escaped, &artifact_dir);
            desc.set_object_directory(&escaped, &object_dir);

            let scope = self.env.target(dep).build_scope.clone();
            if let Some(scope) = scope {
                scope.set(
                    "src-dir",
                    self.env.target(dep).path.to_string_lossy().to_string(),
                );
                scope.set(
                    "artifact-dir",
                    out_dir.join(&artifact_dir).to_string_lossy().to_string(),
                );
                scope.set(
                    "object-dir",
                    out_dir.join(&object_dir).to_string_lossy().to_string(),
                );
            }
        }

        desc.meta["root_target"] = serde_json::json!(self.env.target(target).module);

        Ok(desc)
    }

    /// Writes the JSON meta record under the root's cache directory.
    pub fn save_target_meta(&self, desc: &NinjaBuildDesc) -> Result<()> {
        let Some(root) = desc.root_target else {
            return Ok(());
        };

        let cache_path = self.env.target(root).path.join(CACHE_DIR_NAME).join("meta");
        fs::create_dir_all(&cache_path)?;
        fs::write(cache_path.join("full.json"), desc.meta.to_string())?;
        Ok(())
    }

    /// Generates the build script, runs pre-build actions, invokes the
    /// external build executor, and runs post-build actions.
    pub fn build_target(&mut self, desc: &NinjaBuildDesc) -> Result<i32> {
        let root = desc.root_target.ok_or_else(|| {
            Error::build(None, "build description has no root target".to_string())
        })?;

        self.env.out().info_styled(" - Generating build files\n");
        ninja::generate_build_file(desc, &desc.out_dir)?;
        self.save_target_meta(desc)?;

        self.env.out().info_styled(" - Running pre-build actions\n");
        for dep in self.env.single_target_dep_set(root)? {
            self.env
                .run_automatic_structured_tasks(dep, Some(desc), "pre-build")?;
            self.env.run_actions_categorized(dep, Some(desc), "pre-build")?;
        }

        self.env.out().info_styled(" - Building...\n\n");

        let code = process::run_process(
            "ninja",
            &["-C".to_string(), desc.out_dir.to_string_lossy().to_string()],
            &desc.out_dir,
            &RunOptions {
                strict: false,
                ..Default::default()
            },
        )?;
        if code != 0 {
            return Err(Error::build(
                Some(self.env.target(root).module.clone()),
                format!("build failed: exit_code={code}"),
            ));
        }

        self.env
            .out()
            .info_styled("\n - Running post-build actions\n\n");
        for dep in self.env.single_target_dep_set(root)? {
            self.env
                .run_automatic_structured_tasks(dep, Some(desc), "post-build")?;
            self.env.run_actions_categorized(dep, Some(desc), "post-build")?;
        }

        self.env.out().info_styled(" - Build successful!\n");
        Ok(code)
    }

    /// The install flow for every member of the root's dependency set.
    pub fn install_target(&mut self, desc: &NinjaBuildDesc) -> Result<()> {
        let root = desc.root_target.ok_or_else(|| {
            Error::build(None, "build description has no root target".to_string())
        })?;

        for dep in self.env.single_target_dep_set(root)? {
            self.env.run_install_actions(dep, desc)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputLevel;

    fn quiet() -> Output {
        Output::new(OutputLevel::Off)
    }

    #[test]
    fn user_params_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = BuildContext::new(quiet(), Some(dir.path().to_path_buf()));

        fs::write(
            dir.path().join(USER_PARAMS_FILENAME),
            "arch: arm64\nconfiguration: release\n",
        )
        .unwrap();

        let doc = ctx.load_cached_params(dir.path()).unwrap();
        assert_eq!(
            ctx.env().global_scope().get("arch").as_deref(),
            Some("arm64")
        );
        assert_eq!(
            ctx.env().global_scope().get("configuration").as_deref(),
            Some("release")
        );

        let out = tempfile::tempdir().unwrap();
        ctx.save_cached_params(out.path(), &doc).unwrap();
        let reloaded: Value = serde_yaml::from_str(
            &fs::read_to_string(out.path().join(USER_PARAMS_FILENAME)).unwrap(),
        )
        .unwrap();
        assert_eq!(reloaded, doc);
    }

    #[test]
    fn missing_user_params_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = BuildContext::new(quiet(), Some(dir.path().to_path_buf()));
        assert_eq!(ctx.load_cached_params(dir.path()).unwrap(), Value::Null);
    }

    const TOOLCHAIN_YAML: &str = r#"
vars: {}
default-flags: {}
tools:
  compiler: /usr/bin/c++
  linker: /usr/bin/c++
  archiver: /usr/bin/ar
templates:
  compiler-cmdline: "{flags} -c {input} -o {output}"
  linker-cmdline: "{flags} {input} {link_deps} {global_link_deps} -o {output}"
  archiver-cmdline: "rcs {output} {input} {link_deps}"
  cxx-include-dir: "-I{directory}"
  cxx-lib-dir: "-L{directory}"
  cxx-compile-definition: "-D{name}={value}"
  cxx-compile-definition-no-value: "-D{name}"
  cxx-standard: "-std=c++{version}"
  c-standard: "-std=c{version}"
  compile-as-c: "-x c"
  link-as-shared-library: "-shared"
supported-extensions: [c, cpp, cc, h, hpp]
default-extensions:
  object: o
platform-definitions: {}
use-rspfiles: false
"#;

    const CORE_PROJECT_YAML: &str = r#"
type: project
name: core
link-with: cpp
langs: [cpp]
cxx-env: gcc
cxx-standard: '17'
"#;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn context_with_data() -> (BuildContext, tempfile::TempDir) {
        let data = tempfile::tempdir().unwrap();
        write(
            &data.path().join("environments/cxx/gcc.yml"),
            TOOLCHAIN_YAML,
        );
        write(&data.path().join("core-project/re.yml"), CORE_PROJECT_YAML);

        let mut ctx = BuildContext::new(quiet(), Some(data.path().to_path_buf()));
        ctx.load_default_environment().unwrap();
        (ctx, data)
    }

    #[test]
    fn single_executable_yields_rules_objects_artifact_and_alias() {
        let (mut ctx, _data) = context_with_data();

        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join("re.yml"),
            "type: executable\nname: hello\nlangs: [cpp]\n",
        );
        write(&dir.path().join("main.cpp"), "int main() {}\n");

        let target = ctx.load_target(dir.path()).unwrap();
        let desc = ctx.generate_build_desc(target).unwrap();

        let rule_names: Vec<_> = desc.rules.iter().map(|r| r.name.clone()).collect();
        assert!(rule_names.contains(&"cxx_compile_hello".to_string()));
        assert!(rule_names.contains(&"cxx_link_hello".to_string()));
        assert!(rule_names.contains(&"cxx_archive_hello".to_string()));

        let objects: Vec<_> = desc
            .entries
            .iter()
            .filter(|e| e.ty == crate::desc::BuildEntryType::Object)
            .collect();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].input, "$cxx_path_hello/main.cpp");
        assert_eq!(
            objects[0].output,
            "$builddir/$re_target_object_directory_hello/main.cpp.o"
        );
        assert_eq!(objects[0].rule, "cxx_compile_hello");

        let artifacts: Vec<_> = desc
            .entries
            .iter()
            .filter(|e| e.ty == crate::desc::BuildEntryType::Artifact)
            .collect();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(
            artifacts[0].output,
            "$builddir/$re_target_artifact_directory_hello/hello"
        );
        assert_eq!(artifacts[0].rule, "cxx_link_hello");

        let aliases: Vec<_> = desc
            .entries
            .iter()
            .filter(|e| e.ty == crate::desc::BuildEntryType::Alias)
            .collect();
        assert_eq!(aliases.len(), 1);
        assert_eq!(aliases[0].output, "hello");
        assert_eq!(aliases[0].input, artifacts[0].output);

        assert!(desc.artifacts.contains_key(&target));
        assert_eq!(desc.artifact_directory("hello"), Some("build/hello"));
        assert_eq!(desc.object_directory("hello"), Some("obj/hello"));

        let out_dir = desc.out_dir.to_string_lossy().to_string();
        assert!(out_dir.ends_with(&format!("out/x64-{}-debug", std::env::consts::OS.replace("macos", "osx"))) || out_dir.contains("out/x64-"));

        assert_eq!(desc.meta["root_target"], serde_json::json!("hello"));

        // The rendered script contains the expected statements.
        let text = crate::ninja::render_build_file(&desc);
        assert!(text.contains("rule cxx_compile_hello"));
        assert!(text.contains("build hello: phony"));
    }

    #[test]
    fn static_library_feeds_the_executable_link() {
        let (mut ctx, _data) = context_with_data();

        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("re.yml"), "type: project\nname: proj\n");
        write(
            &dir.path().join("libfoo/re.yml"),
            "type: static-library\n",
        );
        write(&dir.path().join("libfoo/foo.cpp"), "int foo() { return 1; }\n");
        write(
            &dir.path().join("hello/re.yml"),
            "type: executable\ndeps: [.libfoo]\n",
        );
        write(&dir.path().join("hello/main.cpp"), "int main() {}\n");

        let root = ctx.load_target(dir.path()).unwrap();
        let desc = ctx.generate_build_desc(root).unwrap();

        let lib = ctx.env().find_target("proj.libfoo").unwrap();
        let exe = ctx.env().find_target("proj.hello").unwrap();

        // Dependencies come before dependents in the flattened order.
        let set = ctx.env_mut().single_target_dep_set(root).unwrap();
        let pos = |id| set.iter().position(|t| *t == id).unwrap();
        assert!(pos(lib) < pos(exe));

        // The library is archived, and its artifact is an input dependency of
        // the executable's link entry.
        let lib_artifact = desc
            .entries
            .iter()
            .find(|e| {
                e.ty == crate::desc::BuildEntryType::Artifact
                    && e.source_target == Some(lib)
            })
            .unwrap();
        assert_eq!(lib_artifact.rule, "cxx_archive_proj_libfoo");

        let exe_artifact = desc
            .entries
            .iter()
            .find(|e| {
                e.ty == crate::desc::BuildEntryType::Artifact
                    && e.source_target == Some(exe)
            })
            .unwrap();
        assert!(exe_artifact.deps.contains(&lib_artifact.output));

        // The link rule pulls the archive in through its command line.
        let link_rule = desc
            .rules
            .iter()
            .find(|r| r.name == "cxx_link_proj_hello")
            .unwrap();
        assert!(link_rule.cmdline.contains("$cxx_artifact_proj_libfoo"));
    }

    #[test]
    fn install_flow_copies_the_artifact_directory() {
        let (mut ctx, _data) = context_with_data();

        let install_to = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join("re.yml"),
            &format!(
                "type: executable\nname: hello\nlangs: [cpp]\ninstall: {}\n",
                install_to.path().join("dest").display()
            ),
        );
        write(&dir.path().join("main.cpp"), "int main() {}\n");

        let target = ctx.load_target(dir.path()).unwrap();
        let desc = ctx.generate_build_desc(target).unwrap();

        // Simulate the executor having produced the artifact.
        let artifact_dir = desc
            .out_dir
            .join(desc.artifact_directory("hello").unwrap());
        fs::create_dir_all(&artifact_dir).unwrap();
        fs::write(artifact_dir.join("hello"), "binary").unwrap();

        ctx.install_target(&desc).unwrap();

        assert_eq!(
            fs::read_to_string(install_to.path().join("dest").join("hello")).unwrap(),
            "binary"
        );
    }

    #[test]
    fn version_cache_persists_under_the_root_cache_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = BuildContext::new(quiet(), Some(dir.path().to_path_buf()));

        ctx.load_version_cache(dir.path()).unwrap();
        ctx.save_version_cache(dir.path()).unwrap();
        assert!(
            dir.path()
                .join(CACHE_DIR_NAME)
                .join(VERSION_CACHE_FILENAME)
                .is_file()
        );
    }
}
