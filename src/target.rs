// src/target.rs

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex::Regex;
use serde_yaml::Value;

use crate::config::{self, TargetConfig};
use crate::constants::{CONFIG_PARTITION_SUFFIX, TARGET_CONFIG_FILENAME};
use crate::error::{Error, Result};
use crate::vars::VarScope;

/// A stable handle to a target owned by the build environment's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetId(pub usize);

/// The type of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetType {
    /// Has no sources of its own and only contains other subtargets.
    Project,
    Executable,
    StaticLibrary,
    /// Buildable, but not linkable through dependency edges.
    SharedLibrary,
    Custom,
}

impl TargetType {
    pub fn from_config_str(s: &str) -> Result<Self> {
        match s {
            "project" => Ok(Self::Project),
            "executable" => Ok(Self::Executable),
            "static-library" => Ok(Self::StaticLibrary),
            "shared-library" => Ok(Self::SharedLibrary),
            "custom" => Ok(Self::Custom),
            other => Err(Error::load(None, format!("unknown target type '{other}'"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Executable => "executable",
            Self::StaticLibrary => "static-library",
            Self::SharedLibrary => "shared-library",
            Self::Custom => "custom",
        }
    }
}

/// A single source file discovered in a target's tree.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    /// The extension without the leading dot.
    pub extension: String,
}

/// The kind of a dependency's version requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyVersionKind {
    /// Resolve the raw tag as-is, without SemVer comparisons.
    RawTag,
    Equal,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    /// `~x.y.z`: newest version with the same major and minor values.
    SameMinor,
    /// `^x.y.z`: newest version with the same major value.
    SameMajor,
}

impl DependencyVersionKind {
    /// The operator string used in depstrings and version-cache keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RawTag => "@",
            Self::Equal => "==",
            Self::Greater => ">",
            Self::GreaterEqual => ">=",
            Self::Less => "<",
            Self::LessEqual => "<=",
            Self::SameMinor => "~",
            Self::SameMajor => "^",
        }
    }
}

/// A single dependency edge declared by a target.
#[derive(Debug, Clone, Default)]
pub struct TargetDependency {
    /// The original depstring.
    pub raw: String,
    /// The resolver namespace; empty means a local target reference.
    pub ns: String,
    pub name: String,
    pub version: String,
    pub version_kind: Option<DependencyVersionKind>,
    /// The parsed SemVer value when the kind is not a raw tag.
    pub version_sv: Option<semver::Version>,
    /// Subtarget selectors; a leading `/` marks a path cutout.
    pub filters: Vec<String>,
    /// Filled at resolution time. A dependency with a non-empty resolved set
    /// is considered done and is not resolved again.
    pub resolved: Vec<TargetId>,
    /// Per-edge config overrides creating a distinct variant target.
    pub extra_config: Option<Value>,
    /// Identity tag of the target owning the extra config node.
    pub extra_config_hash: Option<String>,
    /// Identity tag of the extra config data itself.
    pub extra_config_data_hash: Option<String>,
}

impl TargetDependency {
    pub fn kind(&self) -> DependencyVersionKind {
        self.version_kind.unwrap_or(DependencyVersionKind::RawTag)
    }

    pub fn to_string_raw(&self) -> &str {
        &self.raw
    }

    /// The first filter when it is a `/path` cutout.
    pub fn cutout_filter(&self) -> Option<&str> {
        self.filters
            .first()
            .and_then(|f| f.strip_prefix('/'))
            .filter(|f| !f.is_empty())
    }
}

lazy_static! {
    static ref DEP_REGEX: Regex = Regex::new(
        r"^\s?(?:([a-zA-Z0-9.-]*):)?\s?([^\s@=<>~\^]*)\s*(?:(@|==|<=|<|>=|>|~|\^)\s*([a-zA-Z0-9._-]*))?\s*(?:\[(.+)\])?\s*$",
    )
    .expect("invalid regex");
}

fn identity_hash(data: &str) -> String {
    hex::encode(&blake3::hash(data.as_bytes()).as_bytes()[..8])
}

/// Parses a depstring of the form
/// `[ns:]name[ @|==|<|<=|>|>=|~|^ version] [ [filter, ...] ]`.
pub fn parse_dependency(s: &str, owner_module: Option<&str>) -> Result<TargetDependency> {
    let caps = DEP_REGEX.captures(s).ok_or_else(|| {
        Error::dependency(
            owner_module.map(str::to_string),
            format!("dependency '{s}' does not meet the format requirements"),
        )
    })?;

    let mut dep = TargetDependency {
        raw: s.to_string(),
        ns: caps.get(1).map(|g| g.as_str()).unwrap_or_default().into(),
        name: caps.get(2).map(|g| g.as_str()).unwrap_or_default().into(),
        version: caps.get(4).map(|g| g.as_str()).unwrap_or_default().into(),
        ..Default::default()
    };

    let kind = match caps.get(3).map(|g| g.as_str()).unwrap_or_default() {
        "" | "@" => DependencyVersionKind::RawTag,
        "==" => DependencyVersionKind::Equal,
        ">" => DependencyVersionKind::Greater,
        ">=" => DependencyVersionKind::GreaterEqual,
        "<" => DependencyVersionKind::Less,
        "<=" => DependencyVersionKind::LessEqual,
        "~" => DependencyVersionKind::SameMinor,
        "^" => DependencyVersionKind::SameMajor,
        other => {
            return Err(Error::dependency(
                owner_module.map(str::to_string),
                format!("invalid kind tag '{other}' in dependency '{s}'"),
            ));
        }
    };
    dep.version_kind = Some(kind);

    if kind != DependencyVersionKind::RawTag {
        let parsed = semver::Version::parse(&dep.version).map_err(|e| {
            Error::dependency(
                owner_module.map(str::to_string),
                format!("invalid version '{}' in dependency '{s}': {e}", dep.version),
            )
        })?;
        dep.version_sv = Some(parsed);
    }

    if let Some(filters) = caps.get(5) {
        dep.filters = filters
            .as_str()
            .replace(' ', "")
            .split(',')
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .collect();
    }

    if dep.name.is_empty() {
        return Err(Error::dependency(
            owner_module.map(str::to_string),
            format!("dependency '{s}' does not have a name specified"),
        ));
    }

    Ok(dep)
}

/// Parses a dependency node: either a plain depstring or a single-key map
/// whose value becomes the dependency's extra config.
pub fn parse_dependency_node(node: &Value, owner_module: Option<&str>) -> Result<TargetDependency> {
    match node {
        Value::String(s) => parse_dependency(s, owner_module),
        Value::Mapping(map) => {
            let (key, value) = map.iter().next().ok_or_else(|| {
                Error::dependency(
                    owner_module.map(str::to_string),
                    "dependency map node must have a key".to_string(),
                )
            })?;

            let depstring = key.as_str().ok_or_else(|| {
                Error::dependency(
                    owner_module.map(str::to_string),
                    "dependency map key must be a string".to_string(),
                )
            })?;

            let mut dep = parse_dependency(depstring, owner_module)?;

            let serialized = serde_yaml::to_string(value)?;
            let data_hash = identity_hash(&serialized);
            dep.extra_config = Some(value.clone());
            dep.extra_config_hash = Some(match owner_module {
                Some(module) => identity_hash(module),
                None => data_hash.clone(),
            });
            dep.extra_config_data_hash = Some(data_hash);

            Ok(dep)
        }
        _ => Err(Error::dependency(
            owner_module.map(str::to_string),
            "dependency node must be string or map".to_string(),
        )),
    }
}

/// Combines two module paths, dotted, tolerating emptiness on either side.
pub fn module_path_combine(a: &str, b: &str) -> String {
    if a.is_empty() {
        b.to_string()
    } else if b.is_empty() {
        a.to_string()
    } else {
        format!("{a}.{b}")
    }
}

/// Escapes a module path for use in generated build-script identifiers.
pub fn escape_module_path(module: &str) -> String {
    module
        .chars()
        .map(|c| match c {
            '.' | ':' | '@' => '_',
            other => other,
        })
        .collect()
}

/// A single buildable target.
///
/// Targets live in the build environment's arena; all graph edges are ids.
#[derive(Debug)]
pub struct Target {
    pub ty: TargetType,
    /// Absolute source path. Not guaranteed to contain a config file.
    pub path: PathBuf,
    /// The ultimate root target's path.
    pub root_path: PathBuf,
    pub name: String,
    /// The globally unique dotted module path.
    pub module: String,

    pub parent: Option<TargetId>,
    pub root: Option<TargetId>,
    /// The parent with respect to dependencies (used by uses-mapping lookup).
    pub dep_parent: Option<TargetId>,

    pub dependencies: Vec<TargetDependency>,
    pub sources: Vec<SourceFile>,
    pub children: Vec<TargetId>,
    /// Reverse edges; never owning.
    pub dependents: BTreeSet<TargetId>,

    pub config_path: PathBuf,
    pub config: TargetConfig,
    /// Flattened configuration for the current context; computed once.
    pub resolved_config: Option<TargetConfig>,

    /// Local-name → parsed dependency exposed to dependents.
    pub used_mapping: Vec<(String, TargetDependency)>,
    /// Names of the target features enabled on this target.
    pub features: BTreeSet<String>,

    pub target_scope: Option<VarScope>,
    pub build_scope: Option<VarScope>,
}

impl Target {
    fn empty(path: PathBuf, ty: TargetType, config: TargetConfig) -> Self {
        Self {
            ty,
            root_path: path.clone(),
            config_path: path.join(TARGET_CONFIG_FILENAME),
            path,
            name: String::new(),
            module: String::new(),
            parent: None,
            root: None,
            dep_parent: None,
            dependencies: Vec::new(),
            sources: Vec::new(),
            children: Vec::new(),
            dependents: BTreeSet::new(),
            config,
            resolved_config: None,
            used_mapping: Vec::new(),
            features: BTreeSet::new(),
            target_scope: None,
            build_scope: None,
        }
    }

    /// Loads a target's base data from a directory containing `re.yml`,
    /// merging any sibling `*.re.yml` partitions over it.
    ///
    /// The module path is finalized later, once the parent is known.
    pub fn from_dir(dir_path: &Path) -> Result<Self> {
        let path = dunce::canonicalize(dir_path)?;
        let config_path = path.join(TARGET_CONFIG_FILENAME);

        let text = fs::read_to_string(&config_path).map_err(|e| {
            Error::load(
                None,
                format!("cannot read '{}': {e}", config_path.display()),
            )
        })?;
        let mut cfg: Value = serde_yaml::from_str(&text).map_err(|e| {
            Error::load(
                None,
                format!("cannot parse '{}': {e}", config_path.display()),
            )
        })?;

        let mut partitions = Vec::new();
        for entry in fs::read_dir(&path)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            if file_name.ends_with(CONFIG_PARTITION_SUFFIX) && entry.path() != config_path {
                partitions.push(entry.path());
            }
        }
        partitions.sort();
        for partition in partitions {
            let text = fs::read_to_string(&partition)?;
            let merge_cfg: Value = serde_yaml::from_str(&text).map_err(|e| {
                Error::load(None, format!("cannot parse '{}': {e}", partition.display()))
            })?;
            config::merge_node(&mut cfg, &merge_cfg, false);
        }

        let dir_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let name = config::entry_str(&cfg, "name").unwrap_or(dir_name);

        let mut target = Self::empty(path, TargetType::Project, cfg);
        target.config_path = config_path;
        target.name = name;
        target.load_base_data()?;

        Ok(target)
    }

    /// Builds a target from explicit data, with no file I/O. Used for targets
    /// materialized by middlewares and synthetic test fixtures.
    pub fn from_data(
        virtual_path: &Path,
        name: &str,
        ty: TargetType,
        config: TargetConfig,
    ) -> Self {
        let mut target = Self::empty(virtual_path.to_path_buf(), ty, config);
        target.name = name.to_string();
        target.module = name.to_string();
        target
    }

    /// Determines the target type and normalizes the name.
    pub fn load_base_data(&mut self) -> Result<()> {
        let type_str = config::entry_str(&self.config, "type").ok_or_else(|| {
            Error::load(
                Some(self.name.clone()),
                "target type not specified".to_string(),
            )
        })?;
        self.ty = TargetType::from_config_str(&type_str)
            .map_err(|_| Error::load(Some(self.name.clone()), format!("unknown target type '{type_str}'")))?;

        if let Some(stripped) = self.name.strip_prefix('.') {
            self.name = stripped.to_string();
        }

        Ok(())
    }

    /// The relevant config instance: resolved when available, raw otherwise.
    pub fn effective_config(&self) -> &TargetConfig {
        self.resolved_config.as_ref().unwrap_or(&self.config)
    }

    /// A config entry from this target's raw config only.
    pub fn cfg_entry(&self, key: &str) -> Option<&Value> {
        self.config.get(key)
    }

    pub fn enabled(&self) -> bool {
        config::entry_bool(self.effective_config(), "enabled").unwrap_or(true)
    }
}

/// Whether a directory contains a loadable target config file.
pub fn dir_contains_target(path: &Path) -> bool {
    path.join(TARGET_CONFIG_FILENAME).is_file()
}

/// Scaffolds an empty target configuration file at the given path.
pub fn create_empty_target(path: &Path, ty: TargetType, name: &str) -> Result<()> {
    let mut doc = serde_yaml::Mapping::new();
    doc.insert("type".into(), Value::String(ty.as_str().to_string()));
    doc.insert("name".into(), Value::String(name.to_string()));

    fs::create_dir_all(path)?;
    fs::write(
        path.join(TARGET_CONFIG_FILENAME),
        serde_yaml::to_string(&Value::Mapping(doc))?,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_namespaced_names() {
        let dep = parse_dependency("libfoo", None).unwrap();
        assert_eq!(dep.ns, "");
        assert_eq!(dep.name, "libfoo");
        assert_eq!(dep.kind(), DependencyVersionKind::RawTag);
        assert!(dep.version.is_empty());

        let dep = parse_dependency("github:user/repo @ v1.0", None).unwrap();
        assert_eq!(dep.ns, "github");
        assert_eq!(dep.name, "user/repo");
        assert_eq!(dep.version, "v1.0");
        assert_eq!(dep.kind(), DependencyVersionKind::RawTag);
    }

    #[test]
    fn parses_every_version_operator() {
        let cases = [
            ("pkg == 1.2.3", DependencyVersionKind::Equal),
            ("pkg > 1.2.3", DependencyVersionKind::Greater),
            ("pkg >= 1.2.3", DependencyVersionKind::GreaterEqual),
            ("pkg < 1.2.3", DependencyVersionKind::Less),
            ("pkg <= 1.2.3", DependencyVersionKind::LessEqual),
            ("pkg ~ 1.2.3", DependencyVersionKind::SameMinor),
            ("pkg ^ 1.2.3", DependencyVersionKind::SameMajor),
        ];

        for (raw, kind) in cases {
            let dep = parse_dependency(raw, None).unwrap();
            assert_eq!(dep.kind(), kind, "for '{raw}'");
            assert_eq!(dep.version, "1.2.3");
            assert!(dep.version_sv.is_some());
        }
    }

    #[test]
    fn semver_operators_require_a_valid_version() {
        assert!(parse_dependency("pkg ^ not-a-version", None).is_err());
        // Raw tags take anything.
        assert!(parse_dependency("pkg @ latest", None).is_ok());
    }

    #[test]
    fn parses_filters_and_cutouts() {
        let dep = parse_dependency("github:user/repo @ v2 [/subdir, tools.gen, lib]", None).unwrap();
        assert_eq!(dep.filters, vec!["/subdir", "tools.gen", "lib"]);
        assert_eq!(dep.cutout_filter(), Some("subdir"));

        let dep = parse_dependency("local [sub]", None).unwrap();
        assert_eq!(dep.filters, vec!["sub"]);
        assert_eq!(dep.cutout_filter(), None);
    }

    #[test]
    fn nameless_dependency_is_rejected() {
        assert!(parse_dependency(" @ v1", None).is_err());
    }

    #[test]
    fn map_node_carries_extra_config_identity() {
        let node: Value =
            serde_yaml::from_str("{\"vendored\": {cxx-standard: '17'}}").unwrap();

        let from_a = parse_dependency_node(&node, Some("proj.a")).unwrap();
        let from_b = parse_dependency_node(&node, Some("proj.b")).unwrap();

        assert!(from_a.extra_config.is_some());
        // Owner identity differs per dependent, data identity does not.
        assert_ne!(from_a.extra_config_hash, from_b.extra_config_hash);
        assert_eq!(
            from_a.extra_config_data_hash,
            from_b.extra_config_data_hash
        );
    }

    #[test]
    fn module_path_helpers() {
        assert_eq!(module_path_combine("", "app"), "app");
        assert_eq!(module_path_combine("proj", ""), "proj");
        assert_eq!(module_path_combine("proj", "app"), "proj.app");

        assert_eq!(
            escape_module_path("git.x64-linux-debug.proj@1:2"),
            "git_x64-linux-debug_proj_1_2"
        );
    }

    #[test]
    fn target_from_dir_reads_partitions_and_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("re.yml"), "type: executable\n").unwrap();
        std::fs::write(dir.path().join("extra.re.yml"), "cxx-standard: '20'\n").unwrap();

        let target = Target::from_dir(dir.path()).unwrap();
        assert_eq!(target.ty, TargetType::Executable);
        // Name falls back to the directory name.
        assert_eq!(
            target.name,
            dir.path().file_name().unwrap().to_string_lossy()
        );
        assert_eq!(
            config::entry_str(&target.config, "cxx-standard").as_deref(),
            Some("20")
        );
    }

    #[test]
    fn scaffolded_targets_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("newlib");
        create_empty_target(&path, TargetType::StaticLibrary, "newlib").unwrap();

        let target = Target::from_dir(&path).unwrap();
        assert_eq!(target.ty, TargetType::StaticLibrary);
        assert_eq!(target.name, "newlib");
    }

    #[test]
    fn target_without_type_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("re.yml"), "name: broken\n").unwrap();

        let err = Target::from_dir(dir.path()).unwrap_err();
        assert!(matches!(err, Error::Load { .. }));
        assert!(err.to_string().contains("target type not specified"));
    }
}
