// src/desc.rs

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::target::TargetId;

pub type BuildVars = BTreeMap<String, String>;

/// An external tool referenced by build rules.
#[derive(Debug, Clone)]
pub struct BuildTool {
    pub name: String,
    pub path: String,
}

/// A build rule: a tool invocation template.
#[derive(Debug, Clone, Default)]
pub struct BuildRule {
    pub name: String,
    pub tool: String,
    pub cmdline: String,
    pub description: String,
    pub vars: BuildVars,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildEntryType {
    Auxiliary,
    Object,
    Artifact,
    Alias,
}

/// A single `build` statement of the generated script.
#[derive(Debug, Clone)]
pub struct BuildEntry {
    pub ty: BuildEntryType,
    pub rule: String,
    pub input: String,
    pub output: String,
    pub vars: BuildVars,
    /// Implicit extra inputs.
    pub deps: Vec<String>,
    pub source_target: Option<TargetId>,
    /// Index into the source target's source list, for object entries.
    pub source_index: Option<usize>,
}

impl BuildEntry {
    pub fn new(ty: BuildEntryType) -> Self {
        Self {
            ty,
            rule: String::new(),
            input: String::new(),
            output: String::new(),
            vars: BuildVars::new(),
            deps: Vec::new(),
            source_target: None,
            source_index: None,
        }
    }
}

const ARTIFACT_DIR_PREFIX: &str = "re_target_artifact_directory_";
const OBJECT_DIR_PREFIX: &str = "re_target_object_directory_";

/// The flat, language-agnostic description of a whole build, consumed by the
/// script generator and the external executor.
#[derive(Debug, Default)]
pub struct NinjaBuildDesc {
    pub out_dir: PathBuf,

    /// Variables emitted at the very beginning of the build file
    /// (module-keyed artifact and object directories).
    pub init_vars: BuildVars,

    /// Substituted variables; these end up in the build script.
    pub vars: BuildVars,

    /// Arbitrary generation state; never emitted.
    pub state: BuildVars,

    pub tools: Vec<BuildTool>,
    pub rules: Vec<BuildRule>,
    pub entries: Vec<BuildEntry>,

    pub subninjas: Vec<String>,

    pub root_target: Option<TargetId>,

    /// Meta record indexed by target path.
    pub meta: serde_json::Value,

    /// Final artifact path per target.
    pub artifacts: BTreeMap<TargetId, PathBuf>,
}

impl NinjaBuildDesc {
    pub fn new() -> Self {
        Self {
            meta: serde_json::json!({}),
            ..Default::default()
        }
    }

    pub fn set_artifact_directory(&mut self, escaped_module: &str, dir: &str) {
        self.init_vars
            .insert(format!("{ARTIFACT_DIR_PREFIX}{escaped_module}"), dir.into());
    }

    pub fn set_object_directory(&mut self, escaped_module: &str, dir: &str) {
        self.init_vars
            .insert(format!("{OBJECT_DIR_PREFIX}{escaped_module}"), dir.into());
    }

    pub fn artifact_directory(&self, escaped_module: &str) -> Option<&str> {
        self.init_vars
            .get(&format!("{ARTIFACT_DIR_PREFIX}{escaped_module}"))
            .map(String::as_str)
    }

    pub fn object_directory(&self, escaped_module: &str) -> Option<&str> {
        self.init_vars
            .get(&format!("{OBJECT_DIR_PREFIX}{escaped_module}"))
            .map(String::as_str)
    }

    pub fn has_artifacts_for(&self, escaped_module: &str) -> bool {
        self.artifact_directory(escaped_module).is_some()
    }

    /// The mutable meta node for a given target path.
    pub fn target_meta(&mut self, target_path: &str) -> &mut serde_json::Value {
        &mut self.meta["targets"][target_path]
    }
}
