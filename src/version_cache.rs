// src/version_cache.rs

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::target::{DependencyVersionKind, TargetDependency};

/// Picks concrete version tags for SemVer-pinned dependencies and remembers
/// the choice, keyed by the full predicate, so that later invocations resolve
/// to the same tag.
///
/// The recorded data round-trips through a JSON file without semantic loss.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DepsVersionCache {
    data: BTreeMap<String, String>,
}

impl DepsVersionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_data(data: BTreeMap<String, String>) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &BTreeMap<String, String> {
        &self.data
    }

    /// Loads the cache from a JSON file; a missing file yields an empty cache.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Returns the newest version tag satisfying the dependency's predicate.
    ///
    /// Raw tags bypass selection entirely. Otherwise the cache is consulted
    /// first; on a miss, `fetch_versions` supplies the candidate tags, which
    /// are filtered by the predicate (invalid SemVer strings are silently
    /// dropped), sorted descending, and the first pick is recorded.
    pub fn latest_matching(
        &mut self,
        target_module: &str,
        dep: &TargetDependency,
        name: &str,
        fetch_versions: &mut dyn FnMut(&TargetDependency, &str) -> Result<Vec<String>>,
    ) -> Result<String> {
        let kind = dep.kind();

        if kind == DependencyVersionKind::RawTag {
            return Ok(dep.version.clone());
        }

        let key = format!("{}:{}{}{}", dep.ns, dep.name, kind.as_str(), dep.version);
        if let Some(existing) = self.data.get(&key) {
            return Ok(existing.clone());
        }

        let required = dep.version_sv.clone().ok_or_else(|| {
            Error::dependency(
                Some(target_module.to_string()),
                format!("dependency '{}' has no parsed version", dep.raw),
            )
        })?;

        let available = fetch_versions(dep, name)?;
        if available.is_empty() {
            return Err(Error::dependency(
                Some(target_module.to_string()),
                format!("no versions for '{}'", dep.raw),
            ));
        }

        let mut matching: Vec<(semver::Version, String)> = available
            .iter()
            .filter_map(|tag| {
                semver::Version::parse(tag.trim_start_matches('v'))
                    .ok()
                    .map(|parsed| (parsed, tag.clone()))
            })
            .filter(|(candidate, _)| match kind {
                DependencyVersionKind::RawTag => true,
                DependencyVersionKind::Equal => *candidate == required,
                DependencyVersionKind::Greater => *candidate > required,
                DependencyVersionKind::GreaterEqual => *candidate >= required,
                DependencyVersionKind::Less => *candidate < required,
                DependencyVersionKind::LessEqual => *candidate <= required,
                DependencyVersionKind::SameMinor => {
                    *candidate >= required
                        && candidate.major == required.major
                        && candidate.minor == required.minor
                }
                DependencyVersionKind::SameMajor => {
                    *candidate >= required && candidate.major == required.major
                }
            })
            .collect();

        if matching.is_empty() {
            return Err(Error::dependency(
                Some(target_module.to_string()),
                format!("no matching versions for '{}'", dep.raw),
            ));
        }

        matching.sort_by(|(a, _), (b, _)| b.cmp(a));
        let chosen = matching[0].1.clone();

        log::debug!("picked version {chosen} for '{}'", dep.raw);

        self.data.insert(key, chosen.clone());
        Ok(chosen)
    }
}
