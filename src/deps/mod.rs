// src/deps/mod.rs

use std::path::Path;

use crate::buildenv::BuildEnv;
use crate::error::{Error, Result};
use crate::target::{TargetDependency, TargetId};

pub mod arch_coerced;
pub mod fs;
pub mod git;
pub mod github;
pub mod global;

pub use arch_coerced::ArchCoercedDepResolver;
pub use fs::FsDepResolver;
pub use git::GitDepResolver;
pub use github::GithubDepResolver;
pub use global::GlobalDepResolver;

/// Converts dependency records into concrete targets, possibly fetching or
/// generating them. One resolver serves one (or more) depstring namespaces.
pub trait DepResolver {
    /// Resolves the dependency to a target, loading and registering it when
    /// it is not already cached.
    fn resolve(
        &self,
        env: &mut BuildEnv,
        from: TargetId,
        dep: &TargetDependency,
    ) -> Result<TargetId>;

    /// Produces an architecture-coerced variant of an already-resolved
    /// target. Only meaningful for the `arch-coerced` resolver.
    fn resolve_coerced(
        &self,
        env: &mut BuildEnv,
        from: TargetId,
        _existing: TargetId,
    ) -> Result<TargetId> {
        Err(Error::dependency(
            Some(env.target(from).module.clone()),
            "this resolver does not support architecture coercion".to_string(),
        ))
    }

    /// Fetches the dependency's contents into a directory for global package
    /// installation. Returns false when the namespace does not support it.
    fn save_to_path(
        &self,
        _env: &mut BuildEnv,
        _dep: &TargetDependency,
        _path: &Path,
    ) -> Result<bool> {
        Ok(false)
    }

    /// Whether the resolver applies subtarget filters itself.
    fn handles_filters(&self) -> bool {
        false
    }
}
