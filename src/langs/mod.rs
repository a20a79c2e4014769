// src/langs/mod.rs

use crate::buildenv::BuildEnv;
use crate::desc::NinjaBuildDesc;
use crate::error::Result;
use crate::target::TargetId;

pub mod cxx;

pub use cxx::CxxLangProvider;

/// A language provider: knows how to turn one language's sources into rules,
/// objects and artifacts of the build description.
pub trait LangProvider {
    /// The stable identifier matched against `langs` config entries.
    fn lang_id(&self) -> &'static str;

    /// Global, once-per-description initialization.
    fn init_in_build_desc(&self, desc: &mut NinjaBuildDesc);

    /// Populates the target's variable scopes, resolves its configuration for
    /// the current context, chooses the toolchain variant, and sets
    /// `build-artifact`.
    fn init_link_target_env(
        &self,
        env: &mut BuildEnv,
        desc: &mut NinjaBuildDesc,
        target: TargetId,
    ) -> Result<()>;

    /// Emits this target's rules. Returning false skips source processing.
    fn init_build_target_rules(
        &self,
        env: &mut BuildEnv,
        desc: &mut NinjaBuildDesc,
        target: TargetId,
    ) -> Result<bool>;

    /// Emits a compile entry for one source file.
    fn process_source_file(
        &self,
        env: &mut BuildEnv,
        desc: &mut NinjaBuildDesc,
        target: TargetId,
        source_index: usize,
    ) -> Result<()>;

    /// Emits the final link/archive entry and registers the artifact path.
    fn create_target_artifact(
        &self,
        env: &mut BuildEnv,
        desc: &mut NinjaBuildDesc,
        target: TargetId,
    ) -> Result<()>;
}
