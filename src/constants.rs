// src/constants.rs

/// The name of the primary target configuration file in a directory.
pub const TARGET_CONFIG_FILENAME: &str = "re.yml";

/// The suffix of additional configuration partitions merged over `re.yml`.
pub const CONFIG_PARTITION_SUFFIX: &str = ".re.yml";

/// The name of the per-target cached user parameter file.
pub const USER_PARAMS_FILENAME: &str = "re.user.yml";

/// The name of the per-root cache directory for fetched dependencies and metadata.
pub const CACHE_DIR_NAME: &str = ".re-cache";

/// The marker file that excludes a directory from source tree loading.
pub const IGNORE_MARKER_FILENAME: &str = ".re-ignore-this";

/// The name of the persistent dependency version cache (inside .re-cache/).
pub const VERSION_CACHE_FILENAME: &str = "deps-versions.json";

/// The file recording the default tag of a globally installed package.
pub const DEFAULT_TAG_FILENAME: &str = "default-tag.txt";

/// The default output directory name under a root target's path.
pub const DEFAULT_OUT_DIR: &str = "out";

/// The default output directory triplet appended to the out dir.
pub const DEFAULT_OUT_DIR_TRIPLET: &str = "${arch}-${platform}-${configuration}";

/// The default per-target artifact directory format.
pub const DEFAULT_ARTIFACT_DIR: &str = "build/${module}";

/// The default per-target object directory format.
pub const DEFAULT_OBJECT_DIR: &str = "obj/${module}";

/// Maximum recursion depth for variable substitution.
pub const MAX_SUBSTITUTION_DEPTH: u32 = 32;
