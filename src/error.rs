// src/error.rs

use std::backtrace::Backtrace;

use thiserror::Error;

fn in_target(kind: &str, target: &Option<String>, message: &str) -> String {
    match target {
        Some(module) => format!("{kind} in target '{module}':\n      {message}"),
        None => format!("{kind}: {message}"),
    }
}

/// The error taxonomy of the engine.
///
/// Every variant captures a backtrace at construction time so that the driver
/// can print the frames leading to the failing call, mirroring the exception
/// model this engine replaces with `Result` propagation.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{}", in_target("TargetLoadError", .target, .message))]
    Load {
        target: Option<String>,
        message: String,
        trace: Box<Backtrace>,
    },

    #[error("{}", in_target("TargetConfigError", .target, .message))]
    Config {
        target: Option<String>,
        message: String,
        trace: Box<Backtrace>,
    },

    #[error("{}", in_target("TargetDependencyError", .target, .message))]
    Dependency {
        target: Option<String>,
        message: String,
        trace: Box<Backtrace>,
    },

    #[error("{}", in_target("TargetUncachedDependencyError", .target, .message))]
    UncachedDependency {
        target: Option<String>,
        message: String,
        trace: Box<Backtrace>,
    },

    #[error("{}", in_target("TargetBuildError", .target, .message))]
    Build {
        target: Option<String>,
        message: String,
        trace: Box<Backtrace>,
    },

    #[error("ProcessRunError: {message}")]
    ProcessRun {
        message: String,
        trace: Box<Backtrace>,
    },

    #[error("VarSubstitutionError: {message}")]
    VarSubstitution {
        message: String,
        trace: Box<Backtrace>,
    },

    #[error("I/O error: {message}")]
    Io {
        message: String,
        trace: Box<Backtrace>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn load(target: Option<String>, message: impl Into<String>) -> Self {
        Self::Load {
            target,
            message: message.into(),
            trace: Box::new(Backtrace::capture()),
        }
    }

    pub fn config(target: Option<String>, message: impl Into<String>) -> Self {
        Self::Config {
            target,
            message: message.into(),
            trace: Box::new(Backtrace::capture()),
        }
    }

    pub fn dependency(target: Option<String>, message: impl Into<String>) -> Self {
        Self::Dependency {
            target,
            message: message.into(),
            trace: Box::new(Backtrace::capture()),
        }
    }

    pub fn uncached_dependency(target: Option<String>, message: impl Into<String>) -> Self {
        Self::UncachedDependency {
            target,
            message: message.into(),
            trace: Box::new(Backtrace::capture()),
        }
    }

    pub fn build(target: Option<String>, message: impl Into<String>) -> Self {
        Self::Build {
            target,
            message: message.into(),
            trace: Box::new(Backtrace::capture()),
        }
    }

    pub fn process_run(message: impl Into<String>) -> Self {
        Self::ProcessRun {
            message: message.into(),
            trace: Box::new(Backtrace::capture()),
        }
    }

    pub fn var_substitution(message: impl Into<String>) -> Self {
        Self::VarSubstitution {
            message: message.into(),
            trace: Box::new(Backtrace::capture()),
        }
    }

    /// The stable name of the error kind, as shown by the driver.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Load { .. } => "TargetLoadError",
            Self::Config { .. } => "TargetConfigError",
            Self::Dependency { .. } => "TargetDependencyError",
            Self::UncachedDependency { .. } => "TargetUncachedDependencyError",
            Self::Build { .. } => "TargetBuildError",
            Self::ProcessRun { .. } => "ProcessRunError",
            Self::VarSubstitution { .. } => "VarSubstitutionError",
            Self::Io { .. } => "IoError",
        }
    }

    /// The module of the target this error is attributed to, when known.
    pub fn target_module(&self) -> Option<&str> {
        match self {
            Self::Load { target, .. }
            | Self::Config { target, .. }
            | Self::Dependency { target, .. }
            | Self::UncachedDependency { target, .. }
            | Self::Build { target, .. } => target.as_deref(),
            _ => None,
        }
    }

    pub fn trace(&self) -> &Backtrace {
        match self {
            Self::Load { trace, .. }
            | Self::Config { trace, .. }
            | Self::Dependency { trace, .. }
            | Self::UncachedDependency { trace, .. }
            | Self::Build { trace, .. }
            | Self::ProcessRun { trace, .. }
            | Self::VarSubstitution { trace, .. }
            | Self::Io { trace, .. } => trace,
        }
    }

    /// The process exit code convention: 5 for uncached dependencies so that
    /// wrapper tooling can re-run with fetching enabled, 1 for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::UncachedDependency { .. } => 5,
            _ => 1,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io {
            message: e.to_string(),
            trace: Box::new(Backtrace::capture()),
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::config(None, format!("YAML error: {e}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::config(None, format!("JSON error: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_errors_mention_the_module() {
        let err = Error::load(Some("myproj.libfoo".to_string()), "target type not specified");
        let text = err.to_string();
        assert!(text.contains("TargetLoadError"));
        assert!(text.contains("myproj.libfoo"));
        assert_eq!(err.target_module(), Some("myproj.libfoo"));
    }

    #[test]
    fn uncached_dependency_exit_code_is_five() {
        let err = Error::uncached_dependency(None, "autoloading is disabled");
        assert_eq!(err.exit_code(), 5);
        assert_eq!(Error::process_run("x failed").exit_code(), 1);
    }
}
