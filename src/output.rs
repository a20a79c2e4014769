// src/output.rs

use colored::Colorize;

/// Severity levels of the user-facing output sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OutputLevel {
    Off,
    Problems,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
    All,
}

impl OutputLevel {
    pub fn from_str_or_default(s: &str) -> Self {
        match s {
            "off" => Self::Off,
            "problems" => Self::Problems,
            "error" => Self::Error,
            "warn" => Self::Warn,
            "debug" => Self::Debug,
            "trace" => Self::Trace,
            "all" => Self::All,
            _ => Self::Info,
        }
    }
}

/// A level-filtered, styled output sink.
///
/// Engine code reports progress through this instead of printing directly so
/// that the driver can silence or amplify it uniformly.
#[derive(Debug, Clone)]
pub struct Output {
    level: OutputLevel,
}

impl Default for Output {
    fn default() -> Self {
        Self {
            level: OutputLevel::Info,
        }
    }
}

impl Output {
    pub fn new(level: OutputLevel) -> Self {
        Self { level }
    }

    pub fn level(&self) -> OutputLevel {
        self.level
    }

    fn enabled(&self, level: OutputLevel) -> bool {
        level <= self.level
    }

    pub fn error(&self, text: &str) {
        if self.enabled(OutputLevel::Error) {
            eprint!("{}", text.red().bold());
        }
    }

    pub fn warn(&self, text: &str) {
        if self.enabled(OutputLevel::Warn) {
            eprint!("{}", text.yellow());
        }
    }

    pub fn info(&self, text: &str) {
        if self.enabled(OutputLevel::Info) {
            print!("{text}");
        }
    }

    pub fn info_styled(&self, text: &str) {
        if self.enabled(OutputLevel::Info) {
            print!("{}", text.cyan().bold());
        }
    }

    pub fn debug(&self, text: &str) {
        if self.enabled(OutputLevel::Debug) {
            print!("{}", text.dimmed());
        }
    }

    pub fn trace(&self, text: &str) {
        if self.enabled(OutputLevel::Trace) {
            print!("{}", text.dimmed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered() {
        assert!(OutputLevel::Off < OutputLevel::Error);
        assert!(OutputLevel::Error < OutputLevel::Info);
        assert!(OutputLevel::Info < OutputLevel::Trace);
        assert!(OutputLevel::Trace < OutputLevel::All);
    }

    #[test]
    fn parsing_falls_back_to_info() {
        assert_eq!(OutputLevel::from_str_or_default("warn"), OutputLevel::Warn);
        assert_eq!(
            OutputLevel::from_str_or_default("garbage"),
            OutputLevel::Info
        );
    }
}
