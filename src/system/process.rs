// src/system/process.rs

use std::path::Path;
use std::process::{Command, Stdio};

use crate::error::{Error, Result};

/// Options for a synchronous child process run.
#[derive(Debug, Default, Clone)]
pub struct RunOptions {
    /// Fail with a process-run error on a non-zero exit.
    pub strict: bool,
    /// Directories prepended to PATH for this run only.
    pub extra_path: Vec<String>,
}

fn compose_path(extra: &[String]) -> Option<String> {
    if extra.is_empty() {
        return None;
    }

    let current = std::env::var("PATH").unwrap_or_default();
    let sep = if cfg!(windows) { ';' } else { ':' };
    let mut joined = extra.join(&sep.to_string());
    if !current.is_empty() {
        joined.push(sep);
        joined.push_str(&current);
    }
    Some(joined)
}

/// Runs a program with arguments, inheriting stdio, and waits for it.
///
/// Fails if the process cannot be spawned, or on a non-zero exit when
/// `strict` is set.
pub fn run_process(
    program: &str,
    args: &[String],
    working_dir: &Path,
    opts: &RunOptions,
) -> Result<i32> {
    log::debug!("running process '{program}' with args {args:?}");

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(dunce::simplified(working_dir))
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    if let Some(path) = compose_path(&opts.extra_path) {
        command.env("PATH", path);
    }

    let mut child = command
        .spawn()
        .map_err(|e| Error::process_run(format!("{program} failed to start: {e}")))?;

    let status = child
        .wait()
        .map_err(|e| Error::process_run(format!("{program} failed to run: {e}")))?;

    let exit_code = status.code().unwrap_or(-1);
    if opts.strict && exit_code != 0 {
        return Err(Error::process_run(format!(
            "{program} failed: exit_code={exit_code}"
        )));
    }

    Ok(exit_code)
}

/// Splits a resolved command line and runs it.
pub fn run_command_line(command_line: &str, working_dir: &Path, opts: &RunOptions) -> Result<i32> {
    let parts = shlex::split(command_line).ok_or_else(|| {
        Error::process_run(format!("command could not be parsed: '{command_line}'"))
    })?;

    let Some((program, args)) = parts.split_first() else {
        return Ok(0);
    };

    run_process(program, args, working_dir, opts)
}

/// Passes a resolved command line to the host shell.
pub fn shell_run(command_line: &str, working_dir: &Path, opts: &RunOptions) -> Result<i32> {
    let (shell, flag) = if cfg!(windows) {
        ("cmd", "/C")
    } else {
        ("sh", "-c")
    };

    run_process(
        shell,
        &[flag.to_string(), command_line.to_string()],
        working_dir,
        opts,
    )
}

/// Runs a program and captures its standard output as UTF-8 text.
/// Stderr is passed through to the user's terminal.
pub fn run_and_capture(program: &str, args: &[String], working_dir: &Path) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .current_dir(dunce::simplified(working_dir))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .output()
        .map_err(|e| Error::process_run(format!("{program} failed to start: {e}")))?;

    if !output.status.success() {
        return Err(Error::process_run(format!(
            "{program} failed: exit_code={}",
            output.status.code().unwrap_or(-1)
        )));
    }

    String::from_utf8(output.stdout)
        .map_err(|e| Error::process_run(format!("{program} produced non-UTF-8 output: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_process_output() {
        let out = run_and_capture("echo", &["hello".to_string()], Path::new(".")).unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn strict_mode_rejects_bad_exits() {
        let opts = RunOptions {
            strict: true,
            ..Default::default()
        };
        let err = run_command_line("false", Path::new("."), &opts).unwrap_err();
        assert!(matches!(err, Error::ProcessRun { .. }));

        let lax = RunOptions::default();
        assert_ne!(run_command_line("false", Path::new("."), &lax).unwrap(), 0);
    }

    #[test]
    fn shell_run_uses_the_host_shell() {
        let code = shell_run("exit 0", Path::new("."), &RunOptions::default()).unwrap();
        assert_eq!(code, 0);
    }
}
