// src/ninja.rs

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use crate::desc::NinjaBuildDesc;
use crate::error::Result;

const TOOL_PREFIX: &str = "re_tool_";

/// Renders the build description as ninja build-script text.
pub fn render_build_file(desc: &NinjaBuildDesc) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "builddir = {}", desc.out_dir.display());

    for (key, value) in &desc.init_vars {
        let _ = writeln!(out, "{key} = {value}");
    }
    for (key, value) in &desc.vars {
        let _ = writeln!(out, "{key} = {value}");
    }
    out.push('\n');

    for tool in &desc.tools {
        let _ = writeln!(out, "{TOOL_PREFIX}{} = {}", tool.name, tool.path);
    }
    out.push('\n');

    for rule in &desc.rules {
        let _ = writeln!(out, "rule {}", rule.name);
        let _ = writeln!(out, "    command = ${TOOL_PREFIX}{} {}", rule.tool, rule.cmdline);
        let _ = writeln!(out, "    description = {}", rule.description);
        for (key, value) in &rule.vars {
            let _ = writeln!(out, "    {key} = {value}");
        }
    }
    out.push('\n');

    for entry in &desc.entries {
        let _ = write!(out, "build {}: {} {}", entry.output, entry.rule, entry.input);
        if !entry.deps.is_empty() {
            let _ = write!(out, " |");
            for dep in &entry.deps {
                let _ = write!(out, " {dep}");
            }
        }
        out.push('\n');
        for (key, value) in &entry.vars {
            let _ = writeln!(out, "    {key} = {value}");
        }
    }
    out.push('\n');

    for subninja in &desc.subninjas {
        let _ = writeln!(out, "subninja {subninja}");
    }

    out
}

/// Writes `build.ninja` into the output directory.
pub fn generate_build_file(desc: &NinjaBuildDesc, out_dir: &Path) -> Result<()> {
    fs::create_dir_all(out_dir)?;
    fs::write(out_dir.join("build.ninja"), render_build_file(desc))?;
    Ok(())
}
