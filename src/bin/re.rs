// src/bin/re.rs

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use re::context::BuildContext;
use re::error::Error;
use re::output::{Output, OutputLevel};
use re::system::process::{self, RunOptions};
use re::target::{TargetId, TargetType, create_empty_target};

#[derive(Parser)]
#[command(name = "re", version, about = "A declarative, polyglot build orchestrator.")]
struct Cli {
    /// Output verbosity: off, problems, error, warn, info, debug, trace, all.
    #[arg(long, default_value = "info", global = true)]
    verbosity: String,

    /// Data directory holding toolchain environments and the core project.
    #[arg(long, global = true)]
    data_path: Option<PathBuf>,

    /// Build variable overrides, e.g. --var arch=arm64.
    #[arg(long = "var", value_name = "KEY=VALUE", global = true)]
    vars: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve the target graph and build it with the external executor.
    Build {
        /// The target directory (defaults to the current directory).
        path: Option<PathBuf>,
    },
    /// Build, then copy artifacts to the configured install locations.
    Install {
        path: Option<PathBuf>,
    },
    /// Only generate the build script and meta record.
    Describe {
        path: Option<PathBuf>,
    },
    /// Build, then run the produced executable artifact.
    Run {
        path: Option<PathBuf>,
        /// Arguments forwarded to the program.
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Build, running the named structured task category around it.
    Do {
        /// The task / action category to run.
        category: String,
        path: Option<PathBuf>,
    },
    /// Scaffold a new target directory with a minimal config.
    New {
        /// The target type: project, executable, static-library,
        /// shared-library or custom.
        #[arg(value_name = "TYPE")]
        target_type: String,
        name: String,
        /// Destination directory (defaults to the target name).
        path: Option<PathBuf>,
    },
    /// Show the resolved target tree and its dependency edges.
    Tree {
        path: Option<PathBuf>,
    },
}

impl Commands {
    fn path(&self) -> PathBuf {
        let path = match self {
            Self::Build { path }
            | Self::Install { path }
            | Self::Describe { path }
            | Self::Run { path, .. }
            | Self::Do { path, .. }
            | Self::Tree { path } => path.clone(),
            Self::New { .. } => None,
        };
        path.unwrap_or_else(|| PathBuf::from("."))
    }
}

fn prepare(cli: &Cli) -> Result<(BuildContext, TargetId, PathBuf), Error> {
    let out = Output::new(OutputLevel::from_str_or_default(&cli.verbosity));
    let mut ctx = BuildContext::new(out, cli.data_path.clone());
    ctx.load_default_environment()?;

    let path = cli.command.path();
    ctx.load_cached_params(&path)?;

    for var in &cli.vars {
        if let Some((key, value)) = var.split_once('=') {
            ctx.set_var(key, value);
        }
    }

    ctx.load_version_cache(&path)?;
    let target = ctx.load_target(&path)?;
    Ok((ctx, target, path))
}

fn run_artifact(
    ctx: &mut BuildContext,
    target: TargetId,
    desc: &re::desc::NinjaBuildDesc,
    args: &[String],
) -> Result<(), Error> {
    let run_target = desc
        .artifacts
        .keys()
        .copied()
        .find(|t| ctx.env().target(*t).ty == TargetType::Executable && *t == target)
        .or_else(|| {
            desc.artifacts
                .keys()
                .copied()
                .find(|t| ctx.env().target(*t).ty == TargetType::Executable)
        })
        .ok_or_else(|| {
            Error::build(
                Some(ctx.env().target(target).module.clone()),
                "this target does not provide any artifacts".to_string(),
            )
        })?;

    // Artifact paths are stored as templates over the target's build scope.
    let template = desc.artifacts[&run_target].to_string_lossy().to_string();
    let artifact = ctx.env().scope_views(run_target).resolve(&template)?;

    let cwd = ctx.env().target(run_target).path.clone();
    process::run_process(
        &artifact,
        args,
        &cwd,
        &RunOptions {
            strict: true,
            ..Default::default()
        },
    )?;
    Ok(())
}

fn run(cli: &Cli) -> Result<(), Error> {
    if let Commands::New {
        target_type,
        name,
        path,
    } = &cli.command
    {
        let ty = TargetType::from_config_str(target_type)?;
        let dir = path
            .clone()
            .unwrap_or_else(|| PathBuf::from(name.trim_start_matches('.')));

        create_empty_target(&dir, ty, name)?;

        println!();
        println!(
            "Created new {target_type} target '{name}' in directory '{}'.",
            dir.display()
        );
        println!();
        println!("    To build the new target, type:");
        println!("        > cd {}", dir.display());
        println!("        > re build");
        println!();
        println!(
            "    To edit the new target, modify the {}/re.yml file.",
            dir.display()
        );
        println!();
        return Ok(());
    }

    let (mut ctx, target, path) = prepare(cli)?;

    let desc = ctx.generate_build_desc(target)?;
    ctx.save_version_cache(&path)?;

    match &cli.command {
        Commands::Describe { .. } => {
            re::ninja::generate_build_file(&desc, &desc.out_dir)?;
            ctx.save_target_meta(&desc)?;
        }
        Commands::Build { .. } => {
            ctx.build_target(&desc)?;
        }
        Commands::Install { .. } => {
            ctx.build_target(&desc)?;
            ctx.install_target(&desc)?;
        }
        Commands::Run { args, .. } => {
            ctx.build_target(&desc)?;
            run_artifact(&mut ctx, target, &desc, args)?;
        }
        Commands::Do { category, .. } => {
            let deps = ctx.env_mut().single_target_dep_set(target)?;

            for dep in &deps {
                ctx.env_mut()
                    .run_structured_task(*dep, Some(&desc), category, "pre-build")?;
            }

            ctx.build_target(&desc)?;

            for dep in &deps {
                ctx.env_mut()
                    .run_structured_task(*dep, Some(&desc), category, "post-build")?;
                ctx.env_mut()
                    .run_actions_categorized(*dep, Some(&desc), category)?;
            }
        }
        Commands::Tree { .. } => {
            print!("{}", ctx.env().render_build_info());
        }
        Commands::New { .. } => unreachable!(),
    }

    Ok(())
}

fn report(err: &Error) {
    eprintln!("\n  Error: {err}");

    if let Some(module) = err.target_module() {
        eprintln!("  Target: {module}");
    }

    // Only engine frames are worth showing to the user.
    let trace = err.trace().to_string();
    let frames: Vec<&str> = trace
        .lines()
        .filter(|line| line.contains("re::"))
        .collect();
    if !frames.is_empty() {
        eprintln!("\n  at:");
        for frame in frames {
            eprintln!("  {}", frame.trim());
        }
    }
    eprintln!();
}

fn main() -> ExitCode {
    env_logger::init();

    let cli = Cli::parse();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err);
            ExitCode::from(err.exit_code() as u8)
        }
    }
}
