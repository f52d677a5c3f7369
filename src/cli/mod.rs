//! CLI for shipline
//!
//! - `run`: execute a pipeline definition
//! - `plan`: show which stages the current environment makes eligible
//! - `check`: validate a pipeline definition
//! - `template`: print the reference delivery pipeline as YAML
//! - `completions`: generate shell completions

pub mod check;
pub mod completions;
pub mod plan;
pub mod run;
pub mod template;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use shipline::infrastructure::{Config, init_logging};
use shipline::pipeline::{Environment, LogColor, Pipeline};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

/// CLI arguments for shipline
#[derive(Parser, Debug)]
#[command(name = "shipline")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Tool config file (defaults to ./shipline.yaml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level, overriding the config file
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a pipeline
    Run {
        /// Pipeline definition (YAML)
        file: PathBuf,
        /// Set a run variable, overriding inherited ones
        #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_key_val)]
        env: Vec<(String, String)>,
        /// Do not pass the process environment to the run
        #[arg(long)]
        no_inherit_env: bool,
        /// Exit with status 2 when the run is unstable
        #[arg(long)]
        fail_on_unstable: bool,
        /// Force the run number instead of the next free one
        #[arg(long)]
        run_number: Option<u64>,
        /// Print the run result as JSON on stdout
        #[arg(long)]
        json: bool,
    },

    /// Show which stages would run
    Plan {
        /// Pipeline definition (YAML)
        file: PathBuf,
        /// Set a run variable, overriding inherited ones
        #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_key_val)]
        env: Vec<(String, String)>,
        /// Do not consider the process environment
        #[arg(long)]
        no_inherit_env: bool,
    },

    /// Validate pipeline definitions
    Check {
        /// Pipeline definitions (YAML)
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Print the reference delivery pipeline
    Template {
        /// Project name
        #[arg(short, long, default_value = "app")]
        project: String,
        /// Delivery settings file (YAML), overriding --project
        #[arg(short, long)]
        delivery_config: Option<PathBuf>,
        /// Output file (stdout if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Generate shell completions
    Completions {
        /// Shell type
        #[arg(value_enum)]
        shell: ShellArg,
        /// Output file (stdout if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ShellArg {
    Bash,
    Zsh,
    Fish,
    PowerShell,
}

/// Parses a `KEY=VALUE` argument
fn parse_key_val(arg: &str) -> Result<(String, String), String> {
    let (key, value) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{arg}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty variable name in '{arg}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Variables handed to a run: the process environment unless disabled,
/// then `--env` pairs.
fn run_overrides(inherit: bool, pairs: Vec<(String, String)>) -> Environment {
    let mut env: Environment = if inherit {
        std::env::vars().collect()
    } else {
        Environment::new()
    };
    for (key, value) in pairs {
        env.insert(key, value);
    }
    env
}

fn load_pipeline(file: &Path) -> Result<Pipeline> {
    Pipeline::from_file(file)
        .with_context(|| format!("Failed to load pipeline: {}", file.display()))
}

/// Build the CLI command for completion generation
pub fn build_cli() -> clap::Command {
    Args::command()
}

/// Parse and execute CLI arguments
pub fn run() -> Result<ExitCode> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    let level = args.log_level.as_deref().unwrap_or(&config.log_level);

    match args.command {
        Command::Run {
            file,
            env,
            no_inherit_env,
            fail_on_unstable,
            run_number,
            json,
        } => {
            let pipeline = load_pipeline(&file)?;
            init_logging(level, pipeline.options.log_color, pipeline.options.timestamps);

            let options = run::RunOptions {
                overrides: run_overrides(!no_inherit_env, env),
                run_number,
                fail_on_unstable,
                json,
            };
            return run::run_pipeline(&config, &pipeline, options).map(ExitCode::from);
        }
        Command::Plan {
            file,
            env,
            no_inherit_env,
        } => {
            init_logging(level, LogColor::Auto, false);
            let pipeline = load_pipeline(&file)?;
            let overrides = run_overrides(!no_inherit_env, env);
            let entries = plan::plan(&pipeline, &config.environment, &overrides);
            print!("{}", plan::format_plan(&pipeline, &entries));
        }
        Command::Check { files } => {
            init_logging(level, LogColor::Auto, false);
            let mut failed = 0;
            for file in &files {
                match check::check_pipeline(file) {
                    Ok(summary) => println!("✓ {}: {summary}", file.display()),
                    Err(e) => {
                        failed += 1;
                        eprintln!("✗ {}: {e:#}", file.display());
                    }
                }
            }
            if failed > 0 {
                anyhow::bail!("{failed} of {} pipeline(s) invalid", files.len());
            }
        }
        Command::Template {
            project,
            delivery_config,
            output,
        } => {
            init_logging(level, LogColor::Auto, false);
            let delivery = template::delivery_config(&project, delivery_config.as_deref())?;
            let yaml = template::render(&delivery)?;
            match output {
                Some(path) => template::save(&yaml, &path)?,
                None => print!("{yaml}"),
            }
        }
        Command::Completions { shell, output } => {
            use clap_complete::Shell;

            let shell_enum = match shell {
                ShellArg::Bash => Shell::Bash,
                ShellArg::Zsh => Shell::Zsh,
                ShellArg::Fish => Shell::Fish,
                ShellArg::PowerShell => Shell::PowerShell,
            };

            let completions = completions::generate_completions(shell_enum)?;

            if let Some(output_path) = output {
                completions::save_completions(&completions, &output_path)?;
            } else {
                println!("{completions}");
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
