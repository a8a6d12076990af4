use std::{path::PathBuf, str::FromStr};

use clap::{Parser, Subcommand};
use precision::MixedPrecision;
use registry::{parse_override_value, ConfigDict};
use training::{
    build_optimizer, build_runner, optimizer_builders, optimizers, runner_builders, runners,
    NamedParameters, RunnerDefaults, TrainingError,
};

fn main() {
    if let Err(err) = run() {
        eprintln!("registry check failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Inspect registries and validate builder configs", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every registered name.
    List,
    /// Build the `optimizer` and `runner` sections of a config file.
    Check {
        #[arg(
            short,
            long,
            value_name = "PATH",
            help = "Path to a TOML or JSON config file"
        )]
        config: PathBuf,

        #[arg(
            long = "override",
            value_name = "KEY=VALUE",
            help = "Override configuration value using dot-separated paths"
        )]
        overrides: Vec<OverrideArg>,
    },
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();
    match args.command {
        Command::List => {
            print_names(optimizers().name(), optimizers().names());
            print_names(optimizer_builders().name(), optimizer_builders().names());
            print_names(runners().name(), runners().names());
            print_names(runner_builders().name(), runner_builders().names());
            Ok(())
        }
        Command::Check { config, overrides } => check(config, &overrides),
    }
}

fn print_names(registry: &str, names: Vec<String>) {
    println!("{} ({})", registry, names.len());
    for name in names {
        println!("  {}", name);
    }
}

fn check(path: PathBuf, overrides: &[OverrideArg]) -> Result<(), TrainingError> {
    let mut config = ConfigDict::from_path(&path)?;
    for override_arg in overrides {
        config.set_path(&override_arg.path, parse_override_value(&override_arg.value))?;
    }

    let mut defaults = RunnerDefaults::new();
    if let Some(optimizer_cfg) = config.section("optimizer")? {
        let model: Vec<(String, candle_core::Var)> = Vec::new();
        let optimizer = build_optimizer(&model as &dyn NamedParameters, &optimizer_cfg)?;
        println!(
            "optimizer: {} (lr {})",
            optimizer.name(),
            optimizer.learning_rate()
        );
        defaults = defaults.with_optimizer(optimizer);
    }

    if let Some(mut runner_cfg) = config.section("runner")? {
        // Checking a config must not create the run directory.
        if let Some(work_dir) = runner_cfg.remove("work_dir") {
            println!("runner: work_dir {} not created", work_dir);
        }
        let runner = build_runner(&runner_cfg, Some(defaults))?;
        let limit = match (runner.max_epochs(), runner.max_iters()) {
            (Some(epochs), _) => format!("{} epochs", epochs),
            (_, Some(iters)) => format!("{} iters", iters),
            _ => "unbounded".to_string(),
        };
        println!(
            "runner: {} ({}, fp16 {})",
            runner.name(),
            limit,
            if runner.fp16_enabled() { "on" } else { "off" }
        );
    }

    println!("{} is valid", path.display());
    Ok(())
}
