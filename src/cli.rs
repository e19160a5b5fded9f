//! Command line front end of a build script.
//!
//! A build script declares its producers and environment defaults, then
//! hands both to [`main`]:
//!
//! ```rust,no_run
//! use bakery::{Environment, Registry};
//!
//! fn main() -> std::process::ExitCode {
//!     let mut registry = Registry::new();
//!     registry.target("hello").default().run(|_| async { Ok(()) });
//!
//!     bakery::cli::main(registry, Environment::builder().default("CC", "cc"))
//! }
//! ```

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::{ArgAction, Parser};
use console::style;

use crate::config::{SEED, STRESS, STRESS_CYCLES, Settings};
use crate::env::EnvBuilder;
use crate::error::{BakeryError, ConfigError};
use crate::registry::Registry;
use crate::scheduler::{Options, Scheduler};
use crate::utils::as_overhead;

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "bake", version, about = "Runs a target of this build script")]
pub struct Args {
    /// Target to run, the default target when omitted.
    pub target: Option<String>,

    /// Revert the target's side effects instead of producing them.
    #[arg(short, long)]
    pub clean: bool,

    /// Override an environment value.
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// List the declared producers and exit.
    #[arg(short, long)]
    pub list: bool,

    /// Print the dependency graph as a Mermaid diagram and exit.
    #[arg(long)]
    pub graph: bool,

    /// After the run, print the dependency graph as a Mermaid diagram
    /// colored by how long each producer took.
    #[arg(long)]
    pub timings: bool,

    /// Print the resolved environment as JSON and exit.
    #[arg(long)]
    pub print_env: bool,

    /// Repeat a single test instead of running the whole suite.
    #[arg(long, value_name = "TEST")]
    pub stress: Option<String>,

    /// Number of repetitions in stress mode.
    #[arg(long)]
    pub cycles: Option<usize>,

    /// Seed for the test order shuffle.
    #[arg(long)]
    pub seed: Option<u64>,

    /// More output, repeat for even more.
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    /// Every environment override given on the command line, dedicated
    /// flags included, as `KEY=VALUE` pairs.
    pub fn overrides(&self) -> Vec<String> {
        let mut pairs = self.env.clone();
        if let Some(test) = &self.stress {
            pairs.push(format!("{STRESS}={test}"));
        }
        if let Some(cycles) = self.cycles {
            pairs.push(format!("{STRESS_CYCLES}={cycles}"));
        }
        if let Some(seed) = self.seed {
            pairs.push(format!("{SEED}={seed}"));
        }
        pairs
    }
}

/// Parses the process arguments and runs the build script.
pub fn main(registry: Registry, env: EnvBuilder) -> ExitCode {
    let args = Args::parse();

    match bake(registry, env, args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(BakeryError::Logging(err)) => {
            eprintln!("{} {err}", style("error:").red().bold());
            ExitCode::FAILURE
        }
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::from(u8::try_from(err.exit_code()).unwrap_or(1))
        }
    }
}

/// Runs the build script with already parsed arguments.
pub fn bake(registry: Registry, env: EnvBuilder, args: Args) -> Result<(), BakeryError> {
    #[cfg(feature = "logging")]
    crate::utils::init_logging(args.verbose)?;

    let env = env.cli_overrides(args.overrides())?.build();
    Settings::from_env(&env)?;

    if args.print_env {
        println!("{}", env.to_json().map_err(ConfigError::Json)?);
        return Ok(());
    }

    let graph = registry.finish(&env)?;

    if args.list {
        for producer in graph.producers() {
            let marker = match graph.default_target() == Some(producer.name()) {
                true => " (default)",
                false => "",
            };
            println!("{:<8} {}{marker}", producer.kind(), producer.name());
        }
        return Ok(());
    }

    if args.graph {
        print!("{graph}");
        return Ok(());
    }

    let mode = match args.clean {
        true => "clean",
        false => "build",
    };
    eprintln!(
        "Running {} in {} mode.",
        style("bakery").red(),
        style(mode).blue()
    );

    let s = Instant::now();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let scheduler = Scheduler::new(graph, Arc::new(env));
    let options = Options { clean: args.clean };
    let cancel = scheduler.context().cancel_token();

    let report = runtime.block_on(async {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
                tracing::warn!("Interrupted, stopping running commands");
            }
        });

        scheduler.run(args.target.as_deref(), &options).await
    })?;

    tracing::debug!("Producer timings:\n{}", report.diagnostics);
    if args.timings {
        print!("{}", report.diagnostics.render_mermaid(scheduler.graph()));
    }

    match report.clean {
        Some(clean) => tracing::info!(
            "Cleaned {} recipe(s) of '{}', {} failed {}",
            clean.cleaned.len(),
            report.target,
            clean.failed.len(),
            as_overhead(s)
        ),
        None => tracing::info!("Baked '{}' {}", report.target, as_overhead(s)),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_command_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_flags() {
        let args = Args::parse_from([
            "bake", "install", "-c", "--env", "CC=g++", "--env", "PREFIX=/opt", "-vv",
        ]);
        assert_eq!(args.target.as_deref(), Some("install"));
        assert!(args.clean);
        assert_eq!(args.env, vec!["CC=g++", "PREFIX=/opt"]);
        assert_eq!(args.verbose, 2);
        assert!(!args.timings);
    }

    #[test]
    fn test_parse_timings() {
        let args = Args::parse_from(["bake", "--timings", "test"]);
        assert!(args.timings);
        assert_eq!(args.target.as_deref(), Some("test"));
    }

    #[test]
    fn test_overrides_include_test_flags() {
        let args = Args::parse_from(["bake", "--stress", "json", "--cycles", "50", "--seed", "3"]);
        assert_eq!(
            args.overrides(),
            vec!["STRESS=json", "STRESS_CYCLES=50", "SEED=3"]
        );
        assert_eq!(args.target, None);
    }
}
