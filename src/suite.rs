//! Test orchestration.
//!
//! A [`TestSuite`] turns a set of compiled test binaries (or ready-made
//! recipes) into run recipes, shuffles them and resolves them all
//! concurrently. Interactive tests run with the terminal held exclusively,
//! which serializes them against each other and against every captured
//! command. Recipe tests run their action under the same guard, shared when
//! they are not interactive. [`stress`] repeats a single test's action to
//! shake out flaky failures.

use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use console::style;
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::config::{DEFAULT_STRESS_CYCLES, Settings};
use crate::context::Context;
use crate::core::Dynamic;
use crate::error::{RecipeError, StressError};
use crate::recipe::Recipe;
use crate::shell::{Mode, Shell};

enum Source {
    Binary(Utf8PathBuf),
    Recipe(Recipe),
}

struct Entry {
    name: String,
    source: Source,
}

/// Collection of tests run under one scheduling policy.
pub struct TestSuite {
    entries: Vec<Entry>,
    interactive: Vec<String>,
    seed: Option<u64>,
    cycles: usize,
    cwd: Option<Utf8PathBuf>,
}

impl Default for TestSuite {
    fn default() -> Self {
        Self::new()
    }
}

impl TestSuite {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            interactive: Vec::new(),
            seed: None,
            cycles: DEFAULT_STRESS_CYCLES,
            cwd: None,
        }
    }

    /// Seed, stress cycles and interactive set taken from `settings`.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            interactive: settings.interactive.clone(),
            seed: settings.seed,
            cycles: settings.stress_cycles,
            ..Self::new()
        }
    }

    /// Adds test executables; each one is named after its file stem.
    pub fn binaries<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Utf8PathBuf>,
    {
        for path in paths {
            let path = path.into();
            let name = path.file_stem().unwrap_or(path.as_str()).to_string();
            self.entries.push(Entry {
                name,
                source: Source::Binary(path),
            });
        }
        self
    }

    /// Adds a ready-made test recipe.
    pub fn recipe(mut self, name: impl Into<String>, recipe: Recipe) -> Self {
        self.entries.push(Entry {
            name: name.into(),
            source: Source::Recipe(recipe),
        });
        self
    }

    /// Names of tests that need the terminal for themselves.
    pub fn interactive<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interactive.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn cycles(mut self, cycles: usize) -> Self {
        self.cycles = cycles;
        self
    }

    /// Working directory of test binaries.
    pub fn cwd(mut self, cwd: impl Into<Utf8PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.name.as_str())
    }

    pub fn is_interactive(&self, name: &str) -> bool {
        self.interactive.iter().any(|item| item == name)
    }

    /// Interned run recipe of test `name`.
    pub fn test(&self, name: &str, ctx: &Context) -> Option<Recipe> {
        self.entries
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| self.run_recipe(entry, ctx))
    }

    fn run_recipe(&self, entry: &Entry, ctx: &Context) -> Recipe {
        let recipe = match &entry.source {
            Source::Recipe(recipe) => self.guarded(&entry.name, ctx.intern(recipe.clone())),
            Source::Binary(path) => {
                let mode = match self.is_interactive(&entry.name) {
                    true => Mode::Interactive,
                    false => Mode::Captured,
                };
                let mut shell = Shell::new("{input}")
                    .arg("input", absolute(path))
                    .mode(mode)
                    .named(entry.name.clone());
                if let Some(cwd) = &self.cwd {
                    shell = shell.cwd(cwd.clone());
                }
                shell.into_recipe()
            }
        };
        ctx.intern(recipe)
    }

    /// Wraps a recipe test so its action runs under the terminal guard: held
    /// exclusively for interactive tests, shared otherwise. Upstream recipes
    /// are resolved before the guard is taken.
    fn guarded(&self, name: &str, test: Recipe) -> Recipe {
        let exclusive = self.is_interactive(name);
        let builder = Recipe::builder(name.to_string())
            .arg(test.sigil())
            .arg(&exclusive);
        let builder = test
            .upstream()
            .fold(builder, |builder, upstream| builder.input(upstream.clone()));

        builder.finish(Arc::new(move |ctx: Context, _: Vec<Dynamic>| {
            let test = test.clone();
            async move {
                let held = ctx.with_terminal_held();
                let output = match exclusive {
                    true => {
                        let _terminal = ctx.terminal().exclusive().await;
                        test.invoke(&held).await
                    }
                    false => {
                        let _terminal = ctx.terminal().shared().await;
                        test.invoke(&held).await
                    }
                };
                Ok::<_, anyhow::Error>(output?)
            }
            .boxed()
        }))
    }

    /// Shuffles the tests and resolves all of them. Returns the first
    /// failure once every started test has finished.
    pub async fn run(&self, ctx: &Context) -> Result<SuiteReport, RecipeError> {
        let mut tests: Vec<(&str, Recipe)> = self
            .entries
            .iter()
            .map(|entry| (entry.name.as_str(), self.run_recipe(entry, ctx)))
            .collect();

        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        tests.shuffle(&mut rng);

        let order: Vec<String> = tests.iter().map(|(name, _)| name.to_string()).collect();
        tracing::info!("Running {} test(s) in order: {}", tests.len(), order.join(", "));

        let start = Instant::now();
        let pending: Vec<BoxFuture<'_, Result<_, RecipeError>>> = tests
            .iter()
            .map(|(_, recipe)| recipe.resolve(ctx))
            .collect();
        let results = join_all(pending).await;

        let mut report = SuiteReport {
            order,
            passed: Vec::new(),
            failed: Vec::new(),
            duration: start.elapsed(),
        };
        let mut first: Option<RecipeError> = None;

        for ((name, _), result) in tests.iter().zip(results) {
            match result {
                Ok(_) => {
                    tracing::info!("{} {name}", style("PASS").green().bold());
                    report.passed.push(name.to_string());
                }
                Err(err) => {
                    tracing::info!("{} {name}", style("FAIL").red().bold());
                    report.failed.push(name.to_string());
                    if first
                        .as_ref()
                        .is_none_or(|first| matches!(first, RecipeError::Aborted(_)))
                    {
                        first = Some(err);
                    }
                }
            }
        }

        match first {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Stress runs test `name` with the configured number of cycles.
    pub async fn stress(&self, name: &str, ctx: &Context) -> Option<Result<StressReport, StressError>> {
        let recipe = self.test(name, ctx)?;
        Some(stress(&recipe, self.cycles, ctx).await)
    }
}

/// Outcome of a suite run.
#[derive(Debug, Clone)]
pub struct SuiteReport {
    /// Test names in the order they were started.
    pub order: Vec<String>,
    pub passed: Vec<String>,
    pub failed: Vec<String>,
    pub duration: Duration,
}

/// Outcome of a successful stress run.
#[derive(Debug, Clone)]
pub struct StressReport {
    pub name: String,
    pub cycles: usize,
    pub duration: Duration,
}

/// Invokes `recipe`'s action `cycles` times in a row, bypassing its memo.
/// Stops at the first failure and reports its 0-based iteration. When the
/// run is already failing nothing more is invoked and the stress run is
/// aborted instead.
pub async fn stress(recipe: &Recipe, cycles: usize, ctx: &Context) -> Result<StressReport, StressError> {
    let name = recipe.name().to_string();
    let start = Instant::now();

    for iteration in 0..cycles {
        tracing::debug!("Stress cycle {}/{cycles} of '{name}'", iteration + 1);

        match recipe.invoke(ctx).await {
            Ok(_) => {}
            Err(RecipeError::Aborted(_)) => {
                tracing::warn!("Stress run of '{name}' aborted after {iteration} cycle(s)");
                return Err(StressError::Aborted {
                    name,
                    completed: iteration,
                    cycles,
                });
            }
            Err(source) => {
                tracing::info!(
                    "{} {name} at iteration {iteration}",
                    style("FAIL").red().bold()
                );
                return Err(StressError::Failed {
                    name,
                    iteration,
                    cycles,
                    source,
                });
            }
        }
    }

    tracing::info!(
        "{} {name} survived {cycles} cycle(s) {}",
        style("PASS").green().bold(),
        crate::utils::as_overhead(start)
    );

    Ok(StressReport {
        name,
        cycles,
        duration: start.elapsed(),
    })
}

fn absolute(path: &Utf8Path) -> Utf8PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .ok()
        .and_then(|dir| Utf8PathBuf::try_from(dir).ok())
        .map(|dir| dir.join(path))
        .unwrap_or_else(|| path.to_path_buf())
}
