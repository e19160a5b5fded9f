//! Dependency resolver and scheduler.
//!
//! A run starts at one target and walks its transitive dependencies. Every
//! node is evaluated at most once per run: its future is memoized and shared
//! by all dependents. Independent dependencies are awaited together (fan-out)
//! and the producer only runs once all of them succeeded (fan-in).
//!
//! The first failure closes the run's gate. Work already in flight finishes,
//! nothing new starts, and the run reports that originating failure.
//!
//! In clean mode the same closure is walked root to leaf and every recipe
//! met along the way is cleaned instead of resolved.

mod diagnostics;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared, join_all};
use petgraph::graph::NodeIndex;
use tracing::{Instrument, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::context::{Context, Inputs, Trip};
use crate::core::{ArcStr, Dynamic, Sigil};
use crate::env::Environment;
use crate::error::{Cause, RecipeError, RunError};
use crate::recipe::{Recipe, Status};
use crate::registry::{Body, Dep, Factory, Graph, Node, PathFn, RunFn};
use crate::utils;

pub use diagnostics::{Diagnostics, Execution};

#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// Revert side effects instead of producing them.
    pub clean: bool,
}

/// Outcome of a clean traversal. Clean is best-effort, failures are listed
/// here and logged but never abort the traversal.
#[derive(Debug, Default)]
pub struct CleanReport {
    pub cleaned: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
}

/// Result of a successful run.
#[derive(Debug)]
pub struct Report {
    pub target: String,
    /// Value of the target; `None` in clean mode.
    pub value: Option<Dynamic>,
    pub diagnostics: Diagnostics,
    pub clean: Option<CleanReport>,
}

/// Executes a validated [`Graph`].
///
/// The scheduler owns the [`Context`] shared by all of its runs, so recipes
/// completed in one run stay completed in the next. Failed recipes are reset
/// at the start of each run.
pub struct Scheduler {
    graph: Arc<Graph>,
    ctx: Context,
    targets: Arc<Mutex<HashMap<NodeIndex, Recipe>>>,
    products: Arc<Mutex<HashMap<NodeIndex, Vec<Recipe>>>>,
}

impl Scheduler {
    pub fn new(graph: Graph, env: Arc<Environment>) -> Self {
        Self::with_context(graph, Context::new(env))
    }

    pub fn with_context(graph: Graph, ctx: Context) -> Self {
        Self {
            graph: Arc::new(graph),
            ctx,
            targets: Default::default(),
            products: Default::default(),
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Runs `target`, or the default target when `None`.
    pub async fn run(&self, target: Option<&str>, options: &Options) -> Result<Report, RunError> {
        let root = self.graph.target(target)?;
        let name = self.graph.node(root).producer.name().to_string();
        let closure = self.graph.closure(root);

        let ctx = self.ctx.for_run();
        ctx.cookbook().reset_failed();

        let span = tracing::info_span!("run", target = %name);
        span.pb_set_length(closure.len() as u64);
        span.pb_set_style(utils::run_style());
        span.pb_set_message(match options.clean {
            true => "Cleaning...",
            false => "Baking...",
        });

        let run = Arc::new(Run {
            graph: self.graph.clone(),
            ctx,
            targets: self.targets.clone(),
            products: self.products.clone(),
            memo: Default::default(),
            times: Default::default(),
            span: span.clone(),
        });

        if options.clean {
            let clean = run.clean(&closure).instrument(span).await;
            return Ok(Report {
                target: name,
                value: None,
                diagnostics: run.diagnostics(),
                clean: Some(clean),
            });
        }

        let result = run.node(root).instrument(span).await;

        match result {
            Ok(value) => {
                tracing::info!("Finished '{name}'");
                Ok(Report {
                    target: name,
                    value: Some(value),
                    diagnostics: run.diagnostics(),
                    clean: None,
                })
            }
            Err(failure) => Err(run.first_failure().unwrap_or(failure).into()),
        }
    }
}

/// Cloneable failure carried through the shared node futures.
#[derive(Debug, Clone)]
enum Failure {
    Producer { name: ArcStr, cause: Cause },
    Recipe { name: ArcStr, source: RecipeError },
    Aborted(ArcStr),
}

impl Failure {
    fn from_recipe(name: ArcStr, source: RecipeError) -> Self {
        match source {
            RecipeError::Aborted(_) => Failure::Aborted(name),
            source => Failure::Recipe { name, source },
        }
    }
}

impl From<Failure> for RunError {
    fn from(value: Failure) -> Self {
        match value {
            Failure::Producer { name, cause } => RunError::Producer {
                name: name.to_string(),
                cause,
            },
            Failure::Recipe { name, source } => RunError::Recipe {
                name: name.to_string(),
                source,
            },
            Failure::Aborted(name) => RunError::Aborted(name.to_string()),
        }
    }
}

type NodeFuture = Shared<BoxFuture<'static, Result<Dynamic, Failure>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Run {
    graph: Arc<Graph>,
    ctx: Context,
    targets: Arc<Mutex<HashMap<NodeIndex, Recipe>>>,
    products: Arc<Mutex<HashMap<NodeIndex, Vec<Recipe>>>>,
    memo: Mutex<HashMap<NodeIndex, NodeFuture>>,
    times: Mutex<HashMap<String, Execution>>,
    span: Span,
}

impl Run {
    fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            execution_times: std::mem::take(&mut *lock(&self.times)),
        }
    }

    /// Memoized evaluation of a node.
    fn node(self: &Arc<Self>, index: NodeIndex) -> NodeFuture {
        lock(&self.memo)
            .entry(index)
            .or_insert_with(|| self.clone().evaluate(index).boxed().shared())
            .clone()
    }

    async fn evaluate(self: Arc<Self>, index: NodeIndex) -> Result<Dynamic, Failure> {
        let node = self.graph.node(index);
        let name = node.producer.label();

        // fan-out
        let pending: Vec<NodeFuture> = node
            .deps
            .iter()
            .filter_map(|dep| match dep {
                Dep::Producer(_, index) => Some(self.node(*index)),
                Dep::Env(_) => None,
            })
            .collect();

        // fan-in
        let mut results = join_all(pending).await.into_iter();

        let mut values = BTreeMap::new();
        let mut failure: Option<Failure> = None;

        for dep in &node.deps {
            match dep {
                Dep::Producer(key, _) => match results.next() {
                    Some(Ok(value)) => {
                        values.insert(key.clone(), value);
                    }
                    Some(Err(err)) => {
                        if failure.as_ref().is_none_or(|f| matches!(f, Failure::Aborted(_))) {
                            failure = Some(err);
                        }
                    }
                    None => {}
                },
                Dep::Env(key) => {
                    if let Some(value) = self.ctx.env().get(key) {
                        values.insert(key.clone(), Arc::new(value.clone()) as Dynamic);
                    }
                }
            }
        }

        if let Some(failure) = failure {
            return Err(failure);
        }

        if self.ctx.gate().is_tripped() {
            return Err(Failure::Aborted(name));
        }

        let span = tracing::info_span!("producer", name = %name);
        span.pb_set_style(utils::step_style());
        span.pb_set_message(&node.producer.kind().to_string());

        let start = Instant::now();
        let inputs = Inputs::new(values, self.ctx.for_producer(name.clone()));
        let result = self.invoke(index, node, inputs).instrument(span).await;

        lock(&self.times).insert(
            name.to_string(),
            Execution {
                start,
                duration: start.elapsed(),
            },
        );
        self.span.pb_inc(1);

        result.map_err(|failure| self.record(failure))
    }

    async fn invoke(&self, index: NodeIndex, node: &Node, inputs: Inputs) -> Result<Dynamic, Failure> {
        let name = node.producer.label();
        let ctx = inputs.context().clone();

        match node.producer.body() {
            Body::Provide(run) => {
                tracing::debug!("Providing '{name}'");
                let value = run(inputs).await.map_err(|cause| Failure::Producer {
                    name: name.clone(),
                    cause: Cause::new(cause),
                })?;
                self.expand(index, &name, value, &ctx).await
            }
            Body::Target { run, produces, .. } => {
                tracing::info!("Running '{name}'");
                let start = Instant::now();
                let recipe = self.target_recipe(index, &name, run, produces.as_ref(), inputs);
                let value = recipe
                    .resolve(&ctx)
                    .await
                    .map_err(|err| Failure::from_recipe(name.clone(), err))?;
                let value = self.expand(index, &name, value, &ctx).await?;
                tracing::info!("Finished '{name}' {}", utils::as_overhead(start));
                Ok(value)
            }
            Body::Recipe(make) => Ok(Arc::new(Factory::new(name, inputs, make.clone()))),
        }
    }

    /// The recipe wrapping a target's body. A target completed in an earlier
    /// run of the same scheduler is reused.
    fn target_recipe(
        &self,
        index: NodeIndex,
        name: &ArcStr,
        run: &RunFn,
        produces: Option<&PathFn>,
        inputs: Inputs,
    ) -> Recipe {
        let mut targets = lock(&self.targets);
        if let Some(recipe) = targets.get(&index)
            && recipe.status() == Status::Done
        {
            return recipe.clone();
        }

        let recipe = target_recipe(name, run, produces, inputs);
        targets.insert(index, recipe.clone());
        recipe
    }

    /// Recipes returned by a producer are interned and resolved; dependents
    /// see their outputs.
    async fn expand(
        &self,
        index: NodeIndex,
        name: &ArcStr,
        value: Dynamic,
        ctx: &Context,
    ) -> Result<Dynamic, Failure> {
        let Some(recipes) = products_of(&value) else {
            return Ok(value);
        };

        let recipes: Vec<Recipe> = recipes.into_iter().map(|r| ctx.intern(r)).collect();
        lock(&self.products).insert(index, recipes.clone());

        let pending: Vec<BoxFuture<'_, Result<Dynamic, RecipeError>>> =
            recipes.iter().map(|recipe| recipe.resolve(ctx)).collect();

        let mut outputs = Vec::with_capacity(pending.len());
        let mut aborted = false;

        for result in join_all(pending).await {
            match result {
                Ok(output) => outputs.push(output),
                Err(RecipeError::Aborted(_)) => aborted = true,
                Err(err) => return Err(Failure::from_recipe(name.clone(), err)),
            }
        }

        if aborted {
            return Err(Failure::Aborted(name.clone()));
        }

        if value.is::<Recipe>()
            && let Some(output) = outputs.pop()
        {
            return Ok(output);
        }

        Ok(Arc::new(outputs))
    }

    /// Closes the gate on a real failure. Recipe failures already closed it
    /// when their action failed, so only the first one is kept.
    fn record(&self, failure: Failure) -> Failure {
        match &failure {
            Failure::Producer { name, cause } => self.ctx.gate().trip_with(Trip::Producer {
                name: name.clone(),
                cause: cause.clone(),
            }),
            Failure::Recipe { name, source } => self.ctx.gate().trip_with(Trip::Recipe {
                owner: Some(name.clone()),
                source: source.clone(),
            }),
            Failure::Aborted(_) => {}
        }
        failure
    }

    /// The failure that closed the gate, attributed to its producer.
    fn first_failure(&self) -> Option<Failure> {
        match self.ctx.gate().first()? {
            Trip::Producer { name, cause } => Some(Failure::Producer { name, cause }),
            Trip::Recipe {
                owner: Some(name),
                source,
            } => Some(Failure::Recipe { name, source }),
            Trip::Recipe { owner: None, .. } => None,
        }
    }

    /// Clean traversal over `closure` (dependencies first).
    ///
    /// Providers and factories are evaluated to discover the recipes they
    /// describe, without resolving anything. Targets are not invoked, so
    /// producers that depend on a target are skipped. Then the closure is
    /// walked root to leaf and every recipe found is cleaned once.
    async fn clean(&self, closure: &[NodeIndex]) -> CleanReport {
        let mut report = CleanReport::default();
        let mut values: HashMap<NodeIndex, Dynamic> = HashMap::new();
        let mut targets: HashMap<NodeIndex, Recipe> = HashMap::new();
        let mut products: HashMap<NodeIndex, Vec<Recipe>> = HashMap::new();

        for &index in closure {
            let node = self.graph.node(index);
            let name = node.producer.label();
            let inputs = self.clean_inputs(node, &values);

            match node.producer.body() {
                Body::Provide(run) => {
                    let Some(inputs) = inputs else {
                        tracing::debug!("Skipping '{name}', it depends on a target");
                        report.skipped.push(name.to_string());
                        continue;
                    };
                    match run(inputs).await {
                        Ok(value) => {
                            let value = match products_of(&value) {
                                Some(recipes) => {
                                    let recipes: Vec<Recipe> =
                                        recipes.into_iter().map(|r| self.ctx.intern(r)).collect();
                                    let mut outputs: Vec<Dynamic> =
                                        recipes.iter().map(planned_output).collect();
                                    products.insert(index, recipes);
                                    match (value.is::<Recipe>(), outputs.pop()) {
                                        (true, Some(output)) => output,
                                        (_, last) => {
                                            outputs.extend(last);
                                            Arc::new(outputs) as Dynamic
                                        }
                                    }
                                }
                                None => value,
                            };
                            values.insert(index, value);
                        }
                        Err(err) => {
                            tracing::warn!("Provider '{name}' failed during clean: {err:#}");
                            report.skipped.push(name.to_string());
                        }
                    }
                }
                Body::Recipe(make) => {
                    if let Some(inputs) = inputs {
                        values.insert(index, Arc::new(Factory::new(name, inputs, make.clone())));
                    }
                }
                Body::Target { run, produces, .. } => {
                    let known = lock(&self.targets).get(&index).cloned();
                    let recipe = match (known, inputs) {
                        (Some(recipe), _) => Some(recipe),
                        (None, Some(inputs)) => {
                            Some(target_recipe(&name, run, produces.as_ref(), inputs))
                        }
                        (None, None) => None,
                    };
                    if let Some(recipe) = recipe {
                        targets.insert(index, recipe);
                    }
                }
            }
            self.span.pb_inc(1);
        }

        let mut seen = HashSet::new();

        for &index in closure.iter().rev() {
            let producer = &self.graph.node(index).producer;

            match producer.body() {
                Body::Target { noclean, .. } => {
                    if let Some(recipe) = targets.get(&index) {
                        if *noclean {
                            tracing::debug!("'{}' is noclean", producer.name());
                        } else {
                            self.clean_recipe(recipe, &mut seen, &mut report, false).await;
                        }
                    }

                    let nested = lock(&self.products).get(&index).cloned().unwrap_or_default();
                    for recipe in &nested {
                        self.clean_recipe(recipe, &mut seen, &mut report, true).await;
                    }
                }
                Body::Provide(_) => {
                    for recipe in products.get(&index).into_iter().flatten() {
                        self.clean_recipe(recipe, &mut seen, &mut report, true).await;
                    }
                }
                Body::Recipe(_) => {}
            }
        }

        tracing::info!(
            "Cleaned {} recipe(s), {} failed",
            report.cleaned.len(),
            report.failed.len()
        );
        report
    }

    fn clean_inputs(&self, node: &Node, values: &HashMap<NodeIndex, Dynamic>) -> Option<Inputs> {
        let mut inputs = BTreeMap::new();
        for dep in &node.deps {
            match dep {
                Dep::Producer(key, index) => {
                    inputs.insert(key.clone(), values.get(index)?.clone());
                }
                Dep::Env(key) => {
                    let value = self.ctx.env().get(key)?;
                    inputs.insert(key.clone(), Arc::new(value.clone()) as Dynamic);
                }
            }
        }
        Some(Inputs::new(inputs, self.ctx.clone()))
    }

    /// Cleans `recipe`, then its upstream recipes when `recursive`.
    fn clean_recipe<'a>(
        &'a self,
        recipe: &'a Recipe,
        seen: &'a mut HashSet<Sigil>,
        report: &'a mut CleanReport,
        recursive: bool,
    ) -> BoxFuture<'a, ()> {
        async move {
            if !seen.insert(recipe.sigil().clone()) {
                return;
            }

            match recipe.clean(&self.ctx).await {
                Ok(true) => report.cleaned.push(recipe.sigil().to_string()),
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!("{err}");
                    report.failed.push(recipe.sigil().to_string());
                }
            }

            if recursive {
                for upstream in recipe.upstream() {
                    self.clean_recipe(upstream, seen, report, true).await;
                }
            }
        }
        .boxed()
    }
}

fn target_recipe(name: &ArcStr, run: &RunFn, produces: Option<&PathFn>, inputs: Inputs) -> Recipe {
    let builder = Recipe::builder(name.clone()).arg(&());
    let builder = match produces.and_then(|produces| produces(&inputs)) {
        Some(path) => builder.output(path),
        None => builder.clean(|_, output| async move { remove_returned(&output) }),
    };

    let run = run.clone();
    builder.finish(Arc::new(move |_, _| run(inputs.clone())))
}

/// Inverse of a target that declared no artifact: paths it returned are
/// removed.
fn remove_returned(output: &Dynamic) -> anyhow::Result<()> {
    if let Some(path) = output.downcast_ref::<camino::Utf8PathBuf>() {
        crate::recipe::remove_artifact(path, true)?;
    } else if let Some(paths) = output.downcast_ref::<Vec<camino::Utf8PathBuf>>() {
        for path in paths {
            crate::recipe::remove_artifact(path, true)?;
        }
    }
    Ok(())
}

fn products_of(value: &Dynamic) -> Option<Vec<Recipe>> {
    if let Some(recipe) = value.downcast_ref::<Recipe>() {
        return Some(vec![recipe.clone()]);
    }
    value.downcast_ref::<Vec<Recipe>>().cloned()
}

/// What a recipe will produce, for dependents evaluated during clean.
fn planned_output(recipe: &Recipe) -> Dynamic {
    match recipe.output_path() {
        Some(path) => Arc::new(path.to_path_buf()),
        None => recipe.output().unwrap_or_else(|| Arc::new(recipe.clone())),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use camino::Utf8PathBuf;

    use super::*;
    use crate::registry::Registry;

    fn env() -> Arc<Environment> {
        Arc::new(
            Environment::builder()
                .default("PREFIX", "/usr/local")
                .process_vars(Vec::<(String, String)>::new())
                .build(),
        )
    }

    fn scheduler(registry: Registry) -> Scheduler {
        let env = env();
        let graph = registry.finish(&env).unwrap();
        Scheduler::new(graph, env)
    }

    #[tokio::test]
    async fn test_provide_chain_into_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = Utf8PathBuf::try_from(dir.path().join("c.txt")).unwrap();

        let mut registry = Registry::new();
        registry.provide("A").run(|_| async { Ok(1usize) });
        registry
            .provide("B")
            .depends_on(["A"])
            .run(|inputs| async move { Ok(inputs.get::<usize>("A")? + 1) });

        let path = out.clone();
        registry
            .task("C")
            .depends_on(["B"])
            .run(move |inputs| {
                let path = path.clone();
                async move {
                    std::fs::write(&path, inputs.get::<usize>("B")?.to_string())?;
                    Ok(path)
                }
            });

        let scheduler = scheduler(registry);
        scheduler.run(Some("C"), &Options::default()).await.unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "2");

        let report = scheduler
            .run(Some("C"), &Options { clean: true })
            .await
            .unwrap();
        assert!(!out.exists());
        let clean = report.clean.unwrap();
        assert_eq!(clean.cleaned.len(), 1);
        assert!(clean.failed.is_empty());
    }

    #[tokio::test]
    async fn test_shared_dependency_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let mut registry = Registry::new();
        registry.provide("Shared").run(move |_| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(counter.fetch_add(1, Ordering::SeqCst))
            }
        });
        registry.task("X").depends_on(["Shared"]).run(|_| async { Ok(()) });
        registry.task("Y").depends_on(["Shared"]).run(|_| async { Ok(()) });
        registry
            .task("all")
            .depends_on(["X", "Y"])
            .default()
            .run(|_| async { Ok(()) });

        let scheduler = scheduler(registry);
        let report = scheduler.run(None, &Options::default()).await.unwrap();

        assert_eq!(report.target, "all");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.diagnostics.execution_times.len(), 4);
    }

    #[tokio::test]
    async fn test_env_values_reach_producers() {
        let mut registry = Registry::new();
        registry
            .provide("dest")
            .depends_on(["PREFIX"])
            .run(|inputs| async move { Ok(format!("{}/bin", inputs.text("PREFIX")?)) });

        let report = scheduler(registry)
            .run(Some("dest"), &Options::default())
            .await
            .unwrap();
        let value = report.value.unwrap();
        assert_eq!(value.downcast_ref::<String>().unwrap(), "/usr/local/bin");
    }

    #[tokio::test]
    async fn test_failure_blocks_new_starts() {
        let started = Arc::new(AtomicUsize::new(0));
        let late = started.clone();

        let mut registry = Registry::new();
        registry
            .task("broken")
            .run(|_| async { Err::<(), _>(anyhow::anyhow!("boom")) });
        registry.task("slow").run(|_| async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(())
        });
        registry.task("after_slow").depends_on(["slow"]).run(move |_| {
            late.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        });
        registry
            .task("all")
            .depends_on(["broken", "after_slow"])
            .run(|_| async { Ok(()) });

        let err = scheduler(registry)
            .run(Some("all"), &Options::default())
            .await
            .unwrap_err();

        match &err {
            RunError::Recipe { name, .. } => assert_eq!(name, "broken"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("boom"));
        assert_eq!(started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_provider_failure_is_attributed() {
        let mut registry = Registry::new();
        registry
            .provide("bad")
            .run(|_| async { Err::<usize, _>(anyhow::anyhow!("no sources")) });
        registry.task("t").depends_on(["bad"]).run(|_| async { Ok(()) });

        let err = scheduler(registry)
            .run(Some("t"), &Options::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Producer { ref name, .. } if name == "bad"));
        assert_eq!(err.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_unknown_and_default_targets() {
        let mut registry = Registry::new();
        registry.provide("a").run(|_| async { Ok(()) });
        let scheduler = scheduler(registry);

        let err = scheduler.run(None, &Options::default()).await.unwrap_err();
        assert!(matches!(err, RunError::Registry(crate::RegistryError::NoDefault)));

        let err = scheduler.run(Some("zzz"), &Options::default()).await.unwrap_err();
        assert!(matches!(err, RunError::Registry(crate::RegistryError::UnknownTarget(_))));
    }

    #[tokio::test]
    async fn test_provided_recipes_are_resolved_and_cleaned() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let builds = Arc::new(AtomicUsize::new(0));

        let mut registry = Registry::new();

        let counter = builds.clone();
        registry.recipe("touch").make(move |_, path: &Utf8PathBuf| {
            let counter = counter.clone();
            let target = path.clone();
            Ok(Recipe::builder("touch").output(path.clone()).action(move |_, _| {
                let counter = counter.clone();
                let target = target.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    std::fs::write(&target, "x")?;
                    Ok(target)
                }
            }))
        });

        let base = root.clone();
        registry
            .provide("artifacts")
            .depends_on(["touch"])
            .run(move |inputs| {
                let base = base.clone();
                async move {
                    let touch = inputs.factory("touch")?;
                    let a = touch.make(base.join("a"))?;
                    let again = touch.make(base.join("a"))?;
                    let b = touch.make(base.join("b"))?;
                    Ok(vec![a, again, b])
                }
            });

        registry
            .task("use")
            .depends_on(["artifacts"])
            .noclean()
            .run(|inputs| async move { Ok(inputs.paths("artifacts")?.len()) });

        let scheduler = scheduler(registry);
        let report = scheduler.run(Some("use"), &Options::default()).await.unwrap();

        assert_eq!(*report.value.unwrap().downcast_ref::<usize>().unwrap(), 3);
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert!(root.join("a").exists());

        let report = scheduler
            .run(Some("use"), &Options { clean: true })
            .await
            .unwrap();
        assert!(!root.join("a").exists());
        assert!(!root.join("b").exists());
        assert_eq!(report.clean.unwrap().cleaned.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_recipes_retry_on_next_run() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let mut registry = Registry::new();
        registry.task("flaky").run(move |_| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                match attempt {
                    0 => Err(anyhow::anyhow!("first attempt fails")),
                    _ => Ok(()),
                }
            }
        });

        let scheduler = scheduler(registry);
        assert!(scheduler.run(Some("flaky"), &Options::default()).await.is_err());
        assert!(scheduler.run(Some("flaky"), &Options::default()).await.is_ok());
        // Done now, not invoked again.
        assert!(scheduler.run(Some("flaky"), &Options::default()).await.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_originating_failure_wins_over_later_one() {
        let mut registry = Registry::new();
        registry.provide("P").run(|_| async {
            let slow = Recipe::builder("slow").action(|_, _| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            });
            let failing = Recipe::builder("fast_fail")
                .action(|_, _| async { Err::<(), _>(anyhow::anyhow!("ORIGINATING")) });
            Ok(vec![slow, failing])
        });
        registry.task("Z").run(|_| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err::<(), _>(anyhow::anyhow!("LATER"))
        });
        registry
            .task("root")
            .depends_on(["Z", "P"])
            .run(|_| async { Ok(()) });

        let err = scheduler(registry)
            .run(Some("root"), &Options::default())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("ORIGINATING"), "{err}");
        assert!(matches!(err, RunError::Recipe { ref name, .. } if name == "P"));
    }
}
