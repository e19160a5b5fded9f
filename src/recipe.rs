//! Memoized units of work.
//!
//! A [`Recipe`] is one concrete instance of work identified by its
//! [`Sigil`]: a name plus a digest of the arguments it was created with. A
//! recipe owns its upstream ingredients, an async action, and optionally a
//! declared output path and an inverse action used by clean mode.
//!
//! Resolution is memoized per instance. The first caller starts the work,
//! concurrent callers await the same shared future, and later callers get the
//! cached output (or the cached failure) back.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Instant, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use futures::future::{BoxFuture, Shared, join_all};
use futures::FutureExt;
use tracing::Instrument;

use crate::context::{Context, Trip};
use crate::core::{ArcStr, Blake3Hasher, Dynamic, Sigil};
use crate::error::{Cause, CleanError, RecipeError, is_abort};

pub(crate) type ActionFn =
    Arc<dyn Fn(Context, Vec<Dynamic>) -> BoxFuture<'static, anyhow::Result<Dynamic>> + Send + Sync>;

pub(crate) type InverseFn =
    Arc<dyn Fn(Context, Dynamic) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

type Resolution = Shared<BoxFuture<'static, Result<Dynamic, RecipeError>>>;

/// An upstream input of a recipe.
#[derive(Clone)]
pub enum Ingredient {
    /// Resolved before the action runs; its output is passed in.
    Recipe(Recipe),
    /// Passed through as is.
    Value(Dynamic),
}

/// Snapshot of a recipe's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pending,
    Running,
    Done,
    Failed,
}

enum State {
    Pending,
    Running(Resolution),
    Done(Dynamic),
    Failed(RecipeError),
}

#[derive(Clone)]
enum Inverse {
    None,
    Remove(Utf8PathBuf),
    Action(InverseFn),
}

struct RecipeInner {
    sigil: Sigil,
    ingredients: Vec<Ingredient>,
    action: ActionFn,
    inverse: Inverse,
    output: Option<Utf8PathBuf>,
    check: Vec<Utf8PathBuf>,
    state: Mutex<State>,
}

/// Cheap, cloneable handle to a recipe instance.
#[derive(Clone)]
pub struct Recipe(Arc<RecipeInner>);

impl Recipe {
    pub fn builder(name: impl Into<ArcStr>) -> RecipeBuilder {
        RecipeBuilder::new(name.into())
    }

    pub fn sigil(&self) -> &Sigil {
        &self.0.sigil
    }

    pub fn name(&self) -> &str {
        self.0.sigil.name()
    }

    /// Declared output artifact, if any.
    pub fn output_path(&self) -> Option<&Utf8Path> {
        self.0.output.as_deref()
    }

    pub fn ingredients(&self) -> &[Ingredient] {
        &self.0.ingredients
    }

    /// Upstream recipes, in declaration order.
    pub fn upstream(&self) -> impl Iterator<Item = &Recipe> {
        self.0.ingredients.iter().filter_map(|ingredient| match ingredient {
            Ingredient::Recipe(recipe) => Some(recipe),
            Ingredient::Value(_) => None,
        })
    }

    pub fn status(&self) -> Status {
        match &*self.state() {
            State::Pending => Status::Pending,
            State::Running(_) => Status::Running,
            State::Done(_) => Status::Done,
            State::Failed(_) => Status::Failed,
        }
    }

    /// Cached output of a finished recipe.
    pub fn output(&self) -> Option<Dynamic> {
        match &*self.state() {
            State::Done(value) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn ptr_eq(&self, other: &Recipe) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.0.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves the recipe, running it at most once per lifecycle.
    ///
    /// Concurrent callers share one execution. Once done, the output is
    /// returned without running anything; once failed, the failure is.
    pub fn resolve<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<Dynamic, RecipeError>> {
        async move { self.resolve_inner(ctx).await }.boxed()
    }

    async fn resolve_inner(&self, ctx: &Context) -> Result<Dynamic, RecipeError> {
        let resolution = {
            let mut state = self.state();
            match &*state {
                State::Done(value) => return Ok(value.clone()),
                State::Failed(err) => return Err(err.clone()),
                State::Running(resolution) => resolution.clone(),
                State::Pending => {
                    if ctx.gate().is_tripped() {
                        return Err(RecipeError::Aborted(self.sigil().to_string()));
                    }
                    let resolution = self.clone().execute(ctx.clone()).boxed().shared();
                    *state = State::Running(resolution.clone());
                    resolution
                }
            }
        };

        resolution.await
    }

    /// Runs the action unconditionally, bypassing the memo. Upstream
    /// ingredients are still resolved through theirs.
    pub async fn invoke(&self, ctx: &Context) -> Result<Dynamic, RecipeError> {
        let inputs = self.gather(ctx).await?;
        if ctx.gate().is_tripped() {
            return Err(RecipeError::Aborted(self.sigil().to_string()));
        }
        self.act(ctx, inputs).await
    }

    /// Reverts the recipe's side effects.
    ///
    /// Returns `Ok(false)` when there was nothing to revert: the recipe never
    /// ran in this process and its declared output doesn't exist either.
    /// Afterwards the recipe is pending again.
    pub async fn clean(&self, ctx: &Context) -> Result<bool, CleanError> {
        let output = {
            let mut state = self.state();
            if let State::Pending = &*state
                && let Some(path) = &self.0.output
                && path.exists()
            {
                *state = State::Done(Arc::new(path.clone()));
            }

            match &*state {
                State::Done(value) => value.clone(),
                _ => {
                    tracing::debug!(recipe = %self.sigil(), "nothing to clean");
                    return Ok(false);
                }
            }
        };

        let result = match &self.0.inverse {
            Inverse::None => Ok(()),
            Inverse::Remove(path) => remove_artifact(path, true),
            Inverse::Action(inverse) => {
                inverse(ctx.clone(), output)
                    .await
                    .map_err(|source| CleanError::Action {
                        sigil: self.sigil().to_string(),
                        source,
                    })
            }
        };

        *self.state() = State::Pending;
        result.map(|_| true)
    }

    /// Puts a failed recipe back to pending so a new run can retry it.
    pub(crate) fn reset_failed(&self) {
        let mut state = self.state();
        if let State::Failed(_) = &*state {
            *state = State::Pending;
        }
    }

    /// Same recipe with its recipe ingredients replaced by `ingredients`.
    pub(crate) fn with_ingredients(&self, ingredients: Vec<Ingredient>) -> Recipe {
        self.rebuild(self.0.sigil.clone(), ingredients)
    }

    /// Same recipe under a different sigil.
    pub(crate) fn rekey(&self, sigil: Sigil) -> Recipe {
        self.rebuild(sigil, self.0.ingredients.clone())
    }

    fn rebuild(&self, sigil: Sigil, ingredients: Vec<Ingredient>) -> Recipe {
        Recipe(Arc::new(RecipeInner {
            sigil,
            ingredients,
            action: self.0.action.clone(),
            inverse: self.0.inverse.clone(),
            output: self.0.output.clone(),
            check: self.0.check.clone(),
            state: Mutex::new(State::Pending),
        }))
    }

    async fn execute(self, ctx: Context) -> Result<Dynamic, RecipeError> {
        let result = self.run_once(&ctx).await;

        let mut state = self.state();
        match &result {
            Ok(value) => *state = State::Done(value.clone()),
            Err(RecipeError::Aborted(_)) => *state = State::Pending,
            Err(err) => *state = State::Failed(err.clone()),
        }
        drop(state);

        result
    }

    async fn run_once(&self, ctx: &Context) -> Result<Dynamic, RecipeError> {
        let inputs = self.gather(ctx).await?;

        if ctx.gate().is_tripped() {
            return Err(RecipeError::Aborted(self.sigil().to_string()));
        }

        if let Some(path) = &self.0.output
            && self.is_fresh(path, &inputs)
        {
            tracing::debug!(recipe = %self.sigil(), "{path} is up to date");
            return Ok(Arc::new(path.clone()));
        }

        self.act(ctx, inputs).await
    }

    async fn act(&self, ctx: &Context, inputs: Vec<Dynamic>) -> Result<Dynamic, RecipeError> {
        let span = tracing::info_span!("recipe", sigil = %self.sigil());
        let start = Instant::now();

        match (self.0.action)(ctx.clone(), inputs).instrument(span).await {
            Ok(value) => {
                tracing::debug!(recipe = %self.sigil(), "finished in {:.2?}", start.elapsed());
                Ok(value)
            }
            Err(cause) if is_abort(&cause) => {
                tracing::debug!(recipe = %self.sigil(), "gave up, the run is failing");
                Err(RecipeError::Aborted(self.sigil().to_string()))
            }
            Err(cause) => {
                let err = RecipeError::Failed {
                    sigil: self.sigil().to_string(),
                    cause: Cause::new(cause),
                };
                ctx.gate().trip_with(Trip::Recipe {
                    owner: ctx.owner().cloned(),
                    source: err.clone(),
                });
                if let Some(path) = &self.0.output
                    && let Err(err) = remove_artifact(path, false)
                {
                    tracing::warn!("{err}");
                }
                Err(err)
            }
        }
    }

    /// Resolves every ingredient concurrently. Siblings already started run
    /// to completion even when one of them fails.
    async fn gather(&self, ctx: &Context) -> Result<Vec<Dynamic>, RecipeError> {
        let pending: Vec<BoxFuture<'_, Result<Dynamic, RecipeError>>> = self
            .0
            .ingredients
            .iter()
            .map(|ingredient| match ingredient {
                Ingredient::Recipe(recipe) => recipe.resolve(ctx),
                Ingredient::Value(value) => futures::future::ready(Ok(value.clone())).boxed(),
            })
            .collect();

        let mut values = Vec::with_capacity(pending.len());
        let mut aborted = None;

        for result in join_all(pending).await {
            match result {
                Ok(value) => values.push(value),
                Err(err @ RecipeError::Failed { .. }) => return Err(err),
                Err(err @ RecipeError::Aborted(_)) => {
                    aborted.get_or_insert(err);
                }
            }
        }

        match aborted {
            Some(err) => Err(err),
            None => Ok(values),
        }
    }

    /// An output is fresh when it exists and is no older than any of the
    /// checked sources and upstream path outputs. Without anything to compare
    /// against the recipe always runs.
    fn is_fresh(&self, output: &Utf8Path, inputs: &[Dynamic]) -> bool {
        let Some(built) = modified(output) else {
            return false;
        };

        let mut sources: Vec<&Utf8Path> = self.0.check.iter().map(Utf8PathBuf::as_path).collect();
        for value in inputs {
            if let Some(path) = value.downcast_ref::<Utf8PathBuf>() {
                sources.push(path);
            }
        }

        if sources.is_empty() {
            return false;
        }

        sources
            .into_iter()
            .all(|source| modified(source).is_some_and(|time| time <= built))
    }
}

fn modified(path: &Utf8Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

/// Removes a file or directory artifact. A missing artifact is an error only
/// when `strict` is set.
pub(crate) fn remove_artifact(path: &Utf8Path, strict: bool) -> Result<(), CleanError> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return match strict {
                true => Err(CleanError::Missing(path.to_path_buf())),
                false => Ok(()),
            };
        }
        Err(source) => {
            return Err(CleanError::Remove {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let result = if meta.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };

    result.map_err(|source| CleanError::Remove {
        path: path.to_path_buf(),
        source,
    })?;

    tracing::info!("Removed {path}");
    Ok(())
}

impl fmt::Debug for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recipe")
            .field("sigil", &self.0.sigil)
            .field("status", &self.status())
            .field("output", &self.0.output)
            .finish()
    }
}

impl fmt::Debug for Ingredient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ingredient::Recipe(recipe) => write!(f, "Recipe({})", recipe.sigil()),
            Ingredient::Value(_) => f.write_str("Value(..)"),
        }
    }
}

/// Builder for a [`Recipe`]. Everything fed through [`arg`](Self::arg),
/// [`input`](Self::input), [`output`](Self::output) and
/// [`check`](Self::check) contributes to the sigil.
pub struct RecipeBuilder {
    name: ArcStr,
    hasher: Blake3Hasher,
    ingredients: Vec<Ingredient>,
    output: Option<Utf8PathBuf>,
    check: Vec<Utf8PathBuf>,
    inverse: Option<Inverse>,
}

impl RecipeBuilder {
    fn new(name: ArcStr) -> Self {
        let mut hasher = Blake3Hasher::default();
        name.hash(&mut hasher);

        Self {
            name,
            hasher,
            ingredients: Vec::new(),
            output: None,
            check: Vec::new(),
            inverse: None,
        }
    }

    pub fn arg<A: Hash + ?Sized>(mut self, arg: &A) -> Self {
        arg.hash(&mut self.hasher);
        self
    }

    /// Adds an upstream recipe.
    pub fn input(mut self, recipe: impl Into<Recipe>) -> Self {
        let recipe = recipe.into();
        recipe.sigil().hash(&mut self.hasher);
        self.ingredients.push(Ingredient::Recipe(recipe));
        self
    }

    /// Adds a plain value ingredient. Values don't contribute to the sigil,
    /// hash what identifies them with [`arg`](Self::arg).
    pub fn value<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.ingredients.push(Ingredient::Value(Arc::new(value)));
        self
    }

    /// Declares the artifact produced by the action. Unless a custom inverse
    /// is set, cleaning removes it.
    pub fn output(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        let path = path.into();
        path.hash(&mut self.hasher);
        self.output = Some(path);
        self
    }

    /// Sources the declared output is compared against before running.
    pub fn check<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Utf8PathBuf>,
    {
        for path in paths {
            let path = path.into();
            path.hash(&mut self.hasher);
            self.check.push(path);
        }
        self
    }

    /// Custom inverse action, receives the recipe's output.
    pub fn clean<F, Fut>(mut self, inverse: F) -> Self
    where
        F: Fn(Context, Dynamic) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inverse = Some(Inverse::Action(Arc::new(move |ctx, output| {
            inverse(ctx, output).boxed()
        })));
        self
    }

    /// No inverse at all, clean leaves the artifact in place.
    pub fn keep(mut self) -> Self {
        self.inverse = Some(Inverse::None);
        self
    }

    /// Finishes the recipe with a typed action.
    pub fn action<F, Fut, R>(self, action: F) -> Recipe
    where
        F: Fn(Context, Vec<Dynamic>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Any + Send + Sync,
    {
        self.finish(Arc::new(move |ctx, inputs| {
            let future = action(ctx, inputs);
            async move { Ok(Arc::new(future.await?) as Dynamic) }.boxed()
        }))
    }

    pub(crate) fn finish(self, action: ActionFn) -> Recipe {
        let inverse = match (self.inverse, &self.output) {
            (Some(inverse), _) => inverse,
            (None, Some(path)) => Inverse::Remove(path.clone()),
            (None, None) => Inverse::None,
        };

        Recipe(Arc::new(RecipeInner {
            sigil: Sigil::from_parts(self.name, self.hasher),
            ingredients: self.ingredients,
            action,
            inverse,
            output: self.output,
            check: self.check,
            state: Mutex::new(State::Pending),
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::env::Environment;

    fn ctx() -> Context {
        let env = Environment::builder()
            .process_vars(Vec::<(String, String)>::new())
            .build();
        Context::new(Arc::new(env))
    }

    fn counting(name: &str, counter: Arc<AtomicUsize>) -> Recipe {
        Recipe::builder(name).arg(&()).action(move |_, _| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(counter.fetch_add(1, Ordering::SeqCst))
            }
        })
    }

    #[tokio::test]
    async fn test_resolve_runs_once() {
        let ctx = ctx();
        let counter = Arc::new(AtomicUsize::new(0));
        let recipe = counting("count", counter.clone());

        let (a, b) = tokio::join!(recipe.resolve(&ctx), recipe.resolve(&ctx));
        let c = recipe.resolve(&ctx).await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(*a.unwrap().downcast_ref::<usize>().unwrap(), 0);
        assert_eq!(*b.unwrap().downcast_ref::<usize>().unwrap(), 0);
        assert_eq!(*c.downcast_ref::<usize>().unwrap(), 0);
        assert_eq!(recipe.status(), Status::Done);
    }

    #[tokio::test]
    async fn test_invoke_bypasses_memo() {
        let ctx = ctx();
        let counter = Arc::new(AtomicUsize::new(0));
        let recipe = counting("count", counter.clone());

        recipe.resolve(&ctx).await.unwrap();
        recipe.invoke(&ctx).await.unwrap();
        recipe.invoke(&ctx).await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_ingredients_feed_action() {
        let ctx = ctx();
        let upstream = Recipe::builder("two").arg(&2).action(|_, _| async { Ok(2usize) });
        let recipe = Recipe::builder("double")
            .input(upstream)
            .value(10usize)
            .action(|_, inputs: Vec<Dynamic>| async move {
                let a = *inputs[0].downcast_ref::<usize>().unwrap();
                let b = *inputs[1].downcast_ref::<usize>().unwrap();
                Ok(a * b)
            });

        let value = recipe.resolve(&ctx).await.unwrap();
        assert_eq!(*value.downcast_ref::<usize>().unwrap(), 20);
    }

    #[tokio::test]
    async fn test_failure_is_cached_and_trips_gate() {
        let ctx = ctx();
        let counter = Arc::new(AtomicUsize::new(0));
        let calls = counter.clone();
        let recipe = Recipe::builder("broken").arg(&()).action(move |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(anyhow::anyhow!("boom")) }
        });

        let first = recipe.resolve(&ctx).await.unwrap_err();
        let second = recipe.resolve(&ctx).await.unwrap_err();

        assert!(matches!(first, RecipeError::Failed { .. }));
        assert_eq!(first.to_string(), second.to_string());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(ctx.gate().is_tripped());

        recipe.reset_failed();
        assert_eq!(recipe.status(), Status::Pending);
    }

    #[tokio::test]
    async fn test_closed_gate_blocks_new_work() {
        let ctx = ctx();
        ctx.gate().trip();
        let recipe = Recipe::builder("late").arg(&()).action(|_, _| async { Ok(()) });

        let err = recipe.resolve(&ctx).await.unwrap_err();
        assert!(matches!(err, RecipeError::Aborted(_)));
        assert_eq!(recipe.status(), Status::Pending);
    }

    #[tokio::test]
    async fn test_upstream_failure_propagates() {
        let ctx = ctx();
        let broken = Recipe::builder("broken")
            .arg(&())
            .action(|_, _| async { Err::<(), _>(anyhow::anyhow!("boom")) });
        let downstream = Recipe::builder("down")
            .input(broken.clone())
            .action(|_, _| async { Ok(()) });

        let err = downstream.resolve(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("broken@"));
        assert_eq!(downstream.status(), Status::Failed);
        assert_eq!(broken.status(), Status::Failed);
    }

    #[tokio::test]
    async fn test_clean_removes_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join("artifact")).unwrap();
        let ctx = ctx();

        let target = path.clone();
        let recipe = Recipe::builder("touch")
            .output(path.clone())
            .action(move |_, _| {
                let target = target.clone();
                async move {
                    std::fs::write(&target, "x")?;
                    Ok(target)
                }
            });

        recipe.resolve(&ctx).await.unwrap();
        assert!(path.exists());

        assert!(recipe.clean(&ctx).await.unwrap());
        assert!(!path.exists());
        assert_eq!(recipe.status(), Status::Pending);

        // Never ran again and nothing on disk.
        assert!(!recipe.clean(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_clean_detects_existing_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join("stale")).unwrap();
        std::fs::write(&path, "x").unwrap();

        let recipe = Recipe::builder("touch")
            .output(path.clone())
            .action(|_, _| async { Ok(()) });

        assert!(recipe.clean(&ctx()).await.unwrap());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_custom_inverse_receives_output() {
        let seen = Arc::new(AtomicUsize::new(0));
        let record = seen.clone();
        let ctx = ctx();

        let recipe = Recipe::builder("value")
            .arg(&())
            .clean(move |_, output| {
                let record = record.clone();
                async move {
                    let value = *output.downcast_ref::<usize>().unwrap();
                    record.store(value, Ordering::SeqCst);
                    Ok(())
                }
            })
            .action(|_, _| async { Ok(7usize) });

        recipe.resolve(&ctx).await.unwrap();
        assert!(recipe.clean(&ctx).await.unwrap());
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn test_fresh_output_skips_action() {
        let dir = tempfile::tempdir().unwrap();
        let src = Utf8PathBuf::try_from(dir.path().join("main.cpp")).unwrap();
        let out = Utf8PathBuf::try_from(dir.path().join("main")).unwrap();
        std::fs::write(&src, "int main() {}").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(&out, "binary").unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let calls = counter.clone();
        let recipe = Recipe::builder("compile")
            .output(out.clone())
            .check([src.clone()])
            .action(move |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            });

        let value = recipe.resolve(&ctx()).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(value.downcast_ref::<Utf8PathBuf>(), Some(&out));
    }

    #[tokio::test]
    async fn test_failure_removes_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = Utf8PathBuf::try_from(dir.path().join("partial")).unwrap();

        let target = out.clone();
        let recipe = Recipe::builder("half")
            .output(out.clone())
            .action(move |_, _| {
                let target = target.clone();
                async move {
                    std::fs::write(&target, "half")?;
                    Err::<(), _>(anyhow::anyhow!("interrupted"))
                }
            });

        assert!(recipe.resolve(&ctx()).await.is_err());
        assert!(!out.exists());
    }
}
