use std::any::{Any, type_name};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use camino::Utf8PathBuf;
use tokio_util::sync::CancellationToken;

use crate::cookbook::Cookbook;
use crate::core::{ArcStr, Dynamic};
use crate::env::{Environment, Value};
use crate::error::{Cause, InputError, RecipeError};
use crate::recipe::Recipe;
use crate::registry::Factory;
use crate::shell::Terminal;

/// The failure that closed a gate.
#[derive(Debug, Clone)]
pub(crate) enum Trip {
    /// A recipe action failed while resolved on behalf of `owner`.
    Recipe {
        owner: Option<ArcStr>,
        source: RecipeError,
    },
    /// A producer body failed.
    Producer { name: ArcStr, cause: Cause },
}

#[derive(Debug, Default)]
struct GateState {
    tripped: AtomicBool,
    first: Mutex<Option<Trip>>,
}

/// Set after the first failure of a run; once closed no new producer or
/// recipe starts. Work already in flight runs to completion.
#[derive(Debug, Clone, Default)]
pub struct Gate(Arc<GateState>);

impl Gate {
    pub fn trip(&self) {
        self.0.tripped.store(true, Ordering::SeqCst);
    }

    /// Closes the gate, remembering `trip` unless an earlier failure already
    /// closed it.
    pub(crate) fn trip_with(&self, trip: Trip) {
        self.0
            .first
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(trip);
        self.trip();
    }

    pub fn is_tripped(&self) -> bool {
        self.0.tripped.load(Ordering::SeqCst)
    }

    /// The failure that closed the gate first, if it was recorded.
    pub(crate) fn first(&self) -> Option<Trip> {
        self.0
            .first
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Shared state handed to every producer, recipe action and shell command.
#[derive(Debug, Clone)]
pub struct Context {
    env: Arc<Environment>,
    terminal: Terminal,
    gate: Gate,
    cookbook: Arc<Cookbook>,
    cancel: CancellationToken,
    owner: Option<ArcStr>,
    holds_terminal: bool,
}

impl Context {
    pub fn new(env: Arc<Environment>) -> Self {
        Self {
            env,
            terminal: Terminal::default(),
            gate: Gate::default(),
            cookbook: Arc::new(Cookbook::default()),
            cancel: CancellationToken::new(),
            owner: None,
            holds_terminal: false,
        }
    }

    /// Same environment, cookbook, terminal and cancellation, with a fresh
    /// failure gate.
    pub(crate) fn for_run(&self) -> Self {
        Self {
            gate: Gate::default(),
            ..self.clone()
        }
    }

    /// Same context, working on behalf of producer `name`. Recipe failures
    /// met through it are attributed to that producer.
    pub(crate) fn for_producer(&self, name: ArcStr) -> Self {
        Self {
            owner: Some(name),
            ..self.clone()
        }
    }

    /// Same context, for work running under a terminal guard taken by the
    /// caller. Commands started through it don't take the terminal again.
    pub(crate) fn with_terminal_held(&self) -> Self {
        Self {
            holds_terminal: true,
            ..self.clone()
        }
    }

    pub(crate) fn owner(&self) -> Option<&ArcStr> {
        self.owner.as_ref()
    }

    pub(crate) fn holds_terminal(&self) -> bool {
        self.holds_terminal
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn terminal(&self) -> &Terminal {
        &self.terminal
    }

    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    pub fn cookbook(&self) -> &Cookbook {
        &self.cookbook
    }

    /// Token cancelled on interrupt; running children are killed when it
    /// fires.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Returns the canonical instance for `recipe`'s sigil.
    pub fn intern(&self, recipe: Recipe) -> Recipe {
        self.cookbook.intern(recipe)
    }
}

/// Resolved dependency values of a producer, keyed by dependency name.
#[derive(Clone)]
pub struct Inputs {
    values: Arc<BTreeMap<ArcStr, Dynamic>>,
    ctx: Context,
}

impl Inputs {
    pub(crate) fn new(values: BTreeMap<ArcStr, Dynamic>, ctx: Context) -> Self {
        Self {
            values: Arc::new(values),
            ctx,
        }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn env(&self) -> &Environment {
        self.ctx.env()
    }

    /// Raw value of dependency `name`.
    pub fn dynamic(&self, name: &str) -> Result<&Dynamic, InputError> {
        self.values
            .get(name)
            .ok_or_else(|| InputError::Missing(name.to_string()))
    }

    /// Value of dependency `name` as a `T`.
    pub fn get<T: Any>(&self, name: &str) -> Result<&T, InputError> {
        self.dynamic(name)?
            .downcast_ref::<T>()
            .ok_or_else(|| InputError::WrongType {
                name: name.to_string(),
                expected: type_name::<T>(),
            })
    }

    /// Every `T` found in dependency `name`: a single `T`, a `Vec<T>` or a
    /// list of dynamic values each holding a `T`.
    pub fn all<T: Any>(&self, name: &str) -> Result<Vec<&T>, InputError> {
        let value = self.dynamic(name)?;
        let wrong = || InputError::WrongType {
            name: name.to_string(),
            expected: type_name::<T>(),
        };

        if let Some(item) = value.downcast_ref::<T>() {
            return Ok(vec![item]);
        }
        if let Some(items) = value.downcast_ref::<Vec<T>>() {
            return Ok(items.iter().collect());
        }
        if let Some(items) = value.downcast_ref::<Vec<Dynamic>>() {
            return items
                .iter()
                .map(|item| item.downcast_ref::<T>().ok_or_else(wrong))
                .collect();
        }

        Err(wrong())
    }

    /// Paths held by dependency `name`, see [`Inputs::all`].
    pub fn paths(&self, name: &str) -> Result<Vec<Utf8PathBuf>, InputError> {
        Ok(self.all::<Utf8PathBuf>(name)?.into_iter().cloned().collect())
    }

    /// Environment dependency `name` as text.
    pub fn text(&self, name: &str) -> Result<String, InputError> {
        let value = self.dynamic(name)?;
        if let Some(value) = value.downcast_ref::<Value>() {
            return Ok(value.to_string());
        }
        if let Some(text) = value.downcast_ref::<String>() {
            return Ok(text.clone());
        }
        Err(InputError::WrongType {
            name: name.to_string(),
            expected: "text value",
        })
    }

    /// Environment dependency `name` as a list of words.
    pub fn list(&self, name: &str) -> Result<Vec<String>, InputError> {
        let value = self.get::<Value>(name)?;
        Ok(value.words().into_iter().map(str::to_string).collect())
    }

    /// Recipe factory bound to dependency `name`.
    pub fn factory(&self, name: &str) -> Result<&Factory, InputError> {
        self.get::<Factory>(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|key| &**key)
    }
}

impl std::fmt::Debug for Inputs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inputs")
            .field("names", &self.names().collect::<Vec<_>>())
            .finish()
    }
}
