#![forbid(unsafe_code)]
//! Declarative, dependency-driven recipe engine.
//!
//! A build script registers named producers in a [`Registry`]. Each one
//! declares the names it depends on: other producers, or values of the
//! [`Environment`]. The validated [`Graph`] is executed by a [`Scheduler`],
//! which runs every producer at most once per run, awaits independent
//! dependencies together and stops starting new work after the first
//! failure.
//!
//! Side effects live in [`Recipe`]s: memoized, content-addressed units of
//! work, usually a [`Shell`] command. Recipes declared with the same
//! arguments are the same recipe, so a shared step runs once no matter how
//! many producers ask for it. Running in clean mode walks the same graph
//! and reverts what the recipes produced.
//!
//! [`TestSuite`] adds the test-oriented scheduling on top: shuffled order,
//! stress repetition and interactive tests that get the terminal to
//! themselves.

mod context;
mod cookbook;
mod core;
mod error;
mod recipe;
mod registry;
mod shell;

pub mod config;
pub mod env;
pub mod files;
pub mod scheduler;
pub mod suite;
pub mod utils;

#[cfg(feature = "cli")]
pub mod cli;

pub use crate::config::Settings;
pub use crate::context::{Context, Gate, Inputs};
pub use crate::cookbook::Cookbook;
pub use crate::core::{Dynamic, Sigil};
pub use crate::env::{EnvBuilder, Environment, Value};
pub use crate::error::*;
pub use crate::recipe::{Ingredient, Recipe, RecipeBuilder, Status};
pub use crate::registry::{Factory, Graph, Kind, Producer, ProducerDef, Registry};
pub use crate::scheduler::{CleanReport, Diagnostics, Options, Report, Scheduler};
pub use crate::shell::{Arg, Mode, Outcome, Shell, Terminal};
pub use crate::suite::{StressReport, SuiteReport, TestSuite};
