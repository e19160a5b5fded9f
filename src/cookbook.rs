use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::core::Sigil;
use crate::recipe::{Ingredient, Recipe};

/// Process-wide store of canonical recipe instances, keyed by sigil.
///
/// Interning a recipe returns the instance already registered under its
/// sigil, or registers this one. Upstream recipes are interned first, so two
/// independently built graphs that share work end up sharing instances.
#[derive(Default)]
pub struct Cookbook {
    recipes: Mutex<HashMap<Sigil, Recipe>>,
}

impl Cookbook {
    pub fn intern(&self, recipe: Recipe) -> Recipe {
        if let Some(known) = self.lock().get(recipe.sigil()) {
            return known.clone();
        }

        // The lock is not held across the recursion into ingredients.
        let mut changed = false;
        let ingredients: Vec<Ingredient> = recipe
            .ingredients()
            .iter()
            .map(|ingredient| match ingredient {
                Ingredient::Recipe(upstream) => {
                    let canonical = self.intern(upstream.clone());
                    changed |= !canonical.ptr_eq(upstream);
                    Ingredient::Recipe(canonical)
                }
                Ingredient::Value(value) => Ingredient::Value(value.clone()),
            })
            .collect();

        let recipe = match changed {
            true => recipe.with_ingredients(ingredients),
            false => recipe,
        };

        self.lock()
            .entry(recipe.sigil().clone())
            .or_insert(recipe)
            .clone()
    }

    pub fn get(&self, sigil: &Sigil) -> Option<Recipe> {
        self.lock().get(sigil).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn recipes(&self) -> Vec<Recipe> {
        self.lock().values().cloned().collect()
    }

    /// Failed recipes go back to pending at the start of a new run.
    pub(crate) fn reset_failed(&self) {
        for recipe in self.lock().values() {
            recipe.reset_failed();
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Sigil, Recipe>> {
        self.recipes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Cookbook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cookbook")
            .field("recipes", &self.len())
            .finish()
    }
}
