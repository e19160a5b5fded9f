//! Producer registry.
//!
//! Build scripts declare named producers and the names they depend on. A
//! dependency name resolves to another producer first and to an environment
//! value second. [`Registry::finish`] validates all of it up front (duplicate
//! names, unknown dependencies, cycles) and returns the immutable [`Graph`]
//! the scheduler executes.
//!
//! ```rust,no_run
//! use bakery::{Environment, Registry};
//!
//! let mut registry = Registry::new();
//!
//! registry
//!     .provide("a")
//!     .run(|_| async { Ok(1usize) });
//!
//! registry
//!     .provide("b")
//!     .depends_on(["a"])
//!     .run(|inputs| async move { Ok(inputs.get::<usize>("a")? + 1) });
//!
//! let graph = registry.finish(&Environment::default()).unwrap();
//! ```

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::str::FromStr;
use std::sync::Arc;

use camino::Utf8PathBuf;
use futures::FutureExt;
use futures::future::BoxFuture;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;

use crate::context::Inputs;
use crate::core::{ArcStr, Dynamic, Sigil};
use crate::env::Environment;
use crate::error::{CyclePath, RegistryError};
use crate::recipe::Recipe;

pub(crate) type RunFn =
    Arc<dyn Fn(Inputs) -> BoxFuture<'static, anyhow::Result<Dynamic>> + Send + Sync>;

pub(crate) type PathFn = Arc<dyn Fn(&Inputs) -> Option<Utf8PathBuf> + Send + Sync>;

pub(crate) type MakeFn =
    Arc<dyn Fn(&Inputs, &(dyn Any + Send + Sync)) -> anyhow::Result<Recipe> + Send + Sync>;

/// Kind tag of a producer declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Pure, value-producing.
    Provide,
    /// Side-effecting, invoked for its effect.
    Target,
    /// Reusable side-effecting unit parameterized by arguments.
    Recipe,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Kind::Provide => "provide",
            Kind::Target => "target",
            Kind::Recipe => "recipe",
        })
    }
}

impl FromStr for Kind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provide" => Ok(Kind::Provide),
            "task" | "target" => Ok(Kind::Target),
            "recipe" | "action" | "factory" => Ok(Kind::Recipe),
            other => Err(format!("unknown producer kind '{other}'")),
        }
    }
}

pub(crate) enum Body {
    Provide(RunFn),
    Target {
        run: RunFn,
        produces: Option<PathFn>,
        noclean: bool,
    },
    Recipe(MakeFn),
}

/// A named unit of the build graph.
pub struct Producer {
    name: ArcStr,
    deps: Vec<ArcStr>,
    body: Body,
}

impl Producer {
    /// Pure producer.
    pub fn provide<I, S, F, Fut, R>(name: impl Into<ArcStr>, deps: I, run: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ArcStr>,
        F: Fn(Inputs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Any + Send + Sync,
    {
        Self {
            name: name.into(),
            deps: deps.into_iter().map(Into::into).collect(),
            body: Body::Provide(erase(run)),
        }
    }

    /// Side-effecting producer.
    pub fn target<I, S, F, Fut, R>(name: impl Into<ArcStr>, deps: I, run: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ArcStr>,
        F: Fn(Inputs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Any + Send + Sync,
    {
        Self {
            name: name.into(),
            deps: deps.into_iter().map(Into::into).collect(),
            body: Body::Target {
                run: erase(run),
                produces: None,
                noclean: false,
            },
        }
    }

    /// Recipe factory. Dependents receive a [`Factory`] and create recipe
    /// instances from concrete arguments.
    pub fn factory<I, S, A, F>(name: impl Into<ArcStr>, deps: I, make: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ArcStr>,
        A: Any + Send + Sync,
        F: Fn(&Inputs, &A) -> anyhow::Result<Recipe> + Send + Sync + 'static,
    {
        let name = name.into();
        let label = name.clone();

        let make: MakeFn = Arc::new(move |inputs, args| {
            let args = args.downcast_ref::<A>().ok_or_else(|| {
                anyhow::anyhow!(
                    "Factory '{label}' expects arguments of type {}",
                    type_name::<A>()
                )
            })?;
            make(inputs, args)
        });

        Self {
            name,
            deps: deps.into_iter().map(Into::into).collect(),
            body: Body::Recipe(make),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn label(&self) -> ArcStr {
        self.name.clone()
    }

    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.deps.iter().map(|dep| &**dep)
    }

    pub fn kind(&self) -> Kind {
        match self.body {
            Body::Provide(_) => Kind::Provide,
            Body::Target { .. } => Kind::Target,
            Body::Recipe(_) => Kind::Recipe,
        }
    }

    pub fn is_noclean(&self) -> bool {
        matches!(self.body, Body::Target { noclean: true, .. })
    }

    pub(crate) fn body(&self) -> &Body {
        &self.body
    }
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("deps", &self.deps)
            .finish()
    }
}

fn erase<F, Fut, R>(run: F) -> RunFn
where
    F: Fn(Inputs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    R: Any + Send + Sync,
{
    Arc::new(move |inputs| {
        let future = run(inputs);
        async move { Ok(Arc::new(future.await?) as Dynamic) }.boxed()
    })
}

/// Recipe factory bound to its resolved dependencies.
#[derive(Clone)]
pub struct Factory {
    name: ArcStr,
    inputs: Inputs,
    make: MakeFn,
}

impl Factory {
    pub(crate) fn new(name: ArcStr, inputs: Inputs, make: MakeFn) -> Self {
        Self { name, inputs, make }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creates the recipe instance for `args`. The instance's sigil is the
    /// factory name plus the hash of `args`, and equal sigils yield the same
    /// interned instance.
    pub fn make<A: Any + Hash + Send + Sync>(&self, args: A) -> anyhow::Result<Recipe> {
        let sigil = Sigil::new(self.name.clone(), &args);
        if let Some(known) = self.inputs.context().cookbook().get(&sigil) {
            return Ok(known);
        }

        let recipe = (self.make)(&self.inputs, &args)?;
        Ok(self.inputs.context().intern(recipe.rekey(sigil)))
    }
}

impl fmt::Debug for Factory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Factory({})", self.name)
    }
}

/// Collects producer declarations.
#[derive(Default)]
pub struct Registry {
    producers: Vec<Producer>,
    default: Option<ArcStr>,
    rejected: Vec<RegistryError>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provide(&mut self, name: impl Into<ArcStr>) -> ProducerDef<'_> {
        self.declare(name, Kind::Provide)
    }

    pub fn target(&mut self, name: impl Into<ArcStr>) -> ProducerDef<'_> {
        self.declare(name, Kind::Target)
    }

    pub fn task(&mut self, name: impl Into<ArcStr>) -> ProducerDef<'_> {
        self.declare(name, Kind::Target)
    }

    pub fn recipe(&mut self, name: impl Into<ArcStr>) -> ProducerDef<'_> {
        self.declare(name, Kind::Recipe)
    }

    pub fn declare(&mut self, name: impl Into<ArcStr>, kind: Kind) -> ProducerDef<'_> {
        ProducerDef {
            registry: self,
            name: name.into(),
            kind,
            deps: Vec::new(),
            default: false,
            noclean: false,
            produces: None,
        }
    }

    pub fn register(&mut self, producer: Producer) -> &mut Self {
        self.producers.push(producer);
        self
    }

    /// Target run when none is named.
    pub fn default_target(&mut self, name: impl Into<ArcStr>) -> &mut Self {
        self.default = Some(name.into());
        self
    }

    pub fn producers(&self) -> impl Iterator<Item = &Producer> {
        self.producers.iter()
    }

    /// Validates every declaration against the producer set and `env` and
    /// builds the dependency graph. Nothing runs before this succeeds.
    pub fn finish(self, env: &Environment) -> Result<Graph, RegistryError> {
        if let Some(err) = self.rejected.into_iter().next() {
            return Err(err);
        }

        let mut graph = petgraph::Graph::<Node, ()>::new();
        let mut names: HashMap<ArcStr, NodeIndex> = HashMap::new();

        for producer in self.producers {
            if names.contains_key(&producer.name) {
                return Err(RegistryError::Duplicate(producer.name.to_string()));
            }
            let name = producer.name.clone();
            let index = graph.add_node(Node {
                producer,
                deps: Vec::new(),
            });
            names.insert(name, index);
        }

        let mut edges = Vec::new();
        for index in graph.node_indices() {
            let node = &graph[index];
            let mut deps = Vec::with_capacity(node.producer.deps.len());

            for dep in &node.producer.deps {
                if let Some(&source) = names.get(dep) {
                    edges.push((source, index));
                    deps.push(Dep::Producer(dep.clone(), source));
                } else if env.contains(dep) {
                    deps.push(Dep::Env(dep.clone()));
                } else {
                    return Err(RegistryError::UnknownDependency {
                        producer: node.producer.name.to_string(),
                        dependency: dep.to_string(),
                    });
                }
            }

            graph[index].deps = deps;
        }

        for (source, target) in edges {
            graph.add_edge(source, target, ());
        }

        detect_cycle(&graph)?;

        let default = match self.default {
            Some(name) => Some(
                *names
                    .get(&name)
                    .ok_or_else(|| RegistryError::UnknownTarget(name.to_string()))?,
            ),
            None => None,
        };

        Ok(Graph {
            graph,
            names,
            default,
        })
    }
}

/// Builder returned by [`Registry::provide`], [`Registry::target`] and
/// friends.
pub struct ProducerDef<'a> {
    registry: &'a mut Registry,
    name: ArcStr,
    kind: Kind,
    deps: Vec<ArcStr>,
    default: bool,
    noclean: bool,
    produces: Option<PathFn>,
}

impl<'a> ProducerDef<'a> {
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ArcStr>,
    {
        self.deps.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Makes this the default target. Not available on recipes.
    pub fn default(mut self) -> Self {
        self.default = true;
        self
    }

    /// Clean mode leaves this target's own artifact alone. Targets only.
    pub fn noclean(mut self) -> Self {
        self.noclean = true;
        self
    }

    /// Artifact written by a target, computed from its inputs. Clean mode
    /// removes it, also when it was built by an earlier process. Targets
    /// only.
    pub fn produces<F>(mut self, produces: F) -> Self
    where
        F: Fn(&Inputs) -> Option<Utf8PathBuf> + Send + Sync + 'static,
    {
        self.produces = Some(Arc::new(produces));
        self
    }

    /// Registers the producer with an async body. For the recipe kind this
    /// registers a factory taking no arguments.
    pub fn run<F, Fut, R>(mut self, run: F)
    where
        F: Fn(Inputs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Any + Send + Sync,
    {
        self.check(None);

        let mut producer = match self.kind {
            Kind::Provide => Producer::provide(self.name.clone(), self.deps, run),
            Kind::Target => Producer::target(self.name.clone(), self.deps, run),
            Kind::Recipe => {
                let name = self.name.clone();
                let run = Arc::new(run);
                Producer::factory(self.name.clone(), self.deps, move |inputs: &Inputs, _: &()| {
                    let run = run.clone();
                    let inputs = inputs.clone();
                    Ok(Recipe::builder(name.clone())
                        .arg(&())
                        .action(move |_, _| run(inputs.clone())))
                })
            }
        };

        if let Body::Target {
            produces, noclean, ..
        } = &mut producer.body
        {
            *produces = self.produces;
            *noclean = self.noclean;
        }

        if self.default {
            self.registry.default = Some(self.name);
        }
        self.registry.register(producer);
    }

    /// Registers a recipe factory. Only recipe declarations take one.
    pub fn make<A, F>(mut self, make: F)
    where
        A: Any + Send + Sync,
        F: Fn(&Inputs, &A) -> anyhow::Result<Recipe> + Send + Sync + 'static,
    {
        self.check((self.kind != Kind::Recipe).then_some("make"));

        let producer = Producer::factory(self.name, self.deps, make);
        self.registry.register(producer);
    }

    /// Records the first option that doesn't apply to this kind; `finish`
    /// reports it.
    fn check(&mut self, misuse: Option<&'static str>) {
        let option = misuse.or(match self.kind {
            Kind::Target => None,
            _ if self.noclean => Some("noclean"),
            _ if self.produces.is_some() => Some("produces"),
            Kind::Recipe if self.default => Some("default"),
            Kind::Provide | Kind::Recipe => None,
        });

        if let Some(option) = option {
            self.registry.rejected.push(RegistryError::Unsupported {
                producer: self.name.to_string(),
                kind: self.kind.to_string(),
                option,
            });
        }
    }
}

/// A resolved dependency of a node.
#[derive(Debug, Clone)]
pub(crate) enum Dep {
    Producer(ArcStr, NodeIndex),
    Env(ArcStr),
}

pub(crate) struct Node {
    pub(crate) producer: Producer,
    pub(crate) deps: Vec<Dep>,
}

/// Validated, acyclic producer graph. Edges point from a dependency to its
/// dependent.
pub struct Graph {
    graph: petgraph::Graph<Node, ()>,
    names: HashMap<ArcStr, NodeIndex>,
    default: Option<NodeIndex>,
}

impl Graph {
    /// Looks up a producer by name.
    pub fn resolve(&self, name: &str) -> Result<&Producer, RegistryError> {
        self.index(name).map(|index| &self.graph[index].producer)
    }

    pub fn default_target(&self) -> Option<&str> {
        self.default.map(|index| self.graph[index].producer.name())
    }

    pub fn producers(&self) -> impl Iterator<Item = &Producer> {
        self.graph.node_weights().map(|node| &node.producer)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub(crate) fn index(&self, name: &str) -> Result<NodeIndex, RegistryError> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| RegistryError::UnknownTarget(name.to_string()))
    }

    /// Named target, or the default one.
    pub(crate) fn target(&self, name: Option<&str>) -> Result<NodeIndex, RegistryError> {
        match name {
            Some(name) => self.index(name),
            None => self.default.ok_or(RegistryError::NoDefault),
        }
    }

    pub(crate) fn node(&self, index: NodeIndex) -> &Node {
        &self.graph[index]
    }

    pub(crate) fn indices(&self) -> impl Iterator<Item = NodeIndex> {
        self.graph.node_indices()
    }

    pub(crate) fn edges(&self) -> impl Iterator<Item = (NodeIndex, NodeIndex)> + '_ {
        self.graph
            .edge_references()
            .map(|edge| (edge.source(), edge.target()))
    }

    /// Transitive dependency closure of `root`, dependencies before
    /// dependents.
    pub(crate) fn closure(&self, root: NodeIndex) -> Vec<NodeIndex> {
        let mut order = Vec::new();
        let mut dfs = petgraph::visit::DfsPostOrder::new(petgraph::visit::Reversed(&self.graph), root);
        while let Some(index) = dfs.next(petgraph::visit::Reversed(&self.graph)) {
            order.push(index);
        }
        order
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let producer = &self.graph[index].producer;
            let name = producer.name().replace('"', "\\\"");
            let (open, close) = match producer.kind() {
                Kind::Provide => ("(", ")"),
                Kind::Target => ("[", "]"),
                Kind::Recipe => ("{{", "}}"),
            };
            writeln!(f, "    {}{open}\"{}\"{close}", index.index(), name)?;

            if self.default == Some(index) {
                writeln!(f, "    style {} stroke-width:3px", index.index())?;
            }

            for dep in &self.graph[index].deps {
                if let Dep::Env(key) = dep {
                    writeln!(f, "    env_{key}[/\"{key}\"/] -.-> {}", index.index())?;
                }
            }
        }

        for edge in self.graph.edge_references() {
            writeln!(f, "    {} --> {}", edge.source().index(), edge.target().index())?;
        }

        Ok(())
    }
}

/// Depth-first search with a "visiting" marker; a node met again while still
/// being visited closes a cycle, reported with its full path.
fn detect_cycle(graph: &petgraph::Graph<Node, ()>) -> Result<(), RegistryError> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Fresh,
        Visiting,
        Done,
    }

    fn visit(
        graph: &petgraph::Graph<Node, ()>,
        index: NodeIndex,
        marks: &mut [Mark],
        path: &mut Vec<NodeIndex>,
    ) -> Result<(), RegistryError> {
        match marks[index.index()] {
            Mark::Done => return Ok(()),
            Mark::Visiting => {
                let start = path.iter().position(|&i| i == index).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..]
                    .iter()
                    .map(|&i| graph[i].producer.name().to_string())
                    .collect();
                cycle.push(graph[index].producer.name().to_string());
                return Err(RegistryError::Cycle(CyclePath(cycle)));
            }
            Mark::Fresh => {}
        }

        marks[index.index()] = Mark::Visiting;
        path.push(index);

        for dep in &graph[index].deps {
            if let Dep::Producer(_, dep) = dep {
                visit(graph, *dep, marks, path)?;
            }
        }

        path.pop();
        marks[index.index()] = Mark::Done;
        Ok(())
    }

    let mut marks = vec![Mark::Fresh; graph.node_count()];
    let mut path = Vec::new();

    for index in graph.node_indices() {
        visit(graph, index, &mut marks, &mut path)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> Environment {
        Environment::builder()
            .default("CC", "clang++")
            .process_vars(Vec::<(String, String)>::new())
            .build()
    }

    #[test]
    fn test_kind_aliases() {
        assert_eq!("provide".parse::<Kind>().unwrap(), Kind::Provide);
        assert_eq!("task".parse::<Kind>().unwrap(), Kind::Target);
        assert_eq!("target".parse::<Kind>().unwrap(), Kind::Target);
        assert_eq!("action".parse::<Kind>().unwrap(), Kind::Recipe);
        assert_eq!("factory".parse::<Kind>().unwrap(), Kind::Recipe);
        assert!("decorator".parse::<Kind>().is_err());
    }

    #[test]
    fn test_finish_resolves_producers_and_env() {
        let mut registry = Registry::new();
        registry.provide("a").run(|_| async { Ok(1usize) });
        registry
            .target("b")
            .depends_on(["a", "CC"])
            .default()
            .run(|_| async { Ok(()) });

        let graph = registry.finish(&env()).unwrap();
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.default_target(), Some("b"));
        assert_eq!(graph.resolve("b").unwrap().kind(), Kind::Target);

        let deps: Vec<_> = graph.resolve("b").unwrap().dependencies().collect();
        assert_eq!(deps, vec!["a", "CC"]);
    }

    #[test]
    fn test_unknown_dependency() {
        let mut registry = Registry::new();
        registry
            .provide("a")
            .depends_on(["nope"])
            .run(|_| async { Ok(()) });

        let err = registry.finish(&env()).err().unwrap();
        assert!(matches!(
            err,
            RegistryError::UnknownDependency { ref producer, ref dependency }
                if producer == "a" && dependency == "nope"
        ));
    }

    #[test]
    fn test_duplicate_name() {
        let mut registry = Registry::new();
        registry.provide("a").run(|_| async { Ok(()) });
        registry.target("a").run(|_| async { Ok(()) });

        let err = registry.finish(&env()).err().unwrap();
        assert!(matches!(err, RegistryError::Duplicate(name) if name == "a"));
    }

    #[test]
    fn test_cycle_reports_full_path() {
        let mut registry = Registry::new();
        registry.provide("root").depends_on(["a"]).run(|_| async { Ok(()) });
        registry.provide("a").depends_on(["b"]).run(|_| async { Ok(()) });
        registry.provide("b").depends_on(["c"]).run(|_| async { Ok(()) });
        registry.provide("c").depends_on(["a"]).run(|_| async { Ok(()) });

        let err = registry.finish(&env()).err().unwrap();
        match err {
            RegistryError::Cycle(path) => {
                assert_eq!(path.0, vec!["a", "b", "c", "a"]);
                assert_eq!(path.to_string(), "a -> b -> c -> a");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_cycle() {
        let mut registry = Registry::new();
        registry.provide("a").depends_on(["a"]).run(|_| async { Ok(()) });

        let err = registry.finish(&env()).err().unwrap();
        assert!(matches!(err, RegistryError::Cycle(path) if path.0 == vec!["a", "a"]));
    }

    #[test]
    fn test_unknown_default() {
        let mut registry = Registry::new();
        registry.provide("a").run(|_| async { Ok(()) });
        registry.default_target("missing");

        let err = registry.finish(&env()).err().unwrap();
        assert!(matches!(err, RegistryError::UnknownTarget(_)));
    }

    #[test]
    fn test_closure_orders_dependencies_first() {
        let mut registry = Registry::new();
        registry.provide("a").run(|_| async { Ok(()) });
        registry.provide("b").depends_on(["a"]).run(|_| async { Ok(()) });
        registry.provide("unrelated").run(|_| async { Ok(()) });
        registry.target("c").depends_on(["b", "a"]).run(|_| async { Ok(()) });

        let graph = registry.finish(&env()).unwrap();
        let root = graph.index("c").unwrap();
        let names: Vec<_> = graph
            .closure(root)
            .into_iter()
            .map(|index| graph.node(index).producer.name().to_string())
            .collect();

        assert_eq!(names.len(), 3);
        assert_eq!(names.last().map(String::as_str), Some("c"));
        let a = names.iter().position(|n| n == "a").unwrap();
        let b = names.iter().position(|n| n == "b").unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_mermaid_output() {
        let mut registry = Registry::new();
        registry.provide("a").run(|_| async { Ok(()) });
        registry
            .target("b")
            .depends_on(["a", "CC"])
            .run(|_| async { Ok(()) });

        let graph = registry.finish(&env()).unwrap();
        let text = graph.to_string();
        assert!(text.starts_with("graph LR"));
        assert!(text.contains("0(\"a\")"));
        assert!(text.contains("1[\"b\"]"));
        assert!(text.contains("0 --> 1"));
        assert!(text.contains("env_CC"));
    }

    fn unsupported(registry: Registry) -> (String, String, &'static str) {
        match registry.finish(&env()) {
            Err(RegistryError::Unsupported {
                producer,
                kind,
                option,
            }) => (producer, kind, option),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("misused option was accepted"),
        }
    }

    #[test]
    fn test_target_only_options_are_rejected_elsewhere() {
        let mut registry = Registry::new();
        registry.provide("sources").noclean().run(|_| async { Ok(()) });
        assert_eq!(
            unsupported(registry),
            ("sources".to_string(), "provide".to_string(), "noclean")
        );

        let mut registry = Registry::new();
        registry
            .recipe("compile")
            .produces(|_| Some(Utf8PathBuf::from("a.out")))
            .make(|_, _: &String| Ok(Recipe::builder("compile").action(|_, _| async { Ok(()) })));
        assert_eq!(unsupported(registry).2, "produces");
    }

    #[test]
    fn test_default_recipe_is_rejected() {
        let mut registry = Registry::new();
        registry
            .recipe("compile")
            .default()
            .make(|_, _: &String| Ok(Recipe::builder("compile").action(|_, _| async { Ok(()) })));
        assert_eq!(
            unsupported(registry),
            ("compile".to_string(), "recipe".to_string(), "default")
        );

        let mut registry = Registry::new();
        registry.recipe("touch").default().run(|_| async { Ok(()) });
        assert_eq!(unsupported(registry).2, "default");
    }

    #[test]
    fn test_make_needs_recipe_declaration() {
        let mut registry = Registry::new();
        registry
            .target("install")
            .make(|_, _: &String| Ok(Recipe::builder("install").action(|_, _| async { Ok(()) })));
        assert_eq!(
            unsupported(registry),
            ("install".to_string(), "target".to_string(), "make")
        );
    }

    #[test]
    fn test_default_provider_is_accepted() {
        let mut registry = Registry::new();
        registry.provide("sources").default().run(|_| async { Ok(()) });
        let graph = registry.finish(&env()).unwrap();
        assert_eq!(graph.default_target(), Some("sources"));
    }
}
