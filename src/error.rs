use std::fmt;
use std::sync::Arc;

use camino::Utf8PathBuf;
use thiserror::Error;

/// Dependency path that closes on itself, e.g. `a -> b -> c -> a`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CyclePath(pub Vec<String>);

impl fmt::Display for CyclePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" -> "))
    }
}

/// Errors found while validating the producer graph. All of them are
/// reported before any side effect runs.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Producer '{0}' is declared more than once")]
    Duplicate(String),

    #[error("Producer '{producer}' depends on unknown name '{dependency}'")]
    UnknownDependency { producer: String, dependency: String },

    #[error("Dependency cycle detected: {0}")]
    Cycle(CyclePath),

    #[error("Unknown target '{0}'")]
    UnknownTarget(String),

    #[error("No target given and no default target declared")]
    NoDefault,

    #[error("'{option}' is not supported on {kind} '{producer}'")]
    Unsupported {
        producer: String,
        kind: String,
        option: &'static str,
    },
}

/// Errors raised by the shell executor.
#[derive(Debug, Error)]
pub enum ShellError {
    #[error("Unknown placeholder '{{{name}}}' in command template: {template}")]
    Placeholder { name: String, template: String },

    #[error("Unterminated placeholder in command template: {0}")]
    Template(String),

    #[error("Argument '{0}' is a recipe that has not been resolved")]
    Unresolved(String),

    #[error("Argument '{name}' cannot be rendered into a command line")]
    Unrenderable { name: String },

    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with status {}{}", display_code(.code), display_output(.output))]
    Failed {
        command: String,
        code: Option<i32>,
        output: String,
    },

    #[error("`{0}` was cancelled")]
    Cancelled(String),
}

fn display_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "<signal>".to_string(),
    }
}

fn display_output(output: &str) -> String {
    let output = output.trim_end();
    if output.is_empty() {
        String::new()
    } else {
        format!(":\n{output}")
    }
}

/// Shared cause of a failed recipe. Every caller awaiting the same recipe
/// receives a clone of the same cause.
#[derive(Clone)]
pub struct Cause(Arc<anyhow::Error>);

impl Cause {
    pub(crate) fn new(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }

    /// The underlying error.
    pub fn error(&self) -> &anyhow::Error {
        &self.0
    }

    /// Exit status of the child process at the root of this failure, if any.
    pub fn exit_code(&self) -> Option<i32> {
        self.0.chain().find_map(|err| {
            if let Some(ShellError::Failed { code, .. }) = err.downcast_ref::<ShellError>() {
                return *code;
            }
            if let Some(err) = err.downcast_ref::<StressError>() {
                return err.exit_code();
            }
            err.downcast_ref::<RecipeError>().and_then(RecipeError::exit_code)
        })
    }
}

/// Whether an action error only reports that the run was already failing.
pub(crate) fn is_abort(err: &anyhow::Error) -> bool {
    err.chain().any(|err| {
        matches!(err.downcast_ref::<RecipeError>(), Some(RecipeError::Aborted(_)))
            || matches!(err.downcast_ref::<StressError>(), Some(StressError::Aborted { .. }))
    })
}

impl fmt::Debug for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

impl std::error::Error for Cause {}

/// Failure of a single recipe. Cloneable so it can be cached on the recipe
/// and handed to every awaiting caller.
#[derive(Debug, Clone, Error)]
pub enum RecipeError {
    #[error("Recipe '{sigil}' failed: {cause}")]
    Failed { sigil: String, cause: Cause },

    #[error("Recipe '{0}' was not started because the run is failing")]
    Aborted(String),
}

impl RecipeError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            RecipeError::Failed { cause, .. } => cause.exit_code(),
            RecipeError::Aborted(_) => None,
        }
    }
}

/// Errors raised by [`Inputs`](crate::Inputs) accessors inside producers.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("'{0}' is not a declared dependency of this producer")]
    Missing(String),

    #[error("Dependency '{name}' is not a {expected}")]
    WrongType {
        name: String,
        expected: &'static str,
    },
}

/// Errors reported by a scheduler run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Producer '{name}' failed:\n{cause}")]
    Producer { name: String, cause: Cause },

    #[error("Producer '{name}': {source}")]
    Recipe {
        name: String,
        #[source]
        source: RecipeError,
    },

    #[error("Run was aborted before '{0}' could start")]
    Aborted(String),
}

impl RunError {
    /// Exit status to report for this failure. Propagates the status of the
    /// child process where one is known.
    pub fn exit_code(&self) -> i32 {
        let code = match self {
            RunError::Producer { cause, .. } => cause.exit_code(),
            RunError::Recipe { source, .. } => source.exit_code(),
            _ => None,
        };

        match code {
            Some(code) if code != 0 => code,
            _ => 1,
        }
    }
}

/// Failure of a stress run.
#[derive(Debug, Error)]
pub enum StressError {
    /// The test failed at the 0-based `iteration`.
    #[error("Stress run of '{name}' failed at iteration {iteration} of {cycles}: {source}")]
    Failed {
        name: String,
        iteration: usize,
        cycles: usize,
        #[source]
        source: RecipeError,
    },

    /// The run was already failing; `completed` cycles ran before that.
    #[error("Stress run of '{name}' was aborted after {completed} of {cycles} cycle(s) because the run is failing")]
    Aborted {
        name: String,
        completed: usize,
        cycles: usize,
    },
}

impl StressError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            StressError::Failed { source, .. } => source.exit_code(),
            StressError::Aborted { .. } => None,
        }
    }
}

/// Errors of an inverse (clean) action. Clean is best-effort, so these are
/// logged and never abort the clean traversal.
#[derive(Debug, Error)]
pub enum CleanError {
    #[error("Artifact {0} is already missing")]
    Missing(Utf8PathBuf),

    #[error("Couldn't remove artifact {path}: {source}")]
    Remove {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Inverse action of '{sigil}' failed: {source}")]
    Action {
        sigil: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Errors of the file helpers.
#[derive(Debug, Error)]
pub enum FilesError {
    #[error("Invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error(transparent)]
    Glob(#[from] glob::GlobError),

    #[error("Path {0:?} is not valid UTF-8")]
    NonUtf8(std::path::PathBuf),
}

/// Errors while reading typed settings out of the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Setting {key} expects {expected}, got '{value}'")]
    Invalid {
        key: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("Malformed environment override '{0}', expected KEY=VALUE")]
    Override(String),

    #[error("Couldn't serialize the environment: {0}")]
    Json(#[from] serde_json::Error),
}

/// Top level error of the engine front end.
#[derive(Debug, Error)]
pub enum BakeryError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to build runtime")]
    Runtime(#[from] std::io::Error),

    #[error("Couldn't set up logging: {0}")]
    Logging(String),
}

impl BakeryError {
    pub fn exit_code(&self) -> i32 {
        match self {
            BakeryError::Run(err) => err.exit_code(),
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_path_display() {
        let path = CyclePath(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(path.to_string(), "a -> b -> a");
    }

    #[test]
    fn test_exit_code_propagates_from_shell() {
        let shell = ShellError::Failed {
            command: "false".into(),
            code: Some(3),
            output: String::new(),
        };
        let cause = Cause::new(anyhow::Error::new(shell).context("running tests"));
        let err = RunError::Producer {
            name: "run_tests".into(),
            cause,
        };
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_through_stress() {
        let shell = ShellError::Failed {
            command: "test/json".into(),
            code: Some(4),
            output: String::new(),
        };
        let stress = StressError::Failed {
            name: "json".into(),
            iteration: 2,
            cycles: 10,
            source: RecipeError::Failed {
                sigil: "json@0".into(),
                cause: Cause::new(anyhow::Error::new(shell)),
            },
        };
        let cause = Cause::new(anyhow::Error::new(stress));
        assert_eq!(cause.exit_code(), Some(4));
    }

    #[test]
    fn test_exit_code_defaults_to_one() {
        let cause = Cause::new(anyhow::anyhow!("boom"));
        let err = RunError::Recipe {
            name: "x".into(),
            source: RecipeError::Failed {
                sigil: "x@0".into(),
                cause,
            },
        };
        assert_eq!(err.exit_code(), 1);
        assert_eq!(RunError::Aborted("y".into()).exit_code(), 1);
    }

    #[test]
    fn test_failed_display_includes_output() {
        let err = ShellError::Failed {
            command: "cc x.c".into(),
            code: Some(1),
            output: "x.c:1: error\n".into(),
        };
        let text = err.to_string();
        assert!(text.contains("exited with status 1"));
        assert!(text.contains("x.c:1: error"));
    }

    #[test]
    fn test_abort_is_found_through_context() {
        let aborted = anyhow::Error::new(RecipeError::Aborted("json@0".into())).context("running tests");
        assert!(is_abort(&aborted));

        let stress = anyhow::Error::new(StressError::Aborted {
            name: "json".into(),
            completed: 3,
            cycles: 10,
        });
        assert!(is_abort(&stress));

        assert!(!is_abort(&anyhow::anyhow!("boom")));
    }
}
