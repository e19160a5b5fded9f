//! Shell executor.
//!
//! A [`Shell`] is a command template such as `"{CC} {CFLAGS} {src} -o
//! {output}"` together with its substitutions. Placeholders are looked up in
//! the explicit substitutions first and in the [`Environment`] second. Every
//! substituted word is shell-quoted, list values word by word, and the
//! rendered line runs under `sh -c` (`cmd /C` with double-quote quoting on
//! Windows).
//!
//! Commands run either *captured* (output buffered and returned) or
//! *interactive* (the child inherits the terminal). Both modes go through the
//! [`Terminal`] lock: captured commands share it, interactive commands take
//! it exclusively, so nothing else runs while a child owns the terminal.
//! Progress bars and log lines are held back until an interactive child
//! exits.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::io;
use std::process::{Command as StdCommand, ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::core::Dynamic;
use crate::env::Environment;
use crate::error::ShellError;
use crate::recipe::Recipe;

/// How a child process is attached to the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Mode {
    /// Standard streams are piped and buffered.
    #[default]
    Captured,
    /// Standard streams are inherited, the child owns the terminal.
    Interactive,
}

/// Exclusive/shared access to the controlling terminal.
#[derive(Clone, Default)]
pub struct Terminal(Arc<RwLock<()>>);

impl Terminal {
    pub async fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.0.read().await
    }

    pub async fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.0.write().await
    }
}

impl std::fmt::Debug for Terminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Terminal")
    }
}

/// A value substituted into a command template.
#[derive(Debug, Clone)]
pub enum Arg {
    Text(String),
    List(Vec<String>),
    /// Output of another recipe. The recipe becomes an upstream dependency
    /// of the command.
    Recipe(Recipe),
}

impl Hash for Arg {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Arg::Text(text) => {
                0u8.hash(state);
                text.hash(state);
            }
            Arg::List(list) => {
                1u8.hash(state);
                list.hash(state);
            }
            Arg::Recipe(recipe) => {
                2u8.hash(state);
                recipe.sigil().hash(state);
            }
        }
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Arg::Text(value.to_string())
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Arg::Text(value)
    }
}

impl From<&Utf8Path> for Arg {
    fn from(value: &Utf8Path) -> Self {
        Arg::Text(value.to_string())
    }
}

impl From<Utf8PathBuf> for Arg {
    fn from(value: Utf8PathBuf) -> Self {
        Arg::Text(value.into_string())
    }
}

impl From<&Utf8PathBuf> for Arg {
    fn from(value: &Utf8PathBuf) -> Self {
        Arg::Text(value.to_string())
    }
}

impl From<Vec<String>> for Arg {
    fn from(value: Vec<String>) -> Self {
        Arg::List(value)
    }
}

impl From<Vec<Utf8PathBuf>> for Arg {
    fn from(value: Vec<Utf8PathBuf>) -> Self {
        Arg::List(value.into_iter().map(Utf8PathBuf::into_string).collect())
    }
}

impl From<Recipe> for Arg {
    fn from(value: Recipe) -> Self {
        Arg::Recipe(value)
    }
}

/// Result of a finished child process.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub command: String,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl Outcome {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// A command template with its substitutions.
#[derive(Debug, Clone)]
pub struct Shell {
    template: String,
    args: BTreeMap<String, Arg>,
    vars: BTreeMap<String, String>,
    cwd: Option<Utf8PathBuf>,
    mode: Mode,
    output: Option<Utf8PathBuf>,
    check: Vec<Utf8PathBuf>,
    name: Option<String>,
}

impl Shell {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            args: BTreeMap::new(),
            vars: BTreeMap::new(),
            cwd: None,
            mode: Mode::Captured,
            output: None,
            check: Vec::new(),
            name: None,
        }
    }

    /// Binds placeholder `name` to `value`.
    pub fn arg(mut self, name: impl Into<String>, value: impl Into<Arg>) -> Self {
        self.args.insert(name.into(), value.into());
        self
    }

    /// Sets an extra variable in the child's process environment.
    pub fn var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<Utf8PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn interactive(self) -> Self {
        self.mode(Mode::Interactive)
    }

    /// Declares the artifact this command produces and binds `{output}`.
    pub fn output(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        let path = path.into();
        self.args
            .entry("output".to_string())
            .or_insert_with(|| Arg::from(&path));
        self.output = Some(path);
        self
    }

    /// Source files the declared output is compared against when deciding
    /// whether the command can be skipped.
    pub fn check<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Utf8PathBuf>,
    {
        self.check.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Name of the recipe built from this command; `sh` by default.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn get_mode(&self) -> Mode {
        self.mode
    }

    /// Renders the command line. `resolved` holds the rendered outputs of
    /// recipe-valued arguments.
    pub fn render(
        &self,
        env: &Environment,
        resolved: &BTreeMap<String, Vec<String>>,
    ) -> Result<String, ShellError> {
        let mut line = String::with_capacity(self.template.len());
        let mut chars = self.template.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    line.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    line.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) => name.push(c),
                            None => return Err(ShellError::Template(self.template.clone())),
                        }
                    }
                    let words = self.lookup(&name, env, resolved)?;
                    line.push_str(&words.iter().map(|w| quote(w)).collect::<Vec<_>>().join(" "));
                }
                c => line.push(c),
            }
        }

        Ok(line)
    }

    fn lookup(
        &self,
        name: &str,
        env: &Environment,
        resolved: &BTreeMap<String, Vec<String>>,
    ) -> Result<Vec<String>, ShellError> {
        match self.args.get(name) {
            Some(Arg::Text(text)) => Ok(vec![text.clone()]),
            Some(Arg::List(list)) => Ok(list.clone()),
            Some(Arg::Recipe(_)) => resolved
                .get(name)
                .cloned()
                .ok_or_else(|| ShellError::Unresolved(name.to_string())),
            None => match env.get(name) {
                Some(value) => Ok(value.words().into_iter().map(str::to_string).collect()),
                None => Err(ShellError::Placeholder {
                    name: name.to_string(),
                    template: self.template.clone(),
                }),
            },
        }
    }

    /// Runs the command once. Recipe-valued arguments must have been
    /// substituted already, see [`Shell::into_recipe`].
    pub async fn run(&self, ctx: &Context) -> Result<Outcome, ShellError> {
        self.run_resolved(ctx, &BTreeMap::new()).await
    }

    pub(crate) async fn run_resolved(
        &self,
        ctx: &Context,
        resolved: &BTreeMap<String, Vec<String>>,
    ) -> Result<Outcome, ShellError> {
        let line = self.render(ctx.env(), resolved)?;

        let mut cmd = system_shell(&line);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd.envs(&self.vars);

        let held = ctx.holds_terminal();

        match self.mode {
            Mode::Captured => {
                let _terminal = match held {
                    true => None,
                    false => Some(ctx.terminal().shared().await),
                };
                let mut cmd = Command::from(cmd);
                cmd.kill_on_drop(true)
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped());
                execute(cmd, line, ctx).await
            }
            Mode::Interactive => {
                let _terminal = match held {
                    true => None,
                    false => Some(ctx.terminal().exclusive().await),
                };
                cmd.stdin(Stdio::inherit())
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit());
                execute_interactive(cmd, line, ctx).await
            }
        }
    }

    /// Turns the command into a recipe. Recipe-valued arguments become
    /// upstream ingredients and are substituted with their outputs.
    pub fn into_recipe(self) -> Recipe {
        let name = self.name.clone().unwrap_or_else(|| "sh".to_string());

        let mut builder = Recipe::builder(name)
            .arg(&self.template)
            .arg(&self.args)
            .arg(&self.vars)
            .arg(&self.cwd)
            .arg(&self.mode)
            .check(self.check.iter().cloned());

        if let Some(output) = &self.output {
            builder = builder.output(output.clone());
        }

        let mut slots = Vec::new();
        for (name, arg) in &self.args {
            if let Arg::Recipe(recipe) = arg {
                slots.push(name.clone());
                builder = builder.input(recipe.clone());
            }
        }

        let shell = Arc::new(self);
        builder.finish(Arc::new(move |ctx: Context, inputs: Vec<Dynamic>| {
            let shell = shell.clone();
            let slots = slots.clone();
            async move {
                let mut resolved = BTreeMap::new();
                for (name, value) in slots.into_iter().zip(&inputs) {
                    let words = render_dynamic(value)
                        .ok_or_else(|| ShellError::Unrenderable { name: name.clone() })?;
                    resolved.insert(name, words);
                }

                let outcome = shell.run_resolved(&ctx, &resolved).await?;

                if !outcome.stdout.is_empty() {
                    tracing::debug!(command = %outcome.command, "{}", outcome.stdout.trim_end());
                }

                let output: Dynamic = match &shell.output {
                    Some(path) => Arc::new(path.clone()),
                    None => Arc::new(outcome),
                };

                Ok::<_, anyhow::Error>(output)
            }
            .boxed()
        }))
    }
}

impl From<Shell> for Recipe {
    fn from(value: Shell) -> Self {
        value.into_recipe()
    }
}

/// Renders a recipe output into command line words.
pub(crate) fn render_dynamic(value: &Dynamic) -> Option<Vec<String>> {
    if let Some(path) = value.downcast_ref::<Utf8PathBuf>() {
        return Some(vec![path.to_string()]);
    }
    if let Some(text) = value.downcast_ref::<String>() {
        return Some(vec![text.clone()]);
    }
    if let Some(paths) = value.downcast_ref::<Vec<Utf8PathBuf>>() {
        return Some(paths.iter().map(ToString::to_string).collect());
    }
    if let Some(list) = value.downcast_ref::<Vec<String>>() {
        return Some(list.clone());
    }
    if let Some(values) = value.downcast_ref::<Vec<Dynamic>>() {
        let mut words = Vec::new();
        for value in values {
            words.extend(render_dynamic(value)?);
        }
        return Some(words);
    }
    None
}

#[cfg(not(windows))]
fn quote(word: &str) -> Cow<'_, str> {
    quote_posix(word)
}

#[cfg(windows)]
fn quote(word: &str) -> Cow<'_, str> {
    quote_cmd(word)
}

#[cfg_attr(windows, allow(dead_code))]
fn quote_posix(word: &str) -> Cow<'_, str> {
    shlex::try_quote(word).unwrap_or_else(|_| Cow::Owned(format!("'{}'", word.replace('\'', "'\\''"))))
}

/// Quoting understood by `cmd /C`: double quotes around words with spaces or
/// metacharacters, inner double quotes doubled.
#[cfg_attr(not(windows), allow(dead_code))]
fn quote_cmd(word: &str) -> Cow<'_, str> {
    const SPECIAL: &[char] = &[' ', '\t', '"', '&', '|', '<', '>', '^', '(', ')', '%', '!', ','];

    if !word.is_empty() && !word.contains(SPECIAL) {
        return Cow::Borrowed(word);
    }
    Cow::Owned(format!("\"{}\"", word.replace('"', "\"\"")))
}

#[cfg(not(windows))]
fn system_shell(line: &str) -> StdCommand {
    let mut cmd = StdCommand::new("sh");
    cmd.arg("-c").arg(line);
    cmd
}

#[cfg(windows)]
fn system_shell(line: &str) -> StdCommand {
    let mut cmd = StdCommand::new("cmd");
    cmd.arg("/C").arg(line);
    cmd
}

async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buffer = Vec::new();
    if let Some(mut pipe) = pipe
        && let Err(err) = pipe.read_to_end(&mut buffer).await
    {
        tracing::warn!("Couldn't read child output: {err}");
    }
    buffer
}

async fn execute(mut cmd: Command, line: String, ctx: &Context) -> Result<Outcome, ShellError> {
    tracing::debug!(command = %line, "spawning");
    let start = Instant::now();

    let mut child = cmd.spawn().map_err(|source| ShellError::Spawn {
        command: line.clone(),
        source,
    })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let cancel = ctx.cancel_token();

    let finished = tokio::select! {
        result = async { tokio::join!(drain(stdout), drain(stderr), child.wait()) } => Some(result),
        _ = cancel.cancelled() => None,
    };

    let Some((stdout, stderr, status)) = finished else {
        if let Err(err) = child.kill().await {
            tracing::warn!(command = %line, "Couldn't kill child: {err}");
        }
        return Err(ShellError::Cancelled(line));
    };

    let status = status.map_err(|source| ShellError::Spawn {
        command: line.clone(),
        source,
    })?;

    conclude(
        status,
        Outcome {
            command: line,
            code: status.code(),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            duration: start.elapsed(),
        },
    )
}

/// Runs a child that inherits the terminal. It is waited for on a blocking
/// thread while the progress display is suspended, so bars stop ticking and
/// log lines from elsewhere wait until the child exits.
async fn execute_interactive(
    mut cmd: StdCommand,
    line: String,
    ctx: &Context,
) -> Result<Outcome, ShellError> {
    tracing::debug!(command = %line, "spawning interactive");
    let start = Instant::now();
    let cancel = ctx.cancel_token();

    let waited = tokio::task::spawn_blocking(move || {
        tracing_indicatif::suspend_tracing_indicatif(|| wait_interactive(&mut cmd, &cancel))
    })
    .await
    .map_err(io::Error::other)
    .and_then(|result| result);

    let status = match waited {
        Ok(Some(status)) => status,
        Ok(None) => return Err(ShellError::Cancelled(line)),
        Err(source) => {
            return Err(ShellError::Spawn {
                command: line,
                source,
            });
        }
    };

    conclude(
        status,
        Outcome {
            command: line,
            code: status.code(),
            stdout: String::new(),
            stderr: String::new(),
            duration: start.elapsed(),
        },
    )
}

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Nothing may be logged in here: log output is suspended on this thread.
/// `None` when the child was killed after cancellation.
fn wait_interactive(cmd: &mut StdCommand, cancel: &CancellationToken) -> io::Result<Option<ExitStatus>> {
    let mut child = cmd.spawn()?;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if cancel.is_cancelled() {
            // Fails only when the child exited in the meantime.
            let _ = child.kill();
            child.wait()?;
            return Ok(None);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

fn conclude(status: ExitStatus, outcome: Outcome) -> Result<Outcome, ShellError> {
    if status.success() {
        Ok(outcome)
    } else {
        let mut output = outcome.stdout;
        output.push_str(&outcome.stderr);
        Err(ShellError::Failed {
            command: outcome.command,
            code: outcome.code,
            output,
        })
    }
}
