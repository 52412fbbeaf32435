// Command Runner
// Step action that runs an external program inside the node's staging directory

use crate::step::descriptor::{ActionContext, StepAction};
use crate::step::models::{Failure, Inputs, Outputs, Value};

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Number of stderr lines kept in a failure
const STDERR_TAIL_LINES: usize = 20;

/// Where a command output slot takes its value from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOutput {
    /// File relative to the work dir (placeholders allowed); must exist after the run
    File(String),
    /// Trimmed standard output
    Stdout,
}

/// Runs an argv template as a child process.
///
/// Placeholders `{slot}` are replaced by the input's string rendering;
/// `{work_dir}`, `{node}` and `{instance}` come from the action context.
#[derive(Debug, Clone, Default)]
pub struct CommandAction {
    argv: Vec<String>,
    env: BTreeMap<String, String>,
    outputs: BTreeMap<String, CommandOutput>,
    timeout: Option<Duration>,
}

impl CommandAction {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn output_file(mut self, slot: impl Into<String>, relative: impl Into<String>) -> Self {
        self.outputs
            .insert(slot.into(), CommandOutput::File(relative.into()));
        self
    }

    pub fn output_stdout(mut self, slot: impl Into<String>) -> Self {
        self.outputs.insert(slot.into(), CommandOutput::Stdout);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }
}

/// Everything that shapes a command's result besides its inputs
#[derive(Serialize)]
struct CommandIdentity<'a> {
    argv: &'a [String],
    env: &'a BTreeMap<String, String>,
    outputs: &'a BTreeMap<String, CommandOutput>,
    timeout_ms: Option<u64>,
}

#[async_trait::async_trait]
impl StepAction for CommandAction {
    async fn run(&self, inputs: &Inputs, ctx: &ActionContext) -> Result<Outputs, Failure> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| Failure::new("command is empty"))?;
        let program = resolve_program(&substitute(program, inputs, ctx)?)?;
        let args = args
            .iter()
            .map(|arg| substitute(arg, inputs, ctx))
            .collect::<Result<Vec<_>, _>>()?;

        let mut cmd = Command::new(&program);
        cmd.args(&args);
        cmd.current_dir(&ctx.work_dir);
        for (key, value) in &self.env {
            cmd.env(key, substitute(value, inputs, ctx)?);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // cancellation drops the future; the child must not outlive it
        cmd.kill_on_drop(true);

        debug!(node = %ctx.node_id, program = %program.display(), ?args, "spawning command");

        let child = cmd.spawn().map_err(|e| {
            Failure::new(format!(
                "failed to spawn '{}': {}",
                program.display(),
                e
            ))
        })?;

        let output = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, child.wait_with_output())
                .await
                .map_err(|_| Failure::new(format!("command timed out after {:?}", timeout)))?,
            None => child.wait_with_output().await,
        }
        .map_err(|e| Failure::new(format!("failed to wait for command: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            let code = output.status.code();
            let message = match code {
                Some(code) => format!("'{}' exited with code {}", program.display(), code),
                None => format!("'{}' was terminated by a signal", program.display()),
            };
            return Err(Failure::new(message)
                .with_exit_code(code)
                .with_details(tail(&stderr, STDERR_TAIL_LINES)));
        }

        let mut outputs = Outputs::new();
        for (slot, source) in &self.outputs {
            let value = match source {
                CommandOutput::Stdout => Value::String(stdout.trim().to_string()),
                CommandOutput::File(relative) => {
                    let path = ctx.work_dir.join(substitute(relative, inputs, ctx)?);
                    if !path.exists() {
                        return Err(Failure::new(format!(
                            "output '{}' was not written to {}",
                            slot,
                            path.display()
                        ))
                        .with_details(tail(&stderr, STDERR_TAIL_LINES)));
                    }
                    Value::Path(path)
                }
            };
            outputs.insert(slot.clone(), value);
        }

        Ok(outputs)
    }

    fn identity(&self) -> Option<String> {
        let identity = CommandIdentity {
            argv: &self.argv,
            env: &self.env,
            outputs: &self.outputs,
            timeout_ms: self
                .timeout
                .map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
        };
        serde_json::to_string(&identity).ok()
    }
}

/// Replace `{name}` placeholders; `{{` and `}}` are literal braces
fn substitute(template: &str, inputs: &Inputs, ctx: &ActionContext) -> Result<String, Failure> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if !closed {
                    return Err(Failure::new(format!(
                        "unterminated placeholder in '{}'",
                        template
                    )));
                }
                out.push_str(&lookup(name.trim(), inputs, ctx)?);
            }
            c => out.push(c),
        }
    }

    Ok(out)
}

fn lookup(name: &str, inputs: &Inputs, ctx: &ActionContext) -> Result<String, Failure> {
    match name {
        "work_dir" => Ok(ctx.work_dir.display().to_string()),
        "node" => Ok(ctx.node_id.clone()),
        "instance" => Ok(ctx.instance.clone()),
        slot => inputs
            .get(slot)
            .map(Value::as_string)
            .ok_or_else(|| Failure::new(format!("no value for placeholder '{{{}}}'", slot))),
    }
}

fn resolve_program(program: &str) -> Result<PathBuf, Failure> {
    let path = PathBuf::from(program);
    if path.components().count() > 1 {
        return Ok(path);
    }
    which::which(program)
        .map_err(|e| Failure::new(format!("program '{}' not found: {}", program, e)))
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn ctx(dir: &tempfile::TempDir) -> ActionContext {
        ActionContext {
            node_id: "spec".to_string(),
            instance: "subject=A".to_string(),
            work_dir: dir.path().to_path_buf(),
        }
    }

    fn inputs(pairs: &[(&str, Value)]) -> Inputs {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_stdout_output() {
        let dir = tempfile::tempdir().unwrap();
        let action = CommandAction::new(["echo", "subject-{subject}"]).output_stdout("label");

        let out = action
            .run(&inputs(&[("subject", Value::from("A"))]), &ctx(&dir))
            .await
            .unwrap();
        assert_eq!(out.get("label"), Some(&Value::from("subject-A")));
    }

    #[tokio::test]
    async fn test_file_output_in_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let action = CommandAction::new(["sh", "-c", "printf %s \"$SUBJECT\" > {subject}.txt"])
            .env("SUBJECT", "{subject}")
            .output_file("onsets", "{subject}.txt");

        let out = action
            .run(&inputs(&[("subject", Value::from("B"))]), &ctx(&dir))
            .await
            .unwrap();
        let path = dir.path().join("B.txt");
        assert_eq!(out.get("onsets"), Some(&Value::Path(path.clone())));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "B");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let action = CommandAction::new(["sh", "-c", "echo 'design is singular' >&2; exit 3"]);

        let failure = action.run(&Inputs::new(), &ctx(&dir)).await.unwrap_err();
        assert_eq!(failure.exit_code, Some(3));
        assert_eq!(failure.details.as_deref(), Some("design is singular"));
    }

    #[tokio::test]
    async fn test_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let action = CommandAction::new(["sleep", "5"]).timeout(Duration::from_millis(100));

        let failure = action.run(&Inputs::new(), &ctx(&dir)).await.unwrap_err();
        assert!(failure.message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_missing_file_output() {
        let dir = tempfile::tempdir().unwrap();
        let action = CommandAction::new(["true"]).output_file("betas", "betas.nii");

        let failure = action.run(&Inputs::new(), &ctx(&dir)).await.unwrap_err();
        assert!(failure.message.contains("betas"));
    }

    #[tokio::test]
    async fn test_unknown_program_and_placeholder() {
        let dir = tempfile::tempdir().unwrap();

        let missing = CommandAction::new(["definitely-not-a-real-program-xyz"]);
        let failure = missing.run(&Inputs::new(), &ctx(&dir)).await.unwrap_err();
        assert!(failure.message.contains("not found"));

        let unbound = CommandAction::new(["echo", "{nope}"]);
        let failure = unbound.run(&Inputs::new(), &ctx(&dir)).await.unwrap_err();
        assert!(failure.message.contains("nope"));
    }

    #[test]
    fn test_substitute_context_and_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(&dir);
        let rendered = substitute("{node}/{instance} {{x}}", &Inputs::new(), &ctx).unwrap();
        assert_eq!(rendered, "spec/subject=A {x}");
    }

    #[test]
    fn test_identity_tracks_configuration() {
        let base = CommandAction::new(["smooth", "fwhm=6"]).output_file("out", "out.nii");
        let same = CommandAction::new(["smooth", "fwhm=6"]).output_file("out", "out.nii");
        assert!(base.identity().is_some());
        assert_eq!(base.identity(), same.identity());

        let variants = [
            CommandAction::new(["smooth", "fwhm=8"]).output_file("out", "out.nii"),
            base.clone().env("FSLDIR", "/opt/fsl"),
            base.clone().timeout(Duration::from_secs(30)),
            CommandAction::new(["smooth", "fwhm=6"]).output_stdout("out"),
        ];
        for variant in &variants {
            assert_ne!(base.identity(), variant.identity(), "{:?}", variant);
        }
    }

    #[test]
    fn test_tail_keeps_last_lines() {
        assert_eq!(tail("a\nb\nc", 2), "b\nc");
        assert_eq!(tail("", 2), "");
    }
}
