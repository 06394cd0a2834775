use crate::callback::EvaluationCallback;
use crate::documents::Documents;
use crate::engine::{Flow, FlowEngine};
use crate::error::RunnerError;
use crate::single::TaskKind;
use crate::{FlowOptions, TrialParameters};
use anyhow::{anyhow, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use tracing::debug;

/// Flow engine that executes an external command once per batch.
///
/// A definition file looks like:
///
/// ```yaml
/// command: [python, ./encode.py, --top-k, "${TOP_K}"]
/// env:
///   MODEL: ${MODEL}
/// workdir: .
/// ```
///
/// `${NAME}` is replaced by the trial parameter `NAME` when the definition is
/// loaded. Each batch is written to the command's stdin as JSONL; every
/// non-blank stdout line is one JSON response handed to the callback.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandEngine;

impl CommandEngine {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug, Deserialize)]
struct FlowDefinition {
    command: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    workdir: Option<String>,
}

impl FlowEngine for CommandEngine {
    fn load(&self, definition: &Path, context: &TrialParameters) -> Result<Box<dyn Flow>> {
        let raw = fs::read_to_string(definition)
            .map_err(|e| anyhow!("failed to read flow definition {}: {}", definition.display(), e))?;
        let parsed: FlowDefinition = serde_yaml::from_str(&raw)
            .map_err(|e| anyhow!("invalid flow definition {}: {}", definition.display(), e))?;
        let base_dir = definition.parent().unwrap_or(Path::new("."));

        let mut command = Vec::with_capacity(parsed.command.len());
        for part in &parsed.command {
            command.push(substitute(part, context)?);
        }
        let mut env = BTreeMap::new();
        for (key, value) in &parsed.env {
            env.insert(key.clone(), substitute(value, context)?);
        }
        let workdir = match &parsed.workdir {
            Some(dir) => base_dir.join(substitute(dir, context)?),
            None => base_dir.to_path_buf(),
        };

        Ok(Box::new(CommandFlow {
            command: resolve_command(command, base_dir),
            env,
            workdir,
            params: context.clone(),
            started: false,
        }))
    }
}

/// Replaces every `${NAME}` in `raw` with the matching parameter.
pub(crate) fn substitute(raw: &str, context: &TrialParameters) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| anyhow!("unterminated substitution in '{}'", raw))?;
        let name = after[..end].trim();
        let value = context
            .get(name)
            .ok_or_else(|| RunnerError::UnresolvedVariable {
                name: name.to_string(),
            })?;
        out.push_str(&value_to_env(value));
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn value_to_env(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn env_key(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn command_part_looks_like_path(part: &str) -> bool {
    part.starts_with("./") || part.starts_with("../")
}

fn resolve_command(mut command: Vec<String>, base_dir: &Path) -> Vec<String> {
    if let Some(first) = command.first_mut() {
        if command_part_looks_like_path(first) {
            *first = base_dir.join(first.as_str()).to_string_lossy().to_string();
        }
    }
    command
}

struct CommandFlow {
    command: Vec<String>,
    env: BTreeMap<String, String>,
    workdir: PathBuf,
    params: TrialParameters,
    started: bool,
}

impl CommandFlow {
    fn drive(
        &mut self,
        task: TaskKind,
        documents: &Documents,
        request_size: usize,
        mut on_done: Option<&mut dyn EvaluationCallback>,
        options: &FlowOptions,
    ) -> Result<()> {
        if !self.started {
            return Err(anyhow!("flow is not started"));
        }
        for (batch_idx, batch) in documents.batches(request_size).enumerate() {
            let mut cmd = Command::new(&self.command[0]);
            cmd.args(&self.command[1..]);
            cmd.current_dir(&self.workdir);
            cmd.env("FLOW_TASK", task.as_str());
            cmd.env("FLOW_REQUEST_SIZE", request_size.to_string());
            for (key, value) in &self.env {
                cmd.env(key, value);
            }
            for (key, value) in &self.params {
                cmd.env(format!("FLOW_PARAM_{}", env_key(key)), value_to_env(value));
            }
            for (key, value) in options {
                cmd.env(format!("FLOW_OPT_{}", env_key(key)), value_to_env(value));
            }

            let responses = run_batch(cmd, batch)?;
            debug!(batch = batch_idx, docs = batch.len(), responses = responses.len(), "batch done");
            if let Some(cb) = on_done.as_mut() {
                for response in &responses {
                    cb.on_done(response)?;
                }
            }
        }
        Ok(())
    }
}

fn run_batch(mut cmd: Command, batch: &[Value]) -> Result<Vec<Value>> {
    let mut payload = Vec::new();
    for doc in batch {
        serde_json::to_writer(&mut payload, doc)?;
        payload.push(b'\n');
    }
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| {
        anyhow!(
            "failed to spawn flow command {}: {}",
            cmd.get_program().to_string_lossy(),
            e
        )
    })?;
    let writer = child.stdin.take().map(|mut stdin| {
        thread::spawn(move || {
            // A command that ignores stdin may close it early.
            let _ = stdin.write_all(&payload);
        })
    });
    let output = child.wait_with_output()?;
    if let Some(writer) = writer {
        let _ = writer.join();
    }

    if !output.status.success() {
        let stderr_tail = String::from_utf8_lossy(&output.stderr)
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("no stderr output")
            .to_string();
        let status = output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        return Err(anyhow!(
            "flow command exited with status {}: {}",
            status,
            stderr_tail
        ));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut responses = Vec::new();
    for line in stdout.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let response: Value = serde_json::from_str(line)
            .map_err(|e| anyhow!("flow command wrote a non-JSON response line: {}", e))?;
        responses.push(response);
    }
    Ok(responses)
}

impl Flow for CommandFlow {
    fn start(&mut self) -> Result<()> {
        if self.command.is_empty() {
            return Err(anyhow!("flow definition has an empty command"));
        }
        self.started = true;
        Ok(())
    }

    fn index(
        &mut self,
        documents: &Documents,
        request_size: usize,
        on_done: Option<&mut dyn EvaluationCallback>,
        options: &FlowOptions,
    ) -> Result<()> {
        self.drive(TaskKind::Index, documents, request_size, on_done, options)
    }

    fn search(
        &mut self,
        documents: &Documents,
        request_size: usize,
        on_done: Option<&mut dyn EvaluationCallback>,
        options: &FlowOptions,
    ) -> Result<()> {
        self.drive(TaskKind::Search, documents, request_size, on_done, options)
    }

    fn close(&mut self) -> Result<()> {
        self.started = false;
        Ok(())
    }
}
