use crate::callback::{EvaluationCallback, Evaluations};
use crate::documents::Documents;
use crate::engine::{FlowEngine, StartedFlow};
use crate::error::RunnerError;
use crate::workspace::prepare_workspace;
use crate::{FlowOptions, FlowRunner, TrialParameters};
use anyhow::Result;
use serde_json::{json, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::str::FromStr;
use tracing::info;

/// Which operation a flow is driven with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Index,
    Search,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Index => "index",
            TaskKind::Search => "search",
        }
    }
}

impl FromStr for TaskKind {
    type Err = RunnerError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "index" => Ok(TaskKind::Index),
            "search" => Ok(TaskKind::Search),
            other => Err(RunnerError::InvalidTask {
                found: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runs one flow definition over a fixed document sequence.
pub struct SingleFlowRunner {
    engine: Rc<dyn FlowEngine>,
    flow_yaml: PathBuf,
    documents: Documents,
    request_size: usize,
    task: TaskKind,
    callback: Option<Box<dyn EvaluationCallback>>,
    trial_callback: Option<Box<dyn EvaluationCallback>>,
    overwrite_workspace: bool,
}

impl SingleFlowRunner {
    /// Validates everything up front; nothing touches the filesystem until
    /// `run`.
    pub fn new(
        engine: Rc<dyn FlowEngine>,
        flow_yaml: impl Into<PathBuf>,
        documents: impl Into<Documents>,
        request_size: usize,
        task: &str,
        callback: Option<Box<dyn EvaluationCallback>>,
        overwrite_workspace: bool,
    ) -> Result<Self> {
        let task = task.parse::<TaskKind>()?;
        if request_size == 0 {
            return Err(RunnerError::InvalidRequestSize.into());
        }
        Ok(Self {
            engine,
            flow_yaml: flow_yaml.into(),
            documents: documents.into(),
            request_size,
            task,
            callback,
            trial_callback: None,
            overwrite_workspace,
        })
    }

    pub fn flow_yaml(&self) -> &Path {
        &self.flow_yaml
    }

    pub fn task(&self) -> TaskKind {
        self.task
    }

    pub fn documents(&self) -> &Documents {
        &self.documents
    }

    pub fn set_documents(&mut self, documents: impl Into<Documents>) {
        self.documents = documents.into();
    }

    pub fn callback(&self) -> Option<&dyn EvaluationCallback> {
        self.callback.as_deref()
    }

    pub fn trial_callback(&self) -> Option<&dyn EvaluationCallback> {
        self.trial_callback.as_deref()
    }
}

impl FlowRunner for SingleFlowRunner {
    fn run(
        &mut self,
        trial_parameters: &TrialParameters,
        workspace: &Path,
        options: &FlowOptions,
    ) -> Result<()> {
        let status = prepare_workspace(workspace, self.overwrite_workspace)?;
        info!(
            flow = %self.flow_yaml.display(),
            task = self.task.as_str(),
            workspace = %workspace.display(),
            workspace_status = status.as_str(),
            documents = self.documents.len(),
            "starting trial"
        );

        self.trial_callback = None;
        let mut fresh = self.callback.as_ref().map(|cb| cb.get_fresh_callback());

        let flow = self.engine.load(&self.flow_yaml, trial_parameters)?;
        let mut started = StartedFlow::start(flow)?;
        let on_done: Option<&mut dyn EvaluationCallback> = match fresh.as_mut() {
            Some(cb) => Some(&mut **cb),
            None => None,
        };
        started.dispatch(
            self.task,
            &self.documents,
            self.request_size,
            on_done,
            options,
        )?;
        drop(started);

        self.trial_callback = fresh;
        info!(flow = %self.flow_yaml.display(), task = self.task.as_str(), "trial finished");
        Ok(())
    }

    fn get_evaluations(&self) -> Result<Evaluations> {
        if self.callback.is_none() {
            return Err(RunnerError::NoCallback.into());
        }
        let trial_callback = self
            .trial_callback
            .as_ref()
            .ok_or(RunnerError::NotExecuted)?;
        trial_callback.get_mean_evaluation()
    }

    fn collects_evaluations(&self) -> bool {
        self.callback.is_some()
    }

    fn describe(&self) -> Value {
        json!({
            "kind": "single",
            "flow": self.flow_yaml.display().to_string(),
            "task": self.task.as_str(),
            "request_size": self.request_size,
            "documents": self.documents.len(),
            "evaluation": self.callback.is_some(),
            "overwrite_workspace": self.overwrite_workspace,
        })
    }
}
