use crate::callback::EvaluationCallback;
use crate::documents::Documents;
use crate::single::TaskKind;
use crate::{FlowOptions, TrialParameters};
use anyhow::Result;
use std::path::Path;
use tracing::{debug, warn};

/// Loads flow definitions. Implemented by whatever executes the processing
/// graph; runners only see this seam.
pub trait FlowEngine {
    /// Parses `definition` with `context` substituted into it. Substitution
    /// points the context does not supply must fail here, not at dispatch.
    fn load(&self, definition: &Path, context: &TrialParameters) -> Result<Box<dyn Flow>>;
}

/// A loaded flow. Only ever driven through [`StartedFlow`].
pub trait Flow {
    fn start(&mut self) -> Result<()>;

    fn index(
        &mut self,
        documents: &Documents,
        request_size: usize,
        on_done: Option<&mut dyn EvaluationCallback>,
        options: &FlowOptions,
    ) -> Result<()>;

    fn search(
        &mut self,
        documents: &Documents,
        request_size: usize,
        on_done: Option<&mut dyn EvaluationCallback>,
        options: &FlowOptions,
    ) -> Result<()>;

    /// Tears the flow down. May be called on a flow whose `start` failed.
    fn close(&mut self) -> Result<()>;
}

/// A started flow that is closed when dropped, on success and error paths
/// alike.
pub struct StartedFlow {
    flow: Box<dyn Flow>,
}

impl StartedFlow {
    pub fn start(flow: Box<dyn Flow>) -> Result<Self> {
        let mut started = Self { flow };
        started.flow.start()?;
        Ok(started)
    }

    pub fn dispatch(
        &mut self,
        task: TaskKind,
        documents: &Documents,
        request_size: usize,
        on_done: Option<&mut dyn EvaluationCallback>,
        options: &FlowOptions,
    ) -> Result<()> {
        debug!(task = task.as_str(), documents = documents.len(), request_size, "dispatching");
        match task {
            TaskKind::Index => self.flow.index(documents, request_size, on_done, options),
            TaskKind::Search => self.flow.search(documents, request_size, on_done, options),
        }
    }
}

impl Drop for StartedFlow {
    fn drop(&mut self) {
        if let Err(err) = self.flow.close() {
            warn!(error = %err, "failed to close flow");
        }
    }
}
