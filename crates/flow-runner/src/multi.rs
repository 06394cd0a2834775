use crate::callback::Evaluations;
use crate::error::RunnerError;
use crate::{FlowOptions, FlowRunner, TrialParameters};
use anyhow::Result;
use serde_json::{json, Value};
use std::path::Path;
use tracing::info;

/// Runs member runners strictly in order over one shared workspace.
///
/// Members see each other's workspace writes, which is how an index flow
/// feeds a later search flow. One member, picked by `eval_flow_index`
/// (negative values count from the end), supplies the chain's evaluation.
pub struct MultiFlowRunner {
    flows: Vec<Box<dyn FlowRunner>>,
    eval_flow_index: isize,
    completed: usize,
}

impl MultiFlowRunner {
    pub fn new(flows: Vec<Box<dyn FlowRunner>>, eval_flow_index: isize) -> Result<Self> {
        if flows.is_empty() {
            return Err(RunnerError::EmptyChain.into());
        }
        resolve_index(eval_flow_index, flows.len())?;
        Ok(Self {
            flows,
            eval_flow_index,
            completed: 0,
        })
    }

    pub fn evaluating_last(flows: Vec<Box<dyn FlowRunner>>) -> Result<Self> {
        Self::new(flows, -1)
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn eval_flow_index(&self) -> isize {
        self.eval_flow_index
    }

    pub fn flows(&self) -> &[Box<dyn FlowRunner>] {
        &self.flows
    }
}

fn resolve_index(index: isize, len: usize) -> Result<usize, RunnerError> {
    let resolved = if index < 0 {
        len.checked_sub(index.unsigned_abs())
    } else {
        Some(index as usize).filter(|i| *i < len)
    };
    resolved.ok_or(RunnerError::InvalidEvalIndex { index, len })
}

impl FlowRunner for MultiFlowRunner {
    fn run(
        &mut self,
        trial_parameters: &TrialParameters,
        workspace: &Path,
        options: &FlowOptions,
    ) -> Result<()> {
        self.completed = 0;
        let total = self.flows.len();
        for (position, flow) in self.flows.iter_mut().enumerate() {
            info!(member = position, total, "running chained flow");
            flow.run(trial_parameters, workspace, options)?;
            self.completed = position + 1;
        }
        Ok(())
    }

    fn get_evaluations(&self) -> Result<Evaluations> {
        let index = resolve_index(self.eval_flow_index, self.flows.len())?;
        if index >= self.completed {
            return Err(RunnerError::NotExecuted.into());
        }
        self.flows[index].get_evaluations()
    }

    fn collects_evaluations(&self) -> bool {
        resolve_index(self.eval_flow_index, self.flows.len())
            .map(|index| self.flows[index].collects_evaluations())
            .unwrap_or(false)
    }

    fn describe(&self) -> Value {
        json!({
            "kind": "chain",
            "eval_flow_index": self.eval_flow_index,
            "flows": self.flows.iter().map(|f| f.describe()).collect::<Vec<_>>(),
        })
    }
}
