//! Parameterized flow execution across repeated trials.
//!
//! A [`FlowRunner`] prepares a trial workspace, resets its evaluation
//! callback, loads a flow definition with the trial parameters substituted in,
//! and pushes a fixed document sequence through it. [`SingleFlowRunner`] drives
//! one flow; [`MultiFlowRunner`] chains runners over a shared workspace and
//! reads its evaluation from one designated member.

mod callback;
mod command_engine;
mod config;
mod documents;
mod engine;
mod error;
mod multi;
mod single;
mod workspace;

use anyhow::Result;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;

pub use callback::{EvaluationCallback, Evaluations, MeanEvaluationCallback};
pub use command_engine::CommandEngine;
pub use config::{
    build_runner, load_runner, load_runner_spec, ChainSpec, EvaluationSpec, RunnerSpec, SingleSpec,
};
pub use documents::Documents;
pub use engine::{Flow, FlowEngine, StartedFlow};
pub use error::RunnerError;
pub use multi::MultiFlowRunner;
pub use single::{SingleFlowRunner, TaskKind};
pub use workspace::{prepare_workspace, WorkspaceStatus};

/// Values substituted into a flow definition at load time, keyed by name.
pub type TrialParameters = BTreeMap<String, Value>;

/// Extra options forwarded verbatim to the flow's index/search call.
pub type FlowOptions = BTreeMap<String, Value>;

/// Common contract of single flows and chains.
///
/// Chains hold members through this trait only, so a member can itself be a
/// chain.
pub trait FlowRunner {
    /// Executes one trial. Blocks until the flow engine reports completion.
    fn run(
        &mut self,
        trial_parameters: &TrialParameters,
        workspace: &Path,
        options: &FlowOptions,
    ) -> Result<()>;

    /// Aggregated evaluation of the last completed trial.
    ///
    /// Fails when no callback is configured or no trial has completed.
    fn get_evaluations(&self) -> Result<Evaluations>;

    /// Whether `get_evaluations` can succeed after a completed trial.
    fn collects_evaluations(&self) -> bool {
        true
    }

    fn describe(&self) -> Value {
        json!({ "kind": "custom" })
    }
}
