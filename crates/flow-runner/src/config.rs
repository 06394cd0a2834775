use crate::callback::{EvaluationCallback, MeanEvaluationCallback};
use crate::documents::Documents;
use crate::engine::FlowEngine;
use crate::multi::MultiFlowRunner;
use crate::single::SingleFlowRunner;
use crate::FlowRunner;
use anyhow::{anyhow, Result};
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// One entry of a runner file: a single flow or a chain of entries.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunnerSpec {
    Single(SingleSpec),
    Chain(ChainSpec),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SingleSpec {
    /// Flow definition, relative to the runner file.
    pub flow: PathBuf,
    #[serde(default)]
    pub documents: Option<Value>,
    /// JSONL file, relative to the runner file.
    #[serde(default)]
    pub documents_path: Option<PathBuf>,
    #[serde(default = "default_request_size")]
    pub request_size: usize,
    pub task: String,
    #[serde(default)]
    pub evaluation: Option<EvaluationSpec>,
    #[serde(default)]
    pub overwrite_workspace: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EvaluationSpec {
    #[serde(default)]
    pub metric: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainSpec {
    pub flows: Vec<RunnerSpec>,
    #[serde(default = "default_eval_flow_index")]
    pub eval_flow_index: isize,
}

fn default_request_size() -> usize {
    100
}

fn default_eval_flow_index() -> isize {
    -1
}

pub fn load_runner_spec(path: &Path) -> Result<RunnerSpec> {
    let raw = fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read runner file {}: {}", path.display(), e))?;
    serde_yaml::from_str(&raw)
        .map_err(|e| anyhow!("invalid runner file {}: {}", path.display(), e))
}

/// Loads a runner file and builds the runner tree it describes.
pub fn load_runner(path: &Path, engine: Rc<dyn FlowEngine>) -> Result<Box<dyn FlowRunner>> {
    let spec = load_runner_spec(path)?;
    let base_dir = path.parent().unwrap_or(Path::new("."));
    build_runner(&spec, base_dir, &engine)
}

/// Builds runners from a parsed spec; relative paths resolve against
/// `base_dir`. All construction-time validation happens here.
pub fn build_runner(
    spec: &RunnerSpec,
    base_dir: &Path,
    engine: &Rc<dyn FlowEngine>,
) -> Result<Box<dyn FlowRunner>> {
    match spec {
        RunnerSpec::Single(single) => {
            let documents = match (&single.documents, &single.documents_path) {
                (Some(_), Some(_)) => {
                    return Err(anyhow!(
                        "runner entry for {} sets both documents and documents_path",
                        single.flow.display()
                    ))
                }
                (Some(inline), None) => Documents::try_from(inline.clone())?,
                (None, Some(path)) => Documents::from_jsonl(&base_dir.join(path))?,
                (None, None) => {
                    return Err(anyhow!(
                        "runner entry for {} needs documents or documents_path",
                        single.flow.display()
                    ))
                }
            };
            let callback = single.evaluation.as_ref().map(|eval| -> Box<dyn EvaluationCallback> {
                match &eval.metric {
                    Some(metric) => Box::new(MeanEvaluationCallback::for_metric(metric.clone())),
                    None => Box::new(MeanEvaluationCallback::new()),
                }
            });
            let runner = SingleFlowRunner::new(
                Rc::clone(engine),
                base_dir.join(&single.flow),
                documents,
                single.request_size,
                &single.task,
                callback,
                single.overwrite_workspace,
            )?;
            Ok(Box::new(runner))
        }
        RunnerSpec::Chain(chain) => {
            let mut flows = Vec::with_capacity(chain.flows.len());
            for member in &chain.flows {
                flows.push(build_runner(member, base_dir, engine)?);
            }
            Ok(Box::new(MultiFlowRunner::new(flows, chain.eval_flow_index)?))
        }
    }
}
