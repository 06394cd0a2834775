use anyhow::{anyhow, Result};
use chrono::Utc;
use flow_runner::{
    Documents, EvaluationCallback, Flow, FlowEngine, FlowOptions, FlowRunner,
    MeanEvaluationCallback, MultiFlowRunner, RunnerError, SingleFlowRunner, TrialParameters,
};
use serde_json::{json, Value};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// In-memory engine. Index flows append document ids to
/// `${WORKSPACE}/index.jsonl`; search flows score a query 1.0 when its id is
/// in that file. Every document of trial N also carries a `trial` metric of N.
#[derive(Default)]
struct MemoryEngine {
    loads: RefCell<BTreeMap<String, usize>>,
}

struct MemoryFlow {
    workspace: PathBuf,
    trial: usize,
    broken: bool,
}

impl FlowEngine for MemoryEngine {
    fn load(&self, definition: &Path, context: &TrialParameters) -> Result<Box<dyn Flow>> {
        let name = definition.display().to_string();
        let trial = {
            let mut loads = self.loads.borrow_mut();
            let count = loads.entry(name.clone()).or_default();
            *count += 1;
            *count
        };
        let workspace = context
            .get("WORKSPACE")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("unresolved substitution variable 'WORKSPACE'"))?;
        Ok(Box::new(MemoryFlow {
            workspace: PathBuf::from(workspace),
            trial,
            broken: name.contains("broken"),
        }))
    }
}

impl MemoryEngine {
    fn loads(&self, definition: &str) -> usize {
        self.loads.borrow().get(definition).copied().unwrap_or(0)
    }
}

fn doc_id(doc: &Value) -> String {
    doc["id"].to_string()
}

impl MemoryFlow {
    fn respond(
        &self,
        batch_docs: Vec<Value>,
        on_done: &mut Option<&mut dyn EvaluationCallback>,
    ) -> Result<()> {
        if let Some(cb) = on_done.as_mut() {
            cb.on_done(&json!({ "docs": batch_docs }))?;
        }
        Ok(())
    }
}

impl Flow for MemoryFlow {
    fn start(&mut self) -> Result<()> {
        if self.broken {
            return Err(anyhow!("flow failed to start: broken pod"));
        }
        Ok(())
    }

    fn index(
        &mut self,
        documents: &Documents,
        request_size: usize,
        mut on_done: Option<&mut dyn EvaluationCallback>,
        _options: &FlowOptions,
    ) -> Result<()> {
        let path = self.workspace.join("index.jsonl");
        let mut stored = fs::read_to_string(&path).unwrap_or_default();
        for batch in documents.batches(request_size) {
            let mut out = Vec::new();
            for doc in batch {
                stored.push_str(&doc_id(doc));
                stored.push('\n');
                out.push(json!({"evaluations": [{"op_name": "trial", "value": self.trial}]}));
            }
            self.respond(out, &mut on_done)?;
        }
        fs::write(&path, stored)?;
        Ok(())
    }

    fn search(
        &mut self,
        documents: &Documents,
        request_size: usize,
        mut on_done: Option<&mut dyn EvaluationCallback>,
        _options: &FlowOptions,
    ) -> Result<()> {
        let stored = fs::read_to_string(self.workspace.join("index.jsonl"))
            .map_err(|e| anyhow!("no index in workspace: {}", e))?;
        let known: BTreeSet<&str> = stored.lines().collect();
        for batch in documents.batches(request_size) {
            let out = batch
                .iter()
                .map(|doc| {
                    let hit = if known.contains(doc_id(doc).as_str()) { 1.0 } else { 0.0 };
                    json!({"evaluations": [{"op_name": "recall", "value": hit}]})
                })
                .collect();
            self.respond(out, &mut on_done)?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

fn temp_ws(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "flow_runner_it_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros()
    ))
}

fn trial_params(ws: &Path) -> TrialParameters {
    TrialParameters::from([("WORKSPACE".to_string(), json!(ws.to_string_lossy()))])
}

fn ids(ids: &[u64]) -> Documents {
    ids.iter().map(|id| json!({ "id": id })).collect()
}

fn mean_callback() -> Option<Box<dyn EvaluationCallback>> {
    Some(Box::new(MeanEvaluationCallback::new()))
}

#[test]
fn repeated_trials_do_not_carry_evaluations_over() {
    let engine = Rc::new(MemoryEngine::default());
    let ws = temp_ws("repeat");
    let mut runner = SingleFlowRunner::new(
        engine.clone(),
        "index.yml",
        ids(&[1, 2, 3]),
        1,
        "index",
        mean_callback(),
        true,
    )
    .expect("runner");

    runner
        .run(&trial_params(&ws), &ws, &FlowOptions::new())
        .expect("first trial");
    assert!(ws.is_dir());
    assert_eq!(runner.get_evaluations().expect("first")["trial"], 1.0);

    runner
        .run(&trial_params(&ws), &ws, &FlowOptions::new())
        .expect("second trial");
    assert!(ws.is_dir());
    assert_eq!(runner.get_evaluations().expect("second")["trial"], 2.0);
    // overwrite_workspace wiped the first trial's index
    let stored = fs::read_to_string(ws.join("index.jsonl")).expect("index");
    assert_eq!(stored.lines().count(), 3);
    assert_eq!(engine.loads("index.yml"), 2);
    let _ = fs::remove_dir_all(ws);
}

#[test]
fn reused_workspace_keeps_prior_artifacts() {
    let engine = Rc::new(MemoryEngine::default());
    let ws = temp_ws("reuse");
    let mut runner =
        SingleFlowRunner::new(engine, "index.yml", ids(&[1, 2]), 2, "index", None, false)
            .expect("runner");
    runner.run(&trial_params(&ws), &ws, &FlowOptions::new()).expect("first");
    runner.run(&trial_params(&ws), &ws, &FlowOptions::new()).expect("second");
    let stored = fs::read_to_string(ws.join("index.jsonl")).expect("index");
    assert_eq!(stored.lines().count(), 4);
    let _ = fs::remove_dir_all(ws);
}

#[test]
fn invalid_task_touches_no_workspace() {
    let engine = Rc::new(MemoryEngine::default());
    let ws = temp_ws("invalid_task");
    let err = SingleFlowRunner::new(engine, "index.yml", ids(&[1]), 1, "update", None, true)
        .err()
        .expect("invalid task");
    assert!(matches!(
        err.downcast_ref::<RunnerError>(),
        Some(RunnerError::InvalidTask { .. })
    ));
    assert!(!ws.exists());
}

#[test]
fn index_then_search_chain_evaluates_the_search_member() {
    let engine = Rc::new(MemoryEngine::default());
    let ws = temp_ws("chain");
    let indexing = SingleFlowRunner::new(
        engine.clone(),
        "index.yml",
        ids(&[1, 2, 3]),
        2,
        "index",
        mean_callback(),
        true,
    )
    .expect("index runner");
    let searching = SingleFlowRunner::new(
        engine.clone(),
        "search.yml",
        ids(&[1, 2, 4, 5]),
        3,
        "search",
        mean_callback(),
        false,
    )
    .expect("search runner");
    let mut chain =
        MultiFlowRunner::new(vec![Box::new(indexing), Box::new(searching)], 1).expect("chain");

    let err = chain.get_evaluations().expect_err("before run");
    assert_eq!(err.downcast_ref::<RunnerError>(), Some(&RunnerError::NotExecuted));

    chain.run(&trial_params(&ws), &ws, &FlowOptions::new()).expect("run");
    let evals = chain.get_evaluations().expect("evaluations");
    assert_eq!(evals["recall"], 0.5);
    assert_eq!(evals, chain.flows()[1].get_evaluations().expect("member"));
    let _ = fs::remove_dir_all(ws);
}

#[test]
fn failing_member_halts_later_members() {
    let engine = Rc::new(MemoryEngine::default());
    let ws = temp_ws("chain_fail");
    let make = |flow: &str, task: &str| -> Box<dyn FlowRunner> {
        Box::new(
            SingleFlowRunner::new(engine.clone(), flow, ids(&[1]), 1, task, mean_callback(), false)
                .expect("member"),
        )
    };
    let mut chain = MultiFlowRunner::evaluating_last(vec![
        make("index.yml", "index"),
        make("more_index.yml", "index"),
        make("broken.yml", "search"),
        make("search.yml", "search"),
    ])
    .expect("chain");

    let err = chain
        .run(&trial_params(&ws), &ws, &FlowOptions::new())
        .expect_err("member 2 fails");
    assert_eq!(err.to_string(), "flow failed to start: broken pod");
    assert_eq!(engine.loads("index.yml"), 1);
    assert_eq!(engine.loads("more_index.yml"), 1);
    assert_eq!(engine.loads("broken.yml"), 1);
    assert_eq!(engine.loads("search.yml"), 0);
    assert!(ws.join("index.jsonl").exists());
    assert!(chain.get_evaluations().is_err());
    let _ = fs::remove_dir_all(ws);
}
