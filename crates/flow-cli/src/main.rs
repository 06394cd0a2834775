use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use flow_runner::{
    load_runner, prepare_workspace, CommandEngine, FlowEngine, FlowOptions, TrialParameters,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "flowrun", version = "0.3.0", about = "Run parameterized flow trials")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one or more trials of a runner file.
    Run {
        runner: PathBuf,
        #[arg(long, default_value = "workspace")]
        workspace: PathBuf,
        /// Trial parameter, value parsed as JSON when possible.
        #[arg(long = "set")]
        set_values: Vec<String>,
        /// JSON or YAML mapping of trial parameters.
        #[arg(long)]
        params: Option<PathBuf>,
        /// Extra option forwarded to the flow's index/search call.
        #[arg(long = "option")]
        option_values: Vec<String>,
        #[arg(long, default_value_t = 1)]
        trials: usize,
        #[arg(long)]
        json: bool,
    },
    /// Print the runner tree a runner file builds.
    Describe {
        runner: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Create, reuse, or wipe a trial workspace.
    Prepare {
        dir: PathBuf,
        #[arg(long)]
        overwrite: bool,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            runner,
            workspace,
            set_values,
            params,
            option_values,
            trials,
            json,
        } => {
            if trials == 0 {
                return Err(anyhow!("--trials must be at least 1"));
            }
            let mut trial_parameters = match params {
                Some(path) => load_params_file(&path)?,
                None => TrialParameters::new(),
            };
            trial_parameters.extend(parse_set_bindings(&set_values)?);
            let workspace_abs = if workspace.is_absolute() {
                workspace.clone()
            } else {
                std::env::current_dir()?.join(&workspace)
            };
            trial_parameters
                .entry("WORKSPACE".to_string())
                .or_insert_with(|| Value::String(workspace_abs.display().to_string()));
            let options: FlowOptions = parse_set_bindings(&option_values)?;

            let engine: Rc<dyn FlowEngine> = Rc::new(CommandEngine::new());
            let mut trial_runner = load_runner(&runner, engine)?;
            let collects = trial_runner.collects_evaluations();

            let mut results = Vec::with_capacity(trials);
            for trial in 1..=trials {
                let started_at = Utc::now().to_rfc3339();
                info!(trial, total = trials, "trial starting");
                trial_runner.run(&trial_parameters, &workspace, &options)?;
                let evaluations = if collects {
                    Some(trial_runner.get_evaluations()?)
                } else {
                    None
                };
                if !json {
                    match &evaluations {
                        Some(evals) => {
                            for (metric, value) in evals {
                                println!("trial {}: {} = {}", trial, metric, value);
                            }
                        }
                        None => println!("trial {}: done", trial),
                    }
                }
                results.push(json!({
                    "trial": trial,
                    "started_at": started_at,
                    "finished_at": Utc::now().to_rfc3339(),
                    "evaluations": evaluations,
                }));
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "runner": runner.display().to_string(),
                    "workspace": workspace.display().to_string(),
                    "parameters": trial_parameters,
                    "trials": results,
                })));
            }
            println!("workspace: {}", workspace.display());
        }
        Commands::Describe { runner, json } => {
            let engine: Rc<dyn FlowEngine> = Rc::new(CommandEngine::new());
            let trial_runner = load_runner(&runner, engine)?;
            let tree = trial_runner.describe();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "runner": tree,
                })));
            }
            print_tree(&tree, 0);
        }
        Commands::Prepare {
            dir,
            overwrite,
            json,
        } => {
            let status = prepare_workspace(&dir, overwrite)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "prepare",
                    "workspace": dir.display().to_string(),
                    "status": status.as_str(),
                })));
            }
            println!("{}: {}", status.as_str(), dir.display());
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Prepare { json, .. } => *json,
    }
}

fn parse_set_bindings(values: &[String]) -> Result<TrialParameters> {
    let mut out = TrialParameters::new();
    for raw in values {
        let (key, val_raw) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid --set '{}': expected k=v", raw))?;
        if key.trim().is_empty() {
            return Err(anyhow!("invalid --set '{}': key cannot be empty", raw));
        }
        let parsed =
            serde_json::from_str::<Value>(val_raw).unwrap_or(Value::String(val_raw.to_string()));
        out.insert(key.trim().to_string(), parsed);
    }
    Ok(out)
}

fn load_params_file(path: &Path) -> Result<TrialParameters> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read params file {}: {}", path.display(), e))?;
    let value: Value = serde_yaml::from_str(&raw)
        .map_err(|e| anyhow!("invalid params file {}: {}", path.display(), e))?;
    match value {
        Value::Object(map) => Ok(map.into_iter().collect()),
        Value::Null => Ok(TrialParameters::new()),
        _ => Err(anyhow!(
            "params file {} must contain a mapping",
            path.display()
        )),
    }
}

fn print_tree(node: &Value, depth: usize) {
    let pad = "  ".repeat(depth);
    match node.get("kind").and_then(|v| v.as_str()) {
        Some("chain") => {
            println!("{}chain (eval_flow_index: {})", pad, node["eval_flow_index"]);
            if let Some(flows) = node.get("flows").and_then(|v| v.as_array()) {
                for flow in flows {
                    print_tree(flow, depth + 1);
                }
            }
        }
        _ => {
            println!(
                "{}{} {} (documents: {}, request_size: {}, evaluation: {}, overwrite_workspace: {})",
                pad,
                node["task"].as_str().unwrap_or("?"),
                node["flow"].as_str().unwrap_or("?"),
                node["documents"],
                node["request_size"],
                node["evaluation"],
                node["overwrite_workspace"],
            );
        }
    }
}
