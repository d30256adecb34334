//! Command implementations.
//!
//! Commands return the process exit code: 0 on success, 2 when an execution
//! ends in a non-success terminal status, and bubble errors (exit 1) for
//! usage and I/O problems.

use crate::http::HttpApiInvoker;
use anyhow::{bail, Context};
use dipeo_core::config::{is_execution_id, new_execution_id, EnvSettings};
use dipeo_core::diagram::format::{load_diagram, DiagramFormat};
use dipeo_core::diagram::{DiagramCompiler, DomainDiagram};
use dipeo_core::services::{ApiInvoker, API_INVOKER};
use dipeo_core::{abort_pair, wire_container, ExecuteDiagramUseCase, ExecutionOptions, RunUpdate};
use dipeo_state::{ExecutionFilter, ExecutionStateRepository, FsStateRepository, Status};
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub struct RunArgs {
    pub base_dir: PathBuf,
    pub diagram: PathBuf,
    pub timeout: Option<u64>,
    pub inputs: Option<PathBuf>,
    pub input_data: Option<String>,
    pub format: Option<String>,
    pub debug: bool,
    pub simple: bool,
    pub settings: EnvSettings,
}

fn parse_format(name: Option<&str>) -> anyhow::Result<Option<DiagramFormat>> {
    name.map(DiagramFormat::parse_name)
        .transpose()
        .map_err(Into::into)
}

fn load(diagram: &Path, format: Option<&str>) -> anyhow::Result<DomainDiagram> {
    load_diagram(diagram, parse_format(format)?)
        .with_context(|| format!("loading diagram '{}'", diagram.display()))
}

fn read_variables(
    inputs: Option<&Path>,
    input_data: Option<&str>,
) -> anyhow::Result<HashMap<String, Value>> {
    let raw: Option<Value> = match (inputs, input_data) {
        (Some(path), _) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading inputs file '{}'", path.display()))?;
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e == "yml" || e == "yaml")
                .unwrap_or(false);
            Some(if is_yaml {
                serde_yaml::from_str(&text)?
            } else {
                serde_json::from_str(&text)?
            })
        }
        (None, Some(data)) => Some(serde_json::from_str(data).context("parsing --input-data")?),
        (None, None) => None,
    };
    match raw {
        None => Ok(HashMap::new()),
        Some(Value::Object(map)) => Ok(map.into_iter().collect()),
        Some(_) => bail!("inputs must be a JSON/YAML object"),
    }
}

pub async fn run(args: RunArgs) -> anyhow::Result<i32> {
    let diagram = load(&args.diagram, args.format.as_deref())?;
    let variables = read_variables(args.inputs.as_deref(), args.input_data.as_deref())?;

    let repo = Arc::new(FsStateRepository::new(args.base_dir.join("executions"))?);
    let diagram_dir = args
        .diagram
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    let container = wire_container(repo, &args.settings, diagram_dir);
    container
        .registry
        .register(API_INVOKER, Arc::new(HttpApiInvoker::new()) as Arc<dyn ApiInvoker>);

    let execution_id = args
        .settings
        .execution_id
        .clone()
        .unwrap_or_else(new_execution_id);

    let (abort_handle, abort_signal) = abort_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("aborting...");
            abort_handle.abort();
        }
    });

    let mut options = ExecutionOptions::new()
        .with_variables(variables)
        .with_debug(args.debug)
        .with_abort(abort_signal);
    if let Some(secs) = args.timeout {
        options = options.with_timeout(Duration::from_secs(secs));
    }
    options.diagram_source_path = Some(args.diagram.clone());

    if !args.simple {
        println!("execution: {execution_id}");
    }

    let started = std::time::Instant::now();
    let use_case = ExecuteDiagramUseCase::new(container.registry.clone())?;
    let mut stream = use_case.execute_diagram(diagram, options, execution_id.clone());

    let mut exit_code = 2;
    while let Some(update) = stream.next().await {
        match update {
            RunUpdate::StepComplete {
                step,
                executed_nodes,
                progress,
                ..
            } => {
                if !args.simple {
                    println!(
                        "step {step}: {} ({:.0}%)",
                        executed_nodes.join(", "),
                        progress.percent
                    );
                }
            }
            RunUpdate::ExecutionComplete { status, .. } => {
                println!("{}", json!({"execution_id": execution_id, "status": status}));
                exit_code = 0;
            }
            RunUpdate::ExecutionError { status, error, .. } => {
                println!(
                    "{}",
                    json!({"execution_id": execution_id, "status": status, "error": error})
                );
                exit_code = 2;
            }
        }
    }

    if args.settings.timing_enabled {
        tracing::info!(
            execution_id = %execution_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "run finished"
        );
    }
    Ok(exit_code)
}

pub fn stats(diagram_path: &Path, format: Option<&str>) -> anyhow::Result<i32> {
    let diagram = load(diagram_path, format)?;
    let compiled = DiagramCompiler::new().compile(&diagram)?;

    let mut by_type: HashMap<String, usize> = HashMap::new();
    for node in &diagram.nodes {
        *by_type.entry(node.node_type().to_string()).or_default() += 1;
    }
    let mut by_type: Vec<(String, usize)> = by_type.into_iter().collect();
    by_type.sort();

    println!("diagram:  {}", diagram.diagram_id());
    println!("nodes:    {}", diagram.nodes.len());
    println!("edges:    {}", diagram.edges.len());
    println!("persons:  {}", diagram.persons.len());
    println!(
        "loops:    {}",
        compiled.edges.iter().filter(|e| e.is_feedback).count()
    );
    println!(
        "terminal: {}",
        compiled.terminal_nodes().iter().map(|n| n.id.as_str()).collect::<Vec<_>>().join(", ")
    );
    println!("by type:");
    for (node_type, count) in by_type {
        println!("  {node_type:<22} {count}");
    }
    Ok(0)
}

pub fn compile(
    diagram_path: &Path,
    check_only: bool,
    as_json: bool,
    format: Option<&str>,
) -> anyhow::Result<i32> {
    let diagram = load(diagram_path, format)?;
    let (compiled, diagnostics) = DiagramCompiler::new().compile_with_diagnostics(&diagram);

    for diagnostic in &diagnostics {
        eprintln!("{diagnostic}");
    }
    match compiled {
        Some(compiled) => {
            if as_json {
                println!("{}", compiled.canonical_json()?);
            } else if !check_only {
                println!(
                    "ok: {} nodes, {} edges, {} diagnostics",
                    compiled.nodes.len(),
                    compiled.edges.len(),
                    diagnostics.len()
                );
            }
            Ok(0)
        }
        None => Ok(1),
    }
}

pub fn convert(
    input: &Path,
    output: &Path,
    from: Option<&str>,
    to: Option<&str>,
) -> anyhow::Result<i32> {
    let diagram = load(input, from)?;
    let target = match parse_format(to)? {
        Some(format) => format,
        None => DiagramFormat::detect(output).ok_or_else(|| {
            anyhow::anyhow!("cannot detect output format of '{}'", output.display())
        })?,
    };
    let rendered = target.write(&diagram)?;
    std::fs::write(output, rendered)
        .with_context(|| format!("writing '{}'", output.display()))?;
    println!("wrote {}", output.display());
    Ok(0)
}

pub fn list(format: Option<&str>, as_json: bool) -> anyhow::Result<i32> {
    let wanted = parse_format(format)?;
    let mut rows = Vec::new();
    collect_diagrams(Path::new("."), 0, &mut rows)?;
    rows.sort();

    let rows: Vec<(PathBuf, DiagramFormat)> = rows
        .into_iter()
        .filter_map(|path| DiagramFormat::detect(&path).map(|f| (path, f)))
        .filter(|(_, f)| wanted.map(|w| w == *f).unwrap_or(true))
        .collect();

    if as_json {
        let value: Vec<Value> = rows
            .iter()
            .map(|(path, format)| json!({"path": path, "format": format}))
            .collect();
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        for (path, format) in rows {
            println!("{}  [{format:?}]", path.display());
        }
    }
    Ok(0)
}

fn collect_diagrams(dir: &Path, depth: usize, out: &mut Vec<PathBuf>) -> anyhow::Result<()> {
    if depth > 3 {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') || name == "target" {
            continue;
        }
        if path.is_dir() {
            collect_diagrams(&path, depth + 1, out)?;
        } else if DiagramFormat::detect(&path).is_some() {
            // Only files that actually parse as diagrams are listed.
            if load_diagram(&path, None).is_ok() {
                out.push(path);
            }
        }
    }
    Ok(())
}

pub async fn metrics(
    base_dir: &Path,
    execution_id: Option<&str>,
    latest: bool,
    as_json: bool,
) -> anyhow::Result<i32> {
    let repo = FsStateRepository::new(base_dir.join("executions"))?;

    let execution_id = match (execution_id, latest) {
        (Some(id), _) => id.to_string(),
        (None, true) => {
            let rows = repo.list(&ExecutionFilter::new().with_limit(1)).await?;
            match rows.into_iter().next() {
                Some(row) => row.id,
                None => bail!("no executions recorded"),
            }
        }
        (None, false) => bail!("pass --execution-id ID or --latest"),
    };

    let Some(state) = repo.get(&execution_id).await? else {
        bail!("execution '{execution_id}' not found");
    };
    let Some(metrics) = state.metadata.get("metrics") else {
        bail!("no metrics collected for '{execution_id}'");
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(metrics)?);
        return Ok(0);
    }

    println!("execution: {execution_id}");
    println!("status:    {}", state.status);
    if let Some(duration) = metrics.get("total_duration_ms").and_then(|v| v.as_u64()) {
        println!("duration:  {duration} ms");
    }
    if let Some(path) = metrics.get("critical_path").and_then(|v| v.as_array()) {
        let chain: Vec<&str> = path.iter().filter_map(|v| v.as_str()).collect();
        println!("critical:  {}", chain.join(" -> "));
    }
    if let Some(nodes) = metrics.get("node_metrics").and_then(|v| v.as_object()) {
        println!("nodes:");
        let mut rows: Vec<(&String, u64)> = nodes
            .iter()
            .map(|(id, m)| (id, m.get("duration_ms").and_then(|v| v.as_u64()).unwrap_or(0)))
            .collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        for (id, duration) in rows {
            println!("  {id:<30} {duration} ms");
        }
    }
    Ok(0)
}

pub async fn results(base_dir: &Path, session_id: &str) -> anyhow::Result<i32> {
    if !is_execution_id(session_id) {
        bail!("invalid session id '{session_id}' (expected exec_ followed by 32 hex chars)");
    }
    let repo = FsStateRepository::new(base_dir.join("executions"))?;
    let Some(state) = repo.get(session_id).await? else {
        println!(
            "{}",
            json!({"session_id": session_id, "status": "not_found"})
        );
        return Ok(2);
    };

    let mut body = json!({
        "session_id": session_id,
        "status": state.status,
        "started_at": state.started_at,
    });
    let object = body.as_object_mut().expect("body is an object");
    if let Some(ended) = state.ended_at {
        object.insert("ended_at".into(), json!(ended));
    }
    if !state.executed_nodes.is_empty() {
        object.insert("executed_nodes".into(), json!(state.executed_nodes));
    }
    if !state.node_outputs.is_empty() {
        let outputs: serde_json::Map<String, Value> = state
            .node_outputs
            .iter()
            .map(|(id, env)| (id.clone(), env.body.clone()))
            .collect();
        object.insert("node_outputs".into(), Value::Object(outputs));
    }
    if let Some(error) = &state.error {
        object.insert("error".into(), json!(error));
    }
    if state.llm_usage.total() > 0 {
        object.insert("llm_usage".into(), json!(state.llm_usage));
    }

    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(if state.status == Status::Completed { 0 } else { 2 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_variables_inline_json() {
        let vars = read_variables(None, Some(r#"{"x": 1, "name": "a"}"#)).unwrap();
        assert_eq!(vars["x"], json!(1));
        assert_eq!(vars["name"], json!("a"));
    }

    #[test]
    fn test_read_variables_rejects_non_object() {
        assert!(read_variables(None, Some("[1,2]")).is_err());
    }

    #[test]
    fn test_parse_format_names() {
        assert_eq!(parse_format(Some("light")).unwrap(), Some(DiagramFormat::Light));
        assert!(parse_format(Some("fancy")).is_err());
        assert_eq!(parse_format(None).unwrap(), None);
    }
}
