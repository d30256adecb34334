//! Batch-mode sub-diagram execution.
//!
//! Fans the child diagram out over an array input with bounded parallelism.
//! Each item runs under an isolated copy of the parent registry and a fresh
//! execution id; item failures are captured per index and never abort
//! siblings. Parent cancellation propagates to every child.

use super::{child_execution_id, diagram_label, load_diagram, map_child_output};
use crate::config::BATCH_MAX_CONCURRENT;
use crate::diagram::{DomainDiagram, NodeConfig, OutputMode};
use crate::error::{DipeoError, Result};
use crate::execution::ExecutionOptions;
use crate::handlers::HandlerRequest;
use crate::usecase::ExecuteDiagramUseCase;
use dipeo_state::{Envelope, Status};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;

struct BatchConfig {
    input_key: String,
    parallel: bool,
    max_concurrent: usize,
    output_mode: OutputMode,
    result_key: String,
}

fn batch_config(request: &HandlerRequest<'_>) -> Result<BatchConfig> {
    let NodeConfig::SubDiagram {
        batch_input_key,
        batch_parallel,
        max_concurrent,
        output_mode,
        result_key,
        ..
    } = &request.node.config
    else {
        return Err(DipeoError::node_execution(
            &request.node.id,
            "sub_diagram node without sub-diagram config",
        ));
    };
    Ok(BatchConfig {
        input_key: batch_input_key.clone(),
        parallel: *batch_parallel,
        max_concurrent: max_concurrent.unwrap_or(BATCH_MAX_CONCURRENT).max(1),
        output_mode: *output_mode,
        result_key: result_key.clone(),
    })
}

pub(crate) async fn execute_batch(request: &HandlerRequest<'_>) -> Result<Envelope> {
    let config = batch_config(request)?;
    let items = extract_batch_items(request, &config.input_key);

    if items.is_empty() {
        tracing::warn!(
            node_id = %request.node.id,
            input_key = %config.input_key,
            "Batch mode enabled but no items found"
        );
        return Ok(request
            .envelope(json!({
                "total_items": 0,
                "successful": 0,
                "failed": 0,
                "results": [],
                "errors": null,
            }))
            .with_meta("batch_parallel", json!(config.parallel)));
    }

    // Load once, reuse for every item.
    let child_diagram = Arc::new(load_diagram(request).await?);
    let total = items.len();

    tracing::info!(
        node_id = %request.node.id,
        total,
        parallel = config.parallel,
        max_concurrent = config.max_concurrent,
        "Starting batch sub-diagram"
    );

    let (outputs, errors) = if config.parallel {
        run_parallel(request, &config, child_diagram, items.clone()).await
    } else {
        run_sequential(request, &config, child_diagram, items.clone()).await
    };

    let successful = outputs.len();
    let failed = errors.len();
    let mut results: Vec<(usize, Value)> = outputs;
    results.sort_by_key(|(index, _)| *index);
    let results: Vec<Value> = results.into_iter().map(|(_, value)| value).collect();
    let errors_value = if errors.is_empty() {
        Value::Null
    } else {
        json!(errors)
    };

    let envelope = match config.output_mode {
        OutputMode::PureList => request
            .envelope(Value::Array(results))
            .with_meta("total_items", json!(total))
            .with_meta("successful", json!(successful))
            .with_meta("failed", json!(failed))
            .with_meta("errors", errors_value),
        OutputMode::RichObject => {
            let mut body = Map::new();
            body.insert("total_items".into(), json!(total));
            body.insert("successful".into(), json!(successful));
            body.insert("failed".into(), json!(failed));
            body.insert(config.result_key.clone(), Value::Array(results));
            body.insert("errors".into(), errors_value);
            request.envelope(Value::Object(body))
        }
    };
    Ok(envelope
        .with_meta("batch_parallel", json!(config.parallel))
        .with_meta("diagram", json!(diagram_label(request))))
}

async fn run_parallel(
    request: &HandlerRequest<'_>,
    config: &BatchConfig,
    child_diagram: Arc<DomainDiagram>,
    items: Vec<Value>,
) -> (Vec<(usize, Value)>, Vec<Value>) {
    let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
    let total = items.len();

    let runs = items.into_iter().enumerate().map(|(index, item)| {
        let semaphore = semaphore.clone();
        let child_diagram = child_diagram.clone();
        async move {
            let _permit = semaphore.acquire().await;
            let outcome = execute_item(request, config, &child_diagram, &item, index, total).await;
            (index, item, outcome)
        }
    });
    collect(futures::future::join_all(runs).await)
}

async fn run_sequential(
    request: &HandlerRequest<'_>,
    config: &BatchConfig,
    child_diagram: Arc<DomainDiagram>,
    items: Vec<Value>,
) -> (Vec<(usize, Value)>, Vec<Value>) {
    let total = items.len();
    let mut finished = Vec::with_capacity(total);
    for (index, item) in items.into_iter().enumerate() {
        let outcome = execute_item(request, config, &child_diagram, &item, index, total).await;
        finished.push((index, item, outcome));
    }
    collect(finished)
}

fn collect(finished: Vec<(usize, Value, Result<Value>)>) -> (Vec<(usize, Value)>, Vec<Value>) {
    let mut outputs = Vec::new();
    let mut errors = Vec::new();
    for (index, item, outcome) in finished {
        match outcome {
            Ok(value) => outputs.push((index, value)),
            Err(error) => {
                tracing::error!(index, error = %error, "Batch item failed");
                errors.push(json!({
                    "index": index,
                    "error": error.to_string(),
                    "error_type": error.kind(),
                    "item": item,
                }));
            }
        }
    }
    (outputs, errors)
}

async fn execute_item(
    request: &HandlerRequest<'_>,
    config: &BatchConfig,
    child_diagram: &DomainDiagram,
    item: &Value,
    index: usize,
    total: usize,
) -> Result<Value> {
    let sub_execution_id = child_execution_id();
    let variables = item_variables(request, &config.input_key, item, index, total);

    // Isolated registry: services shared by reference, container private to
    // this item.
    let isolated = Arc::new(request.services.isolated_clone());
    let use_case = ExecuteDiagramUseCase::new(isolated)?;

    let mut options = ExecutionOptions::new()
        .as_sub_diagram(request.ctx.execution_id.clone())
        .with_variables(variables)
        .with_timeout(request.ctx.remaining_time())
        .with_abort(request.ctx.abort.clone())
        .with_metadata("parent_diagram", json!(diagram_label(request)))
        .with_metadata("batch_index", json!(index))
        .with_metadata("batch_total", json!(total));
    options.is_batch_item = true;
    options.batch_index = Some(index);
    options.batch_total = Some(total);

    let state = use_case
        .execute_to_completion(child_diagram.clone(), options, sub_execution_id)
        .await?;

    if state.status != Status::Completed {
        return Err(DipeoError::node_execution(
            &request.node.id,
            format!(
                "batch item {index} ended with status {}: {}",
                state.status,
                state.error.as_deref().unwrap_or("no error recorded")
            ),
        ));
    }
    Ok(map_child_output(child_diagram, &state))
}

/// Build the child's initial variables for one item.
///
/// With `batch_input_key == "default"` an object item spreads directly to
/// avoid double-wrapping under the start node; otherwise the item lands
/// under `default`. Remaining parent inputs (minus the batch array itself)
/// are carried along.
fn item_variables(
    request: &HandlerRequest<'_>,
    input_key: &str,
    item: &Value,
    index: usize,
    total: usize,
) -> HashMap<String, Value> {
    let mut variables = HashMap::new();
    if input_key == "default" {
        if let Value::Object(map) = item {
            for (k, v) in map {
                variables.insert(k.clone(), v.clone());
            }
        } else {
            variables.insert("default".to_string(), item.clone());
        }
    } else {
        variables.insert("default".to_string(), item.clone());
    }
    variables.insert("_batch_index".to_string(), json!(index));
    variables.insert("_batch_total".to_string(), json!(total));

    for (handle, envelope) in request.inputs {
        if handle != input_key && handle != "default" {
            variables.insert(handle.clone(), envelope.body.clone());
        }
    }
    variables
}

/// Three-level fallback search for the batch array:
/// the key itself, then under `default`, then inside a `default` object.
fn extract_batch_items(request: &HandlerRequest<'_>, input_key: &str) -> Vec<Value> {
    let found = find_batch_items(request, input_key);
    match found {
        None => Vec::new(),
        Some(Value::Array(items)) => items,
        Some(single) => {
            tracing::warn!(
                node_id = %request.node.id,
                input_key = %input_key,
                "Batch input is not a list; treating as a single item"
            );
            vec![single]
        }
    }
}

fn find_batch_items(request: &HandlerRequest<'_>, input_key: &str) -> Option<Value> {
    if let Some(envelope) = request.inputs.get(input_key) {
        return Some(envelope.body.clone());
    }
    let default = request.inputs.get("default")?;
    match &default.body {
        Value::Object(map) if map.contains_key(input_key) => map.get(input_key).cloned(),
        body if input_key == "default" => Some(body.clone()),
        Value::Object(map) => map
            .values()
            .find_map(|value| match value {
                Value::Object(nested) => nested.get(input_key).cloned(),
                _ => None,
            }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagram::NodeType;
    use crate::testing::{make_request_parts, RequestParts};

    fn parts_with_inputs(inputs: Vec<(&str, Value)>) -> RequestParts {
        make_request_parts(
            NodeConfig::SubDiagram {
                diagram_name: Some("child".into()),
                diagram_data: None,
                batch: true,
                batch_input_key: "items".into(),
                batch_parallel: true,
                max_concurrent: None,
                output_mode: OutputMode::PureList,
                result_key: "results".into(),
            },
            vec![],
            inputs,
        )
    }

    #[test]
    fn test_find_items_at_top_level() {
        let parts = parts_with_inputs(vec![("items", json!([1, 2]))]);
        let request = parts.request();
        assert_eq!(request.node.node_type, NodeType::SubDiagram);
        assert_eq!(extract_batch_items(&request, "items"), vec![json!(1), json!(2)]);
    }

    #[test]
    fn test_find_items_under_default() {
        let parts = parts_with_inputs(vec![("default", json!({"items": [3]}))]);
        let request = parts.request();
        assert_eq!(extract_batch_items(&request, "items"), vec![json!(3)]);
    }

    #[test]
    fn test_find_items_nested_in_default() {
        let parts = parts_with_inputs(vec![(
            "default",
            json!({"payload": {"items": [4, 5]}}),
        )]);
        let request = parts.request();
        assert_eq!(
            extract_batch_items(&request, "items"),
            vec![json!(4), json!(5)]
        );
    }

    #[test]
    fn test_default_key_takes_default_value() {
        let parts = parts_with_inputs(vec![("default", json!([7, 8]))]);
        let request = parts.request();
        assert_eq!(
            extract_batch_items(&request, "default"),
            vec![json!(7), json!(8)]
        );
    }

    #[test]
    fn test_non_list_becomes_single_item() {
        let parts = parts_with_inputs(vec![("items", json!({"only": 1}))]);
        let request = parts.request();
        assert_eq!(
            extract_batch_items(&request, "items"),
            vec![json!({"only": 1})]
        );
    }

    #[test]
    fn test_missing_items_empty() {
        let parts = parts_with_inputs(vec![]);
        let request = parts.request();
        assert!(extract_batch_items(&request, "items").is_empty());
    }

    #[test]
    fn test_item_variables_spread_for_default_key() {
        let parts = parts_with_inputs(vec![("config", json!("fast"))]);
        let request = parts.request();
        let vars = item_variables(&request, "default", &json!({"x": 1}), 0, 3);
        assert_eq!(vars["x"], json!(1));
        assert_eq!(vars["_batch_index"], json!(0));
        assert_eq!(vars["_batch_total"], json!(3));
        assert_eq!(vars["config"], json!("fast"));

        let vars = item_variables(&request, "items", &json!(9), 2, 3);
        assert_eq!(vars["default"], json!(9));
    }
}
