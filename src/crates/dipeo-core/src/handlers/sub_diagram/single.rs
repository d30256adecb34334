//! Single-mode sub-diagram execution.

use super::{child_execution_id, diagram_label, load_diagram, map_child_output};
use crate::error::{DipeoError, Result};
use crate::events::SubDiagramFilter;
use crate::execution::ExecutionOptions;
use crate::handlers::HandlerRequest;
use crate::usecase::ExecuteDiagramUseCase;
use dipeo_state::{Envelope, Status};
use serde_json::json;
use std::sync::Arc;

/// Run the nested diagram once with the parent's registry and map its
/// output back.
pub(crate) async fn execute_single(request: &HandlerRequest<'_>) -> Result<Envelope> {
    let child_diagram = load_diagram(request).await?;
    let sub_execution_id = child_execution_id();

    // Clean child state: parent inputs do not leak into the child unless the
    // diagram wires them explicitly through its start node.
    let options = ExecutionOptions::new()
        .as_sub_diagram(request.ctx.execution_id.clone())
        .with_timeout(request.ctx.remaining_time())
        .with_abort(request.ctx.abort.clone())
        .with_metadata("parent_diagram", json!(diagram_label(request)));

    let mut options = options;
    options.event_filter = Some(Arc::new(SubDiagramFilter::new(
        request.ctx.execution_id.clone(),
    )));

    tracing::debug!(
        node_id = %request.node.id,
        sub_execution_id = %sub_execution_id,
        diagram = %diagram_label(request),
        "Starting sub-diagram"
    );

    let use_case = ExecuteDiagramUseCase::new(request.services.clone())?;
    let state = use_case
        .execute_to_completion(child_diagram.clone(), options, sub_execution_id.clone())
        .await?;

    if state.status != Status::Completed {
        return Err(DipeoError::node_execution(
            &request.node.id,
            format!(
                "sub-diagram '{}' ended with status {}: {}",
                diagram_label(request),
                state.status,
                state.error.as_deref().unwrap_or("no error recorded")
            ),
        ));
    }

    let output = map_child_output(&child_diagram, &state);
    Ok(request
        .envelope(output)
        .with_meta("sub_execution_id", json!(sub_execution_id))
        .with_meta("execution_status", json!("completed"))
        .with_meta("diagram_name", json!(diagram_label(request))))
}
