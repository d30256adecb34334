//! `diff_patch` node: applies a unified diff to a file or to its text input.
//!
//! The patch comes from the node config or the `patch` input handle. With a
//! `target` path the patched file is rewritten through the filesystem port;
//! without one the patched text is the node output.

use super::{HandlerRequest, NodeHandler};
use crate::diagram::{NodeConfig, NodeType};
use crate::error::{DipeoError, Result};
use crate::services::FILE_SYSTEM;
use async_trait::async_trait;
use dipeo_state::Envelope;
use serde_json::json;

pub struct DiffPatchHandler;

#[async_trait]
impl NodeHandler for DiffPatchHandler {
    fn node_type(&self) -> NodeType {
        NodeType::DiffPatch
    }

    async fn handle(&self, request: HandlerRequest<'_>) -> Result<Envelope> {
        let NodeConfig::DiffPatch { target, patch } = &request.node.config else {
            return Err(DipeoError::node_execution(
                &request.node.id,
                "diff_patch node without patch config",
            ));
        };

        let patch_text = match patch {
            Some(p) => p.clone(),
            None => request
                .inputs
                .get("patch")
                .and_then(|env| env.body.as_str().map(|s| s.to_string()))
                .ok_or_else(|| {
                    DipeoError::node_execution(
                        &request.node.id,
                        "no inline patch and no 'patch' input",
                    )
                })?,
        };

        match target {
            Some(path) => {
                let fs = request.services.resolve(FILE_SYSTEM)?;
                let original = fs.read_to_string(path).await.map_err(|e| {
                    DipeoError::node_execution(&request.node.id, format!("read '{path}': {e}"))
                })?;
                let patched = apply_unified_diff(&original, &patch_text)
                    .map_err(|e| DipeoError::node_execution(&request.node.id, e))?;
                fs.write(path, &patched).await?;
                Ok(request.envelope(json!({"file": path, "patched": true})))
            }
            None => {
                let original = request
                    .default_input()
                    .and_then(|env| env.body.as_str())
                    .unwrap_or_default()
                    .to_string();
                let patched = apply_unified_diff(&original, &patch_text)
                    .map_err(|e| DipeoError::node_execution(&request.node.id, e))?;
                Ok(request.envelope(json!(patched)))
            }
        }
    }
}

/// Apply a unified diff with exact context matching (no fuzz).
fn apply_unified_diff(original: &str, patch: &str) -> std::result::Result<String, String> {
    let original_lines: Vec<&str> = original.lines().collect();
    let mut output: Vec<String> = Vec::new();
    // Next line of the original not yet consumed (0-based).
    let mut cursor = 0usize;

    let mut lines = patch.lines().peekable();
    while let Some(line) = lines.next() {
        if line.starts_with("--- ") || line.starts_with("+++ ") || line.starts_with("diff ") {
            continue;
        }
        let Some(header) = line.strip_prefix("@@") else {
            if line.trim().is_empty() {
                continue;
            }
            return Err(format!("unexpected line outside hunk: '{line}'"));
        };
        let old_start = parse_hunk_old_start(header)?;
        // Hunk positions are 1-based; 0 means an insertion before line 1.
        let hunk_begin = old_start.saturating_sub(1);
        if hunk_begin < cursor {
            return Err("overlapping hunks".to_string());
        }
        if hunk_begin > original_lines.len() {
            return Err(format!(
                "hunk start {old_start} beyond end of input ({} lines)",
                original_lines.len()
            ));
        }
        for passthrough in &original_lines[cursor..hunk_begin] {
            output.push((*passthrough).to_string());
        }
        cursor = hunk_begin;

        while let Some(&body) = lines.peek() {
            if body.starts_with("@@") || body.starts_with("--- ") || body.starts_with("diff ") {
                break;
            }
            lines.next();
            match body.chars().next() {
                Some(' ') | None => {
                    let expected = &body[body.len().min(1)..];
                    let actual = original_lines.get(cursor).copied().unwrap_or_default();
                    if actual != expected {
                        return Err(format!(
                            "context mismatch at line {}: expected '{expected}', found '{actual}'",
                            cursor + 1
                        ));
                    }
                    output.push(actual.to_string());
                    cursor += 1;
                }
                Some('-') => {
                    let expected = &body[1..];
                    let actual = original_lines.get(cursor).copied().unwrap_or_default();
                    if actual != expected {
                        return Err(format!(
                            "removal mismatch at line {}: expected '{expected}', found '{actual}'",
                            cursor + 1
                        ));
                    }
                    cursor += 1;
                }
                Some('+') => output.push(body[1..].to_string()),
                Some('\\') => {} // "\ No newline at end of file"
                Some(other) => {
                    return Err(format!("unexpected hunk line prefix '{other}'"));
                }
            }
        }
    }

    for passthrough in &original_lines[cursor..] {
        output.push((*passthrough).to_string());
    }

    let mut result = output.join("\n");
    if original.ends_with('\n') && !result.is_empty() {
        result.push('\n');
    }
    Ok(result)
}

/// Extract the old-file start line from a `@@ -l,c +l,c @@` header.
fn parse_hunk_old_start(header: &str) -> std::result::Result<usize, String> {
    let header = header.trim();
    let old = header
        .split_whitespace()
        .find(|part| part.starts_with('-'))
        .ok_or_else(|| format!("malformed hunk header '@@{header}'"))?;
    let old = &old[1..];
    let start = old.split(',').next().unwrap_or(old);
    start
        .parse::<usize>()
        .map_err(|_| format!("malformed hunk start '{start}'"))
}
