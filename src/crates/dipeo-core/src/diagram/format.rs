//! Diagram file formats: `light`, `native`, and `readable`.
//!
//! - **native** - JSON, id-keyed; the direct serde form of [`DomainDiagram`].
//! - **light** - YAML, label-keyed; nodes are a list with flattened typed
//!   props, connections reference labels (`"Label"` or `"Label:handle"`).
//! - **readable** - YAML, a `flow` listing of `"A -> B"` arrows over a
//!   label-keyed node map.
//!
//! All three round-trip through [`DomainDiagram`]; `convert` is read-any /
//! write-any.

use crate::diagram::domain::{
    DomainDiagram, DomainEdge, DomainNode, NodeConfig, Packing, PersonDef, RetryPolicy,
};
use crate::error::{DipeoError, Result};
use dipeo_state::ContentType;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Supported diagram file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagramFormat {
    Light,
    Native,
    Readable,
}

impl DiagramFormat {
    /// Sniff the format from a file path.
    ///
    /// `.json` is native; `.readable.yml`/`.readable.yaml` is readable; any
    /// other YAML extension is light.
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        if name.ends_with(".json") {
            Some(DiagramFormat::Native)
        } else if name.ends_with(".readable.yml") || name.ends_with(".readable.yaml") {
            Some(DiagramFormat::Readable)
        } else if name.ends_with(".yml") || name.ends_with(".yaml") {
            Some(DiagramFormat::Light)
        } else {
            None
        }
    }

    pub fn parse_name(name: &str) -> Result<Self> {
        match name {
            "light" => Ok(DiagramFormat::Light),
            "native" => Ok(DiagramFormat::Native),
            "readable" => Ok(DiagramFormat::Readable),
            other => Err(DipeoError::Validation(format!(
                "Unknown diagram format '{other}' (expected light|native|readable)"
            ))),
        }
    }

    /// Parse diagram text in this format.
    pub fn read(&self, contents: &str) -> Result<DomainDiagram> {
        match self {
            DiagramFormat::Native => Ok(serde_json::from_str(contents)?),
            DiagramFormat::Light => {
                let light: LightDiagram = serde_yaml::from_str(contents)?;
                light.into_domain()
            }
            DiagramFormat::Readable => {
                let readable: ReadableDiagram = serde_yaml::from_str(contents)?;
                readable.into_domain()
            }
        }
    }

    /// Serialize a diagram in this format.
    pub fn write(&self, diagram: &DomainDiagram) -> Result<String> {
        match self {
            DiagramFormat::Native => Ok(serde_json::to_string_pretty(diagram)?),
            DiagramFormat::Light => Ok(serde_yaml::to_string(&LightDiagram::from_domain(diagram))?),
            DiagramFormat::Readable => {
                Ok(serde_yaml::to_string(&ReadableDiagram::from_domain(diagram))?)
            }
        }
    }
}

/// Load a diagram from disk, sniffing the format from the extension unless
/// one is forced.
pub fn load_diagram(path: &Path, format: Option<DiagramFormat>) -> Result<DomainDiagram> {
    let format = match format.or_else(|| DiagramFormat::detect(path)) {
        Some(f) => f,
        None => {
            return Err(DipeoError::Validation(format!(
                "Cannot detect diagram format of '{}'",
                path.display()
            )))
        }
    };
    let contents = std::fs::read_to_string(path)?;
    let mut diagram = format.read(&contents)?;
    if diagram.name.is_none() {
        diagram.name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|s| s.trim_end_matches(".readable").to_string());
    }
    Ok(diagram)
}

// ---------------------------------------------------------------------------
// light
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct LightDiagram {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    persons: BTreeMap<String, PersonDef>,
    #[serde(default)]
    nodes: Vec<LightNode>,
    #[serde(default)]
    connections: Vec<LightConnection>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    variables: HashMap<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LightNode {
    label: String,
    #[serde(flatten)]
    config: NodeConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retry: Option<RetryPolicy>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LightConnection {
    /// `"Label"` or `"Label:handle"`.
    from: String,
    to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_type: Option<ContentType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    packing: Packing,
}

/// Split `"Label:handle"` into endpoint and optional handle.
fn split_endpoint(spec: &str) -> (String, Option<String>) {
    match spec.split_once(':') {
        Some((node, handle)) => (node.trim().to_string(), Some(handle.trim().to_string())),
        None => (spec.trim().to_string(), None),
    }
}

impl LightDiagram {
    fn into_domain(self) -> Result<DomainDiagram> {
        let mut nodes = Vec::with_capacity(self.nodes.len());
        for light in &self.nodes {
            nodes.push(DomainNode {
                id: light.label.clone(),
                label: Some(light.label.clone()),
                config: light.config.clone(),
                max_iterations: light.max_iterations,
                retry: light.retry.clone(),
            });
        }
        let mut edges = Vec::with_capacity(self.connections.len());
        for conn in &self.connections {
            let (source, source_handle) = split_endpoint(&conn.from);
            let (target, target_handle) = split_endpoint(&conn.to);
            edges.push(DomainEdge {
                source,
                source_handle,
                target,
                target_handle,
                content_type: conn.content_type,
                label: conn.label.clone(),
                execution_priority: conn.priority,
                packing: conn.packing,
            });
        }
        Ok(DomainDiagram {
            id: None,
            name: self.name,
            nodes,
            edges,
            persons: self.persons,
            variables: self.variables,
            metadata: HashMap::new(),
        })
    }

    fn from_domain(diagram: &DomainDiagram) -> Self {
        let nodes = diagram
            .nodes
            .iter()
            .map(|n| LightNode {
                label: n.label.clone().unwrap_or_else(|| n.id.clone()),
                config: n.config.clone(),
                max_iterations: n.max_iterations,
                retry: n.retry.clone(),
            })
            .collect();
        let label_of = |id: &str| -> String {
            diagram
                .node(id)
                .and_then(|n| n.label.clone())
                .unwrap_or_else(|| id.to_string())
        };
        let connections = diagram
            .edges
            .iter()
            .map(|e| LightConnection {
                from: match &e.source_handle {
                    Some(h) => format!("{}:{}", label_of(&e.source), h),
                    None => label_of(&e.source),
                },
                to: match &e.target_handle {
                    Some(h) => format!("{}:{}", label_of(&e.target), h),
                    None => label_of(&e.target),
                },
                content_type: e.content_type,
                label: e.label.clone(),
                priority: e.execution_priority,
                packing: e.packing,
            })
            .collect();
        Self {
            name: diagram.name.clone(),
            persons: diagram.persons.clone(),
            nodes,
            connections,
            variables: diagram.variables.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// readable
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct ReadableDiagram {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    persons: BTreeMap<String, PersonDef>,
    /// Label-keyed node definitions.
    #[serde(default)]
    nodes: BTreeMap<String, ReadableNode>,
    /// Arrow listing: `"A -> B"`, `"Cond:true -> A"`.
    #[serde(default)]
    flow: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    variables: HashMap<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ReadableNode {
    #[serde(flatten)]
    config: NodeConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_iterations: Option<u32>,
}

impl ReadableDiagram {
    fn into_domain(self) -> Result<DomainDiagram> {
        let mut nodes = Vec::with_capacity(self.nodes.len());
        for (label, def) in &self.nodes {
            nodes.push(DomainNode {
                id: label.clone(),
                label: Some(label.clone()),
                config: def.config.clone(),
                max_iterations: def.max_iterations,
                retry: None,
            });
        }
        let mut edges = Vec::with_capacity(self.flow.len());
        for arrow in &self.flow {
            let (from, to) = arrow.split_once("->").ok_or_else(|| {
                DipeoError::Validation(format!("Flow entry '{arrow}' is missing '->'"))
            })?;
            let (source, source_handle) = split_endpoint(from);
            let (target, target_handle) = split_endpoint(to);
            edges.push(DomainEdge {
                source,
                source_handle,
                target,
                target_handle,
                content_type: None,
                label: None,
                execution_priority: 0,
                packing: Packing::Pack,
            });
        }
        Ok(DomainDiagram {
            id: None,
            name: self.name,
            nodes,
            edges,
            persons: self.persons,
            variables: self.variables,
            metadata: HashMap::new(),
        })
    }

    fn from_domain(diagram: &DomainDiagram) -> Self {
        let nodes = diagram
            .nodes
            .iter()
            .map(|n| {
                (
                    n.label.clone().unwrap_or_else(|| n.id.clone()),
                    ReadableNode {
                        config: n.config.clone(),
                        max_iterations: n.max_iterations,
                    },
                )
            })
            .collect();
        let label_of = |id: &str| -> String {
            diagram
                .node(id)
                .and_then(|n| n.label.clone())
                .unwrap_or_else(|| id.to_string())
        };
        let flow = diagram
            .edges
            .iter()
            .map(|e| {
                let from = match &e.source_handle {
                    Some(h) => format!("{}:{}", label_of(&e.source), h),
                    None => label_of(&e.source),
                };
                let to = match &e.target_handle {
                    Some(h) => format!("{}:{}", label_of(&e.target), h),
                    None => label_of(&e.target),
                };
                format!("{from} -> {to}")
            })
            .collect();
        Self {
            name: diagram.name.clone(),
            persons: diagram.persons.clone(),
            nodes,
            flow,
            variables: diagram.variables.clone(),
        }
    }
}
