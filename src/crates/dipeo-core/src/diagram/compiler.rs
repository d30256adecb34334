//! The diagram compilation pipeline.
//!
//! Four phases, in order:
//!
//! 1. **Resolve** - canonicalize labels and default handle names, reject
//!    duplicate ids and handle-less condition branches.
//! 2. **Bind** - resolve `person_job` references against the diagram's
//!    persons table and attach the resolved configs; compute effective
//!    iteration budgets.
//! 3. **Validate** - structural checks: at least one source node, no dangling
//!    edge references, condition nodes with both `true`/`false` outputs,
//!    every cycle passing through a node with an iteration budget.
//! 4. **Index** - adjacency maps, feedback-edge discovery, terminal flags,
//!    priority precomputation, deterministic ordering.
//!
//! [`DiagramCompiler::compile`] fails on any error-severity diagnostic;
//! [`DiagramCompiler::compile_with_diagnostics`] returns both for tooling.

use crate::diagram::domain::{DomainDiagram, DomainEdge, NodeConfig, NodeType};
use crate::diagram::executable::{ExecutableDiagram, ExecutableEdge, ExecutableNode};
use crate::error::{Diagnostic, DipeoError, Result, Severity};
use dipeo_state::NodeId;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Default handle name when an edge does not declare one.
pub const DEFAULT_HANDLE: &str = "default";

/// Domain graph -> [`ExecutableDiagram`] compiler.
#[derive(Debug, Default)]
pub struct DiagramCompiler;

impl DiagramCompiler {
    pub fn new() -> Self {
        Self
    }

    /// Compile, failing on the first error-severity diagnostic set.
    pub fn compile(&self, diagram: &DomainDiagram) -> Result<ExecutableDiagram> {
        let (compiled, diagnostics) = self.compile_with_diagnostics(diagram);
        match compiled {
            Some(executable) => Ok(executable),
            None => Err(DipeoError::Compilation(diagnostics)),
        }
    }

    /// Compile, returning the executable (when error-free) plus every
    /// diagnostic collected along the way.
    pub fn compile_with_diagnostics(
        &self,
        diagram: &DomainDiagram,
    ) -> (Option<ExecutableDiagram>, Vec<Diagnostic>) {
        let mut diags = Vec::new();

        let mut nodes = self.resolve(diagram, &mut diags);
        let edges = self.resolve_edges(diagram, &nodes, &mut diags);
        self.bind(diagram, &mut nodes, &mut diags);
        self.validate(&nodes, &edges, &mut diags);

        if diags.iter().any(|d| d.severity == Severity::Error) {
            return (None, diags);
        }

        let executable = self.index(diagram, nodes, edges, diags.clone());
        (Some(executable), diags)
    }

    // -- phase 1: resolve ---------------------------------------------------

    fn resolve(&self, diagram: &DomainDiagram, diags: &mut Vec<Diagnostic>) -> Vec<ExecutableNode> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut nodes = Vec::with_capacity(diagram.nodes.len());
        for node in &diagram.nodes {
            if !seen.insert(node.id.as_str()) {
                diags.push(
                    Diagnostic::error("resolve", format!("Duplicate node id '{}'", node.id))
                        .with_node(node.id.clone()),
                );
                continue;
            }
            nodes.push(ExecutableNode {
                id: node.id.clone(),
                label: node.label.clone().unwrap_or_else(|| node.id.clone()),
                node_type: node.node_type(),
                config: node.config.clone(),
                max_iterations: 1, // effective budget set in bind
                retry: node.retry.clone(),
                is_terminal: false, // set in index
                priority: 0,        // set in index
            });
        }
        nodes
    }

    fn resolve_edges(
        &self,
        diagram: &DomainDiagram,
        nodes: &[ExecutableNode],
        diags: &mut Vec<Diagnostic>,
    ) -> Vec<ExecutableEdge> {
        let types: HashMap<&str, NodeType> = nodes
            .iter()
            .map(|n| (n.id.as_str(), n.node_type))
            .collect();

        let mut edges = Vec::with_capacity(diagram.edges.len());
        for (order, edge) in diagram.edges.iter().enumerate() {
            let source_handle = self.resolve_source_handle(edge, types.get(edge.source.as_str()));
            let source_handle = match source_handle {
                Ok(h) => h,
                Err(message) => {
                    diags.push(
                        Diagnostic::error("resolve", message).with_node(edge.source.clone()),
                    );
                    continue;
                }
            };
            edges.push(ExecutableEdge {
                source: edge.source.clone(),
                source_handle,
                target: edge.target.clone(),
                target_handle: edge
                    .target_handle
                    .clone()
                    .unwrap_or_else(|| DEFAULT_HANDLE.to_string()),
                content_type: edge.content_type,
                label: edge.label.clone(),
                execution_priority: edge.execution_priority,
                packing: edge.packing,
                order,
                is_feedback: false, // set in index
            });
        }
        edges
    }

    /// Condition sources must name a branch handle (`true`/`false`), either
    /// explicitly or through the edge label. Everything else defaults.
    fn resolve_source_handle(
        &self,
        edge: &DomainEdge,
        source_type: Option<&NodeType>,
    ) -> std::result::Result<String, String> {
        let declared = edge
            .source_handle
            .clone()
            .or_else(|| edge.label.clone());
        match source_type {
            Some(NodeType::Condition) => match declared.as_deref() {
                Some("true") => Ok("true".to_string()),
                Some("false") => Ok("false".to_string()),
                Some(other) => Err(format!(
                    "Condition edge handle must be 'true' or 'false', got '{other}'"
                )),
                None => Err(format!(
                    "Edge from condition '{}' must declare a branch handle or label",
                    edge.source
                )),
            },
            _ => Ok(declared.unwrap_or_else(|| DEFAULT_HANDLE.to_string())),
        }
    }

    // -- phase 2: bind ------------------------------------------------------

    fn bind(
        &self,
        diagram: &DomainDiagram,
        nodes: &mut [ExecutableNode],
        diags: &mut Vec<Diagnostic>,
    ) {
        let budgets: HashMap<&str, Option<u32>> = diagram
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), n.max_iterations))
            .collect();

        for node in nodes.iter_mut() {
            let declared = budgets.get(node.id.as_str()).copied().flatten();
            if let NodeConfig::PersonJob {
                person,
                max_iteration,
                resolved_person,
                ..
            } = &mut node.config
            {
                node.max_iterations = declared.or(*max_iteration).unwrap_or(1);
                if let Some(person_name) = person.as_deref() {
                    match diagram.persons.get(person_name) {
                        Some(def) => *resolved_person = Some(def.clone()),
                        None => diags.push(
                            Diagnostic::error(
                                "bind",
                                format!("Unknown person '{person_name}' referenced by node"),
                            )
                            .with_node(node.id.clone()),
                        ),
                    }
                }
            } else {
                node.max_iterations = declared.unwrap_or(1);
            }
            if node.max_iterations == 0 {
                diags.push(
                    Diagnostic::error("bind", "Iteration budget must be at least 1")
                        .with_node(node.id.clone()),
                );
            }
        }
    }

    // -- phase 3: validate --------------------------------------------------

    fn validate(
        &self,
        nodes: &[ExecutableNode],
        edges: &[ExecutableEdge],
        diags: &mut Vec<Diagnostic>,
    ) {
        let ids: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();

        if !nodes.iter().any(|n| n.node_type == NodeType::Start) {
            diags.push(Diagnostic::error(
                "validate",
                "Diagram has no start node",
            ));
        }

        for edge in edges {
            if !ids.contains(edge.source.as_str()) {
                diags.push(
                    Diagnostic::error(
                        "validate",
                        format!("Edge source '{}' does not exist", edge.source),
                    )
                    .with_node(edge.source.clone()),
                );
            }
            if !ids.contains(edge.target.as_str()) {
                diags.push(
                    Diagnostic::error(
                        "validate",
                        format!("Edge target '{}' does not exist", edge.target),
                    )
                    .with_node(edge.target.clone()),
                );
            }
        }

        // Condition nodes need both branches wired.
        for node in nodes.iter().filter(|n| n.node_type == NodeType::Condition) {
            let handles: HashSet<&str> = edges
                .iter()
                .filter(|e| e.source == node.id)
                .map(|e| e.source_handle.as_str())
                .collect();
            for branch in ["true", "false"] {
                if !handles.contains(branch) {
                    diags.push(
                        Diagnostic::error(
                            "validate",
                            format!("Condition node is missing its '{branch}' output"),
                        )
                        .with_node(node.id.clone()),
                    );
                }
            }
        }

        // Cycles are legal, but each must pass through an iteration budget.
        if diags.iter().all(|d| d.severity != Severity::Error) {
            for component in strongly_connected_components(nodes, edges) {
                let cyclic = component.len() > 1
                    || edges
                        .iter()
                        .any(|e| e.source == e.target && component.contains(&e.source));
                if !cyclic {
                    continue;
                }
                let budgeted = nodes
                    .iter()
                    .any(|n| component.contains(&n.id) && n.max_iterations > 1);
                if !budgeted {
                    let mut members: Vec<&str> =
                        component.iter().map(|s| s.as_str()).collect();
                    members.sort_unstable();
                    diags.push(Diagnostic::error(
                        "validate",
                        format!(
                            "Cycle through [{}] has no node with an iteration budget",
                            members.join(", ")
                        ),
                    ));
                }
            }
        }
    }

    // -- phase 4: index -----------------------------------------------------

    fn index(
        &self,
        diagram: &DomainDiagram,
        mut nodes: Vec<ExecutableNode>,
        mut edges: Vec<ExecutableEdge>,
        diagnostics: Vec<Diagnostic>,
    ) -> ExecutableDiagram {
        mark_feedback_edges(&nodes, &mut edges);

        let mut edges_by_source: BTreeMap<NodeId, Vec<usize>> = BTreeMap::new();
        let mut edges_by_target: BTreeMap<NodeId, Vec<usize>> = BTreeMap::new();
        for (i, edge) in edges.iter().enumerate() {
            edges_by_source.entry(edge.source.clone()).or_default().push(i);
            edges_by_target.entry(edge.target.clone()).or_default().push(i);
        }
        for idxs in edges_by_target.values_mut() {
            idxs.sort_by(|&a, &b| {
                edges[b]
                    .execution_priority
                    .cmp(&edges[a].execution_priority)
                    .then(edges[a].order.cmp(&edges[b].order))
            });
        }

        for node in nodes.iter_mut() {
            node.is_terminal = node.node_type == NodeType::Endpoint
                || !edges_by_source.contains_key(&node.id);
            node.priority = edges_by_target
                .get(&node.id)
                .map(|idxs| {
                    idxs.iter()
                        .map(|&i| edges[i].execution_priority)
                        .max()
                        .unwrap_or(0)
                })
                .unwrap_or(0);
        }

        nodes.sort_by(|a, b| a.id.cmp(&b.id));

        let metadata: BTreeMap<String, serde_json::Value> = diagram
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        ExecutableDiagram {
            diagram_id: diagram.diagram_id(),
            nodes,
            edges,
            edges_by_source,
            edges_by_target,
            metadata,
            diagnostics,
        }
    }
}

/// Depth-first search from every source node, marking edges that close a
/// cycle (targets still on the visit stack). Deterministic: roots and
/// neighbors are visited in sorted order.
fn mark_feedback_edges(nodes: &[ExecutableNode], edges: &mut [ExecutableEdge]) {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let mut outgoing: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, edge) in edges.iter().enumerate() {
        outgoing.entry(edge.source.as_str()).or_default().push(i);
    }

    let mut color: HashMap<&str, Color> = nodes
        .iter()
        .map(|n| (n.id.as_str(), Color::White))
        .collect();

    let mut roots: Vec<&str> = nodes
        .iter()
        .filter(|n| n.node_type == NodeType::Start)
        .map(|n| n.id.as_str())
        .collect();
    roots.extend(nodes.iter().map(|n| n.id.as_str()));

    let mut feedback = vec![false; edges.len()];
    for root in roots {
        if color.get(root) != Some(&Color::White) {
            continue;
        }
        // Iterative DFS: (node, next outgoing-edge cursor).
        let mut stack: Vec<(&str, usize)> = vec![(root, 0)];
        color.insert(root, Color::Gray);
        while !stack.is_empty() {
            let step = {
                let top = stack.last_mut().expect("stack is non-empty");
                let out = outgoing.get(top.0).map(|v| v.as_slice()).unwrap_or(&[]);
                if top.1 >= out.len() {
                    None
                } else {
                    let edge_idx = out[top.1];
                    top.1 += 1;
                    Some(edge_idx)
                }
            };
            let Some(edge_idx) = step else {
                let (finished, _) = stack.pop().expect("stack is non-empty");
                color.insert(finished, Color::Black);
                continue;
            };
            let target = edges[edge_idx].target.as_str();
            match color.get(target) {
                Some(Color::White) => {
                    color.insert(target, Color::Gray);
                    stack.push((target, 0));
                }
                Some(Color::Gray) => feedback[edge_idx] = true,
                _ => {}
            }
        }
    }
    for (i, edge) in edges.iter_mut().enumerate() {
        edge.is_feedback = feedback[i];
    }
}

/// Tarjan's strongly connected components, iterative form. Returns each
/// component as a set of node ids.
fn strongly_connected_components(
    nodes: &[ExecutableNode],
    edges: &[ExecutableEdge],
) -> Vec<HashSet<NodeId>> {
    let index_of: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id.as_str(), i))
        .collect();
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for edge in edges {
        if let (Some(&s), Some(&t)) = (
            index_of.get(edge.source.as_str()),
            index_of.get(edge.target.as_str()),
        ) {
            adjacency[s].push(t);
        }
    }

    let n = nodes.len();
    let mut index = vec![usize::MAX; n];
    let mut lowlink = vec![0usize; n];
    let mut on_stack = vec![false; n];
    let mut stack: Vec<usize> = Vec::new();
    let mut next_index = 0usize;
    let mut components = Vec::new();

    // Explicit call stack of (vertex, neighbor cursor).
    for start in 0..n {
        if index[start] != usize::MAX {
            continue;
        }
        let mut call: Vec<(usize, usize)> = vec![(start, 0)];
        while !call.is_empty() {
            let (v, neighbor) = {
                let top = call.last_mut().expect("call stack is non-empty");
                let v = top.0;
                if top.1 == 0 {
                    index[v] = next_index;
                    lowlink[v] = next_index;
                    next_index += 1;
                    stack.push(v);
                    on_stack[v] = true;
                }
                let neighbor = adjacency[v].get(top.1).copied();
                top.1 += 1;
                (v, neighbor)
            };
            match neighbor {
                Some(w) if index[w] == usize::MAX => call.push((w, 0)),
                Some(w) if on_stack[w] => lowlink[v] = lowlink[v].min(index[w]),
                Some(_) => {}
                None => {
                    call.pop();
                    if let Some(&(parent, _)) = call.last() {
                        lowlink[parent] = lowlink[parent].min(lowlink[v]);
                    }
                    if lowlink[v] == index[v] {
                        let mut component = HashSet::new();
                        while let Some(w) = stack.pop() {
                            on_stack[w] = false;
                            component.insert(nodes[w].id.clone());
                            if w == v {
                                break;
                            }
                        }
                        components.push(component);
                    }
                }
            }
        }
    }
    components
}
