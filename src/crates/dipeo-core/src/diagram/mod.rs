//! Diagram data model and compilation.
//!
//! - [`domain`] - the declarative graph as authored (nodes, edges, persons)
//! - [`executable`] - the compiled representation the engine runs
//! - [`compiler`] - the four-phase compilation pipeline
//! - [`format`] - the light/native/readable file formats and conversion

pub mod compiler;
pub mod domain;
pub mod executable;
pub mod format;

pub use compiler::DiagramCompiler;
pub use domain::{
    DbOperation, DomainDiagram, DomainEdge, DomainNode, HookType, NodeConfig, NodeType,
    OutputMode, Packing, PersonDef, RetryPolicy,
};
pub use executable::{ExecutableDiagram, ExecutableEdge, ExecutableNode};
pub use format::DiagramFormat;
