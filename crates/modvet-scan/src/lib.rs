//! Reachability-refined vulnerability scanning.
//!
//! This crate is the core of modvet: the advisory index filtered per
//! installed module, the source reachability engine (imported-symbol
//! detection, call-graph slice, witness extraction), binary symbol
//! matching, and the finding emitter with its handler protocol.
//!
//! The advisory index, module graph, and symbol maps are built once
//! per scan and are read-only afterwards; the call graph is handed
//! off by a barrier join to the slicing phase and discarded after
//! trace extraction.

pub mod binary;
pub mod callgraph;
pub mod cancel;
pub mod emit;
pub mod error;
pub mod finding;
pub mod handler;
pub mod index;
pub mod source;
pub mod witness;

pub use binary::{binary_findings, BinaryArtifact, SymbolSource};
pub use callgraph::{CallGraph, CallSite, FuncNode, NodeId};
pub use cancel::{CancelToken, Cancelled};
pub use emit::{module_level_findings, Emitter};
pub use error::{Result, ScanError};
pub use finding::{Finding, Frame, ScanLevel};
pub use handler::{
    dispatch, found_at_level, replay, Config, Handler, MemHandler, Message, Progress, ScanMode,
    VulnerabilitiesFound, PROTOCOL_VERSION,
};
pub use index::{AdvisoryIndex, Target};
pub use source::{
    analyze_source, check_single_origin, imported_candidates, package_level_findings, slice,
    Candidate, CallGraphBuilder, LoadConfig, LoadedProgram, SourceLoader,
};
