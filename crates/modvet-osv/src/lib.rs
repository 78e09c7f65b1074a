//! OSV advisory model, Go version semantics, and database clients.
//!
//! This crate holds the pieces of modvet that deal with advisories in
//! isolation from any particular program under analysis: the OSV entry
//! model, semver range membership and latest-fixed computation,
//! toolchain-tag mapping, and the pluggable per-module database
//! client.

pub mod client;
pub mod entry;
pub mod version;

pub use client::{escape_module_path, Client, DirClient, HttpClient, MemClient, DEFAULT_DB};
pub use entry::{
    Affected, AffectedModule, AffectedPackage, EcosystemSpecific, Entry, Range, RangeEvent,
    Reference, GO_ECOSYSTEM, RANGE_KIND_SEMVER,
};
