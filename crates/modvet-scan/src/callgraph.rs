//! Call graph arena for reachability analysis.
//!
//! Nodes are function records keyed by a stable identifier; caller
//! records live on the callee node as call sites, indexing back into
//! the arena. The graph may contain cycles and synthetic wrapper
//! nodes; every traversal uses an explicit visited set.

use modvet_graph::{DepGraph, Position};
use std::collections::HashMap;

pub type NodeId = usize;

/// A function of the program, with the sites where it is called.
#[derive(Debug, Clone, Default)]
pub struct FuncNode {
    pub name: String,
    /// Receiver type for methods, possibly with a `*` marker.
    pub receiver: String,
    pub pkg_path: String,
    /// Declaration position.
    pub pos: Option<Position>,
    /// Synthetic wrapper generated by the builder (e.g. a
    /// pointer-receiver thunk), collapsed out of witness stacks.
    pub wrapper: bool,
    pub call_sites: Vec<CallSite>,
}

impl FuncNode {
    pub fn new(pkg_path: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pkg_path: pkg_path.into(),
            ..Self::default()
        }
    }

    pub fn method(
        pkg_path: impl Into<String>,
        receiver: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            receiver: receiver.into(),
            pkg_path: pkg_path.into(),
            ..Self::default()
        }
    }

    pub fn at(mut self, pos: Position) -> Self {
        self.pos = Some(pos);
        self
    }

    pub fn as_wrapper(mut self) -> Self {
        self.wrapper = true;
        self
    }

    /// The advisory-style symbol name: `Func` or `Receiver.Method`
    /// with any pointer marker stripped.
    pub fn symbol(&self) -> String {
        if self.receiver.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.receiver.trim_start_matches('*'), self.name)
        }
    }

    /// Stable identifier within a program: package, receiver, name.
    pub fn key(&self) -> String {
        if self.receiver.is_empty() {
            format!("{}.{}", self.pkg_path, self.name)
        } else {
            format!("{}.{}.{}", self.pkg_path, self.receiver, self.name)
        }
    }
}

/// One call of a function: who calls it, under what syntactic name,
/// and whether the builder resolved the callee statically.
#[derive(Debug, Clone)]
pub struct CallSite {
    pub caller: NodeId,
    pub name: String,
    pub recv_type: String,
    pub resolved: bool,
    pub pos: Option<Position>,
}

impl CallSite {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            caller: 0,
            name: name.into(),
            recv_type: String::new(),
            resolved: true,
            pos: None,
        }
    }

    pub fn at(mut self, pos: Position) -> Self {
        self.pos = Some(pos);
        self
    }

    pub fn with_recv_type(mut self, recv_type: impl Into<String>) -> Self {
        self.recv_type = recv_type.into();
        self
    }

    pub fn unresolved(mut self) -> Self {
        self.resolved = false;
        self
    }
}

/// Whether `name` names a package initializer (explicit or one of the
/// synthetic `init#N` bodies).
pub fn is_init(name: &str) -> bool {
    name == "init" || name.starts_with("init#")
}

#[derive(Debug, Clone, Default)]
pub struct CallGraph {
    nodes: Vec<FuncNode>,
    by_key: HashMap<String, NodeId>,
    entries: Vec<NodeId>,
}

impl CallGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a function. A second add with the same key returns the
    /// existing node.
    pub fn add_func(&mut self, node: FuncNode) -> NodeId {
        let key = node.key();
        if let Some(&id) = self.by_key.get(&key) {
            return id;
        }
        let id = self.nodes.len();
        self.nodes.push(node);
        self.by_key.insert(key, id);
        id
    }

    /// Record that `caller` calls `callee`; the site lands on the
    /// callee's caller list.
    pub fn add_call(&mut self, caller: NodeId, callee: NodeId, mut site: CallSite) {
        site.caller = caller;
        self.nodes[callee].call_sites.push(site);
    }

    pub fn node(&self, id: NodeId) -> &FuncNode {
        &self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &FuncNode)> {
        self.nodes.iter().enumerate()
    }

    /// Nodes whose function matches a vulnerable `(package, symbol)`.
    pub fn lookup_symbol(&self, pkg_path: &str, symbol: &str) -> Vec<NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.pkg_path == pkg_path && n.symbol() == symbol)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn mark_entry(&mut self, id: NodeId) {
        if !self.entries.contains(&id) {
            self.entries.push(id);
            self.entries.sort_unstable();
        }
    }

    pub fn entries(&self) -> &[NodeId] {
        &self.entries
    }

    pub fn is_entry(&self, id: NodeId) -> bool {
        self.entries.binary_search(&id).is_ok()
    }

    /// Enumerate program entry points: `main` of each top-level
    /// package and every package initializer, explicit or implicit.
    pub fn mark_entry_points(&mut self, graph: &DepGraph) {
        let top: Vec<&str> = graph.top_packages().iter().map(String::as_str).collect();
        let marks: Vec<NodeId> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| {
                n.receiver.is_empty()
                    && (is_init(&n.name)
                        || (n.name == "main" && top.contains(&n.pkg_path.as_str())))
            })
            .map(|(id, _)| id)
            .collect();
        for id in marks {
            self.mark_entry(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modvet_graph::Package;

    #[test]
    fn interning_by_key() {
        let mut cg = CallGraph::new();
        let a = cg.add_func(FuncNode::new("example.com/m/p", "F"));
        let b = cg.add_func(FuncNode::new("example.com/m/p", "F"));
        let c = cg.add_func(FuncNode::method("example.com/m/p", "T", "F"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(cg.len(), 2);
    }

    #[test]
    fn symbols_strip_pointer_receivers() {
        let node = FuncNode::method("p", "*Conn", "Close");
        assert_eq!(node.symbol(), "Conn.Close");

        let mut cg = CallGraph::new();
        let id = cg.add_func(node);
        assert_eq!(cg.lookup_symbol("p", "Conn.Close"), vec![id]);
        assert!(cg.lookup_symbol("p", "Close").is_empty());
    }

    #[test]
    fn call_sites_record_callers() {
        let mut cg = CallGraph::new();
        let main = cg.add_func(FuncNode::new("example.com/app", "main"));
        let f = cg.add_func(FuncNode::new("example.com/m/p", "F"));
        cg.add_call(main, f, CallSite::new("F"));

        let sites = &cg.node(f).call_sites;
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].caller, main);
        assert!(sites[0].resolved);
    }

    #[test]
    fn entry_points_are_main_of_top_and_every_init() {
        let mut graph = DepGraph::new();
        graph.add_package(Package {
            path: "example.com/app".into(),
            module: "example.com/app".into(),
            ..Package::default()
        });
        graph.add_package(Package {
            path: "example.com/dep".into(),
            module: "example.com/dep".into(),
            ..Package::default()
        });
        graph.set_top(vec!["example.com/app".into()]);

        let mut cg = CallGraph::new();
        let app_main = cg.add_func(FuncNode::new("example.com/app", "main"));
        let dep_main = cg.add_func(FuncNode::new("example.com/dep", "main"));
        let dep_init = cg.add_func(FuncNode::new("example.com/dep", "init"));
        let dep_init1 = cg.add_func(FuncNode::new("example.com/dep", "init#1"));
        let plain = cg.add_func(FuncNode::new("example.com/dep", "F"));

        cg.mark_entry_points(&graph);
        assert!(cg.is_entry(app_main));
        assert!(!cg.is_entry(dep_main));
        assert!(cg.is_entry(dep_init));
        assert!(cg.is_entry(dep_init1));
        assert!(!cg.is_entry(plain));
    }
}
