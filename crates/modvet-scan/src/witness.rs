//! Witness extraction: one representative call stack per reached
//! vulnerable symbol.
//!
//! Preference order: stacks avoiding other vulnerable symbols, then
//! stacks avoiding synthetic wrapper frames, then the shortest stack,
//! then lexicographic frame order. Wrapper/wrapped pairs that survive
//! are collapsed to the wrapped frame, and `init` frames take their
//! call position from the triggering import statement.

use crate::callgraph::{is_init, CallGraph, CallSite, NodeId};
use crate::finding::Frame;
use modvet_graph::DepGraph;
use modvet_osv::version;
use std::collections::{BTreeSet, HashMap, VecDeque};

/// One frame of a stack under construction, sink first. `call` is the
/// site by which this function was called from the next frame.
#[derive(Debug, Clone)]
pub struct StackFrame {
    pub func: NodeId,
    pub call: Option<CallSite>,
}

/// A representative stack from `sink` to some entry point, in
/// sink-to-entry order. `None` when no entry point reaches the sink.
pub fn witness(
    cg: &CallGraph,
    sink: NodeId,
    avoid_vulnerable: &BTreeSet<NodeId>,
) -> Option<Vec<StackFrame>> {
    let tiers: [(bool, bool); 4] = [(true, true), (true, false), (false, true), (false, false)];
    for (avoid_vuln, avoid_wrappers) in tiers {
        let avoid = avoid_vuln.then_some(avoid_vulnerable);
        if let Some(stack) = shortest_stack(cg, sink, avoid, avoid_wrappers) {
            return Some(stack);
        }
    }
    None
}

/// BFS from the sink over caller edges. Expansion order is sorted by
/// caller identity, so equal-length stacks resolve to the
/// lexicographically first one.
fn shortest_stack(
    cg: &CallGraph,
    sink: NodeId,
    avoid: Option<&BTreeSet<NodeId>>,
    avoid_wrappers: bool,
) -> Option<Vec<StackFrame>> {
    // parent[n] = the callee n was discovered from, and the call site
    // by which n calls it.
    let mut parent: HashMap<NodeId, Option<(NodeId, CallSite)>> = HashMap::new();
    parent.insert(sink, None);
    let mut queue: VecDeque<NodeId> = VecDeque::from([sink]);
    let mut end: Option<NodeId> = if cg.is_entry(sink) { Some(sink) } else { None };

    'bfs: while end.is_none() {
        let Some(current) = queue.pop_front() else {
            break;
        };
        let mut sites: Vec<&CallSite> = cg.node(current).call_sites.iter().collect();
        sites.sort_by(|a, b| {
            cg.node(a.caller)
                .key()
                .cmp(&cg.node(b.caller).key())
                .then_with(|| a.pos.cmp(&b.pos))
        });
        for site in sites {
            let caller = site.caller;
            if parent.contains_key(&caller) {
                continue;
            }
            if avoid.is_some_and(|set| set.contains(&caller)) {
                continue;
            }
            if avoid_wrappers && cg.node(caller).wrapper {
                continue;
            }
            parent.insert(caller, Some((current, site.clone())));
            if cg.is_entry(caller) {
                end = Some(caller);
                break 'bfs;
            }
            queue.push_back(caller);
        }
    }

    let end = end?;
    // Rebuild entry-to-sink, then flip to sink-first.
    let mut stack = vec![StackFrame {
        func: end,
        call: None,
    }];
    let mut current = end;
    while let Some((callee, site)) = parent.get(&current).and_then(|p| p.clone()) {
        stack.push(StackFrame {
            func: callee,
            call: Some(site),
        });
        current = callee;
    }
    stack.reverse();
    Some(stack)
}

/// Collapse adjacent wrapper/wrapped pairs to the wrapped frame. The
/// surviving frame inherits the call that entered the pair.
pub fn collapse_wrappers(cg: &CallGraph, stack: Vec<StackFrame>) -> Vec<StackFrame> {
    let mut out: Vec<StackFrame> = Vec::with_capacity(stack.len());
    let mut i = 0;
    while i < stack.len() {
        if i + 1 < stack.len() {
            let inner = &stack[i];
            let outer = &stack[i + 1];
            let inner_node = cg.node(inner.func);
            let outer_node = cg.node(outer.func);
            let pair = inner_node.pkg_path == outer_node.pkg_path
                && inner_node.name == outer_node.name
                && inner_node.wrapper != outer_node.wrapper;
            if pair {
                if outer_node.wrapper {
                    // Wrapped callee entered through its wrapper: keep
                    // the wrapped frame, called from the wrapper's
                    // caller.
                    out.push(StackFrame {
                        func: inner.func,
                        call: outer.call.clone(),
                    });
                } else {
                    out.push(outer.clone());
                }
                i += 2;
                continue;
            }
        }
        out.push(stack[i].clone());
        i += 1;
    }
    out
}

/// Rewrite `init` frame call positions to the import statement that
/// triggers the initializer, instead of the synthetic init body.
///
/// When the stack continues past the init frame, the importer is the
/// calling init's package. The outermost init of a stack has no
/// caller frame, so it is attributed to the first importing package
/// in path order.
pub fn update_init_positions(cg: &CallGraph, graph: &DepGraph, stack: &mut [StackFrame]) {
    for i in 0..stack.len() {
        let callee = cg.node(stack[i].func);
        if !is_init(&callee.name) {
            continue;
        }
        let init_pkg = callee.pkg_path.clone();

        let import_pos = match stack.get(i + 1) {
            Some(caller_frame) => {
                let caller = cg.node(caller_frame.func);
                if !is_init(&caller.name) {
                    continue;
                }
                graph
                    .get_package(&caller.pkg_path)
                    .and_then(|p| p.import_positions.get(&init_pkg))
                    .cloned()
            }
            None => graph
                .packages()
                .find_map(|p| p.import_positions.get(&init_pkg))
                .cloned(),
        };
        let Some(import_pos) = import_pos else {
            continue;
        };

        match stack[i].call.as_mut() {
            Some(call) => call.pos = Some(import_pos),
            None => {
                let mut call = CallSite::new("init");
                call.pos = Some(import_pos);
                stack[i].call = Some(call);
            }
        }
    }
}

/// Render a stack as finding frames, sink first. A frame's position
/// is where it was called from; the entry frame falls back to its
/// declaration.
pub fn stack_to_trace(cg: &CallGraph, graph: &DepGraph, stack: &[StackFrame]) -> Vec<Frame> {
    stack
        .iter()
        .map(|frame| {
            let node = cg.node(frame.func);
            let (module, module_version) = match graph.module_for_package(&node.pkg_path) {
                Some(module) => (
                    module.path.clone(),
                    version::canonical(&module.resolved().version),
                ),
                None => (graph.owning_module_path(&node.pkg_path), String::new()),
            };
            Frame {
                module,
                version: module_version,
                package: node.pkg_path.clone(),
                receiver: node.receiver.trim_start_matches('*').to_string(),
                function: node.name.clone(),
                position: frame
                    .call
                    .as_ref()
                    .and_then(|call| call.pos.clone())
                    .or_else(|| node.pos.clone()),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callgraph::FuncNode;
    use modvet_graph::{Module, Package, Position};

    fn call(name: &str, file: &str, line: u32) -> CallSite {
        CallSite::new(name).at(Position::new(file, line, 1))
    }

    /// main -> a -> V, plus main -> b -> W -> V.
    fn diamond() -> (CallGraph, NodeId, NodeId) {
        let mut cg = CallGraph::new();
        let main = cg.add_func(FuncNode::new("example.com/app", "main"));
        let a = cg.add_func(FuncNode::new("example.com/app", "a"));
        let b = cg.add_func(FuncNode::new("example.com/app", "b"));
        let w = cg.add_func(FuncNode::new("example.com/v", "W"));
        let v = cg.add_func(FuncNode::new("example.com/v", "V"));

        cg.add_call(main, a, call("a", "main.go", 5));
        cg.add_call(main, b, call("b", "main.go", 6));
        cg.add_call(a, v, call("V", "a.go", 10));
        cg.add_call(b, w, call("W", "b.go", 3));
        cg.add_call(w, v, call("V", "w.go", 7));
        cg.mark_entry(main);
        (cg, v, w)
    }

    #[test]
    fn witness_prefers_stacks_avoiding_other_vulnerable_symbols() {
        let (cg, v, w) = diamond();
        let avoid: BTreeSet<NodeId> = [w].into();
        let stack = witness(&cg, v, &avoid).unwrap();
        let names: Vec<&str> = stack.iter().map(|f| cg.node(f.func).name.as_str()).collect();
        assert_eq!(names, vec!["V", "a", "main"]);
    }

    #[test]
    fn witness_falls_back_when_all_paths_are_vulnerable() {
        let mut cg = CallGraph::new();
        let main = cg.add_func(FuncNode::new("app", "main"));
        let w = cg.add_func(FuncNode::new("v", "W"));
        let v = cg.add_func(FuncNode::new("v", "V"));
        cg.add_call(main, w, call("W", "main.go", 2));
        cg.add_call(w, v, call("V", "w.go", 4));
        cg.mark_entry(main);

        let avoid: BTreeSet<NodeId> = [w].into();
        let stack = witness(&cg, v, &avoid).unwrap();
        let names: Vec<&str> = stack.iter().map(|f| cg.node(f.func).name.as_str()).collect();
        assert_eq!(names, vec!["V", "W", "main"]);
    }

    #[test]
    fn witness_returns_none_for_unreachable_sink() {
        let mut cg = CallGraph::new();
        let main = cg.add_func(FuncNode::new("app", "main"));
        let v = cg.add_func(FuncNode::new("v", "V"));
        cg.mark_entry(main);
        assert!(witness(&cg, v, &BTreeSet::new()).is_none());
    }

    #[test]
    fn witness_is_cycle_safe() {
        let mut cg = CallGraph::new();
        let main = cg.add_func(FuncNode::new("app", "main"));
        let a = cg.add_func(FuncNode::new("app", "a"));
        let v = cg.add_func(FuncNode::new("v", "V"));
        cg.add_call(main, a, call("a", "m.go", 1));
        cg.add_call(a, a, call("a", "a.go", 2));
        cg.add_call(a, v, call("V", "a.go", 3));
        cg.mark_entry(main);

        let stack = witness(&cg, v, &BTreeSet::new()).unwrap();
        assert_eq!(stack.len(), 3);
    }

    #[test]
    fn wrapper_frames_collapse_to_wrapped() {
        let mut cg = CallGraph::new();
        let main = cg.add_func(FuncNode::new("app", "main"));
        let wrapper = cg.add_func(FuncNode::method("v", "*Conn", "Close").as_wrapper());
        let wrapped = cg.add_func(FuncNode::method("v", "Conn", "Close"));
        cg.add_call(main, wrapper, call("Close", "main.go", 9));
        cg.add_call(wrapper, wrapped, call("Close", "wrap.go", 1));
        cg.mark_entry(main);

        // Only the wrapper route exists, so the fallback tier takes it.
        let stack = witness(&cg, wrapped, &BTreeSet::new()).unwrap();
        assert_eq!(stack.len(), 3);

        let collapsed = collapse_wrappers(&cg, stack);
        assert_eq!(collapsed.len(), 2);
        assert_eq!(cg.node(collapsed[0].func).receiver, "Conn");
        // The wrapped frame inherits the caller's call site.
        let pos = collapsed[0].call.as_ref().unwrap().pos.as_ref().unwrap();
        assert_eq!(pos.filename, "main.go");
        assert_eq!(pos.line, 9);
    }

    #[test]
    fn init_frames_take_import_positions() {
        let mut graph = DepGraph::new();
        graph.add_modules([Module::new("example.com/app", ""), Module::new("example.com/dep", "v1.0.0")]);
        let mut app = Package {
            path: "example.com/app".into(),
            module: "example.com/app".into(),
            imports: vec!["example.com/dep".into()],
            ..Package::default()
        };
        app.import_positions
            .insert("example.com/dep".into(), Position::new("app.go", 3, 8));
        graph.add_package(app);
        graph.add_package(Package {
            path: "example.com/dep".into(),
            module: "example.com/dep".into(),
            ..Package::default()
        });
        graph.set_top(vec!["example.com/app".into()]);

        let mut cg = CallGraph::new();
        let app_init = cg.add_func(FuncNode::new("example.com/app", "init"));
        let dep_init = cg.add_func(FuncNode::new("example.com/dep", "init"));
        let sink = cg.add_func(FuncNode::new("example.com/dep", "V"));
        cg.add_call(app_init, dep_init, call("init", "synthetic.go", 1));
        cg.add_call(dep_init, sink, call("V", "dep.go", 12));
        cg.mark_entry_points(&graph);

        // dep.init is itself an entry point, so the witness ends there.
        let mut stack = witness(&cg, sink, &BTreeSet::new()).unwrap();
        assert_eq!(stack.len(), 2);
        update_init_positions(&cg, &graph, &mut stack);

        // dep.init was triggered by app's import statement.
        let dep_frame = stack
            .iter()
            .find(|f| f.func == dep_init)
            .expect("dep init frame");
        let pos = dep_frame.call.as_ref().unwrap().pos.as_ref().unwrap();
        assert_eq!(pos.filename, "app.go");
        assert_eq!(pos.line, 3);
    }

    #[test]
    fn init_chain_uses_the_calling_inits_import() {
        let mut graph = DepGraph::new();
        graph.add_modules([Module::new("example.com/mid", "v1.0.0"), Module::new("example.com/dep", "v1.0.0")]);
        let mut mid = Package {
            path: "example.com/mid".into(),
            module: "example.com/mid".into(),
            imports: vec!["example.com/dep".into()],
            ..Package::default()
        };
        mid.import_positions
            .insert("example.com/dep".into(), Position::new("mid.go", 7, 2));
        graph.add_package(mid);
        graph.add_package(Package {
            path: "example.com/dep".into(),
            module: "example.com/dep".into(),
            ..Package::default()
        });

        let mut cg = CallGraph::new();
        let mid_init = cg.add_func(FuncNode::new("example.com/mid", "init"));
        let dep_init = cg.add_func(FuncNode::new("example.com/dep", "init"));
        cg.add_call(mid_init, dep_init, call("init", "synthetic.go", 1));

        let mut stack = vec![
            StackFrame {
                func: dep_init,
                call: Some(call("init", "synthetic.go", 1)),
            },
            StackFrame {
                func: mid_init,
                call: None,
            },
        ];
        update_init_positions(&cg, &graph, &mut stack);
        let pos = stack[0].call.as_ref().unwrap().pos.as_ref().unwrap();
        assert_eq!(pos.filename, "mid.go");
        assert_eq!(pos.line, 7);
    }

    #[test]
    fn trace_rendering_orders_sink_first() {
        let (cg, v, w) = diamond();
        let mut graph = DepGraph::new();
        graph.add_modules([
            Module::new("example.com/app", ""),
            Module::new("example.com/v", "v1.1.0"),
        ]);
        graph.add_package(Package {
            path: "example.com/app".into(),
            module: "example.com/app".into(),
            ..Package::default()
        });
        graph.add_package(Package {
            path: "example.com/v".into(),
            module: "example.com/v".into(),
            ..Package::default()
        });
        graph.set_top(vec!["example.com/app".into()]);

        let avoid: BTreeSet<NodeId> = [w].into();
        let stack = witness(&cg, v, &avoid).unwrap();
        let trace = stack_to_trace(&cg, &graph, &stack);

        assert_eq!(trace[0].function, "V");
        assert_eq!(trace[0].module, "example.com/v");
        assert_eq!(trace[0].version, "v1.1.0");
        // The sink's position is the call site in its caller.
        assert_eq!(trace[0].position.as_ref().unwrap().filename, "a.go");
        assert_eq!(trace.last().unwrap().function, "main");
    }
}
