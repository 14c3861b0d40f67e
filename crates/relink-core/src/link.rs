//! Linking: order the graph and serialize it into one artifact.
//!
//! Modules are emitted importer-first: a topological order of the import
//! relation, ties broken by first-discovery order. Every module body is
//! wrapped in a function, so textual order only has to be stable, not
//! dependency-correct. A cycle is emitted as one block, in discovery order,
//! at the position of its earliest-discovered member.

use crate::artifact::BuildArtifact;
use crate::error::{Diagnostic, LinkError};
use crate::graph::{EdgeTarget, ModuleGraph, ModuleId, ModuleState};
use crate::sourcemap::SourceMapBuilder;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};

/// Module registry runtime. Ids are positions in emission order; specifiers
/// without a bundled target fall through to the host `require`.
const PRELUDE: &str = r#"(function (modules, entry) {
  var cache = {};
  var hostRequire = typeof require === "function" ? require : null;
  function load(id) {
    if (cache[id]) return cache[id].exports;
    var module = cache[id] = { exports: {} };
    var deps = modules[id][1];
    modules[id][0].call(module.exports, function (specifier) {
      var target = deps[specifier];
      if (target !== undefined) return load(target);
      if (hostRequire) return hostRequire(specifier);
      throw new Error("Cannot find module '" + specifier + "'");
    }, module, module.exports);
    return module.exports;
  }
  load(entry);
})({
"#;

/// Link every module reachable from the entry into one artifact.
///
/// Fails if any of those modules is not `Ready`. Nodes only reachable through
/// unresolved edges are not required.
pub fn link(graph: &ModuleGraph, out_file: &str) -> Result<BuildArtifact, LinkError> {
    if graph.entry().is_none() {
        return Err(LinkError::NoEntry);
    }
    let required = graph.reachable();

    let failures: Vec<Diagnostic> = required
        .iter()
        .filter_map(|id| graph.get(*id))
        .filter(|node| node.state != ModuleState::Ready || node.output.is_none())
        .map(|node| match &node.error {
            Some(err) => err.to_diagnostic(),
            None => Diagnostic::new(
                "MODULE_NOT_READY",
                Some(node.path.clone()),
                format!("{} is {}", node.name, node.state.as_str()),
            ),
        })
        .collect();
    if !failures.is_empty() {
        return Err(LinkError::NotReady { failures });
    }

    let order = emission_order(graph, &required);
    let position: FxHashMap<ModuleId, usize> =
        order.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    let map_file = format!("{out_file}.map");
    let mut code = String::from(PRELUDE);
    let mut line = count_lines(PRELUDE);
    let mut maps = SourceMapBuilder::new();
    let mut module_order = Vec::with_capacity(order.len());

    for (index, id) in order.iter().enumerate() {
        let Some(node) = graph.get(*id) else { continue };
        let Some(output) = &node.output else { continue };

        let deps: BTreeMap<&str, usize> = node
            .imports
            .iter()
            .filter_map(|edge| match edge.target {
                EdgeTarget::Module(target) => position
                    .get(&target)
                    .map(|pos| (edge.specifier.as_str(), *pos)),
                EdgeTarget::External | EdgeTarget::Unresolved => None,
            })
            .collect();
        let deps_json =
            serde_json::to_string(&deps).map_err(|e| LinkError::SourceMap(e.to_string()))?;

        code.push_str(&format!("/* {} */\n", node.name));
        code.push_str(&format!("{index}: [function (require, module, exports) {{\n"));
        line += 2;

        let body = output.code.strip_suffix('\n').unwrap_or(&output.code);
        let body_lines = count_lines(body) + 1;
        maps.append_lines(&output.map, line, body_lines);
        code.push_str(body);
        code.push('\n');
        line += body_lines;

        code.push_str(&format!("}}, {deps_json}],\n"));
        line += 1;

        module_order.push(node.path.clone());
    }

    let entry_position = graph
        .entry()
        .and_then(|entry| position.get(&entry).copied())
        .unwrap_or(0);
    code.push_str(&format!("}}, {entry_position});\n"));
    code.push_str(&format!("//# sourceMappingURL={map_file}\n"));

    let source_map = maps
        .build(out_file)
        .to_json()
        .map_err(|e| LinkError::SourceMap(e.to_string()))?;

    Ok(BuildArtifact::new(
        code.into_bytes(),
        source_map,
        module_order,
        out_file.to_string(),
        map_file,
    ))
}

/// Importer-before-imported order over `required`.
///
/// Import cycles are collapsed into strongly connected components first;
/// the component graph is then sorted topologically with ties broken by the
/// earliest discovery index of each component, and members of one component
/// are emitted in discovery order.
fn emission_order(graph: &ModuleGraph, required: &[ModuleId]) -> Vec<ModuleId> {
    let mut nodes: Vec<ModuleId> = required.to_vec();
    nodes.sort_by_key(|id| (graph.get(*id).map_or(u32::MAX, |n| n.discovery), *id));
    let local: FxHashMap<ModuleId, usize> =
        nodes.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    let edges: Vec<Vec<usize>> = nodes
        .iter()
        .map(|id| {
            graph.get(*id).map_or_else(Vec::new, |node| {
                node.dependencies()
                    .filter_map(|dep| local.get(&dep).copied())
                    .collect()
            })
        })
        .collect();

    let components = strongly_connected(&edges);
    let mut component_of = vec![0usize; nodes.len()];
    for (c, members) in components.iter().enumerate() {
        for &member in members {
            component_of[member] = c;
        }
    }

    let mut successors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); components.len()];
    for (from, targets) in edges.iter().enumerate() {
        for &to in targets {
            if component_of[from] != component_of[to] {
                successors[component_of[from]].insert(component_of[to]);
            }
        }
    }
    let mut pending = vec![0usize; components.len()];
    for targets in &successors {
        for &to in targets {
            pending[to] += 1;
        }
    }

    // Members are local indices, which already follow discovery order.
    let key = |c: usize| components[c].first().copied().unwrap_or(usize::MAX);
    let mut ready: BTreeSet<(usize, usize)> = (0..components.len())
        .filter(|c| pending[*c] == 0)
        .map(|c| (key(c), c))
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some((_, c)) = ready.pop_first() {
        if components[c].len() > 1 {
            tracing::debug!(modules = components[c].len(), "linearizing import cycle");
        }
        order.extend(components[c].iter().map(|&member| nodes[member]));
        for &to in &successors[c] {
            pending[to] -= 1;
            if pending[to] == 0 {
                ready.insert((key(to), to));
            }
        }
    }
    order
}

/// Tarjan's algorithm over a dense adjacency list, without recursion.
/// Each component's members come back sorted ascending.
fn strongly_connected(edges: &[Vec<usize>]) -> Vec<Vec<usize>> {
    let n = edges.len();
    let mut index: Vec<Option<usize>> = vec![None; n];
    let mut low = vec![0usize; n];
    let mut on_stack = vec![false; n];
    let mut stack: Vec<usize> = Vec::new();
    let mut components = Vec::new();
    let mut counter = 0usize;

    for root in 0..n {
        if index[root].is_some() {
            continue;
        }
        // (node, next edge to visit)
        let mut frames: Vec<(usize, usize)> = vec![(root, 0)];
        index[root] = Some(counter);
        low[root] = counter;
        counter += 1;
        stack.push(root);
        on_stack[root] = true;

        while let Some(frame) = frames.last_mut() {
            let (v, next) = *frame;
            frame.1 += 1;
            if let Some(&w) = edges[v].get(next) {
                match index[w] {
                    None => {
                        index[w] = Some(counter);
                        low[w] = counter;
                        counter += 1;
                        stack.push(w);
                        on_stack[w] = true;
                        frames.push((w, 0));
                    }
                    Some(w_index) if on_stack[w] => low[v] = low[v].min(w_index),
                    Some(_) => {}
                }
                continue;
            }

            frames.pop();
            if let Some(&(parent, _)) = frames.last() {
                low[parent] = low[parent].min(low[v]);
            }
            if index[v] == Some(low[v]) {
                let mut members = Vec::new();
                while let Some(member) = stack.pop() {
                    on_stack[member] = false;
                    members.push(member);
                    if member == v {
                        break;
                    }
                }
                members.sort_unstable();
                components.push(members);
            }
        }
    }
    components
}

fn count_lines(text: &str) -> u32 {
    u32::try_from(text.matches('\n').count()).unwrap_or(u32::MAX)
}
