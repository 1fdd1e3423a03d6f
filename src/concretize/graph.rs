//! Canonicalization of resolver output into hashed, ordered nodes

use crate::concretize::node::{ConcreteNode, NodeHash};
use crate::ecosystem::{Ecosystem, ResolvedPackage};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;

/// Structural problems in a resolved graph
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("package key '{0}' appears more than once")]
    DuplicateKey(String),

    #[error("{package} depends on '{dep}', which the resolver did not return")]
    DanglingDependency { package: String, dep: String },

    #[error("dependency cycle through {0}")]
    Cycle(String),
}

/// Canonical nodes plus the hash each resolver key ended up with
#[derive(Debug, Clone, PartialEq)]
pub struct Canonical {
    pub nodes: Vec<ConcreteNode>,
    pub keys: BTreeMap<String, NodeHash>,
}

/// Hash every package and return them dependencies-first.
///
/// Ties are broken by (name, hash) so the order depends only on the graph,
/// never on the order the resolver printed it in. `implicit_deps` are added
/// to every node, e.g. the interpreter a package-index layer runs on.
pub fn canonicalize(
    ecosystem: Ecosystem,
    packages: &[ResolvedPackage],
    implicit_deps: &[NodeHash],
) -> Result<Canonical, GraphError> {
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let mut index_map: HashMap<&str, NodeIndex> = HashMap::with_capacity(packages.len());

    for (i, pkg) in packages.iter().enumerate() {
        let idx = graph.add_node(i);
        if index_map.insert(pkg.key.as_str(), idx).is_some() {
            return Err(GraphError::DuplicateKey(pkg.key.clone()));
        }
    }

    for pkg in packages {
        let to = index_map[pkg.key.as_str()];
        let mut seen = BTreeSet::new();
        for dep in &pkg.deps {
            if !seen.insert(dep.as_str()) {
                continue;
            }
            let from = index_map.get(dep.as_str()).copied().ok_or_else(|| {
                GraphError::DanglingDependency {
                    package: pkg.name.clone(),
                    dep: dep.clone(),
                }
            })?;
            graph.add_edge(from, to, ());
        }
    }

    let topo = toposort(&graph, None)
        .map_err(|cycle| GraphError::Cycle(packages[graph[cycle.node_id()]].name.clone()))?;

    let mut nodes: Vec<Option<ConcreteNode>> = vec![None; packages.len()];
    for idx in topo {
        let pkg = &packages[graph[idx]];
        let mut deps: Vec<NodeHash> = graph
            .neighbors_directed(idx, Direction::Incoming)
            .filter_map(|d| nodes[graph[d]].as_ref().map(|n| n.hash.clone()))
            .collect();
        deps.extend(implicit_deps.iter().cloned());
        nodes[graph[idx]] = Some(ConcreteNode::new(
            ecosystem,
            pkg.name.clone(),
            pkg.version.clone(),
            pkg.options.clone(),
            pkg.native_id.clone(),
            deps,
        ));
    }
    let nodes: Vec<ConcreteNode> = nodes.into_iter().flatten().collect();
    let keys = packages
        .iter()
        .zip(&nodes)
        .map(|(pkg, node)| (pkg.key.clone(), node.hash.clone()))
        .collect();

    Ok(Canonical {
        nodes: canonical_order(&graph, nodes),
        keys,
    })
}

/// Kahn's algorithm, always taking the smallest ready (name, hash)
fn canonical_order(graph: &DiGraph<usize, ()>, nodes: Vec<ConcreteNode>) -> Vec<ConcreteNode> {
    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|idx| graph.neighbors_directed(idx, Direction::Incoming).count())
        .collect();

    let mut ready: BTreeSet<(String, NodeHash, NodeIndex)> = graph
        .node_indices()
        .filter(|idx| in_degree[idx.index()] == 0)
        .map(|idx| {
            let n = &nodes[graph[idx]];
            (n.name.clone(), n.hash.clone(), idx)
        })
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some((_, _, idx)) = ready.pop_first() {
        order.push(graph[idx]);
        for next in graph.neighbors_directed(idx, Direction::Outgoing) {
            let deg = &mut in_degree[next.index()];
            *deg = deg.saturating_sub(1);
            if *deg == 0 {
                let n = &nodes[graph[next]];
                ready.insert((n.name.clone(), n.hash.clone(), next));
            }
        }
    }

    let mut slots: Vec<Option<ConcreteNode>> = nodes.into_iter().map(Some).collect();
    order
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect()
}
