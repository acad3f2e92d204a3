//! Processing order and cycle handling.
//!
//! Compiling a [`GraphDescription`] yields the list of steps the render graph runs every
//! quantum. Cycles are found with Tarjan's algorithm. A cycle that passes through a delay is
//! legal: the delay is split into a read step that runs first and a write step that runs once
//! its input is ready. Any cycle left after that is muted as a whole.

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::description::NodeType;
use crate::graph::GraphDescription;
use crate::node::NodeId;

/// One unit of work in a quantum. Indices refer to [`CompiledTopology::nodes`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Mix inputs, then process.
    Process(usize),
    /// Emit a split delay's output from its history.
    ReadDelay(usize),
    /// Feed a split delay this quantum's input.
    WriteDelay(usize),
}

/// Result of [`compile`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompiledTopology {
    /// Node ids in slot order
    pub nodes: Vec<NodeId>,
    pub steps: Vec<Step>,
    /// Nodes inside a cycle without a delay; they output silence
    pub muted: Vec<bool>,
    /// Delays that run as separate read and write steps
    pub split: Vec<bool>,
}

impl CompiledTopology {
    pub fn index_of(&self, id: NodeId) -> Option<usize> {
        self.nodes.binary_search(&id).ok()
    }

    pub fn is_muted(&self, id: NodeId) -> bool {
        self.index_of(id).is_some_and(|i| self.muted[i])
    }

    /// Node ids in the order their processing completes.
    pub fn order(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.steps.iter().filter_map(|step| match *step {
            Step::Process(i) | Step::WriteDelay(i) => Some(self.nodes[i]),
            Step::ReadDelay(_) => None,
        })
    }
}

/// Dependency edges `(source, destination)` as slot indices, audio and parameter alike.
fn dependency_edges(graph: &GraphDescription, nodes: &[NodeId]) -> Vec<(usize, usize)> {
    let index = |id: NodeId| nodes.binary_search(&id).ok();
    let audio = graph.connections().map(|c| (c.source, c.destination));
    let params = graph.param_connections().map(|c| (c.source, c.destination));
    audio
        .chain(params)
        .filter_map(|(source, destination)| Some((index(source)?, index(destination)?)))
        .collect()
}

/// Strongly connected components that actually form a cycle.
fn cyclic_components(node_count: usize, edges: &[(usize, usize)]) -> Vec<Vec<usize>> {
    let mut graph = DiGraph::<(), ()>::with_capacity(node_count, edges.len());
    for _ in 0..node_count {
        graph.add_node(());
    }
    for &(source, destination) in edges {
        graph.add_edge(NodeIndex::new(source), NodeIndex::new(destination), ());
    }

    tarjan_scc(&graph)
        .into_iter()
        .filter(|component| {
            component.len() > 1 || {
                let n = component[0];
                graph.find_edge(n, n).is_some()
            }
        })
        .map(|component| component.into_iter().map(NodeIndex::index).collect())
        .collect()
}

/// Compute the processing steps for `graph`.
pub fn compile(graph: &GraphDescription) -> CompiledTopology {
    let nodes: Vec<NodeId> = graph.nodes().map(|(id, _)| id).collect();
    let is_delay: Vec<bool> = graph
        .nodes()
        .map(|(_, d)| d.node_type() == NodeType::Delay)
        .collect();
    let count = nodes.len();
    let all_edges = dependency_edges(graph, &nodes);

    let mut split = vec![false; count];
    for component in cyclic_components(count, &all_edges) {
        for i in component {
            if is_delay[i] {
                split[i] = true;
            }
        }
    }

    // a split delay's output is ready before anything else runs
    let edges: Vec<(usize, usize)> = all_edges
        .into_iter()
        .filter(|&(source, _)| !split[source])
        .collect();

    let mut muted = vec![false; count];
    for component in cyclic_components(count, &edges) {
        for i in component {
            muted[i] = true;
        }
    }

    let mut inputs: Vec<Vec<usize>> = vec![Vec::new(); count];
    for &(source, destination) in &edges {
        if !muted[source] && !muted[destination] {
            inputs[destination].push(source);
        }
    }
    for list in &mut inputs {
        list.sort_unstable();
        list.dedup();
    }

    let mut steps: Vec<Step> = (0..count)
        .filter(|&i| split[i] && !muted[i])
        .map(Step::ReadDelay)
        .collect();
    for i in post_order(&inputs, &muted) {
        steps.push(if split[i] { Step::WriteDelay(i) } else { Step::Process(i) });
    }

    CompiledTopology {
        nodes,
        steps,
        muted,
        split,
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Iterative three-color depth-first search over inputs. Every node is emitted after all of
/// its inputs; back edges (which compile never leaves) are skipped.
fn post_order(inputs: &[Vec<usize>], skip: &[bool]) -> Vec<usize> {
    let count = inputs.len();
    let mut color = vec![Color::White; count];
    let mut order = Vec::with_capacity(count);
    let mut stack: Vec<(usize, usize)> = Vec::new();

    for root in 0..count {
        if skip[root] || color[root] != Color::White {
            continue;
        }
        color[root] = Color::Gray;
        stack.push((root, 0));

        while let Some(top) = stack.last_mut() {
            let node = top.0;
            if let Some(&input) = inputs[node].get(top.1) {
                top.1 += 1;
                if color[input] == Color::White && !skip[input] {
                    color[input] = Color::Gray;
                    stack.push((input, 0));
                }
            } else {
                color[node] = Color::Black;
                order.push(node);
                stack.pop();
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_order_visits_inputs_first() {
        // 0 <- 1 <- 2, 0 <- 2
        let inputs = vec![vec![1, 2], vec![2], vec![]];
        assert_eq!(post_order(&inputs, &[false; 3]), vec![2, 1, 0]);
    }

    #[test]
    fn self_loop_is_cyclic() {
        let components = cyclic_components(2, &[(0, 0), (0, 1)]);
        assert_eq!(components, vec![vec![0]]);
    }
}
