use std::collections::{BTreeMap, BTreeSet, VecDeque};

use super::TransactionGraph;

/// Index-based adjacency view of a transaction graph.
///
/// Addresses are numbered in sorted order so every derived quantity is
/// deterministic. Edges whose endpoints are not nodes are skipped, which
/// keeps the view total over malformed input.
#[derive(Debug, Clone)]
pub struct GraphView {
    addresses: Vec<String>,
    out_adj: Vec<BTreeSet<usize>>,
    in_adj: Vec<BTreeSet<usize>>,
    /// (from, to) per edge, multiplicity preserved.
    arcs: Vec<(usize, usize)>,
}

impl GraphView {
    pub fn new(graph: &TransactionGraph) -> Self {
        let index: BTreeMap<&str, usize> = graph
            .addresses()
            .into_iter()
            .enumerate()
            .map(|(i, a)| (a, i))
            .collect();
        let addresses: Vec<String> = index.keys().map(|a| a.to_string()).collect();
        let n = addresses.len();
        let mut out_adj = vec![BTreeSet::new(); n];
        let mut in_adj = vec![BTreeSet::new(); n];
        let mut arcs = Vec::with_capacity(graph.edges.len());

        for edge in &graph.edges {
            let (Some(&from), Some(&to)) = (
                index.get(edge.from_address.as_str()),
                index.get(edge.to_address.as_str()),
            ) else {
                continue;
            };
            out_adj[from].insert(to);
            in_adj[to].insert(from);
            arcs.push((from, to));
        }

        Self {
            addresses,
            out_adj,
            in_adj,
            arcs,
        }
    }

    pub fn node_count(&self) -> usize {
        self.addresses.len()
    }

    pub fn arc_count(&self) -> usize {
        self.arcs.len()
    }

    pub fn address(&self, i: usize) -> &str {
        &self.addresses[i]
    }

    pub fn index_of(&self, address: &str) -> Option<usize> {
        self.addresses.binary_search_by(|a| a.as_str().cmp(address)).ok()
    }

    /// Distinct senders into `i`.
    pub fn in_degree(&self, i: usize) -> usize {
        self.in_adj[i].len()
    }

    /// Distinct recipients from `i`.
    pub fn out_degree(&self, i: usize) -> usize {
        self.out_adj[i].len()
    }

    pub fn max_fan_in(&self) -> usize {
        (0..self.node_count()).map(|i| self.in_degree(i)).max().unwrap_or(0)
    }

    pub fn max_fan_out(&self) -> usize {
        (0..self.node_count()).map(|i| self.out_degree(i)).max().unwrap_or(0)
    }

    /// Incident edge count per node, counting multiplicity.
    pub fn edge_degrees(&self) -> Vec<usize> {
        let mut degrees = vec![0; self.node_count()];
        for &(from, to) in &self.arcs {
            degrees[from] += 1;
            degrees[to] += 1;
        }
        degrees
    }

    pub fn max_degree(&self) -> usize {
        self.edge_degrees().into_iter().max().unwrap_or(0)
    }

    pub fn self_loop_nodes(&self) -> usize {
        (0..self.node_count()).filter(|&i| self.out_adj[i].contains(&i)).count()
    }

    /// Strongly connected components (Tarjan), each sorted, in discovery order.
    pub fn strongly_connected_components(&self) -> Vec<Vec<usize>> {
        struct Tarjan<'a> {
            adj: &'a [BTreeSet<usize>],
            index: Vec<Option<usize>>,
            low: Vec<usize>,
            on_stack: Vec<bool>,
            stack: Vec<usize>,
            next: usize,
            out: Vec<Vec<usize>>,
        }

        impl Tarjan<'_> {
            fn visit(&mut self, v: usize) {
                self.index[v] = Some(self.next);
                self.low[v] = self.next;
                self.next += 1;
                self.stack.push(v);
                self.on_stack[v] = true;

                let adj = self.adj;
                for &w in adj[v].iter() {
                    match self.index[w] {
                        None => {
                            self.visit(w);
                            self.low[v] = self.low[v].min(self.low[w]);
                        }
                        Some(wi) if self.on_stack[w] => {
                            self.low[v] = self.low[v].min(wi);
                        }
                        Some(_) => {}
                    }
                }

                if Some(self.low[v]) == self.index[v] {
                    let mut component = Vec::new();
                    while let Some(w) = self.stack.pop() {
                        self.on_stack[w] = false;
                        component.push(w);
                        if w == v {
                            break;
                        }
                    }
                    component.sort_unstable();
                    self.out.push(component);
                }
            }
        }

        let n = self.node_count();
        let mut t = Tarjan {
            adj: &self.out_adj,
            index: vec![None; n],
            low: vec![0; n],
            on_stack: vec![false; n],
            stack: Vec::new(),
            next: 0,
            out: Vec::new(),
        };
        for v in 0..n {
            if t.index[v].is_none() {
                t.visit(v);
            }
        }
        t.out
    }

    /// Components that contain a cycle: size >= 2, or a single self-looping node.
    fn cyclic_components(&self) -> Vec<Vec<usize>> {
        self.strongly_connected_components()
            .into_iter()
            .filter(|c| c.len() > 1 || self.out_adj[c[0]].contains(&c[0]))
            .collect()
    }

    /// Number of independent cycles: per cyclic component, distinct internal
    /// arcs minus nodes plus one.
    pub fn cycle_rank(&self) -> usize {
        self.cyclic_components()
            .iter()
            .map(|component| {
                let members: BTreeSet<usize> = component.iter().copied().collect();
                let internal: usize = component
                    .iter()
                    .map(|&v| self.out_adj[v].iter().filter(|w| members.contains(w)).count())
                    .sum();
                (internal + 1).saturating_sub(component.len())
            })
            .sum()
    }

    /// Size of the largest cyclic component (1 for a lone self-loop).
    pub fn largest_cycle(&self) -> usize {
        self.cyclic_components().iter().map(Vec::len).max().unwrap_or(0)
    }

    /// Edges (with multiplicity) lying on some cycle.
    pub fn edges_on_cycles(&self) -> usize {
        let mut component_of = vec![usize::MAX; self.node_count()];
        for (ci, component) in self.cyclic_components().iter().enumerate() {
            for &v in component {
                component_of[v] = ci;
            }
        }
        self.arcs
            .iter()
            .filter(|&&(from, to)| component_of[from] != usize::MAX && component_of[from] == component_of[to])
            .count()
    }

    /// Longest shortest path, in hops, over all reachable pairs.
    pub fn hop_count(&self) -> usize {
        let n = self.node_count();
        let mut best = 0;
        let mut dist = vec![usize::MAX; n];
        let mut queue = VecDeque::new();
        for source in 0..n {
            dist.iter_mut().for_each(|d| *d = usize::MAX);
            dist[source] = 0;
            queue.push_back(source);
            while let Some(v) = queue.pop_front() {
                for &w in &self.out_adj[v] {
                    if dist[w] == usize::MAX {
                        dist[w] = dist[v] + 1;
                        best = best.max(dist[w]);
                        queue.push_back(w);
                    }
                }
            }
        }
        best
    }

    /// Edges (with multiplicity) between reciprocal pairs.
    pub fn reciprocal_edges(&self) -> usize {
        self.arcs
            .iter()
            .filter(|&&(from, to)| from != to && self.out_adj[to].contains(&from))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fixtures::*;

    #[test]
    fn triangle_is_one_cycle() {
        let view = GraphView::new(&triangle("0x").transaction_graph);
        assert_eq!(view.cycle_rank(), 1);
        assert_eq!(view.largest_cycle(), 3);
        assert_eq!(view.edges_on_cycles(), 3);
        assert_eq!(view.hop_count(), 2);
        assert_eq!(view.reciprocal_edges(), 0);
    }

    #[test]
    fn chain_has_no_cycle() {
        let p = pattern(vec![
            edge("a", "b", "1", "t1", 0),
            edge("b", "c", "1", "t2", 10),
            edge("c", "d", "1", "t3", 20),
        ]);
        let view = GraphView::new(&p.transaction_graph);
        assert_eq!(view.largest_cycle(), 0);
        assert_eq!(view.cycle_rank(), 0);
        assert_eq!(view.hop_count(), 3);
        assert_eq!(view.max_degree(), 2);
    }

    #[test]
    fn reciprocal_and_self_loop() {
        let p = pattern(vec![
            edge("a", "b", "5", "t1", 0),
            edge("b", "a", "5", "t2", 10),
            edge("c", "c", "1", "t3", 20),
            edge("a", "c", "1", "t4", 30),
        ]);
        let view = GraphView::new(&p.transaction_graph);
        assert_eq!(view.reciprocal_edges(), 2);
        assert_eq!(view.self_loop_nodes(), 1);
        assert_eq!(view.largest_cycle(), 2);
        assert_eq!(view.cycle_rank(), 2);
    }

    #[test]
    fn fan_degrees() {
        let p = pattern(vec![
            edge("src", "m1", "1", "t1", 0),
            edge("src", "m2", "1", "t2", 0),
            edge("src", "m3", "1", "t3", 0),
            edge("m1", "sink", "1", "t4", 0),
            edge("m2", "sink", "1", "t5", 0),
        ]);
        let view = GraphView::new(&p.transaction_graph);
        assert_eq!(view.max_fan_out(), 3);
        assert_eq!(view.max_fan_in(), 2);
        let src = view.index_of("src").unwrap();
        assert_eq!(view.address(src), "src");
        assert_eq!(view.out_degree(src), 3);
    }

    #[test]
    fn skips_edges_with_unknown_endpoints() {
        let mut p = triangle("0x");
        p.transaction_graph.edges.push(edge("0xa", "ghost", "1", "t", 0));
        let view = GraphView::new(&p.transaction_graph);
        assert_eq!(view.arc_count(), 3);
    }
}
