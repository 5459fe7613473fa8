// Bron-Kerbosch maximum clique over an N<=64 node connectivity graph,
// represented as adjacency bitsets so intersection/difference are single
// machine words (spec §4.5: "N <= 64, fits a bitset").

use crate::common::NodeSet;

/// Finds a maximum clique in the graph described by `adjacency[i]` = the
/// set of nodes node `i+1` can mutually reach (both directions agree).
/// Returns `NodeSet::EMPTY` for `n == 0`.
pub fn max_clique(adjacency: &[NodeSet], n: usize) -> NodeSet {
    let mut best = NodeSet::EMPTY;
    let candidates = NodeSet::full(n);
    bron_kerbosch(NodeSet::EMPTY, candidates, NodeSet::EMPTY, adjacency, n, &mut best);
    best
}

fn bron_kerbosch(
    r: NodeSet,
    mut p: NodeSet,
    mut x: NodeSet,
    adjacency: &[NodeSet],
    n: usize,
    best: &mut NodeSet,
) {
    if p.is_empty() && x.is_empty() {
        if r.popcount() > best.popcount() {
            *best = r;
        }
        return;
    }
    for v in p.iter(n) {
        let neighbors = adjacency[v.bit() as usize];
        let mut r_next = r;
        r_next.insert(v);
        bron_kerbosch(
            r_next,
            p.intersect(neighbors),
            x.intersect(neighbors),
            adjacency,
            n,
            best,
        );
        p.remove(v);
        x.insert(v);
    }
}

/// Builds the adjacency bitsets from each node's self-reported
/// connectivity mask (bit i set = "I cannot reach node i"): an edge exists
/// between `a` and `b` iff neither reports the other unreachable.
pub fn build_adjacency(connectivity_masks: &[NodeSet], n: usize) -> Vec<NodeSet> {
    let mut adjacency = vec![NodeSet::EMPTY; n];
    for a in 1..=n as u8 {
        let a_id = crate::common::NodeId(a);
        for b in 1..=n as u8 {
            if a == b {
                continue;
            }
            let b_id = crate::common::NodeId(b);
            let a_unreachable_b = connectivity_masks[a_id.bit() as usize].contains(b_id);
            let b_unreachable_a = connectivity_masks[b_id.bit() as usize].contains(a_id);
            if !a_unreachable_b && !b_unreachable_a {
                adjacency[a_id.bit() as usize].insert(b_id);
            }
        }
    }
    adjacency
}
