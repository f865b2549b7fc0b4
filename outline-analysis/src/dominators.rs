//! Generic dominator-tree computation shared by the forward dominator tree
//! (`Dominators`, used for `isOutlinable`'s "common dominator" test) and the
//! corrected post-dominator tree (`cfg::CorrectedPostDominators`, §4.7).
//!
//! Computes the same tree a Lengauer–Tarjan construction would, via the
//! iterative data-flow fixed point from Cooper, Harvey & Kennedy, "A Simple,
//! Fast Dominance Algorithm" — the formulation most small-to-medium compiler
//! passes reach for instead of the tree-balancing original, since on typical
//! function sizes it's simpler to get right and just as fast in practice.

/// A node's immediate dominator, by index into the same node space passed to
/// [`compute`]. The root has no immediate dominator.
#[derive(Debug, Clone)]
pub struct DominatorTree {
    idom: Vec<Option<usize>>,
    root: usize,
}

impl DominatorTree {
    pub fn root(&self) -> usize {
        self.root
    }

    pub fn immediate_dominator(&self, node: usize) -> Option<usize> {
        self.idom[node]
    }

    /// Reflexive: every node dominates itself.
    pub fn dominates(&self, a: usize, b: usize) -> bool {
        if a == b {
            return true;
        }
        let mut cur = b;
        while let Some(idom) = self.idom[cur] {
            if idom == a {
                return true;
            }
            cur = idom;
        }
        false
    }

    pub fn properly_dominates(&self, a: usize, b: usize) -> bool {
        a != b && self.dominates(a, b)
    }

    /// All nodes that dominate `node`, including `node` itself, nearest
    /// first.
    pub fn dominator_chain(&self, node: usize) -> Vec<usize> {
        let mut chain = vec![node];
        let mut cur = node;
        while let Some(idom) = self.idom[cur] {
            chain.push(idom);
            cur = idom;
        }
        chain
    }

    /// Nearest common ancestor of `a` and `b` in the tree.
    pub fn nearest_common_dominator(&self, a: usize, b: usize) -> usize {
        let a_chain = self.dominator_chain(a);
        let b_set: std::collections::HashSet<usize> = self.dominator_chain(b).into_iter().collect();
        for candidate in a_chain {
            if b_set.contains(&candidate) {
                return candidate;
            }
        }
        self.root
    }
}

/// Computes the dominator tree of a graph with `n` nodes rooted at `root`,
/// given each node's predecessors in the direction dominance is computed
/// (forward predecessors for ordinary dominance, successors-as-predecessors
/// for post-dominance — the caller picks by what it passes in).
pub fn compute(n: usize, root: usize, predecessors: impl Fn(usize) -> Vec<usize>) -> DominatorTree {
    let rpo = reverse_postorder(n, root, |node| predecessors_to_successors(n, &predecessors, node));
    let rpo_number: Vec<Option<usize>> = {
        let mut numbers = vec![None; n];
        for (order, &node) in rpo.iter().enumerate() {
            numbers[node] = Some(order);
        }
        numbers
    };

    let mut idom: Vec<Option<usize>> = vec![None; n];
    idom[root] = Some(root);
    let mut changed = true;
    while changed {
        changed = false;
        for &node in rpo.iter().skip(1) {
            let preds = predecessors(node);
            let mut new_idom: Option<usize> = None;
            for pred in preds {
                if idom[pred].is_none() {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => pred,
                    Some(current) => intersect(&idom, &rpo_number, current, pred),
                });
            }
            if let Some(new_idom) = new_idom {
                if idom[node] != Some(new_idom) {
                    idom[node] = Some(new_idom);
                    changed = true;
                }
            }
        }
    }
    idom[root] = None;
    DominatorTree { idom, root }
}

fn intersect(idom: &[Option<usize>], rpo_number: &[Option<usize>], mut a: usize, mut b: usize) -> usize {
    while a != b {
        while rpo_number[a] > rpo_number[b] {
            a = idom[a].expect("finger walk should stay within reachable nodes");
        }
        while rpo_number[b] > rpo_number[a] {
            b = idom[b].expect("finger walk should stay within reachable nodes");
        }
    }
    a
}

/// The forward-dominance computation only needs predecessors, but the
/// reverse-postorder numbering needs successors; since both dominator (CFG
/// successors) and post-dominator (CFG predecessors, i.e. "successors" in
/// the reversed graph) callers already have the edge direction they want
/// baked into `predecessors`, we derive the opposite direction by scanning.
fn predecessors_to_successors(
    n: usize,
    predecessors: &impl Fn(usize) -> Vec<usize>,
    node: usize,
) -> Vec<usize> {
    let mut succs = Vec::new();
    for candidate in 0..n {
        if predecessors(candidate).contains(&node) {
            succs.push(candidate);
        }
    }
    succs
}

fn reverse_postorder(n: usize, root: usize, successors: impl Fn(usize) -> Vec<usize>) -> Vec<usize> {
    let mut visited = vec![false; n];
    let mut postorder = Vec::with_capacity(n);
    let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
    visited[root] = true;
    while let Some((node, next_child)) = stack.pop() {
        let succs = successors(node);
        if next_child < succs.len() {
            let child = succs[next_child];
            stack.push((node, next_child + 1));
            if !visited[child] {
                visited[child] = true;
                stack.push((child, 0));
            }
        } else {
            postorder.push(node);
        }
    }
    postorder.reverse();
    postorder
}

#[cfg(test)]
mod tests {
    use super::*;

    /// entry -> a -> exit
    ///       -> b -> exit
    fn diamond_preds(node: usize) -> Vec<usize> {
        match node {
            0 => vec![],
            1 => vec![0],
            2 => vec![0],
            3 => vec![1, 2],
            _ => unreachable!(),
        }
    }

    #[test]
    fn diamond_idom_is_entry_for_join_point() {
        let tree = compute(4, 0, diamond_preds);
        assert_eq!(tree.immediate_dominator(3), Some(0));
        assert!(tree.dominates(0, 3));
        assert!(!tree.dominates(1, 3));
        assert!(!tree.dominates(2, 3));
    }

    #[test]
    fn linear_chain_dominates_transitively() {
        let preds = |node: usize| -> Vec<usize> {
            if node == 0 {
                vec![]
            } else {
                vec![node - 1]
            }
        };
        let tree = compute(5, 0, preds);
        assert!(tree.dominates(0, 4));
        assert!(tree.properly_dominates(1, 4));
        assert!(!tree.properly_dominates(4, 1));
    }

    #[test]
    fn nearest_common_dominator_of_diamond_branches_is_entry() {
        let tree = compute(4, 0, diamond_preds);
        assert_eq!(tree.nearest_common_dominator(1, 2), 0);
    }
}
