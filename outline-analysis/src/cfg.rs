//! Block-level CFG views over a [`memo_ir::Function`]: ordinary forward
//! dominance, and the corrected post-dominator of §4.7 that augments the CFG
//! with a synthetic implicit-sink node reachable from every block whose
//! instructions don't guarantee a transfer to their successor.

use crate::dominators::{self, DominatorTree};
use memo_ir::Function;
use std::collections::HashMap;

/// A node in the augmented CFG used for post-dominance: either a real basic
/// block or the synthetic sink absorbing implicit exits (throws, calls to
/// functions that may not return).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CfgNode {
    Regular(usize),
    ImplicitSink,
}

/// Block adjacency derived from `Function::blocks`, indexed by position in
/// `blocks` (not by `BasicBlock::id`, which may be sparse).
pub struct BlockCfg<'f> {
    function: &'f Function,
    index_of_block_id: HashMap<u32, usize>,
    successors: Vec<Vec<usize>>,
    predecessors: Vec<Vec<usize>>,
}

impl<'f> BlockCfg<'f> {
    pub fn new(function: &'f Function) -> BlockCfg<'f> {
        let index_of_block_id: HashMap<u32, usize> = function
            .blocks
            .iter()
            .enumerate()
            .map(|(i, b)| (b.id, i))
            .collect();
        let successors: Vec<Vec<usize>> = function
            .blocks
            .iter()
            .map(|b| {
                b.successors
                    .iter()
                    .map(|id| index_of_block_id[id])
                    .collect()
            })
            .collect();
        let mut predecessors = vec![Vec::new(); function.blocks.len()];
        for (i, succs) in successors.iter().enumerate() {
            for &s in succs {
                predecessors[s].push(i);
            }
        }
        BlockCfg {
            function,
            index_of_block_id,
            successors,
            predecessors,
        }
    }

    pub fn len(&self) -> usize {
        self.function.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn block_index(&self, block_id: u32) -> usize {
        self.index_of_block_id[&block_id]
    }

    pub fn successors(&self, block_index: usize) -> &[usize] {
        &self.successors[block_index]
    }

    pub fn predecessors(&self, block_index: usize) -> &[usize] {
        &self.predecessors[block_index]
    }

    pub fn entry_index(&self) -> usize {
        0
    }

    /// The forward dominator tree, indexed by block position.
    pub fn dominators(&self) -> DominatorTree {
        let preds = self.predecessors.clone();
        dominators::compute(self.len(), self.entry_index(), move |n| preds[n].clone())
    }
}

/// The corrected post-dominator tree (§4.7): node space is `0..num_blocks`
/// for real blocks plus one extra index for the synthetic sink, plus one
/// further virtual root used only to anchor the reverse-dominance
/// computation (every node with no outgoing edge — real exit blocks and the
/// sink — is a predecessor of it). `properly_dominates`/`dominates` ignore
/// the virtual root; callers only ever see `CfgNode` positions.
pub struct CorrectedPostDominators {
    tree: DominatorTree,
    sink_index: usize,
    virtual_root: usize,
}

impl CorrectedPostDominators {
    pub fn build(cfg: &BlockCfg<'_>) -> CorrectedPostDominators {
        let num_blocks = cfg.len();
        let sink_index = num_blocks;
        let virtual_root = num_blocks + 1;
        let total_nodes = num_blocks + 2;

        // successors[node] in the *augmented forward* CFG (blocks -> blocks,
        // implicit-flow blocks -> sink); used to derive predecessors for the
        // reversed graph the post-dominator tree is computed over.
        let mut forward_successors: Vec<Vec<usize>> = vec![Vec::new(); total_nodes];
        for block_index in 0..num_blocks {
            forward_successors[block_index] = cfg.successors(block_index).to_vec();
            if cfg.function.blocks[block_index].has_implicit_control_flow() {
                forward_successors[block_index].push(sink_index);
            }
        }
        // Real exits (no successors at all, implicit or otherwise) and the
        // sink are the predecessors of the virtual root in the reversed
        // graph used to root the post-dominator computation.
        for node in 0..=sink_index {
            if forward_successors[node].is_empty() {
                forward_successors[node].push(virtual_root);
            }
        }

        // Post-dominance is ordinary dominance on the CFG with every edge
        // reversed, rooted at the virtual exit. Reversing an edge swaps
        // predecessor and successor, so "predecessors of `n`" in that
        // reversed graph is exactly `n`'s *successor* list in the original
        // (forward) graph.
        let forward_successors_for_postdom = forward_successors.clone();
        let tree = dominators::compute(total_nodes, virtual_root, move |n| {
            forward_successors_for_postdom[n].clone()
        });

        CorrectedPostDominators {
            tree,
            sink_index,
            virtual_root,
        }
    }

    fn node_index(&self, node: CfgNode) -> usize {
        match node {
            CfgNode::Regular(i) => i,
            CfgNode::ImplicitSink => self.sink_index,
        }
    }

    pub fn dominates(&self, a: CfgNode, b: CfgNode) -> bool {
        self.tree.dominates(self.node_index(a), self.node_index(b))
    }

    pub fn properly_dominates(&self, a: CfgNode, b: CfgNode) -> bool {
        self.tree.properly_dominates(self.node_index(a), self.node_index(b))
    }

    pub fn immediate_post_dominator(&self, node: CfgNode) -> Option<CfgNode> {
        let idom = self.tree.immediate_dominator(self.node_index(node))?;
        if idom == self.virtual_root {
            return None;
        }
        Some(self.to_cfg_node(idom))
    }

    fn to_cfg_node(&self, index: usize) -> CfgNode {
        if index == self.sink_index {
            CfgNode::ImplicitSink
        } else {
            CfgNode::Regular(index)
        }
    }

    /// Walks from `node` all the way to the post-dominator tree root
    /// (the virtual exit has no `CfgNode` representation, so the walk just
    /// ends when there is no further immediate post-dominator).
    pub fn ascend_all(&self, node: CfgNode) -> Vec<CfgNode> {
        let mut out = Vec::new();
        let mut cur = node;
        loop {
            out.push(cur);
            match self.immediate_post_dominator(cur) {
                Some(next) => cur = next,
                None => break,
            }
        }
        out
    }

    /// Walks from `node` up the post-dominator tree until (but not
    /// including) `stop_before`, used by the control-dependence computation
    /// in `pdg.rs`.
    pub fn ascend_until(&self, mut node: CfgNode, stop_before: CfgNode) -> Vec<CfgNode> {
        let mut out = Vec::new();
        loop {
            if node == stop_before {
                break;
            }
            out.push(node);
            match self.immediate_post_dominator(node) {
                Some(next) => node = next,
                None => break,
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memo_ir::{BasicBlock, Instruction, Opcode, Operand};

    /// A single block whose only instruction is a call with no declared CFG
    /// successor: every path out of the block is the implicit exit.
    fn single_block_noreturn_call() -> Function {
        let mut entry = BasicBlock::new(0);
        entry
            .instructions
            .push(Instruction::new(Opcode::Call, vec![]));
        Function {
            name: "f".to_string(),
            params: vec![],
            return_type: memo_ir::AggregateOrType::Scalar(memo_ir::Type::Void),
            blocks: vec![entry],
        }
    }

    /// entry (no implicit control flow) -> exit (Ret).
    fn two_block_function_without_implicit_flow() -> Function {
        let mut entry = BasicBlock::new(0);
        entry
            .instructions
            .push(Instruction::new(Opcode::Add, vec![Operand::Constant]));
        entry.successors = vec![1];

        let mut exit = BasicBlock::new(1);
        exit.instructions.push(Instruction::new(Opcode::Ret, vec![]));

        Function {
            name: "g".to_string(),
            params: vec![],
            return_type: memo_ir::AggregateOrType::Scalar(memo_ir::Type::Void),
            blocks: vec![entry, exit],
        }
    }

    #[test]
    fn implicit_sink_strictly_post_dominates_a_noreturn_call() {
        let f = single_block_noreturn_call();
        let cfg = BlockCfg::new(&f);
        let postdom = CorrectedPostDominators::build(&cfg);
        assert!(postdom.properly_dominates(CfgNode::ImplicitSink, CfgNode::Regular(0)));
    }

    #[test]
    fn ordinary_exit_block_post_dominates_everything_above_it() {
        let f = two_block_function_without_implicit_flow();
        let cfg = BlockCfg::new(&f);
        let postdom = CorrectedPostDominators::build(&cfg);
        assert!(postdom.dominates(CfgNode::Regular(1), CfgNode::Regular(0)));
    }

    #[test]
    fn a_block_that_may_take_either_path_is_postdominated_by_neither_branch_alone() {
        let mut entry = BasicBlock::new(0);
        entry.instructions.push(Instruction::new(Opcode::Call, vec![]));
        entry.successors = vec![1];
        let mut body = BasicBlock::new(1);
        body.instructions.push(Instruction::new(Opcode::Ret, vec![]));
        let f = Function {
            name: "h".to_string(),
            params: vec![],
            return_type: memo_ir::AggregateOrType::Scalar(memo_ir::Type::Void),
            blocks: vec![entry, body],
        };
        let cfg = BlockCfg::new(&f);
        let postdom = CorrectedPostDominators::build(&cfg);
        assert!(!postdom.dominates(CfgNode::ImplicitSink, CfgNode::Regular(0)));
        assert!(!postdom.dominates(CfgNode::Regular(1), CfgNode::Regular(0)));
    }
}
