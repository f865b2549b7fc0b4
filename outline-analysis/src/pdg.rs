//! The outlining program-dependence graph (§4.8): one flattened node space
//! per function (block headers, memory-phis, instructions, in the pre-order
//! `Function::node_layout` assigns), with forced/dominating/data/arg
//! dependence bitvectors plus the legality predicate candidate enumeration
//! and extraction are built on top of.

use crate::cfg::{BlockCfg, CfgNode, CorrectedPostDominators};
use crate::dominators::DominatorTree;
use memo_ir::{Function, InstructionFlags, MemoryAccess, NodeKind, Operand};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Default, Clone)]
pub struct Externals {
    pub arg_inputs: BTreeSet<u32>,
    pub external_inputs: BTreeSet<usize>,
    pub external_outputs: BTreeSet<usize>,
}

/// Per-node dependence bitvectors, keyed by the node's position in
/// `Function::node_layout()`.
pub struct ProgramDependenceGraph {
    node_count: usize,
    block_of_node: Vec<usize>,
    prevents_outlining: Vec<bool>,
    data_depends: Vec<BTreeSet<usize>>,
    reverse_data_depends: Vec<BTreeSet<usize>>,
    arg_depends: Vec<BTreeSet<u32>>,
    forced_depends: Vec<BTreeSet<usize>>,
    dominating_depends: Vec<BTreeSet<usize>>,
    block_dominators: DominatorTree,
}

impl ProgramDependenceGraph {
    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn prevents_outlining(&self, node: usize) -> bool {
        self.prevents_outlining[node]
    }

    pub fn data_depends(&self, node: usize) -> &BTreeSet<usize> {
        &self.data_depends[node]
    }

    pub fn arg_depends(&self, node: usize) -> &BTreeSet<u32> {
        &self.arg_depends[node]
    }

    pub fn forced_depends(&self, node: usize) -> &BTreeSet<usize> {
        &self.forced_depends[node]
    }

    pub fn dominating_depends(&self, node: usize) -> &BTreeSet<usize> {
        &self.dominating_depends[node]
    }

    /// Node-level dominance: for nodes in the same block, position in
    /// program order (the node-index assignment is contiguous and
    /// increasing within a block); for nodes in different blocks, the
    /// forward block-level dominator tree.
    pub fn node_dominates(&self, a: usize, b: usize) -> bool {
        if a == b {
            return true;
        }
        let block_a = self.block_of_node[a];
        let block_b = self.block_of_node[b];
        if block_a == block_b {
            a < b
        } else {
            self.block_dominators.dominates(block_a, block_b)
        }
    }

    /// A bitvector is legal to outline iff (a) it misses every
    /// `PreventsOutlining` node, (b) it is closed under `ForcedDepends`, and
    /// (c) every `DominatingDepends` edge is either internal or a common
    /// dominator of the whole set.
    pub fn is_outlinable(&self, bv: &BTreeSet<usize>) -> bool {
        for &i in bv {
            if self.prevents_outlining[i] {
                return false;
            }
            for &j in &self.forced_depends[i] {
                if !bv.contains(&j) {
                    return false;
                }
            }
            for &j in &self.dominating_depends[i] {
                if bv.contains(&j) {
                    continue;
                }
                if !bv.iter().all(|&k| self.node_dominates(j, k)) {
                    return false;
                }
            }
        }
        true
    }

    /// `ArgInputs`, `ExternalInputs`, `ExternalOutputs` for a legal
    /// bitvector — the parameter/return-value surface the extractor needs.
    pub fn externals(&self, bv: &BTreeSet<usize>) -> Externals {
        let mut externals = Externals::default();
        for &i in bv {
            externals.arg_inputs.extend(self.arg_depends[i].iter().copied());
            for &used in &self.data_depends[i] {
                if !bv.contains(&used) {
                    externals.external_inputs.insert(used);
                }
            }
            for &dependent in &self.reverse_data_depends[i] {
                if !bv.contains(&dependent) {
                    externals.external_outputs.insert(i);
                }
            }
        }
        externals
    }

    /// Tightens `ForcedDepends`/`DominatingDepends` to their transitive
    /// closure so `is_outlinable`'s membership checks don't need to walk
    /// chains; this never changes which bitvectors are legal, since a
    /// bitvector closed under one level of a dependence relation is
    /// automatically closed under its transitive closure and vice versa.
    pub fn compute_transitive_closures(&mut self) {
        close_transitively(&mut self.forced_depends);
        close_transitively(&mut self.dominating_depends);
    }

    pub fn block_dominators(&self) -> &DominatorTree {
        &self.block_dominators
    }
}

fn close_transitively(sets: &mut [BTreeSet<usize>]) {
    let mut changed = true;
    while changed {
        changed = false;
        for i in 0..sets.len() {
            let additions: Vec<usize> = sets[i]
                .iter()
                .flat_map(|&j| sets[j].iter().copied())
                .filter(|k| !sets[i].contains(k) && *k != i)
                .collect();
            if !additions.is_empty() {
                sets[i].extend(additions);
                changed = true;
            }
        }
    }
}

/// Builds the PDG for a function: a forward dominator tree and the
/// corrected post-dominator tree are computed internally, matching §4.8's
/// "input: a function, its dominator tree, its corrected post-dominator
/// tree, and a memory-SSA analysis" (memory-SSA here is simply read off the
/// `clobber`/`memory_phi` fields memo-ir's instructions and blocks already
/// carry).
pub fn build(function: &Function) -> ProgramDependenceGraph {
    let cfg = BlockCfg::new(function);
    let block_dominators = cfg.dominators();
    let postdom = CorrectedPostDominators::build(&cfg);

    let layout = function.node_layout();
    let node_count = layout.len();

    let mut block_of_node = vec![0usize; node_count];
    let mut header_of_block = vec![0usize; function.blocks.len()];
    let mut memphi_of_block: Vec<Option<usize>> = vec![None; function.blocks.len()];
    let mut node_of_instr: BTreeMap<(usize, usize), usize> = BTreeMap::new(); // (block_pos, instr_pos) -> node

    for entry in &layout {
        let block_pos = cfg.block_index(entry.block);
        block_of_node[entry.id.index()] = block_pos;
        match entry.kind {
            NodeKind::BlockHeader => header_of_block[block_pos] = entry.id.index(),
            NodeKind::MemoryPhi => memphi_of_block[block_pos] = Some(entry.id.index()),
            NodeKind::Instruction(i) => {
                node_of_instr.insert((block_pos, i), entry.id.index());
            }
        }
    }

    let mut prevents_outlining = vec![false; node_count];
    let mut data_depends: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); node_count];
    let mut arg_depends: Vec<BTreeSet<u32>> = vec![BTreeSet::new(); node_count];
    let mut forced_depends: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); node_count];
    let mut dominating_depends: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); node_count];

    // Function entry is never outlinable on its own.
    prevents_outlining[header_of_block[0]] = true;
    if let Some(phi) = memphi_of_block[0] {
        prevents_outlining[phi] = true;
    }

    let resolve_memory_access = |access: &MemoryAccess| -> Option<usize> {
        match access {
            MemoryAccess::LiveOnEntry => None,
            MemoryAccess::Access(id) => Some(id.index()),
            MemoryAccess::Phi(block_id) => {
                let block_pos = cfg.block_index(*block_id);
                memphi_of_block[block_pos]
            }
        }
    };

    // Data, memory, and intra-block (forced) dependences, plus
    // non-duplicable / convergent / token-producing prevent-outlining
    // membership.
    for (block_pos, block) in function.blocks.iter().enumerate() {
        let header = header_of_block[block_pos];
        if let Some(phi) = memphi_of_block[block_pos] {
            forced_depends[header].insert(phi);
            if let Some(memphi) = &block.memory_phi {
                for incoming in &memphi.incoming {
                    if let Some(resolved) = resolve_memory_access(incoming) {
                        dominating_depends[phi].insert(resolved);
                    }
                }
            }
        }

        let mut non_transferring_so_far: Vec<usize> = Vec::new();
        for (i, instr) in block.instructions.iter().enumerate() {
            let node = node_of_instr[&(block_pos, i)];

            forced_depends[node].insert(header);
            for &earlier in &non_transferring_so_far {
                forced_depends[node].insert(earlier);
            }
            if instr.opcode.may_not_transfer_to_successor() {
                non_transferring_so_far.push(node);
            }

            for operand in &instr.operands {
                match operand {
                    Operand::Node(id) => {
                        data_depends[node].insert(id.index());
                        dominating_depends[node].insert(id.index());
                    }
                    Operand::Argument(n) => {
                        arg_depends[node].insert(*n);
                    }
                    Operand::Global(_) | Operand::Constant => {}
                }
            }

            if instr.opcode.touches_memory() {
                if let Some(access) = &instr.clobber {
                    if let Some(resolved) = resolve_memory_access(access) {
                        dominating_depends[node].insert(resolved);
                    }
                }
            }

            if instr.opcode.prevents_cloning()
                || instr
                    .flags
                    .intersects(InstructionFlags::CONVERGENT | InstructionFlags::NO_DUPLICATE | InstructionFlags::PRODUCES_TOKEN)
            {
                prevents_outlining[node] = true;
            }
        }
    }

    // Control dependences (§4.8 step 1): for each CFG edge A -> B, every
    // block on the post-dominator-tree path from B up to (but not
    // including) A's immediate post-dominator is control-dependent on A.
    let mut control_dependents_on: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); function.blocks.len()];
    for a in 0..function.blocks.len() {
        let ipdom_a = postdom.immediate_post_dominator(CfgNode::Regular(a));
        for &b in cfg.successors(a) {
            let chain = match ipdom_a {
                Some(stop) => postdom.ascend_until(CfgNode::Regular(b), stop),
                None => postdom.ascend_all(CfgNode::Regular(b)),
            };
            for node in chain {
                if let CfgNode::Regular(dependent_block) = node {
                    control_dependents_on[dependent_block].insert(a);
                }
            }
        }
    }
    for (dependent_block, deps) in control_dependents_on.iter().enumerate() {
        let header = header_of_block[dependent_block];
        for &a in deps {
            let terminator_node = terminator_node_index(&layout, &function.blocks[a]);
            dominating_depends[header].insert(terminator_node);
        }
    }

    // Reverse index for `externals`.
    let mut reverse_data_depends: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); node_count];
    for (node, deps) in data_depends.iter().enumerate() {
        for &dep in deps {
            reverse_data_depends[dep].insert(node);
        }
    }

    ProgramDependenceGraph {
        node_count,
        block_of_node,
        prevents_outlining,
        data_depends,
        reverse_data_depends,
        arg_depends,
        forced_depends,
        dominating_depends,
        block_dominators,
    }
}

fn terminator_node_index(layout: &[memo_ir::NodeEntry], block: &memo_ir::BasicBlock) -> usize {
    let last = block.instructions.len().saturating_sub(1);
    layout
        .iter()
        .find(|e| e.block == block.id && e.kind == NodeKind::Instruction(last))
        .map(|e| e.id.index())
        .unwrap_or_else(|| {
            layout
                .iter()
                .find(|e| e.block == block.id && e.kind == NodeKind::BlockHeader)
                .expect("every block has a header node")
                .id
                .index()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use memo_ir::{AggregateOrType, BasicBlock, Instruction, MemoryPhi, NodeId, Opcode, Type};

    /// entry -> body -> exit, `body` does `%a = load p; %b = add %a 1;
    /// store %b p` — the scenario spec.md §8 walks through by hand.
    fn load_add_store_function() -> Function {
        let entry = BasicBlock {
            id: 0,
            memory_phi: None,
            instructions: vec![],
            successors: vec![1],
        };
        let mut body = BasicBlock::new(1);
        body.memory_phi = Some(MemoryPhi {
            incoming: vec![MemoryAccess::LiveOnEntry],
        });
        body.instructions.push(Instruction {
            opcode: Opcode::Load,
            result_type: Some(AggregateOrType::Scalar(Type::Integer(32))),
            operands: vec![Operand::Argument(0)],
            flags: InstructionFlags::empty(),
            clobber: Some(MemoryAccess::Phi(1)),
        });
        body.instructions.push(Instruction {
            opcode: Opcode::Add,
            result_type: Some(AggregateOrType::Scalar(Type::Integer(32))),
            operands: vec![Operand::Node(NodeId(3)), Operand::Constant],
            flags: InstructionFlags::empty(),
            clobber: None,
        });
        body.instructions.push(Instruction {
            opcode: Opcode::Store,
            result_type: None,
            operands: vec![Operand::Node(NodeId(4)), Operand::Argument(0)],
            flags: InstructionFlags::empty(),
            clobber: Some(MemoryAccess::Access(NodeId(2))),
        });
        body.successors = vec![2];
        let mut exit = BasicBlock::new(2);
        exit.instructions.push(Instruction::new(Opcode::Ret, vec![]));

        Function {
            name: "f".to_string(),
            params: vec![AggregateOrType::Scalar(Type::Pointer(0))],
            return_type: AggregateOrType::Scalar(Type::Void),
            blocks: vec![entry, body, exit],
        }
    }

    #[test]
    fn load_add_store_dependences_match_the_spec_walkthrough() {
        let f = load_add_store_function();
        // Layout: 0=entry header, 1=body header, 2=memphi, 3=%a load,
        // 4=%b add, 5=store, 6=exit header, 7=ret.
        let pdg = build(&f);
        assert_eq!(pdg.node_count(), 8);

        // `%a` forced-depends on its block header (spec.md: "An instruction
        // is forced-depend on its block header"), so the bare singleton is
        // not a legal candidate on its own — only its forced-closure is.
        let mut bare_a = BTreeSet::new();
        bare_a.insert(3);
        assert!(!pdg.is_outlinable(&bare_a), "bare {{%a}} omits its forced header");

        // {1,2,3}: body header, memphi, %a — %a's forced-closure.
        let mut a_set = BTreeSet::new();
        a_set.insert(1);
        a_set.insert(2);
        a_set.insert(3);
        assert!(pdg.is_outlinable(&a_set), "{{%a}}'s forced-closure is legal");

        // {1,2,3,4}: add this closure's %a plus %b, which dominating-depends
        // on %a (already present) — legal.
        let mut ab_set = BTreeSet::new();
        ab_set.insert(1);
        ab_set.insert(2);
        ab_set.insert(3);
        ab_set.insert(4);
        assert!(pdg.is_outlinable(&ab_set), "{{%a,%b}}'s forced-closure is legal");

        let mut store_without_b = BTreeSet::new();
        store_without_b.insert(1);
        store_without_b.insert(2);
        store_without_b.insert(3);
        store_without_b.insert(5);
        assert!(
            !pdg.is_outlinable(&store_without_b),
            "store forced-depends on %b"
        );
    }

    #[test]
    fn function_entry_header_prevents_outlining() {
        let f = load_add_store_function();
        let pdg = build(&f);
        assert!(pdg.prevents_outlining(0));
    }

    #[test]
    fn externals_reports_the_pointer_argument_and_no_external_outputs() {
        let f = load_add_store_function();
        let pdg = build(&f);
        let mut bv = BTreeSet::new();
        bv.insert(3); // %a
        bv.insert(4); // %b
        bv.insert(5); // store
        let ext = pdg.externals(&bv);
        assert!(ext.arg_inputs.contains(&0));
        assert!(ext.external_outputs.is_empty());
    }
}
