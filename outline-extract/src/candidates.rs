//! Candidate enumeration (§4.9): seed a bitvector at each node in reverse
//! program order, grow it along dominating-depends edges while it stays
//! legal, then score it against the size model.

use crate::size_model::SizeModel;
use memo_ir::{AggregateOrType, Function, NodeEntry, NodeKind, Opcode};
use outline_analysis::ProgramDependenceGraph;
use std::collections::{BTreeSet, VecDeque};

#[derive(Debug, Clone)]
pub struct Candidate {
    pub bitvector: BTreeSet<usize>,
    pub arg_types: Vec<AggregateOrType>,
    pub result_types: Vec<AggregateOrType>,
    pub callee_size: i64,
    pub caller_savings: i64,
    pub globals_used: BTreeSet<u32>,
    pub type_signature_key: String,
}

/// `forced-closure({i})`: `i` plus every node reachable by following
/// `ForcedDepends` edges, since `is_outlinable` requires a bitvector to be
/// closed under them.
fn forced_closure(pdg: &ProgramDependenceGraph, seed: usize) -> BTreeSet<usize> {
    let mut set = BTreeSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(seed);
    while let Some(node) = queue.pop_front() {
        if !set.insert(node) {
            continue;
        }
        for &dep in pdg.forced_depends(node) {
            if !set.contains(&dep) {
                queue.push_back(dep);
            }
        }
    }
    set
}

fn layout_entry_of_node<'a>(layout: &'a [NodeEntry], node: usize) -> &'a NodeEntry {
    &layout[node]
}

fn result_type_of_node(function: &Function, layout: &[NodeEntry], node: usize) -> Option<AggregateOrType> {
    let entry = layout_entry_of_node(layout, node);
    match entry.kind {
        NodeKind::Instruction(_) => function
            .instruction_at(*entry)
            .and_then(|instr| instr.result_type.clone()),
        _ => None,
    }
}

fn opcode_of_node(function: &Function, layout: &[NodeEntry], node: usize) -> Option<Opcode> {
    let entry = layout_entry_of_node(layout, node);
    function.instruction_at(*entry).map(|instr| instr.opcode)
}

fn globals_used_by(function: &Function, layout: &[NodeEntry], bv: &BTreeSet<usize>) -> BTreeSet<u32> {
    let mut out = BTreeSet::new();
    for &node in bv {
        let entry = layout_entry_of_node(layout, node);
        if let Some(instr) = function.instruction_at(*entry) {
            for operand in &instr.operands {
                if let memo_ir::Operand::Global(id) = operand {
                    out.insert(*id);
                }
            }
        }
    }
    out
}

/// The canonical, CBOR-encoded, base64pad type-signature key (§4.9) that
/// groups candidates sharing the same parameter/return shape.
pub fn type_signature_key(arg_types: &[AggregateOrType], result_types: &[AggregateOrType]) -> String {
    let canon_args: Vec<CanonicalType> = arg_types.iter().map(CanonicalType::from).collect();
    let canon_results: Vec<CanonicalType> = result_types.iter().map(CanonicalType::from).collect();
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(&(canon_args, canon_results), &mut bytes)
        .expect("type signature tuple is always CBOR-serializable");
    data_encoding::BASE64.encode(&bytes)
}

#[derive(serde::Serialize)]
enum CanonicalType {
    Void,
    Integer(u32),
    Float,
    Double,
    Pointer(u32),
    Aggregate(Vec<CanonicalType>),
}

impl From<&AggregateOrType> for CanonicalType {
    fn from(t: &AggregateOrType) -> CanonicalType {
        match t {
            AggregateOrType::Scalar(memo_ir::Type::Void) => CanonicalType::Void,
            AggregateOrType::Scalar(memo_ir::Type::Integer(n)) => CanonicalType::Integer(*n),
            AggregateOrType::Scalar(memo_ir::Type::Float) => CanonicalType::Float,
            AggregateOrType::Scalar(memo_ir::Type::Double) => CanonicalType::Double,
            AggregateOrType::Scalar(memo_ir::Type::Pointer(space)) => CanonicalType::Pointer(*space),
            AggregateOrType::Aggregate(fields) => {
                CanonicalType::Aggregate(fields.iter().map(CanonicalType::from).collect())
            }
        }
    }
}

/// Grows `set` by pulling in predecessors that are currently
/// dominating-depends of some member and that keep the set legal, until no
/// further growth is possible. Uses a worklist so repeatedly-seen
/// candidates from earlier growth steps aren't rechecked.
fn grow(pdg: &ProgramDependenceGraph, mut set: BTreeSet<usize>) -> BTreeSet<usize> {
    let mut visited_attempts: BTreeSet<usize> = BTreeSet::new();
    loop {
        let frontier: Vec<usize> = set
            .iter()
            .flat_map(|&i| pdg.dominating_depends(i).iter().copied())
            .filter(|j| !set.contains(j) && !visited_attempts.contains(j))
            .collect();
        if frontier.is_empty() {
            break;
        }
        let mut grew = false;
        for candidate_node in frontier {
            visited_attempts.insert(candidate_node);
            let mut trial = set.clone();
            trial.extend(forced_closure(pdg, candidate_node));
            if pdg.is_outlinable(&trial) {
                set = trial;
                grew = true;
            }
        }
        if !grew {
            break;
        }
    }
    set
}

/// Enumerates legal outlining candidates for `function`, per §4.9: seed at
/// each node in reverse program order, grow while legal, reject candidates
/// with non-positive `caller_savings` unless `size_model` is `None`.
pub fn enumerate_candidates(
    function: &Function,
    pdg: &ProgramDependenceGraph,
    size_model: Option<&dyn SizeModel>,
) -> Vec<Candidate> {
    let layout = function.node_layout();
    let mut emitted: Vec<Candidate> = Vec::new();
    let mut already_emitted: BTreeSet<BTreeSet<usize>> = BTreeSet::new();

    for i in (0..pdg.node_count()).rev() {
        if pdg.prevents_outlining(i) {
            continue;
        }
        let seed = forced_closure(pdg, i);
        if !pdg.is_outlinable(&seed) {
            continue;
        }
        let grown = grow(pdg, seed);
        if already_emitted.contains(&grown) {
            continue;
        }

        let externals = pdg.externals(&grown);
        // Both ArgInputs and ExternalInputs become callee parameters (§4.10
        // step 2); only ExternalOutputs shape the return struct.
        let mut arg_types: Vec<AggregateOrType> = externals
            .arg_inputs
            .iter()
            .filter_map(|&idx| function.params.get(idx as usize).cloned())
            .collect();
        arg_types.extend(
            externals
                .external_inputs
                .iter()
                .filter_map(|&node| result_type_of_node(function, &layout, node)),
        );
        let result_types: Vec<AggregateOrType> = externals
            .external_outputs
            .iter()
            .filter_map(|&node| result_type_of_node(function, &layout, node))
            .collect();

        let globals_used = globals_used_by(function, &layout, &grown);
        let key = type_signature_key(&arg_types, &result_types);

        let instruction_sizes_total: i64 = grown
            .iter()
            .filter_map(|&node| opcode_of_node(function, &layout, node))
            .map(|opcode| size_model.map(|m| m.instruction_size(opcode)).unwrap_or(4) as i64)
            .sum();
        let call_size = size_model.map(|m| m.call_instruction_size()).unwrap_or(8) as i64;
        let marshalled = externals.arg_inputs.len() + externals.external_inputs.len() + externals.external_outputs.len();
        let marshalling_cost = size_model.map(|m| m.marshalled_value_size()).unwrap_or(4) as i64 * marshalled as i64;
        let fn_with_callees = size_model.map(|m| m.function_size_with_callees()).unwrap_or(24) as i64;

        let callee_size = fn_with_callees + instruction_sizes_total + call_size;
        let caller_savings = instruction_sizes_total - call_size - marshalling_cost;

        if size_model.is_some() && caller_savings <= 0 {
            continue;
        }

        already_emitted.insert(grown.clone());
        emitted.push(Candidate {
            bitvector: grown,
            arg_types,
            result_types,
            callee_size,
            caller_savings,
            globals_used,
            type_signature_key: key,
        });
    }

    emitted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::size_model::DefaultSizeModel;
    use memo_ir::{
        AggregateOrType, BasicBlock, Instruction, InstructionFlags, MemoryAccess, MemoryPhi, NodeId, Operand, Type,
    };

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
    fn enumeration_finds_at_least_one_legal_candidate() {
        let f = load_add_store_function();
        let pdg = outline_analysis::pdg::build(&f);
        let candidates = enumerate_candidates(&f, &pdg, None);
        assert!(!candidates.is_empty());
        for c in &candidates {
            assert!(pdg.is_outlinable(&c.bitvector));
        }
    }

    #[test]
    fn size_model_rejects_non_positive_savings_candidates() {
        let f = load_add_store_function();
        let pdg = outline_analysis::pdg::build(&f);
        let model = DefaultSizeModel;
        let candidates = enumerate_candidates(&f, &pdg, Some(&model));
        for c in &candidates {
            assert!(c.caller_savings > 0);
        }
    }

    #[test]
    fn type_signature_key_is_stable_for_equal_shapes() {
        let a = vec![AggregateOrType::Scalar(Type::Integer(32))];
        let b = vec![AggregateOrType::Scalar(Type::Integer(32))];
        assert_eq!(type_signature_key(&a, &[]), type_signature_key(&b, &[]));
    }
}
