//! The global-reference walker (§4.12), grounded on `bcdb::GlobalReferenceGraph`
//! in `examples/original_source/`: for each global value, the set of other
//! globals it reaches through its constant operands or, for a function,
//! through any instruction operand in its body. Used both standalone and by
//! `outline-extract`'s `globals_used` candidate metric.

use memo_ir::{GlobalKind, Module, Operand};
use std::collections::{BTreeSet, VecDeque};

/// Direct references out of a single global, keyed by the global's id.
pub fn direct_references(module: &Module, global_id: u32) -> BTreeSet<u32> {
    let global = module.global(global_id);
    let mut refs: BTreeSet<u32> = global.references.iter().copied().collect();
    match &global.kind {
        GlobalKind::Alias { aliasee } | GlobalKind::IFunc { resolver: aliasee } => {
            refs.insert(*aliasee);
        }
        GlobalKind::Function => {
            if let Some(function) = module.functions.iter().find(|f| f.name == global.name) {
                for block in &function.blocks {
                    for instr in &block.instructions {
                        for operand in &instr.operands {
                            if let Operand::Global(id) = operand {
                                refs.insert(*id);
                            }
                        }
                    }
                }
            }
        }
        GlobalKind::Variable => {}
    }
    refs
}

/// The reachability closure of `global_id`: every other global reachable by
/// following `direct_references` transitively, not including `global_id`
/// itself unless a cycle reaches back to it.
pub fn reachable_globals(module: &Module, global_id: u32) -> BTreeSet<u32> {
    let mut visited = BTreeSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(global_id);
    let mut first = true;
    while let Some(id) = queue.pop_front() {
        if !first && !visited.insert(id) {
            continue;
        }
        first = false;
        for next in direct_references(module, id) {
            if !visited.contains(&next) {
                queue.push_back(next);
            }
        }
    }
    visited
}

/// Globals that must live in the same module as `global_id` because it is
/// (or is reachable through) an alias/ifunc aliasee relationship — a subset
/// of `reachable_globals` callers care about separately when packaging
/// modules, per §4.12 ("for aliases and indirect functions, record that the
/// aliasee must live in the same module").
pub fn co_located_aliasees(module: &Module, global_id: u32) -> BTreeSet<u32> {
    let mut out = BTreeSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(global_id);
    let mut visited = BTreeSet::new();
    while let Some(id) = queue.pop_front() {
        if !visited.insert(id) {
            continue;
        }
        let global = module.global(id);
        if let GlobalKind::Alias { aliasee } | GlobalKind::IFunc { resolver: aliasee } = &global.kind {
            out.insert(*aliasee);
            queue.push_back(*aliasee);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use memo_ir::{AggregateOrType, BasicBlock, Function, GlobalValue, Instruction, Opcode, Type};

    fn sample_module() -> Module {
        let caller = Function {
            name: "caller".to_string(),
            params: vec![],
            return_type: AggregateOrType::Scalar(Type::Void),
            blocks: vec![{
                let mut b = BasicBlock::new(0);
                b.instructions.push(Instruction::new(Opcode::Call, vec![Operand::Global(1)]));
                b
            }],
        };
        Module {
            functions: vec![caller],
            globals: vec![
                GlobalValue {
                    id: 0,
                    name: "caller".to_string(),
                    kind: GlobalKind::Function,
                    references: vec![],
                },
                GlobalValue {
                    id: 1,
                    name: "callee".to_string(),
                    kind: GlobalKind::Function,
                    references: vec![],
                },
                GlobalValue {
                    id: 2,
                    name: "alias_of_callee".to_string(),
                    kind: GlobalKind::Alias { aliasee: 1 },
                    references: vec![],
                },
            ],
        }
    }

    #[test]
    fn function_global_reaches_globals_referenced_by_its_body() {
        let module = sample_module();
        let refs = direct_references(&module, 0);
        assert!(refs.contains(&1));
    }

    #[test]
    fn alias_reaches_its_aliasee() {
        let module = sample_module();
        assert!(co_located_aliasees(&module, 2).contains(&1));
    }

    #[test]
    fn reachable_globals_is_transitive() {
        let module = sample_module();
        let reached = reachable_globals(&module, 0);
        assert!(reached.contains(&1));
    }
}
