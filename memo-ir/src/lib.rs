//! A deliberately small stand-in for a real IR (the LLVM bitcode
//! reader/writer that would normally produce these types is out of scope).
//! `outline-analysis` and `outline-extract` consume this model the way
//! they would consume LLVM's `Function`/`BasicBlock`/`Instruction`: node
//! indices are stable, assigned by [`Function::node_layout`] in the exact
//! pre-order the dependence graph expects (block header, optional
//! memory-phi, then instructions).

use bitflags::bitflags;

/// A stable index into a function's flattened node space (block headers,
/// memory-phis, and instructions interleaved per [`Function::node_layout`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Add,
    Sub,
    Mul,
    SDiv,
    UDiv,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
    FAdd,
    FSub,
    FMul,
    FDiv,
    ICmp,
    FCmp,
    Trunc,
    ZExt,
    SExt,
    BitCast,
    Load,
    Store,
    Alloca,
    GetElementPtr,
    Call,
    Invoke,
    Select,
    Phi,
    Ret,
    Br,
    CondBr,
    Switch,
    IndirectBr,
    Unreachable,
    Resume,
}

impl Opcode {
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Opcode::Ret
                | Opcode::Br
                | Opcode::CondBr
                | Opcode::Switch
                | Opcode::IndirectBr
                | Opcode::Unreachable
                | Opcode::Resume
                | Opcode::Invoke
        )
    }

    pub fn touches_memory(self) -> bool {
        matches!(self, Opcode::Load | Opcode::Store | Opcode::Call | Opcode::Invoke)
    }

    /// Instructions not guaranteed to transfer control to their successor:
    /// calls (may throw or never return) and invokes. Per spec, trapping
    /// and volatile instructions are deliberately *not* included here even
    /// though they can abort the process, since that would make the
    /// corrected post-dominator overly conservative.
    pub fn may_not_transfer_to_successor(self) -> bool {
        matches!(self, Opcode::Call | Opcode::Invoke)
    }

    /// Terminators (or other instructions) that cannot be legally
    /// duplicated by the extractor.
    pub fn prevents_cloning(self) -> bool {
        matches!(self, Opcode::Resume | Opcode::IndirectBr)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InstructionFlags: u8 {
        const CONVERGENT = 0b001;
        const NO_DUPLICATE = 0b010;
        const PRODUCES_TOKEN = 0b100;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    Void,
    Integer(u32),
    Float,
    Double,
    Pointer(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AggregateOrType {
    Scalar(Type),
    Aggregate(Vec<AggregateOrType>),
}

/// A use of some other value: a node in the same function, a function
/// argument, a reference to a module-level global, or an opaque constant
/// that carries no dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    Node(NodeId),
    Argument(u32),
    Global(u32),
    Constant,
}

/// The clobbering predecessor memory-SSA assigns to a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryAccess {
    LiveOnEntry,
    Phi(u32),
    Access(NodeId),
}

#[derive(Debug, Clone)]
pub struct Instruction {
    pub opcode: Opcode,
    pub result_type: Option<AggregateOrType>,
    pub operands: Vec<Operand>,
    pub flags: InstructionFlags,
    /// Present when `opcode.touches_memory()`, memory-SSA treats every
    /// access as both read and write so write-after-read anti-dependences
    /// are captured along with read-after-write.
    pub clobber: Option<MemoryAccess>,
}

impl Instruction {
    pub fn new(opcode: Opcode, operands: Vec<Operand>) -> Instruction {
        Instruction {
            opcode,
            result_type: None,
            operands,
            flags: InstructionFlags::empty(),
            clobber: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryPhi {
    /// One incoming access per predecessor block, in predecessor order.
    pub incoming: Vec<MemoryAccess>,
}

#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub id: u32,
    pub memory_phi: Option<MemoryPhi>,
    pub instructions: Vec<Instruction>,
    pub successors: Vec<u32>,
}

impl BasicBlock {
    pub fn new(id: u32) -> BasicBlock {
        BasicBlock {
            id,
            memory_phi: None,
            instructions: Vec::new(),
            successors: Vec::new(),
        }
    }

    /// Whether this block contains any instruction not guaranteed to
    /// transfer to its successor — the predicate that earns it an edge to
    /// the synthetic implicit-sink node.
    pub fn has_implicit_control_flow(&self) -> bool {
        self.instructions
            .iter()
            .any(|i| i.opcode.may_not_transfer_to_successor())
    }

    pub fn terminator(&self) -> Option<&Instruction> {
        self.instructions.last().filter(|i| i.opcode.is_terminator())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    BlockHeader,
    MemoryPhi,
    Instruction(usize),
}

#[derive(Debug, Clone, Copy)]
pub struct NodeEntry {
    pub id: NodeId,
    pub block: u32,
    pub kind: NodeKind,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub params: Vec<AggregateOrType>,
    pub return_type: AggregateOrType,
    /// Must already be in the stable pre-order the dependence graph
    /// expects; `memo-ir` does not compute a traversal order itself.
    pub blocks: Vec<BasicBlock>,
}

impl Function {
    pub fn entry_block(&self) -> &BasicBlock {
        &self.blocks[0]
    }

    /// Assigns the stable `NodeId` layout: for each block in order, a
    /// block-header node, then an optional memory-phi node, then each
    /// instruction node in program order.
    pub fn node_layout(&self) -> Vec<NodeEntry> {
        let mut out = Vec::new();
        let mut next = 0u32;
        for block in &self.blocks {
            out.push(NodeEntry {
                id: NodeId(next),
                block: block.id,
                kind: NodeKind::BlockHeader,
            });
            next += 1;
            if block.memory_phi.is_some() {
                out.push(NodeEntry {
                    id: NodeId(next),
                    block: block.id,
                    kind: NodeKind::MemoryPhi,
                });
                next += 1;
            }
            for i in 0..block.instructions.len() {
                out.push(NodeEntry {
                    id: NodeId(next),
                    block: block.id,
                    kind: NodeKind::Instruction(i),
                });
                next += 1;
            }
        }
        out
    }

    pub fn node_count(&self) -> usize {
        self.node_layout().len()
    }

    pub fn instruction_at(&self, entry: NodeEntry) -> Option<&Instruction> {
        match entry.kind {
            NodeKind::Instruction(i) => self
                .blocks
                .iter()
                .find(|b| b.id == entry.block)
                .map(|b| &b.instructions[i]),
            _ => None,
        }
    }

    pub fn block(&self, id: u32) -> &BasicBlock {
        self.blocks.iter().find(|b| b.id == id).expect("unknown block id")
    }
}

#[derive(Debug, Clone)]
pub enum GlobalKind {
    Variable,
    Function,
    Alias { aliasee: u32 },
    IFunc { resolver: u32 },
}

#[derive(Debug, Clone)]
pub struct GlobalValue {
    pub id: u32,
    pub name: String,
    pub kind: GlobalKind,
    /// Other globals referenced by this global's constant initializer (or,
    /// for a function, by any instruction operand across its body).
    pub references: Vec<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct Module {
    pub functions: Vec<Function>,
    pub globals: Vec<GlobalValue>,
}

impl Module {
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn global(&self, id: u32) -> &GlobalValue {
        self.globals.iter().find(|g| g.id == id).expect("unknown global id")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_function() -> Function {
        let mut entry = BasicBlock::new(0);
        entry.instructions.push(Instruction::new(
            Opcode::Add,
            vec![Operand::Argument(0), Operand::Argument(1)],
        ));
        entry
            .instructions
            .push(Instruction::new(Opcode::Ret, vec![Operand::Node(NodeId(1))]));
        Function {
            name: "add_one".to_string(),
            params: vec![
                AggregateOrType::Scalar(Type::Integer(32)),
                AggregateOrType::Scalar(Type::Integer(32)),
            ],
            return_type: AggregateOrType::Scalar(Type::Integer(32)),
            blocks: vec![entry],
        }
    }

    #[test]
    fn node_layout_is_header_then_instructions() {
        let f = sample_function();
        let layout = f.node_layout();
        assert_eq!(layout.len(), 3);
        assert_eq!(layout[0].kind, NodeKind::BlockHeader);
        assert_eq!(layout[1].kind, NodeKind::Instruction(0));
        assert_eq!(layout[2].kind, NodeKind::Instruction(1));
    }

    #[test]
    fn call_has_implicit_control_flow_but_add_does_not() {
        let mut block = BasicBlock::new(0);
        block.instructions.push(Instruction::new(Opcode::Call, vec![]));
        assert!(block.has_implicit_control_flow());

        let mut block2 = BasicBlock::new(1);
        block2
            .instructions
            .push(Instruction::new(Opcode::Add, vec![Operand::Constant]));
        assert!(!block2.has_implicit_control_flow());
    }

    #[test]
    fn resume_and_indirectbr_prevent_cloning() {
        assert!(Opcode::Resume.prevents_cloning());
        assert!(Opcode::IndirectBr.prevents_cloning());
        assert!(!Opcode::Br.prevents_cloning());
    }
}
