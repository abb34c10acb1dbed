//! Intermediate representation
//!
//! Linear, SSA-ish instruction list per function. Each instruction has an
//! opcode, a typed payload (a sum whose arm is fixed by the opcode), an
//! optional result value id and a source location for debug mappings.
//! Querying the wrong payload arm is an internal error, not a fallback:
//! that hard failure is what catches converter bugs before they become
//! silent bad code.
//!
//! Basic blocks are implicit ranges between `Label` instructions; the CFG
//! is computed on demand.

use crate::diag::{Diagnostic, SourceLoc};
use crate::strings::StrId;
use crate::types::TypeId;
use std::collections::HashMap;

/// SSA value id, unique within one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

/// Branch target label, unique within one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    And,
    Or,
    Xor,
    Neg,
    Not,
    CmpEq,
    CmpNe,
    CmpLt,
    CmpLe,
    CmpGt,
    CmpGe,
    Jmp,
    Br,
    Call,
    CallIndirect,
    VCall,
    Ret,
    Load,
    Store,
    Lea,
    Alloca,
    Phi,
    CastSext,
    CastZext,
    CastTrunc,
    CastIntToFp,
    CastFpToInt,
    CastFpExt,
    CastFpTrunc,
    CastBits,
    Copy,
    PushFrame,
    PopFrame,
    LabelMark,
    ConstInt,
    ConstFloat,
    GlobalAddr,
    /// Marks the start of an EH-protected region (payload: TryRegion).
    TryBegin,
    TryEnd,
    /// Raise an exception value (lowered per target EH model).
    Throw,
}

/// One typed handler of a try-region.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerSpec {
    /// Catch type, `None` for `catch (...)` / `__except`.
    pub ty: Option<TypeId>,
    pub target: Label,
}

/// Payload arms, selected by opcode.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Binary {
        lhs: ValueId,
        rhs: ValueId,
        /// Signedness drives instruction selection (IDIV vs DIV, SAR vs SHR).
        is_signed: bool,
        is_float: bool,
    },
    Unary {
        operand: ValueId,
    },
    Jump {
        target: Label,
    },
    Branch {
        cond: ValueId,
        then_target: Label,
        else_target: Label,
    },
    Call {
        callee: StrId,
        args: Vec<ValueId>,
        variadic_float_args: u8,
    },
    CallIndirect {
        target: ValueId,
        args: Vec<ValueId>,
    },
    VCall {
        object: ValueId,
        /// Vtable slot index.
        slot: u32,
        args: Vec<ValueId>,
        /// Byte adjustment applied to `this` before the call.
        this_adjust: i32,
    },
    Ret {
        value: Option<ValueId>,
    },
    Load {
        addr: ValueId,
    },
    Store {
        addr: ValueId,
        value: ValueId,
    },
    Lea {
        base: ValueId,
        offset: i64,
    },
    Alloca {
        size: u64,
        align: u64,
    },
    Phi {
        incoming: Vec<(Label, ValueId)>,
    },
    Cast {
        operand: ValueId,
    },
    LabelMark {
        label: Label,
    },
    ConstInt {
        value: i64,
    },
    ConstFloat {
        value: f64,
    },
    Global {
        name: StrId,
    },
    TryRegion {
        handlers: Vec<HandlerSpec>,
        /// `__finally` / cleanup continuation.
        finally_target: Option<Label>,
    },
    ThrowValue {
        value: Option<ValueId>,
        ty: Option<TypeId>,
    },
    None,
}

/// One IR instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Instr {
    pub op: Opcode,
    pub payload: Payload,
    /// Result value, when the instruction produces one.
    pub result: Option<ValueId>,
    /// Result type; void ops carry none.
    pub ty: Option<TypeId>,
    pub loc: SourceLoc,
}

impl Instr {
    /// Typed-payload accessors: a mismatched query is an internal
    /// invariant violation (exit code 2), never silently recovered.
    pub fn binary(&self) -> Result<(ValueId, ValueId, bool, bool), Diagnostic> {
        match &self.payload {
            Payload::Binary {
                lhs,
                rhs,
                is_signed,
                is_float,
            } => Ok((*lhs, *rhs, *is_signed, *is_float)),
            other => Err(payload_mismatch(self.op, "Binary", other)),
        }
    }

    pub fn jump(&self) -> Result<Label, Diagnostic> {
        match &self.payload {
            Payload::Jump { target } => Ok(*target),
            other => Err(payload_mismatch(self.op, "Jump", other)),
        }
    }

    pub fn branch(&self) -> Result<(ValueId, Label, Label), Diagnostic> {
        match &self.payload {
            Payload::Branch {
                cond,
                then_target,
                else_target,
            } => Ok((*cond, *then_target, *else_target)),
            other => Err(payload_mismatch(self.op, "Branch", other)),
        }
    }

    pub fn load(&self) -> Result<ValueId, Diagnostic> {
        match &self.payload {
            Payload::Load { addr } => Ok(*addr),
            other => Err(payload_mismatch(self.op, "Load", other)),
        }
    }

    pub fn store(&self) -> Result<(ValueId, ValueId), Diagnostic> {
        match &self.payload {
            Payload::Store { addr, value } => Ok((*addr, *value)),
            other => Err(payload_mismatch(self.op, "Store", other)),
        }
    }

    pub fn label(&self) -> Result<Label, Diagnostic> {
        match &self.payload {
            Payload::LabelMark { label } => Ok(*label),
            other => Err(payload_mismatch(self.op, "LabelMark", other)),
        }
    }
}

fn payload_mismatch(op: Opcode, wanted: &str, got: &Payload) -> Diagnostic {
    Diagnostic::internal(format!(
        "IR payload mismatch: opcode {:?} queried as {} but carries {:?}",
        op,
        wanted,
        std::mem::discriminant(got)
    ))
}

/// A lowered function: linear instruction list plus value/label counters
/// and the debug-side tables.
#[derive(Debug, Clone)]
pub struct IrFunction {
    /// Mangled symbol name.
    pub name: StrId,
    /// Source-level (unmangled) name for debug info.
    pub display_name: StrId,
    pub params: Vec<(Option<StrId>, TypeId)>,
    pub ret: TypeId,
    pub instrs: Vec<Instr>,
    next_value: u32,
    next_label: u32,
    /// Local variable debug records: name, type, alloca value.
    pub locals: Vec<(StrId, TypeId, ValueId)>,
    pub loc: SourceLoc,
    /// Weak linkage (inline functions, template instantiations).
    pub weak: bool,
}

impl IrFunction {
    pub fn new(name: StrId, display_name: StrId, ret: TypeId, loc: SourceLoc) -> Self {
        IrFunction {
            name,
            display_name,
            params: Vec::new(),
            ret,
            instrs: Vec::new(),
            next_value: 0,
            next_label: 0,
            locals: Vec::new(),
            loc,
            weak: false,
        }
    }

    pub fn new_value(&mut self) -> ValueId {
        let v = ValueId(self.next_value);
        self.next_value += 1;
        v
    }

    pub fn value_count(&self) -> usize {
        self.next_value as usize
    }

    pub fn new_label(&mut self) -> Label {
        let l = Label(self.next_label);
        self.next_label += 1;
        l
    }

    pub fn push(&mut self, instr: Instr) -> Option<ValueId> {
        let r = instr.result;
        self.instrs.push(instr);
        r
    }

    /// Emit a result-producing instruction.
    pub fn emit(&mut self, op: Opcode, payload: Payload, ty: TypeId, loc: SourceLoc) -> ValueId {
        let result = self.new_value();
        self.instrs.push(Instr {
            op,
            payload,
            result: Some(result),
            ty: Some(ty),
            loc,
        });
        result
    }

    /// Emit a void instruction.
    pub fn emit_void(&mut self, op: Opcode, payload: Payload, loc: SourceLoc) {
        self.instrs.push(Instr {
            op,
            payload,
            result: None,
            ty: None,
            loc,
        });
    }

    pub fn bind_label(&mut self, label: Label, loc: SourceLoc) {
        self.emit_void(Opcode::LabelMark, Payload::LabelMark { label }, loc);
    }

    /// Compute the basic-block structure on demand: block boundaries at
    /// labels and after terminators, edges from jumps/branches and
    /// fallthrough.
    pub fn cfg(&self) -> Cfg {
        let mut starts = vec![0usize];
        let mut label_at: HashMap<Label, usize> = HashMap::new();
        for (i, instr) in self.instrs.iter().enumerate() {
            match instr.op {
                Opcode::LabelMark => {
                    if let Payload::LabelMark { label } = &instr.payload {
                        if !starts.contains(&i) {
                            starts.push(i);
                        }
                        label_at.insert(*label, i);
                    }
                }
                Opcode::Jmp | Opcode::Br | Opcode::Ret => {
                    if i + 1 < self.instrs.len() && !starts.contains(&(i + 1)) {
                        starts.push(i + 1);
                    }
                }
                _ => {}
            }
        }
        starts.sort_unstable();
        starts.dedup();
        let mut blocks = Vec::with_capacity(starts.len());
        for (bi, &start) in starts.iter().enumerate() {
            let end = starts.get(bi + 1).copied().unwrap_or(self.instrs.len());
            blocks.push(BasicBlock {
                start,
                end,
                succs: Vec::new(),
            });
        }
        let block_of = |i: usize, blocks: &[BasicBlock]| -> usize {
            blocks
                .iter()
                .position(|b| i >= b.start && i < b.end)
                .unwrap_or(0)
        };
        let snapshot = blocks.clone();
        for b in &mut blocks {
            if b.end == 0 || b.start >= self.instrs.len() {
                continue;
            }
            let last = &self.instrs[b.end - 1];
            match (&last.op, &last.payload) {
                (Opcode::Jmp, Payload::Jump { target }) => {
                    if let Some(&ti) = label_at.get(target) {
                        b.succs.push(block_of(ti, &snapshot));
                    }
                }
                (
                    Opcode::Br,
                    Payload::Branch {
                        then_target,
                        else_target,
                        ..
                    },
                ) => {
                    for t in [then_target, else_target] {
                        if let Some(&ti) = label_at.get(t) {
                            b.succs.push(block_of(ti, &snapshot));
                        }
                    }
                }
                (Opcode::Ret, _) => {}
                _ => {
                    // Fallthrough.
                    if b.end < self.instrs.len() {
                        b.succs.push(block_of(b.end, &snapshot));
                    }
                }
            }
        }
        Cfg { blocks }
    }
}

#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub start: usize,
    pub end: usize,
    pub succs: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct Cfg {
    pub blocks: Vec<BasicBlock>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strings::StringTable;
    use crate::types::{Primitive, TypeRegistry};

    fn sample_fn() -> (IrFunction, TypeId) {
        let mut strings = StringTable::new();
        let mut types = TypeRegistry::new(true);
        let int = types.primitive(Primitive::Int);
        let name = strings.intern("f");
        (
            IrFunction::new(name, name, int, SourceLoc::unknown()),
            int,
        )
    }

    #[test]
    fn test_typed_payload_accessor_ok() {
        let (mut f, int) = sample_fn();
        let loc = SourceLoc::unknown();
        let a = f.emit(Opcode::ConstInt, Payload::ConstInt { value: 1 }, int, loc);
        let b = f.emit(Opcode::ConstInt, Payload::ConstInt { value: 2 }, int, loc);
        f.emit(
            Opcode::Add,
            Payload::Binary {
                lhs: a,
                rhs: b,
                is_signed: true,
                is_float: false,
            },
            int,
            loc,
        );
        let add = &f.instrs[2];
        let (l, r, s, fl) = add.binary().unwrap();
        assert_eq!((l, r, s, fl), (a, b, true, false));
    }

    #[test]
    fn test_typed_payload_mismatch_is_internal_error() {
        let (mut f, int) = sample_fn();
        let loc = SourceLoc::unknown();
        f.emit(Opcode::ConstInt, Payload::ConstInt { value: 1 }, int, loc);
        let c = &f.instrs[0];
        let err = c.binary().unwrap_err();
        assert_eq!(err.severity, crate::diag::Severity::Internal);
        assert!(err.message.contains("payload mismatch"));
    }

    #[test]
    fn test_cfg_blocks_and_edges() {
        let (mut f, int) = sample_fn();
        let loc = SourceLoc::unknown();
        let then_l = f.new_label();
        let end_l = f.new_label();
        let c = f.emit(Opcode::ConstInt, Payload::ConstInt { value: 1 }, int, loc);
        f.emit_void(
            Opcode::Br,
            Payload::Branch {
                cond: c,
                then_target: then_l,
                else_target: end_l,
            },
            loc,
        );
        f.bind_label(then_l, loc);
        f.emit_void(Opcode::Jmp, Payload::Jump { target: end_l }, loc);
        f.bind_label(end_l, loc);
        f.emit_void(Opcode::Ret, Payload::Ret { value: Some(c) }, loc);

        let cfg = f.cfg();
        assert_eq!(cfg.blocks.len(), 3);
        // Entry branches to both following blocks.
        assert_eq!(cfg.blocks[0].succs.len(), 2);
        // Then-block jumps to end.
        assert_eq!(cfg.blocks[1].succs, vec![2]);
        // Exit block has no successors.
        assert!(cfg.blocks[2].succs.is_empty());
    }

    #[test]
    fn test_value_ids_are_sequential() {
        let (mut f, int) = sample_fn();
        let loc = SourceLoc::unknown();
        let a = f.emit(Opcode::ConstInt, Payload::ConstInt { value: 1 }, int, loc);
        let b = f.emit(Opcode::ConstInt, Payload::ConstInt { value: 2 }, int, loc);
        assert_eq!(a, ValueId(0));
        assert_eq!(b, ValueId(1));
        assert_eq!(f.value_count(), 2);
    }
}
