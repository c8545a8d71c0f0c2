use super::{BlockId, FuncRef, GlobalId, SigId, ValueId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    SDiv,
    UDiv,
    SRem,
    URem,
    And,
    Or,
    Xor,
    Shl,
    AShr,
    LShr,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FRem,
}

impl BinOp {
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            BinOp::Add
                | BinOp::Mul
                | BinOp::And
                | BinOp::Or
                | BinOp::Xor
                | BinOp::FAdd
                | BinOp::FMul
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntPredicate {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
    Ult,
    Ule,
    Ugt,
    Uge,
}

impl IntPredicate {
    pub fn is_signed(self) -> bool {
        matches!(
            self,
            IntPredicate::Slt | IntPredicate::Sle | IntPredicate::Sgt | IntPredicate::Sge
        )
    }

    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            IntPredicate::Ult | IntPredicate::Ule | IntPredicate::Ugt | IntPredicate::Uge
        )
    }

    pub fn inverse(self) -> Self {
        match self {
            IntPredicate::Eq => IntPredicate::Ne,
            IntPredicate::Ne => IntPredicate::Eq,
            IntPredicate::Slt => IntPredicate::Sge,
            IntPredicate::Sle => IntPredicate::Sgt,
            IntPredicate::Sgt => IntPredicate::Sle,
            IntPredicate::Sge => IntPredicate::Slt,
            IntPredicate::Ult => IntPredicate::Uge,
            IntPredicate::Ule => IntPredicate::Ugt,
            IntPredicate::Ugt => IntPredicate::Ule,
            IntPredicate::Uge => IntPredicate::Ult,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatPredicate {
    Oeq,
    One,
    Olt,
    Ole,
    Ogt,
    Oge,
    Ueq,
    Une,
    Ult,
    Ule,
    Ugt,
    Uge,
    Ord,
    Uno,
}

impl FloatPredicate {
    pub fn is_unordered(self) -> bool {
        matches!(
            self,
            FloatPredicate::Ueq
                | FloatPredicate::Une
                | FloatPredicate::Ult
                | FloatPredicate::Ule
                | FloatPredicate::Ugt
                | FloatPredicate::Uge
                | FloatPredicate::Uno
        )
    }

    /// The logically negated predicate. Ordered and unordered predicates
    /// swap classes, which is what makes inversion-based emission work.
    pub fn inverse(self) -> Self {
        match self {
            FloatPredicate::Oeq => FloatPredicate::Une,
            FloatPredicate::One => FloatPredicate::Ueq,
            FloatPredicate::Olt => FloatPredicate::Uge,
            FloatPredicate::Ole => FloatPredicate::Ugt,
            FloatPredicate::Ogt => FloatPredicate::Ule,
            FloatPredicate::Oge => FloatPredicate::Ult,
            FloatPredicate::Ueq => FloatPredicate::One,
            FloatPredicate::Une => FloatPredicate::Oeq,
            FloatPredicate::Ult => FloatPredicate::Oge,
            FloatPredicate::Ule => FloatPredicate::Ogt,
            FloatPredicate::Ugt => FloatPredicate::Ole,
            FloatPredicate::Uge => FloatPredicate::Olt,
            FloatPredicate::Ord => FloatPredicate::Uno,
            FloatPredicate::Uno => FloatPredicate::Ord,
        }
    }

    /// Strip the unordered flavour, keeping the relational core.
    pub fn ordered_core(self) -> Self {
        match self {
            FloatPredicate::Ueq => FloatPredicate::Oeq,
            FloatPredicate::Une => FloatPredicate::One,
            FloatPredicate::Ult => FloatPredicate::Olt,
            FloatPredicate::Ule => FloatPredicate::Ole,
            FloatPredicate::Ugt => FloatPredicate::Ogt,
            FloatPredicate::Uge => FloatPredicate::Oge,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CastOp {
    Trunc,
    ZExt,
    SExt,
    FpToSi,
    FpToUi,
    SiToFp,
    UiToFp,
    FpExt,
    FpTrunc,
    Bitcast,
    IntToPtr,
    PtrToInt,
}

/// The base pointer a folded address computation starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GepBase {
    Global(GlobalId),
    Null,
    Value(ValueId),
}

/// Folded address arithmetic produced by the layout planner:
/// `Σ(added value × size) − Σ(subbed value × size) + const_part + base`.
#[derive(Debug, Clone)]
pub struct GepExpr {
    pub added: Vec<(ValueId, u32)>,
    pub subbed: Vec<(ValueId, u32)>,
    pub const_part: i64,
    pub base: GepBase,
}

/// Compiler intrinsics surviving lowering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intrinsic {
    Trap,
    StackSave,
    StackRestore,
    VaCopy,
    VaEnd,
    Memcpy,
    Memmove,
    Memset,
    Allocate,
    AllocateArray,
    Reallocate,
    Deallocate,
    Downcast,
    Virtualcast,
    DowncastCurrent,
    UpcastCollapsed,
    CastUser,
    GrowMemory,
    FltRounds,
    /// Math operations with a dedicated wasm opcode.
    Ctlz,
    Fabs,
    Ceil,
    Floor,
    FTrunc,
    Sqrt,
    MinNum,
    MaxNum,
    CopySign,
    /// Libm calls that may lower to host builtins.
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Atan2,
    Exp,
    Log,
    Pow,
    /// Anything the lowering pipeline failed to classify. Always fatal.
    Unknown(String),
}

#[derive(Debug, Clone)]
pub enum Callee {
    Direct(FuncRef),
    Indirect { ptr: ValueId, sig: SigId },
    Intrinsic(Intrinsic),
}

#[derive(Debug, Clone)]
pub struct CallInst {
    pub callee: Callee,
    pub args: Vec<ValueId>,
}

#[derive(Debug, Clone)]
pub enum InstKind {
    Binary {
        op: BinOp,
        lhs: ValueId,
        rhs: ValueId,
    },
    ICmp {
        pred: IntPredicate,
        lhs: ValueId,
        rhs: ValueId,
    },
    FCmp {
        pred: FloatPredicate,
        lhs: ValueId,
        rhs: ValueId,
    },
    Load {
        ptr: ValueId,
    },
    Store {
        ptr: ValueId,
        value: ValueId,
    },
    Gep(GepExpr),
    Select {
        cond: ValueId,
        if_true: ValueId,
        if_false: ValueId,
    },
    Cast {
        op: CastOp,
        value: ValueId,
    },
    Call(Box<CallInst>),
    /// Read the next variadic argument and advance the cursor.
    VaArg {
        list: ValueId,
    },
    Phi {
        incoming: Vec<(BlockId, ValueId)>,
    },
    Ret {
        value: Option<ValueId>,
    },
    Jump {
        target: BlockId,
    },
    CondBr {
        cond: ValueId,
        if_true: BlockId,
        if_false: BlockId,
    },
    Switch {
        cond: ValueId,
        default: BlockId,
        cases: Vec<(i64, BlockId)>,
    },
    Unreachable,
}

impl InstKind {
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstKind::Ret { .. }
                | InstKind::Jump { .. }
                | InstKind::CondBr { .. }
                | InstKind::Switch { .. }
                | InstKind::Unreachable
        )
    }

    /// Value operands, in the order the instruction reads them.
    pub fn operands(&self) -> Vec<ValueId> {
        match self {
            InstKind::Binary { lhs, rhs, .. }
            | InstKind::ICmp { lhs, rhs, .. }
            | InstKind::FCmp { lhs, rhs, .. } => vec![*lhs, *rhs],
            InstKind::Load { ptr } => vec![*ptr],
            InstKind::Store { ptr, value } => vec![*ptr, *value],
            InstKind::Gep(gep) => {
                let mut ops: Vec<ValueId> = gep.added.iter().map(|(v, _)| *v).collect();
                ops.extend(gep.subbed.iter().map(|(v, _)| *v));
                if let GepBase::Value(v) = gep.base {
                    ops.push(v);
                }
                ops
            }
            InstKind::Select {
                cond,
                if_true,
                if_false,
            } => vec![*cond, *if_true, *if_false],
            InstKind::Cast { value, .. } => vec![*value],
            InstKind::Call(call) => {
                let mut ops = call.args.clone();
                if let Callee::Indirect { ptr, .. } = call.callee {
                    ops.push(ptr);
                }
                ops
            }
            InstKind::VaArg { list } => vec![*list],
            InstKind::Phi { incoming } => incoming.iter().map(|(_, v)| *v).collect(),
            InstKind::Ret { value } => value.iter().copied().collect(),
            InstKind::CondBr { cond, .. } => vec![*cond],
            InstKind::Switch { cond, .. } => vec![*cond],
            InstKind::Jump { .. } | InstKind::Unreachable => Vec::new(),
        }
    }
}
