use super::{FuncRef, GlobalId, IntPredicate, IrType};

/// A constant operand. Floats are stored as raw bits so constants can be
/// hashed and compared exactly, which the globalization planner relies on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Constant {
    Int { value: i64, ty: IrType },
    Float { bits: u64, ty: IrType },
    /// The null pointer, always linear-memory address zero.
    Null,
    /// The linear-memory address of a global variable.
    GlobalAddr(GlobalId),
    /// A function pointer, materialised as its function-table address.
    FuncAddr(FuncRef),
    Undef(IrType),
    Expr(Box<ConstExpr>),
    /// Flattened aggregate initialiser, only valid inside global
    /// initialisers. Field padding is expressed with `Zeroes`.
    Aggregate(Vec<Constant>),
    /// A run of zero bytes inside an aggregate initialiser.
    Zeroes(u32),
}

impl Constant {
    pub fn i32(value: i32) -> Self {
        Constant::Int {
            value: i64::from(value),
            ty: IrType::I32,
        }
    }

    pub fn f32(value: f32) -> Self {
        Constant::Float {
            bits: u64::from(value.to_bits()),
            ty: IrType::F32,
        }
    }

    pub fn f64(value: f64) -> Self {
        Constant::Float {
            bits: value.to_bits(),
            ty: IrType::F64,
        }
    }

    pub fn ty(&self) -> IrType {
        match self {
            Constant::Int { ty, .. } | Constant::Float { ty, .. } | Constant::Undef(ty) => *ty,
            Constant::Null | Constant::GlobalAddr(_) | Constant::FuncAddr(_) => IrType::Ptr,
            Constant::Expr(expr) => expr.ty(),
            Constant::Aggregate(_) | Constant::Zeroes(_) => IrType::Void,
        }
    }

    /// True for zero integers, zero floats and null pointers.
    pub fn is_null_value(&self) -> bool {
        match self {
            Constant::Int { value, .. } => *value == 0,
            Constant::Float { bits, .. } => *bits == 0,
            Constant::Null => true,
            Constant::Zeroes(_) => true,
            _ => false,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Constant::Float {
                bits,
                ty: IrType::F32,
            } => Some(f32::from_bits(*bits as u32)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Constant::Float {
                bits,
                ty: IrType::F64,
            } => Some(f64::from_bits(*bits)),
            _ => None,
        }
    }
}

/// Constant expressions surviving lowering. These recurse into plain
/// constants and lower to explicit opcode sequences at each use site.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConstExpr {
    Add(Constant, Constant),
    Sub(Constant, Constant),
    And(Constant, Constant),
    Or(Constant, Constant),
    /// Fully folded address arithmetic over a constant base.
    Gep { base: Constant, offset: i64 },
    /// Pointer-representation casts are no-ops in linear memory.
    Bitcast(Constant),
    IntToPtr(Constant),
    PtrToInt(Constant),
    ICmp {
        pred: IntPredicate,
        lhs: Constant,
        rhs: Constant,
    },
    Select {
        cond: Constant,
        if_true: Constant,
        if_false: Constant,
    },
}

impl ConstExpr {
    pub fn ty(&self) -> IrType {
        match self {
            ConstExpr::Add(lhs, _)
            | ConstExpr::Sub(lhs, _)
            | ConstExpr::And(lhs, _)
            | ConstExpr::Or(lhs, _) => lhs.ty(),
            ConstExpr::Gep { .. } => IrType::Ptr,
            ConstExpr::Bitcast(_) | ConstExpr::IntToPtr(_) => IrType::Ptr,
            ConstExpr::PtrToInt(_) => IrType::I32,
            ConstExpr::ICmp { .. } => IrType::I1,
            ConstExpr::Select { if_true, .. } => if_true.ty(),
        }
    }
}
