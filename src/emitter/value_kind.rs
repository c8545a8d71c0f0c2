use crate::analysis::{PointerKind, RegKind};
use crate::error::{Error, Result};
use crate::ir::IrType;

/// Wasm value types the binary format can express.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ValueType {
    I32,
    I64,
    F32,
    F64,
}

impl ValueType {
    pub(crate) fn to_byte(self) -> u8 {
        match self {
            ValueType::I32 => 0x7F,
            ValueType::I64 => 0x7E,
            ValueType::F32 => 0x7D,
            ValueType::F64 => 0x7C,
        }
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            ValueType::I32 => "i32",
            ValueType::I64 => "i64",
            ValueType::F32 => "f32",
            ValueType::F64 => "f64",
        }
    }
}

/// Map an IR type to its wasm representation. Integers at or below 32
/// bits and raw pointers collapse to `i32`; everything the linear-memory
/// model cannot express is a fatal diagnostic.
pub(crate) fn map_value_type(ty: IrType, pointer_kind: PointerKind) -> Result<ValueType> {
    match ty {
        IrType::I1 | IrType::I8 | IrType::I16 | IrType::I32 => Ok(ValueType::I32),
        IrType::F32 => Ok(ValueType::F32),
        IrType::F64 => Ok(ValueType::F64),
        IrType::Ptr => match pointer_kind {
            PointerKind::ByteLayout => Ok(ValueType::I32),
            PointerKind::CompleteObject | PointerKind::Regular => Err(Error::codegen(
                "anyref pointers cannot be represented in linear wasm code",
            )),
        },
        IrType::I64 => Err(Error::codegen(
            "64-bit integers are not supported by this emitter",
        )),
        IrType::Void => Err(Error::internal("void has no wasm value type")),
    }
}

/// The wasm type backing a register class.
pub(crate) fn map_reg_kind(kind: RegKind) -> Result<ValueType> {
    match kind {
        RegKind::Integer => Ok(ValueType::I32),
        RegKind::Double => Ok(ValueType::F64),
        RegKind::Float => Ok(ValueType::F32),
        RegKind::Object => Err(Error::codegen(
            "anyref registers cannot be represented in linear wasm code",
        )),
    }
}

/// Textual type name, including the anyref diagnostic spelling.
pub(crate) fn type_string(ty: IrType, pointer_kind: PointerKind) -> &'static str {
    match ty {
        IrType::I1 | IrType::I8 | IrType::I16 | IrType::I32 | IrType::I64 => "i32",
        IrType::F32 => "f32",
        IrType::F64 => "f64",
        IrType::Ptr => match pointer_kind {
            PointerKind::ByteLayout => "i32",
            _ => "anyref",
        },
        IrType::Void => "void",
    }
}
