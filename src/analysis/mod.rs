//! Read-only collaborator results the emitter consumes.
//!
//! Register allocation, pointer classification, inlining decisions and the
//! linear-memory layout are computed by upstream passes; the structures
//! here are their serialized answers. They may be shared immutably across
//! function emissions.

mod cfg;

use std::collections::HashMap;

pub use cfg::{Cfg, HandledShape, Shape, ShapeKind, Token};

use crate::error::{Error, Result};
use crate::ir::{BlockId, Constant, FuncRef, GlobalId, SigId, ValueId};

/// Register classes, in the order local groups are declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegKind {
    Integer,
    Double,
    Float,
    Object,
}

/// How the pointer classifier decided to represent a pointer value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerKind {
    CompleteObject,
    Regular,
    ByteLayout,
}

/// The register allocator's answer for one function: a dense register id
/// per non-inlineable value, and a class per register.
#[derive(Debug, Clone, Default)]
pub struct Registers {
    /// Indexed by `ValueId`; `None` for inlineable values and constants.
    pub by_value: Vec<Option<u32>>,
    /// Indexed by register id.
    pub kinds: Vec<RegKind>,
    /// Register overrides on specific CFG edges, used while resolving
    /// PHIs. Falls back to `by_value`.
    pub on_edge: HashMap<(BlockId, BlockId, ValueId), u32>,
}

impl Registers {
    pub fn has_register(&self, v: ValueId) -> bool {
        self.by_value
            .get(v.0 as usize)
            .copied()
            .flatten()
            .is_some()
    }

    pub fn register_of(&self, v: ValueId) -> Result<u32> {
        self.by_value
            .get(v.0 as usize)
            .copied()
            .flatten()
            .ok_or_else(|| Error::internal(format!("value v{} has no register", v.0)))
    }

    pub fn register_on_edge(&self, v: ValueId, from: BlockId, to: BlockId) -> Result<u32> {
        if let Some(&reg) = self.on_edge.get(&(from, to, v)) {
            return Ok(reg);
        }
        self.register_of(v)
    }

    pub fn kind_of(&self, reg: u32) -> RegKind {
        self.kinds[reg as usize]
    }
}

/// Per-function analysis bundle handed to the function emitter.
#[derive(Debug, Clone, Default)]
pub struct FunctionAnalysis {
    pub registers: Registers,
    /// Indexed by `ValueId`; true when the value's emission is folded into
    /// its single consumer's operand stream.
    pub inlineable: Vec<bool>,
    /// Indexed by `ValueId`; meaningful for pointer-typed values only.
    pub pointer_kinds: Vec<PointerKind>,
    pub cfg: Cfg,
}

impl FunctionAnalysis {
    pub fn is_inlineable(&self, v: ValueId) -> bool {
        self.inlineable.get(v.0 as usize).copied().unwrap_or(false)
    }

    pub fn pointer_kind(&self, v: ValueId) -> PointerKind {
        self.pointer_kinds
            .get(v.0 as usize)
            .copied()
            .unwrap_or(PointerKind::ByteLayout)
    }
}

/// Imported host builtins the linear-memory layout assigned ids to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostBuiltin {
    GrowMem,
    Acos,
    Asin,
    Atan,
    Atan2,
    Cos,
    Exp,
    Log,
    Pow,
    Sin,
    Tan,
}

/// One function table entry group: every function sharing a signature.
#[derive(Debug, Clone)]
pub struct FunctionTable {
    pub type_index: u32,
    pub functions: Vec<FuncRef>,
}

/// Receives the byte expansion of a constant, lowest address first.
pub trait ByteListener {
    fn add_byte(&mut self, byte: u8);
}

/// The linear-memory planner's answers: addresses, ids and tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryLayout {
    pub global_addresses: HashMap<GlobalId, u32>,
    /// Function-table addresses for address-taken functions.
    pub function_addresses: HashMap<FuncRef, u32>,
    /// Final wasm function ids. Imports occupy `[0, import_count)`.
    pub function_ids: HashMap<FuncRef, u32>,
    pub function_tables: HashMap<SigId, FunctionTable>,
    /// Deterministic emission order of the tables.
    pub table_order: Vec<SigId>,
    pub builtin_ids: HashMap<HostBuiltin, u32>,
    /// First free byte after static data.
    pub heap_start: u32,
    /// Initial value of the stack-top global.
    pub stack_start: u32,
    /// Globals chosen for promotion to wasm globals: single scalars whose
    /// address is never taken, with their use counts.
    pub globalized_global_usage: HashMap<GlobalId, u32>,
}

impl MemoryLayout {
    pub fn global_address(&self, g: GlobalId) -> Result<u32> {
        self.global_addresses
            .get(&g)
            .copied()
            .ok_or_else(|| Error::codegen(format!("global g{} has no linear-memory address", g.0)))
    }

    pub fn function_has_address(&self, f: FuncRef) -> bool {
        self.function_addresses.contains_key(&f)
    }

    pub fn function_address(&self, f: FuncRef) -> Result<u32> {
        self.function_addresses
            .get(&f)
            .copied()
            .ok_or_else(|| Error::codegen(format!("function f{} has no table address", f.0)))
    }

    pub fn function_id(&self, f: FuncRef) -> Option<u32> {
        self.function_ids.get(&f).copied()
    }

    pub fn builtin_id(&self, builtin: HostBuiltin) -> Result<u32> {
        self.builtin_ids.get(&builtin).copied().ok_or_else(|| {
            Error::codegen(format!("host builtin {builtin:?} was not assigned an import id"))
        })
    }
}

/// Module-wide analysis bundle: the layout plus one entry per function,
/// parallel to `Module::functions`.
#[derive(Debug, Clone, Default)]
pub struct ModuleAnalysis {
    pub layout: MemoryLayout,
    pub functions: Vec<FunctionAnalysis>,
}

/// Expand a constant to its little-endian byte image in linear memory.
pub fn const_bytes(
    constant: &Constant,
    layout: &MemoryLayout,
    listener: &mut dyn ByteListener,
) -> Result<()> {
    match constant {
        Constant::Int { value, ty } => {
            let size = ty.byte_size();
            for i in 0..size {
                listener.add_byte((*value >> (8 * i)) as u8);
            }
        }
        Constant::Float { bits, ty } => {
            for byte in match ty {
                crate::ir::IrType::F32 => (*bits as u32).to_le_bytes().to_vec(),
                _ => bits.to_le_bytes().to_vec(),
            } {
                listener.add_byte(byte);
            }
        }
        Constant::Null => {
            for _ in 0..4 {
                listener.add_byte(0);
            }
        }
        Constant::GlobalAddr(g) => {
            let addr = layout.global_address(*g)?;
            for byte in addr.to_le_bytes() {
                listener.add_byte(byte);
            }
        }
        Constant::FuncAddr(f) => {
            let addr = if layout.function_has_address(*f) {
                layout.function_address(*f)?
            } else {
                0
            };
            for byte in addr.to_le_bytes() {
                listener.add_byte(byte);
            }
        }
        Constant::Undef(ty) => {
            for _ in 0..ty.byte_size() {
                listener.add_byte(0);
            }
        }
        Constant::Zeroes(count) => {
            for _ in 0..*count {
                listener.add_byte(0);
            }
        }
        Constant::Aggregate(fields) => {
            for field in fields {
                const_bytes(field, layout, listener)?;
            }
        }
        Constant::Expr(expr) => match expr.as_ref() {
            crate::ir::ConstExpr::Gep { base, offset } => {
                let mut addr = AddrListener::default();
                const_bytes(base, layout, &mut addr)?;
                let folded = addr.addr.wrapping_add(*offset as u32);
                for byte in folded.to_le_bytes() {
                    listener.add_byte(byte);
                }
            }
            crate::ir::ConstExpr::Bitcast(inner)
            | crate::ir::ConstExpr::IntToPtr(inner)
            | crate::ir::ConstExpr::PtrToInt(inner) => const_bytes(inner, layout, listener)?,
            other => {
                return Err(Error::codegen(format!(
                    "constant expression {other:?} has no byte representation"
                )));
            }
        },
    }
    Ok(())
}

/// Accumulates a little-endian address from a byte expansion.
#[derive(Default)]
pub struct AddrListener {
    pub addr: u32,
    shift: u32,
}

impl ByteListener for AddrListener {
    fn add_byte(&mut self, byte: u8) {
        if self.shift < 32 {
            self.addr |= u32::from(byte) << self.shift;
        }
        self.shift += 8;
    }
}
